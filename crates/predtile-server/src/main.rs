#![forbid(unsafe_code)]

use predtile_server::{build_router, ApiConfig, AppState};
use predtile_store::Store;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .and_then(|v| match v.as_str() {
            "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
            "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn config_from_env() -> ApiConfig {
    let defaults = ApiConfig::default();
    ApiConfig {
        bind_addr: env::var("PREDTILE_BIND").unwrap_or(defaults.bind_addr),
        db_path: env::var("PREDTILE_DB")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path),
        max_body_bytes: env_usize("PREDTILE_MAX_BODY_BYTES", defaults.max_body_bytes),
        tile_ttl: Duration::from_secs(env_u64(
            "PREDTILE_TILE_TTL_SECS",
            defaults.tile_ttl.as_secs(),
        )),
        log_json: env_bool("PREDTILE_LOG_JSON", defaults.log_json),
    }
}

fn init_tracing(log_json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to install shutdown handler");
    }
    info!("shutting down");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = config_from_env();
    init_tracing(config.log_json);

    // Open once up front so schema problems fail at startup, not on the
    // first request.
    Store::open(&config.db_path)?;
    info!(db = %config.db_path.display(), "database ready");

    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(config);
    let router = build_router(state);

    let listener = TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
