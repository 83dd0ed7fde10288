use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: String,
    pub db_path: PathBuf,
    pub max_body_bytes: usize,
    /// cache-control max-age on MVT responses.
    pub tile_ttl: Duration,
    pub log_json: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            db_path: PathBuf::from("predtile.db"),
            max_body_bytes: 8 * 1024 * 1024,
            tile_ttl: Duration::from_secs(300),
            log_json: false,
        }
    }
}
