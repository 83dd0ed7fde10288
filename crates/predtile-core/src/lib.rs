// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

pub mod tilemath;

use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "predtile-core";

#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
