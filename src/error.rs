// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid glob pattern: {0}")]
    InvalidGlob(String),

    #[error("{path}[{begin}..{end}] exceeds buffer size {limit} without a boundary")]
    BoundaryOverflow {
        path: String,
        begin: u64,
        end: u64,
        limit: usize,
    },

    #[error("Binding error: {0}")]
    Binding(String),

    #[error("Timed out acquiring lock for {} after {waited_ms}ms", .path.display())]
    LockTimeout { path: PathBuf, waited_ms: u64 },

    #[error("Delivery failed for sink {sink}: {reason} (retryable: {retryable})")]
    Delivery {
        sink: String,
        reason: String,
        retryable: bool,
    },

    #[error("State corruption in {}: {reason}", .path.display())]
    StateCorruption { path: PathBuf, reason: String },

    #[error(
        "{path} failed after {errors} malformed block(s) in [{begin}..{end}] (slack {slack})"
    )]
    SlackExhausted {
        path: String,
        begin: u64,
        end: u64,
        errors: u64,
        slack: u64,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
