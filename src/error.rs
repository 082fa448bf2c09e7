use std::io;

use thiserror::Error;

/// Raised when the captured bytes cannot be decoded as a crash dump.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("crash dump is not a valid capture")]
    Json(#[from] serde_json::Error),
    #[error("unsupported crash dump version {0}")]
    UnsupportedVersion(u32),
}

/// Errors surfaced while processing a pending dump end to end.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to decode pending crash dump")]
    Decode(#[from] DecodeError),
    #[error("crash capture storage error")]
    Io(#[from] io::Error),
    #[error("failed to serialize crash report")]
    Serialize(#[source] serde_json::Error),
}
