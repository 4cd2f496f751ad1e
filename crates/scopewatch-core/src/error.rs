//! Error types for Scopewatch Core

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Scopewatch operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Bookmark error: {0}")]
    Bookmark(#[from] BookmarkError),

    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Capability token and bookmark store errors
#[derive(Error, Debug)]
pub enum BookmarkError {
    #[error("Failed to create capability token for {path:?}: {reason}")]
    TokenCreation { path: PathBuf, reason: String },

    #[error("Failed to resolve capability token: {0}")]
    TokenResolution(String),

    #[error("Path not grantable: {0}")]
    NotGrantable(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Corrupt bookmark store: {0}")]
    CorruptStore(String),

    #[error("Unsupported bookmark store version: {0}")]
    UnsupportedVersion(u32),

    #[error("Failed to persist bookmark store: {0}")]
    Persist(String),
}

/// File event monitor errors
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Monitor configuration has no paths")]
    NoPaths,

    #[error("Path not watchable: {0}")]
    PathNotWatchable(String),

    #[error("Path {path:?} is on device {actual}, expected device {expected}")]
    DeviceMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("Device-relative streams are not supported on this platform")]
    DeviceScopeUnsupported,

    #[error("Failed to create event stream: {0}")]
    StreamCreation(String),

    #[error("Failed to start event stream: {0}")]
    StartFailed(String),

    #[error("Delivery context unavailable: {0}")]
    DeliveryContext(String),
}

impl serde::Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;
