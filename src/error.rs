//! Error types shared across the crate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Media or fullscreen permission refused by the host
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A measured value missed its required bound
    #[error("threshold not met: {0}")]
    ThresholdNotMet(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("unauthorized")]
    Unauthorized,

    /// The persistent autosave connection is down
    #[error("channel unreachable: {0}")]
    ChannelUnreachable(String),

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("invalid tree: {0}")]
    InvalidTree(String),

    #[error("session already started")]
    AlreadyStarted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
