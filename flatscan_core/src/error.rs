use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum ScanError {
    #[error("link i/o error: {0}")]
    Io(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),
    #[error("device busy")]
    Busy,
    #[error("scan cancelled")]
    Cancelled,
    #[error("invalid state: {0}")]
    State(String),
}

#[derive(Debug, Error, Clone)]
pub enum SetupError {
    #[error("scan width is zero")]
    ZeroWidth,
    #[error("scan height is zero")]
    ZeroHeight,
    #[error("requested resolution exceeds the sensor")]
    ResolutionTooHigh,
    #[error("resolution does not divide the sensor's native dpi")]
    ResolutionNotDerivable,
    #[error("unsupported bit depth")]
    BadDepth,
    #[error("invalid setup: {0}")]
    Invalid(&'static str),
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;
