use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("no supported scanner attached")]
    NotFound,
    #[error("usb access denied: {0}")]
    Access(String),
    #[error("device disconnected")]
    Disconnected,
    #[error("endpoint stalled")]
    Stall,
    #[error("transfer timeout")]
    Timeout,
    #[error("usb transfer failed: {0}")]
    Transfer(String),
}

pub type Result<T> = std::result::Result<T, LinkError>;
