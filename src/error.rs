use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Already initialized")]
    AlreadyInitialized,
    #[error("Already being initialized")]
    AlreadyInitializing,
    #[error("{0}")]
    MissingConfiguration(String),
    #[error("browser surface error: {0}")]
    Surface(String),
    #[error("{0}")]
    Remote(String),
    #[error("Request Timed Out")]
    TimedOut,
    #[error("invalid purchase receipt: {0}")]
    InvalidReceipt(String),
    #[error("unexpected response payload: {0}")]
    UnexpectedPayload(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("file server error: {0}")]
    Server(String),
    #[error("request cancelled: {0}")]
    Cancelled(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    pub(crate) fn missing(field: &str) -> Self {
        Self::MissingConfiguration(format!("Missing {field}"))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut)
    }
}
