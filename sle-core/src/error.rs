use thiserror::Error;

#[derive(Error, Debug)]
pub enum SleError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid source: {0}")]
    InvalidSource(String),

    #[error("Export failed: {0}")]
    Export(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SleError>;
