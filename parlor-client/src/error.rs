//! Error type for backend client operations

use thiserror::Error;

/// Error type for client operations
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API error: {0}")]
    Api(String),

    #[error("Response had no readable body")]
    MissingBody,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] parlor_core::Error),
}

pub type ClientResult<T> = Result<T, ClientError>;
