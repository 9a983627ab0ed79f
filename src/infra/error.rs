use thiserror::Error;

use crate::cache::{FetchError, PersistError};
use crate::config::LoadError;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error("http client error: {message}")]
    Http { message: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
}

impl InfraError {
    pub fn http(message: impl Into<String>) -> Self {
        Self::Http {
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}
