//! Error types for the neuralfit-core crate.

use thiserror::Error;

/// Top-level error type for estimator operations.
#[derive(Debug, Error)]
pub enum NetError {
    /// Invalid hyperparameters, detected when the estimator is constructed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An operation was called in a state that does not allow it.
    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Shape error: {0}")]
    Shape(String),

    /// Failure reported by the network backend.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Training was interrupted from outside the loop.
    #[error("Interrupted")]
    Interrupted,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Weight encoding error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Config loading error: {0}")]
    Figment(#[from] Box<figment::Error>),
}

impl NetError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether this error is the external interrupt signal.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}
