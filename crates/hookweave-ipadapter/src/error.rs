//! Error types for IP-Adapter operations

use thiserror::Error;

/// IP-Adapter errors
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Graph, weight or hook error from the core crate
    #[error(transparent)]
    Core(#[from] hookweave_core::Error),

    /// Tensor operation failed
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// The preprocessor output does not match the adapter variant
    #[error("Expected {expected} preprocessor output, got {actual}")]
    UnexpectedPreprocessorOutput {
        expected: &'static str,
        actual: &'static str,
    },

    /// No preprocessor output was supplied
    #[error("No preprocessor outputs to condition on")]
    EmptyConditioning,

    /// The adapter has no image embedding yet
    #[error("Adapter has not been hooked")]
    NotHooked,

    /// No key/value projection exists for a block key
    #[error("No key/value projection for {0}")]
    MissingProjection(String),
}

/// Result type for IP-Adapter operations
pub type Result<T> = std::result::Result<T, AdapterError>;

impl From<AdapterError> for hookweave_core::Error {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Core(inner) => inner,
            AdapterError::Tensor(inner) => Self::Tensor(inner),
            other => Self::HookFailed(other.to_string()),
        }
    }
}
