//! Error types shared across hookweave crates

use thiserror::Error;

/// Errors raised while operating on a host network graph
#[derive(Debug, Error)]
pub enum Error {
    /// Tensor operation failed
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// A required state dict key is absent
    #[error("Missing state dict key: {0}")]
    MissingKey(String),

    /// A tensor does not have the shape the caller requires
    #[error("Shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Block topology flag is not one of `input`, `middle`, `output`
    #[error("Unknown block flag: {0}")]
    UnknownBlockFlag(String),

    /// No node exists at the given path
    #[error("Block not found: {0}")]
    BlockNotFound(String),

    /// The node at the given path is not an attention module
    #[error("Not an attention block: {0}")]
    NotAttention(String),

    /// The host did not publish a value the hook needs for this step
    #[error("Host step state is missing {0}")]
    MissingStepState(&'static str),

    /// An attention hook failed
    #[error("Attention hook failed: {0}")]
    HookFailed(String),
}

/// Result type for hookweave operations
pub type Result<T> = std::result::Result<T, Error>;
