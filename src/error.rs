// error.rs — Error type shared by the graph, the batch producer and the
// training driver.
//
// Nothing in the crate retries or recovers: every variant ends the current
// step and is handed to the caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HredError {
    /// A configuration value is unusable.
    #[error("invalid configuration `{field}`: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    /// A tensor or batch does not have the shape the layer was built for.
    #[error("shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// A token id lies outside `[0, vocab_size)`.
    #[error("token id {token} is outside the vocabulary (size {vocab_size})")]
    TokenOutOfRange { token: i64, vocab_size: usize },

    /// The loss became NaN or infinite.
    #[error("non-finite loss {loss} at step {step}")]
    NonFiniteLoss { step: usize, loss: f64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),
}

impl HredError {
    pub(crate) fn invalid_config(field: &'static str, reason: impl Into<String>) -> Self {
        HredError::InvalidConfig { field, reason: reason.into() }
    }

    pub(crate) fn shape(what: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        HredError::ShapeMismatch {
            what,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}
