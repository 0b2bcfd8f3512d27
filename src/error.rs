use thiserror::Error;

/// Errors produced by the pipeline and its stages.
///
/// Generation-path failures (`Generation`, `Contract`) are expected,
/// recoverable conditions: the stage pointer does not move and calling
/// `advance()` again retries the stage from scratch.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// No usable credential for the configured provider; nothing was attempted.
    #[error("no generation credential available for provider '{provider}'")]
    MissingCredential { provider: String },

    /// The completion capability failed after the full retry-then-fallback cycle.
    #[error("generation failed on model '{model}' after {attempts} attempts: {message}")]
    Generation {
        model: String,
        attempts: usize,
        message: String,
    },

    /// The model responded, but its output did not satisfy the expected shape
    /// even after one stricter-prompt retry. `raw` is the cleaned model output.
    #[error("model output violated the {shape} contract: {message}")]
    Contract {
        shape: &'static str,
        message: String,
        raw: String,
    },

    /// Caller-supplied input violated a precondition; no generation was attempted.
    #[error("validation error: {0}")]
    Validation(String),

    /// The state store failed. In-memory state is still correct.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Saved progress belongs to a different draft than the one supplied.
    #[error("saved progress fingerprint {saved} does not match draft fingerprint {current}")]
    StaleDraft { saved: String, current: String },

    /// Another advance/regenerate operation is already in flight.
    #[error("another pipeline operation is already in flight")]
    Busy,

    /// The caller's cancellation token was triggered.
    #[error("operation cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        PipelineError::Validation(msg.into())
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
