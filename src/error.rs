use thiserror::Error;

/// Crate-wide error taxonomy. Every fallible boundary returns one of these
/// kinds so the orchestrator can decide retry vs halt without string-matching.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("auth error: {0}")]
    Auth(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("sequence gap: expected {expected}, got {got}")]
    SeqGap { expected: u64, got: u64 },

    #[error("order rejected: {0}")]
    OrderRejected(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("audit write failure: {0}")]
    AuditWriteFailure(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("timeout: {0}")]
    Timeout(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
