/// Shared error type used across all Ensemble crates.
///
/// Per-expert failures (timeout, error, cancellation) are never surfaced
/// through this enum; they are folded into `ExpertResult.status` and the
/// request continues. These variants cover the typed errors a caller of
/// the orchestrator can actually receive, plus registration-time errors.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("no experts registered")]
    EmptyRegistry,

    #[error("expert id already registered: {0}")]
    DuplicateId(String),

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
