use chrono::{DateTime, Utc};
use thiserror::Error;

/// A malformed poll definition or request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("poll title must not be empty")]
    EmptyTitle,

    #[error("a poll needs at least one option")]
    NoOptions,

    #[error("option labels must not be empty")]
    EmptyOptionLabel,

    #[error("duplicate option label: {0}")]
    DuplicateOption(String),

    #[error("start time {starts_at} must be before end time {ends_at}")]
    InvalidWindow {
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    },

    #[error("voter id must not be empty")]
    EmptyVoterId,
}

/// A request that is well-formed but not allowed in the poll's current state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("poll is not active")]
    PollNotActive,

    #[error("option is not part of this poll")]
    UnknownOption,

    #[error("voter has already cast a ballot in this poll")]
    DuplicateVote,

    #[error("poll has already completed")]
    AlreadyCompleted,

    #[error("poll has already opened, its options and voting window are frozen")]
    NotPending,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotFoundError {
    #[error("poll not found: {0}")]
    Poll(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationError {
    #[error("{0} is not an administrator")]
    NotAdmin(String),
}

/// Failures of the durable poll store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),

    #[error("worker for poll {0} has shut down")]
    Shutdown(String),
}

impl EngineError {
    /// Short machine-readable name of the error family, used on the console wire.
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::State(_) => "state",
            EngineError::NotFound(_) => "not_found",
            EngineError::Authorization(_) => "authorization",
            EngineError::Storage(_) => "storage",
            EngineError::Shutdown(_) => "shutdown",
        }
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
