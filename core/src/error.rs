use thiserror::Error;

/// Errors raised by the durable task store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failure (filesystem engine).
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    /// A stored record could not be (de)serialized.
    #[error("store record encoding: {0}")]
    Encoding(#[from] bincode::Error),
    /// The task id is unknown to the store.
    #[error("task {0} not found")]
    NotFound(String),
    /// The store refused the operation (poisoned lock, closed backend, ...).
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised while encoding or decoding a task argument.
#[derive(Debug, Error)]
pub enum CodecError {
    /// JSON codec failure.
    #[error("json codec: {0}")]
    Json(#[from] serde_json::Error),
    /// Bincode codec failure.
    #[error("bincode codec: {0}")]
    Bincode(#[from] bincode::Error),
}

/// Errors produced by the retry engine itself.
///
/// Handler failures are never mapped into this type; they stay
/// `anyhow::Error` and flow back to whoever invoked the handler.
#[derive(Debug, Error)]
pub enum RetryError {
    /// Identity longer than [`crate::handler::MAX_IDENTITY_LEN`].
    #[error("identity={identity} is too long ({len} chars), it must be at most {max}")]
    IdentityTooLong {
        /// Offending identity.
        identity: String,
        /// Its length in characters.
        len: usize,
        /// Allowed maximum.
        max: usize,
    },
    /// Blank identity.
    #[error("handler identity must not be blank")]
    EmptyIdentity,
    /// A handler with this identity is already registered.
    #[error("identity={0} is already registered")]
    DuplicateIdentity(String),
    /// Neither or both of cron/interval set, or a zero interval.
    #[error("identity={identity}: {reason}")]
    InvalidSchedule {
        /// Handler identity.
        identity: String,
        /// What is wrong with the schedule.
        reason: String,
    },
    /// Cron expression failed to parse.
    #[error("identity={identity}: invalid cron expression {expression:?}: {source}")]
    InvalidCron {
        /// Handler identity.
        identity: String,
        /// Expression as given.
        expression: String,
        /// Parser error.
        #[source]
        source: cron::error::Error,
    },
    /// The distributed backend only accepts cron schedules.
    #[error("identity={0}: the distributed scheduler requires a cron expression")]
    CronRequired(String),
    /// The backend selected for a handler was not configured on the engine.
    #[error("identity={identity}: {backend} scheduler backend is not configured")]
    BackendUnavailable {
        /// Handler identity.
        identity: String,
        /// Backend that was asked for.
        backend: &'static str,
    },
    /// No job is registered under this identity.
    #[error("no job registered for identity={0}")]
    UnknownJob(String),
    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Codec failure.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// Coordination service failure.
    #[error("coordination: {0}")]
    Coordination(String),
    /// The scheduler is shutting down.
    #[error("scheduler is shut down")]
    SchedulerClosed,
    /// A tick was aborted before producing an outcome.
    #[error("tick for identity={0} aborted")]
    TickAborted(String),
    /// A scheduler was built outside of a Tokio runtime.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

impl RetryError {
    /// True for errors that abort registration (bad handler configuration).
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            RetryError::IdentityTooLong { .. }
                | RetryError::EmptyIdentity
                | RetryError::DuplicateIdentity(_)
                | RetryError::InvalidSchedule { .. }
                | RetryError::InvalidCron { .. }
                | RetryError::CronRequired(_)
                | RetryError::BackendUnavailable { .. }
        )
    }
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, RetryError>;
