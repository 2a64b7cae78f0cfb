use thiserror::Error;
use uuid::Uuid;

/// Errors returned by a [`JobStore`](crate::storage::JobStore).
#[derive(Debug, Error)]
pub enum StorageError {
    /// The database rejected or could not run a statement.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Applying the embedded migrations failed.
    #[error("failed to migrate the job store: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// A stored JSON column could not be (de)serialized.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// A job with this id already exists.
    #[error("job {0} already exists")]
    DuplicateKey(Uuid),

    /// No job with this id exists.
    #[error("job {0} does not exist")]
    JobNotFound(Uuid),

    /// The job is not in a state that allows the requested transition.
    #[error("job {id} is not in the expected state ({expected})")]
    PreconditionFailed {
        /// The job that was addressed.
        id: Uuid,
        /// The state(s) the transition requires.
        expected: &'static str,
    },
}

/// Errors that can occur when enqueueing jobs or registering cron schedules.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// An error occurred while serializing the job data.
    #[error(transparent)]
    SerializationError(#[from] serde_json::Error),

    /// The job data did not serialize to a JSON object.
    #[error("job data for `{0}` must serialize to a JSON object")]
    InvalidData(String),

    /// A cron expression or time zone was rejected.
    #[error(transparent)]
    InvalidCron(#[from] CronError),

    /// The store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<sqlx::Error> for EnqueueError {
    fn from(error: sqlx::Error) -> Self {
        Self::Storage(StorageError::Database(error))
    }
}

/// Errors raised while validating a cron schedule.
#[derive(Debug, Error)]
pub enum CronError {
    /// The expression is not a valid five-field cron expression.
    #[error("invalid cron expression `{expression}`: {reason}")]
    InvalidExpression {
        /// The rejected expression.
        expression: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The time zone is not a known IANA name.
    #[error("unknown time zone `{0}`")]
    InvalidTimeZone(String),
}

/// Errors raised while decoding or invoking a deferred call.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The descriptor is not valid JSON of the expected shape.
    #[error("malformed call descriptor: {0}")]
    MalformedDescriptor(#[source] serde_json::Error),

    /// No calls are registered for the target.
    #[error("no calls registered for target `{0}`")]
    TypeNotFound(String),

    /// The target exists but the method does not.
    #[error("target `{target}` has no method `{method}`")]
    MethodNotFound {
        /// The call target.
        target: String,
        /// The missing method.
        method: String,
    },

    /// An argument is missing or has the wrong type.
    #[error("argument {index} of `{method}`: {reason}")]
    ArgumentMismatch {
        /// The called method.
        method: String,
        /// Zero-based argument position.
        index: usize,
        /// What went wrong.
        reason: String,
    },
}
