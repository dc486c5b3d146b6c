use std::borrow::Cow;

use thiserror::Error;

use crate::types::{EntityRef, RelationType};

/// Top-level error type returned by the association engine.
#[derive(Debug, Error)]
pub enum FleetError {
    /// A referenced entity does not exist (or is soft-deleted when an active entity is required).
    #[error("entity not found: {entity}")]
    NotFound { entity: EntityRef },

    /// The pair is already linked for this relation type.
    #[error("{subject} is already linked to {object} via {relation}")]
    DuplicateLink {
        relation: RelationType,
        subject: EntityRef,
        object: EntityRef,
    },

    /// Unlink requested for a pair that has no association record.
    #[error("{subject} is not linked to {object} via {relation}")]
    NotLinked {
        relation: RelationType,
        subject: EntityRef,
        object: EntityRef,
    },

    /// A "one" side of the relation already holds an active association.
    #[error("{entity} already holds an active {relation} association (current counterpart: {holder:?})")]
    CapacityExceeded {
        relation: RelationType,
        entity: EntityRef,
        holder: Option<String>,
    },

    /// An entity vanished between existence validation and the guarded write.
    #[error("entities changed between validation and write: {entities:?}")]
    PartialInputInvalid { entities: Vec<EntityRef> },

    /// Retryable infrastructure fault (throttling, network blip, replica loading).
    #[error("transient store error after {attempts} attempt(s): {message}")]
    TransientStore { message: String, attempts: u32 },

    /// A multi-transaction cascade stopped partway; re-issue the same call to continue.
    #[error("cascade delete of {entity} stopped after {deleted_count} association(s): {source}")]
    PartialCascadeFailure {
        entity: EntityRef,
        deleted_count: u64,
        #[source]
        source: Box<FleetError>,
    },

    /// The caller's deadline expired; the outcome of an in-flight write is unknown.
    #[error("deadline exceeded during {operation}; outcome is indeterminate")]
    DeadlineExceeded { operation: &'static str },

    /// Invalid input supplied to an engine operation.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// The plan holds more items than a single store transaction accepts.
    #[error("transaction holds {items} items, limit is {limit}")]
    TransactionTooLarge { items: usize, limit: usize },

    /// Non-transient Redis failure.
    #[error("redis error: {0}")]
    Redis(redis::RedisError),

    /// Stored or scripted payload could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("{message}")]
    Other { message: Cow<'static, str> },
}

impl FleetError {
    /// Retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStore { .. })
    }

    /// The error reflects a real state conflict and must not be retried blindly.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::DuplicateLink { .. } | Self::NotLinked { .. } | Self::CapacityExceeded { .. } | Self::NotFound { .. }
        )
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest { message: message.into() }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientStore {
            message: message.into(),
            attempts: 1,
        }
    }

    pub(crate) fn with_attempts(self, attempts: u32) -> Self {
        match self {
            Self::TransientStore { message, .. } => Self::TransientStore { message, attempts },
            other => other,
        }
    }
}

impl From<redis::RedisError> for FleetError {
    fn from(err: redis::RedisError) -> Self {
        if is_transient_redis_error(&err) {
            FleetError::transient(err.to_string())
        } else {
            FleetError::Redis(err)
        }
    }
}

fn is_transient_redis_error(err: &redis::RedisError) -> bool {
    use redis::ErrorKind;

    if err.is_io_error() || err.is_timeout() || err.is_connection_dropped() || err.is_connection_refusal() {
        return true;
    }
    matches!(err.kind(), ErrorKind::BusyLoadingError | ErrorKind::TryAgain)
        || err.code().is_some_and(|code| code == "BUSY")
}
