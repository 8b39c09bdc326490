use crate::store::Id;

/// Error type for payload and result coding operations.
#[derive(Debug, thiserror::Error)]
pub enum CodingError {
    /// JSON encoding or decoding failed.
    #[error("json coding failed")]
    Json(#[from] serde_json::Error),
    /// BSON encoding failed.
    #[error("bson encoding failed")]
    BsonEncode(#[from] bson::ser::Error),
    /// BSON decoding failed.
    #[error("bson decoding failed")]
    BsonDecode(#[from] bson::de::Error),
}

/// Error type for document store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A document with the same id already exists in the collection.
    #[error("duplicate document id {0}")]
    DuplicateId(Id),
    /// The provided resume token is older than the retained change window.
    #[error("change stream resume token expired")]
    ResumeExpired,
}

/// Error type for live change stream subscriptions.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The subscriber fell behind the retained change window and must
    /// re-scan the collection to catch up.
    #[error("change stream lagged behind the retained window")]
    Lagged,
    /// The underlying collection has been dropped.
    #[error("change stream closed")]
    Closed,
}

/// Error type for job enqueueing operations.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    /// The job payload could not be encoded.
    #[error("failed to encode job payload")]
    Coding(#[from] CodingError),
    /// The underlying store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The sentinel error returned by handlers to cancel a job terminally
/// instead of retrying it.
///
/// The worker downcasts handler errors to this type; any other error is
/// treated as transient and retried with backoff.
#[derive(Debug, thiserror::Error)]
#[error("{reason}")]
pub struct Cancel {
    reason: String,
}

impl Cancel {
    /// Create a cancellation error with the given reason.
    pub fn new(reason: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(Cancel {
            reason: reason.into(),
        })
    }

    /// The cancellation reason.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}
