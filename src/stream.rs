use tokio::sync::broadcast;

use crate::errors::StreamError;
use crate::store::{Id, Model};

/// The kind of change observed on a collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeOp {
    /// A document was inserted.
    Created,
    /// A document was replaced by a conditional update.
    Updated,
    /// A document was deleted.
    Deleted,
}

/// A position in a collection's change log.
///
/// Tokens increase monotonically per collection. A token handed out with an
/// event can be passed back to [`Collection::watch`](crate::Collection::watch)
/// to resume the stream after that event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResumeToken(pub(crate) u64);

/// A single change observed on a collection.
#[derive(Clone, Debug)]
pub struct ChangeEvent<M> {
    /// The kind of change.
    pub op: ChangeOp,
    /// The id of the affected document.
    pub id: Id,
    /// The document after the change; absent for deletions.
    pub model: Option<M>,
    /// The resume position of this event.
    pub token: ResumeToken,
}

/// The subscriber half of a collection change stream.
///
/// Events are delivered in commit order. A subscriber that falls behind the
/// retained window observes [`StreamError::Lagged`] and must re-scan the
/// collection to catch up.
#[derive(Debug)]
pub struct ChangeStream<M> {
    pub(crate) backlog: std::collections::VecDeque<ChangeEvent<M>>,
    pub(crate) receiver: broadcast::Receiver<ChangeEvent<M>>,
}

impl<M: Model> ChangeStream<M> {
    /// Await the next change event.
    pub async fn next(&mut self) -> Result<ChangeEvent<M>, StreamError> {
        if let Some(event) = self.backlog.pop_front() {
            return Ok(event);
        }

        match self.receiver.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Lagged(_)) => Err(StreamError::Lagged),
            Err(broadcast::error::RecvError::Closed) => Err(StreamError::Closed),
        }
    }
}
