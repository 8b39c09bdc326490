#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod coding;
pub mod compute;
mod context;
mod errors;
mod job;
mod queue;
mod reconciler;
mod store;
mod stream;
mod task;
mod util;
mod worker;

pub use self::coding::Coding;
pub use self::context::JobContext;
pub use self::errors::{Cancel, CodingError, EnqueueError, StoreError, StreamError};
pub use self::job::{Job, JobEvent, JobStatus, Payload};
pub use self::queue::{
    Blueprint, EnqueueCallback, Operation, Queue, QueueOptions, Synced, enqueue, except, only,
};
pub use self::reconciler::{Handlers, Reconciler, Reporter};
pub use self::store::{Collection, Id, Model, Revision, Store};
pub use self::stream::{ChangeEvent, ChangeOp, ChangeStream, ResumeToken};
pub use self::task::{Notifier, Task};
