use chrono::Utc;

use crate::errors::Cancel;
use crate::job::{Job, JobStatus};
use crate::queue::Queue;
use crate::store::{Collection, Id, Store};

/// The context passed to a task handler for one attempt.
pub struct JobContext {
    /// The id of the executing job.
    pub id: Id,
    /// The task name.
    pub name: String,
    /// The job label.
    pub label: String,
    /// The current attempt number, starting at one.
    pub attempt: u32,
    /// The store backing the queue.
    pub store: Store,
    /// The queue executing the job, usable for follow-up enqueues.
    pub queue: Queue,
    pub(crate) jobs: Collection<Job>,
}

impl JobContext {
    /// Persist the job progress and append a matching event atomically.
    ///
    /// Fails if the job is no longer held by this attempt, in which case the
    /// handler should abort as its result will be discarded anyway.
    pub async fn progress(&self, progress: f64) -> anyhow::Result<()> {
        let progress = progress.clamp(0.0, 1.0);
        let attempt = self.attempt;
        let now = Utc::now();

        let matched = self
            .jobs
            .update_one(self.id, move |job| {
                if job.status != JobStatus::Dequeued || job.attempts != attempt {
                    return None;
                }

                let mut next = job.clone();
                next.progress = progress;
                next.log(now, "");
                Some(next)
            })
            .await?;

        anyhow::ensure!(matched, "job is no longer held by this attempt");

        Ok(())
    }

    /// Construct the cancellation sentinel with the given reason.
    ///
    /// Returning this error from a handler cancels the job terminally
    /// instead of retrying it.
    pub fn cancel(&self, reason: impl Into<String>) -> anyhow::Error {
        Cancel::new(reason)
    }
}
