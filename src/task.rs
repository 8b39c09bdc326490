use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;

use crate::coding::Coding;
use crate::context::JobContext;
use crate::job::{Job, Payload};
use crate::queue::Blueprint;

/// The type-erased handler stored in the task registry. It decodes the
/// payload, executes the typed handler and encodes the result.
pub(crate) type RunFn =
    Arc<dyn Fn(JobContext, Vec<u8>) -> BoxFuture<'static, anyhow::Result<Vec<u8>>> + Send + Sync>;

/// A callback invoked with the job document after every applied outcome.
pub type Notifier = Arc<dyn Fn(&Job) + Send + Sync>;

pub(crate) struct Periodic {
    pub(crate) interval: Duration,
    pub(crate) blueprint: Blueprint,
}

/// A named handler registration.
///
/// A task owns a worker pool with a concurrency cap and a retry policy.
/// Tasks are registered on a queue with [`Queue::add`](crate::Queue::add)
/// before the queue is started.
pub struct Task {
    pub(crate) name: String,
    pub(crate) coding: Coding,
    pub(crate) run: RunFn,
    pub(crate) workers: usize,
    pub(crate) max_attempts: u32,
    pub(crate) lifetime: Duration,
    pub(crate) timeout: Duration,
    pub(crate) min_delay: Duration,
    pub(crate) max_delay: Duration,
    pub(crate) backoff: f64,
    pub(crate) notifier: Option<Notifier>,
    pub(crate) periodic: Option<Periodic>,
}

impl Task {
    /// Create a task for a payload type with a static name.
    ///
    /// The handler receives a [`JobContext`] and the decoded payload; its
    /// result is encoded with the task coding into the job document.
    pub fn new<J, R, F, Fut>(handler: F) -> Task
    where
        J: Payload,
        R: Serialize + Send + 'static,
        F: Fn(JobContext, J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        Task::named(J::NAME, J::CODING, handler)
    }

    /// Create a task with a runtime determined name, e.g. for job families
    /// that share a payload type across differently named tasks.
    pub fn named<J, R, F, Fut>(name: impl Into<String>, coding: Coding, handler: F) -> Task
    where
        J: serde::de::DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(JobContext, J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let run: RunFn = Arc::new(move |ctx: JobContext, data: Vec<u8>| {
            let handler = handler.clone();
            async move {
                let payload: J = coding
                    .unmarshal(&data)
                    .context("failed to decode job payload")?;
                let result = handler(ctx, payload).await?;
                let result = coding
                    .marshal(&result)
                    .context("failed to encode job result")?;
                Ok(result)
            }
            .boxed()
        });

        Task {
            name: name.into(),
            coding,
            run,
            workers: 1,
            max_attempts: 3,
            lifetime: Duration::ZERO,
            timeout: Duration::from_secs(600),
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(600),
            backoff: 2.0,
            notifier: None,
            periodic: None,
        }
    }

    /// The task name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the number of concurrent executors for this task.
    pub fn workers(mut self, workers: usize) -> Task {
        self.workers = workers.max(1);
        self
    }

    /// Set the number of attempts before a failing job is cancelled.
    ///
    /// Zero means the first failure cancels the job.
    pub fn max_attempts(mut self, max_attempts: u32) -> Task {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the per-attempt soft deadline. Zero disables the deadline.
    pub fn lifetime(mut self, lifetime: Duration) -> Task {
        self.lifetime = lifetime;
        self
    }

    /// Set the absolute claim timeout after which an abandoned job is
    /// failed by the sweeper. Zero disables claim expiry.
    pub fn timeout(mut self, timeout: Duration) -> Task {
        self.timeout = timeout;
        self
    }

    /// Set the minimum retry delay.
    pub fn min_delay(mut self, min_delay: Duration) -> Task {
        self.min_delay = min_delay;
        self
    }

    /// Set the maximum retry delay.
    pub fn max_delay(mut self, max_delay: Duration) -> Task {
        self.max_delay = max_delay;
        self
    }

    /// Set the multiplicative backoff factor for retry delays.
    pub fn backoff(mut self, backoff: f64) -> Task {
        self.backoff = backoff;
        self
    }

    /// Set a callback invoked with the job document after every applied
    /// outcome.
    pub fn notifier(mut self, notifier: impl Fn(&Job) + Send + Sync + 'static) -> Task {
        self.notifier = Some(Arc::new(notifier));
        self
    }

    /// Periodically enqueue the given blueprint while the queue is running.
    ///
    /// Combined with a label and a period on the blueprint this keeps at
    /// most one such job outstanding at any time.
    pub fn periodically(mut self, interval: Duration, blueprint: Blueprint) -> Task {
        self.periodic = Some(Periodic {
            interval,
            blueprint,
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(serde::Serialize, serde::Deserialize)]
    struct TestJob {
        data: String,
    }

    impl Payload for TestJob {
        const NAME: &'static str = "test";
    }

    #[test]
    fn defaults() {
        let task = Task::new::<TestJob, _, _, _>(|_ctx, _job: TestJob| async { Ok(()) });

        assert_eq!(task.name(), "test");
        assert_eq!(task.coding, Coding::Json);
        assert_eq!(task.workers, 1);
        assert_eq!(task.max_attempts, 3);
        assert_eq!(task.lifetime, Duration::ZERO);
        assert_eq!(task.timeout, Duration::from_secs(600));
    }

    #[test]
    fn builder() {
        let task = Task::new::<TestJob, _, _, _>(|_ctx, _job: TestJob| async { Ok(()) })
            .workers(0)
            .max_attempts(1)
            .lifetime(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .min_delay(Duration::from_millis(10))
            .max_delay(Duration::from_secs(1))
            .backoff(1.5);

        // at least one worker is always kept
        assert_eq!(task.workers, 1);
        assert_eq!(task.max_attempts, 1);
        assert_eq!(task.lifetime, Duration::from_secs(5));
        assert_eq!(task.timeout, Duration::from_secs(30));
        assert_eq!(task.min_delay, Duration::from_millis(10));
        assert_eq!(task.max_delay, Duration::from_secs(1));
        assert_eq!(task.backoff, 1.5);
    }
}
