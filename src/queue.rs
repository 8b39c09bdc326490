use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::coding::Coding;
use crate::context::JobContext;
use crate::errors::{CodingError, EnqueueError};
use crate::job::{Job, JobStatus, Payload};
use crate::reconciler::{Handlers, Reconciler, Reporter, default_reporter};
use crate::store::{Collection, Id, Store};
use crate::task::Task;
use crate::{util, worker};

/// The parameters of a job to be enqueued.
#[derive(Clone, Debug)]
pub struct Blueprint {
    /// The task name.
    pub name: String,
    /// The encoded payload.
    pub data: Vec<u8>,
    /// The label used together with `period` for deduplicated enqueueing.
    pub label: String,
    /// The initial delay before the job becomes available.
    pub delay: Duration,
    /// The deduplication period. If set together with a label, the job is
    /// only enqueued while no matching job is outstanding or has recently
    /// finished.
    pub period: Duration,
}

impl Blueprint {
    /// Create a blueprint for a payload type with a static name.
    pub fn new<J: Payload>(job: &J) -> Result<Blueprint, CodingError> {
        Blueprint::named(J::NAME, J::CODING, job)
    }

    /// Create a blueprint for a dynamically named task.
    pub fn named<T: Serialize>(
        name: impl Into<String>,
        coding: Coding,
        payload: &T,
    ) -> Result<Blueprint, CodingError> {
        Ok(Blueprint {
            name: name.into(),
            data: coding.marshal(payload)?,
            label: String::new(),
            delay: Duration::ZERO,
            period: Duration::ZERO,
        })
    }

    /// Set the label.
    pub fn label(mut self, label: impl Into<String>) -> Blueprint {
        self.label = label.into();
        self
    }

    /// Set the initial delay.
    pub fn delay(mut self, delay: Duration) -> Blueprint {
        self.delay = delay;
        self
    }

    /// Set the deduplication period.
    pub fn period(mut self, period: Duration) -> Blueprint {
        self.period = period;
        self
    }
}

/// Enqueue a job described by the blueprint into the given job collection.
///
/// Returns the id of the inserted job, or `None` if the blueprint carries a
/// label and a period and a matching job is still outstanding or has
/// finished within the period. The check and the insert happen in one
/// atomic operation.
#[instrument(name = "queue.enqueue", skip(jobs, blueprint), fields(job.name = %blueprint.name))]
pub async fn enqueue(
    jobs: &Collection<Job>,
    blueprint: Blueprint,
) -> Result<Option<Id>, EnqueueError> {
    let now = Utc::now();
    let available = util::add(now, blueprint.delay);
    let job = Job::enqueued(blueprint.name, blueprint.label, blueprint.data, now, available);

    if blueprint.period.is_zero() || job.label.is_empty() {
        jobs.insert(&job).await?;
        return Ok(Some(job.id));
    }

    let name = job.name.clone();
    let label = job.label.clone();
    let cutoff = now
        .checked_sub_signed(util::delta(blueprint.period))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    let inserted = jobs
        .insert_unless(&job, move |other| {
            other.name == name
                && other.label == label
                && (!other.status.is_terminal()
                    || other.finished.is_some_and(|finished| finished > cutoff))
        })
        .await?;

    Ok(inserted.then_some(job.id))
}

/// Queue options.
pub struct QueueOptions {
    /// The store used to manage jobs.
    pub store: Store,
    /// The upper bound of the random lag added to board entries to
    /// de-synchronize competing processes. Default: 100 ms.
    pub max_lag: Duration,
    /// The in-memory suppression applied to a board entry after a tentative
    /// claim, until the change stream delivers its new state. Default: 10 s.
    pub block_period: Duration,
    /// The callback invoked with asynchronous errors.
    pub reporter: Option<Reporter>,
}

impl QueueOptions {
    /// Create options with defaults for the given store.
    pub fn new(store: Store) -> QueueOptions {
        QueueOptions {
            store,
            max_lag: Duration::from_millis(100),
            block_period: Duration::from_secs(10),
            reporter: None,
        }
    }
}

/// A one-shot signal resolved once the queue has caught up with the job
/// collection after [`Queue::run`].
pub struct Synced(oneshot::Receiver<()>);

impl Synced {
    /// Wait for the queue to be synced.
    pub async fn wait(self) {
        let _ = self.0.await;
    }
}

/// The queue schedules, dispatches and retries jobs.
///
/// Tasks are registered with [`add`](Queue::add) before the queue is started
/// with [`run`](Queue::run). The queue keeps one in-memory board of
/// dispatchable jobs per task, populated by a reconciler on the job
/// collection, and runs the configured number of executors per task.
/// Handles are cheap to clone and refer to the same queue.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    store: Store,
    jobs: Collection<Job>,
    max_lag: Duration,
    block_period: Duration,
    reporter: Reporter,
    token: CancellationToken,
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    tasks: HashMap<String, Arc<Task>>,
    handles: Vec<JoinHandle<()>>,
    reconciler: Option<Reconciler>,
    running: bool,
}

impl Queue {
    /// Create a new queue with the given options.
    pub fn new(options: QueueOptions) -> Queue {
        let jobs = options.store.collection::<Job>();

        Queue {
            inner: Arc::new(QueueInner {
                store: options.store,
                jobs,
                max_lag: options.max_lag,
                block_period: options.block_period,
                reporter: options.reporter.unwrap_or_else(default_reporter),
                token: CancellationToken::new(),
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// The store backing this queue.
    pub fn store(&self) -> Store {
        self.inner.store.clone()
    }

    /// Register a task.
    ///
    /// Panics if the queue is already running or a task with the same name
    /// is registered.
    pub fn add(&self, task: Task) {
        let mut state = self.inner.state.lock().unwrap();

        if state.running {
            panic!("queue: unable to add task to a running queue");
        }
        if state.tasks.contains_key(task.name()) {
            panic!("queue: task {:?} is already registered", task.name());
        }

        state.tasks.insert(task.name().to_string(), Arc::new(task));
    }

    /// Start processing jobs.
    ///
    /// Spawns the per-task worker pools and timers plus one reconciler on
    /// the job collection. Must be called from within a tokio runtime and
    /// panics if the queue is already running.
    pub fn run(&self) -> Synced {
        let mut state = self.inner.state.lock().unwrap();

        if state.running {
            panic!("queue: already running");
        }
        state.running = true;

        let state = &mut *state;

        // build one board per task
        let boards: Arc<HashMap<String, Arc<Board>>> = Arc::new(
            state
                .tasks
                .keys()
                .map(|name| (name.clone(), Arc::new(Board::new())))
                .collect(),
        );

        // start workers and timers
        for task in state.tasks.values() {
            let board = boards[task.name()].clone();

            for index in 1..=task.workers {
                let handle = tokio::spawn(worker::executor(
                    self.clone(),
                    task.clone(),
                    board.clone(),
                    self.inner.token.child_token(),
                    index,
                ));
                state.handles.push(handle);
            }

            let handle = tokio::spawn(worker::timer(
                self.clone(),
                task.clone(),
                board.clone(),
                self.inner.token.child_token(),
            ));
            state.handles.push(handle);
        }

        // reconcile the job collection into the boards
        let (sender, receiver) = oneshot::channel();
        let max_lag = self.inner.max_lag;
        let created = boards.clone();
        let updated = boards.clone();
        let deleted = boards;

        let handlers = Handlers::new()
            .on_synced(move || {
                let _ = sender.send(());
            })
            .on_created(move |job: Job| {
                if let Some(board) = created.get(&job.name) {
                    board.apply(job, max_lag);
                }
            })
            .on_updated(move |job: Job| {
                if let Some(board) = updated.get(&job.name) {
                    board.apply(job, max_lag);
                }
            })
            .on_deleted(move |id| {
                for board in deleted.values() {
                    board.remove(id);
                }
            });

        state.reconciler = Some(Reconciler::spawn(
            self.inner.jobs.clone(),
            handlers,
            Some(self.inner.reporter.clone()),
        ));

        Synced(receiver)
    }

    /// Request termination and wait for all workers and the reconciler.
    ///
    /// Jobs that are executing when the queue closes are abandoned and
    /// recovered through claim expiry by the next running process.
    pub async fn close(&self) {
        self.inner.token.cancel();

        let (reconciler, handles) = {
            let mut state = self.inner.state.lock().unwrap();
            (state.reconciler.take(), std::mem::take(&mut state.handles))
        };

        if let Some(reconciler) = reconciler {
            reconciler.close().await;
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Enqueue a job using this queue's store.
    pub async fn enqueue(&self, blueprint: Blueprint) -> Result<Option<Id>, EnqueueError> {
        enqueue(&self.inner.jobs, blueprint).await
    }

    /// Enqueue a job and wait for it to reach a terminal state.
    ///
    /// A zero timeout selects a default of ten seconds. Fails if the job is
    /// deduplicated or the timeout elapses.
    pub async fn await_job(
        &self,
        blueprint: Blueprint,
        timeout: Duration,
    ) -> anyhow::Result<Job> {
        let timeout = if timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            timeout
        };

        let id = self
            .enqueue(blueprint)
            .await?
            .ok_or_else(|| anyhow::anyhow!("job was deduplicated"))?;

        let jobs = self.inner.jobs.clone();
        let wait = async move {
            loop {
                match jobs.find(id).await? {
                    Some(job) if job.status.is_terminal() => return Ok(job),
                    Some(_) => {}
                    None => anyhow::bail!("job disappeared"),
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for job"))?
    }

    /// Create a request-pipeline callback that enqueues the blueprint
    /// returned by the factory for matching operations.
    pub fn callback(
        &self,
        matcher: impl Fn(Operation) -> bool + Send + Sync + 'static,
        factory: impl Fn(Operation) -> anyhow::Result<Blueprint> + Send + Sync + 'static,
    ) -> EnqueueCallback {
        EnqueueCallback {
            queue: self.clone(),
            matcher: Box::new(matcher),
            factory: Box::new(factory),
        }
    }

    pub(crate) fn jobs(&self) -> Collection<Job> {
        self.inner.jobs.clone()
    }

    pub(crate) fn block_period(&self) -> Duration {
        self.inner.block_period
    }

    pub(crate) fn reporter(&self) -> Reporter {
        self.inner.reporter.clone()
    }

    pub(crate) fn context(&self, job: &Job) -> JobContext {
        JobContext {
            id: job.id,
            name: job.name.clone(),
            label: job.label.clone(),
            attempt: job.attempts,
            store: self.store(),
            queue: self.clone(),
            jobs: self.jobs(),
        }
    }
}

/// A document operation in a request pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// A document is being created.
    Create,
    /// A document is being updated.
    Update,
    /// A document is being deleted.
    Delete,
}

/// A matcher accepting only the listed operations.
pub fn only(operations: &'static [Operation]) -> impl Fn(Operation) -> bool + Send + Sync {
    move |operation| operations.contains(&operation)
}

/// A matcher accepting all but the listed operations.
pub fn except(operations: &'static [Operation]) -> impl Fn(Operation) -> bool + Send + Sync {
    move |operation| !operations.contains(&operation)
}

/// A request-pipeline callback that enqueues a job for matching operations.
///
/// When the pipeline operates on the queue's own store the enqueue uses the
/// pipeline's store handle directly, otherwise it falls back to the queue.
pub struct EnqueueCallback {
    queue: Queue,
    matcher: Box<dyn Fn(Operation) -> bool + Send + Sync>,
    factory: Box<dyn Fn(Operation) -> anyhow::Result<Blueprint> + Send + Sync>,
}

impl EnqueueCallback {
    /// Run the callback for one pipeline operation.
    pub async fn call(&self, store: &Store, operation: Operation) -> anyhow::Result<Option<Id>> {
        if !(self.matcher)(operation) {
            return Ok(None);
        }

        let blueprint = (self.factory)(operation)?;

        let jobs = if store.is(&self.queue.inner.store) {
            store.collection::<Job>()
        } else {
            self.queue.jobs()
        };

        Ok(enqueue(&jobs, blueprint).await?)
    }
}

/// The per-task in-memory set of known dispatchable jobs, updated from the
/// job change stream.
pub(crate) struct Board {
    jobs: Mutex<HashMap<Id, Job>>,
    notify: Notify,
}

impl Board {
    pub(crate) fn new() -> Board {
        Board {
            jobs: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    /// Apply an observed job state.
    ///
    /// Dispatchable jobs are stored with a uniform random lag added to their
    /// availability so that competing processes do not attempt claims in
    /// lockstep. Terminal jobs are removed.
    pub(crate) fn apply(&self, mut job: Job, max_lag: Duration) {
        match job.status {
            JobStatus::Enqueued | JobStatus::Dequeued | JobStatus::Failed => {
                let lag = util::with_jitter(Duration::ZERO, max_lag);
                job.available = util::add(job.available, lag);
                self.jobs.lock().unwrap().insert(job.id, job);
            }
            JobStatus::Completed | JobStatus::Cancelled => {
                self.jobs.lock().unwrap().remove(&job.id);
            }
        }

        self.notify.notify_waiters();
    }

    pub(crate) fn remove(&self, id: Id) {
        self.jobs.lock().unwrap().remove(&id);
        self.notify.notify_waiters();
    }

    /// Pick any job that is available now and block it for the given period
    /// so it is not offered again immediately. There is no ordering
    /// guarantee between simultaneously available jobs.
    pub(crate) fn claim_candidate(&self, block_period: Duration) -> Option<Id> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().unwrap();

        for job in jobs.values_mut() {
            if job.available <= now {
                job.available = util::add(job.available, block_period);
                return Some(job.id);
            }
        }

        None
    }

    /// The ids of jobs whose claim has outlived the given timeout.
    pub(crate) fn expired(&self, timeout: Duration) -> Vec<Id> {
        if timeout.is_zero() {
            return Vec::new();
        }

        let now = Utc::now();
        let timeout = util::delta(timeout);
        let jobs = self.jobs.lock().unwrap();

        jobs.values()
            .filter(|job| {
                job.status == JobStatus::Dequeued
                    && job
                        .started
                        .is_some_and(|started| now.signed_duration_since(started) >= timeout)
            })
            .map(|job| job.id)
            .collect()
    }

    /// The earliest availability among the known jobs.
    pub(crate) fn next_available(&self) -> Option<DateTime<Utc>> {
        let jobs = self.jobs.lock().unwrap();
        jobs.values().map(|job| job.available).min()
    }

    /// Resolves when the board content changes.
    pub(crate) async fn changed(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board_job(status: JobStatus, available: DateTime<Utc>) -> Job {
        let mut job = Job::enqueued("test".into(), String::new(), Vec::new(), available, available);
        job.status = status;
        job
    }

    #[test]
    fn board_applies_bounded_lag() {
        let board = Board::new();
        let available = Utc::now();
        let max_lag = Duration::from_millis(100);

        for _ in 0..50 {
            let job = board_job(JobStatus::Enqueued, available);
            let id = job.id;
            board.apply(job, max_lag);

            let jobs = board.jobs.lock().unwrap();
            let lagged = jobs[&id].available;
            assert!(lagged >= available);
            assert!(lagged < available + chrono::Duration::milliseconds(100));
        }
    }

    #[test]
    fn board_removes_terminal_jobs() {
        let board = Board::new();

        let job = board_job(JobStatus::Enqueued, Utc::now());
        let id = job.id;
        board.apply(job.clone(), Duration::ZERO);
        assert!(board.jobs.lock().unwrap().contains_key(&id));

        let mut done = job;
        done.status = JobStatus::Completed;
        board.apply(done, Duration::ZERO);
        assert!(!board.jobs.lock().unwrap().contains_key(&id));
    }

    #[test]
    fn claim_candidates_are_blocked() {
        let board = Board::new();
        let block = Duration::from_secs(10);

        let job = board_job(JobStatus::Enqueued, Utc::now() - chrono::Duration::seconds(1));
        let id = job.id;
        board.apply(job, Duration::ZERO);

        // the first pick returns the job, the second finds it blocked
        assert_eq!(board.claim_candidate(block), Some(id));
        assert_eq!(board.claim_candidate(block), None);
    }

    #[test]
    fn expired_claims_are_detected() {
        let board = Board::new();
        let timeout = Duration::from_secs(60);

        let mut stale = board_job(JobStatus::Dequeued, Utc::now());
        stale.started = Some(Utc::now() - chrono::Duration::seconds(120));
        let stale_id = stale.id;
        board.apply(stale, Duration::ZERO);

        let mut fresh = board_job(JobStatus::Dequeued, Utc::now());
        fresh.started = Some(Utc::now());
        board.apply(fresh, Duration::ZERO);

        assert_eq!(board.expired(timeout), vec![stale_id]);
        assert_eq!(board.expired(Duration::ZERO), Vec::<Id>::new());
    }
}
