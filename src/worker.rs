use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use futures_util::FutureExt;
use tokio::time::{MissedTickBehavior, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, trace, warn};

use crate::errors::Cancel;
use crate::job::{Job, JobStatus};
use crate::queue::{Board, Queue, enqueue};
use crate::store::{Collection, Id};
use crate::task::Task;
use crate::util;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const POLL_JITTER: Duration = Duration::from_millis(100);
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);
const MIN_WAIT: Duration = Duration::from_millis(10);

/// One executor of a task's worker pool. Repeatedly picks claim candidates
/// from the board, claims them atomically and runs the handler.
pub(crate) async fn executor(
    queue: Queue,
    task: Arc<Task>,
    board: Arc<Board>,
    token: CancellationToken,
    index: usize,
) {
    let span = info_span!("executor", task.name = %task.name(), worker.index = index);

    async move {
        loop {
            if token.is_cancelled() {
                break;
            }

            let Some(id) = board.claim_candidate(queue.block_period()) else {
                let wait = idle_wait(&board);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = board.changed() => {}
                    _ = sleep(wait) => {}
                }
                continue;
            };

            if let Err(error) = run_job(&queue, &task, id, &token).await {
                (queue.reporter())(error);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(util::with_jitter(POLL_INTERVAL, POLL_JITTER)) => {}
                }
            }
        }

        debug!("executor stopped");
    }
    .instrument(span)
    .await
}

/// How long to sleep when no claim candidate is available. Prefers the time
/// until the next known job becomes available, bounded by the poll interval.
fn idle_wait(board: &Board) -> Duration {
    match board.next_available() {
        Some(at) => at
            .signed_duration_since(Utc::now())
            .to_std()
            .map(|wait| wait.clamp(MIN_WAIT, POLL_INTERVAL))
            .unwrap_or(MIN_WAIT),
        None => util::with_jitter(POLL_INTERVAL, POLL_JITTER),
    }
}

/// Claim and execute a single job. Infrastructure errors are returned;
/// handler outcomes are applied to the job document.
async fn run_job(
    queue: &Queue,
    task: &Arc<Task>,
    id: Id,
    token: &CancellationToken,
) -> anyhow::Result<()> {
    let jobs = queue.jobs();
    let now = Utc::now();

    // claim the job, racing other workers and processes
    let mut claimed = None;
    jobs.update_one(id, |job| {
        if !matches!(job.status, JobStatus::Enqueued | JobStatus::Failed) || job.available > now {
            return None;
        }

        let mut next = job.clone();
        next.status = JobStatus::Dequeued;
        next.started = Some(now);
        next.attempts += 1;
        next.progress = 0.0;
        next.log(now, "");
        claimed = Some(next.clone());
        Some(next)
    })
    .await?;

    let Some(job) = claimed else {
        trace!(job.id = %id, "lost the claim");
        return Ok(());
    };

    let span = info_span!("job", job.id = %id, job.name = %job.name, job.attempt = job.attempts);
    let attempt = job.attempts;

    let context = queue.context(&job);
    let future = (task.run)(context, job.data.clone());
    let future = AssertUnwindSafe(future).catch_unwind();

    let outcome = tokio::select! {
        // on shutdown the job is abandoned; claim expiry recovers it in the
        // next running process
        _ = token.cancelled() => return Ok(()),
        outcome = execute(attempt_deadline(task), future).instrument(span.clone()) => outcome,
    };

    let _enter = span.enter();
    match outcome {
        Ok(result) => {
            debug!("job completed");
            complete(&jobs, task, id, attempt, result).await?;
        }
        Err(error) => {
            if let Some(cancel) = error.downcast_ref::<Cancel>() {
                debug!("job cancelled: {}", cancel.reason());
                let reason = cancel.reason().to_string();
                cancel_job(&jobs, task, id, attempt, reason).await?;
            } else {
                warn!("job failed: {error:#}");
                fail(&jobs, task, id, attempt, format!("{error:#}")).await?;
            }
        }
    }

    Ok(())
}

/// The per-attempt deadline: the shorter of the task lifetime and the claim
/// timeout, either being absent when zero.
fn attempt_deadline(task: &Task) -> Option<Duration> {
    match (task.lifetime.is_zero(), task.timeout.is_zero()) {
        (true, true) => None,
        (false, true) => Some(task.lifetime),
        (true, false) => Some(task.timeout),
        (false, false) => Some(task.lifetime.min(task.timeout)),
    }
}

/// Drive the handler future under an optional deadline, converting panics
/// and deadline misses into errors.
async fn execute<F>(deadline: Option<Duration>, future: F) -> anyhow::Result<Vec<u8>>
where
    F: std::future::Future<Output = Result<anyhow::Result<Vec<u8>>, Box<dyn std::any::Any + Send>>>,
{
    let result = match deadline {
        Some(limit) => match tokio::time::timeout(limit, future).await {
            Ok(result) => result,
            Err(_) => return Err(anyhow!("deadline exceeded")),
        },
        None => future.await,
    };

    result.unwrap_or_else(|payload| Err(anyhow!(util::panic_reason(&*payload))))
}

async fn complete(
    jobs: &Collection<Job>,
    task: &Task,
    id: Id,
    attempt: u32,
    result: Vec<u8>,
) -> anyhow::Result<()> {
    let now = Utc::now();

    let mut applied = None;
    jobs.update_one(id, |job| {
        if job.status != JobStatus::Dequeued || job.attempts != attempt {
            return None;
        }

        let mut next = job.clone();
        next.status = JobStatus::Completed;
        next.progress = 1.0;
        next.ended = Some(now);
        next.finished = Some(now);
        next.result = Some(result);
        next.log(now, "");
        applied = Some(next.clone());
        Some(next)
    })
    .await?;

    notify(task, applied);

    Ok(())
}

async fn cancel_job(
    jobs: &Collection<Job>,
    task: &Task,
    id: Id,
    attempt: u32,
    reason: String,
) -> anyhow::Result<()> {
    let now = Utc::now();

    let mut applied = None;
    jobs.update_one(id, |job| {
        if job.status != JobStatus::Dequeued || job.attempts != attempt {
            return None;
        }

        let mut next = job.clone();
        next.status = JobStatus::Cancelled;
        next.ended = Some(now);
        next.finished = Some(now);
        next.log(now, reason);
        applied = Some(next.clone());
        Some(next)
    })
    .await?;

    notify(task, applied);

    Ok(())
}

async fn fail(
    jobs: &Collection<Job>,
    task: &Task,
    id: Id,
    attempt: u32,
    reason: String,
) -> anyhow::Result<()> {
    let now = Utc::now();
    let retry = attempt < task.max_attempts;
    let delay = util::backoff(task.min_delay, task.max_delay, task.backoff, attempt);

    let mut applied = None;
    jobs.update_one(id, |job| {
        if job.status != JobStatus::Dequeued || job.attempts != attempt {
            return None;
        }

        let mut next = job.clone();
        next.ended = Some(now);
        if retry {
            next.status = JobStatus::Failed;
            next.available = util::add(now, delay);
            next.log(now, reason);
        } else {
            next.status = JobStatus::Failed;
            next.log(now, reason);
            next.status = JobStatus::Cancelled;
            next.finished = Some(now);
            next.log(now, "max attempts exceeded");
        }
        applied = Some(next.clone());
        Some(next)
    })
    .await?;

    notify(task, applied);

    Ok(())
}

fn notify(task: &Task, job: Option<Job>) {
    if let (Some(notifier), Some(job)) = (&task.notifier, job) {
        notifier(&job);
    }
}

/// The per-task timer loop: sweeps expired claims and enqueues the periodic
/// blueprint, if one is configured.
pub(crate) async fn timer(
    queue: Queue,
    task: Arc<Task>,
    board: Arc<Board>,
    token: CancellationToken,
) {
    let span = info_span!("timer", task.name = %task.name());

    async move {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut periodic = task
            .periodic
            .as_ref()
            .filter(|periodic| !periodic.interval.is_zero())
            .map(|periodic| {
                let mut interval = tokio::time::interval(periodic.interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                interval
            });

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = sweep.tick() => {
                    if let Err(error) = sweep_expired(&queue, &task, &board).await {
                        (queue.reporter())(error);
                    }
                }
                Some(_) = tick(&mut periodic) => {
                    if let Some(periodic) = task.periodic.as_ref() {
                        if let Err(error) = enqueue(&queue.jobs(), periodic.blueprint.clone()).await {
                            (queue.reporter())(error.into());
                        }
                    }
                }
            }
        }

        debug!("timer stopped");
    }
    .instrument(span)
    .await
}

async fn tick(interval: &mut Option<tokio::time::Interval>) -> Option<tokio::time::Instant> {
    match interval {
        Some(interval) => Some(interval.tick().await),
        None => None,
    }
}

/// Fail jobs whose claim has outlived the task timeout. This recovers jobs
/// abandoned by a crashed or blocked worker.
async fn sweep_expired(queue: &Queue, task: &Task, board: &Board) -> anyhow::Result<()> {
    if task.timeout.is_zero() {
        return Ok(());
    }

    let jobs = queue.jobs();
    let timeout = util::delta(task.timeout);

    for id in board.expired(task.timeout) {
        let now = Utc::now();

        let mut applied = None;
        jobs.update_one(id, |job| {
            if job.status != JobStatus::Dequeued {
                return None;
            }
            let started = job.started?;
            if now.signed_duration_since(started) < timeout {
                return None;
            }

            let attempt = job.attempts;
            let mut next = job.clone();
            next.ended = Some(now);
            if attempt < task.max_attempts {
                next.status = JobStatus::Failed;
                next.available = util::add(
                    now,
                    util::backoff(task.min_delay, task.max_delay, task.backoff, attempt),
                );
                next.log(now, "timeout");
            } else {
                next.status = JobStatus::Failed;
                next.log(now, "timeout");
                next.status = JobStatus::Cancelled;
                next.finished = Some(now);
                next.log(now, "max attempts exceeded");
            }
            applied = Some(next.clone());
            Some(next)
        })
        .await?;

        if let Some(job) = applied {
            warn!(job.id = %job.id, job.name = %job.name, "claim expired");
            notify(task, Some(job));
        }
    }

    Ok(())
}
