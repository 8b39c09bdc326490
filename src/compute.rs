//! Derived-value computation on top of the queue.
//!
//! A [`Computation`] describes how an output is derived from an input on the
//! models of one collection: a `hasher` fingerprints the current input, a
//! `computer` produces the output and a `releaser` clears it when the input
//! becomes empty. Mounting the computation with [`compute`] registers a
//! periodic scan job that finds models whose status is stale or whose hash
//! changed, and a per-model process job that recomputes and persists the
//! derived fields under optimistic concurrency. A change-stream trigger
//! enqueues process jobs for interactive writes as well, so their latency is
//! close to the change-stream delay.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::{self, BoxFuture};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::coding::Coding;
use crate::context::JobContext;
use crate::errors::CodingError;
use crate::job::Job;
use crate::queue::{Blueprint, Queue, enqueue};
use crate::reconciler::{Handlers, Reconciler};
use crate::store::{Collection, Id, Model, Revision, Store};
use crate::task::Task;
use crate::util;

/// The derivation status embedded in computed models.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Status {
    /// The derivation progress in `[0, 1]`.
    pub progress: f64,
    /// When the status was last written.
    pub updated: DateTime<Utc>,
    /// The fingerprint of the input the output was derived from.
    pub hash: String,
    /// Whether the output matches the input fingerprinted by `hash`.
    pub valid: bool,
}

/// Implemented by models that carry a derivation [`Status`].
pub trait Computable: Model {
    /// The embedded status, absent until the model is first processed.
    fn status(&self) -> Option<&Status>;

    /// Replace the embedded status.
    fn set_status(&mut self, status: Status);
}

/// A fingerprint function over the input fields of a model. An empty string
/// marks the input as absent and selects the release path.
pub type Hasher<M> = Arc<dyn Fn(&M) -> String + Send + Sync>;

/// An asynchronous computation step. The step owns the context for its
/// duration and hands it back, with changes staged on it.
pub type Handler<M> = Arc<
    dyn Fn(ComputeContext<M>) -> BoxFuture<'static, anyhow::Result<ComputeContext<M>>>
        + Send
        + Sync,
>;

/// The description of one derived-value computation.
pub struct Computation<M: Computable> {
    name: String,
    hasher: Hasher<M>,
    computer: Handler<M>,
    releaser: Handler<M>,
    keep_outdated: bool,
    rehash_interval: Duration,
    recompute_interval: Duration,
}

impl<M: Computable> Computation<M> {
    /// Create a computation with the given operation name.
    ///
    /// The name selects the job names of the scan and process tasks and must
    /// be unique per queue.
    pub fn new(name: impl Into<String>) -> Computation<M> {
        Computation {
            name: name.into(),
            hasher: Arc::new(|_| String::new()),
            computer: Arc::new(|context| future::ready(Ok(context)).boxed()),
            releaser: Arc::new(|context| future::ready(Ok(context)).boxed()),
            keep_outdated: false,
            rehash_interval: Duration::from_secs(3600),
            recompute_interval: Duration::from_secs(600),
        }
    }

    /// Set the input fingerprint function.
    pub fn hasher(mut self, hasher: impl Fn(&M) -> String + Send + Sync + 'static) -> Self {
        self.hasher = Arc::new(hasher);
        self
    }

    /// Set the computation step producing the output.
    pub fn computer<F, Fut>(mut self, computer: F) -> Self
    where
        F: Fn(ComputeContext<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ComputeContext<M>>> + Send + 'static,
    {
        self.computer = Arc::new(move |context| computer(context).boxed());
        self
    }

    /// Set the release step clearing the output for absent inputs.
    pub fn releaser<F, Fut>(mut self, releaser: F) -> Self
    where
        F: Fn(ComputeContext<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ComputeContext<M>>> + Send + 'static,
    {
        self.releaser = Arc::new(move |context| releaser(context).boxed());
        self
    }

    /// Keep the outdated output visible while a changed input is being
    /// recomputed, instead of clearing it upfront.
    pub fn keep_outdated(mut self, keep_outdated: bool) -> Self {
        self.keep_outdated = keep_outdated;
        self
    }

    /// Set how long a valid status is trusted before the scan re-processes
    /// the model even though its hash still matches.
    pub fn rehash_interval(mut self, rehash_interval: Duration) -> Self {
        self.rehash_interval = rehash_interval;
        self
    }

    /// Set the interval of the periodic scan.
    pub fn recompute_interval(mut self, recompute_interval: Duration) -> Self {
        self.recompute_interval = recompute_interval;
        self
    }
}

/// The context passed through computer and releaser steps.
pub struct ComputeContext<M: Computable> {
    /// The target model as loaded for this run.
    pub model: M,
    /// The store backing the queue.
    pub store: Store,
    job: JobContext,
    collection: Collection<M>,
    revision: Revision,
    progress: f64,
    changes: Vec<Box<dyn FnOnce(&mut M) + Send>>,
}

impl<M: Computable> ComputeContext<M> {
    fn new(model: M, job: JobContext, collection: Collection<M>, revision: Revision) -> Self {
        ComputeContext {
            store: job.store.clone(),
            progress: model.status().map_or(0.0, |status| status.progress),
            model,
            job,
            collection,
            revision,
            changes: Vec::new(),
        }
    }

    /// Stage a change to the model. Staged changes are committed atomically
    /// together with the final status.
    pub fn change(&mut self, change: impl FnOnce(&mut M) + Send + 'static) {
        self.changes.push(Box::new(change));
    }

    /// Persist intermediate progress on the model status and the job.
    ///
    /// Repeated values are not rewritten. Fails if the model was modified
    /// concurrently, in which case the process job should abort and be
    /// retried.
    pub async fn progress(&mut self, progress: f64) -> anyhow::Result<()> {
        let progress = progress.clamp(0.0, 1.0);
        if progress == self.progress {
            return Ok(());
        }

        let now = Utc::now();
        let applied = self
            .collection
            .update_guarded(self.model.id(), self.revision, move |model| {
                let mut next = model.clone();
                let mut status = next.status().cloned().unwrap_or(Status {
                    progress: 0.0,
                    updated: now,
                    hash: String::new(),
                    valid: false,
                });
                status.progress = progress;
                status.updated = now;
                next.set_status(status);
                Some(next)
            })
            .await?;

        let Some(revision) = applied else {
            anyhow::bail!("input changed during computation");
        };

        self.revision = revision;
        self.progress = progress;

        let mut status = self.model.status().cloned().unwrap_or(Status {
            progress: 0.0,
            updated: now,
            hash: String::new(),
            valid: false,
        });
        status.progress = progress;
        status.updated = now;
        self.model.set_status(status);

        self.job.progress(progress).await?;

        Ok(())
    }

    fn take_changes(&mut self) -> Vec<Box<dyn FnOnce(&mut M) + Send>> {
        std::mem::take(&mut self.changes)
    }
}

/// A mounted computation. Closing it stops the change-stream trigger; the
/// scan and process tasks live with the queue.
pub struct Operation {
    reconciler: Reconciler,
}

impl Operation {
    /// Stop the change-stream trigger.
    pub async fn close(self) {
        self.reconciler.close().await;
    }
}

/// Mount a computation on the queue.
///
/// Registers the scan task (run periodically and deduplicated through a
/// labelled blueprint) and the per-model process task, and spawns the
/// change-stream trigger on the target collection. Must be called before
/// the queue is started and from within a tokio runtime.
pub fn compute<M: Computable>(
    queue: &Queue,
    computation: Computation<M>,
) -> Result<Operation, CodingError> {
    let operation = Arc::new(computation);
    let store = queue.store();
    let collection = store.collection::<M>();

    // periodic scan task
    let scan_task = {
        let operation = operation.clone();
        let collection = collection.clone();
        let interval = operation.recompute_interval;
        let blueprint = scan_job(&operation.name)?
            .label("periodic")
            .period(interval);
        Task::named::<ScanJob, usize, _, _>(
            scan_name(&operation.name),
            Coding::Json,
            move |ctx, _payload: ScanJob| {
                let operation = operation.clone();
                let collection = collection.clone();
                async move { scan(ctx, operation, collection).await }
            },
        )
        .periodically(interval, blueprint)
    };
    queue.add(scan_task);

    // process task; a single worker serializes the process jobs of one
    // operation so duplicate triggers reduce to no-ops
    let process_task = {
        let operation = operation.clone();
        let collection = collection.clone();
        Task::named::<ProcessJob, (), _, _>(
            process_name(&operation.name),
            Coding::Json,
            move |ctx, payload: ProcessJob| {
                let operation = operation.clone();
                let collection = collection.clone();
                async move { process(ctx, operation, collection, payload.id).await }
            },
        )
        .workers(1)
    };
    queue.add(process_task);

    // change-stream trigger
    let handle = {
        let jobs = store.collection::<Job>();
        let name = operation.name.clone();
        let reporter = queue.reporter();
        move |model: M| {
            let jobs = jobs.clone();
            let name = name.clone();
            let reporter = reporter.clone();
            tokio::spawn(async move {
                match process_job(&name, model.id()) {
                    Ok(blueprint) => {
                        if let Err(error) = enqueue(&jobs, blueprint).await {
                            reporter(error.into());
                        }
                    }
                    Err(error) => reporter(error.into()),
                }
            });
        }
    };
    let handlers = Handlers::new()
        .on_created(handle.clone())
        .on_updated(handle);
    let reconciler = Reconciler::spawn(collection, handlers, Some(queue.reporter()));

    Ok(Operation { reconciler })
}

async fn scan<M: Computable>(
    ctx: JobContext,
    operation: Arc<Computation<M>>,
    collection: Collection<M>,
) -> anyhow::Result<usize> {
    let now = Utc::now();
    let rehash = util::delta(operation.rehash_interval);
    let models = collection.scan().await?;

    let mut examined = 0usize;
    let mut triggered = 0usize;

    for model in models {
        examined += 1;

        let hash = (operation.hasher)(&model);
        let status = model.status();

        let stale = if hash.is_empty() {
            // released models with an absent input stay untouched
            !status.is_some_and(|status| status.valid && status.hash.is_empty())
        } else {
            match status {
                Some(status) if status.valid && status.hash == hash => {
                    now.signed_duration_since(status.updated) >= rehash
                }
                _ => true,
            }
        };

        if stale {
            triggered += 1;
            let blueprint = process_job(&operation.name, model.id())?;
            ctx.queue.enqueue(blueprint).await?;
        }
    }

    debug!(examined, triggered, "scan finished");

    Ok(examined + triggered)
}

async fn process<M: Computable>(
    ctx: JobContext,
    operation: Arc<Computation<M>>,
    collection: Collection<M>,
    id: Id,
) -> anyhow::Result<()> {
    let Some((model, revision)) = collection.fetch(id).await? else {
        // the model disappeared, nothing to derive
        return Ok(());
    };

    let hash = (operation.hasher)(&model);

    // the derived state already matches the input; re-running is a no-op
    if model
        .status()
        .is_some_and(|status| status.valid && status.hash == hash)
    {
        return Ok(());
    }

    if hash.is_empty() {
        release(ctx, operation, collection, model, revision).await
    } else {
        derive(ctx, operation, collection, model, revision, hash).await
    }
}

async fn release<M: Computable>(
    ctx: JobContext,
    operation: Arc<Computation<M>>,
    collection: Collection<M>,
    model: M,
    revision: Revision,
) -> anyhow::Result<()> {
    let id = model.id();
    let context = ComputeContext::new(model, ctx, collection.clone(), revision);

    let mut context = (operation.releaser)(context).await?;

    let now = Utc::now();
    let changes = context.take_changes();
    let applied = collection
        .update_guarded(id, context.revision, move |model| {
            let mut next = model.clone();
            for change in changes {
                change(&mut next);
            }
            next.set_status(Status {
                progress: 1.0,
                updated: now,
                hash: String::new(),
                valid: true,
            });
            Some(next)
        })
        .await?;

    anyhow::ensure!(applied.is_some(), "input changed during release");

    Ok(())
}

async fn derive<M: Computable>(
    ctx: JobContext,
    operation: Arc<Computation<M>>,
    collection: Collection<M>,
    model: M,
    revision: Revision,
    hash: String,
) -> anyhow::Result<()> {
    let id = model.id();
    let mut context = ComputeContext::new(model, ctx, collection.clone(), revision);

    // invalidate; unless outdated output is kept, clear it upfront
    if !operation.keep_outdated {
        context = (operation.releaser)(context).await?;
    }

    let now = Utc::now();
    let changes = context.take_changes();
    let applied = collection
        .update_guarded(id, context.revision, move |model| {
            let mut next = model.clone();
            for change in changes {
                change(&mut next);
            }
            next.set_status(Status {
                progress: 0.0,
                updated: now,
                hash: String::new(),
                valid: false,
            });
            Some(next)
        })
        .await?;

    let Some(revision) = applied else {
        anyhow::bail!("input changed before computation");
    };
    context.revision = revision;

    // reload the invalidated model
    let Some((model, current)) = collection.fetch(id).await? else {
        return Ok(());
    };
    anyhow::ensure!(
        current == context.revision,
        "input changed during computation"
    );
    context.model = model;
    context.progress = 0.0;

    let mut context = (operation.computer)(context).await?;

    // commit the staged changes together with the validated status
    let now = Utc::now();
    let changes = context.take_changes();
    let applied = collection
        .update_guarded(id, context.revision, move |model| {
            let mut next = model.clone();
            for change in changes {
                change(&mut next);
            }
            next.set_status(Status {
                progress: 1.0,
                updated: now,
                hash,
                valid: true,
            });
            Some(next)
        })
        .await?;

    anyhow::ensure!(applied.is_some(), "input changed during computation");

    Ok(())
}

/// The payload of scan jobs.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct ScanJob {}

/// The payload of per-model process jobs.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ProcessJob {
    /// The id of the target model.
    pub id: Id,
}

fn scan_name(operation: &str) -> String {
    format!("torch/Scan/{operation}")
}

fn process_name(operation: &str) -> String {
    format!("torch/Compute/{operation}")
}

/// A blueprint running the scan job of the named operation once.
pub fn scan_job(operation: &str) -> Result<Blueprint, CodingError> {
    Blueprint::named(scan_name(operation), Coding::Json, &ScanJob {})
}

/// A blueprint running the process job of the named operation for one model.
pub fn process_job(operation: &str, id: Id) -> Result<Blueprint, CodingError> {
    Blueprint::named(process_name(operation), Coding::Json, &ProcessJob { id })
}

/// The hex encoded SHA-256 fingerprint of the input.
pub fn hash(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// A hasher reading a single string field; empty values map to the empty
/// fingerprint and select the release path.
pub fn string_hasher<M, G>(get: G) -> impl Fn(&M) -> String + Send + Sync + 'static
where
    M: Computable,
    G: Fn(&M) -> String + Send + Sync + 'static,
{
    move |model| {
        let input = get(model);
        if input.is_empty() {
            String::new()
        } else {
            hash(&input)
        }
    }
}

/// A computer deriving a single string output field from a single string
/// input field.
pub fn string_computer<M, G, S, F>(
    get: G,
    set: S,
    compute: F,
) -> impl Fn(ComputeContext<M>) -> future::Ready<anyhow::Result<ComputeContext<M>>>
+ Send
+ Sync
+ 'static
where
    M: Computable,
    G: Fn(&M) -> String + Send + Sync + 'static,
    S: Fn(&mut M, String) + Clone + Send + Sync + 'static,
    F: Fn(String) -> anyhow::Result<String> + Send + Sync + 'static,
{
    move |mut context| {
        let result = match compute(get(&context.model)) {
            Ok(output) => {
                let set = set.clone();
                context.change(move |model| set(model, output));
                Ok(context)
            }
            Err(error) => Err(error),
        };

        future::ready(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable() {
        assert_eq!(hash("Hello world!"), hash("Hello world!"));
        assert_ne!(hash("Hello world!"), hash("What's up?"));
        assert_eq!(hash("").len(), 64);
    }

    #[test]
    fn job_names() {
        assert_eq!(scan_name("Status"), "torch/Scan/Status");
        assert_eq!(process_name("Status"), "torch/Compute/Status");
    }
}
