use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::errors::StreamError;
use crate::store::{Collection, Id, Model};
use crate::stream::ChangeOp;

/// A callback invoked with asynchronous infrastructure errors.
pub type Reporter = Arc<dyn Fn(anyhow::Error) + Send + Sync>;

/// The default reporter logs errors via `tracing`.
pub(crate) fn default_reporter() -> Reporter {
    Arc::new(|error| error!("background error: {error:#}"))
}

/// The callbacks driven by a [`Reconciler`].
///
/// All callbacks are optional and are invoked serially from a single task.
pub struct Handlers<M: Model> {
    synced: Option<Box<dyn FnOnce() + Send>>,
    created: Option<Box<dyn FnMut(M) + Send>>,
    updated: Option<Box<dyn FnMut(M) + Send>>,
    deleted: Option<Box<dyn FnMut(Id) + Send>>,
}

impl<M: Model> Default for Handlers<M> {
    fn default() -> Self {
        Handlers {
            synced: None,
            created: None,
            updated: None,
            deleted: None,
        }
    }
}

impl<M: Model> Handlers<M> {
    /// Create an empty set of callbacks.
    pub fn new() -> Self {
        Handlers::default()
    }

    /// Invoked exactly once, after the initial scan has been delivered.
    pub fn on_synced(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.synced = Some(Box::new(f));
        self
    }

    /// Invoked for every document found by the initial scan and for every
    /// subsequent insertion.
    pub fn on_created(mut self, f: impl FnMut(M) + Send + 'static) -> Self {
        self.created = Some(Box::new(f));
        self
    }

    /// Invoked for every subsequent document update.
    pub fn on_updated(mut self, f: impl FnMut(M) + Send + 'static) -> Self {
        self.updated = Some(Box::new(f));
        self
    }

    /// Invoked for every subsequent document deletion.
    pub fn on_deleted(mut self, f: impl FnMut(Id) + Send + 'static) -> Self {
        self.deleted = Some(Box::new(f));
        self
    }
}

/// A reconciler maintains a best-effort, eventually-consistent view of a
/// collection.
///
/// On start it performs a full scan in ascending id order, invoking `created`
/// for each document, then signals `synced` once. Afterwards it delivers
/// change-stream events in order. When the stream falls behind the retained
/// window, a drift-correcting re-scan delivers the current documents as
/// `updated` before the live feed continues.
pub struct Reconciler {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Reconciler {
    /// Start a reconciler on the given collection.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<M: Model>(
        collection: Collection<M>,
        handlers: Handlers<M>,
        reporter: Option<Reporter>,
    ) -> Reconciler {
        let token = CancellationToken::new();
        let reporter = reporter.unwrap_or_else(default_reporter);

        let handle = tokio::spawn(drive(collection, handlers, reporter, token.clone()));

        Reconciler { token, handle }
    }

    /// Terminate the reconciler and wait for its task to finish.
    pub async fn close(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}

async fn drive<M: Model>(
    collection: Collection<M>,
    mut handlers: Handlers<M>,
    reporter: Reporter,
    token: CancellationToken,
) {
    // Subscribing before the scan ensures the stream covers every change at
    // or after the scan start. Changes that race the scan may be delivered
    // twice, once by the scan and once by the stream.
    let mut stream = match collection.watch(None) {
        Ok(stream) => stream,
        Err(error) => {
            reporter(error.into());
            return;
        }
    };

    match collection.scan().await {
        Ok(models) => {
            for model in models {
                if let Some(created) = handlers.created.as_mut() {
                    created(model);
                }
            }
        }
        Err(error) => {
            reporter(error.into());
            return;
        }
    }

    if let Some(synced) = handlers.synced.take() {
        synced();
    }

    loop {
        let event = tokio::select! {
            _ = token.cancelled() => {
                debug!("reconciler closed");
                return;
            }
            event = stream.next() => event,
        };

        match event {
            Ok(event) => match event.op {
                ChangeOp::Created => {
                    if let (Some(created), Some(model)) = (handlers.created.as_mut(), event.model) {
                        created(model);
                    }
                }
                ChangeOp::Updated => {
                    if let (Some(updated), Some(model)) = (handlers.updated.as_mut(), event.model) {
                        updated(model);
                    }
                }
                ChangeOp::Deleted => {
                    if let Some(deleted) = handlers.deleted.as_mut() {
                        deleted(event.id);
                    }
                }
            },
            Err(StreamError::Lagged) => {
                warn!("change stream lagged, re-scanning collection");

                // re-subscribe first so no change after the scan is lost
                stream = match collection.watch(None) {
                    Ok(stream) => stream,
                    Err(error) => {
                        reporter(error.into());
                        return;
                    }
                };

                match collection.scan().await {
                    Ok(models) => {
                        for model in models {
                            if let Some(updated) = handlers.updated.as_mut() {
                                updated(model);
                            } else if let Some(created) = handlers.created.as_mut() {
                                created(model);
                            }
                        }
                    }
                    Err(error) => {
                        reporter(error.into());
                        return;
                    }
                }
            }
            Err(StreamError::Closed) => {
                reporter(anyhow::Error::new(StreamError::Closed));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Item {
        #[serde(rename = "_id")]
        id: Id,
        value: i64,
    }

    impl Model for Item {
        const COLLECTION: &'static str = "items";

        fn id(&self) -> Id {
            self.id
        }
    }

    #[derive(Debug, PartialEq)]
    enum Observed {
        Synced,
        Created(i64),
        Updated(i64),
        Deleted,
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Observed>) -> Observed {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for callback")
            .expect("callback channel closed")
    }

    #[tokio::test]
    async fn scan_then_stream() {
        let store = Store::new();
        let items = store.collection::<Item>();

        let first = Item {
            id: Id::new(),
            value: 1,
        };
        items.insert(&first).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handlers = {
            let synced = tx.clone();
            let created = tx.clone();
            let updated = tx.clone();
            let deleted = tx.clone();
            Handlers::new()
                .on_synced(move || {
                    let _ = synced.send(Observed::Synced);
                })
                .on_created(move |item: Item| {
                    let _ = created.send(Observed::Created(item.value));
                })
                .on_updated(move |item: Item| {
                    let _ = updated.send(Observed::Updated(item.value));
                })
                .on_deleted(move |_| {
                    let _ = deleted.send(Observed::Deleted);
                })
        };

        let reconciler = Reconciler::spawn(items.clone(), handlers, None);

        // the initial scan delivers the existing document, then syncs
        assert_eq!(recv(&mut rx).await, Observed::Created(1));
        assert_eq!(recv(&mut rx).await, Observed::Synced);

        // subsequent changes arrive in order
        let second = Item {
            id: Id::new(),
            value: 2,
        };
        items.insert(&second).await.unwrap();
        assert_eq!(recv(&mut rx).await, Observed::Created(2));

        items
            .update_one(second.id, |item| Some(Item { value: 3, ..*item }))
            .await
            .unwrap();
        assert_eq!(recv(&mut rx).await, Observed::Updated(3));

        items.delete(first.id).await.unwrap();
        assert_eq!(recv(&mut rx).await, Observed::Deleted);

        reconciler.close().await;
    }

    #[tokio::test]
    async fn synced_without_documents() {
        let store = Store::new();
        let items = store.collection::<Item>();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handlers = Handlers::new().on_synced(move || {
            let _ = tx.send(Observed::Synced);
        });

        let reconciler = Reconciler::spawn(items, handlers, None);
        assert_eq!(recv(&mut rx).await, Observed::Synced);
        reconciler.close().await;
    }
}
