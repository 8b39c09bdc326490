use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;

use crate::errors::StoreError;
use crate::stream::{ChangeEvent, ChangeOp, ChangeStream, ResumeToken};

/// The unique identifier of a document.
pub type Id = bson::oid::ObjectId;

/// The revision of a document, used for optimistic concurrency control.
///
/// Revisions start at one and increase with every accepted update.
pub type Revision = u64;

/// The number of change events retained per collection for stream resumption.
const REPLAY_WINDOW: usize = 256;

/// The main trait implemented by every persisted document type.
pub trait Model: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The name of the collection holding documents of this type.
    const COLLECTION: &'static str;

    /// The id of this document.
    fn id(&self) -> Id;
}

/// A handle to an embedded document store.
///
/// The store hosts one typed collection per model type and guarantees atomic
/// single-document updates with monotonically increasing revisions. Handles
/// are cheap to clone and share the same underlying data.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    collections: Mutex<HashMap<&'static str, Box<dyn Any + Send + Sync>>>,
}

impl Store {
    /// Open a new, empty store.
    pub fn new() -> Store {
        Store::default()
    }

    /// Get the typed collection for the specified model.
    ///
    /// The collection is created on first access. Opening the same collection
    /// name with two different model types panics.
    pub fn collection<M: Model>(&self) -> Collection<M> {
        let mut collections = self.inner.collections.lock().unwrap();
        let entry = collections
            .entry(M::COLLECTION)
            .or_insert_with(|| Box::new(Collection::<M>::new()));

        match entry.downcast_ref::<Collection<M>>() {
            Some(collection) => collection.clone(),
            None => panic!(
                "store: collection {:?} is already opened with a different model type",
                M::COLLECTION
            ),
        }
    }

    /// Whether two handles refer to the same underlying store.
    pub fn is(&self, other: &Store) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// A typed collection of documents.
pub struct Collection<M: Model> {
    engine: Arc<Engine<M>>,
}

impl<M: Model> Clone for Collection<M> {
    fn clone(&self) -> Self {
        Collection {
            engine: self.engine.clone(),
        }
    }
}

struct Engine<M: Model> {
    state: Mutex<EngineState<M>>,
    events: broadcast::Sender<ChangeEvent<M>>,
}

struct EngineState<M: Model> {
    docs: HashMap<Id, Versioned<M>>,
    sequence: u64,
    replay: VecDeque<ChangeEvent<M>>,
}

struct Versioned<M> {
    model: M,
    revision: Revision,
}

impl<M: Model> Collection<M> {
    fn new() -> Collection<M> {
        let (events, _) = broadcast::channel(REPLAY_WINDOW);

        Collection {
            engine: Arc::new(Engine {
                state: Mutex::new(EngineState {
                    docs: HashMap::new(),
                    sequence: 0,
                    replay: VecDeque::new(),
                }),
                events,
            }),
        }
    }

    /// Insert a new document. Inserting an existing id is an error.
    pub async fn insert(&self, model: &M) -> Result<(), StoreError> {
        let mut state = self.engine.state.lock().unwrap();

        let id = model.id();
        if state.docs.contains_key(&id) {
            return Err(StoreError::DuplicateId(id));
        }

        state.docs.insert(
            id,
            Versioned {
                model: model.clone(),
                revision: 1,
            },
        );
        self.emit(&mut state, ChangeOp::Created, id, Some(model.clone()));

        Ok(())
    }

    /// Atomically insert a document unless another document matching the
    /// predicate already exists. Returns whether the document was inserted.
    pub async fn insert_unless<F>(&self, model: &M, conflict: F) -> Result<bool, StoreError>
    where
        F: Fn(&M) -> bool + Send,
    {
        let mut state = self.engine.state.lock().unwrap();

        if state.docs.values().any(|doc| conflict(&doc.model)) {
            return Ok(false);
        }

        let id = model.id();
        if state.docs.contains_key(&id) {
            return Err(StoreError::DuplicateId(id));
        }

        state.docs.insert(
            id,
            Versioned {
                model: model.clone(),
                revision: 1,
            },
        );
        self.emit(&mut state, ChangeOp::Created, id, Some(model.clone()));

        Ok(true)
    }

    /// Find a document by id.
    pub async fn find(&self, id: Id) -> Result<Option<M>, StoreError> {
        let state = self.engine.state.lock().unwrap();
        Ok(state.docs.get(&id).map(|doc| doc.model.clone()))
    }

    /// Find a document by id together with its current revision.
    pub async fn fetch(&self, id: Id) -> Result<Option<(M, Revision)>, StoreError> {
        let state = self.engine.state.lock().unwrap();
        Ok(state
            .docs
            .get(&id)
            .map(|doc| (doc.model.clone(), doc.revision)))
    }

    /// Scan all documents in ascending id order.
    pub async fn scan(&self) -> Result<Vec<M>, StoreError> {
        let state = self.engine.state.lock().unwrap();

        let mut models: Vec<M> = state.docs.values().map(|doc| doc.model.clone()).collect();
        models.sort_by_key(|model| model.id().bytes());

        Ok(models)
    }

    /// Atomically apply a conditional update to a single document.
    ///
    /// The closure observes the current document and returns the replacement,
    /// or `None` to leave the document untouched because its condition does
    /// not hold. Returns whether the update was applied.
    pub async fn update_one<F>(&self, id: Id, apply: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&M) -> Option<M> + Send,
    {
        let mut state = self.engine.state.lock().unwrap();

        let Some(doc) = state.docs.get_mut(&id) else {
            return Ok(false);
        };
        let Some(next) = apply(&doc.model) else {
            return Ok(false);
        };

        doc.model = next.clone();
        doc.revision += 1;
        self.emit(&mut state, ChangeOp::Updated, id, Some(next));

        Ok(true)
    }

    /// Like [`update_one`](Collection::update_one), but additionally requires
    /// the document revision to match the one observed at load time. Returns
    /// the new revision if the update was applied.
    pub async fn update_guarded<F>(
        &self,
        id: Id,
        revision: Revision,
        apply: F,
    ) -> Result<Option<Revision>, StoreError>
    where
        F: FnOnce(&M) -> Option<M> + Send,
    {
        let mut state = self.engine.state.lock().unwrap();

        let Some(doc) = state.docs.get_mut(&id) else {
            return Ok(None);
        };
        if doc.revision != revision {
            return Ok(None);
        }
        let Some(next) = apply(&doc.model) else {
            return Ok(None);
        };

        doc.model = next.clone();
        doc.revision += 1;
        let new_revision = doc.revision;
        self.emit(&mut state, ChangeOp::Updated, id, Some(next));

        Ok(Some(new_revision))
    }

    /// Delete a document by id. Returns whether a document was removed.
    pub async fn delete(&self, id: Id) -> Result<bool, StoreError> {
        let mut state = self.engine.state.lock().unwrap();

        if state.docs.remove(&id).is_none() {
            return Ok(false);
        }
        self.emit(&mut state, ChangeOp::Deleted, id, None);

        Ok(true)
    }

    /// Subscribe to the collection change stream.
    ///
    /// Without a resume token the stream starts at the current head. With a
    /// token, all retained events after it are replayed first; if the token
    /// is older than the retained window the subscription fails with
    /// [`StoreError::ResumeExpired`] and the caller must re-scan.
    pub fn watch(&self, resume: Option<ResumeToken>) -> Result<ChangeStream<M>, StoreError> {
        let state = self.engine.state.lock().unwrap();

        let backlog = match resume {
            None => VecDeque::new(),
            Some(token) => {
                let oldest = state.sequence - state.replay.len() as u64;
                if token.0 < oldest {
                    return Err(StoreError::ResumeExpired);
                }
                state
                    .replay
                    .iter()
                    .filter(|event| event.token.0 > token.0)
                    .cloned()
                    .collect()
            }
        };

        // Subscribing while holding the state lock guarantees a gapless
        // hand-off between the replayed backlog and the live feed.
        let receiver = self.engine.events.subscribe();

        Ok(ChangeStream { backlog, receiver })
    }

    fn emit(&self, state: &mut EngineState<M>, op: ChangeOp, id: Id, model: Option<M>) {
        state.sequence += 1;
        let event = ChangeEvent {
            op,
            id,
            model,
            token: ResumeToken(state.sequence),
        };

        state.replay.push_back(event.clone());
        while state.replay.len() > REPLAY_WINDOW {
            state.replay.pop_front();
        }

        // There may be no subscribers yet.
        let _ = self.engine.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StreamError;
    use claims::{assert_matches, assert_none, assert_ok, assert_some};

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

    fn item(value: i64) -> Item {
        Item {
            id: Id::new(),
            value,
        }
    }

    #[tokio::test]
    async fn insert_and_find() {
        let store = Store::new();
        let items = store.collection::<Item>();

        let doc = item(1);
        assert_ok!(items.insert(&doc).await);
        assert_eq!(assert_some!(items.find(doc.id).await.unwrap()), doc);

        // duplicate ids are rejected
        assert_matches!(items.insert(&doc).await, Err(StoreError::DuplicateId(_)));
    }

    #[tokio::test]
    async fn conditional_updates() {
        let store = Store::new();
        let items = store.collection::<Item>();

        let doc = item(1);
        items.insert(&doc).await.unwrap();

        // condition holds
        let matched = items
            .update_one(doc.id, |item| {
                (item.value == 1).then(|| Item { value: 2, ..*item })
            })
            .await
            .unwrap();
        assert!(matched);

        // condition no longer holds
        let matched = items
            .update_one(doc.id, |item| {
                (item.value == 1).then(|| Item { value: 3, ..*item })
            })
            .await
            .unwrap();
        assert!(!matched);

        assert_eq!(items.find(doc.id).await.unwrap().unwrap().value, 2);
    }

    #[tokio::test]
    async fn guarded_updates_detect_concurrent_writes() {
        let store = Store::new();
        let items = store.collection::<Item>();

        let doc = item(1);
        items.insert(&doc).await.unwrap();

        let (_, revision) = items.fetch(doc.id).await.unwrap().unwrap();

        // a concurrent write bumps the revision
        items
            .update_one(doc.id, |item| Some(Item { value: 7, ..*item }))
            .await
            .unwrap();

        // the guarded update misses
        let applied = items
            .update_guarded(doc.id, revision, |item| Some(Item { value: 8, ..*item }))
            .await
            .unwrap();
        assert_none!(applied);
        assert_eq!(items.find(doc.id).await.unwrap().unwrap().value, 7);

        // retried with the fresh revision it applies
        let (_, revision) = items.fetch(doc.id).await.unwrap().unwrap();
        let applied = items
            .update_guarded(doc.id, revision, |item| Some(Item { value: 8, ..*item }))
            .await
            .unwrap();
        assert_some!(applied);
    }

    #[tokio::test]
    async fn insert_unless_is_atomic() {
        let store = Store::new();
        let items = store.collection::<Item>();

        let inserted = items
            .insert_unless(&item(1), |other| other.value == 1)
            .await
            .unwrap();
        assert!(inserted);

        let inserted = items
            .insert_unless(&item(1), |other| other.value == 1)
            .await
            .unwrap();
        assert!(!inserted);

        assert_eq!(items.scan().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn scan_orders_by_id() {
        let store = Store::new();
        let items = store.collection::<Item>();

        for value in 0..10 {
            items.insert(&item(value)).await.unwrap();
        }

        let models = items.scan().await.unwrap();
        assert_eq!(models.len(), 10);
        for pair in models.windows(2) {
            assert!(pair[0].id.bytes() < pair[1].id.bytes());
        }
    }

    #[tokio::test]
    async fn watch_replays_from_resume_token() {
        let store = Store::new();
        let items = store.collection::<Item>();

        let mut stream = items.watch(None).unwrap();

        let doc = item(1);
        items.insert(&doc).await.unwrap();
        let first = stream.next().await.unwrap();
        assert_eq!(first.op, ChangeOp::Created);

        items
            .update_one(doc.id, |item| Some(Item { value: 2, ..*item }))
            .await
            .unwrap();
        items.delete(doc.id).await.unwrap();

        // resume after the insert and observe the rest
        let mut resumed = items.watch(Some(first.token)).unwrap();
        assert_eq!(resumed.next().await.unwrap().op, ChangeOp::Updated);
        let deleted = resumed.next().await.unwrap();
        assert_eq!(deleted.op, ChangeOp::Deleted);
        assert_none!(deleted.model);
    }

    #[tokio::test]
    async fn watch_rejects_expired_resume_tokens() {
        let store = Store::new();
        let items = store.collection::<Item>();

        let doc = item(0);
        items.insert(&doc).await.unwrap();
        let mut stream = items.watch(None).unwrap();

        for value in 0..(REPLAY_WINDOW as i64 + 16) {
            items
                .update_one(doc.id, move |item| Some(Item { value, ..*item }))
                .await
                .unwrap();
        }

        // the token of the initial insert has been evicted
        assert_matches!(
            items.watch(Some(ResumeToken(1))),
            Err(StoreError::ResumeExpired)
        );

        // the live subscriber overflowed as well
        let mut lagged = false;
        loop {
            match stream.next().await {
                Ok(_) => {}
                Err(StreamError::Lagged) => {
                    lagged = true;
                    break;
                }
                Err(StreamError::Closed) => panic!("stream closed"),
            }
        }
        assert!(lagged);
    }

    #[test]
    fn store_identity() {
        let store = Store::new();
        let clone = store.clone();
        let other = Store::new();

        assert!(store.is(&clone));
        assert!(!store.is(&other));
    }
}
