pub mod models;
pub mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Most writes a single [`WriteBatch`] may carry.
pub const MAX_BATCH_WRITES: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid document data: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Document not found: {path}/{id}")]
    NotFound { path: String, id: String },
    #[error("Field '{field}' of {id} is not an integer")]
    NotNumeric { id: String, field: String },
    #[error("Batch of {0} writes exceeds the limit of {max}", max = MAX_BATCH_WRITES)]
    BatchTooLarge(usize),
    #[error("Store connection lock poisoned")]
    Poisoned,
}

/// Slash-separated collection path, e.g. `users/u1/sessions`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionPath(String);

impl CollectionPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// Sub-collection `name` under document `doc_id` of this collection.
    pub fn child(&self, doc_id: &str, name: &str) -> Self {
        Self(format!("{}/{}/{}", self.0, doc_id, name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    /// The first N documents in query order.
    First(usize),
    /// The last N documents, still returned in query order.
    Last(usize),
}

/// Ordered query over one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: CollectionPath,
    pub order_by: String,
    pub direction: Direction,
    pub limit: Option<Limit>,
}

impl Query {
    pub fn new(collection: CollectionPath, order_by: &str) -> Self {
        Self {
            collection,
            order_by: order_by.to_string(),
            direction: Direction::Ascending,
            limit: None,
        }
    }

    pub fn descending(mut self) -> Self {
        self.direction = Direction::Descending;
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(Limit::First(n));
        self
    }

    pub fn limit_to_last(mut self, n: usize) -> Self {
        self.limit = Some(Limit::Last(n));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate {
    Set(Value),
    /// Adds to an integer field; a missing field counts as zero.
    Increment(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    Set {
        path: CollectionPath,
        id: String,
        data: Map<String, Value>,
    },
    Delete {
        path: CollectionPath,
        id: String,
    },
}

impl Write {
    pub fn path(&self) -> &CollectionPath {
        match self {
            Write::Set { path, .. } | Write::Delete { path, .. } => path,
        }
    }
}

/// Group of writes applied all-or-nothing.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    writes: Vec<Write>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, path: &CollectionPath, id: &str, data: Map<String, Value>) -> &mut Self {
        self.writes.push(Write::Set {
            path: path.clone(),
            id: id.to_string(),
            data,
        });
        self
    }

    pub fn delete(&mut self, path: &CollectionPath, id: &str) -> &mut Self {
        self.writes.push(Write::Delete {
            path: path.clone(),
            id: id.to_string(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn writes(&self) -> &[Write] {
        &self.writes
    }
}

/// Receives the full result set of a query each time it may have changed.
pub type SnapshotCallback = Arc<dyn Fn(Result<Vec<Document>, StoreError>) + Send + Sync>;

/// Document database with ordered queries and push subscriptions.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, path: &CollectionPath, id: &str) -> Result<Option<Document>, StoreError>;

    /// Creates or replaces a document.
    async fn set(
        &self,
        path: &CollectionPath,
        id: &str,
        data: Map<String, Value>,
    ) -> Result<(), StoreError>;

    /// Applies field updates to an existing document.
    async fn update(
        &self,
        path: &CollectionPath,
        id: &str,
        updates: Vec<(String, FieldUpdate)>,
    ) -> Result<(), StoreError>;

    async fn delete(&self, path: &CollectionPath, id: &str) -> Result<(), StoreError>;

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError>;

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;

    /// Registers `callback` for `query`. The current result set is delivered
    /// right away, then again after every write to the query's collection.
    fn listen(&self, query: Query, callback: SnapshotCallback) -> ListenerRegistration;
}

/// Live listener handle. The listener keeps firing until [`remove`] is called.
///
/// [`remove`]: ListenerRegistration::remove
#[must_use = "the listener stays registered until `remove` is called"]
#[derive(Debug)]
pub struct ListenerRegistration {
    id: u64,
    registry: Weak<ListenerRegistry>,
}

impl ListenerRegistration {
    pub fn remove(self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

struct Listener {
    query: Query,
    callback: SnapshotCallback,
}

/// Bookkeeping for live listeners, shared by store implementations.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<u64, Listener>>,
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("active", &self.len())
            .finish()
    }
}

impl ListenerRegistry {
    pub fn register(self: &Arc<Self>, query: Query, callback: SnapshotCallback) -> ListenerRegistration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Listener { query, callback });
        ListenerRegistration {
            id,
            registry: Arc::downgrade(self),
        }
    }

    fn remove(&self, id: u64) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Listeners whose query reads one of `collections`.
    pub fn matching(&self, collections: &[&CollectionPath]) -> Vec<(Query, SnapshotCallback)> {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|l| collections.contains(&&l.query.collection))
            .map(|l| (l.query.clone(), Arc::clone(&l.callback)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
