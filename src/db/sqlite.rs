use super::{
    CollectionPath, Direction, Document, DocumentStore, FieldUpdate, Limit, ListenerRegistration,
    ListenerRegistry, Query, SnapshotCallback, StoreError, Write, WriteBatch, MAX_BATCH_WRITES,
};
use async_trait::async_trait;
use log::{debug, warn};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard};

/// Document store kept in a local SQLite file. Documents are JSON objects
/// keyed by (collection path, id); settings share the same file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    listeners: Arc<ListenerRegistry>,
}

impl SqliteStore {
    pub fn new(app_dir: &std::path::Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(app_dir).ok();
        let db_path = app_dir.join("pocket-chat.db");
        Self::from_connection(Connection::open(db_path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(conn),
            listeners: Arc::new(ListenerRegistry::default()),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS documents (
                path TEXT NOT NULL,
                id TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (path, id)
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Number of listeners not yet removed.
    pub fn active_listeners(&self) -> usize {
        self.listeners.len()
    }

    // ── Settings ──

    pub fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }

    // ── Documents ──

    fn snapshot(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        let conn = self.lock()?;
        run_query(&conn, query)
    }

    /// Re-delivers snapshots to every listener reading one of `touched`.
    /// Runs with the connection unlocked so callbacks may call back into the store.
    fn notify(&self, touched: &[&CollectionPath]) {
        for (query, callback) in self.listeners.matching(touched) {
            debug!("[store] notifying listener on {}", query.collection);
            callback(self.snapshot(&query));
        }
    }
}

fn read_document(conn: &Connection, path: &str, id: &str) -> Result<Option<Document>, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT data FROM documents WHERE path = ?1 AND id = ?2",
            params![path, id],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(raw) => Ok(Some(Document {
            id: id.to_string(),
            data: serde_json::from_str(&raw)?,
        })),
        None => Ok(None),
    }
}

fn write_document(
    conn: &Connection,
    path: &str,
    id: &str,
    data: &Map<String, Value>,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO documents (path, id, data) VALUES (?1, ?2, ?3)
         ON CONFLICT(path, id) DO UPDATE SET data = excluded.data",
        params![path, id, serde_json::to_string(data)?],
    )?;
    Ok(())
}

fn apply_write(conn: &Connection, write: &Write) -> Result<(), StoreError> {
    match write {
        Write::Set { path, id, data } => write_document(conn, path.as_str(), id, data),
        Write::Delete { path, id } => {
            conn.execute(
                "DELETE FROM documents WHERE path = ?1 AND id = ?2",
                params![path.as_str(), id],
            )?;
            Ok(())
        }
    }
}

fn run_query(conn: &Connection, query: &Query) -> Result<Vec<Document>, StoreError> {
    // A last-N query runs in reverse order and is flipped back afterwards.
    let (direction, limit, reverse) = match query.limit {
        None => (query.direction, -1i64, false),
        Some(Limit::First(n)) => (query.direction, n as i64, false),
        Some(Limit::Last(n)) => {
            let flipped = match query.direction {
                Direction::Ascending => Direction::Descending,
                Direction::Descending => Direction::Ascending,
            };
            (flipped, n as i64, true)
        }
    };
    let order = match direction {
        Direction::Ascending => "ASC",
        Direction::Descending => "DESC",
    };
    let sql = format!(
        "SELECT id, data FROM documents WHERE path = ?1
         ORDER BY json_extract(data, ?2) {order}, rowid {order} LIMIT ?3"
    );
    let field = format!("$.{}", query.order_by);

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![query.collection.as_str(), field, limit], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut docs = Vec::new();
    for row in rows {
        let (id, raw) = row?;
        match serde_json::from_str(&raw) {
            Ok(data) => docs.push(Document { id, data }),
            Err(e) => warn!("[store] skipping unreadable document {}/{}: {}", query.collection, id, e),
        }
    }
    if reverse {
        docs.reverse();
    }
    Ok(docs)
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn get(&self, path: &CollectionPath, id: &str) -> Result<Option<Document>, StoreError> {
        let conn = self.lock()?;
        read_document(&conn, path.as_str(), id)
    }

    async fn set(
        &self,
        path: &CollectionPath,
        id: &str,
        data: Map<String, Value>,
    ) -> Result<(), StoreError> {
        {
            let conn = self.lock()?;
            write_document(&conn, path.as_str(), id, &data)?;
        }
        self.notify(&[path]);
        Ok(())
    }

    async fn update(
        &self,
        path: &CollectionPath,
        id: &str,
        updates: Vec<(String, FieldUpdate)>,
    ) -> Result<(), StoreError> {
        {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            let mut doc = read_document(&tx, path.as_str(), id)?.ok_or_else(|| {
                StoreError::NotFound {
                    path: path.to_string(),
                    id: id.to_string(),
                }
            })?;
            for (field, update) in updates {
                let value = match update {
                    FieldUpdate::Set(value) => value,
                    FieldUpdate::Increment(by) => {
                        let current = match doc.data.get(&field) {
                            None | Some(Value::Null) => 0,
                            Some(v) => v.as_i64().ok_or_else(|| StoreError::NotNumeric {
                                id: id.to_string(),
                                field: field.clone(),
                            })?,
                        };
                        Value::from(current + by)
                    }
                };
                doc.data.insert(field, value);
            }
            write_document(&tx, path.as_str(), id, &doc.data)?;
            tx.commit()?;
        }
        self.notify(&[path]);
        Ok(())
    }

    async fn delete(&self, path: &CollectionPath, id: &str) -> Result<(), StoreError> {
        {
            let conn = self.lock()?;
            apply_write(
                &conn,
                &Write::Delete {
                    path: path.clone(),
                    id: id.to_string(),
                },
            )?;
        }
        self.notify(&[path]);
        Ok(())
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        self.snapshot(query)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.len() > MAX_BATCH_WRITES {
            return Err(StoreError::BatchTooLarge(batch.len()));
        }
        if batch.is_empty() {
            return Ok(());
        }
        {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            for write in batch.writes() {
                apply_write(&tx, write)?;
            }
            tx.commit()?;
        }
        let mut touched: Vec<&CollectionPath> = Vec::new();
        for write in batch.writes() {
            if !touched.contains(&write.path()) {
                touched.push(write.path());
            }
        }
        self.notify(&touched);
        Ok(())
    }

    fn listen(&self, query: Query, callback: SnapshotCallback) -> ListenerRegistration {
        let registration = self.listeners.register(query.clone(), Arc::clone(&callback));
        callback(self.snapshot(&query));
        registration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("test documents must be objects"),
        }
    }

    fn collection() -> CollectionPath {
        CollectionPath::new("users/u1/sessions")
    }

    #[tokio::test]
    async fn set_then_get_returns_document() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .set(&collection(), "s1", doc(json!({"title": "Hello"})))
            .await
            .unwrap();

        let fetched = store.get(&collection(), "s1").await.unwrap().unwrap();
        assert_eq!(fetched.id, "s1");
        assert_eq!(fetched.data["title"], "Hello");
        assert!(store.get(&collection(), "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn query_orders_numerically_and_limits() {
        let store = SqliteStore::open_in_memory().unwrap();
        for (id, ts) in [("a", 30), ("b", 100), ("c", 5)] {
            store
                .set(&collection(), id, doc(json!({"ts": ts})))
                .await
                .unwrap();
        }

        let asc = store.query(&Query::new(collection(), "ts")).await.unwrap();
        let ids: Vec<_> = asc.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["c", "a", "b"]);

        let desc = store
            .query(&Query::new(collection(), "ts").descending().limit(2))
            .await
            .unwrap();
        let ids: Vec<_> = desc.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["b", "a"]);

        let last = store
            .query(&Query::new(collection(), "ts").limit_to_last(2))
            .await
            .unwrap();
        let ids: Vec<_> = last.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[tokio::test]
    async fn query_is_scoped_to_collection() {
        let store = SqliteStore::open_in_memory().unwrap();
        let other = collection().child("s1", "messages");
        store.set(&collection(), "s1", doc(json!({"ts": 1}))).await.unwrap();
        store.set(&other, "m1", doc(json!({"ts": 1}))).await.unwrap();

        let docs = store.query(&Query::new(other, "ts")).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "m1");
    }

    #[tokio::test]
    async fn update_sets_and_increments_fields() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .set(&collection(), "s1", doc(json!({"title": "t", "count": 2})))
            .await
            .unwrap();
        store
            .update(
                &collection(),
                "s1",
                vec![
                    ("count".into(), FieldUpdate::Increment(2)),
                    ("fresh".into(), FieldUpdate::Increment(1)),
                    ("title".into(), FieldUpdate::Set(json!("renamed"))),
                ],
            )
            .await
            .unwrap();

        let fetched = store.get(&collection(), "s1").await.unwrap().unwrap();
        assert_eq!(fetched.data["count"], 4);
        assert_eq!(fetched.data["fresh"], 1);
        assert_eq!(fetched.data["title"], "renamed");
    }

    #[tokio::test]
    async fn update_missing_document_fails() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store
            .update(&collection(), "nope", vec![("a".into(), FieldUpdate::Increment(1))])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn increment_of_text_field_fails() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.set(&collection(), "s1", doc(json!({"title": "t"}))).await.unwrap();
        let err = store
            .update(&collection(), "s1", vec![("title".into(), FieldUpdate::Increment(1))])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotNumeric { .. }));
    }

    #[tokio::test]
    async fn commit_rejects_oversized_batch() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut batch = WriteBatch::new();
        for i in 0..=MAX_BATCH_WRITES {
            batch.delete(&collection(), &i.to_string());
        }
        let err = store.commit(batch).await.unwrap_err();
        assert!(matches!(err, StoreError::BatchTooLarge(501)));
    }

    #[tokio::test]
    async fn commit_applies_sets_and_deletes() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.set(&collection(), "old", doc(json!({"ts": 1}))).await.unwrap();

        let mut batch = WriteBatch::new();
        batch
            .delete(&collection(), "old")
            .set(&collection(), "new", doc(json!({"ts": 2})));
        store.commit(batch).await.unwrap();

        let docs = store.query(&Query::new(collection(), "ts")).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "new");
    }

    #[tokio::test]
    async fn listener_receives_initial_and_changed_snapshots_until_removed() {
        let store = SqliteStore::open_in_memory().unwrap();
        let seen: Arc<Mutex<Vec<usize>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let registration = store.listen(
            Query::new(collection(), "ts"),
            Arc::new(move |snapshot| {
                sink.lock().unwrap().push(snapshot.unwrap().len());
            }),
        );

        store.set(&collection(), "a", doc(json!({"ts": 1}))).await.unwrap();
        store.set(&collection(), "b", doc(json!({"ts": 2}))).await.unwrap();
        store
            .set(&CollectionPath::new("elsewhere"), "x", doc(json!({})))
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(store.active_listeners(), 1);

        registration.remove();
        store.delete(&collection(), "a").await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(store.active_listeners(), 0);
    }

    #[test]
    fn settings_round_trip_and_delete() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.get_setting("default_model").unwrap(), None);
        store.set_setting("default_model", "openai/gpt-4o").unwrap();
        store.set_setting("default_model", "claude/x").unwrap();
        assert_eq!(
            store.get_setting("default_model").unwrap().as_deref(),
            Some("claude/x")
        );
        store.delete_setting("default_model").unwrap();
        assert_eq!(store.get_setting("default_model").unwrap(), None);
    }
}
