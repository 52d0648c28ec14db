//! Maps chat sessions and messages onto document-store collections.
//!
//! Sessions live in `users/{uid}/sessions`; each session's messages live in
//! the `messages` sub-collection under the session document.

use crate::db::models::{ChatMessage, ChatSession};
use crate::db::{
    CollectionPath, Document, DocumentStore, FieldUpdate, ListenerRegistration, Query, StoreError,
    WriteBatch, MAX_BATCH_WRITES,
};
use chrono::Utc;
use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;

const PREVIEW_MAX_CHARS: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Malformed {kind} document {id}: {source}")]
    Decode {
        kind: &'static str,
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Could not encode {kind}: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

pub struct ChatRepository {
    store: Arc<dyn DocumentStore>,
    user_id: String,
}

impl ChatRepository {
    pub fn new(store: Arc<dyn DocumentStore>, user_id: &str) -> Self {
        Self {
            store,
            user_id: user_id.to_string(),
        }
    }

    fn sessions_path(&self) -> CollectionPath {
        CollectionPath::new(format!("users/{}/sessions", self.user_id))
    }

    fn messages_path(&self, session_id: &str) -> CollectionPath {
        self.sessions_path().child(session_id, "messages")
    }

    fn sessions_query(&self) -> Query {
        Query::new(self.sessions_path(), "lastUpdated").descending()
    }

    fn messages_query(&self, session_id: &str) -> Query {
        Query::new(self.messages_path(session_id), "timestamp")
    }

    // ── Sessions ──

    pub async fn create_session(&self, title: &str) -> RepositoryResult<ChatSession> {
        let session = ChatSession::new(&self.user_id, title);
        self.store
            .set(&self.sessions_path(), &session.id, encode(&session, "session")?)
            .await?;
        info!("[repo] created session {}", session.id);
        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> RepositoryResult<Option<ChatSession>> {
        self.store
            .get(&self.sessions_path(), session_id)
            .await?
            .map(decode_session)
            .transpose()
    }

    pub async fn get_sessions(&self) -> RepositoryResult<Vec<ChatSession>> {
        let docs = self.store.query(&self.sessions_query()).await?;
        docs.into_iter().map(decode_session).collect()
    }

    /// Pushes the ordered session list on every change until the
    /// registration is removed.
    pub fn listen_sessions(
        &self,
        on_change: impl Fn(RepositoryResult<Vec<ChatSession>>) + Send + Sync + 'static,
    ) -> ListenerRegistration {
        self.store.listen(
            self.sessions_query(),
            Arc::new(move |snapshot| on_change(decode_snapshot(snapshot, decode_session))),
        )
    }

    pub async fn rename_session(&self, session_id: &str, title: &str) -> RepositoryResult<()> {
        self.store
            .update(
                &self.sessions_path(),
                session_id,
                vec![("title".into(), FieldUpdate::Set(Value::from(title)))],
            )
            .await?;
        Ok(())
    }

    /// Stores the preview and timestamp of the latest exchange and grows the
    /// message count by `added`.
    pub async fn record_exchange(
        &self,
        session_id: &str,
        preview: &str,
        added: u32,
    ) -> RepositoryResult<()> {
        let preview = truncate_preview(preview);
        self.store
            .update(
                &self.sessions_path(),
                session_id,
                vec![
                    ("lastMessage".into(), FieldUpdate::Set(Value::from(preview))),
                    (
                        "lastUpdated".into(),
                        FieldUpdate::Set(Value::from(Utc::now().timestamp_millis())),
                    ),
                    ("messageCount".into(), FieldUpdate::Increment(i64::from(added))),
                ],
            )
            .await?;
        Ok(())
    }

    /// Deletes every message of the session, then the session itself. Each
    /// batch is atomic; a session with many messages takes several batches,
    /// the session record always goes in the last one.
    pub async fn delete_session(&self, session_id: &str) -> RepositoryResult<()> {
        let messages_path = self.messages_path(session_id);
        let messages = self
            .store
            .query(&Query::new(messages_path.clone(), "timestamp"))
            .await?;

        let mut batches = Vec::new();
        let mut batch = WriteBatch::new();
        for doc in messages {
            if batch.len() == MAX_BATCH_WRITES {
                batches.push(std::mem::take(&mut batch));
            }
            batch.delete(&messages_path, &doc.id);
        }
        if batch.len() == MAX_BATCH_WRITES {
            batches.push(std::mem::take(&mut batch));
        }
        batch.delete(&self.sessions_path(), session_id);
        batches.push(batch);

        let rounds = batches.len();
        for batch in batches {
            self.store.commit(batch).await?;
        }
        info!("[repo] deleted session {} in {} batch(es)", session_id, rounds);
        Ok(())
    }

    // ── Messages ──

    pub async fn get_messages(&self, session_id: &str) -> RepositoryResult<Vec<ChatMessage>> {
        let docs = self.store.query(&self.messages_query(session_id)).await?;
        docs.into_iter().map(decode_message).collect()
    }

    /// Pushes the latest `window` messages of the session, oldest first.
    pub fn listen_messages(
        &self,
        session_id: &str,
        window: usize,
        on_change: impl Fn(RepositoryResult<Vec<ChatMessage>>) + Send + Sync + 'static,
    ) -> ListenerRegistration {
        self.store.listen(
            self.messages_query(session_id).limit_to_last(window),
            Arc::new(move |snapshot| on_change(decode_snapshot(snapshot, decode_message))),
        )
    }

    pub async fn add_message(&self, session_id: &str, message: &ChatMessage) -> RepositoryResult<()> {
        let mut data = encode(message, "message")?;
        data.remove("isTyping");
        self.store
            .set(&self.messages_path(session_id), &message.id, data)
            .await?;
        Ok(())
    }
}

fn encode<T: Serialize>(record: &T, kind: &'static str) -> RepositoryResult<Map<String, Value>> {
    match serde_json::to_value(record) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(RepositoryError::Encode {
            kind,
            source: <serde_json::Error as serde::ser::Error>::custom("not a JSON object"),
        }),
        Err(source) => Err(RepositoryError::Encode { kind, source }),
    }
}

/// The document id wins over any `id` field stored in the data.
fn decode<T: DeserializeOwned>(doc: Document, kind: &'static str) -> RepositoryResult<T> {
    let Document { id, mut data } = doc;
    data.insert("id".into(), Value::from(id.clone()));
    serde_json::from_value(Value::Object(data)).map_err(|source| RepositoryError::Decode {
        kind,
        id,
        source,
    })
}

fn decode_session(doc: Document) -> RepositoryResult<ChatSession> {
    decode(doc, "session")
}

fn decode_message(doc: Document) -> RepositoryResult<ChatMessage> {
    decode(doc, "message")
}

/// Listener snapshots skip undecodable documents instead of failing whole.
fn decode_snapshot<T>(
    snapshot: Result<Vec<Document>, StoreError>,
    decode_one: fn(Document) -> RepositoryResult<T>,
) -> RepositoryResult<Vec<T>> {
    let docs = snapshot?;
    Ok(docs
        .into_iter()
        .filter_map(|doc| match decode_one(doc) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("[repo] {}", e);
                None
            }
        })
        .collect())
}

fn truncate_preview(text: &str) -> String {
    if text.chars().count() <= PREVIEW_MAX_CHARS {
        text.to_string()
    } else {
        let head: String = text.chars().take(PREVIEW_MAX_CHARS).collect();
        format!("{}...", head)
    }
}
