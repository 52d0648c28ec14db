use async_trait::async_trait;
use pocket_chat_lib::db::models::DEFAULT_SESSION_TITLE;
use pocket_chat_lib::db::{
    CollectionPath, Document, DocumentStore, FieldUpdate, ListenerRegistration, Query,
    SnapshotCallback, SqliteStore, StoreError, WriteBatch,
};
use pocket_chat_lib::llm::{LlmError, PromptMessage, Role, StreamChunk, TextGenerator};
use pocket_chat_lib::repository::ChatRepository;
use pocket_chat_lib::state::{ChatOptions, ChatViewModel};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

const USER: &str = "u1";

/// Replies with fixed fragments, or fails, and remembers every prompt.
struct ScriptedGenerator {
    fragments: Vec<&'static str>,
    fail: bool,
    gate: Option<Arc<Notify>>,
    prompts: Mutex<Vec<Vec<PromptMessage>>>,
}

impl ScriptedGenerator {
    fn replying(fragments: &[&'static str]) -> Self {
        Self {
            fragments: fragments.to_vec(),
            fail: false,
            gate: None,
            prompts: Mutex::default(),
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::replying(&[])
        }
    }

    /// Pauses after the first fragment until `gate` is notified.
    fn gated(fragments: &[&'static str], gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::replying(fragments)
        }
    }

    fn prompts(&self) -> Vec<Vec<PromptMessage>> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, messages: &[PromptMessage]) -> Result<String, LlmError> {
        self.prompts.lock().unwrap().push(messages.to_vec());
        if self.fail {
            return Err(LlmError::Api {
                status: 503,
                message: "overloaded".into(),
            });
        }
        Ok(self.fragments.concat())
    }

    async fn generate_stream(
        &self,
        messages: &[PromptMessage],
        on_chunk: &(dyn Fn(StreamChunk) + Send + Sync),
    ) -> Result<String, LlmError> {
        self.prompts.lock().unwrap().push(messages.to_vec());
        if self.fail {
            return Err(LlmError::Api {
                status: 503,
                message: "overloaded".into(),
            });
        }
        for (i, fragment) in self.fragments.iter().enumerate() {
            on_chunk(StreamChunk::delta(*fragment));
            if i == 0 {
                if let Some(gate) = &self.gate {
                    gate.notified().await;
                }
            }
        }
        on_chunk(StreamChunk::done());
        Ok(self.fragments.concat())
    }
}

/// Store wrapper that logs every write as "<op> <path>".
struct RecordingStore {
    inner: SqliteStore,
    log: Mutex<Vec<String>>,
}

impl RecordingStore {
    fn record(&self, op: &str, path: &CollectionPath) {
        self.log.lock().unwrap().push(format!("{} {}", op, path));
    }
}

#[async_trait]
impl DocumentStore for RecordingStore {
    async fn get(&self, path: &CollectionPath, id: &str) -> Result<Option<Document>, StoreError> {
        self.inner.get(path, id).await
    }

    async fn set(
        &self,
        path: &CollectionPath,
        id: &str,
        data: Map<String, Value>,
    ) -> Result<(), StoreError> {
        self.record("set", path);
        self.inner.set(path, id, data).await
    }

    async fn update(
        &self,
        path: &CollectionPath,
        id: &str,
        updates: Vec<(String, FieldUpdate)>,
    ) -> Result<(), StoreError> {
        self.record("update", path);
        self.inner.update(path, id, updates).await
    }

    async fn delete(&self, path: &CollectionPath, id: &str) -> Result<(), StoreError> {
        self.record("delete", path);
        self.inner.delete(path, id).await
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        self.inner.query(query).await
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        self.inner.commit(batch).await
    }

    fn listen(&self, query: Query, callback: SnapshotCallback) -> ListenerRegistration {
        self.inner.listen(query, callback)
    }
}

struct Harness {
    store: Arc<SqliteStore>,
    repo: Arc<ChatRepository>,
    generator: Arc<ScriptedGenerator>,
    chat: ChatViewModel,
}

fn harness_with(generator: ScriptedGenerator, options: ChatOptions) -> Harness {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let repo = Arc::new(ChatRepository::new(store.clone(), USER));
    let generator = Arc::new(generator);
    let chat = ChatViewModel::new(repo.clone(), generator.clone(), options);
    Harness {
        store,
        repo,
        generator,
        chat,
    }
}

fn harness(generator: ScriptedGenerator) -> Harness {
    harness_with(generator, ChatOptions::default())
}

#[tokio::test]
async fn created_session_is_unique_and_selected() {
    let h = harness(ScriptedGenerator::replying(&["hi"]));

    let first = h.chat.create_new_session().await.unwrap();
    let second = h.chat.create_new_session().await.unwrap();
    assert_ne!(first, second);

    let state = h.chat.state();
    assert_eq!(state.current_session_id.as_deref(), Some(second.as_str()));
    assert_eq!(state.sessions.len(), 2);
    assert_eq!(state.current_session().unwrap().title, DEFAULT_SESSION_TITLE);

    h.chat.select_session(&first);
    assert_eq!(h.chat.state().current_session_id.as_deref(), Some(first.as_str()));
}

#[tokio::test]
async fn send_without_session_creates_session_before_message() {
    let store = Arc::new(RecordingStore {
        inner: SqliteStore::open_in_memory().unwrap(),
        log: Mutex::default(),
    });
    let repo = Arc::new(ChatRepository::new(store.clone(), USER));
    let chat = ChatViewModel::new(
        repo,
        Arc::new(ScriptedGenerator::replying(&["Hello"])),
        ChatOptions::default(),
    );

    chat.send_message("What is ownership in Rust?").await.unwrap();

    let state = chat.state();
    let session = state.current_session().expect("a session was created");
    assert_eq!(session.title, "What is ownership in Rust?");

    let log = store.log.lock().unwrap().clone();
    let sessions_path = format!("users/{}/sessions", USER);
    let messages_path = format!("{}/{}/messages", sessions_path, session.id);
    assert_eq!(log[0], format!("set {}", sessions_path));
    assert_eq!(log[1], format!("set {}", messages_path));
}

#[tokio::test]
async fn completed_send_grows_count_by_two() {
    let h = harness(ScriptedGenerator::replying(&["Hel", "lo"]));
    let session_id = h.chat.create_new_session().await.unwrap();

    h.chat.send_message("hi").await.unwrap();
    let stored = h.repo.get_session(&session_id).await.unwrap().unwrap();
    assert_eq!(stored.message_count, 2);
    assert_eq!(stored.last_message, "Hello");
    assert_eq!(stored.title, "hi");

    h.chat.send_message("again").await.unwrap();
    let stored = h.repo.get_session(&session_id).await.unwrap().unwrap();
    assert_eq!(stored.message_count, 4);

    let state = h.chat.state();
    assert!(!state.is_loading);
    assert!(state.pending_reply.is_none());
    let texts: Vec<_> = state.messages.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, ["hi", "Hello", "again", "Hello"]);
    assert_eq!(state.sessions[0].message_count, 4);

    let prompts = h.generator.prompts();
    assert_eq!(prompts.len(), 2);
    let second: Vec<_> = prompts[1].iter().map(|p| (p.role, p.content.as_str())).collect();
    assert_eq!(
        second,
        [
            (Role::User, "hi"),
            (Role::Assistant, "Hello"),
            (Role::User, "again"),
        ]
    );
}

#[tokio::test]
async fn non_streaming_generation_is_used_when_disabled() {
    let options = ChatOptions {
        stream_replies: false,
        ..ChatOptions::default()
    };
    let h = harness_with(ScriptedGenerator::replying(&["whole ", "reply"]), options);

    h.chat.send_message("hi").await.unwrap();

    let state = h.chat.state();
    assert_eq!(state.messages.last().unwrap().text, "whole reply");
}

#[tokio::test]
async fn failed_generation_leaves_inline_error() {
    let h = harness(ScriptedGenerator::failing());
    let session_id = h.chat.create_new_session().await.unwrap();

    h.chat.send_message("hi").await.unwrap();

    let state = h.chat.state();
    let pending = state.pending_reply.as_ref().expect("error reply stays visible");
    assert!(pending.text.starts_with("Error:"));
    assert!(pending.text.contains("overloaded"));
    assert!(!pending.is_typing);
    assert!(!state.is_loading);
    assert!(state.error.is_none());

    let persisted = h.repo.get_messages(&session_id).await.unwrap();
    assert_eq!(persisted.len(), 1);
    assert!(persisted[0].is_from_user);
    let stored = h.repo.get_session(&session_id).await.unwrap().unwrap();
    assert_eq!(stored.message_count, 1);
}

#[tokio::test]
async fn streamed_fragments_fill_the_placeholder() {
    let gate = Arc::new(Notify::new());
    let h = harness(ScriptedGenerator::gated(&["Hel", "lo"], gate.clone()));
    let chat = Arc::new(h.chat);
    let mut updates = chat.subscribe();

    let sending = tokio::spawn({
        let chat = chat.clone();
        async move { chat.send_message("hi").await }
    });

    let mid_flight = updates
        .wait_for(|s| s.pending_reply.as_ref().is_some_and(|p| p.text == "Hel"))
        .await
        .unwrap()
        .clone();
    let pending = mid_flight.pending_reply.as_ref().unwrap();
    assert!(pending.is_typing);
    assert!(mid_flight.is_loading);
    assert_eq!(mid_flight.visible_messages().len(), 2);

    // A second send while the reply is in progress is ignored.
    chat.send_message("ignored").await.unwrap();

    gate.notify_one();
    sending.await.unwrap().unwrap();

    let state = chat.state();
    assert!(state.pending_reply.is_none());
    let texts: Vec<_> = state.messages.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, ["hi", "Hello"]);
    assert_eq!(state.messages[1].id, pending.id);
}

#[tokio::test]
async fn blank_input_is_ignored() {
    let h = harness(ScriptedGenerator::replying(&["x"]));
    h.chat.send_message("   \n").await.unwrap();

    let state = h.chat.state();
    assert!(state.sessions.is_empty());
    assert!(state.current_session_id.is_none());
    assert!(h.generator.prompts().is_empty());
}

#[tokio::test]
async fn deleting_active_session_removes_everything() {
    let h = harness(ScriptedGenerator::replying(&["ok"]));
    let keep = h.chat.create_new_session().await.unwrap();
    let doomed = h.chat.create_new_session().await.unwrap();
    h.chat.send_message("one").await.unwrap();
    h.chat.send_message("two").await.unwrap();
    assert_eq!(h.store.active_listeners(), 2);

    h.chat.delete_session(&doomed).await.unwrap();

    assert!(h.repo.get_messages(&doomed).await.unwrap().is_empty());
    assert!(h.repo.get_session(&doomed).await.unwrap().is_none());
    let state = h.chat.state();
    assert!(state.current_session_id.is_none());
    assert!(state.messages.is_empty());
    let ids: Vec<_> = state.sessions.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, [keep.as_str()]);
    assert_eq!(h.store.active_listeners(), 1);
}

#[tokio::test]
async fn deleting_other_session_keeps_selection() {
    let h = harness(ScriptedGenerator::replying(&["ok"]));
    let other = h.chat.create_new_session().await.unwrap();
    let active = h.chat.create_new_session().await.unwrap();

    h.chat.delete_session(&other).await.unwrap();

    let state = h.chat.state();
    assert_eq!(state.current_session_id.as_deref(), Some(active.as_str()));
    assert_eq!(state.sessions.len(), 1);
}

#[tokio::test]
async fn message_window_bounds_the_mirrored_list() {
    let options = ChatOptions {
        message_window: 3,
        ..ChatOptions::default()
    };
    let h = harness_with(ScriptedGenerator::replying(&["r"]), options);
    let session_id = h.chat.create_new_session().await.unwrap();
    for text in ["a", "b", "c"] {
        h.chat.send_message(text).await.unwrap();
    }

    let texts: Vec<_> = h.chat.state().messages.iter().map(|m| m.text.clone()).collect();
    assert_eq!(texts, ["r", "c", "r"]);
    assert_eq!(h.repo.get_messages(&session_id).await.unwrap().len(), 6);
}

#[tokio::test]
async fn rename_updates_mirrored_sessions() {
    let h = harness(ScriptedGenerator::replying(&["ok"]));
    let id = h.chat.create_new_session().await.unwrap();

    h.chat.rename_session(&id, "  Trip plans ").await.unwrap();

    assert_eq!(h.chat.state().sessions[0].title, "Trip plans");
}

#[tokio::test(start_paused = true)]
async fn operation_errors_are_dismissed_after_delay() {
    let options = ChatOptions {
        error_dismiss: Duration::from_secs(3),
        ..ChatOptions::default()
    };
    let h = harness_with(ScriptedGenerator::replying(&["ok"]), options);

    assert!(h.chat.rename_session("missing", "x").await.is_err());
    assert!(h.chat.state().error.unwrap().contains("Failed to rename session"));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(h.chat.state().error.is_some());

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(h.chat.state().error.is_none());
}

#[tokio::test]
async fn dismiss_error_clears_immediately() {
    let h = harness(ScriptedGenerator::replying(&["ok"]));
    assert!(h.chat.rename_session("missing", "x").await.is_err());

    h.chat.dismiss_error();

    assert!(h.chat.state().error.is_none());
}

#[tokio::test]
async fn close_releases_subscriptions() {
    let h = harness(ScriptedGenerator::replying(&["ok"]));
    h.chat.create_new_session().await.unwrap();
    assert_eq!(h.store.active_listeners(), 2);

    h.chat.close();
    assert_eq!(h.store.active_listeners(), 0);

    h.repo.create_session("after close").await.unwrap();
    assert_eq!(h.chat.state().sessions.len(), 1);
}
