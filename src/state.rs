//! View-state container bridging the repository and the UI.
//!
//! State is published through a [`watch`] channel: the UI keeps a receiver
//! and re-renders on every change. Session and message lists are mirrored
//! from store subscriptions; the assistant reply being produced lives in
//! `pending_reply` until the persisted copy shows up in a snapshot.

use crate::config::{AppSettings, DEFAULT_ERROR_DISMISS, DEFAULT_MESSAGE_WINDOW};
use crate::db::models::{title_from_text, ChatMessage, ChatSession, DEFAULT_SESSION_TITLE};
use crate::db::ListenerRegistration;
use crate::llm::{PromptMessage, Role, StreamChunk, TextGenerator};
use crate::repository::{ChatRepository, RepositoryError};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;

/// Stored in place of an empty assistant reply.
pub const EMPTY_REPLY_TEXT: &str = "(no response)";

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl Serialize for ChatError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChatOptions {
    /// Most messages of the active session kept in memory.
    pub message_window: usize,
    pub error_dismiss: Duration,
    pub stream_replies: bool,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            message_window: DEFAULT_MESSAGE_WINDOW,
            error_dismiss: DEFAULT_ERROR_DISMISS,
            stream_replies: true,
        }
    }
}

impl From<&AppSettings> for ChatOptions {
    fn from(settings: &AppSettings) -> Self {
        Self {
            message_window: settings.message_window,
            error_dismiss: settings.error_dismiss,
            stream_replies: settings.stream_replies,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatState {
    pub sessions: Vec<ChatSession>,
    /// Persisted messages of the active session, oldest first.
    pub messages: Vec<ChatMessage>,
    pub pending_reply: Option<ChatMessage>,
    pub current_session_id: Option<String>,
    pub is_loading: bool,
    pub error: Option<String>,
}

impl ChatState {
    /// What the message list shows: the persisted messages, then the pending reply.
    pub fn visible_messages(&self) -> Vec<&ChatMessage> {
        self.messages.iter().chain(self.pending_reply.as_ref()).collect()
    }

    pub fn current_session(&self) -> Option<&ChatSession> {
        let id = self.current_session_id.as_deref()?;
        self.sessions.iter().find(|s| s.id == id)
    }
}

/// Transient error message, cleared after a fixed delay unless a newer
/// error replaced it first.
#[derive(Clone)]
struct ErrorBanner {
    state: Arc<watch::Sender<ChatState>>,
    generation: Arc<AtomicU64>,
    dismiss_after: Duration,
    runtime: Option<Handle>,
}

impl ErrorBanner {
    fn show(&self, message: String) {
        error!("[chat] {}", message);
        let ticket = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.send_modify(|s| s.error = Some(message));

        let Some(runtime) = &self.runtime else {
            warn!("[chat] no async runtime; error stays until dismissed");
            return;
        };
        let state = Arc::clone(&self.state);
        let generation = Arc::clone(&self.generation);
        let delay = self.dismiss_after;
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if generation.load(Ordering::SeqCst) == ticket {
                state.send_if_modified(|s| s.error.take().is_some());
            }
        });
    }

    fn dismiss(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.state.send_if_modified(|s| s.error.take().is_some());
    }
}

fn lock<T>(slot: &Mutex<T>) -> MutexGuard<'_, T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn to_prompt(message: &ChatMessage) -> PromptMessage {
    let role = if message.is_from_user {
        Role::User
    } else {
        Role::Assistant
    };
    PromptMessage::new(role, message.text.clone())
}

pub struct ChatViewModel {
    repo: Arc<ChatRepository>,
    generator: Arc<dyn TextGenerator>,
    options: ChatOptions,
    state: Arc<watch::Sender<ChatState>>,
    errors: ErrorBanner,
    sessions_listener: Mutex<Option<ListenerRegistration>>,
    messages_listener: Mutex<Option<ListenerRegistration>>,
}

impl ChatViewModel {
    /// Builds the container and subscribes to the session list. Error
    /// auto-dismissal runs on the tokio runtime current at this call, if any.
    pub fn new(
        repo: Arc<ChatRepository>,
        generator: Arc<dyn TextGenerator>,
        options: ChatOptions,
    ) -> Self {
        let (sender, _) = watch::channel(ChatState::default());
        let state = Arc::new(sender);
        let errors = ErrorBanner {
            state: Arc::clone(&state),
            generation: Arc::default(),
            dismiss_after: options.error_dismiss,
            runtime: Handle::try_current().ok(),
        };
        let view_model = Self {
            repo,
            generator,
            options,
            state,
            errors,
            sessions_listener: Mutex::new(None),
            messages_listener: Mutex::new(None),
        };
        view_model.listen_sessions();
        view_model
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ChatState {
        self.state.borrow().clone()
    }

    fn listen_sessions(&self) {
        let state = Arc::clone(&self.state);
        let errors = self.errors.clone();
        let registration = self.repo.listen_sessions(move |result| match result {
            Ok(sessions) => state.send_modify(|s| s.sessions = sessions),
            Err(e) => errors.show(format!("Failed to load sessions: {}", e)),
        });
        if let Some(previous) = lock(&self.sessions_listener).replace(registration) {
            previous.remove();
        }
    }

    fn listen_messages(&self, session_id: &str) {
        let state = Arc::clone(&self.state);
        let errors = self.errors.clone();
        let owner = session_id.to_string();
        let registration =
            self.repo
                .listen_messages(session_id, self.options.message_window, move |result| {
                    let messages = match result {
                        Ok(messages) => messages,
                        Err(e) => {
                            errors.show(format!("Failed to load messages: {}", e));
                            return;
                        }
                    };
                    state.send_if_modified(|s| {
                        if s.current_session_id.as_deref() != Some(owner.as_str()) {
                            return false;
                        }
                        let persisted = s
                            .pending_reply
                            .as_ref()
                            .is_some_and(|p| messages.iter().any(|m| m.id == p.id));
                        if persisted {
                            s.pending_reply = None;
                        }
                        s.messages = messages;
                        true
                    });
                });
        if let Some(previous) = lock(&self.messages_listener).replace(registration) {
            previous.remove();
        }
    }

    fn release_messages_listener(&self) {
        if let Some(registration) = lock(&self.messages_listener).take() {
            registration.remove();
        }
    }

    fn fail(&self, context: &str, err: impl Into<ChatError>) -> ChatError {
        let err = err.into();
        self.errors.show(format!("{}: {}", context, err));
        err
    }

    /// Creates an empty session and makes it the active one.
    pub async fn create_new_session(&self) -> Result<String, ChatError> {
        self.open_session(DEFAULT_SESSION_TITLE).await
    }

    async fn open_session(&self, title: &str) -> Result<String, ChatError> {
        let session = self
            .repo
            .create_session(title)
            .await
            .map_err(|e| self.fail("Failed to create session", e))?;

        self.state.send_if_modified(|s| {
            if s.sessions.iter().any(|x| x.id == session.id) {
                return false;
            }
            s.sessions.insert(0, session.clone());
            true
        });
        self.select_session(&session.id);
        Ok(session.id)
    }

    /// Switches the active session, replacing the message subscription.
    pub fn select_session(&self, session_id: &str) {
        if self.state.borrow().current_session_id.as_deref() == Some(session_id) {
            return;
        }
        info!("[chat] selecting session {}", session_id);
        self.release_messages_listener();
        self.state.send_modify(|s| {
            s.current_session_id = Some(session_id.to_string());
            s.messages.clear();
            s.pending_reply = None;
        });
        self.listen_messages(session_id);
    }

    /// Sends `text` to the active session (creating one if needed) and
    /// produces the assistant's reply. Blank input and input arriving while
    /// a reply is in progress are ignored.
    pub async fn send_message(&self, text: &str) -> Result<(), ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let claimed = self.state.send_if_modified(|s| {
            if s.is_loading {
                return false;
            }
            s.is_loading = true;
            true
        });
        if !claimed {
            debug!("[chat] send ignored, a reply is already in progress");
            return Ok(());
        }

        let result = self.run_exchange(text).await;
        self.state.send_modify(|s| s.is_loading = false);
        result
    }

    async fn run_exchange(&self, text: &str) -> Result<(), ChatError> {
        let current = self.state.borrow().current_session_id.clone();
        let session_id = match current {
            Some(id) => id,
            None => self.open_session(&title_from_text(text)).await?,
        };

        let (mut history, retitle) = {
            let s = self.state.borrow();
            let history: Vec<PromptMessage> = s.messages.iter().map(to_prompt).collect();
            let retitle = s
                .sessions
                .iter()
                .find(|x| x.id == session_id)
                .is_some_and(|x| x.title == DEFAULT_SESSION_TITLE && x.message_count == 0);
            (history, retitle)
        };

        let user_message = ChatMessage::from_user(text);
        self.repo
            .add_message(&session_id, &user_message)
            .await
            .map_err(|e| self.fail("Failed to send message", e))?;
        history.push(to_prompt(&user_message));

        let placeholder = ChatMessage::typing_placeholder();
        let placeholder_id = placeholder.id.clone();
        self.state.send_modify(|s| s.pending_reply = Some(placeholder));

        let reply = if self.options.stream_replies {
            let state = Arc::clone(&self.state);
            let pending_id = placeholder_id.clone();
            let on_chunk = move |chunk: StreamChunk| {
                if chunk.delta.is_empty() {
                    return;
                }
                state.send_if_modified(|s| match s.pending_reply.as_mut() {
                    Some(pending) if pending.id == pending_id => {
                        pending.text.push_str(&chunk.delta);
                        true
                    }
                    _ => false,
                });
            };
            self.generator.generate_stream(&history, &on_chunk).await
        } else {
            self.generator.generate(&history).await
        };

        let added = match reply {
            Ok(reply) => {
                let reply = if reply.trim().is_empty() {
                    EMPTY_REPLY_TEXT.to_string()
                } else {
                    reply
                };
                let assistant = ChatMessage::from_assistant(&placeholder_id, &reply);
                if let Err(e) = self.repo.add_message(&session_id, &assistant).await {
                    self.drop_pending(&placeholder_id);
                    return Err(self.fail("Failed to save reply", e));
                }
                self.drop_pending(&placeholder_id);
                self.repo
                    .record_exchange(&session_id, &reply, 2)
                    .await
                    .map_err(|e| self.fail("Failed to update session", e))?;
                2
            }
            Err(e) => {
                warn!("[chat] generation failed for session {}: {}", session_id, e);
                self.state.send_modify(|s| {
                    if let Some(pending) = s.pending_reply.as_mut() {
                        if pending.id == placeholder_id {
                            pending.text = format!("Error: {}", e);
                            pending.is_typing = false;
                        }
                    }
                });
                self.repo
                    .record_exchange(&session_id, text, 1)
                    .await
                    .map_err(|e| self.fail("Failed to update session", e))?;
                1
            }
        };
        debug!("[chat] session {} grew by {} message(s)", session_id, added);

        if retitle {
            self.repo
                .rename_session(&session_id, &title_from_text(text))
                .await
                .map_err(|e| self.fail("Failed to rename session", e))?;
        }
        Ok(())
    }

    fn drop_pending(&self, placeholder_id: &str) {
        self.state.send_if_modified(|s| {
            if s.pending_reply.as_ref().is_some_and(|p| p.id == placeholder_id) {
                s.pending_reply = None;
                true
            } else {
                false
            }
        });
    }

    /// Deletes the session and its messages; clears the active session if it
    /// was this one.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), ChatError> {
        let was_active = self.state.borrow().current_session_id.as_deref() == Some(session_id);
        if was_active {
            self.release_messages_listener();
        }

        if let Err(e) = self.repo.delete_session(session_id).await {
            if was_active {
                self.listen_messages(session_id);
            }
            return Err(self.fail("Failed to delete session", e));
        }

        self.state.send_modify(|s| {
            s.sessions.retain(|x| x.id != session_id);
            if s.current_session_id.as_deref() == Some(session_id) {
                s.current_session_id = None;
                s.messages.clear();
                s.pending_reply = None;
            }
        });
        Ok(())
    }

    pub async fn rename_session(&self, session_id: &str, title: &str) -> Result<(), ChatError> {
        let title = title.trim();
        if title.is_empty() {
            return Ok(());
        }
        self.repo
            .rename_session(session_id, title)
            .await
            .map_err(|e| self.fail("Failed to rename session", e))
    }

    pub fn dismiss_error(&self) {
        self.errors.dismiss();
    }

    /// Releases both subscriptions. Later store changes no longer reach the state.
    pub fn close(&self) {
        if let Some(registration) = lock(&self.sessions_listener).take() {
            registration.remove();
        }
        self.release_messages_listener();
    }
}

impl Drop for ChatViewModel {
    fn drop(&mut self) {
        self.close();
    }
}
