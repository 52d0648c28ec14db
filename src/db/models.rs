use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SESSION_TITLE: &str = "New Chat";

const TITLE_MAX_CHARS: usize = 30;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub last_message: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub message_count: u32,
    pub user_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl ChatSession {
    pub fn new(user_id: &str, title: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            last_message: String::new(),
            last_updated: now,
            message_count: 0,
            user_id: user_id.to_string(),
            created_at: now,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub text: String,
    pub is_from_user: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// Local-only marker for the assistant reply still being produced.
    #[serde(default)]
    pub is_typing: bool,
}

impl ChatMessage {
    pub fn from_user(text: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.to_string(),
            is_from_user: true,
            timestamp: Utc::now(),
            is_typing: false,
        }
    }

    pub fn from_assistant(id: &str, text: &str) -> Self {
        Self {
            id: id.to_string(),
            text: text.to_string(),
            is_from_user: false,
            timestamp: Utc::now(),
            is_typing: false,
        }
    }

    pub fn typing_placeholder() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: String::new(),
            is_from_user: false,
            timestamp: Utc::now(),
            is_typing: true,
        }
    }
}

/// Session title derived from the first line of a message.
pub fn title_from_text(text: &str) -> String {
    let first_line = text.lines().map(str::trim).find(|l| !l.is_empty());
    let Some(line) = first_line else {
        return DEFAULT_SESSION_TITLE.to_string();
    };
    if line.chars().count() <= TITLE_MAX_CHARS {
        line.to_string()
    } else {
        let head: String = line.chars().take(TITLE_MAX_CHARS).collect();
        format!("{}...", head.trim_end())
    }
}
