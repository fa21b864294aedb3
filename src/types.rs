//! Shared request and message types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Role of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// A single chat message as exchanged with the browser and the upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Provider reference sent by the dashboard (`{"name": "OpenAI", ...}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRef {
    pub name: String,
}

/// Entry of the file map attached to a chat request, keyed by path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FileEntry {
    File {
        content: String,
        #[serde(default, rename = "isBinary")]
        is_binary: bool,
    },
    Folder,
}

pub type FileMap = HashMap<String, FileEntry>;

/// Body of `POST /api/chat`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequestBody {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub provider: Option<ProviderRef>,
    #[serde(default)]
    pub files: Option<FileMap>,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub context_optimization: bool,
}

/// Token usage reported for a single generation segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub completion_tokens: u64,
}

impl Usage {
    pub fn new(completion_tokens: u64) -> Self {
        Self { completion_tokens }
    }
}
