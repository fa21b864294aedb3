//! Prompt text and the message transforms applied before a chat is sent upstream.

use std::sync::LazyLock;

use regex::Regex;

use crate::types::{ChatMessage, FileEntry, FileMap, MessageRole};

/// Instruction appended after a segment that stopped on its length limit.
pub const CONTINUE_PROMPT: &str = "Continue your prior response. IMPORTANT: Immediately begin from where you left off without any interruptions. Do not repeat any content, including artifact and action tags.";

/// Token budget for the enhancer endpoint.
pub const ENHANCER_MAX_TOKENS: u32 = 2000;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant embedded in a personal finance dashboard. \
Answer questions about the user's accounts, transactions and spending clearly and accurately. \
When you are unsure, say so instead of guessing. Format answers with Markdown, and put code in fenced code blocks.";

const OPTIMIZED_SYSTEM_PROMPT: &str = "You are a concise assistant embedded in a personal finance dashboard. \
Answer in as few words as the question allows. Use the provided file context when it is relevant and \
ignore it otherwise. Never repeat file contents back unless asked.";

/// Identifier of a selectable system prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptId {
    Default,
    Optimized,
}

impl PromptId {
    /// Resolve a dashboard prompt id; unknown or missing ids use the default prompt.
    pub fn from_id(id: Option<&str>) -> Self {
        match id.map(str::trim) {
            Some("optimized") => Self::Optimized,
            Some("default") | None => Self::Default,
            Some(other) => {
                tracing::debug!(prompt_id = other, "unknown prompt id, using default");
                Self::Default
            }
        }
    }

    pub fn system_prompt(self) -> &'static str {
        match self {
            Self::Default => DEFAULT_SYSTEM_PROMPT,
            Self::Optimized => OPTIMIZED_SYSTEM_PROMPT,
        }
    }
}

/// Build the enhancer instruction around the user's text.
pub fn enhancer_prompt(message: &str) -> String {
    format!(
        "You are an AI writing assistant. Your task is to enhance the given text while maintaining its original meaning and intent.\n\
Make it more professional, clear, and engaging. Focus on:\n\
1. Improving clarity and readability\n\
2. Enhancing grammar and word choice\n\
3. Maintaining the original tone and intent\n\
4. Making it more concise when possible\n\
\n\
Text to enhance:\n\
{message}\n\
\n\
Enhanced version:"
    )
}

static MODEL_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[Model: (.*?)\]\n\n").expect("valid model tag regex"));
static PROVIDER_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[Provider: (.*?)\]\n\n").expect("valid provider tag regex"));
static FILE_ACTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)(<boltAction[^>]*type="file"[^>]*>)(.*?)(</boltAction>)"#)
        .expect("valid file action regex")
});

/// Model and provider tags found at the start of a user message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTags {
    pub model: Option<String>,
    pub provider: Option<String>,
    /// Message text with the tags removed
    pub content: String,
}

/// Split `[Model: x]\n\n[Provider: y]\n\n` tags off a user message.
pub fn extract_model_and_provider(content: &str) -> MessageTags {
    let model = MODEL_TAG
        .captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());
    let provider = PROVIDER_TAG
        .captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());

    let stripped = MODEL_TAG.replace(content, "");
    let stripped = PROVIDER_TAG.replace(&stripped, "");

    MessageTags {
        model,
        provider,
        content: stripped.into_owned(),
    }
}

/// Replace file-action bodies in an assistant message with an ellipsis.
pub fn simplify_assistant_message(content: &str) -> String {
    FILE_ACTION.replace_all(content, "$1...$3").into_owned()
}

/// Render the non-binary files of a request as context for the system prompt.
pub fn files_context(files: &FileMap) -> Option<String> {
    let mut paths: Vec<_> = files
        .iter()
        .filter_map(|(path, entry)| match entry {
            FileEntry::File {
                content,
                is_binary: false,
            } => Some((path, content)),
            _ => None,
        })
        .collect();
    if paths.is_empty() {
        return None;
    }
    paths.sort_by(|a, b| a.0.cmp(b.0));

    let mut out = String::from("Below are the files the user has open. Use them as context.\n");
    for (path, content) in paths {
        out.push_str(&format!("<file path=\"{path}\">\n{content}\n</file>\n"));
    }
    Some(out)
}

/// Messages and tags for a chat request, ready to send upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedChat {
    pub messages: Vec<ChatMessage>,
    pub model: Option<String>,
    pub provider: Option<String>,
}

/// Turn the dashboard's message list into the upstream conversation.
///
/// Tags are taken from the last user message and stripped from every user
/// message. With `context_optimization`, earlier assistant messages lose
/// their file bodies and open files are appended to the system prompt.
pub fn prepare_chat(
    messages: Vec<ChatMessage>,
    prompt: PromptId,
    files: Option<&FileMap>,
    context_optimization: bool,
) -> PreparedChat {
    let mut model = None;
    let mut provider = None;
    let mut conversation = Vec::with_capacity(messages.len() + 1);

    for message in messages {
        match message.role {
            MessageRole::User => {
                let tags = extract_model_and_provider(&message.content);
                if tags.model.is_some() {
                    model = tags.model;
                }
                if tags.provider.is_some() {
                    provider = tags.provider;
                }
                conversation.push(ChatMessage::user(tags.content));
            }
            MessageRole::Assistant if context_optimization => {
                conversation.push(ChatMessage::assistant(simplify_assistant_message(
                    &message.content,
                )));
            }
            // The relay owns the system prompt.
            MessageRole::System => {}
            MessageRole::Assistant => conversation.push(message),
        }
    }

    let mut system = prompt.system_prompt().to_string();
    if context_optimization {
        if let Some(context) = files.and_then(files_context) {
            system.push_str("\n\n");
            system.push_str(&context);
        }
    }
    conversation.insert(0, ChatMessage::system(system));

    PreparedChat {
        messages: conversation,
        model,
        provider,
    }
}
