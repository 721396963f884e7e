use serde::{Deserialize, Serialize};
use std::fmt;

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Parse a wire role name. Matching is exact and case-sensitive.
    #[must_use]
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message of the conversation sent to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A chat completion request as relayed to the upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
}

impl CompletionRequest {
    #[must_use]
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            stream: true,
        }
    }

    /// Only streaming mode is relayed, whatever the caller asked for.
    #[must_use]
    pub fn into_streaming(mut self) -> Self {
        self.stream = true;
        self
    }
}

/// One unit of incremental model output.
///
/// `is_finished` marks the terminal chunk of a stream; its `delta` carries no
/// meaning. Upstreams that spell the flag `IsFinished` are accepted too.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionChunk {
    #[serde(default)]
    pub delta: String,
    #[serde(default, rename = "isFinished", alias = "IsFinished")]
    pub is_finished: bool,
}

impl CompletionChunk {
    #[must_use]
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            delta: text.into(),
            is_finished: false,
        }
    }

    #[must_use]
    pub fn finished() -> Self {
        Self {
            delta: String::new(),
            is_finished: true,
        }
    }
}
