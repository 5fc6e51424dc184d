//! Conversation messages.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation owned by an assistant message.  Later tool-role
/// messages reference it through `tool_call_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRecord {
    pub id: Uuid,
    pub name: String,
    /// Always a JSON object, possibly empty.
    pub arguments: serde_json::Value,
}

/// The outcome of one tool invocation, carried by a tool-role message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResultRecord {
    pub id: Uuid,
    pub tool_call_id: Uuid,
    /// May have been truncated on a code-point boundary with a `...` marker.
    pub content: String,
    pub is_error: bool,
}

/// A single message in a conversation.
///
/// A tool message carries exactly one tool result whose `tool_call_id`
/// references a tool call owned by a prior assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResultRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Vec<u8>>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            timestamp_ms: Utc::now().timestamp_millis(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            thinking: None,
            image: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Assistant message capturing the text emitted so far plus the tool
    /// calls the model requested.
    pub fn assistant_with_tool_calls(
        content: impl Into<String>,
        tool_calls: Vec<ToolCallRecord>,
    ) -> Self {
        let mut msg = Self::new(Role::Assistant, content);
        msg.tool_calls = tool_calls;
        msg
    }

    pub fn tool_result(result: ToolResultRecord) -> Self {
        let mut msg = Self::new(Role::Tool, result.content.clone());
        msg.tool_results = vec![result];
        msg
    }

    pub fn with_thinking(mut self, thinking: impl Into<String>) -> Self {
        self.thinking = Some(thinking.into());
        self
    }
}
