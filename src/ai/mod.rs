//! Completion-service integration.
//!
//! Defines the boundary to the model endpoint (a black-box chat/completion
//! service with function calling), the server selector and the agentic
//! tool-call loop that alternates completions with tool executions.

mod openai;
mod runner;
mod selector;

pub use openai::OpenAIProvider;
pub use runner::{AgentEvent, ToolCallLoop, MAX_ROUNDS};
pub use selector::{ServerSelector, ServerSummary};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message in the conversation driven by one loop run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    /// System message (context/instructions)
    System { content: String },

    /// User message
    User { content: String },

    /// Assistant message (may include tool calls)
    Assistant {
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<ToolCallRequest>>,
    },

    /// Tool result message, bound to a prior assistant tool call
    Tool { tool_call_id: String, content: String },
}

impl ChatMessage {
    /// System message shorthand.
    pub fn system(content: impl Into<String>) -> Self {
        Self::System { content: content.into() }
    }

    /// User message shorthand.
    pub fn user(content: impl Into<String>) -> Self {
        Self::User { content: content.into() }
    }
}

/// One tool call requested by the completion service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Call id, echoed back in the paired tool message
    pub id: String,
    /// Tool name
    pub name: String,
    /// Arguments as the raw JSON string the service produced
    pub arguments_json: String,
}

/// How the completion service may use the provided tools.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    /// The service decides per round
    #[default]
    Auto,
    /// Tools disabled for this call
    None,
}

/// One request to the completion service.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Conversation so far
    pub messages: Vec<ChatMessage>,
    /// Tool specifications in the service's function-calling format
    pub tools: Vec<Value>,
    /// Tool-use policy
    pub tool_choice: ToolChoice,
}

impl CompletionRequest {
    /// Request with tools enabled.
    pub fn new(messages: Vec<ChatMessage>, tools: Vec<Value>) -> Self {
        Self { messages, tools, tool_choice: ToolChoice::Auto }
    }

    /// Plain text request without tools.
    pub fn text_only(messages: Vec<ChatMessage>) -> Self {
        Self { messages, tools: Vec::new(), tool_choice: ToolChoice::None }
    }
}

/// One response from the completion service.
#[derive(Debug, Clone, Default)]
pub struct CompletionResponse {
    /// Assistant text, if any
    pub content: Option<String>,
    /// Requested tool calls, in the order the service produced them
    pub tool_calls: Vec<ToolCallRequest>,
}

/// AI error types.
#[derive(Debug, thiserror::Error)]
pub enum AiError {
    #[error("provider not available: {0}")]
    ProviderNotAvailable(String),

    #[error("api error: {0}")]
    Api(String),

    #[error("rate limited, retry after {0}s")]
    RateLimited(u64),

    #[error("no response from completion service")]
    NoResponse,

    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

/// Boundary to the model endpoint: one synchronous completion per round.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Run one completion over the conversation and tool specifications.
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, AiError>;

    /// Provider name for logs.
    fn name(&self) -> &str;

    /// Cheap availability probe.
    async fn is_available(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_message_roles_serialize() {
        let json = serde_json::to_value(ChatMessage::user("hi")).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "hi");

        let tool = ChatMessage::Tool {
            tool_call_id: "call-1".to_string(),
            content: "ok".to_string(),
        };
        let json = serde_json::to_value(&tool).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["tool_call_id"], "call-1");
    }

    #[test]
    fn test_assistant_message_omits_empty_tool_calls() {
        let message = ChatMessage::Assistant { content: Some("hello".to_string()), tool_calls: None };
        let json = serde_json::to_string(&message).unwrap();
        assert!(!json.contains("tool_calls"));
    }

    #[test]
    fn test_text_only_request_disables_tools() {
        let request = CompletionRequest::text_only(vec![ChatMessage::user("route this")]);
        assert!(request.tools.is_empty());
        assert_eq!(request.tool_choice, ToolChoice::None);
    }
}
