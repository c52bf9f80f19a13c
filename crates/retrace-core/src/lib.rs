//! Core domain types and collaborator traits for retrace.
//!
//! This crate provides the vocabulary shared by capture, storage and replay:
//!
//! - [`AgentError`]: Error type for model, tool and workflow calls
//! - [`Message`], [`ModelRequest`], [`ModelResponse`]: Model call payloads
//! - [`ToolRequest`] and [`ToolValue`]: Tool call payloads
//! - [`ModelClient`] and [`ToolExecutor`]: The seams a workflow calls through
//!
//! # Example
//!
//! ```rust
//! use retrace_core::{Message, ModelRequest};
//!
//! let request = ModelRequest::new(vec![Message::user("Hello")])
//!     .with_system("You are terse.")
//!     .with_config("max_tokens", 256);
//!
//! assert_eq!(request.messages.len(), 1);
//! assert_eq!(request.config["max_tokens"], 256);
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors that can occur while a workflow talks to its collaborators.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    /// Model request failed.
    #[error("LLM request failed: {0}")]
    Llm(String),

    /// Tool invocation failed.
    #[error("Tool execution failed: {0}")]
    Tool(String),

    /// A replayed call had no recorded counterpart.
    #[error("Replay divergence: {0}")]
    ReplayDivergence(String),

    /// Recording an interaction into the active trace failed.
    #[error("Trace capture failed: {0}")]
    Capture(String),

    /// The execution was cancelled before completing.
    #[error("Execution cancelled")]
    Cancelled,

    /// Failed to parse structured data.
    #[error("Failed to parse structured output: {0}")]
    Parse(String),

    /// Workflow-level failure not tied to a single call.
    #[error("Workflow failed: {0}")]
    Workflow(String),
}

impl AgentError {
    /// Returns true when the error was raised by a replay stub miss.
    pub fn is_divergence(&self) -> bool {
        matches!(self, AgentError::ReplayDivergence(_))
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::Parse(err.to_string())
    }
}

/// Role of a message in a model request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message in a model request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// The role of the message sender.
    pub role: MessageRole,
    /// The content of the message.
    pub content: String,
    /// Optional participant name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Tool call this message answers (tool role only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn with_role(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            tool_call_id: None,
        }
    }

    /// Creates a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::System, content)
    }

    /// Creates a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::User, content)
    }

    /// Creates a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::Assistant, content)
    }

    /// Creates a tool result message answering `tool_call_id`.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::with_role(MessageRole::Tool, content)
        }
    }
}

/// The exact outbound request sent to a model service.
///
/// Recorded requests are the replay key, so nothing downstream of capture
/// mutates them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    /// Ordered conversation messages.
    #[serde(default)]
    pub messages: Vec<Message>,
    /// System instruction text.
    #[serde(default)]
    pub system: String,
    /// Generation parameters (max_tokens, temperature, ...).
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl ModelRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = system.into();
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }
}

/// A structured tool invocation emitted by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

/// Token usage counters reported with a model response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    /// Reported total, or the sum of the parts when the provider omitted it.
    pub fn total(&self) -> u64 {
        match self.total_tokens {
            0 => self.input_tokens + self.output_tokens,
            n => n,
        }
    }
}

/// The inbound response received from a model service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub usage: Usage,
}

impl ModelResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }
}

/// An outbound tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub tool_name: String,
    #[serde(default)]
    pub input: Value,
    /// Correlation id linking the invocation to the model call that asked for it.
    #[serde(default)]
    pub tool_use_id: Option<String>,
}

impl ToolRequest {
    pub fn new(tool_name: impl Into<String>, input: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            input,
            tool_use_id: None,
        }
    }

    pub fn with_tool_use_id(mut self, id: impl Into<String>) -> Self {
        self.tool_use_id = Some(id.into());
        self
    }
}

impl From<&ToolCall> for ToolRequest {
    fn from(call: &ToolCall) -> Self {
        Self {
            tool_name: call.name.clone(),
            input: call.input.clone(),
            tool_use_id: Some(call.id.clone()),
        }
    }
}

/// Result value of a tool invocation.
///
/// Tagged so a replayed value comes back with the type it was recorded with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ToolValue {
    #[default]
    Null,
    Text(String),
    Json(Value),
    Bytes { data: Vec<u8>, media_type: String },
}

impl ToolValue {
    /// Textual rendering of the value, as shown to a model.
    pub fn render(&self) -> String {
        match self {
            ToolValue::Null => String::new(),
            ToolValue::Text(s) => s.clone(),
            ToolValue::Json(Value::String(s)) => s.clone(),
            ToolValue::Json(v) => v.to_string(),
            ToolValue::Bytes { data, media_type } => {
                format!("<{} bytes of {}>", data.len(), media_type)
            }
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ToolValue::Null)
    }
}

impl From<String> for ToolValue {
    fn from(s: String) -> Self {
        ToolValue::Text(s)
    }
}

impl From<&str> for ToolValue {
    fn from(s: &str) -> Self {
        ToolValue::Text(s.to_string())
    }
}

impl From<Value> for ToolValue {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => ToolValue::Null,
            v => ToolValue::Json(v),
        }
    }
}

/// Identifies the node and step that issued an outbound call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallContext {
    pub node_id: String,
    pub step_index: u32,
}

impl CallContext {
    pub fn new(node_id: impl Into<String>, step_index: u32) -> Self {
        Self {
            node_id: node_id.into(),
            step_index,
        }
    }
}

/// A model-completion service.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(
        &self,
        ctx: &CallContext,
        request: &ModelRequest,
    ) -> Result<ModelResponse, AgentError>;

    /// Model identifier recorded alongside interactions.
    fn model_name(&self) -> &str {
        ""
    }

    /// Provider identifier recorded alongside interactions.
    fn provider_name(&self) -> &str {
        ""
    }
}

/// A tool registry capable of executing tool requests.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, ctx: &CallContext, request: &ToolRequest)
        -> Result<ToolValue, AgentError>;
}

#[async_trait]
impl<T: ModelClient + ?Sized> ModelClient for Arc<T> {
    async fn complete(
        &self,
        ctx: &CallContext,
        request: &ModelRequest,
    ) -> Result<ModelResponse, AgentError> {
        (**self).complete(ctx, request).await
    }

    fn model_name(&self) -> &str {
        (**self).model_name()
    }

    fn provider_name(&self) -> &str {
        (**self).provider_name()
    }
}

#[async_trait]
impl<T: ToolExecutor + ?Sized> ToolExecutor for Arc<T> {
    async fn execute(
        &self,
        ctx: &CallContext,
        request: &ToolRequest,
    ) -> Result<ToolValue, AgentError> {
        (**self).execute(ctx, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_usage_total_falls_back_to_parts() {
        let usage = Usage {
            input_tokens: 12,
            output_tokens: 8,
            total_tokens: 0,
        };
        assert_eq!(usage.total(), 20);
        assert_eq!(Usage::new(3, 4).total(), 7);

        let reported = Usage {
            input_tokens: 1,
            output_tokens: 1,
            total_tokens: 100,
        };
        assert_eq!(reported.total(), 100);
    }

    #[test]
    fn test_tool_value_keeps_its_type() {
        let values = vec![
            ToolValue::Null,
            ToolValue::Text("found 3 items".into()),
            ToolValue::Json(json!({"count": 3})),
            ToolValue::Bytes {
                data: vec![0, 159, 146, 150],
                media_type: "application/octet-stream".into(),
            },
        ];

        for value in values {
            let encoded = serde_json::to_string(&value).unwrap();
            let decoded: ToolValue = serde_json::from_str(&encoded).unwrap();
            assert_eq!(decoded, value);
        }

        let encoded = serde_json::to_value(ToolValue::Text("x".into())).unwrap();
        assert_eq!(encoded, json!({"kind": "text", "value": "x"}));
    }

    #[test]
    fn test_tool_value_render() {
        assert_eq!(ToolValue::Null.render(), "");
        assert_eq!(ToolValue::from("hi").render(), "hi");
        assert_eq!(ToolValue::from(json!("quoted")).render(), "quoted");
        assert_eq!(ToolValue::from(json!({"a": 1})).render(), r#"{"a":1}"#);
        assert!(ToolValue::from(Value::Null).is_null());
    }

    #[test]
    fn test_message_constructors() {
        let msg = Message::tool("call-1", "42");
        assert_eq!(msg.role, MessageRole::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call-1"));

        let encoded = serde_json::to_value(Message::user("Hello")).unwrap();
        assert_eq!(encoded, json!({"role": "user", "content": "Hello"}));
    }

    #[test]
    fn test_tool_request_from_call() {
        let call = ToolCall {
            id: "toolu_1".into(),
            name: "search".into(),
            input: json!({"query": "rust"}),
        };
        let request = ToolRequest::from(&call);
        assert_eq!(request.tool_name, "search");
        assert_eq!(request.tool_use_id.as_deref(), Some("toolu_1"));
    }
}
