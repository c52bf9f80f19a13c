//! In-memory trace capture attached to one live execution.

use std::sync::{Mutex, MutexGuard};

use retrace_core::{Message, ModelRequest, ModelResponse, ToolCall, ToolValue, Usage};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::trace::{
    BoundaryKind, ExecutionTrace, ModelInteraction, NodeBoundary, ToolInteraction, TraceMetadata,
    TraceStatus,
};
use crate::CaptureConfig;

/// Errors from misuse of the capture lifecycle.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("No active trace")]
    NoActiveTrace,
    #[error("Trace {0} is already active")]
    AlreadyActive(String),
    #[error("Duplicate tool correlation id: {0}")]
    DuplicateCorrelationId(String),
    #[error("Lock error")]
    Lock,
}

/// A model call to record.
#[derive(Debug, Clone, Default)]
pub struct ModelCapture {
    pub node_id: String,
    pub step_index: u32,
    pub request: ModelRequest,
    pub response: ModelResponse,
    pub latency_ms: u64,
    pub model: String,
    pub provider: String,
    pub error: Option<String>,
}

impl ModelCapture {
    pub fn new(node_id: impl Into<String>, step_index: u32, messages: Vec<Message>) -> Self {
        Self {
            node_id: node_id.into(),
            step_index,
            request: ModelRequest::new(messages),
            ..Default::default()
        }
    }

    /// Starts from an already assembled request.
    pub fn from_request(node_id: impl Into<String>, step_index: u32, request: ModelRequest) -> Self {
        Self {
            node_id: node_id.into(),
            step_index,
            request,
            ..Default::default()
        }
    }

    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.request.system = system.into();
        self
    }

    pub fn config(mut self, config: Map<String, Value>) -> Self {
        self.request.config = config;
        self
    }

    pub fn response_content(mut self, content: impl Into<String>) -> Self {
        self.response.content = content.into();
        self
    }

    pub fn response_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.response.tool_calls = calls;
        self
    }

    pub fn usage(mut self, usage: Usage) -> Self {
        self.response.usage = usage;
        self
    }

    pub fn response(mut self, response: ModelResponse) -> Self {
        self.response = response;
        self
    }

    pub fn latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn model(mut self, model: impl Into<String>, provider: impl Into<String>) -> Self {
        self.model = model.into();
        self.provider = provider.into();
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// A tool call to record.
#[derive(Debug, Clone, Default)]
pub struct ToolCapture {
    pub node_id: String,
    pub step_index: u32,
    pub tool_name: String,
    pub tool_input: Value,
    pub tool_use_id: Option<String>,
    pub result: ToolValue,
    pub result_content: Option<String>,
    pub is_error: bool,
    pub latency_ms: u64,
}

impl ToolCapture {
    pub fn new(
        node_id: impl Into<String>,
        step_index: u32,
        tool_name: impl Into<String>,
        tool_input: Value,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            step_index,
            tool_name: tool_name.into(),
            tool_input,
            ..Default::default()
        }
    }

    pub fn tool_use_id(mut self, id: impl Into<String>) -> Self {
        self.tool_use_id = Some(id.into());
        self
    }

    pub fn result(mut self, result: impl Into<ToolValue>) -> Self {
        self.result = result.into();
        self
    }

    /// Records a failed invocation with its error text as the rendering.
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.result = ToolValue::Null;
        self.result_content = Some(error.into());
        self.is_error = true;
        self
    }

    pub fn latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }
}

/// A node boundary to record.
#[derive(Debug, Clone)]
pub struct BoundaryCapture {
    pub node_id: String,
    pub node_name: String,
    pub node_type: String,
    pub kind: BoundaryKind,
    pub memory_snapshot: Map<String, Value>,
    pub input_data: Map<String, Value>,
    pub output_data: Map<String, Value>,
    pub success: bool,
    pub error: Option<String>,
    pub tokens_used: u64,
    pub latency_ms: u64,
    pub attempt: u32,
    pub verdict: String,
}

impl BoundaryCapture {
    pub fn new(
        node_id: impl Into<String>,
        node_name: impl Into<String>,
        node_type: impl Into<String>,
        kind: BoundaryKind,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            node_name: node_name.into(),
            node_type: node_type.into(),
            kind,
            memory_snapshot: Map::new(),
            input_data: Map::new(),
            output_data: Map::new(),
            success: kind != BoundaryKind::Error,
            error: None,
            tokens_used: 0,
            latency_ms: 0,
            attempt: 1,
            verdict: String::new(),
        }
    }

    pub fn memory(mut self, snapshot: Map<String, Value>) -> Self {
        self.memory_snapshot = snapshot;
        self
    }

    pub fn input(mut self, data: Map<String, Value>) -> Self {
        self.input_data = data;
        self
    }

    pub fn output(mut self, data: Map<String, Value>) -> Self {
        self.output_data = data;
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }

    pub fn tokens(mut self, tokens_used: u64) -> Self {
        self.tokens_used = tokens_used;
        self
    }

    pub fn latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn verdict(mut self, verdict: impl Into<String>) -> Self {
        self.verdict = verdict.into();
        self
    }
}

/// Records the interactions of exactly one execution at a time.
///
/// Share it with `Arc` among the nodes of a single execution. Concurrent
/// executions need their own instances.
pub struct TraceCapture {
    config: CaptureConfig,
    current: Mutex<Option<ExecutionTrace>>,
}

impl Default for TraceCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceCapture {
    pub fn new() -> Self {
        Self::with_config(CaptureConfig::new())
    }

    pub fn with_config(config: CaptureConfig) -> Self {
        Self {
            config,
            current: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<ExecutionTrace>>, CaptureError> {
        self.current.lock().map_err(|_| CaptureError::Lock)
    }

    /// Starts a new trace and makes it current.
    pub fn start_trace(
        &self,
        run_id: &str,
        agent_id: &str,
        goal_id: Option<&str>,
        tags: Vec<String>,
    ) -> Result<String, CaptureError> {
        let mut guard = self.lock()?;
        if let Some(active) = guard.as_ref() {
            return Err(CaptureError::AlreadyActive(active.trace_id().to_string()));
        }

        let mut metadata = TraceMetadata::new(run_id, agent_id, goal_id.unwrap_or_default());
        metadata.tags = tags;
        let trace_id = metadata.trace_id.clone();

        tracing::debug!(trace_id = %trace_id, run_id, agent_id, "Started trace");
        *guard = Some(ExecutionTrace::from_metadata(metadata));
        Ok(trace_id)
    }

    /// Appends a model interaction to the current trace.
    pub fn capture_model_interaction(&self, capture: ModelCapture) -> Result<String, CaptureError> {
        let mut guard = self.lock()?;
        let trace = guard.as_mut().ok_or(CaptureError::NoActiveTrace)?;
        if !self.config.enabled {
            return Ok(String::new());
        }

        let mut interaction = ModelInteraction::new(capture.node_id, capture.step_index, capture.request);
        interaction.response = capture.response;
        interaction.latency_ms = capture.latency_ms;
        interaction.model = capture.model;
        interaction.provider = capture.provider;
        interaction.error = capture.error;

        tracing::debug!(
            trace_id = %trace.metadata.trace_id,
            node_id = %interaction.node_id,
            step_index = interaction.step_index,
            latency_ms = interaction.latency_ms,
            "Captured model interaction"
        );
        Ok(trace.add_model_interaction(interaction))
    }

    /// Appends a tool interaction to the current trace.
    pub fn capture_tool_interaction(&self, capture: ToolCapture) -> Result<String, CaptureError> {
        let mut guard = self.lock()?;
        let trace = guard.as_mut().ok_or(CaptureError::NoActiveTrace)?;
        if !self.config.enabled {
            return Ok(String::new());
        }

        if let Some(id) = capture.tool_use_id.as_deref().filter(|id| !id.is_empty()) {
            let taken = trace
                .tool_interactions
                .iter()
                .any(|t| t.tool_use_id.as_deref() == Some(id));
            if taken {
                return Err(CaptureError::DuplicateCorrelationId(id.to_string()));
            }
        }

        let mut interaction = ToolInteraction::new(capture.node_id, capture.tool_name, capture.tool_input);
        interaction.step_index = capture.step_index;
        interaction.tool_use_id = capture.tool_use_id;
        interaction.result_content = capture
            .result_content
            .unwrap_or_else(|| capture.result.render());
        interaction.result = capture.result;
        interaction.is_error = capture.is_error;
        interaction.latency_ms = capture.latency_ms;

        tracing::debug!(
            trace_id = %trace.metadata.trace_id,
            node_id = %interaction.node_id,
            tool = %interaction.tool_name,
            is_error = interaction.is_error,
            "Captured tool interaction"
        );
        Ok(trace.add_tool_interaction(interaction))
    }

    /// Appends a node boundary snapshot and refreshes the node count.
    pub fn capture_node_boundary(&self, capture: BoundaryCapture) -> Result<String, CaptureError> {
        let mut guard = self.lock()?;
        let trace = guard.as_mut().ok_or(CaptureError::NoActiveTrace)?;
        if !self.config.enabled {
            return Ok(String::new());
        }

        let mut boundary = NodeBoundary::new(capture.node_id, capture.kind);
        boundary.node_name = capture.node_name;
        boundary.node_type = capture.node_type;
        boundary.memory_snapshot = self.config.shape_memory(capture.memory_snapshot);
        boundary.input_data = self.config.shape_io(capture.input_data);
        boundary.output_data = self.config.shape_io(capture.output_data);
        boundary.success = capture.success;
        boundary.error = capture.error;
        boundary.tokens_used = capture.tokens_used;
        boundary.latency_ms = capture.latency_ms;
        boundary.attempt = capture.attempt;
        boundary.verdict = capture.verdict;

        Ok(trace.add_node_boundary(boundary))
    }

    /// Finalizes the current trace and detaches it.
    pub fn finalize_trace(&self, status: TraceStatus) -> Result<ExecutionTrace, CaptureError> {
        let mut guard = self.lock()?;
        let mut trace = guard.take().ok_or(CaptureError::NoActiveTrace)?;
        trace.finalize(status);

        tracing::info!(
            trace_id = %trace.metadata.trace_id,
            status = trace.metadata.status.as_str(),
            model_interactions = trace.model_interactions.len(),
            tool_interactions = trace.tool_interactions.len(),
            node_count = trace.metadata.node_count,
            total_tokens = trace.metadata.total_tokens,
            "Finalized trace"
        );
        Ok(trace)
    }

    /// Flags the current trace as needing attention.
    pub fn flag_attention(&self) -> Result<(), CaptureError> {
        let mut guard = self.lock()?;
        let trace = guard.as_mut().ok_or(CaptureError::NoActiveTrace)?;
        trace.metadata.needs_attention = true;
        Ok(())
    }

    /// Snapshot of the current trace without finalizing it.
    pub fn current_trace(&self) -> Option<ExecutionTrace> {
        let Ok(guard) = self.current.lock() else {
            tracing::warn!("Failed to acquire capture lock");
            return None;
        };
        guard.clone()
    }

    pub fn current_trace_id(&self) -> Option<String> {
        let guard = self.current.lock().ok()?;
        guard.as_ref().map(|t| t.trace_id().to_string())
    }

    pub fn is_active(&self) -> bool {
        self.current
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_start_trace() {
        let capture = TraceCapture::new();
        let trace_id = capture
            .start_trace("run_123", "agent_456", None, vec!["nightly".into()])
            .unwrap();

        assert!(!trace_id.is_empty());
        let trace = capture.current_trace().unwrap();
        assert_eq!(trace.metadata.run_id, "run_123");
        assert_eq!(trace.metadata.agent_id, "agent_456");
        assert_eq!(trace.metadata.tags, vec!["nightly"]);
        assert_eq!(capture.current_trace_id().as_deref(), Some(trace_id.as_str()));
    }

    #[test]
    fn test_start_twice_without_finalize_fails() {
        let capture = TraceCapture::new();
        let first = capture.start_trace("r", "a", None, vec![]).unwrap();
        match capture.start_trace("r", "a", None, vec![]) {
            Err(CaptureError::AlreadyActive(id)) => assert_eq!(id, first),
            other => panic!("expected AlreadyActive, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_capture_without_trace_fails() {
        let capture = TraceCapture::new();
        let result = capture.capture_model_interaction(ModelCapture::new("n1", 0, vec![]));
        assert!(matches!(result, Err(CaptureError::NoActiveTrace)));

        let result = capture.capture_tool_interaction(ToolCapture::new("n1", 0, "t", json!({})));
        assert!(matches!(result, Err(CaptureError::NoActiveTrace)));

        let result = capture.capture_node_boundary(BoundaryCapture::new(
            "n1",
            "Node",
            "llm",
            BoundaryKind::Enter,
        ));
        assert!(matches!(result, Err(CaptureError::NoActiveTrace)));
        assert!(matches!(
            capture.finalize_trace(TraceStatus::Completed),
            Err(CaptureError::NoActiveTrace)
        ));
    }

    #[test]
    fn test_capture_and_finalize() {
        let capture = TraceCapture::new();
        capture.start_trace("run", "agent", Some("goal"), vec![]).unwrap();

        capture
            .capture_node_boundary(BoundaryCapture::new("n1", "Greeter", "llm", BoundaryKind::Enter))
            .unwrap();
        let id = capture
            .capture_model_interaction(
                ModelCapture::new("n1", 0, vec![Message::user("Hello")])
                    .response_content("Hi there!")
                    .usage(Usage::new(5, 3))
                    .latency_ms(120)
                    .model("gpt-4o", "openai"),
            )
            .unwrap();
        assert_eq!(id.len(), 8);
        capture
            .capture_tool_interaction(
                ToolCapture::new("n1", 1, "search", json!({"q": "rust"}))
                    .tool_use_id("toolu_1")
                    .result(json!({"hits": 3})),
            )
            .unwrap();
        capture
            .capture_node_boundary(
                BoundaryCapture::new("n1", "Greeter", "llm", BoundaryKind::Exit).verdict("ACCEPT"),
            )
            .unwrap();

        let trace = capture.finalize_trace(TraceStatus::Completed).unwrap();
        assert_eq!(trace.metadata.goal_id, "goal");
        assert_eq!(trace.metadata.total_tokens, 8);
        assert_eq!(trace.metadata.total_latency_ms, 120);
        assert_eq!(trace.metadata.node_count, 1);
        assert_eq!(trace.tool_interactions[0].result_content, r#"{"hits":3}"#);
        assert_eq!(trace.node_boundaries[1].verdict, "ACCEPT");

        assert!(!capture.is_active());
        let after = capture.capture_model_interaction(ModelCapture::new("n1", 2, vec![]));
        assert!(matches!(after, Err(CaptureError::NoActiveTrace)));
    }

    #[test]
    fn test_duplicate_correlation_id_rejected() {
        let capture = TraceCapture::new();
        capture.start_trace("r", "a", None, vec![]).unwrap();
        capture
            .capture_tool_interaction(ToolCapture::new("n1", 0, "t", json!({})).tool_use_id("c1"))
            .unwrap();
        let dup = capture
            .capture_tool_interaction(ToolCapture::new("n1", 1, "t", json!({})).tool_use_id("c1"));
        assert!(matches!(dup, Err(CaptureError::DuplicateCorrelationId(_))));

        // Calls without correlation ids never collide.
        capture
            .capture_tool_interaction(ToolCapture::new("n1", 2, "t", json!({})))
            .unwrap();
        capture
            .capture_tool_interaction(ToolCapture::new("n1", 3, "t", json!({})))
            .unwrap();
    }

    #[test]
    fn test_failed_tool_capture() {
        let capture = TraceCapture::new();
        capture.start_trace("r", "a", None, vec![]).unwrap();
        capture
            .capture_tool_interaction(ToolCapture::new("n1", 0, "fetch", json!({})).failed("timeout"))
            .unwrap();
        let trace = capture.finalize_trace(TraceStatus::Failed).unwrap();
        let tool = &trace.tool_interactions[0];
        assert!(tool.is_error);
        assert_eq!(tool.result_content, "timeout");
        assert!(tool.result.is_null());
    }

    #[test]
    fn test_boundary_payloads_follow_config() {
        let capture = TraceCapture::with_config(CaptureConfig::new().with_memory(false).with_max_payload_bytes(16));
        capture.start_trace("r", "a", None, vec![]).unwrap();

        let mut memory = Map::new();
        memory.insert("k".into(), json!("v"));
        let mut big = Map::new();
        big.insert("text".into(), json!("x".repeat(64)));

        capture
            .capture_node_boundary(
                BoundaryCapture::new("n1", "N", "llm", BoundaryKind::Enter)
                    .memory(memory)
                    .input(big),
            )
            .unwrap();

        let trace = capture.current_trace().unwrap();
        let boundary = &trace.node_boundaries[0];
        assert!(boundary.memory_snapshot.is_empty());
        assert_eq!(boundary.input_data["_truncated"], json!(true));
    }

    #[test]
    fn test_disabled_capture_records_nothing() {
        let capture = TraceCapture::with_config(CaptureConfig::disabled());
        capture.start_trace("r", "a", None, vec![]).unwrap();
        let id = capture
            .capture_model_interaction(ModelCapture::new("n1", 0, vec![Message::user("hi")]))
            .unwrap();
        assert!(id.is_empty());
        let trace = capture.finalize_trace(TraceStatus::Completed).unwrap();
        assert!(trace.model_interactions.is_empty());
    }

    #[test]
    fn test_parallel_nodes_share_one_capture() {
        let capture = Arc::new(TraceCapture::new());
        capture.start_trace("r", "a", None, vec![]).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let capture = Arc::clone(&capture);
                std::thread::spawn(move || {
                    capture
                        .capture_model_interaction(ModelCapture::new(
                            format!("n{}", i),
                            0,
                            vec![Message::user(format!("q{}", i))],
                        ))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let trace = capture.finalize_trace(TraceStatus::Completed).unwrap();
        assert_eq!(trace.model_interactions.len(), 8);
    }
}
