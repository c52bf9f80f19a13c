//! Model and tool clients that record every call into a [`TraceCapture`].

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use retrace_core::{
    AgentError, CallContext, ModelClient, ModelRequest, ModelResponse, ToolExecutor, ToolRequest,
    ToolValue,
};

use crate::collector::{ModelCapture, ToolCapture, TraceCapture};

/// Wraps a [`ModelClient`], recording each request and its response or error.
pub struct TracedModel<M> {
    inner: M,
    capture: Arc<TraceCapture>,
}

impl<M: ModelClient> TracedModel<M> {
    pub fn new(inner: M, capture: Arc<TraceCapture>) -> Self {
        Self { inner, capture }
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }
}

#[async_trait]
impl<M: ModelClient> ModelClient for TracedModel<M> {
    async fn complete(
        &self,
        ctx: &CallContext,
        request: &ModelRequest,
    ) -> Result<ModelResponse, AgentError> {
        let start = Instant::now();
        let result = self.inner.complete(ctx, request).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let capture = ModelCapture::from_request(ctx.node_id.clone(), ctx.step_index, request.clone())
            .model(self.inner.model_name(), self.inner.provider_name())
            .latency_ms(latency_ms);
        let capture = match &result {
            Ok(response) => capture.response(response.clone()),
            Err(e) => capture.error(e.to_string()),
        };

        self.capture
            .capture_model_interaction(capture)
            .map_err(|e| AgentError::Capture(e.to_string()))?;
        result
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn provider_name(&self) -> &str {
        self.inner.provider_name()
    }
}

/// Wraps a [`ToolExecutor`], recording each invocation and its result.
pub struct TracedTools<T> {
    inner: T,
    capture: Arc<TraceCapture>,
}

impl<T: ToolExecutor> TracedTools<T> {
    pub fn new(inner: T, capture: Arc<TraceCapture>) -> Self {
        Self { inner, capture }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: ToolExecutor> ToolExecutor for TracedTools<T> {
    async fn execute(
        &self,
        ctx: &CallContext,
        request: &ToolRequest,
    ) -> Result<ToolValue, AgentError> {
        let start = Instant::now();
        let result = self.inner.execute(ctx, request).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let mut capture = ToolCapture::new(
            ctx.node_id.clone(),
            ctx.step_index,
            request.tool_name.clone(),
            request.input.clone(),
        )
        .latency_ms(latency_ms);
        if let Some(id) = &request.tool_use_id {
            capture = capture.tool_use_id(id.clone());
        }
        let capture = match &result {
            Ok(value) => capture.result(value.clone()),
            Err(e) => capture.failed(e.to_string()),
        };

        self.capture
            .capture_tool_interaction(capture)
            .map_err(|e| AgentError::Capture(e.to_string()))?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::TraceStatus;
    use retrace_core::{Message, Usage};
    use serde_json::json;

    struct EchoModel;

    #[async_trait]
    impl ModelClient for EchoModel {
        async fn complete(
            &self,
            _ctx: &CallContext,
            request: &ModelRequest,
        ) -> Result<ModelResponse, AgentError> {
            let last = request.messages.last().map(|m| m.content.clone());
            match last.as_deref() {
                Some("fail") => Err(AgentError::Llm("rate limited".into())),
                Some(text) => Ok(ModelResponse::text(format!("echo: {}", text)).with_usage(Usage::new(4, 2))),
                None => Ok(ModelResponse::default()),
            }
        }

        fn model_name(&self) -> &str {
            "echo-1"
        }

        fn provider_name(&self) -> &str {
            "local"
        }
    }

    struct UpperTool;

    #[async_trait]
    impl ToolExecutor for UpperTool {
        async fn execute(
            &self,
            _ctx: &CallContext,
            request: &ToolRequest,
        ) -> Result<ToolValue, AgentError> {
            match request.input.get("text").and_then(|v| v.as_str()) {
                Some(text) => Ok(ToolValue::from(text.to_uppercase())),
                None => Err(AgentError::Tool("missing text".into())),
            }
        }
    }

    #[tokio::test]
    async fn test_traced_model_records_calls() {
        let capture = Arc::new(TraceCapture::new());
        capture.start_trace("run", "agent", None, vec![]).unwrap();
        let model = TracedModel::new(EchoModel, Arc::clone(&capture));
        let ctx = CallContext::new("n1", 0);

        let ok = model
            .complete(&ctx, &ModelRequest::new(vec![Message::user("hi")]))
            .await
            .unwrap();
        assert_eq!(ok.content, "echo: hi");

        let err = model
            .complete(&CallContext::new("n1", 1), &ModelRequest::new(vec![Message::user("fail")]))
            .await
            .unwrap_err();
        assert_eq!(err, AgentError::Llm("rate limited".into()));

        let trace = capture.finalize_trace(TraceStatus::Completed).unwrap();
        assert_eq!(trace.model_interactions.len(), 2);
        assert_eq!(trace.model_interactions[0].model, "echo-1");
        assert_eq!(trace.model_interactions[0].response.content, "echo: hi");
        assert!(trace.model_interactions[1].error.is_some());
        assert_eq!(trace.metadata.total_tokens, 6);
    }

    #[tokio::test]
    async fn test_traced_tools_records_calls() {
        let capture = Arc::new(TraceCapture::new());
        capture.start_trace("run", "agent", None, vec![]).unwrap();
        let tools = TracedTools::new(UpperTool, Arc::clone(&capture));
        let ctx = CallContext::new("n1", 0);

        let value = tools
            .execute(
                &ctx,
                &ToolRequest::new("upper", json!({"text": "abc"})).with_tool_use_id("c1"),
            )
            .await
            .unwrap();
        assert_eq!(value, ToolValue::from("ABC"));
        assert!(tools
            .execute(&ctx, &ToolRequest::new("upper", json!({})))
            .await
            .is_err());

        let trace = capture.current_trace().unwrap();
        assert_eq!(trace.tool_interactions[0].tool_use_id.as_deref(), Some("c1"));
        assert_eq!(trace.tool_interactions[0].result_content, "ABC");
        assert!(trace.tool_interactions[1].is_error);
    }

    #[tokio::test]
    async fn test_capture_failure_surfaces_as_agent_error() {
        let capture = Arc::new(TraceCapture::new());
        let model = TracedModel::new(EchoModel, capture);
        let err = model
            .complete(&CallContext::new("n1", 0), &ModelRequest::new(vec![Message::user("hi")]))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Capture(_)));
    }
}
