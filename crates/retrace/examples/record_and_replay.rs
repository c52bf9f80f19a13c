//! Records a small tool-using workflow, then replays it from the trace.
//!
//! Run with: cargo run --example record_and_replay

use std::sync::Arc;

use async_trait::async_trait;
use retrace::prelude::*;
use serde_json::{json, Map, Value};

/// Answers weather questions with one lookup tool.
struct WeatherAgent;

#[async_trait]
impl Workflow for WeatherAgent {
    async fn run(
        &self,
        input: Map<String, Value>,
        ctx: &ReplayContext,
    ) -> Result<WorkflowOutcome, AgentError> {
        let question = input
            .get("question")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        ctx.boundary(BoundaryCapture::new("plan", "Plan", "llm", BoundaryKind::Enter).input(input.clone()));
        let plan = ctx
            .model
            .complete(
                &CallContext::new("plan", 0),
                &ModelRequest::new(vec![Message::user(question.clone())])
                    .with_system("Use the weather tool when asked about weather."),
            )
            .await?;

        let mut observations = Vec::new();
        for call in &plan.tool_calls {
            let value = ctx
                .tools
                .execute(&CallContext::new("plan", 1), &ToolRequest::from(call))
                .await?;
            observations.push(value.render());
        }

        ctx.boundary(BoundaryCapture::new("answer", "Answer", "llm", BoundaryKind::Enter));
        let answer = ctx
            .model
            .complete(
                &CallContext::new("answer", 0),
                &ModelRequest::new(vec![
                    Message::user(question),
                    Message::assistant(observations.join("\n")),
                ]),
            )
            .await?;

        Ok(WorkflowOutcome {
            success: true,
            path: vec!["plan".into(), "answer".into()],
            output: json!(answer.content),
        })
    }
}

/// Stands in for a hosted model.
struct ScriptedModel;

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn complete(
        &self,
        ctx: &CallContext,
        _request: &ModelRequest,
    ) -> Result<ModelResponse, AgentError> {
        let response = match ctx.node_id.as_str() {
            "plan" => ModelResponse::default().with_tool_call(ToolCall {
                id: "call-1".into(),
                name: "weather".into(),
                input: json!({"city": "Oslo"}),
            }),
            _ => ModelResponse::text("It is 4°C and raining in Oslo."),
        };
        Ok(response.with_usage(Usage::new(12, 8)))
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

struct WeatherTool;

#[async_trait]
impl ToolExecutor for WeatherTool {
    async fn execute(&self, _ctx: &CallContext, request: &ToolRequest) -> Result<ToolValue, AgentError> {
        Ok(ToolValue::Json(json!({"city": request.input["city"], "temp_c": 4, "sky": "rain"})))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dir = std::env::temp_dir().join("retrace-example");
    let store = Arc::new(TraceStore::new(dir)?);

    // Live run, recorded through the traced wrappers.
    let capture = Arc::new(TraceCapture::new());
    let scope = CaptureScope::begin(Arc::clone(&capture), "run-1", "weather-agent", None)?
        .with_store(Arc::clone(&store));
    let ctx = ReplayContext::new(
        Arc::new(TracedModel::new(ScriptedModel, Arc::clone(&capture))),
        Arc::new(TracedTools::new(WeatherTool, Arc::clone(&capture))),
    )
    .with_capture(Arc::clone(&capture));

    let mut input = Map::new();
    input.insert("question".into(), json!("What's the weather in Oslo?"));
    let outcome = WeatherAgent.run(input, &ctx).await?;
    let trace = scope.finish(TraceStatus::Completed)?;
    store.save(&trace)?;
    println!("recorded {} ({} tokens): {}", trace.trace_id(), trace.metadata.total_tokens, outcome.output);

    // Replay against the recording; no model or tool is called.
    let mut engine = ReplayEngine::new(trace, ReplaySettings::default());
    let result = engine.replay(&WeatherAgent).await;
    println!("replay success={} diverged={}", result.success, result.diverged);

    Ok(())
}
