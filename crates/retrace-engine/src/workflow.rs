//! The seam between the replay engine and the executor being replayed.

use std::sync::Arc;

use async_trait::async_trait;
use retrace_core::{AgentError, CallContext, ModelClient, ModelRequest, ToolExecutor, ToolRequest};
use retrace_monitor::{BoundaryCapture, BoundaryKind, ExecutionTrace, TraceCapture, TraceStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Collaborators handed to a workflow during replay.
#[derive(Clone)]
pub struct ReplayContext {
    pub model: Arc<dyn ModelClient>,
    pub tools: Arc<dyn ToolExecutor>,
    /// Present when the replay itself is being recorded.
    pub capture: Option<Arc<TraceCapture>>,
}

impl ReplayContext {
    pub fn new(model: Arc<dyn ModelClient>, tools: Arc<dyn ToolExecutor>) -> Self {
        Self {
            model,
            tools,
            capture: None,
        }
    }

    pub fn with_capture(mut self, capture: Arc<TraceCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Records a node boundary when the replay is being captured.
    pub fn boundary(&self, boundary: BoundaryCapture) {
        let Some(capture) = &self.capture else {
            return;
        };
        if let Err(e) = capture.capture_node_boundary(boundary) {
            tracing::warn!(error = %e, "Failed to record replay boundary");
        }
    }
}

/// How a workflow run ended.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowOutcome {
    pub success: bool,
    /// Node ids in the order they were entered.
    pub path: Vec<String>,
    #[serde(default)]
    pub output: Value,
}

/// An executor that can be driven against replay collaborators.
#[async_trait]
pub trait Workflow: Send + Sync {
    async fn run(
        &self,
        input: Map<String, Value>,
        ctx: &ReplayContext,
    ) -> Result<WorkflowOutcome, AgentError>;
}

/// Rewrites each model request before it is issued.
pub type RequestTransform = Arc<dyn Fn(ModelRequest) -> ModelRequest + Send + Sync>;

#[derive(Debug, Clone)]
enum Step {
    Enter {
        node_id: String,
        node_name: String,
        node_type: String,
    },
    Model {
        ctx: CallContext,
        request: ModelRequest,
        expect_error: bool,
    },
    Tool {
        ctx: CallContext,
        request: ToolRequest,
        expect_error: bool,
    },
}

/// Re-issues a trace's own requests in recorded order.
///
/// Stands in for the real executor when none is available; a transform lets a
/// candidate configuration alter the requests it sends.
#[derive(Clone)]
pub struct RecordedWorkflow {
    steps: Vec<Step>,
    success: bool,
    transform: Option<RequestTransform>,
}

impl RecordedWorkflow {
    pub fn from_trace(trace: &ExecutionTrace) -> Self {
        // (timestamp, capture sequence, kind order, step); traces written before
        // sequences existed carry 0 and fall back to kind order.
        let mut ordered: Vec<(i64, u64, u8, Step)> = Vec::new();

        for boundary in &trace.node_boundaries {
            if boundary.kind == BoundaryKind::Enter {
                ordered.push((
                    boundary.timestamp,
                    boundary.sequence,
                    0,
                    Step::Enter {
                        node_id: boundary.node_id.clone(),
                        node_name: boundary.node_name.clone(),
                        node_type: boundary.node_type.clone(),
                    },
                ));
            }
        }
        for interaction in &trace.model_interactions {
            ordered.push((
                interaction.timestamp,
                interaction.sequence,
                1,
                Step::Model {
                    ctx: CallContext::new(interaction.node_id.clone(), interaction.step_index),
                    request: interaction.request.clone(),
                    expect_error: interaction.error.is_some(),
                },
            ));
        }
        for interaction in &trace.tool_interactions {
            let mut request = ToolRequest::new(interaction.tool_name.clone(), interaction.tool_input.clone());
            request.tool_use_id = interaction.tool_use_id.clone();
            ordered.push((
                interaction.timestamp,
                interaction.sequence,
                2,
                Step::Tool {
                    ctx: CallContext::new(interaction.node_id.clone(), interaction.step_index),
                    request,
                    expect_error: interaction.is_error,
                },
            ));
        }
        ordered.sort_by_key(|(ts, seq, kind, _)| (*ts, *seq, *kind));

        Self {
            steps: ordered.into_iter().map(|(_, _, _, step)| step).collect(),
            success: trace.metadata.status == TraceStatus::Completed,
            transform: None,
        }
    }

    pub fn with_transform(mut self, transform: RequestTransform) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }
}

#[async_trait]
impl Workflow for RecordedWorkflow {
    async fn run(
        &self,
        _input: Map<String, Value>,
        ctx: &ReplayContext,
    ) -> Result<WorkflowOutcome, AgentError> {
        let mut path = Vec::new();
        let mut output = Value::Null;

        for step in &self.steps {
            match step {
                Step::Enter {
                    node_id,
                    node_name,
                    node_type,
                } => {
                    path.push(node_id.clone());
                    ctx.boundary(BoundaryCapture::new(
                        node_id.clone(),
                        node_name.clone(),
                        node_type.clone(),
                        BoundaryKind::Enter,
                    ));
                }
                Step::Model {
                    ctx: call,
                    request,
                    expect_error,
                } => {
                    let request = match &self.transform {
                        Some(transform) => transform(request.clone()),
                        None => request.clone(),
                    };
                    match ctx.model.complete(call, &request).await {
                        Ok(response) => output = Value::String(response.content),
                        Err(e) if *expect_error && !e.is_divergence() => {}
                        Err(e) => return Err(e),
                    }
                }
                Step::Tool {
                    ctx: call,
                    request,
                    expect_error,
                } => match ctx.tools.execute(call, request).await {
                    Ok(_) => {}
                    Err(e) if *expect_error && !e.is_divergence() => {}
                    Err(e) => return Err(e),
                },
            }
        }

        Ok(WorkflowOutcome {
            success: self.success,
            path,
            output,
        })
    }
}
