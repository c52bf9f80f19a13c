//! Drives a workflow against a recorded trace and reports divergence.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use retrace_core::{ModelClient, ToolExecutor};
use retrace_monitor::{
    ExecutionTrace, TraceCapture, TraceMetadata, TraceStatus, TracedModel, TracedTools,
};
use serde::{Deserialize, Serialize};

use crate::stub::{DeterministicStub, Divergence, DivergenceKind, MissPolicy};
use crate::workflow::{RecordedWorkflow, ReplayContext, Workflow};

/// Tag carried by every trace recorded during a replay.
pub const REPLAY_TAG: &str = "replay";

const REPLAY_OF_PREFIX: &str = "replay_of:";

/// True for traces captured while replaying another trace.
pub fn is_replay_trace(metadata: &TraceMetadata) -> bool {
    metadata.tags.iter().any(|t| t == REPLAY_TAG)
}

/// Knobs for a single replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplaySettings {
    #[serde(default)]
    pub miss_policy: MissPolicy,
    /// Compare the replayed node path against the recorded one.
    #[serde(default = "default_true")]
    pub compare_paths: bool,
    /// Record only the first path mismatch.
    #[serde(default)]
    pub stop_on_mismatch: bool,
    /// Capture the replay itself into a new trace.
    #[serde(default)]
    pub record_replay: bool,
    /// Abort once this many divergences are recorded; later ones are dropped.
    #[serde(default)]
    pub max_divergence_depth: Option<usize>,
}

fn default_true() -> bool {
    true
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            miss_policy: MissPolicy::Abort,
            compare_paths: true,
            stop_on_mismatch: false,
            record_replay: false,
            max_divergence_depth: None,
        }
    }
}

impl ReplaySettings {
    pub fn with_miss_policy(mut self, policy: MissPolicy) -> Self {
        self.miss_policy = policy;
        self
    }

    pub fn with_compare_paths(mut self, enabled: bool) -> Self {
        self.compare_paths = enabled;
        self
    }

    pub fn with_stop_on_mismatch(mut self, enabled: bool) -> Self {
        self.stop_on_mismatch = enabled;
        self
    }

    pub fn with_record_replay(mut self, enabled: bool) -> Self {
        self.record_replay = enabled;
        self
    }

    pub fn with_max_divergence_depth(mut self, depth: usize) -> Self {
        self.max_divergence_depth = Some(depth);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayState {
    Loaded,
    Running,
    Completed,
    Errored,
}

/// Outcome of replaying one trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayResult {
    /// Reached the recorded terminal status without being aborted.
    pub success: bool,
    pub diverged: bool,
    pub divergence_point: Option<String>,
    pub divergence_reason: Option<String>,
    pub divergences: Vec<Divergence>,
    pub original_trace_id: String,
    pub replay_trace_id: Option<String>,
    pub original_status: TraceStatus,
    pub replay_status: TraceStatus,
    pub original_node_count: u32,
    pub replay_node_count: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_trace: Option<ExecutionTrace>,
}

impl ReplayResult {
    /// A result for a replay that never got to run.
    pub fn failed(original_trace_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            success: false,
            diverged: true,
            divergence_point: None,
            divergence_reason: Some(reason.clone()),
            divergences: vec![Divergence {
                kind: DivergenceKind::Error,
                node_id: String::new(),
                step_index: 0,
                key: String::new(),
                reason,
            }],
            original_trace_id: original_trace_id.into(),
            replay_trace_id: None,
            original_status: TraceStatus::InProgress,
            replay_status: TraceStatus::Aborted,
            original_node_count: 0,
            replay_node_count: 0,
            duration_ms: 0,
            replay_trace: None,
        }
    }

    /// Fills in what is known about the recording when the replay did not finish.
    pub fn with_original(mut self, trace: &ExecutionTrace) -> Self {
        self.original_status = trace.metadata.status;
        self.original_node_count = trace.metadata.node_count;
        self
    }
}

/// Replays one recorded trace.
pub struct ReplayEngine {
    trace: ExecutionTrace,
    settings: ReplaySettings,
    stub: Arc<DeterministicStub>,
    state: ReplayState,
}

impl ReplayEngine {
    pub fn new(trace: ExecutionTrace, settings: ReplaySettings) -> Self {
        let stub = build_stub(&trace, &settings);
        Self {
            trace,
            settings,
            stub,
            state: ReplayState::Loaded,
        }
    }

    pub fn state(&self) -> ReplayState {
        self.state
    }

    pub fn trace(&self) -> &ExecutionTrace {
        &self.trace
    }

    pub fn settings(&self) -> &ReplaySettings {
        &self.settings
    }

    pub fn stub(&self) -> &Arc<DeterministicStub> {
        &self.stub
    }

    /// Replays the trace's own requests through a [`RecordedWorkflow`].
    pub async fn replay_recorded(&mut self) -> ReplayResult {
        let workflow = RecordedWorkflow::from_trace(&self.trace);
        self.replay(&workflow).await
    }

    /// Runs `workflow` against the recorded responses.
    ///
    /// Never fails: workflow errors and panics become an errored, diverged result.
    pub async fn replay(&mut self, workflow: &dyn Workflow) -> ReplayResult {
        if self.state != ReplayState::Loaded {
            self.stub = build_stub(&self.trace, &self.settings);
        }
        self.state = ReplayState::Running;
        let start = Instant::now();
        let original_trace_id = self.trace.metadata.trace_id.clone();

        tracing::info!(trace_id = %original_trace_id, "Starting replay");

        let capture = self.settings.record_replay.then(|| Arc::new(TraceCapture::new()));
        let ctx = match &capture {
            Some(capture) => self.recording_context(capture),
            None => ReplayContext::new(self.stub.clone(), self.stub.clone()),
        };

        let input = self.trace.initial_memory();
        let run = AssertUnwindSafe(workflow.run(input, &ctx)).catch_unwind().await;

        let mut divergences = self.stub.divergences();
        let stub_diverged = !divergences.is_empty();
        let original_status = self.trace.metadata.status;
        let mut aborted = false;
        let mut panicked = false;
        let mut error_reason = None;

        let (replay_status, outcome) = match run {
            Ok(Ok(outcome)) => {
                self.state = ReplayState::Completed;
                let status = if outcome.success {
                    TraceStatus::Completed
                } else {
                    TraceStatus::Failed
                };
                (status, Some(outcome))
            }
            Ok(Err(e)) => {
                self.state = ReplayState::Errored;
                aborted = stub_diverged;
                if !e.is_divergence() {
                    divergences.push(Divergence {
                        kind: DivergenceKind::Error,
                        node_id: String::new(),
                        step_index: 0,
                        key: String::new(),
                        reason: e.to_string(),
                    });
                }
                error_reason = Some(e.to_string());
                let status = if aborted {
                    TraceStatus::Aborted
                } else {
                    TraceStatus::Failed
                };
                (status, None)
            }
            Err(panic) => {
                self.state = ReplayState::Errored;
                panicked = true;
                let reason = format!("Workflow panicked: {}", panic_message(panic.as_ref()));
                divergences.push(Divergence {
                    kind: DivergenceKind::Error,
                    node_id: String::new(),
                    step_index: 0,
                    key: String::new(),
                    reason: reason.clone(),
                });
                error_reason = Some(reason);
                (TraceStatus::Aborted, None)
            }
        };

        if let (Some(outcome), true) = (&outcome, self.settings.compare_paths) {
            divergences.extend(compare_paths(
                &self.trace.node_path(),
                &outcome.path,
                self.settings.stop_on_mismatch,
            ));
        }
        if let Some(depth) = self.settings.max_divergence_depth {
            divergences.truncate(depth.max(1));
        }

        let replay_trace = capture.and_then(|c| match c.finalize_trace(replay_status) {
            Ok(trace) => Some(trace),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to finalize replay trace");
                None
            }
        });

        let replay_node_count = match (&outcome, &replay_trace) {
            (Some(outcome), _) => outcome.path.len() as u32,
            (None, Some(trace)) => trace.metadata.node_count,
            (None, None) => 0,
        };

        let first = divergences.first();
        let result = ReplayResult {
            success: !aborted && !panicked && replay_status == original_status,
            diverged: !divergences.is_empty(),
            divergence_point: first.map(|d| d.node_id.clone()).filter(|n| !n.is_empty()),
            divergence_reason: first.map(|d| d.reason.clone()).or(error_reason),
            original_trace_id,
            replay_trace_id: replay_trace.as_ref().map(|t| t.metadata.trace_id.clone()),
            original_status,
            replay_status,
            original_node_count: self.trace.metadata.node_count,
            replay_node_count,
            duration_ms: start.elapsed().as_millis() as u64,
            replay_trace,
            divergences,
        };

        tracing::info!(
            trace_id = %result.original_trace_id,
            success = result.success,
            diverged = result.diverged,
            divergences = result.divergences.len(),
            duration_ms = result.duration_ms,
            "Replay finished"
        );
        result
    }

    fn recording_context(&self, capture: &Arc<TraceCapture>) -> ReplayContext {
        let meta = &self.trace.metadata;
        let tags = vec![REPLAY_TAG.to_string(), format!("{}{}", REPLAY_OF_PREFIX, meta.trace_id)];
        let goal = (!meta.goal_id.is_empty()).then_some(meta.goal_id.as_str());
        if let Err(e) = capture.start_trace(&meta.run_id, &meta.agent_id, goal, tags) {
            tracing::warn!(error = %e, "Failed to start replay trace");
        }

        let model: Arc<dyn ModelClient> = Arc::new(TracedModel::new(self.stub.clone(), Arc::clone(capture)));
        let tools: Arc<dyn ToolExecutor> = Arc::new(TracedTools::new(self.stub.clone(), Arc::clone(capture)));
        ReplayContext::new(model, tools).with_capture(Arc::clone(capture))
    }
}

fn build_stub(trace: &ExecutionTrace, settings: &ReplaySettings) -> Arc<DeterministicStub> {
    Arc::new(
        DeterministicStub::from_trace(trace, settings.miss_policy)
            .with_max_divergences(settings.max_divergence_depth),
    )
}

/// Step-by-step comparison of the recorded and replayed node paths.
fn compare_paths(original: &[String], replayed: &[String], stop_on_mismatch: bool) -> Vec<Divergence> {
    let mut divergences = Vec::new();

    for (step, (expected, actual)) in original.iter().zip(replayed).enumerate() {
        if expected == actual {
            continue;
        }
        divergences.push(Divergence {
            kind: DivergenceKind::Path,
            node_id: expected.clone(),
            step_index: step as u32,
            key: String::new(),
            reason: format!(
                "Path mismatch at step {}: expected {}, got {}",
                step, expected, actual
            ),
        });
        if stop_on_mismatch {
            return divergences;
        }
    }

    if original.len() != replayed.len() {
        let step = original.len().min(replayed.len());
        let node_id = original
            .get(step)
            .or_else(|| replayed.get(step))
            .cloned()
            .unwrap_or_default();
        divergences.push(Divergence {
            kind: DivergenceKind::Path,
            node_id,
            step_index: step as u32,
            key: String::new(),
            reason: format!(
                "Path length mismatch: expected {} nodes, got {}",
                original.len(),
                replayed.len()
            ),
        });
    }

    divergences
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        return s.to_string();
    }
    if let Some(s) = panic.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic".to_string()
}
