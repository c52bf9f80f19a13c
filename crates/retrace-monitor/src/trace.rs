//! Trace schema types.
//!
//! ```text
//! ExecutionTrace
//! ├── metadata: TraceMetadata
//! ├── model_interactions: Vec<ModelInteraction>
//! ├── tool_interactions: Vec<ToolInteraction>
//! └── node_boundaries: Vec<NodeBoundary>
//! ```

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use retrace_core::{ModelRequest, ModelResponse, ToolValue};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::fingerprint::{fingerprint_request, fingerprint_tool};

/// Lifecycle status of a trace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    /// Execution is still being captured.
    #[default]
    InProgress,
    /// Execution completed successfully.
    Completed,
    /// Execution failed with an error.
    Failed,
    /// Execution was cancelled or abandoned before finishing.
    Aborted,
}

impl TraceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceStatus::InProgress => "in_progress",
            TraceStatus::Completed => "completed",
            TraceStatus::Failed => "failed",
            TraceStatus::Aborted => "aborted",
        }
    }

    /// Parses a status string, returning `None` for unknown values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(TraceStatus::InProgress),
            "completed" => Some(TraceStatus::Completed),
            "failed" => Some(TraceStatus::Failed),
            "aborted" => Some(TraceStatus::Aborted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TraceStatus::InProgress)
    }
}

/// Kind of node boundary snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryKind {
    Enter,
    Exit,
    Error,
}

/// Identity and summary of one traced execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceMetadata {
    pub trace_id: String,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub goal_id: String,
    /// Unix timestamp (milliseconds) when capture started.
    pub started_at: i64,
    /// Unix timestamp (milliseconds) when the trace was finalized.
    #[serde(default)]
    pub completed_at: Option<i64>,
    #[serde(default)]
    pub status: TraceStatus,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub total_latency_ms: u64,
    /// Number of node-enter boundaries.
    #[serde(default)]
    pub node_count: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    /// The run was flagged for attention (escalated or judged a failure).
    #[serde(default)]
    pub needs_attention: bool,
}

impl TraceMetadata {
    pub fn new(
        run_id: impl Into<String>,
        agent_id: impl Into<String>,
        goal_id: impl Into<String>,
    ) -> Self {
        Self {
            trace_id: new_id(16),
            run_id: run_id.into(),
            agent_id: agent_id.into(),
            goal_id: goal_id.into(),
            started_at: now_ms(),
            completed_at: None,
            status: TraceStatus::InProgress,
            total_tokens: 0,
            total_latency_ms: 0,
            node_count: 0,
            tags: Vec::new(),
            needs_attention: false,
        }
    }
}

/// One request/response pair with a model service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInteraction {
    pub interaction_id: String,
    pub timestamp: i64,
    /// Position in capture order across all interactions and boundaries.
    #[serde(default)]
    pub sequence: u64,
    pub node_id: String,
    /// Orders interactions within a node.
    #[serde(default)]
    pub step_index: u32,
    pub request: ModelRequest,
    #[serde(default)]
    pub response: ModelResponse,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl ModelInteraction {
    pub fn new(node_id: impl Into<String>, step_index: u32, request: ModelRequest) -> Self {
        Self {
            interaction_id: new_id(8),
            timestamp: now_ms(),
            sequence: 0,
            node_id: node_id.into(),
            step_index,
            request,
            response: ModelResponse::default(),
            latency_ms: 0,
            model: String::new(),
            provider: String::new(),
            error: None,
        }
    }

    /// Stub-map key for this interaction's request.
    pub fn fingerprint(&self) -> String {
        fingerprint_request(&self.request)
    }
}

/// One tool invocation and its result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInteraction {
    pub interaction_id: String,
    pub timestamp: i64,
    #[serde(default)]
    pub sequence: u64,
    pub node_id: String,
    #[serde(default)]
    pub step_index: u32,
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
    /// Correlation id linking back to the model call that requested the tool.
    #[serde(default)]
    pub tool_use_id: Option<String>,
    #[serde(default)]
    pub result: ToolValue,
    #[serde(default)]
    pub result_content: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub latency_ms: u64,
}

impl ToolInteraction {
    pub fn new(node_id: impl Into<String>, tool_name: impl Into<String>, tool_input: Value) -> Self {
        Self {
            interaction_id: new_id(8),
            timestamp: now_ms(),
            sequence: 0,
            node_id: node_id.into(),
            step_index: 0,
            tool_name: tool_name.into(),
            tool_input,
            tool_use_id: None,
            result: ToolValue::Null,
            result_content: String::new(),
            is_error: false,
            latency_ms: 0,
        }
    }

    /// Replay lookup key: the correlation id, else a content hash of name and input.
    pub fn replay_key(&self) -> String {
        match self.tool_use_id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => fingerprint_tool(&self.tool_name, &self.tool_input),
        }
    }
}

/// Snapshot at entry, exit, or error of one workflow node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeBoundary {
    pub boundary_id: String,
    pub timestamp: i64,
    #[serde(default)]
    pub sequence: u64,
    pub node_id: String,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub node_type: String,
    pub kind: BoundaryKind,
    #[serde(default)]
    pub memory_snapshot: Map<String, Value>,
    #[serde(default)]
    pub input_data: Map<String, Value>,
    #[serde(default)]
    pub output_data: Map<String, Value>,
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    /// Judge verdict for gated nodes (ACCEPT, RETRY, ESCALATE).
    #[serde(default)]
    pub verdict: String,
}

fn default_true() -> bool {
    true
}

fn default_attempt() -> u32 {
    1
}

impl NodeBoundary {
    pub fn new(node_id: impl Into<String>, kind: BoundaryKind) -> Self {
        Self {
            boundary_id: new_id(8),
            timestamp: now_ms(),
            sequence: 0,
            node_id: node_id.into(),
            node_name: String::new(),
            node_type: String::new(),
            kind,
            memory_snapshot: Map::new(),
            input_data: Map::new(),
            output_data: Map::new(),
            success: true,
            error: None,
            tokens_used: 0,
            latency_ms: 0,
            attempt: 1,
            verdict: String::new(),
        }
    }
}

/// The complete recorded interaction history of one workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub metadata: TraceMetadata,
    #[serde(default)]
    pub model_interactions: Vec<ModelInteraction>,
    #[serde(default)]
    pub tool_interactions: Vec<ToolInteraction>,
    #[serde(default)]
    pub node_boundaries: Vec<NodeBoundary>,
}

impl ExecutionTrace {
    pub fn new(
        run_id: impl Into<String>,
        agent_id: impl Into<String>,
        goal_id: impl Into<String>,
    ) -> Self {
        Self::from_metadata(TraceMetadata::new(run_id, agent_id, goal_id))
    }

    pub fn from_metadata(metadata: TraceMetadata) -> Self {
        Self {
            metadata,
            model_interactions: Vec::new(),
            tool_interactions: Vec::new(),
            node_boundaries: Vec::new(),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.metadata.trace_id
    }

    fn next_sequence(&self) -> u64 {
        (self.model_interactions.len() + self.tool_interactions.len() + self.node_boundaries.len()) as u64 + 1
    }

    pub fn add_model_interaction(&mut self, mut interaction: ModelInteraction) -> String {
        interaction.sequence = self.next_sequence();
        let id = interaction.interaction_id.clone();
        self.model_interactions.push(interaction);
        id
    }

    pub fn add_tool_interaction(&mut self, mut interaction: ToolInteraction) -> String {
        interaction.sequence = self.next_sequence();
        let id = interaction.interaction_id.clone();
        self.tool_interactions.push(interaction);
        id
    }

    pub fn add_node_boundary(&mut self, mut boundary: NodeBoundary) -> String {
        boundary.sequence = self.next_sequence();
        let id = boundary.boundary_id.clone();
        self.node_boundaries.push(boundary);
        self.metadata.node_count = self
            .node_boundaries
            .iter()
            .filter(|b| b.kind == BoundaryKind::Enter)
            .count() as u32;
        id
    }

    pub fn is_finalized(&self) -> bool {
        self.metadata.status.is_terminal()
    }

    /// Stamps completion, rolls up totals and fixes the terminal status.
    ///
    /// Returns false without touching anything when already finalized.
    /// `InProgress` is not a terminal status and is treated as `Completed`.
    pub fn finalize(&mut self, status: TraceStatus) -> bool {
        if self.is_finalized() {
            tracing::warn!(
                trace_id = %self.metadata.trace_id,
                status = self.metadata.status.as_str(),
                "Trace already finalized"
            );
            return false;
        }

        let status = match status {
            TraceStatus::InProgress => TraceStatus::Completed,
            s => s,
        };

        self.metadata.completed_at = Some(now_ms());
        self.metadata.status = status;
        self.metadata.total_tokens = self
            .model_interactions
            .iter()
            .map(|i| i.response.usage.total())
            .sum();
        self.metadata.total_latency_ms = self.model_interactions.iter().map(|i| i.latency_ms).sum();
        true
    }

    /// Recorded model interactions grouped by request fingerprint, in recording order.
    pub fn model_stub_map(&self) -> BTreeMap<String, Vec<&ModelInteraction>> {
        let mut map: BTreeMap<String, Vec<&ModelInteraction>> = BTreeMap::new();
        for interaction in &self.model_interactions {
            map.entry(interaction.fingerprint()).or_default().push(interaction);
        }
        map
    }

    /// Recorded tool interactions keyed by replay key. Later records win.
    pub fn tool_stub_map(&self) -> BTreeMap<String, &ToolInteraction> {
        self.tool_interactions
            .iter()
            .map(|i| (i.replay_key(), i))
            .collect()
    }

    /// Node ids in the order they were entered.
    pub fn node_path(&self) -> Vec<String> {
        self.node_boundaries
            .iter()
            .filter(|b| b.kind == BoundaryKind::Enter)
            .map(|b| b.node_id.clone())
            .collect()
    }

    /// Working memory at the first node entry, input data overlaid by the snapshot.
    pub fn initial_memory(&self) -> Map<String, Value> {
        let Some(first) = self
            .node_boundaries
            .iter()
            .find(|b| b.kind == BoundaryKind::Enter)
        else {
            return Map::new();
        };

        let mut memory = first.input_data.clone();
        for (key, value) in &first.memory_snapshot {
            memory.insert(key.clone(), value.clone());
        }
        memory
    }
}

/// Query parameters for listing traces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceQuery {
    /// Filter by agent ID.
    pub agent_id: Option<String>,
    /// Filter by run ID.
    pub run_id: Option<String>,
    /// Filter by status.
    pub status: Option<TraceStatus>,
    /// Maximum number of traces to return (default 100).
    pub limit: Option<usize>,
}

impl TraceQuery {
    pub const DEFAULT_LIMIT: usize = 100;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn status(mut self, status: TraceStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT)
    }

    /// Equality filters; empty strings match everything.
    pub fn matches(&self, metadata: &TraceMetadata) -> bool {
        let field_matches = |want: &Option<String>, have: &str| match want.as_deref() {
            Some(w) if !w.is_empty() => w == have,
            _ => true,
        };

        field_matches(&self.agent_id, &metadata.agent_id)
            && field_matches(&self.run_id, &metadata.run_id)
            && self.status.map_or(true, |s| s == metadata.status)
    }
}

/// Milliseconds since the Unix epoch; 0 if the clock is before it.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A random hex id of at most `len` characters.
pub fn new_id(len: usize) -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(len);
    id
}
