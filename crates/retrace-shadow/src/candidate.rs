//! Configurations that can be shadow-tested against recorded traces.

use std::sync::Arc;

use retrace_core::ModelRequest;
use retrace_engine::{RecordedWorkflow, RequestTransform, Workflow};
use retrace_monitor::{new_id, ExecutionTrace};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Something that can be replayed against a recorded trace.
pub trait ReplayTarget: Send + Sync {
    /// Identifier reported in shadow results.
    fn id(&self) -> &str;

    /// The workflow to drive for `trace`.
    fn workflow_for(&self, trace: &ExecutionTrace) -> Arc<dyn Workflow>;

    /// Experiment arm this target belongs to, copied onto its results.
    fn variant_id(&self) -> Option<&str> {
        None
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    #[default]
    Candidate,
    Approved,
    Deployed,
    Rejected,
}

/// An agent configuration expressed as overrides on the recorded requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateConfig {
    #[serde(default = "new_config_id")]
    pub config_id: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub status: CandidateStatus,
    /// Replaces the system instruction of every model request.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Merged into the generation parameters of every model request.
    #[serde(default)]
    pub config_overrides: Map<String, Value>,
    /// A/B arm this candidate is tested under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<String>,
}

fn new_config_id() -> String {
    new_id(12)
}

fn default_version() -> u32 {
    1
}

impl CandidateConfig {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            config_id: new_config_id(),
            agent_id: agent_id.into(),
            version: 1,
            parent_id: None,
            status: CandidateStatus::Candidate,
            system_prompt: None,
            config_overrides: Map::new(),
            variant_id: None,
        }
    }

    pub fn with_id(mut self, config_id: impl Into<String>) -> Self {
        self.config_id = config_id.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_variant(mut self, variant_id: impl Into<String>) -> Self {
        self.variant_id = Some(variant_id.into());
        self
    }

    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config_overrides.insert(key.into(), value.into());
        self
    }

    /// True when the candidate leaves recorded requests untouched.
    pub fn is_passthrough(&self) -> bool {
        self.system_prompt.is_none() && self.config_overrides.is_empty()
    }

    /// A new candidate derived from this one.
    pub fn clone_as_child(&self) -> Self {
        Self {
            config_id: new_config_id(),
            agent_id: self.agent_id.clone(),
            version: self.version + 1,
            parent_id: Some(self.config_id.clone()),
            status: CandidateStatus::Candidate,
            system_prompt: self.system_prompt.clone(),
            config_overrides: self.config_overrides.clone(),
            variant_id: self.variant_id.clone(),
        }
    }

    /// Applies the overrides to one request.
    pub fn apply(&self, mut request: ModelRequest) -> ModelRequest {
        if let Some(prompt) = &self.system_prompt {
            request.system = prompt.clone();
        }
        for (key, value) in &self.config_overrides {
            request.config.insert(key.clone(), value.clone());
        }
        request
    }
}

impl ReplayTarget for CandidateConfig {
    fn id(&self) -> &str {
        &self.config_id
    }

    fn variant_id(&self) -> Option<&str> {
        self.variant_id.as_deref()
    }

    fn workflow_for(&self, trace: &ExecutionTrace) -> Arc<dyn Workflow> {
        let workflow = RecordedWorkflow::from_trace(trace);
        if self.is_passthrough() {
            return Arc::new(workflow);
        }
        let candidate = self.clone();
        let transform: RequestTransform = Arc::new(move |request: ModelRequest| candidate.apply(request));
        Arc::new(workflow.with_transform(transform))
    }
}

/// Replays every trace through one fixed workflow.
pub struct WorkflowTarget {
    id: String,
    workflow: Arc<dyn Workflow>,
}

impl WorkflowTarget {
    pub fn new(id: impl Into<String>, workflow: Arc<dyn Workflow>) -> Self {
        Self {
            id: id.into(),
            workflow,
        }
    }
}

impl ReplayTarget for WorkflowTarget {
    fn id(&self) -> &str {
        &self.id
    }

    fn workflow_for(&self, _trace: &ExecutionTrace) -> Arc<dyn Workflow> {
        Arc::clone(&self.workflow)
    }
}
