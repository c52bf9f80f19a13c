//! Recorded responses served back to a replayed execution.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use retrace_core::{
    AgentError, CallContext, ModelClient, ModelRequest, ModelResponse, ToolExecutor, ToolRequest,
    ToolValue,
};
use retrace_monitor::{fingerprint_request, fingerprint_tool, ExecutionTrace};
use serde::{Deserialize, Serialize};

/// What a stub does when a call has no recorded counterpart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissPolicy {
    /// Fail the call with [`AgentError::ReplayDivergence`].
    #[default]
    Abort,
    /// Answer with an empty response and keep going.
    Substitute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceKind {
    Model,
    Tool,
    Path,
    Error,
}

/// A point where the replayed execution departed from the recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Divergence {
    pub kind: DivergenceKind,
    pub node_id: String,
    pub step_index: u32,
    /// Stub key that missed, empty for path and error divergences.
    #[serde(default)]
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
enum Reply {
    Response(ModelResponse),
    Failure(String),
}

#[derive(Debug, Default)]
struct ReplyQueue {
    replies: Vec<Reply>,
    next: usize,
}

impl ReplyQueue {
    /// Next reply in recording order; the last one repeats once exhausted.
    fn pop(&mut self) -> Option<Reply> {
        let reply = self
            .replies
            .get(self.next)
            .or_else(|| self.replies.last())
            .cloned();
        if self.next < self.replies.len() {
            self.next += 1;
        }
        reply
    }
}

#[derive(Debug, Clone)]
struct ToolReply {
    result: ToolValue,
    result_content: String,
    is_error: bool,
}

#[derive(Default)]
struct ToolStubs {
    /// Keyed by replay key: correlation id when recorded, else content hash.
    by_key: HashMap<String, ToolReply>,
    /// Keyed by content hash for every recorded call.
    by_content: HashMap<String, ToolReply>,
}

/// Answers model and tool calls from a recorded trace.
///
/// Built eagerly; lookups never touch storage.
pub struct DeterministicStub {
    policy: MissPolicy,
    model_name: String,
    provider_name: String,
    models: Mutex<HashMap<String, ReplyQueue>>,
    tools: Mutex<ToolStubs>,
    divergences: Mutex<Vec<Divergence>>,
    max_divergences: Option<usize>,
}

impl DeterministicStub {
    /// Creates a stub with no recorded responses.
    pub fn empty(policy: MissPolicy) -> Self {
        Self {
            policy,
            model_name: String::new(),
            provider_name: String::new(),
            models: Mutex::new(HashMap::new()),
            tools: Mutex::new(ToolStubs::default()),
            divergences: Mutex::new(Vec::new()),
            max_divergences: None,
        }
    }

    pub fn from_trace(trace: &ExecutionTrace, policy: MissPolicy) -> Self {
        let mut models: HashMap<String, ReplyQueue> = HashMap::new();
        for (fingerprint, interactions) in trace.model_stub_map() {
            let replies = interactions
                .into_iter()
                .map(|i| match &i.error {
                    Some(error) => Reply::Failure(error.clone()),
                    None => Reply::Response(i.response.clone()),
                })
                .collect();
            models.insert(fingerprint, ReplyQueue { replies, next: 0 });
        }

        let mut tools = ToolStubs::default();
        for interaction in &trace.tool_interactions {
            let reply = ToolReply {
                result: interaction.result.clone(),
                result_content: interaction.result_content.clone(),
                is_error: interaction.is_error,
            };
            tools.by_content.insert(
                fingerprint_tool(&interaction.tool_name, &interaction.tool_input),
                reply.clone(),
            );
            tools.by_key.insert(interaction.replay_key(), reply);
        }

        let (model_name, provider_name) = trace
            .model_interactions
            .first()
            .map(|i| (i.model.clone(), i.provider.clone()))
            .unwrap_or_default();

        tracing::debug!(
            trace_id = %trace.metadata.trace_id,
            model_stubs = models.len(),
            tool_stubs = tools.by_key.len(),
            "Built replay stubs"
        );

        Self {
            policy,
            model_name,
            provider_name,
            models: Mutex::new(models),
            tools: Mutex::new(tools),
            divergences: Mutex::new(Vec::new()),
            max_divergences: None,
        }
    }

    /// Stops recording after `limit` divergences and fails every later miss,
    /// whatever the policy.
    pub fn with_max_divergences(mut self, limit: Option<usize>) -> Self {
        self.max_divergences = limit.map(|n| n.max(1));
        self
    }

    pub fn policy(&self) -> MissPolicy {
        self.policy
    }

    /// Queues `response` for requests matching `request`.
    pub fn register_model_response(&self, request: &ModelRequest, response: ModelResponse) {
        let Ok(mut models) = self.models.lock() else {
            tracing::warn!("Failed to acquire model stub lock");
            return;
        };
        models
            .entry(fingerprint_request(request))
            .or_default()
            .replies
            .push(Reply::Response(response));
    }

    /// Stubs `value` for tool requests matching `request`.
    pub fn register_tool_response(&self, request: &ToolRequest, value: ToolValue) {
        let Ok(mut tools) = self.tools.lock() else {
            tracing::warn!("Failed to acquire tool stub lock");
            return;
        };
        let reply = ToolReply {
            result_content: value.render(),
            result: value,
            is_error: false,
        };
        tools
            .by_content
            .insert(fingerprint_tool(&request.tool_name, &request.input), reply.clone());
        tools.by_key.insert(tool_key(request), reply);
    }

    /// Number of distinct recorded model requests.
    pub fn model_stub_count(&self) -> usize {
        self.models.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn tool_stub_count(&self) -> usize {
        self.tools.lock().map(|t| t.by_key.len()).unwrap_or(0)
    }

    /// Divergences recorded so far, in the order they happened.
    pub fn divergences(&self) -> Vec<Divergence> {
        self.divergences
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    pub fn has_diverged(&self) -> bool {
        self.divergences.lock().map(|d| !d.is_empty()).unwrap_or(false)
    }

    /// Records a miss and reports whether the call must fail.
    fn record(&self, divergence: Divergence) -> bool {
        tracing::info!(
            kind = ?divergence.kind,
            node_id = %divergence.node_id,
            step_index = divergence.step_index,
            key = %divergence.key,
            "Replay diverged"
        );
        let recorded = match self.divergences.lock() {
            Ok(mut divergences) => {
                if self.max_divergences.map_or(true, |max| divergences.len() < max) {
                    divergences.push(divergence);
                }
                divergences.len()
            }
            Err(_) => 0,
        };
        let exhausted = self.max_divergences.is_some_and(|max| recorded >= max);
        if exhausted {
            tracing::warn!(divergences = recorded, "Divergence limit reached, aborting replay");
        }
        self.policy == MissPolicy::Abort || exhausted
    }
}

fn tool_key(request: &ToolRequest) -> String {
    match request.tool_use_id.as_deref() {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => fingerprint_tool(&request.tool_name, &request.input),
    }
}

#[async_trait]
impl ModelClient for DeterministicStub {
    async fn complete(
        &self,
        ctx: &CallContext,
        request: &ModelRequest,
    ) -> Result<ModelResponse, AgentError> {
        let fingerprint = fingerprint_request(request);
        let reply = {
            let Ok(mut models) = self.models.lock() else {
                return Err(AgentError::Workflow("Model stub lock poisoned".into()));
            };
            models.get_mut(&fingerprint).and_then(|q| q.pop())
        };

        match reply {
            Some(Reply::Response(response)) => Ok(response),
            Some(Reply::Failure(error)) => Err(AgentError::Llm(error)),
            None => {
                let reason = format!(
                    "No recorded model response for request {} at node {} step {}",
                    fingerprint, ctx.node_id, ctx.step_index
                );
                let abort = self.record(Divergence {
                    kind: DivergenceKind::Model,
                    node_id: ctx.node_id.clone(),
                    step_index: ctx.step_index,
                    key: fingerprint,
                    reason: reason.clone(),
                });
                if abort {
                    Err(AgentError::ReplayDivergence(reason))
                } else {
                    Ok(ModelResponse::default())
                }
            }
        }
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn provider_name(&self) -> &str {
        &self.provider_name
    }
}

#[async_trait]
impl ToolExecutor for DeterministicStub {
    async fn execute(
        &self,
        ctx: &CallContext,
        request: &ToolRequest,
    ) -> Result<ToolValue, AgentError> {
        let key = tool_key(request);
        let reply = {
            let Ok(tools) = self.tools.lock() else {
                return Err(AgentError::Workflow("Tool stub lock poisoned".into()));
            };
            tools
                .by_key
                .get(&key)
                .or_else(|| {
                    tools
                        .by_content
                        .get(&fingerprint_tool(&request.tool_name, &request.input))
                })
                .cloned()
        };

        match reply {
            Some(reply) if reply.is_error => Err(AgentError::Tool(reply.result_content)),
            Some(reply) => Ok(reply.result),
            None => {
                let reason = format!(
                    "No recorded result for tool {} ({}) at node {} step {}",
                    request.tool_name, key, ctx.node_id, ctx.step_index
                );
                let abort = self.record(Divergence {
                    kind: DivergenceKind::Tool,
                    node_id: ctx.node_id.clone(),
                    step_index: ctx.step_index,
                    key,
                    reason: reason.clone(),
                });
                if abort {
                    Err(AgentError::ReplayDivergence(reason))
                } else {
                    Ok(ToolValue::Null)
                }
            }
        }
    }
}
