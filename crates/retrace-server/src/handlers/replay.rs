//! Replay API handler.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use retrace_engine::{MissPolicy, RecordedWorkflow, ReplayEngine, ReplayResult, Workflow};
use retrace_shadow::{CandidateConfig, ReplayTarget};
use serde::Deserialize;

use crate::error::AppError;
use crate::ServerState;

/// Overrides for a single replay; unset fields fall back to the server config.
#[derive(Debug, Deserialize, Default)]
pub struct ReplayRequest {
    pub miss_policy: Option<MissPolicy>,
    pub compare_paths: Option<bool>,
    pub stop_on_mismatch: Option<bool>,
    /// Persist the replay as a new trace.
    pub record_replay: Option<bool>,
    pub max_divergence_depth: Option<usize>,
    /// Replay with a candidate's overrides instead of the recorded requests.
    pub candidate: Option<CandidateConfig>,
}

/// POST /api/traces/{id}/replay - Replay a stored trace.
pub async fn replay(
    State(state): State<Arc<ServerState>>,
    Path(trace_id): Path<String>,
    Json(request): Json<ReplayRequest>,
) -> Result<Json<ReplayResult>, AppError> {
    let trace = state
        .store
        .load_async(trace_id)
        .await?
        .ok_or_else(|| AppError::NotFound("trace not found".into()))?;

    let mut settings = state.config.replay.clone();
    if let Some(policy) = request.miss_policy {
        settings.miss_policy = policy;
    }
    if let Some(enabled) = request.compare_paths {
        settings.compare_paths = enabled;
    }
    if let Some(enabled) = request.stop_on_mismatch {
        settings.stop_on_mismatch = enabled;
    }
    if let Some(enabled) = request.record_replay {
        settings.record_replay = enabled;
    }
    if let Some(depth) = request.max_divergence_depth {
        settings.max_divergence_depth = Some(depth);
    }

    let workflow: Arc<dyn Workflow> = match &request.candidate {
        Some(candidate) => candidate.workflow_for(&trace),
        None => Arc::new(RecordedWorkflow::from_trace(&trace)),
    };

    let mut engine = ReplayEngine::new(trace, settings);
    let result = engine.replay(workflow.as_ref()).await;

    if let Some(replay_trace) = result.replay_trace.clone() {
        state.store.save_async(replay_trace).await?;
    }

    Ok(Json(result))
}
