//! Shadow validation API handler.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use retrace_shadow::{CandidateConfig, ReplayTarget, ShadowSettings, ShadowTestResult, ShadowValidator};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::ServerState;

#[derive(Debug, Deserialize)]
pub struct ShadowRequest {
    pub candidates: Vec<CandidateConfig>,
    /// Explicit sample; selected from the store when absent.
    #[serde(default)]
    pub trace_ids: Option<Vec<String>>,
    /// Replaces the configured thresholds for this request.
    #[serde(default)]
    pub settings: Option<ShadowSettings>,
}

/// Verdicts ranked by success rate, best first.
#[derive(Serialize)]
pub struct ShadowResponse {
    pub results: Vec<ShadowTestResult>,
}

/// POST /api/shadow - Shadow-test candidate configurations.
pub async fn run(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<ShadowRequest>,
) -> Result<Json<ShadowResponse>, AppError> {
    if request.candidates.is_empty() {
        return Err(AppError::BadRequest("no candidates given".into()));
    }

    let settings = request.settings.unwrap_or_else(|| state.config.shadow.clone());
    let validator = ShadowValidator::new(Arc::clone(&state.store), settings)
        .with_replay_settings(state.config.replay.clone());

    let targets: Vec<Arc<dyn ReplayTarget>> = request
        .candidates
        .into_iter()
        .map(|c| Arc::new(c) as Arc<dyn ReplayTarget>)
        .collect();

    let results = validator
        .compare_configurations(&targets, request.trace_ids)
        .await?;

    tracing::info!(
        candidates = results.len(),
        passed = results.iter().filter(|r| r.passed).count(),
        "Shadow request finished"
    );
    Ok(Json(ShadowResponse { results }))
}
