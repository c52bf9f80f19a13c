//! Trace browsing API handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use retrace_monitor::{ExecutionTrace, MetricsSummary, TraceMetadata, TraceQuery, TraceStatus};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::ServerState;

/// Response for listing traces.
#[derive(Serialize)]
pub struct TracesListResponse {
    pub traces: Vec<TraceMetadata>,
}

#[derive(Serialize)]
pub struct DeleteResponse {
    pub deleted: bool,
}

/// Query parameters for listing traces.
#[derive(Debug, Deserialize, Default)]
pub struct ListTracesQuery {
    pub agent_id: Option<String>,
    pub run_id: Option<String>,
    pub status: Option<String>,
    pub limit: Option<usize>,
}

impl ListTracesQuery {
    fn into_query(self) -> Result<TraceQuery, AppError> {
        let status = match self.status.as_deref().filter(|s| !s.is_empty()) {
            Some(s) => Some(
                TraceStatus::parse(s)
                    .ok_or_else(|| AppError::BadRequest(format!("unknown status: {}", s)))?,
            ),
            None => None,
        };
        Ok(TraceQuery {
            agent_id: self.agent_id,
            run_id: self.run_id,
            status,
            limit: self.limit,
        })
    }
}

/// GET /api/traces - List trace metadata, newest first.
pub async fn list(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<ListTracesQuery>,
) -> Result<Json<TracesListResponse>, AppError> {
    let query = params.into_query()?;
    let traces = state.store.list_async(query).await?;
    Ok(Json(TracesListResponse { traces }))
}

/// GET /api/traces/{id} - Get a full trace.
pub async fn get(
    State(state): State<Arc<ServerState>>,
    Path(trace_id): Path<String>,
) -> Result<Json<ExecutionTrace>, AppError> {
    let trace = state
        .store
        .load_async(trace_id)
        .await?
        .ok_or_else(|| AppError::NotFound("trace not found".into()))?;
    Ok(Json(trace))
}

/// DELETE /api/traces/{id} - Delete a trace.
pub async fn delete(
    State(state): State<Arc<ServerState>>,
    Path(trace_id): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    if !state.store.delete_async(trace_id).await? {
        return Err(AppError::NotFound("trace not found".into()));
    }
    Ok(Json(DeleteResponse { deleted: true }))
}

/// GET /api/metrics/summary - Aggregate metrics over all traces.
pub async fn metrics_summary(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<MetricsSummary>, AppError> {
    let summary = state.store.metrics_summary_async().await?;
    Ok(Json(summary))
}
