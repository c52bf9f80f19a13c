//! Batch replay of stored traces against a target.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use retrace_engine::{ReplayEngine, ReplayResult, ReplaySettings};
use retrace_monitor::{TraceStatus, TraceStore};
use serde::{Deserialize, Serialize};

use crate::candidate::ReplayTarget;

/// Per-trace outcome kept in shadow results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayDetail {
    pub trace_id: String,
    pub success: bool,
    pub diverged: bool,
    pub divergence_reason: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
    /// Status of the recording; in progress when it could not be loaded.
    #[serde(default)]
    pub original_status: TraceStatus,
}

impl ReplayDetail {
    /// Succeeded without diverging.
    pub fn is_clean(&self) -> bool {
        self.success && !self.diverged
    }
}

impl From<&ReplayResult> for ReplayDetail {
    fn from(result: &ReplayResult) -> Self {
        Self {
            trace_id: result.original_trace_id.clone(),
            success: result.success,
            diverged: result.diverged,
            divergence_reason: result.divergence_reason.clone(),
            duration_ms: result.duration_ms,
            original_status: result.original_status,
        }
    }
}

/// Aggregate of one shadow run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShadowSummary {
    pub total_traces: usize,
    pub successful_replays: usize,
    pub success_rate: f64,
    pub divergence_rate: f64,
    pub results: Vec<ReplayDetail>,
    /// Requested traces that were not in the store.
    pub missing: Vec<String>,
}

pub(crate) struct Batch {
    pub details: Vec<ReplayDetail>,
    pub missing: Vec<String>,
}

/// Called with each replay outcome as soon as it is known.
pub type ResultCallback = Arc<dyn Fn(&ReplayDetail) + Send + Sync>;

enum Slot {
    Replayed(ReplayDetail),
    Missing(String),
}

/// Replays stored traces against a target with bounded concurrency.
pub struct ShadowRunner {
    store: Arc<TraceStore>,
    replay: ReplaySettings,
    concurrency: usize,
    timeout: Duration,
    on_result: Option<ResultCallback>,
}

impl ShadowRunner {
    pub fn new(store: Arc<TraceStore>) -> Self {
        Self {
            store,
            replay: ReplaySettings::default(),
            concurrency: 4,
            timeout: Duration::from_millis(30_000),
            on_result: None,
        }
    }

    pub fn with_replay_settings(mut self, settings: ReplaySettings) -> Self {
        self.replay = settings;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Streams each finished replay to `callback`, in completion order.
    pub fn with_on_result(mut self, callback: ResultCallback) -> Self {
        self.on_result = Some(callback);
        self
    }

    pub fn store(&self) -> &Arc<TraceStore> {
        &self.store
    }

    /// Replays `trace_ids` against `target`; missing traces are skipped.
    pub async fn shadow_run(&self, target: &dyn ReplayTarget, trace_ids: &[String]) -> ShadowSummary {
        let batch = self.replay_batch(target, trace_ids).await;

        let total = batch.details.len();
        let successful = batch.details.iter().filter(|d| d.is_clean()).count();
        let diverged = batch.details.iter().filter(|d| d.diverged).count();

        ShadowSummary {
            total_traces: total,
            successful_replays: successful,
            success_rate: ratio(successful, total),
            divergence_rate: ratio(diverged, total),
            results: batch.details,
            missing: batch.missing,
        }
    }

    pub(crate) async fn replay_batch(&self, target: &dyn ReplayTarget, trace_ids: &[String]) -> Batch {
        let slots: Vec<Slot> = stream::iter(trace_ids.iter().cloned())
            .map(|trace_id| self.replay_one(target, trace_id))
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut batch = Batch {
            details: Vec::new(),
            missing: Vec::new(),
        };
        for slot in slots {
            match slot {
                Slot::Replayed(detail) => batch.details.push(detail),
                Slot::Missing(trace_id) => batch.missing.push(trace_id),
            }
        }

        tracing::info!(
            target_id = target.id(),
            replayed = batch.details.len(),
            missing = batch.missing.len(),
            "Shadow batch finished"
        );
        batch
    }

    async fn replay_one(&self, target: &dyn ReplayTarget, trace_id: String) -> Slot {
        let trace = match self.store.load_async(trace_id.as_str()).await {
            Ok(Some(trace)) => trace,
            Ok(None) => {
                tracing::warn!(trace_id = %trace_id, "Trace not found, skipping");
                return Slot::Missing(trace_id);
            }
            Err(e) => {
                tracing::warn!(trace_id = %trace_id, error = %e, "Failed to load trace");
                let result = ReplayResult::failed(trace_id, format!("Failed to load trace: {}", e));
                let detail = ReplayDetail::from(&result);
                self.notify(&detail);
                return Slot::Replayed(detail);
            }
        };

        let workflow = target.workflow_for(&trace);
        let mut engine = ReplayEngine::new(trace, self.replay.clone());
        let outcome = tokio::time::timeout(self.timeout, engine.replay(workflow.as_ref())).await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(trace_id = %trace_id, timeout_ms = self.timeout.as_millis() as u64, "Replay timed out");
                ReplayResult::failed(
                    trace_id,
                    format!("Replay timed out after {} ms", self.timeout.as_millis()),
                )
                .with_original(engine.trace())
            }
        };
        let detail = ReplayDetail::from(&result);
        self.notify(&detail);
        Slot::Replayed(detail)
    }

    fn notify(&self, detail: &ReplayDetail) {
        if let Some(callback) = &self.on_result {
            callback(detail);
        }
    }
}

pub(crate) fn ratio(part: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    part as f64 / total as f64
}
