//! Statistical pass/fail verdicts over batches of replays.

use std::sync::Arc;
use std::time::Duration;

use retrace_engine::{is_replay_trace, ReplaySettings};
use retrace_monitor::{StoreError, TraceQuery, TraceStatus, TraceStore};
use serde::{Deserialize, Serialize};

use crate::candidate::ReplayTarget;
use crate::runner::{ratio, ReplayDetail, ResultCallback, ShadowRunner};

/// Thresholds and sampling for shadow validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowSettings {
    #[serde(default = "default_min_traces")]
    pub min_traces: usize,
    #[serde(default = "default_max_traces")]
    pub max_traces: usize,
    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: f64,
    #[serde(default = "default_max_divergence_rate")]
    pub max_divergence_rate: f64,
    /// Mix traces flagged for attention into the sample.
    #[serde(default = "default_true")]
    pub include_failures: bool,
    /// Interleave clean and flagged traces one to one.
    #[serde(default = "default_true")]
    pub balance_traces: bool,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_timeout_ms")]
    pub per_trace_timeout_ms: u64,
}

fn default_min_traces() -> usize {
    10
}

fn default_max_traces() -> usize {
    50
}

fn default_min_success_rate() -> f64 {
    0.9
}

fn default_max_divergence_rate() -> f64 {
    0.1
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    4
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for ShadowSettings {
    fn default() -> Self {
        Self {
            min_traces: default_min_traces(),
            max_traces: default_max_traces(),
            min_success_rate: default_min_success_rate(),
            max_divergence_rate: default_max_divergence_rate(),
            include_failures: true,
            balance_traces: true,
            concurrency: default_concurrency(),
            per_trace_timeout_ms: default_timeout_ms(),
        }
    }
}

/// Verdict for one target over a trace sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShadowTestResult {
    pub config_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<String>,
    pub total_traces: usize,
    pub successful_replays: usize,
    pub divergences: usize,
    pub success_rate: f64,
    pub divergence_rate: f64,
    pub passed: bool,
    pub failure_reasons: Vec<String>,
    pub details: Vec<ReplayDetail>,
    /// Requested traces that were not in the store.
    pub missing_traces: Vec<String>,
}

impl ShadowTestResult {
    /// Fraction of clean replays; 0.5 when nothing was replayed.
    pub fn fitness(&self) -> f64 {
        if self.details.is_empty() {
            return 0.5;
        }
        let clean = self.details.iter().filter(|d| d.is_clean()).count();
        clean as f64 / self.details.len() as f64
    }

    /// Average replay duration over the replayed traces.
    pub fn avg_duration_ms(&self) -> f64 {
        if self.details.is_empty() {
            return 0.0;
        }
        let total: u64 = self.details.iter().map(|d| d.duration_ms).sum();
        total as f64 / self.details.len() as f64
    }
}

/// Decides whether a configuration behaves like the recorded executions.
pub struct ShadowValidator {
    store: Arc<TraceStore>,
    settings: ShadowSettings,
    replay: ReplaySettings,
    on_result: Option<ResultCallback>,
}

impl ShadowValidator {
    pub fn new(store: Arc<TraceStore>, settings: ShadowSettings) -> Self {
        Self {
            store,
            settings,
            replay: ReplaySettings::default(),
            on_result: None,
        }
    }

    pub fn with_replay_settings(mut self, settings: ReplaySettings) -> Self {
        self.replay = settings;
        self
    }

    /// Streams every per-trace outcome to `callback` while tests run.
    pub fn with_on_result(mut self, callback: ResultCallback) -> Self {
        self.on_result = Some(callback);
        self
    }

    pub fn settings(&self) -> &ShadowSettings {
        &self.settings
    }

    fn runner(&self) -> ShadowRunner {
        let runner = ShadowRunner::new(Arc::clone(&self.store))
            .with_replay_settings(self.replay.clone())
            .with_concurrency(self.settings.concurrency)
            .with_timeout(Duration::from_millis(self.settings.per_trace_timeout_ms));
        match &self.on_result {
            Some(callback) => runner.with_on_result(Arc::clone(callback)),
            None => runner,
        }
    }

    /// Picks completed traces to replay, newest first. Traces recorded by
    /// earlier replays are never picked.
    ///
    /// With balancing on, clean successes and traces flagged for attention are
    /// interleaved one to one, success first.
    pub async fn select_traces(&self) -> Result<Vec<String>, StoreError> {
        let completed = self
            .store
            .list_async(TraceQuery::new().status(TraceStatus::Completed).limit(usize::MAX))
            .await?
            .into_iter()
            .filter(|m| !is_replay_trace(m))
            .collect::<Vec<_>>();
        let max = self.settings.max_traces;

        if !self.settings.balance_traces {
            return Ok(completed.into_iter().take(max).map(|m| m.trace_id).collect());
        }

        let (flagged, clean): (Vec<_>, Vec<_>) =
            completed.into_iter().partition(|m| m.needs_attention);
        let clean: Vec<String> = clean.into_iter().map(|m| m.trace_id).collect();
        let flagged: Vec<String> = flagged.into_iter().map(|m| m.trace_id).collect();

        if !self.settings.include_failures || flagged.is_empty() {
            return Ok(clean.into_iter().take(max).collect());
        }

        let mut selected = Vec::new();
        for i in 0..clean.len().max(flagged.len()) {
            if let Some(id) = clean.get(i) {
                selected.push(id.clone());
            }
            if let Some(id) = flagged.get(i) {
                if selected.len() < max {
                    selected.push(id.clone());
                }
            }
        }
        selected.truncate(max);
        Ok(selected)
    }

    /// Replays a sample and evaluates every pass criterion.
    pub async fn test_configuration(
        &self,
        target: &dyn ReplayTarget,
        trace_ids: Option<Vec<String>>,
    ) -> Result<ShadowTestResult, StoreError> {
        let trace_ids = match trace_ids {
            Some(ids) => ids,
            None => self.select_traces().await?,
        };
        Ok(self.run_sample(target, &trace_ids).await)
    }

    /// Like [`test_configuration`](Self::test_configuration), with the result
    /// tagged as one arm of an A/B comparison.
    pub async fn test_variant(
        &self,
        target: &dyn ReplayTarget,
        variant_id: impl Into<String>,
        trace_ids: Option<Vec<String>>,
    ) -> Result<ShadowTestResult, StoreError> {
        let mut result = self.test_configuration(target, trace_ids).await?;
        result.variant_id = Some(variant_id.into());
        Ok(result)
    }

    /// Tests every target on the same sample, best success rate first.
    pub async fn compare_configurations(
        &self,
        targets: &[Arc<dyn ReplayTarget>],
        trace_ids: Option<Vec<String>>,
    ) -> Result<Vec<ShadowTestResult>, StoreError> {
        let trace_ids = match trace_ids {
            Some(ids) => ids,
            None => self.select_traces().await?,
        };

        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            results.push(self.run_sample(target.as_ref(), &trace_ids).await);
        }
        results.sort_by(|a, b| b.success_rate.total_cmp(&a.success_rate));
        Ok(results)
    }

    async fn run_sample(&self, target: &dyn ReplayTarget, trace_ids: &[String]) -> ShadowTestResult {
        let batch = self.runner().replay_batch(target, trace_ids).await;

        let total = batch.details.len();
        let successful = batch.details.iter().filter(|d| d.is_clean()).count();
        let divergences = batch.details.iter().filter(|d| d.diverged).count();

        let mut result = ShadowTestResult {
            config_id: target.id().to_string(),
            variant_id: target.variant_id().map(str::to_string),
            total_traces: total,
            successful_replays: successful,
            divergences,
            success_rate: ratio(successful, total),
            divergence_rate: ratio(divergences, total),
            passed: false,
            failure_reasons: Vec::new(),
            details: batch.details,
            missing_traces: batch.missing,
        };
        self.evaluate(&mut result);

        tracing::info!(
            config_id = %result.config_id,
            total = result.total_traces,
            success_rate = result.success_rate,
            divergence_rate = result.divergence_rate,
            passed = result.passed,
            "Shadow test finished"
        );
        result
    }

    fn evaluate(&self, result: &mut ShadowTestResult) {
        let s = &self.settings;
        let mut reasons = Vec::new();

        if result.total_traces < s.min_traces {
            reasons.push(format!(
                "Insufficient traces: {} < {}",
                result.total_traces, s.min_traces
            ));
        }
        if result.success_rate < s.min_success_rate {
            reasons.push(format!(
                "Success rate too low: {} < {}",
                percent(result.success_rate),
                percent(s.min_success_rate)
            ));
        }
        if result.divergence_rate > s.max_divergence_rate {
            reasons.push(format!(
                "Divergence rate too high: {} > {}",
                percent(result.divergence_rate),
                percent(s.max_divergence_rate)
            ));
        }

        result.passed = reasons.is_empty();
        result.failure_reasons = reasons;
    }
}

fn percent(rate: f64) -> String {
    format!("{:.2}%", rate * 100.0)
}
