//! Baseline comparison between shadow runs of the same goal.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use retrace_monitor::{new_id, now_ms, write_atomic};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::validator::ShadowTestResult;
use crate::ShadowError;

const REGRESSION_DIR: &str = "regression";
const LATEST_FILE: &str = "latest.json";
const DEFAULT_HISTORY_LIMIT: usize = 10;

/// How far current outcomes have moved from the baseline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
}

impl DriftLevel {
    pub fn from_similarity(similarity: f64) -> Self {
        if similarity > 0.95 {
            DriftLevel::None
        } else if similarity > 0.85 {
            DriftLevel::Low
        } else if similarity > 0.70 {
            DriftLevel::Medium
        } else {
            DriftLevel::High
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceOutcome {
    pub trace_id: String,
    pub clean: bool,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Snapshot of a shadow result that later runs are compared against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionBaseline {
    pub baseline_id: String,
    pub goal_id: String,
    #[serde(default)]
    pub config_id: String,
    /// Unix timestamp (milliseconds).
    pub created_at: i64,
    pub pass_rate: f64,
    #[serde(default)]
    pub avg_duration_ms: f64,
    #[serde(default)]
    pub outcomes: Vec<TraceOutcome>,
}

impl RegressionBaseline {
    pub fn from_result(goal_id: impl Into<String>, result: &ShadowTestResult) -> Self {
        Self {
            baseline_id: new_id(12),
            goal_id: goal_id.into(),
            config_id: result.config_id.clone(),
            created_at: now_ms(),
            pass_rate: result.success_rate,
            avg_duration_ms: result.avg_duration_ms(),
            outcomes: outcomes(result),
        }
    }
}

/// Outcome of comparing one shadow run against a baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionResult {
    pub run_id: String,
    pub goal_id: String,
    pub baseline_id: Option<String>,
    pub timestamp: i64,
    pub current_pass_rate: f64,
    pub baseline_pass_rate: f64,
    /// Current minus baseline.
    pub pass_rate_delta: f64,
    pub duration_delta_ms: f64,
    /// Fraction of shared traces whose clean/unclean outcome agrees.
    pub similarity: f64,
    pub compared_traces: usize,
    pub drift: DriftLevel,
    pub is_regression: bool,
    pub failure_reason: Option<String>,
}

/// Thresholds for flagging a regression.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegressionComparator {
    #[serde(default = "default_drift_threshold")]
    pub drift_threshold: f64,
    #[serde(default = "default_regression_threshold")]
    pub regression_threshold: f64,
}

fn default_drift_threshold() -> f64 {
    0.85
}

fn default_regression_threshold() -> f64 {
    0.05
}

impl Default for RegressionComparator {
    fn default() -> Self {
        Self {
            drift_threshold: default_drift_threshold(),
            regression_threshold: default_regression_threshold(),
        }
    }
}

impl RegressionComparator {
    pub fn compare(
        &self,
        run_id: impl Into<String>,
        current: &ShadowTestResult,
        baseline: &RegressionBaseline,
    ) -> RegressionResult {
        let pass_rate_delta = current.success_rate - baseline.pass_rate;
        let duration_delta_ms = current.avg_duration_ms() - baseline.avg_duration_ms;
        let (similarity, compared) = similarity(&outcomes(current), &baseline.outcomes);

        let mut reasons = Vec::new();
        if pass_rate_delta < -self.regression_threshold {
            reasons.push(format!("Pass rate dropped by {:.1}%", -pass_rate_delta * 100.0));
        }
        if similarity < self.drift_threshold {
            reasons.push(format!("Outcome drift detected, similarity: {:.2}", similarity));
        }

        let result = RegressionResult {
            run_id: run_id.into(),
            goal_id: baseline.goal_id.clone(),
            baseline_id: Some(baseline.baseline_id.clone()),
            timestamp: now_ms(),
            current_pass_rate: current.success_rate,
            baseline_pass_rate: baseline.pass_rate,
            pass_rate_delta,
            duration_delta_ms,
            similarity,
            compared_traces: compared,
            drift: DriftLevel::from_similarity(similarity),
            is_regression: !reasons.is_empty(),
            failure_reason: (!reasons.is_empty()).then(|| reasons.join("; ")),
        };

        if result.is_regression {
            tracing::warn!(
                goal_id = %result.goal_id,
                run_id = %result.run_id,
                pass_rate_delta,
                similarity,
                "Regression detected"
            );
        }
        result
    }

    /// Compares against the goal's latest baseline and records a report.
    ///
    /// Without a baseline the current run becomes the first one and no
    /// regression is reported.
    pub fn check(
        &self,
        store: &BaselineStore,
        goal_id: &str,
        run_id: &str,
        current: &ShadowTestResult,
    ) -> Result<RegressionResult, ShadowError> {
        let result = match store.latest_baseline(goal_id)? {
            Some(baseline) => self.compare(run_id, current, &baseline),
            None => {
                tracing::info!(goal_id, "No baseline yet, recording current run");
                store.save_baseline(&RegressionBaseline::from_result(goal_id, current))?;
                RegressionResult {
                    run_id: run_id.to_string(),
                    goal_id: goal_id.to_string(),
                    baseline_id: None,
                    timestamp: now_ms(),
                    current_pass_rate: current.success_rate,
                    baseline_pass_rate: current.success_rate,
                    pass_rate_delta: 0.0,
                    duration_delta_ms: 0.0,
                    similarity: 1.0,
                    compared_traces: 0,
                    drift: DriftLevel::None,
                    is_regression: false,
                    failure_reason: None,
                }
            }
        };
        store.save_report(&result)?;
        Ok(result)
    }
}

/// File layout under `{base}/regression/`.
pub struct BaselineStore {
    root: PathBuf,
}

impl BaselineStore {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            root: base_path.as_ref().join(REGRESSION_DIR),
        }
    }

    fn baselines_dir(&self, goal_id: &str) -> Result<PathBuf, ShadowError> {
        validate_goal(goal_id)?;
        Ok(self.root.join("baselines").join(goal_id))
    }

    fn reports_dir(&self, goal_id: &str) -> Result<PathBuf, ShadowError> {
        validate_goal(goal_id)?;
        Ok(self.root.join("reports").join(goal_id))
    }

    /// Writes a timestamped copy and replaces `latest.json`.
    pub fn save_baseline(&self, baseline: &RegressionBaseline) -> Result<PathBuf, ShadowError> {
        let dir = self.baselines_dir(&baseline.goal_id)?;
        let bytes = serde_json::to_vec_pretty(baseline)?;

        let path = dir.join(format!("{:013}_{}.json", baseline.created_at, baseline.baseline_id));
        write_atomic(&path, &bytes)?;
        write_atomic(&dir.join(LATEST_FILE), &bytes)?;

        tracing::info!(
            goal_id = %baseline.goal_id,
            baseline_id = %baseline.baseline_id,
            pass_rate = baseline.pass_rate,
            "Saved regression baseline"
        );
        Ok(path)
    }

    pub fn latest_baseline(&self, goal_id: &str) -> Result<Option<RegressionBaseline>, ShadowError> {
        read_json(&self.baselines_dir(goal_id)?.join(LATEST_FILE))
    }

    pub fn save_report(&self, result: &RegressionResult) -> Result<PathBuf, ShadowError> {
        let dir = self.reports_dir(&result.goal_id)?;
        let path = dir.join(format!("{:013}_{}.json", result.timestamp, result.run_id));
        write_atomic(&path, &serde_json::to_vec_pretty(result)?)?;
        Ok(path)
    }

    /// Past reports for a goal, newest first. `limit` defaults to 10.
    pub fn history(
        &self,
        goal_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<RegressionResult>, ShadowError> {
        let dir = self.reports_dir(goal_id)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_report = path.extension().is_some_and(|ext| ext == "json")
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| !n.starts_with('.'));
            if is_report {
                paths.push(path);
            }
        }
        paths.sort();
        paths.reverse();

        let mut reports = Vec::new();
        for path in paths.into_iter().take(limit.unwrap_or(DEFAULT_HISTORY_LIMIT)) {
            if let Some(report) = read_json(&path)? {
                reports.push(report);
            }
        }
        Ok(reports)
    }
}

fn outcomes(result: &ShadowTestResult) -> Vec<TraceOutcome> {
    result
        .details
        .iter()
        .map(|d| TraceOutcome {
            trace_id: d.trace_id.clone(),
            clean: d.is_clean(),
            duration_ms: d.duration_ms,
        })
        .collect()
}

fn similarity(current: &[TraceOutcome], baseline: &[TraceOutcome]) -> (f64, usize) {
    let mut compared = 0;
    let mut agreeing = 0;
    for outcome in current {
        if let Some(before) = baseline.iter().find(|b| b.trace_id == outcome.trace_id) {
            compared += 1;
            if before.clean == outcome.clean {
                agreeing += 1;
            }
        }
    }
    if compared == 0 {
        return (1.0, 0);
    }
    (agreeing as f64 / compared as f64, compared)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ShadowError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Corrupt regression document");
            Ok(None)
        }
    }
}

fn validate_goal(goal_id: &str) -> Result<(), ShadowError> {
    if goal_id.is_empty() || goal_id.contains(['/', '\\']) || goal_id.contains("..") {
        return Err(ShadowError::InvalidId(goal_id.to_string()));
    }
    Ok(())
}
