//! Shadow validation of agent configurations against recorded traces.
//!
//! A candidate is replayed over a sample of stored executions; the batch is
//! judged against success and divergence thresholds, and can be compared with
//! a stored baseline to catch regressions between runs.

mod candidate;
mod regression;
mod runner;
mod validator;

pub use candidate::{CandidateConfig, CandidateStatus, ReplayTarget, WorkflowTarget};
pub use regression::{
    BaselineStore, DriftLevel, RegressionBaseline, RegressionComparator, RegressionResult,
    TraceOutcome,
};
pub use runner::{ReplayDetail, ResultCallback, ShadowRunner, ShadowSummary};
pub use validator::{ShadowSettings, ShadowTestResult, ShadowValidator};

use retrace_monitor::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShadowError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid id: {0:?}")]
    InvalidId(String),
}
