//! Deterministic replay of recorded executions.
//!
//! A [`ReplayEngine`] loads an [`ExecutionTrace`](retrace_monitor::ExecutionTrace),
//! builds a [`DeterministicStub`] from its recorded interactions and drives a
//! [`Workflow`] against it. Any call the recording cannot answer is reported
//! as a [`Divergence`].

mod replay;
mod stub;
mod workflow;

pub use replay::{is_replay_trace, ReplayEngine, ReplayResult, ReplaySettings, ReplayState, REPLAY_TAG};
pub use stub::{DeterministicStub, Divergence, DivergenceKind, MissPolicy};
pub use workflow::{RecordedWorkflow, ReplayContext, RequestTransform, Workflow, WorkflowOutcome};
