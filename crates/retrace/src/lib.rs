//! # Retrace
//!
//! Execution tracing and deterministic replay for agent workflows.
//!
//! Wrap a workflow's model client and tool executor with [`TracedModel`] and
//! [`TracedTools`] (or call the [`TraceCapture`] operations directly), persist
//! the finished [`ExecutionTrace`] in a [`TraceStore`], and later drive the
//! same workflow through a [`ReplayEngine`] that answers every call from the
//! recording. Calls the recording cannot answer are reported as divergences.
//!
//! [`ShadowValidator`] replays a sample of stored traces against a candidate
//! configuration and decides whether it still behaves like production.
//!
//! ## Quick Start
//!
//! ```rust
//! use retrace::prelude::*;
//!
//! let capture = TraceCapture::new();
//! capture.start_trace("run-1", "support-agent", None, vec![]).unwrap();
//! capture
//!     .capture_model_interaction(
//!         ModelCapture::new("answer", 0, vec![Message::user("Hello")])
//!             .response_content("Hi there!")
//!             .usage(Usage::new(3, 4)),
//!     )
//!     .unwrap();
//! let trace = capture.finalize_trace(TraceStatus::Completed).unwrap();
//!
//! assert_eq!(trace.metadata.total_tokens, 7);
//! assert_eq!(trace.model_stub_map().len(), 1);
//! ```
//!
//! ## Crates
//!
//! - [`retrace_core`]: payload types and the collaborator traits
//! - [`retrace_monitor`]: capture, storage and indexing
//! - [`retrace_engine`]: deterministic stubs and the replay engine
//! - [`retrace_shadow`]: shadow validation and regression comparison
//! - [`retrace_config`]: file and environment configuration

pub use retrace_config;
pub use retrace_core;
pub use retrace_engine;
pub use retrace_monitor;
pub use retrace_shadow;

pub use retrace_config::{ConfigError, RetraceConfig};
pub use retrace_core::{
    AgentError, CallContext, Message, MessageRole, ModelClient, ModelRequest, ModelResponse,
    ToolCall, ToolExecutor, ToolRequest, ToolValue, Usage,
};
pub use retrace_engine::{
    is_replay_trace, DeterministicStub, Divergence, DivergenceKind, MissPolicy, RecordedWorkflow,
    ReplayContext, ReplayEngine, ReplayResult, ReplaySettings, Workflow, WorkflowOutcome, REPLAY_TAG,
};
pub use retrace_monitor::{
    BoundaryCapture, BoundaryKind, CaptureConfig, CaptureError, CaptureScope, ExecutionTrace,
    MetadataIndex, ModelCapture, SessionTraceMirror, StoreError, ToolCapture, TraceCapture,
    TraceMetadata, TraceQuery, TraceStatus, TraceStore, TracedModel, TracedTools,
};
pub use retrace_shadow::{
    BaselineStore, CandidateConfig, DriftLevel, RegressionComparator, RegressionResult,
    ReplayDetail, ReplayTarget, ResultCallback, ShadowError, ShadowRunner, ShadowSettings,
    ShadowTestResult, ShadowValidator,
};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        AgentError, BoundaryCapture, BoundaryKind, CallContext, CandidateConfig, CaptureScope,
        ExecutionTrace, Message, ModelCapture, ModelClient, ModelRequest, ModelResponse,
        ReplayContext, ReplayEngine, ReplaySettings, ShadowSettings, ShadowValidator, ToolCapture,
        ToolCall, ToolExecutor, ToolRequest, ToolValue, TraceCapture, TraceQuery, TraceStatus, TraceStore,
        TracedModel, TracedTools, Usage, Workflow, WorkflowOutcome,
    };
}
