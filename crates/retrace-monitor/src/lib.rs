//! Execution trace capture and persistence for agent workflows.

mod collector;
mod fingerprint;
mod index;
mod scope;
mod session;
mod store;
mod trace;
mod wrap;

pub use collector::{BoundaryCapture, CaptureError, ModelCapture, ToolCapture, TraceCapture};
pub use fingerprint::{fingerprint_request, fingerprint_tool};
pub use index::MetadataIndex;
pub use scope::CaptureScope;
pub use session::SessionTraceMirror;
pub use store::{write_atomic, MetricsSummary, StoreError, TraceStore};
pub use trace::{
    new_id, now_ms, BoundaryKind, ExecutionTrace, ModelInteraction, NodeBoundary, ToolInteraction,
    TraceMetadata, TraceQuery, TraceStatus,
};
pub use wrap::{TracedModel, TracedTools};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Controls what a [`TraceCapture`] records at node boundaries.
///
/// Model requests are never altered; they are the replay key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Record anything at all. Capture calls still succeed when disabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Record working-memory snapshots.
    #[serde(default = "default_true")]
    pub capture_memory: bool,
    /// Record node input and output payloads.
    #[serde(default = "default_true")]
    pub capture_io: bool,
    /// Payloads whose serialized size exceeds this are replaced by a marker.
    #[serde(default)]
    pub max_payload_bytes: Option<usize>,
}

fn default_true() -> bool {
    true
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureConfig {
    /// Creates a config that records everything.
    pub fn new() -> Self {
        Self {
            enabled: true,
            capture_memory: true,
            capture_io: true,
            max_payload_bytes: None,
        }
    }

    /// Creates a config that accepts capture calls but records nothing.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new()
        }
    }

    pub fn with_memory(mut self, enabled: bool) -> Self {
        self.capture_memory = enabled;
        self
    }

    pub fn with_io(mut self, enabled: bool) -> Self {
        self.capture_io = enabled;
        self
    }

    pub fn with_max_payload_bytes(mut self, max: usize) -> Self {
        self.max_payload_bytes = Some(max);
        self
    }

    pub(crate) fn shape_memory(&self, payload: Map<String, Value>) -> Map<String, Value> {
        if !self.capture_memory {
            return Map::new();
        }
        self.truncate(payload)
    }

    pub(crate) fn shape_io(&self, payload: Map<String, Value>) -> Map<String, Value> {
        if !self.capture_io {
            return Map::new();
        }
        self.truncate(payload)
    }

    fn truncate(&self, payload: Map<String, Value>) -> Map<String, Value> {
        let Some(max) = self.max_payload_bytes else {
            return payload;
        };
        let size = serde_json::to_vec(&payload).map(|b| b.len()).unwrap_or(0);
        if size <= max {
            return payload;
        }

        let mut marker = Map::new();
        marker.insert("_truncated".into(), json!(true));
        marker.insert("_original_bytes".into(), json!(size));
        marker
    }
}
