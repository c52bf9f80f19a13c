//! Per-session copy of the latest trace.

use std::path::PathBuf;

use crate::store::{read_trace, validate_id, write_atomic, StoreError};
use crate::trace::ExecutionTrace;

/// Mirrors a session's most recent trace at `{base}/sessions/{session_id}/trace.json`.
pub struct SessionTraceMirror {
    sessions_dir: PathBuf,
}

impl SessionTraceMirror {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            sessions_dir: base_path.into().join("sessions"),
        }
    }

    pub fn session_path(&self, session_id: &str) -> Result<PathBuf, StoreError> {
        validate_id(session_id)?;
        Ok(self.sessions_dir.join(session_id).join("trace.json"))
    }

    pub fn save_for_session(
        &self,
        session_id: &str,
        trace: &ExecutionTrace,
    ) -> Result<PathBuf, StoreError> {
        let path = self.session_path(session_id)?;
        let bytes = serde_json::to_vec_pretty(trace)?;
        write_atomic(&path, &bytes)?;
        tracing::debug!(session_id, trace_id = %trace.metadata.trace_id, "Mirrored session trace");
        Ok(path)
    }

    /// Absent and corrupt documents both yield `None`.
    pub fn load_for_session(&self, session_id: &str) -> Result<Option<ExecutionTrace>, StoreError> {
        read_trace(&self.session_path(session_id)?)
    }
}
