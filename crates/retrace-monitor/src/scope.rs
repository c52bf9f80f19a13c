//! Scoped capture that always finalizes its trace.

use std::sync::Arc;

use crate::collector::{CaptureError, TraceCapture};
use crate::store::TraceStore;
use crate::trace::{ExecutionTrace, TraceStatus};

/// Owns one trace for the lifetime of the scope.
///
/// Dropping the scope without calling [`CaptureScope::finish`] (early return,
/// `?`, panic unwind, task cancellation) finalizes the trace as `aborted` and
/// persists it when a store is attached.
pub struct CaptureScope {
    capture: Arc<TraceCapture>,
    store: Option<Arc<TraceStore>>,
    trace_id: String,
    finished: bool,
}

impl CaptureScope {
    pub fn begin(
        capture: Arc<TraceCapture>,
        run_id: &str,
        agent_id: &str,
        goal_id: Option<&str>,
    ) -> Result<Self, CaptureError> {
        let trace_id = capture.start_trace(run_id, agent_id, goal_id, Vec::new())?;
        Ok(Self {
            capture,
            store: None,
            trace_id,
            finished: false,
        })
    }

    /// Attaches a store that receives the trace if the scope is abandoned.
    pub fn with_store(mut self, store: Arc<TraceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn capture(&self) -> &Arc<TraceCapture> {
        &self.capture
    }

    /// Finalizes the trace with `status` and hands it back.
    pub fn finish(mut self, status: TraceStatus) -> Result<ExecutionTrace, CaptureError> {
        self.finished = true;
        self.capture.finalize_trace(status)
    }
}

impl Drop for CaptureScope {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if self.capture.current_trace_id().as_deref() != Some(self.trace_id.as_str()) {
            return;
        }

        let trace = match self.capture.finalize_trace(TraceStatus::Aborted) {
            Ok(trace) => trace,
            Err(e) => {
                tracing::warn!(trace_id = %self.trace_id, error = %e, "Failed to abort trace");
                return;
            }
        };
        tracing::warn!(trace_id = %self.trace_id, "Capture scope dropped, trace aborted");

        let Some(store) = self.store.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || persist(&store, &trace));
            }
            Err(_) => persist(&store, &trace),
        }
    }
}

fn persist(store: &TraceStore, trace: &ExecutionTrace) {
    if let Err(e) = store.save(trace) {
        tracing::warn!(trace_id = %trace.metadata.trace_id, error = %e, "Failed to save aborted trace");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::ModelCapture;
    use retrace_core::Message;
    use std::time::Duration;

    #[test]
    fn test_finish_returns_trace() {
        let capture = Arc::new(TraceCapture::new());
        let scope = CaptureScope::begin(Arc::clone(&capture), "run", "agent", None).unwrap();
        let id = scope.trace_id().to_string();

        let trace = scope.finish(TraceStatus::Completed).unwrap();
        assert_eq!(trace.metadata.trace_id, id);
        assert_eq!(trace.metadata.status, TraceStatus::Completed);
        assert!(!capture.is_active());
    }

    #[test]
    fn test_drop_aborts_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TraceStore::new(dir.path()).unwrap());
        let capture = Arc::new(TraceCapture::new());

        let run = || -> Result<(), String> {
            let scope = CaptureScope::begin(Arc::clone(&capture), "run", "agent", None)
                .unwrap()
                .with_store(Arc::clone(&store));
            scope
                .capture()
                .capture_model_interaction(ModelCapture::new("n1", 0, vec![Message::user("hi")]))
                .unwrap();
            Err(format!("node failed in {}", scope.trace_id()))
        };
        let err = run().unwrap_err();

        assert!(!capture.is_active());
        let id = err.rsplit(' ').next().unwrap();
        let saved = store.load(id).unwrap().unwrap();
        assert_eq!(saved.metadata.status, TraceStatus::Aborted);
        assert_eq!(saved.model_interactions.len(), 1);
    }

    #[test]
    fn test_drop_after_panic_aborts() {
        let capture = Arc::new(TraceCapture::new());
        let inner = Arc::clone(&capture);
        let result = std::panic::catch_unwind(move || {
            let _scope = CaptureScope::begin(inner, "run", "agent", None).unwrap();
            panic!("node exploded");
        });
        assert!(result.is_err());
        assert!(!capture.is_active());

        // The capture is reusable afterwards.
        capture.start_trace("run-2", "agent", None, vec![]).unwrap();
    }

    #[tokio::test]
    async fn test_drop_inside_runtime_persists_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TraceStore::new(dir.path()).unwrap());
        let capture = Arc::new(TraceCapture::new());

        let task_capture = Arc::clone(&capture);
        let task_store = Arc::clone(&store);
        let handle = tokio::spawn(async move {
            let scope = CaptureScope::begin(task_capture, "run", "agent", None)
                .unwrap()
                .with_store(task_store);
            let id = scope.trace_id().to_string();
            tokio::time::sleep(Duration::from_secs(60)).await;
            id
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let id = capture.current_trace_id().unwrap();
        handle.abort();
        let _ = handle.await;

        let mut saved = None;
        for _ in 0..100 {
            saved = store.load(&id).unwrap();
            if saved.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(saved.unwrap().metadata.status, TraceStatus::Aborted);
    }
}
