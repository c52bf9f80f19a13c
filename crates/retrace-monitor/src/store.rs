//! File-backed trace storage.
//!
//! One JSON document per trace at `{base}/traces/{trace_id}.json`, optionally
//! shadowed by a SQLite [`MetadataIndex`] for listing.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::index::MetadataIndex;
use crate::trace::{ExecutionTrace, TraceMetadata, TraceQuery, TraceStatus};

const TRACES_DIR: &str = "traces";
const INDEX_FILE: &str = "index.sqlite3";

/// Errors from trace store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Index error: {0}")]
    Index(#[from] rusqlite::Error),
    #[error("Invalid trace id: {0:?}")]
    InvalidId(String),
    #[error("Lock error")]
    Lock,
    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Persists and retrieves execution traces.
pub struct TraceStore {
    base_path: PathBuf,
    traces_dir: PathBuf,
    index: Option<MetadataIndex>,
}

impl TraceStore {
    /// Opens a store rooted at `base_path`, creating the directory layout.
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_path = base_path.into();
        let traces_dir = base_path.join(TRACES_DIR);
        fs::create_dir_all(&traces_dir)?;
        Ok(Self {
            base_path,
            traces_dir,
            index: None,
        })
    }

    /// Opens a store with a SQLite index at `{base}/index.sqlite3`.
    ///
    /// The index is reconciled with the trace files on open, so writes made
    /// by index-less stores or direct file removals are picked up.
    pub fn with_index(base_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self::new(base_path)?;
        let index = MetadataIndex::open(store.base_path.join(INDEX_FILE))?;
        store.attach_index(index)
    }

    /// Opens a store with an in-memory index (for testing).
    pub fn open_in_memory_index(base_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self::new(base_path)?;
        store.attach_index(MetadataIndex::in_memory()?)
    }

    fn attach_index(mut self, index: MetadataIndex) -> Result<Self, StoreError> {
        index.rebuild(self.scan_metadata()?)?;
        self.index = Some(index);
        Ok(self)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn has_index(&self) -> bool {
        self.index.is_some()
    }

    /// Path of the document for `trace_id`.
    pub fn trace_path(&self, trace_id: &str) -> Result<PathBuf, StoreError> {
        validate_id(trace_id)?;
        Ok(self.traces_dir.join(format!("{}.json", trace_id)))
    }

    /// Writes the trace atomically, replacing any previous document with the same id.
    pub fn save(&self, trace: &ExecutionTrace) -> Result<PathBuf, StoreError> {
        let path = self.trace_path(trace.trace_id())?;
        let bytes = serde_json::to_vec_pretty(trace)?;
        write_atomic(&path, &bytes)?;

        if let Some(index) = &self.index {
            index.upsert(&trace.metadata)?;
        }

        tracing::debug!(
            trace_id = %trace.metadata.trace_id,
            path = %path.display(),
            "Saved trace"
        );
        Ok(path)
    }

    /// Loads a trace. Missing and corrupt documents both yield `None`.
    pub fn load(&self, trace_id: &str) -> Result<Option<ExecutionTrace>, StoreError> {
        let path = self.trace_path(trace_id)?;
        read_trace(&path)
    }

    /// Lists trace metadata matching `query`, newest first.
    pub fn list(&self, query: &TraceQuery) -> Result<Vec<TraceMetadata>, StoreError> {
        if let Some(index) = &self.index {
            return index.query(query);
        }

        let mut entries: Vec<TraceMetadata> = self
            .scan_metadata()?
            .into_iter()
            .filter(|m| query.matches(m))
            .collect();
        entries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        entries.truncate(query.effective_limit());
        Ok(entries)
    }

    /// Removes a trace, returning whether it existed.
    pub fn delete(&self, trace_id: &str) -> Result<bool, StoreError> {
        let path = self.trace_path(trace_id)?;
        let existed = match fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        if let Some(index) = &self.index {
            index.remove(trace_id)?;
        }

        if existed {
            tracing::debug!(trace_id, "Deleted trace");
        }
        Ok(existed)
    }

    pub fn exists(&self, trace_id: &str) -> bool {
        self.trace_path(trace_id)
            .map(|p| p.is_file())
            .unwrap_or(false)
    }

    /// Rebuilds the index from the trace files. No-op without an index.
    pub fn reindex(&self) -> Result<usize, StoreError> {
        let Some(index) = &self.index else {
            return Ok(0);
        };
        index.rebuild(self.scan_metadata()?)
    }

    /// Aggregate metrics over every stored trace.
    pub fn metrics_summary(&self) -> Result<MetricsSummary, StoreError> {
        let mut summary = MetricsSummary::default();
        let mut latency_total: u64 = 0;

        for path in self.trace_files()? {
            let Some(trace) = read_trace(&path)? else {
                continue;
            };
            summary.total_traces += 1;
            summary.total_tokens += trace.metadata.total_tokens;
            summary.total_model_calls += trace.model_interactions.len() as u64;
            summary.total_tool_calls += trace.tool_interactions.len() as u64;
            latency_total += trace.metadata.total_latency_ms;
            match trace.metadata.status {
                TraceStatus::Completed => summary.completed += 1,
                TraceStatus::Failed => summary.failed += 1,
                TraceStatus::Aborted => summary.aborted += 1,
                TraceStatus::InProgress => {}
            }
        }

        if summary.total_traces > 0 {
            summary.avg_latency_ms = latency_total as f64 / summary.total_traces as f64;
        }
        Ok(summary)
    }

    pub async fn save_async(self: &Arc<Self>, trace: ExecutionTrace) -> Result<PathBuf, StoreError> {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.save(&trace)).await?
    }

    pub async fn load_async(
        self: &Arc<Self>,
        trace_id: impl Into<String>,
    ) -> Result<Option<ExecutionTrace>, StoreError> {
        let store = Arc::clone(self);
        let trace_id = trace_id.into();
        tokio::task::spawn_blocking(move || store.load(&trace_id)).await?
    }

    pub async fn list_async(
        self: &Arc<Self>,
        query: TraceQuery,
    ) -> Result<Vec<TraceMetadata>, StoreError> {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.list(&query)).await?
    }

    pub async fn delete_async(self: &Arc<Self>, trace_id: impl Into<String>) -> Result<bool, StoreError> {
        let store = Arc::clone(self);
        let trace_id = trace_id.into();
        tokio::task::spawn_blocking(move || store.delete(&trace_id)).await?
    }

    pub async fn metrics_summary_async(self: &Arc<Self>) -> Result<MetricsSummary, StoreError> {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.metrics_summary()).await?
    }

    fn trace_files(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.traces_dir)? {
            let path = entry?.path();
            let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(true, |n| n.starts_with('.'));
            if is_json && !hidden {
                files.push(path);
            }
        }
        Ok(files)
    }

    fn scan_metadata(&self) -> Result<Vec<TraceMetadata>, StoreError> {
        let mut entries = Vec::new();
        for path in self.trace_files()? {
            match read_trace(&path) {
                Ok(Some(trace)) => entries.push(trace.metadata),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable trace");
                }
            }
        }
        Ok(entries)
    }
}

/// Aggregate metrics for the dashboard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_traces: u64,
    pub completed: u64,
    pub failed: u64,
    pub aborted: u64,
    pub total_tokens: u64,
    pub total_model_calls: u64,
    pub total_tool_calls: u64,
    pub avg_latency_ms: f64,
}

pub(crate) fn validate_id(trace_id: &str) -> Result<(), StoreError> {
    let invalid = trace_id.is_empty()
        || trace_id.contains('/')
        || trace_id.contains('\\')
        || trace_id.contains("..");
    if invalid {
        return Err(StoreError::InvalidId(trace_id.to_string()));
    }
    Ok(())
}

pub(crate) fn read_trace(path: &Path) -> Result<Option<ExecutionTrace>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    match serde_json::from_slice(&bytes) {
        Ok(trace) => Ok(Some(trace)),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Corrupt trace document");
            Ok(None)
        }
    }
}

/// Writes via a sibling temp file and rename so readers never see a partial document.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("trace");
    let tmp = parent.join(format!(".{}.tmp.{}", name, crate::trace::new_id(32)));

    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{BoundaryKind, ModelInteraction, NodeBoundary, ToolInteraction};
    use retrace_core::{Message, ModelRequest, ToolValue, Usage};
    use serde_json::json;

    fn trace_for(agent: &str, started_at: i64) -> ExecutionTrace {
        let mut trace = ExecutionTrace::new("run-1", agent, "goal-1");
        trace.metadata.started_at = started_at;
        trace
    }

    fn rich_trace() -> ExecutionTrace {
        let mut trace = ExecutionTrace::new("run-1", "agent-1", "goal-1");
        let mut enter = NodeBoundary::new("n1", BoundaryKind::Enter);
        enter.input_data.insert("query".into(), json!("weather"));
        trace.add_node_boundary(enter);

        let mut model = ModelInteraction::new(
            "n1",
            0,
            ModelRequest::new(vec![Message::user("Hello")]).with_config("temperature", 0.0),
        );
        model.response.content = "Hi there!".into();
        model.response.usage = Usage::new(10, 5);
        model.latency_ms = 42;
        trace.add_model_interaction(model);

        let mut tool = ToolInteraction::new("n1", "lookup", json!({"city": "Oslo"}));
        tool.tool_use_id = Some("toolu_9".into());
        tool.result = ToolValue::Bytes {
            data: vec![1, 2, 3],
            media_type: "image/png".into(),
        };
        trace.add_tool_interaction(tool);
        trace.add_node_boundary(NodeBoundary::new("n1", BoundaryKind::Exit));
        trace.finalize(TraceStatus::Completed);
        trace
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = TraceStore::new(dir.path()).unwrap();

        let empty = ExecutionTrace::new("run-0", "agent-0", "");
        let path = store.save(&empty).unwrap();
        assert!(path.ends_with(format!("traces/{}.json", empty.trace_id())));
        assert_eq!(store.load(empty.trace_id()).unwrap(), Some(empty));

        let rich = rich_trace();
        store.save(&rich).unwrap();
        assert_eq!(store.load(rich.trace_id()).unwrap(), Some(rich));
    }

    #[test]
    fn test_save_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = TraceStore::new(dir.path()).unwrap();
        let mut trace = trace_for("a1", 1);
        store.save(&trace).unwrap();
        trace.metadata.tags.push("second".into());
        store.save(&trace).unwrap();

        let loaded = store.load(trace.trace_id()).unwrap().unwrap();
        assert_eq!(loaded.metadata.tags, vec!["second"]);
        assert_eq!(store.list(&TraceQuery::new()).unwrap().len(), 1);
    }

    #[test]
    fn test_load_missing_and_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = TraceStore::new(dir.path()).unwrap();
        assert_eq!(store.load("nope").unwrap(), None);

        fs::write(store.trace_path("broken").unwrap(), b"{not json").unwrap();
        assert_eq!(store.load("broken").unwrap(), None);
        assert!(store.list(&TraceQuery::new()).unwrap().is_empty());
    }

    #[test]
    fn test_list_filters_and_orders() {
        let dir = tempfile::tempdir().unwrap();
        let store = TraceStore::new(dir.path()).unwrap();

        let old = trace_for("a1", 1_000);
        let new = trace_for("a1", 3_000);
        let other = trace_for("a2", 2_000);
        for trace in [&old, &new, &other] {
            store.save(trace).unwrap();
        }

        let listed = store.list(&TraceQuery::new().agent("a1")).unwrap();
        let ids: Vec<&str> = listed.iter().map(|m| m.trace_id.as_str()).collect();
        assert_eq!(ids, vec![new.trace_id(), old.trace_id()]);

        let limited = store.list(&TraceQuery::new().limit(2)).unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].trace_id, new.trace_id());
        assert_eq!(limited[1].trace_id, other.trace_id());
    }

    #[test]
    fn test_list_with_index_matches_scan() {
        let dir = tempfile::tempdir().unwrap();
        let plain = TraceStore::new(dir.path()).unwrap();
        let mut done = trace_for("a1", 10);
        done.finalize(TraceStatus::Completed);
        plain.save(&done).unwrap();
        plain.save(&trace_for("a1", 20)).unwrap();
        plain.save(&trace_for("a2", 30)).unwrap();

        let indexed = TraceStore::open_in_memory_index(dir.path()).unwrap();
        assert!(indexed.has_index());

        for query in [
            TraceQuery::new(),
            TraceQuery::new().agent("a1"),
            TraceQuery::new().status(TraceStatus::Completed),
            TraceQuery::new().limit(1),
        ] {
            assert_eq!(indexed.list(&query).unwrap(), plain.list(&query).unwrap());
        }

        indexed.delete(done.trace_id()).unwrap();
        assert!(indexed
            .list(&TraceQuery::new().status(TraceStatus::Completed))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_with_index_persists() {
        let dir = tempfile::tempdir().unwrap();
        let trace = trace_for("a1", 5);
        {
            let store = TraceStore::with_index(dir.path()).unwrap();
            store.save(&trace).unwrap();
        }
        assert!(dir.path().join(INDEX_FILE).exists());

        let reopened = TraceStore::with_index(dir.path()).unwrap();
        let listed = reopened.list(&TraceQuery::new()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].trace_id, trace.trace_id());
    }

    #[test]
    fn test_with_index_reconciles_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let first = trace_for("a1", 5);
        let removed = trace_for("a1", 6);
        {
            let store = TraceStore::with_index(dir.path()).unwrap();
            store.save(&first).unwrap();
            store.save(&removed).unwrap();
        }

        // Written behind the index's back.
        let plain = TraceStore::new(dir.path()).unwrap();
        let added = trace_for("a2", 7);
        plain.save(&added).unwrap();
        fs::remove_file(plain.trace_path(removed.trace_id()).unwrap()).unwrap();

        let reopened = TraceStore::with_index(dir.path()).unwrap();
        let listed = reopened.list(&TraceQuery::new()).unwrap();
        assert_eq!(listed, plain.list(&TraceQuery::new()).unwrap());
        let ids: Vec<&str> = listed.iter().map(|m| m.trace_id.as_str()).collect();
        assert_eq!(ids, vec![added.trace_id(), first.trace_id()]);
    }

    #[test]
    fn test_delete_and_exists() {
        let dir = tempfile::tempdir().unwrap();
        let store = TraceStore::new(dir.path()).unwrap();
        let trace = trace_for("a1", 1);
        store.save(&trace).unwrap();

        assert!(store.exists(trace.trace_id()));
        assert!(store.delete(trace.trace_id()).unwrap());
        assert!(!store.exists(trace.trace_id()));
        assert!(!store.delete(trace.trace_id()).unwrap());
    }

    #[test]
    fn test_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = TraceStore::new(dir.path()).unwrap();
        for id in ["../escape", "a/b", "a\\b", ""] {
            assert!(matches!(store.load(id), Err(StoreError::InvalidId(_))));
        }
        assert!(!store.exists("../escape"));
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = TraceStore::new(dir.path()).unwrap();
        store.save(&rich_trace()).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path().join(TRACES_DIR))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with(".json"));
    }

    #[test]
    fn test_metrics_summary() {
        let dir = tempfile::tempdir().unwrap();
        let store = TraceStore::new(dir.path()).unwrap();
        store.save(&rich_trace()).unwrap();
        let mut failed = trace_for("a1", 1);
        failed.finalize(TraceStatus::Failed);
        store.save(&failed).unwrap();

        let summary = store.metrics_summary().unwrap();
        assert_eq!(summary.total_traces, 2);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.total_tokens, 15);
        assert_eq!(summary.total_model_calls, 1);
        assert_eq!(summary.total_tool_calls, 1);
        assert!((summary.avg_latency_ms - 21.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_async_variants() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TraceStore::new(dir.path()).unwrap());
        let trace = rich_trace();
        let id = trace.trace_id().to_string();

        store.save_async(trace.clone()).await.unwrap();
        assert_eq!(store.load_async(id.as_str()).await.unwrap(), Some(trace));
        assert_eq!(store.list_async(TraceQuery::new()).await.unwrap().len(), 1);
        assert_eq!(store.metrics_summary_async().await.unwrap().total_traces, 1);
        assert!(store.delete_async(id.as_str()).await.unwrap());
        assert_eq!(store.load_async(id).await.unwrap(), None);
    }
}
