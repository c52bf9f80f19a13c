//! SQLite-backed metadata index over persisted traces.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, Row};

use crate::store::StoreError;
use crate::trace::{TraceMetadata, TraceQuery, TraceStatus};

/// Incrementally maintained `trace_id -> metadata` index.
///
/// The trace files stay authoritative; the index can always be rebuilt from them.
pub struct MetadataIndex {
    conn: Mutex<Connection>,
}

impl MetadataIndex {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let index = Self {
            conn: Mutex::new(conn),
        };
        index.init_schema()?;
        Ok(index)
    }

    /// Creates an in-memory index (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let index = Self {
            conn: Mutex::new(conn),
        };
        index.init_schema()?;
        Ok(index)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS trace_index (
                trace_id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                goal_id TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                completed_at INTEGER,
                status TEXT NOT NULL,
                total_tokens INTEGER NOT NULL,
                total_latency_ms INTEGER NOT NULL,
                node_count INTEGER NOT NULL,
                needs_attention INTEGER NOT NULL,
                tags TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_trace_index_started ON trace_index(started_at DESC);
            CREATE INDEX IF NOT EXISTS idx_trace_index_agent ON trace_index(agent_id);
            "#,
        )?;

        Ok(())
    }

    /// Inserts or replaces the row for `metadata.trace_id`.
    pub fn upsert(&self, metadata: &TraceMetadata) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;
        upsert_row(&conn, metadata)
    }

    pub fn remove(&self, trace_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;
        let removed = conn.execute("DELETE FROM trace_index WHERE trace_id = ?1", params![trace_id])?;
        Ok(removed > 0)
    }

    /// Filters and orders exactly like a directory scan would.
    pub fn query(&self, query: &TraceQuery) -> Result<Vec<TraceMetadata>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;

        let mut sql = String::from(
            r#"SELECT trace_id, run_id, agent_id, goal_id, started_at, completed_at, status,
               total_tokens, total_latency_ms, node_count, needs_attention, tags
               FROM trace_index WHERE 1=1"#,
        );

        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(agent) = query.agent_id.as_deref().filter(|a| !a.is_empty()) {
            sql.push_str(" AND agent_id = ?");
            params_vec.push(Box::new(agent.to_string()));
        }

        if let Some(run) = query.run_id.as_deref().filter(|r| !r.is_empty()) {
            sql.push_str(" AND run_id = ?");
            params_vec.push(Box::new(run.to_string()));
        }

        if let Some(status) = query.status {
            sql.push_str(" AND status = ?");
            params_vec.push(Box::new(status.as_str().to_string()));
        }

        // SQLite limits are signed 64-bit.
        let limit = query.effective_limit().min(i64::MAX as usize);
        sql.push_str(&format!(" ORDER BY started_at DESC LIMIT {}", limit));

        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(params_refs.as_slice(), metadata_from_row)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }

        Ok(entries)
    }

    /// Replaces the whole index with `entries` in one transaction.
    pub fn rebuild<I>(&self, entries: I) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = TraceMetadata>,
    {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Lock)?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM trace_index", [])?;
        let mut count = 0;
        for metadata in entries {
            upsert_row(&tx, &metadata)?;
            count += 1;
        }
        tx.commit()?;

        tracing::info!(entries = count, "Rebuilt trace index");
        Ok(count)
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM trace_index", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

fn upsert_row(conn: &Connection, metadata: &TraceMetadata) -> Result<(), StoreError> {
    conn.execute(
        r#"INSERT OR REPLACE INTO trace_index
           (trace_id, run_id, agent_id, goal_id, started_at, completed_at, status,
            total_tokens, total_latency_ms, node_count, needs_attention, tags)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"#,
        params![
            metadata.trace_id,
            metadata.run_id,
            metadata.agent_id,
            metadata.goal_id,
            metadata.started_at,
            metadata.completed_at,
            metadata.status.as_str(),
            metadata.total_tokens as i64,
            metadata.total_latency_ms as i64,
            metadata.node_count,
            metadata.needs_attention,
            serde_json::to_string(&metadata.tags)?,
        ],
    )?;
    Ok(())
}

fn metadata_from_row(row: &Row<'_>) -> rusqlite::Result<TraceMetadata> {
    let status: String = row.get(6)?;
    let tags: String = row.get(11)?;
    Ok(TraceMetadata {
        trace_id: row.get(0)?,
        run_id: row.get(1)?,
        agent_id: row.get(2)?,
        goal_id: row.get(3)?,
        started_at: row.get(4)?,
        completed_at: row.get(5)?,
        status: TraceStatus::parse(&status).unwrap_or_default(),
        total_tokens: row.get::<_, i64>(7)? as u64,
        total_latency_ms: row.get::<_, i64>(8)? as u64,
        node_count: row.get(9)?,
        needs_attention: row.get(10)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(id: &str, agent: &str, started_at: i64) -> TraceMetadata {
        let mut m = TraceMetadata::new("run", agent, "");
        m.trace_id = id.to_string();
        m.started_at = started_at;
        m.status = TraceStatus::Completed;
        m
    }

    #[test]
    fn test_index_upsert_and_query() {
        let index = MetadataIndex::in_memory().unwrap();
        index.upsert(&meta("t1", "a1", 100)).unwrap();
        index.upsert(&meta("t2", "a2", 200)).unwrap();
        let mut tagged = meta("t3", "a1", 300);
        tagged.tags = vec!["nightly".into()];
        tagged.needs_attention = true;
        index.upsert(&tagged).unwrap();

        let a1 = index.query(&TraceQuery::new().agent("a1")).unwrap();
        let ids: Vec<&str> = a1.iter().map(|m| m.trace_id.as_str()).collect();
        assert_eq!(ids, vec!["t3", "t1"]);
        assert_eq!(a1[0], tagged);

        let limited = index.query(&TraceQuery::new().limit(1)).unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].trace_id, "t3");
    }

    #[test]
    fn test_index_upsert_replaces() {
        let index = MetadataIndex::in_memory().unwrap();
        let mut m = meta("t1", "a1", 100);
        index.upsert(&m).unwrap();
        m.status = TraceStatus::Failed;
        index.upsert(&m).unwrap();

        assert_eq!(index.len().unwrap(), 1);
        let failed = index.query(&TraceQuery::new().status(TraceStatus::Failed)).unwrap();
        assert_eq!(failed.len(), 1);
    }

    #[test]
    fn test_index_remove_and_rebuild() {
        let index = MetadataIndex::in_memory().unwrap();
        index.upsert(&meta("t1", "a1", 100)).unwrap();
        assert!(index.remove("t1").unwrap());
        assert!(!index.remove("t1").unwrap());
        assert!(index.is_empty().unwrap());

        let rebuilt = index
            .rebuild(vec![meta("x", "a", 1), meta("y", "a", 2)])
            .unwrap();
        assert_eq!(rebuilt, 2);
        assert_eq!(index.len().unwrap(), 2);
    }
}
