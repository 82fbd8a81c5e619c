use std::path::Path;
use std::sync::Mutex;

use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use agentflow_core::error::{FlowError, Result};
use agentflow_core::traits::RunStore;
use agentflow_core::types::{RunEvent, RunId, RunRecord};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS runs (
        run_id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        workflow_version INTEGER NOT NULL,
        state TEXT NOT NULL,
        record TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_runs_workflow ON runs(workflow_id, created_at);

    CREATE TABLE IF NOT EXISTS run_events (
        run_id TEXT NOT NULL,
        sequence INTEGER NOT NULL,
        timestamp TEXT NOT NULL,
        event TEXT NOT NULL,
        PRIMARY KEY (run_id, sequence)
    );";

/// SQLite-backed run record and event log store.
pub struct SqliteRunStore {
    conn: Mutex<Connection>,
}

impl SqliteRunStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = crate::open_connection(path)?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| FlowError::Database(e.to_string()))?;
        debug!(path = %path.display(), "SQLite run store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| FlowError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| FlowError::Database(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run ids recorded for a workflow, newest first.
    pub fn list_runs(&self, workflow_id: &str, limit: usize) -> Result<Vec<RunId>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| FlowError::Database(e.to_string()))?;
        let mut stmt = conn
            .prepare(
                "SELECT run_id FROM runs
                 WHERE workflow_id = ?1
                 ORDER BY created_at DESC
                 LIMIT ?2",
            )
            .map_err(|e| FlowError::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params![workflow_id, limit as i64], |row| {
                row.get::<_, String>(0)
            })
            .map_err(|e| FlowError::Database(e.to_string()))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(RunId(row.map_err(|e| FlowError::Database(e.to_string()))?));
        }
        Ok(ids)
    }
}

impl RunStore for SqliteRunStore {
    fn save_run(&self, record: RunRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let json = serde_json::to_string(&record)?;
            let conn = self
                .conn
                .lock()
                .map_err(|e| FlowError::Database(e.to_string()))?;
            conn.execute(
                "INSERT OR REPLACE INTO runs
                 (run_id, workflow_id, workflow_version, state, record, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.run_id.0,
                    record.workflow_id,
                    record.workflow_version,
                    record.state.to_string(),
                    json,
                    record.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| FlowError::Database(e.to_string()))?;
            Ok(())
        })
    }

    fn load_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<RunRecord>>> {
        let run_id = run_id.0.clone();
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| FlowError::Database(e.to_string()))?;
            let json: Option<String> = conn
                .query_row(
                    "SELECT record FROM runs WHERE run_id = ?1",
                    params![run_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| FlowError::Database(e.to_string()))?;
            match json {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
    }

    fn append_events(&self, events: Vec<RunEvent>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut conn = self
                .conn
                .lock()
                .map_err(|e| FlowError::Database(e.to_string()))?;
            let tx = conn
                .transaction()
                .map_err(|e| FlowError::Database(e.to_string()))?;
            for event in &events {
                tx.execute(
                    "INSERT OR REPLACE INTO run_events (run_id, sequence, timestamp, event)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        event.run_id.0,
                        event.sequence as i64,
                        event.timestamp.to_rfc3339(),
                        serde_json::to_string(event)?,
                    ],
                )
                .map_err(|e| FlowError::Database(e.to_string()))?;
            }
            tx.commit().map_err(|e| FlowError::Database(e.to_string()))?;
            Ok(())
        })
    }

    fn load_events(
        &self,
        run_id: &RunId,
        from_sequence: u64,
    ) -> BoxFuture<'_, Result<Vec<RunEvent>>> {
        let run_id = run_id.0.clone();
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| FlowError::Database(e.to_string()))?;
            let mut stmt = conn
                .prepare(
                    "SELECT event FROM run_events
                     WHERE run_id = ?1 AND sequence >= ?2
                     ORDER BY sequence ASC",
                )
                .map_err(|e| FlowError::Database(e.to_string()))?;
            let rows = stmt
                .query_map(
                    params![run_id, from_sequence.min(i64::MAX as u64) as i64],
                    |row| row.get::<_, String>(0),
                )
                .map_err(|e| FlowError::Database(e.to_string()))?;

            let mut events = Vec::new();
            for row in rows {
                let json = row.map_err(|e| FlowError::Database(e.to_string()))?;
                events.push(serde_json::from_str(&json)?);
            }
            Ok(events)
        })
    }

    fn delete_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<()>> {
        let run_id = run_id.0.clone();
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| FlowError::Database(e.to_string()))?;
            conn.execute("DELETE FROM run_events WHERE run_id = ?1", params![run_id])
                .map_err(|e| FlowError::Database(e.to_string()))?;
            conn.execute("DELETE FROM runs WHERE run_id = ?1", params![run_id])
                .map_err(|e| FlowError::Database(e.to_string()))?;
            Ok(())
        })
    }
}
