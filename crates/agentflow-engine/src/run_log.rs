use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use agentflow_core::event::EventBus;
use agentflow_core::types::{RunEvent, RunEventKind, RunId};

/// JSONL run logger.
///
/// Subscribes to the EventBus and appends one JSON object per event to
/// `{log_dir}/{run_id}.jsonl`. Lines are flushed as they are written, so a
/// crash never loses an event that was already logged.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
    only: Option<RunId>,
    rx: broadcast::Receiver<RunEvent>,
}

/// A single log entry written to the JSONL file.
#[derive(Debug, Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    sequence: u64,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl LogEntry {
    fn from_event(event: &RunEvent) -> Self {
        let mut detail = serde_json::to_value(&event.kind).unwrap_or_default();
        let mut event_type = String::new();
        let mut node_id = None;
        if let serde_json::Value::Object(map) = &mut detail {
            if let Some(serde_json::Value::String(t)) = map.remove("type") {
                event_type = t;
            }
            if let Some(serde_json::Value::String(n)) = map.remove("node_id") {
                node_id = Some(n);
            }
        }
        let detail = match detail {
            serde_json::Value::Object(map) if map.is_empty() => None,
            other => Some(other),
        };

        Self {
            timestamp: event.timestamp.to_rfc3339(),
            run_id: event.run_id.0.clone(),
            sequence: event.sequence,
            event_type,
            node_id,
            detail,
        }
    }
}

impl RunLogger {
    /// Subscribe to `event_bus` now so no event published after this call is
    /// missed.
    ///
    /// `level` controls verbosity: 1 = run lifecycle, 2 = + node outcomes,
    /// 3 = every event.
    pub fn new(log_dir: PathBuf, level: u8, event_bus: &EventBus) -> Self {
        Self {
            log_dir,
            level,
            only: None,
            rx: event_bus.subscribe(),
        }
    }

    /// Log a single run and stop after it completes.
    pub fn only(mut self, run_id: RunId) -> Self {
        self.only = Some(run_id);
        self
    }

    pub fn log_path(log_dir: &Path, run_id: &RunId) -> PathBuf {
        log_dir.join(format!("{}.jsonl", run_id))
    }

    /// Run the logger until cancelled, the bus closes, or the selected run
    /// completes.
    pub async fn run(mut self, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, path = %self.log_dir.display(), "Failed to create log directory");
            return;
        }
        info!(path = %self.log_dir.display(), level = self.level, "RunLogger started");

        let mut files: HashMap<RunId, BufWriter<File>> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = self.rx.recv() => {
                    match result {
                        Ok(event) => {
                            if self.only.as_ref().is_some_and(|id| id != &event.run_id) {
                                continue;
                            }
                            let completed = matches!(event.kind, RunEventKind::RunCompleted { .. });

                            if self.should_log(&event.kind) {
                                if let Err(e) = self.write(&mut files, &event).await {
                                    error!(run_id = %event.run_id, error = %e, "Failed to write log entry");
                                }
                            }

                            if completed {
                                if let Some(mut writer) = files.remove(&event.run_id) {
                                    writer.flush().await.ok();
                                }
                                if self.only.is_some() {
                                    break;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        for (_, mut writer) in files {
            writer.flush().await.ok();
        }
        debug!("RunLogger finished");
    }

    async fn write(
        &self,
        files: &mut HashMap<RunId, BufWriter<File>>,
        event: &RunEvent,
    ) -> std::io::Result<()> {
        if !files.contains_key(&event.run_id) {
            let path = Self::log_path(&self.log_dir, &event.run_id);
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            debug!(path = %path.display(), "Opened run log");
            files.insert(event.run_id.clone(), BufWriter::new(file));
        }
        let Some(writer) = files.get_mut(&event.run_id) else {
            return Ok(());
        };

        let json = serde_json::to_string(&LogEntry::from_event(event))?;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await
    }

    /// Whether an event passes the configured level.
    fn should_log(&self, kind: &RunEventKind) -> bool {
        match kind {
            RunEventKind::RunCreated { .. }
            | RunEventKind::RunStarted
            | RunEventKind::CancelRequested
            | RunEventKind::RunCompleted { .. } => true,
            RunEventKind::NodeSucceeded { .. }
            | RunEventKind::NodeFailed { .. }
            | RunEventKind::NodeCached { .. }
            | RunEventKind::NodeSkipped { .. } => self.level >= 2,
            RunEventKind::NodeStarted { .. } | RunEventKind::NodeRetried { .. } => self.level >= 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_core::types::RunState;
    use chrono::Utc;
    use std::time::Duration;

    fn event(run_id: &RunId, sequence: u64, kind: RunEventKind) -> RunEvent {
        RunEvent {
            run_id: run_id.clone(),
            sequence,
            timestamp: Utc::now(),
            kind,
        }
    }

    #[test]
    fn test_entry_shape() {
        let id = RunId::from_str("run-1");
        let entry = LogEntry::from_event(&event(
            &id,
            4,
            RunEventKind::NodeSucceeded {
                node_id: "a".into(),
                attempts: 2,
                elapsed_ms: 15,
            },
        ));
        assert_eq!(entry.event_type, "node_succeeded");
        assert_eq!(entry.node_id.as_deref(), Some("a"));
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"attempts\":2"));
        assert!(json.contains("\"sequence\":4"));

        let entry = LogEntry::from_event(&event(&id, 0, RunEventKind::RunStarted));
        assert_eq!(entry.event_type, "run_started");
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("detail"));
        assert!(!json.contains("node_id"));
    }

    #[test]
    fn test_event_level_filtering() {
        let bus = EventBus::new(4);
        let started = RunEventKind::NodeStarted {
            node_id: "a".into(),
            attempt: 1,
        };
        let skipped = RunEventKind::NodeSkipped {
            node_id: "a".into(),
            reason: "missing".into(),
        };

        let l1 = RunLogger::new(PathBuf::from("/tmp"), 1, &bus);
        assert!(l1.should_log(&RunEventKind::RunStarted));
        assert!(!l1.should_log(&skipped));
        assert!(!l1.should_log(&started));

        let l2 = RunLogger::new(PathBuf::from("/tmp"), 2, &bus);
        assert!(l2.should_log(&skipped));
        assert!(!l2.should_log(&started));

        let l3 = RunLogger::new(PathBuf::from("/tmp"), 3, &bus);
        assert!(l3.should_log(&started));
    }

    #[tokio::test]
    async fn test_writes_one_file_per_run() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new(32);
        let run_id = RunId::new();
        let other = RunId::new();
        let logger = RunLogger::new(dir.path().to_path_buf(), 2, &bus).only(run_id.clone());
        let handle = tokio::spawn(logger.run(CancellationToken::new()));

        bus.publish(event(&run_id, 0, RunEventKind::RunStarted));
        bus.publish(event(&other, 0, RunEventKind::RunStarted));
        bus.publish(event(
            &run_id,
            1,
            RunEventKind::NodeStarted {
                node_id: "a".into(),
                attempt: 1,
            },
        ));
        bus.publish(event(
            &run_id,
            2,
            RunEventKind::RunCompleted {
                state: RunState::Succeeded,
            },
        ));

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        let content =
            std::fs::read_to_string(RunLogger::log_path(dir.path(), &run_id)).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("run_started"));
        assert!(lines[1].contains("run_completed"));
        assert!(!RunLogger::log_path(dir.path(), &other).exists());
    }
}
