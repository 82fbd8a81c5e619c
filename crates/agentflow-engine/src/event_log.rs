//! Per-run append-only event log.
//!
//! Every event gets the next sequence number of its run, starting at 0, and
//! is mirrored onto the shared `EventBus` in the same order. Streams can start
//! at any sequence: they replay what is already recorded, then follow live
//! appends until `RunCompleted` closes the log.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::watch;

use agentflow_core::event::EventBus;
use agentflow_core::types::{RunEvent, RunEventKind, RunId};

pub struct EventLog {
    run_id: RunId,
    state: Mutex<LogState>,
    /// Number of recorded events, bumped after every append.
    notify: watch::Sender<usize>,
    bus: Option<Arc<EventBus>>,
}

#[derive(Default)]
struct LogState {
    events: Vec<RunEvent>,
    closed: bool,
}

impl EventLog {
    pub fn new(run_id: RunId, bus: Option<Arc<EventBus>>) -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            run_id,
            state: Mutex::new(LogState::default()),
            notify,
            bus,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an event. Returns `None` once the log has been closed by
    /// `RunCompleted`.
    pub fn append(&self, kind: RunEventKind) -> Option<RunEvent> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }

        let event = RunEvent {
            run_id: self.run_id.clone(),
            sequence: state.events.len() as u64,
            timestamp: Utc::now(),
            kind,
        };
        if matches!(event.kind, RunEventKind::RunCompleted { .. }) {
            state.closed = true;
        }
        state.events.push(event.clone());

        // Publish under the lock so bus order matches sequence order.
        if let Some(bus) = &self.bus {
            bus.publish(event.clone());
        }
        let count = state.events.len();
        drop(state);

        self.notify.send_replace(count);
        Some(event)
    }

    /// Events with `sequence >= from`, and whether the log is closed.
    pub fn read_from(&self, from: u64) -> (Vec<RunEvent>, bool) {
        let state = self.lock();
        let start = (from as usize).min(state.events.len());
        (state.events[start..].to_vec(), state.closed)
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.lock().events.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Stream events from `from` onwards. The stream ends after the event
    /// that closes the log.
    pub fn stream(self: &Arc<Self>, from: u64) -> BoxStream<'static, RunEvent> {
        let cursor = Cursor {
            log: Arc::clone(self),
            rx: self.notify.subscribe(),
            next: from,
            pending: VecDeque::new(),
            done: false,
        };

        stream::unfold(cursor, |mut c| async move {
            loop {
                if let Some(event) = c.pending.pop_front() {
                    c.next = event.sequence + 1;
                    return Some((event, c));
                }
                if c.done {
                    return None;
                }

                let (batch, closed) = c.log.read_from(c.next);
                if !batch.is_empty() {
                    c.pending.extend(batch);
                    c.done = closed;
                    continue;
                }
                if closed {
                    return None;
                }
                if c.rx.changed().await.is_err() {
                    // Sender gone: drain whatever is left and stop.
                    let (batch, _) = c.log.read_from(c.next);
                    c.pending.extend(batch);
                    c.done = true;
                }
            }
        })
        .boxed()
    }
}

struct Cursor {
    log: Arc<EventLog>,
    rx: watch::Receiver<usize>,
    next: u64,
    pending: VecDeque<RunEvent>,
    done: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_core::types::RunState;
    use std::time::Duration;

    fn started(node: &str) -> RunEventKind {
        RunEventKind::NodeStarted {
            node_id: node.into(),
            attempt: 1,
        }
    }

    fn completed() -> RunEventKind {
        RunEventKind::RunCompleted {
            state: RunState::Succeeded,
        }
    }

    #[test]
    fn test_sequences_start_at_zero_and_increase() {
        let log = EventLog::new(RunId::from_str("r1"), None);
        let a = log.append(RunEventKind::RunStarted).unwrap();
        let b = log.append(started("a")).unwrap();
        assert_eq!(a.sequence, 0);
        assert_eq!(b.sequence, 1);
        assert_eq!(b.run_id, RunId::from_str("r1"));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_completed_log_refuses_appends() {
        let log = EventLog::new(RunId::new(), None);
        log.append(completed()).unwrap();
        assert!(log.is_closed());
        assert!(log.append(started("late")).is_none());
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_read_from_past_end_is_empty() {
        let log = EventLog::new(RunId::new(), None);
        log.append(RunEventKind::RunStarted);
        let (events, closed) = log.read_from(10);
        assert!(events.is_empty());
        assert!(!closed);
    }

    #[tokio::test]
    async fn test_stream_resumes_from_sequence() {
        let log = Arc::new(EventLog::new(RunId::new(), None));
        log.append(RunEventKind::RunStarted);
        log.append(started("a"));
        log.append(started("b"));
        log.append(completed());

        let seqs: Vec<u64> = log.stream(2).map(|e| e.sequence).collect().await;
        assert_eq!(seqs, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_stream_follows_live_appends() {
        let log = Arc::new(EventLog::new(RunId::new(), None));
        log.append(RunEventKind::RunStarted);

        let writer = Arc::clone(&log);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append(started("a"));
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append(completed());
        });

        let events: Vec<RunEvent> = tokio::time::timeout(
            Duration::from_secs(5),
            log.stream(0).collect::<Vec<_>>(),
        )
        .await
        .unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert!(matches!(events[2].kind, RunEventKind::RunCompleted { .. }));
    }

    #[tokio::test]
    async fn test_events_mirror_to_bus() {
        let bus = Arc::new(EventBus::new(16));
        let mut rx = bus.subscribe();
        let log = EventLog::new(RunId::new(), Some(bus));
        log.append(RunEventKind::RunStarted);
        log.append(started("a"));

        assert_eq!(rx.recv().await.unwrap().sequence, 0);
        assert_eq!(rx.recv().await.unwrap().sequence, 1);
    }
}
