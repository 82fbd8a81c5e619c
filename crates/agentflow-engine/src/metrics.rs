//! Run counters and latency summaries.
//!
//! A `RunRecorder` is the only way the scheduler and coordinator emit events:
//! it appends to the run's `EventLog` and folds each event into the run's
//! counters and the collector-wide totals.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use agentflow_core::event::EventBus;
use agentflow_core::types::{RunEvent, RunEventKind, RunId};

use crate::event_log::EventLog;

/// Most recent successful latencies kept per node.
pub const LATENCY_WINDOW: usize = 256;

/// Raw counters for one run (or for all runs).
#[derive(Debug, Clone, Default)]
struct RunMetrics {
    succeeded: u64,
    failed: u64,
    cached: u64,
    skipped: u64,
    retries: u64,
    cache_hits: u64,
    cache_misses: u64,
    cache_errors: u64,
    invocations: u64,
    /// Recent wall-clock times of successful nodes, in milliseconds.
    latencies: HashMap<String, VecDeque<u64>>,
}

impl RunMetrics {
    fn observe(&mut self, kind: &RunEventKind) {
        match kind {
            RunEventKind::NodeSucceeded {
                node_id,
                elapsed_ms,
                ..
            } => {
                self.succeeded += 1;
                let window = self.latencies.entry(node_id.clone()).or_default();
                if window.len() == LATENCY_WINDOW {
                    window.pop_front();
                }
                window.push_back(*elapsed_ms);
            }
            RunEventKind::NodeFailed { .. } => self.failed += 1,
            RunEventKind::NodeCached { .. } => {
                self.cached += 1;
                self.cache_hits += 1;
            }
            RunEventKind::NodeSkipped { .. } => self.skipped += 1,
            RunEventKind::NodeRetried { .. } => self.retries += 1,
            _ => {}
        }
    }

    fn snapshot(&self) -> MetricsSnapshot {
        let pooled: Vec<u64> = self.latencies.values().flatten().copied().collect();
        let node_latency = self
            .latencies
            .iter()
            .filter_map(|(node, window)| {
                let samples: Vec<u64> = window.iter().copied().collect();
                LatencySummary::from_samples(&samples).map(|s| (node.clone(), s))
            })
            .collect();
        MetricsSnapshot {
            nodes_succeeded: self.succeeded,
            nodes_failed: self.failed,
            nodes_cached: self.cached,
            nodes_skipped: self.skipped,
            retries: self.retries,
            cache_hits: self.cache_hits,
            cache_misses: self.cache_misses,
            cache_errors: self.cache_errors,
            invocations: self.invocations,
            latency: LatencySummary::from_samples(&pooled),
            node_latency,
        }
    }
}

/// Point-in-time view of a run's counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub nodes_succeeded: u64,
    pub nodes_failed: u64,
    pub nodes_cached: u64,
    pub nodes_skipped: u64,
    pub retries: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Lookups that failed in the backend and were treated as misses.
    pub cache_errors: u64,
    /// Provider invocations, counting every attempt.
    pub invocations: u64,
    /// Over the recent window of every node.
    #[serde(default)]
    pub latency: Option<LatencySummary>,
    #[serde(default)]
    pub node_latency: BTreeMap<String, LatencySummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub count: usize,
    pub min_ms: u64,
    pub max_ms: u64,
    pub mean_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
}

impl LatencySummary {
    pub fn from_samples(samples: &[u64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_unstable();
        let n = sorted.len();
        let sum: u64 = sorted.iter().sum();
        Some(Self {
            count: n,
            min_ms: sorted[0],
            max_ms: sorted[n - 1],
            mean_ms: sum / n as u64,
            p50_ms: sorted[n / 2],
            p95_ms: sorted[(n * 95 / 100).min(n - 1)],
        })
    }
}

fn lock(m: &Mutex<RunMetrics>) -> std::sync::MutexGuard<'_, RunMetrics> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Event log plus counters for one run.
pub struct RunRecorder {
    log: Arc<EventLog>,
    metrics: Mutex<RunMetrics>,
    totals: Arc<Mutex<RunMetrics>>,
}

impl RunRecorder {
    /// A recorder not attached to any collector.
    pub fn new(log: Arc<EventLog>) -> Self {
        Self {
            log,
            metrics: Mutex::new(RunMetrics::default()),
            totals: Arc::new(Mutex::new(RunMetrics::default())),
        }
    }

    pub fn run_id(&self) -> &RunId {
        self.log.run_id()
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    /// Append an event and count it. Returns `None` if the run already
    /// completed.
    pub fn record(&self, kind: RunEventKind) -> Option<RunEvent> {
        let event = self.log.append(kind)?;
        self.apply(|m| m.observe(&event.kind));
        Some(event)
    }

    pub fn record_cache_miss(&self) {
        self.apply(|m| m.cache_misses += 1);
    }

    pub fn record_cache_error(&self) {
        self.apply(|m| {
            m.cache_errors += 1;
            m.cache_misses += 1;
        });
    }

    pub fn record_invocation(&self) {
        self.apply(|m| m.invocations += 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        lock(&self.metrics).snapshot()
    }

    fn apply(&self, f: impl Fn(&mut RunMetrics)) {
        f(&mut lock(&self.metrics));
        f(&mut lock(&self.totals));
    }
}

/// Registry of per-run recorders plus engine-wide totals.
pub struct MetricsCollector {
    runs: RwLock<HashMap<RunId, Arc<RunRecorder>>>,
    totals: Arc<Mutex<RunMetrics>>,
    bus: Option<Arc<EventBus>>,
}

impl MetricsCollector {
    pub fn new(bus: Option<Arc<EventBus>>) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            totals: Arc::new(Mutex::new(RunMetrics::default())),
            bus,
        }
    }

    /// Create the event log and recorder for a new run.
    pub fn register_run(&self, run_id: RunId) -> Arc<RunRecorder> {
        let log = Arc::new(EventLog::new(run_id.clone(), self.bus.clone()));
        let recorder = Arc::new(RunRecorder {
            log,
            metrics: Mutex::new(RunMetrics::default()),
            totals: Arc::clone(&self.totals),
        });
        self.runs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run_id, Arc::clone(&recorder));
        recorder
    }

    pub fn recorder(&self, run_id: &RunId) -> Option<Arc<RunRecorder>> {
        self.runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .cloned()
    }

    pub fn snapshot(&self, run_id: &RunId) -> Option<MetricsSnapshot> {
        self.recorder(run_id).map(|r| r.snapshot())
    }

    /// Counters summed over every run recorded since startup.
    pub fn totals(&self) -> MetricsSnapshot {
        lock(&self.totals).snapshot()
    }

    pub fn remove(&self, run_id: &RunId) -> Option<Arc<RunRecorder>> {
        self.runs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run_id)
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_core::types::{FailureKind, Fingerprint, TaskFailure};

    #[test]
    fn test_latency_summary() {
        assert!(LatencySummary::from_samples(&[]).is_none());
        let s = LatencySummary::from_samples(&[30, 10, 20, 40]).unwrap();
        assert_eq!(s.count, 4);
        assert_eq!(s.min_ms, 10);
        assert_eq!(s.max_ms, 40);
        assert_eq!(s.mean_ms, 25);
        assert_eq!(s.p50_ms, 30);
        assert_eq!(s.p95_ms, 40);
    }

    #[test]
    fn test_counters_follow_events() {
        let collector = MetricsCollector::default();
        let recorder = collector.register_run(RunId::from_str("r"));

        recorder.record(RunEventKind::NodeCached {
            node_id: "a".into(),
            fingerprint: Fingerprint("fp".into()),
        });
        recorder.record_cache_miss();
        recorder.record_invocation();
        recorder.record(RunEventKind::NodeRetried {
            node_id: "b".into(),
            attempt: 2,
            delay_ms: 10,
            error: "timeout".into(),
        });
        recorder.record_invocation();
        recorder.record(RunEventKind::NodeSucceeded {
            node_id: "b".into(),
            attempts: 2,
            elapsed_ms: 12,
        });
        recorder.record(RunEventKind::NodeFailed {
            node_id: "c".into(),
            attempts: 1,
            error: TaskFailure::new(FailureKind::AgentInvocation, "bad", false),
        });

        let snap = collector.snapshot(&RunId::from_str("r")).unwrap();
        assert_eq!(snap.nodes_cached, 1);
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.cache_misses, 1);
        assert_eq!(snap.retries, 1);
        assert_eq!(snap.invocations, 2);
        assert_eq!(snap.nodes_succeeded, 1);
        assert_eq!(snap.nodes_failed, 1);
        assert_eq!(snap.latency.unwrap().max_ms, 12);
        assert_eq!(recorder.log().len(), 4);
    }

    #[test]
    fn test_totals_span_runs() {
        let collector = MetricsCollector::default();
        for _ in 0..3 {
            let r = collector.register_run(RunId::new());
            r.record_invocation();
            r.record_cache_error();
        }
        let totals = collector.totals();
        assert_eq!(totals.invocations, 3);
        assert_eq!(totals.cache_errors, 3);
        assert_eq!(totals.cache_misses, 3);
    }

    #[test]
    fn test_latency_is_windowed_per_node() {
        let collector = MetricsCollector::default();
        let recorder = collector.register_run(RunId::new());
        for i in 0..(LATENCY_WINDOW as u64 + 50) {
            recorder.record(RunEventKind::NodeSucceeded {
                node_id: "slow".into(),
                attempts: 1,
                elapsed_ms: 1000 + i,
            });
        }
        recorder.record(RunEventKind::NodeSucceeded {
            node_id: "fast".into(),
            attempts: 1,
            elapsed_ms: 5,
        });

        let totals = collector.totals();
        assert_eq!(totals.nodes_succeeded, LATENCY_WINDOW as u64 + 51);
        let slow = &totals.node_latency["slow"];
        assert_eq!(slow.count, LATENCY_WINDOW);
        assert_eq!(slow.min_ms, 1050);
        assert_eq!(totals.node_latency["fast"].max_ms, 5);
        assert_eq!(totals.latency.unwrap().count, LATENCY_WINDOW + 1);

        let run = recorder.snapshot();
        assert_eq!(run.node_latency.len(), 2);
        assert_eq!(run.node_latency["slow"].count, LATENCY_WINDOW);
    }

    #[test]
    fn test_remove() {
        let collector = MetricsCollector::default();
        let id = RunId::new();
        collector.register_run(id.clone());
        assert!(collector.remove(&id).is_some());
        assert!(collector.snapshot(&id).is_none());
    }
}
