//! Ready-set scheduler.
//!
//! A node becomes ready once every upstream node is terminal. Ready nodes are
//! dispatched in declaration order while the run's concurrency budget allows;
//! each dispatched node runs as its own task that resolves the cache, invokes
//! the runner and applies the retry policy. The loop ends when nothing is
//! ready and nothing is in flight.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use agentflow_core::config::EngineConfig;
use agentflow_core::error::{FlowError, Result};
use agentflow_core::types::{
    CacheEntry, FailureKind, Fingerprint, Outputs, RunEventKind, RunId, RunState, TaskFailure,
    TaskResult, TaskStatus,
};
use agentflow_core::workflow::NodeDefinition;

use crate::cache::{CacheLookup, ResultCache};
use crate::fingerprint::{fingerprint_scoped, VersionScope};
use crate::graph::WorkflowGraph;
use crate::metrics::RunRecorder;
use crate::recovery::{RecoveryManager, RetryDecision};
use crate::runner::{is_cancellation, TaskRunner};

/// Node results of one run. Nodes appear once dispatched.
#[derive(Default)]
pub struct TaskTable {
    results: RwLock<BTreeMap<String, TaskResult>>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, result: TaskResult) {
        self.results
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(result.node_id.clone(), result);
    }

    pub fn get(&self, node_id: &str) -> Option<TaskResult> {
        self.results
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node_id)
            .cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, TaskResult> {
        self.results
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Everything the scheduler needs to drive one run.
pub struct RunContext {
    pub run_id: RunId,
    pub graph: Arc<WorkflowGraph>,
    pub inputs: Outputs,
    pub recorder: Arc<RunRecorder>,
    pub table: Arc<TaskTable>,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(
        run_id: RunId,
        graph: Arc<WorkflowGraph>,
        inputs: Outputs,
        recorder: Arc<RunRecorder>,
    ) -> Self {
        Self {
            run_id,
            graph,
            inputs,
            recorder,
            table: Arc::new(TaskTable::new()),
            cancel: CancellationToken::new(),
        }
    }
}

pub struct Scheduler {
    runner: TaskRunner,
    cache: ResultCache,
    recovery: RecoveryManager,
    max_concurrency: usize,
    default_timeout: Duration,
    /// Shared across every run driven by this scheduler.
    global_limit: Option<Arc<Semaphore>>,
}

impl Scheduler {
    pub fn new(
        runner: TaskRunner,
        cache: ResultCache,
        recovery: RecoveryManager,
        config: &EngineConfig,
    ) -> Self {
        Self {
            runner,
            cache,
            recovery,
            max_concurrency: config.max_concurrency.max(1),
            default_timeout: Duration::from_secs(config.default_timeout_secs),
            global_limit: config
                .global_concurrency
                .map(|n| Arc::new(Semaphore::new(n.max(1)))),
        }
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    /// Drive a run until every reachable node is terminal or the run is
    /// cancelled, then return the run's terminal state.
    pub async fn execute(&self, ctx: &RunContext) -> RunState {
        let graph = &ctx.graph;
        let n = graph.len();

        let mut waiting: Vec<usize> = (0..n).map(|i| graph.upstream(i).len()).collect();
        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| waiting[i] == 0).collect();
        let mut settled: Vec<Option<TaskResult>> = vec![None; n];
        let mut in_flight = FuturesUnordered::new();

        info!(
            run_id = %ctx.run_id,
            nodes = n,
            max_concurrency = self.max_concurrency,
            "Scheduling run"
        );

        loop {
            while in_flight.len() < self.max_concurrency && !ctx.cancel.is_cancelled() {
                let Some(idx) = ready.pop_first() else {
                    break;
                };
                let node = graph.node(idx);

                match resolve_inputs(ctx, idx, &settled) {
                    Ok(inputs) => {
                        debug!(run_id = %ctx.run_id, node_id = %node.id, "Dispatching node");
                        let job = self.job(ctx, node, inputs);
                        let handle = tokio::spawn(job.run());
                        in_flight.push(async move { (idx, handle.await) });
                    }
                    Err(e) => {
                        let result = skip(ctx, node, TaskFailure::from(&e));
                        release(graph, idx, result, &mut settled, &mut waiting, &mut ready);
                    }
                }
            }

            if in_flight.is_empty() {
                break;
            }

            let next = if ctx.cancel.is_cancelled() {
                in_flight.next().await
            } else {
                tokio::select! {
                    next = in_flight.next() => next,
                    _ = ctx.cancel.cancelled() => {
                        info!(run_id = %ctx.run_id, "Cancel observed, draining in-flight nodes");
                        continue;
                    }
                }
            };
            let Some((idx, joined)) = next else {
                break;
            };

            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    let node = graph.node(idx);
                    error!(run_id = %ctx.run_id, node_id = %node.id, error = %e, "Node task aborted");
                    let failure = TaskFailure::new(FailureKind::Internal, e.to_string(), false);
                    let mut result = TaskResult::new(node.id.clone(), TaskStatus::Failed);
                    result.finished_at = Some(Utc::now());
                    result.error = Some(failure.clone());
                    ctx.table.set(result.clone());
                    ctx.recorder.record(RunEventKind::NodeFailed {
                        node_id: node.id.clone(),
                        attempts: 0,
                        error: failure,
                    });
                    result
                }
            };
            release(graph, idx, result, &mut settled, &mut waiting, &mut ready);
        }

        let cancelled = ctx.cancel.is_cancelled();
        self.recovery
            .verdict(graph, &ctx.table.snapshot(), cancelled)
    }

    fn job(&self, ctx: &RunContext, node: &NodeDefinition, inputs: Outputs) -> NodeJob {
        let definition = ctx.graph.definition();
        NodeJob {
            run_id: ctx.run_id.clone(),
            workflow_id: definition.id.clone(),
            workflow_version: definition.version,
            node: node.clone(),
            inputs,
            timeout: node
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(self.default_timeout),
            runner: self.runner.clone(),
            cache: self.cache.clone(),
            recovery: self.recovery.clone(),
            recorder: Arc::clone(&ctx.recorder),
            table: Arc::clone(&ctx.table),
            cancel: ctx.cancel.clone(),
            global_limit: self.global_limit.clone(),
        }
    }
}

/// Record a settled node and make its dependents ready where possible.
fn release(
    graph: &WorkflowGraph,
    idx: usize,
    result: TaskResult,
    settled: &mut [Option<TaskResult>],
    waiting: &mut [usize],
    ready: &mut BTreeSet<usize>,
) {
    settled[idx] = Some(result);
    for &d in graph.downstream(idx) {
        waiting[d] = waiting[d].saturating_sub(1);
        if waiting[d] == 0 {
            ready.insert(d);
        }
    }
}

/// Gather a node's inputs: upstream output, then run input, then default.
fn resolve_inputs(
    ctx: &RunContext,
    idx: usize,
    settled: &[Option<TaskResult>],
) -> Result<Outputs> {
    let graph = &ctx.graph;
    let node = graph.node(idx);
    let mut inputs = Outputs::new();

    for port in &node.inputs {
        let from_edge = graph.incoming_edge(idx, &port.name).and_then(|edge| {
            let upstream = graph.index_of(&edge.from)?;
            settled[upstream]
                .as_ref()
                .filter(|r| r.status.produced_output())
                .and_then(|r| r.outputs.get(&edge.from_port).cloned())
        });

        let value = from_edge
            .or_else(|| {
                port.run_input
                    .as_ref()
                    .and_then(|key| ctx.inputs.get(key).cloned())
            })
            .or_else(|| port.default.clone());

        match value {
            Some(v) => {
                inputs.insert(port.name.clone(), v);
            }
            None if port.required => {
                return Err(FlowError::InputResolution {
                    node: node.id.clone(),
                    port: port.name.clone(),
                });
            }
            None => {}
        }
    }
    Ok(inputs)
}

/// Mark a node skipped without invoking it.
fn skip(ctx: &RunContext, node: &NodeDefinition, failure: TaskFailure) -> TaskResult {
    debug!(run_id = %ctx.run_id, node_id = %node.id, reason = %failure, "Skipping node");
    let mut result = TaskResult::new(node.id.clone(), TaskStatus::Skipped);
    result.finished_at = Some(Utc::now());
    result.error = Some(failure.clone());
    ctx.table.set(result.clone());
    ctx.recorder.record(RunEventKind::NodeSkipped {
        node_id: node.id.clone(),
        reason: failure.message,
    });
    result
}

/// One dispatched node, owned by its spawned task.
struct NodeJob {
    run_id: RunId,
    workflow_id: String,
    workflow_version: u32,
    node: NodeDefinition,
    inputs: Outputs,
    timeout: Duration,
    runner: TaskRunner,
    cache: ResultCache,
    recovery: RecoveryManager,
    recorder: Arc<RunRecorder>,
    table: Arc<TaskTable>,
    cancel: CancellationToken,
    global_limit: Option<Arc<Semaphore>>,
}

impl NodeJob {
    async fn run(self) -> TaskResult {
        let scope = self.cache.version_scoped().then(|| VersionScope {
            workflow_id: &self.workflow_id,
            version: self.workflow_version,
        });
        let fp = fingerprint_scoped(&self.node, &self.inputs, scope);

        if self.cache.is_enabled() {
            match self.cache.lookup(&fp).await {
                CacheLookup::Hit(entry) => return self.cached(fp, entry.outputs),
                CacheLookup::Miss => self.recorder.record_cache_miss(),
                CacheLookup::Unavailable => self.recorder.record_cache_error(),
            }
        }

        let _permit = match &self.global_limit {
            Some(limit) => tokio::select! {
                permit = Arc::clone(limit).acquire_owned() => permit.ok(),
                _ = self.cancel.cancelled() => return self.interrupted(fp, None, 0),
            },
            None => None,
        };

        if self.cancel.is_cancelled() {
            return self.interrupted(fp, None, 0);
        }

        let node_id = self.node.id.clone();
        let started_at = Utc::now();
        let started = Instant::now();
        let mut attempt = 1;

        let mut running = TaskResult::new(node_id.clone(), TaskStatus::Running);
        running.fingerprint = Some(fp.clone());
        running.started_at = Some(started_at);
        running.attempts = attempt;
        self.table.set(running.clone());
        self.recorder.record(RunEventKind::NodeStarted {
            node_id: node_id.clone(),
            attempt,
        });

        loop {
            if self.cancel.is_cancelled() {
                return self.interrupted(fp, Some(started_at), attempt - 1);
            }
            self.recorder.record_invocation();
            let outcome = self
                .runner
                .run(
                    &self.run_id,
                    &self.node,
                    self.inputs.clone(),
                    attempt,
                    self.timeout,
                    &self.cancel,
                )
                .await;

            if outcome.status == TaskStatus::Succeeded {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                let mut result = outcome;
                result.fingerprint = Some(fp.clone());
                result.started_at = Some(started_at);

                let entry = CacheEntry::new(
                    fp,
                    self.workflow_id.clone(),
                    self.workflow_version,
                    node_id.clone(),
                    result.outputs.clone(),
                    self.cache.default_ttl_secs(),
                );
                self.cache.store(entry).await;

                self.table.set(result.clone());
                self.recorder.record(RunEventKind::NodeSucceeded {
                    node_id,
                    attempts: attempt,
                    elapsed_ms,
                });
                return result;
            }

            if is_cancellation(&outcome) {
                return self.interrupted(fp, Some(started_at), attempt);
            }

            let failure = outcome.error.clone().unwrap_or_else(|| {
                TaskFailure::new(FailureKind::Internal, "attempt failed without detail", false)
            });

            match self.recovery.should_retry(&self.node, attempt, &failure) {
                RetryDecision::Retry { delay } => {
                    let backoff_ms = delay.as_millis() as u64;
                    warn!(
                        run_id = %self.run_id,
                        node_id = %node_id,
                        attempt,
                        backoff_ms,
                        error = %failure,
                        "Node attempt failed, retrying"
                    );
                    attempt += 1;
                    running.attempts = attempt;
                    self.table.set(running.clone());
                    self.recorder.record(RunEventKind::NodeRetried {
                        node_id: node_id.clone(),
                        attempt,
                        delay_ms: backoff_ms,
                        error: failure.message,
                    });

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => {
                            return self.interrupted(fp, Some(started_at), attempt - 1);
                        }
                    }
                }
                RetryDecision::GiveUp => {
                    warn!(
                        run_id = %self.run_id,
                        node_id = %node_id,
                        attempts = attempt,
                        critical = self.node.critical,
                        error = %failure,
                        "Node failed"
                    );
                    let mut result = outcome;
                    result.fingerprint = Some(fp);
                    result.started_at = Some(started_at);
                    result.attempts = attempt;
                    self.table.set(result.clone());
                    self.recorder.record(RunEventKind::NodeFailed {
                        node_id,
                        attempts: attempt,
                        error: failure,
                    });
                    return result;
                }
            }
        }
    }

    fn cached(&self, fp: Fingerprint, outputs: Outputs) -> TaskResult {
        debug!(run_id = %self.run_id, node_id = %self.node.id, fingerprint = %fp, "Cache hit");
        let now = Utc::now();
        let mut result = TaskResult::new(self.node.id.clone(), TaskStatus::Cached);
        result.fingerprint = Some(fp.clone());
        result.outputs = outputs;
        result.started_at = Some(now);
        result.finished_at = Some(now);
        self.table.set(result.clone());
        self.recorder.record(RunEventKind::NodeCached {
            node_id: self.node.id.clone(),
            fingerprint: fp,
        });
        result
    }

    /// The run was cancelled while this node was waiting or running.
    fn interrupted(
        &self,
        fp: Fingerprint,
        started_at: Option<chrono::DateTime<Utc>>,
        attempts: u32,
    ) -> TaskResult {
        let failure = TaskFailure::cancelled();
        let mut result = TaskResult::new(self.node.id.clone(), TaskStatus::Skipped);
        result.fingerprint = Some(fp);
        result.started_at = started_at;
        result.finished_at = Some(Utc::now());
        result.attempts = attempts;
        result.error = Some(failure.clone());
        self.table.set(result.clone());
        self.recorder.record(RunEventKind::NodeSkipped {
            node_id: self.node.id.clone(),
            reason: failure.message,
        });
        result
    }
}
