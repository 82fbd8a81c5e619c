//! Run coordinator: the engine's public façade.
//!
//! Owns registered workflows and live runs. A submission validates the
//! workflow, records `RunCreated`, and spawns a driver task that moves the run
//! through `Running` into a terminal state while the scheduler does the work.
//! Terminal runs stay queryable in memory for the retention window and, when
//! a run store is configured, afterwards from the store.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use agentflow_core::config::AppConfig;
use agentflow_core::error::{FlowError, Result};
use agentflow_core::event::EventBus;
use agentflow_core::traits::{CacheBackend, RunStore};
use agentflow_core::types::{
    CacheSelector, CacheStats, Fingerprint, Outputs, RunEvent, RunEventKind, RunId, RunRecord,
    RunState, TaskFailure, TaskResult, TaskStatus,
};
use agentflow_core::workflow::WorkflowDefinition;

use crate::cache::{MemoryCache, ResultCache};
use crate::graph::WorkflowGraph;
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::recovery::RecoveryManager;
use crate::registry::CapabilityRegistry;
use crate::runner::TaskRunner;
use crate::scheduler::{RunContext, Scheduler};

/// Status of one node as reported by `run_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub status: TaskStatus,
    pub attempts: u32,
    #[serde(default)]
    pub fingerprint: Option<Fingerprint>,
    #[serde(default)]
    pub error: Option<TaskFailure>,
    #[serde(default)]
    pub elapsed_ms: Option<u64>,
    pub critical: bool,
}

/// Snapshot of a run, safe to poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: RunId,
    pub workflow_id: String,
    pub workflow_version: u32,
    pub state: RunState,
    #[serde(default)]
    pub principal: Option<String>,
    /// Nodes in declaration order.
    pub nodes: Vec<NodeStatus>,
    /// Number of root nodes, i.e. independent branches.
    pub branches: usize,
    /// Outputs of sink nodes that produced a result.
    #[serde(default)]
    pub outputs: BTreeMap<String, Outputs>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metrics: Option<MetricsSnapshot>,
}

impl RunStatus {
    pub fn node(&self, node_id: &str) -> Option<&NodeStatus> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    fn build(
        record: &RunRecord,
        definition: Option<&WorkflowDefinition>,
        metrics: Option<MetricsSnapshot>,
    ) -> Self {
        let mut nodes = Vec::new();
        let mut outputs = BTreeMap::new();
        let mut branches = 0;

        match definition {
            Some(def) => {
                branches = def.root_nodes().len();
                for node in &def.nodes {
                    let result = record.results.get(&node.id);
                    nodes.push(node_status(&node.id, node.critical, result));
                    let is_sink = !def.edges.iter().any(|e| e.from == node.id);
                    if let Some(r) = result.filter(|r| is_sink && r.status.produced_output()) {
                        outputs.insert(node.id.clone(), r.outputs.clone());
                    }
                }
            }
            // Workflow no longer registered: report what was recorded.
            None => {
                for (id, result) in &record.results {
                    nodes.push(node_status(id, true, Some(result)));
                }
            }
        }

        Self {
            run_id: record.run_id.clone(),
            workflow_id: record.workflow_id.clone(),
            workflow_version: record.workflow_version,
            state: record.state,
            principal: record.principal.clone(),
            nodes,
            branches,
            outputs,
            created_at: record.created_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
            metrics,
        }
    }
}

fn node_status(node_id: &str, critical: bool, result: Option<&TaskResult>) -> NodeStatus {
    match result {
        Some(r) => NodeStatus {
            node_id: node_id.to_string(),
            status: r.status,
            attempts: r.attempts,
            fingerprint: r.fingerprint.clone(),
            error: r.error.clone(),
            elapsed_ms: r.elapsed_ms(),
            critical,
        },
        None => NodeStatus {
            node_id: node_id.to_string(),
            status: TaskStatus::Pending,
            attempts: 0,
            fingerprint: None,
            error: None,
            elapsed_ms: None,
            critical,
        },
    }
}

/// Answer to a cancel request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelAck {
    pub run_id: RunId,
    /// False when the run was already terminal.
    pub accepted: bool,
    pub state: RunState,
}

struct Lifecycle {
    state: RunState,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    cancel_requested: bool,
}

/// A live run.
struct RunHandle {
    definition: Arc<WorkflowDefinition>,
    principal: Option<String>,
    ctx: Arc<RunContext>,
    lifecycle: Mutex<Lifecycle>,
    state_tx: watch::Sender<RunState>,
}

impl RunHandle {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: RunState) {
        let mut lc = self.lifecycle();
        if lc.state.is_terminal() {
            return;
        }
        lc.state = state;
        match state {
            RunState::Running => lc.started_at = Some(Utc::now()),
            s if s.is_terminal() => lc.completed_at = Some(Utc::now()),
            _ => {}
        }
        drop(lc);
        self.state_tx.send_replace(state);
    }

    fn record(&self) -> RunRecord {
        let lc = self.lifecycle();
        RunRecord {
            run_id: self.ctx.run_id.clone(),
            workflow_id: self.definition.id.clone(),
            workflow_version: self.definition.version,
            state: lc.state,
            principal: self.principal.clone(),
            inputs: self.ctx.inputs.clone(),
            results: self.ctx.table.snapshot(),
            created_at: lc.created_at,
            started_at: lc.started_at,
            completed_at: lc.completed_at,
        }
    }

    fn status(&self) -> RunStatus {
        RunStatus::build(
            &self.record(),
            Some(&self.definition),
            Some(self.ctx.recorder.snapshot()),
        )
    }
}

/// Dependencies of a `RunCoordinator`.
pub struct CoordinatorBuilder {
    pub config: AppConfig,
    pub registry: Arc<CapabilityRegistry>,
    pub cache: Arc<dyn CacheBackend>,
    pub run_store: Option<Arc<dyn RunStore>>,
    pub event_bus: Arc<EventBus>,
}

impl CoordinatorBuilder {
    /// In-memory cache sized from `config`, no run store, fresh event bus.
    pub fn new(config: AppConfig, registry: CapabilityRegistry) -> Self {
        let cache = Arc::new(MemoryCache::from_config(&config.cache));
        let event_bus = Arc::new(EventBus::new(config.engine.event_buffer.max(1)));
        Self {
            config,
            registry: Arc::new(registry),
            cache,
            run_store: None,
            event_bus,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheBackend>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_run_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.run_store = Some(store);
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = bus;
        self
    }

    pub fn build(self) -> RunCoordinator {
        let cache = ResultCache::new(self.cache, &self.config.cache);
        let scheduler = Scheduler::new(
            TaskRunner::new(self.registry),
            cache,
            RecoveryManager::new(self.config.retry.clone()),
            &self.config.engine,
        );
        RunCoordinator {
            retention: Duration::from_secs(self.config.engine.retention_secs),
            workflows: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
            scheduler: Arc::new(scheduler),
            metrics: Arc::new(MetricsCollector::new(Some(Arc::clone(&self.event_bus)))),
            event_bus: self.event_bus,
            store: self.run_store,
        }
    }
}

pub struct RunCoordinator {
    retention: Duration,
    workflows: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
    runs: RwLock<HashMap<RunId, Arc<RunHandle>>>,
    scheduler: Arc<Scheduler>,
    metrics: Arc<MetricsCollector>,
    event_bus: Arc<EventBus>,
    store: Option<Arc<dyn RunStore>>,
}

impl RunCoordinator {
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Register (or replace) a workflow. Validation happens per submission.
    pub fn register_workflow(&self, definition: WorkflowDefinition) {
        info!(workflow_id = %definition.id, version = definition.version, "Workflow registered");
        self.workflows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(definition.id.clone(), Arc::new(definition));
    }

    pub fn workflow(&self, workflow_id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(workflow_id)
            .cloned()
    }

    /// Start a run of a registered workflow.
    ///
    /// Fails with `WorkflowNotFound` for an unknown id and with `Validation`,
    /// carrying every violation, when the graph is invalid. No run exists in
    /// either case.
    pub async fn submit_run(&self, workflow_id: &str, inputs: Outputs) -> Result<RunId> {
        self.submit_run_as(workflow_id, inputs, None).await
    }

    /// `submit_run` on behalf of an already-authorised principal.
    pub async fn submit_run_as(
        &self,
        workflow_id: &str,
        inputs: Outputs,
        principal: Option<String>,
    ) -> Result<RunId> {
        self.evict_expired();

        let definition = self
            .workflow(workflow_id)
            .ok_or_else(|| FlowError::WorkflowNotFound(workflow_id.to_string()))?;

        let graph = match WorkflowGraph::build(Arc::clone(&definition)) {
            Ok(graph) => Arc::new(graph),
            Err(e) => {
                warn!(workflow_id, error = %e, "Rejected invalid workflow");
                return Err(e);
            }
        };

        let run_id = RunId::new();
        let recorder = self.metrics.register_run(run_id.clone());
        let ctx = Arc::new(RunContext::new(run_id.clone(), graph, inputs, recorder));
        let (state_tx, _) = watch::channel(RunState::Created);
        let handle = Arc::new(RunHandle {
            definition: Arc::clone(&definition),
            principal,
            ctx,
            lifecycle: Mutex::new(Lifecycle {
                state: RunState::Created,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                cancel_requested: false,
            }),
            state_tx,
        });

        handle.ctx.recorder.record(RunEventKind::RunCreated {
            workflow_id: definition.id.clone(),
            version: definition.version,
        });
        self.runs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run_id.clone(), Arc::clone(&handle));

        if let Some(store) = &self.store {
            if let Err(e) = store.save_run(handle.record()).await {
                warn!(run_id = %run_id, error = %e, "Failed to persist run");
            }
        }

        info!(
            run_id = %run_id,
            workflow_id = %definition.id,
            version = definition.version,
            nodes = definition.nodes.len(),
            "Run created"
        );

        tokio::spawn(drive(
            Arc::clone(&self.scheduler),
            self.store.clone(),
            handle,
        ));
        Ok(run_id)
    }

    /// Register `definition` and start a run of it.
    pub async fn submit_definition(
        &self,
        definition: WorkflowDefinition,
        inputs: Outputs,
        principal: Option<String>,
    ) -> Result<RunId> {
        let workflow_id = definition.id.clone();
        self.register_workflow(definition);
        self.submit_run_as(&workflow_id, inputs, principal).await
    }

    fn handle(&self, run_id: &RunId) -> Option<Arc<RunHandle>> {
        self.runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .cloned()
    }

    /// Current state and per-node status of a run.
    pub async fn run_status(&self, run_id: &RunId) -> Result<RunStatus> {
        if let Some(handle) = self.handle(run_id) {
            return Ok(handle.status());
        }
        let record = self.load_record(run_id).await?;
        let definition = self
            .workflow(&record.workflow_id)
            .filter(|d| d.version == record.workflow_version);
        Ok(RunStatus::build(&record, definition.as_deref(), None))
    }

    async fn load_record(&self, run_id: &RunId) -> Result<RunRecord> {
        let Some(store) = &self.store else {
            return Err(FlowError::RunNotFound(run_id.to_string()));
        };
        store
            .load_run(run_id)
            .await?
            .ok_or_else(|| FlowError::RunNotFound(run_id.to_string()))
    }

    /// Events of a run from `from_sequence` on. Live runs are followed until
    /// `RunCompleted`; finished runs replay what the store holds.
    pub async fn stream_run_events(
        &self,
        run_id: &RunId,
        from_sequence: u64,
    ) -> Result<BoxStream<'static, RunEvent>> {
        if let Some(handle) = self.handle(run_id) {
            return Ok(handle.ctx.recorder.log().stream(from_sequence));
        }
        let Some(store) = &self.store else {
            return Err(FlowError::RunNotFound(run_id.to_string()));
        };
        let events = store.load_events(run_id, from_sequence).await?;
        if events.is_empty() && store.load_run(run_id).await?.is_none() {
            return Err(FlowError::RunNotFound(run_id.to_string()));
        }
        Ok(stream::iter(events).boxed())
    }

    /// Request cooperative cancellation. Repeated requests are acknowledged
    /// without further effect; terminal runs are left untouched.
    pub async fn cancel_run(&self, run_id: &RunId) -> Result<CancelAck> {
        let Some(handle) = self.handle(run_id) else {
            let record = self.load_record(run_id).await?;
            return Ok(CancelAck {
                run_id: run_id.clone(),
                accepted: false,
                state: record.state,
            });
        };

        let mut lc = handle.lifecycle();
        if lc.state.is_terminal() {
            return Ok(CancelAck {
                run_id: run_id.clone(),
                accepted: false,
                state: lc.state,
            });
        }
        if !lc.cancel_requested {
            if handle.ctx.recorder.record(RunEventKind::CancelRequested).is_none() {
                return Ok(CancelAck {
                    run_id: run_id.clone(),
                    accepted: false,
                    state: lc.state,
                });
            }
            lc.cancel_requested = true;
            handle.ctx.cancel.cancel();
            info!(run_id = %run_id, "Cancel requested");
        }
        Ok(CancelAck {
            run_id: run_id.clone(),
            accepted: true,
            state: lc.state,
        })
    }

    /// Resolve once the run is terminal.
    pub async fn wait(&self, run_id: &RunId) -> Result<RunStatus> {
        if let Some(handle) = self.handle(run_id) {
            let mut rx = handle.state_tx.subscribe();
            while !rx.borrow_and_update().is_terminal() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
            return Ok(handle.status());
        }
        self.run_status(run_id).await
    }

    /// Administrative cache invalidation.
    pub async fn invalidate_cache(&self, selector: CacheSelector) -> Result<usize> {
        let removed = self.scheduler.cache().invalidate(selector).await?;
        info!(removed, "Cache entries invalidated");
        Ok(removed)
    }

    pub async fn cache_stats(&self) -> Result<CacheStats> {
        self.scheduler.cache().stats().await
    }

    pub fn run_metrics(&self, run_id: &RunId) -> Option<MetricsSnapshot> {
        self.metrics.snapshot(run_id)
    }

    /// Drop terminal runs older than the retention window from memory.
    pub fn evict_expired(&self) -> usize {
        let retention = chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let now = Utc::now();

        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        let expired: Vec<RunId> = runs
            .iter()
            .filter(|(_, h)| {
                let lc = h.lifecycle();
                lc.state.is_terminal() && lc.completed_at.is_some_and(|at| at + retention <= now)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            runs.remove(id);
            self.metrics.remove(id);
            debug!(run_id = %id, "Evicted terminal run");
        }
        expired.len()
    }

    /// Ids of runs currently held in memory.
    pub fn run_ids(&self) -> Vec<RunId> {
        let mut ids: Vec<RunId> = self
            .runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

/// Move a run from `Created` to its terminal state.
async fn drive(scheduler: Arc<Scheduler>, store: Option<Arc<dyn RunStore>>, handle: Arc<RunHandle>) {
    let run_id = handle.ctx.run_id.clone();
    let recorder = Arc::clone(&handle.ctx.recorder);

    handle.set_state(RunState::Running);
    recorder.record(RunEventKind::RunStarted);

    let state = scheduler.execute(&handle.ctx).await;

    handle.set_state(state);
    recorder.record(RunEventKind::RunCompleted { state });

    let snapshot = recorder.snapshot();
    info!(
        run_id = %run_id,
        state = %state,
        succeeded = snapshot.nodes_succeeded,
        cached = snapshot.nodes_cached,
        failed = snapshot.nodes_failed,
        skipped = snapshot.nodes_skipped,
        "Run completed"
    );

    if let Some(store) = store {
        if let Err(e) = store.save_run(handle.record()).await {
            warn!(run_id = %run_id, error = %e, "Failed to persist run");
        }
        if let Err(e) = store.append_events(recorder.log().events()).await {
            warn!(run_id = %run_id, error = %e, "Failed to persist run events");
        }
    }
}
