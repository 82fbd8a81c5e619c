use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use agentflow_core::error::{FlowError, Result};
use agentflow_core::traits::{AgentProvider, AgentRequest};
use agentflow_core::types::Outputs;

#[derive(Debug, Clone)]
enum Outcome {
    Succeed(Outputs),
    /// Return the request inputs as outputs.
    Echo,
    Fail { message: String, retryable: bool },
    /// Block until cancelled.
    Hang,
}

#[derive(Debug, Clone)]
struct Step {
    outcome: Outcome,
    delay: Duration,
}

/// Scripted behaviour for one node. Each call consumes the next step; the
/// last step repeats forever.
#[derive(Debug, Clone)]
pub struct Script {
    steps: Vec<Step>,
}

impl Script {
    fn single(outcome: Outcome) -> Self {
        Self {
            steps: vec![Step {
                outcome,
                delay: Duration::ZERO,
            }],
        }
    }

    /// Succeed with `value`. A non-object value is wrapped as `{"result": value}`.
    pub fn succeed(value: Value) -> Self {
        let outputs = match value {
            Value::Object(map) => map,
            other => {
                let mut map = Outputs::new();
                map.insert("result".into(), other);
                map
            }
        };
        Self::single(Outcome::Succeed(outputs))
    }

    pub fn echo() -> Self {
        Self::single(Outcome::Echo)
    }

    pub fn fail(message: impl Into<String>, retryable: bool) -> Self {
        Self::single(Outcome::Fail {
            message: message.into(),
            retryable,
        })
    }

    pub fn hang() -> Self {
        Self::single(Outcome::Hang)
    }

    pub fn sequence(scripts: Vec<Script>) -> Self {
        Self {
            steps: scripts.into_iter().flat_map(|s| s.steps).collect(),
        }
    }

    /// Delay every step before it resolves. Delays honour cancellation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        for step in &mut self.steps {
            step.delay = delay;
        }
        self
    }

    fn step(&self, call: usize) -> Option<&Step> {
        self.steps.get(call).or_else(|| self.steps.last())
    }
}

/// Invocation bookkeeping shared between a provider and the test.
#[derive(Debug, Default)]
pub struct CallLog {
    inner: Mutex<CallState>,
}

#[derive(Debug, Default)]
struct CallState {
    counts: HashMap<String, u32>,
    started: Vec<String>,
    finished: Vec<String>,
    active: usize,
    max_active: usize,
}

impl CallLog {
    /// Invocations of `node` so far.
    pub fn count(&self, node: &str) -> u32 {
        self.inner.lock().unwrap().counts.get(node).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.inner.lock().unwrap().counts.values().sum()
    }

    /// Highest number of simultaneously running invocations.
    pub fn max_concurrent(&self) -> usize {
        self.inner.lock().unwrap().max_active
    }

    pub fn started_order(&self) -> Vec<String> {
        self.inner.lock().unwrap().started.clone()
    }

    pub fn finished_order(&self) -> Vec<String> {
        self.inner.lock().unwrap().finished.clone()
    }

    fn start(self: &Arc<Self>, node: &str) -> (u32, ActiveGuard) {
        let mut state = self.inner.lock().unwrap();
        let count = state.counts.entry(node.to_string()).or_insert(0);
        *count += 1;
        let call = *count;
        state.started.push(node.to_string());
        state.active += 1;
        state.max_active = state.max_active.max(state.active);
        (
            call,
            ActiveGuard {
                log: Arc::clone(self),
                node: node.to_string(),
            },
        )
    }
}

/// Decrements the active count when an invocation ends, including when the
/// engine drops it on timeout.
struct ActiveGuard {
    log: Arc<CallLog>,
    node: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.log.inner.lock() {
            state.active = state.active.saturating_sub(1);
            state.finished.push(std::mem::take(&mut self.node));
        }
    }
}

/// Provider whose behaviour is scripted per node id.
pub struct ScriptedProvider {
    name: String,
    capability: String,
    priority: u32,
    available: AtomicBool,
    scripts: Mutex<HashMap<String, Script>>,
    default: Mutex<Option<Script>>,
    calls: Arc<CallLog>,
}

impl ScriptedProvider {
    pub fn new(capability: &str) -> Self {
        Self::named(capability, capability)
    }

    pub fn named(name: &str, capability: &str) -> Self {
        Self {
            name: name.to_string(),
            capability: capability.to_string(),
            priority: 100,
            available: AtomicBool::new(true),
            scripts: Mutex::new(HashMap::new()),
            default: Mutex::new(None),
            calls: Arc::new(CallLog::default()),
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Script used for nodes without their own script.
    pub fn with_default(self, script: Script) -> Self {
        *self.default.lock().unwrap() = Some(script);
        self
    }

    pub fn script(&self, node: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(node.to_string(), script);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Arc<CallLog> {
        Arc::clone(&self.calls)
    }

    fn script_for(&self, node: &str) -> Option<Script> {
        let scripts = self.scripts.lock().unwrap();
        scripts
            .get(node)
            .cloned()
            .or_else(|| self.default.lock().unwrap().clone())
    }
}

impl AgentProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> &str {
        &self.capability
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn invoke(
        &self,
        request: AgentRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<Outputs>> {
        Box::pin(async move {
            let (call, _guard) = self.calls.start(&request.node_id);
            let script = self.script_for(&request.node_id);
            let Some(step) = script.as_ref().and_then(|s| s.step(call as usize - 1)) else {
                return Err(FlowError::AgentInvocation {
                    capability: self.capability.clone(),
                    message: format!("no script for node {}", request.node_id),
                    retryable: false,
                });
            };

            if !step.delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(step.delay) => {}
                    _ = cancel.cancelled() => return Err(FlowError::Cancelled),
                }
            }

            match &step.outcome {
                Outcome::Succeed(outputs) => Ok(outputs.clone()),
                Outcome::Echo => Ok(request.inputs.clone()),
                Outcome::Fail { message, retryable } => Err(FlowError::AgentInvocation {
                    capability: self.capability.clone(),
                    message: message.clone(),
                    retryable: *retryable,
                }),
                Outcome::Hang => {
                    cancel.cancelled().await;
                    Err(FlowError::Cancelled)
                }
            }
        })
    }
}
