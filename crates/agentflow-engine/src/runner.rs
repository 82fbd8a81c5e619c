use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use agentflow_core::error::FlowError;
use agentflow_core::traits::AgentRequest;
use agentflow_core::types::{FailureKind, Outputs, RunId, TaskFailure, TaskResult, TaskStatus};
use agentflow_core::workflow::NodeDefinition;

use crate::registry::CapabilityRegistry;

/// Deadline used when `now + timeout` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Invokes a node's capability exactly once under a wall-clock timeout.
///
/// No caching and no retries happen here; the scheduler and recovery manager
/// own those.
#[derive(Clone)]
pub struct TaskRunner {
    registry: Arc<CapabilityRegistry>,
}

impl TaskRunner {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Run one attempt. The result is `Succeeded` or `Failed`; a failure
    /// carries its kind, message and retryability.
    pub async fn run(
        &self,
        run_id: &RunId,
        node: &NodeDefinition,
        inputs: Outputs,
        attempt: u32,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> TaskResult {
        let mut result = TaskResult::new(node.id.clone(), TaskStatus::Running);
        result.started_at = Some(Utc::now());
        result.attempts = attempt;
        let start = Instant::now();

        let outcome = self
            .invoke(run_id, node, inputs, attempt, timeout, cancel)
            .await;

        result.finished_at = Some(Utc::now());
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(outputs) => {
                info!(node_id = %node.id, attempt, elapsed_ms, "Node attempt succeeded");
                result.status = TaskStatus::Succeeded;
                result.outputs = outputs;
            }
            Err(failure) => {
                debug!(
                    node_id = %node.id,
                    attempt,
                    elapsed_ms,
                    error = %failure,
                    retryable = failure.retryable,
                    "Node attempt failed"
                );
                result.status = TaskStatus::Failed;
                result.error = Some(failure);
            }
        }
        result
    }

    async fn invoke(
        &self,
        run_id: &RunId,
        node: &NodeDefinition,
        inputs: Outputs,
        attempt: u32,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> std::result::Result<Outputs, TaskFailure> {
        if cancel.is_cancelled() {
            return Err(TaskFailure::cancelled());
        }

        let provider = self
            .registry
            .resolve(&node.role)
            .map_err(|e| TaskFailure::from(&e))?;

        let now = Instant::now();
        let request = AgentRequest {
            run_id: run_id.clone(),
            node_id: node.id.clone(),
            role: node.role.clone(),
            inputs,
            attempt,
            deadline: now.checked_add(timeout).unwrap_or(now + FAR_FUTURE),
        };

        debug!(
            node_id = %node.id,
            provider = provider.name(),
            capability = node.role.capability(),
            attempt,
            "Invoking provider"
        );

        match tokio::time::timeout(timeout, provider.invoke(request, cancel.clone())).await {
            Ok(Ok(outputs)) => Ok(outputs),
            Ok(Err(e)) => Err(TaskFailure::from(&e)),
            Err(_) if cancel.is_cancelled() => Err(TaskFailure::cancelled()),
            Err(_) => Err(TaskFailure::from(&FlowError::Timeout {
                node: node.id.clone(),
                timeout_secs: timeout.as_secs(),
            })),
        }
    }
}

/// Whether a failed attempt ended because the run was cancelled.
pub fn is_cancellation(result: &TaskResult) -> bool {
    result
        .error
        .as_ref()
        .is_some_and(|e| e.kind == FailureKind::Cancelled)
}
