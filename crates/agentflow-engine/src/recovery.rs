use std::collections::BTreeMap;
use std::time::Duration;

use agentflow_core::config::RetryConfig;
use agentflow_core::types::{RunState, TaskFailure, TaskResult, TaskStatus};
use agentflow_core::workflow::NodeDefinition;

use crate::graph::WorkflowGraph;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

/// Retry policy and run outcome rules.
#[derive(Debug, Clone)]
pub struct RecoveryManager {
    config: RetryConfig,
}

impl RecoveryManager {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Total attempts allowed for a node, including the first.
    pub fn max_attempts(&self, node: &NodeDefinition) -> u32 {
        node.max_attempts.unwrap_or(self.config.max_attempts).max(1)
    }

    /// Decide after `attempt` (1-based) failed with `failure`.
    ///
    /// Only retryable failures are retried, and never beyond the node's
    /// attempt budget.
    pub fn should_retry(
        &self,
        node: &NodeDefinition,
        attempt: u32,
        failure: &TaskFailure,
    ) -> RetryDecision {
        if !failure.retryable || attempt >= self.max_attempts(node) {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            delay: self.backoff(attempt),
        }
    }

    /// Exponential backoff with jitter, capped at `max_backoff_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let ms = self
            .config
            .initial_backoff_ms
            .saturating_mul(2u64.saturating_pow(exp))
            .min(self.config.max_backoff_ms);
        if !self.config.jitter {
            return Duration::from_millis(ms);
        }
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        let jittered = (ms as f64 * jitter) as u64;
        Duration::from_millis(jittered.min(self.config.max_backoff_ms))
    }

    /// Terminal run state from the settled node results.
    ///
    /// Cancellation wins; otherwise a permanently failed critical node fails
    /// the run, a run where every node succeeded or hit the cache succeeds,
    /// and anything else (non-critical failures, skipped branches) is a
    /// partial success.
    pub fn verdict(
        &self,
        graph: &WorkflowGraph,
        results: &BTreeMap<String, TaskResult>,
        cancelled: bool,
    ) -> RunState {
        if cancelled {
            return RunState::Cancelled;
        }

        let mut all_ok = true;
        for idx in 0..graph.len() {
            let node = graph.node(idx);
            let status = results.get(&node.id).map(|r| r.status).unwrap_or(TaskStatus::Pending);
            match status {
                TaskStatus::Succeeded | TaskStatus::Cached => {}
                TaskStatus::Failed if node.critical => return RunState::Failed,
                _ => all_ok = false,
            }
        }

        if all_ok {
            RunState::Succeeded
        } else {
            RunState::PartiallySucceeded
        }
    }
}

impl Default for RecoveryManager {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
