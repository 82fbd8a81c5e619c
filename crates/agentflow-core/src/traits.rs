use std::time::Instant;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::*;
use crate::workflow::AgentRole;

/// A single capability call handed to a provider.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub run_id: RunId,
    pub node_id: String,
    pub role: AgentRole,
    pub inputs: Outputs,
    pub attempt: u32,
    /// Wall-clock deadline after which the engine abandons the call.
    pub deadline: Instant,
}

/// Agent capability provider. Executes one capability call.
pub trait AgentProvider: Send + Sync + 'static {
    /// Provider name (e.g., "openai", "local").
    fn name(&self) -> &str;

    /// Capability tag this provider serves (e.g., "agent", "command").
    fn capability(&self) -> &str;

    /// Execute the capability with the given inputs.
    ///
    /// Implementations should watch `cancel` and return promptly once it fires.
    /// Failures are reported as `FlowError::AgentInvocation` with a
    /// retryability hint.
    fn invoke(
        &self,
        request: AgentRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<Outputs>>;

    /// Whether the provider can currently accept work.
    fn is_available(&self) -> bool {
        true
    }

    /// Selection order among providers of the same capability (lower first).
    fn priority(&self) -> u32 {
        100
    }
}

/// Fingerprint-keyed result storage.
pub trait CacheBackend: Send + Sync + 'static {
    /// Look up a live entry. Expired entries are treated as absent.
    fn get(&self, key: &Fingerprint) -> BoxFuture<'_, Result<Option<CacheEntry>>>;

    /// Insert an entry. Returns false when a live entry already holds the key.
    fn put(&self, entry: CacheEntry) -> BoxFuture<'_, Result<bool>>;

    /// Remove matching entries, returning how many were removed.
    fn invalidate(&self, selector: CacheSelector) -> BoxFuture<'_, Result<usize>>;

    fn stats(&self) -> BoxFuture<'_, Result<CacheStats>>;
}

/// Durable run records and event logs.
pub trait RunStore: Send + Sync + 'static {
    fn save_run(&self, record: RunRecord) -> BoxFuture<'_, Result<()>>;

    fn load_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<RunRecord>>>;

    fn append_events(&self, events: Vec<RunEvent>) -> BoxFuture<'_, Result<()>>;

    /// Events of a run with `sequence >= from_sequence`, in order.
    fn load_events(&self, run_id: &RunId, from_sequence: u64)
        -> BoxFuture<'_, Result<Vec<RunEvent>>>;

    fn delete_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<()>>;
}
