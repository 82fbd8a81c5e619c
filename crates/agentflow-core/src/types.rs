use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FlowError;

/// Output values of a node, keyed by output port.
pub type Outputs = serde_json::Map<String, serde_json::Value>;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content hash of a node's configuration and resolved inputs.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a single node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cached,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cached | TaskStatus::Skipped
        )
    }

    /// Whether downstream nodes can read this node's outputs.
    pub fn produced_output(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Cached)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Cached => "cached",
            TaskStatus::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// Overall run state.
///
/// `Created -> Running -> {Succeeded, Failed, PartiallySucceeded, Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    Running,
    Succeeded,
    Failed,
    PartiallySucceeded,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::Created | RunState::Running)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Created => "created",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::PartiallySucceeded => "partially_succeeded",
            RunState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InputResolution,
    AgentInvocation,
    Timeout,
    Cancelled,
    CapabilityNotFound,
    Internal,
}

/// Error detail recorded on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
    pub retryable: bool,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
        }
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "run cancelled", false)
    }
}

impl From<&FlowError> for TaskFailure {
    fn from(err: &FlowError) -> Self {
        let kind = match err {
            FlowError::InputResolution { .. } => FailureKind::InputResolution,
            FlowError::AgentInvocation { .. } => FailureKind::AgentInvocation,
            FlowError::Timeout { .. } => FailureKind::Timeout,
            FlowError::Cancelled => FailureKind::Cancelled,
            FlowError::CapabilityNotFound(_) => FailureKind::CapabilityNotFound,
            _ => FailureKind::Internal,
        };
        Self::new(kind, err.to_string(), err.is_retryable())
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Result of one node within one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub node_id: String,
    #[serde(default)]
    pub fingerprint: Option<Fingerprint>,
    pub status: TaskStatus,
    #[serde(default)]
    pub outputs: Outputs,
    #[serde(default)]
    pub error: Option<TaskFailure>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: u32,
}

impl TaskResult {
    pub fn new(node_id: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            node_id: node_id.into(),
            fingerprint: None,
            status,
            outputs: Outputs::new(),
            error: None,
            started_at: None,
            finished_at: None,
            attempts: 0,
        }
    }

    pub fn elapsed_ms(&self) -> Option<u64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}

/// Durable record of a run, keyed by `RunId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub workflow_id: String,
    pub workflow_version: u32,
    pub state: RunState,
    #[serde(default)]
    pub principal: Option<String>,
    #[serde(default)]
    pub inputs: Outputs,
    #[serde(default)]
    pub results: BTreeMap<String, TaskResult>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// One entry of a run's append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: RunId,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: RunEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEventKind {
    RunCreated {
        workflow_id: String,
        version: u32,
    },
    RunStarted,
    NodeStarted {
        node_id: String,
        attempt: u32,
    },
    NodeRetried {
        node_id: String,
        /// The attempt about to be made.
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    NodeSucceeded {
        node_id: String,
        attempts: u32,
        elapsed_ms: u64,
    },
    NodeFailed {
        node_id: String,
        attempts: u32,
        error: TaskFailure,
    },
    NodeCached {
        node_id: String,
        fingerprint: Fingerprint,
    },
    NodeSkipped {
        node_id: String,
        reason: String,
    },
    CancelRequested,
    RunCompleted {
        state: RunState,
    },
}

impl RunEventKind {
    pub fn node_id(&self) -> Option<&str> {
        match self {
            RunEventKind::NodeStarted { node_id, .. }
            | RunEventKind::NodeRetried { node_id, .. }
            | RunEventKind::NodeSucceeded { node_id, .. }
            | RunEventKind::NodeFailed { node_id, .. }
            | RunEventKind::NodeCached { node_id, .. }
            | RunEventKind::NodeSkipped { node_id, .. } => Some(node_id),
            _ => None,
        }
    }

    /// Events that settle a node or the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunEventKind::NodeSucceeded { .. }
                | RunEventKind::NodeFailed { .. }
                | RunEventKind::NodeCached { .. }
                | RunEventKind::NodeSkipped { .. }
                | RunEventKind::RunCompleted { .. }
        )
    }

    pub fn is_run_lifecycle(&self) -> bool {
        self.node_id().is_none()
    }
}

/// A memoized node result, keyed by fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub workflow_id: String,
    pub workflow_version: u32,
    pub node_id: String,
    pub outputs: Outputs,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    pub size_bytes: usize,
}

impl CacheEntry {
    pub fn new(
        fingerprint: Fingerprint,
        workflow_id: impl Into<String>,
        workflow_version: u32,
        node_id: impl Into<String>,
        outputs: Outputs,
        ttl_secs: Option<u64>,
    ) -> Self {
        let size_bytes = serde_json::to_vec(&outputs).map(|b| b.len()).unwrap_or(0)
            + fingerprint.0.len();
        Self {
            fingerprint,
            workflow_id: workflow_id.into(),
            workflow_version,
            node_id: node_id.into(),
            outputs,
            created_at: Utc::now(),
            ttl_secs,
            size_bytes,
        }
    }

    /// `None` when the entry never expires, including TTLs too large to
    /// represent as a timestamp.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = i64::try_from(self.ttl_secs?).ok()?;
        self.created_at
            .checked_add_signed(chrono::Duration::try_seconds(ttl)?)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| now >= at)
    }
}

/// Which cache entries an invalidation applies to.
#[derive(Clone)]
pub enum CacheSelector {
    All,
    Key(Fingerprint),
    /// Entries written by a workflow, optionally only one version of it.
    Workflow {
        workflow_id: String,
        version: Option<u32>,
    },
    /// Entries written by a node id, optionally scoped to one workflow.
    Node {
        node_id: String,
        workflow_id: Option<String>,
    },
    Predicate(Arc<dyn Fn(&CacheEntry) -> bool + Send + Sync>),
}

impl CacheSelector {
    pub fn predicate(f: impl Fn(&CacheEntry) -> bool + Send + Sync + 'static) -> Self {
        CacheSelector::Predicate(Arc::new(f))
    }

    pub fn matches(&self, entry: &CacheEntry) -> bool {
        match self {
            CacheSelector::All => true,
            CacheSelector::Key(key) => &entry.fingerprint == key,
            CacheSelector::Workflow {
                workflow_id,
                version,
            } => {
                &entry.workflow_id == workflow_id
                    && version.map_or(true, |v| entry.workflow_version == v)
            }
            CacheSelector::Node {
                node_id,
                workflow_id,
            } => {
                &entry.node_id == node_id
                    && workflow_id
                        .as_ref()
                        .map_or(true, |w| &entry.workflow_id == w)
            }
            CacheSelector::Predicate(f) => f(entry),
        }
    }
}

impl std::fmt::Debug for CacheSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheSelector::All => write!(f, "All"),
            CacheSelector::Key(k) => write!(f, "Key({})", k),
            CacheSelector::Workflow {
                workflow_id,
                version,
            } => write!(f, "Workflow({}, {:?})", workflow_id, version),
            CacheSelector::Node {
                node_id,
                workflow_id,
            } => write!(f, "Node({}, {:?})", node_id, workflow_id),
            CacheSelector::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

/// Occupancy of a cache backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub evictions: u64,
}
