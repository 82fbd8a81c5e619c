pub mod builtin;
pub mod cache;
pub mod coordinator;
pub mod event_log;
pub mod fingerprint;
pub mod graph;
pub mod loader;
pub mod metrics;
pub mod recovery;
pub mod registry;
pub mod run_log;
pub mod runner;
pub mod scheduler;

pub use builtin::{CommandProvider, OutputCollector};
pub use cache::{CacheLookup, MemoryCache, ResultCache};
pub use coordinator::{CancelAck, CoordinatorBuilder, NodeStatus, RunCoordinator, RunStatus};
pub use event_log::EventLog;
pub use fingerprint::{fingerprint, fingerprint_scoped};
pub use graph::{validate, WorkflowGraph};
pub use loader::load_workflow;
pub use metrics::{LatencySummary, MetricsCollector, MetricsSnapshot, RunRecorder};
pub use recovery::{RecoveryManager, RetryDecision};
pub use registry::CapabilityRegistry;
pub use run_log::RunLogger;
pub use runner::TaskRunner;
pub use scheduler::{RunContext, Scheduler, TaskTable};
