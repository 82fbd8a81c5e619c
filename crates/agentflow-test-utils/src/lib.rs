//! Scripted providers, an in-memory run store and workflow fixtures shared
//! by agentflow tests.

pub mod fixtures;
pub mod provider;
pub mod store;

pub use fixtures::*;
pub use provider::{CallLog, Script, ScriptedProvider};
pub use store::{MemoryRunStore, OfflineCache};
