use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use futures::future::BoxFuture;

use agentflow_core::error::{FlowError, Result};
use agentflow_core::traits::{CacheBackend, RunStore};
use agentflow_core::types::{
    CacheEntry, CacheSelector, CacheStats, Fingerprint, RunEvent, RunId, RunRecord,
};

/// In-memory `RunStore` for tests.
#[derive(Default)]
pub struct MemoryRunStore {
    runs: Mutex<HashMap<RunId, RunRecord>>,
    events: Mutex<HashMap<RunId, BTreeMap<u64, RunEvent>>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_count(&self) -> usize {
        self.runs.lock().unwrap().len()
    }
}

impl RunStore for MemoryRunStore {
    fn save_run(&self, record: RunRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.runs
                .lock()
                .unwrap()
                .insert(record.run_id.clone(), record);
            Ok(())
        })
    }

    fn load_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<RunRecord>>> {
        let run_id = run_id.clone();
        Box::pin(async move { Ok(self.runs.lock().unwrap().get(&run_id).cloned()) })
    }

    fn append_events(&self, events: Vec<RunEvent>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut all = self.events.lock().unwrap();
            for event in events {
                all.entry(event.run_id.clone())
                    .or_default()
                    .insert(event.sequence, event);
            }
            Ok(())
        })
    }

    fn load_events(
        &self,
        run_id: &RunId,
        from_sequence: u64,
    ) -> BoxFuture<'_, Result<Vec<RunEvent>>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            let all = self.events.lock().unwrap();
            Ok(all
                .get(&run_id)
                .map(|events| events.range(from_sequence..).map(|(_, e)| e.clone()).collect())
                .unwrap_or_default())
        })
    }

    fn delete_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<()>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            self.runs.lock().unwrap().remove(&run_id);
            self.events.lock().unwrap().remove(&run_id);
            Ok(())
        })
    }
}

/// Cache backend whose every operation fails, as if the store were offline.
pub struct OfflineCache;

impl CacheBackend for OfflineCache {
    fn get(&self, _key: &Fingerprint) -> BoxFuture<'_, Result<Option<CacheEntry>>> {
        Box::pin(async { Err(FlowError::Cache("offline".into())) })
    }

    fn put(&self, _entry: CacheEntry) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async { Err(FlowError::Cache("offline".into())) })
    }

    fn invalidate(&self, _selector: CacheSelector) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async { Err(FlowError::Cache("offline".into())) })
    }

    fn stats(&self) -> BoxFuture<'_, Result<CacheStats>> {
        Box::pin(async { Err(FlowError::Cache("offline".into())) })
    }
}
