//! In-memory and discarding persisters.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use tracing::debug;

use crate::error::AppResult;
use crate::record::{FinalizedRun, RecordEntry, RunMetadata};
use crate::storage::RunPersister;

/// Keeps flushed entries and finalized runs in memory.
#[derive(Debug, Default)]
pub struct MemoryPersister {
    flushed: Mutex<Vec<(String, RecordEntry)>>,
    runs: Mutex<Vec<FinalizedRun>>,
    serialized: Mutex<Vec<Vec<u8>>>,
}

impl MemoryPersister {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Finalized runs in persistence order.
    pub fn runs(&self) -> Vec<FinalizedRun> {
        self.runs.lock().clone()
    }

    /// Most recently persisted run.
    pub fn last_run(&self) -> Option<FinalizedRun> {
        self.runs.lock().last().cloned()
    }

    /// Serialized bytes of every persisted run, as a file backend would store them.
    pub fn serialized(&self) -> Vec<Vec<u8>> {
        self.serialized.lock().clone()
    }

    /// Entries flushed for `run_uid` while the run was in progress.
    pub fn flushed_entries(&self, run_uid: &str) -> Vec<RecordEntry> {
        self.flushed
            .lock()
            .iter()
            .filter(|(uid, _)| uid == run_uid)
            .map(|(_, entry)| entry.clone())
            .collect()
    }
}

#[async_trait]
impl RunPersister for MemoryPersister {
    fn name(&self) -> &str {
        "memory"
    }

    async fn flush_entry(&self, metadata: &RunMetadata, entry: &RecordEntry) -> AppResult<()> {
        self.flushed
            .lock()
            .push((metadata.uid.clone(), entry.clone()));
        Ok(())
    }

    async fn persist(&self, run: &FinalizedRun) -> AppResult<Option<PathBuf>> {
        let bytes = serde_json::to_vec_pretty(run)?;
        self.serialized.lock().push(bytes);
        self.runs.lock().push(run.clone());
        Ok(None)
    }
}

/// Discards every run.
#[derive(Debug, Default, Clone, Copy)]
pub struct ForgetfulPersister;

#[async_trait]
impl RunPersister for ForgetfulPersister {
    fn name(&self) -> &str {
        "forget"
    }

    async fn persist(&self, run: &FinalizedRun) -> AppResult<Option<PathBuf>> {
        debug!(run_uid = %run.metadata.uid, "discarding run");
        Ok(None)
    }
}
