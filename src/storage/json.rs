//! JSON run storage.
//!
//! Layout of a run directory:
//!
//! ```text
//! <root>/<template>/
//!   .run_uid        uid of the owning run
//!   entries.jsonl   one RecordEntry per line, appended as steps complete,
//!                   rewritten from the finalized record at the end
//!   run.json        the FinalizedRun, pretty-printed
//! ```

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{AppResult, DaqError};
use crate::record::{FinalizedRun, RecordEntry, RunMetadata};
use crate::storage::{RunPersister, SaveLayout};

/// Name of the finalized run file.
pub const RUN_FILE: &str = "run.json";
/// Name of the per-entry log.
pub const ENTRIES_FILE: &str = "entries.jsonl";

/// Writes runs as JSON under a [`SaveLayout`].
#[derive(Debug, Clone)]
pub struct JsonPersister {
    layout: SaveLayout,
}

impl JsonPersister {
    /// Persister rooted at `layout`.
    pub fn new(layout: SaveLayout) -> Self {
        Self { layout }
    }

    /// Directory the run is stored in, if it has been stored.
    pub async fn locate(&self, metadata: &RunMetadata) -> AppResult<Option<PathBuf>> {
        self.layout.locate(metadata).await
    }

    /// Read a finalized run back.
    pub async fn load(&self, metadata: &RunMetadata) -> AppResult<FinalizedRun> {
        let dir = self.locate(metadata).await?.ok_or_else(|| {
            DaqError::Persistence(format!("run {} has not been stored", metadata.uid))
        })?;
        let bytes = tokio::fs::read(dir.join(RUN_FILE)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Serialize entries as JSON lines.
fn entries_jsonl(entries: &[RecordEntry]) -> AppResult<Vec<u8>> {
    let mut out = Vec::new();
    for entry in entries {
        serde_json::to_writer(&mut out, entry)?;
        out.push(b'\n');
    }
    Ok(out)
}

#[async_trait]
impl RunPersister for JsonPersister {
    fn name(&self) -> &str {
        "json"
    }

    async fn flush_entry(&self, metadata: &RunMetadata, entry: &RecordEntry) -> AppResult<()> {
        let dir = self.layout.claim(metadata).await?;

        let line = entries_jsonl(std::slice::from_ref(entry))?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(ENTRIES_FILE))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        debug!(run_uid = %metadata.uid, seq = entry.seq, "flushed entry");
        Ok(())
    }

    async fn persist(&self, run: &FinalizedRun) -> AppResult<Option<PathBuf>> {
        let dir = self.layout.claim(&run.metadata).await?;

        let mut body = serde_json::to_vec_pretty(run)?;
        body.push(b'\n');
        tokio::fs::write(dir.join(RUN_FILE), body).await?;
        tokio::fs::write(dir.join(ENTRIES_FILE), entries_jsonl(&run.entries)?).await?;

        info!(
            run_uid = %run.metadata.uid,
            status = %run.status,
            path = %dir.display(),
            "run persisted"
        );
        Ok(Some(dir))
    }
}
