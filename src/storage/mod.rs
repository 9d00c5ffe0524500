//! Persistence of finalized runs.
//!
//! The run engine hands every finalized record to a [`RunPersister`]. Persisters
//! see a run twice:
//!
//! - `flush_entry` after each step, best effort: failures are logged and the run
//!   continues
//! - `persist` once at finalization, mandatory: failures are surfaced to the
//!   caller alongside the run outcome
//!
//! Output is deterministic. Every field of a [`FinalizedRun`] is captured once,
//! maps are ordered, and the save directory is derived from run metadata alone,
//! so persisting the same finalized run twice produces byte-identical files.
//!
//! A run directory belongs to exactly one run. The owner's uid is written to
//! [`OWNER_FILE`] when the directory is claimed; if the templated directory is
//! already owned by another run (a restarted process reuses run indices), the
//! run falls back to the same path suffixed with its uid.
//!
//! # Backends
//!
//! - [`JsonPersister`] - `run.json` plus incrementally flushed `entries.jsonl`
//! - [`CsvPersister`] - one row per intent with a commented metadata header
//!   (feature `storage_csv`)
//! - [`MemoryPersister`] - keeps runs in memory, for tests and embedding
//! - [`ForgetfulPersister`] - discards everything

pub mod csv;
pub mod json;
pub mod memory;

pub use self::csv::CsvPersister;
pub use json::JsonPersister;
pub use memory::{ForgetfulPersister, MemoryPersister};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::error::{AppResult, DaqError};
use crate::record::{FinalizedRun, RecordEntry, RunMetadata};

/// Persistence collaborator.
#[async_trait]
pub trait RunPersister: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Store one entry of a run in progress. Best effort.
    async fn flush_entry(&self, _metadata: &RunMetadata, _entry: &RecordEntry) -> AppResult<()> {
        Ok(())
    }

    /// Store a finalized run. Returns where it was stored, if on disk.
    async fn persist(&self, run: &FinalizedRun) -> AppResult<Option<PathBuf>>;
}

/// Available persistence backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// JSON files
    #[default]
    Json,
    /// CSV file
    Csv,
    /// In-memory
    Memory,
    /// Discard
    Forget,
}

/// Save directory layout: a root plus a template expanded per run.
///
/// Placeholders: `{user}`, `{session}`, `{run}` (run index), `{date}` (run
/// start date, `YYYY-MM-DD`) and `{uid}`.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveLayout {
    root: PathBuf,
    template: String,
}

/// Default directory template.
pub const DEFAULT_TEMPLATE: &str = "{user}/{session}/{date}/run_{run}";

/// File holding the uid of the run that owns a directory.
pub const OWNER_FILE: &str = ".run_uid";

/// Who holds a candidate directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Occupancy {
    Free,
    Mine,
    Taken,
}

impl SaveLayout {
    /// Layout under `root` using `template`.
    pub fn new(root: impl Into<PathBuf>, template: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            template: template.into(),
        }
    }

    /// Layout under `root` with the default template.
    pub fn with_default_template(root: impl Into<PathBuf>) -> Self {
        Self::new(root, DEFAULT_TEMPLATE)
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for the run described by `metadata`.
    pub fn directory_for(&self, metadata: &RunMetadata) -> PathBuf {
        let relative = self
            .template
            .replace("{user}", &sanitize(&metadata.user))
            .replace("{session}", &sanitize(&metadata.session))
            .replace("{run}", &format!("{:03}", metadata.run_index))
            .replace("{date}", &metadata.started_at.format("%Y-%m-%d").to_string())
            .replace("{uid}", &metadata.uid);
        self.root.join(relative)
    }

    /// Candidate directories in preference order: the templated path, then
    /// the path suffixed with the short uid, then with the full uid.
    fn candidates(&self, metadata: &RunMetadata) -> Vec<PathBuf> {
        let base = self.directory_for(metadata);
        let short: String = metadata.uid.chars().take(8).collect();
        let mut out = vec![base.clone()];
        for suffix in [short, metadata.uid.clone()] {
            out.push(match base.file_name() {
                Some(name) => {
                    base.with_file_name(format!("{}_{}", name.to_string_lossy(), suffix))
                }
                None => base.join(suffix),
            });
        }
        out
    }

    /// Directory owned by the run, claiming one if the run has none yet.
    ///
    /// Claiming the same run again returns the same directory. A directory
    /// holding another run's data is never reused.
    ///
    /// # Errors
    /// `Io` on filesystem failures, `Persistence` when every candidate is taken.
    pub async fn claim(&self, metadata: &RunMetadata) -> AppResult<PathBuf> {
        let candidates = self.candidates(metadata);
        for (index, dir) in candidates.iter().enumerate() {
            let mut state = occupancy(dir, &metadata.uid).await?;
            if state == Occupancy::Free {
                tokio::fs::create_dir_all(dir).await?;
                state = match tokio::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(dir.join(OWNER_FILE))
                    .await
                {
                    Ok(mut file) => {
                        file.write_all(metadata.uid.as_bytes()).await?;
                        file.flush().await?;
                        Occupancy::Mine
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                        occupancy(dir, &metadata.uid).await?
                    }
                    Err(e) => return Err(e.into()),
                };
                if state == Occupancy::Mine && index > 0 {
                    info!(
                        run_uid = %metadata.uid,
                        taken = %candidates[0].display(),
                        path = %dir.display(),
                        "run directory already owned by another run"
                    );
                }
            }
            if state == Occupancy::Mine {
                return Ok(dir.clone());
            }
        }
        Err(DaqError::Persistence(format!(
            "no free directory for run {} under {}",
            metadata.uid,
            self.root.display()
        )))
    }

    /// Directory already claimed by the run, if any.
    pub async fn locate(&self, metadata: &RunMetadata) -> AppResult<Option<PathBuf>> {
        for dir in self.candidates(metadata) {
            if occupancy(&dir, &metadata.uid).await? == Occupancy::Mine {
                return Ok(Some(dir));
            }
        }
        Ok(None)
    }
}

/// Inspect `dir` on behalf of the run `uid`. Unmarked directories with content
/// count as taken.
async fn occupancy(dir: &Path, uid: &str) -> AppResult<Occupancy> {
    match tokio::fs::read_to_string(dir.join(OWNER_FILE)).await {
        Ok(owner) if owner.trim() == uid => Ok(Occupancy::Mine),
        Ok(_) => Ok(Occupancy::Taken),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            match tokio::fs::read_dir(dir).await {
                Ok(mut entries) => Ok(if entries.next_entry().await?.is_some() {
                    Occupancy::Taken
                } else {
                    Occupancy::Free
                }),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Occupancy::Free),
                Err(e) => Err(e.into()),
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// Replace path separators and blanks so user-provided names stay one component.
fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "unknown".to_string()
    } else {
        cleaned
    }
}

/// Instantiate the configured backend.
pub fn create_persister(
    backend: StorageBackend,
    layout: SaveLayout,
) -> AppResult<Arc<dyn RunPersister>> {
    Ok(match backend {
        StorageBackend::Json => Arc::new(JsonPersister::new(layout)),
        StorageBackend::Csv => Arc::new(CsvPersister::new(layout)?),
        StorageBackend::Memory => Arc::new(MemoryPersister::new()),
        StorageBackend::Forget => Arc::new(ForgetfulPersister),
    })
}
