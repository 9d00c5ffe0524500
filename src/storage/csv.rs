//! CSV run storage (feature `storage_csv`).
//!
//! One `run.csv` per run: the run metadata and terminal status as `# `-prefixed
//! JSON header lines, then one row per intent outcome.

use async_trait::async_trait;
use std::path::PathBuf;

use crate::error::{AppResult, DaqError};
use crate::record::FinalizedRun;
use crate::storage::{RunPersister, SaveLayout};

#[cfg(feature = "storage_csv")]
use crate::axis::AxisValue;
#[cfg(feature = "storage_csv")]
use tracing::info;

/// Name of the CSV file inside the run directory.
pub const CSV_FILE: &str = "run.csv";

/// Writes runs as CSV under a [`SaveLayout`].
#[derive(Debug, Clone)]
pub struct CsvPersister {
    #[cfg_attr(not(feature = "storage_csv"), allow(dead_code))]
    layout: SaveLayout,
}

impl CsvPersister {
    /// Persister rooted at `layout`.
    ///
    /// # Errors
    /// `FeatureNotEnabled` when built without `storage_csv`.
    pub fn new(layout: SaveLayout) -> AppResult<Self> {
        #[cfg(not(feature = "storage_csv"))]
        {
            let _ = layout;
            return Err(DaqError::FeatureNotEnabled("storage_csv".to_string()));
        }

        #[cfg(feature = "storage_csv")]
        Ok(Self { layout })
    }
}

#[cfg(feature = "storage_csv")]
fn render(run: &FinalizedRun) -> AppResult<Vec<u8>> {
    let header = serde_json::json!({
        "metadata": run.metadata,
        "status": run.status,
        "cause": run.cause,
        "comments": run.comments,
    });

    let mut out = Vec::new();
    for line in serde_json::to_string_pretty(&header)?.lines() {
        out.extend_from_slice(b"# ");
        out.extend_from_slice(line.as_bytes());
        out.push(b'\n');
    }

    let csv_err = |e: ::csv::Error| DaqError::Persistence(e.to_string());
    let mut writer = ::csv::Writer::from_writer(out);
    writer
        .write_record([
            "seq",
            "label",
            "axis",
            "op",
            "requested",
            "resolved",
            "started_at",
            "finished_at",
            "attempts",
            "failure",
        ])
        .map_err(csv_err)?;

    let text = |v: &Option<AxisValue>| v.as_ref().map_or(String::new(), ToString::to_string);
    for entry in &run.entries {
        for outcome in &entry.outcomes {
            writer
                .write_record([
                    entry.seq.to_string(),
                    entry.label.clone().unwrap_or_default(),
                    outcome.axis.clone(),
                    outcome.op.as_str().to_string(),
                    text(&outcome.requested),
                    text(&outcome.resolved),
                    outcome.started_at.to_rfc3339(),
                    outcome.finished_at.to_rfc3339(),
                    outcome.attempts.to_string(),
                    outcome
                        .failure
                        .as_ref()
                        .map_or(String::new(), |f| format!("{}: {}", f.kind, f.message)),
                ])
                .map_err(csv_err)?;
        }
    }
    writer
        .into_inner()
        .map_err(|e| DaqError::Persistence(e.to_string()))
}

#[async_trait]
impl RunPersister for CsvPersister {
    fn name(&self) -> &str {
        "csv"
    }

    async fn persist(&self, run: &FinalizedRun) -> AppResult<Option<PathBuf>> {
        #[cfg(not(feature = "storage_csv"))]
        {
            let _ = run;
            return Err(DaqError::FeatureNotEnabled("storage_csv".to_string()));
        }

        #[cfg(feature = "storage_csv")]
        {
            let dir = self.layout.claim(&run.metadata).await?;
            tokio::fs::write(dir.join(CSV_FILE), render(run)?).await?;
            info!(run_uid = %run.metadata.uid, path = %dir.display(), "run persisted as CSV");
            Ok(Some(dir))
        }
    }
}

#[cfg(all(test, feature = "storage_csv"))]
mod tests {
    use super::*;
    use crate::record::tests::{entry, metadata};
    use crate::record::{ActionRecord, RunStatus};
    use chrono::Utc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn writes_header_and_rows() {
        let tmp = TempDir::new().unwrap();
        let persister = CsvPersister::new(SaveLayout::with_default_template(tmp.path())).unwrap();

        let mut record = ActionRecord::new(metadata());
        record.append(entry(0, 0.0, Some(0.0))).unwrap();
        record.append(entry(1, 1.0, None)).unwrap();
        let run = record.finalize(RunStatus::Failed, None, Utc::now());

        let dir = persister.persist(&run).await.unwrap().unwrap();
        let text = std::fs::read_to_string(dir.join(CSV_FILE)).unwrap();

        assert!(text.starts_with("# {"));
        let rows: Vec<&str> = text.lines().filter(|l| !l.starts_with("# ")).collect();
        assert_eq!(
            rows[0],
            "seq,label,axis,op,requested,resolved,started_at,finished_at,attempts,failure"
        );
        assert_eq!(rows.len(), 1 + 4);
        assert!(rows[4].ends_with("driver: timeout"));
    }
}
