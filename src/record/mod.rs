//! Action Record for executed scans
//!
//! Every step the run engine executes produces one [`RecordEntry`]. Entries are
//! appended to the run's [`ActionRecord`], which is finalized into a
//! [`FinalizedRun`] when the run reaches a terminal state and handed to
//! persistence. Collaborators observe the record through [`RecordEvent`]s and
//! snapshots; they never mutate it.
//!
//! # Record Flow
//!
//! ```text
//! RunStarted (1, metadata)
//!    │
//!    ├── EntryAppended (N, one per executed step)
//!    │
//!    ├── Comment (0+, free-text annotations)
//!    │
//! RunFinished (1, terminal status)
//! ```

pub mod collation;

pub use collation::{Collation, IndependentAxis};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::axis::value::AxisValue;
use crate::axis::AxisOp;
use crate::error::{AppResult, DaqError, FailureKind};

/// Generate a new unique run ID
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Why an attempt at an intent failed before a later attempt was made.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryNote {
    /// 1-based attempt that failed
    pub attempt: u32,
    /// Error message of that attempt
    pub error: String,
    /// When the attempt failed
    pub at: DateTime<Utc>,
}

/// Final failure of an intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentFailure {
    /// Error classification
    pub kind: FailureKind,
    /// Error message
    pub message: String,
}

impl IntentFailure {
    /// Capture a crate error.
    pub fn from_error(err: &DaqError) -> Self {
        Self {
            kind: err.failure_kind(),
            message: err.to_string(),
        }
    }
}

/// Outcome of one intent within a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentOutcome {
    /// Axis path
    pub axis: String,
    /// Read or write
    pub op: AxisOp,
    /// Value requested by a write
    pub requested: Option<AxisValue>,
    /// Value read, or value confirmed by a write
    pub resolved: Option<AxisValue>,
    /// First attempt start
    pub started_at: DateTime<Utc>,
    /// Last attempt end
    pub finished_at: DateTime<Utc>,
    /// Attempts made, including the final one
    pub attempts: u32,
    /// Failed attempts that were retried
    #[serde(default)]
    pub retries: Vec<RetryNote>,
    /// Final failure, if the intent did not succeed
    pub failure: Option<IntentFailure>,
}

impl IntentOutcome {
    /// Whether the intent succeeded.
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// Record of one executed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEntry {
    /// Step sequence number within the run, starting at 0
    pub seq: u64,
    /// Step label
    pub label: Option<String>,
    /// Step start
    pub started_at: DateTime<Utc>,
    /// Barrier release
    pub finished_at: DateTime<Utc>,
    /// Outcomes in intent declaration order
    pub outcomes: Vec<IntentOutcome>,
}

impl RecordEntry {
    /// Some, but not all, intents failed.
    pub fn is_partial_failure(&self) -> bool {
        let failed = self.outcomes.iter().filter(|o| !o.succeeded()).count();
        failed > 0 && failed < self.outcomes.len()
    }

    /// Any intent failed.
    pub fn has_failures(&self) -> bool {
        self.outcomes.iter().any(|o| !o.succeeded())
    }

    /// Resolved value for `axis`, if it was part of this step and succeeded.
    pub fn value_of(&self, axis: &str) -> Option<&AxisValue> {
        self.outcomes
            .iter()
            .find(|o| o.axis == axis)
            .and_then(|o| o.resolved.as_ref())
    }
}

/// Free-text annotation attached to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    /// When the comment was made
    pub at: DateTime<Utc>,
    /// Text
    pub text: String,
}

impl Comment {
    /// Comment stamped now.
    pub fn now(text: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            text: text.into(),
        }
    }
}

/// Run metadata handed to persistence with the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Unique run ID
    pub uid: String,
    /// Per-engine run number, starting at 1
    pub run_index: u64,
    /// Operator
    pub user: String,
    /// Session or sample name
    pub session: String,
    /// Scan type
    pub plan_type: String,
    /// Scan arguments
    pub plan_args: BTreeMap<String, String>,
    /// Expected number of steps, if known
    pub num_steps: Option<usize>,
    /// Run start
    pub started_at: DateTime<Utc>,
    /// Run end, set at finalization
    pub ended_at: Option<DateTime<Utc>>,
    /// User key/value pairs
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// All steps consumed without fatal failure
    Completed,
    /// A fatal error stopped the run
    Failed,
    /// Stopped by request at a step boundary
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Why a run failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalCause {
    /// Error classification
    pub kind: FailureKind,
    /// Error message
    pub message: String,
    /// Sequence number of the step that failed
    pub step: Option<u64>,
    /// Axis involved, when known
    pub axis: Option<String>,
}

/// Append-only log of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRecord {
    metadata: RunMetadata,
    entries: Vec<RecordEntry>,
    comments: Vec<Comment>,
}

impl ActionRecord {
    /// Fresh record for a starting run.
    pub fn new(metadata: RunMetadata) -> Self {
        Self {
            metadata,
            entries: Vec::new(),
            comments: Vec::new(),
        }
    }

    /// Run metadata.
    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    /// Entries appended so far.
    pub fn entries(&self) -> &[RecordEntry] {
        &self.entries
    }

    /// Comments appended so far.
    pub fn comments(&self) -> &[Comment] {
        &self.comments
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries were appended.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sequence number the next entry must exceed.
    pub fn last_seq(&self) -> Option<u64> {
        self.entries.last().map(|e| e.seq)
    }

    /// Append an entry.
    ///
    /// # Errors
    /// `Engine` if `entry.seq` does not strictly follow the last entry.
    pub fn append(&mut self, entry: RecordEntry) -> AppResult<()> {
        if let Some(last) = self.last_seq() {
            if entry.seq <= last {
                return Err(DaqError::Engine(format!(
                    "record entry {} does not follow entry {}",
                    entry.seq, last
                )));
            }
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Append a comment.
    pub fn add_comment(&mut self, comment: Comment) {
        self.comments.push(comment);
    }

    /// Close the record.
    pub fn finalize(
        mut self,
        status: RunStatus,
        cause: Option<TerminalCause>,
        ended_at: DateTime<Utc>,
    ) -> FinalizedRun {
        self.metadata.ended_at = Some(ended_at);
        FinalizedRun {
            metadata: self.metadata,
            status,
            cause,
            entries: self.entries,
            comments: self.comments,
        }
    }
}

/// Closed record of a run, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizedRun {
    /// Run metadata
    pub metadata: RunMetadata,
    /// Terminal status
    pub status: RunStatus,
    /// Failure cause for `Failed` runs
    pub cause: Option<TerminalCause>,
    /// All entries in step order
    pub entries: Vec<RecordEntry>,
    /// All comments in order
    pub comments: Vec<Comment>,
}

impl FinalizedRun {
    /// Resolved values of `axis` across all entries, in step order.
    pub fn values_of(&self, axis: &str) -> Vec<AxisValue> {
        self.entries
            .iter()
            .filter_map(|e| e.value_of(axis).cloned())
            .collect()
    }

    /// Independent-axis statistics.
    pub fn collation(&self) -> Collation {
        Collation::from_entries(&self.entries)
    }
}

/// Notification published while a run progresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordEvent {
    /// A run started
    RunStarted {
        /// Metadata at start
        metadata: RunMetadata,
    },
    /// An entry was appended
    EntryAppended {
        /// Run ID
        run_uid: String,
        /// The entry
        entry: RecordEntry,
    },
    /// A comment was appended
    Comment {
        /// Run ID
        run_uid: String,
        /// The comment
        comment: Comment,
    },
    /// A run reached a terminal state
    RunFinished {
        /// Run ID
        run_uid: String,
        /// Terminal status
        status: RunStatus,
        /// Number of entries recorded
        entries: usize,
    },
}

impl RecordEvent {
    /// Run this event belongs to.
    pub fn run_uid(&self) -> &str {
        match self {
            RecordEvent::RunStarted { metadata } => &metadata.uid,
            RecordEvent::EntryAppended { run_uid, .. }
            | RecordEvent::Comment { run_uid, .. }
            | RecordEvent::RunFinished { run_uid, .. } => run_uid,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn metadata() -> RunMetadata {
        RunMetadata {
            uid: "run-1".to_string(),
            run_index: 1,
            user: "tester".to_string(),
            session: "bench".to_string(),
            plan_type: "declarative".to_string(),
            plan_args: BTreeMap::new(),
            num_steps: Some(3),
            started_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default(),
            ended_at: None,
            extra: BTreeMap::new(),
        }
    }

    pub(crate) fn entry(seq: u64, x: f64, reading: Option<f64>) -> RecordEntry {
        let at = DateTime::from_timestamp(1_700_000_000 + seq as i64, 0).unwrap_or_default();
        let mut outcomes = vec![IntentOutcome {
            axis: "mc.x".to_string(),
            op: AxisOp::Write,
            requested: Some(AxisValue::Float(x)),
            resolved: Some(AxisValue::Float(x)),
            started_at: at,
            finished_at: at,
            attempts: 1,
            retries: Vec::new(),
            failure: None,
        }];
        outcomes.push(IntentOutcome {
            axis: "sensor.value".to_string(),
            op: AxisOp::Read,
            requested: None,
            resolved: reading.map(AxisValue::Float),
            started_at: at,
            finished_at: at,
            attempts: 1,
            retries: Vec::new(),
            failure: reading.is_none().then(|| IntentFailure {
                kind: FailureKind::Driver,
                message: "timeout".to_string(),
            }),
        });
        RecordEntry {
            seq,
            label: Some(format!("point_{}", seq)),
            started_at: at,
            finished_at: at,
            outcomes,
        }
    }

    #[test]
    fn append_requires_increasing_seq() {
        let mut record = ActionRecord::new(metadata());
        record.append(entry(0, 0.0, Some(0.0))).unwrap();
        record.append(entry(1, 1.0, Some(10.0))).unwrap();
        assert!(record.append(entry(1, 1.0, Some(10.0))).is_err());
        assert!(record.append(entry(0, 1.0, Some(10.0))).is_err());
        assert_eq!(record.len(), 2);
    }

    #[test]
    fn partial_failure_detection() {
        let ok = entry(0, 0.0, Some(0.0));
        let partial = entry(1, 1.0, None);
        assert!(!ok.is_partial_failure());
        assert!(partial.is_partial_failure());
        assert!(partial.has_failures());
        assert_eq!(partial.value_of("mc.x"), Some(&AxisValue::Float(1.0)));
        assert_eq!(partial.value_of("sensor.value"), None);
    }

    #[test]
    fn finalize_keeps_entries_and_stamps_end() {
        let mut record = ActionRecord::new(metadata());
        record.append(entry(0, 0.0, Some(0.0))).unwrap();
        record.add_comment(Comment::now("hello"));
        let end = Utc::now();
        let run = record.finalize(RunStatus::Completed, None, end);
        assert_eq!(run.metadata.ended_at, Some(end));
        assert_eq!(run.entries.len(), 1);
        assert_eq!(run.comments[0].text, "hello");
        assert_eq!(run.values_of("sensor.value"), vec![AxisValue::Float(0.0)]);
    }

    #[test]
    fn event_serialization_is_tagged() {
        let event = RecordEvent::RunFinished {
            run_uid: "run-1".to_string(),
            status: RunStatus::Cancelled,
            entries: 3,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"type":"run_finished","run_uid":"run-1","status":"cancelled","entries":3}"#
        );
        assert_eq!(event.run_uid(), "run-1");
    }
}
