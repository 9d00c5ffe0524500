//! RunEngine - Execution runtime for scans
//!
//! The RunEngine consumes a [`Scan`], resolves every intent against the
//! [`AxisRegistry`], issues the intents of each step concurrently, records the
//! outcomes in an [`ActionRecord`] and hands the finalized record to a
//! [`RunPersister`].
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐  run()/start()  ┌─────────┐  steps exhausted   ┌───────────┐
//! │ Idle │────────────────▶│ Running │───────────────────▶│ Completed │
//! └──────┘                 └────┬────┘                    └───────────┘
//!                               │
//!                               │  fatal failure          ┌───────────┐
//!                               ├────────────────────────▶│  Failed   │
//!                               │                         └───────────┘
//!                               │
//!                               │  cancel(), checked      ┌───────────┐
//!                               └────────────────────────▶│ Cancelled │
//!                                  between steps          └───────────┘
//! ```
//!
//! Any terminal state accepts the next run.
//!
//! # Step Execution
//!
//! For each step the engine:
//!
//! 1. observes the cancellation flag and stops before issuing anything
//! 2. validates the step and resolves every axis path; failures here abort the
//!    run before any I/O for the step
//! 3. issues all intents together on the engine task and waits for all of them
//! 4. appends the entry, notifies subscribers and flushes it to persistence
//!
//! A failed intent (after retries) is recorded in its step's entry next to the
//! sibling outcomes, then the run fails. Nothing already recorded is discarded.
//!
//! # Usage
//!
//! ```rust,no_run
//! use daq_sequencer::axis::registry::create_mock_registry;
//! use daq_sequencer::engine::{RunConfig, RunEngine};
//! use daq_sequencer::scan::{AxisRange, DeclarativeScan};
//! use daq_sequencer::storage::MemoryPersister;
//! use std::sync::Arc;
//!
//! # async fn demo() -> daq_sequencer::error::AppResult<()> {
//! let engine = RunEngine::new(
//!     Arc::new(create_mock_registry()?),
//!     Arc::new(MemoryPersister::new()),
//! );
//! let mut events = engine.subscribe();
//!
//! let scan = DeclarativeScan::new()
//!     .with_range(AxisRange::values("mc.x", vec![0.0, 1.0, 2.0]))
//!     .with_read("sensor.value");
//! let outcome = engine.run(scan, RunConfig::default()).await?;
//! assert_eq!(outcome.run.entries.len(), 3);
//! # let _ = events.try_recv();
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod retry;

pub use cancel::CancelFlag;
pub use retry::{execute_intent, RetryPolicy};

use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use crate::axis::AxisRegistry;
use crate::error::{AppResult, DaqError};
use crate::record::{
    new_uid, ActionRecord, Comment, FinalizedRun, RecordEntry, RecordEvent, RunMetadata,
    RunStatus, TerminalCause,
};
use crate::scan::{Scan, Step};
use crate::storage::RunPersister;

/// Default capacity of the record event channel.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

/// Run engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// No run has been started yet
    Idle,
    /// A run is executing steps
    Running,
    /// Last run consumed all steps
    Completed,
    /// Last run stopped on a fatal failure
    Failed,
    /// Last run was cancelled
    Cancelled,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Idle => write!(f, "Idle"),
            RunState::Running => write!(f, "Running"),
            RunState::Completed => write!(f, "Completed"),
            RunState::Failed => write!(f, "Failed"),
            RunState::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl From<RunStatus> for RunState {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Completed => RunState::Completed,
            RunStatus::Failed => RunState::Failed,
            RunStatus::Cancelled => RunState::Cancelled,
        }
    }
}

/// Immutable parameters of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Retry policy for transient driver failures
    pub retry: RetryPolicy,
    /// Per-intent timeout, applied to every attempt
    pub intent_timeout: Option<Duration>,
    /// Operator recorded in metadata
    pub user: String,
    /// Session or sample recorded in metadata
    pub session: String,
    /// Extra metadata
    pub metadata: BTreeMap<String, String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            intent_timeout: None,
            user: "anonymous".to_string(),
            session: "default".to_string(),
            metadata: BTreeMap::new(),
        }
    }
}

impl RunConfig {
    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the per-intent timeout.
    pub fn with_intent_timeout(mut self, timeout: Duration) -> Self {
        self.intent_timeout = Some(timeout);
        self
    }

    /// Set user and session.
    pub fn with_owner(mut self, user: impl Into<String>, session: impl Into<String>) -> Self {
        self.user = user.into();
        self.session = session.into();
        self
    }

    /// Add an extra metadata pair.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Result of a finished run.
#[derive(Debug)]
pub struct RunOutcome {
    /// The finalized record, whatever the terminal status
    pub run: FinalizedRun,
    /// Where persistence stored it, if on disk
    pub location: Option<PathBuf>,
    /// Persistence failure at finalization, if any
    pub persist_error: Option<DaqError>,
}

impl RunOutcome {
    /// Terminal status.
    pub fn status(&self) -> RunStatus {
        self.run.status
    }

    /// Whether the run completed and was persisted.
    pub fn is_success(&self) -> bool {
        self.run.status == RunStatus::Completed && self.persist_error.is_none()
    }
}

/// Progress of the current or last run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Run ID
    pub run_uid: String,
    /// Steps recorded so far
    pub completed: usize,
    /// Total steps, if the scan knows
    pub total: Option<usize>,
}

/// A scan waiting in the queue
struct QueuedScan {
    run_uid: String,
    scan: Box<dyn Scan>,
    config: RunConfig,
}

/// Execution runtime for scans.
pub struct RunEngine {
    registry: Arc<AxisRegistry>,
    persister: Arc<dyn RunPersister>,
    state: RwLock<RunState>,
    queue: Mutex<VecDeque<QueuedScan>>,
    event_sender: broadcast::Sender<RecordEvent>,
    cancel: CancelFlag,
    record: SyncMutex<Option<ActionRecord>>,
    pending_comments: SyncMutex<Vec<Comment>>,
    progress: SyncMutex<Option<Progress>>,
    run_counter: AtomicU64,
}

impl RunEngine {
    /// Create an engine with the default event channel capacity.
    pub fn new(registry: Arc<AxisRegistry>, persister: Arc<dyn RunPersister>) -> Self {
        Self::with_capacity(registry, persister, DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Create an engine whose event channel buffers `capacity` events.
    ///
    /// Subscribers lagging further behind lose the oldest events; the run never
    /// waits for them.
    pub fn with_capacity(
        registry: Arc<AxisRegistry>,
        persister: Arc<dyn RunPersister>,
        capacity: usize,
    ) -> Self {
        let (event_sender, _) = broadcast::channel(capacity.max(1));
        Self {
            registry,
            persister,
            state: RwLock::new(RunState::Idle),
            queue: Mutex::new(VecDeque::new()),
            event_sender,
            cancel: CancelFlag::new(),
            record: SyncMutex::new(None),
            pending_comments: SyncMutex::new(Vec::new()),
            progress: SyncMutex::new(None),
            run_counter: AtomicU64::new(0),
        }
    }

    /// Subscribe to record events.
    pub fn subscribe(&self) -> broadcast::Receiver<RecordEvent> {
        self.event_sender.subscribe()
    }

    /// Current engine state.
    pub async fn state(&self) -> RunState {
        *self.state.read().await
    }

    /// Axis registry runs resolve against.
    pub fn registry(&self) -> &Arc<AxisRegistry> {
        &self.registry
    }

    /// Handle on the cancellation flag, shared with the engine.
    ///
    /// Triggering it has the same effect as [`RunEngine::cancel`] without the
    /// state check. A trigger while idle cancels the next run at its first step
    /// boundary; the flag is reset when a run finishes.
    pub fn cancel_handle(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Progress of the current or last run.
    pub fn progress(&self) -> Option<Progress> {
        self.progress.lock().clone()
    }

    /// Copy of the active run's record.
    pub fn snapshot(&self) -> Option<ActionRecord> {
        self.record.lock().clone()
    }

    /// Queue a scan, returning the run ID it will use.
    pub async fn queue<S: Scan + 'static>(&self, scan: S, config: RunConfig) -> String {
        let run_uid = new_uid();
        info!(run_uid = %run_uid, plan_type = %scan.plan_type(), "Queueing scan");
        self.queue.lock().await.push_back(QueuedScan {
            run_uid: run_uid.clone(),
            scan: Box::new(scan),
            config,
        });
        run_uid
    }

    /// Number of queued scans.
    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Drop all queued scans.
    pub async fn clear_queue(&self) {
        self.queue.lock().await.clear();
    }

    /// Run the oldest queued scan to completion.
    ///
    /// # Errors
    /// `Engine` if a run is in progress or the queue is empty.
    #[instrument(skip(self), err)]
    pub async fn start(&self) -> AppResult<RunOutcome> {
        let mut state = self.state.write().await;
        if *state == RunState::Running {
            return Err(DaqError::Engine(format!("Cannot start: engine is {}", *state)));
        }
        let queued = self
            .queue
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| DaqError::Engine("No scans in queue".to_string()))?;
        *state = RunState::Running;
        drop(state);

        info!("Engine started");
        Ok(self.execute(queued.scan, queued.config, queued.run_uid).await)
    }

    /// Run `scan` immediately, bypassing the queue.
    ///
    /// Returns the finalized run whatever its terminal status; a failed or
    /// cancelled run is not an error.
    ///
    /// # Errors
    /// `Engine` if a run is in progress.
    #[instrument(skip(self, scan, config), fields(plan_type = %scan.plan_type()), err)]
    pub async fn run<S: Scan + 'static>(
        &self,
        scan: S,
        config: RunConfig,
    ) -> AppResult<RunOutcome> {
        {
            let mut state = self.state.write().await;
            if *state == RunState::Running {
                return Err(DaqError::Engine(format!("Cannot run: engine is {}", *state)));
            }
            *state = RunState::Running;
        }
        Ok(self.execute(Box::new(scan), config, new_uid()).await)
    }

    /// Request cancellation of the active run at the next step boundary.
    ///
    /// # Errors
    /// `Engine` if no run is in progress.
    #[instrument(skip(self), err)]
    pub async fn cancel(&self, reason: &str) -> AppResult<()> {
        let state = *self.state.read().await;
        if state != RunState::Running {
            return Err(DaqError::Engine(format!("Cannot cancel: engine is {}", state)));
        }
        info!(reason = %reason, "Cancellation requested");
        self.cancel.trigger(reason);
        Ok(())
    }

    /// Attach a comment to the active run at the next step boundary.
    ///
    /// # Errors
    /// `Engine` if no run is in progress.
    pub async fn comment(&self, text: impl Into<String>) -> AppResult<()> {
        let state = *self.state.read().await;
        if state != RunState::Running {
            return Err(DaqError::Engine(format!("Cannot comment: engine is {}", state)));
        }
        self.pending_comments.lock().push(Comment::now(text));
        Ok(())
    }

    fn emit(&self, event: RecordEvent) {
        debug!(run_uid = %event.run_uid(), "Emitting record event");
        // No subscribers is fine
        let _ = self.event_sender.send(event);
    }

    /// Move pending comments into the active record.
    fn drain_comments(&self, run_uid: &str) {
        let pending: Vec<Comment> = std::mem::take(&mut *self.pending_comments.lock());
        for comment in pending {
            self.add_comment(run_uid, comment);
        }
    }

    fn add_comment(&self, run_uid: &str, comment: Comment) {
        if let Some(record) = self.record.lock().as_mut() {
            record.add_comment(comment.clone());
        }
        self.emit(RecordEvent::Comment {
            run_uid: run_uid.to_string(),
            comment,
        });
    }

    /// Execute one scan. The state must already be `Running`.
    #[instrument(
        skip(self, scan, config, run_uid),
        fields(run_uid = %run_uid, plan_type = %scan.plan_type())
    )]
    async fn execute(
        &self,
        mut scan: Box<dyn Scan>,
        config: RunConfig,
        run_uid: String,
    ) -> RunOutcome {
        self.pending_comments.lock().clear();

        let metadata = RunMetadata {
            uid: run_uid.clone(),
            run_index: self.run_counter.fetch_add(1, Ordering::SeqCst) + 1,
            user: config.user.clone(),
            session: config.session.clone(),
            plan_type: scan.plan_type().to_string(),
            plan_args: scan.plan_args(),
            num_steps: scan.num_steps(),
            started_at: Utc::now(),
            ended_at: None,
            extra: config.metadata.clone(),
        };

        *self.record.lock() = Some(ActionRecord::new(metadata.clone()));
        *self.progress.lock() = Some(Progress {
            run_uid: run_uid.clone(),
            completed: 0,
            total: metadata.num_steps,
        });
        info!(
            run_index = metadata.run_index,
            num_steps = ?metadata.num_steps,
            "Run started"
        );
        self.emit(RecordEvent::RunStarted {
            metadata: metadata.clone(),
        });

        let mut seq = 0u64;
        let (status, cause) = loop {
            self.drain_comments(&run_uid);

            if self.cancel.is_triggered() {
                let reason = self.cancel.reason().unwrap_or_else(|| "cancelled".to_string());
                info!(reason = %reason, steps = seq, "Run cancelled at step boundary");
                self.add_comment(&run_uid, Comment::now(format!("Cancelled: {}", reason)));
                break (RunStatus::Cancelled, None);
            }

            let Some(step) = scan.next_step() else {
                break (RunStatus::Completed, None);
            };

            let entry = match self.execute_step(seq, step, &config).await {
                Ok(entry) => entry,
                Err(cause) => {
                    error!(
                        step = seq,
                        kind = %cause.kind,
                        error = %cause.message,
                        "Step rejected before I/O"
                    );
                    break (RunStatus::Failed, Some(cause));
                }
            };
            let fatal = first_failure(&entry);

            if let Err(e) = self.append(&metadata, entry).await {
                error!(step = seq, error = %e, "Failed to append record entry");
                break (RunStatus::Failed, Some(cause_from(&e, Some(seq), None)));
            }

            if let Some(cause) = fatal {
                error!(
                    step = seq,
                    axis = ?cause.axis,
                    kind = %cause.kind,
                    error = %cause.message,
                    "Intent failed, stopping run"
                );
                break (RunStatus::Failed, Some(cause));
            }
            seq += 1;
        };

        self.drain_comments(&run_uid);
        self.finish(metadata, status, cause).await
    }

    /// Validate, resolve and execute one step.
    ///
    /// Errors are returned before any intent is issued.
    async fn execute_step(
        &self,
        seq: u64,
        step: Step,
        config: &RunConfig,
    ) -> Result<RecordEntry, TerminalCause> {
        step.validate().map_err(|e| cause_from(&e, Some(seq), None))?;

        let label = step.label().map(str::to_string);
        let intents = step.into_intents();
        let mut resolved = Vec::with_capacity(intents.len());
        for intent in intents {
            let axis = self
                .registry
                .resolve(&intent.axis)
                .map_err(|e| cause_from(&e, Some(seq), Some(intent.axis.clone())))?;
            resolved.push((axis, intent));
        }

        debug!(step = seq, label = ?label, intents = resolved.len(), "Issuing step");
        let started_at = Utc::now();
        let outcomes = join_all(resolved.iter().map(|(axis, intent)| {
            execute_intent(axis, intent, &config.retry, config.intent_timeout)
        }))
        .await;

        Ok(RecordEntry {
            seq,
            label,
            started_at,
            finished_at: Utc::now(),
            outcomes,
        })
    }

    /// Append an entry, notify subscribers and flush it.
    async fn append(&self, metadata: &RunMetadata, entry: RecordEntry) -> AppResult<()> {
        {
            let mut guard = self.record.lock();
            let record = guard
                .as_mut()
                .ok_or_else(|| DaqError::Engine("no active record".to_string()))?;
            record.append(entry.clone())?;
        }
        if let Some(progress) = self.progress.lock().as_mut() {
            progress.completed += 1;
        }

        if entry.is_partial_failure() {
            warn!(step = entry.seq, "Partial failure recorded");
        }
        if let Err(e) = self.persister.flush_entry(metadata, &entry).await {
            warn!(
                step = entry.seq,
                persister = %self.persister.name(),
                error = %e,
                "Incremental flush failed, continuing"
            );
        }
        self.emit(RecordEvent::EntryAppended {
            run_uid: metadata.uid.clone(),
            entry,
        });
        Ok(())
    }

    /// Finalize the record, persist it and publish the terminal state.
    async fn finish(
        &self,
        metadata: RunMetadata,
        status: RunStatus,
        cause: Option<TerminalCause>,
    ) -> RunOutcome {
        let record = self
            .record
            .lock()
            .take()
            .unwrap_or_else(|| ActionRecord::new(metadata));
        let run = record.finalize(status, cause, Utc::now());
        // A request consumed by this run must not cancel the next one
        self.cancel.reset();

        let (location, persist_error) = match self.persister.persist(&run).await {
            Ok(location) => (location, None),
            Err(e) => {
                error!(
                    persister = %self.persister.name(),
                    error = %e,
                    "Failed to persist finalized run"
                );
                let err = match e {
                    DaqError::Persistence(_) => e,
                    other => DaqError::Persistence(other.to_string()),
                };
                (None, Some(err))
            }
        };

        self.emit(RecordEvent::RunFinished {
            run_uid: run.metadata.uid.clone(),
            status,
            entries: run.entries.len(),
        });
        *self.state.write().await = status.into();

        info!(
            status = %status,
            entries = run.entries.len(),
            "Run finished"
        );

        RunOutcome {
            run,
            location,
            persist_error,
        }
    }
}

fn cause_from(err: &DaqError, step: Option<u64>, axis: Option<String>) -> TerminalCause {
    TerminalCause {
        kind: err.failure_kind(),
        message: err.to_string(),
        step,
        axis,
    }
}

/// First failed outcome of an entry, in declaration order.
fn first_failure(entry: &RecordEntry) -> Option<TerminalCause> {
    entry.outcomes.iter().find_map(|outcome| {
        outcome.failure.as_ref().map(|failure| TerminalCause {
            kind: failure.kind,
            message: failure.message.clone(),
            step: Some(entry.seq),
            axis: Some(outcome.axis.clone()),
        })
    })
}
