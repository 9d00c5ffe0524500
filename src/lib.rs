//! # DAQ Sequencer Core Library
//!
//! Inverted-control scan sequencing for laboratory data acquisition. Users
//! describe an experiment as a lazy sequence of steps made of read/write
//! intents against abstract axes; the run engine executes them, records every
//! outcome and hands the record to persistence, whatever way the run ends.
//!
//! ## Crate Structure
//!
//! - **`axis`**: The `Axis` abstraction over instrument quantities, the
//!   `AxisDriver` trait implemented by the driver layer, mock drivers and the
//!   `AxisRegistry` that resolves axis paths.
//! - **`scan`**: `Step`s and `Intent`s, the `Scan` trait, declarative
//!   (Cartesian product) and imperative scans, range strategies and
//!   `ScanDefinition` for scans described in configuration.
//! - **`engine`**: The `RunEngine` state machine: concurrent step execution,
//!   retries of transient driver errors, per-intent timeouts, cooperative
//!   cancellation, a run queue and record event subscriptions.
//! - **`record`**: The append-only `ActionRecord`, its entries, finalized runs
//!   and independent-axis collation.
//! - **`storage`**: The `RunPersister` collaborator trait with JSON, CSV,
//!   in-memory and discarding backends.
//! - **`backoff`**: Exponential backoff shared by settling and retries.
//! - **`config`**: Figment-based `Settings` loaded from TOML and environment.
//! - **`logging`**: Tracing subscriber setup.
//! - **`error`**: The `DaqError` enum for centralized error handling.
//!
//! ## Example
//!
//! ```rust
//! use daq_sequencer::axis::registry::create_mock_registry;
//! use daq_sequencer::axis::AxisValue;
//! use daq_sequencer::engine::{RunConfig, RunEngine};
//! use daq_sequencer::scan::{AxisRange, DeclarativeScan};
//! use daq_sequencer::storage::MemoryPersister;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let engine = RunEngine::new(
//!     Arc::new(create_mock_registry().unwrap()),
//!     Arc::new(MemoryPersister::new()),
//! );
//! let scan = DeclarativeScan::new()
//!     .with_range(AxisRange::values("mc.x", vec![0.0, 1.0, 2.0]))
//!     .with_read("sensor.value");
//!
//! let outcome = engine.run(scan, RunConfig::default()).await.unwrap();
//! assert_eq!(
//!     outcome.run.values_of("sensor.value"),
//!     vec![AxisValue::Float(0.0), AxisValue::Float(10.0), AxisValue::Float(20.0)]
//! );
//! # })
//! ```

pub mod axis;
pub mod backoff;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod record;
pub mod scan;
pub mod storage;

pub use axis::{Axis, AxisDriver, AxisRegistry, AxisValue};
pub use engine::{RunConfig, RunEngine, RunState};
pub use error::{AppResult, DaqError};
pub use record::{ActionRecord, FinalizedRun, RecordEntry, RecordEvent, RunStatus};
pub use scan::{DeclarativeScan, ImperativeScan, Intent, Scan, Step};
