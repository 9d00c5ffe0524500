//! Integration tests for scan execution through the RunEngine.
//!
//! Covers the end-to-end guarantees of the sequencer: step cardinality,
//! pre-I/O step validation, retries, failure and cancellation semantics, and
//! preservation of everything recorded before a run stops.

use daq_sequencer::axis::registry::{create_mock_registry, AxisConfig, RegistryBuilder};
use daq_sequencer::axis::{Axis, AxisRegistry, AxisValue, ComputedDriver, MockAxisDriver};
use daq_sequencer::engine::{CancelFlag, RetryPolicy, RunConfig, RunEngine, RunState};
use daq_sequencer::error::{DriverError, FailureKind};
use daq_sequencer::record::{RecordEvent, RunStatus};
use daq_sequencer::scan::{AxisRange, DeclarativeScan, ImperativeScan, Scan, Step};
use daq_sequencer::storage::MemoryPersister;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn stage_and_sensor() -> (Arc<MockAxisDriver>, Arc<MockAxisDriver>, AxisRegistry) {
    let stage = Arc::new(MockAxisDriver::new(0.0));
    let sensor = Arc::new(MockAxisDriver::new(1.0));
    let mut registry = AxisRegistry::new();
    registry
        .register(Axis::builder("mc.x").driver(stage.clone()).build().unwrap())
        .unwrap();
    registry
        .register(
            Axis::builder("sensor.value")
                .read_only()
                .driver(sensor.clone())
                .build()
                .unwrap(),
        )
        .unwrap();
    (stage, sensor, registry)
}

#[test]
fn test_product_cardinality() {
    let scan = DeclarativeScan::new()
        .with_range(AxisRange::linspace("mc.x", 0.0, 1.0, 4))
        .with_range(AxisRange::values("mc.y", vec![0i64, 1, 2]))
        .with_range(AxisRange::values("mc.mode", vec!["a", "b"]))
        .with_read("sensor.value");
    assert_eq!(scan.num_steps(), Some(24));

    let mut scan = scan;
    let mut count = 0;
    while scan.next_step().is_some() {
        count += 1;
    }
    assert_eq!(count, 24);
}

#[test]
fn test_empty_range_yields_no_steps() {
    let mut scan = DeclarativeScan::new()
        .with_range(AxisRange::linspace("mc.x", 0.0, 1.0, 5))
        .with_range(AxisRange::linspace("mc.y", 0.0, 1.0, 0))
        .with_read("sensor.value");
    assert_eq!(scan.num_steps(), Some(0));
    assert!(scan.next_step().is_none());
}

#[tokio::test]
async fn test_example_scan_records_ten_x() {
    let persister = Arc::new(MemoryPersister::new());
    let engine = RunEngine::new(Arc::new(create_mock_registry().unwrap()), persister.clone());

    let scan = DeclarativeScan::new()
        .with_range(AxisRange::values("mc.x", vec![0.0, 1.0, 2.0]))
        .with_read("sensor.value");
    let outcome = engine.run(scan, RunConfig::default()).await.unwrap();

    assert_eq!(outcome.status(), RunStatus::Completed);
    assert_eq!(outcome.run.entries.len(), 3);
    for entry in &outcome.run.entries {
        assert_eq!(entry.outcomes.len(), 2);
        assert_eq!(entry.outcomes[0].axis, "mc.x");
        assert_eq!(entry.outcomes[1].axis, "sensor.value");
    }
    assert_eq!(
        outcome.run.values_of("sensor.value"),
        vec![
            AxisValue::Float(0.0),
            AxisValue::Float(10.0),
            AxisValue::Float(20.0)
        ]
    );
    assert_eq!(persister.last_run().unwrap(), outcome.run);
}

#[tokio::test]
async fn test_duplicate_axis_step_rejected_before_io() {
    let (stage, sensor, registry) = stage_and_sensor();
    let engine = RunEngine::new(Arc::new(registry), Arc::new(MemoryPersister::new()));

    let scan = ImperativeScan::from_steps(vec![Step::new()
        .write("mc.x", 1.0)
        .read("sensor.value")
        .read("mc.x")]);
    let outcome = engine.run(scan, RunConfig::default()).await.unwrap();

    assert_eq!(outcome.status(), RunStatus::Failed);
    assert_eq!(outcome.run.cause.unwrap().kind, FailureKind::StepValidation);
    assert!(outcome.run.entries.is_empty());
    assert_eq!(stage.write_count(), 0);
    assert_eq!(stage.read_count(), 0);
    assert_eq!(sensor.read_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_read_failures_are_retried() {
    let stage = Arc::new(MockAxisDriver::new(0.0));
    let sensor = Arc::new(MockAxisDriver::new(42.0).failing_reads(2));
    let mut registry = AxisRegistry::new();
    registry
        .register(Axis::builder("mc.x").driver(stage).build().unwrap())
        .unwrap();
    registry
        .register(Axis::builder("sensor.value").driver(sensor.clone()).build().unwrap())
        .unwrap();
    let engine = RunEngine::new(Arc::new(registry), Arc::new(MemoryPersister::new()));

    let scan = DeclarativeScan::new()
        .with_range(AxisRange::values("mc.x", vec![1.0]))
        .with_read("sensor.value");
    let config = RunConfig::default().with_retry(RetryPolicy::with_max_retries(2));
    let outcome = engine.run(scan, config).await.unwrap();

    assert_eq!(outcome.status(), RunStatus::Completed);
    let read = &outcome.run.entries[0].outcomes[1];
    assert!(read.succeeded());
    assert_eq!(read.resolved, Some(AxisValue::Float(42.0)));
    assert_eq!(read.attempts, 3);
    assert_eq!(read.retries.len(), 2);
    assert!(read.retries[0].error.contains("scripted read failure"));
    assert_eq!(sensor.read_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_fail_the_run() {
    let sensor = Arc::new(MockAxisDriver::new(0.0).failing_reads(10));
    let mut registry = AxisRegistry::new();
    registry
        .register(Axis::builder("sensor.value").driver(sensor).build().unwrap())
        .unwrap();
    let engine = RunEngine::new(Arc::new(registry), Arc::new(MemoryPersister::new()));

    let steps = (0..3).map(|_| Step::new().read("sensor.value"));
    let config = RunConfig::default().with_retry(RetryPolicy::with_max_retries(1));
    let outcome = engine
        .run(ImperativeScan::new("count", steps), config)
        .await
        .unwrap();

    assert_eq!(outcome.status(), RunStatus::Failed);
    assert_eq!(outcome.run.entries.len(), 1);
    let cause = outcome.run.cause.unwrap();
    assert_eq!(cause.kind, FailureKind::Driver);
    assert_eq!(cause.step, Some(0));
}

#[tokio::test]
async fn test_validation_failure_preserves_prior_entries() {
    let persister = Arc::new(MemoryPersister::new());
    let registry = RegistryBuilder::new()
        .build(&[
            AxisConfig {
                domain: Some(daq_sequencer::axis::Domain::Limits { min: 0.0, max: 2.0 }),
                ..AxisConfig::mock("mc.x", 0.0)
            },
            AxisConfig::derived("sensor.value", "mc.x", 10.0),
        ])
        .unwrap();
    let engine = RunEngine::new(Arc::new(registry), persister.clone());

    let scan = DeclarativeScan::new()
        .with_range(AxisRange::values("mc.x", vec![0.0, 1.0, 2.0, 3.0, 1.0]))
        .with_read("sensor.value");
    let outcome = engine.run(scan, RunConfig::default()).await.unwrap();

    assert_eq!(outcome.status(), RunStatus::Failed);
    let run = persister.last_run().unwrap();
    assert_eq!(run, outcome.run);

    // Steps 0..=2 intact, step 3 recorded with its failure, step 4 never issued
    assert_eq!(run.entries.len(), 4);
    for (i, entry) in run.entries.iter().take(3).enumerate() {
        assert_eq!(entry.seq, i as u64);
        assert!(!entry.has_failures());
        assert_eq!(entry.value_of("sensor.value"), Some(&AxisValue::Float(10.0 * i as f64)));
    }
    let failed = &run.entries[3];
    assert!(failed.is_partial_failure());
    assert_eq!(failed.outcomes[0].failure.as_ref().unwrap().kind, FailureKind::Validation);

    let cause = run.cause.unwrap();
    assert_eq!(cause.kind, FailureKind::Validation);
    assert_eq!(cause.step, Some(3));
    assert_eq!(cause.axis.as_deref(), Some("mc.x"));
}

#[tokio::test]
async fn test_cancellation_after_third_step_keeps_three_entries() {
    let x = Arc::new(MockAxisDriver::new(0.0));
    let flag_slot: Arc<Mutex<Option<CancelFlag>>> = Arc::new(Mutex::new(None));
    let reads = Arc::new(AtomicU32::new(0));

    // Cancel while step 3 is in flight; it must still finish and be recorded.
    let sensor = {
        let x = x.clone();
        let flag_slot = flag_slot.clone();
        let reads = reads.clone();
        ComputedDriver::new(move || {
            if reads.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                if let Some(flag) = flag_slot.lock().as_ref() {
                    flag.trigger("operator stop");
                }
            }
            Ok::<_, DriverError>(AxisValue::Float(10.0 * x.current_f64()))
        })
    };

    let mut registry = AxisRegistry::new();
    registry
        .register(Axis::builder("mc.x").driver(x.clone()).build().unwrap())
        .unwrap();
    registry
        .register(
            Axis::builder("sensor.value")
                .read_only()
                .driver(Arc::new(sensor))
                .build()
                .unwrap(),
        )
        .unwrap();

    let persister = Arc::new(MemoryPersister::new());
    let engine = RunEngine::new(Arc::new(registry), persister.clone());
    *flag_slot.lock() = Some(engine.cancel_handle());

    let scan = DeclarativeScan::new()
        .with_range(AxisRange::linspace("mc.x", 0.0, 9.0, 10))
        .with_read("sensor.value");
    assert_eq!(scan.num_steps(), Some(10));
    let outcome = engine.run(scan, RunConfig::default()).await.unwrap();

    assert_eq!(outcome.status(), RunStatus::Cancelled);
    assert_eq!(engine.state().await, RunState::Cancelled);
    let run = persister.last_run().unwrap();
    assert_eq!(run.entries.len(), 3);
    assert_eq!(run.values_of("sensor.value").len(), 3);
    assert!(run.cause.is_none());
    assert_eq!(x.write_count(), 3);
}

#[tokio::test]
async fn test_cancel_from_another_task() {
    let stage = Arc::new(MockAxisDriver::new(0.0).with_latency(Duration::from_millis(20)));
    let mut registry = AxisRegistry::new();
    registry
        .register(Axis::builder("mc.x").driver(stage).build().unwrap())
        .unwrap();
    let engine = Arc::new(RunEngine::new(
        Arc::new(registry),
        Arc::new(MemoryPersister::new()),
    ));
    let mut events = engine.subscribe();

    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move {
            let scan = DeclarativeScan::new()
                .with_range(AxisRange::linspace("mc.x", 0.0, 1.0, 1000));
            engine.run(scan, RunConfig::default()).await
        })
    };

    // Wait for the first entry, then cancel
    loop {
        match events.recv().await.unwrap() {
            RecordEvent::EntryAppended { .. } => break,
            _ => continue,
        }
    }
    engine.cancel("test").await.unwrap();
    engine.comment("stopped early").await.ok();

    let outcome = runner.await.unwrap().unwrap();
    assert_eq!(outcome.status(), RunStatus::Cancelled);
    assert!(outcome.run.entries.len() < 1000);
    assert!(outcome
        .run
        .comments
        .iter()
        .any(|c| c.text.contains("test")));
}

#[tokio::test]
async fn test_second_run_rejected_while_running() {
    let stage = Arc::new(MockAxisDriver::new(0.0).with_latency(Duration::from_millis(50)));
    let mut registry = AxisRegistry::new();
    registry
        .register(Axis::builder("mc.x").driver(stage).build().unwrap())
        .unwrap();
    let engine = Arc::new(RunEngine::new(
        Arc::new(registry),
        Arc::new(MemoryPersister::new()),
    ));
    let mut events = engine.subscribe();

    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move {
            let scan = DeclarativeScan::new().with_range(AxisRange::linspace("mc.x", 0.0, 1.0, 3));
            engine.run(scan, RunConfig::default()).await
        })
    };
    assert!(matches!(
        events.recv().await.unwrap(),
        RecordEvent::RunStarted { .. }
    ));

    let second = engine
        .run(DeclarativeScan::new(), RunConfig::default())
        .await;
    assert!(second.is_err());
    assert_eq!(runner.await.unwrap().unwrap().status(), RunStatus::Completed);
}

#[tokio::test]
async fn test_concurrent_intents_share_one_barrier() {
    let a = Arc::new(MockAxisDriver::new(0.0).with_latency(Duration::from_millis(100)));
    let b = Arc::new(MockAxisDriver::new(0.0).with_latency(Duration::from_millis(100)));
    let mut registry = AxisRegistry::new();
    registry
        .register(Axis::builder("mc.a").driver(a).build().unwrap())
        .unwrap();
    registry
        .register(Axis::builder("mc.b").driver(b).build().unwrap())
        .unwrap();
    let engine = RunEngine::new(Arc::new(registry), Arc::new(MemoryPersister::new()));

    let scan = ImperativeScan::from_steps(vec![Step::new().write("mc.a", 1.0).write("mc.b", 2.0)]);
    let started = tokio::time::Instant::now();
    let outcome = engine.run(scan, RunConfig::default()).await.unwrap();

    assert_eq!(outcome.status(), RunStatus::Completed);
    // Both writes overlap; sequential execution would take at least 200ms
    assert!(started.elapsed() < Duration::from_millis(190));
}
