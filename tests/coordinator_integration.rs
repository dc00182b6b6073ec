//! Integration tests for the operation coordinator.
//!
//! These tests drive a real worker pool against lock directories created with
//! tempfile and a fixed memory source, so admission decisions are
//! deterministic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tempfile::TempDir;

use opcoord::coordinator::{OperationManager, SubmitRequest};
use opcoord::core::config::CoordinatorConfig;
use opcoord::core::memory::{FixedMemory, MemoryMonitor, PressureLevel};
use opcoord::core::operation::runnable;
use opcoord::core::ops::lock::{LockManager, LockMode};
use opcoord::core::sink::{JournalSink, MemorySink, SinkEventKind, StepStatus};
use opcoord::core::types::{OperationId, OperationType, Priority, ResourceRequirement};

// =============================================================================
// Test Helpers
// =============================================================================

const PATIENCE: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn config(dir: &TempDir, workers: usize) -> CoordinatorConfig {
    CoordinatorConfig {
        max_concurrent: workers,
        lock_dir: dir.path().join("locks"),
        ..Default::default()
    }
    .with_intervals(Duration::from_millis(20))
}

/// Monitor with thresholds 512/256 MB over an adjustable source.
fn memory(available_mb: u64) -> (Arc<FixedMemory>, MemoryMonitor) {
    let source = Arc::new(FixedMemory::from_mb(available_mb));
    let monitor = MemoryMonitor::with_source(512, 256, source.clone());
    (source, monitor)
}

fn start(dir: &TempDir, workers: usize, available_mb: u64) -> (Arc<FixedMemory>, OperationManager) {
    init_tracing();
    let (source, monitor) = memory(available_mb);
    let manager =
        OperationManager::with_monitor(config(dir, workers), monitor).expect("start manager");
    (source, manager)
}

fn counting(id: &str, counter: &Arc<AtomicUsize>) -> (Arc<MemorySink>, SubmitRequest) {
    let sink = Arc::new(MemorySink::new(id));
    let counter = Arc::clone(counter);
    let request = SubmitRequest::new(
        id,
        OperationType::Sync,
        runnable(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
        sink.clone(),
    );
    (sink, request)
}

/// Poll `cond` until it holds or patience runs out.
fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + PATIENCE;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// One-shot latch that callbacks block on.
#[derive(Clone, Default)]
struct Gate(Arc<(Mutex<bool>, Condvar)>);

impl Gate {
    fn wait(&self) {
        let (open, signal) = &*self.0;
        let deadline = Instant::now() + PATIENCE;
        let mut open = open.lock();
        while !*open {
            if signal.wait_until(&mut open, deadline).timed_out() {
                break;
            }
        }
    }

    fn open(&self) {
        let (open, signal) = &*self.0;
        *open.lock() = true;
        signal.notify_all();
    }
}

/// Submit an operation that blocks until `gate` opens, and wait for it to run.
fn occupy_worker(manager: &OperationManager, gate: &Gate, resources: ResourceRequirement) {
    let gate = gate.clone();
    let sink = Arc::new(MemorySink::new("blocker"));
    assert!(manager.submit_operation(
        SubmitRequest::new(
            "blocker",
            OperationType::Backup,
            runnable(move || {
                gate.wait();
                Ok(())
            }),
            sink,
        )
        .with_resources(resources)
    ));
    assert!(wait_for(|| manager.running_operations().len() == 1));
}

// =============================================================================
// Execution
// =============================================================================

#[test]
fn executes_every_submitted_operation() {
    let temp = TempDir::new().expect("create temp dir");
    let (_, manager) = start(&temp, 3, 8192);
    let counter = Arc::new(AtomicUsize::new(0));

    let sinks: Vec<_> = (0..6)
        .map(|i| {
            let (sink, request) = counting(&format!("op-{}", i), &counter);
            assert!(manager.submit_operation(request));
            sink
        })
        .collect();

    assert!(manager.wait_until_idle(Some(PATIENCE)));
    assert_eq!(counter.load(Ordering::SeqCst), 6);

    let metrics = manager.metrics();
    assert_eq!(metrics.operations_started, 6);
    assert_eq!(metrics.operations_completed, 6);
    assert_eq!(metrics.operations_failed, 0);

    for sink in sinks {
        assert!(sink.has_step("queued", StepStatus::Completed));
        assert!(sink.has_step("execution", StepStatus::Started));
        assert!(sink.has_step("execution", StepStatus::Completed));
    }
}

#[test]
fn failing_callback_is_counted_and_logged() {
    let temp = TempDir::new().expect("create temp dir");
    let (_, manager) = start(&temp, 1, 8192);
    let sink = Arc::new(MemorySink::new("bad"));

    assert!(manager.submit_operation(SubmitRequest::new(
        "bad",
        OperationType::Scrub,
        runnable(|| anyhow::bail!("checksum mismatch")),
        sink.clone(),
    )));

    assert!(manager.wait_until_idle(Some(PATIENCE)));
    let metrics = manager.metrics();
    assert_eq!(metrics.operations_failed, 1);
    assert_eq!(metrics.operations_completed, 0);
    assert_eq!(sink.error_kinds(), vec!["execution_failed".to_string()]);
    assert!(!sink.has_step("execution", StepStatus::Completed));
}

#[test]
fn panicking_callback_leaves_worker_usable() {
    let temp = TempDir::new().expect("create temp dir");
    let (_, manager) = start(&temp, 1, 8192);
    let counter = Arc::new(AtomicUsize::new(0));

    let panicking = Arc::new(MemorySink::new("panics"));
    assert!(manager.submit_operation(
        SubmitRequest::new(
            "panics",
            OperationType::Sync,
            runnable(|| panic!("callback exploded")),
            panicking.clone(),
        )
        .with_paths(["/data/shared"])
    ));
    let (_, after) = counting("after", &counter);
    assert!(manager.submit_operation(after.with_paths(["/data/shared"])));

    assert!(manager.wait_until_idle(Some(PATIENCE)));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(manager.metrics().operations_failed, 1);
    assert_eq!(manager.metrics().operations_completed, 1);
    assert_eq!(panicking.error_kinds(), vec!["execution_failed".to_string()]);
    assert!(manager.lock_manager().held_locks().is_empty());
}

#[test]
fn higher_priority_runs_first() {
    let temp = TempDir::new().expect("create temp dir");
    let (_, manager) = start(&temp, 1, 8192);
    let gate = Gate::default();
    occupy_worker(&manager, &gate, ResourceRequirement::default());

    let order = Arc::new(Mutex::new(Vec::new()));
    for (id, priority) in [
        ("low", Priority::Low),
        ("normal", Priority::Normal),
        ("critical", Priority::Critical),
        ("high", Priority::High),
        ("normal-2", Priority::Normal),
    ] {
        let order = Arc::clone(&order);
        let name = id.to_string();
        assert!(manager.submit_operation(
            SubmitRequest::new(
                id,
                OperationType::Sync,
                runnable(move || {
                    order.lock().push(name.clone());
                    Ok(())
                }),
                Arc::new(MemorySink::new(id)),
            )
            .with_priority(priority)
        ));
    }

    gate.open();
    assert!(manager.wait_until_idle(Some(PATIENCE)));
    assert_eq!(
        *order.lock(),
        vec!["critical", "high", "normal", "normal-2", "low"]
    );
}

// =============================================================================
// Admission control
// =============================================================================

#[test]
fn critical_pressure_throttles_until_recovery() {
    let temp = TempDir::new().expect("create temp dir");
    let (source, manager) = start(&temp, 2, 100);
    let counter = Arc::new(AtomicUsize::new(0));
    let (sink, request) = counting("throttled", &counter);

    assert!(manager.submit_operation(request.with_priority(Priority::Critical)));
    assert!(wait_for(|| manager.metrics().memory_throttles >= 2));
    assert_eq!(counter.load(Ordering::SeqCst), 0);
    assert_eq!(manager.get_status().memory_pressure, PressureLevel::Critical);
    assert!(sink
        .warnings()
        .contains(&"Critical memory pressure, throttling operations".to_string()));

    source.set_mb(8192);
    assert!(manager.wait_until_idle(Some(PATIENCE)));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(manager.metrics().operations_started, 1);
}

#[test]
fn warning_pressure_admits_only_high_priority() {
    let temp = TempDir::new().expect("create temp dir");
    let (_, manager) = start(&temp, 2, 400);
    let low_runs = Arc::new(AtomicUsize::new(0));
    let high_runs = Arc::new(AtomicUsize::new(0));

    let (low_sink, low) = counting("low", &low_runs);
    let (_, high) = counting("high", &high_runs);
    assert!(manager.submit_operation(low.with_priority(Priority::Low)));
    assert!(manager.submit_operation(high.with_priority(Priority::High)));

    assert!(wait_for(|| high_runs.load(Ordering::SeqCst) == 1));
    assert!(wait_for(|| low_sink
        .warnings()
        .contains(&"Memory pressure, skipping LOW priority".to_string())));
    assert_eq!(low_runs.load(Ordering::SeqCst), 0);
    assert!(manager.queue().contains(&OperationId::new("low").unwrap()));

    manager.shutdown();
    assert_eq!(low_runs.load(Ordering::SeqCst), 0);
}

#[test]
fn insufficient_headroom_is_throttled() {
    let temp = TempDir::new().expect("create temp dir");
    let (source, manager) = start(&temp, 1, 1000);
    let counter = Arc::new(AtomicUsize::new(0));
    let (sink, request) = counting("big", &counter);

    assert!(manager.submit_operation(request.with_resources(ResourceRequirement::new(800, 50.0))));
    assert!(wait_for(|| sink
        .warnings()
        .contains(&"Insufficient memory for 800MB requirement".to_string())));
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    source.set_mb(4096);
    assert!(manager.wait_until_idle(Some(PATIENCE)));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn external_lock_holder_blocks_until_release() {
    let temp = TempDir::new().expect("create temp dir");
    let (_, manager) = start(&temp, 2, 8192);
    let external = LockManager::new(temp.path().join("locks")).expect("external manager");
    assert!(external.acquire_lock("/data/photos", LockMode::Exclusive));

    let counter = Arc::new(AtomicUsize::new(0));
    let (sink, request) = counting("photos", &counter);
    assert!(manager.submit_operation(request.with_paths(["/data/photos"])));

    assert!(wait_for(|| manager.metrics().resource_conflicts >= 1));
    assert_eq!(counter.load(Ordering::SeqCst), 0);
    assert!(sink
        .warnings()
        .contains(&"Resource already in use: /data/photos".to_string()));
    assert_eq!(
        manager.get_resource_conflicts(&["/data/photos", "/data/music"]),
        vec!["/data/photos".to_string()]
    );

    external.release_lock("/data/photos");
    assert!(manager.wait_until_idle(Some(PATIENCE)));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(manager.get_resource_conflicts(&["/data/photos"]).is_empty());
}

#[test]
fn overlapping_paths_never_run_concurrently() {
    let temp = TempDir::new().expect("create temp dir");
    let (_, manager) = start(&temp, 3, 8192);
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    for i in 0..6 {
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        let done = Arc::clone(&done);
        let id = format!("shared-{}", i);
        assert!(manager.submit_operation(
            SubmitRequest::new(
                id.clone(),
                OperationType::Scrub,
                runnable(move || {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(15));
                    active.fetch_sub(1, Ordering::SeqCst);
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
                Arc::new(MemorySink::new(id)),
            )
            .with_paths(["/volume/shared"])
        ));
    }

    assert!(manager.wait_until_idle(Some(Duration::from_secs(30))));
    assert_eq!(done.load(Ordering::SeqCst), 6);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Queue management
// =============================================================================

#[test]
fn cancel_removes_only_queued_operations() {
    let temp = TempDir::new().expect("create temp dir");
    let (_, manager) = start(&temp, 1, 8192);
    let gate = Gate::default();
    occupy_worker(&manager, &gate, ResourceRequirement::default());

    let counter = Arc::new(AtomicUsize::new(0));
    let (sink, request) = counting("waiting", &counter);
    assert!(manager.submit_operation(request));

    assert!(!manager.cancel_operation("blocker"));
    assert!(manager.cancel_operation("waiting"));
    assert!(!manager.cancel_operation("waiting"));
    assert!(!manager.cancel_operation(""));
    assert!(sink.has_step("cancelled", StepStatus::Completed));

    gate.open();
    assert!(manager.wait_until_idle(Some(PATIENCE)));
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[test]
fn full_queue_rejects_with_warning() {
    let temp = TempDir::new().expect("create temp dir");
    init_tracing();
    let (_, monitor) = memory(8192);
    let manager = OperationManager::with_monitor(
        CoordinatorConfig {
            queue_capacity: 2,
            ..config(&temp, 1)
        },
        monitor,
    )
    .expect("start manager");
    let gate = Gate::default();
    occupy_worker(&manager, &gate, ResourceRequirement::default());

    let counter = Arc::new(AtomicUsize::new(0));
    let (_, first) = counting("first", &counter);
    let (_, second) = counting("second", &counter);
    let (rejected_sink, third) = counting("third", &counter);
    assert!(manager.submit_operation(first));
    assert!(manager.submit_operation(second));
    assert!(!manager.submit_operation(third));
    assert_eq!(rejected_sink.warnings(), vec!["Operation queue is full".to_string()]);
    assert_eq!(manager.queue().size(), 2);

    gate.open();
    assert!(manager.wait_until_idle(Some(PATIENCE)));
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn duplicate_queued_id_is_rejected() {
    let temp = TempDir::new().expect("create temp dir");
    let (_, manager) = start(&temp, 1, 8192);
    let gate = Gate::default();
    occupy_worker(&manager, &gate, ResourceRequirement::default());

    let counter = Arc::new(AtomicUsize::new(0));
    let (_, original) = counting("twin", &counter);
    let (dup_sink, duplicate) = counting("twin", &counter);
    assert!(manager.submit_operation(original));
    assert!(!manager.submit_operation(duplicate));
    assert_eq!(dup_sink.warnings(), vec!["Operation id is already queued".to_string()]);

    gate.open();
    assert!(manager.wait_until_idle(Some(PATIENCE)));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Status and lifecycle
// =============================================================================

#[test]
fn status_reports_running_usage() {
    let temp = TempDir::new().expect("create temp dir");
    let (_, manager) = start(&temp, 2, 8192);
    let gate = Gate::default();
    occupy_worker(&manager, &gate, ResourceRequirement::new(128, 25.0));

    let status = manager.get_status();
    assert_eq!(status.running_operations, 1);
    assert_eq!(status.max_concurrent, 2);
    assert_eq!(status.current_usage.memory_mb, 128);
    assert_eq!(status.current_usage.cpu_percent, 25.0);
    assert_eq!(status.memory_pressure, PressureLevel::Normal);
    assert_eq!(status.available_memory_mb, 8192);
    assert_eq!(status.queue_info.size, 0);

    let running = manager.running_operations();
    assert_eq!(running[0].id.as_str(), "blocker");
    assert!(running[0].started_at.is_some());

    gate.open();
    assert!(manager.wait_until_idle(Some(PATIENCE)));
    let status = manager.get_status();
    assert_eq!(status.running_operations, 0);
    assert_eq!(status.current_usage.memory_mb, 0);
}

#[test]
fn wait_until_idle_times_out_while_callback_runs() {
    let temp = TempDir::new().expect("create temp dir");
    let (_, manager) = start(&temp, 1, 8192);
    let gate = Gate::default();
    occupy_worker(&manager, &gate, ResourceRequirement::default());

    let started = Instant::now();
    assert!(!manager.wait_until_idle(Some(Duration::from_millis(100))));
    assert!(started.elapsed() >= Duration::from_millis(100));

    gate.open();
    assert!(manager.wait_until_idle(None));
}

#[test]
fn shutdown_is_prompt_with_default_intervals() {
    let temp = TempDir::new().expect("create temp dir");
    init_tracing();
    let (_, monitor) = memory(8192);
    let manager = OperationManager::with_monitor(
        CoordinatorConfig {
            max_concurrent: 3,
            lock_dir: temp.path().join("locks"),
            ..Default::default()
        },
        monitor,
    )
    .expect("start manager");

    thread::sleep(Duration::from_millis(50));
    let started = Instant::now();
    manager.shutdown();
    manager.shutdown();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(manager.queue().is_shutdown());
    assert!(manager.queue().dequeue().is_none());
}

#[test]
fn journal_sink_records_lifecycle() {
    let temp = TempDir::new().expect("create temp dir");
    let (_, manager) = start(&temp, 1, 8192);
    let journal_path = temp.path().join("journal").join("op.jsonl");
    let sink = Arc::new(JournalSink::create("journaled", &journal_path).expect("create journal"));

    assert!(manager.submit_operation(SubmitRequest::new(
        "journaled",
        OperationType::Backup,
        runnable(|| Ok(())),
        sink,
    )));
    assert!(manager.wait_until_idle(Some(PATIENCE)));

    let events = JournalSink::read(&journal_path).expect("read journal");
    let stages: Vec<_> = events
        .iter()
        .filter_map(|e| match &e.kind {
            SinkEventKind::Step { step, status, .. } => Some((step.clone(), *status)),
            _ => None,
        })
        .collect();
    assert_eq!(
        stages,
        vec![
            ("queued".to_string(), StepStatus::Completed),
            ("execution".to_string(), StepStatus::Started),
            ("execution".to_string(), StepStatus::Completed),
        ]
    );
    assert!(events.iter().all(|e| e.operation_id == "journaled"));
}
