//! Integration tests for synchronization deadlines and the abort path,
//! driven entirely on virtual time.

use std::sync::Arc;
use std::time::Duration;

use taskstream_core::prelude::*;
use taskstream_sim::SimDriver;

struct Harness {
    driver: Arc<SimDriver>,
    clock: Arc<VirtualClock>,
    ctx: Context,
    _runtime: Arc<Runtime>,
}

fn harness(driver: SimDriver) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let driver = Arc::new(driver);
    let clock = Arc::new(VirtualClock::new());
    let runtime = Runtime::builder()
        .driver(Arc::clone(&driver) as Arc<dyn Driver>)
        .clock(Arc::clone(&clock) as Arc<dyn Clock>)
        .config(RuntimeConfig::for_testing())
        .build()
        .expect("Failed to build runtime");
    let ctx = runtime.create_context().expect("Failed to create context");
    Harness {
        driver,
        clock,
        ctx,
        _runtime: runtime,
    }
}

#[test]
fn test_stream_synchronize_drains_completed_work() {
    let h = harness(SimDriver::new());
    let stream = h
        .ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");

    for _ in 0..4 {
        h.ctx.memset(stream, 0x2000, 0, 64).expect("submit failed");
    }
    h.ctx
        .stream_synchronize(stream, Duration::from_millis(100))
        .expect("synchronize failed");

    let stats = h.ctx.stream_stats(stream).expect("no stats");
    assert_eq!(stats.inflight, 0, "drained tasks are reclaimed");
    assert_eq!(stats.pool.outstanding, 0);
}

#[test]
fn test_synchronize_timeout_monotonicity() {
    let h = harness(SimDriver::manual());
    let stream = h
        .ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");

    // The queue never drains.
    h.ctx.memset(stream, 0x2000, 0, 64).expect("submit failed");

    for timeout_ms in [10u64, 50, 100] {
        let timeout = Duration::from_millis(timeout_ms);
        let before = h.clock.elapsed();
        let err = h.ctx.stream_synchronize(stream, timeout).unwrap_err();
        let elapsed = h.clock.elapsed() - before;

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(elapsed >= timeout, "returned before the deadline");
        // One poll granularity of slack.
        assert!(
            elapsed <= timeout + RuntimeConfig::for_testing().sync_poll_interval,
            "stalled past the deadline: {elapsed:?}"
        );
    }
}

#[test]
fn test_context_synchronize_timeout_on_stuck_stream() {
    let h = harness(SimDriver::manual());
    let stream = h
        .ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");
    h.ctx.memset(stream, 0x2000, 0, 64).expect("submit failed");

    let before = h.clock.elapsed();
    let err = h.ctx.synchronize(Duration::from_millis(100)).unwrap_err();
    let elapsed = h.clock.elapsed() - before;

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed <= Duration::from_millis(120));
}

#[test]
fn test_context_synchronize_remembers_first_error_but_continues() {
    let h = harness(SimDriver::new());
    let a = h
        .ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");
    let b = h
        .ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");

    // Both streams drain instantly; a capture on A makes its synchronize
    // fail with a state conflict, which must not stop B from draining.
    h.ctx.memset(b, 0x2000, 0, 64).expect("submit failed");
    h.ctx
        .begin_capture(a, CaptureMode::Relaxed)
        .expect("Failed to begin capture");
    h.ctx
        .exchange_thread_capture_mode(CaptureMode::Relaxed);

    let err = h.ctx.synchronize(Duration::from_millis(50)).unwrap_err();
    assert!(matches!(err, RuntimeError::StreamCaptured(s) if s == a));

    let stats = h.ctx.stream_stats(b).expect("no stats");
    assert_eq!(stats.inflight, 0, "other streams were still synchronized");
}

#[test]
fn test_context_synchronize_skips_do_not_sync_streams() {
    let h = harness(SimDriver::manual());
    let background = h
        .ctx
        .create_stream(StreamFlags {
            do_not_sync: true,
            ..StreamFlags::default()
        })
        .expect("Failed to create stream");

    // Work on the excluded stream never drains, yet synchronize succeeds.
    h.ctx.memset(background, 0x2000, 0, 64).expect("submit failed");
    h.ctx
        .synchronize(Duration::from_millis(20))
        .expect("synchronize should skip the excluded stream");
}

#[test]
fn test_device_abort_terminates_synchronize_immediately() {
    let h = harness(SimDriver::manual());
    let stream = h
        .ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");
    h.ctx.memset(stream, 0x2000, 0, 64).expect("submit failed");

    h.driver.set_device_status(DeviceStatus::Abort);
    let before = h.clock.elapsed();
    let err = h.ctx.synchronize(Duration::from_millis(100)).unwrap_err();
    assert!(matches!(err, RuntimeError::DeviceTaskAbort));
    assert!(h.clock.elapsed() - before < Duration::from_millis(5), "no deadline wait");
}

#[test]
fn test_fault_latch_short_circuits_submissions() {
    let h = harness(SimDriver::manual());
    let stream = h
        .ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");
    h.ctx.memset(stream, 0x2000, 0, 64).expect("submit failed");

    h.driver.set_device_status(DeviceStatus::Fault);
    let err = h
        .ctx
        .stream_synchronize(stream, Duration::from_millis(10))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceFault);
    assert!(h.ctx.latched_fault().is_some());

    // Submissions short-circuit with the latched fault until cleared.
    h.driver.set_device_status(DeviceStatus::Ok);
    let err = h.ctx.memset(stream, 0x2000, 0, 64).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceFault);

    h.ctx.clear_fault();
    h.ctx.memset(stream, 0x2000, 0, 64).expect("submit after clear failed");
}

#[test]
fn test_abort_recycles_outstanding_tasks() {
    let h = harness(SimDriver::manual());
    let stream = h
        .ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");

    for _ in 0..5 {
        h.ctx.memset(stream, 0x2000, 0, 64).expect("submit failed");
    }
    let before = h.ctx.stream_stats(stream).expect("no stats");
    assert_eq!(before.inflight, 5);

    h.ctx.stream_abort(stream).expect("abort failed");

    let after = h.ctx.stream_stats(stream).expect("no stats");
    assert_eq!(after.inflight, 0, "all five tasks recycled");
    assert_eq!(after.pool.outstanding, 0);
    assert_eq!(after.failure, None, "failure mode cleared on success");

    // The stream accepts work again after the restore.
    h.ctx.memset(stream, 0x2000, 0, 64).expect("submit after abort failed");
}

#[test]
fn test_abort_waits_for_terminate_ack() {
    let h = harness(SimDriver::manual());
    h.driver.set_kill_ack_polls(3);
    let stream = h
        .ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");
    h.ctx.memset(stream, 0x2000, 0, 64).expect("submit failed");

    let before = h.clock.elapsed();
    h.ctx.stream_abort(stream).expect("abort failed");
    let elapsed = h.clock.elapsed() - before;

    // Three unacknowledged polls, one sleep per poll.
    let poll = RuntimeConfig::for_testing().abort_poll_interval;
    assert!(elapsed >= poll * 3);
}

#[test]
fn test_abort_times_out_without_ack() {
    let h = harness(SimDriver::manual());
    // Never acknowledge the kill within the abort deadline.
    h.driver.set_kill_ack_polls(usize::MAX);
    let stream = h
        .ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");
    h.ctx.memset(stream, 0x2000, 0, 64).expect("submit failed");

    let err = h.ctx.stream_abort(stream).unwrap_err();
    assert!(matches!(err, RuntimeError::WaitTimeout(_)));
    assert_eq!(err.kind(), ErrorKind::Timeout);

    // The failure mode stays latched after a failed abort.
    let stats = h.ctx.stream_stats(stream).expect("no stats");
    assert_eq!(stats.failure, Some(FailureMode::Aborting));
}
