//! Integration tests for the capture state machine and recorded graphs.

use std::sync::Arc;

use taskstream_core::prelude::*;
use taskstream_sim::SimDriver;

fn harness() -> (Arc<SimDriver>, Arc<Runtime>, Context) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let driver = Arc::new(SimDriver::new());
    let runtime = Runtime::builder()
        .driver(Arc::clone(&driver) as Arc<dyn Driver>)
        .clock(Arc::new(VirtualClock::new()))
        .config(RuntimeConfig::for_testing())
        .build()
        .expect("Failed to build runtime");
    let ctx = runtime.create_context().expect("Failed to create context");
    (driver, runtime, ctx)
}

#[test]
fn test_capture_round_trip_single_stream() {
    let (driver, _runtime, ctx) = harness();
    let stream = ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");
    let module = ctx.register_kernel(vec![1, 2, 3]);

    let model = ctx
        .begin_capture(stream, CaptureMode::Relaxed)
        .expect("Failed to begin capture");

    ctx.launch_kernel(stream, module, 0, 32, &[1]).expect("launch A failed");
    ctx.launch_kernel(stream, module, 1, 32, &[2]).expect("launch B failed");

    // Recorded, not dispatched.
    assert_eq!(driver.submitted_with_tag(TaskTag::KernelLaunch), 0);

    let finished = ctx.end_capture(stream).expect("Failed to end capture");
    assert_eq!(finished, model);

    let info = ctx.model_info(model).expect("model info failed");
    assert_eq!(info.state, CaptureState::Finished);
    assert_eq!(info.recorded_tasks, 2);

    ctx.with_model_graph(model, |graph| {
        assert!(graph.is_finalized());
        let tilings: Vec<u32> = graph
            .nodes()
            .iter()
            .map(|n| match n.payload {
                TaskPayload::KernelLaunch { tiling_key, .. } => tiling_key,
                _ => panic!("unexpected payload in graph"),
            })
            .collect();
        assert_eq!(tilings, vec![0, 1], "submission order preserved");
    })
    .expect("graph access failed");

    let info = ctx.capture_info(stream).expect("capture info failed");
    assert_eq!(info.status, CaptureStatus::None);
}

#[test]
fn test_begin_capture_on_active_stream_conflicts() {
    let (_driver, _runtime, ctx) = harness();
    let stream = ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");

    ctx.begin_capture(stream, CaptureMode::Global)
        .expect("Failed to begin capture");
    for mode in [CaptureMode::Global, CaptureMode::ThreadLocal, CaptureMode::Relaxed] {
        let err = ctx.begin_capture(stream, mode).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateConflict);
    }
}

#[test]
fn test_global_capture_excludes_other_captures() {
    let (_driver, _runtime, ctx) = harness();
    let a = ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");
    let b = ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");

    ctx.begin_capture(a, CaptureMode::Global)
        .expect("Failed to begin capture");
    let err = ctx.begin_capture(b, CaptureMode::Relaxed).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StateConflict);

    ctx.end_capture(a).expect("Failed to end capture");
    ctx.begin_capture(b, CaptureMode::Relaxed)
        .expect("capture after end should succeed");
}

#[test]
fn test_end_capture_without_capture() {
    let (_driver, _runtime, ctx) = harness();
    let stream = ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");

    let err = ctx.end_capture(stream).unwrap_err();
    assert!(matches!(err, RuntimeError::StreamNotCaptured(_)));
}

#[test]
fn test_end_capture_from_joined_stream_unmatched() {
    let (_driver, _runtime, ctx) = harness();
    let a = ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");
    let b = ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");

    ctx.begin_capture(a, CaptureMode::Relaxed)
        .expect("Failed to begin capture");
    let notify = ctx.create_notify();
    ctx.notify_record(a, notify).expect("record failed");
    ctx.notify_wait(b, notify).expect("wait failed");

    // B is now a member, but only A may end the capture.
    let err = ctx.end_capture(b).unwrap_err();
    assert!(matches!(err, RuntimeError::CaptureUnmatched(_)));

    // The failed end destroyed the model; both streams are released.
    assert_eq!(
        ctx.capture_info(a).expect("info failed").status,
        CaptureStatus::None
    );
    assert_eq!(
        ctx.capture_info(b).expect("info failed").status,
        CaptureStatus::None
    );
}

#[test]
fn test_capture_join_and_join_back_round_trip() {
    let (driver, _runtime, ctx) = harness();
    let a = ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");
    let b = ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");

    let model = ctx
        .begin_capture(a, CaptureMode::Relaxed)
        .expect("Failed to begin capture");

    // Fan out: B is ordered after A via a notify edge, joining the capture.
    let fork = ctx.create_notify();
    ctx.notify_record(a, fork).expect("record failed");
    ctx.notify_wait(b, fork).expect("wait failed");
    ctx.memset(b, 0x2000, 0, 64).expect("memset on B failed");
    assert!(driver.submitted_with_tag(TaskTag::Memset) == 0, "recorded, not submitted");

    // Fan in: A waits on B's notify, joining B back.
    let join = ctx.create_notify();
    ctx.notify_record(b, join).expect("record failed");
    ctx.notify_wait(a, join).expect("wait failed");

    ctx.end_capture(a).expect("Failed to end capture");

    let info = ctx.model_info(model).expect("model info failed");
    assert_eq!(info.state, CaptureState::Finished);
    assert_eq!(info.member_streams, 2);
    // 5 recorded tasks plus B's completion notify.
    assert_eq!(info.recorded_tasks, 6);

    ctx.with_model_graph(model, |graph| {
        // The notify edges appear alongside the per-stream chains.
        assert!(graph.edges().len() >= 4);
    })
    .expect("graph access failed");
}

#[test]
fn test_end_capture_fails_without_join_back() {
    let (_driver, _runtime, ctx) = harness();
    let a = ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");
    let b = ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");

    ctx.begin_capture(a, CaptureMode::Relaxed)
        .expect("Failed to begin capture");
    let fork = ctx.create_notify();
    ctx.notify_record(a, fork).expect("record failed");
    ctx.notify_wait(b, fork).expect("wait failed");
    ctx.memset(b, 0x2000, 0, 64).expect("memset on B failed");

    // B never synchronized back into A.
    let err = ctx.end_capture(a).unwrap_err();
    assert!(matches!(err, RuntimeError::StreamUnjoined(s) if s == b));
    assert_eq!(err.kind(), ErrorKind::StateConflict);

    // Model destroyed, streams reset.
    assert_eq!(
        ctx.capture_info(b).expect("info failed").status,
        CaptureStatus::None
    );
    assert_eq!(ctx.stats().live_models, 0);
}

#[test]
fn test_explicitly_added_stream_needs_no_join_back() {
    let (_driver, _runtime, ctx) = harness();
    let a = ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");
    let b = ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");

    let model = ctx
        .begin_capture(a, CaptureMode::Relaxed)
        .expect("Failed to begin capture");
    ctx.model_add_stream(model, b).expect("add stream failed");
    ctx.memset(b, 0x2000, 0, 64).expect("memset on B failed");

    ctx.end_capture(a).expect("Failed to end capture");
    assert_eq!(
        ctx.model_info(model).expect("info failed").state,
        CaptureState::Finished
    );
}

#[test]
fn test_capture_streams_return_to_free_set() {
    let (_driver, _runtime, ctx) = harness();
    let a = ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");

    assert!(ctx.free_stream_ids().contains(&a));
    ctx.begin_capture(a, CaptureMode::Relaxed)
        .expect("Failed to begin capture");
    assert!(!ctx.free_stream_ids().contains(&a), "bound stream leaves free set");

    ctx.end_capture(a).expect("Failed to end capture");
    assert!(ctx.free_stream_ids().contains(&a), "released stream rejoins free set");
}

#[test]
fn test_synchronize_rejected_while_capturing() {
    let (_driver, _runtime, ctx) = harness();
    let stream = ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");

    ctx.begin_capture(stream, CaptureMode::Relaxed)
        .expect("Failed to begin capture");
    let err = ctx
        .stream_synchronize(stream, std::time::Duration::from_millis(10))
        .unwrap_err();
    assert!(matches!(err, RuntimeError::StreamCaptured(_)));
}

#[test]
fn test_destroy_model_releases_streams() {
    let (_driver, _runtime, ctx) = harness();
    let stream = ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");

    let model = ctx
        .begin_capture(stream, CaptureMode::Global)
        .expect("Failed to begin capture");
    ctx.memset(stream, 0x2000, 0, 64).expect("memset failed");

    ctx.destroy_model(model).expect("destroy failed");
    assert_eq!(
        ctx.capture_info(stream).expect("info failed").status,
        CaptureStatus::None
    );
    assert_eq!(ctx.stats().live_models, 0);

    // A fresh capture can begin immediately.
    ctx.begin_capture(stream, CaptureMode::Global)
        .expect("Failed to begin capture after destroy");
}

#[test]
fn test_device_fault_invalidates_live_capture() {
    let driver = Arc::new(SimDriver::manual());
    let runtime = Runtime::builder()
        .driver(Arc::clone(&driver) as Arc<dyn Driver>)
        .clock(Arc::new(VirtualClock::new()))
        .config(RuntimeConfig::for_testing())
        .build()
        .expect("Failed to build runtime");
    let ctx = runtime.create_context().expect("Failed to create context");
    let worker = ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");
    let captured = ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");

    ctx.begin_capture(captured, CaptureMode::Relaxed)
        .expect("Failed to begin capture");
    ctx.memset(captured, 0x2000, 0, 64).expect("memset failed");

    // A fault surfaces while synchronizing an unrelated stream.
    ctx.memset(worker, 0x3000, 0, 64).expect("memset failed");
    driver.set_device_status(DeviceStatus::Fault);
    let err = ctx
        .stream_synchronize(worker, std::time::Duration::from_millis(10))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceFault);

    // The capture is invalidated and further submissions fail fast.
    let err = ctx.memset(captured, 0x2000, 0, 64).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceFault);

    // Clearing the fault exposes the invalidated capture status.
    ctx.clear_fault();
    let err = ctx.memset(captured, 0x2000, 0, 64).unwrap_err();
    assert!(matches!(err, RuntimeError::CaptureInvalidated));

    // Ending the invalidated capture reports it and resets the stream.
    let err = ctx.end_capture(captured).unwrap_err();
    assert!(matches!(err, RuntimeError::CaptureInvalidated));
    assert_eq!(
        ctx.capture_info(captured).expect("info failed").status,
        CaptureStatus::None
    );
}

#[test]
fn test_thread_capture_mode_exchange() {
    let (_driver, _runtime, ctx) = harness();
    assert_eq!(
        ctx.exchange_thread_capture_mode(CaptureMode::Relaxed),
        CaptureMode::Global
    );
    assert_eq!(
        ctx.exchange_thread_capture_mode(CaptureMode::Global),
        CaptureMode::Relaxed
    );
}
