//! Integration tests for context, stream, and pool lifecycles against the
//! simulated driver.

use std::sync::Arc;

use taskstream_core::prelude::*;
use taskstream_sim::SimDriver;

fn runtime_with(driver: Arc<SimDriver>) -> Arc<Runtime> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Runtime::builder()
        .driver(driver)
        .clock(Arc::new(VirtualClock::new()))
        .config(RuntimeConfig::for_testing())
        .build()
        .expect("Failed to build runtime")
}

#[test]
fn test_context_creation_has_default_stream() {
    let driver = Arc::new(SimDriver::new());
    let runtime = runtime_with(Arc::clone(&driver));
    let ctx = runtime.create_context().expect("Failed to create context");

    assert_eq!(ctx.stats().streams, 1);
    assert!(ctx.free_stream_ids().contains(&ctx.default_stream()));
}

#[test]
fn test_stream_create_destroy() {
    let driver = Arc::new(SimDriver::new());
    let runtime = runtime_with(Arc::clone(&driver));
    let ctx = runtime.create_context().expect("Failed to create context");

    let stream = ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");
    assert_eq!(ctx.stats().streams, 2);

    ctx.destroy_stream(stream).expect("Failed to destroy stream");
    assert_eq!(ctx.stats().streams, 1);

    let err = ctx.destroy_stream(stream).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_default_stream_cannot_be_destroyed() {
    let driver = Arc::new(SimDriver::new());
    let runtime = runtime_with(driver);
    let ctx = runtime.create_context().expect("Failed to create context");

    let err = ctx.destroy_stream(ctx.default_stream()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_submission_reaches_driver() {
    let driver = Arc::new(SimDriver::new());
    let runtime = runtime_with(Arc::clone(&driver));
    let ctx = runtime.create_context().expect("Failed to create context");
    let stream = ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");

    let ticket = ctx
        .memset(stream, 0x2000, 0, 256)
        .expect("Failed to submit memset");
    assert_eq!(ticket.stream, stream);
    assert_eq!(ticket.seq, 1);
    assert_eq!(driver.submitted_with_tag(TaskTag::Memset), 1);

    ctx.memcpy(stream, 0x3000, 0x2000, 256, CopyKind::Linear)
        .expect("Failed to submit memcpy");
    assert_eq!(driver.submitted_with_tag(TaskTag::Memcpy), 1);
    assert_eq!(ctx.last_submission().expect("no submission").seq, 2);
}

#[test]
fn test_kernel_launch_loads_module_lazily() {
    let driver = Arc::new(SimDriver::new());
    let runtime = runtime_with(Arc::clone(&driver));
    let ctx = runtime.create_context().expect("Failed to create context");
    let stream = ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");

    let module = ctx.register_kernel(vec![0xde, 0xad, 0xbe, 0xef]);
    assert_eq!(driver.loaded_kernels(), 0);

    ctx.launch_kernel(stream, module, 7, 64, &[1, 2, 3, 4])
        .expect("Failed to launch kernel");
    assert_eq!(driver.loaded_kernels(), 1);

    // Second launch reuses the loaded module.
    ctx.launch_kernel(stream, module, 7, 64, &[1, 2, 3, 4])
        .expect("Failed to launch kernel");
    assert_eq!(driver.loaded_kernels(), 1);
}

#[test]
fn test_oversized_args_staged_through_scratch() {
    let driver = Arc::new(SimDriver::new());
    let runtime = runtime_with(Arc::clone(&driver));
    let ctx = runtime.create_context().expect("Failed to create context");
    let stream = ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");

    // for_testing() keeps 64 bytes inline; 256 must be staged.
    let args = vec![0u8; 256];
    ctx.launch_kernel_ptr(stream, 0x4000, 32, &args)
        .expect("Failed to launch kernel");
    assert_eq!(driver.bytes_copied(), 256);
}

#[test]
fn test_scratch_exhaustion_is_resource_error() {
    let driver = Arc::new(SimDriver::new());
    let runtime = runtime_with(driver);
    let ctx = runtime.create_context().expect("Failed to create context");
    let stream = ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");

    // for_testing() scratch is 4096 bytes.
    let args = vec![0u8; 8192];
    let err = ctx.launch_kernel_ptr(stream, 0x4000, 32, &args).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
}

#[test]
fn test_failed_submission_recycles_task() {
    let driver = Arc::new(SimDriver::new());
    let runtime = runtime_with(Arc::clone(&driver));
    let ctx = runtime.create_context().expect("Failed to create context");
    let stream = ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");

    let before = ctx.stream_stats(stream).expect("no stats").pool.free_slots;

    driver.set_submit_error(Some("queue entry rejected"));
    let err = ctx.memset(stream, 0x2000, 0, 64).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceFault);

    let after = ctx.stream_stats(stream).expect("no stats").pool.free_slots;
    assert_eq!(before, after, "failed submission must not leak a descriptor");
}

#[test]
fn test_task_pool_exhaustion_surfaces() {
    let driver = Arc::new(SimDriver::manual());
    let runtime = runtime_with(driver);
    let ctx = runtime.create_context().expect("Failed to create context");
    let stream = ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");

    // for_testing(): 16 primary + 4 overflow slots.
    for _ in 0..20 {
        ctx.memset(stream, 0x2000, 0, 64).expect("Failed to submit");
    }
    let err = ctx.memset(stream, 0x2000, 0, 64).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
}

#[test]
fn test_module_release_and_pool_sweep() {
    let driver = Arc::new(SimDriver::new());
    let runtime = runtime_with(Arc::clone(&driver));
    let ctx = runtime.create_context().expect("Failed to create context");
    let stream = ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");

    // for_testing(): 4 slots per pool, isolation width 1. Fill three pools
    // so the sweep has reclaimable pools behind the window.
    let modules: Vec<ModuleId> = (0..12).map(|i| ctx.register_kernel(vec![i as u8 + 1])).collect();
    for module in &modules {
        ctx.launch_kernel(stream, *module, 0, 16, &[]).expect("launch failed");
    }
    assert_eq!(driver.loaded_kernels(), 12);

    // Release everything in the first two pools; the third stays referenced.
    for module in &modules[..8] {
        ctx.release_module(*module).expect("release failed");
    }

    let reclaimed = ctx.try_recycle_module_pools().expect("sweep failed");
    assert_eq!(reclaimed, 2);
    assert_eq!(driver.unloaded_kernels(), 8);
    assert_eq!(driver.loaded_kernels(), 4);
}

#[test]
fn test_sweep_never_frees_referenced_pool() {
    let driver = Arc::new(SimDriver::new());
    let runtime = runtime_with(Arc::clone(&driver));
    let ctx = runtime.create_context().expect("Failed to create context");
    let stream = ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");

    let modules: Vec<ModuleId> = (0..12).map(|i| ctx.register_kernel(vec![i as u8 + 1])).collect();
    for module in &modules {
        ctx.launch_kernel(stream, *module, 0, 16, &[]).expect("launch failed");
    }
    // Pool 0 keeps one referenced slot.
    for module in &modules[1..8] {
        ctx.release_module(*module).expect("release failed");
    }

    let reclaimed = ctx.try_recycle_module_pools().expect("sweep failed");
    assert_eq!(reclaimed, 1, "only the fully released pool may go");
    assert_eq!(driver.loaded_kernels(), 8);
}

#[test]
fn test_teardown_releases_driver_resources() {
    let driver = Arc::new(SimDriver::new());
    let runtime = runtime_with(Arc::clone(&driver));
    let ctx = runtime.create_context().expect("Failed to create context");
    let _stream = ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");

    assert_eq!(driver.live_allocations(), 1, "scratch buffer allocated");
    ctx.teardown().expect("teardown failed");
    assert_eq!(driver.live_allocations(), 0, "scratch buffer freed");

    // Teardown is idempotent, and Drop after teardown is a no-op.
    ctx.teardown().expect("second teardown failed");
    drop(ctx);
}

#[test]
fn test_notify_lifecycle() {
    let driver = Arc::new(SimDriver::new());
    let runtime = runtime_with(driver);
    let ctx = runtime.create_context().expect("Failed to create context");
    let stream = ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");

    let notify = ctx.create_notify();
    ctx.notify_record(stream, notify).expect("record failed");
    ctx.notify_wait(stream, notify).expect("wait failed");

    ctx.destroy_notify(notify).expect("destroy failed");
    let err = ctx.notify_record(stream, notify).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_control_task_family() {
    let driver = Arc::new(SimDriver::new());
    let runtime = runtime_with(Arc::clone(&driver));
    let ctx = runtime.create_context().expect("Failed to create context");
    let a = ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");
    let b = ctx
        .create_stream(StreamFlags::default())
        .expect("Failed to create stream");

    ctx.stream_switch(a, b).expect("switch failed");
    ctx.stream_set_active(a).expect("set-active failed");
    ctx.debug_register(a, 0x7000, 128).expect("debug register failed");
    ctx.debug_unregister(a, 0x7000).expect("debug unregister failed");
    assert_eq!(driver.submitted_with_tag(TaskTag::Control), 4);

    let err = ctx.stream_switch(a, StreamId::new(999)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
