//! Context lifecycle against real dispatch traffic
//!
//! The context is process-wide state, so every test in this binary runs
//! serially and leaves no context active when it finishes.

use despachar::{
    kernels, launch, Context, ContextConfig, DespacharError, Geometry, LaunchArg, QueueConfig,
};
use serial_test::serial;

#[test]
#[serial]
fn test_explicit_initialize_with_custom_queue() {
    let context = Context::initialize(&ContextConfig {
        queue: QueueConfig { capacity: 16 },
    })
    .expect("initialize");
    assert_eq!(context.agent().id(), 0);

    let mut out = vec![0.0f32; 8];
    launch(
        &kernels::fill_f32(),
        Geometry::linear(8),
        &mut [LaunchArg::OutF32(&mut out), LaunchArg::F32(4.0), LaunchArg::U32(8)],
    )
    .expect("launch on explicit context");
    assert!(out.iter().all(|&v| v == 4.0));

    let stats = context.queue_stats();
    assert_eq!(stats.submitted, 1);
    assert_eq!(stats.completed, 1);
    context.release().expect("release");
}

#[test]
#[serial]
fn test_release_refused_until_buffers_unregistered() {
    let context = Context::acquire().expect("acquire");
    let data = vec![1.0f32; 32];
    let pointers = context
        .registrar()
        .register_all(&[LaunchArg::InF32(&data)])
        .expect("register");

    let err = context.clone().release().expect_err("busy context");
    assert!(matches!(
        err,
        DespacharError::ContextBusy {
            registrations: 1,
            ..
        }
    ));

    context
        .registrar()
        .unregister_all(&pointers)
        .expect("unregister");
    context.release().expect("release once idle");
}

#[test]
#[serial]
fn test_launch_after_release_reinitializes() {
    let context = Context::acquire().expect("acquire");
    context.release().expect("release");

    // the facade transparently brings up a fresh default context
    let mut out = vec![0i32; 4];
    let src = vec![9i32; 4];
    launch(
        &kernels::copy_i32(),
        Geometry::linear(4),
        &mut [
            LaunchArg::InI32(&src),
            LaunchArg::OutI32(&mut out),
            LaunchArg::U32(4),
        ],
    )
    .expect("launch after release");
    assert_eq!(out, src);

    Context::acquire()
        .expect("reacquire")
        .release()
        .expect("final release");
}

#[test]
#[serial]
fn test_queue_stats_reset_across_contexts() {
    let context = Context::acquire().expect("acquire");
    let mut out = vec![0.0f32; 4];
    launch(
        &kernels::fill_f32(),
        Geometry::linear(4),
        &mut [LaunchArg::OutF32(&mut out), LaunchArg::F32(1.0), LaunchArg::U32(4)],
    )
    .expect("launch");
    assert!(context.queue_stats().submitted >= 1);
    context.release().expect("release");

    let fresh = Context::acquire().expect("fresh context");
    assert_eq!(fresh.queue_stats().submitted, 0, "new queue, new counters");
    fresh.release().expect("release");
}
