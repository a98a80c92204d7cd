//! Integration tests for materialization: sync, fetch, sync_all and eager mode.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tarn_core::{DType, Device, Engine, EngineConfig, TarnError, Tensor};

fn engine() -> Engine {
    Engine::new(EngineConfig::default()).expect("engine")
}

// ============================================================================
// Construction
// ============================================================================

#[test]
fn test_array_roundtrip_integers() {
    let e = engine();
    let values: Vec<i64> = (0..37).map(|i| i * 3 - 50).collect();
    let t = e.array(values.clone()).unwrap();
    assert_eq!(t.shape().dims(), &[37]);
    assert_eq!(t.dtype(), DType::I64);
    assert_eq!(t.to_vec::<i64>().unwrap(), values);

    let nested = e.array(vec![vec![1i32, 2], vec![3, 4], vec![5, 6]]).unwrap();
    assert_eq!(nested.shape().dims(), &[3, 2]);
    assert_eq!(nested.to_vec::<i32>().unwrap(), vec![1, 2, 3, 4, 5, 6]);
}

#[test]
fn test_empty_and_ragged_arrays_rejected() {
    let e = engine();
    assert!(matches!(e.array(Vec::<f32>::new()), Err(TarnError::InvalidShape(_))));
    assert!(matches!(
        e.array(vec![vec![1.0f32], vec![2.0, 3.0]]),
        Err(TarnError::RaggedArray(_))
    ));
}

#[test]
fn test_constructors() {
    let e = engine();
    assert_eq!(e.zeros([2, 2], DType::I32).unwrap().to_vec::<i32>().unwrap(), vec![0; 4]);
    assert_eq!(e.ones([3], DType::F64).unwrap().to_vec::<f64>().unwrap(), vec![1.0; 3]);
    assert_eq!(e.full([2], 2.5, DType::F32).unwrap().to_vec::<f32>().unwrap(), vec![2.5; 2]);
    let s = e.scalar(4.0, DType::I64).unwrap();
    assert!(s.shape().is_scalar());
    assert_eq!(s.item::<i64>().unwrap(), 4);
}

// ============================================================================
// Laziness and sync
// ============================================================================

#[test]
fn test_nothing_runs_until_sync() {
    let e = engine();
    let x = e.array(vec![1.0f32, 2.0, 3.0]).unwrap();
    let y = x.mul(&x).unwrap().add_scalar(1.0).unwrap();
    assert!(!y.is_materialized());
    assert_eq!(e.stats().kernels_run, 0);

    y.sync().unwrap();
    assert!(y.is_materialized());
    // mul, the scalar fill and add
    assert_eq!(e.stats().kernels_run, 3);

    // a second sync is free
    y.sync().unwrap();
    assert_eq!(e.stats().kernels_run, 3);
    assert_eq!(y.to_vec::<f32>().unwrap(), vec![2.0, 5.0, 10.0]);
}

#[test]
fn test_shared_subgraph_runs_once() {
    let e = engine();
    let x = e.array(vec![1i32, 2]).unwrap();
    let shared = x.add(&x).unwrap();
    let a = shared.mul(&x).unwrap();
    let b = shared.sub(&x).unwrap();
    a.sync().unwrap();
    b.sync().unwrap();
    assert_eq!(e.stats().kernels_run, 3);
    assert_eq!(b.to_vec::<i32>().unwrap(), vec![1, 2]);
}

#[test]
fn test_failure_propagates_to_dependents() {
    let e = engine();
    let x = e.array(vec![1i32, 2]).unwrap();
    let zero = e.array(vec![0i32, 1]).unwrap();
    let bad = x.div(&zero).unwrap();
    let downstream = bad.add(&x).unwrap().sum().unwrap();
    let err = downstream.sync().unwrap_err();
    assert!(matches!(err, TarnError::KernelExecution { ref kernel, .. } if kernel == "div"));
    assert_eq!(bad.sync().unwrap_err(), err);
}

#[test]
fn test_mixed_device_graph() {
    let e = engine();
    let host = e.array(vec![1.0f64, 2.0, 3.0]).unwrap();
    let on_accel = {
        let scope = e.scope(Device::Accel(0)).unwrap();
        let a = scope.array(vec![10.0f64, 20.0, 30.0]).unwrap();
        a.add(&host).unwrap()
    };
    assert_eq!(on_accel.device(), Device::Accel(0));
    // host consumer of an accelerator result
    let back = host.mul(&on_accel).unwrap();
    assert_eq!(back.device(), Device::Cpu);
    assert_eq!(back.to_vec::<f64>().unwrap(), vec![11.0, 44.0, 99.0]);
}

// ============================================================================
// fetch
// ============================================================================

#[test]
fn test_fetch_delivers_result() {
    let e = engine();
    let x = e.array(vec![1.0f32, 2.0]).unwrap();
    let y = x.mul_scalar(3.0).unwrap();
    let (tx, rx) = mpsc::channel();
    y.fetch(move |result| {
        tx.send(result.map(|b| b.to_vec::<f32>())).unwrap();
    })
    .unwrap();
    let values = rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap();
    assert_eq!(values, vec![3.0, 6.0]);
}

#[test]
fn test_fetch_callbacks_in_submission_order() {
    let e = engine();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let scope = e.scope(Device::Accel(0)).unwrap();
    let mut tensors = Vec::new();
    for i in 0..8 {
        let t = scope.full([64], i as f64, DType::F32).unwrap().exp().unwrap();
        tensors.push(t);
    }
    // fetch in reverse creation order
    for (i, t) in tensors.iter().enumerate().rev() {
        let seen = Arc::clone(&seen);
        t.fetch(move |r| {
            assert!(r.is_ok());
            seen.lock().push(i);
        })
        .unwrap();
    }
    e.sync_all(true).unwrap();
    assert_eq!(*seen.lock(), (0..8).rev().collect::<Vec<_>>());
}

#[test]
fn test_fetch_reports_errors() {
    let e = engine();
    let bad = e
        .code([1], DType::F32, &[], tarn_core::KernelSource::new("broken", "@out(0) = ;"))
        .unwrap();
    let (tx, rx) = mpsc::channel();
    bad.fetch(move |r| tx.send(r.map(|_| ())).unwrap()).unwrap();
    let err = rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap_err();
    assert!(matches!(err, TarnError::KernelCompilation { ref kernel, .. } if kernel == "broken"));
}

#[tokio::test]
async fn test_materialize_async() {
    let e = engine();
    let scope = e.scope(Device::Accel(0)).unwrap();
    let x = scope.array(vec![2.0f64, 3.0]).unwrap();
    let y = x.mul(&x).unwrap();
    drop(scope);
    let buffer = y.materialize().await.unwrap();
    assert_eq!(buffer.to_vec::<f64>(), vec![4.0, 9.0]);
}

// ============================================================================
// sync_all and eager mode
// ============================================================================

#[test]
fn test_sync_all_materializes_pending() {
    let e = engine();
    let x = e.array(vec![1i64, 2, 3]).unwrap();
    let pending: Vec<Tensor> = (0..4).map(|i| x.add_scalar(i as f64).unwrap()).collect();
    assert!(pending.iter().all(|t| !t.is_materialized()));
    e.sync_all(false).unwrap();
    assert!(pending.iter().all(Tensor::is_materialized));
    assert_eq!(pending[3].to_vec::<i64>().unwrap(), vec![4, 5, 6]);
}

#[test]
fn test_sync_all_returns_first_error() {
    let e = engine();
    let x = e.array(vec![1i32]).unwrap();
    let _bad = x.div(&e.array(vec![0i32]).unwrap()).unwrap();
    let good = x.add(&x).unwrap();
    assert!(matches!(e.sync_all(false), Err(TarnError::KernelExecution { .. })));
    assert!(good.is_materialized());
}

#[test]
fn test_sync_all_device_drains_fetches() {
    let e = Engine::new(EngineConfig {
        link_latency_us: 500,
        ..Default::default()
    })
    .unwrap();
    let scope = e.scope(Device::Accel(0)).unwrap();
    let done = Arc::new(Mutex::new(0usize));
    for _ in 0..5 {
        let t = scope.array(vec![1.0f32; 256]).unwrap().mul_scalar(2.0).unwrap();
        let done = Arc::clone(&done);
        t.fetch(move |r| {
            r.unwrap();
            *done.lock() += 1;
        })
        .unwrap();
    }
    e.sync_all(true).unwrap();
    assert_eq!(*done.lock(), 5);
}

#[test]
fn test_eager_mode_materializes_on_creation() {
    let e = Engine::new(EngineConfig {
        eager: true,
        ..Default::default()
    })
    .unwrap();
    let x = e.array(vec![1.0f32, 2.0]).unwrap();
    let y = x.add(&x).unwrap();
    assert!(y.is_materialized());
    let err = e
        .array(vec![1i32])
        .unwrap()
        .div(&e.array(vec![0i32]).unwrap())
        .unwrap_err();
    assert!(matches!(err, TarnError::KernelExecution { .. }));
}

#[test]
fn test_engine_from_json_config() {
    let config = EngineConfig::from_json_str(r#"{"accelerators": 2, "default_device": {"accel": 1}}"#).unwrap();
    let e = Engine::new(config).unwrap();
    assert_eq!(e.accelerators(), 2);
    assert_eq!(e.current_device(), Device::Accel(1));
    assert_eq!(e.zeros([1], DType::F32).unwrap().device(), Device::Accel(1));

    let bad = EngineConfig {
        accelerators: 0,
        default_device: Device::Accel(0),
        ..Default::default()
    };
    assert!(matches!(Engine::new(bad), Err(TarnError::Config(_))));
}

// ============================================================================
// Graph lifetime
// ============================================================================

#[test]
fn test_long_chain_materializes_and_drops() {
    let e = Engine::new(EngineConfig {
        accelerators: 0,
        ..Default::default()
    })
    .unwrap();
    let mut w = e.array(vec![0.0f64]).unwrap();
    for _ in 0..200_000 {
        w = w.add_scalar(1.0).unwrap();
    }
    assert_eq!(w.to_vec::<f64>().unwrap(), vec![200_000.0]);
    drop(w);
    e.sync_all(false).unwrap();
}
