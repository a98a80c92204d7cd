//! Host views, writes through views and rebinding.

use tarn_core::{DType, Device, Engine, EngineConfig, TarnError};

fn engine() -> Engine {
    Engine::new(EngineConfig::default()).unwrap()
}

#[test]
fn test_host_write_visible_to_later_reads() {
    let e = engine();
    let x = e.array(vec![vec![1.0f32, 2.0], vec![3.0, 4.0]]).unwrap();
    let view = x.data().unwrap();
    assert_eq!(view.get::<f32>(&[1, 0]).unwrap(), 3.0);
    view.set(&[1, 0], 30.0f32).unwrap();
    drop(view);
    assert_eq!(x.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 30.0, 4.0]);
    // consumers created afterwards see the write
    assert_eq!(x.sum().unwrap().item::<f32>().unwrap(), 37.0);
}

#[test]
fn test_host_write_invalidates_device_copy() {
    let e = engine();
    let scope = e.scope(Device::Accel(0)).unwrap();
    let x = scope.array(vec![1i64, 2, 3]).unwrap();
    // uploads x
    assert_eq!(x.mul(&x).unwrap().to_vec::<i64>().unwrap(), vec![1, 4, 9]);
    assert_eq!(x.sync().unwrap().device_mirror(), Some(0));

    x.data().unwrap().update(|v: &mut [i64]| v[2] = 10).unwrap();
    assert_eq!(x.sync().unwrap().device_mirror(), None);
    assert_eq!(x.mul(&x).unwrap().to_vec::<i64>().unwrap(), vec![1, 4, 100]);
}

#[test]
fn test_view_errors() {
    let e = engine();
    let x = e.array(vec![1.0f64, 2.0]).unwrap();
    let view = x.data().unwrap();
    assert!(view.get::<f64>(&[2]).is_err());
    assert!(matches!(view.get::<f64>(&[0, 0]), Err(TarnError::ShapeMismatch { .. })));
    assert!(matches!(
        view.update(|v: &mut [f32]| v[0] = 1.0),
        Err(TarnError::DTypeMismatch { .. })
    ));
}

#[test]
fn test_set_data_from_values() {
    let e = engine();
    let mut x = e.array(vec![1.0f32, 2.0, 3.0]).unwrap();
    let old = x.clone();
    x.set_data(vec![4i32, 5, 6]).unwrap();
    assert_eq!(x.dtype(), DType::F32);
    assert_eq!(x.to_vec::<f32>().unwrap(), vec![4.0, 5.0, 6.0]);
    // other handles keep the old node
    assert_eq!(old.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0]);
    assert!(matches!(x.set_data(vec![1.0f32]), Err(TarnError::ShapeMismatch { .. })));
}

#[test]
fn test_assign_from_tensor() {
    let e = engine();
    let mut x = e.zeros([2, 2], DType::F64).unwrap();
    let src = e.array(vec![vec![1.0f64, 2.0], vec![3.0, 4.0]]).unwrap().mul_scalar(2.0).unwrap();
    x.assign(&src).unwrap();
    assert!(x.op() == &tarn_core::Op::Leaf);
    assert_eq!(x.to_vec::<f64>().unwrap(), vec![2.0, 4.0, 6.0, 8.0]);
    let wrong = e.zeros([4], DType::F64).unwrap();
    assert!(matches!(x.assign(&wrong), Err(TarnError::ShapeMismatch { .. })));
}

#[test]
fn test_view_outlives_tensor() {
    let e = engine();
    let view = {
        let x = e.array(vec![7i32, 8]).unwrap().add_scalar(1.0).unwrap();
        x.data().unwrap()
    };
    assert_eq!(view.to_vec::<i32>(), vec![8, 9]);
    assert_eq!(view.shape().dims(), &[2]);
}
