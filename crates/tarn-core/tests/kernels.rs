//! User kernels injected through `Engine::code` / `Scope::code`.

use tarn_core::{DType, Device, Engine, EngineConfig, KernelSource, TarnError};

const SQUARE_TWICE: &str = r#"
    for (int i = 0; i < in0_shape0; i++) {
        @out(i) = @in0(i) * @in0(i) * 2;
    }
"#;

fn engine() -> Engine {
    Engine::new(EngineConfig::default()).unwrap()
}

#[test]
fn test_custom_kernel_on_accelerator() {
    let e = engine();
    let scope = e.scope(Device::Accel(0)).unwrap();
    let x = scope.array(vec![1.0f32, 2.0, 3.0]).unwrap();
    let y = scope
        .code([3], DType::F32, &[&x], KernelSource::new("square_twice", SQUARE_TWICE))
        .unwrap();
    assert_eq!(y.device(), Device::Accel(0));
    assert_eq!(y.to_vec::<f32>().unwrap(), vec![2.0, 8.0, 18.0]);
}

#[test]
fn test_device_fragment_preferred_on_accelerator() {
    let e = engine();
    let source = KernelSource::new("which", "@out(0) = 1;").with_device("@out(0) = 2;");
    let host = e.code([1], DType::I32, &[], source.clone()).unwrap();
    assert_eq!(host.to_vec::<i32>().unwrap(), vec![1]);

    let scope = e.scope(Device::Accel(0)).unwrap();
    let dev = scope.code([1], DType::I32, &[], source).unwrap();
    assert_eq!(dev.to_vec::<i32>().unwrap(), vec![2]);
}

#[test]
fn test_kernel_with_two_inputs_and_shapes() {
    let e = engine();
    let a = e.array(vec![vec![1.0f64, 2.0, 3.0], vec![4.0, 5.0, 6.0]]).unwrap();
    let b = e.array(vec![10.0f64, 20.0, 30.0]).unwrap();
    let src = r#"
        for (index_t r = 0; r < @out_shape(0); r++)
            for (index_t c = 0; c < @out_shape(1); c++)
                @out(r, c) = @in0(r, c) + @in1(c) * (r == 0 ? 1.0 : -1.0);
    "#;
    let y = e.code([2, 3], DType::F64, &[&a, &b], KernelSource::new("signed_add", src)).unwrap();
    assert_eq!(y.to_vec::<f64>().unwrap(), vec![11.0, 22.0, 33.0, -6.0, -15.0, -24.0]);
}

#[test]
fn test_syntax_error_deferred_to_materialization() {
    let e = engine();
    let x = e.array(vec![1.0f32]).unwrap();
    let y = e
        .code([1], DType::F32, &[&x], KernelSource::new("bad", "@out(0) = @in0(0) +;\n"))
        .unwrap();
    match y.sync().unwrap_err() {
        TarnError::KernelCompilation { kernel, line, .. } => {
            assert_eq!(kernel, "bad");
            assert_eq!(line, 1);
        }
        other => panic!("expected compilation error, got {other:?}"),
    }
}

#[test]
fn test_out_of_bounds_access_fails() {
    let e = engine();
    let x = e.array(vec![1i32, 2]).unwrap();
    let y = e
        .code([2], DType::I32, &[&x], KernelSource::new("oob", "@out(0) = @in0(5);"))
        .unwrap();
    assert!(matches!(y.sync(), Err(TarnError::KernelExecution { .. })));
}

#[test]
fn test_invalid_construction() {
    let e = engine();
    let empty = KernelSource {
        name: "none".into(),
        host: None,
        device: None,
    };
    assert!(matches!(e.code([1], DType::F32, &[], empty), Err(TarnError::InvalidKernel(_))));
    let ok = KernelSource::new("ok", "@out(0) = 0;");
    assert!(matches!(e.code([2, 0], DType::F32, &[], ok), Err(TarnError::InvalidShape(_))));
}
