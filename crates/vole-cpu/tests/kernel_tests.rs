// Kernel Registry Tests — pooling, reduction, element-wise and conversion
// kernels driven through the same manager lifecycle the engine uses

use half::f16;

use vole_core::{
    Block, DType, DataFormat, DynOfflineManager, EdgeType, EngineContext, ExecArgs, HostTensor,
    PadFill, Shape, TensorMut, TensorRef, TuneOptions,
};
use vole_cpu::{convert_host, BackendProfile, KernelRegistry, KernelRequest};
use vole_ir::{OpKind, Pool2dAttrs, ReduceAttrs, ReduceKind};

// Helpers

const N4: EdgeType = EdgeType::new(DataFormat::N4cx, DType::F32);
const PLANAR: EdgeType = EdgeType::ndarray(DType::F32);

fn registry() -> KernelRegistry {
    KernelRegistry::new(BackendProfile::simd4_f32(), EngineContext::host(2).unwrap())
}

fn first_manager(reg: &KernelRegistry, req: &KernelRequest) -> Box<dyn DynOfflineManager> {
    let mut ms = reg.managers(req).unwrap();
    assert!(!ms.is_empty());
    let m = ms.remove(0);
    assert!(m.is_supported(), "{} rejected {:?}", m.algorithm(), req.op);
    m
}

/// Heuristic schedule, exact scratch, one execution.
fn run_node(reg: &KernelRegistry, op: OpKind, xs: &[&HostTensor], out: (Shape, EdgeType)) -> HostTensor {
    let req = KernelRequest {
        op,
        inputs: xs.iter().map(|x| (x.shape().clone(), x.ty())).collect(),
        outputs: vec![out.clone()],
    };
    let mut m = first_manager(reg, &req);
    m.fast_init_schedule_param().unwrap();
    let mut exec = m.gen_executor().unwrap();
    exec.set_shapes(xs.iter().map(|x| x.shape().clone()).collect(), vec![out.0.clone()]);
    exec.prepare().unwrap();
    let mut scratch = Block::detached(exec.cal_temp_buffer_size().unwrap());
    let mut y = HostTensor::zeros(out.0, out.1);
    exec.execute(ExecArgs {
        inputs: xs.iter().map(|x| TensorRef::new(x.bytes(), x.ty())).collect(),
        outputs: vec![TensorMut::new(y.bytes_mut(), out.1)],
        scratch: scratch.as_bytes_mut(),
        pool: reg.context().pool(),
    })
    .unwrap();
    y
}

fn to_blocked(x: &HostTensor, fill: PadFill, reg: &KernelRegistry) -> HostTensor {
    convert_host(x, N4, fill, reg.context().pool()).unwrap()
}

fn planar(x: &HostTensor, reg: &KernelRegistry) -> Vec<f32> {
    convert_host(x, PLANAR, PadFill::Zero, reg.context().pool())
        .unwrap()
        .to_vec::<f32>()
        .unwrap()
}

fn assert_close(got: &[f32], want: &[f32], tol: f32) {
    assert_eq!(got.len(), want.len(), "length mismatch");
    for (i, (g, w)) in got.iter().zip(want).enumerate() {
        assert!((g - w).abs() <= tol, "elem {i}: got {g}, want {w} (tol={tol})");
    }
}

fn ramp(shape: impl Into<Shape>) -> HostTensor {
    let shape = shape.into();
    let vals: Vec<f32> = (0..shape.elem_count())
        .map(|i| ((i * 37) % 23) as f32 - 11.0)
        .collect();
    HostTensor::from_vec(vals, shape).unwrap()
}

// Reduction

#[test]
fn test_channel_max_ignores_padded_lanes() {
    let reg = registry();
    let x = ramp((2, 6, 3, 3));
    // padded lanes hold the largest float; they must never win
    let xb = to_blocked(&x, PadFill::Highest, &reg);

    let attrs = ReduceAttrs::new(ReduceKind::Max, vec![1], false);
    let y_shape = Shape::from((2, 3, 3));
    let got = run_node(&reg, OpKind::Reduce(attrs.clone()), &[&xb], (y_shape.clone(), PLANAR));

    // same reduction over 8 planar channels, the two extra at lowest()
    let src = x.to_vec::<f32>().unwrap();
    let mut wide = Vec::with_capacity(2 * 8 * 9);
    for n in 0..2 {
        wide.extend_from_slice(&src[n * 54..(n + 1) * 54]);
        wide.extend(std::iter::repeat(f32::MIN).take(18));
    }
    let x8 = HostTensor::from_vec(wide, (2, 8, 3, 3)).unwrap();
    let want = run_node(&reg, OpKind::Reduce(attrs), &[&x8], (y_shape, PLANAR));

    assert_eq!(got.to_vec::<f32>().unwrap(), want.to_vec::<f32>().unwrap());
}

#[test]
fn test_spatial_mean_keeps_blocking() {
    let reg = registry();
    let x = ramp((1, 5, 2, 2));
    let xb = to_blocked(&x, PadFill::Highest, &reg);
    let attrs = ReduceAttrs::new(ReduceKind::Mean, vec![2, 3], true);
    let y_shape = Shape::from((1, 5, 1, 1));
    let y = run_node(&reg, OpKind::Reduce(attrs), &[&xb], (y_shape, N4));

    let src = x.to_vec::<f32>().unwrap();
    let want: Vec<f32> = (0..5)
        .map(|c| src[c * 4..c * 4 + 4].iter().sum::<f32>() / 4.0)
        .collect();
    assert_close(&planar(&y, &reg), &want, 1e-6);
    // two channel blocks, lanes 5..8 of the second are padding
    let raw = y.as_slice::<f32>().unwrap();
    assert_eq!(raw.len(), 8);
    assert_eq!(&raw[5..], &[0.0, 0.0, 0.0]);
}

#[test]
fn test_full_sum_over_all_axes() {
    let reg = registry();
    let x = HostTensor::from_vec((1..=24).map(|v| v as f32).collect::<Vec<_>>(), (2, 3, 4)).unwrap();
    let attrs = ReduceAttrs::new(ReduceKind::Sum, vec![], false);
    let y = run_node(&reg, OpKind::Reduce(attrs), &[&x], (Shape::from(()), PLANAR));
    assert_eq!(y.to_vec::<f32>().unwrap(), vec![300.0]);
}

// Pooling

#[test]
fn test_maxpool_blocked_matches_planar() {
    let reg = registry();
    let x = ramp((2, 6, 5, 5));
    let xb = to_blocked(&x, PadFill::Highest, &reg);
    let attrs = Pool2dAttrs::new([3, 3], [2, 2]).with_pad([1, 1]);
    let y_shape = attrs.output_shape(x.shape()).unwrap();

    let blocked = run_node(
        &reg,
        OpKind::MaxPool2d(attrs),
        &[&xb],
        (y_shape.clone(), N4),
    );
    let reference = {
        let planar_reg =
            KernelRegistry::new(BackendProfile::scalar(), EngineContext::host(1).unwrap());
        run_node(&planar_reg, OpKind::MaxPool2d(attrs), &[&x], (y_shape, PLANAR))
    };
    assert_eq!(planar(&blocked, &reg), reference.to_vec::<f32>().unwrap());
}

#[test]
fn test_maxpool_needs_native_type() {
    let reg = registry();
    let attrs = Pool2dAttrs::new([2, 2], [2, 2]);
    let req = KernelRequest {
        op: OpKind::MaxPool2d(attrs),
        inputs: vec![(Shape::from((1, 4, 4, 4)), PLANAR)],
        outputs: vec![(Shape::from((1, 4, 2, 2)), PLANAR)],
    };
    assert!(reg.managers(&req).unwrap_err().is_unsupported());
}

// Element-wise

#[test]
fn test_blocked_add_then_relu() {
    let reg = registry();
    let a = ramp((1, 6, 2, 3));
    let b = HostTensor::from_vec(vec![2.5f32; 36], (1, 6, 2, 3)).unwrap();
    let ab = to_blocked(&a, PadFill::Zero, &reg);
    let bb = to_blocked(&b, PadFill::Zero, &reg);
    let shape = a.shape().clone();

    let sum = run_node(&reg, OpKind::Add, &[&ab, &bb], (shape.clone(), N4));
    let y = run_node(&reg, OpKind::Relu, &[&sum], (shape, N4));

    let want: Vec<f32> = a
        .to_vec::<f32>()
        .unwrap()
        .iter()
        .map(|v| (v + 2.5).max(0.0))
        .collect();
    assert_eq!(planar(&y, &reg), want);
}

#[test]
fn test_planar_broadcast_mul() {
    let reg = registry();
    let a = HostTensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3)).unwrap();
    let b = HostTensor::from_vec(vec![10.0f32, 100.0], (2, 1)).unwrap();
    let y = run_node(&reg, OpKind::Mul, &[&a, &b], (Shape::from((2, 3)), PLANAR));
    assert_eq!(
        y.to_vec::<f32>().unwrap(),
        vec![10.0, 20.0, 30.0, 400.0, 500.0, 600.0]
    );
}

// Conversion

#[test]
fn test_converter_writes_consumer_identity() {
    let reg = registry();
    let x = ramp((1, 3, 2));
    let to = EdgeType::new(DataFormat::N8cx, DType::F16);
    let y = run_node(
        &reg,
        OpKind::Converter {
            fill: PadFill::Lowest,
        },
        &[&x],
        (x.shape().clone(), to),
    );
    let raw = y.as_slice::<f16>().unwrap();
    assert_eq!(raw.len(), 16);
    // spatial 0, lanes 3..8
    assert!(raw[3..8].iter().all(|&v| v == f16::MIN));
    assert_eq!(raw[0].to_f32(), x.to_vec::<f32>().unwrap()[0]);
}

// Tuning

#[test]
fn test_plain_manager_tunes_one_candidate() {
    let reg = registry();
    let req = KernelRequest {
        op: OpKind::Relu,
        inputs: vec![(Shape::from((1, 8, 4, 4)), N4)],
        outputs: vec![(Shape::from((1, 8, 4, 4)), N4)],
    };
    let mut m = first_manager(&reg, &req);
    assert!(m.describe_schedule().is_none());
    let fast = TuneOptions {
        warmup_iters: 0,
        bench_iters: 2,
        ..TuneOptions::default()
    };
    m.tune(&[Shape::from((1, 8, 4, 4))], &fast).unwrap();
    assert!(m.describe_schedule().is_some());
    assert!(!m.needs_weights());
    assert!(m.gen_executor().is_ok());
}

#[test]
fn test_executor_requires_a_schedule() {
    let reg = registry();
    let req = KernelRequest {
        op: OpKind::Relu,
        inputs: vec![(Shape::from(4), PLANAR)],
        outputs: vec![(Shape::from(4), PLANAR)],
    };
    let m = first_manager(&reg, &req);
    assert!(m.gen_executor().is_err());
}
