// Engine Tests — whole graphs compiled and run through a Session, checked
// against plain nested-loop references

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use vole::prelude::*;
use vole::{EngineContext, SymDim, SymbolicShape, TuneOptions};
use vole_core::{HostAllocator, ScriptedClock, WorkerPool};

// Helpers

fn engine() -> Engine {
    Engine::new(EngineConfig::default().with_workers(2)).unwrap()
}

/// Deterministic values in roughly [-1, 1).
fn pattern(len: usize, seed: usize) -> Vec<f32> {
    (0..len)
        .map(|i| (((i * 37 + seed * 11) % 29) as f32 - 14.0) / 14.0)
        .collect()
}

fn tensor(dims: (usize, usize, usize, usize), seed: usize) -> HostTensor {
    let len = dims.0 * dims.1 * dims.2 * dims.3;
    HostTensor::from_vec(pattern(len, seed), dims).unwrap()
}

fn feeds(pairs: &[(&str, &HostTensor)]) -> HashMap<String, HostTensor> {
    pairs
        .iter()
        .map(|(n, t)| (n.to_string(), (*t).clone()))
        .collect()
}

fn assert_close(got: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(got.len(), expected.len(), "length mismatch");
    for (i, (a, b)) in got.iter().zip(expected).enumerate() {
        assert!((a - b).abs() <= tol, "index {i}: got {a}, expected {b} (tol {tol})");
    }
}

/// Stride-1 NCHW convolution with symmetric padding.
fn reference_conv(
    x: &HostTensor,
    w: &HostTensor,
    bias: Option<&[f32]>,
    pad: usize,
) -> (Vec<f32>, [usize; 4]) {
    let [n, c, h, wd] = [x.shape().dims()[0], x.shape().dims()[1], x.shape().dims()[2], x.shape().dims()[3]];
    let [oc, _, kh, kw] = [w.shape().dims()[0], w.shape().dims()[1], w.shape().dims()[2], w.shape().dims()[3]];
    let (oh, ow) = (h + 2 * pad - kh + 1, wd + 2 * pad - kw + 1);
    let xs = x.as_slice::<f32>().unwrap();
    let ws = w.as_slice::<f32>().unwrap();
    let mut out = vec![0.0f32; n * oc * oh * ow];
    for b in 0..n {
        for o in 0..oc {
            for y in 0..oh {
                for z in 0..ow {
                    let mut acc = bias.map_or(0.0, |bs| bs[o]);
                    for ci in 0..c {
                        for i in 0..kh {
                            for j in 0..kw {
                                let (yy, zz) = ((y + i) as isize - pad as isize, (z + j) as isize - pad as isize);
                                if yy < 0 || zz < 0 || yy >= h as isize || zz >= wd as isize {
                                    continue;
                                }
                                let xv = xs[((b * c + ci) * h + yy as usize) * wd + zz as usize];
                                let wv = ws[((o * c + ci) * kh + i) * kw + j];
                                acc += xv * wv;
                            }
                        }
                    }
                    out[((b * oc + o) * oh + y) * ow + z] = acc;
                }
            }
        }
    }
    (out, [n, oc, oh, ow])
}

fn relu(v: &[f32]) -> Vec<f32> {
    v.iter().map(|x| x.max(0.0)).collect()
}

/// conv(3x3, pad 1, bias) -> relu
fn conv_relu_graph(x: &HostTensor, w: &HostTensor, bias: &HostTensor) -> Graph {
    let mut b = GraphBuilder::new();
    b.input("x", x.shape().clone(), DType::F32).unwrap();
    b.constant("w", w.clone()).unwrap();
    b.constant("bias", bias.clone()).unwrap();
    let attrs = Conv2dAttrs::new([3, 3]).with_pad([1, 1]).with_bias();
    b.node("conv", OpKind::Conv2d(attrs), &["x", "w", "bias"], &["c"])
        .unwrap();
    b.node("relu", OpKind::Relu, &["c"], &["y"]).unwrap();
    b.output("y").unwrap();
    b.build().unwrap()
}

struct ConvCase {
    x: HostTensor,
    w: HostTensor,
    bias: HostTensor,
}

impl ConvCase {
    fn new() -> Self {
        ConvCase {
            x: tensor((1, 4, 5, 5), 1),
            w: tensor((8, 4, 3, 3), 2),
            bias: HostTensor::from_vec(pattern(8, 3), 8).unwrap(),
        }
    }

    fn graph(&self) -> Graph {
        conv_relu_graph(&self.x, &self.w, &self.bias)
    }

    fn expected(&self) -> Vec<f32> {
        let bias = self.bias.to_vec::<f32>().unwrap();
        relu(&reference_conv(&self.x, &self.w, Some(&bias), 1).0)
    }
}

// Convolution

#[test]
fn test_conv_relu_matches_reference() {
    let case = ConvCase::new();
    let mut session = engine().compile(&case.graph()).unwrap();
    let out = session.run(&feeds(&[("x", &case.x)])).unwrap();
    let y = &out["y"];
    assert_eq!(y.shape().dims(), &[1, 8, 5, 5]);
    assert_eq!(y.ty(), EdgeType::ndarray(DType::F32));
    assert_close(&y.to_vec::<f32>().unwrap(), &case.expected(), 1e-4);
}

#[test]
fn test_conv_relu_is_fused_and_bridged() {
    let case = ConvCase::new();
    let session = engine().compile(&case.graph()).unwrap();
    let stats = session.stats();
    assert_eq!(stats.num_source_nodes, 2);
    assert_eq!(stats.num_fused, 1);
    // planar -> N4cx in front of the conv, N4cx -> planar behind it
    assert_eq!(stats.num_bridges, 2);
    assert_eq!(stats.num_nodes, 3);
    assert!(session.steps().iter().all(|s| s.name != "relu"));
    assert!(stats.arena_bytes > 0);
}

#[test]
fn test_source_graph_is_not_modified() {
    let case = ConvCase::new();
    let g = case.graph();
    let _session = engine().compile(&g).unwrap();
    assert_eq!(g.node_count(), 2);
    assert!(g.find_node("relu").is_some());
}

#[test]
fn test_runs_are_repeatable() {
    let case = ConvCase::new();
    let mut session = engine().compile(&case.graph()).unwrap();
    let f = feeds(&[("x", &case.x)]);
    let first = session.run(&f).unwrap();
    let other = tensor((1, 4, 5, 5), 9);
    session.run(&feeds(&[("x", &other)])).unwrap();
    let again = session.run(&f).unwrap();
    assert_eq!(first["y"].bytes(), again["y"].bytes());
}

#[test]
fn test_scalar_backend_matches_simd() {
    let case = ConvCase::new();
    let scalar = Engine::new(
        EngineConfig::default()
            .with_workers(1)
            .with_backend(BackendProfile::scalar()),
    )
    .unwrap();
    let mut session = scalar.compile(&case.graph()).unwrap();
    // planar end to end: nothing to convert
    assert_eq!(session.stats().num_bridges, 0);
    let out = session.run(&feeds(&[("x", &case.x)])).unwrap();
    assert_close(&out["y"].to_vec::<f32>().unwrap(), &case.expected(), 1e-4);
}

#[test]
fn test_conv_add_relu_folds_skip_connection() {
    let x = tensor((1, 4, 6, 6), 4);
    let skip = tensor((1, 8, 6, 6), 5);
    let w = tensor((8, 4, 3, 3), 6);

    let mut b = GraphBuilder::new();
    b.input("x", x.shape().clone(), DType::F32).unwrap();
    b.input("skip", skip.shape().clone(), DType::F32).unwrap();
    b.constant("w", w.clone()).unwrap();
    let attrs = Conv2dAttrs::new([3, 3]).with_pad([1, 1]);
    b.node("conv", OpKind::Conv2d(attrs), &["x", "w"], &["c"]).unwrap();
    b.node("add", OpKind::Add, &["c", "skip"], &["s"]).unwrap();
    b.node("relu", OpKind::Relu, &["s"], &["y"]).unwrap();
    b.output("y").unwrap();
    let g = b.build().unwrap();

    let mut session = engine().compile(&g).unwrap();
    assert_eq!(session.stats().num_fused, 2);

    let out = session
        .run(&feeds(&[("x", &x), ("skip", &skip)]))
        .unwrap();
    let conv = reference_conv(&x, &w, None, 1).0;
    let sum: Vec<f32> = conv
        .iter()
        .zip(skip.as_slice::<f32>().unwrap())
        .map(|(a, b)| a + b)
        .collect();
    assert_close(&out["y"].to_vec::<f32>().unwrap(), &relu(&sum), 1e-4);
}

// Pooling, reduction, element-wise

#[test]
fn test_maxpool_with_padded_channels() {
    // 3 channels do not fill a 4-lane block
    let x = tensor((1, 3, 4, 4), 7);
    let mut b = GraphBuilder::new();
    b.input("x", x.shape().clone(), DType::F32).unwrap();
    b.node(
        "pool",
        OpKind::MaxPool2d(Pool2dAttrs::new([2, 2], [2, 2])),
        &["x"],
        &["y"],
    )
    .unwrap();
    b.output("y").unwrap();

    let mut session = engine().compile(&b.build().unwrap()).unwrap();
    let out = session.run(&feeds(&[("x", &x)])).unwrap();
    let y = &out["y"];
    assert_eq!(y.shape().dims(), &[1, 3, 2, 2]);

    let xs = x.as_slice::<f32>().unwrap();
    let mut expected = Vec::new();
    for c in 0..3 {
        for i in 0..2 {
            for j in 0..2 {
                let mut m = f32::NEG_INFINITY;
                for di in 0..2 {
                    for dj in 0..2 {
                        m = m.max(xs[(c * 4 + 2 * i + di) * 4 + 2 * j + dj]);
                    }
                }
                expected.push(m);
            }
        }
    }
    assert_close(&y.to_vec::<f32>().unwrap(), &expected, 0.0);
}

#[test]
fn test_spatial_mean() {
    let x = tensor((2, 3, 3, 3), 8);
    let mut b = GraphBuilder::new();
    b.input("x", x.shape().clone(), DType::F32).unwrap();
    b.node(
        "mean",
        OpKind::Reduce(ReduceAttrs::new(ReduceKind::Mean, vec![2, 3], true)),
        &["x"],
        &["y"],
    )
    .unwrap();
    b.output("y").unwrap();

    let mut session = engine().compile(&b.build().unwrap()).unwrap();
    let out = session.run(&feeds(&[("x", &x)])).unwrap();
    assert_eq!(out["y"].shape().dims(), &[2, 3, 1, 1]);
    let expected: Vec<f32> = x
        .as_slice::<f32>()
        .unwrap()
        .chunks(9)
        .map(|c| c.iter().sum::<f32>() / 9.0)
        .collect();
    assert_close(&out["y"].to_vec::<f32>().unwrap(), &expected, 1e-5);
}

#[test]
fn test_add_then_clip_fans_out_to_two_outputs() {
    let a = tensor((1, 2, 3, 3), 10);
    let b_in = tensor((1, 2, 3, 3), 11);
    let mut b = GraphBuilder::new();
    b.input("a", a.shape().clone(), DType::F32).unwrap();
    b.input("b", b_in.shape().clone(), DType::F32).unwrap();
    b.node("add", OpKind::Add, &["a", "b"], &["s"]).unwrap();
    b.node("clip", OpKind::Clip { min: -0.5, max: 0.5 }, &["s"], &["c"])
        .unwrap();
    b.output("s").unwrap();
    b.output("c").unwrap();

    let mut session = engine().compile(&b.build().unwrap()).unwrap();
    let out = session.run(&feeds(&[("a", &a), ("b", &b_in)])).unwrap();
    let sum: Vec<f32> = a
        .as_slice::<f32>()
        .unwrap()
        .iter()
        .zip(b_in.as_slice::<f32>().unwrap())
        .map(|(x, y)| x + y)
        .collect();
    let clipped: Vec<f32> = sum.iter().map(|v| v.clamp(-0.5, 0.5)).collect();
    assert_close(&out["s"].to_vec::<f32>().unwrap(), &sum, 1e-6);
    assert_close(&out["c"].to_vec::<f32>().unwrap(), &clipped, 1e-6);
}

// Compile errors

#[test]
fn test_custom_op_names_pass_and_node() {
    let mut b = GraphBuilder::new();
    b.input("x", Shape::from((1, 4)), DType::F32).unwrap();
    b.node("nms", OpKind::Custom { name: "nms".into() }, &["x"], &["y"])
        .unwrap();
    b.output("y").unwrap();
    let err = engine().compile(&b.build().unwrap()).unwrap_err();
    assert!(err.is_unsupported());
    match err {
        Error::Pass { pass, node, .. } => {
            assert_eq!(pass, "instantiate");
            assert_eq!(node, "nms");
        }
        other => panic!("expected a pass error, got {other}"),
    }
}

fn symbolic_graph() -> Graph {
    let mut b = GraphBuilder::new();
    let shape = SymbolicShape::new(vec![
        SymDim::symbolic("Batch"),
        SymDim::fixed(4),
        SymDim::fixed(2),
        SymDim::fixed(2),
    ]);
    b.input("x", shape, DType::F32).unwrap();
    b.node("relu", OpKind::Relu, &["x"], &["y"]).unwrap();
    b.output("y").unwrap();
    b.build().unwrap()
}

#[test]
fn test_unbound_symbol_is_reported() {
    let err = engine().compile(&symbolic_graph()).unwrap_err();
    match err {
        Error::Pass { pass, node, source } => {
            assert_eq!(pass, "infer_shapes");
            assert_eq!(node, "x");
            assert!(matches!(*source, Error::UnboundSymbol(ref s) if s == "Batch"));
        }
        other => panic!("expected a pass error, got {other}"),
    }
}

#[test]
fn test_bound_symbol_fixes_feed_shape() {
    let e = Engine::new(EngineConfig::default().with_workers(1).set_dim("Batch", 3)).unwrap();
    let mut session = e.compile(&symbolic_graph()).unwrap();
    let (shape, ty) = session.input_spec("x").unwrap();
    assert_eq!(shape.dims(), &[3, 4, 2, 2]);
    assert_eq!(ty, EdgeType::ndarray(DType::F32));

    let x = tensor((3, 4, 2, 2), 12);
    let out = session.run(&feeds(&[("x", &x)])).unwrap();
    assert_close(
        &out["y"].to_vec::<f32>().unwrap(),
        &relu(x.as_slice::<f32>().unwrap()),
        0.0,
    );
    let wrong = tensor((2, 4, 2, 2), 12);
    assert!(session.run(&feeds(&[("x", &wrong)])).is_err());
}

// Autotuning, memory, profiling

fn scripted_engine(config: EngineConfig) -> (Engine, Arc<ScriptedClock>) {
    let clock = Arc::new(ScriptedClock::new(vec![
        Duration::from_micros(5),
        Duration::from_micros(3),
        Duration::from_micros(7),
    ]));
    let ctx = EngineContext::new(
        Arc::new(HostAllocator::new()),
        clock.clone(),
        Arc::new(WorkerPool::new(1).unwrap()),
    );
    (Engine::with_context(config, ctx).unwrap(), clock)
}

#[test]
fn test_autotune_agrees_with_heuristic() {
    let case = ConvCase::new();
    let tune = TuneOptions {
        warmup_iters: 0,
        bench_iters: 2,
        tune_blocksize: false,
        ..TuneOptions::default()
    };
    let (tuned_engine, clock) = scripted_engine(
        EngineConfig::default()
            .with_autotune(64)
            .with_tune_options(tune),
    );
    let mut session = tuned_engine.compile(&case.graph()).unwrap();
    assert!(session.stats().num_tuned > 0);
    assert!(clock.reads() > 0);
    assert!(session.steps().iter().any(|s| s.tuned));

    let out = session.run(&feeds(&[("x", &case.x)])).unwrap();
    assert_close(&out["y"].to_vec::<f32>().unwrap(), &case.expected(), 1e-4);
}

#[test]
fn test_zero_budget_falls_back_to_heuristic() {
    let case = ConvCase::new();
    let (e, clock) = scripted_engine(EngineConfig::default().with_autotune(0));
    let session = e.compile(&case.graph()).unwrap();
    assert_eq!(session.stats().num_tuned, 0);
    assert_eq!(clock.reads(), 0);
}

#[test]
fn test_arena_is_released_with_the_session() {
    let case = ConvCase::new();
    let e = engine();
    let before = e.context().allocator().stats().live_blocks;
    let session = e.compile(&case.graph()).unwrap();
    assert!(e.context().allocator().stats().live_blocks > before);
    drop(session);
    assert_eq!(e.context().allocator().stats().live_blocks, before);
}

#[test]
fn test_arena_limit_fails_compile() {
    let case = ConvCase::new();
    let ctx = EngineContext::host(1)
        .unwrap()
        .with_allocator(Arc::new(HostAllocator::with_limit(16)));
    let e = Engine::with_context(EngineConfig::default().with_workers(1), ctx).unwrap();
    assert!(e.compile(&case.graph()).is_err());
}

#[test]
fn test_profiling_counts_every_step_per_run() {
    let case = ConvCase::new();
    let e = Engine::new(EngineConfig::default().with_workers(1).with_profiling(true)).unwrap();
    let mut session = e.compile(&case.graph()).unwrap();
    let f = feeds(&[("x", &case.x)]);
    session.run(&f).unwrap();
    session.run(&f).unwrap();

    let report = session.profile();
    assert_eq!(report.entries.len(), session.steps().len());
    let conv = report.entry("conv").unwrap();
    assert_eq!(conv.count, 2);
    assert!(report.to_string().contains("conv"));

    session.clear_profile();
    assert!(session.profile().entries.is_empty());
}
