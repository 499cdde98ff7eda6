// Operator fusion
//
// Folds short chains that start at a convolution into the convolution
// itself, so the epilogue runs on the accumulator instead of a second pass
// over memory. A backend only fuses the chains its profile declares:
//
//   Conv → Relu              relu flag
//   Conv → Clip(0, 6)        relu6 flag
//   Conv → Add               sum flag, the other addend becomes an input
//   Conv → Add → Relu        sum and relu flags
//
// A chain is folded only when every interior edge is private to it (read by
// the next node alone, not a graph output, no pending bridge) and all of its
// nodes run on the same backend. Runs after negotiation, so the fused node
// keeps the types already resolved for the chain's final output.

use std::collections::HashMap;

use vole_core::{Error, Result, Shape};
use vole_cpu::{BackendProfile, FusionChain};
use vole_ir::{Consumer, Conv2dAttrs, EdgeId, Graph, NodeId, OpKind};

use crate::facade::{make_facade, OpFacade};
use crate::negotiate::Negotiation;

type Facades = HashMap<NodeId, Box<dyn OpFacade>>;

fn backend_of(facades: &Facades, id: NodeId) -> Option<&str> {
    facades.get(&id).map(|f| f.backend())
}

/// The node reading `node`'s single output, when that edge is private to it.
fn private_reader(
    graph: &Graph,
    facades: &Facades,
    pending: &Negotiation,
    node: NodeId,
) -> Result<Option<(EdgeId, NodeId)>> {
    let link = match graph.node(node)?.outputs.as_slice() {
        [o] => *o,
        _ => return Ok(None),
    };
    let edge = graph.edge(link)?;
    let reader = match edge.consumers.as_slice() {
        [r] => *r,
        _ => return Ok(None),
    };
    let private = !graph.is_output(link)
        && !pending.bridges_edge(link)
        && backend_of(facades, reader).is_some()
        && backend_of(facades, reader) == backend_of(facades, node);
    Ok(private.then_some((link, reader)))
}

/// Move pending bridges that feed `from` onto `to`.
fn retarget(pending: &mut Negotiation, from: NodeId, to: NodeId) {
    for b in &mut pending.bridges {
        for c in &mut b.consumers {
            if *c == Consumer::Node(from) {
                *c = Consumer::Node(to);
            }
        }
    }
}

fn fold(
    graph: &mut Graph,
    facades: &mut Facades,
    pending: &mut Negotiation,
    head: NodeId,
    succ: NodeId,
    extra: &[EdgeId],
) -> Result<()> {
    graph.fold_into(head, succ, extra)?;
    facades.remove(&succ);
    retarget(pending, succ, head);
    Ok(())
}

/// The addend of `add` that is not `link`, if it matches the conv output.
fn sum_operand(graph: &Graph, add: NodeId, link: EdgeId) -> Result<Option<EdgeId>> {
    let inputs = &graph.node(add)?.inputs;
    let other = match inputs.as_slice() {
        [a, b] if *a == link && *b != link => *b,
        [a, b] if *b == link && *a != link => *a,
        _ => return Ok(None),
    };
    let same = graph.edge(other)?.desc.shape == graph.edge(link)?.desc.shape;
    Ok(same.then_some(other))
}

/// Fold at most one chain into convolution `head`. Returns the number of
/// nodes removed.
fn fuse_head(
    graph: &mut Graph,
    facades: &mut Facades,
    pending: &mut Negotiation,
    profile: &BackendProfile,
    head: NodeId,
) -> Result<usize> {
    let mut attrs: Conv2dAttrs = match &graph.node(head)?.op {
        OpKind::Conv2d(a) if !a.fuse.any() => *a,
        _ => return Ok(0),
    };
    let Some((link, succ)) = private_reader(graph, facades, pending, head)? else {
        return Ok(0);
    };

    let folded = match graph.node(succ)?.op.clone() {
        OpKind::Relu if profile.fuses(FusionChain::ConvRelu) => {
            fold(graph, facades, pending, head, succ, &[])?;
            attrs.fuse.relu = true;
            1
        }
        op if op.is_relu6() && profile.fuses(FusionChain::ConvRelu6) => {
            fold(graph, facades, pending, head, succ, &[])?;
            attrs.fuse.relu6 = true;
            1
        }
        OpKind::Add => {
            let Some(other) = sum_operand(graph, succ, link)? else {
                return Ok(0);
            };
            let relu = match private_reader(graph, facades, pending, succ)? {
                Some((_, r)) if graph.node(r)?.op == OpKind::Relu => Some(r),
                _ => None,
            };
            match relu {
                Some(r) if profile.fuses(FusionChain::ConvSumRelu) => {
                    fold(graph, facades, pending, head, succ, &[other])?;
                    fold(graph, facades, pending, head, r, &[])?;
                    attrs.fuse.sum = true;
                    attrs.fuse.relu = true;
                    2
                }
                _ if profile.fuses(FusionChain::ConvSum) => {
                    fold(graph, facades, pending, head, succ, &[other])?;
                    attrs.fuse.sum = true;
                    1
                }
                _ => 0,
            }
        }
        _ => 0,
    };
    if folded == 0 {
        return Ok(0);
    }

    let op = OpKind::Conv2d(attrs);
    let facade = make_facade(&op, profile)?;
    let (inputs, outputs) = {
        let n = graph.node(head)?;
        (n.inputs.clone(), n.outputs.clone())
    };
    let shapes = inputs
        .iter()
        .map(|&e| graph.edge(e)?.desc.shape().cloned())
        .collect::<Result<Vec<Shape>>>()?;
    let inferred = facade.infer_shapes(&shapes)?;
    for (&o, s) in outputs.iter().zip(inferred) {
        let have = graph.edge(o)?.desc.shape()?;
        if *have != s {
            return Err(Error::ShapeMismatch {
                expected: have.clone(),
                got: s,
            });
        }
    }
    graph.node_mut(head)?.op = op;
    facades.insert(head, facade);
    Ok(folded)
}

/// Fold every eligible chain. Returns the number of nodes folded away.
pub fn fuse(
    graph: &mut Graph,
    facades: &mut Facades,
    pending: &mut Negotiation,
    profiles: &[BackendProfile],
) -> Result<usize> {
    let heads: Vec<NodeId> = graph
        .topo_order()?
        .into_iter()
        .filter(|&id| matches!(graph.node(id), Ok(n) if matches!(n.op, OpKind::Conv2d(_))))
        .collect();

    let mut count = 0;
    for head in heads {
        let name = graph.node(head)?.name.clone();
        let Some(backend) = backend_of(facades, head).map(str::to_string) else {
            continue;
        };
        let Some(profile) = profiles.iter().find(|p| p.name() == backend) else {
            continue;
        };
        let n = fuse_head(graph, facades, pending, profile, head)
            .map_err(|e| e.in_pass("fuse", name.as_str()))?;
        if n > 0 {
            log::debug!("fused {n} node(s) into '{name}' on {backend}");
        }
        count += n;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vole_core::{DType, EdgeType, HostTensor};
    use vole_ir::GraphBuilder;

    use crate::negotiate::{negotiate, PendingBridge};

    /// Facades on simd4_f32 for every node, shapes filled in by hand for
    /// the edges the graph has.
    fn prepare(g: &mut Graph, shapes: &[(&str, Shape)]) -> Facades {
        for (name, s) in shapes {
            if let Some(e) = g.find_edge(name) {
                g.edge_mut(e).unwrap().desc.shape = Some(s.clone());
            }
        }
        let p = BackendProfile::simd4_f32();
        g.nodes()
            .map(|n| (n.id, make_facade(&n.op, &p).unwrap()))
            .collect()
    }

    fn conv_graph(tail: impl FnOnce(&mut GraphBuilder)) -> Graph {
        let mut b = GraphBuilder::new();
        b.input("x", Shape::from((1, 4, 6, 6)), DType::F32).unwrap();
        b.input("skip", Shape::from((1, 8, 6, 6)), DType::F32).unwrap();
        let w = HostTensor::from_vec(vec![0.1f32; 8 * 4 * 9], (8, 4, 3, 3)).unwrap();
        b.constant("w", w).unwrap();
        let attrs = Conv2dAttrs::new([3, 3]).with_pad([1, 1]);
        b.node("conv", OpKind::Conv2d(attrs), &["x", "w"], &["c"]).unwrap();
        tail(&mut b);
        b.build().unwrap()
    }

    fn shapes() -> Vec<(&'static str, Shape)> {
        let y = Shape::from((1, 8, 6, 6));
        vec![
            ("x", Shape::from((1, 4, 6, 6))),
            ("skip", y.clone()),
            ("c", y.clone()),
            ("s", y.clone()),
            ("r", y),
        ]
    }

    fn conv_attrs(g: &Graph) -> Conv2dAttrs {
        let id = g.find_node("conv").unwrap();
        match g.node(id).unwrap().op {
            OpKind::Conv2d(a) => a,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_conv_add_relu_folds_into_one_node() {
        let mut g = conv_graph(|b| {
            b.node("add", OpKind::Add, &["c", "skip"], &["s"]).unwrap();
            b.node("relu", OpKind::Relu, &["s"], &["r"]).unwrap();
            b.output("r").unwrap();
        });
        let mut f = prepare(&mut g, &shapes());
        let mut pending = Negotiation::default();
        let n = fuse(&mut g, &mut f, &mut pending, &[BackendProfile::simd4_f32()]).unwrap();
        assert_eq!(n, 2);
        assert_eq!(g.node_count(), 1);
        let a = conv_attrs(&g);
        assert!(a.fuse.sum && a.fuse.relu);
        let conv = g.find_node("conv").unwrap();
        assert_eq!(g.node(conv).unwrap().inputs.len(), a.arity());
        assert_eq!(g.node(conv).unwrap().outputs, vec![g.find_edge("r").unwrap()]);
    }

    #[test]
    fn test_relu6_needs_exact_clip() {
        let mut g = conv_graph(|b| {
            b.node("clip", OpKind::Clip { min: 0.0, max: 5.0 }, &["c"], &["r"])
                .unwrap();
            b.output("r").unwrap();
        });
        let mut f = prepare(&mut g, &shapes());
        let mut pending = Negotiation::default();
        let n = fuse(&mut g, &mut f, &mut pending, &[BackendProfile::simd4_f32()]).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_shared_edge_blocks_fusion() {
        let mut g = conv_graph(|b| {
            b.node("relu", OpKind::Relu, &["c"], &["r"]).unwrap();
            b.output("r").unwrap();
            b.output("c").unwrap();
        });
        let mut f = prepare(&mut g, &shapes());
        let mut pending = Negotiation::default();
        let n = fuse(&mut g, &mut f, &mut pending, &[BackendProfile::simd4_f32()]).unwrap();
        assert_eq!(n, 0);
        assert_eq!(g.node_count(), 2);
    }

    #[test]
    fn test_pending_bridge_blocks_fusion() {
        let mut g = conv_graph(|b| {
            b.node("relu", OpKind::Relu, &["c"], &["r"]).unwrap();
            b.output("r").unwrap();
        });
        let mut f = prepare(&mut g, &shapes());
        let c = g.find_edge("c").unwrap();
        let relu = g.find_node("relu").unwrap();
        let mut pending = Negotiation {
            bridges: vec![PendingBridge {
                edge: c,
                from: EdgeType::ndarray(DType::F32),
                to: EdgeType::ndarray(DType::F16),
                fill: vole_core::PadFill::Zero,
                consumers: vec![Consumer::Node(relu)],
            }],
            visits: 0,
        };
        let n = fuse(&mut g, &mut f, &mut pending, &[BackendProfile::simd4_f32()]).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_sum_operand_bridge_moves_to_conv() {
        let mut g = conv_graph(|b| {
            b.node("add", OpKind::Add, &["c", "skip"], &["s"]).unwrap();
            b.output("s").unwrap();
        });
        let mut f = prepare(&mut g, &shapes());
        let mut pending = negotiate(&mut g, &f).unwrap();
        // skip arrives planar and must be bridged to the conv layout
        assert!(pending.bridges_edge(g.find_edge("skip").unwrap()));
        let n = fuse(&mut g, &mut f, &mut pending, &[BackendProfile::simd4_f32()]).unwrap();
        assert_eq!(n, 1);
        let conv = g.find_node("conv").unwrap();
        let skip = pending
            .bridges
            .iter()
            .find(|b| b.edge == g.find_edge("skip").unwrap())
            .unwrap();
        assert_eq!(skip.consumers, vec![Consumer::Node(conv)]);
    }

    #[test]
    fn test_backend_without_chain_keeps_nodes() {
        let mut g = conv_graph(|b| {
            b.node("relu", OpKind::Relu, &["c"], &["r"]).unwrap();
            b.output("r").unwrap();
        });
        let mut f = prepare(&mut g, &shapes());
        let mut pending = Negotiation::default();
        let bare = BackendProfile::new(
            "simd4_f32",
            vole_core::DataFormat::N4cx,
            vec![DType::F32],
            vec![],
        );
        assert_eq!(fuse(&mut g, &mut f, &mut pending, &[bare]).unwrap(), 0);
    }
}
