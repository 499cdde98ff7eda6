use std::collections::HashMap;

use vole_core::{DType, EdgeType, Error, HostTensor, Result, SymbolicShape};

use crate::graph::{EdgeId, EdgeKind, Graph, NodeId};
use crate::op::OpKind;

/// Builds a [`Graph`] by tensor name.
///
/// ```ignore
/// let mut b = GraphBuilder::new();
/// b.input("x", Shape::from((1, 3, 8, 8)), DType::F32)?;
/// b.constant("w", filter)?;
/// b.node("conv", OpKind::Conv2d(Conv2dAttrs::new([3, 3])), &["x", "w"], &["y"])?;
/// b.output("y")?;
/// let graph = b.build()?;
/// ```
#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: Graph,
    by_name: HashMap<String, EdgeId>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh(&mut self, name: &str, kind: EdgeKind) -> Result<EdgeId> {
        if self.by_name.contains_key(name) {
            return Err(Error::invalid(format!("tensor '{name}' is defined twice")));
        }
        let id = self.graph.add_edge(name, kind);
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    fn lookup(&self, name: &str) -> Result<EdgeId> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| Error::invalid(format!("unknown tensor '{name}'")))
    }

    /// Declare a graph input fed as planar `dtype` data. The shape may name
    /// symbolic dims that the engine configuration binds.
    pub fn input(
        &mut self,
        name: &str,
        shape: impl Into<SymbolicShape>,
        dtype: DType,
    ) -> Result<EdgeId> {
        let id = self.fresh(name, EdgeKind::Input)?;
        self.graph.mark_input(id)?;
        let desc = &mut self.graph.edge_mut(id)?.desc;
        desc.symbolic = Some(shape.into());
        desc.required = Some(EdgeType::ndarray(dtype));
        Ok(id)
    }

    pub fn constant(&mut self, name: &str, value: HostTensor) -> Result<EdgeId> {
        let id = self.fresh(name, EdgeKind::Constant)?;
        self.graph.set_constant(id, value)?;
        Ok(id)
    }

    /// Add a node. Inputs must already exist; outputs are created.
    pub fn node(
        &mut self,
        name: &str,
        op: OpKind,
        inputs: &[&str],
        outputs: &[&str],
    ) -> Result<NodeId> {
        let ins = inputs
            .iter()
            .map(|n| self.lookup(n))
            .collect::<Result<Vec<_>>>()?;
        let mut outs = Vec::with_capacity(outputs.len());
        for n in outputs {
            outs.push(self.fresh(n, EdgeKind::Intermediate)?);
        }
        self.graph.add_node(name, op, ins, outs)
    }

    /// Restrict a node to the named backends, in priority order.
    pub fn assign(&mut self, node: NodeId, backends: &[&str]) -> Result<()> {
        self.graph.node_mut(node)?.backends = backends.iter().map(|b| b.to_string()).collect();
        Ok(())
    }

    /// Return a tensor to the caller in planar layout.
    pub fn output(&mut self, name: &str) -> Result<EdgeId> {
        let id = self.lookup(name)?;
        self.graph.mark_output(id)?;
        Ok(id)
    }

    /// Return a tensor to the caller in a fixed type.
    pub fn output_as(&mut self, name: &str, ty: EdgeType) -> Result<EdgeId> {
        let id = self.output(name)?;
        self.graph.edge_mut(id)?.desc.required = Some(ty);
        Ok(id)
    }

    pub fn build(self) -> Result<Graph> {
        if self.graph.outputs().is_empty() {
            return Err(Error::invalid("graph has no outputs"));
        }
        for e in self.graph.edges() {
            let dangling = e.producer.is_none()
                && !matches!(e.desc.kind, EdgeKind::Input | EdgeKind::Constant);
            if dangling {
                return Err(Error::invalid(format!(
                    "tensor '{}' has no producer",
                    e.name
                )));
            }
        }
        self.graph.topo_order()?;
        Ok(self.graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vole_core::Shape;

    #[test]
    fn test_build_simple_graph() {
        let mut b = GraphBuilder::new();
        b.input("x", Shape::from((1, 4, 2, 2)), DType::F32).unwrap();
        let r = b.node("r", OpKind::Relu, &["x"], &["y"]).unwrap();
        b.assign(r, &["scalar"]).unwrap();
        b.output("y").unwrap();
        let g = b.build().unwrap();
        assert_eq!(g.node_count(), 1);
        assert_eq!(g.node(r).unwrap().backends, vec!["scalar".to_string()]);
        let y = g.find_edge("y").unwrap();
        assert!(g.is_output(y));
    }

    #[test]
    fn test_names_are_checked() {
        let mut b = GraphBuilder::new();
        b.input("x", Shape::from((1, 4)), DType::F32).unwrap();
        assert!(b.input("x", Shape::from((1, 4)), DType::F32).is_err());
        assert!(b.node("r", OpKind::Relu, &["nope"], &["y"]).is_err());
        assert!(b.node("r", OpKind::Relu, &["x"], &["x"]).is_err());
    }

    #[test]
    fn test_graph_without_outputs_rejected() {
        let mut b = GraphBuilder::new();
        b.input("x", Shape::from((1, 4)), DType::F32).unwrap();
        b.node("r", OpKind::Relu, &["x"], &["y"]).unwrap();
        assert!(b.build().is_err());
    }
}
