// Graph — the acyclic node/edge graph the pipeline compiles
//
// Nodes and edges are stored in id-indexed slot vectors. Removing a node or
// an edge leaves a tombstone, so ids handed out earlier stay valid (or fail
// cleanly) for the rest of the compile.
//
// KEY CONCEPTS:
//
// 1. **Edges own the tensor description**: shape, role and the negotiated
//    format/type live on the edge (TensorDesc), never on the node. A node
//    only lists its ordered input and output edges.
//
// 2. **Producer/consumer links**: every edge records its producing node
//    (None for graph inputs and constants) and its consuming nodes. Graph
//    outputs are listed separately; an output edge may also feed nodes.
//
// 3. **Structural edits**: the pipeline only ever inserts bridges, folds a
//    successor into a node (fusion) and bypasses single-in/single-out nodes
//    (bridge elimination). Those three edits keep the links consistent.
//
// 4. **Topological order**: Kahn's algorithm with the ready set ordered by
//    node id, so the order is deterministic for a given graph.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use vole_core::{EdgeType, Error, HostTensor, Result, Shape, SymbolicShape};

use crate::op::OpKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Role of an edge in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// Fed by the caller.
    Input,
    /// Returned to the caller.
    Output,
    /// Baked into the graph (weights, biases, constant operands).
    Constant,
    /// Produced and consumed inside the graph.
    Intermediate,
}

/// What an edge carries.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDesc {
    pub kind: EdgeKind,
    /// Concrete shape; set for constants and by shape inference.
    pub shape: Option<Shape>,
    /// Declared shape of graph inputs that have named dims.
    pub symbolic: Option<SymbolicShape>,
    /// Acceptable types in preference order, before negotiation.
    pub candidates: Vec<EdgeType>,
    /// The single type chosen by negotiation.
    pub resolved: Option<EdgeType>,
    /// Type fixed by the caller: the feed type of an input, the declared
    /// type of an output.
    pub required: Option<EdgeType>,
}

impl TensorDesc {
    pub fn new(kind: EdgeKind) -> Self {
        TensorDesc {
            kind,
            shape: None,
            symbolic: None,
            candidates: Vec::new(),
            resolved: None,
            required: None,
        }
    }

    pub fn shape(&self) -> Result<&Shape> {
        self.shape
            .as_ref()
            .ok_or_else(|| Error::invalid("edge shape has not been inferred"))
    }

    pub fn resolved(&self) -> Result<EdgeType> {
        self.resolved
            .ok_or_else(|| Error::invalid("edge type has not been negotiated"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub id: EdgeId,
    pub name: String,
    pub producer: Option<NodeId>,
    pub consumers: Vec<NodeId>,
    pub desc: TensorDesc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub op: OpKind,
    pub inputs: Vec<EdgeId>,
    pub outputs: Vec<EdgeId>,
    /// Backend names this node may run on, in priority order. Empty means
    /// any engine backend.
    pub backends: Vec<String>,
}

/// Who reads an edge: a node, or the caller through the graph outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Consumer {
    Node(NodeId),
    GraphOutput,
}

/// A directed acyclic graph of operator nodes and tensor edges.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Option<Node>>,
    edges: Vec<Option<Edge>>,
    inputs: Vec<EdgeId>,
    outputs: Vec<EdgeId>,
    constants: HashMap<EdgeId, Arc<HostTensor>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    // Construction

    pub fn add_edge(&mut self, name: impl Into<String>, kind: EdgeKind) -> EdgeId {
        let id = EdgeId(self.edges.len());
        self.edges.push(Some(Edge {
            id,
            name: name.into(),
            producer: None,
            consumers: Vec::new(),
            desc: TensorDesc::new(kind),
        }));
        id
    }

    /// Add a node reading `inputs` and producing `outputs`. Each output edge
    /// must not have a producer yet.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        op: OpKind,
        inputs: Vec<EdgeId>,
        outputs: Vec<EdgeId>,
    ) -> Result<NodeId> {
        let id = NodeId(self.nodes.len());
        let name = name.into();
        for &e in &outputs {
            let edge = self.edge(e)?;
            if let Some(p) = edge.producer {
                return Err(Error::invalid(format!(
                    "edge '{}' already produced by {p}",
                    edge.name
                )));
            }
            if matches!(edge.desc.kind, EdgeKind::Input | EdgeKind::Constant) {
                return Err(Error::invalid(format!(
                    "node '{name}' cannot produce input or constant edge '{}'",
                    edge.name
                )));
            }
        }
        for &e in &inputs {
            self.edge(e)?;
        }
        for &e in &inputs {
            let edge = self.edge_mut(e)?;
            if !edge.consumers.contains(&id) {
                edge.consumers.push(id);
            }
        }
        for &e in &outputs {
            self.edge_mut(e)?.producer = Some(id);
        }
        self.nodes.push(Some(Node {
            id,
            name,
            op,
            inputs,
            outputs,
            backends: Vec::new(),
        }));
        Ok(id)
    }

    pub fn mark_input(&mut self, e: EdgeId) -> Result<()> {
        self.edge_mut(e)?.desc.kind = EdgeKind::Input;
        if !self.inputs.contains(&e) {
            self.inputs.push(e);
        }
        Ok(())
    }

    pub fn mark_output(&mut self, e: EdgeId) -> Result<()> {
        let desc = &mut self.edge_mut(e)?.desc;
        if desc.kind == EdgeKind::Intermediate {
            desc.kind = EdgeKind::Output;
        }
        if !self.outputs.contains(&e) {
            self.outputs.push(e);
        }
        Ok(())
    }

    /// Attach constant data to a constant edge and record its shape.
    pub fn set_constant(&mut self, e: EdgeId, value: HostTensor) -> Result<()> {
        let edge = self.edge_mut(e)?;
        edge.desc.kind = EdgeKind::Constant;
        edge.desc.shape = Some(value.shape().clone());
        edge.desc.required = Some(value.ty());
        self.constants.insert(e, Arc::new(value));
        Ok(())
    }

    // Access

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::invalid(format!("no node {id}")))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::invalid(format!("no node {id}")))
    }

    pub fn edge(&self, id: EdgeId) -> Result<&Edge> {
        self.edges
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::invalid(format!("no edge {id}")))
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> Result<&mut Edge> {
        self.edges
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::invalid(format!("no edge {id}")))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().flatten()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter().flatten()
    }

    pub fn node_count(&self) -> usize {
        self.nodes().count()
    }

    pub fn edge_count(&self) -> usize {
        self.edges().count()
    }

    pub fn inputs(&self) -> &[EdgeId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[EdgeId] {
        &self.outputs
    }

    pub fn is_output(&self, e: EdgeId) -> bool {
        self.outputs.contains(&e)
    }

    pub fn constant(&self, e: EdgeId) -> Option<&Arc<HostTensor>> {
        self.constants.get(&e)
    }

    pub fn is_constant(&self, e: EdgeId) -> bool {
        self.constants.contains_key(&e)
    }

    /// Replace the data of a constant edge (used when materializing it in
    /// its negotiated type).
    pub fn replace_constant(&mut self, e: EdgeId, value: HostTensor) -> Result<()> {
        match self.constants.get_mut(&e) {
            Some(slot) => {
                *slot = Arc::new(value);
                Ok(())
            }
            None => Err(Error::invalid(format!("edge {e} is not a constant"))),
        }
    }

    pub fn find_edge(&self, name: &str) -> Option<EdgeId> {
        self.edges().find(|e| e.name == name).map(|e| e.id)
    }

    pub fn find_node(&self, name: &str) -> Option<NodeId> {
        self.nodes().find(|n| n.name == name).map(|n| n.id)
    }

    /// Every reader of `e`: its consumer nodes, then the graph outputs.
    pub fn readers(&self, e: EdgeId) -> Result<Vec<Consumer>> {
        let mut out: Vec<Consumer> = self
            .edge(e)?
            .consumers
            .iter()
            .map(|&n| Consumer::Node(n))
            .collect();
        if self.is_output(e) {
            out.push(Consumer::GraphOutput);
        }
        Ok(out)
    }

    /// Nodes in dependency order (Kahn, ties broken by node id).
    pub fn topo_order(&self) -> Result<Vec<NodeId>> {
        let mut pending: HashMap<NodeId, usize> = HashMap::new();
        let mut ready = BTreeSet::new();
        for node in self.nodes() {
            let deps = node
                .inputs
                .iter()
                .filter(|&&e| matches!(self.edge(e), Ok(edge) if edge.producer.is_some()))
                .count();
            if deps == 0 {
                ready.insert(node.id);
            } else {
                pending.insert(node.id, deps);
            }
        }

        let mut order = Vec::with_capacity(self.node_count());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            for &out in &self.node(id)?.outputs {
                for &c in &self.edge(out)?.consumers {
                    let reads = self
                        .node(c)?
                        .inputs
                        .iter()
                        .filter(|&&e| e == out)
                        .count();
                    if let Some(left) = pending.get_mut(&c) {
                        *left = left.saturating_sub(reads);
                        if *left == 0 {
                            pending.remove(&c);
                            ready.insert(c);
                        }
                    }
                }
            }
        }

        if order.len() != self.node_count() {
            return Err(Error::invalid(format!(
                "graph has a cycle through {} node(s)",
                self.node_count() - order.len()
            )));
        }
        Ok(order)
    }

    // Structural edits

    /// Insert `op` between `edge` and the listed readers. The readers are
    /// rewired to a new edge produced by the bridge node; other readers keep
    /// reading `edge`. A bridged graph output keeps its name on the new edge.
    pub fn insert_bridge(
        &mut self,
        edge: EdgeId,
        targets: &[Consumer],
        op: OpKind,
        name: impl Into<String>,
    ) -> Result<(NodeId, EdgeId)> {
        let name = name.into();
        let (src_name, shape) = {
            let e = self.edge(edge)?;
            (e.name.clone(), e.desc.shape.clone())
        };
        for t in targets {
            let reads = match t {
                Consumer::Node(n) => self.edge(edge)?.consumers.contains(n),
                Consumer::GraphOutput => self.is_output(edge),
            };
            if !reads {
                return Err(Error::invalid(format!(
                    "{t:?} does not read edge '{src_name}'"
                )));
            }
        }

        let to_output = targets.contains(&Consumer::GraphOutput);
        let new_edge = self.add_edge(format!("{src_name}:{name}"), EdgeKind::Intermediate);
        self.edge_mut(new_edge)?.desc.shape = shape;
        let bridge = self.add_node(name, op, vec![edge], vec![new_edge])?;

        for t in targets {
            if let Consumer::Node(n) = *t {
                self.rewire_input(n, edge, new_edge)?;
            }
        }
        if to_output {
            self.swap_output(edge, new_edge)?;
        }
        Ok((bridge, new_edge))
    }

    /// Replace every read of `from` by node `n` with `to`.
    fn rewire_input(&mut self, n: NodeId, from: EdgeId, to: EdgeId) -> Result<()> {
        for input in self.node_mut(n)?.inputs.iter_mut() {
            if *input == from {
                *input = to;
            }
        }
        self.edge_mut(from)?.consumers.retain(|&c| c != n);
        let consumers = &mut self.edge_mut(to)?.consumers;
        if !consumers.contains(&n) {
            consumers.push(n);
        }
        Ok(())
    }

    /// Move the graph-output role (and its name) from `from` to `to`.
    fn swap_output(&mut self, from: EdgeId, to: EdgeId) -> Result<()> {
        let from_edge = self.edge(from)?;
        let out_name = from_edge.name.clone();
        let required = from_edge.desc.required;
        let to_name = self.edge(to)?.name.clone();
        for o in self.outputs.iter_mut() {
            if *o == from {
                *o = to;
            }
        }
        {
            let f = self.edge_mut(from)?;
            f.name = to_name;
            if f.desc.kind == EdgeKind::Output {
                f.desc.kind = EdgeKind::Intermediate;
                f.desc.required = None;
            }
        }
        let t = self.edge_mut(to)?;
        t.name = out_name;
        t.desc.required = required;
        if t.desc.kind == EdgeKind::Intermediate {
            t.desc.kind = EdgeKind::Output;
        }
        Ok(())
    }

    /// Detach and remove a node. Its output edges lose their producer.
    pub fn remove_node(&mut self, id: NodeId) -> Result<Node> {
        let node = self
            .nodes
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or_else(|| Error::invalid(format!("no node {id}")))?;
        for &e in &node.inputs {
            if let Ok(edge) = self.edge_mut(e) {
                edge.consumers.retain(|&c| c != id);
            }
        }
        for &e in &node.outputs {
            if let Ok(edge) = self.edge_mut(e) {
                edge.producer = None;
            }
        }
        Ok(node)
    }

    /// Remove an edge nobody produces or reads.
    pub fn remove_edge(&mut self, id: EdgeId) -> Result<Edge> {
        let edge = self.edge(id)?;
        if edge.producer.is_some() || !edge.consumers.is_empty() || self.is_output(id) {
            return Err(Error::invalid(format!(
                "edge '{}' is still connected",
                edge.name
            )));
        }
        self.inputs.retain(|&e| e != id);
        self.constants.remove(&id);
        self.edges
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or_else(|| Error::invalid(format!("no edge {id}")))
    }

    /// Remove a single-input, single-output node, connecting the readers of
    /// its output directly to its input.
    pub fn bypass_node(&mut self, id: NodeId) -> Result<()> {
        let node = self.node(id)?;
        let (input, output) = match (node.inputs.as_slice(), node.outputs.as_slice()) {
            ([i], [o]) => (*i, *o),
            _ => {
                return Err(Error::invalid(format!(
                    "node '{}' is not single-input single-output",
                    node.name
                )))
            }
        };
        for c in self.edge(output)?.consumers.clone() {
            self.rewire_input(c, output, input)?;
        }
        if self.is_output(output) {
            self.swap_output(output, input)?;
        }
        self.remove_node(id)?;
        self.remove_edge(output)?;
        Ok(())
    }

    /// Fold `succ` into `head` (fusion). `head` must have a single output
    /// read by `succ` alone; `head` takes over the outputs of `succ` and
    /// appends `extra_inputs` to its own inputs.
    pub fn fold_into(&mut self, head: NodeId, succ: NodeId, extra_inputs: &[EdgeId]) -> Result<()> {
        let link = match self.node(head)?.outputs.as_slice() {
            [o] => *o,
            _ => return Err(Error::invalid("fusion head must have one output")),
        };
        let link_edge = self.edge(link)?;
        if link_edge.consumers != [succ] || self.is_output(link) {
            return Err(Error::invalid(format!(
                "edge '{}' is not private to the fused chain",
                link_edge.name
            )));
        }
        let succ_node = self.remove_node(succ)?;
        for &e in &succ_node.outputs {
            self.edge_mut(e)?.producer = Some(head);
        }
        for &e in extra_inputs {
            let consumers = &mut self.edge_mut(e)?.consumers;
            if !consumers.contains(&head) {
                consumers.push(head);
            }
        }
        let h = self.node_mut(head)?;
        h.outputs = succ_node.outputs;
        h.inputs.extend_from_slice(extra_inputs);
        self.edge_mut(link)?.producer = None;
        self.remove_edge(link)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// x -> relu(a) -> y -> relu(b) -> z
    fn chain() -> (Graph, [EdgeId; 3], [NodeId; 2]) {
        let mut g = Graph::new();
        let x = g.add_edge("x", EdgeKind::Input);
        let y = g.add_edge("y", EdgeKind::Intermediate);
        let z = g.add_edge("z", EdgeKind::Intermediate);
        g.mark_input(x).unwrap();
        let b = g.add_node("b", OpKind::Relu, vec![y], vec![z]).unwrap();
        let a = g.add_node("a", OpKind::Relu, vec![x], vec![y]).unwrap();
        g.mark_output(z).unwrap();
        (g, [x, y, z], [a, b])
    }

    #[test]
    fn test_topo_order_follows_edges() {
        let (g, _, [a, b]) = chain();
        assert_eq!(g.topo_order().unwrap(), vec![a, b]);
    }

    #[test]
    fn test_cycle_detected() {
        let mut g = Graph::new();
        let p = g.add_edge("p", EdgeKind::Intermediate);
        let q = g.add_edge("q", EdgeKind::Intermediate);
        g.add_node("a", OpKind::Relu, vec![q], vec![p]).unwrap();
        g.add_node("b", OpKind::Relu, vec![p], vec![q]).unwrap();
        assert!(g.topo_order().is_err());
    }

    #[test]
    fn test_insert_bridge_rewires_targets_only() {
        let (mut g, [_, y, _], [_, b]) = chain();
        let c = g.add_edge("w", EdgeKind::Intermediate);
        let other = g.add_node("c", OpKind::Relu, vec![y], vec![c]).unwrap();
        let (bridge, ny) = g
            .insert_bridge(y, &[Consumer::Node(b)], OpKind::Relu, "cvt")
            .unwrap();
        assert_eq!(g.node(b).unwrap().inputs, vec![ny]);
        assert_eq!(g.node(other).unwrap().inputs, vec![y]);
        assert_eq!(g.edge(ny).unwrap().producer, Some(bridge));
        assert!(g.edge(y).unwrap().consumers.contains(&bridge));
        assert!(g.topo_order().is_ok());
    }

    #[test]
    fn test_bridge_on_graph_output_moves_name() {
        let (mut g, [_, _, z], _) = chain();
        let (_, nz) = g
            .insert_bridge(z, &[Consumer::GraphOutput], OpKind::Relu, "cvt")
            .unwrap();
        assert_eq!(g.outputs(), &[nz]);
        assert_eq!(g.edge(nz).unwrap().name, "z");
        assert_eq!(g.edge(z).unwrap().desc.kind, EdgeKind::Intermediate);
    }

    #[test]
    fn test_bypass_restores_chain() {
        let (mut g, [_, y, _], [_, b]) = chain();
        let (bridge, ny) = g
            .insert_bridge(y, &[Consumer::Node(b)], OpKind::Relu, "cvt")
            .unwrap();
        g.bypass_node(bridge).unwrap();
        assert_eq!(g.node(b).unwrap().inputs, vec![y]);
        assert!(g.edge(ny).is_err());
        assert_eq!(g.node_count(), 2);
    }

    #[test]
    fn test_fold_into_takes_successor_outputs() {
        let (mut g, [_, y, z], [a, b]) = chain();
        g.fold_into(a, b, &[]).unwrap();
        assert_eq!(g.node(a).unwrap().outputs, vec![z]);
        assert_eq!(g.edge(z).unwrap().producer, Some(a));
        assert!(g.edge(y).is_err());
        assert!(g.node(b).is_err());
        assert_eq!(g.topo_order().unwrap(), vec![a]);
    }

    #[test]
    fn test_fold_refuses_shared_edge() {
        let (mut g, [_, y, _], [a, b]) = chain();
        let w = g.add_edge("w", EdgeKind::Intermediate);
        g.add_node("c", OpKind::Relu, vec![y], vec![w]).unwrap();
        assert!(g.fold_into(a, b, &[]).is_err());
    }
}
