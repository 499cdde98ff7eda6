// Format/type negotiation
//
// Narrows every edge from "whatever its producer can emit" to exactly one
// EdgeType, and records the bridges (conversions) needed where a producer
// and its readers cannot agree.
//
// WORKFLOW:
//
//   1. Backward sweep (reverse topological order): every node computes the
//      accept set of each of its inputs. The hint handed to a node is what
//      the readers of its first output accept, which were computed earlier
//      in the same sweep.
//
//   2. Forward sweep (topological order): edges without a producer (graph
//      inputs, constants) are resolved first, then each node checks its
//      dynamic constraints and resolves its outputs from the candidates it
//      offers for the input types it actually receives.
//
// Each node is visited once per sweep. There is no fixpoint iteration.
//
// RESOLVING ONE EDGE:
//
//   - The first producer candidate every reader accepts wins; no bridge.
//   - Otherwise the candidate accepted by the most readers wins (ties go
//     to producer order), and each rejecting reader is bridged to a type
//     from its own accept set, preferring the chosen element type so the
//     bridge only changes layout. Readers that need the same target share
//     one bridge.
//
// A graph output is a reader whose accept set is its declared type, or any
// planar type when none was declared.

use std::collections::HashMap;

use vole_core::{DType, EdgeType, Error, PadFill, Result, Shape};
use vole_ir::{Consumer, EdgeId, EdgeKind, Graph, NodeId};

use crate::facade::OpFacade;

/// A conversion to be materialized by `insert_bridges`.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingBridge {
    pub edge: EdgeId,
    pub from: EdgeType,
    pub to: EdgeType,
    /// Identity written into padded lanes of the converted tensor.
    pub fill: PadFill,
    pub consumers: Vec<Consumer>,
}

/// Outcome of negotiation.
#[derive(Debug, Clone, Default)]
pub struct Negotiation {
    pub bridges: Vec<PendingBridge>,
    /// Node visits over both sweeps.
    pub visits: usize,
}

impl Negotiation {
    /// Whether any bridge starts at `edge`.
    pub fn bridges_edge(&self, edge: EdgeId) -> bool {
        self.bridges.iter().any(|b| b.edge == edge)
    }

    fn record(&mut self, edge: EdgeId, from: EdgeType, to: EdgeType, fill: PadFill, who: Consumer) {
        for b in self.bridges.iter_mut().filter(|b| b.edge == edge) {
            b.consumers.retain(|&c| c != who);
        }
        self.bridges.retain(|b| !b.consumers.is_empty());
        match self.bridges.iter_mut().find(|b| b.edge == edge && b.to == to) {
            Some(b) => b.consumers.push(who),
            None => self.bridges.push(PendingBridge {
                edge,
                from,
                to,
                fill,
                consumers: vec![who],
            }),
        }
    }
}

const PLANAR_DTYPES: [DType; 7] = [
    DType::F32,
    DType::F16,
    DType::BF16,
    DType::F64,
    DType::I64,
    DType::U32,
    DType::U8,
];

fn output_accepts(required: Option<EdgeType>) -> Vec<EdgeType> {
    match required {
        Some(t) => vec![t],
        None => PLANAR_DTYPES.iter().map(|&d| EdgeType::ndarray(d)).collect(),
    }
}

fn accepted(set: &[EdgeType], t: EdgeType) -> bool {
    set.is_empty() || set.contains(&t)
}

/// Ordered intersection of the non-empty sets; the first set when they
/// share nothing.
fn combine(sets: &[&Vec<EdgeType>]) -> Vec<EdgeType> {
    let mut nonempty = sets.iter().filter(|s| !s.is_empty());
    let Some(first) = nonempty.next() else {
        return Vec::new();
    };
    let rest: Vec<_> = nonempty.collect();
    let common: Vec<EdgeType> = first
        .iter()
        .copied()
        .filter(|t| rest.iter().all(|s| s.contains(t)))
        .collect();
    if common.is_empty() {
        first.to_vec()
    } else {
        common
    }
}

struct Reader {
    who: Consumer,
    /// Input slots of the reading node (empty for a graph output).
    slots: Vec<usize>,
    accepts: Vec<EdgeType>,
    fill: PadFill,
}

struct Negotiator<'a> {
    facades: &'a HashMap<NodeId, Box<dyn OpFacade>>,
    accept: HashMap<(NodeId, usize), Vec<EdgeType>>,
    effective: HashMap<(NodeId, usize), EdgeType>,
    out: Negotiation,
}

impl<'a> Negotiator<'a> {
    fn facade(&self, id: NodeId) -> Result<&'a dyn OpFacade> {
        self.facades
            .get(&id)
            .map(|f| f.as_ref())
            .ok_or_else(|| Error::invalid(format!("node {id} has no facade")))
    }

    fn input_shapes(graph: &Graph, id: NodeId) -> Result<Vec<Shape>> {
        graph
            .node(id)?
            .inputs
            .iter()
            .map(|&e| graph.edge(e)?.desc.shape().cloned())
            .collect()
    }

    fn readers(&self, graph: &Graph, e: EdgeId) -> Result<Vec<Reader>> {
        let mut out = Vec::new();
        for who in graph.readers(e)? {
            match who {
                Consumer::Node(c) => {
                    let node = graph.node(c)?;
                    let slots: Vec<usize> = node
                        .inputs
                        .iter()
                        .enumerate()
                        .filter(|(_, i)| **i == e)
                        .map(|(j, _)| j)
                        .collect();
                    let empty = Vec::new();
                    let sets: Vec<&Vec<EdgeType>> = slots
                        .iter()
                        .map(|&j| self.accept.get(&(c, j)).unwrap_or(&empty))
                        .collect();
                    let fill = match slots.first() {
                        Some(&j) => self.facade(c)?.pad_fill(j),
                        None => PadFill::Zero,
                    };
                    out.push(Reader {
                        who,
                        accepts: combine(&sets),
                        slots,
                        fill,
                    });
                }
                Consumer::GraphOutput => out.push(Reader {
                    who,
                    slots: Vec::new(),
                    accepts: output_accepts(graph.edge(e)?.desc.required),
                    fill: PadFill::Zero,
                }),
            }
        }
        Ok(out)
    }

    /// What the readers of `e` accept, in reader order.
    fn wanted(&self, graph: &Graph, e: EdgeId) -> Result<Vec<EdgeType>> {
        let mut hint = Vec::new();
        for r in self.readers(graph, e)? {
            for t in r.accepts {
                if !hint.contains(&t) {
                    hint.push(t);
                }
            }
        }
        Ok(hint)
    }

    fn backward(&mut self, graph: &Graph, order: &[NodeId]) -> Result<()> {
        for &id in order.iter().rev() {
            self.out.visits += 1;
            let name = graph.node(id)?.name.clone();
            self.visit_backward(graph, id)
                .map_err(|e| e.in_pass("negotiate", name))?;
        }
        Ok(())
    }

    fn visit_backward(&mut self, graph: &Graph, id: NodeId) -> Result<()> {
        let node = graph.node(id)?;
        let facade = self.facade(id)?;
        let shapes = Self::input_shapes(graph, id)?;
        let hint = match node.outputs.first() {
            Some(&o) => self.wanted(graph, o)?,
            None => Vec::new(),
        };
        for i in 0..node.inputs.len() {
            self.accept.insert((id, i), facade.accepts(i, &shapes, &hint));
        }
        Ok(())
    }

    fn resolve(&mut self, graph: &mut Graph, e: EdgeId, candidates: Vec<EdgeType>) -> Result<()> {
        let name = graph.edge(e)?.name.clone();
        if candidates.is_empty() {
            return Err(Error::unsupported(format!(
                "no type can be produced for edge '{name}'"
            )));
        }
        let readers = self.readers(graph, e)?;
        let votes = |t: EdgeType| readers.iter().filter(|r| accepted(&r.accepts, t)).count();

        let chosen = match candidates.iter().copied().find(|&t| votes(t) == readers.len()) {
            Some(t) => t,
            None => {
                let mut best = candidates[0];
                for &t in &candidates[1..] {
                    if votes(t) > votes(best) {
                        best = t;
                    }
                }
                best
            }
        };

        for r in &readers {
            let target = if accepted(&r.accepts, chosen) {
                chosen
            } else {
                let t = r
                    .accepts
                    .iter()
                    .copied()
                    .find(|t| t.dtype == chosen.dtype)
                    .unwrap_or(r.accepts[0]);
                log::debug!("edge '{name}': {chosen} → {t} for {:?}", r.who);
                self.out.record(e, chosen, t, r.fill, r.who);
                t
            };
            if let Consumer::Node(c) = r.who {
                for &j in &r.slots {
                    self.effective.insert((c, j), target);
                }
            }
        }

        let desc = &mut graph.edge_mut(e)?.desc;
        desc.candidates = candidates;
        desc.resolved = Some(chosen);
        Ok(())
    }

    /// Source edges: graph inputs keep their feed type, constants take what
    /// their readers want (materialized at compile time).
    fn resolve_sources(&mut self, graph: &mut Graph) -> Result<()> {
        let sources: Vec<(EdgeId, EdgeKind, Option<EdgeType>)> = graph
            .edges()
            .filter(|e| e.producer.is_none())
            .map(|e| (e.id, e.desc.kind, e.desc.required))
            .collect();
        for (e, kind, required) in sources {
            let name = graph.edge(e)?.name.clone();
            let own = required
                .ok_or_else(|| Error::invalid(format!("source edge '{name}' has no type")))?;
            let candidates = match kind {
                EdgeKind::Constant => {
                    // readers that take anything (weights) leave it raw
                    let mut c = self.wanted(graph, e)?;
                    if !c.contains(&own) {
                        c.push(own);
                    }
                    c
                }
                _ => vec![own],
            };
            self.resolve(graph, e, candidates)
                .map_err(|err| err.in_pass("negotiate", name))?;
        }
        Ok(())
    }

    fn forward(&mut self, graph: &mut Graph, order: &[NodeId]) -> Result<()> {
        self.resolve_sources(graph)?;
        for &id in order {
            self.out.visits += 1;
            let name = graph.node(id)?.name.clone();
            self.visit_forward(graph, id)
                .map_err(|e| e.in_pass("negotiate", name))?;
        }
        Ok(())
    }

    fn visit_forward(&mut self, graph: &mut Graph, id: NodeId) -> Result<()> {
        let facade = self.facade(id)?;
        let (inputs, outputs) = {
            let n = graph.node(id)?;
            (n.inputs.clone(), n.outputs.clone())
        };
        let shapes = Self::input_shapes(graph, id)?;
        let mut types = Vec::with_capacity(inputs.len());
        for (i, &e) in inputs.iter().enumerate() {
            let t = match self.effective.get(&(id, i)) {
                Some(&t) => t,
                None => graph.edge(e)?.desc.resolved()?,
            };
            types.push(t);
        }

        for (i, &e) in inputs.iter().enumerate() {
            let Some(need) = facade.constraint(i, &types) else {
                continue;
            };
            if types[i] == need {
                continue;
            }
            let from = graph.edge(e)?.desc.resolved()?;
            if from == need {
                // an earlier bridge for this reader is no longer needed
                for b in self.out.bridges.iter_mut().filter(|b| b.edge == e) {
                    b.consumers.retain(|&c| c != Consumer::Node(id));
                }
                self.out.bridges.retain(|b| !b.consumers.is_empty());
            } else {
                self.out
                    .record(e, from, need, facade.pad_fill(i), Consumer::Node(id));
            }
            for (j, &other) in inputs.iter().enumerate() {
                if other == e {
                    self.effective.insert((id, j), need);
                    types[j] = need;
                }
            }
        }

        for (k, &o) in outputs.iter().enumerate() {
            let candidates = facade.offers(k, &shapes, &types);
            self.resolve(graph, o, candidates)?;
        }
        Ok(())
    }
}

/// Resolve every edge of `graph` to one type and collect the bridges.
///
/// Errors are attributed to the node being visited.
pub fn negotiate(
    graph: &mut Graph,
    facades: &HashMap<NodeId, Box<dyn OpFacade>>,
) -> Result<Negotiation> {
    let order = graph.topo_order()?;
    let mut n = Negotiator {
        facades,
        accept: HashMap::new(),
        effective: HashMap::new(),
        out: Negotiation::default(),
    };
    n.backward(graph, &order)?;
    n.forward(graph, &order)?;
    Ok(n.out)
}
