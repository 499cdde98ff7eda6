// Graph compilation pipeline
//
// Turns a source graph into an ordered list of prepared executors. The
// pipeline works on a clone of the source graph, so a failing compile
// leaves the caller's graph untouched.
//
// PASSES (each runs once, in this order):
//
//   1. instantiate            one facade per node on its first capable backend
//   2. infer_shapes           resolve symbolic inputs, propagate shapes
//   3. negotiate              pick one EdgeType per edge, collect bridges
//   4. fuse                   fold conv epilogues declared by the profile
//   5. insert_bridges         materialize bridges as Converter nodes
//   6. select_algorithms      pick a manager and commit its schedule
//   7. materialize_constants  convert weights and constants, build executors
//   8. eliminate_bridges      drop identity converters, final topological sort
//
// Every failure is reported as `Error::Pass { pass, node, .. }` naming the
// pass and the node (or edge) it failed on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use vole_core::{
    DynOfflineManager, EdgeType, Error, HostTensor, Result, RuntimeExecutor, Shape, ShapeEnv,
};
use vole_cpu::{convert_host, BackendProfile, KernelRegistry, KernelRequest};
use vole_ir::{Consumer, EdgeId, Graph, Node, NodeId, OpKind};

use crate::config::{EngineConfig, TuningMode};
use crate::facade::{make_facade, BridgeFacade, OpFacade};
use crate::fusion::fuse;
use crate::negotiate::{negotiate, Negotiation};
use crate::profiler::CompileStats;

/// One node of a compiled graph, ready to execute.
#[derive(Debug)]
pub struct Step {
    pub node: NodeId,
    pub name: String,
    pub backend: String,
    pub algorithm: &'static str,
    /// Debug rendering of the committed schedule parameters.
    pub schedule: Option<String>,
    pub tuned: bool,
    pub executor: Box<dyn RuntimeExecutor>,
    /// Runtime inputs in executor order (weights excluded).
    pub inputs: Vec<EdgeId>,
    pub outputs: Vec<EdgeId>,
    pub scratch_bytes: usize,
}

/// Output of the pipeline: the rewritten graph and its steps in order.
#[derive(Debug)]
pub struct Compiled {
    pub graph: Graph,
    pub steps: Vec<Step>,
    pub stats: CompileStats,
}

struct Chosen {
    backend: String,
    manager: Box<dyn DynOfflineManager>,
    tuned: bool,
}

struct Built {
    backend: String,
    algorithm: &'static str,
    schedule: Option<String>,
    tuned: bool,
    executor: Box<dyn RuntimeExecutor>,
    scratch_bytes: usize,
}

#[derive(Default)]
struct State {
    graph: Graph,
    facades: HashMap<NodeId, Box<dyn OpFacade>>,
    /// Backends each node may run on, in priority order.
    allowed: HashMap<NodeId, Vec<String>>,
    pending: Negotiation,
    chosen: HashMap<NodeId, Chosen>,
    built: HashMap<NodeId, Built>,
    /// Manager sweeps spent on autotuning so far.
    sweeps: usize,
    stats: CompileStats,
}

impl State {
    fn facade(&self, id: NodeId) -> Result<&dyn OpFacade> {
        self.facades
            .get(&id)
            .map(|f| f.as_ref())
            .ok_or_else(|| Error::invalid(format!("node {id} has no facade")))
    }

    /// Input slots of `node` that are read at run time.
    fn runtime_inputs(&self, node: &Node) -> Result<Vec<EdgeId>> {
        let facade = self.facade(node.id)?;
        Ok(node
            .inputs
            .iter()
            .enumerate()
            .filter(|(i, _)| !facade.is_weight(*i))
            .map(|(_, &e)| e)
            .collect())
    }

    fn shapes(&self, edges: &[EdgeId]) -> Result<Vec<Shape>> {
        edges
            .iter()
            .map(|&e| self.graph.edge(e)?.desc.shape().cloned())
            .collect()
    }

    fn typed(&self, edges: &[EdgeId]) -> Result<Vec<(Shape, EdgeType)>> {
        edges
            .iter()
            .map(|&e| {
                let d = &self.graph.edge(e)?.desc;
                Ok((d.shape()?.clone(), d.resolved()?))
            })
            .collect()
    }
}

/// Runs the compilation passes against a fixed set of backends.
pub struct Pipeline<'a> {
    config: &'a EngineConfig,
    registries: &'a [KernelRegistry],
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a EngineConfig, registries: &'a [KernelRegistry]) -> Result<Self> {
        if registries.is_empty() {
            return Err(Error::invalid("no backends to compile for"));
        }
        Ok(Pipeline { config, registries })
    }

    fn registry(&self, name: &str) -> Result<&'a KernelRegistry> {
        self.registries
            .iter()
            .find(|r| r.profile().name() == name)
            .ok_or_else(|| Error::invalid(format!("unknown backend '{name}'")))
    }

    fn profiles(&self) -> Vec<BackendProfile> {
        self.registries.iter().map(|r| r.profile().clone()).collect()
    }

    fn backend_names(&self) -> Vec<String> {
        self.registries
            .iter()
            .map(|r| r.profile().name().to_string())
            .collect()
    }

    /// Compile `source` into ordered, prepared steps.
    pub fn compile(&self, source: &Graph) -> Result<Compiled> {
        let start = Instant::now();
        let mut st = State {
            graph: source.clone(),
            ..State::default()
        };
        st.stats.num_source_nodes = source.node_count();
        log::info!(
            "compiling {} node(s) for {:?}",
            source.node_count(),
            self.backend_names()
        );

        self.instantiate(&mut st)?;
        self.infer_shapes(&mut st)?;

        st.pending = negotiate(&mut st.graph, &st.facades)?;
        log::info!(
            "negotiate: {} bridge(s) pending after {} node visits",
            st.pending.bridges.len(),
            st.pending.visits
        );

        st.stats.num_fused = fuse(
            &mut st.graph,
            &mut st.facades,
            &mut st.pending,
            &self.profiles(),
        )?;
        log::info!("fuse: {} node(s) folded", st.stats.num_fused);

        self.insert_bridges(&mut st)?;
        self.select_algorithms(&mut st)?;
        self.materialize_constants(&mut st)?;
        let steps = self.eliminate_bridges(&mut st)?;

        st.stats.num_nodes = steps.len();
        st.stats.num_bridges = steps
            .iter()
            .filter(|s| matches!(st.graph.node(s.node), Ok(n) if n.op.is_converter()))
            .count();
        st.stats.num_tuned = steps.iter().filter(|s| s.tuned).count();
        st.stats.compile_time_us = start.elapsed().as_micros() as u64;
        Ok(Compiled {
            graph: st.graph,
            steps,
            stats: st.stats,
        })
    }

    // 1. instantiate

    fn instantiate(&self, st: &mut State) -> Result<()> {
        let all = self.backend_names();
        let ids: Vec<NodeId> = st.graph.nodes().map(|n| n.id).collect();
        for id in ids {
            let node = st.graph.node(id)?;
            let allowed = match self.config.assignments.get(&node.name) {
                Some(list) => list.clone(),
                None if !node.backends.is_empty() => node.backends.clone(),
                None => all.clone(),
            };
            let facade = self
                .bind(&node.op, &allowed)
                .map_err(|e| e.in_pass("instantiate", node.name.as_str()))?;
            log::debug!("'{}' bound to {}", node.name, facade.backend());
            st.facades.insert(id, facade);
            st.allowed.insert(id, allowed);
        }
        log::info!("instantiate: {} facade(s)", st.facades.len());
        Ok(())
    }

    fn bind(&self, op: &OpKind, allowed: &[String]) -> Result<Box<dyn OpFacade>> {
        for name in allowed {
            let reg = self.registry(name)?;
            if reg.supports_kind(op) {
                return make_facade(op, reg.profile());
            }
        }
        Err(Error::unsupported(format!(
            "no backend among {allowed:?} supports {op}"
        )))
    }

    // 2. infer_shapes

    fn infer_shapes(&self, st: &mut State) -> Result<()> {
        let env = ShapeEnv::from(&self.config.dims);
        let inputs = st.graph.inputs().to_vec();
        for e in inputs {
            let edge = st.graph.edge_mut(e)?;
            match edge.desc.symbolic.clone() {
                Some(sym) => {
                    let shape = sym
                        .resolve(&env)
                        .map_err(|err| err.in_pass("infer_shapes", edge.name.as_str()))?;
                    edge.desc.shape = Some(shape);
                }
                None if edge.desc.shape.is_some() => {}
                None => {
                    return Err(Error::invalid("graph input has no shape")
                        .in_pass("infer_shapes", edge.name.as_str()))
                }
            }
        }

        for id in st.graph.topo_order()? {
            let name = st.graph.node(id)?.name.clone();
            self.infer_node(st, id)
                .map_err(|e| e.in_pass("infer_shapes", name))?;
        }
        log::info!("infer_shapes: {} edge(s) shaped", st.graph.edge_count());
        Ok(())
    }

    fn infer_node(&self, st: &mut State, id: NodeId) -> Result<()> {
        let node = st.graph.node(id)?;
        let outputs = node.outputs.clone();
        let shapes = st.shapes(&node.inputs)?;
        let inferred = st.facade(id)?.infer_shapes(&shapes)?;
        if inferred.len() != outputs.len() {
            return Err(Error::invalid(format!(
                "{} output shape(s) for {} output edge(s)",
                inferred.len(),
                outputs.len()
            )));
        }
        for (e, s) in outputs.into_iter().zip(inferred) {
            st.graph.edge_mut(e)?.desc.shape = Some(s);
        }
        Ok(())
    }

    // 5. insert_bridges

    fn insert_bridges(&self, st: &mut State) -> Result<()> {
        let pending = std::mem::take(&mut st.pending.bridges);
        let count = pending.len();
        for b in pending {
            let edge_name = st.graph.edge(b.edge)?.name.clone();
            let name = format!("cvt_{}_{}_{}", edge_name, b.to.format, b.to.dtype);
            let backend = self
                .bridge_backend(st, b.edge, &b.consumers)
                .map_err(|e| e.in_pass("insert_bridges", name.as_str()))?;
            let (node, out) = st
                .graph
                .insert_bridge(b.edge, &b.consumers, OpKind::Converter { fill: b.fill }, name.as_str())
                .map_err(|e| e.in_pass("insert_bridges", name.as_str()))?;
            let desc = &mut st.graph.edge_mut(out)?.desc;
            desc.resolved = Some(b.to);
            desc.candidates = vec![b.to];
            log::debug!("bridge '{name}': {} → {} on {backend}", b.from, b.to);

            let mut allowed = vec![backend.clone()];
            allowed.extend(self.backend_names().into_iter().filter(|n| *n != backend));
            st.allowed.insert(node, allowed);
            st.facades
                .insert(node, Box::new(BridgeFacade::new(b.from, b.to, b.fill, backend)));
        }
        log::info!("insert_bridges: {count} converter(s)");
        Ok(())
    }

    /// A bridge runs where its first reader runs, else where its producer does.
    fn bridge_backend(&self, st: &State, edge: EdgeId, consumers: &[Consumer]) -> Result<String> {
        let reader = consumers.iter().find_map(|c| match c {
            Consumer::Node(n) => Some(*n),
            Consumer::GraphOutput => None,
        });
        let owner = reader.or(st.graph.edge(edge)?.producer);
        match owner {
            Some(n) => Ok(st.facade(n)?.backend().to_string()),
            None => Ok(self.registries[0].profile().name().to_string()),
        }
    }

    // 6. select_algorithms

    fn select_algorithms(&self, st: &mut State) -> Result<()> {
        for id in st.graph.topo_order()? {
            let name = st.graph.node(id)?.name.clone();
            let chosen = self
                .select_node(st, id)
                .map_err(|e| e.in_pass("select_algorithms", name.as_str()))?;
            log::debug!(
                "'{name}': {} on {} {}",
                chosen.manager.algorithm(),
                chosen.backend,
                chosen.manager.describe_schedule().unwrap_or_default()
            );
            st.chosen.insert(id, chosen);
        }
        log::info!(
            "select_algorithms: {} node(s), {} tuning sweep(s)",
            st.chosen.len(),
            st.sweeps
        );
        Ok(())
    }

    fn select_node(&self, st: &mut State, id: NodeId) -> Result<Chosen> {
        let node = st.graph.node(id)?;
        let name = node.name.clone();
        let req = KernelRequest {
            op: node.op.clone(),
            inputs: st.typed(&node.inputs)?,
            outputs: st.typed(&node.outputs)?,
        };
        let src = st.shapes(&st.runtime_inputs(node)?)?;
        let facade = st.facade(id)?;
        let weights = facade.weight_inputs();
        let own = facade.backend().to_string();

        let mut order = vec![own.clone()];
        for b in st.allowed.get(&id).cloned().unwrap_or_default() {
            if b != own && self.accepts_on(&b, &req, &weights)? {
                order.push(b);
            }
        }

        for backend in order {
            let managers = match self.registry(&backend)?.managers(&req) {
                Ok(m) => m,
                Err(e) if e.is_unsupported() => {
                    log::warn!("'{name}': {backend} cannot run it: {e}");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let supported: Vec<Box<dyn DynOfflineManager>> =
                managers.into_iter().filter(|m| m.is_supported()).collect();
            if supported.is_empty() {
                log::warn!("'{name}': no algorithm on {backend} supports it");
                continue;
            }
            if backend != own {
                log::warn!("'{name}': falling back from {own} to {backend}");
            }
            let (manager, tuned) = self.choose(supported, &src, &mut st.sweeps)?;
            return Ok(Chosen {
                backend,
                manager,
                tuned,
            });
        }
        let types: Vec<String> = req.inputs.iter().map(|(_, t)| t.to_string()).collect();
        Err(Error::unsupported(format!(
            "no backend can run {} on [{}]",
            req.op,
            types.join(", ")
        )))
    }

    /// Whether `backend` reads the negotiated types of every runtime input.
    fn accepts_on(&self, backend: &str, req: &KernelRequest, weights: &[usize]) -> Result<bool> {
        let reg = self.registry(backend)?;
        if !reg.supports_kind(&req.op) {
            return Ok(false);
        }
        let Ok(facade) = make_facade(&req.op, reg.profile()) else {
            return Ok(false);
        };
        let shapes: Vec<Shape> = req.inputs.iter().map(|(s, _)| s.clone()).collect();
        Ok(req.inputs.iter().enumerate().all(|(i, (_, ty))| {
            if weights.contains(&i) {
                return true;
            }
            let acc = facade.accepts(i, &shapes, &[]);
            acc.is_empty() || acc.contains(ty)
        }))
    }

    /// Autotune while the budget lasts, otherwise take the first heuristic.
    fn choose(
        &self,
        mut managers: Vec<Box<dyn DynOfflineManager>>,
        src: &[Shape],
        sweeps: &mut usize,
    ) -> Result<(Box<dyn DynOfflineManager>, bool)> {
        if let TuningMode::Autotune { budget } = self.config.tuning {
            let mut best: Option<(usize, Duration)> = None;
            for (i, m) in managers.iter_mut().enumerate() {
                if *sweeps >= budget {
                    break;
                }
                *sweeps += 1;
                match m.tune(src, &self.config.tune) {
                    Ok(t) if best.map_or(true, |(_, b)| t < b) => best = Some((i, t)),
                    Ok(_) => {}
                    Err(e) => log::debug!("{} dropped from tuning: {e}", m.algorithm()),
                }
            }
            if let Some((i, t)) = best {
                log::debug!("{} won in {t:?}", managers[i].algorithm());
                return Ok((managers.swap_remove(i), true));
            }
        }
        let mut first = managers
            .into_iter()
            .next()
            .ok_or_else(|| Error::unsupported("no algorithm to choose from"))?;
        first.fast_init_schedule_param()?;
        Ok((first, false))
    }

    // 7. materialize_constants

    fn materialize_constants(&self, st: &mut State) -> Result<()> {
        let order = st.graph.topo_order()?;

        // weights first, from the raw constants
        for &id in &order {
            let node = st.graph.node(id)?;
            let Some(chosen) = st.chosen.get_mut(&id) else {
                continue;
            };
            if !chosen.manager.needs_weights() {
                continue;
            }
            let facade = st
                .facades
                .get(&id)
                .ok_or_else(|| Error::invalid(format!("node {id} has no facade")))?;
            let weights = facade.weight_inputs();
            let filter = weight(&st.graph, node, weights.first().copied())?;
            let bias = match weights.get(1) {
                Some(&slot) => Some(weight(&st.graph, node, Some(slot))?),
                None => None,
            };
            chosen
                .manager
                .gen_cvt_weights(&filter, bias.as_deref())
                .map_err(|e| e.in_pass("materialize_constants", node.name.as_str()))?;
        }

        // other constants are stored in their negotiated type
        let pool = self.registries[0].context().pool();
        let consts: Vec<EdgeId> = st
            .graph
            .edges()
            .map(|e| e.id)
            .filter(|&e| st.graph.is_constant(e))
            .collect();
        let mut converted = 0;
        for e in consts {
            let edge = st.graph.edge(e)?;
            let mut fill = None;
            for &c in &edge.consumers {
                let reader = st.graph.node(c)?;
                let facade = st.facade(c)?;
                for (slot, &i) in reader.inputs.iter().enumerate() {
                    if i == e && !facade.is_weight(slot) && fill.is_none() {
                        fill = Some(facade.pad_fill(slot));
                    }
                }
            }
            let Some(fill) = fill else {
                continue;
            };
            let target = edge.desc.resolved()?;
            let name = edge.name.clone();
            let raw = st
                .graph
                .constant(e)
                .cloned()
                .ok_or_else(|| Error::invalid(format!("constant '{name}' has no data")))?;
            if raw.ty() != target {
                let value = convert_host(&raw, target, fill, pool)
                    .map_err(|err| err.in_pass("materialize_constants", name.as_str()))?;
                st.graph.replace_constant(e, value)?;
                converted += 1;
            }
        }

        for &id in &order {
            let Some(chosen) = st.chosen.remove(&id) else {
                continue;
            };
            let node = st.graph.node(id)?;
            let name = node.name.clone();
            let built = self
                .build(st, node, chosen)
                .map_err(|e| e.in_pass("materialize_constants", name))?;
            st.built.insert(id, built);
        }
        log::info!(
            "materialize_constants: {converted} constant(s) converted, {} executor(s) prepared",
            st.built.len()
        );
        Ok(())
    }

    fn build(&self, st: &State, node: &Node, chosen: Chosen) -> Result<Built> {
        let src = st.shapes(&st.runtime_inputs(node)?)?;
        let dst = st.shapes(&node.outputs)?;
        let mut executor = chosen.manager.gen_executor()?;
        executor.set_shapes(src, dst);
        executor.prepare()?;
        let scratch_bytes = executor.cal_temp_buffer_size()?;
        Ok(Built {
            backend: chosen.backend,
            algorithm: chosen.manager.algorithm(),
            schedule: chosen.manager.describe_schedule(),
            tuned: chosen.tuned,
            executor,
            scratch_bytes,
        })
    }

    // 8. eliminate_bridges + sort

    fn eliminate_bridges(&self, st: &mut State) -> Result<Vec<Step>> {
        let removed = eliminate_identity_bridges(&mut st.graph)?;
        for id in &removed {
            st.built.remove(id);
            st.facades.remove(id);
        }
        log::info!("eliminate_bridges: {} identity converter(s) removed", removed.len());

        let mut steps = Vec::with_capacity(st.built.len());
        for id in st.graph.topo_order()? {
            let node = st.graph.node(id)?;
            let built = st
                .built
                .remove(&id)
                .ok_or_else(|| Error::invalid(format!("node '{}' was never built", node.name)))?;
            steps.push(Step {
                node: id,
                name: node.name.clone(),
                backend: built.backend,
                algorithm: built.algorithm,
                schedule: built.schedule,
                tuned: built.tuned,
                executor: built.executor,
                inputs: st.runtime_inputs(node)?,
                outputs: node.outputs.clone(),
                scratch_bytes: built.scratch_bytes,
            });
        }
        Ok(steps)
    }
}

fn weight(graph: &Graph, node: &Node, slot: Option<usize>) -> Result<Arc<HostTensor>> {
    slot.and_then(|s| node.inputs.get(s))
        .and_then(|&e| graph.constant(e).cloned())
        .ok_or_else(|| {
            Error::unsupported(format!("weights of '{}' must be graph constants", node.name))
        })
}

/// Remove Converter nodes whose input and output types are equal. Returns
/// the removed nodes.
pub fn eliminate_identity_bridges(graph: &mut Graph) -> Result<Vec<NodeId>> {
    let bridges: Vec<NodeId> = graph
        .nodes()
        .filter(|n| n.op.is_converter())
        .map(|n| n.id)
        .collect();
    let mut removed = Vec::new();
    for id in bridges {
        let node = graph.node(id)?;
        let (input, output) = match (node.inputs.as_slice(), node.outputs.as_slice()) {
            ([i], [o]) => (*i, *o),
            _ => continue,
        };
        let same = graph.edge(input)?.desc.resolved.is_some()
            && graph.edge(input)?.desc.resolved == graph.edge(output)?.desc.resolved;
        if same {
            let name = node.name.clone();
            graph
                .bypass_node(id)
                .map_err(|e| e.in_pass("eliminate_bridges", name))?;
            removed.push(id);
        }
    }
    Ok(removed)
}
