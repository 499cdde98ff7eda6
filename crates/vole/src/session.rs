// Engine and Session — compile once, run many times
//
// An Engine owns the backends (one KernelRegistry per configured profile,
// all sharing one EngineContext). `Engine::compile` runs the pipeline, plans
// the arena and returns a Session. A Session holds everything a run needs:
//
//   steps      prepared executors in topological order
//   arena      one allocator Block for every activation and scratch slice
//   constants  converted constant operands read at run time
//
// `Session::run` copies the feeds into the arena, executes each step on
// disjoint arena slices carved for it, and copies the graph outputs out.

use std::collections::HashMap;
use std::sync::Arc;

use vole_core::{
    Block, EdgeType, EngineContext, Error, ExecArgs, HostTensor, Result, TensorMut, TensorRef,
};
use vole_cpu::KernelRegistry;
use vole_ir::{EdgeId, Graph};

use crate::config::EngineConfig;
use crate::pipeline::{Pipeline, Step};
use crate::planner::{carve_regions, plan_memory, BufferKey, BufferLifetime, MemoryPlan};
use crate::profiler::{CompileStats, ProfileReport, Profiler};

/// Compiles graphs for a fixed set of backends.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    ctx: EngineContext,
    registries: Vec<KernelRegistry>,
}

impl Engine {
    /// Engine on the host allocator, wall clock and `config.workers` threads.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let ctx = EngineContext::host(config.workers)?;
        Self::with_context(config, ctx)
    }

    /// Engine on a caller-provided context (custom allocator or clock).
    pub fn with_context(config: EngineConfig, ctx: EngineContext) -> Result<Self> {
        config.validate()?;
        let registries = config
            .backend_profiles()
            .into_iter()
            .map(|p| KernelRegistry::new(p, ctx.clone()))
            .collect();
        Ok(Engine {
            config,
            ctx,
            registries,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn registries(&self) -> &[KernelRegistry] {
        &self.registries
    }

    /// Compile `graph`. The graph itself is not modified.
    pub fn compile(&self, graph: &Graph) -> Result<Session> {
        let compiled = Pipeline::new(&self.config, &self.registries)?.compile(graph)?;
        let mut stats = compiled.stats;
        let graph = compiled.graph;
        let steps = compiled.steps;

        let buffers = lifetimes(&graph, &steps)?;
        let plan = plan_memory(&buffers)?;
        let arena = self.ctx.allocator().alloc(plan.total)?;
        stats.num_buffers = plan.len();
        stats.arena_bytes = plan.total;
        log::info!("{stats}");

        let mut constants = HashMap::new();
        for step in &steps {
            for &e in &step.inputs {
                if let Some(c) = graph.constant(e) {
                    constants.insert(e, Arc::clone(c));
                }
            }
        }
        for &e in graph.outputs() {
            if let Some(c) = graph.constant(e) {
                constants.insert(e, Arc::clone(c));
            }
        }

        let named = |ids: &[EdgeId]| -> Result<Vec<(String, EdgeId)>> {
            ids.iter()
                .map(|&e| Ok((graph.edge(e)?.name.clone(), e)))
                .collect()
        };
        let inputs = named(graph.inputs())?;
        let outputs = named(graph.outputs())?;

        Ok(Session {
            inputs,
            outputs,
            graph,
            steps,
            plan,
            arena,
            constants,
            ctx: self.ctx.clone(),
            stats,
            profiler: self.config.profiling.then(Profiler::new),
        })
    }
}

/// Arena lifetimes of every runtime tensor and scratch buffer.
fn lifetimes(graph: &Graph, steps: &[Step]) -> Result<Vec<BufferLifetime>> {
    let end = steps.len();
    let mut first: HashMap<EdgeId, usize> = HashMap::new();
    let mut last: HashMap<EdgeId, usize> = HashMap::new();
    for &e in graph.inputs() {
        first.insert(e, 0);
        last.insert(e, 0);
    }
    for (s, step) in steps.iter().enumerate() {
        for &e in &step.outputs {
            first.insert(e, s);
            last.entry(e).or_insert(s);
        }
        for &e in &step.inputs {
            if !graph.is_constant(e) {
                let l = last.entry(e).or_insert(s);
                *l = (*l).max(s);
            }
        }
    }
    for &e in graph.outputs() {
        if !graph.is_constant(e) {
            last.insert(e, end);
        }
    }

    let mut out = Vec::with_capacity(first.len() + steps.len());
    for (&e, &f) in &first {
        let desc = &graph.edge(e)?.desc;
        out.push(BufferLifetime {
            key: BufferKey::Edge(e),
            bytes: desc.resolved()?.storage_bytes(desc.shape()?),
            first: f,
            last: last.get(&e).copied().unwrap_or(f),
        });
    }
    for (s, step) in steps.iter().enumerate() {
        out.push(BufferLifetime {
            key: BufferKey::Scratch(s),
            bytes: step.scratch_bytes,
            first: s,
            last: s,
        });
    }
    Ok(out)
}

/// A compiled graph, ready to run.
#[derive(Debug)]
pub struct Session {
    graph: Graph,
    steps: Vec<Step>,
    plan: MemoryPlan,
    arena: Block,
    constants: HashMap<EdgeId, Arc<HostTensor>>,
    inputs: Vec<(String, EdgeId)>,
    outputs: Vec<(String, EdgeId)>,
    ctx: EngineContext,
    stats: CompileStats,
    profiler: Option<Profiler>,
}

impl Session {
    pub fn stats(&self) -> &CompileStats {
        &self.stats
    }

    /// Per-node timings of every run so far; empty unless profiling is on.
    pub fn profile(&self) -> ProfileReport {
        self.profiler
            .as_ref()
            .map(Profiler::report)
            .unwrap_or_default()
    }

    pub fn clear_profile(&mut self) {
        if let Some(p) = &mut self.profiler {
            p.clear();
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// The graph after compilation (fused, bridged, types resolved).
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(|(n, _)| n.as_str())
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|(n, _)| n.as_str())
    }

    /// Shape and type a feed named `name` must have.
    pub fn input_spec(&self, name: &str) -> Result<(vole_core::Shape, EdgeType)> {
        let &(_, e) = self
            .inputs
            .iter()
            .find(|(n, _)| n == name)
            .ok_or_else(|| Error::invalid(format!("no graph input '{name}'")))?;
        let desc = &self.graph.edge(e)?.desc;
        Ok((desc.shape()?.clone(), desc.resolved()?))
    }

    /// Run the graph on `feeds` (one tensor per graph input, by name).
    pub fn run(&mut self, feeds: &HashMap<String, HostTensor>) -> Result<HashMap<String, HostTensor>> {
        if let Some(extra) = feeds.keys().find(|k| !self.inputs.iter().any(|(n, _)| n == *k)) {
            return Err(Error::invalid(format!("unknown input '{extra}'")));
        }
        for (name, e) in &self.inputs {
            let feed = feeds
                .get(name)
                .ok_or_else(|| Error::invalid(format!("missing input '{name}'")))?;
            let desc = &self.graph.edge(*e)?.desc;
            let shape = desc.shape()?;
            if feed.shape() != shape {
                return Err(Error::ShapeMismatch {
                    expected: shape.clone(),
                    got: feed.shape().clone(),
                });
            }
            let ty = desc.resolved()?;
            if feed.ty() != ty {
                return Err(Error::invalid(format!(
                    "input '{name}' must be {ty}, got {}",
                    feed.ty()
                )));
            }
            let r = self.plan.region(BufferKey::Edge(*e))?;
            let dst = self
                .arena
                .as_bytes_mut()
                .get_mut(r.offset..r.end())
                .ok_or(Error::IndexOutOfBounds {
                    index: r.end(),
                    len: self.plan.total,
                })?;
            if dst.len() != feed.bytes().len() {
                return Err(Error::invalid(format!(
                    "input '{name}' has {} bytes, its arena region {}",
                    feed.bytes().len(),
                    dst.len()
                )));
            }
            dst.copy_from_slice(feed.bytes());
        }

        for s in 0..self.steps.len() {
            self.run_step(s)?;
        }

        let mut out = HashMap::with_capacity(self.outputs.len());
        for (name, e) in &self.outputs {
            if let Some(c) = self.constants.get(e) {
                out.insert(name.clone(), HostTensor::clone(c));
                continue;
            }
            let desc = &self.graph.edge(*e)?.desc;
            let r = self.plan.region(BufferKey::Edge(*e))?;
            let bytes = self
                .arena
                .as_bytes()
                .get(r.offset..r.end())
                .ok_or(Error::IndexOutOfBounds {
                    index: r.end(),
                    len: self.plan.total,
                })?;
            let t = HostTensor::from_bytes(bytes, desc.shape()?.clone(), desc.resolved()?)?;
            out.insert(name.clone(), t);
        }
        Ok(out)
    }

    fn run_step(&mut self, s: usize) -> Result<()> {
        let step = &self.steps[s];
        let resolved = |e: EdgeId| -> Result<EdgeType> { self.graph.edge(e)?.desc.resolved() };

        let mut keys = Vec::new();
        for &e in &step.inputs {
            let k = BufferKey::Edge(e);
            if !self.constants.contains_key(&e) && !keys.contains(&k) {
                keys.push(k);
            }
        }
        let n_in = keys.len();
        keys.extend(step.outputs.iter().map(|&e| BufferKey::Edge(e)));
        keys.push(BufferKey::Scratch(s));
        let regions = keys
            .iter()
            .map(|&k| self.plan.region(k))
            .collect::<Result<Vec<_>>>()?;

        let parts = carve_regions(self.arena.as_bytes_mut(), &regions)?;
        let mut reads: HashMap<EdgeId, &[u8]> = HashMap::new();
        let mut writes = Vec::with_capacity(step.outputs.len());
        let mut scratch: &mut [u8] = &mut [];
        for (i, (k, part)) in keys.iter().zip(parts).enumerate() {
            match k {
                BufferKey::Edge(e) if i < n_in => {
                    reads.insert(*e, part);
                }
                BufferKey::Edge(e) => writes.push(TensorMut::new(part, resolved(*e)?)),
                BufferKey::Scratch(_) => scratch = part,
            }
        }

        let mut inputs = Vec::with_capacity(step.inputs.len());
        for &e in &step.inputs {
            let t = match self.constants.get(&e) {
                Some(c) => TensorRef::new(c.bytes(), c.ty()),
                None => {
                    let bytes = reads
                        .get(&e)
                        .copied()
                        .ok_or_else(|| Error::msg(format!("edge {e} was not carved")))?;
                    TensorRef::new(bytes, resolved(e)?)
                }
            };
            inputs.push(t);
        }

        let args = ExecArgs {
            inputs,
            outputs: writes,
            scratch,
            pool: self.ctx.pool(),
        };
        let result = match &mut self.profiler {
            Some(p) => p.measure(self.ctx.clock(), &step.name, step.algorithm, || {
                step.executor.execute(args)
            }),
            None => step.executor.execute(args),
        };
        if let Err(e) = &result {
            log::error!("step '{}' ({}) failed: {e}", step.name, step.algorithm);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vole_core::{DType, RuntimeExecutor, Shape};
    use vole_ir::{GraphBuilder, OpKind};

    fn relu_graph() -> Graph {
        let mut b = GraphBuilder::new();
        b.input("x", Shape::from((2, 3)), DType::F32).unwrap();
        b.node("r", OpKind::Relu, &["x"], &["y"]).unwrap();
        b.output("y").unwrap();
        b.build().unwrap()
    }

    fn engine() -> Engine {
        Engine::new(EngineConfig::default().with_workers(1)).unwrap()
    }

    #[test]
    fn test_run_checks_feeds() {
        let mut s = engine().compile(&relu_graph()).unwrap();
        let good = HostTensor::from_vec(vec![0.0f32; 6], (2, 3)).unwrap();
        let bad_shape = HostTensor::from_vec(vec![0.0f32; 4], (2, 2)).unwrap();

        let mut feeds = HashMap::new();
        assert!(s.run(&feeds).is_err());
        feeds.insert("x".to_string(), bad_shape);
        assert!(matches!(s.run(&feeds), Err(Error::ShapeMismatch { .. })));
        feeds.insert("x".to_string(), good.clone());
        feeds.insert("z".to_string(), good);
        assert!(s.run(&feeds).is_err());
    }

    #[test]
    fn test_relu_runs_twice_identically() {
        let mut s = engine().compile(&relu_graph()).unwrap();
        let x = HostTensor::from_vec(vec![-1.0f32, 2.0, -3.0, 4.0, 0.5, -0.5], (2, 3)).unwrap();
        let feeds = HashMap::from([("x".to_string(), x)]);
        let a = s.run(&feeds).unwrap();
        let b = s.run(&feeds).unwrap();
        assert_eq!(
            a["y"].to_vec::<f32>().unwrap(),
            vec![0.0, 2.0, 0.0, 4.0, 0.5, 0.0]
        );
        assert_eq!(a["y"].bytes(), b["y"].bytes());
    }

    #[test]
    fn test_input_spec_and_names() {
        let s = engine().compile(&relu_graph()).unwrap();
        assert_eq!(s.input_names().collect::<Vec<_>>(), vec!["x"]);
        assert_eq!(s.output_names().collect::<Vec<_>>(), vec!["y"]);
        let (shape, ty) = s.input_spec("x").unwrap();
        assert_eq!(shape, Shape::from((2, 3)));
        assert_eq!(ty, EdgeType::ndarray(DType::F32));
        assert!(s.input_spec("nope").is_err());
    }

    #[derive(Debug)]
    struct Refusing;

    impl RuntimeExecutor for Refusing {
        fn algorithm(&self) -> &'static str {
            "refusing"
        }
        fn set_shapes(&mut self, _src: Vec<Shape>, _dst: Vec<Shape>) {}
        fn cal_temp_buffer_size(&self) -> Result<usize> {
            Ok(0)
        }
        fn prepare(&mut self) -> Result<()> {
            Ok(())
        }
        fn execute(&self, _args: ExecArgs<'_>) -> Result<()> {
            Err(Error::unsupported("kernel gap"))
        }
        fn is_ready(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_executor_error_reaches_caller_unchanged() {
        let mut s = engine().compile(&relu_graph()).unwrap();
        s.steps[0].executor = Box::new(Refusing);
        let x = HostTensor::from_vec(vec![0.0f32; 6], (2, 3)).unwrap();
        let feeds = HashMap::from([("x".to_string(), x)]);
        let err = s.run(&feeds).unwrap_err();
        assert!(matches!(&err, Error::Unsupported(m) if m == "kernel gap"));
        assert_eq!(err.status(), vole_core::Status::Unsupported);
    }

    #[test]
    fn test_profile_is_empty_when_disabled() {
        let s = engine().compile(&relu_graph()).unwrap();
        assert!(s.profile().entries.is_empty());
    }
}
