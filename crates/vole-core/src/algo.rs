// Operator lifecycle — Offline Manager and Runtime Executor
//
// Every compute strategy is driven through the same two objects.
//
// OFFLINE MANAGER (one per node, compile time):
//
//   1. is_supported()               static attributes only, no shapes
//   2. fast_init_schedule_param()   O(1) heuristic default, or
//      pick_best_schedule_param()   empirical sweep on synthetic data
//   3. gen_cvt_weights()            one-shot layout conversion of weights
//   4. gen_executor()               factory for runtime executors
//
// RUNTIME EXECUTOR (bound to one shape pair):
//
//   Unbound --set_shapes--> Bound --prepare--> Ready --execute--> Ready ...
//
//   cal_temp_buffer_size() bounds every byte of scratch execute() touches.
//   set_shapes() drops the executor back to Bound; it must be prepared again.
//
// Schedule parameters and converted weights travel together: once weights
// exist the schedule can no longer be changed. Switching algorithm means
// building a new manager.
//
// Managers are written against the typed OfflineManager trait. The pipeline
// stores them as Box<dyn DynOfflineManager>, a blanket-implemented erased
// view that commits the tuning winner as part of `tune`.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::allocator::{cast_bytes, cast_bytes_mut};
use crate::dtype::WithDType;
use crate::error::{Error, Result};
use crate::format::EdgeType;
use crate::parallel::WorkerPool;
use crate::shape::Shape;
use crate::tensor::{check_dtype, HostTensor};

/// Marker for plain schedule parameter bundles.
pub trait ScheduleParams: Clone + fmt::Debug + PartialEq + Send + Sync + 'static {}

/// Schedule parameters of strategies with nothing to tune.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NoParams;

impl ScheduleParams for NoParams {}

/// Knobs for empirical schedule search.
#[derive(Debug, Clone, PartialEq)]
pub struct TuneOptions {
    /// Untimed iterations per candidate.
    pub warmup_iters: usize,
    /// Timed iterations per candidate.
    pub bench_iters: usize,
    /// Sweep blocking factors; when false only the default block is tried.
    pub tune_blocksize: bool,
    /// Seed for the synthetic trial data.
    pub seed: u64,
    /// Soft per-candidate budget, checked between timed iterations.
    pub candidate_timeout: Option<Duration>,
}

impl Default for TuneOptions {
    fn default() -> Self {
        TuneOptions {
            warmup_iters: 1,
            bench_iters: 5,
            tune_blocksize: true,
            seed: 0x5eed,
            candidate_timeout: None,
        }
    }
}

/// Winner of a schedule sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct Tuned<P> {
    pub params: P,
    /// Total duration of the timed iterations.
    pub run_time: Duration,
}

// Execution arguments

/// Read-only edge buffer handed to an executor.
#[derive(Debug, Clone, Copy)]
pub struct TensorRef<'a> {
    bytes: &'a [u8],
    ty: EdgeType,
}

impl<'a> TensorRef<'a> {
    pub fn new(bytes: &'a [u8], ty: EdgeType) -> Self {
        TensorRef { bytes, ty }
    }

    pub fn ty(&self) -> EdgeType {
        self.ty
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn typed<T: WithDType>(&self) -> Result<&'a [T]> {
        check_dtype::<T>(self.ty.dtype)?;
        cast_bytes(self.bytes)
    }
}

/// Writable edge buffer handed to an executor.
#[derive(Debug)]
pub struct TensorMut<'a> {
    bytes: &'a mut [u8],
    ty: EdgeType,
}

impl<'a> TensorMut<'a> {
    pub fn new(bytes: &'a mut [u8], ty: EdgeType) -> Self {
        TensorMut { bytes, ty }
    }

    pub fn ty(&self) -> EdgeType {
        self.ty
    }

    pub fn into_typed<T: WithDType>(self) -> Result<&'a mut [T]> {
        check_dtype::<T>(self.ty.dtype)?;
        cast_bytes_mut(self.bytes)
    }
}

/// Everything one `execute()` call may touch.
#[derive(Debug)]
pub struct ExecArgs<'a> {
    pub inputs: Vec<TensorRef<'a>>,
    pub outputs: Vec<TensorMut<'a>>,
    pub scratch: &'a mut [u8],
    pub pool: &'a WorkerPool,
}

impl<'a> ExecArgs<'a> {
    pub fn input(&self, i: usize) -> Result<TensorRef<'a>> {
        self.inputs
            .get(i)
            .copied()
            .ok_or_else(|| Error::invalid(format!("missing input {i}")))
    }

    /// Take the single output buffer, leaving the rest of the arguments.
    pub fn take_output(&mut self, i: usize) -> Result<TensorMut<'a>> {
        if i >= self.outputs.len() {
            return Err(Error::invalid(format!("missing output {i}")));
        }
        Ok(self.outputs.swap_remove(i))
    }
}

// Executor state

/// Shape binding and readiness bookkeeping shared by executors.
#[derive(Debug, Clone, Default)]
pub struct ExecState {
    src: Option<Vec<Shape>>,
    dst: Option<Vec<Shape>>,
    prepared: bool,
}

impl ExecState {
    pub fn bind(&mut self, src: Vec<Shape>, dst: Vec<Shape>) {
        self.src = Some(src);
        self.dst = Some(dst);
        self.prepared = false;
    }

    /// Bound shapes, or InvalidValue when set_shapes was never called.
    pub fn shapes(&self) -> Result<(&[Shape], &[Shape])> {
        match (&self.src, &self.dst) {
            (Some(s), Some(d)) => Ok((s, d)),
            _ => Err(Error::invalid("executor shapes are not set")),
        }
    }

    pub fn src(&self, i: usize) -> Result<&Shape> {
        let (src, _) = self.shapes()?;
        src.get(i)
            .ok_or_else(|| Error::invalid(format!("source shape {i} is not set")))
    }

    pub fn dst(&self, i: usize) -> Result<&Shape> {
        let (_, dst) = self.shapes()?;
        dst.get(i)
            .ok_or_else(|| Error::invalid(format!("destination shape {i} is not set")))
    }

    pub fn mark_prepared(&mut self) {
        self.prepared = true;
    }

    pub fn is_ready(&self) -> bool {
        self.prepared
    }

    pub fn ensure_ready(&self) -> Result<()> {
        if !self.prepared {
            return Err(Error::invalid("execute() called before prepare()"));
        }
        Ok(())
    }
}

/// Shape-bound, repeatable execution object.
pub trait RuntimeExecutor: Send + Sync + fmt::Debug {
    fn algorithm(&self) -> &'static str;

    /// Bind source/destination shapes; the executor must be prepared again.
    fn set_shapes(&mut self, src: Vec<Shape>, dst: Vec<Shape>);

    /// Upper bound on scratch bytes touched by `execute()` for the bound shapes.
    fn cal_temp_buffer_size(&self) -> Result<usize>;

    /// Validate shapes and derive shape-dependent values.
    fn prepare(&mut self) -> Result<()>;

    /// Run the operator. Deterministic for fixed shapes and inputs.
    fn execute(&self, args: ExecArgs<'_>) -> Result<()>;

    fn is_ready(&self) -> bool;
}

/// One-shot holder for converted weights.
#[derive(Debug)]
pub struct WeightSlot<W> {
    cell: OnceLock<Arc<W>>,
}

impl<W> WeightSlot<W> {
    pub fn new() -> Self {
        WeightSlot {
            cell: OnceLock::new(),
        }
    }

    /// Store the weights; PermissionDenied if they already exist.
    pub fn set(&self, w: W) -> Result<()> {
        self.cell
            .set(Arc::new(w))
            .map_err(|_| Error::denied("converted weights already exist"))
    }

    pub fn get(&self) -> Option<&Arc<W>> {
        self.cell.get()
    }

    pub fn is_set(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl<W> Default for WeightSlot<W> {
    fn default() -> Self {
        Self::new()
    }
}

/// Typed offline manager for one node and one algorithm.
pub trait OfflineManager: Send + Sync + fmt::Debug {
    type Params: ScheduleParams;

    fn algorithm(&self) -> &'static str;

    /// Pure predicate over the static attributes.
    fn is_supported(&self) -> bool;

    /// O(1) default schedule.
    fn heuristic_params(&self) -> Self::Params;

    /// Empirical sweep over the candidate schedules on synthetic data.
    /// Does not change the manager.
    fn pick_best_schedule_param(
        &self,
        src: &[Shape],
        tune: &TuneOptions,
    ) -> Result<Tuned<Self::Params>>;

    fn schedule_param(&self) -> Option<&Self::Params>;

    /// Store a schedule. May normalize it; PermissionDenied once weights exist.
    fn commit_schedule_param(&mut self, params: Self::Params) -> Result<()>;

    /// Commit the heuristic default and check that it survives unchanged.
    fn fast_init_schedule_param(&mut self) -> Result<()> {
        let params = self.heuristic_params();
        self.commit_schedule_param(params.clone())?;
        if self.schedule_param() != Some(&params) {
            return Err(Error::invalid(format!(
                "{}: heuristic schedule {:?} did not round-trip",
                self.algorithm(),
                params
            )));
        }
        Ok(())
    }

    /// Whether this strategy consumes converted constant weights.
    fn needs_weights(&self) -> bool {
        false
    }

    fn has_cvt_weights(&self) -> bool {
        false
    }

    /// One-shot conversion of raw weights into the backend layout.
    fn gen_cvt_weights(&mut self, _filter: &HostTensor, _bias: Option<&HostTensor>) -> Result<()> {
        Err(Error::invalid(format!(
            "{} takes no weights",
            self.algorithm()
        )))
    }

    fn gen_executor(&self) -> Result<Box<dyn RuntimeExecutor>>;
}

/// Object-safe view of an OfflineManager, as stored by the pipeline.
pub trait DynOfflineManager: Send + Sync + fmt::Debug {
    fn algorithm(&self) -> &'static str;
    fn is_supported(&self) -> bool;
    fn fast_init_schedule_param(&mut self) -> Result<()>;
    /// Sweep and commit the winner; returns its measured time.
    fn tune(&mut self, src: &[Shape], tune: &TuneOptions) -> Result<Duration>;
    /// Debug rendering of the committed schedule.
    fn describe_schedule(&self) -> Option<String>;
    fn needs_weights(&self) -> bool;
    fn has_cvt_weights(&self) -> bool;
    fn gen_cvt_weights(&mut self, filter: &HostTensor, bias: Option<&HostTensor>) -> Result<()>;
    fn gen_executor(&self) -> Result<Box<dyn RuntimeExecutor>>;
}

impl<M: OfflineManager> DynOfflineManager for M {
    fn algorithm(&self) -> &'static str {
        OfflineManager::algorithm(self)
    }

    fn is_supported(&self) -> bool {
        OfflineManager::is_supported(self)
    }

    fn fast_init_schedule_param(&mut self) -> Result<()> {
        OfflineManager::fast_init_schedule_param(self)
    }

    fn tune(&mut self, src: &[Shape], tune: &TuneOptions) -> Result<Duration> {
        let tuned = self.pick_best_schedule_param(src, tune)?;
        log::debug!(
            "{}: picked {:?} ({:?} over {} iterations)",
            OfflineManager::algorithm(self),
            tuned.params,
            tuned.run_time,
            tune.bench_iters
        );
        self.commit_schedule_param(tuned.params)?;
        Ok(tuned.run_time)
    }

    fn describe_schedule(&self) -> Option<String> {
        self.schedule_param().map(|p| format!("{p:?}"))
    }

    fn needs_weights(&self) -> bool {
        OfflineManager::needs_weights(self)
    }

    fn has_cvt_weights(&self) -> bool {
        OfflineManager::has_cvt_weights(self)
    }

    fn gen_cvt_weights(&mut self, filter: &HostTensor, bias: Option<&HostTensor>) -> Result<()> {
        OfflineManager::gen_cvt_weights(self, filter, bias)
    }

    fn gen_executor(&self) -> Result<Box<dyn RuntimeExecutor>> {
        OfflineManager::gen_executor(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::DataFormat;
    use crate::DType;

    #[test]
    fn test_weight_slot_is_one_shot() {
        let slot = WeightSlot::new();
        slot.set(vec![1.0f32, 2.0]).unwrap();
        let err = slot.set(vec![9.0f32]).unwrap_err();
        assert_eq!(err.status(), crate::Status::PermissionDenied);
        assert_eq!(slot.get().unwrap().as_slice(), &[1.0, 2.0]);
    }

    #[test]
    fn test_exec_state_lifecycle() {
        let mut st = ExecState::default();
        assert!(st.shapes().is_err());
        st.bind(vec![Shape::from((1, 4))], vec![Shape::from((1, 4))]);
        assert!(st.ensure_ready().is_err());
        st.mark_prepared();
        assert!(st.ensure_ready().is_ok());
        st.bind(vec![Shape::from((2, 4))], vec![Shape::from((2, 4))]);
        assert!(!st.is_ready());
    }

    #[test]
    fn test_tensor_ref_checks_dtype() {
        let words = [0u32; 4];
        let bytes: &[u8] = bytemuck::cast_slice(&words);
        let r = TensorRef::new(bytes, EdgeType::new(DataFormat::Ndarray, DType::F32));
        assert_eq!(r.typed::<f32>().unwrap().len(), 4);
        assert!(r.typed::<i64>().is_err());
    }
}
