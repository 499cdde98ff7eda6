// Autotune harness — timed trials of candidate schedules
//
// pick_best_schedule_param implementations enumerate their candidates and
// hand them to `sweep`, together with a closure that builds an executor
// bound to synthetic weights for one candidate. For each candidate the
// harness:
//
//   1. binds the trial shapes and prepares the executor
//   2. asks for cal_temp_buffer_size() and allocates scratch
//   3. allocates inputs filled with uniform noise and zeroed outputs
//   4. runs warmup_iters untimed, then bench_iters timed executions
//
// Every buffer of a trial is an allocator Block owned by the trial, so it is
// released when the trial ends, whichever step failed. A failing candidate
// is logged and skipped; the sweep only fails when no candidate survives.
// The winner is the strictly fastest, so the first of equal times wins.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::algo::{ExecArgs, RuntimeExecutor, ScheduleParams, TensorMut, TensorRef, TuneOptions, Tuned};
use crate::allocator::Block;
use crate::context::EngineContext;
use crate::dtype::{DType, WithDType};
use crate::error::{Error, Result};
use crate::format::EdgeType;
use crate::shape::Shape;

/// Shapes and edge types of one synthetic trial.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialSpec {
    pub inputs: Vec<(Shape, EdgeType)>,
    pub outputs: Vec<(Shape, EdgeType)>,
}

impl TrialSpec {
    pub fn input_shapes(&self) -> Vec<Shape> {
        self.inputs.iter().map(|(s, _)| s.clone()).collect()
    }

    pub fn output_shapes(&self) -> Vec<Shape> {
        self.outputs.iter().map(|(s, _)| s.clone()).collect()
    }
}

/// Time every candidate and return the fastest.
pub fn sweep<P, F>(
    ctx: &EngineContext,
    tune: &TuneOptions,
    spec: &TrialSpec,
    candidates: Vec<P>,
    mut build: F,
) -> Result<Tuned<P>>
where
    P: ScheduleParams,
    F: FnMut(&P, &mut StdRng) -> Result<Box<dyn RuntimeExecutor>>,
{
    let mut rng = StdRng::seed_from_u64(tune.seed);
    let mut best: Option<Tuned<P>> = None;
    let total = candidates.len();

    for params in candidates {
        let timed = build(&params, &mut rng)
            .and_then(|mut exec| run_trial(ctx, tune, spec, exec.as_mut(), &mut rng));
        match timed {
            Ok(run_time) => {
                let faster = best.as_ref().map_or(true, |b| run_time < b.run_time);
                if faster {
                    best = Some(Tuned { params, run_time });
                }
            }
            Err(e) => log::debug!("schedule candidate {:?} rejected: {}", params, e),
        }
    }

    best.ok_or_else(|| {
        Error::unsupported(format!("none of {total} schedule candidates could run"))
    })
}

/// Run one candidate; returns the total time of the timed iterations.
pub fn run_trial(
    ctx: &EngineContext,
    tune: &TuneOptions,
    spec: &TrialSpec,
    exec: &mut dyn RuntimeExecutor,
    rng: &mut StdRng,
) -> Result<std::time::Duration> {
    exec.set_shapes(spec.input_shapes(), spec.output_shapes());
    exec.prepare()?;
    let temp = exec.cal_temp_buffer_size()?;

    let alloc = ctx.allocator();
    let mut inputs = Vec::with_capacity(spec.inputs.len());
    for (shape, ty) in &spec.inputs {
        let mut block = alloc.alloc(ty.storage_bytes(shape))?;
        fill_uniform(&mut block, ty.dtype, rng)?;
        inputs.push(block);
    }
    let mut outputs = Vec::with_capacity(spec.outputs.len());
    for (shape, ty) in &spec.outputs {
        outputs.push(alloc.alloc(ty.storage_bytes(shape))?);
    }
    let mut scratch = alloc.alloc(temp)?;

    for _ in 0..tune.warmup_iters {
        exec.execute(trial_args(ctx, spec, &inputs, &mut outputs, &mut scratch))?;
    }

    let clock = ctx.clock();
    let start = clock.now();
    for i in 0..tune.bench_iters {
        exec.execute(trial_args(ctx, spec, &inputs, &mut outputs, &mut scratch))?;
        if let Some(limit) = tune.candidate_timeout {
            let spent = clock.now().saturating_sub(start);
            if spent > limit && i + 1 < tune.bench_iters {
                return Err(Error::unsupported(format!(
                    "candidate exceeded its {limit:?} budget after {} iterations",
                    i + 1
                )));
            }
        }
    }
    Ok(clock.now().saturating_sub(start))
}

fn trial_args<'a>(
    ctx: &'a EngineContext,
    spec: &TrialSpec,
    inputs: &'a [Block],
    outputs: &'a mut [Block],
    scratch: &'a mut Block,
) -> ExecArgs<'a> {
    ExecArgs {
        inputs: inputs
            .iter()
            .zip(&spec.inputs)
            .map(|(b, (_, ty))| TensorRef::new(b.as_bytes(), *ty))
            .collect(),
        outputs: outputs
            .iter_mut()
            .zip(&spec.outputs)
            .map(|(b, (_, ty))| TensorMut::new(b.as_bytes_mut(), *ty))
            .collect(),
        scratch: scratch.as_bytes_mut(),
        pool: ctx.pool(),
    }
}

/// Fill a block with uniform noise: [-0.5, 0.5) for floats, small integers
/// otherwise.
pub fn fill_uniform(block: &mut Block, dtype: DType, rng: &mut StdRng) -> Result<()> {
    crate::dispatch_dtype!(dtype, T => fill_typed::<T>(block.typed_mut::<T>()?, rng));
    Ok(())
}

fn fill_typed<T: WithDType>(data: &mut [T], rng: &mut StdRng) {
    let float = T::DTYPE.is_float();
    for v in data.iter_mut() {
        *v = if float {
            T::from_f64(rng.gen_range(-0.5..0.5))
        } else {
            T::from_f64(rng.gen_range(0..8) as f64)
        };
    }
}
