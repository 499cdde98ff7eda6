// PlainManager — offline manager for strategies with nothing to tune
//
// Pooling, reduction, element-wise and conversion kernels have no schedule
// parameters and no weights. They implement the small PlainKernel trait;
// PlainManager turns any of them into a full OfflineManager whose schedule
// is the unit NoParams. Autotuning still runs one timed trial, so a kernel
// that cannot run at the requested shapes is reported as Unsupported by the
// same path as the tunable strategies.

use std::fmt;

use vole_core::tune::{sweep, TrialSpec};
use vole_core::{
    EngineContext, Error, NoParams, OfflineManager, Result, RuntimeExecutor, Shape, TuneOptions,
    Tuned,
};

/// A parameter-free kernel family.
pub trait PlainKernel: Send + Sync + fmt::Debug + 'static {
    const NAME: &'static str;

    /// Pure predicate over the static attributes and edge types.
    fn supported(&self) -> bool;

    /// A fresh, unbound executor.
    fn executor(&self, workers: usize) -> Box<dyn RuntimeExecutor>;

    /// Shapes and types of a synthetic trial for the given sources.
    fn trial(&self, src: &[Shape]) -> Result<TrialSpec>;
}

#[derive(Debug)]
pub struct PlainManager<K> {
    kernel: K,
    ctx: EngineContext,
    params: Option<NoParams>,
}

impl<K: PlainKernel> PlainManager<K> {
    pub fn new(kernel: K, ctx: EngineContext) -> Self {
        PlainManager {
            kernel,
            ctx,
            params: None,
        }
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }
}

impl<K: PlainKernel> OfflineManager for PlainManager<K> {
    type Params = NoParams;

    fn algorithm(&self) -> &'static str {
        K::NAME
    }

    fn is_supported(&self) -> bool {
        self.kernel.supported()
    }

    fn heuristic_params(&self) -> NoParams {
        NoParams
    }

    fn pick_best_schedule_param(&self, src: &[Shape], tune: &TuneOptions) -> Result<Tuned<NoParams>> {
        let trial = self.kernel.trial(src)?;
        let workers = self.ctx.workers();
        sweep(&self.ctx, tune, &trial, vec![NoParams], |_, _| {
            Ok(self.kernel.executor(workers))
        })
    }

    fn schedule_param(&self) -> Option<&NoParams> {
        self.params.as_ref()
    }

    fn commit_schedule_param(&mut self, params: NoParams) -> Result<()> {
        self.params = Some(params);
        Ok(())
    }

    fn gen_executor(&self) -> Result<Box<dyn RuntimeExecutor>> {
        if self.params.is_none() {
            return Err(Error::invalid(format!("{}: no schedule committed", K::NAME)));
        }
        Ok(self.kernel.executor(self.ctx.workers()))
    }
}

/// Check that `got` is exactly `n` shapes.
pub(crate) fn expect_count(what: &str, got: &[Shape], n: usize) -> Result<()> {
    if got.len() != n {
        return Err(Error::invalid(format!(
            "{what} expects {n} shapes, got {}",
            got.len()
        )));
    }
    Ok(())
}
