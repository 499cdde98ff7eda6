// Im2col convolution — blocked GEMM over unrolled input patches
//
// Each (batch, group) is a GEMM:
//
//   out[M = OC/g][N = OH*OW] = W[M][K = C/g * KH * KW] x col[K][N]
//
// computed in blocks of m_blk x n_blk, with K consumed k_blk rows at a time.
// For every (n-block, k-block) the worker unrolls the needed input patches
// into its private `col` buffer, then accumulates into its `acc` buffer.
// The input is read through logical channel indices, so unaligned groups
// need no input staging; only the output is staged.
//
// Per-worker scratch: col [k_blk][n_blk] + acc [m_blk][n_blk], both f32.
//
// Candidate sweep: m_blk ∈ {32, 40, 48, 64}, n_blk ∈ {48, 68, 72, 84, 96},
// k_blk ∈ {64, 128, 192}. Along each axis the sweep stops after the first
// value that already covers the problem (M, N or K). Only f32.

use std::sync::Arc;

use vole_core::format::round_up;
use vole_core::tune::sweep;
use vole_core::{
    Block, DType, EngineContext, Error, ExecArgs, ExecState, FeatureView, HostTensor,
    OfflineManager, Result, RuntimeExecutor, ScheduleParams, Shape, TuneOptions, Tuned,
    WeightSlot,
};

use super::{
    f32_scratch, planar_f32, scatter_output, ConvGeom, ConvProblem, ConvWeights, Epilogue,
    ScratchPlan,
};

const M_BLKS: [usize; 4] = [32, 40, 48, 64];
const N_BLKS: [usize; 5] = [48, 68, 72, 84, 96];
const K_BLKS: [usize; 3] = [64, 128, 192];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Im2colParams {
    pub m_blk: usize,
    pub n_blk: usize,
    pub k_blk: usize,
}

impl Default for Im2colParams {
    fn default() -> Self {
        Im2colParams {
            m_blk: 40,
            n_blk: 68,
            k_blk: 128,
        }
    }
}

impl ScheduleParams for Im2colParams {}

/// Take values of `list` up to and including the first one that reaches `need`.
fn covering(list: &[usize], need: usize) -> Vec<usize> {
    let mut out = Vec::new();
    for &v in list {
        out.push(v);
        if v >= need {
            break;
        }
    }
    out
}

#[derive(Debug)]
pub struct Im2colConvManager {
    prob: ConvProblem,
    ctx: EngineContext,
    params: Option<Im2colParams>,
    weights: WeightSlot<ConvWeights>,
}

impl Im2colConvManager {
    pub fn new(prob: ConvProblem, ctx: EngineContext) -> Self {
        Im2colConvManager {
            prob,
            ctx,
            params: None,
            weights: WeightSlot::new(),
        }
    }

    fn k_len(&self) -> usize {
        let [kh, kw] = self.prob.attrs.kernel;
        self.prob.ic_g() * kh * kw
    }

    fn candidates(&self, y: &Shape, tune: &TuneOptions) -> Vec<Im2colParams> {
        if !tune.tune_blocksize {
            return vec![Im2colParams::default()];
        }
        let m = self.prob.oc_g();
        let n = y.spatial();
        let k = self.k_len();
        let mut out = Vec::new();
        for &m_blk in &covering(&M_BLKS, m) {
            for &n_blk in &covering(&N_BLKS, n) {
                for &k_blk in &covering(&K_BLKS, k) {
                    out.push(Im2colParams { m_blk, n_blk, k_blk });
                }
            }
        }
        out
    }

    /// Filter as [G][OC/g padded to B][K], rows past OC/g zero.
    fn convert(&self, filter: &[f32], bias: &[f32]) -> Result<ConvWeights> {
        if filter.len() != self.prob.filter.elem_count() {
            return Err(Error::invalid(format!(
                "filter has {} values, {} expects {}",
                filter.len(),
                self.prob.filter,
                self.prob.filter.elem_count()
            )));
        }
        let g_n = self.prob.attrs.group;
        let oc_g = self.prob.oc_g();
        let rows = round_up(oc_g, self.prob.block());
        let k = self.k_len();
        let mut block = Block::detached(g_n * rows * k * std::mem::size_of::<f32>());
        let dst = block.typed_mut::<f32>()?;
        for g in 0..g_n {
            for m in 0..oc_g {
                let src = (g * oc_g + m) * k;
                let row = (g * rows + m) * k;
                dst[row..row + k].copy_from_slice(&filter[src..src + k]);
            }
        }
        let (bias, bias_stride) = self.prob.padded_bias(bias)?;
        Ok(ConvWeights {
            filter: block,
            bias,
            bias_stride,
        })
    }

    fn executor(&self, params: Im2colParams, weights: Arc<ConvWeights>) -> Box<dyn RuntimeExecutor> {
        Box::new(Im2colConvExec {
            prob: self.prob.clone(),
            params,
            weights,
            workers: self.ctx.workers(),
            state: ExecState::default(),
            geom: None,
        })
    }
}

impl OfflineManager for Im2colConvManager {
    type Params = Im2colParams;

    fn algorithm(&self) -> &'static str {
        "conv2d_im2col"
    }

    fn is_supported(&self) -> bool {
        self.prob.ty.dtype == DType::F32 && self.prob.attrs.group > 0 && self.prob.filter.rank() == 4
    }

    fn heuristic_params(&self) -> Im2colParams {
        Im2colParams::default()
    }

    fn pick_best_schedule_param(
        &self,
        src: &[Shape],
        tune: &TuneOptions,
    ) -> Result<Tuned<Im2colParams>> {
        let x = src
            .first()
            .ok_or_else(|| Error::invalid("conv2d tuning needs the input shape"))?;
        let trial = self.prob.trial(x)?;
        let y = trial.outputs[0].0.clone();
        sweep(&self.ctx, tune, &trial, self.candidates(&y, tune), |p, rng| {
            let (filter, bias) = self.prob.random_weights(rng);
            let weights = self.convert(&filter, &bias)?;
            Ok(self.executor(*p, Arc::new(weights)))
        })
    }

    fn schedule_param(&self) -> Option<&Im2colParams> {
        self.params.as_ref()
    }

    fn commit_schedule_param(&mut self, params: Im2colParams) -> Result<()> {
        if self.weights.is_set() {
            return Err(Error::denied(
                "schedule is fixed once converted weights exist",
            ));
        }
        if params.m_blk == 0 || params.n_blk == 0 || params.k_blk == 0 {
            return Err(Error::invalid(format!("degenerate im2col blocking {params:?}")));
        }
        self.params = Some(Im2colParams {
            m_blk: round_up(params.m_blk, self.prob.block()),
            ..params
        });
        Ok(())
    }

    fn needs_weights(&self) -> bool {
        true
    }

    fn has_cvt_weights(&self) -> bool {
        self.weights.is_set()
    }

    fn gen_cvt_weights(&mut self, filter: &HostTensor, bias: Option<&HostTensor>) -> Result<()> {
        if self.weights.is_set() {
            return Err(Error::denied("converted weights already exist"));
        }
        if self.params.is_none() {
            return Err(Error::invalid(
                "commit a schedule before converting weights",
            ));
        }
        if filter.shape() != &self.prob.filter {
            return Err(Error::ShapeMismatch {
                expected: self.prob.filter.clone(),
                got: filter.shape().clone(),
            });
        }
        let raw = planar_f32(filter)?;
        let bias = bias.map(planar_f32).transpose()?.unwrap_or_default();
        let converted = self.convert(&raw, &bias)?;
        self.weights.set(converted)
    }

    fn gen_executor(&self) -> Result<Box<dyn RuntimeExecutor>> {
        let params = self
            .params
            .ok_or_else(|| Error::invalid("no schedule committed"))?;
        let weights = self
            .weights
            .get()
            .cloned()
            .ok_or_else(|| Error::invalid("weights have not been converted"))?;
        Ok(self.executor(params, weights))
    }
}

#[derive(Debug)]
pub struct Im2colConvExec {
    prob: ConvProblem,
    params: Im2colParams,
    weights: Arc<ConvWeights>,
    workers: usize,
    state: ExecState,
    geom: Option<ConvGeom>,
}

impl Im2colConvExec {
    fn bound_geom(&self) -> Result<ConvGeom> {
        ConvGeom::new(&self.prob, self.state.src(0)?, self.state.dst(0)?, false)
    }

    fn plan(&self, geom: &ConvGeom) -> ScratchPlan {
        let p = self.params;
        let floats = p.k_blk * p.n_blk + p.m_blk * p.n_blk;
        ScratchPlan::new(geom, std::mem::size_of::<f32>(), floats * std::mem::size_of::<f32>())
    }
}

impl RuntimeExecutor for Im2colConvExec {
    fn algorithm(&self) -> &'static str {
        "conv2d_im2col"
    }

    fn set_shapes(&mut self, src: Vec<Shape>, dst: Vec<Shape>) {
        self.state.bind(src, dst);
        self.geom = None;
    }

    fn cal_temp_buffer_size(&self) -> Result<usize> {
        let geom = self.bound_geom()?;
        Ok(self.plan(&geom).total(self.workers))
    }

    fn prepare(&mut self) -> Result<()> {
        let geom = self.bound_geom()?;
        let (src, _) = self.state.shapes()?;
        let expected = 1 + usize::from(self.prob.attrs.fuse.sum);
        if src.len() != expected {
            return Err(Error::invalid(format!(
                "conv2d_im2col expects {expected} sources, got {}",
                src.len()
            )));
        }
        if self.prob.attrs.fuse.sum && src[1] != *self.state.dst(0)? {
            return Err(Error::ShapeMismatch {
                expected: self.state.dst(0)?.clone(),
                got: src[1].clone(),
            });
        }
        let p = self.params;
        if p.m_blk == 0 || p.n_blk == 0 || p.k_blk == 0 || p.m_blk % geom.block != 0 {
            return Err(Error::invalid(format!("unusable im2col blocking {p:?}")));
        }
        self.geom = Some(geom);
        self.state.mark_prepared();
        Ok(())
    }

    fn execute(&self, mut args: ExecArgs<'_>) -> Result<()> {
        self.state.ensure_ready()?;
        let geom = self
            .geom
            .ok_or_else(|| Error::invalid("executor geometry missing"))?;
        if geom.y_geom.storage_len() == 0 {
            return Ok(());
        }
        let input = args.input(0)?;
        if input.ty() != self.prob.ty {
            return Err(Error::invalid(format!(
                "conv2d_im2col bound to {}, got {}",
                self.prob.ty,
                input.ty()
            )));
        }
        let xv = FeatureView::with_geom(input.typed::<f32>()?, geom.x_geom)?;
        let sum = if self.prob.attrs.fuse.sum {
            Some(FeatureView::with_geom(args.input(1)?.typed::<f32>()?, geom.y_geom)?)
        } else {
            None
        };
        let pool = args.pool;
        let y = args.take_output(0)?.into_typed::<f32>()?;
        if y.len() < geom.y_geom.storage_len() {
            return Err(Error::IndexOutOfBounds {
                index: geom.y_geom.storage_len(),
                len: y.len(),
            });
        }

        let plan = self.plan(&geom);
        let (_, out_stage, work) = plan.split(args.scratch, self.workers)?;

        let p = self.params;
        let b = geom.block;
        let a = self.prob.attrs;
        let [kh_n, kw_n] = a.kernel;
        let taps = kh_n * kw_n;
        let k_len = geom.ic_g * taps;
        let n_len = geom.dst_hw();
        let weights = self.weights.filter.typed::<f32>()?;
        let epi = Epilogue {
            bias: &self.weights.bias,
            bias_stride: self.weights.bias_stride,
            sum,
            fuse: a.fuse,
            oc_g: geom.oc_g,
        };
        let (lens, chunks) = geom.item_lens(p.m_blk / b);

        let compute = |i: usize, part: &mut [f32], ws: &mut [u8]| -> Result<()> {
            let (bi, g, mc) = geom.item(i, chunks);
            let m0 = mc * p.m_blk;
            let mm = part.len() / n_len;
            let (col, acc) = f32_scratch(ws)?.split_at_mut(p.k_blk * p.n_blk);
            for n0 in (0..n_len).step_by(p.n_blk) {
                let nn = p.n_blk.min(n_len - n0);
                acc[..mm * nn].fill(0.0);
                for k0 in (0..k_len).step_by(p.k_blk) {
                    let kk = p.k_blk.min(k_len - k0);
                    for r in 0..kk {
                        let k = k0 + r;
                        let (ic, tap) = (k / taps, k % taps);
                        let (kh, kw) = (tap / kw_n, tap % kw_n);
                        for j in 0..nn {
                            let s = n0 + j;
                            let (oh, ow) = (s / geom.dst_w, s % geom.dst_w);
                            let ih = (oh * a.stride[0] + kh * a.dilation[0]) as isize - a.pad[0] as isize;
                            let iw = (ow * a.stride[1] + kw * a.dilation[1]) as isize - a.pad[1] as isize;
                            let inside = ih >= 0
                                && iw >= 0
                                && (ih as usize) < geom.src_h
                                && (iw as usize) < geom.src_w;
                            col[r * nn + j] = if inside {
                                xv.get(bi, g * geom.ic_g + ic, ih as usize * geom.src_w + iw as usize)
                            } else {
                                0.0
                            };
                        }
                    }
                    for m in 0..mm {
                        let row = ((g * geom.oc_g_pck + m0 + m) * k_len) + k0;
                        let out = &mut acc[m * nn..(m + 1) * nn];
                        for r in 0..kk {
                            let w = weights[row + r];
                            let src = &col[r * nn..(r + 1) * nn];
                            for (o, c) in out.iter_mut().zip(src) {
                                *o += w * c;
                            }
                        }
                    }
                }
                for m in 0..mm {
                    for j in 0..nn {
                        let s = n0 + j;
                        let idx = ((m / b) * n_len + s) * b + m % b;
                        part[idx] = epi.apply(bi, g, m0 + m, s, acc[m * nn + j]);
                    }
                }
            }
            Ok(())
        };

        if geom.stage_out {
            let stage = vole_core::allocator::cast_bytes_mut::<f32>(out_stage)?;
            pool.for_each_split(&mut *stage, &lens, work, plan.per_worker, compute)?;
            scatter_output(pool, &geom, stage, y)
        } else {
            pool.for_each_split(y, &lens, work, plan.per_worker, compute)
        }
    }

    fn is_ready(&self) -> bool {
        self.state.is_ready()
    }
}
