// Direct convolution — register-tiled accumulation over blocked channels
//
// The output of each (batch, group) is produced one pair of output-channel
// blocks at a time. For a pair, the input channels are consumed in tiles of
// `ic_tile` channels; for every tile the output rows are walked in chunks of
// up to MAX_TILE_W columns, each chunk handled by a monomorphized kernel
// from the TileTable. The f32 accumulator for the pair's whole output plane
// lives in the worker's scratch; the epilogue (bias, sum, activation) is
// applied once all tiles are in.
//
// FILTER LAYOUT (gen_cvt_weights):
//
//   [G][pairs][ic blocks][KH][KW][B (ic)][2B (oc)]
//
//   Channels past OC/g or C/g are zero, so padded lanes contribute nothing.
//
// SCHEDULE:
//
//   ic_tile from {32, 48, 64, 96, 112, 128}; candidates past the first one
//   that covers all of C/g are skipped. Committed values are rounded up to a
//   whole number of blocks.

use std::marker::PhantomData;
use std::sync::Arc;

use half::f16;

use vole_core::format::round_up;
use vole_core::tune::sweep;
use vole_core::{
    Block, DType, EngineContext, Error, ExecArgs, ExecState, FeatureView, HostTensor,
    OfflineManager, Result, RuntimeExecutor, ScheduleParams, Shape, TuneOptions, Tuned,
    WeightSlot, WithDType,
};

use super::{
    f32_scratch, pack_input, planar_f32, scatter_output, ConvGeom, ConvProblem, ConvWeights,
    Epilogue, ScratchPlan,
};
use crate::registry::{TileElem, TileTables};
use crate::tile::{TileArgs, MAX_TILE_W};

const IC_TILES: [usize; 6] = [32, 48, 64, 96, 112, 128];
const DEFAULT_IC_TILE: usize = 64;

/// Input channels accumulated per pass over the output plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectParams {
    pub ic_tile: usize,
}

impl ScheduleParams for DirectParams {}

#[derive(Debug)]
pub struct DirectConvManager {
    prob: ConvProblem,
    ctx: EngineContext,
    tiles: Arc<TileTables>,
    params: Option<DirectParams>,
    weights: WeightSlot<ConvWeights>,
}

impl DirectConvManager {
    pub fn new(prob: ConvProblem, ctx: EngineContext, tiles: Arc<TileTables>) -> Self {
        DirectConvManager {
            prob,
            ctx,
            tiles,
            params: None,
            weights: WeightSlot::new(),
        }
    }

    fn candidates(&self, tune: &TuneOptions) -> Vec<DirectParams> {
        if !tune.tune_blocksize {
            return vec![DirectParams {
                ic_tile: DEFAULT_IC_TILE,
            }];
        }
        let ic_g = self.prob.ic_g();
        let mut out = Vec::new();
        for ic_tile in IC_TILES {
            out.push(DirectParams { ic_tile });
            if ic_tile >= ic_g {
                break;
            }
        }
        out
    }

    fn convert(&self, filter: &[f32], bias: &[f32]) -> Result<ConvWeights> {
        match self.prob.ty.dtype {
            DType::F32 => convert_filter::<f32>(&self.prob, filter, bias),
            DType::F16 => convert_filter::<f16>(&self.prob, filter, bias),
            other => Err(Error::unsupported(format!("direct conv2d on {other}"))),
        }
    }

    fn executor(
        &self,
        params: DirectParams,
        weights: Arc<ConvWeights>,
    ) -> Result<Box<dyn RuntimeExecutor>> {
        match self.prob.ty.dtype {
            DType::F32 => Ok(Box::new(DirectConvExec::<f32>::new(self, params, weights))),
            DType::F16 => Ok(Box::new(DirectConvExec::<f16>::new(self, params, weights))),
            other => Err(Error::unsupported(format!("direct conv2d on {other}"))),
        }
    }
}

impl OfflineManager for DirectConvManager {
    type Params = DirectParams;

    fn algorithm(&self) -> &'static str {
        "conv2d_direct"
    }

    fn is_supported(&self) -> bool {
        matches!(self.prob.ty.dtype, DType::F32 | DType::F16)
            && self.prob.attrs.group > 0
            && self.prob.filter.rank() == 4
    }

    fn heuristic_params(&self) -> DirectParams {
        DirectParams {
            ic_tile: DEFAULT_IC_TILE,
        }
    }

    fn pick_best_schedule_param(
        &self,
        src: &[Shape],
        tune: &TuneOptions,
    ) -> Result<Tuned<DirectParams>> {
        let x = src
            .first()
            .ok_or_else(|| Error::invalid("conv2d tuning needs the input shape"))?;
        let trial = self.prob.trial(x)?;
        sweep(&self.ctx, tune, &trial, self.candidates(tune), |p, rng| {
            let (filter, bias) = self.prob.random_weights(rng);
            let weights = self.convert(&filter, &bias)?;
            self.executor(*p, Arc::new(weights))
        })
    }

    fn schedule_param(&self) -> Option<&DirectParams> {
        self.params.as_ref()
    }

    fn commit_schedule_param(&mut self, params: DirectParams) -> Result<()> {
        if self.weights.is_set() {
            return Err(Error::denied(
                "schedule is fixed once converted weights exist",
            ));
        }
        if params.ic_tile == 0 {
            return Err(Error::invalid("ic_tile must be positive"));
        }
        self.params = Some(DirectParams {
            ic_tile: round_up(params.ic_tile, self.prob.block()),
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
        self.executor(params, weights)
    }
}

/// Reorder an [OC][C/g][KH][KW] filter into the pair-blocked layout.
pub fn convert_filter<T: WithDType>(
    prob: &ConvProblem,
    filter: &[f32],
    bias: &[f32],
) -> Result<ConvWeights> {
    if filter.len() != prob.filter.elem_count() {
        return Err(Error::invalid(format!(
            "filter has {} values, {} expects {}",
            filter.len(),
            prob.filter,
            prob.filter.elem_count()
        )));
    }
    let b = prob.block();
    let b2 = 2 * b;
    let g_n = prob.attrs.group;
    let (ic_g, oc_g) = (prob.ic_g(), prob.oc_g());
    let [kh_n, kw_n] = prob.attrs.kernel;
    let pairs = round_up(oc_g, b2) / b2;
    let icb_g = round_up(ic_g, b) / b;
    let len = g_n * pairs * icb_g * kh_n * kw_n * b * b2;

    let mut block = Block::detached(len * std::mem::size_of::<T>());
    let dst = block.typed_mut::<T>()?;
    for g in 0..g_n {
        for oc in 0..oc_g {
            for ic in 0..ic_g {
                for kh in 0..kh_n {
                    for kw in 0..kw_n {
                        let src = (((g * oc_g + oc) * ic_g + ic) * kh_n + kh) * kw_n + kw;
                        let tap = (((g * pairs + oc / b2) * icb_g + ic / b) * kh_n + kh) * kw_n + kw;
                        dst[tap * b * b2 + (ic % b) * b2 + oc % b2] = T::from_acc(filter[src]);
                    }
                }
            }
        }
    }
    let (bias, bias_stride) = prob.padded_bias(bias)?;
    Ok(ConvWeights {
        filter: block,
        bias,
        bias_stride,
    })
}

#[derive(Debug)]
pub struct DirectConvExec<T> {
    prob: ConvProblem,
    params: DirectParams,
    weights: Arc<ConvWeights>,
    tiles: Arc<TileTables>,
    workers: usize,
    state: ExecState,
    geom: Option<ConvGeom>,
    _elem: PhantomData<T>,
}

impl<T: TileElem> DirectConvExec<T> {
    fn new(mgr: &DirectConvManager, params: DirectParams, weights: Arc<ConvWeights>) -> Self {
        DirectConvExec {
            prob: mgr.prob.clone(),
            params,
            weights,
            tiles: mgr.tiles.clone(),
            workers: mgr.ctx.workers(),
            state: ExecState::default(),
            geom: None,
            _elem: PhantomData,
        }
    }

    fn bound_geom(&self) -> Result<ConvGeom> {
        let x = self.state.src(0)?;
        let y = self.state.dst(0)?;
        ConvGeom::new(&self.prob, x, y, true)
    }

    fn plan(&self, geom: &ConvGeom) -> ScratchPlan {
        let acc = geom.dst_hw() * 2 * geom.block * std::mem::size_of::<f32>();
        ScratchPlan::new(geom, std::mem::size_of::<T>(), acc)
    }
}

impl<T: TileElem> RuntimeExecutor for DirectConvExec<T> {
    fn algorithm(&self) -> &'static str {
        "conv2d_direct"
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
                "conv2d_direct expects {expected} sources, got {}",
                src.len()
            )));
        }
        if self.prob.attrs.fuse.sum && src[1] != *self.state.dst(0)? {
            return Err(Error::ShapeMismatch {
                expected: self.state.dst(0)?.clone(),
                got: src[1].clone(),
            });
        }
        if self.params.ic_tile == 0 {
            return Err(Error::invalid("ic_tile must be positive"));
        }
        self.weights.filter.typed::<T>()?;
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
        let ty = self.prob.ty;
        let input = args.input(0)?;
        if input.ty() != ty {
            return Err(Error::invalid(format!(
                "conv2d_direct bound to {ty}, got {}",
                input.ty()
            )));
        }
        let x = input.typed::<T>()?;
        let sum = if self.prob.attrs.fuse.sum {
            Some(FeatureView::with_geom(args.input(1)?.typed::<T>()?, geom.y_geom)?)
        } else {
            None
        };
        let pool = args.pool;
        let y = args.take_output(0)?.into_typed::<T>()?;
        if y.len() < geom.y_geom.storage_len() {
            return Err(Error::IndexOutOfBounds {
                index: geom.y_geom.storage_len(),
                len: y.len(),
            });
        }

        let plan = self.plan(&geom);
        let (in_stage, out_stage, work) = plan.split(args.scratch, self.workers)?;

        let src: &[T] = if geom.stage_in {
            let stage = vole_core::allocator::cast_bytes_mut::<T>(in_stage)?;
            pack_input(pool, &geom, x, stage)?;
            &*stage
        } else {
            x
        };

        let filter = self.weights.filter.typed::<T>()?;
        let table = T::table(&self.tiles);
        let epi = Epilogue {
            bias: &self.weights.bias,
            bias_stride: self.weights.bias_stride,
            sum,
            fuse: self.prob.attrs.fuse,
            oc_g: geom.oc_g,
        };
        let b = geom.block;
        let [kh_n, kw_n] = self.prob.attrs.kernel;
        let pairs = round_up(geom.oc_g, 2 * b) / (2 * b);
        let tile_blocks = (self.params.ic_tile / b).max(1);
        let dst_hw = geom.dst_hw();
        let (lens, chunks) = geom.item_lens(2);

        let compute = |i: usize, part: &mut [T], ws: &mut [u8]| -> Result<()> {
            let (bi, g, p) = geom.item(i, chunks);
            let nb = part.len() / (dst_hw * b);
            let acc = &mut f32_scratch(ws)?[..nb * dst_hw * b];
            acc.fill(0.0);
            let mut tile = TileArgs {
                src,
                src_base: geom.src_base(bi, g),
                src_h: geom.src_h,
                src_w: geom.src_w,
                filter,
                flt_base: (g * pairs + p) * geom.icb_g * kh_n * kw_n * b * 2 * b,
                block: b,
                kernel: self.prob.attrs.kernel,
                stride: self.prob.attrs.stride,
                pad: self.prob.attrs.pad,
                dilation: self.prob.attrs.dilation,
                icb: 0..0,
                oh: 0,
                ow: 0,
                dst_w: geom.dst_w,
                dst_hw,
            };
            for icb0 in (0..geom.icb_g).step_by(tile_blocks) {
                tile.icb = icb0..(icb0 + tile_blocks).min(geom.icb_g);
                for oh in 0..geom.dst_h {
                    let mut ow = 0;
                    while ow < geom.dst_w {
                        let width = (geom.dst_w - ow).min(MAX_TILE_W);
                        tile.oh = oh;
                        tile.ow = ow;
                        table.get(width, nb)?(&tile, acc);
                        ow += width;
                    }
                }
            }
            for ob in 0..nb {
                for s in 0..dst_hw {
                    for lane in 0..b {
                        let l = (2 * p + ob) * b + lane;
                        let idx = (ob * dst_hw + s) * b + lane;
                        part[idx] = epi.apply(bi, g, l, s, acc[idx]);
                    }
                }
            }
            Ok(())
        };

        if geom.stage_out {
            let stage = vole_core::allocator::cast_bytes_mut::<T>(out_stage)?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use vole_core::{DataFormat, EdgeType, Status};
    use vole_ir::Conv2dAttrs;

    fn manager(ic: usize, oc: usize) -> DirectConvManager {
        let prob = ConvProblem {
            attrs: Conv2dAttrs::new([3, 3]).with_pad([1, 1]),
            filter: Shape::from((oc, ic, 3, 3)),
            x: Shape::from((1, ic, 4, 4)),
            ty: EdgeType::new(DataFormat::N4cx, DType::F32),
        };
        DirectConvManager::new(prob, EngineContext::host(1).unwrap(), Arc::default())
    }

    #[test]
    fn test_candidates_stop_at_first_covering_tile() {
        let m = manager(40, 8);
        let c = m.candidates(&TuneOptions::default());
        assert_eq!(
            c.iter().map(|p| p.ic_tile).collect::<Vec<_>>(),
            vec![32, 48]
        );
        let fixed = TuneOptions {
            tune_blocksize: false,
            ..TuneOptions::default()
        };
        assert_eq!(m.candidates(&fixed), vec![DirectParams { ic_tile: 64 }]);
    }

    #[test]
    fn test_commit_rounds_to_block() {
        let mut m = manager(8, 8);
        m.commit_schedule_param(DirectParams { ic_tile: 30 }).unwrap();
        assert_eq!(m.schedule_param(), Some(&DirectParams { ic_tile: 32 }));
        assert!(m.commit_schedule_param(DirectParams { ic_tile: 0 }).is_err());
    }

    #[test]
    fn test_reconversion_is_denied_before_shape_checks() {
        let mut m = manager(4, 4);
        m.fast_init_schedule_param().unwrap();
        let w = HostTensor::from_vec(vec![0.5f32; 4 * 4 * 9], (4, 4, 3, 3)).unwrap();
        m.gen_cvt_weights(&w, None).unwrap();
        let other = HostTensor::from_vec(vec![0.5f32; 8 * 4 * 9], (8, 4, 3, 3)).unwrap();
        assert_eq!(
            m.gen_cvt_weights(&other, None).unwrap_err().status(),
            Status::PermissionDenied
        );
    }

    #[test]
    fn test_weights_require_schedule_and_are_one_shot() {
        let mut m = manager(4, 4);
        let w = HostTensor::from_vec(vec![0.5f32; 4 * 4 * 9], (4, 4, 3, 3)).unwrap();
        assert_eq!(
            m.gen_cvt_weights(&w, None).unwrap_err().status(),
            Status::InvalidValue
        );
        m.fast_init_schedule_param().unwrap();
        m.gen_cvt_weights(&w, None).unwrap();
        assert_eq!(
            m.gen_cvt_weights(&w, None).unwrap_err().status(),
            Status::PermissionDenied
        );
        assert_eq!(
            m.commit_schedule_param(DirectParams { ic_tile: 32 })
                .unwrap_err()
                .status(),
            Status::PermissionDenied
        );
        assert!(m.gen_executor().is_ok());
    }

    #[test]
    fn test_filter_layout() {
        let m = manager(4, 4);
        let filter: Vec<f32> = (0..4 * 4 * 9).map(|v| v as f32).collect();
        let w = convert_filter::<f32>(&m.prob, &filter, &[]).unwrap();
        let d = w.filter.typed::<f32>().unwrap();
        // one pair of 8 oc lanes, one ic block, 9 taps of [4][8]
        assert_eq!(d.len(), 9 * 4 * 8);
        // oc 2, ic 1, tap (1, 2): src (2*4+1)*9 + 5
        assert_eq!(d[5 * 32 + 8 + 2], ((2 * 4 + 1) * 9 + 5) as f32);
        // oc lanes 4..8 are padding
        assert_eq!(d[5 * 32 + 8 + 6], 0.0);
    }
}
