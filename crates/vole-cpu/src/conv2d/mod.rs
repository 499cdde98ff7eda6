// Conv2d — shared machinery of the convolution strategies
//
// Both strategies (direct and im2col) read a channel-blocked input, write a
// channel-blocked output and accumulate in f32. Planar data is the B = 1
// case of the same layout, so the scalar backend runs the same code.
//
// GROUP STAGING:
//
//   With group > 1, a group's channels start at channel g * C/g. When that is
//   not a multiple of B, the group does not start on a block boundary and
//   cannot be addressed block-wise in place. The executor then works in
//   three phases, each a separate WorkerPool call (the return of each call
//   is the barrier):
//
//     1. pack     input  → input stage   [N][G][ceil(C/g / B)][H*W][B]
//     2. compute  stage  → output stage  [N][G][ceil(OC/g / B)][OH*OW][B]
//     3. scatter  output stage → output
//
//   Aligned groups skip the phases they do not need.
//
// SCRATCH LAYOUT (one execute() call):
//
//   [ input stage | output stage | worker 0 | worker 1 | ... ]
//
//   Every region starts on a 64-byte boundary. cal_temp_buffer_size() is
//   the end of the last worker region, so it covers every phase.
//
// WORK ITEMS:
//
//   Output (or output stage) is split into consecutive regions per
//   (batch, group, output-channel chunk). The chunk is a pair of blocks for
//   the direct strategy and an m-block for im2col; both tile the group's
//   blocks exactly, so the regions are disjoint and in storage order.

pub mod direct;
pub mod im2col;

use rand::rngs::StdRng;
use rand::Rng;

use vole_core::allocator::cast_bytes_mut;
use vole_core::format::round_up;
use vole_core::tune::TrialSpec;
use vole_core::{
    Block, EdgeType, Error, FeatureGeom, FeatureView, FeatureViewMut, HostTensor, Result, Shape,
    WithDType, WorkerPool,
};
use vole_ir::{Conv2dAttrs, FuseFlags, OpKind};

use crate::registry::KernelRequest;

pub use direct::{DirectConvManager, DirectParams};
pub use im2col::{Im2colConvManager, Im2colParams};

const ALIGN: usize = 64;

/// Static description of one convolution node.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvProblem {
    pub attrs: Conv2dAttrs,
    /// [OC, C/group, KH, KW]
    pub filter: Shape,
    pub x: Shape,
    /// Type of the data input, the sum operand and the output.
    pub ty: EdgeType,
}

impl ConvProblem {
    pub fn from_request(req: &KernelRequest) -> Result<Self> {
        let attrs = match &req.op {
            OpKind::Conv2d(a) => *a,
            other => return Err(Error::invalid(format!("{other} is not a convolution"))),
        };
        if req.inputs.len() != attrs.arity() {
            return Err(Error::invalid(format!(
                "conv2d expects {} inputs, got {}",
                attrs.arity(),
                req.inputs.len()
            )));
        }
        let (x, ty) = req.inputs[0].clone();
        let filter = req.inputs[1].0.clone();
        if let Some((_, out_ty)) = req.outputs.first() {
            if *out_ty != ty {
                return Err(Error::invalid(format!(
                    "conv2d output {out_ty} differs from input {ty}"
                )));
            }
        }
        Ok(ConvProblem {
            attrs,
            filter,
            x,
            ty,
        })
    }

    pub fn oc(&self) -> usize {
        self.filter.dims().first().copied().unwrap_or(0)
    }

    pub fn ic_g(&self) -> usize {
        self.filter.dims().get(1).copied().unwrap_or(0)
    }

    pub fn oc_g(&self) -> usize {
        self.oc() / self.attrs.group.max(1)
    }

    pub fn block(&self) -> usize {
        self.ty.format.channel_block()
    }

    /// Synthetic trial for source shape `x`.
    pub fn trial(&self, x: &Shape) -> Result<TrialSpec> {
        let y = self.attrs.output_shape(x, &self.filter)?;
        let mut inputs = vec![(x.clone(), self.ty)];
        if self.attrs.fuse.sum {
            inputs.push((y.clone(), self.ty));
        }
        Ok(TrialSpec {
            inputs,
            outputs: vec![(y, self.ty)],
        })
    }

    /// Random raw filter and bias for autotuning trials.
    pub fn random_weights(&self, rng: &mut StdRng) -> (Vec<f32>, Vec<f32>) {
        let filter = (0..self.filter.elem_count())
            .map(|_| rng.gen_range(-0.5f32..0.5))
            .collect();
        let bias = if self.attrs.has_bias {
            (0..self.oc()).map(|_| rng.gen_range(-0.5f32..0.5)).collect()
        } else {
            Vec::new()
        };
        (filter, bias)
    }

    /// Bias padded to whole pairs of blocks per group.
    pub fn padded_bias(&self, bias: &[f32]) -> Result<(Vec<f32>, usize)> {
        let (g, oc_g) = (self.attrs.group, self.oc_g());
        let stride = round_up(oc_g, 2 * self.block());
        let mut out = vec![0.0f32; g * stride];
        if bias.is_empty() {
            return Ok((out, stride));
        }
        if bias.len() != self.oc() {
            return Err(Error::invalid(format!(
                "bias has {} values for {} output channels",
                bias.len(),
                self.oc()
            )));
        }
        for gi in 0..g {
            out[gi * stride..gi * stride + oc_g].copy_from_slice(&bias[gi * oc_g..(gi + 1) * oc_g]);
        }
        Ok((out, stride))
    }
}

/// Logical f32 values of a planar host tensor.
pub fn planar_f32(t: &HostTensor) -> Result<Vec<f32>> {
    if t.format().is_blocked() {
        return Err(Error::invalid(format!(
            "raw weights must be planar, got {}",
            t.format()
        )));
    }
    let values: Vec<f32> =
        vole_core::dispatch_dtype!(t.dtype(), T => t.as_slice::<T>()?.iter().map(|&v| v.to_acc()).collect());
    Ok(values)
}

/// Converted weights of one convolution manager.
#[derive(Debug)]
pub struct ConvWeights {
    /// Strategy-specific layout, in the compute element type.
    pub filter: Block,
    /// Bias per group, `bias_stride` values each (zero padded).
    pub bias: Vec<f32>,
    pub bias_stride: usize,
}

/// Shape-derived constants of a bound convolution executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeom {
    pub n: usize,
    pub ic: usize,
    pub oc: usize,
    pub group: usize,
    pub ic_g: usize,
    pub oc_g: usize,
    pub block: usize,
    pub ic_g_pck: usize,
    pub oc_g_pck: usize,
    /// Input blocks per group.
    pub icb_g: usize,
    /// Output blocks per group.
    pub ocb_g: usize,
    pub src_h: usize,
    pub src_w: usize,
    pub dst_h: usize,
    pub dst_w: usize,
    pub stage_in: bool,
    pub stage_out: bool,
    pub x_geom: FeatureGeom,
    pub y_geom: FeatureGeom,
}

impl ConvGeom {
    /// Validate `x`/`y` against the node and derive the geometry.
    /// `may_stage_in` is false for strategies that read the input through
    /// logical channel indices.
    pub fn new(prob: &ConvProblem, x: &Shape, y: &Shape, may_stage_in: bool) -> Result<Self> {
        let expected = prob.attrs.output_shape(x, &prob.filter)?;
        if &expected != y {
            return Err(Error::ShapeMismatch {
                expected,
                got: y.clone(),
            });
        }
        let block = prob.block();
        let group = prob.attrs.group;
        let (ic, oc) = (x.channels(), y.channels());
        let (ic_g, oc_g) = (ic / group, oc / group);
        let ic_g_pck = round_up(ic_g, block);
        let oc_g_pck = round_up(oc_g, block);
        Ok(ConvGeom {
            n: x.batch(),
            ic,
            oc,
            group,
            ic_g,
            oc_g,
            block,
            ic_g_pck,
            oc_g_pck,
            icb_g: ic_g_pck / block,
            ocb_g: oc_g_pck / block,
            src_h: x.dims()[2],
            src_w: x.dims()[3],
            dst_h: y.dims()[2],
            dst_w: y.dims()[3],
            stage_in: may_stage_in && group > 1 && ic_g % block != 0,
            stage_out: group > 1 && oc_g % block != 0,
            x_geom: FeatureGeom::new(x, prob.ty.format),
            y_geom: FeatureGeom::new(y, prob.ty.format),
        })
    }

    pub fn src_hw(&self) -> usize {
        self.src_h * self.src_w
    }

    pub fn dst_hw(&self) -> usize {
        self.dst_h * self.dst_w
    }

    pub fn in_stage_len(&self) -> usize {
        if self.stage_in {
            self.n * self.group * self.ic_g_pck * self.src_hw()
        } else {
            0
        }
    }

    pub fn out_stage_len(&self) -> usize {
        if self.stage_out {
            self.n * self.group * self.oc_g_pck * self.dst_hw()
        } else {
            0
        }
    }

    /// Offset of input block 0 of (batch, group) in the buffer the compute
    /// phase reads (stage or input).
    pub fn src_base(&self, b: usize, g: usize) -> usize {
        let hw_b = self.src_hw() * self.block;
        if self.stage_in {
            (b * self.group + g) * self.icb_g * hw_b
        } else {
            (b * self.x_geom.cblocks + g * self.icb_g) * hw_b
        }
    }

    /// Work-item lengths when each (batch, group) is cut into chunks of
    /// `chunk` output blocks. Returns the lengths and the chunk count per
    /// group.
    pub fn item_lens(&self, chunk: usize) -> (Vec<usize>, usize) {
        let chunks = self.ocb_g.div_ceil(chunk.max(1));
        let mut lens = Vec::with_capacity(self.n * self.group * chunks);
        for _ in 0..self.n * self.group {
            for c in 0..chunks {
                let blocks = chunk.min(self.ocb_g - c * chunk);
                lens.push(blocks * self.dst_hw() * self.block);
            }
        }
        (lens, chunks)
    }

    /// (batch, group, chunk) of work item `i`.
    pub fn item(&self, i: usize, chunks: usize) -> (usize, usize, usize) {
        let per_batch = self.group * chunks;
        (i / per_batch, (i % per_batch) / chunks, i % chunks)
    }
}

/// Byte layout of the scratch buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchPlan {
    pub in_stage: usize,
    pub out_stage: usize,
    pub per_worker: usize,
}

impl ScratchPlan {
    pub fn new(geom: &ConvGeom, elem_size: usize, per_worker: usize) -> Self {
        ScratchPlan {
            in_stage: geom.in_stage_len() * elem_size,
            out_stage: geom.out_stage_len() * elem_size,
            per_worker: round_up(per_worker, ALIGN),
        }
    }

    pub fn total(&self, workers: usize) -> usize {
        round_up(self.in_stage, ALIGN) + round_up(self.out_stage, ALIGN) + workers * self.per_worker
    }

    /// (input stage, output stage, worker scratch), each exactly sized.
    pub fn split<'a>(
        &self,
        scratch: &'a mut [u8],
        workers: usize,
    ) -> Result<(&'a mut [u8], &'a mut [u8], &'a mut [u8])> {
        let need = self.total(workers);
        if scratch.len() < need {
            return Err(Error::IndexOutOfBounds {
                index: need,
                len: scratch.len(),
            });
        }
        let (ins, rest) = scratch.split_at_mut(round_up(self.in_stage, ALIGN));
        let (outs, rest) = rest.split_at_mut(round_up(self.out_stage, ALIGN));
        let (work, _) = rest.split_at_mut(workers * self.per_worker);
        Ok((&mut ins[..self.in_stage], &mut outs[..self.out_stage], work))
    }
}

/// Bias, sum operand and activation applied when an accumulator is stored.
#[derive(Debug, Clone, Copy)]
pub struct Epilogue<'a, T> {
    pub bias: &'a [f32],
    pub bias_stride: usize,
    pub sum: Option<FeatureView<'a, T>>,
    pub fuse: FuseFlags,
    pub oc_g: usize,
}

impl<'a, T: WithDType> Epilogue<'a, T> {
    /// Final value for group-local output channel `l` at spatial `s`.
    /// Lanes past the group's channels are written as zero.
    #[inline]
    pub fn apply(&self, b: usize, g: usize, l: usize, s: usize, acc: f32) -> T {
        if l >= self.oc_g {
            return T::zero();
        }
        let mut v = acc + self.bias.get(g * self.bias_stride + l).copied().unwrap_or(0.0);
        if let Some(sum) = &self.sum {
            v += sum.get(b, g * self.oc_g + l, s).to_acc();
        }
        if self.fuse.relu {
            v = v.max(0.0);
        }
        if self.fuse.relu6 {
            v = v.clamp(0.0, 6.0);
        }
        T::from_acc(v)
    }
}

/// Phase 1: copy each group's input channels into block-aligned storage.
pub fn pack_input<T: WithDType>(
    pool: &WorkerPool,
    geom: &ConvGeom,
    x: &[T],
    stage: &mut [T],
) -> Result<()> {
    let xv = FeatureView::with_geom(x, geom.x_geom)?;
    let (b_n, hw) = (geom.block, geom.src_hw());
    let lens = vec![geom.icb_g * hw * b_n; geom.n * geom.group];
    pool.for_each_split(stage, &lens, &mut [], 0, |i, part, _| {
        let (b, g) = (i / geom.group, i % geom.group);
        for c in 0..geom.ic_g_pck {
            for s in 0..hw {
                part[((c / b_n) * hw + s) * b_n + c % b_n] = if c < geom.ic_g {
                    xv.get(b, g * geom.ic_g + c, s)
                } else {
                    T::zero()
                };
            }
        }
        Ok(())
    })
}

/// Phase 3: move the output stage into the real output, zeroing padded lanes.
pub fn scatter_output<T: WithDType>(
    pool: &WorkerPool,
    geom: &ConvGeom,
    stage: &[T],
    y: &mut [T],
) -> Result<()> {
    let (b_n, hw) = (geom.block, geom.dst_hw());
    let yg = geom.y_geom;
    let one = FeatureGeom { batch: 1, ..yg };
    let lens = vec![yg.batch_stride(); geom.n];
    pool.for_each_split(y, &lens, &mut [], 0, |b, part, _| {
        let mut yv = FeatureViewMut::with_geom(part, one)?;
        for c in 0..yg.cblocks * b_n {
            for s in 0..hw {
                let v = if c < geom.oc {
                    let (g, l) = (c / geom.oc_g, c % geom.oc_g);
                    stage[(((b * geom.group + g) * geom.ocb_g + l / b_n) * hw + s) * b_n + l % b_n]
                } else {
                    T::zero()
                };
                yv.set(0, c, s, v);
            }
        }
        Ok(())
    })
}

/// View worker scratch as f32.
pub fn f32_scratch(ws: &mut [u8]) -> Result<&mut [f32]> {
    cast_bytes_mut::<f32>(ws)
}
