// Reduce — max/min/sum/mean/prod over a set of axes
//
// Input and output are addressed through their logical (n, c, s)
// coordinates, so the same loop serves planar and channel-blocked buffers.
// Only real channels are visited: padded lanes of a blocked input never
// enter a reduction, whatever they hold. Padded lanes of a blocked output
// are written as zero.
//
// A blocked output is only produced when neither the batch nor the channel
// axis is reduced; otherwise the output is planar.
//
// Work items are output batch items when the batch axis survives, otherwise
// the whole output is one item. Sums, means and products accumulate in f64;
// max and min compare in the element type.

use vole_core::tune::TrialSpec;
use vole_core::{
    EdgeType, Error, ExecArgs, ExecState, FeatureGeom, FeatureView, FeatureViewMut, Result,
    RuntimeExecutor, Shape, WithDType,
};
use vole_ir::{ReduceAttrs, ReduceKind};

use crate::plain::{expect_count, PlainKernel};

#[derive(Debug, Clone, PartialEq)]
pub struct ReduceKernel {
    pub attrs: ReduceAttrs,
    pub x: Shape,
    pub in_ty: EdgeType,
    pub out_ty: EdgeType,
}

impl ReduceKernel {
    /// Whether a reduction of `x` over `attrs` may keep a blocked format.
    pub fn keeps_blocking(attrs: &ReduceAttrs, x: &Shape) -> bool {
        match (attrs.resolved_axes(x), attrs.output_shape(x)) {
            (Ok(axes), Ok(y)) => !axes.contains(&0) && !axes.contains(&1) && y.rank() >= 2,
            _ => false,
        }
    }
}

impl PlainKernel for ReduceKernel {
    const NAME: &'static str = "reduce";

    fn supported(&self) -> bool {
        let blocked_ok =
            !self.out_ty.format.is_blocked() || Self::keeps_blocking(&self.attrs, &self.x);
        self.in_ty.dtype == self.out_ty.dtype
            && blocked_ok
            && self.attrs.resolved_axes(&self.x).is_ok()
    }

    fn executor(&self, _workers: usize) -> Box<dyn RuntimeExecutor> {
        Box::new(ReduceExec {
            attrs: self.attrs.clone(),
            in_ty: self.in_ty,
            out_ty: self.out_ty,
            state: ExecState::default(),
            plan: None,
        })
    }

    fn trial(&self, src: &[Shape]) -> Result<TrialSpec> {
        expect_count("reduce", src, 1)?;
        let y = self.attrs.output_shape(&src[0])?;
        Ok(TrialSpec {
            inputs: vec![(src[0].clone(), self.in_ty)],
            outputs: vec![(y, self.out_ty)],
        })
    }
}

/// Row-major multi-index of `flat` within `dims`.
fn unravel(mut flat: usize, dims: &[usize], out: &mut [usize]) {
    for (i, &d) in dims.iter().enumerate().rev() {
        if d == 0 {
            out[i] = 0;
            continue;
        }
        out[i] = flat % d;
        flat /= d;
    }
}

/// (n, c, s) of a logical multi-index.
fn feature_coords(dims: &[usize], idx: &[usize]) -> (usize, usize, usize) {
    let n = idx.first().copied().unwrap_or(0);
    let c = idx.get(1).copied().unwrap_or(0);
    let mut s = 0;
    for (d, i) in dims.iter().zip(idx).skip(2) {
        s = s * d + i;
    }
    (n, c, s)
}

#[derive(Debug, Clone)]
struct ReducePlan {
    in_dims: Vec<usize>,
    out_dims: Vec<usize>,
    reduced: Vec<usize>,
    kept: Vec<usize>,
    reduce_len: usize,
    per_item: usize,
    items: usize,
}

#[derive(Debug)]
pub struct ReduceExec {
    attrs: ReduceAttrs,
    in_ty: EdgeType,
    out_ty: EdgeType,
    state: ExecState,
    plan: Option<ReducePlan>,
}

impl ReduceExec {
    fn run<T: WithDType>(&self, plan: &ReducePlan, mut args: ExecArgs<'_>) -> Result<()> {
        let x_shape = Shape::new(plan.in_dims.clone());
        let y_shape = Shape::new(plan.out_dims.clone());
        let xv = FeatureView::new(args.input(0)?.typed::<T>()?, &x_shape, self.in_ty.format)?;
        let yg = FeatureGeom::new(&y_shape, self.out_ty.format);
        let pool = args.pool;
        let y = args.take_output(0)?.into_typed::<T>()?;

        let item_geom = if plan.items == 1 {
            yg
        } else {
            FeatureGeom { batch: 1, ..yg }
        };
        let lens = vec![item_geom.storage_len(); plan.items];
        let kind = self.attrs.kind;
        let keepdims = self.attrs.keepdims;

        pool.for_each_split(y, &lens, &mut [], 0, |item, part, _| {
            let mut yv = FeatureViewMut::with_geom(part, item_geom)?;
            let mut out_idx = vec![0usize; plan.out_dims.len()];
            let mut in_idx = vec![0usize; plan.in_dims.len()];
            let mut red_idx = vec![0usize; plan.reduced.len()];
            let red_dims: Vec<usize> = plan.reduced.iter().map(|&a| plan.in_dims[a]).collect();

            for o in item * plan.per_item..(item + 1) * plan.per_item {
                unravel(o, &plan.out_dims, &mut out_idx);
                for (k, &a) in plan.kept.iter().enumerate() {
                    in_idx[a] = if keepdims { out_idx[a] } else { out_idx[k] };
                }
                let mut m = match kind {
                    ReduceKind::Max => T::lowest(),
                    _ => T::highest(),
                };
                let mut acc = match kind {
                    ReduceKind::Prod => 1.0f64,
                    _ => 0.0,
                };
                for r in 0..plan.reduce_len {
                    unravel(r, &red_dims, &mut red_idx);
                    for (k, &a) in plan.reduced.iter().enumerate() {
                        in_idx[a] = red_idx[k];
                    }
                    let (n, c, s) = feature_coords(&plan.in_dims, &in_idx);
                    let v = xv.get(n, c, s);
                    match kind {
                        ReduceKind::Max => m = m.max_of(v),
                        ReduceKind::Min => m = m.min_of(v),
                        ReduceKind::Sum | ReduceKind::Mean => acc += v.to_f64(),
                        ReduceKind::Prod => acc *= v.to_f64(),
                    }
                }
                let value = match kind {
                    ReduceKind::Max | ReduceKind::Min => m,
                    ReduceKind::Mean if plan.reduce_len > 0 => {
                        T::from_f64(acc / plan.reduce_len as f64)
                    }
                    _ => T::from_f64(acc),
                };
                let (n, c, s) = feature_coords(&plan.out_dims, &out_idx);
                let n = if plan.items == 1 { n } else { 0 };
                yv.set(n, c, s, value);
            }
            if item_geom.block > 1 {
                yv.fill_padding(T::zero());
            }
            Ok(())
        })
    }
}

impl RuntimeExecutor for ReduceExec {
    fn algorithm(&self) -> &'static str {
        "reduce"
    }

    fn set_shapes(&mut self, src: Vec<Shape>, dst: Vec<Shape>) {
        self.state.bind(src, dst);
        self.plan = None;
    }

    fn cal_temp_buffer_size(&self) -> Result<usize> {
        self.state.shapes()?;
        Ok(0)
    }

    fn prepare(&mut self) -> Result<()> {
        let (src, dst) = self.state.shapes()?;
        expect_count("reduce sources", src, 1)?;
        expect_count("reduce destinations", dst, 1)?;
        let x = &src[0];
        let expected = self.attrs.output_shape(x)?;
        if expected != dst[0] {
            return Err(Error::ShapeMismatch {
                expected,
                got: dst[0].clone(),
            });
        }
        if self.out_ty.format.is_blocked() && !ReduceKernel::keeps_blocking(&self.attrs, x) {
            return Err(Error::invalid(format!(
                "reduce over {:?} cannot produce {}",
                self.attrs.axes, self.out_ty
            )));
        }
        let reduced = self.attrs.resolved_axes(x)?;
        let kept: Vec<usize> = (0..x.rank()).filter(|a| !reduced.contains(a)).collect();
        let reduce_len = reduced.iter().map(|&a| x.dims()[a]).product();
        let by_batch = kept.first() == Some(&0) && expected.rank() > 0;
        let (items, per_item) = if by_batch && expected.dims()[0] > 0 {
            let n = expected.dims()[0];
            (n, expected.elem_count() / n)
        } else {
            (1, expected.elem_count())
        };
        self.plan = Some(ReducePlan {
            in_dims: x.dims().to_vec(),
            out_dims: expected.dims().to_vec(),
            reduced,
            kept,
            reduce_len,
            per_item,
            items,
        });
        self.state.mark_prepared();
        Ok(())
    }

    fn execute(&self, args: ExecArgs<'_>) -> Result<()> {
        self.state.ensure_ready()?;
        let plan = self
            .plan
            .as_ref()
            .ok_or_else(|| Error::invalid("reduce plan missing"))?;
        if plan.out_dims.contains(&0) {
            return Ok(());
        }
        vole_core::dispatch_dtype!(self.in_ty.dtype, T => self.run::<T>(plan, args))
    }

    fn is_ready(&self) -> bool {
        self.state.is_ready()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vole_core::{DType, DataFormat, HostTensor, TensorMut, TensorRef, WorkerPool};

    fn run(k: &ReduceKernel, x: &HostTensor) -> HostTensor {
        let spec = k.trial(&[x.shape().clone()]).unwrap();
        let (y_shape, ty) = spec.outputs[0].clone();
        let mut exec = k.executor(1);
        exec.set_shapes(spec.input_shapes(), spec.output_shapes());
        exec.prepare().unwrap();
        let mut y = HostTensor::zeros(y_shape, ty);
        let pool = WorkerPool::new(2).unwrap();
        exec.execute(ExecArgs {
            inputs: vec![TensorRef::new(x.bytes(), x.ty())],
            outputs: vec![TensorMut::new(y.bytes_mut(), ty)],
            scratch: &mut [],
            pool: &pool,
        })
        .unwrap();
        y
    }

    fn kernel(kind: ReduceKind, axes: Vec<i64>, keepdims: bool, x: &HostTensor, out: EdgeType) -> ReduceKernel {
        ReduceKernel {
            attrs: ReduceAttrs::new(kind, axes, keepdims),
            x: x.shape().clone(),
            in_ty: x.ty(),
            out_ty: out,
        }
    }

    #[test]
    fn test_unravel_and_coords() {
        let mut idx = [0; 3];
        unravel(7, &[2, 2, 3], &mut idx);
        assert_eq!(idx, [1, 0, 1]);
        assert_eq!(feature_coords(&[2, 3, 4, 5], &[1, 2, 3, 4]), (1, 2, 19));
        assert_eq!(feature_coords(&[6], &[4]), (4, 0, 0));
    }

    #[test]
    fn test_planar_sum_and_mean() {
        let x = HostTensor::from_vec((0..6).map(|v| v as f32).collect(), (2, 3)).unwrap();
        let k = kernel(ReduceKind::Sum, vec![1], false, &x, EdgeType::ndarray(DType::F32));
        assert_eq!(run(&k, &x).to_vec::<f32>().unwrap(), vec![3.0, 12.0]);
        let k = kernel(ReduceKind::Mean, vec![0], true, &x, EdgeType::ndarray(DType::F32));
        let y = run(&k, &x);
        assert_eq!(y.shape().dims(), &[1, 3]);
        assert_eq!(y.to_vec::<f32>().unwrap(), vec![1.5, 2.5, 3.5]);
    }

    #[test]
    fn test_reduce_all_axes() {
        let x = HostTensor::from_vec(vec![2i64, 3, 4], 3).unwrap();
        let k = kernel(ReduceKind::Prod, vec![], false, &x, EdgeType::ndarray(DType::I64));
        let y = run(&k, &x);
        assert_eq!(y.shape().rank(), 0);
        assert_eq!(y.to_vec::<i64>().unwrap(), vec![24]);
    }

    #[test]
    fn test_blocked_spatial_reduce_keeps_blocking() {
        let ty = EdgeType::new(DataFormat::N4cx, DType::F32);
        let mut x = HostTensor::zeros((1, 3, 2, 1), ty);
        {
            let d = x.as_mut_slice::<f32>().unwrap();
            // [s][lane]
            d.copy_from_slice(&[1.0, 5.0, -1.0, 9.0, 2.0, 4.0, -3.0, 9.0]);
        }
        let k = kernel(ReduceKind::Max, vec![2, 3], true, &x, ty);
        assert!(k.supported());
        let y = run(&k, &x);
        assert_eq!(y.as_slice::<f32>().unwrap(), &[2.0, 5.0, -1.0, 0.0]);
    }

    #[test]
    fn test_blocked_output_rejected_when_channels_reduced() {
        let ty = EdgeType::new(DataFormat::N4cx, DType::F32);
        let x = HostTensor::zeros((1, 3, 2, 2), ty);
        let k = kernel(ReduceKind::Sum, vec![1], true, &x, ty);
        assert!(!k.supported());
    }
}
