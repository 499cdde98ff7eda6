// 2-D max pooling over planar or channel-blocked feature maps.
//
// Work items are (batch, channel block) planes, which are contiguous in
// every format. Each window starts at lowest() and skips positions that
// fall in the padding, so an all-padding window yields lowest(). Padded
// channel lanes of the output are written as zero.

use vole_core::tune::TrialSpec;
use vole_core::{
    EdgeType, Error, ExecArgs, ExecState, FeatureGeom, Result, RuntimeExecutor, Shape, WithDType,
};
use vole_ir::Pool2dAttrs;

use crate::plain::{expect_count, PlainKernel};

#[derive(Debug, Clone, PartialEq)]
pub struct MaxPoolKernel {
    pub attrs: Pool2dAttrs,
    pub ty: EdgeType,
}

impl PlainKernel for MaxPoolKernel {
    const NAME: &'static str = "maxpool2d";

    fn supported(&self) -> bool {
        let [kh, kw] = self.attrs.kernel;
        kh > 0 && kw > 0 && self.attrs.stride.iter().all(|&s| s > 0)
    }

    fn executor(&self, _workers: usize) -> Box<dyn RuntimeExecutor> {
        Box::new(MaxPoolExec {
            attrs: self.attrs,
            ty: self.ty,
            state: ExecState::default(),
        })
    }

    fn trial(&self, src: &[Shape]) -> Result<TrialSpec> {
        expect_count("maxpool2d", src, 1)?;
        let y = self.attrs.output_shape(&src[0])?;
        Ok(TrialSpec {
            inputs: vec![(src[0].clone(), self.ty)],
            outputs: vec![(y, self.ty)],
        })
    }
}

#[derive(Debug)]
pub struct MaxPoolExec {
    attrs: Pool2dAttrs,
    ty: EdgeType,
    state: ExecState,
}

impl MaxPoolExec {
    fn run<T: WithDType>(&self, mut args: ExecArgs<'_>) -> Result<()> {
        let x_shape = self.state.src(0)?;
        let y_shape = self.state.dst(0)?;
        let xg = FeatureGeom::new(x_shape, self.ty.format);
        let yg = FeatureGeom::new(y_shape, self.ty.format);
        if yg.storage_len() == 0 {
            return Ok(());
        }
        let x = args.input(0)?.typed::<T>()?;
        let pool = args.pool;
        let y = args.take_output(0)?.into_typed::<T>()?;
        if x.len() < xg.storage_len() || y.len() < yg.storage_len() {
            return Err(Error::invalid("maxpool2d buffers are smaller than their shapes"));
        }

        let (src_h, src_w) = (x_shape.dims()[2], x_shape.dims()[3]);
        let dst_w = y_shape.dims()[3];
        let a = self.attrs;
        let b = yg.block;
        let lens = vec![yg.block_stride(); yg.batch * yg.cblocks];
        pool.for_each_split(y, &lens, &mut [], 0, |i, part, _| {
            let src = &x[i * xg.block_stride()..(i + 1) * xg.block_stride()];
            let cb = i % yg.cblocks;
            for s in 0..yg.spatial {
                let (oh, ow) = (s / dst_w, s % dst_w);
                for lane in 0..b {
                    if cb * b + lane >= yg.channels {
                        part[s * b + lane] = T::zero();
                        continue;
                    }
                    let mut m = T::lowest();
                    for kh in 0..a.kernel[0] {
                        let ih = (oh * a.stride[0] + kh) as isize - a.pad[0] as isize;
                        if ih < 0 || ih >= src_h as isize {
                            continue;
                        }
                        for kw in 0..a.kernel[1] {
                            let iw = (ow * a.stride[1] + kw) as isize - a.pad[1] as isize;
                            if iw < 0 || iw >= src_w as isize {
                                continue;
                            }
                            let v = src[(ih as usize * src_w + iw as usize) * b + lane];
                            m = m.max_of(v);
                        }
                    }
                    part[s * b + lane] = m;
                }
            }
            Ok(())
        })
    }
}

impl RuntimeExecutor for MaxPoolExec {
    fn algorithm(&self) -> &'static str {
        "maxpool2d"
    }

    fn set_shapes(&mut self, src: Vec<Shape>, dst: Vec<Shape>) {
        self.state.bind(src, dst);
    }

    fn cal_temp_buffer_size(&self) -> Result<usize> {
        self.state.shapes()?;
        Ok(0)
    }

    fn prepare(&mut self) -> Result<()> {
        let (src, dst) = self.state.shapes()?;
        expect_count("maxpool2d sources", src, 1)?;
        expect_count("maxpool2d destinations", dst, 1)?;
        let expected = self.attrs.output_shape(&src[0])?;
        if expected != dst[0] {
            return Err(Error::ShapeMismatch {
                expected,
                got: dst[0].clone(),
            });
        }
        self.state.mark_prepared();
        Ok(())
    }

    fn execute(&self, args: ExecArgs<'_>) -> Result<()> {
        self.state.ensure_ready()?;
        vole_core::dispatch_dtype!(self.ty.dtype, T => self.run::<T>(args))
    }

    fn is_ready(&self) -> bool {
        self.state.is_ready()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vole_core::{DType, DataFormat, HostTensor, TensorMut, TensorRef, WorkerPool};

    fn run(kernel: &MaxPoolKernel, x: &HostTensor) -> HostTensor {
        let spec = kernel.trial(&[x.shape().clone()]).unwrap();
        let (y_shape, ty) = spec.outputs[0].clone();
        let mut exec = kernel.executor(1);
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

    #[test]
    fn test_planar_max_with_padding() {
        let k = MaxPoolKernel {
            attrs: Pool2dAttrs::new([2, 2], [2, 2]).with_pad([1, 1]),
            ty: EdgeType::ndarray(DType::F32),
        };
        // 1x1x3x3, values -1..-9 so the padding must not contribute zeros.
        let vals: Vec<f32> = (1..=9).map(|v| -(v as f32)).collect();
        let x = HostTensor::from_vec(vals, (1, 1, 3, 3)).unwrap();
        let y = run(&k, &x);
        assert_eq!(y.shape().dims(), &[1, 1, 2, 2]);
        assert_eq!(y.to_vec::<f32>().unwrap(), vec![-1.0, -2.0, -4.0, -5.0]);
    }

    #[test]
    fn test_blocked_padded_lanes_are_zero() {
        let ty = EdgeType::new(DataFormat::N4cx, DType::F32);
        let k = MaxPoolKernel {
            attrs: Pool2dAttrs::new([2, 2], [2, 2]),
            ty,
        };
        // 1 x 3 channels x 2 x 2, stored as one block of 4 lanes.
        let mut x = HostTensor::zeros((1, 3, 2, 2), ty);
        {
            let d = x.as_mut_slice::<f32>().unwrap();
            for s in 0..4 {
                for lane in 0..3 {
                    d[s * 4 + lane] = (lane * 10 + s) as f32;
                }
                d[s * 4 + 3] = 99.0;
            }
        }
        let y = run(&k, &x);
        assert_eq!(y.as_slice::<f32>().unwrap(), &[3.0, 13.0, 23.0, 0.0]);
    }
}
