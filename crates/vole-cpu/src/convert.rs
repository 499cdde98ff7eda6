// Converter — format and element-type bridge between two edge types.
//
// Copies every logical (n, c, s) element from the source layout to the
// target layout, casting through f64, then writes the consumer's identity
// into the target's padded channel lanes. Work items are batch items.

use vole_core::tune::TrialSpec;
use vole_core::{
    EdgeType, Error, ExecArgs, ExecState, FeatureGeom, FeatureView, FeatureViewMut, PadFill,
    Result, RuntimeExecutor, Shape, WithDType,
};

use crate::plain::{expect_count, PlainKernel};

#[derive(Debug, Clone, PartialEq)]
pub struct ConvertKernel {
    pub from: EdgeType,
    pub to: EdgeType,
    pub fill: PadFill,
}

impl PlainKernel for ConvertKernel {
    const NAME: &'static str = "converter";

    fn supported(&self) -> bool {
        true
    }

    fn executor(&self, _workers: usize) -> Box<dyn RuntimeExecutor> {
        Box::new(ConvertExec {
            kernel: self.clone(),
            state: ExecState::default(),
        })
    }

    fn trial(&self, src: &[Shape]) -> Result<TrialSpec> {
        expect_count("converter", src, 1)?;
        Ok(TrialSpec {
            inputs: vec![(src[0].clone(), self.from)],
            outputs: vec![(src[0].clone(), self.to)],
        })
    }
}

#[derive(Debug)]
pub struct ConvertExec {
    kernel: ConvertKernel,
    state: ExecState,
}

impl ConvertExec {
    fn run<S: WithDType, D: WithDType>(&self, mut args: ExecArgs<'_>) -> Result<()> {
        let shape = self.state.src(0)?;
        let xv = FeatureView::new(args.input(0)?.typed::<S>()?, shape, self.kernel.from.format)?;
        let yg = FeatureGeom::new(shape, self.kernel.to.format);
        let pool = args.pool;
        let y = args.take_output(0)?.into_typed::<D>()?;
        if y.len() < yg.storage_len() {
            return Err(Error::IndexOutOfBounds {
                index: yg.storage_len(),
                len: y.len(),
            });
        }
        let one = FeatureGeom { batch: 1, ..yg };
        let lens = vec![one.storage_len(); yg.batch];
        let pad = self.kernel.fill.value::<D>();
        pool.for_each_split(y, &lens, &mut [], 0, |n, part, _| {
            let mut out = FeatureViewMut::with_geom(part, one)?;
            for c in 0..yg.channels {
                for s in 0..yg.spatial {
                    out.set(0, c, s, D::from_f64(xv.get(n, c, s).to_f64()));
                }
            }
            out.fill_padding(pad);
            Ok(())
        })
    }
}

impl RuntimeExecutor for ConvertExec {
    fn algorithm(&self) -> &'static str {
        "converter"
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
        expect_count("converter sources", src, 1)?;
        expect_count("converter destinations", dst, 1)?;
        if src[0] != dst[0] {
            return Err(Error::ShapeMismatch {
                expected: src[0].clone(),
                got: dst[0].clone(),
            });
        }
        for ty in [self.kernel.from, self.kernel.to] {
            if !ty.format.can_hold(&src[0]) {
                return Err(Error::invalid(format!("{ty} cannot hold {}", src[0])));
            }
        }
        self.state.mark_prepared();
        Ok(())
    }

    fn execute(&self, args: ExecArgs<'_>) -> Result<()> {
        self.state.ensure_ready()?;
        let (from, to) = (self.kernel.from.dtype, self.kernel.to.dtype);
        vole_core::dispatch_dtype!(from, S => vole_core::dispatch_dtype!(to, D => self.run::<S, D>(args)))
    }

    fn is_ready(&self) -> bool {
        self.state.is_ready()
    }
}

/// Convert a host tensor to `to` outside any graph (constants, session I/O).
pub fn convert_host(
    x: &vole_core::HostTensor,
    to: EdgeType,
    fill: PadFill,
    pool: &vole_core::WorkerPool,
) -> Result<vole_core::HostTensor> {
    if x.ty() == to {
        return Ok(x.clone());
    }
    let kernel = ConvertKernel {
        from: x.ty(),
        to,
        fill,
    };
    let mut exec = kernel.executor(pool.workers());
    exec.set_shapes(vec![x.shape().clone()], vec![x.shape().clone()]);
    exec.prepare()?;
    let mut y = vole_core::HostTensor::zeros(x.shape().clone(), to);
    exec.execute(ExecArgs {
        inputs: vec![vole_core::TensorRef::new(x.bytes(), x.ty())],
        outputs: vec![vole_core::TensorMut::new(y.bytes_mut(), to)],
        scratch: &mut [],
        pool,
    })?;
    Ok(y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;
    use vole_core::{DType, DataFormat, HostTensor, WorkerPool};

    #[test]
    fn test_round_trip_through_blocked_half() {
        let pool = WorkerPool::new(2).unwrap();
        let vals: Vec<f32> = (0..2 * 5 * 3).map(|v| v as f32 * 0.5).collect();
        let x = HostTensor::from_vec(vals.clone(), (2, 5, 3)).unwrap();
        let blocked = EdgeType::new(DataFormat::N8cx, DType::F16);
        let b = convert_host(&x, blocked, PadFill::Lowest, &pool).unwrap();
        assert_eq!(b.as_slice::<f16>().unwrap().len(), 2 * 8 * 3);
        // batch 0, spatial 0, lane 5 is padding
        assert_eq!(b.as_slice::<f16>().unwrap()[5], f16::MIN);
        let back = convert_host(&b, EdgeType::ndarray(DType::F32), PadFill::Zero, &pool).unwrap();
        assert_eq!(back.to_vec::<f32>().unwrap(), vals);
    }

    #[test]
    fn test_identity_conversion_is_a_copy() {
        let pool = WorkerPool::new(1).unwrap();
        let x = HostTensor::from_vec(vec![1i64, 2, 3], 3).unwrap();
        let y = convert_host(&x, x.ty(), PadFill::Zero, &pool).unwrap();
        assert_eq!(y.to_vec::<i64>().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_blocked_format_needs_channel_axis() {
        let pool = WorkerPool::new(1).unwrap();
        let x = HostTensor::from_vec(vec![1.0f32; 4], 4).unwrap();
        let to = EdgeType::new(DataFormat::N4cx, DType::F32);
        assert!(convert_host(&x, to, PadFill::Zero, &pool).is_err());
    }
}
