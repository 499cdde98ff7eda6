// Element-wise kernels: relu, clip, add, mul.
//
// Same-shape operands are processed over their whole storage in fixed
// chunks, which is valid in every format because both sides share one
// layout. Blocked outputs then get their padded lanes reset to zero, since
// clip can map zero to something else.
//
// Operands of different shapes broadcast numpy-style, planar only: each
// input is read through a Layout whose broadcast axes have stride 0.

use vole_core::tune::TrialSpec;
use vole_core::{
    EdgeType, Error, ExecArgs, ExecState, FeatureViewMut, Layout, Result, RuntimeExecutor, Shape,
    View, WithDType,
};
use vole_ir::OpKind;

use crate::plain::{expect_count, PlainKernel};

const CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EltOp {
    Relu,
    Clip { min: f32, max: f32 },
    Add,
    Mul,
}

impl EltOp {
    pub fn from_kind(kind: &OpKind) -> Option<EltOp> {
        match kind {
            OpKind::Relu => Some(EltOp::Relu),
            OpKind::Clip { min, max } => Some(EltOp::Clip {
                min: *min,
                max: *max,
            }),
            OpKind::Add => Some(EltOp::Add),
            OpKind::Mul => Some(EltOp::Mul),
            _ => None,
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            EltOp::Relu | EltOp::Clip { .. } => 1,
            EltOp::Add | EltOp::Mul => 2,
        }
    }

    #[inline]
    fn unary<T: WithDType>(&self, v: T) -> T {
        match *self {
            EltOp::Relu => v.max_of(T::zero()),
            EltOp::Clip { min, max } => v
                .max_of(T::from_acc(min))
                .min_of(T::from_acc(max)),
            _ => v,
        }
    }

    #[inline]
    fn binary<T: WithDType>(&self, a: T, b: T) -> T {
        match self {
            EltOp::Mul => T::from_f64(a.to_f64() * b.to_f64()),
            _ => T::from_f64(a.to_f64() + b.to_f64()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EltwiseKernel {
    pub op: EltOp,
    pub ty: EdgeType,
}

impl PlainKernel for EltwiseKernel {
    const NAME: &'static str = "eltwise";

    fn supported(&self) -> bool {
        match self.op {
            EltOp::Clip { min, max } => min <= max,
            _ => true,
        }
    }

    fn executor(&self, _workers: usize) -> Box<dyn RuntimeExecutor> {
        Box::new(EltwiseExec {
            op: self.op,
            ty: self.ty,
            state: ExecState::default(),
        })
    }

    fn trial(&self, src: &[Shape]) -> Result<TrialSpec> {
        expect_count("eltwise", src, self.op.arity())?;
        let y = output_shape(src)?;
        Ok(TrialSpec {
            inputs: src.iter().map(|s| (s.clone(), self.ty)).collect(),
            outputs: vec![(y, self.ty)],
        })
    }
}

fn output_shape(src: &[Shape]) -> Result<Shape> {
    match src {
        [a] => Ok(a.clone()),
        [a, b] => Shape::broadcast_shape(a, b),
        _ => Err(Error::invalid(format!(
            "element-wise ops take one or two inputs, got {}",
            src.len()
        ))),
    }
}

#[derive(Debug)]
pub struct EltwiseExec {
    op: EltOp,
    ty: EdgeType,
    state: ExecState,
}

impl EltwiseExec {
    fn run<T: WithDType>(&self, mut args: ExecArgs<'_>) -> Result<()> {
        let (src, dst) = self.state.shapes()?;
        let y_shape = &dst[0];
        let pool = args.pool;
        let a = args.input(0)?.typed::<T>()?;
        let b = if self.op.arity() == 2 {
            Some(args.input(1)?.typed::<T>()?)
        } else {
            None
        };
        let y = args.take_output(0)?.into_typed::<T>()?;
        let len = self.ty.format.storage_len(y_shape);
        let y = y
            .get_mut(..len)
            .ok_or_else(|| Error::invalid("eltwise output is smaller than its shape"))?;
        let op = self.op;
        let same_shape = src.iter().all(|s| s == y_shape);
        if same_shape && (a.len() < len || b.is_some_and(|b| b.len() < len)) {
            return Err(Error::invalid("eltwise input is smaller than its shape"));
        }

        match b {
            None => pool.for_each_chunk(&mut *y, CHUNK, &mut [], 0, |i, part, _| {
                let src = &a[i * CHUNK..i * CHUNK + part.len()];
                for (o, &v) in part.iter_mut().zip(src) {
                    *o = op.unary(v);
                }
                Ok(())
            })?,
            Some(b) if src[0] == src[1] => pool.for_each_chunk(&mut *y, CHUNK, &mut [], 0, |i, part, _| {
                let r = i * CHUNK..i * CHUNK + part.len();
                for ((o, &u), &v) in part.iter_mut().zip(&a[r.clone()]).zip(&b[r]) {
                    *o = op.binary(u, v);
                }
                Ok(())
            })?,
            Some(b) => {
                let la = Layout::new(y_shape.clone(), src[0].broadcast_strides(y_shape), 0);
                let lb = Layout::new(y_shape.clone(), src[1].broadcast_strides(y_shape), 0);
                let va = View::new(a, &la)?;
                let vb = View::new(b, &lb)?;
                pool.for_each_split(&mut *y, &[len], &mut [], 0, |_, part, _| {
                    for ((o, u), v) in part.iter_mut().zip(va.iter()).zip(vb.iter()) {
                        *o = op.binary(u, v);
                    }
                    Ok(())
                })?
            }
        }

        if self.ty.format.is_blocked() && y_shape.rank() >= 2 {
            FeatureViewMut::new(y, y_shape, self.ty.format)?.fill_padding(T::zero());
        }
        Ok(())
    }
}

impl RuntimeExecutor for EltwiseExec {
    fn algorithm(&self) -> &'static str {
        "eltwise"
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
        expect_count("eltwise sources", src, self.op.arity())?;
        expect_count("eltwise destinations", dst, 1)?;
        let expected = output_shape(src)?;
        if expected != dst[0] {
            return Err(Error::ShapeMismatch {
                expected,
                got: dst[0].clone(),
            });
        }
        if self.ty.format.is_blocked() && src.iter().any(|s| *s != dst[0]) {
            return Err(Error::invalid(format!(
                "{} operands must have identical shapes to broadcast",
                self.ty
            )));
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
