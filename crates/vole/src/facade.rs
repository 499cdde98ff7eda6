// Operator facades — the graph-visible side of an operator
//
// A facade wraps one node for the pipeline. It knows the node's static
// attributes and the profile of the backend it was instantiated on, and
// answers three kinds of questions without touching any kernel:
//
//   infer_shapes   output shapes from input shapes
//   accepts        which edge types an input may arrive in
//   offers         which edge types an output can be produced in, given the
//                  types its inputs resolved to
//
// KEY CONCEPTS:
//
// 1. **Accept sets are ordered**: the first entry is the facade's favourite.
//    An empty accept set means "anything", which is what weight inputs
//    declare: they are consumed raw by weight conversion.
//
// 2. **Pass-through facades follow hints**: element-wise operators handle
//    every type of their backend, so they move the types their consumers
//    want to the front of their own accept sets. That lets a chain of
//    element-wise nodes inherit the layout of whatever reads it last.
//
// 3. **Dynamic constraints**: a binary element-wise operator additionally
//    needs its second operand in the type the first one resolved to. This
//    is only known during the forward sweep, so it is a separate query.
//
//   Conv2d       x, sum: native compute types     out: type of x
//   MaxPool2d    x: native compute types          out: type of x
//   Reduce       x: every backend type            out: type of x, or planar
//   eltwise      every backend type, hint first   out: type of input 0
//   Converter    its source type                  out: its target type

use std::fmt;

use vole_core::{EdgeType, Error, PadFill, Result, Shape};
use vole_cpu::reduce::ReduceKernel;
use vole_cpu::BackendProfile;
use vole_ir::{Conv2dAttrs, OpKind, Pool2dAttrs, ReduceAttrs};

/// Graph-visible wrapper around one node.
pub trait OpFacade: fmt::Debug + Send + Sync {
    fn op(&self) -> &OpKind;

    /// Name of the backend the facade was instantiated on.
    fn backend(&self) -> &str;

    fn infer_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>>;

    /// Types input `input` may arrive in, favourite first. `hint` is what
    /// the readers of this node's first output would like to receive.
    fn accepts(&self, input: usize, shapes: &[Shape], hint: &[EdgeType]) -> Vec<EdgeType>;

    /// Types output `output` can be produced in, given the input types.
    fn offers(&self, output: usize, shapes: &[Shape], types: &[EdgeType]) -> Vec<EdgeType>;

    /// The type input `input` must have given the other inputs' types.
    fn constraint(&self, _input: usize, _types: &[EdgeType]) -> Option<EdgeType> {
        None
    }

    /// Identity the kernel expects in padded lanes of input `input`.
    fn pad_fill(&self, _input: usize) -> PadFill {
        PadFill::Zero
    }

    /// Constant inputs consumed by weight conversion: filter first, then
    /// bias. They never reach the executor.
    fn weight_inputs(&self) -> Vec<usize> {
        Vec::new()
    }

    fn is_weight(&self, input: usize) -> bool {
        self.weight_inputs().contains(&input)
    }
}

/// Build the facade for `op` on `profile`.
pub fn make_facade(op: &OpKind, profile: &BackendProfile) -> Result<Box<dyn OpFacade>> {
    let profile = profile.clone();
    let facade: Box<dyn OpFacade> = match op {
        OpKind::Conv2d(attrs) => Box::new(ConvFacade::new(*attrs, profile)),
        OpKind::MaxPool2d(attrs) => Box::new(PoolFacade {
            op: op.clone(),
            attrs: *attrs,
            profile,
        }),
        OpKind::Reduce(attrs) => Box::new(ReduceFacade {
            op: op.clone(),
            attrs: attrs.clone(),
            profile,
        }),
        OpKind::Relu | OpKind::Clip { .. } | OpKind::Add | OpKind::Mul => {
            Box::new(EltwiseFacade {
                op: op.clone(),
                profile,
            })
        }
        OpKind::Converter { .. } => {
            return Err(Error::invalid(
                "converter nodes are inserted by negotiation, not by the caller",
            ))
        }
        OpKind::Custom { name } => {
            return Err(Error::unsupported(format!(
                "no facade for custom operator '{name}'"
            )))
        }
    };
    Ok(facade)
}

fn arg<'a>(shapes: &'a [Shape], i: usize, op: &OpKind) -> Result<&'a Shape> {
    shapes
        .get(i)
        .ok_or_else(|| Error::invalid(format!("{op} is missing input {i}")))
}

fn first_type(types: &[EdgeType]) -> Vec<EdgeType> {
    types.first().copied().into_iter().collect()
}

// Convolution

#[derive(Debug, Clone)]
pub struct ConvFacade {
    op: OpKind,
    attrs: Conv2dAttrs,
    profile: BackendProfile,
}

impl ConvFacade {
    pub fn new(attrs: Conv2dAttrs, profile: BackendProfile) -> Self {
        ConvFacade {
            op: OpKind::Conv2d(attrs),
            attrs,
            profile,
        }
    }
}

impl OpFacade for ConvFacade {
    fn op(&self) -> &OpKind {
        &self.op
    }

    fn backend(&self) -> &str {
        self.profile.name()
    }

    fn infer_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        if inputs.len() != self.attrs.arity() {
            return Err(Error::invalid(format!(
                "{} takes {} inputs, got {}",
                self.op,
                self.attrs.arity(),
                inputs.len()
            )));
        }
        let y = self.attrs.output_shape(&inputs[0], &inputs[1])?;
        if self.attrs.has_bias {
            let expected = Shape::from(y.channels());
            if inputs[2] != expected {
                return Err(Error::ShapeMismatch {
                    expected,
                    got: inputs[2].clone(),
                });
            }
        }
        if let Some(s) = self.attrs.sum_input() {
            if inputs[s] != y {
                return Err(Error::ShapeMismatch {
                    expected: y,
                    got: inputs[s].clone(),
                });
            }
        }
        Ok(vec![y])
    }

    fn accepts(&self, input: usize, _shapes: &[Shape], _hint: &[EdgeType]) -> Vec<EdgeType> {
        if self.is_weight(input) {
            Vec::new()
        } else {
            self.profile.compute_types()
        }
    }

    fn offers(&self, _output: usize, _shapes: &[Shape], types: &[EdgeType]) -> Vec<EdgeType> {
        first_type(types)
    }

    fn constraint(&self, input: usize, types: &[EdgeType]) -> Option<EdgeType> {
        // the fused sum operand is read in the output layout
        (Some(input) == self.attrs.sum_input()).then(|| types.first().copied()).flatten()
    }

    fn weight_inputs(&self) -> Vec<usize> {
        let mut w = vec![1];
        if self.attrs.has_bias {
            w.push(2);
        }
        w
    }
}

// Pooling

#[derive(Debug, Clone)]
pub struct PoolFacade {
    op: OpKind,
    attrs: Pool2dAttrs,
    profile: BackendProfile,
}

impl OpFacade for PoolFacade {
    fn op(&self) -> &OpKind {
        &self.op
    }

    fn backend(&self) -> &str {
        self.profile.name()
    }

    fn infer_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        Ok(vec![self.attrs.output_shape(arg(inputs, 0, &self.op)?)?])
    }

    fn accepts(&self, _input: usize, _shapes: &[Shape], _hint: &[EdgeType]) -> Vec<EdgeType> {
        self.profile.compute_types()
    }

    fn offers(&self, _output: usize, _shapes: &[Shape], types: &[EdgeType]) -> Vec<EdgeType> {
        first_type(types)
    }

    fn pad_fill(&self, _input: usize) -> PadFill {
        PadFill::Lowest
    }
}

// Reduction

#[derive(Debug, Clone)]
pub struct ReduceFacade {
    op: OpKind,
    attrs: ReduceAttrs,
    profile: BackendProfile,
}

impl OpFacade for ReduceFacade {
    fn op(&self) -> &OpKind {
        &self.op
    }

    fn backend(&self) -> &str {
        self.profile.name()
    }

    fn infer_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        Ok(vec![self.attrs.output_shape(arg(inputs, 0, &self.op)?)?])
    }

    fn accepts(&self, _input: usize, shapes: &[Shape], _hint: &[EdgeType]) -> Vec<EdgeType> {
        let all = self.profile.all_types();
        match shapes.first() {
            Some(x) => all.into_iter().filter(|t| t.format.can_hold(x)).collect(),
            None => all,
        }
    }

    fn offers(&self, _output: usize, shapes: &[Shape], types: &[EdgeType]) -> Vec<EdgeType> {
        let Some(&x_ty) = types.first() else {
            return Vec::new();
        };
        let planar = EdgeType::ndarray(x_ty.dtype);
        let keeps = shapes
            .first()
            .is_some_and(|x| ReduceKernel::keeps_blocking(&self.attrs, x));
        if x_ty.format.is_blocked() && keeps {
            vec![x_ty, planar]
        } else {
            vec![planar]
        }
    }

    fn pad_fill(&self, _input: usize) -> PadFill {
        match &self.op {
            OpKind::Reduce(r) => r.kind.identity(),
            _ => PadFill::Zero,
        }
    }
}

// Element-wise

#[derive(Debug, Clone)]
pub struct EltwiseFacade {
    op: OpKind,
    profile: BackendProfile,
}

impl EltwiseFacade {
    fn arity(&self) -> usize {
        match self.op {
            OpKind::Add | OpKind::Mul => 2,
            _ => 1,
        }
    }
}

impl OpFacade for EltwiseFacade {
    fn op(&self) -> &OpKind {
        &self.op
    }

    fn backend(&self) -> &str {
        self.profile.name()
    }

    fn infer_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        if inputs.len() != self.arity() {
            return Err(Error::invalid(format!(
                "{} takes {} inputs, got {}",
                self.op,
                self.arity(),
                inputs.len()
            )));
        }
        match inputs {
            [a, b] => Ok(vec![Shape::broadcast_shape(a, b)?]),
            _ => Ok(vec![inputs[0].clone()]),
        }
    }

    fn accepts(&self, input: usize, shapes: &[Shape], hint: &[EdgeType]) -> Vec<EdgeType> {
        let broadcasting = shapes.windows(2).any(|w| w[0] != w[1]);
        let base: Vec<EdgeType> = self
            .profile
            .all_types()
            .into_iter()
            .filter(|t| match shapes.get(input) {
                Some(s) => t.format.can_hold(s) && !(broadcasting && t.format.is_blocked()),
                None => true,
            })
            .collect();
        let mut out: Vec<EdgeType> = hint.iter().copied().filter(|t| base.contains(t)).collect();
        out.dedup();
        for t in base {
            if !out.contains(&t) {
                out.push(t);
            }
        }
        out
    }

    fn offers(&self, _output: usize, _shapes: &[Shape], types: &[EdgeType]) -> Vec<EdgeType> {
        first_type(types)
    }

    fn constraint(&self, input: usize, types: &[EdgeType]) -> Option<EdgeType> {
        if input == 1 && self.arity() == 2 {
            types.first().copied()
        } else {
            None
        }
    }
}

// Bridge

/// Facade of a Converter node inserted by negotiation.
#[derive(Debug, Clone)]
pub struct BridgeFacade {
    op: OpKind,
    pub from: EdgeType,
    pub to: EdgeType,
    backend: String,
}

impl BridgeFacade {
    pub fn new(from: EdgeType, to: EdgeType, fill: PadFill, backend: impl Into<String>) -> Self {
        BridgeFacade {
            op: OpKind::Converter { fill },
            from,
            to,
            backend: backend.into(),
        }
    }

    pub fn is_identity(&self) -> bool {
        self.from == self.to
    }
}

impl OpFacade for BridgeFacade {
    fn op(&self) -> &OpKind {
        &self.op
    }

    fn backend(&self) -> &str {
        &self.backend
    }

    fn infer_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        Ok(vec![arg(inputs, 0, &self.op)?.clone()])
    }

    fn accepts(&self, _input: usize, _shapes: &[Shape], _hint: &[EdgeType]) -> Vec<EdgeType> {
        vec![self.from]
    }

    fn offers(&self, _output: usize, _shapes: &[Shape], _types: &[EdgeType]) -> Vec<EdgeType> {
        vec![self.to]
    }
}
