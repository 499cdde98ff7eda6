// OpKind — the operator kinds a vole graph can contain
//
// The IR only records *what* a node computes. Which algorithm computes it,
// in which data format and with which tile sizes, is decided later by the
// compilation pipeline. The shape arithmetic lives here because it depends
// on the attributes alone and is shared by every backend.
//
// Input conventions:
//
//   Conv2d     [x, filter, bias?, sum?]  filter [OC, C/group, KH, KW]
//   MaxPool2d  [x]
//   Reduce     [x]
//   Relu/Clip  [x]
//   Add/Mul    [a, b]                    numpy broadcasting
//   Converter  [x]                       format/type bridge
//
// Fused convolutions keep their Conv2d kind and record the absorbed
// successors in FuseFlags. A fused sum operand is appended as the last input.

use std::fmt;

use vole_core::{Error, PadFill, Result, Shape};

/// Epilogues folded into a convolution by the fusion pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FuseFlags {
    pub relu: bool,
    pub relu6: bool,
    pub sum: bool,
}

impl FuseFlags {
    pub fn any(&self) -> bool {
        self.relu || self.relu6 || self.sum
    }
}

/// Static attributes of a 2-D convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Conv2dAttrs {
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    /// Symmetric zero padding per spatial axis.
    pub pad: [usize; 2],
    pub dilation: [usize; 2],
    pub group: usize,
    pub has_bias: bool,
    pub fuse: FuseFlags,
}

impl Conv2dAttrs {
    pub fn new(kernel: [usize; 2]) -> Self {
        Conv2dAttrs {
            kernel,
            stride: [1, 1],
            pad: [0, 0],
            dilation: [1, 1],
            group: 1,
            has_bias: false,
            fuse: FuseFlags::default(),
        }
    }

    pub fn with_stride(mut self, stride: [usize; 2]) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_pad(mut self, pad: [usize; 2]) -> Self {
        self.pad = pad;
        self
    }

    pub fn with_dilation(mut self, dilation: [usize; 2]) -> Self {
        self.dilation = dilation;
        self
    }

    pub fn with_group(mut self, group: usize) -> Self {
        self.group = group;
        self
    }

    pub fn with_bias(mut self) -> Self {
        self.has_bias = true;
        self
    }

    pub fn is_pointwise(&self) -> bool {
        self.kernel == [1, 1] && self.stride == [1, 1] && self.pad == [0, 0]
    }

    /// Index of the fused sum operand, if any.
    pub fn sum_input(&self) -> Option<usize> {
        self.fuse.sum.then_some(if self.has_bias { 3 } else { 2 })
    }

    /// Number of inputs the node must have.
    pub fn arity(&self) -> usize {
        2 + self.has_bias as usize + self.fuse.sum as usize
    }

    fn check(&self) -> Result<()> {
        let zero = |v: [usize; 2]| v.contains(&0);
        if zero(self.kernel) || zero(self.stride) || zero(self.dilation) || self.group == 0 {
            return Err(Error::invalid(format!(
                "conv2d kernel, stride, dilation and group must be positive: {self:?}"
            )));
        }
        Ok(())
    }

    /// Output shape for input `x` [N, C, H, W] and `filter` [OC, C/g, KH, KW].
    pub fn output_shape(&self, x: &Shape, filter: &Shape) -> Result<Shape> {
        self.check()?;
        if x.rank() != 4 {
            return Err(Error::RankMismatch {
                expected: 4,
                got: x.rank(),
            });
        }
        if filter.rank() != 4 {
            return Err(Error::RankMismatch {
                expected: 4,
                got: filter.rank(),
            });
        }
        let (ic, oc) = (x.channels(), filter.dims()[0]);
        let g = self.group;
        let expected_filter = Shape::new(vec![oc, ic / g, self.kernel[0], self.kernel[1]]);
        if ic % g != 0 || oc % g != 0 || filter != &expected_filter {
            return Err(Error::ShapeMismatch {
                expected: expected_filter,
                got: filter.clone(),
            });
        }
        let mut dims = vec![x.batch(), oc];
        for a in 0..2 {
            dims.push(window_out(
                x.dims()[2 + a],
                self.kernel[a],
                self.stride[a],
                self.pad[a],
                self.dilation[a],
            )?);
        }
        Ok(Shape::new(dims))
    }
}

/// Static attributes of 2-D max pooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pool2dAttrs {
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub pad: [usize; 2],
}

impl Pool2dAttrs {
    pub fn new(kernel: [usize; 2], stride: [usize; 2]) -> Self {
        Pool2dAttrs {
            kernel,
            stride,
            pad: [0, 0],
        }
    }

    pub fn with_pad(mut self, pad: [usize; 2]) -> Self {
        self.pad = pad;
        self
    }

    pub fn output_shape(&self, x: &Shape) -> Result<Shape> {
        if x.rank() != 4 {
            return Err(Error::RankMismatch {
                expected: 4,
                got: x.rank(),
            });
        }
        if self.kernel.contains(&0) || self.stride.contains(&0) {
            return Err(Error::invalid(format!(
                "pool kernel and stride must be positive: {self:?}"
            )));
        }
        if self.pad[0] >= self.kernel[0] || self.pad[1] >= self.kernel[1] {
            return Err(Error::invalid("pool padding must be smaller than the window"));
        }
        let mut dims = vec![x.batch(), x.channels()];
        for a in 0..2 {
            dims.push(window_out(
                x.dims()[2 + a],
                self.kernel[a],
                self.stride[a],
                self.pad[a],
                1,
            )?);
        }
        Ok(Shape::new(dims))
    }
}

/// Output extent of a sliding window. An empty input axis gives an empty
/// output axis.
fn window_out(len: usize, k: usize, stride: usize, pad: usize, dil: usize) -> Result<usize> {
    if len == 0 {
        return Ok(0);
    }
    let span = dil * (k - 1) + 1;
    let padded = len + 2 * pad;
    if padded < span {
        return Err(Error::invalid(format!(
            "window of {span} does not fit an axis of {len} with padding {pad}"
        )));
    }
    Ok((padded - span) / stride + 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceKind {
    Max,
    Min,
    Sum,
    Mean,
    Prod,
}

impl ReduceKind {
    /// The identity of this reduction, used for padded lanes.
    pub fn identity(&self) -> PadFill {
        match self {
            ReduceKind::Max => PadFill::Lowest,
            ReduceKind::Min => PadFill::Highest,
            ReduceKind::Sum | ReduceKind::Mean => PadFill::Zero,
            ReduceKind::Prod => PadFill::One,
        }
    }
}

/// Reduction over a set of axes. Empty `axes` reduces every axis.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReduceAttrs {
    pub kind: ReduceKind,
    pub axes: Vec<i64>,
    pub keepdims: bool,
}

impl ReduceAttrs {
    pub fn new(kind: ReduceKind, axes: Vec<i64>, keepdims: bool) -> Self {
        ReduceAttrs {
            kind,
            axes,
            keepdims,
        }
    }

    /// Sorted, deduplicated, non-negative axes for `x`.
    pub fn resolved_axes(&self, x: &Shape) -> Result<Vec<usize>> {
        if self.axes.is_empty() {
            return Ok((0..x.rank()).collect());
        }
        let mut axes = self
            .axes
            .iter()
            .map(|&a| x.normalize_axis(a))
            .collect::<Result<Vec<_>>>()?;
        axes.sort_unstable();
        axes.dedup();
        Ok(axes)
    }

    pub fn output_shape(&self, x: &Shape) -> Result<Shape> {
        let axes = self.resolved_axes(x)?;
        let dims = x
            .dims()
            .iter()
            .enumerate()
            .filter_map(|(i, &d)| match (axes.contains(&i), self.keepdims) {
                (false, _) => Some(d),
                (true, true) => Some(1),
                (true, false) => None,
            })
            .collect();
        Ok(Shape::new(dims))
    }
}

/// Operator kind of a graph node.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    Conv2d(Conv2dAttrs),
    MaxPool2d(Pool2dAttrs),
    Reduce(ReduceAttrs),
    Relu,
    Clip { min: f32, max: f32 },
    Add,
    Mul,
    /// Format/type conversion inserted by negotiation.
    Converter { fill: PadFill },
    /// A kind no backend implements.
    Custom { name: String },
}

impl OpKind {
    pub fn name(&self) -> &str {
        match self {
            OpKind::Conv2d(_) => "conv2d",
            OpKind::MaxPool2d(_) => "maxpool2d",
            OpKind::Reduce(_) => "reduce",
            OpKind::Relu => "relu",
            OpKind::Clip { .. } => "clip",
            OpKind::Add => "add",
            OpKind::Mul => "mul",
            OpKind::Converter { .. } => "converter",
            OpKind::Custom { name } => name,
        }
    }

    pub fn is_converter(&self) -> bool {
        matches!(self, OpKind::Converter { .. })
    }

    pub fn is_eltwise(&self) -> bool {
        matches!(
            self,
            OpKind::Relu | OpKind::Clip { .. } | OpKind::Add | OpKind::Mul
        )
    }

    /// Clip(0, 6), the pattern folded into a convolution as relu6.
    pub fn is_relu6(&self) -> bool {
        matches!(self, OpKind::Clip { min, max } if *min == 0.0 && *max == 6.0)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Conv2d(a) if a.fuse.any() => {
                write!(f, "conv2d")?;
                if a.fuse.sum {
                    write!(f, "+sum")?;
                }
                if a.fuse.relu {
                    write!(f, "+relu")?;
                }
                if a.fuse.relu6 {
                    write!(f, "+relu6")?;
                }
                Ok(())
            }
            OpKind::Reduce(r) => write!(f, "reduce_{:?}", r.kind),
            other => write!(f, "{}", other.name()),
        }
    }
}
