// KernelRegistry — the compute-strategy boundary of one backend
//
// A registry is built per backend when an engine starts. It owns the
// backend's profile, the TileTables shared by its direct-convolution
// executors and the EngineContext handed to every manager.
//
// For a node, `managers()` lists one offline manager per strategy that can
// compute the node's family, in heuristic preference order. The list is not
// filtered by is_supported(); the pipeline asks each manager itself.
//
//   Conv2d      direct, im2col   (im2col first for pointwise kernels)
//   MaxPool2d   maxpool2d
//   Reduce      reduce
//   eltwise     eltwise
//   Converter   converter
//   Custom      none, Unsupported

use std::fmt;
use std::sync::Arc;

use half::f16;

use vole_core::{DynOfflineManager, EdgeType, EngineContext, Error, Result, Shape, WithDType};
use vole_ir::OpKind;

use crate::conv2d::{ConvProblem, DirectConvManager, Im2colConvManager};
use crate::convert::ConvertKernel;
use crate::eltwise::{EltOp, EltwiseKernel};
use crate::maxpool::MaxPoolKernel;
use crate::plain::PlainManager;
use crate::profile::BackendProfile;
use crate::reduce::ReduceKernel;
use crate::tile::TileTable;

/// Shapes and negotiated types of one node, as seen by the registry.
///
/// `inputs` lists every node input in order, weights included (with their
/// raw constant type); `outputs` every node output.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelRequest {
    pub op: OpKind,
    pub inputs: Vec<(Shape, EdgeType)>,
    pub outputs: Vec<(Shape, EdgeType)>,
}

impl KernelRequest {
    fn input(&self, i: usize) -> Result<&(Shape, EdgeType)> {
        self.inputs
            .get(i)
            .ok_or_else(|| Error::invalid(format!("{} request lacks input {i}", self.op)))
    }

    fn output(&self, i: usize) -> Result<&(Shape, EdgeType)> {
        self.outputs
            .get(i)
            .ok_or_else(|| Error::invalid(format!("{} request lacks output {i}", self.op)))
    }
}

/// Tile kernels per element type.
#[derive(Debug, Default)]
pub struct TileTables {
    pub f32: TileTable<f32>,
    pub f16: TileTable<f16>,
}

/// Element types the direct convolution is instantiated for.
pub trait TileElem: WithDType {
    fn table(tables: &TileTables) -> &TileTable<Self>;
}

impl TileElem for f32 {
    fn table(tables: &TileTables) -> &TileTable<f32> {
        &tables.f32
    }
}

impl TileElem for f16 {
    fn table(tables: &TileTables) -> &TileTable<f16> {
        &tables.f16
    }
}

pub struct KernelRegistry {
    profile: BackendProfile,
    tiles: Arc<TileTables>,
    ctx: EngineContext,
}

impl KernelRegistry {
    pub fn new(profile: BackendProfile, ctx: EngineContext) -> Self {
        KernelRegistry {
            profile,
            tiles: Arc::new(TileTables::default()),
            ctx,
        }
    }

    pub fn profile(&self) -> &BackendProfile {
        &self.profile
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// Whether any strategy of this backend computes `kind`.
    pub fn supports_kind(&self, kind: &OpKind) -> bool {
        match kind {
            OpKind::Conv2d(_) | OpKind::MaxPool2d(_) => !self.profile.compute_types().is_empty(),
            OpKind::Custom { .. } => false,
            _ => true,
        }
    }

    /// Candidate managers for a node, in heuristic order.
    pub fn managers(&self, req: &KernelRequest) -> Result<Vec<Box<dyn DynOfflineManager>>> {
        let ctx = self.ctx.clone();
        let out: Vec<Box<dyn DynOfflineManager>> = match &req.op {
            OpKind::Conv2d(attrs) => {
                let prob = ConvProblem::from_request(req)?;
                self.check_native(&prob.ty, &req.op)?;
                let direct = boxed(DirectConvManager::new(prob.clone(), ctx.clone(), self.tiles.clone()));
                let im2col = boxed(Im2colConvManager::new(prob, ctx));
                if attrs.is_pointwise() {
                    vec![im2col, direct]
                } else {
                    vec![direct, im2col]
                }
            }
            OpKind::MaxPool2d(attrs) => {
                let ty = req.input(0)?.1;
                self.check_native(&ty, &req.op)?;
                vec![boxed(PlainManager::new(
                    MaxPoolKernel { attrs: *attrs, ty },
                    ctx,
                ))]
            }
            OpKind::Reduce(attrs) => {
                let (x, in_ty) = req.input(0)?.clone();
                let out_ty = req.output(0)?.1;
                vec![boxed(PlainManager::new(
                    ReduceKernel {
                        attrs: attrs.clone(),
                        x,
                        in_ty,
                        out_ty,
                    },
                    ctx,
                ))]
            }
            OpKind::Relu | OpKind::Clip { .. } | OpKind::Add | OpKind::Mul => {
                let op = EltOp::from_kind(&req.op)
                    .ok_or_else(|| Error::invalid(format!("{} is not element-wise", req.op)))?;
                let ty = req.output(0)?.1;
                vec![boxed(PlainManager::new(EltwiseKernel { op, ty }, ctx))]
            }
            OpKind::Converter { fill } => {
                let from = req.input(0)?.1;
                let to = req.output(0)?.1;
                vec![boxed(PlainManager::new(
                    ConvertKernel {
                        from,
                        to,
                        fill: *fill,
                    },
                    ctx,
                ))]
            }
            OpKind::Custom { name } => {
                return Err(Error::unsupported(format!(
                    "backend {} has no kernel for '{name}'",
                    self.profile.name()
                )))
            }
        };
        Ok(out)
    }

    fn check_native(&self, ty: &EdgeType, op: &OpKind) -> Result<()> {
        if !self.profile.compute_types().contains(ty) {
            return Err(Error::unsupported(format!(
                "backend {} cannot run {op} on {ty}",
                self.profile.name()
            )));
        }
        Ok(())
    }
}

fn boxed<M: DynOfflineManager + 'static>(m: M) -> Box<dyn DynOfflineManager> {
    Box::new(m)
}

impl fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelRegistry")
            .field("profile", &self.profile.name())
            .field("workers", &self.ctx.workers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vole_core::{DType, DataFormat};
    use vole_ir::Conv2dAttrs;

    fn registry() -> KernelRegistry {
        KernelRegistry::new(BackendProfile::simd4_f32(), EngineContext::host(1).unwrap())
    }

    fn conv_request(attrs: Conv2dAttrs, ty: EdgeType) -> KernelRequest {
        let x = Shape::from((1, 8, 6, 6));
        let [kh, kw] = attrs.kernel;
        let filter = Shape::from((8, 8, kh, kw));
        let y = attrs.output_shape(&x, &filter).unwrap();
        KernelRequest {
            op: OpKind::Conv2d(attrs),
            inputs: vec![(x, ty), (filter, EdgeType::ndarray(DType::F32))],
            outputs: vec![(y, ty)],
        }
    }

    #[test]
    fn test_conv_heuristic_order() {
        let r = registry();
        let ty = EdgeType::new(DataFormat::N4cx, DType::F32);
        let ms = r.managers(&conv_request(Conv2dAttrs::new([3, 3]), ty)).unwrap();
        let names: Vec<_> = ms.iter().map(|m| m.algorithm()).collect();
        assert_eq!(names, vec!["conv2d_direct", "conv2d_im2col"]);
        let ms = r.managers(&conv_request(Conv2dAttrs::new([1, 1]), ty)).unwrap();
        assert_eq!(ms[0].algorithm(), "conv2d_im2col");
    }

    #[test]
    fn test_foreign_types_and_custom_ops_are_unsupported() {
        let r = registry();
        let ty = EdgeType::new(DataFormat::N8cx, DType::F16);
        let err = r.managers(&conv_request(Conv2dAttrs::new([3, 3]), ty)).unwrap_err();
        assert!(err.is_unsupported());
        let custom = KernelRequest {
            op: OpKind::Custom { name: "nms".into() },
            inputs: vec![],
            outputs: vec![],
        };
        assert!(!r.supports_kind(&custom.op));
        assert!(r.managers(&custom).unwrap_err().is_unsupported());
    }
}
