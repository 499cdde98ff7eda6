use std::fmt;

use crate::allocator::Block;
use crate::dtype::{DType, WithDType};
use crate::error::{Error, Result};
use crate::format::{DataFormat, EdgeType};
use crate::shape::Shape;

// HostTensor — owned host buffer with a negotiated edge type
//
// Graph constants, session inputs and session outputs are HostTensors. The
// bytes are laid out according to `ty.format`; typed access checks the dtype
// so a buffer is never silently reinterpreted.

/// An owned tensor in host memory.
#[derive(Clone)]
pub struct HostTensor {
    shape: Shape,
    ty: EdgeType,
    data: Block,
}

impl HostTensor {
    /// Zero-filled tensor of the given shape and type.
    pub fn zeros(shape: impl Into<Shape>, ty: EdgeType) -> Self {
        let shape = shape.into();
        let data = Block::detached(ty.storage_bytes(&shape));
        HostTensor { shape, ty, data }
    }

    /// Planar tensor from a vector of elements.
    pub fn from_vec<T: WithDType>(data: Vec<T>, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::invalid(format!(
                "shape {} needs {} elements, got {}",
                shape,
                shape.elem_count(),
                data.len()
            )));
        }
        let mut t = Self::zeros(shape, EdgeType::ndarray(T::DTYPE));
        t.as_mut_slice::<T>()?.copy_from_slice(&data);
        Ok(t)
    }

    /// Wrap raw bytes already laid out for `ty`.
    pub fn from_bytes(bytes: &[u8], shape: impl Into<Shape>, ty: EdgeType) -> Result<Self> {
        let shape = shape.into();
        let mut t = Self::zeros(shape, ty);
        if bytes.len() != t.data.len() {
            return Err(Error::invalid(format!(
                "{} {} needs {} bytes, got {}",
                ty,
                t.shape,
                t.data.len(),
                bytes.len()
            )));
        }
        t.data.as_bytes_mut().copy_from_slice(bytes);
        Ok(t)
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn ty(&self) -> EdgeType {
        self.ty
    }

    pub fn dtype(&self) -> DType {
        self.ty.dtype
    }

    pub fn format(&self) -> DataFormat {
        self.ty.format
    }

    pub fn bytes(&self) -> &[u8] {
        self.data.as_bytes()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.data.as_bytes_mut()
    }

    /// Stored elements (padded lanes included) as `T`.
    pub fn as_slice<T: WithDType>(&self) -> Result<&[T]> {
        check_dtype::<T>(self.ty.dtype)?;
        self.data.typed()
    }

    pub fn as_mut_slice<T: WithDType>(&mut self) -> Result<&mut [T]> {
        check_dtype::<T>(self.ty.dtype)?;
        self.data.typed_mut()
    }

    /// Logical elements of a planar tensor.
    pub fn to_vec<T: WithDType>(&self) -> Result<Vec<T>> {
        if self.ty.format.is_blocked() {
            return Err(Error::invalid(format!(
                "to_vec needs a planar tensor, this one is {}",
                self.ty.format
            )));
        }
        Ok(self.as_slice::<T>()?.to_vec())
    }
}

impl fmt::Debug for HostTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostTensor({} {})", self.shape, self.ty)
    }
}

/// Error unless `T` is the element type of `dtype`.
pub fn check_dtype<T: WithDType>(dtype: DType) -> Result<()> {
    if T::DTYPE != dtype {
        return Err(Error::DTypeMismatch {
            expected: dtype,
            got: T::DTYPE,
        });
    }
    Ok(())
}
