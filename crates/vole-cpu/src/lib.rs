//! # vole-cpu
//!
//! Host CPU compute strategies for vole.
//!
//! Each backend is described by a [`BackendProfile`] (native data format,
//! element types, fusion chains) and served by a [`KernelRegistry`] that
//! lists the offline managers able to compute a node:
//!
//! - [`conv2d`]: direct (tile kernels) and im2col (blocked GEMM) convolution
//! - [`maxpool`], [`reduce`], [`eltwise`]: parameter-free families
//! - [`convert`]: format and element-type bridges

pub mod conv2d;
pub mod convert;
pub mod eltwise;
pub mod maxpool;
pub mod plain;
pub mod profile;
pub mod reduce;
pub mod registry;
pub mod tile;

pub use convert::{convert_host, ConvertKernel};
pub use profile::{BackendProfile, FusionChain};
pub use registry::{KernelRegistry, KernelRequest};
