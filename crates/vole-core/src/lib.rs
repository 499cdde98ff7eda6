//! # vole-core
//!
//! Core types shared by every vole crate.
//!
//! This crate provides:
//! - [`Shape`] / [`Layout`] / [`FeatureView`]: shapes and strided views
//! - [`DType`] / [`DataFormat`] / [`EdgeType`]: what an edge carries
//! - [`Error`] / [`Status`]: the error taxonomy
//! - [`Allocator`] / [`Block`]: the memory capability
//! - [`WorkerPool`]: data-parallel fan-out inside one kernel call
//! - [`OfflineManager`] / [`RuntimeExecutor`]: the operator lifecycle
//! - [`tune::sweep`]: the autotuning trial harness

// - DType, DataFormat, EdgeType: element types and memory layouts
// - Shape, Layout, FeatureView: addressing
// - Allocator, Block, HostTensor: memory
// - Clock, WorkerPool, EngineContext: capabilities handed to kernels
// - OfflineManager, RuntimeExecutor: the compile/run lifecycle

pub mod algo;
pub mod allocator;
pub mod clock;
pub mod context;
pub mod dtype;
pub mod dynamic_shape;
pub mod error;
pub mod format;
pub mod layout;
pub mod parallel;
pub mod shape;
pub mod tensor;
pub mod tune;

pub use half;

pub use algo::{
    DynOfflineManager, ExecArgs, ExecState, NoParams, OfflineManager, RuntimeExecutor,
    ScheduleParams, TensorMut, TensorRef, TuneOptions, Tuned, WeightSlot,
};
pub use allocator::{AllocStats, Allocator, Block, HostAllocator};
pub use clock::{Clock, MonotonicClock, ScriptedClock};
pub use context::EngineContext;
pub use dtype::{DType, WithDType};
pub use dynamic_shape::{ShapeEnv, SymDim, SymbolicShape};
pub use error::{status_of, Error, Result, Status};
pub use format::{DataFormat, EdgeType, PadFill};
pub use layout::{FeatureGeom, FeatureView, FeatureViewMut, Layout, View};
pub use parallel::WorkerPool;
pub use shape::Shape;
pub use tensor::HostTensor;
