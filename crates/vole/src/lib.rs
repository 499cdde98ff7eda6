//! # Vole
//!
//! Graph compilation for heterogeneous inference backends: operator
//! algorithm selection, data-format negotiation, fusion and arena planning.
//!
//! ## Usage
//!
//! ```rust
//! use vole::prelude::*;
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `vole-core` | Shapes, dtypes, data formats, allocator, clock, worker pool, operator lifecycle |
//! | `vole-ir` | Dataflow graph, operator attributes, graph builder |
//! | `vole-cpu` | CPU backends: conv2d, maxpool, reduce, eltwise and converter kernels |
//! | `vole` | Compilation pipeline and sessions |
//!
//! ## Modules
//!
//! - [`config`] — EngineConfig, TuningMode
//! - [`facade`] — per-operator shape inference and format preferences
//! - [`negotiate`] — backward/forward type resolution over the graph
//! - [`fusion`] — conv + relu / relu6 / sum folding
//! - [`pipeline`] — the compile passes, from source graph to prepared steps
//! - [`planner`] — arena placement by buffer lifetime
//! - [`profiler`] — per-node timing and compile statistics
//! - [`session`] — Engine and Session

/// Re-export core types.
pub use vole_core::{
    DType, DataFormat, EdgeType, EngineContext, Error, HostTensor, PadFill, Result, Shape,
    SymDim, SymbolicShape, TuneOptions,
};

/// Re-export the graph IR.
pub mod ir {
    pub use vole_ir::*;
}

/// Re-export the CPU backends.
pub mod cpu {
    pub use vole_cpu::*;
}

/// Engine configuration.
pub mod config;

/// Operator facades: shapes, accepted and offered edge types.
pub mod facade;

/// Format negotiation.
pub mod negotiate;

/// Operator fusion.
pub mod fusion;

/// Compilation passes.
pub mod pipeline;

/// Arena memory planning.
pub mod planner;

/// Profiling and compile statistics.
pub mod profiler;

/// Engine and Session.
pub mod session;

pub use config::{EngineConfig, TuningMode};
pub use session::{Engine, Session};

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::config::{EngineConfig, TuningMode};
    pub use crate::profiler::{CompileStats, ProfileEntry, ProfileReport, Profiler, Stopwatch};
    pub use crate::session::{Engine, Session};
    pub use crate::{DType, DataFormat, EdgeType, Error, HostTensor, Result, Shape};
    pub use vole_cpu::BackendProfile;
    pub use vole_ir::{
        Conv2dAttrs, FuseFlags, Graph, GraphBuilder, OpKind, Pool2dAttrs, ReduceAttrs, ReduceKind,
    };
}
