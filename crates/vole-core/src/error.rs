use std::fmt;

use crate::dtype::DType;
use crate::shape::Shape;

/// All errors that can occur within vole.
///
/// Every variant maps onto one of the three failure statuses the engine
/// reports (see [`Status`]): malformed or missing state is `InvalidValue`,
/// a capability gap is `Unsupported`, and redoing a one-shot step is
/// `PermissionDenied`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Required state is missing or malformed (unset shapes, bad attributes).
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// No algorithm or backend can handle the request.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A one-shot step was attempted a second time.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Shape mismatch between two tensors.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Operation requires a specific rank (number of dimensions).
    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// DType mismatch between a buffer and the type it is read as.
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    /// Dimension index out of range for the tensor's rank.
    #[error("dimension out of range: dim {dim} for tensor with {rank} dimensions")]
    DimOutOfRange { dim: usize, rank: usize },

    /// A view or arena access fell outside its backing storage.
    #[error("index out of bounds: index {index} for storage of {len} elements")]
    IndexOutOfBounds { index: usize, len: usize },

    /// A symbolic dimension had no binding at compile time.
    #[error("unbound symbolic dimension '{0}'")]
    UnboundSymbol(String),

    /// A compilation pass failed on a specific node.
    #[error("pass '{pass}' failed at node '{node}': {source}")]
    Pass {
        pass: &'static str,
        node: String,
        #[source]
        source: Box<Error>,
    },

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    pub fn invalid(s: impl Into<String>) -> Self {
        Error::InvalidValue(s.into())
    }

    pub fn unsupported(s: impl Into<String>) -> Self {
        Error::Unsupported(s.into())
    }

    pub fn denied(s: impl Into<String>) -> Self {
        Error::PermissionDenied(s.into())
    }

    /// Attach the pass name and node to an error raised inside a pass.
    pub fn in_pass(self, pass: &'static str, node: impl Into<String>) -> Self {
        Error::Pass {
            pass,
            node: node.into(),
            source: Box::new(self),
        }
    }

    /// The status code this error reports.
    pub fn status(&self) -> Status {
        match self {
            Error::Unsupported(_) => Status::Unsupported,
            Error::PermissionDenied(_) => Status::PermissionDenied,
            Error::Pass { source, .. } => source.status(),
            _ => Status::InvalidValue,
        }
    }

    /// True for capability gaps the pipeline may recover from by trying
    /// another backend.
    pub fn is_unsupported(&self) -> bool {
        self.status() == Status::Unsupported
    }
}

/// Result status values returned by every core operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    InvalidValue,
    Unsupported,
    PermissionDenied,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Success => "success",
            Status::InvalidValue => "invalid value",
            Status::Unsupported => "unsupported",
            Status::PermissionDenied => "permission denied",
        };
        write!(f, "{}", s)
    }
}

/// Collapse a result into its status code.
pub fn status_of<T>(r: &Result<T>) -> Status {
    match r {
        Ok(_) => Status::Success,
        Err(e) => e.status(),
    }
}

/// Convenience Result type used throughout vole.
pub type Result<T> = std::result::Result<T, Error>;
