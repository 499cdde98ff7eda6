// Symbolic shapes — graph inputs whose dims are bound at compile time
//
// A model may declare inputs such as [N, 3, H, W] where N, H and W are only
// known when the engine is configured. Shape inference needs concrete
// shapes, so the first thing the pipeline does with a graph input is resolve
// its SymbolicShape against the ShapeEnv built from EngineConfig::dims.
//
// COMPONENTS:
//
//   SymDim         — one dimension: a fixed size or a named symbol
//   SymbolicShape  — a shape pattern made of SymDims
//   ShapeEnv       — symbol name → concrete size
//
// A compiled session is specialized to the resolved shapes; feeding it
// tensors of other sizes is rejected rather than re-specialized.

use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, Result};
use crate::shape::Shape;

/// A dimension that is either known or named.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SymDim {
    Fixed(usize),
    Symbolic(String),
}

impl SymDim {
    pub fn fixed(n: usize) -> Self {
        SymDim::Fixed(n)
    }

    pub fn symbolic(name: impl Into<String>) -> Self {
        SymDim::Symbolic(name.into())
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self, SymDim::Fixed(_))
    }

    pub fn resolve(&self, env: &ShapeEnv) -> Option<usize> {
        match self {
            SymDim::Fixed(n) => Some(*n),
            SymDim::Symbolic(name) => env.get(name),
        }
    }
}

impl fmt::Display for SymDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymDim::Fixed(n) => write!(f, "{n}"),
            SymDim::Symbolic(s) => write!(f, "{s}"),
        }
    }
}

impl From<usize> for SymDim {
    fn from(n: usize) -> Self {
        SymDim::Fixed(n)
    }
}

impl From<&str> for SymDim {
    fn from(s: &str) -> Self {
        SymDim::Symbolic(s.to_string())
    }
}

/// Shape pattern that may contain named dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymbolicShape {
    dims: Vec<SymDim>,
}

impl SymbolicShape {
    pub fn new(dims: Vec<SymDim>) -> Self {
        Self { dims }
    }

    pub fn from_shape(shape: &Shape) -> Self {
        Self {
            dims: shape.dims().iter().map(|&d| SymDim::Fixed(d)).collect(),
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[SymDim] {
        &self.dims
    }

    /// Concrete shape, or UnboundSymbol naming the first unbound dim.
    pub fn resolve(&self, env: &ShapeEnv) -> Result<Shape> {
        self.dims
            .iter()
            .map(|d| match d {
                SymDim::Fixed(n) => Ok(*n),
                SymDim::Symbolic(name) => env
                    .get(name)
                    .ok_or_else(|| Error::UnboundSymbol(name.clone())),
            })
            .collect::<Result<Vec<_>>>()
            .map(Shape::new)
    }
}

impl fmt::Display for SymbolicShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

impl From<Vec<SymDim>> for SymbolicShape {
    fn from(dims: Vec<SymDim>) -> Self {
        Self::new(dims)
    }
}

impl From<Shape> for SymbolicShape {
    fn from(shape: Shape) -> Self {
        Self::from_shape(&shape)
    }
}

/// Symbol bindings used to resolve graph input shapes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShapeEnv {
    bindings: HashMap<String, usize>,
}

impl ShapeEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, name: impl Into<String>, value: usize) {
        self.bindings.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<usize> {
        self.bindings.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl From<&HashMap<String, usize>> for ShapeEnv {
    fn from(dims: &HashMap<String, usize>) -> Self {
        ShapeEnv {
            bindings: dims.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nchw() -> SymbolicShape {
        SymbolicShape::new(vec!["N".into(), 3.into(), "H".into(), "H".into()])
    }

    #[test]
    fn test_resolve_bound() {
        let mut env = ShapeEnv::new();
        env.bind("N", 2);
        env.bind("H", 16);
        assert_eq!(nchw().resolve(&env).unwrap().dims(), &[2, 3, 16, 16]);
        assert_eq!(format!("{}", nchw()), "[N, 3, H, H]");
    }

    #[test]
    fn test_resolve_reports_unbound_symbol() {
        let mut env = ShapeEnv::new();
        env.bind("N", 2);
        match nchw().resolve(&env) {
            Err(Error::UnboundSymbol(name)) => assert_eq!(name, "H"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
