// BackendProfile — what one CPU backend computes natively
//
// A profile names a backend and fixes its native data format and element
// types. Facades derive their accept sets from it, the registry builds its
// strategy list from it, and the fusion pass reads the chains it declares.
//
//   simd4_f32   N4cx  / f32       four-lane vector unit
//   simd8_f16   N8cx  / f16       eight-lane half-precision unit
//   scalar      ndarray / f32,i64 plain loops, no channel blocking
//
// Every backend also reads and writes planar (ndarray) data for the
// element-wise and reduction families, so graph inputs and outputs can stay
// planar without a bridge when nothing downstream needs blocking.

use std::fmt;

use vole_core::{DType, DataFormat, EdgeType};

/// A producer/consumer chain a backend can fold into one convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FusionChain {
    /// Conv → Relu
    ConvRelu,
    /// Conv → Clip(0, 6)
    ConvRelu6,
    /// Conv → Add
    ConvSum,
    /// Conv → Add → Relu
    ConvSumRelu,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendProfile {
    name: String,
    format: DataFormat,
    dtypes: Vec<DType>,
    fusions: Vec<FusionChain>,
}

impl BackendProfile {
    pub fn new(
        name: impl Into<String>,
        format: DataFormat,
        dtypes: Vec<DType>,
        fusions: Vec<FusionChain>,
    ) -> Self {
        BackendProfile {
            name: name.into(),
            format,
            dtypes,
            fusions,
        }
    }

    pub fn simd4_f32() -> Self {
        Self::new(
            "simd4_f32",
            DataFormat::N4cx,
            vec![DType::F32],
            vec![
                FusionChain::ConvSumRelu,
                FusionChain::ConvSum,
                FusionChain::ConvRelu,
                FusionChain::ConvRelu6,
            ],
        )
    }

    pub fn simd8_f16() -> Self {
        Self::new(
            "simd8_f16",
            DataFormat::N8cx,
            vec![DType::F16],
            vec![FusionChain::ConvRelu, FusionChain::ConvRelu6],
        )
    }

    pub fn scalar() -> Self {
        Self::new(
            "scalar",
            DataFormat::Ndarray,
            vec![DType::F32, DType::I64],
            vec![FusionChain::ConvRelu],
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn format(&self) -> DataFormat {
        self.format
    }

    pub fn channel_block(&self) -> usize {
        self.format.channel_block()
    }

    pub fn dtypes(&self) -> &[DType] {
        &self.dtypes
    }

    pub fn fusions(&self) -> &[FusionChain] {
        &self.fusions
    }

    pub fn fuses(&self, chain: FusionChain) -> bool {
        self.fusions.contains(&chain)
    }

    /// Native-format float types: what convolution and pooling read.
    pub fn compute_types(&self) -> Vec<EdgeType> {
        self.dtypes
            .iter()
            .filter(|d| d.is_float())
            .map(|&d| EdgeType::new(self.format, d))
            .collect()
    }

    /// Every type the element-wise and reduction families handle, native
    /// format first.
    pub fn all_types(&self) -> Vec<EdgeType> {
        let mut out: Vec<EdgeType> = self
            .dtypes
            .iter()
            .map(|&d| EdgeType::new(self.format, d))
            .collect();
        for &d in &self.dtypes {
            let planar = EdgeType::ndarray(d);
            if !out.contains(&planar) {
                out.push(planar);
            }
        }
        out
    }

    pub fn handles(&self, ty: EdgeType) -> bool {
        self.all_types().contains(&ty)
    }
}

impl fmt::Display for BackendProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}", self.name, self.format)?;
        for d in &self.dtypes {
            write!(f, " {d}")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_sets() {
        let p = BackendProfile::simd4_f32();
        assert_eq!(p.compute_types(), vec![EdgeType::new(DataFormat::N4cx, DType::F32)]);
        assert_eq!(
            p.all_types(),
            vec![
                EdgeType::new(DataFormat::N4cx, DType::F32),
                EdgeType::ndarray(DType::F32)
            ]
        );
        let s = BackendProfile::scalar();
        assert_eq!(s.compute_types(), vec![EdgeType::ndarray(DType::F32)]);
        assert_eq!(s.all_types().len(), 2);
        assert!(s.handles(EdgeType::ndarray(DType::I64)));
    }
}
