use std::fmt;

// DType — numeric types an edge can carry
//
// Backends declare a preferred precision (F32 on wide vector units, F16 on
// half-precision SIMD cores) and negotiation settles every edge on one of
// these. Integer types appear on reduction and indexing paths.
//
//   F16  — 16-bit IEEE half float
//   BF16 — 16-bit brain float
//   F32  — 32-bit float, the default
//   F64  — 64-bit float
//   U8   — unsigned byte
//   U32  — unsigned 32-bit int
//   I64  — signed 64-bit int

/// Enum of all supported element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F16,
    BF16,
    F32,
    F64,
    U8,
    U32,
    I64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F16 => 2,
            DType::BF16 => 2,
            DType::F32 => 4,
            DType::F64 => 8,
            DType::U8 => 1,
            DType::U32 => 4,
            DType::I64 => 8,
        }
    }

    /// Whether this dtype is a floating-point type.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
    }

    /// Whether this is a half-precision type (F16 or BF16).
    pub fn is_half(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::U8 => "u8",
            DType::U32 => "u32",
            DType::I64 => "i64",
        };
        write!(f, "{}", s)
    }
}

// WithDType — Rust element types behind each DType
//
// Kernels are written once, generic over T: WithDType, and instantiated per
// dtype through `dispatch_dtype!`. Besides the f64 round trip, every element
// type exposes its representable extremes: padded channel lanes must hold
// the identity of whatever reduction later consumes them, and for max/min
// that identity is lowest()/highest() rather than zero.

/// Trait implemented by Rust types that can be stored in an edge buffer.
pub trait WithDType:
    Copy
    + Send
    + Sync
    + 'static
    + PartialOrd
    + bytemuck::Pod
    + num_traits::NumCast
    + num_traits::Bounded
    + fmt::Debug
{
    /// The corresponding DType enum variant.
    const DTYPE: DType;

    /// Convert this value to f64.
    fn to_f64(self) -> f64;

    /// Create a value of this type from f64.
    fn from_f64(v: f64) -> Self;

    /// Accumulation-precision view used by the float kernels.
    fn to_acc(self) -> f32 {
        self.to_f64() as f32
    }

    fn from_acc(v: f32) -> Self {
        Self::from_f64(v as f64)
    }

    fn zero() -> Self {
        Self::from_f64(0.0)
    }

    fn one() -> Self {
        Self::from_f64(1.0)
    }

    /// Smallest finite value (the identity of max).
    fn lowest() -> Self {
        <Self as num_traits::Bounded>::min_value()
    }

    /// Largest finite value (the identity of min).
    fn highest() -> Self {
        <Self as num_traits::Bounded>::max_value()
    }

    /// Larger of two values; NaN on either side yields `self`.
    fn max_of(self, other: Self) -> Self {
        if other > self {
            other
        } else {
            self
        }
    }

    fn min_of(self, other: Self) -> Self {
        if other < self {
            other
        } else {
            self
        }
    }
}

impl WithDType for f32 {
    const DTYPE: DType = DType::F32;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as f32
    }
    fn to_acc(self) -> f32 {
        self
    }
    fn from_acc(v: f32) -> Self {
        v
    }
}

impl WithDType for f64 {
    const DTYPE: DType = DType::F64;
    fn to_f64(self) -> f64 {
        self
    }
    fn from_f64(v: f64) -> Self {
        v
    }
}

impl WithDType for half::f16 {
    const DTYPE: DType = DType::F16;
    fn to_f64(self) -> f64 {
        half::f16::to_f64(self)
    }
    fn from_f64(v: f64) -> Self {
        half::f16::from_f64(v)
    }
    fn to_acc(self) -> f32 {
        half::f16::to_f32(self)
    }
    fn from_acc(v: f32) -> Self {
        half::f16::from_f32(v)
    }
}

impl WithDType for half::bf16 {
    const DTYPE: DType = DType::BF16;
    fn to_f64(self) -> f64 {
        half::bf16::to_f64(self)
    }
    fn from_f64(v: f64) -> Self {
        half::bf16::from_f64(v)
    }
    fn to_acc(self) -> f32 {
        half::bf16::to_f32(self)
    }
    fn from_acc(v: f32) -> Self {
        half::bf16::from_f32(v)
    }
}

impl WithDType for u8 {
    const DTYPE: DType = DType::U8;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v.clamp(0.0, 255.0) as u8
    }
}

impl WithDType for u32 {
    const DTYPE: DType = DType::U32;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v.clamp(0.0, u32::MAX as f64) as u32
    }
}

impl WithDType for i64 {
    const DTYPE: DType = DType::I64;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as i64
    }
}

/// Run `$body` with `$T` aliased to the Rust element type of `$dtype`.
///
/// ```ignore
/// dispatch_dtype!(dtype, T => relu_kernel::<T>(src, dst))
/// ```
#[macro_export]
macro_rules! dispatch_dtype {
    ($dtype:expr, $T:ident => $body:expr) => {
        match $dtype {
            $crate::DType::F16 => {
                type $T = $crate::half::f16;
                $body
            }
            $crate::DType::BF16 => {
                type $T = $crate::half::bf16;
                $body
            }
            $crate::DType::F32 => {
                type $T = f32;
                $body
            }
            $crate::DType::F64 => {
                type $T = f64;
                $body
            }
            $crate::DType::U8 => {
                type $T = u8;
                $body
            }
            $crate::DType::U32 => {
                type $T = u32;
                $body
            }
            $crate::DType::I64 => {
                type $T = i64;
                $body
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extremes() {
        assert_eq!(f32::lowest(), f32::MIN);
        assert_eq!(half::f16::lowest(), half::f16::MIN);
        assert_eq!(i64::highest(), i64::MAX);
        assert_eq!(u8::lowest(), 0);
    }

    #[test]
    fn test_dispatch_picks_element_type() {
        fn width(d: DType) -> usize {
            dispatch_dtype!(d, T => std::mem::size_of::<T>())
        }
        for d in [DType::F16, DType::F32, DType::I64, DType::U8] {
            assert_eq!(width(d), d.size_in_bytes());
        }
    }

    #[test]
    fn test_max_min_of() {
        assert_eq!(3.0f32.max_of(5.0), 5.0);
        assert_eq!(3i64.min_of(-2), -2);
    }

    #[test]
    fn test_acc_through_borrowed_slices() {
        fn dot<T: WithDType>(a: &[T], b: &[T]) -> f32 {
            a.iter().zip(b).map(|(x, w)| x.to_acc() * w.to_acc()).sum()
        }
        let a = [half::f16::from_f32(1.5), half::f16::from_f32(-2.0)];
        let b = [half::f16::from_f32(2.0), half::f16::from_f32(0.5)];
        assert_eq!(dot(&a, &b), 2.0);
        assert_eq!(dot(&[3i64, 4], &[2, 1]), 10.0);
        assert_eq!(half::bf16::from_acc(0.25).to_acc(), 0.25);
    }
}
