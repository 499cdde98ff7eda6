use std::fmt;

use crate::dtype::{DType, WithDType};
use crate::shape::Shape;

// DataFormat — memory layout tags negotiated per edge
//
// Ndarray is plain row-major NC[S...]. The channel-blocked formats group
// channels into blocks of B lanes so a vector unit can load one block per
// spatial position:
//
//   N4cx:  [N][ceil(C/4)][S...][4]
//   N8cx:  [N][ceil(C/8)][S...][8]
//
// When C is not a multiple of B the last block is partially padded. Padded
// lanes are not part of the logical tensor, but kernels read them as whole
// blocks, so whoever writes a blocked buffer fills them with the identity
// of the reduction that will consume it (PadFill).

/// Memory layout of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataFormat {
    Ndarray,
    N4cx,
    N8cx,
}

impl DataFormat {
    /// Number of channel lanes per block (1 for planar data).
    pub fn channel_block(&self) -> usize {
        match self {
            DataFormat::Ndarray => 1,
            DataFormat::N4cx => 4,
            DataFormat::N8cx => 8,
        }
    }

    pub fn is_blocked(&self) -> bool {
        !matches!(self, DataFormat::Ndarray)
    }

    /// The blocked format with `block` lanes, if one exists.
    pub fn blocked(block: usize) -> Option<DataFormat> {
        match block {
            1 => Some(DataFormat::Ndarray),
            4 => Some(DataFormat::N4cx),
            8 => Some(DataFormat::N8cx),
            _ => None,
        }
    }

    /// Channel count rounded up to a whole number of blocks.
    pub fn padded_channels(&self, channels: usize) -> usize {
        round_up(channels, self.channel_block())
    }

    /// Whether a tensor of `shape` can be stored in this format.
    /// Blocked formats need a channel axis.
    pub fn can_hold(&self, shape: &Shape) -> bool {
        !self.is_blocked() || shape.rank() >= 2
    }

    /// Number of stored elements (including padded lanes) for `shape`.
    pub fn storage_len(&self, shape: &Shape) -> usize {
        if !self.is_blocked() || shape.rank() < 2 {
            return shape.elem_count();
        }
        shape.batch() * self.padded_channels(shape.channels()) * shape.spatial()
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataFormat::Ndarray => "ndarray",
            DataFormat::N4cx => "n4cx",
            DataFormat::N8cx => "n8cx",
        };
        write!(f, "{}", s)
    }
}

/// The (format, numeric type) pair an edge is negotiated to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeType {
    pub format: DataFormat,
    pub dtype: DType,
}

impl EdgeType {
    pub const fn new(format: DataFormat, dtype: DType) -> Self {
        Self { format, dtype }
    }

    pub const fn ndarray(dtype: DType) -> Self {
        Self::new(DataFormat::Ndarray, dtype)
    }

    /// Bytes needed to store a tensor of `shape` with this type.
    pub fn storage_bytes(&self, shape: &Shape) -> usize {
        self.format.storage_len(shape) * self.dtype.size_in_bytes()
    }
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.format, self.dtype)
    }
}

/// Identity value written into padded channel lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PadFill {
    /// Additive identity: convolution accumulation, sums, element-wise ops.
    #[default]
    Zero,
    /// Multiplicative identity: products.
    One,
    /// Identity of max.
    Lowest,
    /// Identity of min.
    Highest,
}

impl PadFill {
    pub fn value<T: WithDType>(&self) -> T {
        match self {
            PadFill::Zero => T::zero(),
            PadFill::One => T::one(),
            PadFill::Lowest => T::lowest(),
            PadFill::Highest => T::highest(),
        }
    }
}

/// Round `v` up to a multiple of `m` (`m` > 0).
pub fn round_up(v: usize, m: usize) -> usize {
    v.div_ceil(m) * m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_storage_pads_channels() {
        let s = Shape::from((2, 6, 3, 3));
        assert_eq!(DataFormat::Ndarray.storage_len(&s), 2 * 6 * 9);
        assert_eq!(DataFormat::N4cx.storage_len(&s), 2 * 8 * 9);
        assert_eq!(DataFormat::N8cx.storage_len(&s), 2 * 8 * 9);
        let t = EdgeType::new(DataFormat::N4cx, DType::F16);
        assert_eq!(t.storage_bytes(&s), 2 * 8 * 9 * 2);
    }

    #[test]
    fn test_rank_one_is_not_blockable() {
        assert!(!DataFormat::N4cx.can_hold(&Shape::from(5)));
        assert!(DataFormat::Ndarray.can_hold(&Shape::from(5)));
    }

    #[test]
    fn test_pad_fill_values() {
        assert_eq!(PadFill::Lowest.value::<f32>(), f32::MIN);
        assert_eq!(PadFill::Zero.value::<i64>(), 0);
        assert_eq!(PadFill::One.value::<f32>(), 1.0);
    }
}
