use crate::error::{Error, Result};
use crate::format::DataFormat;
use crate::shape::Shape;

// Layout — strided addressing of edge storage
//
// Kernels never compute byte offsets by hand. Every buffer they touch is
// described by a Layout (shape + strides + offset) or, for feature maps, a
// FeatureView that knows the data format's channel blocking.
//
// KEY CONCEPTS:
//
// 1. **Storage layout**: a blocked [N, C, H, W] tensor in N4cx is stored as
//    the contiguous 5-D array [N, ceil(C/4), H, W, 4]. Layout::for_format
//    returns that storage layout, so generic strided code can walk blocked
//    buffers without knowing anything about blocking.
//
// 2. **Checked access**: View::get and FeatureView::try_get validate every
//    index against the shape and the backing slice, returning
//    Error::IndexOutOfBounds instead of reading past the buffer. Hot loops use
//    the unchecked-arithmetic `index` helpers, which still go through slice
//    indexing and panic rather than read out of bounds.
//
// 3. **Narrow**: selecting a sub-range of one axis adjusts the offset and
//    shape only. Group convolution uses it to address one channel group of a
//    tensor without copying.

/// Layout describes how a logical shape maps to flat storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: Vec<usize>,
    offset: usize,
}

impl Layout {
    /// Create a new contiguous (row-major) layout for the given shape.
    pub fn contiguous(shape: Shape) -> Self {
        let strides = shape.stride_contiguous();
        Layout {
            shape,
            strides,
            offset: 0,
        }
    }

    /// Create a layout with explicit strides and offset.
    pub fn new(shape: Shape, strides: Vec<usize>, offset: usize) -> Self {
        Layout {
            shape,
            strides,
            offset,
        }
    }

    /// Storage layout of a tensor of logical `shape` held in `format`.
    ///
    /// Ndarray yields the contiguous layout of `shape` itself. Blocked
    /// formats yield the contiguous layout of [N, Cb, S..., B].
    pub fn for_format(shape: &Shape, format: DataFormat) -> Layout {
        if !format.is_blocked() || shape.rank() < 2 {
            return Layout::contiguous(shape.clone());
        }
        let b = format.channel_block();
        let mut dims = Vec::with_capacity(shape.rank() + 1);
        dims.push(shape.batch());
        dims.push(shape.channels().div_ceil(b));
        dims.extend_from_slice(&shape.dims()[2..]);
        dims.push(b);
        Layout::contiguous(Shape::new(dims))
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    /// Check if this layout is contiguous (row-major, no gaps, offset 0).
    pub fn is_contiguous(&self) -> bool {
        self.offset == 0 && self.strides == self.shape.stride_contiguous()
    }

    /// Narrow (slice) along a dimension, returning a view into the same
    /// storage with adjusted shape and offset.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Layout> {
        let rank = self.rank();
        if dim >= rank {
            return Err(Error::DimOutOfRange { dim, rank });
        }
        let dim_size = self.shape.dims()[dim];
        if start + len > dim_size {
            return Err(Error::IndexOutOfBounds {
                index: start + len,
                len: dim_size,
            });
        }
        let mut new_dims = self.shape.dims().to_vec();
        new_dims[dim] = len;
        let new_offset = self.offset + start * self.strides[dim];
        Ok(Layout::new(
            Shape::new(new_dims),
            self.strides.clone(),
            new_offset,
        ))
    }

    /// flat_index = offset + sum(index[i] * stride[i]). No bounds checks.
    pub fn flat_index(&self, index: &[usize]) -> usize {
        let mut flat = self.offset;
        for (i, &idx) in index.iter().enumerate() {
            flat += idx * self.strides[i];
        }
        flat
    }

    /// Bounds-checked flat index.
    pub fn checked_index(&self, index: &[usize]) -> Result<usize> {
        if index.len() != self.rank() {
            return Err(Error::RankMismatch {
                expected: self.rank(),
                got: index.len(),
            });
        }
        for (&i, &d) in index.iter().zip(self.dims()) {
            if i >= d {
                return Err(Error::IndexOutOfBounds { index: i, len: d });
            }
        }
        Ok(self.flat_index(index))
    }

    /// One past the largest flat index this layout can reach (0 if empty).
    pub fn storage_extent(&self) -> usize {
        if self.shape.is_empty() {
            return 0;
        }
        let last: usize = self
            .dims()
            .iter()
            .zip(&self.strides)
            .map(|(&d, &s)| (d - 1) * s)
            .sum();
        self.offset + last + 1
    }

    /// Iterator over all flat indices of this layout, in logical order.
    pub fn strided_indices(&self) -> StridedIter {
        StridedIter::new(self)
    }
}

/// Iterator that yields flat storage indices for each element of a Layout.
pub struct StridedIter {
    current: Vec<usize>,
    dims: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
    remaining: usize,
}

impl StridedIter {
    fn new(layout: &Layout) -> Self {
        StridedIter {
            current: vec![0; layout.rank()],
            dims: layout.dims().to_vec(),
            strides: layout.strides().to_vec(),
            offset: layout.offset(),
            remaining: layout.elem_count(),
        }
    }
}

impl Iterator for StridedIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        let idx = self.offset
            + self
                .current
                .iter()
                .zip(&self.strides)
                .map(|(&i, &s)| i * s)
                .sum::<usize>();
        self.remaining -= 1;
        // Odometer increment, last dimension fastest.
        for d in (0..self.dims.len()).rev() {
            self.current[d] += 1;
            if self.current[d] < self.dims[d] {
                break;
            }
            self.current[d] = 0;
        }
        Some(idx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

/// Read-only strided view: a slice plus the layout that addresses it.
#[derive(Debug, Clone, Copy)]
pub struct View<'a, T> {
    data: &'a [T],
    layout: &'a Layout,
}

impl<'a, T: Copy> View<'a, T> {
    /// Fails if the layout can reach past the end of `data`.
    pub fn new(data: &'a [T], layout: &'a Layout) -> Result<Self> {
        let extent = layout.storage_extent();
        if extent > data.len() {
            return Err(Error::IndexOutOfBounds {
                index: extent,
                len: data.len(),
            });
        }
        Ok(View { data, layout })
    }

    pub fn layout(&self) -> &Layout {
        self.layout
    }

    pub fn get(&self, index: &[usize]) -> Result<T> {
        Ok(self.data[self.layout.checked_index(index)?])
    }

    /// Elements in logical order.
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        self.layout.strided_indices().map(|i| self.data[i])
    }
}

// FeatureView — logical (n, c, s) addressing of NC[S] feature maps
//
// `s` is the flattened spatial index. The view hides the difference between
// planar and channel-blocked storage:
//
//   Ndarray: ((n * C  + c) * S + s)
//   blocked: ((n * Cb + c / B) * S + s) * B + c % B

/// Geometry shared by FeatureView and FeatureViewMut.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureGeom {
    pub batch: usize,
    pub channels: usize,
    pub spatial: usize,
    pub block: usize,
    pub cblocks: usize,
}

impl FeatureGeom {
    pub fn new(shape: &Shape, format: DataFormat) -> Self {
        let block = if shape.rank() < 2 {
            1
        } else {
            format.channel_block()
        };
        let channels = shape.channels();
        FeatureGeom {
            batch: shape.batch(),
            channels,
            spatial: shape.spatial(),
            block,
            cblocks: channels.div_ceil(block),
        }
    }

    /// Stored elements per batch item.
    pub fn batch_stride(&self) -> usize {
        self.cblocks * self.spatial * self.block
    }

    /// Stored elements per channel block.
    pub fn block_stride(&self) -> usize {
        self.spatial * self.block
    }

    pub fn storage_len(&self) -> usize {
        self.batch * self.batch_stride()
    }

    #[inline]
    pub fn index(&self, n: usize, c: usize, s: usize) -> usize {
        ((n * self.cblocks + c / self.block) * self.spatial + s) * self.block + c % self.block
    }

    pub fn checked_index(&self, n: usize, c: usize, s: usize) -> Result<usize> {
        if n >= self.batch {
            return Err(Error::IndexOutOfBounds {
                index: n,
                len: self.batch,
            });
        }
        if c >= self.cblocks * self.block {
            return Err(Error::IndexOutOfBounds {
                index: c,
                len: self.cblocks * self.block,
            });
        }
        if s >= self.spatial {
            return Err(Error::IndexOutOfBounds {
                index: s,
                len: self.spatial,
            });
        }
        Ok(self.index(n, c, s))
    }
}

/// Read-only (n, c, s) view over a feature map in any format.
#[derive(Debug, Clone, Copy)]
pub struct FeatureView<'a, T> {
    data: &'a [T],
    geom: FeatureGeom,
}

impl<'a, T: Copy> FeatureView<'a, T> {
    pub fn new(data: &'a [T], shape: &Shape, format: DataFormat) -> Result<Self> {
        Self::with_geom(data, FeatureGeom::new(shape, format))
    }

    pub fn with_geom(data: &'a [T], geom: FeatureGeom) -> Result<Self> {
        if data.len() < geom.storage_len() {
            return Err(Error::IndexOutOfBounds {
                index: geom.storage_len(),
                len: data.len(),
            });
        }
        Ok(FeatureView { data, geom })
    }

    pub fn geom(&self) -> &FeatureGeom {
        &self.geom
    }

    pub fn data(&self) -> &'a [T] {
        self.data
    }

    /// Element at logical (n, c, s); `c` may address a padded lane.
    #[inline]
    pub fn get(&self, n: usize, c: usize, s: usize) -> T {
        self.data[self.geom.index(n, c, s)]
    }

    pub fn try_get(&self, n: usize, c: usize, s: usize) -> Result<T> {
        Ok(self.data[self.geom.checked_index(n, c, s)?])
    }
}

/// Mutable (n, c, s) view over a feature map in any format.
#[derive(Debug)]
pub struct FeatureViewMut<'a, T> {
    data: &'a mut [T],
    geom: FeatureGeom,
}

impl<'a, T: Copy> FeatureViewMut<'a, T> {
    pub fn new(data: &'a mut [T], shape: &Shape, format: DataFormat) -> Result<Self> {
        Self::with_geom(data, FeatureGeom::new(shape, format))
    }

    pub fn with_geom(data: &'a mut [T], geom: FeatureGeom) -> Result<Self> {
        if data.len() < geom.storage_len() {
            return Err(Error::IndexOutOfBounds {
                index: geom.storage_len(),
                len: data.len(),
            });
        }
        Ok(FeatureViewMut { data, geom })
    }

    pub fn geom(&self) -> &FeatureGeom {
        &self.geom
    }

    #[inline]
    pub fn set(&mut self, n: usize, c: usize, s: usize, v: T) {
        let i = self.geom.index(n, c, s);
        self.data[i] = v;
    }

    pub fn try_set(&mut self, n: usize, c: usize, s: usize, v: T) -> Result<()> {
        let i = self.geom.checked_index(n, c, s)?;
        self.data[i] = v;
        Ok(())
    }

    /// Overwrite every padded lane (channels C..Cb*B) with `v`.
    pub fn fill_padding(&mut self, v: T) {
        let g = self.geom;
        for n in 0..g.batch {
            for c in g.channels..g.cblocks * g.block {
                for s in 0..g.spatial {
                    self.set(n, c, s, v);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_storage_layout() {
        let l = Layout::for_format(&Shape::from((2, 6, 3, 5)), DataFormat::N4cx);
        assert_eq!(l.dims(), &[2, 2, 3, 5, 4]);
        assert!(l.is_contiguous());
        assert_eq!(l.storage_extent(), 2 * 2 * 3 * 5 * 4);
    }

    #[test]
    fn test_feature_index_matches_storage_layout() {
        let shape = Shape::from((2, 6, 3, 5));
        let l = Layout::for_format(&shape, DataFormat::N4cx);
        let g = FeatureGeom::new(&shape, DataFormat::N4cx);
        // channel 5 lives in block 1, lane 1; spatial (2, 4) is s = 14
        assert_eq!(g.index(1, 5, 14), l.flat_index(&[1, 1, 2, 4, 1]));
    }

    #[test]
    fn test_view_checks_bounds() {
        let data = vec![0.0f32; 6];
        let l = Layout::contiguous(Shape::from((2, 3)));
        let v = View::new(&data, &l).unwrap();
        assert!(v.get(&[1, 2]).is_ok());
        assert!(v.get(&[2, 0]).is_err());
        assert!(v.get(&[0]).is_err());

        let short = vec![0.0f32; 5];
        assert!(View::new(&short, &l).is_err());
    }

    #[test]
    fn test_narrow_view() {
        let data: Vec<i64> = (0..12).collect();
        let l = Layout::contiguous(Shape::from((3, 4))).narrow(1, 1, 2).unwrap();
        let v = View::new(&data, &l).unwrap();
        let got: Vec<i64> = v.iter().collect();
        assert_eq!(got, vec![1, 2, 5, 6, 9, 10]);
    }

    #[test]
    fn test_fill_padding_touches_only_padded_lanes() {
        let shape = Shape::from((1, 6, 2));
        let mut data = vec![0.0f32; DataFormat::N4cx.storage_len(&shape)];
        let mut v = FeatureViewMut::new(&mut data, &shape, DataFormat::N4cx).unwrap();
        v.fill_padding(f32::MIN);
        let g = FeatureGeom::new(&shape, DataFormat::N4cx);
        for c in 0..8 {
            for s in 0..2 {
                let want = if c < 6 { 0.0 } else { f32::MIN };
                assert_eq!(data[g.index(0, c, s)], want);
            }
        }
    }
}
