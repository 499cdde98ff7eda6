// TileTable — monomorphized direct-convolution micro-kernels
//
// The direct convolution walks each output row in tiles of up to
// MAX_TILE_W columns. Each (tile width, output-channel blocks) combination is
// a separate instantiation of `direct_tile`, so the inner loops have
// compile-time trip counts. The table maps the remaining width of a row and
// the number of output-channel blocks in the current pair (1 or 2) to the
// matching function pointer.
//
// One table per element type is built when a KernelRegistry is created and
// shared by every executor of that registry.
//
// Accumulation is always f32, whatever the storage type.

use std::fmt;
use std::ops::Range;

use vole_core::{Error, Result, WithDType};

/// Widest output tile handled by one kernel call.
pub const MAX_TILE_W: usize = 10;

/// Everything a tile kernel reads.
///
/// `src` is addressed as [icb][src_h][src_w][block] from `src_base`;
/// `filter` as [icb][kh][kw][block (ic)][2 * block (oc)] from `flt_base`.
/// The accumulator is [ocb][dst_h * dst_w][block].
#[derive(Debug, Clone)]
pub struct TileArgs<'a, T> {
    pub src: &'a [T],
    pub src_base: usize,
    pub src_h: usize,
    pub src_w: usize,
    pub filter: &'a [T],
    pub flt_base: usize,
    pub block: usize,
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub pad: [usize; 2],
    pub dilation: [usize; 2],
    /// Input-channel blocks to accumulate, relative to `src_base`.
    pub icb: Range<usize>,
    pub oh: usize,
    pub ow: usize,
    pub dst_w: usize,
    pub dst_hw: usize,
}

pub type TileFn<T> = fn(&TileArgs<'_, T>, &mut [f32]);

/// Accumulate `TW` output columns of `OCB` output-channel blocks.
fn direct_tile<T: WithDType, const OCB: usize, const TW: usize>(a: &TileArgs<'_, T>, acc: &mut [f32]) {
    let b = a.block;
    let b2 = 2 * b;
    let [kh_n, kw_n] = a.kernel;
    let plane = a.src_h * a.src_w * b;
    let ih0 = (a.oh * a.stride[0]) as isize - a.pad[0] as isize;

    for icb in a.icb.clone() {
        let src_blk = a.src_base + icb * plane;
        for kh in 0..kh_n {
            let ih = ih0 + (kh * a.dilation[0]) as isize;
            if ih < 0 || ih >= a.src_h as isize {
                continue;
            }
            let src_row = src_blk + ih as usize * a.src_w * b;
            for kw in 0..kw_n {
                let w_off = a.flt_base + ((icb * kh_n + kh) * kw_n + kw) * b * b2;
                for t in 0..TW {
                    let ow = a.ow + t;
                    let iw = (ow * a.stride[1] + kw * a.dilation[1]) as isize - a.pad[1] as isize;
                    if iw < 0 || iw >= a.src_w as isize {
                        continue;
                    }
                    let x_off = src_row + iw as usize * b;
                    let s = a.oh * a.dst_w + ow;
                    for l in 0..b {
                        let x = a.src[x_off + l].to_acc();
                        let w_row = w_off + l * b2;
                        for ob in 0..OCB {
                            let dst = (ob * a.dst_hw + s) * b;
                            let w = &a.filter[w_row + ob * b..w_row + (ob + 1) * b];
                            for (o, &wv) in w.iter().enumerate() {
                                acc[dst + o] += x * wv.to_acc();
                            }
                        }
                    }
                }
            }
        }
    }
}

macro_rules! tile_row {
    ($t:ty, $ocb:literal) => {
        [
            direct_tile::<$t, $ocb, 1> as TileFn<$t>,
            direct_tile::<$t, $ocb, 2>,
            direct_tile::<$t, $ocb, 3>,
            direct_tile::<$t, $ocb, 4>,
            direct_tile::<$t, $ocb, 5>,
            direct_tile::<$t, $ocb, 6>,
            direct_tile::<$t, $ocb, 7>,
            direct_tile::<$t, $ocb, 8>,
            direct_tile::<$t, $ocb, 9>,
            direct_tile::<$t, $ocb, 10>,
        ]
    };
}

/// (tile width, oc blocks) → kernel.
pub struct TileTable<T> {
    oc1: [TileFn<T>; MAX_TILE_W],
    oc2: [TileFn<T>; MAX_TILE_W],
}

impl<T: WithDType> TileTable<T> {
    pub fn new() -> Self {
        TileTable {
            oc1: tile_row!(T, 1),
            oc2: tile_row!(T, 2),
        }
    }

    /// Kernel for a tile of `width` columns (1..=MAX_TILE_W) and `ocb`
    /// output-channel blocks (1 or 2).
    pub fn get(&self, width: usize, ocb: usize) -> Result<TileFn<T>> {
        if width == 0 || width > MAX_TILE_W {
            return Err(Error::invalid(format!("no tile kernel of width {width}")));
        }
        match ocb {
            1 => Ok(self.oc1[width - 1]),
            2 => Ok(self.oc2[width - 1]),
            _ => Err(Error::invalid(format!("no tile kernel for {ocb} oc blocks"))),
        }
    }
}

impl<T: WithDType> Default for TileTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for TileTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TileTable(2 x {MAX_TILE_W})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_bounds() {
        let t = TileTable::<f32>::new();
        assert!(t.get(1, 1).is_ok());
        assert!(t.get(MAX_TILE_W, 2).is_ok());
        assert!(t.get(0, 1).is_err());
        assert!(t.get(MAX_TILE_W + 1, 1).is_err());
        assert!(t.get(3, 3).is_err());
    }

    #[test]
    fn test_tile_matches_naive_dot() {
        // 1x1 kernel, one input block of 2 lanes, 3 columns.
        let block = 2;
        let src: Vec<f32> = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]; // [w=3][2]
        // filter [ic lane][4 oc lanes]
        let filter: Vec<f32> = vec![1.0, 0.0, 2.0, 0.0, 0.0, 1.0, 0.0, 3.0];
        let args = TileArgs {
            src: &src,
            src_base: 0,
            src_h: 1,
            src_w: 3,
            filter: &filter,
            flt_base: 0,
            block,
            kernel: [1, 1],
            stride: [1, 1],
            pad: [0, 0],
            dilation: [1, 1],
            icb: 0..1,
            oh: 0,
            ow: 0,
            dst_w: 3,
            dst_hw: 3,
        };
        let mut acc = vec![0.0f32; 2 * 3 * block];
        let table = TileTable::<f32>::new();
        table.get(3, 2).unwrap()(&args, &mut acc);
        // oc0 = x0, oc1 = x1, oc2 = 2*x0, oc3 = 3*x1
        assert_eq!(&acc[0..6], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(&acc[6..12], &[2.0, 6.0, 6.0, 12.0, 10.0, 18.0]);
    }
}
