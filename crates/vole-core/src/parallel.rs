// WorkerPool — data-parallel fan-out inside one execute() call
//
// Every kernel parallelizes the same way: the output buffer is split into
// consecutive, disjoint parts (one per batch item, output-channel block or
// spatial tile) and each part is handed to exactly one worker together with
// that worker's private slice of scratch memory.
//
// WORKFLOW:
//
//   1. The caller lists part lengths; they must tile a prefix of `out`.
//   2. Parts are assigned to workers in contiguous runs: worker w gets parts
//      [w * per_worker, (w + 1) * per_worker).
//   3. Scratch is cut into `workers` slices of `scratch_stride` bytes, one per
//      worker, so no locking is needed inside a kernel.
//   4. The call returns once every part has finished. A kernel with a
//      producer phase (group packing) and a consumer phase issues two calls;
//      the return of the first is the barrier.
//
// There is one control-flow path regardless of worker count. A pool with one
// worker runs the same code with a single group.

use rayon::prelude::*;

use crate::error::{Error, Result};

/// Fixed-size worker pool backed by a private rayon thread pool.
#[derive(Debug)]
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    workers: usize,
}

impl WorkerPool {
    /// Build a pool with `workers` threads (at least one).
    pub fn new(workers: usize) -> Result<Self> {
        let workers = workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("vole-worker-{i}"))
            .build()
            .map_err(|e| Error::msg(format!("failed to start worker pool: {e}")))?;
        Ok(WorkerPool { pool, workers })
    }

    /// Number of workers; kernels size per-worker scratch by this.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `f(part_index, part, worker_scratch)` for consecutive parts of
    /// `out` with the given lengths.
    pub fn for_each_split<T, F>(
        &self,
        out: &mut [T],
        lens: &[usize],
        scratch: &mut [u8],
        scratch_stride: usize,
        f: F,
    ) -> Result<()>
    where
        T: Send,
        F: Fn(usize, &mut [T], &mut [u8]) -> Result<()> + Sync,
    {
        let total: usize = lens.iter().sum();
        if total > out.len() {
            return Err(Error::IndexOutOfBounds {
                index: total,
                len: out.len(),
            });
        }
        if lens.is_empty() {
            return Ok(());
        }
        let workers = self.workers.min(lens.len());
        let per_worker = lens.len().div_ceil(workers);

        let mut parts: Vec<(usize, &mut [T])> = Vec::with_capacity(lens.len());
        let mut rest = out;
        for (i, &len) in lens.iter().enumerate() {
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(len);
            parts.push((i, head));
            rest = tail;
        }

        let scratch_parts: Vec<&mut [u8]> = if scratch_stride == 0 {
            (0..workers).map(|_| <&mut [u8]>::default()).collect()
        } else {
            if scratch.len() < scratch_stride * workers {
                return Err(Error::IndexOutOfBounds {
                    index: scratch_stride * workers,
                    len: scratch.len(),
                });
            }
            scratch.chunks_mut(scratch_stride).take(workers).collect()
        };

        let mut parts = parts.into_iter();
        let groups: Vec<(Vec<(usize, &mut [T])>, &mut [u8])> = scratch_parts
            .into_iter()
            .map(|s| (parts.by_ref().take(per_worker).collect(), s))
            .collect();

        self.pool.install(|| {
            groups.into_par_iter().try_for_each(|(items, scratch)| {
                for (i, part) in items {
                    f(i, part, scratch)?;
                }
                Ok(())
            })
        })
    }

    /// `for_each_split` with equal parts of `chunk_len` (the last may be short).
    pub fn for_each_chunk<T, F>(
        &self,
        out: &mut [T],
        chunk_len: usize,
        scratch: &mut [u8],
        scratch_stride: usize,
        f: F,
    ) -> Result<()>
    where
        T: Send,
        F: Fn(usize, &mut [T], &mut [u8]) -> Result<()> + Sync,
    {
        if chunk_len == 0 || out.is_empty() {
            return Ok(());
        }
        let full = out.len() / chunk_len;
        let mut lens = vec![chunk_len; full];
        if out.len() % chunk_len != 0 {
            lens.push(out.len() % chunk_len);
        }
        self.for_each_split(out, &lens, scratch, scratch_stride, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_part_written_once() {
        let pool = WorkerPool::new(3).unwrap();
        let mut out = vec![0u32; 10];
        pool.for_each_split(&mut out, &[1, 4, 0, 3, 2], &mut [], 0, |i, part, _| {
            for v in part.iter_mut() {
                *v += i as u32 + 1;
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(out, vec![1, 2, 2, 2, 2, 4, 4, 4, 5, 5]);
    }

    #[test]
    fn test_scratch_is_private_per_worker() {
        let pool = WorkerPool::new(2).unwrap();
        let mut out = vec![0u8; 8];
        let mut scratch = vec![0u8; 2 * 4];
        pool.for_each_chunk(&mut out, 1, &mut scratch, 4, |i, part, s| {
            assert_eq!(s.len(), 4);
            s[0] = i as u8;
            part[0] = s[0];
            Ok(())
        })
        .unwrap();
        assert_eq!(out, (0..8).collect::<Vec<u8>>());
    }

    #[test]
    fn test_short_scratch_is_rejected() {
        let pool = WorkerPool::new(4).unwrap();
        let mut out = vec![0u8; 8];
        let mut scratch = vec![0u8; 7];
        let r = pool.for_each_chunk(&mut out, 1, &mut scratch, 4, |_, _, _| Ok(()));
        assert!(r.is_err());
    }

    #[test]
    fn test_error_propagates() {
        let pool = WorkerPool::new(2).unwrap();
        let mut out = vec![0u8; 4];
        let r = pool.for_each_chunk(&mut out, 1, &mut [], 0, |i, _, _| {
            if i == 2 {
                return Err(Error::msg("boom"));
            }
            Ok(())
        });
        assert!(r.is_err());
    }

    #[test]
    fn test_single_worker_same_result() {
        let one = WorkerPool::new(1).unwrap();
        let many = WorkerPool::new(4).unwrap();
        let run = |pool: &WorkerPool| {
            let mut out = vec![0i64; 12];
            pool.for_each_chunk(&mut out, 5, &mut [], 0, |i, part, _| {
                for (j, v) in part.iter_mut().enumerate() {
                    *v = (i * 100 + j) as i64;
                }
                Ok(())
            })
            .unwrap();
            out
        };
        assert_eq!(run(&one), run(&many));
    }
}
