// Memory planner — one arena for every activation and scratch buffer
//
// Steps run strictly one after another, so two buffers whose lifetimes do
// not overlap may share bytes.
//
// COMPONENTS:
//
//   BufferKey       — an edge's tensor, or the scratch of one step
//   BufferLifetime  — size plus the first and last step that touch it
//   MemoryPlan      — offset of every buffer inside the arena
//   carve_regions   — split the arena into disjoint mutable slices
//
// LIFETIMES (inclusive step indices):
//
//   graph input         [0, last reader]
//   produced tensor     [producer, last reader]
//   graph output        [producer, end]
//   step scratch        [step, step]
//
// Placement is greedy: largest buffer first, at the lowest aligned offset
// that does not collide with an already placed buffer of overlapping life.

use std::collections::HashMap;
use std::fmt;

use vole_core::format::round_up;
use vole_core::{Error, Result};
use vole_ir::EdgeId;

/// Every region starts on this boundary.
pub const ARENA_ALIGN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BufferKey {
    Edge(EdgeId),
    Scratch(usize),
}

impl fmt::Display for BufferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferKey::Edge(e) => write!(f, "edge {e}"),
            BufferKey::Scratch(s) => write!(f, "scratch of step {s}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLifetime {
    pub key: BufferKey,
    pub bytes: usize,
    pub first: usize,
    pub last: usize,
}

impl BufferLifetime {
    fn overlaps(&self, other: &BufferLifetime) -> bool {
        self.first <= other.last && other.first <= self.last
    }
}

/// Offset and length of one buffer inside the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub offset: usize,
    pub len: usize,
}

impl Region {
    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    fn collides(&self, other: &Region) -> bool {
        self.len > 0 && other.len > 0 && self.offset < other.end() && other.offset < self.end()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryPlan {
    regions: HashMap<BufferKey, Region>,
    /// Arena size in bytes.
    pub total: usize,
    /// Sum of all buffer sizes; `total` is at most this.
    pub requested: usize,
}

impl MemoryPlan {
    pub fn region(&self, key: BufferKey) -> Result<Region> {
        self.regions
            .get(&key)
            .copied()
            .ok_or_else(|| Error::invalid(format!("{key} has no arena region")))
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BufferKey, &Region)> {
        self.regions.iter()
    }
}

/// Place every buffer. Keys must be unique.
pub fn plan_memory(buffers: &[BufferLifetime]) -> Result<MemoryPlan> {
    let mut order: Vec<&BufferLifetime> = buffers.iter().collect();
    order.sort_by(|a, b| b.bytes.cmp(&a.bytes).then(a.key.cmp(&b.key)));

    let mut placed: Vec<(BufferLifetime, Region)> = Vec::with_capacity(buffers.len());
    let mut plan = MemoryPlan::default();
    for buf in order {
        if plan.regions.contains_key(&buf.key) {
            return Err(Error::invalid(format!("{} is planned twice", buf.key)));
        }
        if buf.first > buf.last {
            return Err(Error::invalid(format!(
                "{} dies at step {} before it is born at step {}",
                buf.key, buf.last, buf.first
            )));
        }
        let mut busy: Vec<Region> = placed
            .iter()
            .filter(|(l, r)| r.len > 0 && l.overlaps(buf))
            .map(|(_, r)| *r)
            .collect();
        busy.sort_by_key(|r| r.offset);

        let mut offset = 0;
        if buf.bytes > 0 {
            for r in &busy {
                if offset + buf.bytes <= r.offset {
                    break;
                }
                offset = offset.max(round_up(r.end(), ARENA_ALIGN));
            }
        }
        let region = Region {
            offset,
            len: buf.bytes,
        };
        plan.total = plan.total.max(round_up(region.end(), ARENA_ALIGN));
        plan.requested += buf.bytes;
        plan.regions.insert(buf.key, region);
        placed.push((*buf, region));
    }
    Ok(plan)
}

/// Split `arena` into one mutable slice per region, returned in the order
/// given. Regions must not overlap; empty regions yield empty slices.
pub fn carve_regions<'a>(arena: &'a mut [u8], regions: &[Region]) -> Result<Vec<&'a mut [u8]>> {
    let len = arena.len();
    let mut by_offset: Vec<usize> = (0..regions.len()).collect();
    by_offset.sort_by_key(|&i| (regions[i].offset, regions[i].len));

    let mut out: Vec<Option<&'a mut [u8]>> = (0..regions.len()).map(|_| None).collect();
    let mut rest: &'a mut [u8] = arena;
    let mut cursor = 0;
    for i in by_offset {
        let r = regions[i];
        if r.len == 0 {
            out[i] = Some(Default::default());
            continue;
        }
        if r.end() > len {
            return Err(Error::IndexOutOfBounds {
                index: r.end(),
                len,
            });
        }
        if r.offset < cursor {
            return Err(Error::invalid(format!(
                "arena region at {} overlaps the region ending at {cursor}",
                r.offset
            )));
        }
        let (_, tail) = std::mem::take(&mut rest).split_at_mut(r.offset - cursor);
        let (mine, tail) = tail.split_at_mut(r.len);
        rest = tail;
        cursor = r.end();
        out[i] = Some(mine);
    }
    out.into_iter()
        .map(|s| s.ok_or_else(|| Error::msg("arena region left uncarved")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(key: usize, bytes: usize, first: usize, last: usize) -> BufferLifetime {
        BufferLifetime {
            key: BufferKey::Edge(EdgeId(key)),
            bytes,
            first,
            last,
        }
    }

    fn assert_disjoint(plan: &MemoryPlan, bufs: &[BufferLifetime]) {
        for a in bufs {
            for b in bufs {
                if a.key == b.key || !a.overlaps(b) {
                    continue;
                }
                let (ra, rb) = (plan.region(a.key).unwrap(), plan.region(b.key).unwrap());
                assert!(!ra.collides(&rb), "{} and {} share bytes", a.key, b.key);
            }
        }
    }

    #[test]
    fn test_chain_reuses_dead_buffers() {
        // x -> a -> b -> c, each step reads the previous tensor
        let bufs = vec![buf(0, 1000, 0, 0), buf(1, 1000, 0, 1), buf(2, 1000, 1, 2), buf(3, 1000, 2, 3)];
        let plan = plan_memory(&bufs).unwrap();
        assert_disjoint(&plan, &bufs);
        assert!(plan.total < plan.requested);
        // only two tensors are ever live at once
        assert_eq!(plan.total, 2 * round_up(1000, ARENA_ALIGN));
    }

    #[test]
    fn test_overlapping_lifetimes_never_share() {
        let mut bufs: Vec<BufferLifetime> = (0..12)
            .map(|i| buf(i, 100 + 37 * i, i % 4, i % 4 + (i % 3)))
            .collect();
        bufs.push(BufferLifetime {
            key: BufferKey::Scratch(2),
            bytes: 512,
            first: 2,
            last: 2,
        });
        let plan = plan_memory(&bufs).unwrap();
        assert_disjoint(&plan, &bufs);
        for (_, r) in plan.iter() {
            assert_eq!(r.offset % ARENA_ALIGN, 0);
            assert!(r.end() <= plan.total);
        }
    }

    #[test]
    fn test_bad_requests() {
        assert!(plan_memory(&[buf(0, 8, 3, 1)]).is_err());
        assert!(plan_memory(&[buf(0, 8, 0, 1), buf(0, 8, 0, 1)]).is_err());
    }

    #[test]
    fn test_carve_keeps_request_order() {
        let mut arena = vec![0u8; 256];
        let regions = [
            Region { offset: 128, len: 64 },
            Region { offset: 0, len: 64 },
            Region { offset: 0, len: 0 },
        ];
        let mut parts = carve_regions(&mut arena, &regions).unwrap();
        assert_eq!(parts[0].len(), 64);
        assert!(parts[2].is_empty());
        parts[0].fill(7);
        parts[1].fill(1);
        drop(parts);
        assert_eq!(arena[128], 7);
        assert_eq!(arena[0], 1);
        assert_eq!(arena[64], 0);
    }

    #[test]
    fn test_carve_rejects_overlap_and_overflow() {
        let mut arena = vec![0u8; 128];
        let overlap = [Region { offset: 0, len: 64 }, Region { offset: 32, len: 64 }];
        assert!(carve_regions(&mut arena, &overlap).is_err());
        let past = [Region { offset: 64, len: 128 }];
        assert!(carve_regions(&mut arena, &past).is_err());
    }
}
