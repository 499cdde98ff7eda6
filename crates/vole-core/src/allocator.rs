// Allocator — opaque host memory capability
//
// The engine allocates memory in exactly two places: synthetic-data trials
// during autotuning, and the persistent scratch arena of a compiled session.
// Both go through the Allocator trait so tests can substitute a limited or
// instrumented allocator.
//
// A Block is an RAII handle. Dropping it (or passing it to
// Allocator::free) returns its bytes to the ledger it was drawn from, so a
// trial that fails half-way through still releases everything it held.
// Storage is a Vec<u64>, which gives every block 8-byte alignment; typed
// access goes through bytemuck and fails cleanly on misaligned or
// ill-sized casts.
//
// Usage:
//
//   let alloc = HostAllocator::new();
//   let block = alloc.alloc(4096)?;
//   let floats: &[f32] = block.typed()?;
//   alloc.free(block);
//   assert_eq!(alloc.stats().live_blocks, 0);

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

// Statistics

/// Snapshot of an allocator's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocStats {
    /// Blocks currently alive.
    pub live_blocks: usize,
    /// Bytes currently alive.
    pub live_bytes: usize,
    /// High-water mark of `live_bytes`.
    pub peak_bytes: usize,
    /// Cumulative successful allocations.
    pub allocs: u64,
    /// Cumulative releases.
    pub frees: u64,
}

/// Shared counters a block reports back to when released.
#[derive(Debug, Default)]
pub struct AllocLedger {
    next_id: AtomicU64,
    live_blocks: AtomicUsize,
    live_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
    allocs: AtomicU64,
    frees: AtomicU64,
}

impl AllocLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn acquire(&self, bytes: usize) -> u64 {
        self.live_blocks.fetch_add(1, Ordering::Relaxed);
        let live = self.live_bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.peak_bytes.fetch_max(live, Ordering::Relaxed);
        self.allocs.fetch_add(1, Ordering::Relaxed);
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn release(&self, bytes: usize) {
        self.live_blocks.fetch_sub(1, Ordering::Relaxed);
        self.live_bytes.fetch_sub(bytes, Ordering::Relaxed);
        self.frees.fetch_add(1, Ordering::Relaxed);
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> AllocStats {
        AllocStats {
            live_blocks: self.live_blocks.load(Ordering::Relaxed),
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            peak_bytes: self.peak_bytes.load(Ordering::Relaxed),
            allocs: self.allocs.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
        }
    }
}

// Block

/// A zero-initialized byte buffer drawn from an allocator.
pub struct Block {
    id: u64,
    words: Vec<u64>,
    len: usize,
    ledger: Option<Arc<AllocLedger>>,
}

impl Block {
    /// A block that belongs to no allocator (host tensors, constants).
    pub fn detached(len: usize) -> Self {
        Block {
            id: 0,
            words: vec![0u64; len.div_ceil(8)],
            len,
            ledger: None,
        }
    }

    /// A block accounted against `ledger`.
    pub fn tracked(len: usize, ledger: &Arc<AllocLedger>) -> Self {
        let id = ledger.acquire(len);
        Block {
            id,
            words: vec![0u64; len.div_ceil(8)],
            len,
            ledger: Some(Arc::clone(ledger)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.len]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..self.len]
    }

    pub fn typed<T: bytemuck::Pod>(&self) -> Result<&[T]> {
        cast_bytes(self.as_bytes())
    }

    pub fn typed_mut<T: bytemuck::Pod>(&mut self) -> Result<&mut [T]> {
        cast_bytes_mut(self.as_bytes_mut())
    }
}

impl Clone for Block {
    fn clone(&self) -> Self {
        let mut out = match &self.ledger {
            Some(ledger) => Block::tracked(self.len, ledger),
            None => Block::detached(self.len),
        };
        out.words.copy_from_slice(&self.words);
        out
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if let Some(ledger) = &self.ledger {
            ledger.release(self.len);
        }
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id)
            .field("len", &self.len)
            .field("tracked", &self.ledger.is_some())
            .finish()
    }
}

/// View a byte slice as `T`s. The slice length must be a multiple of
/// `size_of::<T>()` and suitably aligned.
pub fn cast_bytes<T: bytemuck::Pod>(bytes: &[u8]) -> Result<&[T]> {
    bytemuck::try_cast_slice(bytes)
        .map_err(|e| Error::invalid(format!("cannot view {} bytes as elements: {e}", bytes.len())))
}

pub fn cast_bytes_mut<T: bytemuck::Pod>(bytes: &mut [u8]) -> Result<&mut [T]> {
    let len = bytes.len();
    bytemuck::try_cast_slice_mut(bytes)
        .map_err(|e| Error::invalid(format!("cannot view {len} bytes as elements: {e}")))
}

// Allocator trait

/// Allocate-then-free capability. Implementations must be usable from the
/// compiling thread while worker threads run kernels.
pub trait Allocator: Send + Sync + fmt::Debug {
    /// Allocate `bytes` zero-initialized bytes.
    fn alloc(&self, bytes: usize) -> Result<Block>;

    /// Return a block. Dropping the block has the same effect.
    fn free(&self, block: Block) {
        drop(block);
    }

    fn stats(&self) -> AllocStats;
}

/// Plain host-heap allocator with live/peak accounting and an optional cap.
#[derive(Debug)]
pub struct HostAllocator {
    ledger: Arc<AllocLedger>,
    limit: Option<usize>,
}

impl HostAllocator {
    pub fn new() -> Self {
        HostAllocator {
            ledger: AllocLedger::new(),
            limit: None,
        }
    }

    /// An allocator that refuses to hold more than `limit` live bytes.
    pub fn with_limit(limit: usize) -> Self {
        HostAllocator {
            ledger: AllocLedger::new(),
            limit: Some(limit),
        }
    }
}

impl Default for HostAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for HostAllocator {
    fn alloc(&self, bytes: usize) -> Result<Block> {
        if let Some(limit) = self.limit {
            let live = self.ledger.live_bytes();
            if live + bytes > limit {
                return Err(Error::msg(format!(
                    "out of memory: requested {bytes} bytes with {live} of {limit} in use"
                )));
            }
        }
        Ok(Block::tracked(bytes, &self.ledger))
    }

    fn stats(&self) -> AllocStats {
        self.ledger.stats()
    }
}
