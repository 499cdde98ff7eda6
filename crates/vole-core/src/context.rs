use std::sync::Arc;

use crate::allocator::{Allocator, HostAllocator};
use crate::clock::{Clock, MonotonicClock};
use crate::error::Result;
use crate::parallel::WorkerPool;

/// Capabilities shared by every manager and executor of one engine: the
/// allocator, the timing source and the worker pool.
///
/// Cloning is cheap; all three are reference counted.
#[derive(Debug, Clone)]
pub struct EngineContext {
    allocator: Arc<dyn Allocator>,
    clock: Arc<dyn Clock>,
    pool: Arc<WorkerPool>,
}

impl EngineContext {
    pub fn new(allocator: Arc<dyn Allocator>, clock: Arc<dyn Clock>, pool: Arc<WorkerPool>) -> Self {
        EngineContext {
            allocator,
            clock,
            pool,
        }
    }

    /// Host allocator, wall clock and a pool of `workers` threads.
    pub fn host(workers: usize) -> Result<Self> {
        Ok(Self::new(
            Arc::new(HostAllocator::new()),
            Arc::new(MonotonicClock::new()),
            Arc::new(WorkerPool::new(workers)?),
        ))
    }

    pub fn with_allocator(mut self, allocator: Arc<dyn Allocator>) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn allocator(&self) -> &dyn Allocator {
        self.allocator.as_ref()
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn workers(&self) -> usize {
        self.pool.workers()
    }
}
