// src/port_allocator.rs
//! Random non-colliding relay port allocation
//!
//! Ports are drawn at random from the configured range so relay ports are
//! spread out and less likely to collide with sockets this process does not
//! manage. After a bounded number of random probes the allocator scans the
//! range from a random offset, so allocation only fails when every port in the
//! range is genuinely taken.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::{thread_rng, Rng};
use tracing::{debug, trace, warn};

use crate::config::{BindingConfig, DEFAULT_RANDOM_ATTEMPTS};
use crate::error::{BindingError, BindingResult};

/// Process-wide pool of relay ports
#[derive(Debug)]
pub struct PortAllocator {
    /// Lowest port handed out
    min_port: u16,

    /// Highest port handed out (inclusive)
    max_port: u16,

    /// Random probes before falling back to a scan
    max_random_attempts: u32,

    /// Ports currently allocated
    allocated: Mutex<HashSet<u16>>,

    /// Statistics
    stats: PoolStats,
}

/// Pool statistics
#[derive(Debug, Default)]
struct PoolStats {
    allocations_total: AtomicU64,
    releases_total: AtomicU64,
    pool_exhausted_count: AtomicU64,
    scan_fallbacks: AtomicU64,
}

impl PortAllocator {
    /// Create an allocator over the inclusive range `min_port..=max_port`
    pub fn new(min_port: u16, max_port: u16) -> BindingResult<Self> {
        if min_port == 0 || min_port > max_port {
            return Err(BindingError::InvalidConfig(format!(
                "invalid relay port range {}-{}",
                min_port, max_port
            )));
        }

        debug!("Relay port pool covers {}-{}", min_port, max_port);

        Ok(Self {
            min_port,
            max_port,
            max_random_attempts: DEFAULT_RANDOM_ATTEMPTS,
            allocated: Mutex::new(HashSet::new()),
            stats: PoolStats::default(),
        })
    }

    /// Create an allocator from configuration
    pub fn from_config(config: &BindingConfig) -> BindingResult<Self> {
        config.validate()?;
        Ok(Self::new(config.min_port, config.max_port)?
            .with_random_attempts(config.max_random_attempts))
    }

    /// Override the number of random probes per allocation
    pub fn with_random_attempts(mut self, attempts: u32) -> Self {
        self.max_random_attempts = attempts;
        self
    }

    /// Allocate a port that is not currently in use
    pub fn allocate(&self) -> BindingResult<u16> {
        let mut allocated = self.allocated.lock();
        let capacity = self.capacity();

        if allocated.len() as u32 >= capacity {
            self.stats.pool_exhausted_count.fetch_add(1, Ordering::Relaxed);
            warn!("Relay port pool {}-{} exhausted", self.min_port, self.max_port);
            return Err(BindingError::NoPortAvailable {
                min: self.min_port,
                max: self.max_port,
            });
        }

        let mut rng = thread_rng();

        for _ in 0..self.max_random_attempts {
            let port = rng.gen_range(self.min_port..=self.max_port);
            if allocated.insert(port) {
                self.stats.allocations_total.fetch_add(1, Ordering::Relaxed);
                trace!("Allocated relay port {}", port);
                return Ok(port);
            }
        }

        // Dense pool: walk the whole range once from a random starting point
        self.stats.scan_fallbacks.fetch_add(1, Ordering::Relaxed);
        let offset = rng.gen_range(0..capacity);
        for step in 0..capacity {
            let port = (u32::from(self.min_port) + (offset + step) % capacity) as u16;
            if allocated.insert(port) {
                self.stats.allocations_total.fetch_add(1, Ordering::Relaxed);
                trace!("Allocated relay port {} after range scan", port);
                return Ok(port);
            }
        }

        self.stats.pool_exhausted_count.fetch_add(1, Ordering::Relaxed);
        Err(BindingError::NoPortAvailable {
            min: self.min_port,
            max: self.max_port,
        })
    }

    /// Return a port to the pool.
    ///
    /// Returns `false` when the port was not allocated; the pool is left untouched.
    pub fn release(&self, port: u16) -> bool {
        let removed = self.allocated.lock().remove(&port);
        if removed {
            self.stats.releases_total.fetch_add(1, Ordering::Relaxed);
            trace!("Released relay port {}", port);
        } else {
            debug!("Ignoring release of relay port {} which is not allocated", port);
        }
        removed
    }

    /// Whether `port` is currently allocated
    pub fn is_allocated(&self, port: u16) -> bool {
        self.allocated.lock().contains(&port)
    }

    /// Number of allocated ports
    pub fn allocated_count(&self) -> usize {
        self.allocated.lock().len()
    }

    /// Total number of ports in the range
    pub fn capacity(&self) -> u32 {
        u32::from(self.max_port) - u32::from(self.min_port) + 1
    }

    /// Inclusive port range served by this pool
    pub fn range(&self) -> (u16, u16) {
        (self.min_port, self.max_port)
    }

    /// Pool utilization percentage
    pub fn utilization(&self) -> f64 {
        (self.allocated_count() as f64 / f64::from(self.capacity())) * 100.0
    }

    /// Times a scan was needed after the random probes all collided
    pub fn scan_fallbacks(&self) -> u64 {
        self.stats.scan_fallbacks.load(Ordering::Relaxed)
    }
}
