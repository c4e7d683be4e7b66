//! Dirty Memory Accounting
//!
//! Tracks how much memory is held by data that is not yet durable.
//!
//! ## Counters
//! - **real**: bytes of every live partition version, including versions
//!   kept alive only because a reader or a compaction step references them
//! - **virtual**: the part of real that no flush reader has streamed out yet
//!
//! A [`DirtyMemoryManager`] holds the totals for a group of memtables and is
//! injected into each of them; every memtable charges its own
//! [`MemoryAccount`], which forwards to the manager until the memtable's
//! flushed memory is reverted.
//!
//! The counters are advisory (they drive backpressure), so plain atomics are
//! enough for the manager; they saturate at zero and never report negative
//! values.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Config;

/// What the caller of `apply` should do about memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryPressure {
    /// Nothing to do
    Normal,
    /// Compaction would reclaim fragmented memory
    Reclaim,
    /// Virtual dirty memory is over the soft limit: flush a memtable
    Flush,
    /// Virtual dirty memory is over the hard limit: stall writers
    Throttle,
}

/// Process-level (or shard-level) dirty memory totals
#[derive(Debug)]
pub struct DirtyMemoryManager {
    real: AtomicUsize,
    virtual_: AtomicUsize,
    soft_limit: usize,
    hard_limit: usize,
    reclaim_threshold: usize,
}

impl DirtyMemoryManager {
    /// Manager with limits taken from `config`
    pub fn new(config: &Config) -> Arc<Self> {
        Arc::new(Self::with_limits(
            config.dirty_soft_limit,
            config.dirty_hard_limit,
            config.reclaim_threshold,
        ))
    }

    /// Manager that never reports pressure
    pub fn unlimited() -> Arc<Self> {
        Arc::new(Self::with_limits(usize::MAX, usize::MAX, usize::MAX))
    }

    fn with_limits(soft_limit: usize, hard_limit: usize, reclaim_threshold: usize) -> Self {
        Self {
            real: AtomicUsize::new(0),
            virtual_: AtomicUsize::new(0),
            soft_limit,
            hard_limit,
            reclaim_threshold,
        }
    }

    pub fn real_dirty_memory(&self) -> usize {
        self.real.load(Ordering::Acquire)
    }

    pub fn virtual_dirty_memory(&self) -> usize {
        self.virtual_.load(Ordering::Acquire)
    }

    pub fn soft_limit(&self) -> usize {
        self.soft_limit
    }

    pub fn hard_limit(&self) -> usize {
        self.hard_limit
    }

    /// Current pressure level
    pub fn pressure(&self) -> MemoryPressure {
        let virtual_dirty = self.virtual_dirty_memory();
        if virtual_dirty >= self.hard_limit {
            MemoryPressure::Throttle
        } else if virtual_dirty >= self.soft_limit {
            MemoryPressure::Flush
        } else if self.real_dirty_memory() >= self.reclaim_threshold {
            MemoryPressure::Reclaim
        } else {
            MemoryPressure::Normal
        }
    }

    fn add(&self, real: usize, virtual_: usize) {
        if real > 0 {
            self.real.fetch_add(real, Ordering::AcqRel);
        }
        if virtual_ > 0 {
            self.virtual_.fetch_add(virtual_, Ordering::AcqRel);
        }
    }

    fn sub(&self, real: usize, virtual_: usize) {
        if real > 0 {
            saturating_sub(&self.real, real);
        }
        if virtual_ > 0 {
            saturating_sub(&self.virtual_, virtual_);
        }
    }
}

fn saturating_sub(counter: &AtomicUsize, amount: usize) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
        Some(v.saturating_sub(amount))
    });
}

/// Per-memtable share of the manager's counters
#[derive(Debug)]
pub struct MemoryAccount {
    manager: Arc<DirtyMemoryManager>,
    state: Mutex<AccountState>,
}

#[derive(Debug, Default)]
struct AccountState {
    real: usize,
    virtual_: usize,
    /// Once reverted, changes no longer reach the manager
    detached: bool,
}

impl MemoryAccount {
    pub fn new(manager: Arc<DirtyMemoryManager>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            state: Mutex::new(AccountState::default()),
        })
    }

    pub fn manager(&self) -> &Arc<DirtyMemoryManager> {
        &self.manager
    }

    /// Real bytes held by this memtable
    pub fn real(&self) -> usize {
        self.state.lock().real
    }

    /// Unflushed bytes held by this memtable
    pub fn virtual_(&self) -> usize {
        self.state.lock().virtual_
    }

    /// New unflushed memory
    pub(crate) fn charge(&self, bytes: usize) {
        let mut state = self.state.lock();
        state.real += bytes;
        state.virtual_ += bytes;
        if !state.detached {
            self.manager.add(bytes, bytes);
        }
    }

    /// A version's accounted size went from `old` to `new`
    pub(crate) fn resize(&self, old: usize, new: usize, flushed: bool) {
        let mut state = self.state.lock();
        let detached = state.detached;
        if new >= old {
            let delta = new - old;
            state.real += delta;
            let virtual_delta = if flushed { 0 } else { delta };
            state.virtual_ += virtual_delta;
            if !detached {
                self.manager.add(delta, virtual_delta);
            }
        } else {
            let delta = old - new;
            state.real = state.real.saturating_sub(delta);
            let virtual_delta = if flushed { 0 } else { delta };
            state.virtual_ = state.virtual_.saturating_sub(virtual_delta);
            if !detached {
                self.manager.sub(delta, virtual_delta);
            }
        }
    }

    /// A version of `bytes` was destroyed
    pub(crate) fn release(&self, bytes: usize, flushed: bool) {
        self.resize(bytes, 0, flushed);
    }

    /// A version of `bytes` was streamed out by a flush reader
    pub(crate) fn mark_flushed(&self, bytes: usize) {
        let mut state = self.state.lock();
        state.virtual_ = state.virtual_.saturating_sub(bytes);
        if !state.detached {
            self.manager.sub(0, bytes);
        }
    }

    /// Remove this memtable's remaining footprint from the manager.
    ///
    /// Returns the `(real, virtual)` bytes that were removed.
    pub(crate) fn detach(&self) -> (usize, usize) {
        let mut state = self.state.lock();
        if state.detached {
            return (0, 0);
        }
        state.detached = true;
        self.manager.sub(state.real, state.virtual_);
        (state.real, state.virtual_)
    }

    pub fn is_detached(&self) -> bool {
        self.state.lock().detached
    }
}
