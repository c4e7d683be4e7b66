//! Background Reclamation
//!
//! A worker thread that runs bounded compaction steps over registered
//! memtables, either on a fixed interval while the memory manager reports
//! pressure, or immediately when kicked.
//!
//! ## Threading
//! Memtables are held as `Weak` references, so the reclaimer never keeps a
//! flushed generation alive; dead references are pruned on each pass. The
//! thread exits when the handle is dropped or `shutdown` is called.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::error::{AtlasError, Result};
use crate::memory::{DirtyMemoryManager, MemoryPressure};
use crate::memtable::Memtable;
use crate::partition::CompactionStats;

enum Command {
    Register(Weak<Memtable>),
    /// Run a pass now, regardless of pressure
    Kick,
    Shutdown,
}

/// Handle to the background reclamation thread
pub struct Reclaimer {
    tx: Sender<Command>,
    handle: Option<JoinHandle<()>>,
}

impl Reclaimer {
    /// Start the worker
    pub fn spawn(manager: Arc<DirtyMemoryManager>, interval: Duration, step_budget: usize) -> Result<Self> {
        let (tx, rx) = channel::unbounded();
        let handle = thread::Builder::new()
            .name("atlastable-reclaim".to_string())
            .spawn(move || {
                let mut memtables: Vec<Weak<Memtable>> = Vec::new();
                loop {
                    let forced = match rx.recv_timeout(interval) {
                        Ok(Command::Register(memtable)) => {
                            memtables.push(memtable);
                            continue;
                        }
                        Ok(Command::Kick) => true,
                        Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => false,
                    };
                    if forced || manager.pressure() >= MemoryPressure::Reclaim {
                        let stats = run_pass(&mut memtables, step_budget);
                        if stats.versions_merged > 0 {
                            debug!(?stats, "background reclamation pass");
                        }
                    }
                }
                debug!("reclaimer stopped");
            })?;
        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    /// Include `memtable` in future passes
    pub fn register(&self, memtable: &Arc<Memtable>) -> Result<()> {
        self.send(Command::Register(Arc::downgrade(memtable)))
    }

    /// Request a pass now
    pub fn kick(&self) -> Result<()> {
        self.send(Command::Kick)
    }

    /// Stop the worker and wait for it
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| AtlasError::Storage("reclaimer thread is gone".to_string()))
    }

    fn stop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("reclaimer thread panicked");
            }
        }
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One bounded step over every live, unflushed memtable
fn run_pass(memtables: &mut Vec<Weak<Memtable>>, step_budget: usize) -> CompactionStats {
    let mut stats = CompactionStats::default();
    memtables.retain(|weak| match weak.upgrade() {
        Some(memtable) if !memtable.is_flushed() => {
            stats += memtable.compact_step(step_budget);
            true
        }
        _ => false,
    });
    stats
}
