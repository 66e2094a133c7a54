//! Epoch-based deferred reclamation.
//!
//! Readers register a [`GcSession`] and pin it for the duration of any
//! operation that dereferences mapped memory. Writers push resources that
//! must outlive in-flight readers (superseded mappings, emptied regions);
//! a resource is reclaimed — its `Drop` run — only once every pinned
//! session has observed a later epoch.
//!
//! Reclamation happens when a pin is released or on an explicit
//! [`GcQueue::collect`]; `push` never reclaims, so it is safe to call with
//! unrelated locks held.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

const IDLE: u64 = u64::MAX;

struct Slot {
    epoch: AtomicU64,
}

pub struct GcQueue {
    epoch: AtomicU64,
    slots: Mutex<Vec<Arc<Slot>>>,
    pending: Mutex<VecDeque<(u64, Box<dyn Any + Send>)>>,
}

impl GcQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(GcQueue {
            epoch: AtomicU64::new(1),
            slots: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
        })
    }

    /// Register a session. Cheap; one slot per live session.
    pub fn register(self: &Arc<Self>) -> GcSession {
        let slot = Arc::new(Slot {
            epoch: AtomicU64::new(IDLE),
        });
        self.slots.lock().push(slot.clone());
        GcSession {
            queue: self.clone(),
            slot,
        }
    }

    /// Retire a resource. Its `Drop` runs once every session pinned at or
    /// before the current epoch has unpinned.
    pub fn push<T: Send + 'static>(&self, resource: T) {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel);
        self.pending.lock().push_back((epoch, Box::new(resource)));
    }

    /// Reclaim everything no pinned session can still observe.
    pub fn collect(&self) {
        let min = {
            let slots = self.slots.lock();
            slots
                .iter()
                .map(|s| s.epoch.load(Ordering::Acquire))
                .min()
                .unwrap_or(IDLE)
        };
        let mut ready = Vec::new();
        {
            let mut pending = self.pending.lock();
            while let Some(front) = pending.front() {
                if front.0 < min {
                    ready.push(pending.pop_front().unwrap());
                } else {
                    break;
                }
            }
        }
        if !ready.is_empty() {
            log::trace!("gc queue reclaimed {} resources", ready.len());
        }
        // run Drops outside the queue locks
        drop(ready);
    }

    /// Reclaim everything unconditionally. Only valid once no session can
    /// be pinned again (shutdown).
    pub fn drain(&self) {
        let mut ready = Vec::new();
        {
            let mut pending = self.pending.lock();
            while let Some(item) = pending.pop_front() {
                ready.push(item);
            }
        }
        drop(ready);
    }

    fn unregister(&self, slot: &Arc<Slot>) {
        let mut slots = self.slots.lock();
        if let Some(pos) = slots.iter().position(|s| Arc::ptr_eq(s, slot)) {
            slots.swap_remove(pos);
        }
    }
}

/// A registered reader identity. Pin it to hold an epoch.
pub struct GcSession {
    queue: Arc<GcQueue>,
    slot: Arc<Slot>,
}

impl GcSession {
    /// Pin the session at the current epoch. Every pointer into mapped
    /// memory acquired while the guard lives stays dereferenceable until
    /// the guard drops. Pins do not nest: one guard per operation.
    pub fn pin(&self) -> SessionGuard {
        debug_assert_eq!(self.slot.epoch.load(Ordering::Relaxed), IDLE);
        self.slot
            .epoch
            .store(self.queue.epoch.load(Ordering::Acquire), Ordering::Release);
        SessionGuard {
            queue: self.queue.clone(),
            slot: self.slot.clone(),
        }
    }
}

impl Drop for GcSession {
    fn drop(&mut self) {
        self.queue.unregister(&self.slot);
        self.queue.collect();
    }
}

/// RAII pin on a session's epoch.
pub struct SessionGuard {
    queue: Arc<GcQueue>,
    slot: Arc<Slot>,
}

impl SessionGuard {
    /// Temporarily release the pin so reclamation can make global progress
    /// across a blocking step. The caller must not hold any pointer into
    /// mapped memory across the relock.
    pub fn unpinned(&self) -> Relocker<'_> {
        self.slot.epoch.store(IDLE, Ordering::Release);
        Relocker { guard: self }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.slot.epoch.store(IDLE, Ordering::Release);
        self.queue.collect();
    }
}

/// Re-pins the owning guard at a fresh epoch when dropped.
pub struct Relocker<'a> {
    guard: &'a SessionGuard,
}

impl Drop for Relocker<'_> {
    fn drop(&mut self) {
        self.guard.slot.epoch.store(
            self.guard.queue.epoch.load(Ordering::Acquire),
            Ordering::Release,
        );
    }
}
