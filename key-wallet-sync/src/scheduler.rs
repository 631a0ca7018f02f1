//! Single-slot scan scheduling with priority preemption.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex};

use crate::error::SyncError;

/// Priority classes for operations that need the scan slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ScanPriority {
    /// Background full-wallet synchronization.
    Low,
    /// User-triggered refresh of a slice of the wallet.
    Normal,
    /// Must run as soon as possible, e.g. a key source switch.
    High,
}

#[derive(Default)]
struct SlotState {
    running: Option<ScanPriority>,
    interrupt: bool,
    pending: BTreeMap<ScanPriority, usize>,
}

impl SlotState {
    fn highest_pending(&self) -> Option<ScanPriority> {
        self.pending.keys().next_back().copied()
    }

    fn unregister(&mut self, priority: ScanPriority) {
        if let Some(count) = self.pending.get_mut(&priority) {
            *count -= 1;
            if *count == 0 {
                self.pending.remove(&priority);
            }
        }
    }
}

/// Arbitrates ownership of the single scan slot.
///
/// At most one scan-class operation runs at a time. A waiter with a higher
/// priority than the running operation raises the interrupt flag; the
/// running scan observes it at its next batch boundary through
/// [`ScanPermit::checkpoint`] and returns early. Waiters register in the
/// pending set before blocking, so arbitration always sees the full queue.
pub struct ScanScheduler {
    slot: Mutex<SlotState>,
    available: Condvar,
}

impl ScanScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(SlotState::default()),
            available: Condvar::new(),
        })
    }

    /// Blocks until the slot can be handed to `priority`. Among waiters the
    /// highest priority is admitted first; equal priorities queue without
    /// preempting each other.
    pub fn acquire(self: &Arc<Self>, priority: ScanPriority) -> ScanPermit {
        let mut slot = self.slot.lock().unwrap();
        *slot.pending.entry(priority).or_insert(0) += 1;
        loop {
            match slot.running {
                Some(running) => {
                    if priority > running {
                        slot.interrupt = true;
                    }
                }
                None => {
                    if slot.highest_pending().map_or(true, |highest| highest <= priority) {
                        slot.unregister(priority);
                        slot.running = Some(priority);
                        slot.interrupt = false;
                        return ScanPermit {
                            scheduler: Arc::clone(self),
                            priority,
                        };
                    }
                }
            }
            slot = self.available.wait(slot).unwrap();
        }
    }

    fn interrupted(&self) -> bool {
        self.slot.lock().unwrap().interrupt
    }

    fn release(&self) {
        let mut slot = self.slot.lock().unwrap();
        slot.running = None;
        slot.interrupt = false;
        drop(slot);
        self.available.notify_all();
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.slot.lock().unwrap().pending.values().sum()
    }
}

/// RAII ownership of the scan slot. Dropping the permit releases the slot
/// and wakes waiters.
pub struct ScanPermit {
    scheduler: Arc<ScanScheduler>,
    priority: ScanPriority,
}

impl ScanPermit {
    pub fn priority(&self) -> ScanPriority {
        self.priority
    }

    /// Returns [`SyncError::ScanInterrupted`] when a higher-priority request
    /// is waiting for the slot. Scans call this between batches so the
    /// interruption lands on a consistent boundary.
    pub fn checkpoint(&self) -> Result<(), SyncError> {
        if self.scheduler.interrupted() {
            return Err(SyncError::ScanInterrupted);
        }
        Ok(())
    }
}

impl Drop for ScanPermit {
    fn drop(&mut self) {
        self.scheduler.release();
    }
}
