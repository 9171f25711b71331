//! # Record Handles
//!
//! `RecordRef` is the on-heap wrapper business code holds while it works
//! with an off-heap record. The record store keeps a strong clone in its
//! shadow table for every *live* slot; `free` downgrades that to a weak
//! handle, so from that point the record stays materialized only as long
//! as some caller still holds a clone.
//!
//! When the last clone of a freed record drops, its slot index is pushed
//! onto the owning registry's collection queue — the deterministic
//! replacement for garbage-collector-driven weak-reference enqueueing.
//! The slot's bytes stay intact until `evict_collected` returns the slot
//! to the free list, so in-flight readers that still hold the wrapper
//! never observe recycled bytes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_queue::SegQueue;

use crate::config::RESERVED_SLOTS;

pub struct RecordInner {
    slot: AtomicU32,
    dead: Arc<SegQueue<u32>>,
}

impl Drop for RecordInner {
    fn drop(&mut self) {
        let slot = self.slot.load(Ordering::Relaxed);
        if slot as usize >= RESERVED_SLOTS {
            self.dead.push(slot);
        }
    }
}

/// Shared handle to one off-heap record slot.
#[derive(Clone)]
pub struct RecordRef {
    inner: Arc<RecordInner>,
}

impl std::fmt::Debug for RecordRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordRef").field("slot", &self.slot()).finish()
    }
}

impl RecordRef {
    pub(crate) fn new(slot: u32, dead: Arc<SegQueue<u32>>) -> Self {
        Self {
            inner: Arc::new(RecordInner {
                slot: AtomicU32::new(slot),
                dead,
            }),
        }
    }

    /// The slot index this handle denotes. Zero after a nuke detach.
    #[inline]
    pub fn slot(&self) -> u32 {
        self.inner.slot.load(Ordering::Relaxed)
    }

    /// Sever the handle from its slot: the eventual drop will not enqueue
    /// the slot for reuse. Used when an incoming replicated record with a
    /// different primary key takes the slot over.
    pub(crate) fn detach(&self) {
        self.inner.slot.store(0, Ordering::Relaxed);
    }

    pub(crate) fn downgrade(&self) -> WeakRecordRef {
        WeakRecordRef {
            slot: self.slot(),
            referent: Arc::downgrade(&self.inner),
        }
    }

    /// Identity comparison: two clones of the same wrapper.
    #[inline]
    pub fn ptr_eq(&self, other: &RecordRef) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Weak handle stored in the registry and in the shadow table of freed
/// slots: remembers the slot it guards without keeping the wrapper alive.
#[derive(Clone)]
pub struct WeakRecordRef {
    slot: u32,
    referent: Weak<RecordInner>,
}

impl WeakRecordRef {
    #[inline]
    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn upgrade(&self) -> Option<RecordRef> {
        self.referent.upgrade().map(|inner| RecordRef { inner })
    }

    pub fn is_dead(&self) -> bool {
        self.referent.strong_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_of_last_clone_enqueues_slot() {
        let dead = Arc::new(SegQueue::new());
        let rec = RecordRef::new(7, Arc::clone(&dead));
        let clone = rec.clone();
        drop(rec);
        assert!(dead.pop().is_none());
        drop(clone);
        assert_eq!(dead.pop(), Some(7));
    }

    #[test]
    fn detached_handle_never_enqueues() {
        let dead = Arc::new(SegQueue::new());
        let rec = RecordRef::new(9, Arc::clone(&dead));
        rec.detach();
        drop(rec);
        assert!(dead.pop().is_none());
    }

    #[test]
    fn weak_handle_observes_death() {
        let dead = Arc::new(SegQueue::new());
        let rec = RecordRef::new(11, Arc::clone(&dead));
        let weak = rec.downgrade();
        assert!(!weak.is_dead());
        assert!(weak.upgrade().is_some());
        drop(rec);
        assert!(weak.is_dead());
        assert!(weak.upgrade().is_none());
        assert_eq!(weak.slot(), 11);
    }
}
