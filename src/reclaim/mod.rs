//! # Deferred Reclaimer
//!
//! When a record store grows, the superseded arena cannot be unmapped
//! immediately: a lock-free reader that loaded the old base address just
//! before the swap may still be dereferencing into it. Retired arenas are
//! therefore parked here and physically freed only once quiescence is
//! reached.
//!
//! ## Epoch Scheme
//!
//! A global epoch counter advances on every sweep. Readers wrap each
//! lock-free arena access in an [`EpochGuard`]: pinning publishes the
//! observed epoch in a per-thread, cache-padded slot; unpinning clears it
//! (pins nest). Retiring an arena records the epoch at retire time.
//!
//! An arena is eligible for unmapping once
//!
//! 1. every currently pinned reader's epoch is *greater* than the arena's
//!    retire epoch (any reader that could have seen the old base has
//!    since unpinned), and
//! 2. a minimum dwell of half the sweep period has elapsed.
//!
//! This can under-free — a parked reader delays everything retired after
//! its pin, which leaks until it moves on — but it can never free early.
//!
//! ## Sweeping
//!
//! A background thread sweeps on a fixed period, sleeping on a condvar so
//! shutdown is prompt. `sweep_now` exposes one sweep synchronously, which
//! the deterministic tests lean on.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::arena::Arena;
use crate::config::DEFAULT_SWEEP_INTERVAL;

static NEXT_RECLAIMER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct ReaderSlot {
    /// 0 = idle; otherwise the epoch observed at pin time.
    state: CachePadded<AtomicU64>,
    /// Nesting depth, touched only by the owning thread.
    nest: AtomicU32,
}

struct Retired {
    arena: Arena,
    epoch: u64,
    at: Instant,
}

struct ReclaimShared {
    id: u64,
    epoch: AtomicU64,
    interval: Duration,
    readers: Mutex<Vec<Arc<ReaderSlot>>>,
    retired: Mutex<Vec<Retired>>,
    shutdown: Mutex<bool>,
    wake: Condvar,
}

impl ReclaimShared {
    fn sweep(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let min_active = {
            let readers = self.readers.lock();
            readers
                .iter()
                .filter_map(|slot| {
                    let v = slot.state.load(Ordering::SeqCst);
                    (v != 0).then_some(v)
                })
                .min()
        };
        let dwell = self.interval / 2;
        let mut retired = self.retired.lock();
        let before = retired.len();
        retired.retain(|r| {
            let quiescent = min_active.map_or(true, |m| m > r.epoch);
            let dwelled = r.at.elapsed() >= dwell;
            !(quiescent && dwelled)
        });
        let freed = before - retired.len();
        if freed > 0 {
            debug!(
                target: "offcache::reclaim",
                freed, outstanding = retired.len(), "reclaimed retired arenas"
            );
        }
    }
}

pub struct Reclaimer {
    shared: Arc<ReclaimShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Reclaimer {
    /// Start a reclaimer sweeping at the default period.
    pub fn start() -> Arc<Self> {
        Self::with_interval(DEFAULT_SWEEP_INTERVAL)
    }

    pub fn with_interval(interval: Duration) -> Arc<Self> {
        let shared = Arc::new(ReclaimShared {
            id: NEXT_RECLAIMER_ID.fetch_add(1, Ordering::Relaxed),
            epoch: AtomicU64::new(1),
            interval,
            readers: Mutex::new(Vec::new()),
            retired: Mutex::new(Vec::new()),
            shutdown: Mutex::new(false),
            wake: Condvar::new(),
        });
        let weak = Arc::downgrade(&shared);
        let worker = std::thread::Builder::new()
            .name("offcache-reclaim".into())
            .spawn(move || run_sweeper(weak, interval))
            .ok();
        Arc::new(Self {
            shared,
            worker: Mutex::new(worker),
        })
    }

    /// Pin the current thread; any base address read while the guard is
    /// live stays mapped until after the guard drops.
    pub fn pin(&self) -> EpochGuard {
        let slot = self.thread_slot();
        if slot.nest.fetch_add(1, Ordering::Relaxed) == 0 {
            let epoch = self.shared.epoch.load(Ordering::SeqCst);
            slot.state.store(epoch, Ordering::SeqCst);
        }
        EpochGuard { slot }
    }

    /// Park a superseded arena for deferred unmapping. Callers must have
    /// published the replacement base address first.
    pub fn retire(&self, arena: Arena) {
        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        let mut retired = self.shared.retired.lock();
        retired.push(Retired {
            arena,
            epoch,
            at: Instant::now(),
        });
    }

    /// Arenas currently awaiting quiescence.
    pub fn retired_count(&self) -> usize {
        self.shared.retired.lock().len()
    }

    /// Run one sweep synchronously.
    pub fn sweep_now(&self) {
        self.shared.sweep();
    }

    /// Stop the sweep thread and free everything still parked. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut flag = self.shared.shutdown.lock();
            *flag = true;
            self.shared.wake.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        // No store survives its reclaimer; remaining readers are gone.
        self.shared.retired.lock().clear();
    }

    fn thread_slot(&self) -> Arc<ReaderSlot> {
        thread_local! {
            static SLOTS: std::cell::RefCell<Vec<(u64, Arc<ReaderSlot>)>> =
                const { std::cell::RefCell::new(Vec::new()) };
        }
        SLOTS.with(|cell| {
            let mut slots = cell.borrow_mut();
            if let Some((_, slot)) = slots.iter().find(|(id, _)| *id == self.shared.id) {
                return Arc::clone(slot);
            }
            let slot = Arc::new(ReaderSlot::default());
            self.shared.readers.lock().push(Arc::clone(&slot));
            slots.push((self.shared.id, Arc::clone(&slot)));
            slot
        })
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_sweeper(shared: Weak<ReclaimShared>, interval: Duration) {
    loop {
        let Some(strong) = shared.upgrade() else { return };
        {
            let mut flag = strong.shutdown.lock();
            if *flag {
                return;
            }
            let _ = strong.wake.wait_for(&mut flag, interval);
            if *flag {
                return;
            }
        }
        strong.sweep();
    }
}

pub struct EpochGuard {
    slot: Arc<ReaderSlot>,
}

impl Drop for EpochGuard {
    fn drop(&mut self) {
        if self.slot.nest.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.slot.state.store(0, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> Arena {
        Arena::zeroed(4096).unwrap()
    }

    #[test]
    fn retire_is_deferred_not_immediate() {
        let reclaimer = Reclaimer::with_interval(Duration::from_secs(3600));
        reclaimer.retire(arena());
        assert_eq!(reclaimer.retired_count(), 1);
    }

    #[test]
    fn sweep_frees_after_dwell_with_no_readers() {
        let reclaimer = Reclaimer::with_interval(Duration::from_millis(10));
        reclaimer.retire(arena());
        std::thread::sleep(Duration::from_millis(20));
        reclaimer.sweep_now();
        assert_eq!(reclaimer.retired_count(), 0);
    }

    #[test]
    fn pinned_reader_blocks_reclaim() {
        let reclaimer = Reclaimer::with_interval(Duration::from_millis(10));
        let guard = reclaimer.pin();
        reclaimer.retire(arena());
        std::thread::sleep(Duration::from_millis(20));
        reclaimer.sweep_now();
        assert_eq!(reclaimer.retired_count(), 1);
        drop(guard);
        reclaimer.sweep_now();
        assert_eq!(reclaimer.retired_count(), 0);
    }

    #[test]
    fn nested_pins_release_together() {
        let reclaimer = Reclaimer::with_interval(Duration::from_millis(10));
        let outer = reclaimer.pin();
        let inner = reclaimer.pin();
        reclaimer.retire(arena());
        drop(inner);
        std::thread::sleep(Duration::from_millis(20));
        reclaimer.sweep_now();
        assert_eq!(reclaimer.retired_count(), 1, "outer pin still live");
        drop(outer);
        reclaimer.sweep_now();
        assert_eq!(reclaimer.retired_count(), 0);
    }

    #[test]
    fn readers_pinned_after_retire_do_not_block() {
        let reclaimer = Reclaimer::with_interval(Duration::from_millis(10));
        reclaimer.retire(arena());
        reclaimer.sweep_now();
        let _guard = reclaimer.pin();
        std::thread::sleep(Duration::from_millis(20));
        reclaimer.sweep_now();
        assert_eq!(reclaimer.retired_count(), 0);
    }

    #[test]
    fn shutdown_drains_everything() {
        let reclaimer = Reclaimer::with_interval(Duration::from_secs(3600));
        reclaimer.retire(arena());
        reclaimer.retire(arena());
        reclaimer.shutdown();
        assert_eq!(reclaimer.retired_count(), 0);
    }
}
