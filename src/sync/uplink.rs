//! # Master Cache Uplink
//!
//! The replica-side driver of the replication protocol. A small pool of
//! worker threads partitions the replicated stores among itself each
//! cycle via a shared cursor (cursor value -1 is the string-table sync,
//! claimed by whichever worker draws it first); the last worker to
//! finish a cycle schedules the next one at `max(now, previous_start +
//! interval)` and wakes anything blocked on completion — including the
//! caller of [`Uplink::start_sync_and_wait_for_initial_sync`], which
//! blocks until the first cycle ends.
//!
//! ## Failure Isolation
//!
//! A transport or decode failure during one store's sync aborts that
//! store's cycle only: the worker logs it with the type name and moves
//! to the next store. The last-successful-refresh stamp advances only
//! when a whole cycle ran clean.
//!
//! ## Pause
//!
//! `pause` / `unpause` is the only cancellation primitive: workers check
//! between stores and park on a condvar while paused. There is no
//! mid-sync abort.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use eyre::{bail, Result};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{error, info};

use crate::config::{DEFAULT_SYNC_INTERVAL, DEFAULT_SYNC_THREADS, STRING_MAP_SLACK};
use crate::store::{RecordStore, SyncIndex};
use crate::sync::result::MasterSyncResult;
use crate::sync::service::{now_millis, MasterService};
use crate::sync::strings::StringPool;

/// One replicated store together with the cache index it feeds.
#[derive(Clone)]
pub struct ReplicatedStore {
    pub store: Arc<RecordStore>,
    pub index: Arc<dyn SyncIndex>,
}

struct CycleState {
    generation: u64,
    start_at: Instant,
    /// Shared cursor; -1 is the string sync, then store indices.
    cursor: i64,
    active_threads: usize,
    store_slots: usize,
    failed: bool,
    /// Set once every store was destroyed or the uplink shut down.
    done: bool,
}

struct UplinkShared {
    master_cache_id: String,
    service: Arc<dyn MasterService>,
    pool: Arc<StringPool>,
    /// master string ref → local string ref; index 0 unused.
    string_map: RwLock<Vec<u32>>,
    string_sync: Mutex<()>,
    sync_interval_ms: AtomicU64,
    sync_threads: AtomicUsize,
    paused: Mutex<bool>,
    pause_wake: Condvar,
    last_successful_refresh: AtomicI64,
    initial_sync_failed: AtomicBool,
    /// Threads actually spawned by the last start call; cycles count
    /// down from this, not from the mutable setting.
    worker_count: AtomicUsize,
    stores: Mutex<Vec<Option<ReplicatedStore>>>,
    active_stores: AtomicUsize,
    cycle: Mutex<CycleState>,
    cycle_wake: Condvar,
    shutdown: AtomicBool,
}

#[derive(Clone)]
pub struct Uplink {
    shared: Arc<UplinkShared>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Uplink {
    pub fn new(
        master_cache_id: impl Into<String>,
        service: Arc<dyn MasterService>,
        pool: Arc<StringPool>,
    ) -> Self {
        Self {
            shared: Arc::new(UplinkShared {
                master_cache_id: master_cache_id.into(),
                service,
                pool,
                string_map: RwLock::new(Vec::new()),
                string_sync: Mutex::new(()),
                sync_interval_ms: AtomicU64::new(DEFAULT_SYNC_INTERVAL.as_millis() as u64),
                sync_threads: AtomicUsize::new(DEFAULT_SYNC_THREADS),
                paused: Mutex::new(false),
                pause_wake: Condvar::new(),
                last_successful_refresh: AtomicI64::new(0),
                initial_sync_failed: AtomicBool::new(false),
                worker_count: AtomicUsize::new(0),
                stores: Mutex::new(Vec::new()),
                active_stores: AtomicUsize::new(0),
                cycle: Mutex::new(CycleState {
                    generation: 0,
                    start_at: Instant::now(),
                    cursor: -1,
                    active_threads: 0,
                    store_slots: 0,
                    failed: false,
                    done: false,
                }),
                cycle_wake: Condvar::new(),
                shutdown: AtomicBool::new(false),
            }),
            workers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn master_cache_id(&self) -> &str {
        &self.shared.master_cache_id
    }

    pub fn set_sync_interval(&self, interval: Duration) {
        self.shared
            .sync_interval_ms
            .store(interval.as_millis() as u64, Ordering::Release);
    }

    /// Takes effect for threads spawned by the next start call.
    pub fn set_sync_threads(&self, threads: usize) {
        self.shared
            .sync_threads
            .store(threads.max(1), Ordering::Release);
    }

    pub fn last_successful_refresh(&self) -> i64 {
        self.shared.last_successful_refresh.load(Ordering::Acquire)
    }

    pub fn pause(&self) {
        *self.shared.paused.lock() = true;
    }

    pub fn unpause(&self) {
        let mut paused = self.shared.paused.lock();
        *paused = false;
        self.shared.pause_wake.notify_all();
    }

    /// Install the replicated stores (largest master estimate first, so
    /// the big types start streaming immediately), spawn the worker
    /// pool, and block until the initial sync cycle completes.
    pub fn start_sync_and_wait_for_initial_sync(
        &self,
        stores: Vec<ReplicatedStore>,
    ) -> Result<()> {
        let sizes = self.shared.service.retrieve_initial_sync_size()?;
        let mut stores = stores;
        stores.sort_by_key(|rs| {
            std::cmp::Reverse(sizes.get(rs.store.name()).copied().unwrap_or(0))
        });
        let count = stores.len();
        let threads = self.shared.sync_threads.load(Ordering::Acquire);
        {
            let mut slots = self.shared.stores.lock();
            *slots = stores.into_iter().map(Some).collect();
        }
        self.shared.active_stores.store(count, Ordering::Release);
        self.shared.worker_count.store(threads, Ordering::Release);
        {
            let mut cycle = self.shared.cycle.lock();
            *cycle = CycleState {
                generation: 1,
                start_at: Instant::now(),
                cursor: -1,
                active_threads: threads,
                store_slots: count,
                failed: false,
                done: false,
            };
        }
        {
            let mut workers = self.workers.lock();
            for n in 0..threads {
                let shared = Arc::clone(&self.shared);
                let handle = std::thread::Builder::new()
                    .name(format!("offcache-sync-{}", n))
                    .spawn(move || run_worker(shared))
                    .map_err(|e| eyre::eyre!("failed to spawn sync worker: {}", e))?;
                workers.push(handle);
            }
        }
        let mut cycle = self.shared.cycle.lock();
        while cycle.generation == 1 && !cycle.done {
            self.shared.cycle_wake.wait(&mut cycle);
        }
        drop(cycle);
        if self.shared.initial_sync_failed.load(Ordering::Acquire) {
            bail!(
                "initial sync against master cache '{}' failed; see log for the failing types",
                self.shared.master_cache_id
            );
        }
        Ok(())
    }

    /// Stop the worker pool. In-flight store syncs finish first.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.pause_wake.notify_all();
        self.shared.cycle_wake.notify_all();
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        info!(
            target: "offcache::sync",
            master = %self.shared.master_cache_id,
            "uplink shut down"
        );
    }

    /// Fetch one type's diff from the master service.
    pub fn sync_with_master(&self, name: &str, since_version: u64) -> Result<MasterSyncResult> {
        self.shared.service.sync_with_master(name, since_version)
    }

    /// Remap a master string ref to the local pool, syncing the string
    /// table on demand. An unknown ref after a sync is a protocol desync.
    pub fn map_master_string_ref(&self, master_ref: u32) -> Result<u32> {
        if master_ref == 0 {
            return Ok(0);
        }
        if let Some(local) = self.lookup_string_ref(master_ref) {
            return Ok(local);
        }
        self.shared.sync_strings()?;
        match self.lookup_string_ref(master_ref) {
            Some(local) => Ok(local),
            None => bail!("unknown master cache string ref {}", master_ref),
        }
    }

    fn lookup_string_ref(&self, master_ref: u32) -> Option<u32> {
        let map = self.shared.string_map.read();
        match map.get(master_ref as usize) {
            Some(&local) if local != 0 => Some(local),
            _ => None,
        }
    }
}

impl UplinkShared {
    /// Pull the master's interning-table tail and extend the remap. One
    /// syncer at a time; losers of the race see the winner's result.
    fn sync_strings(&self) -> Result<()> {
        let _serial = self.string_sync.lock();
        let start = self.string_map.read().len() as u32;
        let started = Instant::now();
        let result = self.service.retrieve_strings(start)?;
        if result.refs.is_empty() {
            return Ok(());
        }
        let max_ref = *result.refs.iter().max().unwrap_or(&0) as usize;
        let mut map = self.string_map.write();
        if map.len() <= max_ref {
            let additional = ((max_ref + 1) as f64 * STRING_MAP_SLACK) as usize - map.len();
            map.reserve(additional);
            map.resize(max_ref + 1, 0);
        }
        for (r, s) in result.refs.iter().zip(result.strings.iter()) {
            map[*r as usize] = self.pool.intern(s);
        }
        info!(
            target: "offcache::sync",
            master = %self.master_cache_id,
            count = result.refs.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "string sync processed"
        );
        Ok(())
    }

    fn pause_point(&self) {
        let mut paused = self.paused.lock();
        while *paused && !self.shutdown.load(Ordering::Acquire) {
            self.pause_wake.wait(&mut paused);
        }
    }
}

fn run_worker(shared: Arc<UplinkShared>) {
    let uplink = Uplink {
        shared: Arc::clone(&shared),
        workers: Arc::new(Mutex::new(Vec::new())),
    };
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        let (generation, start_at, done) = {
            let cycle = shared.cycle.lock();
            (cycle.generation, cycle.start_at, cycle.done)
        };
        if done {
            return;
        }
        // Sleep until the cycle's scheduled start, shutdown-aware.
        let now = Instant::now();
        if start_at > now {
            let remaining = start_at - now;
            std::thread::sleep(remaining.min(Duration::from_millis(50)));
            continue;
        }
        let failed = sync_cycle(&shared, &uplink, generation);
        if finish_cycle(&shared, generation, failed) {
            return;
        }
    }
}

/// Work through the cycle's cursor. Returns whether anything failed.
fn sync_cycle(shared: &UplinkShared, uplink: &Uplink, generation: u64) -> bool {
    let mut failed = false;
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return failed;
        }
        let (claim, slots) = {
            let mut cycle = shared.cycle.lock();
            if cycle.generation != generation {
                return failed;
            }
            let claim = cycle.cursor;
            cycle.cursor += 1;
            (claim, cycle.store_slots)
        };
        if claim == -1 {
            if let Err(err) = shared.sync_strings() {
                error!(
                    target: "offcache::sync",
                    master = %shared.master_cache_id,
                    error = %err,
                    "string sync failed"
                );
                failed = true;
            }
            continue;
        }
        let idx = claim as usize;
        if idx >= slots {
            return failed;
        }
        shared.pause_point();
        let entry = { shared.stores.lock()[idx].clone() };
        let Some(replicated) = entry else { continue };
        match replicated
            .store
            .sync_with_master(uplink, replicated.index.as_ref())
        {
            Ok(false) => {}
            Ok(true) => {
                // Destroyed mid-sync; drop it from the rotation.
                shared.stores.lock()[idx] = None;
                shared.active_stores.fetch_sub(1, Ordering::AcqRel);
            }
            Err(err) => {
                error!(
                    target: "offcache::sync",
                    store = replicated.store.name(),
                    error = %err,
                    "sync failed; will retry next cycle"
                );
                failed = true;
            }
        }
    }
}

/// Last worker out schedules the next cycle; the rest wait for it.
/// Returns whether the uplink is finished for good.
fn finish_cycle(shared: &UplinkShared, generation: u64, failed: bool) -> bool {
    let mut cycle = shared.cycle.lock();
    if cycle.generation != generation {
        return cycle.done;
    }
    if failed {
        cycle.failed = true;
    }
    cycle.active_threads -= 1;
    if cycle.active_threads > 0 {
        while cycle.generation == generation && !cycle.done {
            shared.cycle_wake.wait(&mut cycle);
        }
        return cycle.done;
    }
    // Last thread out.
    let clean = !cycle.failed;
    if generation == 1 && !clean {
        shared.initial_sync_failed.store(true, Ordering::Release);
    }
    if clean {
        shared
            .last_successful_refresh
            .store(now_millis(), Ordering::Release);
    }
    let elapsed = cycle.start_at.elapsed();
    info!(
        target: "offcache::sync",
        master = %shared.master_cache_id,
        generation,
        clean,
        elapsed_ms = elapsed.as_millis() as u64,
        "cache replication cycle finished"
    );
    let active = shared.active_stores.load(Ordering::Acquire);
    if active == 0 || shared.shutdown.load(Ordering::Acquire) {
        cycle.done = true;
        shared.cycle_wake.notify_all();
        return true;
    }
    let interval = Duration::from_millis(shared.sync_interval_ms.load(Ordering::Acquire));
    let threads = shared.worker_count.load(Ordering::Acquire);
    let next_start = std::cmp::max(Instant::now(), cycle.start_at + interval);
    let slots = shared.stores.lock().len();
    *cycle = CycleState {
        generation: generation + 1,
        start_at: next_start,
        cursor: -1,
        active_threads: threads,
        store_slots: slots,
        failed: false,
        done: false,
    };
    shared.cycle_wake.notify_all();
    false
}
