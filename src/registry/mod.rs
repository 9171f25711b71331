//! # Weak Registry
//!
//! A lock-free, concurrently-resizable hash set of weak record handles,
//! keyed by slot index. The record store parks a [`WeakRecordRef`] here
//! for every freed slot; when the wrapper's last clone drops, the slot
//! lands on the registry's collection queue and `evict_collected` on the
//! store returns it to the free list.
//!
//! ## Bucket States
//!
//! Each bucket is a tagged pointer to an immutable, CAS-published entry
//! chain:
//!
//! ```text
//! tag 0, null     Empty
//! tag 0, ptr      Chain(head)         — live entries
//! tag 1, ptr/null Resizing            — chain being copied to the next table
//! tag 2, null     Resized             — fully transferred, consult next table
//! ```
//!
//! Chains are never mutated in place: insertion pushes a fresh head,
//! removal publishes a rebuilt chain. Replaced nodes are handed to
//! `crossbeam-epoch` for deferred destruction, so readers traversing a
//! chain under an epoch pin never observe a freed node.
//!
//! ## Resize Protocol
//!
//! When load exceeds 3/4, the thread that wins a CAS on the table's
//! resize cell installs a `ResizeContainer { next, resizers,
//! queue_position }` and becomes the owner, transferring buckets forward
//! (claiming each via a `Chain → Resizing` tag CAS, copying, then marking
//! `Resized`). Any other thread that trips over a `Resizing`/`Resized`
//! bucket becomes a helper: it increments `resizers`, claims descending
//! bucket ranges via CAS on `queue_position`, and transfers them in
//! reverse — forward owner and reverse helpers meet in the middle, which
//! guarantees progress under contention. The next table becomes visible
//! to a thread only once `resizers` has drained to zero, so every old
//! bucket reaches exactly one terminal `Resized` state and every live
//! entry lands in the new table exactly once.
//!
//! ## Size Tracking
//!
//! Tables at or above [`STRIPED_SIZE_THRESHOLD`] shard their size counter
//! across [`SIZE_STRIPES`] cache-padded stripes selected by a hash of the
//! calling thread's id; `size()` sums the stripes plus the residual
//! counter.

use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_queue::SegQueue;
use crossbeam_utils::CachePadded;

use crate::config::{
    REGISTRY_DEFAULT_CAPACITY, REGISTRY_MAX_CAPACITY, SIZE_STRIPES, STRIPED_SIZE_THRESHOLD,
    TRANSFER_STRIDE,
};
use crate::store::WeakRecordRef;

const TAG_CHAIN: usize = 0;
const TAG_RESIZING: usize = 1;
const TAG_RESIZED: usize = 2;

struct Entry {
    slot: u32,
    handle: WeakRecordRef,
    /// Set once before publication, never mutated afterwards.
    next: Atomic<Entry>,
}

struct Table {
    buckets: Box<[Atomic<Entry>]>,
    resize: Atomic<ResizeContainer>,
}

impl Table {
    fn new(capacity: usize) -> Self {
        let buckets = (0..capacity).map(|_| Atomic::null()).collect();
        Self {
            buckets,
            resize: Atomic::null(),
        }
    }

    #[inline]
    fn index(&self, slot: u32) -> usize {
        (spread(slot) as usize) & (self.buckets.len() - 1)
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        // A retired table still owns its resize container; the next table
        // the container points at has its own owner and is left alone.
        // SAFETY: tables are destroyed only when unreachable.
        let guard = unsafe { epoch::unprotected() };
        let container = self.resize.load(Ordering::Relaxed, guard);
        if !container.is_null() {
            drop(unsafe { container.into_owned() });
        }
    }
}

struct ResizeContainer {
    next: Atomic<Table>,
    resizers: AtomicUsize,
    queue_position: AtomicIsize,
}

/// Walk a chain looking for `slot`.
fn chain_find<'g>(chain: Shared<'g, Entry>, slot: u32, guard: &'g Guard) -> Option<Shared<'g, Entry>> {
    let mut e = chain;
    // SAFETY: chain nodes are destroyed only via epoch deferral; the
    // caller's pin keeps them alive.
    while let Some(entry) = unsafe { e.as_ref() } {
        if entry.slot == slot {
            return Some(e);
        }
        e = entry.next.load(Ordering::Acquire, guard);
    }
    None
}

/// Hash spreader over the slot index (high bits folded down so the
/// power-of-two mask sees them).
#[inline]
fn spread(slot: u32) -> u32 {
    let mut h = slot.wrapping_mul(0x9E37_79B9);
    h ^= (h >> 20) ^ (h >> 12);
    h ^ (h >> 7) ^ (h >> 4)
}

fn thread_stripe() -> usize {
    use std::hash::{Hash, Hasher};
    thread_local! {
        static STRIPE: usize = {
            let mut h = std::collections::hash_map::DefaultHasher::new();
            std::thread::current().id().hash(&mut h);
            (h.finish() as usize) & SIZE_STRIPES
        };
    }
    STRIPE.with(|s| *s)
}

pub struct WeakRegistry {
    table: Atomic<Table>,
    size: AtomicIsize,
    stripes: Box<[CachePadded<AtomicIsize>]>,
    striped: AtomicBool,
    dead: Arc<SegQueue<u32>>,
}

impl Default for WeakRegistry {
    fn default() -> Self {
        Self::with_capacity(REGISTRY_DEFAULT_CAPACITY)
    }
}

impl WeakRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity
            .next_power_of_two()
            .clamp(2, REGISTRY_MAX_CAPACITY);
        let stripes = (0..SIZE_STRIPES)
            .map(|_| CachePadded::new(AtomicIsize::new(0)))
            .collect();
        Self {
            table: Atomic::new(Table::new(capacity)),
            size: AtomicIsize::new(0),
            stripes,
            striped: AtomicBool::new(capacity >= STRIPED_SIZE_THRESHOLD),
            dead: Arc::new(SegQueue::new()),
        }
    }

    /// Queue fed by dying record wrappers; shared with every handle the
    /// owning store creates.
    pub(crate) fn dead_queue(&self) -> Arc<SegQueue<u32>> {
        Arc::clone(&self.dead)
    }

    /// Drain slots whose wrappers have been dropped since the last call.
    pub fn drain_dead(&self, mut f: impl FnMut(u32)) {
        while let Some(slot) = self.dead.pop() {
            f(slot);
        }
    }

    pub fn size(&self) -> usize {
        let mut total = self.size.load(Ordering::Acquire);
        for stripe in self.stripes.iter() {
            total += stripe.load(Ordering::Acquire);
        }
        total.max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    fn add_to_size(&self, delta: isize) {
        if self.striped.load(Ordering::Relaxed) {
            let h = thread_stripe();
            if h != 0 {
                self.stripes[h - 1].fetch_add(delta, Ordering::AcqRel);
                return;
            }
        }
        self.size.fetch_add(delta, Ordering::AcqRel);
    }

    /// Insert (or replace) the handle for its slot.
    pub fn put(&self, handle: WeakRecordRef) {
        let guard = &epoch::pin();
        let slot = handle.slot();
        let mut table_sh = self.table.load(Ordering::Acquire, guard);
        let mut spare: Option<Owned<Entry>> = None;
        loop {
            // SAFETY: tables are only destroyed via epoch deferral; the pin
            // keeps this one alive.
            let table = unsafe { table_sh.deref() };
            let idx = table.index(slot);
            let bucket = &table.buckets[idx];
            let cur = bucket.load(Ordering::Acquire, guard);
            if cur.tag() != TAG_CHAIN {
                table_sh = self.help_with_resize_while_bucket(table, idx, guard);
                continue;
            }
            if let Some(found) = chain_find(cur, slot, guard) {
                // Same slot already present: publish a rebuilt chain with
                // the replacement handle at its head.
                if self.replace_chain(bucket, cur, found, Some(&handle), guard) {
                    return;
                }
                continue;
            }
            let new = spare.take().unwrap_or_else(|| {
                Owned::new(Entry {
                    slot,
                    handle: handle.clone(),
                    next: Atomic::null(),
                })
            });
            new.next.store(cur, Ordering::Relaxed);
            match bucket.compare_exchange(cur, new, Ordering::AcqRel, Ordering::Acquire, guard) {
                Ok(_) => {
                    self.add_to_size(1);
                    if !cur.is_null() {
                        self.maybe_resize(table_sh, table.buckets.len(), guard);
                    }
                    return;
                }
                Err(e) => {
                    spare = Some(e.new);
                }
            }
        }
    }

    /// Remove the handle for `slot`. Returns whether it was present.
    pub fn remove(&self, slot: u32) -> bool {
        let guard = &epoch::pin();
        let mut table_sh = self.table.load(Ordering::Acquire, guard);
        loop {
            // SAFETY: pin keeps the table alive (see put).
            let table = unsafe { table_sh.deref() };
            let idx = table.index(slot);
            let bucket = &table.buckets[idx];
            let cur = bucket.load(Ordering::Acquire, guard);
            if cur.tag() != TAG_CHAIN {
                table_sh = self.help_with_resize_while_bucket(table, idx, guard);
                continue;
            }
            let Some(found) = chain_find(cur, slot, guard) else {
                return false;
            };
            if self.replace_chain(bucket, cur, found, None, guard) {
                self.add_to_size(-1);
                return true;
            }
        }
    }

    /// Look up the handle registered for `slot`.
    pub fn get(&self, slot: u32) -> Option<WeakRecordRef> {
        let guard = &epoch::pin();
        let mut table_sh = self.table.load(Ordering::Acquire, guard);
        loop {
            // SAFETY: pin keeps the table alive (see put).
            let table = unsafe { table_sh.deref() };
            let bucket = &table.buckets[table.index(slot)];
            let cur = bucket.load(Ordering::Acquire, guard);
            if cur.tag() == TAG_RESIZED {
                table_sh = self.next_table(table, guard);
                continue;
            }
            // A Resizing bucket still carries its intact chain; entries
            // being copied are observable from either table.
            let mut e = cur.with_tag(TAG_CHAIN);
            // SAFETY: chain nodes are destroyed only via epoch deferral.
            while let Some(entry) = unsafe { e.as_ref() } {
                if entry.slot == slot {
                    return Some(entry.handle.clone());
                }
                e = entry.next.load(Ordering::Acquire, guard);
            }
            return None;
        }
    }

    pub fn contains(&self, slot: u32) -> bool {
        self.get(slot).is_some()
    }

    /// Remove every entry. Helps any in-flight resize to completion.
    pub fn clear(&self) {
        let guard = &epoch::pin();
        let mut table_sh = self.table.load(Ordering::Acquire, guard);
        loop {
            // SAFETY: pin keeps the table alive (see put).
            let table = unsafe { table_sh.deref() };
            let mut saw_resize = false;
            for bucket in table.buckets.iter() {
                loop {
                    let cur = bucket.load(Ordering::Acquire, guard);
                    if cur.tag() != TAG_CHAIN {
                        saw_resize = true;
                        break;
                    }
                    if cur.is_null() {
                        break;
                    }
                    if bucket
                        .compare_exchange(
                            cur,
                            Shared::null(),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                            guard,
                        )
                        .is_ok()
                    {
                        let removed = destroy_chain_deferred(cur, guard);
                        self.add_to_size(-(removed as isize));
                        break;
                    }
                }
            }
            if !saw_resize {
                return;
            }
            table_sh = self.next_table(table, guard);
        }
    }

    /// Publish `cur` with `found` removed (and, for `replacement`,
    /// substituted by a fresh entry at the head). Defers destruction of
    /// every superseded node on success.
    fn replace_chain(
        &self,
        bucket: &Atomic<Entry>,
        cur: Shared<'_, Entry>,
        found: Shared<'_, Entry>,
        replacement: Option<&WeakRecordRef>,
        guard: &Guard,
    ) -> bool {
        // SAFETY: nodes reachable from a live bucket under a pin.
        let head = unsafe { cur.deref() };
        let target = unsafe { found.deref() };
        if std::ptr::eq(head, target) && replacement.is_none() {
            // Removing the head: the tail is shared as-is, only the head
            // node dies.
            let tail = target.next.load(Ordering::Acquire, guard);
            if bucket
                .compare_exchange(cur, tail, Ordering::AcqRel, Ordering::Acquire, guard)
                .is_ok()
            {
                // SAFETY: the head is now unreachable from the bucket.
                unsafe { guard.defer_destroy(cur) };
                return true;
            }
            return false;
        }
        // General case: rebuild the whole chain without the target, then
        // retire every old node.
        let mut rebuilt: Shared<'_, Entry> = Shared::null();
        let mut e = cur;
        // SAFETY: chain nodes live under the pin.
        while let Some(entry) = unsafe { e.as_ref() } {
            if !std::ptr::eq(entry, target) {
                let node = Owned::new(Entry {
                    slot: entry.slot,
                    handle: entry.handle.clone(),
                    next: Atomic::null(),
                });
                node.next.store(rebuilt, Ordering::Relaxed);
                rebuilt = node.into_shared(guard);
            }
            e = entry.next.load(Ordering::Acquire, guard);
        }
        if let Some(handle) = replacement {
            let node = Owned::new(Entry {
                slot: handle.slot(),
                handle: handle.clone(),
                next: Atomic::null(),
            });
            node.next.store(rebuilt, Ordering::Relaxed);
            rebuilt = node.into_shared(guard);
        }
        if bucket
            .compare_exchange(cur, rebuilt, Ordering::AcqRel, Ordering::Acquire, guard)
            .is_ok()
        {
            destroy_chain_deferred(cur, guard);
            true
        } else {
            // The speculative chain was never published; reclaim it now.
            // SAFETY: no other thread has seen these nodes.
            let mut e = rebuilt;
            while !e.is_null() {
                let next = unsafe { e.deref() }.next.load(Ordering::Relaxed, guard);
                drop(unsafe { e.into_owned() });
                e = next;
            }
            false
        }
    }

    fn maybe_resize(&self, table_sh: Shared<'_, Table>, capacity: usize, guard: &Guard) {
        let threshold = capacity - (capacity >> 2);
        if self.size() + 1 > threshold {
            self.resize(table_sh, guard);
        }
    }

    fn resize(&self, table_sh: Shared<'_, Table>, guard: &Guard) {
        // SAFETY: pin keeps the table alive (see put).
        let table = unsafe { table_sh.deref() };
        let old_len = table.buckets.len();
        assert!(
            old_len < REGISTRY_MAX_CAPACITY,
            "weak registry exceeded maximum capacity"
        );
        let existing = table.resize.load(Ordering::Acquire, guard);
        if existing.is_null() {
            let new_len = old_len << 1;
            let container = Owned::new(ResizeContainer {
                next: Atomic::new(Table::new(new_len)),
                resizers: AtomicUsize::new(1),
                queue_position: AtomicIsize::new(old_len as isize),
            });
            match table.resize.compare_exchange(
                Shared::null(),
                container,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(container_sh) => {
                    if new_len >= STRIPED_SIZE_THRESHOLD {
                        self.striped.store(true, Ordering::Relaxed);
                    }
                    // SAFETY: just published; destroyed only with the table.
                    let container = unsafe { container_sh.deref() };
                    self.transfer(table, container, guard);
                    let next_sh = container.next.load(Ordering::Acquire, guard);
                    self.publish(table_sh, next_sh, guard);
                }
                Err(e) => {
                    // Lost the race to install the container: reclaim the
                    // speculative table and container, then help.
                    let container = e.new;
                    let spare_table = container.next.load(Ordering::Relaxed, guard);
                    // SAFETY: never published.
                    drop(unsafe { spare_table.into_owned() });
                    drop(container);
                    self.help_with_resize(table, guard);
                }
            }
        } else {
            self.help_with_resize(table, guard);
        }
    }

    /// Swing the registry's table pointer from `old` to `next`, helping
    /// ancestor resizes until it is our turn (double-resize chains).
    fn publish(&self, old: Shared<'_, Table>, next: Shared<'_, Table>, guard: &Guard) {
        loop {
            match self
                .table
                .compare_exchange(old, next, Ordering::AcqRel, Ordering::Acquire, guard)
            {
                Ok(_) => {
                    // SAFETY: every bucket of the old table is Resized and
                    // all entry nodes were retired during transfer; pinned
                    // readers drain before destruction runs.
                    unsafe { guard.defer_destroy(old) };
                    return;
                }
                Err(e) => {
                    let current = e.current;
                    if current == old {
                        continue;
                    }
                    // SAFETY: pin keeps it alive.
                    self.help_with_resize(unsafe { current.deref() }, guard);
                }
            }
        }
    }

    /// Forward transfer performed by the resize owner.
    fn transfer(&self, table: &Table, container: &ResizeContainer, guard: &Guard) {
        let dest_sh = container.next.load(Ordering::Acquire, guard);
        let len = table.buckets.len();
        let mut j = 0;
        while j < len {
            let bucket = &table.buckets[j];
            let cur = bucket.load(Ordering::Acquire, guard);
            match cur.tag() {
                TAG_CHAIN if cur.is_null() => {
                    if bucket
                        .compare_exchange(
                            cur,
                            Shared::null().with_tag(TAG_RESIZED),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                            guard,
                        )
                        .is_ok()
                    {
                        j += 1;
                    }
                }
                TAG_CHAIN => {
                    if bucket
                        .compare_exchange(
                            cur,
                            cur.with_tag(TAG_RESIZING),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                            guard,
                        )
                        .is_ok()
                    {
                        self.copy_and_seal(bucket, cur, dest_sh, guard);
                        j += 1;
                    }
                }
                _ => {
                    // A helper owns this range; skip to the next stride and
                    // stop early once we are the only resizer left.
                    j = (j & !(TRANSFER_STRIDE - 1)) + TRANSFER_STRIDE;
                    if container.resizers.load(Ordering::Acquire) == 1 {
                        break;
                    }
                }
            }
        }
        container.resizers.fetch_sub(1, Ordering::AcqRel);
        wait_for_resizers(container);
    }

    /// Reverse transfer performed by helpers, claiming descending ranges.
    fn reverse_transfer(&self, table: &Table, container: &ResizeContainer, guard: &Guard) {
        let dest_sh = container.next.load(Ordering::Acquire, guard);
        while container.queue_position.load(Ordering::Acquire) > 0 {
            let end = container
                .queue_position
                .fetch_sub(TRANSFER_STRIDE as isize, Ordering::AcqRel);
            let start = end - TRANSFER_STRIDE as isize;
            if end <= 0 {
                break;
            }
            let start = start.max(0) as usize;
            let mut j = end as usize;
            while j > start {
                let bucket = &table.buckets[j - 1];
                let cur = bucket.load(Ordering::Acquire, guard);
                match cur.tag() {
                    TAG_CHAIN if cur.is_null() => {
                        if bucket
                            .compare_exchange(
                                cur,
                                Shared::null().with_tag(TAG_RESIZED),
                                Ordering::AcqRel,
                                Ordering::Acquire,
                                guard,
                            )
                            .is_ok()
                        {
                            j -= 1;
                        }
                    }
                    TAG_CHAIN => {
                        if bucket
                            .compare_exchange(
                                cur,
                                cur.with_tag(TAG_RESIZING),
                                Ordering::AcqRel,
                                Ordering::Acquire,
                                guard,
                            )
                            .is_ok()
                        {
                            self.copy_and_seal(bucket, cur, dest_sh, guard);
                            j -= 1;
                        }
                    }
                    _ => {
                        // Ran into the forward transfer; the table is done
                        // up to here.
                        container.queue_position.store(0, Ordering::Release);
                        return;
                    }
                }
            }
        }
    }

    /// Copy the claimed chain into the destination table, seal the source
    /// bucket as Resized, and retire the old nodes.
    fn copy_and_seal(
        &self,
        bucket: &Atomic<Entry>,
        chain: Shared<'_, Entry>,
        dest_sh: Shared<'_, Table>,
        guard: &Guard,
    ) {
        let mut e = chain.with_tag(TAG_CHAIN);
        // SAFETY: nodes stay alive under the pin; destruction is deferred.
        while let Some(entry) = unsafe { e.as_ref() } {
            self.copy_entry(entry, dest_sh, guard);
            let next = entry.next.load(Ordering::Acquire, guard);
            unsafe { guard.defer_destroy(e) };
            e = next;
        }
        bucket.store(Shared::null().with_tag(TAG_RESIZED), Ordering::Release);
    }

    /// Insert a copy of `entry` into the destination table, chasing
    /// further resizes if the destination is itself transferring.
    fn copy_entry<'g>(&self, entry: &Entry, mut dest_sh: Shared<'g, Table>, guard: &'g Guard) {
        let mut spare: Option<Owned<Entry>> = None;
        loop {
            // SAFETY: pin keeps the destination table alive.
            let dest = unsafe { dest_sh.deref() };
            let bucket = &dest.buckets[dest.index(entry.slot)];
            let cur = bucket.load(Ordering::Acquire, guard);
            if cur.tag() != TAG_CHAIN {
                dest_sh = self.next_table(dest, guard);
                continue;
            }
            let node = spare.take().unwrap_or_else(|| {
                Owned::new(Entry {
                    slot: entry.slot,
                    handle: entry.handle.clone(),
                    next: Atomic::null(),
                })
            });
            node.next.store(cur, Ordering::Relaxed);
            match bucket.compare_exchange(cur, node, Ordering::AcqRel, Ordering::Acquire, guard) {
                Ok(_) => return,
                Err(e) => spare = Some(e.new),
            }
        }
    }

    /// Help until the given bucket of `table` reaches Resized, then return
    /// the next table.
    fn help_with_resize_while_bucket<'g>(
        &self,
        table: &Table,
        idx: usize,
        guard: &'g Guard,
    ) -> Shared<'g, Table> {
        let mut next = self.help_with_resize(table, guard);
        let mut spins = 0u32;
        while table.buckets[idx].load(Ordering::Acquire, guard).tag() != TAG_RESIZED {
            spins += 1;
            next = self.help_with_resize(table, guard);
            if spins & 7 == 0 {
                std::thread::yield_now();
            }
        }
        next
    }

    /// Become a helper for the resize in progress on `table` (if any work
    /// remains to claim) and return the next table.
    fn help_with_resize<'g>(&self, table: &Table, guard: &'g Guard) -> Shared<'g, Table> {
        let container_sh = table.resize.load(Ordering::Acquire, guard);
        let Some(container) = (unsafe { container_sh.as_ref() }) else {
            // Raced ahead of the container installation; fall back to the
            // published table.
            return self.table.load(Ordering::Acquire, guard);
        };
        let next = container.next.load(Ordering::Acquire, guard);
        if container.queue_position.load(Ordering::Acquire) > TRANSFER_STRIDE as isize {
            container.resizers.fetch_add(1, Ordering::AcqRel);
            self.reverse_transfer(table, container, guard);
            container.resizers.fetch_sub(1, Ordering::AcqRel);
        }
        next
    }

    fn next_table<'g>(&self, table: &Table, guard: &'g Guard) -> Shared<'g, Table> {
        let container_sh = table.resize.load(Ordering::Acquire, guard);
        match unsafe { container_sh.as_ref() } {
            Some(container) => container.next.load(Ordering::Acquire, guard),
            None => self.table.load(Ordering::Acquire, guard),
        }
    }
}

/// Retire every node of an unpublished-from-bucket chain; returns the node
/// count.
fn destroy_chain_deferred(chain: Shared<'_, Entry>, guard: &Guard) -> usize {
    let mut count = 0;
    let mut e = chain.with_tag(TAG_CHAIN);
    // SAFETY: the chain was just unlinked from its bucket; pinned readers
    // may still traverse it, hence deferral.
    while let Some(entry) = unsafe { e.as_ref() } {
        let next = entry.next.load(Ordering::Acquire, guard);
        unsafe { guard.defer_destroy(e) };
        count += 1;
        e = next;
    }
    count
}

fn wait_for_resizers(container: &ResizeContainer) {
    for _ in 0..16 {
        if container.resizers.load(Ordering::Acquire) == 0 {
            return;
        }
    }
    while container.resizers.load(Ordering::Acquire) != 0 {
        std::thread::yield_now();
    }
}

impl Drop for WeakRegistry {
    fn drop(&mut self) {
        // Exclusive access: no concurrent operations, no pinned readers.
        // SAFETY: &mut self guarantees quiescence.
        let guard = unsafe { epoch::unprotected() };
        let mut table_sh = self.table.load(Ordering::Relaxed, guard);
        while !table_sh.is_null() {
            // SAFETY: sole owner; Table::drop frees any attached container.
            let table = unsafe { table_sh.into_owned() };
            for bucket in table.buckets.iter() {
                let mut e = bucket.load(Ordering::Relaxed, guard);
                if e.tag() == TAG_RESIZED {
                    continue;
                }
                e = e.with_tag(TAG_CHAIN);
                while !e.is_null() {
                    // SAFETY: chains are exclusively owned at drop time.
                    let node = unsafe { e.into_owned() };
                    e = node.next.load(Ordering::Relaxed, guard);
                }
            }
            let container_sh = table.resize.load(Ordering::Relaxed, guard);
            // SAFETY: reading through the container before the table (and
            // with it the container) is dropped at the end of this scope.
            table_sh = match unsafe { container_sh.as_ref() } {
                Some(container) => container.next.load(Ordering::Relaxed, guard),
                None => Shared::null(),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RecordRef;
    use std::sync::Barrier;

    fn handle_for(slot: u32, queue: &Arc<SegQueue<u32>>, keep: &mut Vec<RecordRef>) -> WeakRecordRef {
        let rec = RecordRef::new(slot, Arc::clone(queue));
        let weak = rec.downgrade();
        keep.push(rec);
        weak
    }

    #[test]
    fn put_get_remove_round_trip() {
        let registry = WeakRegistry::new();
        let queue = registry.dead_queue();
        let mut keep = Vec::new();
        for slot in 2..50 {
            registry.put(handle_for(slot, &queue, &mut keep));
        }
        assert_eq!(registry.size(), 48);
        for slot in 2..50 {
            assert!(registry.contains(slot));
        }
        assert!(!registry.contains(999));
        assert!(registry.remove(17));
        assert!(!registry.contains(17));
        assert!(!registry.remove(17));
        assert_eq!(registry.size(), 47);
    }

    #[test]
    fn put_of_same_slot_replaces() {
        let registry = WeakRegistry::new();
        let queue = registry.dead_queue();
        let mut keep = Vec::new();
        registry.put(handle_for(5, &queue, &mut keep));
        let second = RecordRef::new(5, Arc::clone(&queue));
        registry.put(second.downgrade());
        assert_eq!(registry.size(), 1);
        let got = registry.get(5).unwrap();
        assert!(got.upgrade().unwrap().ptr_eq(&second));
    }

    #[test]
    fn survives_multiple_resizes() {
        let registry = WeakRegistry::with_capacity(4);
        let queue = registry.dead_queue();
        let mut keep = Vec::new();
        let count = 10_000u32;
        for slot in 2..count {
            registry.put(handle_for(slot, &queue, &mut keep));
        }
        assert_eq!(registry.size(), (count - 2) as usize);
        for slot in 2..count {
            assert!(registry.contains(slot), "slot {} lost in resize", slot);
        }
    }

    #[test]
    fn clear_empties_the_set() {
        let registry = WeakRegistry::new();
        let queue = registry.dead_queue();
        let mut keep = Vec::new();
        for slot in 2..300 {
            registry.put(handle_for(slot, &queue, &mut keep));
        }
        registry.clear();
        assert_eq!(registry.size(), 0);
        assert!(!registry.contains(2));
    }

    #[test]
    fn dead_queue_reports_dropped_wrappers() {
        let registry = WeakRegistry::new();
        let queue = registry.dead_queue();
        let rec = RecordRef::new(42, Arc::clone(&queue));
        registry.put(rec.downgrade());
        drop(rec);
        let mut dead = Vec::new();
        registry.drain_dead(|slot| dead.push(slot));
        assert_eq!(dead, vec![42]);
    }

    #[test]
    fn concurrent_puts_during_resize() {
        let registry = Arc::new(WeakRegistry::with_capacity(4));
        let total_threads = 4;
        let per_thread = 2_000u32;
        let barrier = Arc::new(Barrier::new(total_threads));
        let mut workers = Vec::new();
        for t in 0..total_threads {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            workers.push(std::thread::spawn(move || {
                let queue = registry.dead_queue();
                let mut keep = Vec::new();
                barrier.wait();
                let base = 2 + t as u32 * per_thread;
                for slot in base..base + per_thread {
                    let rec = RecordRef::new(slot, Arc::clone(&queue));
                    registry.put(rec.downgrade());
                    keep.push(rec);
                }
                keep
            }));
        }
        let kept: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        assert_eq!(registry.size(), total_threads * per_thread as usize);
        for t in 0..total_threads {
            let base = 2 + t as u32 * per_thread;
            for slot in base..base + per_thread {
                assert!(registry.contains(slot), "slot {} missing", slot);
            }
        }
        drop(kept);
    }

    #[test]
    fn concurrent_put_remove_converges() {
        let registry = Arc::new(WeakRegistry::with_capacity(8));
        let barrier = Arc::new(Barrier::new(3));
        let adder = {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let queue = registry.dead_queue();
                let mut keep = Vec::new();
                barrier.wait();
                for slot in 2..2_002u32 {
                    let rec = RecordRef::new(slot, Arc::clone(&queue));
                    registry.put(rec.downgrade());
                    keep.push(rec);
                }
                keep
            })
        };
        let remover = {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                let mut removed = 0usize;
                for slot in 2..2_002u32 {
                    if registry.remove(slot) {
                        removed += 1;
                    }
                }
                removed
            })
        };
        barrier.wait();
        let keep = adder.join().unwrap();
        let removed = remover.join().unwrap();
        assert_eq!(registry.size(), 2_000 - removed);
        drop(keep);
    }
}
