//! # Record Store
//!
//! A `RecordStore` holds every record of one business-object type in a
//! single growable arena of fixed-stride slots. It is the master-side
//! source and replica-side target of the replication protocol, and the
//! component the weak registry and deferred reclaimer exist to serve.
//!
//! ## Slot Lifecycle
//!
//! ```text
//!            allocate                    free                   drop of
//!   Empty ─────────────▶ Live ──────────────────▶ Reclaimable ──────────▶ queued
//!     ▲                   (shadow holds a strong    (shadow holds a weak   (collection
//!     │                    clone of the wrapper)     handle; bytes intact)  queue)
//!     └──────────────────────── evict_collected ◀──────────────────────────┘
//!                               (slot returns to the free list)
//! ```
//!
//! `free` deliberately does *not* return the slot to the free list: the
//! occupant is downgraded to a weak handle first, so in-flight readers
//! that still hold the wrapper never see recycled bytes. Only once the
//! wrapper provably died does `evict_collected` recycle the slot.
//!
//! ## Free List
//!
//! Free slots form an intrusive stack linked through each slot's first
//! four bytes. Head and approximate size share one `AtomicU64`
//! (`[size:32][head:32]`) so both advance in a single CAS — no lock on
//! the allocate/evict fast paths. Slot 0 can never be on the list, which
//! is what lets head 0 double as the end marker.
//!
//! ## Growth and Lock-Free Reads
//!
//! Growth maps a new arena (doubling until the fixed-increment cap),
//! bulk-copies, publishes the new base address with release ordering,
//! bumps the fence counter, and retires the old arena to the reclaimer.
//! Field reads never lock: they pin a reclaim epoch, snapshot the fence,
//! read through the published base, and retry if the fence moved — the
//! cooperative publication barrier, not a full memory fence per read.
//!
//! ## Locking Contract
//!
//! State mutators (`allocate`, `free`, `evict_collected`, `mark_dirty`,
//! merge application) serialize on the store's internal write lock.
//! Field *setters* are lock-free like the getters and rely on the
//! caller's external write lock — the same contract the surrounding
//! cache layer already imposes — to never race a concurrent growth.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::RwLock;
use tracing::debug;

use crate::arena::Arena;
use crate::config::{
    MAX_INCREASE_PAGES, PAGE_POWER, RESERVED_SLOTS, SLOTS_PER_PAGE, STORE_HARD_CAP_BYTES,
    TOMBSTONE,
};
use crate::reclaim::Reclaimer;
use crate::registry::WeakRegistry;
use crate::store::{RecordLayout, RecordRef, WeakRecordRef};

pub(super) enum SlotEntry {
    Empty,
    Live(RecordRef),
    Reclaimable(WeakRecordRef),
}

impl SlotEntry {
    #[inline]
    pub(super) fn is_live(&self) -> bool {
        matches!(self, SlotEntry::Live(_))
    }
}

pub(super) struct StoreState {
    pub(super) arena: Option<Arena>,
    pub(super) shadow: Vec<SlotEntry>,
    /// Highest slot index ever handed out; RESERVED_SLOTS - 1 when virgin.
    pub(super) current: usize,
    /// Slot capacity of the arena.
    pub(super) max: usize,
    /// Page version vector: 0 = dirty, positive = sync epoch. Grows lazily.
    pub(super) page_versions: Vec<u64>,
    pub(super) current_page_version: u64,
    pub(super) max_replicated_page_version: u64,
}

impl StoreState {
    pub(super) fn arena(&self) -> &Arena {
        match &self.arena {
            Some(a) => a,
            None => panic!("record store used after destroy"),
        }
    }

    #[inline]
    pub(super) fn is_virgin(&self) -> bool {
        self.current < RESERVED_SLOTS
    }

    pub(super) fn set_page_version(&mut self, page: usize, version: u64) {
        if self.page_versions.len() <= page {
            self.page_versions.resize(page + 1, 0);
        }
        self.page_versions[page] = version;
    }
}

pub struct RecordStore {
    name: String,
    layout: RecordLayout,
    stride: usize,
    max_increase_bytes: u64,
    base: AtomicPtr<u8>,
    len_bytes: AtomicUsize,
    fence: AtomicU64,
    /// Packed free list: `[size:32][head:32]`.
    free_list: AtomicU64,
    total_freed: AtomicI64,
    destroyed: AtomicBool,
    last_refresh_time: AtomicI64,
    pub(super) state: RwLock<StoreState>,
    pub(super) registry: WeakRegistry,
    pub(super) reclaimer: Arc<Reclaimer>,
}

#[inline]
fn stack_head(word: u64) -> u32 {
    word as u32
}

#[inline]
fn stack_size(word: u64) -> u32 {
    (word >> 32) as u32
}

#[inline]
fn pack_stack(head: u32, size: u32) -> u64 {
    ((size as u64) << 32) | head as u64
}

impl RecordStore {
    pub fn new(
        name: impl Into<String>,
        layout: RecordLayout,
        reclaimer: Arc<Reclaimer>,
    ) -> Result<Self> {
        let stride = layout.stride();
        let page_bytes = stride << PAGE_POWER;
        let arena = Arena::zeroed(page_bytes)?;
        arena.put_u8(0, TOMBSTONE);
        arena.put_u8(stride, TOMBSTONE);
        let base = arena.base_ptr();
        let max = page_bytes / stride;
        let mut shadow = Vec::new();
        shadow.resize_with(max, || SlotEntry::Empty);
        Ok(Self {
            name: name.into(),
            stride,
            max_increase_bytes: (stride as u64) << (PAGE_POWER + MAX_INCREASE_PAGES),
            base: AtomicPtr::new(base),
            len_bytes: AtomicUsize::new(page_bytes),
            fence: AtomicU64::new(0),
            free_list: AtomicU64::new(0),
            total_freed: AtomicI64::new(0),
            destroyed: AtomicBool::new(false),
            last_refresh_time: AtomicI64::new(0),
            state: RwLock::new(StoreState {
                arena: Some(arena),
                shadow,
                current: RESERVED_SLOTS - 1,
                max,
                page_versions: Vec::new(),
                current_page_version: 0,
                max_replicated_page_version: 0,
            }),
            registry: WeakRegistry::new(),
            reclaimer,
            layout,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn layout(&self) -> &RecordLayout {
        &self.layout
    }

    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    #[inline]
    pub(super) fn page_bytes(&self) -> usize {
        self.stride << PAGE_POWER
    }

    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn last_refresh_time(&self) -> i64 {
        self.last_refresh_time.load(Ordering::Acquire)
    }

    pub fn set_last_refresh_time(&self, millis: i64) {
        self.last_refresh_time.store(millis, Ordering::Release);
    }

    /// Allocate a slot: reuse from the free list when possible, else
    /// append past `current`, growing the arena first if full.
    pub fn allocate(&self) -> Result<RecordRef> {
        ensure!(!self.is_destroyed(), "allocate on destroyed store '{}'", self.name);
        let mut state = self.state.write();
        loop {
            let cur = self.free_list.load(Ordering::Acquire);
            let head = stack_head(cur);
            if head != 0 {
                let next = state.arena().get_i32(head as usize * self.stride) as u32;
                let replacement = pack_stack(next, stack_size(cur) - 1);
                if self
                    .free_list
                    .compare_exchange(cur, replacement, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.total_freed.fetch_sub(1, Ordering::Relaxed);
                    state.arena().zero_range(head as usize * self.stride, self.stride);
                    let rec = RecordRef::new(head, self.registry.dead_queue());
                    state.shadow[head as usize] = SlotEntry::Live(rec.clone());
                    Self::mark_dirty_locked(&mut state, head as usize);
                    return Ok(rec);
                }
            } else {
                if state.current + 1 == state.max {
                    self.grow_locked(&mut state)?;
                }
                state.current += 1;
                let slot = state.current;
                let rec = RecordRef::new(slot as u32, self.registry.dead_queue());
                state.shadow[slot] = SlotEntry::Live(rec.clone());
                Self::mark_dirty_locked(&mut state, slot);
                return Ok(rec);
            }
        }
    }

    /// Mark a slot reclaimable: the occupant is downgraded to a weak
    /// handle parked in the registry. Bytes stay intact; the slot reaches
    /// the free list only via `evict_collected`.
    pub fn free(&self, slot: u32) {
        let mut state = self.state.write();
        self.free_locked(&mut state, slot);
    }

    pub(super) fn free_locked(&self, state: &mut StoreState, slot: u32) {
        let idx = slot as usize;
        assert!(
            idx >= RESERVED_SLOTS && idx <= state.current,
            "free of slot {} outside [{}, {}]",
            slot,
            RESERVED_SLOTS,
            state.current
        );
        let entry = std::mem::replace(&mut state.shadow[idx], SlotEntry::Empty);
        let SlotEntry::Live(rec) = entry else {
            panic!("free of slot {} that is not live", slot);
        };
        let weak = rec.downgrade();
        self.registry.put(weak.clone());
        state.shadow[idx] = SlotEntry::Reclaimable(weak);
        self.total_freed.fetch_add(1, Ordering::Relaxed);
        Self::mark_dirty_locked(state, idx);
    }

    /// Drain the registry's collection queue, returning slots whose
    /// wrappers died to the free list.
    pub fn evict_collected(&self) {
        if self.is_destroyed() {
            return;
        }
        let mut state = self.state.write();
        let state = &mut *state;
        self.registry.drain_dead(|slot| {
            let idx = slot as usize;
            let stale = match &state.shadow[idx] {
                SlotEntry::Reclaimable(w) => w.slot() == slot && w.is_dead(),
                _ => false,
            };
            if !stale {
                return;
            }
            state.shadow[idx] = SlotEntry::Empty;
            self.registry.remove(slot);
            loop {
                let cur = self.free_list.load(Ordering::Acquire);
                state.arena().put_i32(idx * self.stride, stack_head(cur) as i32);
                let replacement = pack_stack(slot, stack_size(cur) + 1);
                if self
                    .free_list
                    .compare_exchange(cur, replacement, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
            }
        });
    }

    /// Set the slot's page version to 0 ("dirty, not yet stamped").
    pub fn mark_dirty(&self, slot: u32) {
        let mut state = self.state.write();
        Self::mark_dirty_locked(&mut state, slot as usize);
    }

    pub(super) fn mark_dirty_locked(state: &mut StoreState, slot: usize) {
        state.set_page_version(slot >> PAGE_POWER, 0);
    }

    fn grow_locked(&self, state: &mut StoreState) -> Result<()> {
        let old_len = state.arena().len() as u64;
        let new_len = if old_len < self.max_increase_bytes {
            old_len << 1
        } else {
            old_len + self.max_increase_bytes
        };
        self.grow_to_locked(state, new_len)
    }

    pub(super) fn grow_to_locked(&self, state: &mut StoreState, new_len: u64) -> Result<()> {
        debug_assert_eq!(new_len as usize % self.page_bytes(), 0);
        ensure!(
            new_len <= STORE_HARD_CAP_BYTES,
            "growth of store '{}' to {} bytes exceeds the addressable cap",
            self.name,
            new_len
        );
        let new_arena = Arena::zeroed(new_len as usize)?;
        new_arena.copy_from(0, state.arena(), 0, state.arena().len());
        let old = self.install_arena_locked(state, new_arena);
        if let Some(old) = old {
            self.reclaimer.retire(old);
        }
        Ok(())
    }

    /// Swap in a replacement arena, publish its base for lock-free
    /// readers, and hand back the old one.
    pub(super) fn install_arena_locked(
        &self,
        state: &mut StoreState,
        new_arena: Arena,
    ) -> Option<Arena> {
        let new_len = new_arena.len();
        let new_base = new_arena.base_ptr();
        let old = state.arena.replace(new_arena);
        state.max = new_len / self.stride;
        state.shadow.resize_with(state.max, || SlotEntry::Empty);
        self.base.store(new_base, Ordering::Release);
        self.len_bytes.store(new_len, Ordering::Release);
        // Readers re-check this counter instead of paying a barrier per read.
        self.fence.fetch_add(1, Ordering::Release);
        old
    }

    /// Advance the read-retry fence without an arena swap, for the merge
    /// path's version-byte-last record copies.
    #[inline]
    pub(super) fn bump_fence(&self) {
        self.fence.fetch_add(1, Ordering::Release);
    }

    /// Page-rounded pre-growth so a bulk insert of `extra` records will
    /// not reallocate mid-way.
    pub fn ensure_extra_capacity(&self, extra: usize) -> Result<()> {
        let mut state = self.state.write();
        let free = self.free_capacity_locked(&state);
        if free < extra {
            let mut need = extra - free + 10;
            let mask = SLOTS_PER_PAGE - 1;
            if need & mask != 0 {
                need = (need & !mask) + SLOTS_PER_PAGE;
            }
            let target = state.arena().len() as u64 + (need * self.stride) as u64;
            self.grow_to_locked(&mut state, target)?;
        }
        Ok(())
    }

    fn free_capacity_locked(&self, state: &StoreState) -> usize {
        state.max - state.current + stack_size(self.free_list.load(Ordering::Acquire)) as usize
    }

    pub fn free_capacity(&self) -> usize {
        self.free_capacity_locked(&self.state.read())
    }

    /// Run `f` over every live record until it returns true. Returns
    /// whether the walk stopped early.
    pub fn for_all(&self, mut f: impl FnMut(&RecordRef) -> bool) -> bool {
        let state = self.state.read();
        for idx in RESERVED_SLOTS..=state.current.min(state.shadow.len().saturating_sub(1)) {
            if let SlotEntry::Live(rec) = &state.shadow[idx] {
                if f(rec) {
                    return true;
                }
            }
        }
        false
    }

    /// Free every live slot and forget all page versions.
    pub fn clear(&self) {
        let mut state = self.state.write();
        for idx in RESERVED_SLOTS..=state.current.min(state.shadow.len().saturating_sub(1)) {
            if state.shadow[idx].is_live() {
                self.free_locked(&mut state, idx as u32);
            }
        }
        state.page_versions.clear();
    }

    /// Release the arena and version vector. Idempotent; any later slot
    /// access is a contract violation.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = self.state.write();
        state.arena.take();
        state.shadow.clear();
        state.page_versions.clear();
        self.len_bytes.store(0, Ordering::Release);
        self.fence.fetch_add(1, Ordering::Release);
        self.registry.clear();
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.len_bytes.load(Ordering::Acquire) as u64
    }

    pub fn used_bytes(&self) -> u64 {
        let state = self.state.read();
        let live = state.current as i64
            - (RESERVED_SLOTS as i64 - 1)
            - self.total_freed.load(Ordering::Relaxed);
        (live.max(0) as u64) * self.stride as u64
    }

    pub fn report_space_usage(&self) {
        let state = self.state.read();
        debug!(
            target: "offcache::store",
            "store '{}' stride {} allocated {} live {} freed {}",
            self.name,
            self.stride,
            self.allocated_bytes(),
            state.current as i64 - (RESERVED_SLOTS as i64 - 1)
                - self.total_freed.load(Ordering::Relaxed),
            self.total_freed.load(Ordering::Relaxed),
        );
    }

    // --- lock-free field access ------------------------------------------

    /// Lock-free read protocol: pin a reclaim epoch, snapshot the fence,
    /// read through the published base, retry if the fence moved.
    #[inline]
    fn read_raw<T>(&self, slot: u32, field: u32, size: usize, read: impl Fn(*const u8) -> T) -> T {
        let _epoch = self.reclaimer.pin();
        loop {
            let fence = self.fence.load(Ordering::Acquire);
            let base = self.base.load(Ordering::Acquire);
            let len = self.len_bytes.load(Ordering::Acquire);
            let off = slot as usize * self.stride + field as usize;
            assert!(
                off + size <= len && slot as usize * self.stride < len,
                "field access out of bounds: slot {} field {} in store '{}'",
                slot,
                field,
                self.name
            );
            // SAFETY: bounds asserted against the published length; the
            // epoch pin keeps this base mapped even across a growth.
            let value = read(unsafe { base.add(off) });
            if self.fence.load(Ordering::Acquire) == fence {
                return value;
            }
        }
    }

    /// Writes follow the same publication protocol; the caller's external
    /// write lock keeps them from racing a growth copy.
    #[inline]
    fn write_raw(&self, slot: u32, field: u32, size: usize, write: impl Fn(*mut u8)) {
        let _epoch = self.reclaimer.pin();
        loop {
            let fence = self.fence.load(Ordering::Acquire);
            let base = self.base.load(Ordering::Acquire);
            let len = self.len_bytes.load(Ordering::Acquire);
            let off = slot as usize * self.stride + field as usize;
            assert!(
                off + size <= len,
                "field write out of bounds: slot {} field {} in store '{}'",
                slot,
                field,
                self.name
            );
            // SAFETY: bounds asserted; epoch pin keeps the base mapped.
            write(unsafe { base.add(off) });
            if self.fence.load(Ordering::Acquire) == fence {
                return;
            }
        }
    }

    pub fn get_byte(&self, slot: u32, field: u32) -> i8 {
        self.read_raw(slot, field, 1, |p| {
            // SAFETY: see read_raw.
            unsafe { *p as i8 }
        })
    }

    pub fn set_byte(&self, slot: u32, field: u32, value: i8) {
        self.write_raw(slot, field, 1, |p| {
            // SAFETY: see write_raw.
            unsafe { *p = value as u8 }
        })
    }

    pub fn get_short(&self, slot: u32, field: u32) -> i16 {
        self.read_raw(slot, field, 2, |p| {
            // SAFETY: see read_raw.
            unsafe { ptr::read_unaligned(p as *const i16) }
        })
    }

    pub fn set_short(&self, slot: u32, field: u32, value: i16) {
        self.write_raw(slot, field, 2, |p| {
            // SAFETY: see write_raw.
            unsafe { ptr::write_unaligned(p as *mut i16, value) }
        })
    }

    pub fn get_char(&self, slot: u32, field: u32) -> u16 {
        self.read_raw(slot, field, 2, |p| {
            // SAFETY: see read_raw.
            unsafe { ptr::read_unaligned(p as *const u16) }
        })
    }

    pub fn set_char(&self, slot: u32, field: u32, value: u16) {
        self.write_raw(slot, field, 2, |p| {
            // SAFETY: see write_raw.
            unsafe { ptr::write_unaligned(p as *mut u16, value) }
        })
    }

    pub fn get_int(&self, slot: u32, field: u32) -> i32 {
        self.read_raw(slot, field, 4, |p| {
            // SAFETY: see read_raw.
            unsafe { ptr::read_unaligned(p as *const i32) }
        })
    }

    pub fn set_int(&self, slot: u32, field: u32, value: i32) {
        self.write_raw(slot, field, 4, |p| {
            // SAFETY: see write_raw.
            unsafe { ptr::write_unaligned(p as *mut i32, value) }
        })
    }

    pub fn get_long(&self, slot: u32, field: u32) -> i64 {
        self.read_raw(slot, field, 8, |p| {
            // SAFETY: see read_raw.
            unsafe { ptr::read_unaligned(p as *const i64) }
        })
    }

    pub fn set_long(&self, slot: u32, field: u32, value: i64) {
        self.write_raw(slot, field, 8, |p| {
            // SAFETY: see write_raw.
            unsafe { ptr::write_unaligned(p as *mut i64, value) }
        })
    }

    pub fn get_float(&self, slot: u32, field: u32) -> f32 {
        f32::from_bits(self.get_int(slot, field) as u32)
    }

    pub fn set_float(&self, slot: u32, field: u32, value: f32) {
        self.set_int(slot, field, value.to_bits() as i32)
    }

    pub fn get_double(&self, slot: u32, field: u32) -> f64 {
        f64::from_bits(self.get_long(slot, field) as u64)
    }

    pub fn set_double(&self, slot: u32, field: u32, value: f64) {
        self.set_long(slot, field, value.to_bits() as i64)
    }

    /// Booleans are a 3-state byte: 0 = false, 1 = true, 2 = null, so
    /// nullability is representable without a separate bitmap.
    pub fn get_boolean(&self, slot: u32, field: u32) -> bool {
        self.get_byte(slot, field) == 1
    }

    pub fn set_boolean(&self, slot: u32, field: u32, value: bool) {
        self.set_byte(slot, field, value as i8)
    }

    pub fn is_boolean_null(&self, slot: u32, field: u32) -> bool {
        self.get_byte(slot, field) == 2
    }

    pub fn set_boolean_null(&self, slot: u32, field: u32) {
        self.set_byte(slot, field, 2)
    }

    /// The registered wrapper for a slot, live or still-reachable weak.
    pub fn record_at(&self, slot: u32) -> Option<RecordRef> {
        let state = self.state.read();
        match state.shadow.get(slot as usize)? {
            SlotEntry::Live(rec) => Some(rec.clone()),
            SlotEntry::Reclaimable(w) => w.upgrade(),
            SlotEntry::Empty => None,
        }
    }

    pub fn live_count(&self) -> usize {
        let state = self.state.read();
        state.shadow.iter().filter(|s| s.is_live()).count()
    }

    // --- test hooks -------------------------------------------------------

    #[cfg(test)]
    pub(crate) fn free_stack_size(&self) -> u32 {
        stack_size(self.free_list.load(Ordering::Acquire))
    }

    #[cfg(test)]
    pub(crate) fn page_version(&self, page: usize) -> u64 {
        let state = self.state.read();
        state.page_versions.get(page).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SLOTS_PER_PAGE;
    use std::time::Duration;

    fn store(stride: usize) -> RecordStore {
        let reclaimer = Reclaimer::with_interval(Duration::from_secs(3600));
        RecordStore::new("TestRecord", RecordLayout::opaque(stride), reclaimer).unwrap()
    }

    #[test]
    fn first_allocation_is_slot_two() {
        let store = store(16);
        let rec = store.allocate().unwrap();
        assert_eq!(rec.slot(), RESERVED_SLOTS as u32);
    }

    #[test]
    fn sentinel_slots_carry_tombstone() {
        let store = store(16);
        assert_eq!(store.get_byte(0, 0) as u8, TOMBSTONE);
        assert_eq!(store.get_byte(1, 0) as u8, TOMBSTONE);
    }

    #[test]
    fn field_round_trip() {
        let store = store(32);
        let rec = store.allocate().unwrap();
        let s = rec.slot();
        store.set_int(s, 0, -5);
        store.set_long(s, 8, i64::MIN);
        store.set_short(s, 16, 300);
        store.set_double(s, 20, 2.5);
        store.set_boolean(s, 28, true);
        assert_eq!(store.get_int(s, 0), -5);
        assert_eq!(store.get_long(s, 8), i64::MIN);
        assert_eq!(store.get_short(s, 16), 300);
        assert_eq!(store.get_double(s, 20), 2.5);
        assert!(store.get_boolean(s, 28));
        assert!(!store.is_boolean_null(s, 28));
        store.set_boolean_null(s, 28);
        assert!(store.is_boolean_null(s, 28));
        assert!(!store.get_boolean(s, 28));
    }

    #[test]
    fn freed_then_collected_slot_is_reused() {
        // Scenario: allocate 3 slots, free the second, drop its wrapper,
        // evict — the next allocation reuses that index.
        let store = store(16);
        let a = store.allocate().unwrap();
        let b = store.allocate().unwrap();
        let c = store.allocate().unwrap();
        assert_eq!((a.slot(), b.slot(), c.slot()), (2, 3, 4));
        let freed_slot = b.slot();
        store.free(freed_slot);
        assert_eq!(store.free_stack_size(), 0, "free defers to collection");
        drop(b);
        store.evict_collected();
        assert_eq!(store.free_stack_size(), 1);
        let d = store.allocate().unwrap();
        assert_eq!(d.slot(), freed_slot);
    }

    #[test]
    fn reused_slot_comes_back_zeroed() {
        let store = store(16);
        let a = store.allocate().unwrap();
        let slot = a.slot();
        store.set_long(slot, 0, -1);
        store.set_long(slot, 8, -1);
        store.free(slot);
        drop(a);
        store.evict_collected();
        let b = store.allocate().unwrap();
        assert_eq!(b.slot(), slot);
        assert_eq!(store.get_long(slot, 0), 0);
        assert_eq!(store.get_long(slot, 8), 0);
    }

    #[test]
    fn growth_retires_old_arena() {
        // Scenario: one page holds 1024 slots; allocating 1025 records
        // forces exactly one growth, and the old arena is parked on the
        // reclaimer rather than freed.
        let reclaimer = Reclaimer::with_interval(Duration::from_secs(3600));
        let store =
            RecordStore::new("Grown", RecordLayout::opaque(16), Arc::clone(&reclaimer)).unwrap();
        let mut recs = Vec::new();
        // One page minus the two sentinels fits 1022 records.
        for _ in 0..(SLOTS_PER_PAGE - RESERVED_SLOTS) {
            recs.push(store.allocate().unwrap());
        }
        assert_eq!(reclaimer.retired_count(), 0);
        assert_eq!(store.allocated_bytes(), (16 << PAGE_POWER) as u64);
        for _ in 0..3 {
            recs.push(store.allocate().unwrap());
        }
        assert_eq!(reclaimer.retired_count(), 1);
        assert_eq!(store.allocated_bytes(), 2 * (16 << PAGE_POWER) as u64);
        // Contents survived the copy.
        assert_eq!(recs.len(), SLOTS_PER_PAGE - RESERVED_SLOTS + 3);
    }

    #[test]
    fn growth_preserves_record_bytes() {
        let store = store(16);
        let mut recs = Vec::new();
        for i in 0..2000u32 {
            let rec = store.allocate().unwrap();
            store.set_int(rec.slot(), 0, i as i32);
            recs.push(rec);
        }
        for (i, rec) in recs.iter().enumerate() {
            assert_eq!(store.get_int(rec.slot(), 0), i as i32);
        }
    }

    #[test]
    fn allocate_marks_page_dirty() {
        let store = store(16);
        let rec = store.allocate().unwrap();
        assert_eq!(store.page_version((rec.slot() as usize) >> PAGE_POWER), 0);
    }

    #[test]
    fn ensure_extra_capacity_grows_page_rounded() {
        let store = store(16);
        let before = store.allocated_bytes();
        store.ensure_extra_capacity(SLOTS_PER_PAGE * 3).unwrap();
        let after = store.allocated_bytes();
        assert!(after > before);
        assert_eq!(after % (16 << PAGE_POWER) as u64, 0);
        assert!(store.free_capacity() >= SLOTS_PER_PAGE * 3);
    }

    #[test]
    fn used_bytes_tracks_live_records() {
        let store = store(16);
        let a = store.allocate().unwrap();
        let _b = store.allocate().unwrap();
        assert_eq!(store.used_bytes(), 32);
        store.free(a.slot());
        assert_eq!(store.used_bytes(), 16);
        drop(a);
    }

    #[test]
    fn clear_frees_all_live_slots() {
        let store = store(16);
        let recs: Vec<_> = (0..5).map(|_| store.allocate().unwrap()).collect();
        store.clear();
        assert_eq!(store.used_bytes(), 0);
        assert_eq!(store.live_count(), 0);
        drop(recs);
        store.evict_collected();
        assert_eq!(store.free_stack_size(), 5);
    }

    #[test]
    fn for_all_visits_only_live() {
        let store = store(16);
        let a = store.allocate().unwrap();
        let _b = store.allocate().unwrap();
        store.free(a.slot());
        let mut seen = Vec::new();
        store.for_all(|rec| {
            seen.push(rec.slot());
            false
        });
        assert_eq!(seen, vec![3]);
    }

    #[test]
    fn destroy_is_idempotent() {
        let store = store(16);
        let _rec = store.allocate().unwrap();
        store.destroy();
        store.destroy();
        assert!(store.is_destroyed());
        assert!(store.allocate().is_err());
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn field_read_past_arena_panics() {
        let store = store(16);
        store.get_long(SLOTS_PER_PAGE as u32, 0);
    }

    #[test]
    fn concurrent_alloc_and_recycle_balance() {
        use std::sync::Barrier;
        let reclaimer = Reclaimer::with_interval(Duration::from_secs(3600));
        let store = Arc::new(
            RecordStore::new("Concurrent", RecordLayout::opaque(16), reclaimer).unwrap(),
        );
        let threads = 4;
        let per_thread = 500;
        let barrier = Arc::new(Barrier::new(threads));
        let workers: Vec<_> = (0..threads)
            .map(|_| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    let mut live = Vec::new();
                    for round in 0..per_thread {
                        let rec = store.allocate().unwrap();
                        store.set_int(rec.slot(), 0, round as i32);
                        if round % 3 == 0 {
                            store.free(rec.slot());
                            drop(rec);
                        } else {
                            live.push(rec);
                        }
                        if round % 16 == 0 {
                            store.evict_collected();
                        }
                    }
                    live
                })
            })
            .collect();
        let mut live_all = Vec::new();
        for w in workers {
            live_all.extend(w.join().unwrap());
        }
        store.evict_collected();
        assert_eq!(store.live_count(), live_all.len());
        let slots: std::collections::HashSet<u32> =
            live_all.iter().map(|r| r.slot()).collect();
        assert_eq!(slots.len(), live_all.len(), "no live slot issued twice");
    }
}
