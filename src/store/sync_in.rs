//! # Replica-Side Merge
//!
//! Applying a decoded [`MasterSyncResult`] to a local record store.
//!
//! ## Initial Sync
//!
//! A virgin store (nothing allocated yet) takes the fast path when
//! exactly one buffer arrived: the buffer's arena is adopted wholesale —
//! no copy — and every used slot gets a wrapper constructed and handed to
//! the cache index. Multiple buffers are validated for contiguous page
//! coverage (a hole is a master/replica protocol desync, fatal for this
//! store's cycle) and bulk-copied into one fresh arena.
//!
//! ## Steady State
//!
//! Every incoming (page, slot) at or below the local high page is
//! bucketed against local state into four disjoint classes:
//!
//! - **insert**: incoming used, local empty (or reclaimable and dead)
//! - **remove**: incoming unused, local live
//! - **update**: both used, bytes differ, same primary key
//! - **nuke-and-insert**: both used, bytes differ, different primary key
//!   (and incoming over a reclaimable-but-reachable local record — the
//!   wrapper someone still holds must be severed, not updated under them)
//!
//! One asymmetric rule: an *unused* incoming slot over a local record
//! that is reclaimable but still reachable back-copies the local bytes
//! into the buffer page, so a later wholesale page copy cannot wipe
//! bytes a reader still holds a wrapper for.
//!
//! Application is **in-place** when every incoming page fits the current
//! arena (record copies write the version byte last, behind a fence
//! bump), or **copy-based** when growth is needed: a fresh arena takes
//! one pass of existing + incoming pages, the buckets reconcile the
//! index, and the old arena retires to the reclaimer. Both paths leave
//! the page version vector consistent with the merged arena before the
//! write lock releases.

use std::time::Instant;

use eyre::{bail, Result};
use tracing::{debug, info};

use crate::config::{COPY_GROWTH_SLACK, PAGE_POWER, PAGE_SLOT_MASK, RESERVED_SLOTS, SLOTS_PER_PAGE};
use crate::arena::Arena;
use crate::store::record_store::{RecordStore, SlotEntry, StoreState};
use crate::store::{RecordRef, SyncIndex};
use crate::sync::result::MasterSyncResult;
use crate::sync::uplink::Uplink;

/// What one merge did, for the cycle log.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncOutcome {
    pub initial_sync: bool,
    pub via_copy: bool,
    pub inserted: usize,
    pub removed: usize,
    pub updated: usize,
    pub replaced: usize,
    pub pages: usize,
}

#[derive(Default)]
struct Buckets {
    insert: Vec<u32>,
    remove: Vec<u32>,
    update: Vec<u32>,
    nuke: Vec<u32>,
}

impl RecordStore {
    /// One full sync exchange against the master: fetch the diff since
    /// our watermark, remap string refs, merge, and stamp the refresh
    /// time. Returns true when the store was destroyed mid-sync and
    /// should leave the rotation.
    pub fn sync_with_master(&self, uplink: &Uplink, index: &dyn SyncIndex) -> Result<bool> {
        if self.is_destroyed() {
            return Ok(true);
        }
        index.set_replication_mode();
        let started = Instant::now();
        let since = self.state.read().max_replicated_page_version;
        let result = uplink.sync_with_master(self.name(), since)?;
        let received_at = Instant::now();
        if self.is_destroyed() {
            info!(target: "offcache::sync", store = self.name(), "stopping sync of destroyed store");
            return Ok(true);
        }
        result.fix_up_string_refs(self.layout(), |r| uplink.map_master_string_ref(r))?;
        let refresh_time = result.last_master_refresh_time;
        let outcome = self.apply_sync_result(result, index)?;
        self.set_last_refresh_time(refresh_time);
        debug!(
            target: "offcache::sync",
            store = self.name(),
            network_ms = received_at.duration_since(started).as_millis() as u64,
            merge_ms = received_at.elapsed().as_millis() as u64,
            pages = outcome.pages,
            initial = outcome.initial_sync,
            via_copy = outcome.via_copy,
            inserted = outcome.inserted,
            removed = outcome.removed,
            updated = outcome.updated,
            replaced = outcome.replaced,
            "cache replication sync finished"
        );
        Ok(false)
    }

    /// Merge a decoded sync result. The watermark advances to exactly
    /// the result's maximum shipped version — but only when anything was
    /// shipped at all.
    pub fn apply_sync_result(
        &self,
        result: MasterSyncResult,
        index: &dyn SyncIndex,
    ) -> Result<SyncOutcome> {
        if result.is_empty() {
            return Ok(SyncOutcome::default());
        }
        eyre::ensure!(
            result.page_size_bytes == self.page_bytes(),
            "sync stream page size {} does not match store '{}' page size {}",
            result.page_size_bytes,
            self.name(),
            self.page_bytes()
        );
        let pages = result.page_count();
        let max_version = result.max_replicated_version;
        let virgin = self.state.read().is_virgin();
        let mut outcome = if virgin {
            if result.buffers.len() == 1 {
                let mut outcome = SyncOutcome { initial_sync: true, ..Default::default() };
                self.adopt_single_buffer(result, index, &mut outcome)?;
                outcome
            } else {
                let mut outcome = SyncOutcome {
                    initial_sync: true,
                    via_copy: true,
                    ..Default::default()
                };
                self.initial_sync_with_copy(&result, index, &mut outcome)?;
                outcome
            }
        } else {
            self.steady_sync(&result, index)?
        };
        outcome.pages = pages;
        self.state.write().max_replicated_page_version = max_version;
        Ok(outcome)
    }

    // --- initial sync -----------------------------------------------------

    /// Exactly one buffer arrived: its arena is adopted wholesale — no
    /// copy, the mapping itself becomes the store's arena.
    fn adopt_single_buffer(
        &self,
        mut result: MasterSyncResult,
        index: &dyn SyncIndex,
        outcome: &mut SyncOutcome,
    ) -> Result<()> {
        check_contiguous_coverage(&result, result.buffers[0].used_pages())?;
        let parts = result.buffers.swap_remove(0).into_parts();
        let data_count = parts.master_page_indices.len() << PAGE_POWER;
        let mut state = self.state.write();
        let old = self.install_arena_locked(&mut state, parts.arena);
        for flat in 0..data_count {
            if parts.used[flat / 64] & (1u64 << (flat % 64)) != 0 {
                self.construct_and_add(&mut state, index, flat);
                outcome.inserted += 1;
            }
        }
        state.current = data_count - 1;
        state.page_versions = parts.master_page_versions;
        drop(state);
        if let Some(old) = old {
            self.reclaimer.retire(old);
        }
        Ok(())
    }

    fn initial_sync_with_copy(
        &self,
        result: &MasterSyncResult,
        index: &dyn SyncIndex,
        outcome: &mut SyncOutcome,
    ) -> Result<()> {
        let page_bytes = self.page_bytes();
        let total_pages: usize = result.buffers.iter().map(|b| b.used_pages()).sum();
        check_contiguous_coverage(result, total_pages)?;
        let fresh = Arena::zeroed(total_pages * page_bytes)?;
        let mut copy_offset = 0usize;
        let mut versions = Vec::with_capacity(total_pages);
        for buffer in &result.buffers {
            let len = buffer.used_pages() * page_bytes;
            fresh.copy_from(copy_offset, buffer.arena(), 0, len);
            copy_offset += len;
            versions.extend_from_slice(buffer.versions());
        }
        let data_count = total_pages << PAGE_POWER;
        let mut state = self.state.write();
        let old = self.install_arena_locked(&mut state, fresh);
        for flat in 0..data_count {
            let page = (flat >> PAGE_POWER) as u32;
            let loc = result
                .locate(page)
                .ok_or_else(|| eyre::eyre!("page {} vanished from sync result", page))?;
            if result.buffers[loc.buffer].used(loc.page, flat & PAGE_SLOT_MASK) {
                self.construct_and_add(&mut state, index, flat);
                outcome.inserted += 1;
            }
        }
        state.current = data_count - 1;
        state.page_versions = versions;
        drop(state);
        if let Some(old) = old {
            self.reclaimer.retire(old);
        }
        Ok(())
    }

    // --- steady state -----------------------------------------------------

    fn steady_sync(&self, result: &MasterSyncResult, index: &dyn SyncIndex) -> Result<SyncOutcome> {
        let (current_max_page, capacity_pages) = {
            let state = self.state.read();
            (state.current >> PAGE_POWER, state.max >> PAGE_POWER)
        };
        let max_page = result
            .max_page()
            .map(|p| (p as usize).max(current_max_page))
            .unwrap_or(current_max_page);
        if max_page >= capacity_pages {
            self.merge_via_copy(result, index, current_max_page, max_page)
        } else {
            self.merge_in_place(result, index, current_max_page, max_page)
        }
    }

    fn merge_in_place(
        &self,
        result: &MasterSyncResult,
        index: &dyn SyncIndex,
        current_max_page: usize,
        max_page: usize,
    ) -> Result<SyncOutcome> {
        let mut outcome = SyncOutcome::default();
        let buckets;
        {
            let state = self.state.read();
            buckets = self.bucket_all_incoming(&state, result, current_max_page);
            // Whole pages past the current high slot land directly in the
            // existing arena; their records are constructed later.
            for page in current_max_page + 1..=max_page {
                let Some(loc) = result.locate(page as u32) else {
                    bail!("missing page {} after current in sync result", page);
                };
                let buffer = &result.buffers[loc.buffer];
                state.arena().copy_from(
                    page * self.page_bytes(),
                    buffer.arena(),
                    buffer.page_offset(loc.page),
                    self.page_bytes(),
                );
            }
        }
        let mut state = self.state.write();
        for &slot in &buckets.insert {
            self.copy_record_from_buffers(&state, result, slot as usize)?;
        }
        for &slot in &buckets.remove {
            let SlotEntry::Live(rec) = &state.shadow[slot as usize] else {
                continue;
            };
            let rec = rec.clone();
            index.sync_record_removed(&rec);
            self.free_locked(&mut state, slot);
        }
        for &slot in &buckets.update {
            if let SlotEntry::Live(rec) = &state.shadow[slot as usize] {
                index.sync_record_removed(&rec.clone());
            }
            self.copy_record_from_buffers(&state, result, slot as usize)?;
        }
        for &slot in &buckets.nuke {
            self.nuke_slot(&mut state, index, slot as usize);
            self.copy_record_from_buffers(&state, result, slot as usize)?;
        }
        state.current = state.current.max(((max_page + 1) << PAGE_POWER) - 1);
        self.update_cache_after_copy(
            &mut state,
            result,
            index,
            &buckets,
            current_max_page,
            max_page,
            &mut outcome,
        )?;
        update_local_page_versions(&mut state, result);
        outcome.removed = buckets.remove.len();
        outcome.updated = buckets.update.len();
        outcome.replaced = buckets.nuke.len();
        Ok(outcome)
    }

    fn merge_via_copy(
        &self,
        result: &MasterSyncResult,
        index: &dyn SyncIndex,
        current_max_page: usize,
        max_page: usize,
    ) -> Result<SyncOutcome> {
        let mut outcome = SyncOutcome { via_copy: true, ..Default::default() };
        let page_bytes = self.page_bytes();
        let new_pages = (((max_page + 1) as f64) * COPY_GROWTH_SLACK) as usize;
        let fresh = Arena::zeroed(new_pages * page_bytes)?;
        let buckets;
        {
            let state = self.state.read();
            buckets = self.bucket_all_incoming(&state, result, current_max_page);
            // One pass: every existing page (preferring the shipped copy)
            // plus every page past the current high slot.
            for page in 0..=current_max_page {
                match result.locate(page as u32) {
                    Some(loc) => {
                        let buffer = &result.buffers[loc.buffer];
                        fresh.copy_from(
                            page * page_bytes,
                            buffer.arena(),
                            buffer.page_offset(loc.page),
                            page_bytes,
                        );
                    }
                    None => {
                        fresh.copy_from(
                            page * page_bytes,
                            state.arena(),
                            page * page_bytes,
                            page_bytes,
                        );
                    }
                }
            }
            for page in current_max_page + 1..=max_page {
                let Some(loc) = result.locate(page as u32) else {
                    bail!("missing page {} after current in sync result", page);
                };
                let buffer = &result.buffers[loc.buffer];
                fresh.copy_from(
                    page * page_bytes,
                    buffer.arena(),
                    buffer.page_offset(loc.page),
                    page_bytes,
                );
            }
        }
        let mut state = self.state.write();
        for &slot in &buckets.remove {
            let SlotEntry::Live(rec) = &state.shadow[slot as usize] else {
                continue;
            };
            let rec = rec.clone();
            index.sync_record_removed(&rec);
            self.free_locked(&mut state, slot);
        }
        for &slot in &buckets.update {
            if let SlotEntry::Live(rec) = &state.shadow[slot as usize] {
                index.sync_record_removed(&rec.clone());
            }
        }
        for &slot in &buckets.nuke {
            self.nuke_slot(&mut state, index, slot as usize);
        }
        let old = self.install_arena_locked(&mut state, fresh);
        if let Some(old) = old {
            self.reclaimer.retire(old);
        }
        state.current = state.current.max(((max_page + 1) << PAGE_POWER) - 1);
        self.update_cache_after_copy(
            &mut state,
            result,
            index,
            &buckets,
            current_max_page,
            max_page,
            &mut outcome,
        )?;
        update_local_page_versions(&mut state, result);
        outcome.removed = buckets.remove.len();
        outcome.updated = buckets.update.len();
        outcome.replaced = buckets.nuke.len();
        Ok(outcome)
    }

    /// Re-add updates, construct replacements and inserts, and construct
    /// everything used in the pages past the old high slot.
    #[allow(clippy::too_many_arguments)]
    fn update_cache_after_copy(
        &self,
        state: &mut StoreState,
        result: &MasterSyncResult,
        index: &dyn SyncIndex,
        buckets: &Buckets,
        current_max_page: usize,
        max_page: usize,
        outcome: &mut SyncOutcome,
    ) -> Result<()> {
        for &slot in &buckets.update {
            if let SlotEntry::Live(rec) = &state.shadow[slot as usize] {
                index.sync_record_added(rec.clone());
            }
        }
        for &slot in &buckets.nuke {
            self.construct_and_add(state, index, slot as usize);
        }
        for &slot in &buckets.insert {
            self.construct_and_add(state, index, slot as usize);
            outcome.inserted += 1;
        }
        for page in current_max_page + 1..=max_page {
            let Some(loc) = result.locate(page as u32) else {
                bail!("missing page {} after current in sync result", page);
            };
            let buffer = &result.buffers[loc.buffer];
            for slot_in_page in 0..SLOTS_PER_PAGE {
                if buffer.used(loc.page, slot_in_page) {
                    self.construct_and_add(state, index, (page << PAGE_POWER) + slot_in_page);
                    outcome.inserted += 1;
                }
            }
        }
        Ok(())
    }

    /// Classify every incoming slot of pages at or below the local high
    /// page. Runs under the read lock; the sync thread is the only
    /// writer on a replica store.
    fn bucket_all_incoming(
        &self,
        state: &StoreState,
        result: &MasterSyncResult,
        current_max_page: usize,
    ) -> Buckets {
        let mut buckets = Buckets::default();
        let stride = self.stride();
        for buffer in &result.buffers {
            for buffer_page in 0..buffer.used_pages() {
                let page = buffer.master_page_index(buffer_page) as usize;
                if page > current_max_page {
                    continue;
                }
                for slot_in_page in 0..SLOTS_PER_PAGE {
                    let flat = (page << PAGE_POWER) + slot_in_page;
                    if flat < RESERVED_SLOTS {
                        continue;
                    }
                    let incoming_used = buffer.used(buffer_page, slot_in_page);
                    let incoming_off = buffer.page_offset(buffer_page) + slot_in_page * stride;
                    match (&state.shadow[flat], incoming_used) {
                        (SlotEntry::Empty, true) => buckets.insert.push(flat as u32),
                        (SlotEntry::Empty, false) => {}
                        (SlotEntry::Reclaimable(w), true) => {
                            if w.upgrade().is_none() {
                                buckets.insert.push(flat as u32);
                            } else {
                                // A reachable wrapper with a different fate
                                // than the master's record: treat as a pk
                                // mismatch.
                                buckets.nuke.push(flat as u32);
                            }
                        }
                        (SlotEntry::Reclaimable(w), false) => {
                            if w.upgrade().is_some() {
                                // Keep the reachable record's bytes ahead of
                                // any wholesale copy of this buffer page.
                                buffer.arena().copy_from(
                                    incoming_off,
                                    state.arena(),
                                    flat * stride,
                                    stride,
                                );
                            }
                        }
                        (SlotEntry::Live(_), false) => buckets.remove.push(flat as u32),
                        (SlotEntry::Live(_), true) => {
                            if state.arena().bytes_differ(
                                flat * stride,
                                buffer.arena(),
                                incoming_off,
                                stride,
                            ) {
                                if self.layout().pk_equal(
                                    state.arena(),
                                    flat * stride,
                                    buffer.arena(),
                                    incoming_off,
                                ) {
                                    buckets.update.push(flat as u32);
                                } else {
                                    buckets.nuke.push(flat as u32);
                                }
                            }
                        }
                    }
                }
            }
        }
        buckets
    }

    /// Copy one record's bytes from its incoming page, version byte last
    /// behind a fence bump so a lock-free reader cannot see a new
    /// version over old bytes.
    fn copy_record_from_buffers(
        &self,
        state: &StoreState,
        result: &MasterSyncResult,
        slot: usize,
    ) -> Result<()> {
        let stride = self.stride();
        let page = (slot >> PAGE_POWER) as u32;
        let Some(loc) = result.locate(page) else {
            bail!("slot {} bucketed from a page missing in the sync result", slot);
        };
        let buffer = &result.buffers[loc.buffer];
        let src = buffer.page_offset(loc.page) + (slot & PAGE_SLOT_MASK) * stride;
        let dst = slot * stride;
        state
            .arena()
            .copy_from(dst + 1, buffer.arena(), src + 1, stride - 1);
        self.bump_fence();
        state.arena().put_u8(dst, buffer.arena().get_u8(src));
        Ok(())
    }

    /// Evict whatever occupies the slot ahead of a replacement record:
    /// live records leave the index, reachable wrappers are severed from
    /// the slot so their eventual drop cannot recycle it.
    fn nuke_slot(&self, state: &mut StoreState, index: &dyn SyncIndex, slot: usize) {
        match std::mem::replace(&mut state.shadow[slot], SlotEntry::Empty) {
            SlotEntry::Live(rec) => {
                index.sync_record_removed(&rec);
                rec.detach();
            }
            SlotEntry::Reclaimable(w) => {
                if let Some(rec) = w.upgrade() {
                    rec.detach();
                }
                self.registry.remove(slot as u32);
            }
            SlotEntry::Empty => {}
        }
    }

    fn construct_and_add(&self, state: &mut StoreState, index: &dyn SyncIndex, slot: usize) {
        let rec = RecordRef::new(slot as u32, self.registry.dead_queue());
        state.shadow[slot] = SlotEntry::Live(rec.clone());
        index.sync_record_added(rec);
        if state.current < slot {
            state.current = slot;
        }
    }
}

fn update_local_page_versions(state: &mut StoreState, result: &MasterSyncResult) {
    for buffer in &result.buffers {
        for buffer_page in 0..buffer.used_pages() {
            state.set_page_version(
                buffer.master_page_index(buffer_page) as usize,
                buffer.master_page_version(buffer_page),
            );
        }
    }
}

fn check_contiguous_coverage(result: &MasterSyncResult, total_pages: usize) -> Result<()> {
    for page in 0..total_pages {
        if result.locate(page as u32).is_none() {
            let layout: Vec<Vec<u32>> = result.buffers.iter().map(|b| b.indices().to_vec()).collect();
            tracing::error!(
                target: "offcache::sync",
                page,
                buffers = ?layout,
                "missing page in initial sync"
            );
            bail!("initial sync stream is missing page {}", page);
        }
    }
    let mut copied = 0usize;
    for buffer in &result.buffers {
        if buffer.used_pages() > 0 && buffer.master_page_index(0) as usize != copied {
            bail!(
                "initial sync buffers are not contiguous at page {}",
                buffer.master_page_index(0)
            );
        }
        copied += buffer.used_pages();
    }
    Ok(())
}
