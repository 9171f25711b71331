//! # Master-Side Sync Serialization
//!
//! Producing one sync response: scan the page version vector, lazily
//! stamping dirty pages with a fresh epoch, select every page newer than
//! the replica's watermark, and stream them out.
//!
//! ## Lazy Stamping
//!
//! A mutated page sits at version 0 ("dirty, not yet stamped") until a
//! sync scan reaches it. The scan runs under an upgradable read lock and
//! takes the write side exactly once per scan to stamp all dirty pages
//! with the next epoch; `parking_lot`'s upgrade is atomic — the lock is
//! never released in between — so readers that slipped in meanwhile saw
//! either the old state or the stamped one, never a torn scan.
//!
//! ## Small Diffs vs Batched Streaming
//!
//! Up to [`MAX_PAGES_PER_LOCK_BATCH`] pages are copied into one buffer
//! under the scan's lock and streamed after release. Larger diffs stream
//! in batches of that size, re-acquiring the read lock per batch and
//! re-validating every selected page's version first: a page that went
//! dirty (version 0) or advanced past the scan-time maximum since
//! selection restarts the scan, merging the still-unsent selection with
//! the fresh one — no page ships with an undetected newer version left
//! behind.

use std::io::Write;

use eyre::Result;
use hashbrown::HashSet;
use parking_lot::{RwLockUpgradableReadGuard, RwLockWriteGuard};

use crate::config::{MAX_PAGES_PER_LOCK_BATCH, PAGE_POWER, SLOTS_PER_PAGE};
use crate::store::record_store::{RecordStore, StoreState};
use crate::sync::page_buffer::PageBuffer;
use crate::sync::wire::{self, SyncHeader};

impl RecordStore {
    /// Serialize everything newer than `since_version` onto `out`.
    pub fn serialize_sync(&self, out: &mut dyn Write, since_version: u64) -> Result<()> {
        let mut selection = Selection::default();
        let small_buffer = self.with_stamped_read(|state| -> Result<Option<PageBuffer>> {
            selection = select_pages(state, since_version);
            if selection.pages.is_empty() || selection.pages.len() > MAX_PAGES_PER_LOCK_BATCH {
                return Ok(None);
            }
            let mut buffer = PageBuffer::new(self.page_bytes(), selection.pages.len())?;
            for &page in &selection.pages {
                self.copy_page_into(state, &mut buffer, page);
            }
            Ok(Some(buffer))
        })?;

        wire::write_header(
            out,
            &SyncHeader {
                last_refresh_time: self.last_refresh_time(),
                page_size_bytes: self.page_bytes() as i64,
                page_count_estimate: selection.pages.len() as i32,
            },
        )?;
        if let Some(buffer) = small_buffer {
            buffer.send_pages(out)?;
            wire::write_i32(out, 0)?;
            return Ok(());
        }
        self.send_pages_in_batches(out, selection)
    }

    /// Run `f` under a read view whose version vector carries no zeros:
    /// if any page is dirty the lock is upgraded once, all dirty pages
    /// are stamped with the next epoch, and the lock downgrades back.
    fn with_stamped_read<R>(&self, f: impl FnOnce(&StoreState) -> R) -> R {
        let guard = self.state.upgradable_read();
        if guard.page_versions.iter().any(|v| *v == 0) {
            let mut writer = RwLockUpgradableReadGuard::upgrade(guard);
            writer.current_page_version += 1;
            let epoch = writer.current_page_version;
            for version in writer.page_versions.iter_mut() {
                if *version == 0 {
                    *version = epoch;
                }
            }
            let guard = RwLockWriteGuard::downgrade_to_upgradable(writer);
            f(&guard)
        } else {
            f(&guard)
        }
    }

    /// Stream a large diff in lock batches with stale-version restarts.
    fn send_pages_in_batches(&self, out: &mut dyn Write, mut selection: Selection) -> Result<()> {
        let mut buffer = PageBuffer::new(self.page_bytes(), MAX_PAGES_PER_LOCK_BATCH)?;
        let mut offset = 0usize;
        while offset < selection.pages.len() {
            let mut restart = false;
            {
                let state = self.state.read();
                let end = (selection.pages.len() - offset).min(MAX_PAGES_PER_LOCK_BATCH);
                for i in 0..end {
                    let page = selection.pages[offset + i] as usize;
                    let version = state.page_versions.get(page).copied().unwrap_or(0);
                    if version == 0 || version > selection.max_version {
                        restart = true;
                        break;
                    }
                }
                if !restart {
                    buffer.clear();
                    for i in 0..end {
                        self.copy_page_into(&state, &mut buffer, selection.pages[offset + i]);
                    }
                    offset += end;
                }
            }
            if restart {
                // Merge whatever is still unsent with a fresh scan above
                // the old maximum, and start the batch walk over.
                let mut merged: HashSet<u32> =
                    selection.pages[offset..].iter().copied().collect();
                let rescan =
                    self.with_stamped_read(|state| select_pages(state, selection.max_version));
                merged.extend(rescan.pages.iter().copied());
                let mut pages: Vec<u32> = merged.into_iter().collect();
                pages.sort_unstable();
                selection = Selection {
                    pages,
                    max_version: rescan.max_version.max(selection.max_version),
                };
                offset = 0;
            } else {
                buffer.send_pages(out)?;
            }
        }
        wire::write_i32(out, 0)?;
        Ok(())
    }

    /// Copy one page plus its used-slot bitset into the buffer. Caller
    /// holds at least the read lock.
    fn copy_page_into(&self, state: &StoreState, buffer: &mut PageBuffer, page: u32) {
        let page_bytes = self.page_bytes();
        let version = state.page_versions[page as usize];
        let buffer_page =
            buffer.copy_page_from(page, version, state.arena(), page as usize * page_bytes);
        let first_slot = (page as usize) << PAGE_POWER;
        for slot_in_page in 0..SLOTS_PER_PAGE {
            let live = state
                .shadow
                .get(first_slot + slot_in_page)
                .map(|s| s.is_live())
                .unwrap_or(false);
            if live {
                buffer.set_used(buffer_page, slot_in_page);
            }
        }
    }
}

#[derive(Default)]
struct Selection {
    pages: Vec<u32>,
    /// Maximum version across *all* pages at scan time, sent or not.
    max_version: u64,
}

fn select_pages(state: &StoreState, since_version: u64) -> Selection {
    let mut selection = Selection::default();
    for (page, &version) in state.page_versions.iter().enumerate() {
        if version > since_version {
            selection.pages.push(page as u32);
        }
        selection.max_version = selection.max_version.max(version);
    }
    selection
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reclaim::Reclaimer;
    use crate::store::RecordLayout;
    use crate::sync::result::MasterSyncResult;
    use std::time::Duration;

    fn master(stride: usize) -> RecordStore {
        let reclaimer = Reclaimer::with_interval(Duration::from_secs(3600));
        RecordStore::new("Master", RecordLayout::opaque(stride), reclaimer).unwrap()
    }

    fn sync_result(store: &RecordStore, since: u64) -> MasterSyncResult {
        let mut out = Vec::new();
        store.serialize_sync(&mut out, since).unwrap();
        MasterSyncResult::read_from(&mut &out[..]).unwrap()
    }

    #[test]
    fn empty_store_ships_nothing() {
        let store = master(16);
        let result = sync_result(&store, 0);
        assert!(result.is_empty());
    }

    #[test]
    fn dirty_pages_are_stamped_and_shipped() {
        let store = master(16);
        let rec = store.allocate().unwrap();
        store.set_int(rec.slot(), 0, 99);
        assert_eq!(store.page_version(0), 0, "dirty until scanned");
        let result = sync_result(&store, 0);
        assert_eq!(result.page_count(), 1);
        assert_eq!(store.page_version(0), 1, "stamped with the first epoch");
        assert_eq!(result.max_replicated_version, 1);
        let loc = result.locate(0).unwrap();
        let buffer = &result.buffers[loc.buffer];
        assert!(buffer.used(loc.page, rec.slot() as usize));
        assert!(!buffer.used(loc.page, 0));
        assert_eq!(
            buffer.arena().get_i32(rec.slot() as usize * 16),
            99
        );
    }

    #[test]
    fn watermark_filters_unchanged_pages() {
        // Master ends with pages {0: v1, 1: v2}; a replica at watermark
        // v1 is shipped only page 1 and advances to v2.
        let store = master(16);
        let mut recs = Vec::new();
        let mut in_page_one = 0;
        while in_page_one < 512 {
            let rec = store.allocate().unwrap();
            if (rec.slot() as usize) >> PAGE_POWER == 1 {
                in_page_one += 1;
            }
            recs.push(rec);
        }
        let first = sync_result(&store, 0);
        assert_eq!(first.page_count(), 2);
        assert_eq!(store.page_version(0), 1);
        assert_eq!(store.page_version(1), 1);

        let touched = recs.last().unwrap().slot();
        store.set_int(touched, 0, 7);
        store.mark_dirty(touched);

        let result = sync_result(&store, 1);
        assert_eq!(store.page_version(0), 1);
        assert_eq!(store.page_version(1), 2);
        assert_eq!(result.page_count(), 1, "only the redirtied page ships");
        assert!(result.locate(1).is_some());
        assert!(result.locate(0).is_none());
        assert_eq!(result.max_replicated_version, 2);
    }

    #[test]
    fn unchanged_master_ships_empty_after_first_sync() {
        let store = master(16);
        let _rec = store.allocate().unwrap();
        let first = sync_result(&store, 0);
        assert_eq!(first.page_count(), 1);
        let second = sync_result(&store, first.max_replicated_version);
        assert!(second.is_empty());
    }

    #[test]
    fn large_diff_streams_in_batches() {
        let store = master(16);
        store
            .ensure_extra_capacity(SLOTS_PER_PAGE * 40)
            .unwrap();
        let mut recs = Vec::new();
        for _ in 0..SLOTS_PER_PAGE * 30 {
            recs.push(store.allocate().unwrap());
        }
        let result = sync_result(&store, 0);
        assert!(result.page_count() > MAX_PAGES_PER_LOCK_BATCH);
        assert!(result.buffers.len() > 1, "batched into multiple blocks");
        for page in 0..result.page_count() as u32 {
            assert!(result.locate(page).is_some(), "page {} missing", page);
        }
    }
}
