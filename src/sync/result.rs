//! # Master Sync Result
//!
//! The replica-side decoding of one sync response: the received page
//! buffers, a map from master page index to its location among them, and
//! the high-water version mark the replica advances to after merging.
//! Built per exchange and destroyed after the merge.

use std::io::Read;

use eyre::{ensure, Result};
use hashbrown::HashMap;

use crate::config::SLOTS_PER_PAGE;
use crate::store::RecordLayout;
use crate::sync::page_buffer::PageBuffer;
use crate::sync::wire;

#[derive(Debug, Clone, Copy)]
pub struct PageLoc {
    pub buffer: usize,
    pub page: usize,
}

pub struct MasterSyncResult {
    pub last_master_refresh_time: i64,
    pub page_size_bytes: usize,
    pub page_count_estimate: i32,
    pub buffers: Vec<PageBuffer>,
    pub page_location_map: HashMap<u32, PageLoc>,
    pub max_replicated_version: u64,
}

impl MasterSyncResult {
    /// Decode a whole response stream.
    pub fn read_from(reader: &mut dyn Read) -> Result<Self> {
        let header = wire::read_header(reader)?;
        let page_size = header.page_size_bytes;
        ensure!(
            page_size > 0 && page_size % SLOTS_PER_PAGE as i64 == 0,
            "sync stream page size {} is not a positive slot multiple",
            page_size
        );
        let page_size_bytes = page_size as usize;
        let mut result = Self {
            last_master_refresh_time: header.last_refresh_time,
            page_size_bytes,
            page_count_estimate: header.page_count_estimate,
            buffers: Vec::new(),
            page_location_map: HashMap::new(),
            max_replicated_version: 0,
        };
        loop {
            let count = wire::read_i32(reader)?;
            if count == 0 {
                break;
            }
            ensure!(count > 0, "negative page count {} in sync stream", count);
            let buffer = PageBuffer::read_block(reader, page_size_bytes, count as usize)?;
            let buffer_pos = result.buffers.len();
            for page in 0..buffer.used_pages() {
                result.page_location_map.insert(
                    buffer.master_page_index(page),
                    PageLoc { buffer: buffer_pos, page },
                );
                result.max_replicated_version =
                    result.max_replicated_version.max(buffer.master_page_version(page));
            }
            result.buffers.push(buffer);
        }
        Ok(result)
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn page_count(&self) -> usize {
        self.page_location_map.len()
    }

    pub fn locate(&self, master_page: u32) -> Option<PageLoc> {
        self.page_location_map.get(&master_page).copied()
    }

    /// Highest master page index shipped, if any.
    pub fn max_page(&self) -> Option<u32> {
        self.page_location_map.keys().copied().max()
    }

    /// Rewrite every string-reference field of every used incoming slot
    /// from master refs to local refs.
    pub fn fix_up_string_refs(
        &self,
        layout: &RecordLayout,
        mut map_ref: impl FnMut(u32) -> Result<u32>,
    ) -> Result<()> {
        let offsets = layout.string_field_offsets();
        if offsets.is_empty() {
            return Ok(());
        }
        let stride = layout.stride();
        for buffer in &self.buffers {
            for page in 0..buffer.used_pages() {
                let page_base = buffer.page_offset(page);
                for slot in 0..SLOTS_PER_PAGE {
                    if !buffer.used(page, slot) {
                        continue;
                    }
                    let record_base = page_base + slot * stride;
                    for &off in offsets {
                        let master_ref = buffer.arena().get_u32(record_base + off as usize);
                        let local_ref = map_ref(master_ref)?;
                        if local_ref != master_ref {
                            buffer.arena().put_u32(record_base + off as usize, local_ref);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::sync::wire::SyncHeader;

    fn encoded_stream(pages: &[(u32, u64)]) -> Vec<u8> {
        let stride = 8usize;
        let page_size = stride * SLOTS_PER_PAGE;
        let src = Arena::zeroed(page_size).unwrap();
        let mut out = Vec::new();
        wire::write_header(
            &mut out,
            &SyncHeader {
                last_refresh_time: 42,
                page_size_bytes: page_size as i64,
                page_count_estimate: pages.len() as i32,
            },
        )
        .unwrap();
        let mut buffer = PageBuffer::new(page_size, pages.len().max(1)).unwrap();
        for &(idx, version) in pages {
            let bp = buffer.copy_page_from(idx, version, &src, 0);
            buffer.set_used(bp, 0);
        }
        buffer.send_pages(&mut out).unwrap();
        wire::write_i32(&mut out, 0).unwrap();
        out
    }

    #[test]
    fn decodes_pages_and_watermark() {
        let stream = encoded_stream(&[(0, 3), (4, 9), (2, 5)]);
        let result = MasterSyncResult::read_from(&mut &stream[..]).unwrap();
        assert_eq!(result.last_master_refresh_time, 42);
        assert_eq!(result.page_count(), 3);
        assert_eq!(result.max_replicated_version, 9);
        assert_eq!(result.max_page(), Some(4));
        let loc = result.locate(4).unwrap();
        assert_eq!(result.buffers[loc.buffer].master_page_version(loc.page), 9);
        assert!(result.locate(1).is_none());
    }

    #[test]
    fn empty_stream_is_empty_result() {
        let stream = encoded_stream(&[]);
        let result = MasterSyncResult::read_from(&mut &stream[..]).unwrap();
        assert!(result.is_empty());
        assert_eq!(result.max_replicated_version, 0);
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let stream = encoded_stream(&[(0, 1)]);
        assert!(MasterSyncResult::read_from(&mut &stream[..stream.len() - 40]).is_err());
    }
}
