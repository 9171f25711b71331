//! # Page Buffer
//!
//! A `PageBuffer` stages whole pages for one direction of a sync
//! exchange: the master copies modified pages into one under its read
//! lock and streams them out; the replica decodes incoming blocks into
//! fresh buffers and merges them. Buffers are transient — merged or sent,
//! then dropped — except for the initial-sync fast path, where a single
//! incoming buffer's arena is adopted wholesale by the record store.
//!
//! Alongside the raw page bytes a buffer carries, per page: the master's
//! page index, the page version, and a used-slot bitset (one bit per
//! slot) that tells the replica which slots hold records rather than
//! zeroed or reclaimed space.

use std::io::{Read, Write};

use eyre::{ensure, Result, WrapErr};

use crate::arena::Arena;
use crate::config::{PAGE_SLOT_MASK, SLOTS_PER_PAGE, USED_BITSET_BYTES};
use crate::sync::wire;

pub struct PageBuffer {
    page_size_bytes: usize,
    capacity_pages: usize,
    arena: Arena,
    master_page_indices: Vec<u32>,
    master_page_versions: Vec<u64>,
    /// One bit per slot across all capacity pages, LSB first.
    used: Vec<u64>,
}

/// The constituents of a decoded buffer, for arena adoption.
pub struct PageBufferParts {
    pub arena: Arena,
    pub master_page_indices: Vec<u32>,
    pub master_page_versions: Vec<u64>,
    pub used: Vec<u64>,
    pub capacity_pages: usize,
}

impl PageBuffer {
    pub fn new(page_size_bytes: usize, capacity_pages: usize) -> Result<Self> {
        ensure!(capacity_pages > 0, "page buffer needs capacity for at least one page");
        let arena = Arena::zeroed(page_size_bytes * capacity_pages)?;
        Ok(Self {
            page_size_bytes,
            capacity_pages,
            arena,
            master_page_indices: Vec::with_capacity(capacity_pages),
            master_page_versions: Vec::with_capacity(capacity_pages),
            used: vec![0; capacity_pages * SLOTS_PER_PAGE / 64],
        })
    }

    #[inline]
    pub fn used_pages(&self) -> usize {
        self.master_page_indices.len()
    }

    #[inline]
    pub fn capacity_pages(&self) -> usize {
        self.capacity_pages
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.used_pages() == self.capacity_pages
    }

    #[inline]
    pub fn page_size_bytes(&self) -> usize {
        self.page_size_bytes
    }

    #[inline]
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    #[inline]
    pub fn master_page_index(&self, buffer_page: usize) -> u32 {
        self.master_page_indices[buffer_page]
    }

    #[inline]
    pub fn master_page_version(&self, buffer_page: usize) -> u64 {
        self.master_page_versions[buffer_page]
    }

    #[inline]
    pub fn page_offset(&self, buffer_page: usize) -> usize {
        buffer_page * self.page_size_bytes
    }

    /// Append a page copied out of `src`; returns its buffer-page index.
    /// The used bitset for the page starts cleared.
    pub fn copy_page_from(
        &mut self,
        master_page_index: u32,
        version: u64,
        src: &Arena,
        src_offset: usize,
    ) -> usize {
        assert!(!self.is_full(), "page buffer over capacity");
        let buffer_page = self.used_pages();
        self.arena.copy_from(
            self.page_offset(buffer_page),
            src,
            src_offset,
            self.page_size_bytes,
        );
        self.master_page_indices.push(master_page_index);
        self.master_page_versions.push(version);
        self.clear_used(buffer_page);
        buffer_page
    }

    #[inline]
    fn bit_index(buffer_page: usize, slot_in_page: usize) -> (usize, u64) {
        debug_assert!(slot_in_page < SLOTS_PER_PAGE);
        let flat = buffer_page * SLOTS_PER_PAGE + slot_in_page;
        (flat / 64, 1u64 << (flat % 64))
    }

    #[inline]
    pub fn used(&self, buffer_page: usize, slot_in_page: usize) -> bool {
        let (word, mask) = Self::bit_index(buffer_page, slot_in_page);
        self.used[word] & mask != 0
    }

    /// Used bit by flat slot index across the buffer's pages in order.
    #[inline]
    pub fn used_flat(&self, flat_slot: usize) -> bool {
        self.used(flat_slot >> crate::config::PAGE_POWER, flat_slot & PAGE_SLOT_MASK)
    }

    pub fn set_used(&mut self, buffer_page: usize, slot_in_page: usize) {
        let (word, mask) = Self::bit_index(buffer_page, slot_in_page);
        self.used[word] |= mask;
    }

    pub fn clear_used(&mut self, buffer_page: usize) {
        let start = buffer_page * SLOTS_PER_PAGE / 64;
        for word in &mut self.used[start..start + SLOTS_PER_PAGE / 64] {
            *word = 0;
        }
    }

    /// Reset for reuse in the next lock batch.
    pub fn clear(&mut self) {
        self.master_page_indices.clear();
        self.master_page_versions.clear();
        self.used.fill(0);
    }

    /// Write this buffer's pages as one body block. Empty buffers write
    /// nothing — a zero count is the stream terminator and is written by
    /// the caller once.
    pub fn send_pages(&self, out: &mut dyn Write) -> Result<()> {
        if self.used_pages() == 0 {
            return Ok(());
        }
        wire::write_i32(out, self.used_pages() as i32)?;
        for buffer_page in 0..self.used_pages() {
            wire::write_i32(out, self.master_page_indices[buffer_page] as i32)?;
            wire::write_i64(out, self.master_page_versions[buffer_page] as i64)?;
            out.write_all(
                self.arena
                    .slice(self.page_offset(buffer_page), self.page_size_bytes),
            )
            .wrap_err("failed to write page content")?;
            let bits_start = buffer_page * SLOTS_PER_PAGE / 64;
            let mut bitset = [0u8; USED_BITSET_BYTES];
            for (i, word) in self.used[bits_start..bits_start + SLOTS_PER_PAGE / 64]
                .iter()
                .enumerate()
            {
                bitset[i * 8..(i + 1) * 8].copy_from_slice(&word.to_le_bytes());
            }
            out.write_all(&bitset).wrap_err("failed to write used bitset")?;
        }
        Ok(())
    }

    /// Decode one body block of `page_count` pages into a fresh buffer.
    pub fn read_block(
        reader: &mut dyn Read,
        page_size_bytes: usize,
        page_count: usize,
    ) -> Result<Self> {
        let mut buffer = Self::new(page_size_bytes, page_count)?;
        let mut page_bytes = vec![0u8; page_size_bytes];
        for buffer_page in 0..page_count {
            let index = wire::read_i32(reader)? as u32;
            let version = wire::read_i64(reader)? as u64;
            reader
                .read_exact(&mut page_bytes)
                .wrap_err_with(|| format!("sync stream ended inside page {}", index))?;
            buffer
                .arena
                .write_bytes(buffer_page * page_size_bytes, &page_bytes);
            buffer.master_page_indices.push(index);
            buffer.master_page_versions.push(version);
            let mut bitset = [0u8; USED_BITSET_BYTES];
            reader
                .read_exact(&mut bitset)
                .wrap_err_with(|| format!("sync stream ended inside used bitset of page {}", index))?;
            let bits_start = buffer_page * SLOTS_PER_PAGE / 64;
            for i in 0..SLOTS_PER_PAGE / 64 {
                let mut word = [0u8; 8];
                word.copy_from_slice(&bitset[i * 8..(i + 1) * 8]);
                buffer.used[bits_start + i] = u64::from_le_bytes(word);
            }
        }
        Ok(buffer)
    }

    pub fn into_parts(self) -> PageBufferParts {
        PageBufferParts {
            arena: self.arena,
            master_page_indices: self.master_page_indices,
            master_page_versions: self.master_page_versions,
            used: self.used,
            capacity_pages: self.capacity_pages,
        }
    }

    pub fn versions(&self) -> &[u64] {
        &self.master_page_versions
    }

    pub fn indices(&self) -> &[u32] {
        &self.master_page_indices
    }
}
