//! # Variable-Length Int Allocator
//!
//! `IntArrayStorage` is a general-purpose free-list allocator over a single
//! arena, measured in i32 words. It backs the open-addressing index
//! structures that sit on top of the record store; the core only promises
//! them this contract: `allocate` / `free` / `reallocate`, bounds-checked
//! `get_int` / `set_int`, capacity assurance, and usage reporting.
//!
//! ## Block Layout
//!
//! Every block carries boundary tags — its size in words, stored both
//! immediately before and immediately after the payload:
//!
//! ```text
//! word:    ref-1      ref .. ref+size-1      ref+size
//!        +--------+------------------------+--------+
//!        |  size  |       payload          |  size  |
//!        +--------+------------------------+--------+
//! ```
//!
//! A reference is the index of the first payload word. Free blocks store
//! the size *negated* in both tags, which is what lets `free` coalesce
//! with physically adjacent free neighbors in O(1) by peeking one word to
//! either side.
//!
//! ## Allocation Strategy
//!
//! - Sizes 3..=16 words are served from per-size intrusive free lists
//!   whose head words live at the front of the arena (word indices
//!   `0..=MAX_SMALL-MIN`). Small freed blocks keep positive tags and are
//!   therefore invisible to coalescing — reuse is exact-fit and O(1).
//! - Larger blocks first try the "largest known free block" hint (exact
//!   fit, or split when the remainder can hold another block), then fall
//!   back to bump allocation at `current`, growing the arena when the
//!   bump bound is reached.
//! - Growth doubles until [`INT_MAX_INCREASE_BYTES`], then advances by
//!   that fixed increment; crossing [`INT_HARD_CAP_BYTES`] is a fatal
//!   allocation error.
//!
//! Freeing the physically last block simply rewinds the bump pointer.
//!
//! ## Concurrency
//!
//! Not internally synchronized. The index structures that own an
//! `IntArrayStorage` mutate it only under their cache's write lock, so
//! growth here frees the superseded arena immediately instead of routing
//! it through the deferred reclaimer.

use eyre::{ensure, Result};
use tracing::debug;

use crate::arena::Arena;
use crate::config::{
    INT_HARD_CAP_BYTES, INT_INITIAL_BYTES, INT_MAX_INCREASE_BYTES, INT_MAX_SMALL_BLOCK,
    INT_MIN_BLOCK,
};

pub struct IntArrayStorage {
    arena: Arena,
    /// Next unallocated word index (bump pointer).
    current: usize,
    /// Words sitting on free lists or in coalesced free blocks.
    total_freed: i64,
    /// Start-boundary word index of the largest known free block. Best
    /// effort: kept current enough that its tag is always negative.
    largest_free: Option<usize>,
}

impl IntArrayStorage {
    pub fn new() -> Result<Self> {
        let arena = Arena::zeroed(INT_INITIAL_BYTES)?;
        Ok(Self {
            arena,
            current: INT_MAX_SMALL_BLOCK - INT_MIN_BLOCK + 1,
            total_freed: 0,
            largest_free: None,
        })
    }

    #[inline]
    fn word(&self, idx: usize) -> i32 {
        self.arena.get_i32(idx << 2)
    }

    #[inline]
    fn set_word(&self, idx: usize, value: i32) {
        self.arena.put_i32(idx << 2, value)
    }

    #[inline]
    fn max_words(&self) -> usize {
        self.arena.len() >> 2
    }

    /// Allocate a block of `size` words and return its reference. The
    /// payload is zeroed.
    pub fn allocate(&mut self, size: usize) -> Result<u32> {
        assert!(size > 0, "int-store allocation of zero words");
        if size <= INT_MAX_SMALL_BLOCK {
            return self.allocate_small(size.max(INT_MIN_BLOCK));
        }
        self.allocate_large(size)
    }

    fn allocate_small(&mut self, size: usize) -> Result<u32> {
        let head_idx = size - INT_MIN_BLOCK;
        let existing = self.word(head_idx);
        if existing == 0 {
            return self.allocate_large(size);
        }
        let existing = existing as usize;
        let next = self.word(existing);
        self.set_word(head_idx, next);
        self.arena.zero_range(existing << 2, size << 2);
        self.total_freed -= (size + 2) as i64;
        Ok(existing as u32)
    }

    fn allocate_large(&mut self, size: usize) -> Result<u32> {
        if let Some(largest) = self.largest_free {
            let free_size = -(self.word(largest) as i64);
            if free_size == size as i64 {
                let result = largest + 1;
                self.set_word(largest, size as i32);
                self.set_word(result + size, size as i32);
                self.total_freed -= (size + 2) as i64;
                self.largest_free = None;
                self.arena.zero_range(result << 2, size << 2);
                return Ok(result as u32);
            } else if free_size > (size + 2) as i64 {
                let result = largest + 1;
                self.set_word(largest, size as i32);
                self.set_word(result + size, size as i32);
                self.total_freed -= (size + 2) as i64;
                let left_over = free_size as usize - size - 2;
                let new_largest = largest + size + 2;
                self.set_word(new_largest, -(left_over as i32));
                self.set_word(new_largest + left_over + 1, -(left_over as i32));
                self.largest_free = Some(new_largest);
                self.arena.zero_range(result << 2, size << 2);
                return Ok(result as u32);
            }
        }
        if self.current + size + 2 > self.max_words() {
            self.grow((size << 2) as u64)?;
        }
        let result = self.current + 1;
        self.set_word(self.current, size as i32);
        self.current += size + 2;
        self.set_word(self.current - 1, size as i32);
        Ok(result as u32)
    }

    fn grow(&mut self, min_extra_bytes: u64) -> Result<()> {
        let old_bytes = self.arena.len() as u64;
        let mut new_bytes = old_bytes;
        while new_bytes - old_bytes < min_extra_bytes {
            if new_bytes < INT_MAX_INCREASE_BYTES as u64 {
                new_bytes <<= 1;
            } else {
                new_bytes += INT_MAX_INCREASE_BYTES as u64;
            }
        }
        ensure!(
            new_bytes <= INT_HARD_CAP_BYTES,
            "int-store growth to {} bytes exceeds the hard cap",
            new_bytes
        );
        let new_arena = Arena::zeroed(new_bytes as usize)?;
        new_arena.copy_from(0, &self.arena, 0, self.current << 2);
        // Single-owner substrate mutated under the index write lock: the
        // superseded arena has no concurrent readers and drops here.
        self.arena = new_arena;
        Ok(())
    }

    /// Return a block to the allocator. The trailing block rewinds the
    /// bump pointer; small blocks go onto their size bucket; large blocks
    /// coalesce with adjacent free neighbors via the boundary tags.
    pub fn free(&mut self, r: u32) {
        let r = r as usize;
        assert!(r > 2 && r < self.current, "int-store free of invalid ref {}", r);
        let size = self.word(r - 1) as usize;
        if r + size + 1 == self.current {
            self.current = r - 1;
            self.arena.zero_range(self.current << 2, (size + 2) << 2);
            return;
        }
        if size <= INT_MAX_SMALL_BLOCK {
            self.free_small(r, size);
            return;
        }
        let left_size = self.word(r - 2);
        let right_size = self.word(r + size + 1);
        let mut start = r - 1;
        let mut end = r + size + 1;
        let mut extra_free = 0usize;
        if left_size < 0 {
            start -= (-left_size) as usize + 2;
            extra_free += 2;
        }
        if right_size < 0 {
            end += (-right_size) as usize + 2;
            extra_free += 2;
        }
        let total_size = end - start - 2;
        self.set_word(start, -(total_size as i32));
        self.set_word(end - 1, -(total_size as i32));
        let current_largest = self
            .largest_free
            .map(|l| -(self.word(l) as i64))
            .unwrap_or(0);
        if total_size as i64 > current_largest {
            self.largest_free = Some(start);
        }
        self.total_freed += (size + extra_free) as i64;
    }

    fn free_small(&mut self, r: usize, size: usize) {
        let head_idx = size - INT_MIN_BLOCK;
        let existing = self.word(head_idx);
        self.set_word(r, existing);
        self.set_word(head_idx, r as i32);
        self.total_freed += (size + 2) as i64;
    }

    /// Resize a block, preferring in-place growth: the trailing block
    /// extends the bump pointer, and a free right neighbor is absorbed.
    /// Otherwise allocates, copies, and frees.
    pub fn reallocate(&mut self, r: u32, new_size: usize) -> Result<u32> {
        let r = r as usize;
        let size = self.word(r - 1) as usize;
        assert!(new_size >= size, "int-store reallocate cannot shrink");
        let delta = new_size - size;
        if r + size + 1 == self.current {
            if delta + self.current < self.max_words() {
                self.set_word(r + size, 0);
                self.current += delta;
                self.set_word(r - 1, new_size as i32);
                self.set_word(r + new_size, new_size as i32);
                return Ok(r as u32);
            }
            return self.realloc_by_copy(r, new_size);
        }
        let right_size = self.word(r + size + 1);
        if right_size < 0 && (-right_size) as usize > delta {
            self.arena.zero_range((r + size) << 2, delta << 2);
            self.set_word(r - 1, new_size as i32);
            self.set_word(r + new_size, new_size as i32);
            let new_right_size = (-right_size) as usize - delta;
            let new_right = r + new_size + 1;
            self.set_word(new_right, -(new_right_size as i32));
            self.set_word(new_right + new_right_size + 1, -(new_right_size as i32));
            if self.largest_free == Some(r + size + 1) {
                self.largest_free = Some(new_right);
            }
            self.total_freed -= delta as i64;
            return Ok(r as u32);
        }
        self.realloc_by_copy(r, new_size)
    }

    fn realloc_by_copy(&mut self, r: usize, new_size: usize) -> Result<u32> {
        let old_len = self.word(r - 1) as usize;
        let new_ref = self.allocate(new_size)? as usize;
        // Disjoint blocks within one arena; grow() during allocate keeps
        // the old block's offset valid in the replacement mapping.
        self.arena
            .copy_from(new_ref << 2, &self.arena, r << 2, old_len << 2);
        self.free(r as u32);
        Ok(new_ref as u32)
    }

    #[inline]
    pub fn length(&self, r: u32) -> usize {
        let r = r as usize;
        assert!(r > 2 && r < self.current, "int-store ref {} out of range", r);
        self.word(r - 1) as usize
    }

    #[inline]
    pub fn get_int(&self, r: u32, pos: usize) -> i32 {
        assert!(pos < self.length(r), "int-store read past block end");
        self.word(r as usize + pos)
    }

    #[inline]
    pub fn set_int(&mut self, r: u32, pos: usize, value: i32) {
        assert!(pos < self.length(r), "int-store write past block end");
        self.set_word(r as usize + pos, value);
    }

    pub fn increment_and_get(&mut self, r: u32, pos: usize, delta: i32) -> i32 {
        let result = self.get_int(r, pos) + delta;
        self.set_word(r as usize + pos, result);
        result
    }

    /// Zero a block's payload.
    pub fn clear(&mut self, r: u32) {
        let len = self.length(r);
        self.arena.zero_range((r as usize) << 2, len << 2);
    }

    pub fn ensure_capacity(&mut self, bytes: u64) -> Result<()> {
        if bytes > self.arena.len() as u64 {
            self.grow(bytes - self.arena.len() as u64)?;
        }
        Ok(())
    }

    /// Heuristic for the owning index to decide whether a compacting
    /// rehash would pay off.
    pub fn is_fragmented(&self) -> bool {
        self.current > 1000 && self.total_freed > (self.current as i64) >> 3
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.arena.len() as u64
    }

    pub fn used_bytes(&self) -> u64 {
        (self.current as u64) << 2
    }

    pub fn report_space_usage(&self, tag: &str) {
        debug!(
            target: "offcache::int_store",
            "{} allocated bytes {} bump pointer {} freed words {} total unused {}",
            tag,
            self.allocated_bytes(),
            self.used_bytes(),
            self.total_freed,
            self.arena.len() as i64 - (self.current as i64) * 4 + self.total_freed * 4
        );
    }
}
