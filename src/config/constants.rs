//! # offcache Configuration Constants
//!
//! This module centralizes all configuration constants, grouping
//! interdependent values together and documenting their relationships.
//! Constants that depend on each other are co-located to prevent mismatch
//! bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_POWER (10)
//!       │
//!       ├─> SLOTS_PER_PAGE (derived: 1 << PAGE_POWER = 1024 slots)
//!       │     Replication granularity: one page version per 1024 slots.
//!       │
//!       ├─> PAGE_SLOT_MASK (derived: SLOTS_PER_PAGE - 1)
//!       │
//!       ├─> USED_BITSET_BYTES (derived: SLOTS_PER_PAGE / 8)
//!       │     Wire-format size of the per-page used-slot bitset.
//!       │
//!       └─> MAX_INCREASE_PAGES (10)
//!             Arena growth doubles until stride << (PAGE_POWER + 10)
//!             bytes, then grows by that fixed increment.
//!
//! RESERVED_SLOTS (2)
//!       │
//!       └─> Slots 0 and 1 are never allocated; their first byte holds
//!           TOMBSTONE so accidental zero-index reads are detectable.
//!           The free-list head value 0 doubles as the end-of-list marker,
//!           which is only sound because slot 0 can never be on the list.
//!
//! MAX_PAGES_PER_LOCK_BATCH (10)
//!       │
//!       └─> Master-side sync copies at most this many pages per read-lock
//!           acquisition; larger diffs stream in batches with version
//!           re-validation between batches.
//!
//! REGISTRY_DEFAULT_CAPACITY (32)
//!       │
//!       ├─> Must be a power of two; resize doubles up to
//!       │   REGISTRY_MAX_CAPACITY.
//!       │
//!       └─> STRIPED_SIZE_THRESHOLD (4096)
//!             Tables at or above this capacity shard their size counter
//!             across SIZE_STRIPES cache-padded stripes.
//! ```
//!
//! ## Critical Invariants
//!
//! Enforced by compile-time assertions below:
//!
//! 1. `SLOTS_PER_PAGE` is a power of two (page math uses shifts/masks)
//! 2. `SLOTS_PER_PAGE % 8 == 0` (used bitset packs into whole bytes)
//! 3. `REGISTRY_DEFAULT_CAPACITY` is a power of two (bucket masking)
//! 4. `INT_MIN_BLOCK <= INT_MAX_SMALL_BLOCK` (small bucket range is valid)

use std::time::Duration;

/// log2 of the number of slots per page.
pub const PAGE_POWER: u32 = 10;

/// Contiguous slots sharing one replication version.
pub const SLOTS_PER_PAGE: usize = 1 << PAGE_POWER;

/// Mask extracting the slot-within-page component of a slot index.
pub const PAGE_SLOT_MASK: usize = SLOTS_PER_PAGE - 1;

/// Bytes per page in the wire-format used-slot bitset (one bit per slot).
pub const USED_BITSET_BYTES: usize = SLOTS_PER_PAGE / 8;

/// Slot indices below this are reserved sentinels, never allocated.
pub const RESERVED_SLOTS: usize = 2;

/// Marker byte written into the reserved sentinel slots.
pub const TOMBSTONE: u8 = 0xFE;

/// Arena growth doubles until `stride << (PAGE_POWER + MAX_INCREASE_PAGES)`
/// bytes (1024 pages' worth), then grows by that fixed increment.
pub const MAX_INCREASE_PAGES: u32 = 10;

/// Hard ceiling on a single record-store arena. Requests beyond this are a
/// fatal allocation error, not a recoverable one.
pub const STORE_HARD_CAP_BYTES: u64 = 1 << 40;

/// Pages copied per read-lock acquisition on the master sync path.
pub const MAX_PAGES_PER_LOCK_BATCH: usize = 10;

/// Copy-based merge allocates `(max_page + 1) * COPY_GROWTH_SLACK` pages.
pub const COPY_GROWTH_SLACK: f64 = 1.1;

// --- int-array storage (index substrate) ---

/// Smallest allocatable block in i32 words; requests below are rounded up.
pub const INT_MIN_BLOCK: usize = 3;

/// Largest block served from the small-size free-list buckets.
pub const INT_MAX_SMALL_BLOCK: usize = 16;

/// Initial int-store arena size in bytes (2 KiB).
pub const INT_INITIAL_BYTES: usize = 1 << 11;

/// Int-store growth doubles until this, then grows by this increment.
pub const INT_MAX_INCREASE_BYTES: usize = 1 << 26;

/// Hard ceiling on the int-store arena (8 GiB).
pub const INT_HARD_CAP_BYTES: u64 = 1 << 33;

// --- weak registry ---

/// Initial bucket count. Must be a power of two.
pub const REGISTRY_DEFAULT_CAPACITY: usize = 32;

/// Largest table the registry will grow to.
pub const REGISTRY_MAX_CAPACITY: usize = 1 << 30;

/// Tables at or above this capacity stripe their size counter.
pub const STRIPED_SIZE_THRESHOLD: usize = 4096;

/// Number of striped size counters (plus one residual counter).
pub const SIZE_STRIPES: usize = 7;

/// Buckets claimed per helper step during a cooperative resize.
pub const TRANSFER_STRIDE: usize = 16;

// --- deferred reclaim ---

/// Default sweep period for the background reclaimer. Retired arenas
/// additionally dwell for at least half of this before being freed.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

// --- replication uplink ---

/// Default gap between steady-state sync cycle starts.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Default number of uplink worker threads.
pub const DEFAULT_SYNC_THREADS: usize = 2;

/// Slack factor applied when growing the master→local string remap table.
pub const STRING_MAP_SLACK: f64 = 1.1;

const _: () = assert!(SLOTS_PER_PAGE.is_power_of_two());
const _: () = assert!(SLOTS_PER_PAGE % 8 == 0);
const _: () = assert!(REGISTRY_DEFAULT_CAPACITY.is_power_of_two());
const _: () = assert!(INT_MIN_BLOCK <= INT_MAX_SMALL_BLOCK);
const _: () = assert!(RESERVED_SLOTS >= 1);
