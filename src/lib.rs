//! # offcache - Off-Heap Object Cache Engine
//!
//! offcache stores business-object records outside the managed heap,
//! indexes them for fast lookup through a narrow allocator contract, and
//! keeps a fleet of replica processes synchronized with a single master's
//! copy of the data without going through a database.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │      Business objects / index structures       │
//! │  (external: extractors, hash indexes, queries) │
//! ├───────────────────────────────────────────────┤
//! │   RecordStore          │   IntArrayStorage     │
//! │   fixed-stride slots,  │   boundary-tag int    │
//! │   free list, page      │   allocator for the   │
//! │   versions             │   index substrate     │
//! ├────────────┬───────────┴───────────────────────┤
//! │ WeakRegistry│        Replication (sync)         │
//! │ lock-free   │  wire format · page buffers ·     │
//! │ weak-handle │  master diff · replica merge ·    │
//! │ set         │  uplink workers · string remap    │
//! ├────────────┴───────────────────────────────────┤
//! │        Reclaimer (epoch-based deferred free)    │
//! ├────────────────────────────────────────────────┤
//! │        Arena (anonymous-mapped raw memory)      │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! ## Data Flow
//!
//! Business code allocates and frees slots in a [`store::RecordStore`];
//! freed slots park a weak handle in the store's registry, and the
//! wrapper's eventual drop feeds the collection queue that returns slots
//! to the free list. Arena growth retires the old mapping to the
//! [`reclaim::Reclaimer`], which unmaps it only once every lock-free
//! reader has moved past it.
//!
//! On the master, each store stamps per-page versions lazily during sync
//! scans; the [`sync::Uplink`] on a replica asks for every page newer
//! than its watermark and merges the result in place or through a fresh,
//! larger arena.
//!
//! ## Quick Start
//!
//! ```ignore
//! use offcache::reclaim::Reclaimer;
//! use offcache::store::{RecordLayout, RecordStore};
//!
//! let reclaimer = Reclaimer::start();
//! let store = RecordStore::new("Order", RecordLayout::opaque(64), reclaimer)?;
//!
//! let order = store.allocate()?;
//! store.set_long(order.slot(), 0, 42);   // order id
//! store.set_int(order.slot(), 8, 7);     // quantity
//! store.mark_dirty(order.slot());
//! ```
//!
//! ## Scope
//!
//! The hash indexes built atop [`arena::IntArrayStorage`], the attribute
//! extractor framework, bitemporal query semantics, and any SQL/ORM
//! surface are external collaborators — they consume the allocator and
//! layout contracts defined here and are not part of this crate.

pub mod arena;
pub mod config;
pub mod reclaim;
pub mod registry;
pub mod store;
pub mod sync;

pub use arena::{Arena, IntArrayStorage};
pub use reclaim::Reclaimer;
pub use registry::WeakRegistry;
pub use store::{Field, FieldKind, RecordLayout, RecordRef, RecordStore, SyncIndex};
pub use sync::{LocalMaster, MasterService, ReplicatedStore, StringPool, Uplink};
