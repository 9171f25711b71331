//! # Replication Module
//!
//! The master→replica synchronization protocol: the binary wire format,
//! the page staging buffers, the decoded sync result, the string
//! interning/remap layer, the uplink worker pool, and the master service
//! surface.
//!
//! ## Protocol Shape
//!
//! The master keeps a version per 1024-slot page; a replica asks for
//! "everything newer than version V" and receives whole pages. Initial
//! sync is the same request with V = 0. Merging classifies each incoming
//! slot as insert / remove / update / nuke-and-insert against local
//! state (see `store::sync_in`), so one mechanism covers bootstrap and
//! steady-state increments alike.
//!
//! ## Module Organization
//!
//! - `wire`: stream header and framing primitives
//! - `page_buffer`: page staging + used-slot bitsets
//! - `result`: decoded `MasterSyncResult` and string fix-up
//! - `strings`: interning pool and the master→local remap
//! - `service`: `MasterService` trait and the in-process `LocalMaster`
//! - `uplink`: worker pool, cycle scheduling, pause control

pub mod page_buffer;
pub mod result;
pub mod service;
pub mod strings;
pub mod uplink;
pub mod wire;

pub use page_buffer::PageBuffer;
pub use result::MasterSyncResult;
pub use service::{LocalMaster, MasterService};
pub use strings::{StringPool, StringSyncResult};
pub use uplink::{ReplicatedStore, Uplink};
