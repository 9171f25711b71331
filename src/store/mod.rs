//! # Record Store Module
//!
//! The off-heap record store and its satellites: the on-heap record
//! wrappers ([`RecordRef`]), the layout seam the external extractor
//! framework plugs into ([`RecordLayout`]), and the store's two halves
//! of the replication protocol (master-side diff serialization,
//! replica-side merge).
//!
//! ## Module Organization
//!
//! - `record_store`: slot lifecycle, free list, growth, field access
//! - `handle`: `RecordRef` / `WeakRecordRef` wrappers and the drop →
//!   collection-queue trigger
//! - `layout`: stride, primary-key fields, string-field offsets
//! - `sync_out`: page-version scan, lazy stamping, diff streaming
//! - `sync_in`: initial sync, four-way merge bucketing, in-place and
//!   copy-based application

mod handle;
mod layout;
mod record_store;
mod sync_in;
mod sync_out;

pub use handle::{RecordRef, WeakRecordRef};
pub use layout::{Field, FieldKind, RecordLayout};
pub use record_store::RecordStore;
pub use sync_in::SyncOutcome;

/// Replica-side cache index callbacks. The merge reports every record it
/// materializes or evicts so the external index structures stay
/// consistent with the arena.
pub trait SyncIndex: Send + Sync {
    /// Called once per sync exchange before any mutation.
    fn set_replication_mode(&self) {}

    /// A record became live at its slot (insert, update re-add, or
    /// replacement).
    fn sync_record_added(&self, record: RecordRef);

    /// A record left its slot (remove, update removal, or replacement).
    fn sync_record_removed(&self, record: &RecordRef);
}
