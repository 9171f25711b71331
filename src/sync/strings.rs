//! # String Interning and Replication
//!
//! Records store strings as u32 references into a per-process interning
//! pool (0 is the null string). Master and replica each own a pool, and
//! the refs a master assigns mean nothing on a replica — the uplink keeps
//! a master→local remap table and rewrites every string field of every
//! incoming record before the merge touches it.
//!
//! The table is synced the same incremental way as pages: the replica
//! asks for everything from its current high ref up, and the master
//! ships `(ref, string)` pairs for the tail of its pool. Refs are dense
//! and append-only on the master, so "everything since N" is a suffix.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

pub struct StringPool {
    inner: RwLock<PoolInner>,
}

struct PoolInner {
    by_str: HashMap<Arc<str>, u32>,
    /// Ref r lives at index r - 1; ref 0 is the null string.
    by_ref: Vec<Arc<str>>,
}

impl Default for StringPool {
    fn default() -> Self {
        Self::new()
    }
}

impl StringPool {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(PoolInner {
                by_str: HashMap::new(),
                by_ref: Vec::new(),
            }),
        }
    }

    /// Intern a string, returning its stable ref (1-based).
    pub fn intern(&self, s: &str) -> u32 {
        {
            let inner = self.inner.read();
            if let Some(&r) = inner.by_str.get(s) {
                return r;
            }
        }
        let mut inner = self.inner.write();
        if let Some(&r) = inner.by_str.get(s) {
            return r;
        }
        let interned: Arc<str> = Arc::from(s);
        inner.by_ref.push(Arc::clone(&interned));
        let r = inner.by_ref.len() as u32;
        inner.by_str.insert(interned, r);
        r
    }

    /// Resolve a ref; 0 is the null string.
    pub fn get(&self, r: u32) -> Option<Arc<str>> {
        if r == 0 {
            return None;
        }
        self.inner.read().by_ref.get(r as usize - 1).cloned()
    }

    /// The highest ref assigned so far.
    pub fn high_ref(&self) -> u32 {
        self.inner.read().by_ref.len() as u32
    }

    /// Everything assigned at or after `start_ref`, for shipping to a
    /// replica that has synced up to (but not including) that ref.
    pub fn strings_since(&self, start_ref: u32) -> StringSyncResult {
        let inner = self.inner.read();
        let start = start_ref.max(1);
        let mut refs = Vec::new();
        let mut strings = Vec::new();
        for r in start..=inner.by_ref.len() as u32 {
            refs.push(r);
            strings.push(Arc::clone(&inner.by_ref[r as usize - 1]));
        }
        StringSyncResult { refs, strings }
    }
}

/// One batch of the master's interning table.
pub struct StringSyncResult {
    pub refs: Vec<u32>,
    pub strings: Vec<Arc<str>>,
}
