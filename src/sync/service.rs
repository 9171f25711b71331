//! # Master Service Surface
//!
//! What a replica needs from its master: size estimates for scheduling
//! the initial sync, the page diff per business-object type, and the
//! string-interning table tail. [`LocalMaster`] implements the surface
//! in-process over a set of master-side record stores, round-tripping
//! through the real wire codec — the loop-back deployment mode, and the
//! backbone of the replication tests.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use eyre::{bail, Result};
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::store::RecordStore;
use crate::sync::result::MasterSyncResult;
use crate::sync::strings::{StringPool, StringSyncResult};

pub trait MasterService: Send + Sync {
    /// Approximate used bytes per business-object type, for ordering the
    /// initial sync from largest to smallest.
    fn retrieve_initial_sync_size(&self) -> Result<HashMap<String, u64>>;

    /// The page diff for one type since the replica's watermark.
    fn sync_with_master(&self, name: &str, since_version: u64) -> Result<MasterSyncResult>;

    /// The interning table from `start_ref` up.
    fn retrieve_strings(&self, start_ref: u32) -> Result<StringSyncResult>;
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// In-process master: serializes each store through the wire format and
/// decodes it back, exactly as a remote replica would see it.
pub struct LocalMaster {
    stores: RwLock<HashMap<String, Arc<RecordStore>>>,
    pool: Arc<StringPool>,
}

impl LocalMaster {
    pub fn new(pool: Arc<StringPool>) -> Self {
        Self {
            stores: RwLock::new(HashMap::new()),
            pool,
        }
    }

    pub fn register(&self, store: Arc<RecordStore>) {
        self.stores.write().insert(store.name().to_string(), store);
    }

    pub fn pool(&self) -> &Arc<StringPool> {
        &self.pool
    }
}

impl MasterService for LocalMaster {
    fn retrieve_initial_sync_size(&self) -> Result<HashMap<String, u64>> {
        let stores = self.stores.read();
        Ok(stores
            .iter()
            .map(|(name, store)| (name.clone(), store.used_bytes()))
            .collect())
    }

    fn sync_with_master(&self, name: &str, since_version: u64) -> Result<MasterSyncResult> {
        let store = {
            let stores = self.stores.read();
            match stores.get(name) {
                Some(store) => Arc::clone(store),
                None => bail!("unknown business-object type '{}' on master", name),
            }
        };
        store.set_last_refresh_time(now_millis());
        let mut stream = Vec::new();
        store.serialize_sync(&mut stream, since_version)?;
        MasterSyncResult::read_from(&mut &stream[..])
    }

    fn retrieve_strings(&self, start_ref: u32) -> Result<StringSyncResult> {
        Ok(self.pool.strings_since(start_ref))
    }
}
