//! # Master/Replica Replication Tests
//!
//! End-to-end exercises of the replication protocol over the in-process
//! `LocalMaster`, which serializes every response through the real wire
//! codec and decodes it back — exactly the byte stream a remote replica
//! would receive.
//!
//! ## Coverage
//!
//! 1. Initial sync — bootstrap of an empty replica, index callbacks,
//!    string-ref remapping into the replica's own pool
//! 2. Steady state — insert / update / remove / nuke-and-insert
//!    bucketing against a live replica
//! 3. Watermarks — a second sync after no master changes ships nothing
//! 4. Merge idempotence — applying the same decoded result twice
//! 5. Copy-based merge — incoming pages past the replica's capacity
//! 6. Uplink workers — initial-sync blocking, steady cycles, pause,
//!    per-type failure isolation

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::Mutex;

use offcache::reclaim::Reclaimer;
use offcache::store::{Field, FieldKind, RecordLayout, RecordRef, RecordStore, SyncIndex};
use offcache::sync::{LocalMaster, MasterService, ReplicatedStore, StringPool, Uplink};

const STRIDE: usize = 24;
const PK_OFFSET: u32 = 0;
const VALUE_OFFSET: u32 = 8;
const STRING_OFFSET: u32 = 12;

fn layout() -> RecordLayout {
    RecordLayout::new(
        STRIDE,
        [Field { offset: PK_OFFSET, kind: FieldKind::Long }],
        [STRING_OFFSET],
    )
}

fn quiet_reclaimer() -> Arc<Reclaimer> {
    Reclaimer::with_interval(Duration::from_secs(3600))
}

#[derive(Default)]
struct TestIndex {
    records: Mutex<HashMap<u32, RecordRef>>,
    added: AtomicUsize,
    removed: AtomicUsize,
}

impl TestIndex {
    fn live(&self) -> usize {
        self.records.lock().len()
    }

    fn added(&self) -> usize {
        self.added.load(Ordering::SeqCst)
    }

    fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }
}

impl SyncIndex for TestIndex {
    fn sync_record_added(&self, record: RecordRef) {
        self.added.fetch_add(1, Ordering::SeqCst);
        self.records.lock().insert(record.slot(), record);
    }

    fn sync_record_removed(&self, record: &RecordRef) {
        self.removed.fetch_add(1, Ordering::SeqCst);
        self.records.lock().remove(&record.slot());
    }
}

struct Fixture {
    master: Arc<RecordStore>,
    master_pool: Arc<StringPool>,
    service: Arc<LocalMaster>,
    replica: Arc<RecordStore>,
    replica_pool: Arc<StringPool>,
    uplink: Uplink,
    index: Arc<TestIndex>,
}

fn fixture(name: &str) -> Fixture {
    let master_pool = Arc::new(StringPool::new());
    let master =
        Arc::new(RecordStore::new(name, layout(), quiet_reclaimer()).unwrap());
    let service = Arc::new(LocalMaster::new(Arc::clone(&master_pool)));
    service.register(Arc::clone(&master));
    let replica_pool = Arc::new(StringPool::new());
    let replica =
        Arc::new(RecordStore::new(name, layout(), quiet_reclaimer()).unwrap());
    let uplink = Uplink::new(
        "test-master",
        Arc::<LocalMaster>::clone(&service) as Arc<dyn MasterService>,
        Arc::clone(&replica_pool),
    );
    Fixture {
        master,
        master_pool,
        service,
        replica,
        replica_pool,
        uplink,
        index: Arc::new(TestIndex::default()),
    }
}

fn master_insert(fx: &Fixture, pk: i64, value: i32, s: &str) -> RecordRef {
    let rec = fx.master.allocate().unwrap();
    fx.master.set_long(rec.slot(), PK_OFFSET, pk);
    fx.master.set_int(rec.slot(), VALUE_OFFSET, value);
    let string_ref = fx.master_pool.intern(s);
    fx.master.set_int(rec.slot(), STRING_OFFSET, string_ref as i32);
    fx.master.mark_dirty(rec.slot());
    rec
}

fn sync_once(fx: &Fixture) {
    let destroyed = fx
        .replica
        .sync_with_master(&fx.uplink, fx.index.as_ref())
        .unwrap();
    assert!(!destroyed);
}

fn replica_string(fx: &Fixture, slot: u32) -> String {
    let local_ref = fx.replica.get_int(slot, STRING_OFFSET) as u32;
    fx.replica_pool.get(local_ref).unwrap().to_string()
}

#[test]
fn initial_sync_replicates_everything() {
    let fx = fixture("Order");
    let recs: Vec<_> = (0..5)
        .map(|i| master_insert(&fx, 100 + i, i as i32 * 10, &format!("customer-{}", i)))
        .collect();

    sync_once(&fx);

    assert_eq!(fx.index.live(), 5);
    assert_eq!(fx.index.added(), 5);
    assert_eq!(fx.index.removed(), 0);
    for (i, rec) in recs.iter().enumerate() {
        let slot = rec.slot();
        assert_eq!(fx.replica.get_long(slot, PK_OFFSET), 100 + i as i64);
        assert_eq!(fx.replica.get_int(slot, VALUE_OFFSET), i as i32 * 10);
        assert_eq!(replica_string(&fx, slot), format!("customer-{}", i));
    }
    assert!(fx.replica.last_refresh_time() > 0);
}

#[test]
fn string_refs_remap_to_the_replica_pool() {
    let fx = fixture("Trade");
    // Skew the replica pool so master and local refs cannot coincide.
    fx.replica_pool.intern("padding-a");
    fx.replica_pool.intern("padding-b");
    let rec = master_insert(&fx, 1, 1, "desk-seven");

    sync_once(&fx);

    let master_ref = fx.master.get_int(rec.slot(), STRING_OFFSET) as u32;
    let local_ref = fx.replica.get_int(rec.slot(), STRING_OFFSET) as u32;
    assert_ne!(master_ref, local_ref);
    assert_eq!(replica_string(&fx, rec.slot()), "desk-seven");
}

#[test]
fn steady_state_buckets_insert_update_remove() {
    let fx = fixture("Position");
    let keep = master_insert(&fx, 1, 10, "keep");
    let update = master_insert(&fx, 2, 20, "update");
    let remove = master_insert(&fx, 3, 30, "remove");
    sync_once(&fx);
    assert_eq!(fx.index.live(), 3);

    // Mutate: touch one record's value, free another, add a fourth.
    fx.master.set_int(update.slot(), VALUE_OFFSET, 21);
    fx.master.mark_dirty(update.slot());
    let removed_slot = remove.slot();
    fx.master.free(removed_slot);
    drop(remove);
    let insert = master_insert(&fx, 4, 40, "insert");

    let added_before = fx.index.added();
    let removed_before = fx.index.removed();
    sync_once(&fx);

    assert_eq!(fx.index.live(), 3);
    assert_eq!(fx.replica.get_int(update.slot(), VALUE_OFFSET), 21);
    assert_eq!(fx.replica.get_long(insert.slot(), PK_OFFSET), 4);
    assert!(fx.index.records.lock().get(&removed_slot).is_none());
    assert_eq!(fx.replica.get_int(keep.slot(), VALUE_OFFSET), 10);
    // update = remove+add of the same wrapper; remove and insert one each
    assert_eq!(fx.index.added() - added_before, 2);
    assert_eq!(fx.index.removed() - removed_before, 2);
}

#[test]
fn pk_change_is_a_replacement_not_an_update() {
    let fx = fixture("Account");
    let doomed = master_insert(&fx, 7, 70, "old");
    sync_once(&fx);
    let old_slot = doomed.slot();
    let replica_wrapper_before = {
        let map = fx.index.records.lock();
        map.get(&old_slot).unwrap().clone()
    };

    // Master recycles the slot for a record with a different pk.
    fx.master.free(old_slot);
    drop(doomed);
    fx.master.evict_collected();
    let replacement = master_insert(&fx, 8, 80, "new");
    assert_eq!(replacement.slot(), old_slot, "slot reuse is the premise");

    sync_once(&fx);

    assert_eq!(fx.replica.get_long(old_slot, PK_OFFSET), 8);
    let replica_wrapper_after = {
        let map = fx.index.records.lock();
        map.get(&old_slot).unwrap().clone()
    };
    assert!(
        !replica_wrapper_after.ptr_eq(&replica_wrapper_before),
        "replacement must construct a fresh wrapper"
    );
    assert_eq!(replica_wrapper_before.slot(), 0, "old wrapper was severed");
}

#[test]
fn unchanged_master_ships_nothing() {
    let fx = fixture("Ref");
    master_insert(&fx, 1, 1, "x");
    sync_once(&fx);
    let added = fx.index.added();

    sync_once(&fx);
    sync_once(&fx);

    assert_eq!(fx.index.added(), added);
    assert_eq!(fx.index.removed(), 0);
}

#[test]
fn merge_is_idempotent() {
    let fx = fixture("Idem");
    for i in 0..10 {
        master_insert(&fx, i, i as i32, "s");
    }
    // Two independent decodes of the same master state.
    let first = fx.service.sync_with_master("Idem", 0).unwrap();
    let second = fx.service.sync_with_master("Idem", 0).unwrap();

    fx.replica
        .apply_sync_result(first, fx.index.as_ref())
        .unwrap();
    let live_after_first = fx.index.live();
    let added_after_first = fx.index.added();

    fx.replica
        .apply_sync_result(second, fx.index.as_ref())
        .unwrap();

    assert_eq!(fx.index.live(), live_after_first);
    assert_eq!(fx.index.added(), added_after_first);
    assert_eq!(fx.index.removed(), 0);
}

#[test]
fn growth_merges_via_copy() {
    let fx = fixture("Bulk");
    master_insert(&fx, 0, 0, "seed");
    sync_once(&fx);

    let count = 3000u32;
    let mut recs = Vec::new();
    for i in 1..count {
        recs.push(master_insert(&fx, i as i64, i as i32, "bulk"));
    }
    sync_once(&fx);

    assert_eq!(fx.index.live(), count as usize);
    for rec in recs.iter().step_by(271) {
        assert_eq!(
            fx.replica.get_long(rec.slot(), PK_OFFSET),
            fx.master.get_long(rec.slot(), PK_OFFSET)
        );
    }
}

#[test]
fn uplink_runs_initial_and_steady_cycles() {
    let fx = fixture("Live");
    let rec = master_insert(&fx, 1, 1, "v1");

    fx.uplink.set_sync_interval(Duration::from_millis(50));
    fx.uplink.set_sync_threads(2);
    fx.uplink
        .start_sync_and_wait_for_initial_sync(vec![ReplicatedStore {
            store: Arc::clone(&fx.replica),
            index: Arc::<TestIndex>::clone(&fx.index) as Arc<dyn SyncIndex>,
        }])
        .unwrap();
    assert_eq!(fx.index.live(), 1);
    assert!(fx.uplink.last_successful_refresh() > 0);

    fx.master.set_int(rec.slot(), VALUE_OFFSET, 99);
    fx.master.mark_dirty(rec.slot());
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while fx.replica.get_int(rec.slot(), VALUE_OFFSET) != 99 {
        assert!(std::time::Instant::now() < deadline, "steady cycle never applied");
        std::thread::sleep(Duration::from_millis(20));
    }

    // Paused workers must not apply further changes.
    fx.uplink.pause();
    std::thread::sleep(Duration::from_millis(150));
    fx.master.set_int(rec.slot(), VALUE_OFFSET, 100);
    fx.master.mark_dirty(rec.slot());
    std::thread::sleep(Duration::from_millis(250));
    assert_eq!(fx.replica.get_int(rec.slot(), VALUE_OFFSET), 99);

    fx.uplink.unpause();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while fx.replica.get_int(rec.slot(), VALUE_OFFSET) != 100 {
        assert!(std::time::Instant::now() < deadline, "unpause never resumed");
        std::thread::sleep(Duration::from_millis(20));
    }

    fx.uplink.shutdown();
}

/// Delegating service that fails one type's page sync on demand.
struct Flaky {
    inner: Arc<LocalMaster>,
    failing_type: String,
    failing: AtomicBool,
}

impl MasterService for Flaky {
    fn retrieve_initial_sync_size(&self) -> eyre::Result<HashMap<String, u64>> {
        self.inner.retrieve_initial_sync_size()
    }

    fn sync_with_master(
        &self,
        name: &str,
        since_version: u64,
    ) -> eyre::Result<offcache::sync::MasterSyncResult> {
        if name == self.failing_type && self.failing.load(Ordering::SeqCst) {
            eyre::bail!("simulated transport failure for '{}'", name);
        }
        self.inner.sync_with_master(name, since_version)
    }

    fn retrieve_strings(&self, start_ref: u32) -> eyre::Result<offcache::sync::StringSyncResult> {
        self.inner.retrieve_strings(start_ref)
    }
}

#[test]
fn per_type_failure_leaves_other_types_synced() {
    let master_pool = Arc::new(StringPool::new());
    let local = Arc::new(LocalMaster::new(Arc::clone(&master_pool)));
    let reclaimer = quiet_reclaimer();
    let master_a = Arc::new(RecordStore::new("A", layout(), Arc::clone(&reclaimer)).unwrap());
    let master_b = Arc::new(RecordStore::new("B", layout(), Arc::clone(&reclaimer)).unwrap());
    local.register(Arc::clone(&master_a));
    local.register(Arc::clone(&master_b));
    let rec_a = master_a.allocate().unwrap();
    master_a.set_long(rec_a.slot(), PK_OFFSET, 1);
    let rec_b = master_b.allocate().unwrap();
    master_b.set_long(rec_b.slot(), PK_OFFSET, 2);

    let flaky = Arc::new(Flaky {
        inner: local,
        failing_type: "B".into(),
        failing: AtomicBool::new(true),
    });
    let replica_pool = Arc::new(StringPool::new());
    let replica_a = Arc::new(RecordStore::new("A", layout(), quiet_reclaimer()).unwrap());
    let replica_b = Arc::new(RecordStore::new("B", layout(), quiet_reclaimer()).unwrap());
    let index_a = Arc::new(TestIndex::default());
    let index_b = Arc::new(TestIndex::default());
    let uplink = Uplink::new(
        "flaky-master",
        Arc::<Flaky>::clone(&flaky) as Arc<dyn MasterService>,
        replica_pool,
    );
    uplink.set_sync_interval(Duration::from_millis(50));
    uplink.set_sync_threads(1);

    let result = uplink.start_sync_and_wait_for_initial_sync(vec![
        ReplicatedStore {
            store: Arc::clone(&replica_a),
            index: Arc::<TestIndex>::clone(&index_a) as Arc<dyn SyncIndex>,
        },
        ReplicatedStore {
            store: Arc::clone(&replica_b),
            index: Arc::<TestIndex>::clone(&index_b) as Arc<dyn SyncIndex>,
        },
    ]);
    assert!(result.is_err(), "a failing type fails the initial sync");
    assert_eq!(index_a.live(), 1, "healthy type synced regardless");
    assert_eq!(index_b.live(), 0);
    assert_eq!(uplink.last_successful_refresh(), 0);

    // Transport recovers; the next cycles pick B up and stamp a clean
    // refresh.
    flaky.failing.store(false, Ordering::SeqCst);
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while index_b.live() != 1 {
        assert!(std::time::Instant::now() < deadline, "type B never recovered");
        std::thread::sleep(Duration::from_millis(20));
    }
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while uplink.last_successful_refresh() == 0 {
        assert!(std::time::Instant::now() < deadline, "clean cycle never stamped");
        std::thread::sleep(Duration::from_millis(20));
    }
    uplink.shutdown();
}
