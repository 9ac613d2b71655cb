//! End-to-end write concern scenarios against the public tracker API: a
//! replica set primary tracking its slaves, with the background flusher
//! persisting progress into an in-memory slaves collection.

use repltrack::repl::{Client, GhostSync, Membership, TagRule};
use repltrack::storage::{LockState, Memory, SLAVES_NS};
use repltrack::{Error, OpTime, SlaveTracker};

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

const A: &str = "10000000-0000-0000-0000-000000000001";
const B: &str = "10000000-0000-0000-0000-000000000002";
const C: &str = "10000000-0000-0000-0000-000000000003";

/// A settable membership service for a three-slave set.
struct FakeSet {
    in_set: AtomicBool,
    primary: AtomicBool,
    majority: AtomicU64,
    rules: Mutex<HashMap<String, TagRule>>,
}

impl Default for FakeSet {
    fn default() -> Self {
        Self {
            in_set: AtomicBool::new(true),
            primary: AtomicBool::new(true),
            majority: AtomicU64::new(2),
            rules: Mutex::new(HashMap::new()),
        }
    }
}

impl Membership for FakeSet {
    fn in_replica_set(&self) -> bool {
        self.in_set.load(Ordering::SeqCst)
    }

    fn is_primary(&self) -> bool {
        self.primary.load(Ordering::SeqCst)
    }

    fn majority_count(&self) -> u64 {
        self.majority.load(Ordering::SeqCst)
    }

    fn tag_rules(&self) -> HashMap<String, TagRule> {
        self.rules.lock().unwrap().clone()
    }

    fn my_config(&self) -> Value {
        json!({"_id": 0, "host": "primary:27017"})
    }
}

/// Records chained-sync traffic.
#[derive(Default)]
struct FakeGhost {
    updates: Mutex<Vec<(Uuid, OpTime)>>,
    percolated: Mutex<Vec<(Value, OpTime)>>,
}

impl GhostSync for FakeGhost {
    fn update_slave(&self, rid: Uuid, op: OpTime) {
        self.updates.lock().unwrap().push((rid, op));
    }

    fn percolate(&self, rid: &Value, op: OpTime) {
        self.percolated.lock().unwrap().push((rid.clone(), op));
    }
}

/// A slave connection that has handshaken with a member config.
struct FakeSlave {
    rid: Value,
    handshake: Value,
}

impl FakeSlave {
    fn new(id: &str, host: &str) -> Self {
        Self {
            rid: json!({"_id": id}),
            handshake: json!({"handshake": id, "config": {"host": host}}),
        }
    }
}

impl Client for FakeSlave {
    fn remote_id(&self) -> Option<&Value> {
        Some(&self.rid)
    }

    fn handshake(&self) -> Option<&Value> {
        Some(&self.handshake)
    }

    fn remote_addr(&self) -> String {
        "10.0.0.9:5555".into()
    }
}

struct Cluster {
    tracker: Arc<SlaveTracker>,
    set: Arc<FakeSet>,
    ghost: Arc<FakeGhost>,
    fsync: Arc<LockState>,
    store: Arc<Memory>,
}

impl Cluster {
    /// A primary in a three-slave set with majority 2 and a fast flusher.
    fn new() -> Self {
        let set = Arc::new(FakeSet::default());
        let ghost = Arc::new(FakeGhost::default());
        let fsync = Arc::new(LockState::new());
        let store = Arc::new(Memory::new());
        let tracker = Arc::new(SlaveTracker::with_interval(
            set.clone(),
            ghost.clone(),
            fsync.clone(),
            store.clone(),
            Duration::from_millis(10),
        ));
        Self { tracker, set, ghost, fsync, store }
    }

    /// Reports slave progress through the ingress path.
    fn report(&self, id: &str, host: &str, secs: u32) {
        let slave = FakeSlave::new(id, host);
        self.tracker
            .update_slave_location(&slave, "local.oplog.rs", OpTime::new(secs, 0))
            .unwrap();
    }

    /// Polls the slaves collection until it holds n rows or 5s pass.
    fn wait_for_rows(&self, n: usize) -> Vec<Value> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let rows = self.store.rows(SLAVES_NS).unwrap();
            if rows.len() >= n || Instant::now() >= deadline {
                return rows;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

fn op(secs: u32) -> OpTime {
    OpTime::new(secs, 0)
}

#[test]
fn numeric_write_concerns() {
    let c = Cluster::new();
    c.report(A, "a:27017", 10);
    c.report(B, "b:27017", 10);

    assert_eq!(c.tracker.op_replicated_enough(op(10), &json!(2)), Ok(true));
    assert_eq!(c.tracker.op_replicated_enough(op(10), &json!(3)), Ok(true));
    assert_eq!(c.tracker.op_replicated_enough(op(10), &json!(4)), Ok(false));

    // A stale slave doesn't count until its next report catches up.
    c.report(C, "c:27017", 5);
    assert_eq!(c.tracker.op_replicated_enough(op(10), &json!(4)), Ok(false));
    c.report(C, "c:27017", 10);
    assert_eq!(c.tracker.op_replicated_enough(op(10), &json!(4)), Ok(true));

    assert_eq!(c.tracker.slave_count(), Ok(3));
}

#[test]
fn majority_matches_numeric() {
    let c = Cluster::new();
    c.report(A, "a:27017", 10);

    for majority in [2, 3] {
        c.set.majority.store(majority, Ordering::SeqCst);
        assert_eq!(
            c.tracker.op_replicated_enough(op(10), &json!("majority")),
            c.tracker.op_replicated_enough(op(10), &json!(majority)),
        );
    }
}

#[test]
fn tag_rules_and_error_codes() {
    let c = Cluster::new();
    c.set.rules.lock().unwrap().insert("allDCs".into(), TagRule { last: op(15) });

    assert_eq!(c.tracker.op_replicated_enough(op(10), &json!("allDCs")), Ok(true));
    assert_eq!(c.tracker.op_replicated_enough(op(20), &json!("allDCs")), Ok(false));

    let err = c.tracker.op_replicated_enough(op(10), &json!("nosuchmode")).unwrap_err();
    assert_eq!(err, Error::UnknownMode("nosuchmode".into()));
    assert_eq!(err.code(), Some(14830));
    assert_eq!(err.to_string(), "unrecognized getLastError mode: nosuchmode");

    let err = c.tracker.op_replicated_enough(op(10), &json!({"w": 2})).unwrap_err();
    assert_eq!(err.code(), Some(16250));
    assert_eq!(err.to_string(), "w has to be a string or a number");
}

#[test]
fn secondary_accepts_any_write_concern() {
    let c = Cluster::new();
    c.set.primary.store(false, Ordering::SeqCst);

    assert_eq!(c.tracker.op_replicated_enough(op(100), &json!(5)), Ok(true));
    assert_eq!(c.tracker.wait_for_replication(op(100), 5, Duration::from_secs(5)), Ok(true));
}

#[test]
fn wait_blocks_until_progress_or_deadline() {
    let c = Cluster::new();
    c.report(A, "a:27017", 15);
    c.report(B, "b:27017", 15);

    // Nobody reaches 20 in time, so the first wait expires.
    let start = Instant::now();
    assert_eq!(c.tracker.wait_for_replication(op(20), 2, Duration::from_millis(300)), Ok(false));
    assert!(start.elapsed() >= Duration::from_millis(300));

    // A concurrent report past 20 wakes the second wait well before its
    // deadline.
    let tracker = c.tracker.clone();
    let waiter =
        thread::spawn(move || tracker.wait_for_replication(op(20), 2, Duration::from_secs(5)));
    thread::sleep(Duration::from_millis(50));
    c.report(A, "a:27017", 25);
    assert_eq!(waiter.join().unwrap(), Ok(true));
}

#[test]
fn hosts_at_op_lists_self_then_slaves() {
    let c = Cluster::new();
    c.report(B, "b:27017", 10);
    c.report(A, "a:27017", 10);
    c.report(C, "c:27017", 5);

    assert_eq!(
        c.tracker.hosts_at_op(op(10)).unwrap(),
        vec![
            json!({"_id": 0, "host": "primary:27017"}),
            json!({"host": "a:27017"}),
            json!({"host": "b:27017"}),
        ]
    );
}

#[test]
fn flusher_persists_identity_rows() {
    let c = Cluster::new();
    c.report(A, "a:27017", 10);

    let rows = c.wait_for_rows(1);
    assert_eq!(
        rows,
        vec![json!({
            "_id": A,
            "config": {"host": "a:27017"},
            "ns": "local.oplog.rs",
            "syncedTo": op(10).as_u64(),
        })]
    );

    // Progress updates the row in place rather than adding a sibling.
    c.report(A, "a:27017", 30);
    let deadline = Instant::now() + Duration::from_secs(5);
    while c.store.rows(SLAVES_NS).unwrap()[0]["syncedTo"] != json!(op(30).as_u64()) {
        assert!(Instant::now() < deadline, "syncedTo never advanced");
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(c.store.rows(SLAVES_NS).unwrap().len(), 1);
}

#[test]
fn fsync_lock_stalls_flushing() {
    let c = Cluster::new();
    c.fsync.set_locked(true);
    c.report(A, "a:27017", 10);

    thread::sleep(Duration::from_millis(100));
    assert!(c.store.rows(SLAVES_NS).unwrap().is_empty());

    c.fsync.set_locked(false);
    assert_eq!(c.wait_for_rows(1).len(), 1);
}

#[test]
fn reset_empties_the_map() {
    let c = Cluster::new();
    c.report(A, "a:27017", 10);
    c.report(B, "b:27017", 10);
    assert_eq!(c.tracker.slave_count(), Ok(2));

    // A flush pass may be writing at this instant, which makes reset an
    // advisory no-op; retry until it lands.
    let deadline = Instant::now() + Duration::from_secs(5);
    c.tracker.reset().unwrap();
    while c.tracker.slave_count().unwrap() > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
        c.tracker.reset().unwrap();
    }
    assert_eq!(c.tracker.slave_count(), Ok(0));
    assert_eq!(c.tracker.op_replicated_enough(op(10), &json!(2)), Ok(false));
}

#[test]
fn percolates_toward_primary_when_secondary() {
    let c = Cluster::new();
    c.set.primary.store(false, Ordering::SeqCst);
    c.report(A, "a:27017", 10);

    assert_eq!(
        c.ghost.percolated.lock().unwrap().clone(),
        vec![(json!({"_id": A}), op(10))]
    );
    assert!(c.ghost.updates.lock().unwrap().is_empty());
}

#[test]
fn primary_feeds_chaining_state() {
    let c = Cluster::new();
    c.report(A, "a:27017", 10);

    assert_eq!(
        c.ghost.updates.lock().unwrap().clone(),
        vec![(Uuid::parse_str(A).unwrap(), op(10))]
    );
    assert!(c.ghost.percolated.lock().unwrap().is_empty());
}
