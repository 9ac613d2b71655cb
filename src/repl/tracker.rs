//! Tracks replication progress on a primary node. Each slave tailing the
//! oplog reports the position it has applied through; the tracker keeps
//! the newest position per slave in memory and serves write concern
//! queries against it.
//!
//! The in-memory map is the source of truth and is guarded by a single
//! mutex, paired with a condition variable that wakes waiting request
//! threads whenever progress arrives. A background flusher thread, started
//! lazily on the first update, persists the map into the local slaves
//! collection about once a second: it snapshots the map under the lock,
//! then upserts each row without it, so the hot path never blocks on
//! storage. Flush failures are left for a later pass; missed passes are
//! safe since any subsequent update re-marks the map dirty.
//!
//! Write concerns come in three forms. Numeric w asks for w members
//! counting the primary itself, so w - 1 slaves must have caught up;
//! w <= 1 and non-primary nodes answer true without looking at the map.
//! The "majority" mode resolves to a member count via the set config. Any
//! other string names a tag rule whose watermark the membership service
//! maintains.
//!
//! The membership, chained-sync, fsync lock, and storage collaborators are
//! all consulted without the map lock held.

use super::{GhostSync, Membership, OpTime, SlaveIdent};
use crate::error::{Error, Result};
use crate::storage::{FsyncLock, LocalStore, SLAVES_NS};

use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use itertools::Itertools as _;
use log::{debug, error, warn};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// The interval between flusher passes.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Log every Nth consecutive flush pass skipped due to the fsync lock.
const LOCKED_LOG_EVERY: u32 = 128;

/// A client connection serving a slave's oplog tail, as seen by the
/// tracker. Implemented by the request plumbing.
pub trait Client {
    /// The slave's remote identity document, if it has sent one.
    fn remote_id(&self) -> Option<&Value>;

    /// The slave's handshake document, if it has handshaken.
    fn handshake(&self) -> Option<&Value>;

    /// The remote host:port of the connection.
    fn remote_addr(&self) -> String;
}

/// The mutex-guarded tracker state.
#[derive(Default)]
struct State {
    /// The newest observed position per slave.
    slaves: BTreeMap<SlaveIdent, OpTime>,
    /// True if the map holds state not yet persisted.
    dirty: bool,
    /// True once the flusher thread has been started.
    started: bool,
}

/// State shared between request threads and the flusher.
struct Shared {
    /// The progress map and flags.
    state: Mutex<State>,
    /// Woken on every progress update and after every flush pass. Waiters
    /// must recheck their predicate after each wake.
    replicated: Condvar,
    /// True while the flusher is writing to the slaves collection. Checked
    /// by reset() so an in-flight snapshot isn't clobbered.
    flushing: AtomicBool,
}

/// Tracks the replication progress of each slave of this node, evaluates
/// write concerns against it, and persists it into the slaves collection.
/// Constructed once by the owning node and shared via Arc; all methods
/// take &self and are safe to call from any request thread.
pub struct SlaveTracker {
    members: Arc<dyn Membership>,
    ghost: Arc<dyn GhostSync>,
    fsync: Arc<dyn FsyncLock>,
    store: Arc<dyn LocalStore>,
    /// The interval between flusher passes.
    interval: Duration,
    /// State shared with the flusher thread.
    shared: Arc<Shared>,
    /// Cloned into the flusher thread when it is lazily started.
    shutdown_rx: Receiver<()>,
    /// Held so the shutdown channel disconnects when the tracker is
    /// dropped, stopping the flusher within one tick.
    _shutdown: Sender<()>,
}

impl SlaveTracker {
    /// Creates a new tracker. The flusher thread is started lazily on the
    /// first progress update.
    pub fn new(
        members: Arc<dyn Membership>,
        ghost: Arc<dyn GhostSync>,
        fsync: Arc<dyn FsyncLock>,
        store: Arc<dyn LocalStore>,
    ) -> Self {
        Self::with_interval(members, ghost, fsync, store, FLUSH_INTERVAL)
    }

    /// Creates a new tracker with a custom flush interval.
    pub fn with_interval(
        members: Arc<dyn Membership>,
        ghost: Arc<dyn GhostSync>,
        fsync: Arc<dyn FsyncLock>,
        store: Arc<dyn LocalStore>,
        interval: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = bounded(0);
        Self {
            members,
            ghost,
            fsync,
            store,
            interval,
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                replicated: Condvar::new(),
                flushing: AtomicBool::new(false),
            }),
            shutdown_rx,
            _shutdown: shutdown_tx,
        }
    }

    /// Records the newest position a slave has applied through, replacing
    /// any previous entry for its id, and wakes waiting threads. Starts
    /// the flusher on first use.
    pub fn update(&self, rid: &Value, config: &Value, ns: &str, last: OpTime) -> Result<()> {
        let ident = SlaveIdent::new(rid, config, ns)?;
        let id = ident.id();

        {
            let mut state = self.shared.state.lock()?;
            state.slaves.insert(ident, last);
            state.dirty = true;
            if !state.started {
                state.started = true;
                self.spawn_flusher()?;
            }
            self.shared.replicated.notify_all();
        }

        // Feed the chaining state, without the map lock held.
        if self.members.in_replica_set() && self.members.is_primary() {
            self.ghost.update_slave(id, last);
        }
        Ok(())
    }

    /// Records the oplog position a slave has fetched through, derived
    /// from its connection. Null positions and clients that haven't yet
    /// identified themselves are ignored. On a non-primary set member the
    /// position is also percolated up the replication chain.
    pub fn update_slave_location(
        &self,
        client: &dyn Client,
        ns: &str,
        last: OpTime,
    ) -> Result<()> {
        if last.is_null() {
            return Ok(());
        }
        assert!(ns.starts_with("local.oplog."), "slave location update for non-oplog {ns}");

        let Some(rid) = client.remote_id() else {
            return Ok(());
        };
        if rid.as_object().map_or(true, |fields| fields.is_empty()) {
            return Ok(());
        }

        match client.handshake().and_then(|h| h.get("config")) {
            Some(config) => self.update(rid, config, ns, last)?,
            None => {
                // A pre-handshake slave: synthesize a config from the
                // connection so it still shows up in the slaves collection.
                let config = json!({"host": client.remote_addr(), "upgradeNeeded": true});
                self.update(rid, &config, ns, last)?;
            }
        }

        if self.members.in_replica_set() && !self.members.is_primary() {
            // The slave's own port isn't known here; the chained sync
            // service keeps the rid-to-slave mapping and forwards the
            // position toward the primary.
            debug!("percolating {last} from {rid}");
            self.ghost.percolate(rid, last);
        }
        Ok(())
    }

    /// Checks a position against a write concern w value: a number, the
    /// string "majority", or the name of a tag rule in the set config.
    pub fn op_replicated_enough(&self, op: OpTime, w: &Value) -> Result<bool> {
        if w.is_number() {
            let n = w.as_i64().unwrap_or_else(|| w.as_f64().unwrap_or(0.0) as i64);
            return self.replicated_to_num(op, n);
        }
        let Some(mode) = w.as_str() else {
            return Err(Error::InvalidWType(w.to_string()));
        };

        if !self.members.in_replica_set() {
            return Ok(false);
        }

        if mode == "majority" {
            return self.replicated_to_num(op, self.members.majority_count() as i64);
        }

        match self.members.tag_rules().get(mode) {
            Some(rule) => Ok(op <= rule.last),
            None => Err(Error::UnknownMode(mode.to_string())),
        }
    }

    /// Checks whether a position has replicated to at least w members,
    /// counting this node. Trivially true when w <= 1, or when this node
    /// isn't primary and so has no business vetoing the write.
    pub fn replicated_to_num(&self, op: OpTime, w: i64) -> Result<bool> {
        if w <= 1 || !self.members.is_primary() {
            return Ok(true);
        }
        // The primary counts itself, so w - 1 slaves must have caught up.
        let need = w - 1;
        let state = self.shared.state.lock()?;
        Ok(Self::replicated_to(&state, op, need))
    }

    /// Blocks until the position has replicated to at least w members or
    /// the deadline expires, returning false on expiry. Short-circuits
    /// like replicated_to_num. Only numeric write concerns can wait here;
    /// string modes are answered by polling op_replicated_enough.
    pub fn wait_for_replication(&self, op: OpTime, w: i64, max_wait: Duration) -> Result<bool> {
        if w <= 1 || !self.members.is_primary() {
            return Ok(true);
        }
        let need = w - 1;
        let deadline = Instant::now() + max_wait;

        let mut state = self.shared.state.lock()?;
        loop {
            if Self::replicated_to(&state, op, need) {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let (guard, _) = self.shared.replicated.wait_timeout(state, deadline - now)?;
            state = guard;
        }
    }

    /// Checks whether at least `need` slaves in the map have reached `op`.
    fn replicated_to(state: &State, op: OpTime, mut need: i64) -> bool {
        for last in state.slaves.values() {
            if *last < op {
                continue;
            }
            need -= 1;
            if need == 0 {
                return true;
            }
        }
        need <= 0
    }

    /// Returns the member configs of every node caught up to the given
    /// position: this node first (when in a replica set), then each slave
    /// at or past the position, in id order.
    pub fn hosts_at_op(&self, op: OpTime) -> Result<Vec<Value>> {
        let mut hosts = Vec::new();
        if self.members.in_replica_set() {
            hosts.push(self.members.my_config());
        }
        let state = self.shared.state.lock()?;
        hosts.extend(
            state
                .slaves
                .iter()
                .filter(|(_, last)| **last >= op)
                .map(|(ident, _)| ident.config().clone()),
        );
        Ok(hosts)
    }

    /// The number of tracked slaves, not counting this node.
    pub fn slave_count(&self) -> Result<usize> {
        Ok(self.shared.state.lock()?.slaves.len())
    }

    /// Empties the progress map, e.g. when a config change invalidates the
    /// tracked slaves. A no-op while a flush pass is writing, so that a
    /// snapshot in flight isn't clobbered.
    pub fn reset(&self) -> Result<()> {
        if self.shared.flushing.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.state.lock()?.slaves.clear();
        Ok(())
    }

    /// Builds a flusher over this tracker's shared state.
    fn flusher(&self) -> Flusher {
        Flusher {
            shared: self.shared.clone(),
            fsync: self.fsync.clone(),
            store: self.store.clone(),
        }
    }

    /// Starts the flusher thread.
    fn spawn_flusher(&self) -> Result<()> {
        let flusher = self.flusher();
        let interval = self.interval;
        let shutdown = self.shutdown_rx.clone();
        std::thread::Builder::new().name("slavetrack".into()).spawn(move || {
            if let Err(err) = flusher.run(interval, shutdown) {
                error!("slave tracking flusher failed: {err}");
            }
        })?;
        Ok(())
    }
}

/// The background flusher, periodically persisting dirty progress entries
/// into the slaves collection.
struct Flusher {
    shared: Arc<Shared>,
    fsync: Arc<dyn FsyncLock>,
    store: Arc<dyn LocalStore>,
}

impl Flusher {
    /// Runs flush passes at the given interval until the shutdown channel
    /// disconnects.
    fn run(self, interval: Duration, shutdown: Receiver<()>) -> Result<()> {
        let ticker = tick(interval);
        let mut locked_skips = 0_u32;
        loop {
            select! {
                recv(ticker) -> _ => {}
                recv(shutdown) -> _ => return Ok(()),
            }

            if !self.shared.state.lock()?.dirty {
                continue;
            }

            // Writing to the slaves collection while fsync-locked would
            // violate the lock, so skip the pass and retry next tick. The
            // lock can still arrive between this check and the writes.
            if self.fsync.locked_for_writing() {
                if locked_skips % LOCKED_LOG_EVERY == 0 {
                    warn!("can't update {SLAVES_NS} because locked for writing");
                }
                locked_skips += 1;
                continue;
            }
            locked_skips = 0;

            self.flush()?;
        }
    }

    /// Runs a single flush pass: snapshots the map and clears the dirty
    /// flag under the lock, then upserts each row without it, and finally
    /// wakes waiters. Upsert failures are logged and left for a later
    /// pass. Returns the number of rows written.
    fn flush(&self) -> Result<usize> {
        let todo: Vec<(Value, Value)> = {
            let mut state = self.shared.state.lock()?;
            let todo = state
                .slaves
                .iter()
                .map(|(ident, last)| {
                    (ident.doc().clone(), json!({"$set": {"syncedTo": last.as_u64()}}))
                })
                .collect();
            state.dirty = false;
            todo
        };

        self.shared.flushing.store(true, Ordering::SeqCst);
        let mut written = 0;
        for (key, update) in &todo {
            match self.store.upsert(SLAVES_NS, key, update) {
                Ok(()) => written += 1,
                Err(err) => error!("failed to update {SLAVES_NS} row {key}: {err}"),
            }
        }
        self.shared.flushing.store(false, Ordering::SeqCst);

        debug!(
            "flushed syncedTo for slaves [{}]",
            todo.iter().filter_map(|(key, _)| key.get("_id")).join(", ")
        );
        self.shared.replicated.notify_all();
        Ok(written)
    }
}
