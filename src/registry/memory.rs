//! In-memory registry database backend.
//!
//! [`ClusterRegistry`] holds the shared state one relational database
//! would: the node table, the global settings row, the audit sink and the
//! database clock. [`MemoryDatabase`] is a per-node connection handle
//! implementing [`Database`], with buffered transactional writes, a table
//! lock honoring `FOR UPDATE` semantics and an independently severable
//! connection. Integration tests and embedded deployments run several
//! nodes against one registry, exactly like peers sharing a database.

use super::{Database, DbError, DbResult, GlobalSettings, NodeUpdate};
use crate::audit::AuditEntry;
use crate::config::DEFAULT_FAILOVER_DELAY;
use crate::types::{Cuid, NodeRecord, NodeStatus};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long a handle waits for a contended row lock before failing.
const LOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct SharedState {
    nodes: BTreeMap<Cuid, NodeRecord>,
    settings: GlobalSettings,
    audit: Vec<AuditEntry>,
    clock_base: i64,
    clock_offset: i64,
    table_lock: Option<u64>,
    settings_lock: Option<u64>,
    next_handle: u64,
}

/// The shared registry state; clone handles from it for each node.
#[derive(Clone)]
pub struct ClusterRegistry {
    inner: Arc<Mutex<SharedState>>,
    started: Instant,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::with_failover_delay(DEFAULT_FAILOVER_DELAY)
    }

    pub fn with_failover_delay(failover_delay: i64) -> Self {
        ClusterRegistry {
            inner: Arc::new(Mutex::new(SharedState {
                nodes: BTreeMap::new(),
                settings: GlobalSettings {
                    failover_delay,
                    audit_enabled: true,
                },
                audit: Vec::new(),
                clock_base: 1_000_000,
                clock_offset: 0,
                table_lock: None,
                settings_lock: None,
                next_handle: 1,
            })),
            started: Instant::now(),
        }
    }

    /// Open a new connection handle for one node process.
    pub fn handle(&self) -> MemoryDatabase {
        let handle_id = {
            let mut state = self.inner.lock();
            let id = state.next_handle;
            state.next_handle += 1;
            id
        };

        MemoryDatabase {
            inner: Arc::clone(&self.inner),
            started: self.started,
            handle_id,
            offline: Arc::new(AtomicBool::new(false)),
            connected: false,
            in_tx: false,
            pending: Vec::new(),
            holds_table_lock: false,
            holds_settings_lock: false,
        }
    }

    /// Current database clock in seconds.
    pub fn db_time(&self) -> i64 {
        let state = self.inner.lock();
        clock_now(&state, self.started)
    }

    /// Shift the database clock forward.
    pub fn advance_clock(&self, seconds: i64) {
        self.inner.lock().clock_offset += seconds;
    }

    /// Snapshot of the node table, ordered by node id.
    pub fn nodes(&self) -> Vec<NodeRecord> {
        self.inner.lock().nodes.values().cloned().collect()
    }

    pub fn node_by_name(&self, name: &str) -> Option<NodeRecord> {
        self.inner
            .lock()
            .nodes
            .values()
            .find(|n| n.name == name)
            .cloned()
    }

    pub fn settings(&self) -> GlobalSettings {
        self.inner.lock().settings.clone()
    }

    pub fn set_audit_enabled(&self, enabled: bool) {
        self.inner.lock().settings.audit_enabled = enabled;
    }

    /// All audit entries flushed so far.
    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.inner.lock().audit.clone()
    }

    /// Overwrite a node row's session id, simulating another process
    /// claiming the row.
    pub fn set_node_session(&self, id: &Cuid, session: Cuid) {
        if let Some(node) = self.inner.lock().nodes.get_mut(id) {
            node.session = Some(session);
        }
    }
}

impl Default for ClusterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn clock_now(state: &SharedState, started: Instant) -> i64 {
    state.clock_base + started.elapsed().as_secs() as i64 + state.clock_offset
}

#[derive(Debug, Clone)]
enum PendingOp {
    Insert { id: Cuid, name: String },
    Update { id: Cuid, update: NodeUpdate },
    Delete { id: Cuid },
    SetFailoverDelay(i64),
    Audit(Vec<AuditEntry>),
}

/// One node's connection to a [`ClusterRegistry`].
pub struct MemoryDatabase {
    inner: Arc<Mutex<SharedState>>,
    started: Instant,
    handle_id: u64,
    offline: Arc<AtomicBool>,
    connected: bool,
    in_tx: bool,
    pending: Vec<PendingOp>,
    holds_table_lock: bool,
    holds_settings_lock: bool,
}

impl MemoryDatabase {
    /// Flag severing this handle's connectivity. Keep a clone before
    /// handing the database to a manager to simulate outages.
    pub fn outage_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.offline)
    }

    fn check_online(&mut self) -> DbResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            self.drop_connection();
            return Err(DbError::Offline);
        }
        if !self.connected {
            return Err(DbError::Offline);
        }
        Ok(())
    }

    fn drop_connection(&mut self) {
        self.connected = false;
        self.in_tx = false;
        self.pending.clear();
        self.release_locks();
    }

    fn release_locks(&mut self) {
        if self.holds_table_lock || self.holds_settings_lock {
            let mut state = self.inner.lock();
            if self.holds_table_lock && state.table_lock == Some(self.handle_id) {
                state.table_lock = None;
            }
            if self.holds_settings_lock && state.settings_lock == Some(self.handle_id) {
                state.settings_lock = None;
            }
        }
        self.holds_table_lock = false;
        self.holds_settings_lock = false;
    }

    fn acquire_lock(&mut self, settings_row: bool) -> DbResult<()> {
        if (settings_row && self.holds_settings_lock) || (!settings_row && self.holds_table_lock) {
            return Ok(());
        }

        let deadline = Instant::now() + LOCK_WAIT_TIMEOUT;
        loop {
            if self.offline.load(Ordering::SeqCst) {
                self.drop_connection();
                return Err(DbError::Offline);
            }

            {
                let mut state = self.inner.lock();
                let slot = if settings_row {
                    &mut state.settings_lock
                } else {
                    &mut state.table_lock
                };
                if slot.is_none() {
                    *slot = Some(self.handle_id);
                    if settings_row {
                        self.holds_settings_lock = true;
                    } else {
                        self.holds_table_lock = true;
                    }
                    return Ok(());
                }
            }

            if Instant::now() >= deadline {
                return Err(DbError::Fatal("row lock wait timeout".to_string()));
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn apply(state: &mut SharedState, now: i64, op: PendingOp) -> DbResult<()> {
        match op {
            PendingOp::Insert { id, name } => {
                if state.nodes.contains_key(&id) {
                    return Err(DbError::Fatal(format!("duplicate node id \"{}\"", id)));
                }
                state.nodes.insert(
                    id.clone(),
                    NodeRecord {
                        id,
                        name,
                        status: NodeStatus::Stopped,
                        lastaccess: now,
                        address: String::new(),
                        port: 0,
                        session: None,
                    },
                );
            }
            PendingOp::Update { id, update } => {
                if let Some(node) = state.nodes.get_mut(&id) {
                    if let Some(status) = update.status {
                        node.status = status;
                    }
                    if update.touch {
                        node.lastaccess = now;
                    }
                    if let Some(address) = update.address {
                        node.address = address;
                    }
                    if let Some(port) = update.port {
                        node.port = port;
                    }
                    if let Some(session) = update.session {
                        node.session = Some(session);
                    }
                }
            }
            PendingOp::Delete { id } => {
                state.nodes.remove(&id);
            }
            PendingOp::SetFailoverDelay(delay) => {
                state.settings.failover_delay = delay;
            }
            PendingOp::Audit(entries) => {
                state.audit.extend(entries);
            }
        }
        Ok(())
    }
}

impl Database for MemoryDatabase {
    fn connect(&mut self) -> DbResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(DbError::Offline);
        }
        self.connected = true;
        Ok(())
    }

    fn close(&mut self) {
        self.drop_connection();
    }

    fn begin(&mut self) -> DbResult<()> {
        self.check_online()?;
        self.in_tx = true;
        self.pending.clear();
        Ok(())
    }

    fn commit(&mut self) -> DbResult<()> {
        self.check_online()?;
        let ops = std::mem::take(&mut self.pending);
        let result = {
            let mut state = self.inner.lock();
            let now = clock_now(&state, self.started);
            ops.into_iter().try_for_each(|op| Self::apply(&mut state, now, op))
        };
        self.in_tx = false;
        self.release_locks();
        result
    }

    fn rollback(&mut self) -> DbResult<()> {
        self.check_online()?;
        self.pending.clear();
        self.in_tx = false;
        self.release_locks();
        Ok(())
    }

    fn fetch_nodes(&mut self, lock: bool) -> DbResult<Vec<NodeRecord>> {
        self.check_online()?;
        if lock {
            self.acquire_lock(false)?;
        }
        Ok(self.inner.lock().nodes.values().cloned().collect())
    }

    fn fetch_time(&mut self) -> DbResult<i64> {
        self.check_online()?;
        let state = self.inner.lock();
        Ok(clock_now(&state, self.started))
    }

    fn fetch_settings(&mut self, lock: bool) -> DbResult<GlobalSettings> {
        self.check_online()?;
        if lock {
            self.acquire_lock(true)?;
        }
        Ok(self.inner.lock().settings.clone())
    }

    fn insert_node(&mut self, id: &Cuid, name: &str) -> DbResult<()> {
        self.check_online()?;
        self.pending.push(PendingOp::Insert {
            id: id.clone(),
            name: name.to_string(),
        });
        Ok(())
    }

    fn update_node(&mut self, id: &Cuid, update: &NodeUpdate) -> DbResult<()> {
        self.check_online()?;
        self.pending.push(PendingOp::Update {
            id: id.clone(),
            update: update.clone(),
        });
        Ok(())
    }

    fn delete_node(&mut self, id: &Cuid) -> DbResult<()> {
        self.check_online()?;
        self.pending.push(PendingOp::Delete { id: id.clone() });
        Ok(())
    }

    fn update_failover_delay(&mut self, delay: i64) -> DbResult<()> {
        self.check_online()?;
        self.pending.push(PendingOp::SetFailoverDelay(delay));
        Ok(())
    }

    fn append_audit(&mut self, entries: &[AuditEntry]) -> DbResult<()> {
        self.check_online()?;
        self.pending.push(PendingOp::Audit(entries.to_vec()));
        Ok(())
    }
}

impl Drop for MemoryDatabase {
    fn drop(&mut self) {
        self.release_locks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected_handle(registry: &ClusterRegistry) -> MemoryDatabase {
        let mut db = registry.handle();
        db.connect().unwrap();
        db
    }

    #[test]
    fn test_insert_commits_stopped_row() {
        let registry = ClusterRegistry::new();
        let mut db = connected_handle(&registry);
        let id = Cuid::generate();

        db.begin().unwrap();
        db.insert_node(&id, "node-1").unwrap();
        db.commit().unwrap();

        let nodes = registry.nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "node-1");
        assert_eq!(nodes[0].status, NodeStatus::Stopped);
        assert_eq!(nodes[0].lastaccess, registry.db_time());
    }

    #[test]
    fn test_rollback_discards_writes() {
        let registry = ClusterRegistry::new();
        let mut db = connected_handle(&registry);

        db.begin().unwrap();
        db.insert_node(&Cuid::generate(), "node-1").unwrap();
        db.rollback().unwrap();

        assert!(registry.nodes().is_empty());
    }

    #[test]
    fn test_update_applies_subset() {
        let registry = ClusterRegistry::new();
        let mut db = connected_handle(&registry);
        let id = Cuid::generate();

        db.begin().unwrap();
        db.insert_node(&id, "node-1").unwrap();
        db.commit().unwrap();

        let session = Cuid::generate();
        db.begin().unwrap();
        db.update_node(
            &id,
            &NodeUpdate {
                status: Some(NodeStatus::Active),
                touch: true,
                address: Some("10.0.0.5".to_string()),
                port: Some(10051),
                session: Some(session.clone()),
            },
        )
        .unwrap();
        db.commit().unwrap();

        let node = registry.node_by_name("node-1").unwrap();
        assert_eq!(node.status, NodeStatus::Active);
        assert_eq!(node.address, "10.0.0.5");
        assert_eq!(node.session, Some(session));
    }

    #[test]
    fn test_severed_handle_goes_offline() {
        let registry = ClusterRegistry::new();
        let mut db = connected_handle(&registry);
        let flag = db.outage_flag();

        flag.store(true, Ordering::SeqCst);
        assert_eq!(db.begin(), Err(DbError::Offline));
        assert_eq!(db.connect(), Err(DbError::Offline));

        flag.store(false, Ordering::SeqCst);
        db.connect().unwrap();
        db.begin().unwrap();
    }

    #[test]
    fn test_outage_mid_transaction_discards_pending() {
        let registry = ClusterRegistry::new();
        let mut db = connected_handle(&registry);
        let flag = db.outage_flag();

        db.begin().unwrap();
        db.insert_node(&Cuid::generate(), "node-1").unwrap();
        flag.store(true, Ordering::SeqCst);
        assert_eq!(db.commit(), Err(DbError::Offline));

        flag.store(false, Ordering::SeqCst);
        assert!(registry.nodes().is_empty());
    }

    #[test]
    fn test_table_lock_blocks_second_handle() {
        let registry = ClusterRegistry::new();
        let mut first = connected_handle(&registry);

        first.begin().unwrap();
        first.fetch_nodes(true).unwrap();

        let registry2 = registry.clone();
        let contender = std::thread::spawn(move || {
            let mut second = connected_handle(&registry2);
            second.begin().unwrap();
            let start = Instant::now();
            second.fetch_nodes(true).unwrap();
            second.commit().unwrap();
            start.elapsed()
        });

        std::thread::sleep(Duration::from_millis(50));
        first.commit().unwrap();

        let waited = contender.join().unwrap();
        assert!(waited >= Duration::from_millis(40));
    }

    #[test]
    fn test_clock_advances_with_offset() {
        let registry = ClusterRegistry::new();
        let before = registry.db_time();
        registry.advance_clock(120);
        assert_eq!(registry.db_time(), before + 120);
    }

    #[test]
    fn test_audit_entries_commit_with_transaction() {
        let registry = ClusterRegistry::new();
        let mut db = connected_handle(&registry);

        db.begin().unwrap();
        db.append_audit(&[AuditEntry::settings_update()]).unwrap();
        db.rollback().unwrap();
        assert!(registry.audit_entries().is_empty());

        db.begin().unwrap();
        db.append_audit(&[AuditEntry::settings_update()]).unwrap();
        db.commit().unwrap();
        assert_eq!(registry.audit_entries().len(), 1);
    }
}
