//! Registry store: the crate's seam to the shared node database.
//!
//! The relational driver is an external collaborator; [`Database`] captures
//! the transactional API and clock function the HA manager needs from it.
//! [`RegistryStore`] wraps a driver with the connection-state discipline
//! the manager relies on:
//!
//! - while the connection is down, every operation is a no-op returning
//!   [`DbError::Offline`] and reconnect is attempted lazily inside the
//!   next [`RegistryStore::begin`];
//! - a fatal driver error is sticky and poisons all further operations;
//! - an offline failure mid-transaction silently drops the transaction
//!   and closes the connection;
//! - audit entries recorded during a transaction flush with its commit
//!   and are discarded otherwise.

pub mod memory;

use crate::audit::{AuditEntry, AuditLog};
use crate::types::{Cuid, NodeRecord, NodeStatus};
use thiserror::Error;
use tracing::debug;

/// Database-tier error: retryable connection loss or fatal failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    /// Connection lost; the operation may be retried on a later tick.
    #[error("database is offline")]
    Offline,

    /// Query or constraint failure; not retryable.
    #[error("database error: {0}")]
    Fatal(String),
}

/// Result type for database operations.
pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for crate::error::HavenError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Offline => crate::error::HavenError::DbOffline,
            DbError::Fatal(detail) => crate::error::HavenError::Database(detail),
        }
    }
}

/// Global HA settings stored in the shared database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalSettings {
    /// Failover delay in seconds.
    pub failover_delay: i64,
    /// Whether audit entries are recorded.
    pub audit_enabled: bool,
}

/// Field subset written by a node row update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeUpdate {
    pub status: Option<NodeStatus>,
    /// Refresh `lastaccess` to the database clock.
    pub touch: bool,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub session: Option<Cuid>,
}

impl NodeUpdate {
    /// An update that only refreshes `lastaccess`.
    pub fn touch() -> Self {
        NodeUpdate {
            touch: true,
            ..Default::default()
        }
    }

    /// An update that only changes the status.
    pub fn status(status: NodeStatus) -> Self {
        NodeUpdate {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Transactional API and clock function assumed from the database driver.
///
/// All node reads return rows ordered by node id. `fetch_nodes` with
/// `lock = true` must take row locks on the whole table and hold them
/// until commit or rollback, serializing state transitions across nodes;
/// `fetch_settings` with `lock = true` locks the settings row.
pub trait Database: Send {
    fn connect(&mut self) -> DbResult<()>;
    fn close(&mut self);

    fn begin(&mut self) -> DbResult<()>;
    fn commit(&mut self) -> DbResult<()>;
    fn rollback(&mut self) -> DbResult<()>;

    fn fetch_nodes(&mut self, lock: bool) -> DbResult<Vec<NodeRecord>>;
    /// The database server's own clock, in seconds.
    fn fetch_time(&mut self) -> DbResult<i64>;
    fn fetch_settings(&mut self, lock: bool) -> DbResult<GlobalSettings>;

    /// Insert a node row in status stopped with `lastaccess` set to the
    /// database clock.
    fn insert_node(&mut self, id: &Cuid, name: &str) -> DbResult<()>;
    fn update_node(&mut self, id: &Cuid, update: &NodeUpdate) -> DbResult<()>;
    fn delete_node(&mut self, id: &Cuid) -> DbResult<()>;

    fn update_failover_delay(&mut self, delay: i64) -> DbResult<()>;

    /// Append audit entries as part of the open transaction.
    fn append_audit(&mut self, entries: &[AuditEntry]) -> DbResult<()>;
}

/// Connection state tracked by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbState {
    Ok,
    Down,
    Fail,
}

/// Wrapper over a [`Database`] driver carrying connection state and the
/// transactional audit log.
pub struct RegistryStore<D: Database> {
    db: D,
    state: DbState,
    audit: AuditLog,
}

impl<D: Database> RegistryStore<D> {
    pub fn new(db: D) -> Self {
        RegistryStore {
            db,
            state: DbState::Down,
            audit: AuditLog::new(),
        }
    }

    pub fn state(&self) -> DbState {
        self.state
    }

    pub fn is_ok(&self) -> bool {
        self.state == DbState::Ok
    }

    /// Start a transaction, reconnecting first if the connection is down.
    pub fn begin(&mut self) -> DbResult<()> {
        if self.state == DbState::Down {
            match self.db.connect() {
                Ok(()) => {
                    debug!("registry database connection established");
                    self.state = DbState::Ok;
                }
                Err(DbError::Offline) => return Err(DbError::Offline),
                Err(err) => {
                    self.state = DbState::Fail;
                    return Err(err);
                }
            }
        }

        self.op(|db| db.begin())
    }

    /// Commit the open transaction. An offline failure rolls back and
    /// closes the connection; a fatal failure is sticky.
    pub fn commit(&mut self) -> DbResult<()> {
        self.guard()?;
        match self.db.commit() {
            Ok(()) => Ok(()),
            Err(DbError::Offline) => {
                let _ = self.db.rollback();
                self.db.close();
                self.state = DbState::Down;
                Err(DbError::Offline)
            }
            Err(err) => {
                let _ = self.db.rollback();
                self.state = DbState::Fail;
                Err(err)
            }
        }
    }

    /// Roll back the open transaction, discarding pending audit entries.
    pub fn rollback(&mut self) {
        self.audit.clear();
        if self.state != DbState::Ok {
            return;
        }
        match self.db.rollback() {
            Ok(()) => {}
            Err(DbError::Offline) => {
                self.db.close();
                self.state = DbState::Down;
            }
            Err(_) => self.state = DbState::Fail,
        }
    }

    pub fn close(&mut self) {
        self.db.close();
        if self.state == DbState::Ok {
            self.state = DbState::Down;
        }
    }

    pub fn nodes(&mut self, lock: bool) -> DbResult<Vec<NodeRecord>> {
        self.op(|db| db.fetch_nodes(lock))
    }

    pub fn db_time(&mut self) -> DbResult<i64> {
        self.op(|db| db.fetch_time())
    }

    pub fn settings(&mut self, lock: bool) -> DbResult<GlobalSettings> {
        self.op(|db| db.fetch_settings(lock))
    }

    pub fn insert_node(&mut self, id: &Cuid, name: &str) -> DbResult<()> {
        self.op(|db| db.insert_node(id, name))
    }

    pub fn update_node(&mut self, id: &Cuid, update: &NodeUpdate) -> DbResult<()> {
        self.op(|db| db.update_node(id, update))
    }

    pub fn delete_node(&mut self, id: &Cuid) -> DbResult<()> {
        self.op(|db| db.delete_node(id))
    }

    pub fn update_failover_delay(&mut self, delay: i64) -> DbResult<()> {
        self.op(|db| db.update_failover_delay(delay))
    }

    /// Start an audit batch for the current transaction.
    pub fn begin_audit(&mut self, enabled: bool) {
        self.audit.begin(enabled);
    }

    pub fn audit(&mut self) -> &mut AuditLog {
        &mut self.audit
    }

    /// Flush the accumulated audit batch into the open transaction.
    ///
    /// When the connection is not usable the batch is discarded without
    /// error; the surrounding transaction already failed.
    pub fn flush_audit(&mut self) -> DbResult<()> {
        let entries = self.audit.take();
        if entries.is_empty() || self.state != DbState::Ok {
            return Ok(());
        }
        self.op(|db| db.append_audit(&entries))
    }

    fn guard(&self) -> DbResult<()> {
        match self.state {
            DbState::Ok => Ok(()),
            DbState::Down => Err(DbError::Offline),
            DbState::Fail => Err(DbError::Fatal("database error".to_string())),
        }
    }

    fn op<T>(&mut self, f: impl FnOnce(&mut D) -> DbResult<T>) -> DbResult<T> {
        self.guard()?;
        match f(&mut self.db) {
            Ok(value) => Ok(value),
            Err(DbError::Offline) => {
                debug!("registry database connection lost");
                self.db.close();
                self.state = DbState::Down;
                Err(DbError::Offline)
            }
            Err(err) => {
                self.state = DbState::Fail;
                Err(err)
            }
        }
    }
}
