//! The HA manager control loop.
//!
//! One [`HaManager`] runs as a dedicated task with a single logical thread
//! of control: a cooperative loop interleaving registry transactions with
//! IPC reception. Every `poll_period` it re-evaluates its role against the
//! shared registry (under the table row lock), refreshes its own lease and
//! notifies the parent of status changes; between polls it services parent
//! and administrative requests with a timeout that expires at the next
//! tick. While the database is down the poll rate accelerates to the base
//! tick so a reconnect is noticed before a short failover delay forces an
//! unnecessary demotion.

use crate::audit::AuditEntry;
use crate::config::{HaSettings, DEFAULT_FAILOVER_DELAY};
use crate::error::{HavenError, Result};
use crate::ipc::{ClientId, HaReply, HaRequest, IpcService};
use crate::lease::{self, ActiveCheck, ActiveWatch};
use crate::logging::LogHandle;
use crate::registry::{Database, DbError, NodeUpdate, RegistryStore};
use crate::types::{Cuid, HaStatus, NodeListEntry, NodeRecord, NodeStatus};
use tracing::{debug, error, info, warn};

/// The HA manager: registry state machine plus notification service.
pub struct HaManager<D: Database> {
    settings: HaSettings,
    store: RegistryStore<D>,
    session: Cuid,
    node_id: Option<Cuid>,
    status: HaStatus,
    failover_delay: i64,
    audit_enabled: bool,
    watch: ActiveWatch,
    error: Option<String>,
    log: Option<LogHandle>,
}

impl<D: Database> HaManager<D> {
    /// Create a manager over the given registry database.
    ///
    /// `initial_status` is `Unknown` on a cold start (triggering
    /// registration on the first tick) or a previously persisted status
    /// when resuming.
    pub fn new(settings: HaSettings, db: D, initial_status: HaStatus) -> Self {
        HaManager {
            settings,
            store: RegistryStore::new(db),
            session: Cuid::generate(),
            node_id: None,
            status: initial_status,
            failover_delay: DEFAULT_FAILOVER_DELAY,
            audit_enabled: false,
            watch: ActiveWatch::default(),
            error: None,
            log: None,
        }
    }

    /// Attach the runtime log-level handle driving LogLevelUp/Down.
    pub fn with_log_handle(mut self, log: LogHandle) -> Self {
        self.log = Some(log);
        self
    }

    /// Resume with the session id of a previous manager incarnation in
    /// the same process.
    pub fn with_session(mut self, session: Cuid) -> Self {
        self.session = session;
        self
    }

    pub fn settings(&self) -> &HaSettings {
        &self.settings
    }

    pub fn status(&self) -> HaStatus {
        self.status
    }

    pub fn last_error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn node_id(&self) -> Option<&Cuid> {
        self.node_id.as_ref()
    }

    pub fn session(&self) -> &Cuid {
        &self.session
    }

    pub fn failover_delay(&self) -> i64 {
        self.failover_delay
    }

    /// Run the manager until stopped.
    ///
    /// Returns an error only on notification-channel failures; admission
    /// and ownership violations end in the paused state awaiting `Stop`,
    /// with the reason reported through the status protocol.
    pub async fn run(mut self) -> Result<()> {
        info!("starting HA manager");

        let mut service = match IpcService::bind(&self.settings.socket_path).await {
            Ok(service) => service,
            Err(e) => {
                error!("cannot start HA manager service: {}", e);
                return Err(e);
            }
        };

        let mut parent: Option<ClientId> = None;
        let mut pause = false;
        let mut stop = false;

        let mut tick = tokio::time::Instant::now();

        if self.status == HaStatus::Unknown {
            self.poll_registry();
        }

        let base = self.settings.heartbeat_interval;
        let poll_ticks = self.poll_ticks();
        let mut ticks: i64 = 0;
        // Double the initial registry check delay in standby mode so a
        // just-demoted or restarted node does not immediately reclaim
        // leadership.
        let mut nextcheck: i64 = if self.status == HaStatus::Standby {
            poll_ticks * 2
        } else {
            poll_ticks
        };

        info!("HA manager started in {} mode", self.status);

        while !pause && self.status != HaStatus::Error {
            let now = tokio::time::Instant::now();
            if tick <= now {
                ticks += 1;

                if nextcheck <= ticks {
                    let old_status = self.status;
                    self.poll_registry();

                    if let Some(parent_id) = parent {
                        if old_status != self.status && self.status != HaStatus::Unknown {
                            self.update_parent(&mut service, parent_id)?;
                        }
                    }

                    if self.status == HaStatus::Error {
                        break;
                    }

                    let delay = if self.store.is_ok() { poll_ticks } else { 1 };
                    while nextcheck <= ticks {
                        nextcheck += delay;
                    }
                }

                if let Some(parent_id) = parent {
                    if self.store.is_ok() {
                        self.send_heartbeat(&mut service, parent_id)?;
                    }
                }

                while tick <= now {
                    tick += base;
                }
            }

            let wait = tick.saturating_duration_since(tokio::time::Instant::now());
            if let Some((client, request)) = service.recv(wait).await {
                match request {
                    HaRequest::Register => {
                        debug!(client, "parent process registered");
                        parent = Some(client);
                    }
                    HaRequest::RequestStatus => {
                        self.update_parent(&mut service, parent.unwrap_or(client))?;
                    }
                    HaRequest::Stop => {
                        stop = true;
                        pause = true;
                    }
                    HaRequest::Pause => pause = true,
                    HaRequest::GetNodes => self.send_node_list(&mut service, client),
                    HaRequest::RemoveNode { index } => {
                        let result = self.remove_node_by_index(index);
                        let reply = HaReply::RemoveNode { error: result.err() };
                        if let Err(e) = service.send(client, reply) {
                            debug!("cannot reply to remove node request: {}", e);
                        }
                    }
                    HaRequest::SetFailoverDelay { seconds } => {
                        let result = self.set_failover_delay(seconds);
                        let reply = HaReply::SetFailoverDelay { error: result.err() };
                        if let Err(e) = service.send(client, reply) {
                            debug!("cannot reply to failover delay request: {}", e);
                        }
                        if let Some(parent_id) = parent {
                            self.update_parent(&mut service, parent_id)?;
                        }
                    }
                    HaRequest::LogLevelUp => self.change_log_level(true),
                    HaRequest::LogLevelDown => self.change_log_level(false),
                }
            }
        }

        info!("HA manager has been paused");

        while !stop {
            let received = service.recv(self.settings.poll_period).await;

            if self.status.is_live_status() {
                self.refresh_lastaccess();
            }

            if let Some((client, request)) = received {
                match request {
                    HaRequest::Register => parent = Some(client),
                    HaRequest::RequestStatus => {
                        self.update_parent(&mut service, parent.unwrap_or(client))?;
                    }
                    HaRequest::Stop => stop = true,
                    _ => {}
                }
            }
        }

        self.update_exit_status();
        self.store.close();
        service.close();

        info!("HA manager has been stopped");
        Ok(())
    }

    /// Advance the registry state machine by one poll: registration while
    /// the status is unknown, the role liveness check afterwards.
    pub fn poll_registry(&mut self) {
        match self.status {
            HaStatus::Error => {}
            HaStatus::Unknown => self.register(),
            _ => self.check_nodes(),
        }
    }

    fn poll_ticks(&self) -> i64 {
        let base = self.settings.heartbeat_interval.as_secs_f64();
        ((self.settings.poll_period.as_secs_f64() / base).round() as i64).max(1)
    }

    fn failover_ticks(&self) -> i64 {
        (self.failover_delay as f64 / self.settings.poll_period.as_secs_f64()) as i64 + 1
    }

    /// Record a terminal error; the first error wins.
    fn set_error(&mut self, message: String) {
        if self.status == HaStatus::Error {
            return;
        }
        error!("{}", message);
        self.error = Some(message);
        self.status = HaStatus::Error;
    }

    fn fail(&mut self, err: HavenError) {
        self.store.rollback();
        match err {
            HavenError::DbOffline => {}
            HavenError::Database(detail) => {
                warn!("registry database failure: {}", detail);
                self.set_error("database error".to_string());
            }
            HavenError::Fatal(message) => self.set_error(message),
            other => self.set_error(other.to_string()),
        }
    }

    fn commit_or_flag(&mut self) -> bool {
        match self.store.commit() {
            Ok(()) => true,
            Err(DbError::Offline) => false,
            Err(DbError::Fatal(detail)) => {
                warn!("registry database failure: {}", detail);
                self.set_error("database error".to_string());
                false
            }
        }
    }

    /// Registration: find or create the node row, then claim a role.
    fn register(&mut self) {
        self.create_node_row();

        if self.node_id.is_none() || self.status == HaStatus::Error {
            return;
        }

        match self.register_tx() {
            Ok(target) => {
                if self.commit_or_flag() {
                    self.status = target;
                }
            }
            Err(e) => self.fail(e),
        }
    }

    fn create_node_row(&mut self) {
        if self.node_id.is_some() {
            return;
        }
        match self.create_node_tx() {
            Ok(node_id) => {
                if self.commit_or_flag() {
                    self.node_id = Some(node_id);
                }
            }
            Err(e) => self.fail(e),
        }
    }

    fn create_node_tx(&mut self) -> Result<Cuid> {
        self.store.begin()?;
        let nodes = self.store.nodes(false)?;

        let settings = self.store.settings(false)?;
        self.failover_delay = settings.failover_delay;
        self.audit_enabled = settings.audit_enabled;

        if let Some(existing) = lease::find_by_name(&nodes, &self.settings.node_name) {
            return Ok(existing.id.clone());
        }

        let db_time = self.store.db_time()?;
        if self.settings.is_cluster() {
            lease::check_cluster(&self.settings.node_name, &nodes, db_time, self.failover_delay)?;
        } else {
            lease::check_standalone(&nodes, db_time, self.failover_delay)?;
        }

        let node_id = Cuid::generate();
        self.store.insert_node(&node_id, &self.settings.node_name)?;

        self.store.begin_audit(self.audit_enabled);
        self.store.audit().push(AuditEntry::node_add(
            &node_id,
            &self.settings.node_name,
            NodeStatus::Stopped,
        ));
        self.store.flush_audit()?;

        Ok(node_id)
    }

    fn register_tx(&mut self) -> Result<HaStatus> {
        self.store.begin()?;
        let nodes = self.store.nodes(true)?;
        let db_time = self.store.db_time()?;

        let activate = if self.settings.is_cluster() {
            lease::check_cluster(&self.settings.node_name, &nodes, db_time, self.failover_delay)?
                .activate
        } else {
            lease::check_standalone(&nodes, db_time, self.failover_delay)?;
            true
        };

        let node = lease::find_by_name(&nodes, &self.settings.node_name).ok_or_else(|| {
            HavenError::Fatal(format!(
                "cannot find node \"{}\" in registry",
                self.settings.node_name
            ))
        })?;

        let target = if activate {
            HaStatus::Active
        } else {
            HaStatus::Standby
        };
        let target_row = target.as_node_status().expect("target is a row status");

        let (address, port) = self.settings.external_address()?;

        let mut update = NodeUpdate {
            touch: true,
            session: Some(self.session.clone()),
            ..Default::default()
        };
        let mut entry = AuditEntry::node_update(&node.id, &node.name);

        if node.status != target_row {
            entry = entry.with_change("status", node.status.as_i32(), target_row.as_i32());
            update.status = Some(target_row);
        }
        if node.address != address {
            entry = entry.with_change("address", &node.address, &address);
            update.address = Some(address);
        }
        if node.port != port {
            entry = entry.with_change("port", node.port, port);
            update.port = Some(port);
        }

        self.store.begin_audit(self.audit_enabled);
        self.store.update_node(&node.id, &update)?;
        self.store.audit().push(entry);

        // Claiming the role with no live peer around: any row still
        // marked active is an expired leftover and must not keep the
        // registry with two active rows.
        if activate {
            for stale in lease::stale_actives(&nodes, &node.id) {
                self.store
                    .update_node(&stale.id, &NodeUpdate::status(NodeStatus::Unavailable))?;
                self.store.audit().push(
                    AuditEntry::node_update(&stale.id, &stale.name).with_change(
                        "status",
                        stale.status.as_i32(),
                        NodeStatus::Unavailable.as_i32(),
                    ),
                );
            }
        }

        self.store.flush_audit()?;

        Ok(target)
    }

    /// The per-tick liveness check for an already registered node.
    fn check_nodes(&mut self) {
        match self.check_nodes_tx() {
            Ok(target) => {
                if self.commit_or_flag() {
                    if self.status != target {
                        info!("HA status changed from {} to {}", self.status, target);
                    }
                    self.status = target;
                }
            }
            Err(e) => self.fail(e),
        }
    }

    fn check_nodes_tx(&mut self) -> Result<HaStatus> {
        self.store.begin()?;
        let mut target = self.status;

        let nodes = self.store.nodes(true)?;

        let node = lease::find_by_name(&nodes, &self.settings.node_name)
            .ok_or_else(|| {
                HavenError::Fatal(format!(
                    "cannot find node \"{}\" in registry",
                    self.settings.node_name
                ))
            })?
            .clone();

        if node.session.as_ref() != Some(&self.session) {
            return Err(HavenError::Fatal(
                "HA registry record has changed ownership".to_string(),
            ));
        }

        // Recover the node id after a manager restart.
        if self.node_id.is_none() {
            self.node_id = Some(node.id.clone());
        }

        let settings = self.store.settings(false)?;
        self.failover_delay = settings.failover_delay;
        self.audit_enabled = settings.audit_enabled;

        let db_time = self.store.db_time()?;

        let mut stale_active: Option<NodeRecord> = None;

        if self.settings.is_cluster() {
            if self.status == HaStatus::Active {
                match lease::check_active_self(&node.id, &nodes)? {
                    lease::ActiveSelfCheck::Retain => {
                        self.sweep_stale_standbys(&nodes, db_time)?;
                    }
                    lease::ActiveSelfCheck::Demote { other_name, .. } => {
                        info!(
                            "active role taken over by node \"{}\", switching to standby",
                            other_name
                        );
                        target = HaStatus::Standby;
                        self.watch = ActiveWatch::default();
                    }
                }
            } else {
                let failover_ticks = self.failover_ticks();
                match lease::check_active_peer(
                    &node.id,
                    &nodes,
                    &mut self.watch,
                    failover_ticks,
                )? {
                    ActiveCheck::Promote => target = HaStatus::Active,
                    ActiveCheck::TakeOver { stale } => {
                        target = HaStatus::Active;
                        stale_active = nodes.iter().find(|n| n.id == stale).cloned();
                    }
                    ActiveCheck::Wait => {}
                }
            }
        } else {
            // Standalone stays admissible only while no named node is
            // live; a cluster that took over during an outage wins.
            lease::check_standalone(&nodes, db_time, self.failover_delay)?;
        }

        // Refresh the lease; record the status change and any takeover in
        // one audit batch flushed with this commit.
        self.store.begin_audit(self.audit_enabled);

        let mut update = NodeUpdate::touch();
        if let Some(target_row) = target.as_node_status() {
            if node.status != target_row {
                update.status = Some(target_row);
                self.store.audit().push(
                    AuditEntry::node_update(&node.id, &node.name).with_change(
                        "status",
                        node.status.as_i32(),
                        target_row.as_i32(),
                    ),
                );
            }
        }
        self.store.update_node(&node.id, &update)?;

        if let Some(stale) = stale_active {
            warn!(
                "marking stalled active node \"{}\" as unavailable",
                stale.name
            );
            self.store
                .update_node(&stale.id, &NodeUpdate::status(NodeStatus::Unavailable))?;
            self.store.audit().push(
                AuditEntry::node_update(&stale.id, &stale.name).with_change(
                    "status",
                    stale.status.as_i32(),
                    NodeStatus::Unavailable.as_i32(),
                ),
            );
        }

        self.store.flush_audit()?;
        Ok(target)
    }

    /// Mark standby peers with expired leases unavailable; run by the
    /// active node with its own audit batch.
    fn sweep_stale_standbys(&mut self, nodes: &[NodeRecord], db_time: i64) -> Result<()> {
        let stale: Vec<NodeRecord> = lease::stale_standbys(nodes, db_time, self.failover_delay)
            .into_iter()
            .cloned()
            .collect();
        if stale.is_empty() {
            return Ok(());
        }

        self.store.begin_audit(self.audit_enabled);
        for node in &stale {
            info!("standby node \"{}\" became unavailable", node.name);
            self.store
                .update_node(&node.id, &NodeUpdate::status(NodeStatus::Unavailable))?;
            self.store.audit().push(
                AuditEntry::node_update(&node.id, &node.name).with_change(
                    "status",
                    node.status.as_i32(),
                    NodeStatus::Unavailable.as_i32(),
                ),
            );
        }
        self.store.flush_audit()?;
        Ok(())
    }

    /// Lease refresh for the paused manager.
    fn refresh_lastaccess(&mut self) {
        let Some(node_id) = self.node_id.clone() else {
            return;
        };
        match self.refresh_tx(&node_id) {
            Ok(()) => {
                self.commit_or_flag();
            }
            Err(e) => self.fail(e),
        }
    }

    fn refresh_tx(&mut self, node_id: &Cuid) -> Result<()> {
        self.store.begin()?;
        self.store.nodes(true)?;
        self.store.update_node(node_id, &NodeUpdate::touch())?;
        Ok(())
    }

    /// Final transaction on shutdown: leave the own row stopped.
    fn update_exit_status(&mut self) {
        if !self.status.is_live_status() {
            return;
        }
        let Some(node_id) = self.node_id.clone() else {
            return;
        };
        match self.exit_tx(&node_id) {
            Ok(()) => {
                self.commit_or_flag();
            }
            Err(e) => self.fail(e),
        }
    }

    fn exit_tx(&mut self, node_id: &Cuid) -> Result<()> {
        self.store.begin()?;
        let nodes = self.store.nodes(true)?;
        self.store
            .update_node(node_id, &NodeUpdate::status(NodeStatus::Stopped))?;

        let name = nodes
            .iter()
            .find(|n| &n.id == node_id)
            .map(|n| n.name.clone())
            .unwrap_or_default();
        let old_status = self
            .status
            .as_node_status()
            .map(|s| s.as_i32())
            .unwrap_or(-1);

        self.store.begin_audit(self.audit_enabled);
        self.store.audit().push(
            AuditEntry::node_update(node_id, &name).with_change(
                "status",
                old_status,
                NodeStatus::Stopped.as_i32(),
            ),
        );
        self.store.flush_audit()?;
        Ok(())
    }

    fn update_parent(&mut self, service: &mut IpcService, parent: ClientId) -> Result<()> {
        debug!(status = %self.status, "sending HA status notification");
        let reply = HaReply::StatusUpdate {
            status: self.status,
            failover_delay: self.failover_delay,
            error: self.error.clone(),
        };
        service.send(parent, reply).map_err(|e| {
            error!("cannot send HA notification to main process");
            e
        })
    }

    fn send_heartbeat(&mut self, service: &mut IpcService, parent: ClientId) -> Result<()> {
        service.send(parent, HaReply::Heartbeat).map_err(|e| {
            error!("cannot send HA heartbeat to main process");
            e
        })
    }

    fn send_node_list(&mut self, service: &mut IpcService, client: ClientId) {
        let reply = match self.nodes_json() {
            Ok(payload) => HaReply::NodeList { ok: true, payload },
            Err(error) => HaReply::NodeList {
                ok: false,
                payload: error,
            },
        };
        if let Err(e) = service.send(client, reply) {
            debug!("cannot reply to node list request: {}", e);
        }
    }

    /// Serialize the node table for the `GetNodes` reply.
    fn nodes_json(&mut self) -> std::result::Result<String, String> {
        match self.nodes_json_tx() {
            Ok(json) => match self.store.commit() {
                Ok(()) => Ok(json),
                Err(_) => Err("database error".to_string()),
            },
            Err(_) => {
                self.store.rollback();
                Err("database error".to_string())
            }
        }
    }

    fn nodes_json_tx(&mut self) -> Result<String> {
        self.store.begin()?;
        let db_time = self.store.db_time()?;
        let nodes = self.store.nodes(false)?;

        let entries: Vec<NodeListEntry> = nodes
            .iter()
            .map(|n| NodeListEntry::from_record(n, db_time))
            .collect();
        Ok(serde_json::to_string(&entries)?)
    }

    /// Remove a node by its 1-based index in the id-ordered list.
    fn remove_node_by_index(&mut self, index: u32) -> std::result::Result<(), String> {
        match self.remove_node_tx(index) {
            Ok((id, name)) => match self.store.commit() {
                Ok(()) => {
                    warn!("removed node \"{}\" with ID \"{}\"", name, id);
                    Ok(())
                }
                Err(_) => Err("database connection problem".to_string()),
            },
            Err(message) => {
                self.store.rollback();
                Err(message)
            }
        }
    }

    fn remove_node_tx(&mut self, index: u32) -> std::result::Result<(Cuid, String), String> {
        self.store
            .begin()
            .map_err(|_| "database connection problem".to_string())?;
        let nodes = self
            .store
            .nodes(true)
            .map_err(|_| "database connection problem".to_string())?;

        let node = (index as usize)
            .checked_sub(1)
            .and_then(|i| nodes.get(i))
            .ok_or_else(|| "node index out of range".to_string())?;

        if node.status.is_live_status() {
            return Err(format!("node is {}", node.status));
        }

        self.store
            .delete_node(&node.id)
            .map_err(|_| "database connection problem".to_string())?;

        self.store.begin_audit(self.audit_enabled);
        self.store
            .audit()
            .push(AuditEntry::node_delete(&node.id, &node.name));
        self.store
            .flush_audit()
            .map_err(|_| "database connection problem".to_string())?;

        Ok((node.id.clone(), node.name.clone()))
    }

    /// Change the global failover delay; old and new value are read and
    /// written inside one locked transaction.
    fn set_failover_delay(&mut self, seconds: i64) -> std::result::Result<(), String> {
        if seconds <= 0 {
            return Err("invalid failover delay".to_string());
        }

        match self.set_failover_tx(seconds) {
            Ok(()) => match self.store.commit() {
                Ok(()) => {
                    self.failover_delay = seconds;
                    warn!("HA failover delay set to {}s", seconds);
                    Ok(())
                }
                Err(_) => Err("database error".to_string()),
            },
            Err(_) => {
                self.store.rollback();
                Err("database error".to_string())
            }
        }
    }

    fn set_failover_tx(&mut self, seconds: i64) -> Result<()> {
        self.store.begin()?;
        let settings = self.store.settings(true)?;
        self.store.update_failover_delay(seconds)?;

        self.store.begin_audit(self.audit_enabled);
        self.store.audit().push(AuditEntry::settings_update().with_change(
            "ha_failover_delay",
            settings.failover_delay,
            seconds,
        ));
        self.store.flush_audit()?;
        Ok(())
    }

    fn change_log_level(&mut self, up: bool) {
        let direction = if up { "increase" } else { "decrease" };
        let Some(log) = &self.log else {
            info!("cannot {} log level: no log handle registered", direction);
            return;
        };

        let result = if up { log.increase() } else { log.decrease() };
        match result {
            Ok(level) => info!(
                "log level has been {}d to {}",
                direction,
                level
            ),
            Err(e) => info!("cannot {} log level: {}", direction, e),
        }
    }
}
