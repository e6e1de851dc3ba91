//! Parent-side facade for the HA manager.
//!
//! The embedding server owns one [`HaClient`]: it spawns the manager,
//! holds the notification connection, and exposes the administrative
//! operations. [`HaClient::receive_status`] also carries the client-side
//! safety net: while this node believes it is active, missing heartbeats
//! for `failover_delay - poll_period` forces the returned status to
//! standby so the server initiates teardown even if the manager is hung
//! inside the database driver.

use crate::config::{HaSettings, DEFAULT_FAILOVER_DELAY};
use crate::error::{HavenError, Result};
use crate::ipc::{self, HaReply, HaRequest};
use crate::manager::HaManager;
use crate::registry::Database;
use crate::types::HaStatus;
use std::time::{Duration, Instant};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Client handle held by the embedding server process.
pub struct HaClient {
    settings: HaSettings,
    writer: OwnedWriteHalf,
    replies: mpsc::UnboundedReceiver<HaReply>,
    reader: JoinHandle<()>,
    manager: Option<JoinHandle<Result<()>>>,
    status: HaStatus,
    failover_delay: i64,
    last_heartbeat: Option<Instant>,
}

impl HaClient {
    /// Spawn the HA manager over the given registry database, connect to
    /// its service and register as the notification target.
    pub async fn start<D>(settings: HaSettings, db: D, initial_status: HaStatus) -> Result<Self>
    where
        D: Database + 'static,
    {
        settings.validate()?;
        Self::start_manager(HaManager::new(settings, db, initial_status)).await
    }

    /// Spawn a pre-built manager (e.g. one carrying a log handle or a
    /// resumed session id).
    pub async fn start_manager<D>(manager: HaManager<D>) -> Result<Self>
    where
        D: Database + 'static,
    {
        let settings = manager.settings().clone();
        let handle = tokio::spawn(manager.run());
        Self::connect_inner(settings, Some(handle)).await
    }

    /// Attach to an already running manager service.
    pub async fn connect(settings: HaSettings) -> Result<Self> {
        Self::connect_inner(settings, None).await
    }

    async fn connect_inner(
        settings: HaSettings,
        manager: Option<JoinHandle<Result<()>>>,
    ) -> Result<Self> {
        let deadline = Instant::now() + settings.service_timeout;

        let stream = loop {
            if let Some(handle) = &manager {
                if handle.is_finished() {
                    return Err(HavenError::Ipc(
                        "cannot connect to HA manager process: manager exited".to_string(),
                    ));
                }
            }

            match UnixStream::connect(&settings.socket_path).await {
                Ok(stream) => break stream,
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(HavenError::Ipc(format!(
                            "cannot connect to HA manager process: {}",
                            e
                        )));
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        };

        let (mut read_half, writer) = stream.into_split();
        let (reply_tx, replies) = mpsc::unbounded_channel();

        let reader = tokio::spawn(async move {
            loop {
                match ipc::read_frame::<HaReply, _>(&mut read_half).await {
                    Ok(Some(reply)) => {
                        if reply_tx.send(reply).is_err() {
                            break;
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        });

        let mut client = HaClient {
            settings,
            writer,
            replies,
            reader,
            manager,
            status: HaStatus::Unknown,
            failover_delay: DEFAULT_FAILOVER_DELAY,
            last_heartbeat: None,
        };

        client.send(&HaRequest::Register).await?;
        Ok(client)
    }

    async fn send(&mut self, request: &HaRequest) -> Result<()> {
        let write = ipc::write_frame(&mut self.writer, request);
        match tokio::time::timeout(self.settings.service_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            _ => Err(HavenError::Ipc(
                "cannot send message to HA manager service".to_string(),
            )),
        }
    }

    /// Ask the manager for an immediate `StatusUpdate`.
    pub async fn request_status(&mut self) -> Result<()> {
        self.send(&HaRequest::RequestStatus).await
    }

    /// Drain pending notifications and return the current status.
    ///
    /// Waits up to `timeout` for the first frame, then consumes whatever
    /// else is queued. A terminal error status surfaces as
    /// [`HavenError::Manager`].
    pub async fn receive_status(&mut self, timeout: Duration) -> Result<HaStatus> {
        match tokio::time::timeout(timeout, self.replies.recv()).await {
            Err(_) => {}
            Ok(None) => {
                return Err(HavenError::Ipc(
                    "cannot receive message from HA manager service".to_string(),
                ))
            }
            Ok(Some(reply)) => self.apply_reply(reply)?,
        }

        while let Ok(reply) = self.replies.try_recv() {
            self.apply_reply(reply)?;
        }

        // Heartbeat watchdog: a hung manager must not leave this node
        // believing it is still active.
        if self.settings.is_cluster() && self.status == HaStatus::Active {
            if let Some(last) = self.last_heartbeat {
                let budget = (self.failover_delay as f64
                    - self.settings.poll_period.as_secs_f64())
                .max(0.0);
                if last.elapsed().as_secs_f64() >= budget {
                    debug!("no HA heartbeats within failover budget, demoting to standby");
                    self.status = HaStatus::Standby;
                }
            }
        }

        Ok(self.status)
    }

    fn apply_reply(&mut self, reply: HaReply) -> Result<()> {
        match reply {
            HaReply::StatusUpdate {
                status,
                failover_delay,
                error,
            } => {
                if status == HaStatus::Error {
                    return Err(HavenError::Manager(error.unwrap_or_default()));
                }
                if status != self.status {
                    self.last_heartbeat = Some(Instant::now());
                }
                self.status = status;
                self.failover_delay = failover_delay;
            }
            HaReply::Heartbeat => self.last_heartbeat = Some(Instant::now()),
            // Administrative replies travel on ephemeral connections.
            _ => {}
        }
        Ok(())
    }

    /// Last status learned from the manager.
    pub fn status(&self) -> HaStatus {
        self.status
    }

    /// Failover delay carried by the last `StatusUpdate`.
    pub fn failover_delay(&self) -> i64 {
        self.failover_delay
    }

    /// Pause the manager: the registry poll stops, only the lease refresh
    /// keeps running until `stop`.
    pub async fn pause(&mut self) -> Result<()> {
        self.send(&HaRequest::Pause).await
    }

    /// Stop the manager and wait for it to exit.
    pub async fn stop(mut self) -> Result<()> {
        self.send(&HaRequest::Stop).await?;
        self.reader.abort();

        if let Some(handle) = self.manager.take() {
            match handle.await {
                Ok(result) => result?,
                Err(e) => {
                    return Err(HavenError::Internal(format!(
                        "failed to wait for HA manager to exit: {}",
                        e
                    )))
                }
            }
        }
        Ok(())
    }

    /// Kill the manager without the stop handshake and close the channel.
    pub async fn kill(mut self) {
        self.reader.abort();
        if let Some(handle) = self.manager.take() {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// Fetch the node listing as a JSON array.
    ///
    /// Opens an ephemeral connection so the request does not interleave
    /// with the notification stream.
    pub async fn get_nodes(&self) -> Result<String> {
        let reply = ipc::exchange(
            &self.settings.socket_path,
            &HaRequest::GetNodes,
            self.settings.service_timeout,
        )
        .await?;

        match reply {
            HaReply::NodeList { ok: true, payload } => Ok(payload),
            HaReply::NodeList { ok: false, payload } => Err(HavenError::Manager(payload)),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Remove a node by its 1-based index in the id-ordered listing.
    pub async fn remove_node(&self, index: u32) -> Result<()> {
        let reply = ipc::exchange(
            &self.settings.socket_path,
            &HaRequest::RemoveNode { index },
            self.settings.service_timeout,
        )
        .await?;

        match reply {
            HaReply::RemoveNode { error: None } => Ok(()),
            HaReply::RemoveNode { error: Some(error) } => Err(HavenError::Manager(error)),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Change the cluster-wide failover delay.
    pub async fn set_failover_delay(&self, seconds: i64) -> Result<()> {
        let reply = ipc::exchange(
            &self.settings.socket_path,
            &HaRequest::SetFailoverDelay { seconds },
            self.settings.service_timeout,
        )
        .await?;

        match reply {
            HaReply::SetFailoverDelay { error: None } => Ok(()),
            HaReply::SetFailoverDelay { error: Some(error) } => Err(HavenError::Manager(error)),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Step the manager's log level up or down.
    pub async fn change_log_level(&mut self, increase: bool) -> Result<()> {
        let request = if increase {
            HaRequest::LogLevelUp
        } else {
            HaRequest::LogLevelDown
        };
        self.send(&request).await
    }
}

impl Drop for HaClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn unexpected_reply(reply: HaReply) -> HavenError {
    HavenError::Ipc(format!("unexpected reply from HA manager: {:?}", reply))
}
