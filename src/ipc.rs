//! Notification channel between the HA manager and its parent process.
//!
//! The manager registers a message service on a well-known unix socket;
//! the parent (and ephemeral administrative connections) exchange
//! length-prefixed bincode frames over it. Delivery is reliable and
//! ordered per direction, which the status protocol depends on: a
//! `StatusUpdate` emitted after a commit reflects that commit.

use crate::error::{HavenError, Result};
use crate::types::HaStatus;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Upper bound on a single frame; the node list JSON stays far below it.
const MAX_FRAME_LEN: u32 = 4 * 1024 * 1024;

/// Requests sent from the parent (or an admin connection) to the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HaRequest {
    /// Announce this connection as the parent notification target.
    Register,
    /// Ask for an immediate `StatusUpdate`.
    RequestStatus,
    Pause,
    Stop,
    GetNodes,
    /// 1-based index into the id-ordered node list.
    RemoveNode { index: u32 },
    SetFailoverDelay { seconds: i64 },
    LogLevelUp,
    LogLevelDown,
}

/// Frames sent from the manager back to its clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HaReply {
    StatusUpdate {
        status: HaStatus,
        failover_delay: i64,
        error: Option<String>,
    },
    Heartbeat,
    /// Reply to `GetNodes`: the JSON array on success, an error string
    /// otherwise.
    NodeList { ok: bool, payload: String },
    /// Reply to `RemoveNode`: `None` on success.
    RemoveNode { error: Option<String> },
    /// Reply to `SetFailoverDelay`: `None` on success.
    SetFailoverDelay { error: Option<String> },
}

pub(crate) async fn write_frame<T, W>(writer: &mut W, message: &T) -> Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let body = bincode::serialize(message)?;
    if body.len() > MAX_FRAME_LEN as usize {
        return Err(HavenError::Ipc(format!("frame too large: {} bytes", body.len())));
    }

    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame; `Ok(None)` on clean connection close.
pub(crate) async fn read_frame<T, R>(reader: &mut R) -> Result<Option<T>>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(HavenError::Ipc(format!("frame too large: {} bytes", len)));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Some(bincode::deserialize(&body)?))
}

/// Identifier of one connected service client.
pub type ClientId = u64;

enum ServiceEvent {
    Connected(ClientId, mpsc::UnboundedSender<HaReply>),
    Request(ClientId, HaRequest),
    Disconnected(ClientId),
}

/// The manager-side message service bound to the well-known socket.
pub struct IpcService {
    path: PathBuf,
    events: mpsc::UnboundedReceiver<ServiceEvent>,
    clients: HashMap<ClientId, mpsc::UnboundedSender<HaReply>>,
    accept_task: JoinHandle<()>,
}

impl IpcService {
    /// Bind the service, replacing any stale socket file.
    pub async fn bind(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)
            .map_err(|e| HavenError::Ipc(format!("cannot bind {}: {}", path.display(), e)))?;

        let (event_tx, events) = mpsc::unbounded_channel();
        let accept_task = tokio::spawn(accept_loop(listener, event_tx));

        debug!(path = %path.display(), "HA service listening");

        Ok(IpcService {
            path: path.to_path_buf(),
            events,
            clients: HashMap::new(),
            accept_task,
        })
    }

    /// Wait up to `timeout` for the next client request, servicing
    /// connection lifecycle events along the way.
    pub async fn recv(&mut self, timeout: Duration) -> Option<(ClientId, HaRequest)> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let event = match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Err(_) => return None,
                Ok(None) => return None,
                Ok(Some(event)) => event,
            };

            match event {
                ServiceEvent::Connected(id, sender) => {
                    self.clients.insert(id, sender);
                }
                ServiceEvent::Disconnected(id) => {
                    self.clients.remove(&id);
                }
                ServiceEvent::Request(id, request) => return Some((id, request)),
            }
        }
    }

    /// Queue a reply to a connected client.
    pub fn send(&mut self, client: ClientId, reply: HaReply) -> Result<()> {
        let sender = self
            .clients
            .get(&client)
            .ok_or_else(|| HavenError::Ipc("client disconnected".to_string()))?;
        sender
            .send(reply)
            .map_err(|_| HavenError::Ipc("client connection closed".to_string()))
    }

    /// Shut the service down and remove the socket file.
    pub fn close(mut self) {
        self.accept_task.abort();
        self.clients.clear();
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for IpcService {
    fn drop(&mut self) {
        self.accept_task.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn accept_loop(listener: UnixListener, events: mpsc::UnboundedSender<ServiceEvent>) {
    let mut next_id: ClientId = 1;
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!("HA service accept failed: {}", e);
                continue;
            }
        };

        let id = next_id;
        next_id += 1;

        let (mut read_half, mut write_half) = stream.into_split();
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<HaReply>();

        if events.send(ServiceEvent::Connected(id, reply_tx)).is_err() {
            return;
        }

        let reader_events = events.clone();
        tokio::spawn(async move {
            loop {
                match read_frame::<HaRequest, _>(&mut read_half).await {
                    Ok(Some(request)) => {
                        if reader_events.send(ServiceEvent::Request(id, request)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(client = id, "HA service read failed: {}", e);
                        break;
                    }
                }
            }
            let _ = reader_events.send(ServiceEvent::Disconnected(id));
        });

        tokio::spawn(async move {
            while let Some(reply) = reply_rx.recv().await {
                if let Err(e) = write_frame(&mut write_half, &reply).await {
                    debug!(client = id, "HA service write failed: {}", e);
                    break;
                }
            }
        });
    }
}

/// Connect to the service with a bound on the attempt.
pub(crate) async fn connect(path: &Path, timeout: Duration) -> Result<UnixStream> {
    match tokio::time::timeout(timeout, UnixStream::connect(path)).await {
        Err(_) => Err(HavenError::Timeout(timeout)),
        Ok(Err(e)) => Err(HavenError::Ipc(format!(
            "cannot connect to {}: {}",
            path.display(),
            e
        ))),
        Ok(Ok(stream)) => Ok(stream),
    }
}

/// One-shot request/reply over an ephemeral connection, so administrative
/// calls do not interleave with the notification stream.
pub async fn exchange(path: &Path, request: &HaRequest, timeout: Duration) -> Result<HaReply> {
    let exchange = async {
        let mut stream = connect(path, timeout).await?;
        write_frame(&mut stream, request).await?;
        match read_frame::<HaReply, _>(&mut stream).await? {
            Some(reply) => Ok(reply),
            None => Err(HavenError::Ipc("connection closed by HA manager".to_string())),
        }
    };

    match tokio::time::timeout(timeout, exchange).await {
        Err(_) => Err(HavenError::Timeout(timeout)),
        Ok(result) => result,
    }
}
