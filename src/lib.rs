//! haven - a high-availability manager for server daemons.
//!
//! A haven node is one of several peer server processes sharing a single
//! relational registry database. At every instant exactly one node is
//! `active` (allowed to do exclusive work); the others run `standby`,
//! ready to take over when the active node's liveness signal stops
//! advancing for longer than the operator-configured failover delay.
//! Leadership is derived from timestamped leases in the shared registry,
//! judged exclusively on the database server's own clock, so clock skew
//! between nodes is irrelevant.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │  parent server process                                     │
//! │    HaClient ── facade: start/stop, status, admin ops       │
//! ├──────────────── unix-socket notification channel ──────────┤
//! │  HA manager task                                           │
//! │    HaManager ── tick loop: registration, lease refresh     │
//! │    lease     ── pure role decisions over registry snapshot │
//! │    RegistryStore ── transactions, audit flush, reconnect   │
//! ├────────────────────────────────────────────────────────────┤
//! │  shared registry database (one per cluster)                │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use haven::{ClusterRegistry, HaClient, HaSettings, HaStatus};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> haven::Result<()> {
//!     let registry = ClusterRegistry::new();
//!
//!     let settings = HaSettings {
//!         node_name: "node-1".to_string(),
//!         node_address: "10.0.0.5:10051".to_string(),
//!         ..Default::default()
//!     };
//!
//!     let mut client = HaClient::start(settings, registry.handle(), HaStatus::Unknown).await?;
//!     client.request_status().await?;
//!
//!     match client.receive_status(Duration::from_secs(10)).await? {
//!         HaStatus::Active => { /* start exclusive subsystems */ }
//!         _ => { /* stay passive */ }
//!     }
//!
//!     client.stop().await
//! }
//! ```

pub mod audit;
pub mod client;
pub mod config;
pub mod error;
pub mod ipc;
pub mod lease;
pub mod logging;
pub mod manager;
pub mod registry;
pub mod types;

pub use client::HaClient;
pub use config::HaSettings;
pub use error::{HavenError, Result};
pub use manager::HaManager;
pub use registry::memory::{ClusterRegistry, MemoryDatabase};
pub use registry::{Database, DbError, GlobalSettings, NodeUpdate, RegistryStore};
pub use types::{Cuid, HaStatus, NodeListEntry, NodeRecord, NodeStatus};
