//! Core type definitions for the haven HA manager.
//!
//! This module contains the fundamental data types shared across the
//! registry, lease engine, manager loop and client facade:
//!
//! - [`Cuid`]: 25-character collision-resistant identifier used for node
//!   and session ids
//! - [`NodeStatus`]: the persisted status of a registry row
//! - [`HaStatus`]: the manager-side status reported to the parent process,
//!   a superset of [`NodeStatus`] with `Unknown` and `Error`
//! - [`NodeRecord`]: one row of the shared node registry
//! - [`NodeListEntry`]: the JSON shape returned by the node listing

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of collision-resistant identifiers.
pub const CUID_LEN: usize = 25;

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// A 25-character collision-resistant identifier.
///
/// Generated once per node row (node id) and once per process start
/// (session id). Ordering is lexicographic, which the registry relies on
/// for its stable node listing order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cuid(String);

impl Cuid {
    /// Generate a fresh identifier from the current millisecond timestamp
    /// and random entropy.
    pub fn generate() -> Self {
        let mut out = String::with_capacity(CUID_LEN);
        out.push('c');

        // 8 base-36 digits of timestamp, most significant first.
        let millis = Utc::now().timestamp_millis().unsigned_abs() % 36u64.pow(8);
        let mut ts = [0u8; 8];
        let mut v = millis;
        for slot in ts.iter_mut().rev() {
            *slot = BASE36[(v % 36) as usize];
            v /= 36;
        }
        out.push_str(std::str::from_utf8(&ts).expect("base36 digits are ascii"));

        let mut rng = rand::thread_rng();
        for _ in out.len()..CUID_LEN {
            out.push(BASE36[rng.gen_range(0..36)] as char);
        }

        Cuid(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Construct from an existing identifier string (e.g. a database row).
    pub fn from_string(value: String) -> Self {
        Cuid(value)
    }
}

impl fmt::Display for Cuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted status of a node registry row.
///
/// The discriminants match the integer values stored in the `ha_node`
/// table and exposed through the node listing JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Standby,
    Stopped,
    Unavailable,
    Active,
}

impl NodeStatus {
    pub fn as_i32(self) -> i32 {
        match self {
            NodeStatus::Standby => 0,
            NodeStatus::Stopped => 1,
            NodeStatus::Unavailable => 2,
            NodeStatus::Active => 3,
        }
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(NodeStatus::Standby),
            1 => Some(NodeStatus::Stopped),
            2 => Some(NodeStatus::Unavailable),
            3 => Some(NodeStatus::Active),
            _ => None,
        }
    }

    /// Whether this status participates in liveness (active or standby).
    pub fn is_live_status(self) -> bool {
        matches!(self, NodeStatus::Active | NodeStatus::Standby)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Standby => "standby",
            NodeStatus::Stopped => "stopped",
            NodeStatus::Unavailable => "unavailable",
            NodeStatus::Active => "active",
        };
        f.write_str(s)
    }
}

/// Manager-side HA status, reported to the parent process.
///
/// Extends [`NodeStatus`] with `Unknown` (registration pending) and
/// `Error` (terminal failure); neither is ever written to a registry row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaStatus {
    Error,
    Unknown,
    Standby,
    Stopped,
    Unavailable,
    Active,
}

impl HaStatus {
    pub fn as_i32(self) -> i32 {
        match self {
            HaStatus::Error => -2,
            HaStatus::Unknown => -1,
            HaStatus::Standby => 0,
            HaStatus::Stopped => 1,
            HaStatus::Unavailable => 2,
            HaStatus::Active => 3,
        }
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            -2 => Some(HaStatus::Error),
            -1 => Some(HaStatus::Unknown),
            0 => Some(HaStatus::Standby),
            1 => Some(HaStatus::Stopped),
            2 => Some(HaStatus::Unavailable),
            3 => Some(HaStatus::Active),
            _ => None,
        }
    }

    /// The row status equivalent, if one exists.
    pub fn as_node_status(self) -> Option<NodeStatus> {
        match self {
            HaStatus::Standby => Some(NodeStatus::Standby),
            HaStatus::Stopped => Some(NodeStatus::Stopped),
            HaStatus::Unavailable => Some(NodeStatus::Unavailable),
            HaStatus::Active => Some(NodeStatus::Active),
            HaStatus::Error | HaStatus::Unknown => None,
        }
    }

    pub fn is_live_status(self) -> bool {
        matches!(self, HaStatus::Active | HaStatus::Standby)
    }
}

impl From<NodeStatus> for HaStatus {
    fn from(status: NodeStatus) -> Self {
        match status {
            NodeStatus::Standby => HaStatus::Standby,
            NodeStatus::Stopped => HaStatus::Stopped,
            NodeStatus::Unavailable => HaStatus::Unavailable,
            NodeStatus::Active => HaStatus::Active,
        }
    }
}

impl fmt::Display for HaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HaStatus::Error => "error",
            HaStatus::Unknown => "unknown",
            HaStatus::Standby => "standby",
            HaStatus::Stopped => "stopped",
            HaStatus::Unavailable => "unavailable",
            HaStatus::Active => "active",
        };
        f.write_str(s)
    }
}

/// One row of the shared node registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Unique node identifier, generated on first registration.
    pub id: Cuid,
    /// Operator-chosen name; empty for the standalone node.
    pub name: String,
    pub status: NodeStatus,
    /// Database-clock seconds of the node's last self-update.
    pub lastaccess: i64,
    /// Externally reachable address reported by the owner.
    pub address: String,
    pub port: u16,
    /// Session id written by the owning process; `None` until first
    /// registration completes.
    pub session: Option<Cuid>,
}

/// Node listing entry, serialized to JSON for the `GetNodes` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeListEntry {
    pub nodeid: String,
    pub name: String,
    pub status: i32,
    pub lastaccess: i64,
    pub address: String,
    pub db_timestamp: i64,
    pub lastaccess_age: i64,
}

impl NodeListEntry {
    pub fn from_record(record: &NodeRecord, db_time: i64) -> Self {
        NodeListEntry {
            nodeid: record.id.to_string(),
            name: record.name.clone(),
            status: record.status.as_i32(),
            lastaccess: record.lastaccess,
            address: format!("{}:{}", record.address, record.port),
            db_timestamp: db_time,
            lastaccess_age: db_time - record.lastaccess,
        }
    }
}
