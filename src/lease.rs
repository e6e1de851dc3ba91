//! Node lease engine.
//!
//! Pure decision logic over a snapshot of the node registry: given the
//! node table, the database clock and the failover delay, it answers
//! whether this node may start, which role it should take, whether a
//! stalled active peer may be taken over, and which standby peers have
//! gone stale. The engine performs no I/O; callers apply its decisions
//! inside the surrounding registry transaction.

use crate::error::{HavenError, Result};
use crate::types::{Cuid, NodeRecord, NodeStatus};

/// Liveness predicate: a row is live while its status is active or
/// standby and its lease has not expired on the database clock.
pub fn is_live(node: &NodeRecord, db_time: i64, failover_delay: i64) -> bool {
    node.status.is_live_status() && node.lastaccess + failover_delay > db_time
}

/// Find a node row by name.
pub fn find_by_name<'a>(nodes: &'a [NodeRecord], name: &str) -> Option<&'a NodeRecord> {
    nodes.iter().find(|n| n.name == name)
}

/// Admission decision for a starting cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Whether the node should start active (no live peer can take over).
    pub activate: bool,
}

/// Check that the registry permits standalone operation.
///
/// Fails while any named node is still live.
pub fn check_standalone(nodes: &[NodeRecord], db_time: i64, failover_delay: i64) -> Result<()> {
    for node in nodes {
        if node.name.is_empty() {
            continue;
        }

        if is_live(node, db_time, failover_delay) {
            return Err(HavenError::Fatal(format!(
                "cannot change mode to standalone while HA node \"{}\" is {}",
                node.name, node.status
            )));
        }
    }

    Ok(())
}

/// Check that the registry permits cluster operation for `name`.
///
/// Fails on a live standalone survivor or a live duplicate of this
/// node's name; otherwise reports whether the node should start active.
pub fn check_cluster(
    name: &str,
    nodes: &[NodeRecord],
    db_time: i64,
    failover_delay: i64,
) -> Result<Admission> {
    let mut activate = true;

    for node in nodes {
        if !is_live(node, db_time, failover_delay) {
            continue;
        }

        if node.name.is_empty() {
            return Err(HavenError::Fatal(format!(
                "cannot change mode to HA while standalone node is {}",
                node.status
            )));
        }

        if node.name == name {
            return Err(HavenError::Fatal(format!(
                "found {} duplicate \"{}\" node",
                node.status, name
            )));
        }

        // A live peer exists that can take over; start passive.
        activate = false;
    }

    Ok(Admission { activate })
}

/// Progress tracking for the active peer, kept by a standby node across
/// ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActiveWatch {
    /// Last observed `lastaccess` of the active peer.
    pub lastaccess_active: i64,
    /// Consecutive polls without that value advancing.
    pub offline_ticks_active: i64,
}

/// Outcome of a standby node's check of the active peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveCheck {
    /// No live obstacle: claim the active role.
    Promote,
    /// The active peer stalled past the failover budget: claim the
    /// active role and mark the stale row unavailable in the same
    /// transaction.
    TakeOver { stale: Cuid },
    /// An active peer is making progress; stay standby.
    Wait,
}

/// Check the active peer from a standby node's perspective.
///
/// `failover_ticks` is the stall budget in poll ticks
/// (`failover_delay / poll_period + 1`). The watch counters persist
/// across ticks and reset whenever the active row's `lastaccess`
/// advances at all; both sides read the same database clock, so the
/// comparison is skew-free.
pub fn check_active_peer(
    self_id: &Cuid,
    nodes: &[NodeRecord],
    watch: &mut ActiveWatch,
    failover_ticks: i64,
) -> Result<ActiveCheck> {
    let active = nodes.iter().find(|n| n.status == NodeStatus::Active);

    let active = match active {
        None => return Ok(ActiveCheck::Promote),
        Some(node) if node.name.is_empty() => {
            return Err(HavenError::Fatal(
                "found active standalone node in HA mode".to_string(),
            ));
        }
        // Own row still marked active: reclaim the role (covers a
        // prolonged connection loss where no peer took over).
        Some(node) if &node.id == self_id => return Ok(ActiveCheck::Promote),
        Some(node) => node,
    };

    if active.lastaccess != watch.lastaccess_active {
        watch.lastaccess_active = active.lastaccess;
        watch.offline_ticks_active = 0;
    } else {
        watch.offline_ticks_active += 1;
    }

    if watch.offline_ticks_active > failover_ticks {
        Ok(ActiveCheck::TakeOver {
            stale: active.id.clone(),
        })
    } else {
        Ok(ActiveCheck::Wait)
    }
}

/// Outcome of an active node's check of its own claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveSelfCheck {
    /// Still the sole active row; keep the role.
    Retain,
    /// A peer claimed the active role while this node was cut off; fall
    /// back to standby.
    Demote { other: Cuid, other_name: String },
}

/// Verify an active node's claim against the registry snapshot.
///
/// A peer that promoted itself during this node's database outage owns
/// the role now; re-claiming it would put two rows in active status.
pub fn check_active_self(self_id: &Cuid, nodes: &[NodeRecord]) -> Result<ActiveSelfCheck> {
    match nodes
        .iter()
        .find(|n| n.status == NodeStatus::Active && &n.id != self_id)
    {
        None => Ok(ActiveSelfCheck::Retain),
        Some(other) if other.name.is_empty() => Err(HavenError::Fatal(
            "found active standalone node in HA mode".to_string(),
        )),
        Some(other) => Ok(ActiveSelfCheck::Demote {
            other: other.id.clone(),
            other_name: other.name.clone(),
        }),
    }
}

/// Rows still marked active that cannot be live anymore; cleared by a
/// node claiming the role so the registry never carries two active rows.
pub fn stale_actives<'a>(nodes: &'a [NodeRecord], self_id: &Cuid) -> Vec<&'a NodeRecord> {
    nodes
        .iter()
        .filter(|n| n.status == NodeStatus::Active && &n.id != self_id)
        .collect()
}

/// Standby rows whose lease has expired, to be marked unavailable by the
/// active node.
pub fn stale_standbys<'a>(
    nodes: &'a [NodeRecord],
    db_time: i64,
    failover_delay: i64,
) -> Vec<&'a NodeRecord> {
    nodes
        .iter()
        .filter(|n| n.status == NodeStatus::Standby && db_time >= n.lastaccess + failover_delay)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, status: NodeStatus, lastaccess: i64) -> NodeRecord {
        NodeRecord {
            id: Cuid::generate(),
            name: name.to_string(),
            status,
            lastaccess,
            address: "localhost".to_string(),
            port: 10051,
            session: None,
        }
    }

    #[test]
    fn test_liveness_boundary() {
        let n = node("a", NodeStatus::Active, 100);
        // lastaccess + delay > db_time must hold strictly.
        assert!(is_live(&n, 159, 60));
        assert!(!is_live(&n, 160, 60));

        let stopped = node("a", NodeStatus::Stopped, 100);
        assert!(!is_live(&stopped, 100, 60));
    }

    #[test]
    fn test_standalone_admission_empty_table() {
        assert!(check_standalone(&[], 100, 60).is_ok());
    }

    #[test]
    fn test_standalone_blocked_by_live_cluster_node() {
        let nodes = vec![node("a", NodeStatus::Active, 100)];
        let err = check_standalone(&nodes, 110, 60).unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot change mode to standalone while HA node \"a\" is active"
        );
    }

    #[test]
    fn test_standalone_allows_stale_and_stopped_cluster_nodes() {
        let nodes = vec![
            node("a", NodeStatus::Stopped, 100),
            node("b", NodeStatus::Standby, 10),
        ];
        assert!(check_standalone(&nodes, 100, 60).is_ok());
    }

    #[test]
    fn test_cluster_first_node_activates() {
        let admission = check_cluster("a", &[], 100, 60).unwrap();
        assert!(admission.activate);
    }

    #[test]
    fn test_cluster_with_live_peer_starts_standby() {
        let nodes = vec![node("a", NodeStatus::Active, 100)];
        let admission = check_cluster("b", &nodes, 110, 60).unwrap();
        assert!(!admission.activate);
    }

    #[test]
    fn test_cluster_activates_past_expired_peer() {
        let nodes = vec![node("a", NodeStatus::Active, 10)];
        let admission = check_cluster("b", &nodes, 100, 60).unwrap();
        assert!(admission.activate);
    }

    #[test]
    fn test_cluster_blocked_by_live_standalone() {
        let nodes = vec![node("", NodeStatus::Active, 100)];
        let err = check_cluster("a", &nodes, 110, 60).unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot change mode to HA while standalone node is active"
        );
    }

    #[test]
    fn test_cluster_rejects_live_duplicate() {
        let nodes = vec![node("a", NodeStatus::Standby, 100)];
        let err = check_cluster("a", &nodes, 110, 60).unwrap_err();
        assert_eq!(err.to_string(), "found standby duplicate \"a\" node");
    }

    #[test]
    fn test_cluster_allows_stale_duplicate() {
        // A crashed previous incarnation of this node whose lease expired
        // must not block re-registration.
        let nodes = vec![node("a", NodeStatus::Active, 10)];
        let admission = check_cluster("a", &nodes, 100, 60).unwrap();
        assert!(admission.activate);
    }

    #[test]
    fn test_active_check_promotes_without_active_row() {
        let id = Cuid::generate();
        let nodes = vec![node("b", NodeStatus::Standby, 100)];
        let mut watch = ActiveWatch::default();

        let check = check_active_peer(&id, &nodes, &mut watch, 13).unwrap();
        assert_eq!(check, ActiveCheck::Promote);
    }

    #[test]
    fn test_active_check_promotes_own_active_row() {
        let mut own = node("a", NodeStatus::Active, 100);
        own.id = Cuid::generate();
        let id = own.id.clone();
        let mut watch = ActiveWatch::default();

        let check = check_active_peer(&id, &[own], &mut watch, 13).unwrap();
        assert_eq!(check, ActiveCheck::Promote);
    }

    #[test]
    fn test_active_check_rejects_standalone_active() {
        let id = Cuid::generate();
        let nodes = vec![node("", NodeStatus::Active, 100)];
        let mut watch = ActiveWatch::default();

        let err = check_active_peer(&id, &nodes, &mut watch, 13).unwrap_err();
        assert_eq!(err.to_string(), "found active standalone node in HA mode");
    }

    #[test]
    fn test_active_check_counter_reset_and_takeover() {
        let id = Cuid::generate();
        let peer = node("a", NodeStatus::Active, 100);
        let mut watch = ActiveWatch::default();
        let budget = 2;

        // First observation adopts the peer's lastaccess.
        let check = check_active_peer(&id, &[peer.clone()], &mut watch, budget).unwrap();
        assert_eq!(check, ActiveCheck::Wait);
        assert_eq!(watch.offline_ticks_active, 0);

        // Stalled peer accumulates ticks.
        for expected in 1..=budget {
            let check = check_active_peer(&id, &[peer.clone()], &mut watch, budget).unwrap();
            assert_eq!(check, ActiveCheck::Wait);
            assert_eq!(watch.offline_ticks_active, expected);
        }

        // Any advance resets the counter.
        let mut advanced = peer.clone();
        advanced.lastaccess += 1;
        let check = check_active_peer(&id, &[advanced], &mut watch, budget).unwrap();
        assert_eq!(check, ActiveCheck::Wait);
        assert_eq!(watch.offline_ticks_active, 0);

        // A stall past the budget triggers takeover of the stale row.
        let mut stalled = peer.clone();
        stalled.lastaccess += 1;
        for _ in 0..=budget {
            check_active_peer(&id, &[stalled.clone()], &mut watch, budget).unwrap();
        }
        let check = check_active_peer(&id, &[stalled.clone()], &mut watch, budget).unwrap();
        assert_eq!(
            check,
            ActiveCheck::TakeOver {
                stale: stalled.id.clone()
            }
        );
    }

    #[test]
    fn test_active_self_check_retains_sole_claim() {
        let own = node("a", NodeStatus::Active, 100);
        let peer = node("b", NodeStatus::Standby, 100);
        let check = check_active_self(&own.id.clone(), &[own, peer]).unwrap();
        assert_eq!(check, ActiveSelfCheck::Retain);
    }

    #[test]
    fn test_active_self_check_demotes_after_takeover() {
        let own = node("a", NodeStatus::Unavailable, 100);
        let peer = node("b", NodeStatus::Active, 120);
        let check = check_active_self(&own.id.clone(), &[own, peer.clone()]).unwrap();
        assert_eq!(
            check,
            ActiveSelfCheck::Demote {
                other: peer.id,
                other_name: "b".to_string()
            }
        );
    }

    #[test]
    fn test_active_self_check_rejects_standalone() {
        let own = node("a", NodeStatus::Unavailable, 100);
        let standalone = node("", NodeStatus::Active, 120);
        let err = check_active_self(&own.id.clone(), &[own, standalone]).unwrap_err();
        assert_eq!(err.to_string(), "found active standalone node in HA mode");
    }

    #[test]
    fn test_stale_actives_excludes_self() {
        let own = node("a", NodeStatus::Active, 100);
        let expired = node("b", NodeStatus::Active, 10);
        let standby = node("c", NodeStatus::Standby, 10);
        let nodes = vec![own.clone(), expired.clone(), standby];

        let stale = stale_actives(&nodes, &own.id);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, expired.id);
    }

    #[test]
    fn test_stale_standbys() {
        let fresh = node("a", NodeStatus::Standby, 90);
        let expired = node("b", NodeStatus::Standby, 40);
        let active = node("c", NodeStatus::Active, 40);
        let nodes = vec![fresh.clone(), expired.clone(), active];

        let stale = stale_standbys(&nodes, 100, 60);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, expired.id);

        // Boundary: exactly at expiry counts as stale.
        let stale = stale_standbys(&nodes, 150, 60);
        assert_eq!(stale.len(), 2);
    }
}
