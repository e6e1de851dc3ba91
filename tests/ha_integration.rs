//! End-to-end scenarios for the HA manager: cold start, cluster
//! bring-up, failover, administrative operations and the parent-side
//! heartbeat watchdog.

mod common;

use common::{fast_settings, wait_for_status, Result, TestEnv};
use haven::audit::AuditAction;
use haven::{ClusterRegistry, HaClient, HaStatus, HavenError, NodeListEntry, NodeStatus};
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test]
async fn test_cold_standalone_start() -> Result<()> {
    let env = TestEnv::new();
    let registry = ClusterRegistry::new();

    let settings = fast_settings(&env, "node", "");
    let mut client = HaClient::start(settings, registry.handle(), HaStatus::Unknown).await?;

    client.request_status().await?;
    let status = client.receive_status(Duration::from_secs(2)).await?;
    assert_eq!(status, HaStatus::Active);
    assert_eq!(client.failover_delay(), 60);

    let nodes = registry.nodes();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].name, "");
    assert_eq!(nodes[0].status, NodeStatus::Active);
    assert!(nodes[0].session.is_some());

    client.stop().await?;
    assert_eq!(registry.nodes()[0].status, NodeStatus::Stopped);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cluster_bring_up_two_nodes() -> Result<()> {
    let env = TestEnv::new();
    let registry = ClusterRegistry::new();

    let mut a = HaClient::start(
        fast_settings(&env, "a", "a"),
        registry.handle(),
        HaStatus::Unknown,
    )
    .await?;
    a.request_status().await?;
    assert_eq!(a.receive_status(Duration::from_secs(2)).await?, HaStatus::Active);

    let mut b = HaClient::start(
        fast_settings(&env, "b", "b"),
        registry.handle(),
        HaStatus::Unknown,
    )
    .await?;
    b.request_status().await?;
    assert_eq!(b.receive_status(Duration::from_secs(2)).await?, HaStatus::Standby);

    // Node listing from either client shows both, with consistent ages.
    let json = a.get_nodes().await?;
    let entries: Vec<NodeListEntry> = serde_json::from_str(&json)?;
    assert_eq!(entries.len(), 2);

    for entry in &entries {
        let record = registry
            .nodes()
            .into_iter()
            .find(|n| n.id.to_string() == entry.nodeid)
            .expect("listed node exists");
        assert_eq!(entry.name, record.name);
        assert_eq!(entry.status, record.status.as_i32());
        assert_eq!(entry.lastaccess, record.lastaccess);
        assert_eq!(entry.address, "localhost:10051");
        assert_eq!(entry.lastaccess_age, entry.db_timestamp - entry.lastaccess);
    }

    let statuses: Vec<(String, i32)> = entries
        .iter()
        .map(|e| (e.name.clone(), e.status))
        .collect();
    assert!(statuses.contains(&("a".to_string(), NodeStatus::Active.as_i32())));
    assert!(statuses.contains(&("b".to_string(), NodeStatus::Standby.as_i32())));

    b.stop().await?;
    a.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failover_to_standby() -> Result<()> {
    let env = TestEnv::new();
    let registry = ClusterRegistry::with_failover_delay(2);

    let a_db = registry.handle();
    let a_outage = a_db.outage_flag();
    let mut a = HaClient::start(fast_settings(&env, "a", "a"), a_db, HaStatus::Unknown).await?;
    a.request_status().await?;
    assert_eq!(a.receive_status(Duration::from_secs(2)).await?, HaStatus::Active);

    let mut b = HaClient::start(
        fast_settings(&env, "b", "b"),
        registry.handle(),
        HaStatus::Unknown,
    )
    .await?;
    b.request_status().await?;
    assert_eq!(b.receive_status(Duration::from_secs(2)).await?, HaStatus::Standby);

    // Sever A's database connection; its lease stops advancing and B
    // takes over once the stall budget is spent.
    a_outage.store(true, Ordering::SeqCst);

    wait_for_status(&mut b, HaStatus::Active, Duration::from_secs(15)).await?;

    let a_row = registry.node_by_name("a").unwrap();
    let b_row = registry.node_by_name("b").unwrap();
    assert_eq!(a_row.status, NodeStatus::Unavailable);
    assert_eq!(b_row.status, NodeStatus::Active);

    b.stop().await?;
    a.kill().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restarted_node_rejoins_as_standby() -> Result<()> {
    let env = TestEnv::new();
    let registry = ClusterRegistry::new();

    let a = HaClient::start(
        fast_settings(&env, "a", "a"),
        registry.handle(),
        HaStatus::Unknown,
    )
    .await?;

    let mut b = HaClient::start(
        fast_settings(&env, "b", "b"),
        registry.handle(),
        HaStatus::Unknown,
    )
    .await?;
    b.request_status().await?;
    assert_eq!(b.receive_status(Duration::from_secs(2)).await?, HaStatus::Standby);

    // A shuts down cleanly; B promotes on a later tick.
    a.stop().await?;
    wait_for_status(&mut b, HaStatus::Active, Duration::from_secs(10)).await?;

    // A restarts with a fresh session and must join as standby, not
    // fight for the active role.
    let mut a = HaClient::start(
        fast_settings(&env, "a2", "a"),
        registry.handle(),
        HaStatus::Unknown,
    )
    .await?;
    a.request_status().await?;
    assert_eq!(a.receive_status(Duration::from_secs(2)).await?, HaStatus::Standby);

    a.stop().await?;
    b.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_name_is_rejected() -> Result<()> {
    let env = TestEnv::new();
    let registry = ClusterRegistry::new();

    let a = HaClient::start(
        fast_settings(&env, "a", "a"),
        registry.handle(),
        HaStatus::Unknown,
    )
    .await?;

    let mut dup = HaClient::start(
        fast_settings(&env, "dup", "a"),
        registry.handle(),
        HaStatus::Unknown,
    )
    .await?;
    dup.request_status().await?;

    let err = dup
        .receive_status(Duration::from_secs(2))
        .await
        .expect_err("duplicate registration must fail");
    match err {
        HavenError::Manager(message) => {
            assert_eq!(message, "found active duplicate \"a\" node");
        }
        other => panic!("unexpected error: {}", other),
    }

    // No second row was created for the duplicate.
    assert_eq!(registry.nodes().len(), 1);

    dup.stop().await?;
    a.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remove_node() -> Result<()> {
    let env = TestEnv::new();
    let registry = ClusterRegistry::new();

    let a = HaClient::start(
        fast_settings(&env, "a", "a"),
        registry.handle(),
        HaStatus::Unknown,
    )
    .await?;

    let b = HaClient::start(
        fast_settings(&env, "b", "b"),
        registry.handle(),
        HaStatus::Unknown,
    )
    .await?;
    // B leaves a stopped row behind.
    b.stop().await?;

    let json = a.get_nodes().await?;
    let entries: Vec<NodeListEntry> = serde_json::from_str(&json)?;
    let b_index = entries.iter().position(|e| e.name == "b").unwrap() as u32 + 1;
    let a_index = entries.iter().position(|e| e.name == "a").unwrap() as u32 + 1;

    // Removing the active node is rejected and leaves the row intact.
    let err = a.remove_node(a_index).await.expect_err("active node");
    assert_eq!(err.to_string(), "HA manager error: node is active");
    assert_eq!(registry.nodes().len(), 2);

    let err = a.remove_node(99).await.expect_err("bad index");
    assert_eq!(err.to_string(), "HA manager error: node index out of range");

    // Removing the stopped node succeeds and is audited.
    a.remove_node(b_index).await?;
    let nodes = registry.nodes();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].name, "a");

    let deletes: Vec<_> = registry
        .audit_entries()
        .into_iter()
        .filter(|e| e.action == AuditAction::Delete)
        .collect();
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].entity_name, "b");

    a.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_failover_delay_change_propagates() -> Result<()> {
    let env = TestEnv::new();
    let registry = ClusterRegistry::new();

    let mut client = HaClient::start(
        fast_settings(&env, "a", "a"),
        registry.handle(),
        HaStatus::Unknown,
    )
    .await?;
    client.request_status().await?;
    client.receive_status(Duration::from_secs(2)).await?;
    assert_eq!(client.failover_delay(), 60);

    client.set_failover_delay(30).await?;

    // The manager pushes a StatusUpdate carrying the new delay.
    let end = std::time::Instant::now() + Duration::from_secs(2);
    while client.failover_delay() != 30 {
        client.receive_status(Duration::from_millis(100)).await?;
        assert!(std::time::Instant::now() < end, "delay change not seen");
    }

    assert_eq!(registry.settings().failover_delay, 30);
    let settings_updates: Vec<_> = registry
        .audit_entries()
        .into_iter()
        .filter(|e| e.entity_id == "config")
        .collect();
    assert_eq!(settings_updates.len(), 1);
    assert_eq!(settings_updates[0].changes[0].old, "60");
    assert_eq!(settings_updates[0].changes[0].new, "30");

    let err = client.set_failover_delay(0).await.expect_err("zero delay");
    assert_eq!(err.to_string(), "HA manager error: invalid failover delay");

    client.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_heartbeat_watchdog_demotes_parent() -> Result<()> {
    let env = TestEnv::new();
    let registry = ClusterRegistry::with_failover_delay(2);

    let db = registry.handle();
    let outage = db.outage_flag();
    let mut client = HaClient::start(fast_settings(&env, "a", "a"), db, HaStatus::Unknown).await?;
    client.request_status().await?;
    assert_eq!(
        client.receive_status(Duration::from_secs(2)).await?,
        HaStatus::Active
    );

    // The manager goes silent (database down stops heartbeats) without
    // ever reporting a status change; the facade demotes on its own
    // after failover_delay - poll_period.
    outage.store(true, Ordering::SeqCst);
    wait_for_status(&mut client, HaStatus::Standby, Duration::from_secs(10)).await?;

    client.kill().await;
    Ok(())
}

#[tokio::test]
async fn test_pause_keeps_lease_fresh() -> Result<()> {
    let env = TestEnv::new();
    let registry = ClusterRegistry::new();

    let mut client = HaClient::start(
        fast_settings(&env, "a", "a"),
        registry.handle(),
        HaStatus::Unknown,
    )
    .await?;
    client.request_status().await?;
    assert_eq!(
        client.receive_status(Duration::from_secs(2)).await?,
        HaStatus::Active
    );

    client.pause().await?;

    // The paused manager still answers status requests and refreshes its
    // lease on the slow loop.
    tokio::time::sleep(Duration::from_millis(300)).await;
    client.request_status().await?;
    assert_eq!(
        client.receive_status(Duration::from_secs(2)).await?,
        HaStatus::Active
    );

    let before = registry.node_by_name("a").unwrap().lastaccess;
    registry.advance_clock(5);
    tokio::time::sleep(Duration::from_millis(500)).await;
    let after = registry.node_by_name("a").unwrap().lastaccess;
    assert!(after > before, "lease must advance while paused");

    client.stop().await?;
    assert_eq!(registry.node_by_name("a").unwrap().status, NodeStatus::Stopped);
    Ok(())
}

#[tokio::test]
async fn test_audit_trail_for_lifecycle() -> Result<()> {
    let env = TestEnv::new();
    let registry = ClusterRegistry::new();

    let client = HaClient::start(
        fast_settings(&env, "a", "a"),
        registry.handle(),
        HaStatus::Unknown,
    )
    .await?;
    client.stop().await?;

    let audit = registry.audit_entries();
    // One add (row creation), one update (role claim), one update (exit
    // to stopped).
    let adds = audit.iter().filter(|e| e.action == AuditAction::Add).count();
    let updates = audit
        .iter()
        .filter(|e| e.action == AuditAction::Update)
        .count();
    assert_eq!(adds, 1);
    assert!(updates >= 2);

    // Auditing disabled: no further entries for a full lifecycle.
    registry.set_audit_enabled(false);
    let count_before = registry.audit_entries().len();

    let client = HaClient::start(
        fast_settings(&env, "b", "b"),
        registry.handle(),
        HaStatus::Unknown,
    )
    .await?;
    client.stop().await?;
    assert_eq!(registry.audit_entries().len(), count_before);

    Ok(())
}
