//! Common test utilities for integration tests.

use haven::{HaClient, HaSettings, HaStatus};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;

/// Test environment owning a temporary directory for socket paths.
pub struct TestEnv {
    pub temp_dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        TestEnv {
            temp_dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    pub fn socket_path(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(format!("{}.sock", name))
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Settings with compressed timings so failover scenarios complete in
/// seconds: 200ms poll, 50ms heartbeat.
pub fn fast_settings(env: &TestEnv, socket: &str, node_name: &str) -> HaSettings {
    HaSettings {
        node_name: node_name.to_string(),
        node_address: "localhost:10051".to_string(),
        socket_path: env.socket_path(socket),
        poll_period: Duration::from_millis(200),
        heartbeat_interval: Duration::from_millis(50),
        service_timeout: Duration::from_secs(5),
        log_level: "info".to_string(),
    }
}

/// Poll `receive_status` until the wanted status appears.
pub async fn wait_for_status(
    client: &mut HaClient,
    want: HaStatus,
    deadline: Duration,
) -> Result<()> {
    let end = Instant::now() + deadline;
    loop {
        let status = client.receive_status(Duration::from_millis(100)).await?;
        if status == want {
            return Ok(());
        }
        if Instant::now() >= end {
            return Err(
                format!("timed out waiting for status {}, last seen {}", want, status).into(),
            );
        }
    }
}
