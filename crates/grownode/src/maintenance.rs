//! Maintenance collaborator invoked for reboot, firmware update and factory
//! reset requests. The runtime only recognizes the request; what a reboot or
//! an update means is up to the implementation.

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

#[async_trait]
pub trait Maintenance: Send + Sync + 'static {
    /// Restart the device. Production implementations do not return.
    async fn reboot(&self);

    /// Hand control to the firmware update agent.
    async fn start_update(&self);

    /// Called after the persisted store has been erased.
    async fn factory_reset(&self) {
        self.reboot().await;
    }
}

/// Restarts by exiting the process and leaving the restart to the service
/// manager. The grace period lets the outbox flush the maintenance notice.
pub struct ProcessMaintenance {
    grace: Duration,
}

impl Default for ProcessMaintenance {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(500),
        }
    }
}

#[async_trait]
impl Maintenance for ProcessMaintenance {
    async fn reboot(&self) {
        warn!(grace_ms = self.grace.as_millis() as u64, "rebooting");
        tokio::time::sleep(self.grace).await;
        std::process::exit(0);
    }

    async fn start_update(&self) {
        // No update agent ships with the node; the request is only logged.
        warn!("firmware update requested but no update agent is installed");
    }
}

/// Records which entry points were invoked instead of acting on them.
#[derive(Default)]
pub struct RecordingMaintenance {
    calls: Mutex<Vec<&'static str>>,
}

impl RecordingMaintenance {
    pub fn calls(&self) -> Vec<&'static str> {
        match self.calls.lock() {
            Ok(c) => c.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn push(&self, call: &'static str) {
        match self.calls.lock() {
            Ok(mut c) => c.push(call),
            Err(poisoned) => poisoned.into_inner().push(call),
        }
    }
}

#[async_trait]
impl Maintenance for RecordingMaintenance {
    async fn reboot(&self) {
        self.push("reboot");
    }

    async fn start_update(&self) {
        self.push("start_update");
    }

    async fn factory_reset(&self) {
        self.push("factory_reset");
    }
}
