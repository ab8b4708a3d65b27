use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::registry::ProcessRegistry;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub terminated: usize,
}

/// Periodic cleanup of exited and idle agents.
#[derive(Debug, Clone)]
pub struct Reaper {
    registry: Arc<ProcessRegistry>,
    idle_timeout: Duration,
}

impl Reaper {
    pub fn new(registry: Arc<ProcessRegistry>, idle_timeout: Duration) -> Self {
        Self {
            registry,
            idle_timeout,
        }
    }

    /// Removes exited entries and signals idle ones. Idle entries stay registered
    /// until a later sweep sees them exit.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for process in self.registry.snapshot().await {
            if process.has_exited() {
                if self.registry.remove_if_same(&process).await {
                    tracing::info!(
                        agent_id = %process.agent_id(),
                        code = ?process.exit_code(),
                        "reaped exited agent process"
                    );
                    report.removed += 1;
                }
                continue;
            }

            let idle = process.idle_for();
            if idle > self.idle_timeout {
                tracing::info!(
                    agent_id = %process.agent_id(),
                    idle_secs = idle.as_secs(),
                    "terminating idle agent process"
                );
                process.terminate();
                report.terminated += 1;
            }
        }
        report
    }

    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let report = self.sweep().await;
                if report != SweepReport::default() {
                    tracing::debug!(
                        removed = report.removed,
                        terminated = report.terminated,
                        "reaper sweep"
                    );
                }
            }
        })
    }
}
