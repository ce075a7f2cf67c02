//! Background health monitor for registered agents.

use crate::a2a::client::AgentClient;
use crate::a2a::registry::AgentRegistry;
use crate::a2a::types::HealthStatus;
use crate::config::RegistryConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What one sweep observed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub probed: usize,
    pub unreachable: usize,
    pub reaped: Vec<String>,
}

pub struct HealthMonitor {
    registry: Arc<AgentRegistry>,
    client: Arc<dyn AgentClient>,
    interval: Duration,
    timeout: Duration,
    /// Deregister after this many consecutive unreachable probes; 0 never.
    reap_after: u32,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<AgentRegistry>,
        client: Arc<dyn AgentClient>,
        config: &RegistryConfig,
    ) -> Self {
        Self {
            registry,
            client,
            interval: Duration::from_secs(config.health_interval_secs),
            timeout: Duration::from_millis(config.health_timeout_ms),
            reap_after: config.reap_after_failures,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Probe every registered agent once, concurrently.
    pub async fn sweep(&self) -> SweepReport {
        let names: Vec<String> = self
            .registry
            .snapshot()
            .into_iter()
            .map(|c| c.name)
            .collect();

        let probes = names.iter().map(|name| {
            let registry = &self.registry;
            let client = self.client.as_ref();
            async move { (name, registry.health_check(name, client, self.timeout).await) }
        });
        let results = futures::future::join_all(probes).await;

        let mut report = SweepReport {
            probed: results.len(),
            ..SweepReport::default()
        };
        for (name, result) in results {
            // Deregistered while the probe was in flight.
            let Ok(status) = result else { continue };
            if status != HealthStatus::Unreachable {
                continue;
            }
            report.unreachable += 1;
            let streak = self.registry.unreachable_streak(name).unwrap_or(0);
            if self.reap_after > 0
                && streak >= self.reap_after
                && self.registry.deregister(name).is_ok()
            {
                tracing::warn!(agent = %name, streak, "A2A: Reaped unreachable agent");
                report.reaped.push(name.clone());
            }
        }
        report
    }

    /// Sweep on a fixed interval until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(interval_secs = self.interval.as_secs(), "Health monitor started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = self.sweep().await;
                        tracing::debug!(
                            probed = report.probed,
                            unreachable = report.unreachable,
                            reaped = report.reaped.len(),
                            "Health sweep finished"
                        );
                    }
                }
            }
        })
    }
}
