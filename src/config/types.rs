//! Configuration sections and their defaults.

use crate::utils::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub dispatch: DispatchConfig,
    pub breaker: BreakerConfig,
    pub registry: RegistryConfig,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
    /// Base URLs of agents whose cards are fetched and registered at start-up.
    pub agents: Vec<String>,
}

/// HTTP gateway (JSON-RPC endpoint, discovery surface, own agent card).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1".to_string(),
            port: 18789,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Global cap on concurrent agent calls, shared by all plans.
    pub max_concurrent_agent_calls: usize,
    pub agent_call_timeout_ms: u64,
    pub overall_plan_timeout_ms: u64,
    /// Use `message/stream` when the agent advertises streaming.
    pub prefer_streaming: bool,
    pub retry: RetryConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agent_calls: 8,
            agent_call_timeout_ms: 30_000,
            overall_plan_timeout_ms: 120_000,
            prefer_streaming: true,
            retry: RetryConfig::default(),
        }
    }
}

impl DispatchConfig {
    pub fn agent_call_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_call_timeout_ms)
    }

    pub fn overall_plan_timeout(&self) -> Duration {
        Duration::from_millis(self.overall_plan_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub window_ms: u64,
    pub open_base_ms: u64,
    pub open_max_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_ms: 60_000,
            open_base_ms: 1_000,
            open_max_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub health_interval_secs: u64,
    pub health_timeout_ms: u64,
    /// Consecutive unreachable probes before a card is removed. 0 disables reaping.
    pub reap_after_failures: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: 30,
            health_timeout_ms: 2_000,
            reap_after_failures: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ttl_secs: u64,
    pub purge_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 1_800,
            purge_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    /// Daily-rolling log file. Logs go to stderr when unset.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}
