//! Error taxonomy for the orchestration engine.
//!
//! `A2aError` is what library callers match on. `ErrorKind` is its
//! serialisable shadow, used when a failure has to be reported inside a
//! message or a JSON-RPC envelope rather than propagated.

use crate::a2a::types::error_codes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum A2aError {
    #[error("registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("no agent available for: {query}")]
    DiscoveryEmpty { query: String },

    #[error("planning failed: {0}")]
    Planning(String),

    #[error("transport error talking to {agent}: {message}")]
    Transport { agent: String, message: String },

    #[error("protocol error from {agent}: {message}")]
    Protocol { agent: String, message: String },

    #[error("agent {agent} timed out after {after_ms}ms")]
    Timeout { agent: String, after_ms: u64 },

    #[error("agent {agent} unavailable (circuit open for {retry_in_ms}ms)")]
    AgentUnavailable { agent: String, retry_in_ms: u64 },

    #[error("agent {agent} reported failure: {message}")]
    TaskFailed { agent: String, message: String },

    #[error("plan cancelled")]
    Cancelled,

    #[error("session: {0}")]
    Session(#[from] SessionError),

    #[error("config: {0}")]
    Config(String),

    #[error("all {count} sub-tasks failed")]
    AllTasksFailed {
        count: usize,
        failures: Vec<crate::a2a::task::TaskError>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("invalid agent card: {0}")]
    Invalid(String),

    #[error("agent not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),
}

/// Flat, serialisable classification of an `A2aError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RegistryError,
    DiscoveryEmpty,
    PlanningError,
    TransportError,
    ProtocolError,
    Timeout,
    AgentUnavailable,
    TaskFailed,
    Cancelled,
    SessionError,
    ConfigError,
    AllTasksFailed,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::RegistryError => "RegistryError",
            Self::DiscoveryEmpty => "DiscoveryEmpty",
            Self::PlanningError => "PlanningError",
            Self::TransportError => "TransportError",
            Self::ProtocolError => "ProtocolError",
            Self::Timeout => "Timeout",
            Self::AgentUnavailable => "AgentUnavailable",
            Self::TaskFailed => "TaskFailed",
            Self::Cancelled => "Cancelled",
            Self::SessionError => "SessionError",
            Self::ConfigError => "ConfigError",
            Self::AllTasksFailed => "AllTasksFailed",
        };
        f.write_str(label)
    }
}

impl A2aError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Registry(_) => ErrorKind::RegistryError,
            Self::DiscoveryEmpty { .. } => ErrorKind::DiscoveryEmpty,
            Self::Planning(_) => ErrorKind::PlanningError,
            Self::Transport { .. } => ErrorKind::TransportError,
            Self::Protocol { .. } => ErrorKind::ProtocolError,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::AgentUnavailable { .. } => ErrorKind::AgentUnavailable,
            Self::TaskFailed { .. } => ErrorKind::TaskFailed,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Session(_) => ErrorKind::SessionError,
            Self::Config(_) => ErrorKind::ConfigError,
            Self::AllTasksFailed { .. } => ErrorKind::AllTasksFailed,
        }
    }

    /// Transient failures that the dispatcher retries and that count
    /// against an agent's circuit breaker.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout { .. })
    }

    /// The agent this error is attributed to, if any.
    pub fn agent(&self) -> Option<&str> {
        match self {
            Self::Transport { agent, .. }
            | Self::Protocol { agent, .. }
            | Self::Timeout { agent, .. }
            | Self::AgentUnavailable { agent, .. }
            | Self::TaskFailed { agent, .. } => Some(agent),
            _ => None,
        }
    }

    /// JSON-RPC error code used when this error is returned over the wire.
    pub fn rpc_code(&self) -> i64 {
        match self {
            Self::Registry(RegistryError::NotFound(_)) => error_codes::AGENT_NOT_FOUND,
            Self::Registry(RegistryError::Invalid(_)) => error_codes::INVALID_PARAMS,
            Self::DiscoveryEmpty { .. } => error_codes::DISCOVERY_EMPTY,
            Self::Planning(_) => error_codes::PLANNING_FAILED,
            Self::Transport { .. } => error_codes::TRANSPORT_ERROR,
            Self::Protocol { .. } => error_codes::INVALID_AGENT_RESPONSE,
            Self::Timeout { .. } => error_codes::AGENT_TIMEOUT,
            Self::AgentUnavailable { .. } => error_codes::AGENT_UNAVAILABLE,
            Self::TaskFailed { .. } => error_codes::TASK_FAILED,
            Self::Cancelled => error_codes::PLAN_CANCELLED,
            Self::Session(_) => error_codes::SESSION_NOT_FOUND,
            Self::Config(_) => error_codes::INTERNAL_ERROR,
            Self::AllTasksFailed { .. } => error_codes::ALL_TASKS_FAILED,
        }
    }
}

/// Shorthand result type for the crate.
pub type Result<T> = std::result::Result<T, A2aError>;
