//! Layered configuration.
//!
//! Sources, lowest priority first: compiled-in defaults, the TOML file
//! (`--config PATH`, else `~/.crabswarm/config.toml`), then environment
//! variables such as `CRABSWARM__DISPATCH__MAX_CONCURRENT_AGENT_CALLS=16`.

mod types;

pub use types::*;

use crate::error::{A2aError, Result};
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "CRABSWARM";

/// `~/.crabswarm`, or `./.crabswarm` when no home directory is known.
pub fn crabswarm_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".crabswarm")
}

pub fn default_config_path() -> PathBuf {
    crabswarm_home().join("config.toml")
}

impl Config {
    /// Load and validate configuration. An explicit `path` must exist; the
    /// default path is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (file, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (default_config_path(), false),
        };
        let env = config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("agents");
        Self::load_layered(&file, required, env)
    }

    fn load_layered(file: &Path, required: bool, env: config::Environment) -> Result<Self> {
        let defaults = config::Config::try_from(&Config::default())
            .map_err(|e| A2aError::Config(format!("Failed to encode defaults: {}", e)))?;

        let loaded: Config = config::Config::builder()
            .add_source(defaults)
            .add_source(
                config::File::from(file)
                    .format(config::FileFormat::Toml)
                    .required(required),
            )
            .add_source(env)
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| {
                A2aError::Config(format!("Failed to load {}: {}", file.display(), e))
            })?;

        loaded.validate()?;
        tracing::debug!(path = %file.display(), "Configuration loaded");
        Ok(loaded)
    }

    /// Render as TOML, in the shape `load` reads back.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| A2aError::Config(format!("Failed to render config: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        let d = &self.dispatch;
        if d.max_concurrent_agent_calls == 0 {
            return Err(A2aError::Config(
                "dispatch.max_concurrent_agent_calls must be at least 1".to_string(),
            ));
        }
        if d.agent_call_timeout_ms == 0 || d.overall_plan_timeout_ms == 0 {
            return Err(A2aError::Config(
                "dispatch timeouts must be greater than zero".to_string(),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(A2aError::Config(
                "breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.registry.health_timeout_ms == 0 || self.registry.health_interval_secs == 0 {
            return Err(A2aError::Config(
                "registry health interval and timeout must be greater than zero".to_string(),
            ));
        }
        if self.session.ttl_secs == 0 {
            return Err(A2aError::Config(
                "session.ttl_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
