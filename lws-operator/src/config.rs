//! Runtime configuration.

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

/// The field manager identity used for Server-Side Apply, unless configured otherwise.
pub const DEFAULT_FIELD_MANAGER: &str = "lws";

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    #[serde(default = "Config::rust_log_default")]
    pub rust_log: String,
    /// The port used for healthchecks.
    #[serde(default = "Config::http_port_default")]
    pub http_port: u16,

    /// The Kubernetes namespace to watch. All namespaces are watched when unset.
    #[serde(default)]
    pub namespace: Option<String>,
    /// The field manager identity used when applying worker StatefulSets.
    ///
    /// Fields set by this manager are force-claimed on conflict.
    #[serde(default = "Config::field_manager_default")]
    pub field_manager: String,

    /// The number of seconds to wait on any single K8s API call.
    #[serde(default = "Config::api_timeout_seconds_default")]
    pub api_timeout_seconds: u64,
    /// The number of seconds to wait before redelivering an object whose reconciliation failed.
    #[serde(default = "Config::retry_seconds_default")]
    pub retry_seconds: u64,
    /// The maximum number of objects reconciled concurrently.
    #[serde(default = "Config::reconcile_concurrency_default")]
    pub reconcile_concurrency: u16,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Self = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Ensure the given values are usable.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.field_manager.is_empty(), "FIELD_MANAGER must not be empty");
        ensure!(self.api_timeout_seconds >= 1, "API_TIMEOUT_SECONDS must be at least 1 second");
        ensure!(self.retry_seconds >= 1, "RETRY_SECONDS must be at least 1 second");
        ensure!(self.reconcile_concurrency >= 1, "RECONCILE_CONCURRENCY must be at least 1");
        Ok(())
    }

    /// The timeout applied to each K8s API call.
    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_seconds)
    }

    /// The delay before a failed reconciliation is retried.
    pub fn retry_after(&self) -> Duration {
        Duration::from_secs(self.retry_seconds)
    }

    fn rust_log_default() -> String {
        "info".into()
    }

    fn http_port_default() -> u16 {
        8081
    }

    fn field_manager_default() -> String {
        DEFAULT_FIELD_MANAGER.into()
    }

    fn api_timeout_seconds_default() -> u64 {
        10
    }

    fn retry_seconds_default() -> u64 {
        5
    }

    fn reconcile_concurrency_default() -> u16 {
        8
    }
}
