//! Runtime configuration
//!
//! Defaults cover a development host. Production hosts layer a config file
//! and `PLUGIN_RUNTIME__*` environment variables on top via [`RuntimeConfig::load`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PluginResult, PluginRuntimeError};

/// Environment prefix for configuration overrides
pub const ENV_PREFIX: &str = "PLUGIN_RUNTIME";

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Root directory for installed plugin packages
    pub plugin_dir: PathBuf,
    /// Per-handler hook timeout (milliseconds)
    pub hook_timeout_ms: u64,
    /// Per-implementation extension call timeout (milliseconds)
    pub extension_timeout_ms: u64,
    /// Capacity of event broadcast channels
    pub event_capacity: usize,
    /// Base64 32-byte master key for plugin-scoped encryption. A random
    /// per-process key is used when unset.
    pub master_key: Option<String>,
    /// Sandbox limits
    pub sandbox: SandboxConfig,
    /// Logging
    pub log: LogConfig,
}

/// Sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Deadline for instantiating plugin code (milliseconds)
    pub load_timeout_ms: u64,
    /// Maximum memory per plugin (bytes)
    pub max_memory_bytes: usize,
    /// Budget for a single lifecycle callback (milliseconds)
    pub max_cpu_time_ms: u64,
    /// Timer delays longer than this are clamped down (milliseconds)
    pub max_timer_delay_ms: u64,
    /// Interval periods shorter than this are clamped up (milliseconds)
    pub min_timer_interval_ms: u64,
    /// Host modules a sandboxed plugin may require
    pub allowed_modules: Vec<String>,
    /// Environment variable names copied into the sandbox snapshot
    pub exposed_env: Vec<String>,
    /// Hosts reachable through `PluginApi::http_get`
    pub network_allowlist: Vec<String>,
    /// WASM fuel granted per call
    pub wasm_fuel_per_call: u64,
    /// WASM import namespaces a module may link against
    pub wasm_allowed_imports: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
    /// Redact PII-shaped values in plugin log messages
    pub redact_plugin_logs: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from("./plugins"),
            hook_timeout_ms: 5_000,
            extension_timeout_ms: 10_000,
            event_capacity: 256,
            master_key: None,
            sandbox: SandboxConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            load_timeout_ms: 10_000,
            max_memory_bytes: 64 * 1024 * 1024, // 64MB
            max_cpu_time_ms: 5_000,
            max_timer_delay_ms: 60_000,
            min_timer_interval_ms: 100,
            allowed_modules: vec!["json".to_string(), "uuid".to_string(), "time".to_string()],
            exposed_env: vec!["APP_ENV".to_string(), "TZ".to_string()],
            network_allowlist: Vec::new(),
            wasm_fuel_per_call: 1_000_000_000,
            wasm_allowed_imports: vec!["env".to_string()],
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            redact_plugin_logs: true,
        }
    }
}

impl RuntimeConfig {
    /// Load from an optional file (yaml/toml/json by extension) and the
    /// environment, e.g. `PLUGIN_RUNTIME__SANDBOX__LOAD_TIMEOUT_MS=2000`.
    pub fn load(path: Option<&Path>) -> PluginResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<RuntimeConfig>())
            .map_err(|e| PluginRuntimeError::ConfigurationError(e.to_string()))
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_millis(self.hook_timeout_ms)
    }

    pub fn extension_timeout(&self) -> Duration {
        Duration::from_millis(self.extension_timeout_ms)
    }
}

impl SandboxConfig {
    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn max_cpu_time(&self) -> Duration {
        Duration::from_millis(self.max_cpu_time_ms)
    }

    pub fn max_timer_delay(&self) -> Duration {
        Duration::from_millis(self.max_timer_delay_ms)
    }

    pub fn min_timer_interval(&self) -> Duration {
        Duration::from_millis(self.min_timer_interval_ms)
    }
}
