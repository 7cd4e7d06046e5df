//! Plugin runtime error types
//!
//! One error enum for the whole runtime. Registration problems are aggregated
//! (every violation reported at once); lifecycle and sandbox failures are
//! always attributed to the plugin that caused them.

use std::fmt;
use thiserror::Error;

use crate::security::Permission;

/// Main plugin runtime error type
#[derive(Error, Debug)]
pub enum PluginRuntimeError {
    /// Aggregated manifest problems
    #[error("Plugin manifest validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// Aggregated missing or incompatible dependency specs
    #[error("Unresolved plugin dependencies: {}", .0.join("; "))]
    Dependency(Vec<String>),

    /// Extension registration lacking a permission the extension point requires
    #[error(
        "Plugin {plugin_id} lacks permission {} required by extension point {point_id}",
        join_permissions(.missing)
    )]
    Permission {
        /// Plugin attempting the registration
        plugin_id: String,
        /// Target extension point
        point_id: String,
        /// Every required permission the plugin was not granted
        missing: Vec<Permission>,
    },

    /// PluginAPI call the plugin is not granted
    #[error("Plugin {plugin_id} is not granted {permission} for {operation}")]
    AccessDenied {
        plugin_id: String,
        permission: Permission,
        operation: String,
    },

    /// Sandbox creation or plugin code execution failure
    #[error("Sandbox error in plugin {plugin_id}: {message}")]
    Sandbox {
        /// Owning plugin
        plugin_id: String,
        /// Error message
        message: String,
        /// Error source
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Sandboxed load exceeded its deadline
    #[error("Plugin {plugin_id} load exceeded the {timeout_ms}ms deadline")]
    LoadTimeout { plugin_id: String, timeout_ms: u64 },

    /// Module import outside the sandbox allowlist
    #[error("Module '{module}' is not allowed in the sandbox of plugin {plugin_id}")]
    ModuleNotAllowed { plugin_id: String, module: String },

    /// Unknown plugin, extension point, hook or module
    #[error("{kind} not found: {id}")]
    NotFound { kind: ResourceKind, id: String },

    /// Invalid plugin state for operation
    #[error("Invalid plugin state: {0}")]
    InvalidState(String),

    /// Invalid plugin operation
    #[error("Invalid plugin operation: {0}")]
    InvalidOperation(String),

    /// Invalid plugin module
    #[error("Invalid plugin module: {0}")]
    InvalidModule(String),

    /// Package extraction or layout problem
    #[error("Plugin package error: {0}")]
    Package(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Plugin-scoped encryption failure
    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Plugin runtime result type
pub type PluginResult<T> = Result<T, PluginRuntimeError>;

/// Kind of resource a lookup failed on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Plugin,
    ExtensionPoint,
    Hook,
    Module,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plugin => write!(f, "Plugin"),
            Self::ExtensionPoint => write!(f, "Extension point"),
            Self::Hook => write!(f, "Hook"),
            Self::Module => write!(f, "Module"),
        }
    }
}

fn join_permissions(missing: &[Permission]) -> String {
    missing
        .iter()
        .map(Permission::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

impl PluginRuntimeError {
    pub fn plugin_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: ResourceKind::Plugin,
            id: id.into(),
        }
    }

    pub fn point_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: ResourceKind::ExtensionPoint,
            id: id.into(),
        }
    }

    /// Registration through an API handle whose load was torn down
    pub fn revoked(plugin_id: &str) -> Self {
        Self::InvalidOperation(format!(
            "plugin {plugin_id} was unloaded; its API handle can no longer register"
        ))
    }

    /// Wrap an error raised by plugin code and attribute it to the plugin
    pub fn sandbox(plugin_id: impl Into<String>, error: anyhow::Error) -> Self {
        Self::Sandbox {
            plugin_id: plugin_id.into(),
            message: format!("{error:#}"),
            source: Some(error.into()),
        }
    }

    /// Sandbox failure without an underlying error value
    pub fn sandbox_message(plugin_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Sandbox {
            plugin_id: plugin_id.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Check if error is considered critical
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::ModuleNotAllowed { .. } | Self::InvalidModule(_) | Self::AccessDenied { .. }
        )
    }

    /// Get error category for logging and metrics
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) => ErrorCategory::Validation,
            Self::Dependency(_) => ErrorCategory::Dependency,
            Self::Permission { .. } | Self::AccessDenied { .. } | Self::ModuleNotAllowed { .. } => {
                ErrorCategory::Security
            }
            Self::Sandbox { .. } => ErrorCategory::Execution,
            Self::LoadTimeout { .. } => ErrorCategory::Timeout,
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::InvalidState(_) => ErrorCategory::State,
            Self::InvalidOperation(_) => ErrorCategory::Operation,
            Self::InvalidModule(_) => ErrorCategory::Module,
            Self::Package(_) | Self::IoError(_) => ErrorCategory::Io,
            Self::ConfigurationError(_) => ErrorCategory::Configuration,
            Self::Crypto(_) => ErrorCategory::Security,
            Self::JsonError(_) => ErrorCategory::Serialization,
        }
    }
}

/// Error category enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Dependency,
    Security,
    Execution,
    Timeout,
    NotFound,
    State,
    Operation,
    Module,
    Io,
    Configuration,
    Serialization,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Dependency => write!(f, "dependency"),
            Self::Security => write!(f, "security"),
            Self::Execution => write!(f, "execution"),
            Self::Timeout => write!(f, "timeout"),
            Self::NotFound => write!(f, "not_found"),
            Self::State => write!(f, "state"),
            Self::Operation => write!(f, "operation"),
            Self::Module => write!(f, "module"),
            Self::Io => write!(f, "io"),
            Self::Configuration => write!(f, "configuration"),
            Self::Serialization => write!(f, "serialization"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_error_names_missing_permissions() {
        let err = PluginRuntimeError::Permission {
            plugin_id: "b".to_string(),
            point_id: "ENTITY_PROCESSOR".to_string(),
            missing: vec![Permission::EntityRead, Permission::NetworkAccess],
        };
        let message = err.to_string();
        assert!(message.contains("ENTITY_READ"));
        assert!(message.contains("NETWORK_ACCESS"));
        assert_eq!(err.category(), ErrorCategory::Security);
    }

    #[test]
    fn test_validation_error_lists_every_problem() {
        let err = PluginRuntimeError::Validation(vec![
            "name is required".to_string(),
            "main entry is required".to_string(),
        ]);
        assert_eq!(
            err.to_string(),
            "Plugin manifest validation failed: name is required; main entry is required"
        );
    }

    #[test]
    fn test_sandbox_error_keeps_context_chain() {
        let cause = anyhow::anyhow!("disk full").context("writing cache");
        let err = PluginRuntimeError::sandbox("audit-trail", cause);
        assert!(err.to_string().contains("audit-trail"));
        assert!(err.to_string().contains("writing cache: disk full"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
