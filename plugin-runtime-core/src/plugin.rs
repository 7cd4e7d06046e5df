//! Plugin entity and lifecycle status

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::security::{Permission, PermissionSet};

/// Plugin lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginStatus {
    /// Validated and stored, no code loaded
    Registered,
    /// Module being instantiated
    Loading,
    /// Code loaded, hooks and extensions registered
    Loaded,
    /// Activation callback running
    Activating,
    /// Fully active
    Active,
    /// Deactivation callback running
    Deactivating,
    /// Last lifecycle operation failed; nothing of the plugin is live
    Failed,
}

impl PluginStatus {
    pub const ALL: [PluginStatus; 7] = [
        PluginStatus::Registered,
        PluginStatus::Loading,
        PluginStatus::Loaded,
        PluginStatus::Activating,
        PluginStatus::Active,
        PluginStatus::Deactivating,
        PluginStatus::Failed,
    ];

    /// Whether `next` is a legal transition from this state
    pub fn can_transition_to(self, next: PluginStatus) -> bool {
        use PluginStatus::*;
        matches!(
            (self, next),
            (Registered | Failed, Loading)
                | (Loading, Loaded | Failed)
                | (Loaded, Activating | Registered | Failed)
                | (Activating, Active | Failed)
                | (Active, Deactivating | Failed)
                | (Deactivating, Loaded | Failed)
                | (Failed, Registered)
        )
    }

    /// Code is loaded and hooks/extensions are live
    pub fn is_live(self) -> bool {
        matches!(self, PluginStatus::Loaded | PluginStatus::Active)
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Registered => "REGISTERED",
            Self::Loading => "LOADING",
            Self::Loaded => "LOADED",
            Self::Activating => "ACTIVATING",
            Self::Active => "ACTIVE",
            Self::Deactivating => "DEACTIVATING",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Per-plugin usage statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMetrics {
    /// Successful activations
    pub activations: u64,
    /// Hook and extension invocations
    pub executions: u64,
    /// Invocations that returned an error or panicked
    pub errors: u64,
    /// Invocations abandoned after their timeout
    pub timeouts: u64,
    /// Failed lifecycle operations
    pub load_failures: u64,
    /// Last invocation timestamp
    pub last_execution: Option<DateTime<Utc>>,
}

/// Plugin record, owned by the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plugin {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub main: String,
    pub extension_points: Vec<String>,
    pub hooks: Vec<String>,
    pub dependencies: BTreeMap<String, String>,
    pub peer_dependencies: BTreeMap<String, String>,
    pub permissions: PermissionSet,
    pub sandboxed: bool,
    pub status: PluginStatus,
    pub configuration: serde_json::Map<String, serde_json::Value>,
    pub metrics: PluginMetrics,
    /// Message of the last lifecycle failure
    pub error: Option<String>,
    /// Directory the plugin package was installed into
    pub install_path: Option<PathBuf>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plugin {
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    pub fn declares_hook(&self, hook: &str) -> bool {
        self.hooks.iter().any(|h| h == hook)
    }

    pub fn declares_extension_point(&self, point_id: &str) -> bool {
        self.extension_points.iter().any(|p| p == point_id)
    }
}

/// Filter for plugin listings. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct PluginFilter {
    pub status: Option<PluginStatus>,
    pub extension_point: Option<String>,
    pub permission: Option<Permission>,
    pub name_contains: Option<String>,
}

impl PluginFilter {
    pub fn status(status: PluginStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn matches(&self, plugin: &Plugin) -> bool {
        if self.status.is_some_and(|s| s != plugin.status) {
            return false;
        }
        if let Some(point) = &self.extension_point {
            if !plugin.declares_extension_point(point) {
                return false;
            }
        }
        if self.permission.is_some_and(|p| !plugin.has_permission(p)) {
            return false;
        }
        if let Some(needle) = &self.name_contains {
            if !plugin.name.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        true
    }
}
