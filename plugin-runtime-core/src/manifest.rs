//! Plugin manifest
//!
//! Declarative plugin metadata read from `plugin.json` at the root of a
//! plugin package. Fields are kept loosely typed here; the registry's
//! validator turns them into a [`Plugin`](crate::plugin::Plugin) and reports
//! every problem at once.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::PluginResult;

/// Manifest file name inside a plugin package
pub const MANIFEST_FILE: &str = "plugin.json";

/// Plugin manifest structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    /// Plugin unique identifier (generated when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Plugin name
    #[serde(default)]
    pub name: String,
    /// Semantic version
    #[serde(default)]
    pub version: String,
    /// Plugin description
    #[serde(default)]
    pub description: String,
    /// Main entry reference
    #[serde(default)]
    pub main: String,
    /// Extension points the plugin implements
    #[serde(default)]
    pub extension_points: Vec<String>,
    /// Hooks the plugin attaches to
    #[serde(default)]
    pub hooks: Vec<String>,
    /// Required plugins: id -> version range
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    /// Optional plugins checked only when present
    #[serde(default)]
    pub peer_dependencies: BTreeMap<String, String>,
    /// Requested permissions
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Run inside a sandbox (the trusted path must be opted into explicitly)
    #[serde(default = "default_sandboxed")]
    pub sandboxed: bool,
    /// Initial plugin configuration
    #[serde(default)]
    pub configuration: serde_json::Map<String, serde_json::Value>,
}

fn default_sandboxed() -> bool {
    true
}

impl PluginManifest {
    /// Minimal manifest with the required fields set
    pub fn new(name: impl Into<String>, version: impl Into<String>, main: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            main: main.into(),
            sandboxed: true,
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.push(permission.into());
        self
    }

    pub fn with_extension_point(mut self, point_id: impl Into<String>) -> Self {
        self.extension_points.push(point_id.into());
        self
    }

    pub fn with_hook(mut self, hook: impl Into<String>) -> Self {
        self.hooks.push(hook.into());
        self
    }

    pub fn with_dependency(mut self, id: impl Into<String>, range: impl Into<String>) -> Self {
        self.dependencies.insert(id.into(), range.into());
        self
    }

    pub fn with_peer_dependency(mut self, id: impl Into<String>, range: impl Into<String>) -> Self {
        self.peer_dependencies.insert(id.into(), range.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.configuration.insert(key.into(), value);
        self
    }

    /// Opt out of sandboxing. Trusted plugins run with full host access.
    pub fn trusted(mut self) -> Self {
        self.sandboxed = false;
        self
    }

    pub fn from_json(json: &str) -> PluginResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub async fn from_file(path: impl AsRef<Path>) -> PluginResult<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_json(&raw)
    }
}
