//! Plugin registry and manifest validation
//!
//! The registry is the single owner of [`Plugin`] records. Registration is
//! all-or-nothing: every manifest problem is collected into one
//! `Validation` error and nothing is stored unless the manifest and its
//! dependencies check out.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{PluginResult, PluginRuntimeError};
use crate::events::HOST_SOURCE;
use crate::extension_point::ExtensionPointRegistry;
use crate::manifest::PluginManifest;
use crate::plugin::{Plugin, PluginFilter, PluginMetrics, PluginStatus};
use crate::resolver::DependencyResolver;
use crate::security::{Permission, PermissionSet};

/// Result of one hook or extension invocation, for per-plugin metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success,
    Error,
    Timeout,
}

/// Owner of all plugin records
pub struct PluginRegistry {
    plugins: RwLock<HashMap<String, Plugin>>,
    points: Arc<ExtensionPointRegistry>,
    resolver: Arc<DependencyResolver>,
}

impl PluginRegistry {
    pub fn new(points: Arc<ExtensionPointRegistry>, resolver: Arc<DependencyResolver>) -> Self {
        Self {
            plugins: RwLock::new(HashMap::new()),
            points,
            resolver,
        }
    }

    /// Validate a manifest and build the record it would produce.
    ///
    /// `replacing` names the plugin being updated; its id is then expected
    /// rather than rejected as a duplicate.
    async fn build(
        &self,
        manifest: &PluginManifest,
        plugins: &HashMap<String, Plugin>,
        replacing: Option<&str>,
    ) -> PluginResult<Plugin> {
        let mut errors = Vec::new();

        let id = match (&manifest.id, replacing) {
            (Some(id), _) if id.trim().is_empty() => {
                errors.push("id must not be empty".to_string());
                String::new()
            }
            (Some(id), Some(current)) if id != current => {
                errors.push(format!("package id '{id}' does not match plugin '{current}'"));
                id.clone()
            }
            (Some(id), _) => id.clone(),
            (None, Some(current)) => current.to_string(),
            (None, None) => Uuid::new_v4().to_string(),
        };
        if replacing.is_none() && plugins.contains_key(&id) {
            errors.push(format!("plugin id '{id}' is already registered"));
        }
        if id == HOST_SOURCE {
            errors.push(format!("plugin id '{id}' is reserved for the host"));
        }
        if id.contains(':') {
            errors.push(format!("plugin id '{id}' must not contain ':'"));
        }

        if manifest.name.trim().is_empty() {
            errors.push("name is required".to_string());
        }
        if semver::Version::parse(manifest.version.trim()).is_err() {
            errors.push(format!(
                "version '{}' is not a valid semantic version",
                manifest.version
            ));
        }
        if manifest.main.trim().is_empty() {
            errors.push("main entry is required".to_string());
        }

        for point in self.points.unknown_points(&manifest.extension_points).await {
            errors.push(format!("unknown extension point '{point}'"));
        }

        let mut permissions = PermissionSet::new();
        for name in &manifest.permissions {
            match name.parse::<Permission>() {
                Ok(permission) => {
                    permissions.insert(permission);
                }
                Err(e) => errors.push(e.to_string()),
            }
        }

        if !errors.is_empty() {
            return Err(PluginRuntimeError::Validation(errors));
        }

        let installed: HashMap<String, String> = plugins
            .values()
            .filter(|p| Some(p.id.as_str()) != replacing)
            .map(|p| (p.id.clone(), p.version.clone()))
            .collect();
        self.resolver
            .check(&manifest.dependencies, &manifest.peer_dependencies, &installed)?;

        let now = Utc::now();
        Ok(Plugin {
            id,
            name: manifest.name.trim().to_string(),
            version: manifest.version.trim().to_string(),
            description: manifest.description.clone(),
            main: manifest.main.trim().to_string(),
            extension_points: manifest.extension_points.clone(),
            hooks: manifest.hooks.clone(),
            dependencies: manifest.dependencies.clone(),
            peer_dependencies: manifest.peer_dependencies.clone(),
            permissions,
            sandboxed: manifest.sandboxed,
            status: PluginStatus::Registered,
            configuration: manifest.configuration.clone(),
            metrics: PluginMetrics::default(),
            error: None,
            install_path: None,
            registered_at: now,
            updated_at: now,
        })
    }

    /// Validate without storing
    pub async fn validate(&self, manifest: &PluginManifest) -> PluginResult<Plugin> {
        let plugins = self.plugins.read().await;
        self.build(manifest, &plugins, None).await
    }

    /// Validate, resolve dependencies and store as `REGISTERED`
    pub async fn register(&self, manifest: &PluginManifest) -> PluginResult<Plugin> {
        let mut plugins = self.plugins.write().await;
        let plugin = self.build(manifest, &plugins, None).await?;
        self.resolver.record(&plugin.id, plugin.dependencies.keys());
        plugins.insert(plugin.id.clone(), plugin.clone());
        info!(plugin_id = %plugin.id, version = %plugin.version, "Plugin registered");
        Ok(plugin)
    }

    /// Build the record an update would produce, keeping the previous
    /// record's configuration values, metrics and registration time
    pub async fn prepare_replacement(&self, id: &str, manifest: &PluginManifest) -> PluginResult<Plugin> {
        let plugins = self.plugins.read().await;
        let previous = plugins
            .get(id)
            .ok_or_else(|| PluginRuntimeError::plugin_not_found(id))?;
        let mut plugin = self.build(manifest, &plugins, Some(id)).await?;
        for (key, value) in &previous.configuration {
            plugin.configuration.insert(key.clone(), value.clone());
        }
        plugin.metrics = previous.metrics.clone();
        plugin.registered_at = previous.registered_at;
        plugin.install_path = previous.install_path.clone();
        Ok(plugin)
    }

    /// Store `plugin` over the record with the same id
    pub async fn replace(&self, plugin: Plugin) -> PluginResult<Plugin> {
        let mut plugins = self.plugins.write().await;
        let slot = plugins
            .get_mut(&plugin.id)
            .ok_or_else(|| PluginRuntimeError::plugin_not_found(&plugin.id))?;
        self.resolver.forget_dependencies_of(&plugin.id, slot.dependencies.keys());
        self.resolver.record(&plugin.id, plugin.dependencies.keys());
        *slot = plugin.clone();
        debug!(plugin_id = %plugin.id, version = %plugin.version, "Plugin record replaced");
        Ok(plugin)
    }

    pub async fn get(&self, id: &str) -> PluginResult<Plugin> {
        self.plugins
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| PluginRuntimeError::plugin_not_found(id))
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.plugins.read().await.contains_key(id)
    }

    /// Plugins matching `filter`, ordered by registration time then id
    pub async fn list(&self, filter: &PluginFilter) -> Vec<Plugin> {
        let mut plugins: Vec<Plugin> = self
            .plugins
            .read()
            .await
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        plugins.sort_by(|a, b| a.registered_at.cmp(&b.registered_at).then_with(|| a.id.cmp(&b.id)));
        plugins
    }

    /// Apply a lifecycle transition, rejecting moves outside the state machine
    pub async fn transition(&self, id: &str, to: PluginStatus) -> PluginResult<Plugin> {
        let mut plugins = self.plugins.write().await;
        let plugin = plugins
            .get_mut(id)
            .ok_or_else(|| PluginRuntimeError::plugin_not_found(id))?;
        if !plugin.status.can_transition_to(to) {
            return Err(PluginRuntimeError::InvalidState(format!(
                "plugin {id} cannot move from {} to {to}",
                plugin.status
            )));
        }
        debug!(plugin_id = %id, from = %plugin.status, to = %to, "Plugin status change");
        plugin.status = to;
        if to != PluginStatus::Failed {
            plugin.error = None;
        }
        if to == PluginStatus::Active {
            plugin.metrics.activations += 1;
        }
        plugin.updated_at = Utc::now();
        Ok(plugin.clone())
    }

    /// Move to `FAILED` from any state and count the failure
    pub async fn mark_failed(&self, id: &str, message: &str) -> Option<Plugin> {
        let mut plugins = self.plugins.write().await;
        let plugin = plugins.get_mut(id)?;
        plugin.status = PluginStatus::Failed;
        plugin.error = Some(message.to_string());
        plugin.metrics.load_failures += 1;
        plugin.updated_at = Utc::now();
        Some(plugin.clone())
    }

    /// Force a status without transition checks (used to roll back updates)
    pub(crate) async fn restore_status(&self, id: &str, status: PluginStatus) {
        if let Some(plugin) = self.plugins.write().await.get_mut(id) {
            plugin.status = status;
            plugin.updated_at = Utc::now();
        }
    }

    /// Delete a plugin; only allowed while `REGISTERED`
    pub async fn remove(&self, id: &str) -> PluginResult<Plugin> {
        let mut plugins = self.plugins.write().await;
        let status = plugins
            .get(id)
            .map(|p| p.status)
            .ok_or_else(|| PluginRuntimeError::plugin_not_found(id))?;
        if status != PluginStatus::Registered {
            return Err(PluginRuntimeError::InvalidState(format!(
                "plugin {id} must be REGISTERED to be removed (currently {status})"
            )));
        }
        let plugin = plugins
            .remove(id)
            .ok_or_else(|| PluginRuntimeError::plugin_not_found(id))?;
        self.resolver.forget(id);
        info!(plugin_id = %id, "Plugin removed");
        Ok(plugin)
    }

    /// Drop a record regardless of status (rollback of a failed install)
    pub(crate) async fn discard(&self, id: &str) {
        if self.plugins.write().await.remove(id).is_some() {
            self.resolver.forget(id);
        }
    }

    pub async fn record_execution(&self, id: &str, outcome: ExecutionOutcome) {
        let mut plugins = self.plugins.write().await;
        let Some(plugin) = plugins.get_mut(id) else {
            return;
        };
        let metrics = &mut plugin.metrics;
        metrics.executions += 1;
        metrics.last_execution = Some(Utc::now());
        match outcome {
            ExecutionOutcome::Success => {}
            ExecutionOutcome::Error => metrics.errors += 1,
            ExecutionOutcome::Timeout => metrics.timeouts += 1,
        }
    }

    pub async fn set_configuration(&self, id: &str, key: &str, value: serde_json::Value) -> PluginResult<()> {
        let mut plugins = self.plugins.write().await;
        let plugin = plugins
            .get_mut(id)
            .ok_or_else(|| PluginRuntimeError::plugin_not_found(id))?;
        plugin.configuration.insert(key.to_string(), value);
        plugin.updated_at = Utc::now();
        Ok(())
    }

    /// Overlay persisted values onto the record's configuration
    pub async fn merge_configuration(
        &self,
        id: &str,
        values: serde_json::Map<String, serde_json::Value>,
    ) -> PluginResult<Plugin> {
        let mut plugins = self.plugins.write().await;
        let plugin = plugins
            .get_mut(id)
            .ok_or_else(|| PluginRuntimeError::plugin_not_found(id))?;
        plugin.configuration.extend(values);
        Ok(plugin.clone())
    }

    pub async fn set_install_path(&self, id: &str, path: std::path::PathBuf) -> PluginResult<()> {
        let mut plugins = self.plugins.write().await;
        let plugin = plugins
            .get_mut(id)
            .ok_or_else(|| PluginRuntimeError::plugin_not_found(id))?;
        plugin.install_path = Some(path);
        Ok(())
    }

    /// Plugin count per status, including zero counts
    pub async fn status_counts(&self) -> BTreeMap<String, usize> {
        let plugins = self.plugins.read().await;
        let mut counts: BTreeMap<String, usize> =
            PluginStatus::ALL.iter().map(|s| (s.to_string(), 0)).collect();
        for plugin in plugins.values() {
            *counts.entry(plugin.status.to_string()).or_default() += 1;
        }
        counts
    }

    pub async fn metrics(&self) -> BTreeMap<String, PluginMetrics> {
        self.plugins
            .read()
            .await
            .values()
            .map(|p| (p.id.clone(), p.metrics.clone()))
            .collect()
    }
}
