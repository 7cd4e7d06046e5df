//! Extension point registry
//!
//! Extension points are host-defined contracts. The host defines them at
//! start-up; only the extension dispatcher attaches and detaches
//! implementations.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{PluginResult, PluginRuntimeError};
use crate::module::Extension;
use crate::security::{missing_permissions, Permission, PermissionSet};

/// Methods, events and context fields an extension point promises
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtensionContract {
    pub methods: Vec<String>,
    pub events: Vec<String>,
    pub context: Vec<String>,
}

/// An implementation attached to a point
#[derive(Clone)]
pub struct RegisteredExtension {
    pub plugin_id: String,
    pub implementation: Arc<dyn Extension>,
    /// Plugin permissions at registration time
    pub granted: PermissionSet,
    pub registered_at: DateTime<Utc>,
}

impl std::fmt::Debug for RegisteredExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredExtension")
            .field("plugin_id", &self.plugin_id)
            .field("granted", &self.granted)
            .field("registered_at", &self.registered_at)
            .finish_non_exhaustive()
    }
}

/// Host-defined extension point
#[derive(Debug, Clone)]
pub struct ExtensionPoint {
    pub id: String,
    pub description: String,
    pub contract: ExtensionContract,
    pub required_permissions: PermissionSet,
    /// Data-access scopes the point's implementations touch
    pub data_access: Vec<String>,
    /// Implementations in registration order
    pub extensions: Vec<RegisteredExtension>,
}

impl ExtensionPoint {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            contract: ExtensionContract::default(),
            required_permissions: PermissionSet::new(),
            data_access: Vec::new(),
            extensions: Vec::new(),
        }
    }

    pub fn with_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.contract.methods = methods.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.contract.events = events.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_context<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.contract.context = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn requires(mut self, permission: Permission) -> Self {
        self.required_permissions.insert(permission);
        self
    }

    pub fn with_data_access(mut self, scope: impl Into<String>) -> Self {
        self.data_access.push(scope.into());
        self
    }

    pub fn info(&self) -> ExtensionPointInfo {
        ExtensionPointInfo {
            id: self.id.clone(),
            description: self.description.clone(),
            contract: self.contract.clone(),
            required_permissions: self.required_permissions.clone(),
            data_access: self.data_access.clone(),
            plugins: self.extensions.iter().map(|e| e.plugin_id.clone()).collect(),
        }
    }
}

/// Serializable view of an [`ExtensionPoint`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionPointInfo {
    pub id: String,
    pub description: String,
    pub contract: ExtensionContract,
    pub required_permissions: PermissionSet,
    pub data_access: Vec<String>,
    /// Plugin ids of attached implementations, in registration order
    pub plugins: Vec<String>,
}

/// Points the host starts with
pub fn default_extension_points() -> Vec<ExtensionPoint> {
    vec![
        ExtensionPoint::new("ENTITY_PROCESSOR", "Transform entities as they move through the host")
            .with_methods(["process"])
            .with_events(["entity.processed"])
            .with_context(["entityType", "entityId"])
            .requires(Permission::EntityRead)
            .with_data_access("entities"),
        ExtensionPoint::new("ENTITY_VALIDATOR", "Validate entities before they are persisted")
            .with_methods(["validate"])
            .with_context(["entityType"])
            .requires(Permission::EntityRead)
            .with_data_access("entities"),
        ExtensionPoint::new("ANALYTICS_PROVIDER", "Contribute metrics and reports")
            .with_methods(["collect", "report"])
            .with_context(["period"])
            .requires(Permission::AnalyticsRead)
            .with_data_access("analytics"),
        ExtensionPoint::new("NOTIFICATION_CHANNEL", "Deliver notifications over a custom channel")
            .with_methods(["send"])
            .with_events(["notification.sent", "notification.failed"])
            .with_context(["recipient", "channel"])
            .requires(Permission::NotificationSend),
        ExtensionPoint::new("WORKFLOW_ACTION", "Custom workflow step")
            .with_methods(["execute"])
            .with_context(["workflowId", "step"])
            .requires(Permission::WorkflowExecute),
        ExtensionPoint::new("DATA_EXPORTER", "Export host data to external formats")
            .with_methods(["export"])
            .with_context(["format"])
            .requires(Permission::EntityRead)
            .with_data_access("entities"),
    ]
}

/// Registry of extension points keyed by id
#[derive(Debug, Default)]
pub struct ExtensionPointRegistry {
    points: RwLock<BTreeMap<String, ExtensionPoint>>,
}

impl ExtensionPointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let points = default_extension_points()
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
        Self {
            points: RwLock::new(points),
        }
    }

    /// Define or redefine a point. Redefinition keeps the attached
    /// implementations whose plugins hold every newly required permission
    /// and detaches the rest. Returns the ids of detached plugins.
    pub async fn define(&self, mut point: ExtensionPoint) -> Vec<String> {
        let mut points = self.points.write().await;
        let mut detached = Vec::new();
        if let Some(existing) = points.remove(&point.id) {
            for extension in existing.extensions {
                let missing = missing_permissions(&extension.granted, &point.required_permissions);
                if missing.is_empty() {
                    point.extensions.push(extension);
                } else {
                    warn!(
                        point = %point.id,
                        plugin_id = %extension.plugin_id,
                        ?missing,
                        "Extension detached by point redefinition"
                    );
                    detached.push(extension.plugin_id);
                }
            }
        }
        debug!(point = %point.id, "Extension point defined");
        points.insert(point.id.clone(), point);
        detached
    }

    pub async fn contains(&self, point_id: &str) -> bool {
        self.points.read().await.contains_key(point_id)
    }

    /// Ids among `point_ids` that are not defined
    pub async fn unknown_points<'a>(&self, point_ids: &'a [String]) -> Vec<&'a str> {
        let points = self.points.read().await;
        point_ids
            .iter()
            .filter(|id| !points.contains_key(id.as_str()))
            .map(String::as_str)
            .collect()
    }

    pub async fn required_permissions(&self, point_id: &str) -> PluginResult<PermissionSet> {
        self.points
            .read()
            .await
            .get(point_id)
            .map(|p| p.required_permissions.clone())
            .ok_or_else(|| PluginRuntimeError::point_not_found(point_id))
    }

    /// Attach after checking the extension's permissions against the point.
    /// Both checks run under the write lock, so neither a redefinition nor a
    /// revocation of `scope` can slip in between.
    pub(crate) async fn attach(
        &self,
        point_id: &str,
        extension: RegisteredExtension,
        scope: Option<&CancellationToken>,
    ) -> PluginResult<()> {
        let mut points = self.points.write().await;
        let point = points
            .get_mut(point_id)
            .ok_or_else(|| PluginRuntimeError::point_not_found(point_id))?;
        if scope.is_some_and(CancellationToken::is_cancelled) {
            return Err(PluginRuntimeError::revoked(&extension.plugin_id));
        }
        let missing = missing_permissions(&extension.granted, &point.required_permissions);
        if !missing.is_empty() {
            return Err(PluginRuntimeError::Permission {
                plugin_id: extension.plugin_id,
                point_id: point_id.to_string(),
                missing,
            });
        }
        point.extensions.push(extension);
        Ok(())
    }

    /// Remove a plugin's implementations from one point; returns how many were removed
    pub(crate) async fn detach(&self, point_id: &str, plugin_id: &str) -> usize {
        let mut points = self.points.write().await;
        let Some(point) = points.get_mut(point_id) else {
            return 0;
        };
        let before = point.extensions.len();
        point.extensions.retain(|e| e.plugin_id != plugin_id);
        before - point.extensions.len()
    }

    pub(crate) async fn detach_plugin(&self, plugin_id: &str) -> usize {
        let mut points = self.points.write().await;
        points
            .values_mut()
            .map(|point| {
                let before = point.extensions.len();
                point.extensions.retain(|e| e.plugin_id != plugin_id);
                before - point.extensions.len()
            })
            .sum()
    }

    /// Copy of a point's implementations at this moment
    pub async fn snapshot(&self, point_id: &str) -> PluginResult<Vec<RegisteredExtension>> {
        self.points
            .read()
            .await
            .get(point_id)
            .map(|p| p.extensions.clone())
            .ok_or_else(|| PluginRuntimeError::point_not_found(point_id))
    }

    pub async fn list(&self) -> Vec<ExtensionPointInfo> {
        self.points.read().await.values().map(ExtensionPoint::info).collect()
    }

    pub async fn extension_count(&self) -> usize {
        self.points.read().await.values().map(|p| p.extensions.len()).sum()
    }
}
