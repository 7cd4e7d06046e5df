//! PluginAPI surface
//!
//! Everything plugin code can reach in the host goes through [`PluginApi`].
//! Each instance is bound to one plugin id, so events are always published
//! under the caller's own id and every permission check is made against the
//! caller's current record.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditSink};
use crate::crypto::MasterKey;
use crate::error::{PluginResult, PluginRuntimeError};
use crate::events::{PluginEvent, PluginEventBus};
use crate::extensions::ExtensionDispatcher;
use crate::hooks::HookPipeline;
use crate::module::{Extension, HookHandler};
use crate::registry::PluginRegistry;
use crate::sandbox::ResourceLimits;
use crate::security::Permission;
use crate::store::ConfigStore;

/// Host data service a plugin can call into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataService {
    Entities,
    Analytics,
    Notifications,
    Workflows,
}

impl fmt::Display for DataService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Entities => "entities",
            Self::Analytics => "analytics",
            Self::Notifications => "notifications",
            Self::Workflows => "workflows",
        };
        f.write_str(name)
    }
}

/// Delegated call into a host data service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataRequest {
    pub service: DataService,
    pub operation: String,
    #[serde(default)]
    pub params: Value,
}

impl DataRequest {
    pub fn new(service: DataService, operation: impl Into<String>, params: Value) -> Self {
        Self {
            service,
            operation: operation.into(),
            params,
        }
    }

    /// Permission this request needs
    pub fn required_permission(&self) -> PluginResult<Permission> {
        let operation = self.operation.as_str();
        let permission = match self.service {
            DataService::Entities => match operation {
                "get" | "list" | "search" => Permission::EntityRead,
                "create" | "update" => Permission::EntityWrite,
                "delete" => Permission::EntityDelete,
                other => {
                    return Err(PluginRuntimeError::InvalidOperation(format!(
                        "unknown entities operation '{other}'"
                    )))
                }
            },
            DataService::Analytics => match operation {
                "query" | "report" => Permission::AnalyticsRead,
                _ => Permission::AnalyticsWrite,
            },
            DataService::Notifications => Permission::NotificationSend,
            DataService::Workflows => Permission::WorkflowExecute,
        };
        Ok(permission)
    }

    fn action(&self) -> String {
        format!("{}.{}", self.service, self.operation)
    }
}

/// Host implementation of the data services
#[async_trait]
pub trait DataServices: Send + Sync {
    async fn execute(&self, plugin_id: &str, request: &DataRequest) -> anyhow::Result<Value>;
}

/// Default when the host wires no data services
#[derive(Debug, Default)]
pub struct NoDataServices;

#[async_trait]
impl DataServices for NoDataServices {
    async fn execute(&self, _plugin_id: &str, request: &DataRequest) -> anyhow::Result<Value> {
        anyhow::bail!("no {} service is configured", request.service)
    }
}

/// Response of [`PluginApi::http_get`]
#[derive(Debug, Clone, Serialize)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// Shared host services behind every [`PluginApi`]
pub struct ApiServices {
    pub(crate) registry: Arc<PluginRegistry>,
    pub(crate) hooks: Arc<HookPipeline>,
    pub(crate) extensions: Arc<ExtensionDispatcher>,
    pub(crate) bus: Arc<PluginEventBus>,
    pub(crate) config_store: Arc<dyn ConfigStore>,
    pub(crate) data: Arc<dyn DataServices>,
    pub(crate) audit: Arc<dyn AuditSink>,
    pub(crate) master_key: MasterKey,
    pub(crate) http: reqwest::Client,
}

/// API handle bound to one plugin and to the load that issued it
#[derive(Clone)]
pub struct PluginApi {
    plugin_id: Arc<str>,
    limits: Arc<ResourceLimits>,
    services: Arc<ApiServices>,
    /// Cancelled when that load is torn down
    revoked: CancellationToken,
}

impl fmt::Debug for PluginApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginApi").field("plugin_id", &self.plugin_id).finish_non_exhaustive()
    }
}

impl PluginApi {
    pub(crate) fn new(
        plugin_id: &str,
        limits: ResourceLimits,
        services: Arc<ApiServices>,
        revoked: CancellationToken,
    ) -> Self {
        Self {
            plugin_id: Arc::from(plugin_id),
            limits: Arc::new(limits),
            services,
            revoked,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// True once the plugin was unloaded or failed after this handle was issued.
    /// A revoked handle can no longer register hooks or extensions.
    pub fn is_revoked(&self) -> bool {
        self.revoked.is_cancelled()
    }

    // Events

    /// Publish `name` under this plugin's id; returns the number of receivers
    pub async fn emit(&self, name: &str, payload: Value) -> usize {
        self.services.bus.publish(&self.plugin_id, name, payload).await
    }

    pub async fn subscribe(&self, source: &str, name: &str) -> broadcast::Receiver<PluginEvent> {
        self.services.bus.subscribe(source, name).await
    }

    // Configuration

    pub async fn config(&self) -> PluginResult<Map<String, Value>> {
        Ok(self.services.registry.get(&self.plugin_id).await?.configuration)
    }

    pub async fn get_config(&self, key: &str) -> PluginResult<Option<Value>> {
        Ok(self.config().await?.get(key).cloned())
    }

    /// Update the live record and persist in the background
    pub async fn set_config(&self, key: &str, value: Value) -> PluginResult<()> {
        self.services
            .registry
            .set_configuration(&self.plugin_id, key, value.clone())
            .await?;

        let store = self.services.config_store.clone();
        let plugin_id = self.plugin_id.to_string();
        let key = key.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.save(&plugin_id, &key, value).await {
                warn!(plugin_id = %plugin_id, key = %key, error = %e, "Failed to persist plugin configuration");
            }
        });
        Ok(())
    }

    // Hooks and extensions

    pub async fn register_hook(&self, hook_name: &str, priority: i32, handler: Arc<dyn HookHandler>) -> PluginResult<()> {
        self.services
            .hooks
            .register_scoped(hook_name, &self.plugin_id, handler, priority, &self.revoked)
            .await
    }

    pub async fn unregister_hook(&self, hook_name: &str) -> usize {
        self.services.hooks.unregister_hook(hook_name, &self.plugin_id).await
    }

    pub async fn register_extension(&self, point_id: &str, implementation: Arc<dyn Extension>) -> PluginResult<()> {
        self.services
            .extensions
            .register_scoped(&self.plugin_id, point_id, implementation, &self.revoked)
            .await
    }

    // Data access

    async fn audit(&self, event_type: &str, action: String, allowed: bool, data: Value) {
        self.services
            .audit
            .record(AuditEntry::new(event_type, &*self.plugin_id, action, allowed, data))
            .await;
    }

    async fn check_permission(&self, permission: Permission, operation: &str) -> PluginResult<()> {
        let plugin = self.services.registry.get(&self.plugin_id).await?;
        if plugin.has_permission(permission) {
            Ok(())
        } else {
            Err(PluginRuntimeError::AccessDenied {
                plugin_id: self.plugin_id.to_string(),
                permission,
                operation: operation.to_string(),
            })
        }
    }

    /// Delegate to a host data service after the permission check.
    /// Allowed and denied calls are both audited.
    pub async fn call(&self, request: DataRequest) -> PluginResult<Value> {
        let action = request.action();
        let checked = match request.required_permission() {
            Ok(permission) => self.check_permission(permission, &action).await,
            Err(e) => Err(e),
        };
        self.audit(
            "plugin.data_access",
            action.clone(),
            checked.is_ok(),
            serde_json::json!({ "params": request.params }),
        )
        .await;
        checked?;

        debug!(plugin_id = %self.plugin_id, action = %action, "Data service call");
        self.services
            .data
            .execute(&self.plugin_id, &request)
            .await
            .map_err(|e| PluginRuntimeError::InvalidOperation(format!("{action} failed: {e:#}")))
    }

    /// GET `url`; needs NETWORK_ACCESS and a host on the sandbox allowlist
    pub async fn http_get(&self, url: &str) -> PluginResult<HttpResponse> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| PluginRuntimeError::InvalidOperation(format!("invalid url '{url}': {e}")))?;
        let host = parsed.host_str().unwrap_or_default().to_string();
        let action = format!("http.get {host}");

        let mut checked = self.check_permission(Permission::NetworkAccess, &action).await;
        if checked.is_ok() && !self.limits.allows_host(&host) {
            checked = Err(PluginRuntimeError::AccessDenied {
                plugin_id: self.plugin_id.to_string(),
                permission: Permission::NetworkAccess,
                operation: format!("{action} (host not in allowlist)"),
            });
        }
        self.audit("plugin.network", action, checked.is_ok(), serde_json::json!({ "url": url }))
            .await;
        checked?;

        let response = self
            .services
            .http
            .get(parsed)
            .send()
            .await
            .map_err(|e| PluginRuntimeError::InvalidOperation(format!("http request failed: {e}")))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| PluginRuntimeError::InvalidOperation(format!("http body unreadable: {e}")))?;
        Ok(HttpResponse { status, body })
    }

    // Utilities

    pub fn generate_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    pub fn sanitize(&self, input: &str) -> String {
        sanitize(input)
    }

    pub fn encrypt(&self, plaintext: &str) -> PluginResult<String> {
        self.services.master_key.cipher_for(&self.plugin_id)?.encrypt(plaintext)
    }

    pub fn decrypt(&self, ciphertext: &str) -> PluginResult<String> {
        self.services.master_key.cipher_for(&self.plugin_id)?.decrypt(ciphertext)
    }
}

/// Drop control characters (newline and tab survive) and HTML-escape
pub fn sanitize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '\n' | '\t' => out.push(c),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out
}
