//! Extension dispatcher
//!
//! Registers plugin implementations against extension points (after the
//! permission check) and broadcasts method calls to them. Implementations run
//! one at a time in registration order; a failure in one never stops the rest.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PluginResult, PluginRuntimeError};
use crate::events::{EventHub, RuntimeEvent};
use crate::extension_point::{ExtensionPointRegistry, RegisteredExtension};
use crate::metrics::RuntimeMetrics;
use crate::module::Extension;
use crate::registry::{ExecutionOutcome, PluginRegistry};
use crate::sandbox::isolate;

/// Result from one implementation, tagged with its plugin
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionResult {
    pub plugin_id: String,
    pub result: Value,
}

pub struct ExtensionDispatcher {
    points: Arc<ExtensionPointRegistry>,
    registry: Arc<PluginRegistry>,
    events: Arc<EventHub>,
    metrics: Arc<RuntimeMetrics>,
    timeout: Duration,
}

impl ExtensionDispatcher {
    pub fn new(
        points: Arc<ExtensionPointRegistry>,
        registry: Arc<PluginRegistry>,
        events: Arc<EventHub>,
        metrics: Arc<RuntimeMetrics>,
        timeout: Duration,
    ) -> Self {
        Self {
            points,
            registry,
            events,
            metrics,
            timeout,
        }
    }

    pub async fn register_extension(
        &self,
        plugin_id: &str,
        point_id: &str,
        implementation: Arc<dyn Extension>,
    ) -> PluginResult<()> {
        self.attach(plugin_id, point_id, implementation, None).await
    }

    /// [`register_extension`](Self::register_extension) on behalf of plugin
    /// code. Rejected once `scope` is cancelled.
    pub(crate) async fn register_scoped(
        &self,
        plugin_id: &str,
        point_id: &str,
        implementation: Arc<dyn Extension>,
        scope: &CancellationToken,
    ) -> PluginResult<()> {
        self.attach(plugin_id, point_id, implementation, Some(scope)).await
    }

    async fn attach(
        &self,
        plugin_id: &str,
        point_id: &str,
        implementation: Arc<dyn Extension>,
        scope: Option<&CancellationToken>,
    ) -> PluginResult<()> {
        let plugin = self.registry.get(plugin_id).await?;
        let extension = RegisteredExtension {
            plugin_id: plugin_id.to_string(),
            implementation,
            granted: plugin.permissions,
            registered_at: Utc::now(),
        };
        if let Err(e) = self.points.attach(point_id, extension, scope).await {
            if let PluginRuntimeError::Permission { missing, .. } = &e {
                warn!(plugin_id, point = point_id, ?missing, "Extension registration denied");
            }
            return Err(e);
        }
        info!(plugin_id, point = point_id, "Extension registered");
        self.events.emit(RuntimeEvent::ExtensionRegistered {
            plugin_id: plugin_id.to_string(),
            point_id: point_id.to_string(),
        });
        Ok(())
    }

    /// Remove `plugin_id`'s implementations from `point_id`. Idempotent.
    pub async fn unregister_extension(&self, plugin_id: &str, point_id: &str) -> usize {
        let removed = self.points.detach(point_id, plugin_id).await;
        if removed > 0 {
            debug!(plugin_id, point = point_id, removed, "Extension unregistered");
        }
        removed
    }

    pub async fn unregister_plugin(&self, plugin_id: &str) -> usize {
        self.points.detach_plugin(plugin_id).await
    }

    /// Call `method` on every implementation of `point_id` that exposes it.
    ///
    /// Failed, panicking and timed-out implementations are left out of the
    /// result; an unknown point is `NotFound`.
    pub async fn execute_extension(
        &self,
        point_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> PluginResult<Vec<ExtensionResult>> {
        let snapshot = self.points.snapshot(point_id).await?;
        let mut results = Vec::with_capacity(snapshot.len());

        for extension in snapshot {
            if !extension.implementation.implements(method) {
                continue;
            }

            let implementation = extension.implementation.clone();
            let call_method = method.to_string();
            let call_args = args.clone();
            self.metrics.extension_executed();

            let run = isolate(&extension.plugin_id, async move {
                implementation.invoke(&call_method, call_args).await
            });
            let outcome = match tokio::time::timeout(self.timeout, run).await {
                Ok(Ok(result)) => {
                    results.push(ExtensionResult {
                        plugin_id: extension.plugin_id.clone(),
                        result,
                    });
                    ExecutionOutcome::Success
                }
                Ok(Err(e)) => {
                    warn!(point = point_id, method, plugin_id = %extension.plugin_id, error = %e, "Extension call failed");
                    self.metrics.extension_failed();
                    ExecutionOutcome::Error
                }
                Err(_) => {
                    warn!(point = point_id, method, plugin_id = %extension.plugin_id, "Extension call timed out");
                    self.metrics.extension_timed_out();
                    ExecutionOutcome::Timeout
                }
            };
            self.registry.record_execution(&extension.plugin_id, outcome).await;
        }

        Ok(results)
    }
}
