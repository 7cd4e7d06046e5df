//! Plugin lifecycle management
//!
//! Drives plugins through load, activate, deactivate, unload and remove.
//! Every operation runs under one lock, so a plugin is never half-loaded by
//! one caller while another is unloading it. A failing step tears down
//! everything the plugin registered and leaves it `FAILED`.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::api::{ApiServices, PluginApi};
use crate::error::{PluginResult, PluginRuntimeError};
use crate::events::{EventHub, RuntimeEvent};
use crate::metrics::RuntimeMetrics;
use crate::module::{CodeLoader, LifecycleCallback, PluginExports};
use crate::plugin::{Plugin, PluginStatus};
use crate::sandbox::{isolate, PluginContext, ResourceLimits, Sandbox, SandboxFactory};

/// Code and isolation state of a loaded plugin
struct LivePlugin {
    exports: PluginExports,
    context: PluginContext,
    sandbox: Option<Sandbox>,
    /// Revokes the API handle issued for this load
    revoked: CancellationToken,
}

impl LivePlugin {
    /// Sandboxed callbacks run under the cpu budget; trusted ones only get
    /// panic isolation
    async fn run(&self, name: &str, callback: Arc<dyn LifecycleCallback>) -> PluginResult<()> {
        match &self.sandbox {
            Some(sandbox) => sandbox.run_callback(name, callback).await,
            None => {
                let ctx = self.context.clone();
                isolate(self.context.plugin_id(), async move { callback.call(ctx).await }).await
            }
        }
    }

    fn callback(&self, name: &str) -> Option<Arc<dyn LifecycleCallback>> {
        match name {
            "initialize" => self.exports.initialize.clone(),
            "activate" => self.exports.activate.clone(),
            "deactivate" => self.exports.deactivate.clone(),
            "cleanup" => self.exports.cleanup.clone(),
            _ => None,
        }
    }

    async fn run_export(&self, name: &str) -> PluginResult<()> {
        match self.callback(name) {
            Some(callback) => self.run(name, callback).await,
            None => Ok(()),
        }
    }

    fn destroy(self) {
        self.revoked.cancel();
        match self.sandbox {
            Some(sandbox) => sandbox.destroy(),
            None => {
                self.context.timers().clear_all();
            }
        }
    }
}

pub struct LifecycleManager {
    live: Mutex<HashMap<String, LivePlugin>>,
    services: Arc<ApiServices>,
    sandboxes: SandboxFactory,
    sandbox_limits: ResourceLimits,
    loader: Arc<CodeLoader>,
    events: Arc<EventHub>,
    metrics: Arc<RuntimeMetrics>,
}

impl LifecycleManager {
    pub fn new(
        services: Arc<ApiServices>,
        sandboxes: SandboxFactory,
        sandbox_limits: ResourceLimits,
        loader: Arc<CodeLoader>,
        events: Arc<EventHub>,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        Self {
            live: Mutex::new(HashMap::new()),
            services,
            sandboxes,
            sandbox_limits,
            loader,
            events,
            metrics,
        }
    }

    /// Plugins with code currently loaded
    pub async fn live_plugins(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.live.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Load a plugin. A no-op on `LOADED` or `ACTIVE`.
    pub async fn load(&self, id: &str) -> PluginResult<Plugin> {
        let mut live = self.live.lock().await;
        self.load_locked(&mut live, id).await
    }

    /// Activate a plugin, loading it first when needed. A no-op on `ACTIVE`.
    pub async fn activate(&self, id: &str) -> PluginResult<Plugin> {
        let mut live = self.live.lock().await;
        self.activate_locked(&mut live, id).await
    }

    /// Deactivate an active plugin. Any other status is returned unchanged.
    pub async fn deactivate(&self, id: &str) -> PluginResult<Plugin> {
        let mut live = self.live.lock().await;
        self.deactivate_locked(&mut live, id).await
    }

    /// Unload back to `REGISTERED`, deactivating first when active
    pub async fn unload(&self, id: &str) -> PluginResult<Plugin> {
        let mut live = self.live.lock().await;
        self.unload_locked(&mut live, id).await
    }

    /// Delete a `REGISTERED` plugin record
    pub async fn remove(&self, id: &str) -> PluginResult<Plugin> {
        let mut live = self.live.lock().await;
        let plugin = self.services.registry.remove(id).await?;
        self.teardown(&mut live, id).await;
        self.events.emit(RuntimeEvent::PluginRemoved {
            plugin_id: id.to_string(),
        });
        Ok(plugin)
    }

    /// Bring a plugin back to `target` after an update or a rollback
    pub async fn restore(&self, id: &str, target: PluginStatus) -> PluginResult<Plugin> {
        let mut live = self.live.lock().await;
        match target {
            PluginStatus::Active => self.activate_locked(&mut live, id).await,
            PluginStatus::Loaded => self.load_locked(&mut live, id).await,
            _ => self.services.registry.get(id).await,
        }
    }

    /// Unload every live plugin; failures are logged and skipped
    pub async fn unload_all(&self) -> usize {
        let mut live = self.live.lock().await;
        let ids: Vec<String> = live.keys().cloned().collect();
        let mut unloaded = 0;
        for id in ids {
            match self.unload_locked(&mut live, &id).await {
                Ok(_) => unloaded += 1,
                Err(e) => error!(plugin_id = %id, error = %e, "Failed to unload plugin during shutdown"),
            }
        }
        unloaded
    }

    async fn load_locked(&self, live: &mut HashMap<String, LivePlugin>, id: &str) -> PluginResult<Plugin> {
        let registry = &self.services.registry;
        let plugin = registry.get(id).await?;
        match plugin.status {
            PluginStatus::Loaded | PluginStatus::Active => return Ok(plugin),
            PluginStatus::Registered | PluginStatus::Failed => {}
            other => {
                return Err(PluginRuntimeError::InvalidState(format!(
                    "plugin {id} cannot be loaded while {other}"
                )))
            }
        }

        registry.transition(id, PluginStatus::Loading).await?;
        info!(plugin_id = %id, sandboxed = plugin.sandboxed, "Loading plugin");

        let entry = match self.prepare(&plugin) {
            Ok(entry) => entry,
            Err(e) => return Err(self.fail(live, id, "load", e).await),
        };
        let entry = live.entry(id.to_string()).or_insert(entry);
        if let Err(e) = self.start(&plugin, entry).await {
            return Err(self.fail(live, id, "load", e).await);
        }

        let plugin = registry.transition(id, PluginStatus::Loaded).await?;
        info!(plugin_id = %id, "Plugin loaded");
        self.events.emit(RuntimeEvent::PluginLoaded(plugin.clone()));
        Ok(plugin)
    }

    /// Context (and sandbox) for a plugin about to load
    fn prepare(&self, plugin: &Plugin) -> PluginResult<LivePlugin> {
        let limits = if plugin.sandboxed {
            self.sandbox_limits.clone()
        } else {
            ResourceLimits::unrestricted()
        };
        let revoked = CancellationToken::new();
        let api = PluginApi::new(&plugin.id, limits, self.services.clone(), revoked.clone());

        if plugin.sandboxed {
            let sandbox = self.sandboxes.create_sandbox(plugin, api)?;
            Ok(LivePlugin {
                exports: PluginExports::default(),
                context: sandbox.context(),
                sandbox: Some(sandbox),
                revoked,
            })
        } else {
            Ok(LivePlugin {
                exports: PluginExports::default(),
                context: self.sandboxes.trusted_context(plugin, api),
                sandbox: None,
                revoked,
            })
        }
    }

    /// Instantiate, initialize, then wire exported hooks and extensions
    async fn start(&self, plugin: &Plugin, entry: &mut LivePlugin) -> PluginResult<()> {
        let module = self.loader.resolve(plugin).await?;
        let exports = match &entry.sandbox {
            Some(sandbox) => sandbox.execute_load(module).await?,
            None => {
                let ctx = entry.context.clone();
                isolate(&plugin.id, async move { module.instantiate(ctx).await }).await?
            }
        };
        entry.exports = exports;
        entry.run_export("initialize").await?;

        for (hook_name, export) in &entry.exports.hooks {
            self.services
                .hooks
                .register_hook(hook_name, &plugin.id, export.handler.clone(), export.priority)
                .await?;
        }
        for (point_id, implementation) in &entry.exports.extensions {
            if !plugin.declares_extension_point(point_id) {
                return Err(PluginRuntimeError::InvalidOperation(format!(
                    "extension point '{point_id}' is not declared by plugin {}",
                    plugin.id
                )));
            }
            self.services
                .extensions
                .register_extension(&plugin.id, point_id, implementation.clone())
                .await?;
        }
        debug!(plugin_id = %plugin.id, exports = ?entry.exports, "Plugin exports wired");
        Ok(())
    }

    async fn activate_locked(&self, live: &mut HashMap<String, LivePlugin>, id: &str) -> PluginResult<Plugin> {
        let plugin = self.services.registry.get(id).await?;
        match plugin.status {
            PluginStatus::Active => return Ok(plugin),
            PluginStatus::Loaded => {}
            PluginStatus::Registered | PluginStatus::Failed => {
                self.load_locked(live, id).await?;
            }
            other => {
                return Err(PluginRuntimeError::InvalidState(format!(
                    "plugin {id} cannot be activated while {other}"
                )))
            }
        }

        self.services.registry.transition(id, PluginStatus::Activating).await?;
        if let Err(e) = self.run_live(live, id, "activate").await {
            return Err(self.fail(live, id, "activate", e).await);
        }

        let plugin = self.services.registry.transition(id, PluginStatus::Active).await?;
        info!(plugin_id = %id, "Plugin activated");
        self.events.emit(RuntimeEvent::PluginActivated(plugin.clone()));
        Ok(plugin)
    }

    async fn deactivate_locked(&self, live: &mut HashMap<String, LivePlugin>, id: &str) -> PluginResult<Plugin> {
        let plugin = self.services.registry.get(id).await?;
        if plugin.status != PluginStatus::Active {
            return Ok(plugin);
        }

        self.services.registry.transition(id, PluginStatus::Deactivating).await?;
        if let Err(e) = self.run_live(live, id, "deactivate").await {
            return Err(self.fail(live, id, "deactivate", e).await);
        }

        let plugin = self.services.registry.transition(id, PluginStatus::Loaded).await?;
        info!(plugin_id = %id, "Plugin deactivated");
        self.events.emit(RuntimeEvent::PluginDeactivated(plugin.clone()));
        Ok(plugin)
    }

    async fn unload_locked(&self, live: &mut HashMap<String, LivePlugin>, id: &str) -> PluginResult<Plugin> {
        let plugin = self.services.registry.get(id).await?;
        match plugin.status {
            PluginStatus::Registered => return Ok(plugin),
            PluginStatus::Failed => {}
            PluginStatus::Active => {
                self.deactivate_locked(live, id).await?;
                self.cleanup(live, id).await?;
            }
            PluginStatus::Loaded => self.cleanup(live, id).await?,
            other => {
                return Err(PluginRuntimeError::InvalidState(format!(
                    "plugin {id} cannot be unloaded while {other}"
                )))
            }
        }

        self.teardown(live, id).await;
        let plugin = self.services.registry.transition(id, PluginStatus::Registered).await?;
        info!(plugin_id = %id, "Plugin unloaded");
        self.events.emit(RuntimeEvent::PluginUnloaded(plugin.clone()));
        Ok(plugin)
    }

    async fn cleanup(&self, live: &mut HashMap<String, LivePlugin>, id: &str) -> PluginResult<()> {
        match self.run_live(live, id, "cleanup").await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(live, id, "unload", e).await),
        }
    }

    async fn run_live(&self, live: &HashMap<String, LivePlugin>, id: &str, name: &str) -> PluginResult<()> {
        match live.get(id) {
            Some(entry) => entry.run_export(name).await,
            None => Err(PluginRuntimeError::InvalidState(format!(
                "plugin {id} has no loaded code"
            ))),
        }
    }

    /// Drop everything the plugin registered with the host.
    /// The API handle is revoked first so plugin tasks still running cannot
    /// register again behind the sweep.
    async fn teardown(&self, live: &mut HashMap<String, LivePlugin>, id: &str) {
        let had_code = match live.remove(id) {
            Some(entry) => {
                entry.destroy();
                true
            }
            None => false,
        };
        let hooks = self.services.hooks.unregister_plugin(id).await;
        let extensions = self.services.extensions.unregister_plugin(id).await;
        let topics = self.services.bus.close_source(id).await;
        if hooks + extensions + topics > 0 || had_code {
            debug!(plugin_id = %id, hooks, extensions, topics, had_code, "Plugin torn down");
        }
    }

    /// Tear down, mark `FAILED` and hand the error back
    async fn fail(
        &self,
        live: &mut HashMap<String, LivePlugin>,
        id: &str,
        operation: &str,
        err: PluginRuntimeError,
    ) -> PluginRuntimeError {
        self.teardown(live, id).await;
        self.services.registry.mark_failed(id, &err.to_string()).await;
        self.metrics.lifecycle_failed();
        error!(
            plugin_id = %id,
            operation,
            category = %err.category(),
            error = %err,
            "Plugin lifecycle operation failed"
        );
        err
    }
}
