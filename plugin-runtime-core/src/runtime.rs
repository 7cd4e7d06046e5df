//! Plugin runtime facade
//!
//! [`PluginRuntime`] wires the registry, lifecycle manager, hook pipeline
//! and extension dispatcher together and is the only type most hosts touch.

use serde_json::Value;
use std::any::Any;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::api::{ApiServices, DataServices, NoDataServices};
use crate::audit::{AuditSink, TracingAuditSink};
use crate::config::RuntimeConfig;
use crate::crypto::MasterKey;
use crate::error::{PluginResult, PluginRuntimeError};
use crate::events::{EventHub, PluginEventBus, RuntimeEvent, HOST_SOURCE};
use crate::extension_point::{ExtensionPoint, ExtensionPointInfo, ExtensionPointRegistry};
use crate::extensions::{ExtensionDispatcher, ExtensionResult};
use crate::hooks::{HookInfo, HookPipeline};
use crate::lifecycle::LifecycleManager;
use crate::logging::Redactor;
use crate::manifest::PluginManifest;
use crate::metrics::{MetricsSnapshot, RuntimeMetrics};
use crate::module::{CodeLoader, Extension, HookHandler, PluginModule};
use crate::plugin::{Plugin, PluginFilter, PluginStatus};
use crate::registry::PluginRegistry;
use crate::resolver::DependencyResolver;
use crate::sandbox::{HostModules, ResourceLimits, SandboxFactory};
use crate::store::{ConfigStore, FilesystemPluginStore, MemoryConfigStore, PluginStore, StagedPackage};
use crate::wasm::{WasmConfig, WasmRuntime};

/// Builder for [`PluginRuntime`]
pub struct PluginRuntimeBuilder {
    config: RuntimeConfig,
    data: Option<Arc<dyn DataServices>>,
    config_store: Option<Arc<dyn ConfigStore>>,
    audit: Option<Arc<dyn AuditSink>>,
    store: Option<Arc<dyn PluginStore>>,
    host_modules: HostModules,
    extension_points: Vec<ExtensionPoint>,
    modules: Vec<(String, Arc<dyn PluginModule>)>,
}

impl PluginRuntimeBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            data: None,
            config_store: None,
            audit: None,
            store: None,
            host_modules: HostModules::new(),
            extension_points: Vec::new(),
            modules: Vec::new(),
        }
    }

    pub fn with_data_services(mut self, data: Arc<dyn DataServices>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_config_store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.config_store = Some(store);
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_plugin_store(mut self, store: Arc<dyn PluginStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Expose a host module to `require`
    pub fn with_host_module<T: Any + Send + Sync>(mut self, name: impl Into<String>, module: T) -> Self {
        self.host_modules = self.host_modules.with(name, module);
        self
    }

    /// Define an extension point in addition to the defaults
    pub fn with_extension_point(mut self, point: ExtensionPoint) -> Self {
        self.extension_points.push(point);
        self
    }

    /// Provide the code for plugins whose `main` equals `main`
    pub fn with_module(mut self, main: impl Into<String>, module: Arc<dyn PluginModule>) -> Self {
        self.modules.push((main.into(), module));
        self
    }

    pub async fn build(self) -> PluginResult<PluginRuntime> {
        let config = self.config;

        let master_key = match &config.master_key {
            Some(encoded) => MasterKey::from_base64(encoded)?,
            None => {
                warn!("No master key configured; plugin secrets will not survive a restart");
                MasterKey::generate()
            }
        };
        let http = reqwest::Client::builder()
            .timeout(config.extension_timeout())
            .build()
            .map_err(|e| PluginRuntimeError::ConfigurationError(format!("http client: {e}")))?;

        let points = Arc::new(ExtensionPointRegistry::with_defaults());
        for point in self.extension_points {
            points.define(point).await;
        }
        let resolver = Arc::new(DependencyResolver::new());
        let registry = Arc::new(PluginRegistry::new(points.clone(), resolver.clone()));
        let events = Arc::new(EventHub::new(config.event_capacity));
        let metrics = Arc::new(RuntimeMetrics::default());
        let hooks = Arc::new(HookPipeline::new(registry.clone(), metrics.clone(), config.hook_timeout()));
        let extensions = Arc::new(ExtensionDispatcher::new(
            points.clone(),
            registry.clone(),
            events.clone(),
            metrics.clone(),
            config.extension_timeout(),
        ));

        let services = Arc::new(ApiServices {
            registry: registry.clone(),
            hooks: hooks.clone(),
            extensions: extensions.clone(),
            bus: Arc::new(PluginEventBus::new(config.event_capacity)),
            config_store: self.config_store.unwrap_or_else(|| Arc::new(MemoryConfigStore::new())),
            data: self.data.unwrap_or_else(|| Arc::new(NoDataServices)),
            audit: self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink)),
            master_key,
            http,
        });

        let wasm = Arc::new(WasmRuntime::new(WasmConfig::from_sandbox(&config.sandbox))?);
        let loader = Arc::new(CodeLoader::new(config.plugin_dir.clone(), Some(wasm)));
        for (main, module) in self.modules {
            loader.register(main, module).await;
        }

        let redactor = config.log.redact_plugin_logs.then(|| Arc::new(Redactor::new()));
        let lifecycle = LifecycleManager::new(
            services.clone(),
            SandboxFactory::new(config.sandbox.clone(), self.host_modules, redactor),
            ResourceLimits::from_config(&config.sandbox),
            loader.clone(),
            events.clone(),
            metrics.clone(),
        );
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(FilesystemPluginStore::new(config.plugin_dir.clone())));

        info!(plugin_dir = %config.plugin_dir.display(), "Plugin runtime ready");
        Ok(PluginRuntime {
            config,
            points,
            resolver,
            registry,
            hooks,
            extensions,
            lifecycle,
            loader,
            services,
            events,
            metrics,
            store,
            packages: Mutex::new(()),
        })
    }
}

/// Plugin and extension runtime
pub struct PluginRuntime {
    config: RuntimeConfig,
    points: Arc<ExtensionPointRegistry>,
    resolver: Arc<DependencyResolver>,
    registry: Arc<PluginRegistry>,
    hooks: Arc<HookPipeline>,
    extensions: Arc<ExtensionDispatcher>,
    lifecycle: LifecycleManager,
    loader: Arc<CodeLoader>,
    services: Arc<ApiServices>,
    events: Arc<EventHub>,
    metrics: Arc<RuntimeMetrics>,
    store: Arc<dyn PluginStore>,
    /// Serializes install and update
    packages: Mutex<()>,
}

impl PluginRuntime {
    pub fn builder(config: RuntimeConfig) -> PluginRuntimeBuilder {
        PluginRuntimeBuilder::new(config)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    // Registration and lifecycle

    /// Validate and store a plugin as `REGISTERED`
    pub async fn register_plugin(&self, manifest: &PluginManifest) -> PluginResult<Plugin> {
        let plugin = self.registry.register(manifest).await?;
        let plugin = self.merge_persisted_config(plugin).await;
        self.events.emit(RuntimeEvent::PluginRegistered(plugin.clone()));
        Ok(plugin)
    }

    /// Read `plugin.json` (or any manifest file) and register it
    pub async fn register_plugin_from_file(&self, path: impl AsRef<Path>) -> PluginResult<Plugin> {
        let manifest = PluginManifest::from_file(path).await?;
        self.register_plugin(&manifest).await
    }

    async fn merge_persisted_config(&self, plugin: Plugin) -> Plugin {
        match self.services.config_store.load(&plugin.id).await {
            Ok(persisted) if persisted.is_empty() => plugin,
            Ok(persisted) => match self.registry.merge_configuration(&plugin.id, persisted).await {
                Ok(merged) => merged,
                Err(e) => {
                    warn!(plugin_id = %plugin.id, error = %e, "Failed to merge persisted configuration");
                    plugin
                }
            },
            Err(e) => {
                warn!(plugin_id = %plugin.id, error = %e, "Failed to load persisted configuration");
                plugin
            }
        }
    }

    pub async fn load_plugin(&self, id: &str) -> PluginResult<Plugin> {
        self.lifecycle.load(id).await
    }

    pub async fn activate_plugin(&self, id: &str) -> PluginResult<Plugin> {
        self.lifecycle.activate(id).await
    }

    pub async fn deactivate_plugin(&self, id: &str) -> PluginResult<Plugin> {
        self.lifecycle.deactivate(id).await
    }

    pub async fn unload_plugin(&self, id: &str) -> PluginResult<Plugin> {
        self.lifecycle.unload(id).await
    }

    /// Delete a `REGISTERED` plugin with its installed files and stored
    /// configuration
    pub async fn remove_plugin(&self, id: &str) -> PluginResult<Plugin> {
        let plugin = self.lifecycle.remove(id).await?;
        if plugin.install_path.is_some() {
            if let Err(e) = self.store.remove(id).await {
                warn!(plugin_id = %id, error = %e, "Failed to delete installed plugin files");
            }
        }
        if let Err(e) = self.services.config_store.delete(id).await {
            warn!(plugin_id = %id, error = %e, "Failed to delete stored plugin configuration");
        }
        Ok(plugin)
    }

    // Packages

    /// Install a package (gzip tarball with `plugin.json` at its root).
    /// Nothing is left behind when any step fails.
    pub async fn install_plugin(&self, package: &[u8]) -> PluginResult<Plugin> {
        let _guard = self.packages.lock().await;
        let staged = self.store.unpack(package).await?;
        let result = self.install_staged(&staged).await;
        self.discard_staging(&staged).await;
        result
    }

    async fn install_staged(&self, staged: &StagedPackage) -> PluginResult<Plugin> {
        let plugin = self.registry.register(&staged.manifest).await?;
        let id = plugin.id.clone();

        let path = match self.store.commit(staged, &id).await {
            Ok(path) => path,
            Err(e) => {
                self.registry.discard(&id).await;
                return Err(e);
            }
        };
        if let Err(e) = self.registry.set_install_path(&id, path).await {
            self.registry.discard(&id).await;
            if let Err(cleanup) = self.store.remove(&id).await {
                warn!(plugin_id = %id, error = %cleanup, "Failed to remove partially installed files");
            }
            return Err(e);
        }

        let plugin = self.merge_persisted_config(self.registry.get(&id).await?).await;
        info!(plugin_id = %id, version = %plugin.version, "Plugin installed");
        self.events.emit(RuntimeEvent::PluginRegistered(plugin.clone()));
        self.events.emit(RuntimeEvent::PluginInstalled(plugin.clone()));
        Ok(plugin)
    }

    /// Replace an installed plugin with a new package and bring it back to
    /// its previous status. Files, record and status are restored on failure.
    pub async fn update_plugin(&self, id: &str, package: &[u8]) -> PluginResult<Plugin> {
        let _guard = self.packages.lock().await;
        let previous = self.registry.get(id).await?;
        let staged = self.store.unpack(package).await?;
        let result = self.update_staged(&previous, &staged).await;
        self.discard_staging(&staged).await;
        result
    }

    async fn update_staged(&self, previous: &Plugin, staged: &StagedPackage) -> PluginResult<Plugin> {
        let id = previous.id.as_str();
        // Validate before anything is touched
        let replacement = self.registry.prepare_replacement(id, &staged.manifest).await?;

        if previous.status != PluginStatus::Registered {
            if let Err(e) = self.lifecycle.unload(id).await {
                self.rollback(previous, None).await;
                return Err(e);
            }
        }
        let backup = match self.store.backup(id).await {
            Ok(backup) => backup,
            Err(e) => {
                self.rollback(previous, None).await;
                return Err(e);
            }
        };

        let applied = async {
            let path = self.store.commit(staged, id).await?;
            let mut replacement = replacement;
            replacement.install_path = Some(path);
            self.registry.replace(replacement).await?;
            self.lifecycle.restore(id, previous.status).await
        }
        .await;

        match applied {
            Ok(plugin) => {
                if let Some(backup) = &backup {
                    if let Err(e) = self.store.drop_backup(backup).await {
                        warn!(plugin_id = %id, error = %e, "Failed to delete update backup");
                    }
                }
                info!(
                    plugin_id = %id,
                    from = %previous.version,
                    to = %plugin.version,
                    "Plugin updated"
                );
                self.events.emit(RuntimeEvent::PluginUpdated {
                    previous_version: previous.version.clone(),
                    plugin: plugin.clone(),
                });
                Ok(plugin)
            }
            Err(e) => {
                warn!(plugin_id = %id, error = %e, "Plugin update failed, rolling back");
                self.rollback(previous, Some(backup)).await;
                Err(e)
            }
        }
    }

    /// Put files, record and status back the way they were before an update.
    /// `files` is `None` when the installed files were never touched.
    async fn rollback(&self, previous: &Plugin, files: Option<Option<std::path::PathBuf>>) {
        let id = previous.id.as_str();
        if let Err(e) = self.lifecycle.unload(id).await {
            warn!(plugin_id = %id, error = %e, "Rollback could not unload the new version");
        }

        if let Some(backup) = files {
            let restored = match &backup {
                Some(backup) => self.store.restore(id, backup).await,
                None => self.store.remove(id).await,
            };
            if let Err(e) = restored {
                warn!(plugin_id = %id, error = %e, "Rollback could not restore plugin files");
            }
        }

        let mut record = previous.clone();
        record.status = PluginStatus::Registered;
        record.error = None;
        if let Err(e) = self.registry.replace(record).await {
            warn!(plugin_id = %id, error = %e, "Rollback could not restore the plugin record");
            return;
        }
        if let Err(e) = self.lifecycle.restore(id, previous.status).await {
            warn!(plugin_id = %id, error = %e, "Rollback could not restore the previous status");
        }
    }

    async fn discard_staging(&self, staged: &StagedPackage) {
        if let Err(e) = self.store.discard(staged).await {
            warn!(dir = %staged.dir.display(), error = %e, "Failed to delete staging directory");
        }
    }

    // Hooks and extensions

    /// Run `hook_name` over `data`; never fails
    pub async fn execute_hook(&self, hook_name: &str, data: Value, context: Value) -> Value {
        self.hooks.execute_hook(hook_name, data, context).await
    }

    pub async fn register_hook(
        &self,
        plugin_id: &str,
        hook_name: &str,
        handler: Arc<dyn HookHandler>,
        priority: i32,
    ) -> PluginResult<()> {
        self.hooks.register_hook(hook_name, plugin_id, handler, priority).await
    }

    pub async fn unregister_hook(&self, plugin_id: &str, hook_name: &str) -> usize {
        self.hooks.unregister_hook(hook_name, plugin_id).await
    }

    pub async fn register_extension(
        &self,
        plugin_id: &str,
        point_id: &str,
        implementation: Arc<dyn Extension>,
    ) -> PluginResult<()> {
        self.extensions
            .register_extension(plugin_id, point_id, implementation)
            .await
    }

    pub async fn unregister_extension(&self, plugin_id: &str, point_id: &str) -> usize {
        self.extensions.unregister_extension(plugin_id, point_id).await
    }

    pub async fn execute_extension(
        &self,
        point_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> PluginResult<Vec<ExtensionResult>> {
        self.extensions.execute_extension(point_id, method, args).await
    }

    pub async fn register_module(&self, main: impl Into<String>, module: Arc<dyn PluginModule>) {
        self.loader.register(main, module).await;
    }

    /// Define or redefine a point. Returns the plugins whose implementations
    /// were detached because they lack a newly required permission.
    pub async fn define_extension_point(&self, point: ExtensionPoint) -> Vec<String> {
        info!(point = %point.id, "Extension point defined");
        self.points.define(point).await
    }

    /// Publish `name` to plugin subscribers of the host source
    pub async fn publish_event(&self, name: &str, payload: Value) -> usize {
        self.services.bus.publish(HOST_SOURCE, name, payload).await
    }

    // Introspection

    pub async fn get_plugins(&self, filter: &PluginFilter) -> Vec<Plugin> {
        self.registry.list(filter).await
    }

    pub async fn get_plugin(&self, id: &str) -> PluginResult<Plugin> {
        self.registry.get(id).await
    }

    pub async fn get_extension_points(&self) -> Vec<ExtensionPointInfo> {
        self.points.list().await
    }

    pub async fn get_hooks(&self) -> std::collections::BTreeMap<String, Vec<HookInfo>> {
        self.hooks.get_hooks().await
    }

    pub async fn get_metrics(&self) -> MetricsSnapshot {
        let by_status = self.registry.status_counts().await;
        let hooks = self.hooks.get_hooks().await;
        MetricsSnapshot {
            total_plugins: by_status.values().sum(),
            by_status,
            extension_points: self.points.list().await.len(),
            registered_extensions: self.points.extension_count().await,
            hooks: hooks.len(),
            hook_handlers: hooks.values().map(Vec::len).sum(),
            counters: self.metrics.counters(),
            plugins: self.registry.metrics().await,
        }
    }

    /// Ids of registered plugins that depend on `id`
    pub fn dependents_of(&self, id: &str) -> Vec<String> {
        self.resolver.dependents_of(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    /// Unload every live plugin
    pub async fn shutdown(&self) -> usize {
        let unloaded = self.lifecycle.unload_all().await;
        info!(unloaded, "Plugin runtime shut down");
        unloaded
    }
}
