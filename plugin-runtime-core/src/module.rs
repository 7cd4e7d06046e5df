//! Plugin code contracts and the code loader
//!
//! A plugin's `main` entry resolves to a [`PluginModule`]. Instantiating the
//! module yields [`PluginExports`]: optional lifecycle callbacks plus the hook
//! handlers and extension implementations the plugin offers. Every capability
//! is an explicit `Option` or map entry; nothing is probed at call time.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{PluginResult, PluginRuntimeError, ResourceKind};
use crate::hooks::HookContext;
use crate::plugin::Plugin;
use crate::sandbox::PluginContext;
use crate::wasm::WasmRuntime;

/// Handler attached to a named hook
#[async_trait]
pub trait HookHandler: Send + Sync {
    /// Return `Some(value)` to replace the data, `None` to leave it unchanged
    async fn handle(&self, data: Value, ctx: HookContext) -> anyhow::Result<Option<Value>>;
}

struct FnHook<F>(F);

#[async_trait]
impl<F> HookHandler for FnHook<F>
where
    F: Fn(Value, HookContext) -> BoxFuture<'static, anyhow::Result<Option<Value>>> + Send + Sync,
{
    async fn handle(&self, data: Value, ctx: HookContext) -> anyhow::Result<Option<Value>> {
        (self.0)(data, ctx).await
    }
}

/// Wrap a closure returning a boxed future as a [`HookHandler`]
pub fn hook_fn<F>(f: F) -> Arc<dyn HookHandler>
where
    F: Fn(Value, HookContext) -> BoxFuture<'static, anyhow::Result<Option<Value>>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnHook(f))
}

/// Implementation registered against an extension point
#[async_trait]
pub trait Extension: Send + Sync {
    /// Whether `method` is exposed; non-implementers are skipped by dispatch
    fn implements(&self, method: &str) -> bool;

    async fn invoke(&self, method: &str, args: Vec<Value>) -> anyhow::Result<Value>;
}

type MethodFn = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// [`Extension`] built from per-method closures
#[derive(Clone, Default)]
pub struct MethodTable {
    methods: HashMap<String, MethodFn>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Arc::new(f));
        self
    }

    pub fn into_extension(self) -> Arc<dyn Extension> {
        Arc::new(self)
    }
}

#[async_trait]
impl Extension for MethodTable {
    fn implements(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    async fn invoke(&self, method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        let f = self
            .methods
            .get(method)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("method {method} is not implemented"))?;
        (f.as_ref())(args).await
    }
}

/// Optional lifecycle export (`initialize`, `activate`, `deactivate`, `cleanup`)
#[async_trait]
pub trait LifecycleCallback: Send + Sync {
    async fn call(&self, ctx: PluginContext) -> anyhow::Result<()>;
}

struct FnCallback<F>(F);

#[async_trait]
impl<F> LifecycleCallback for FnCallback<F>
where
    F: Fn(PluginContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync,
{
    async fn call(&self, ctx: PluginContext) -> anyhow::Result<()> {
        (self.0)(ctx).await
    }
}

pub fn callback<F>(f: F) -> Arc<dyn LifecycleCallback>
where
    F: Fn(PluginContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
{
    Arc::new(FnCallback(f))
}

/// Hook handler plus its priority (higher runs first)
#[derive(Clone)]
pub struct HookExport {
    pub handler: Arc<dyn HookHandler>,
    pub priority: i32,
}

/// What a plugin module hands back when instantiated
#[derive(Clone, Default)]
pub struct PluginExports {
    pub initialize: Option<Arc<dyn LifecycleCallback>>,
    pub activate: Option<Arc<dyn LifecycleCallback>>,
    pub deactivate: Option<Arc<dyn LifecycleCallback>>,
    pub cleanup: Option<Arc<dyn LifecycleCallback>>,
    /// hook name -> handler
    pub hooks: BTreeMap<String, HookExport>,
    /// extension point id -> implementation
    pub extensions: BTreeMap<String, Arc<dyn Extension>>,
}

impl PluginExports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_initialize(mut self, cb: Arc<dyn LifecycleCallback>) -> Self {
        self.initialize = Some(cb);
        self
    }

    pub fn on_activate(mut self, cb: Arc<dyn LifecycleCallback>) -> Self {
        self.activate = Some(cb);
        self
    }

    pub fn on_deactivate(mut self, cb: Arc<dyn LifecycleCallback>) -> Self {
        self.deactivate = Some(cb);
        self
    }

    pub fn on_cleanup(mut self, cb: Arc<dyn LifecycleCallback>) -> Self {
        self.cleanup = Some(cb);
        self
    }

    pub fn hook(mut self, name: impl Into<String>, priority: i32, handler: Arc<dyn HookHandler>) -> Self {
        self.hooks.insert(name.into(), HookExport { handler, priority });
        self
    }

    pub fn extension(mut self, point_id: impl Into<String>, implementation: Arc<dyn Extension>) -> Self {
        self.extensions.insert(point_id.into(), implementation);
        self
    }
}

impl std::fmt::Debug for PluginExports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginExports")
            .field("initialize", &self.initialize.is_some())
            .field("activate", &self.activate.is_some())
            .field("deactivate", &self.deactivate.is_some())
            .field("cleanup", &self.cleanup.is_some())
            .field("hooks", &self.hooks.keys().collect::<Vec<_>>())
            .field("extensions", &self.extensions.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Loadable plugin code
#[async_trait]
pub trait PluginModule: Send + Sync {
    async fn instantiate(&self, ctx: PluginContext) -> anyhow::Result<PluginExports>;
}

struct FnModule<F>(F);

#[async_trait]
impl<F> PluginModule for FnModule<F>
where
    F: Fn(PluginContext) -> BoxFuture<'static, anyhow::Result<PluginExports>> + Send + Sync,
{
    async fn instantiate(&self, ctx: PluginContext) -> anyhow::Result<PluginExports> {
        (self.0)(ctx).await
    }
}

/// Wrap a closure as a [`PluginModule`]
pub fn module_fn<F>(f: F) -> Arc<dyn PluginModule>
where
    F: Fn(PluginContext) -> BoxFuture<'static, anyhow::Result<PluginExports>> + Send + Sync + 'static,
{
    Arc::new(FnModule(f))
}

/// Resolves a plugin's `main` entry to a module.
///
/// Host-registered modules win. Otherwise a `.wasm` entry is read from the
/// plugin's install directory (or the plugin directory) and compiled.
pub struct CodeLoader {
    builtin: RwLock<HashMap<String, Arc<dyn PluginModule>>>,
    wasm: Option<Arc<WasmRuntime>>,
    plugin_dir: PathBuf,
}

impl CodeLoader {
    pub fn new(plugin_dir: impl Into<PathBuf>, wasm: Option<Arc<WasmRuntime>>) -> Self {
        Self {
            builtin: RwLock::new(HashMap::new()),
            wasm,
            plugin_dir: plugin_dir.into(),
        }
    }

    pub async fn register(&self, main: impl Into<String>, module: Arc<dyn PluginModule>) {
        self.builtin.write().await.insert(main.into(), module);
    }

    pub async fn resolve(&self, plugin: &Plugin) -> PluginResult<Arc<dyn PluginModule>> {
        if let Some(module) = self.builtin.read().await.get(&plugin.main) {
            return Ok(module.clone());
        }

        let is_wasm = Path::new(&plugin.main)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("wasm") || ext.eq_ignore_ascii_case("wat"));
        let Some(wasm) = self.wasm.as_ref().filter(|_| is_wasm) else {
            return Err(PluginRuntimeError::NotFound {
                kind: ResourceKind::Module,
                id: plugin.main.clone(),
            });
        };

        let path = self.entry_path(plugin)?;
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            PluginRuntimeError::InvalidModule(format!("cannot read {}: {e}", path.display()))
        })?;
        let module = wasm.compile(&plugin.id, &bytes)?;
        Ok(Arc::new(module))
    }

    fn entry_path(&self, plugin: &Plugin) -> PluginResult<PathBuf> {
        let relative = Path::new(&plugin.main);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(PluginRuntimeError::InvalidModule(format!(
                "main entry '{}' escapes the plugin directory",
                plugin.main
            )));
        }
        let base = plugin
            .install_path
            .clone()
            .unwrap_or_else(|| self.plugin_dir.join(&plugin.id));
        Ok(base.join(relative))
    }
}
