//! Plugin sandbox implementation
//!
//! A sandbox owns the execution context handed to one plugin: scoped logger,
//! PluginAPI, bounded timers, an allowlisted module loader and a frozen
//! environment snapshot. Sandboxed code runs on its own task so a panic is
//! contained and reported against the plugin.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::api::PluginApi;
use crate::config::SandboxConfig;
use crate::error::{PluginResult, PluginRuntimeError, ResourceKind};
use crate::logging::{PluginLogger, Redactor};
use crate::module::{LifecycleCallback, PluginExports, PluginModule};
use crate::plugin::Plugin;

/// Resource limits for sandbox
#[derive(Debug, Clone, serde::Serialize)]
pub struct ResourceLimits {
    /// Maximum memory usage (bytes)
    pub max_memory_bytes: usize,
    /// Budget for a single lifecycle callback
    pub max_cpu_time: Duration,
    /// Hosts reachable over HTTP; `None` means unrestricted
    pub network_allowlist: Option<Vec<String>>,
}

impl ResourceLimits {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            max_memory_bytes: config.max_memory_bytes,
            max_cpu_time: config.max_cpu_time(),
            network_allowlist: Some(config.network_allowlist.clone()),
        }
    }

    pub fn unrestricted() -> Self {
        Self {
            max_memory_bytes: usize::MAX,
            max_cpu_time: Duration::MAX,
            network_allowlist: None,
        }
    }

    /// Whether `host` may be contacted under these limits
    pub fn allows_host(&self, host: &str) -> bool {
        match &self.network_allowlist {
            None => true,
            Some(allowed) => {
                let host = host.to_ascii_lowercase();
                allowed.iter().any(|entry| {
                    let entry = entry.to_ascii_lowercase();
                    match entry.strip_prefix("*.") {
                        Some(suffix) => host.ends_with(&format!(".{suffix}")),
                        None => entry == host,
                    }
                })
            }
        }
    }
}

/// How a plugin's context was built
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Isolation {
    Sandboxed,
    Trusted,
}

#[derive(Debug, Clone, Copy)]
struct TimerPolicy {
    max_delay: Duration,
    min_interval: Duration,
}

/// Identifier returned by [`Timers::set_timeout`] and [`Timers::set_interval`]
pub type TimerId = u64;

/// Timers owned by one plugin; all of them die with the sandbox
#[derive(Debug)]
pub struct Timers {
    policy: Option<TimerPolicy>,
    handles: Mutex<HashMap<TimerId, JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl Timers {
    fn new(policy: Option<TimerPolicy>) -> Self {
        Self {
            policy,
            handles: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Delay actually applied to a timeout request
    pub fn effective_delay(&self, delay: Duration) -> Duration {
        match self.policy {
            Some(policy) => delay.min(policy.max_delay),
            None => delay,
        }
    }

    /// Period actually applied to an interval request
    pub fn effective_period(&self, period: Duration) -> Duration {
        let period = match self.policy {
            Some(policy) => period.max(policy.min_interval),
            None => period,
        };
        // tokio intervals reject a zero period
        period.max(Duration::from_millis(1))
    }

    pub fn set_timeout<F, Fut>(&self, delay: Duration, f: F) -> TimerId
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delay = self.effective_delay(delay);
        self.track(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            f().await;
        }))
    }

    pub fn set_interval<F, Fut>(&self, period: Duration, mut f: F) -> TimerId
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let period = self.effective_period(period);
        self.track(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                f().await;
            }
        }))
    }

    pub fn clear(&self, id: TimerId) -> bool {
        match self.handles.lock().remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn clear_all(&self) -> usize {
        let mut handles = self.handles.lock();
        let count = handles.len();
        for (_, handle) in handles.drain() {
            handle.abort();
        }
        count
    }

    /// Timers that have not fired (or intervals still running)
    pub fn active(&self) -> usize {
        self.handles.lock().values().filter(|h| !h.is_finished()).count()
    }

    fn track(&self, handle: JoinHandle<()>) -> TimerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut handles = self.handles.lock();
        handles.retain(|_, h| !h.is_finished());
        handles.insert(id, handle);
        id
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.clear_all();
    }
}

/// Host-provided modules a plugin can `require`
#[derive(Default, Clone)]
pub struct HostModules {
    modules: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl HostModules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Any + Send + Sync>(mut self, name: impl Into<String>, module: T) -> Self {
        self.modules.insert(name.into(), Arc::new(module));
        self
    }

    fn get(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.modules.get(name).cloned()
    }
}

impl std::fmt::Debug for HostModules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.modules.keys()).finish()
    }
}

/// Module loader restricted to an allowlist (unrestricted for trusted plugins)
#[derive(Debug, Clone)]
pub struct ModuleLoader {
    plugin_id: String,
    allowlist: Option<HashSet<String>>,
    modules: Arc<HostModules>,
}

impl ModuleLoader {
    pub fn require<T: Any + Send + Sync>(&self, name: &str) -> PluginResult<Arc<T>> {
        if let Some(allowlist) = &self.allowlist {
            if !allowlist.contains(name) {
                tracing::warn!(plugin_id = %self.plugin_id, module = name, "Blocked module import");
                return Err(PluginRuntimeError::ModuleNotAllowed {
                    plugin_id: self.plugin_id.clone(),
                    module: name.to_string(),
                });
            }
        }
        let module = self.modules.get(name).ok_or_else(|| PluginRuntimeError::NotFound {
            kind: ResourceKind::Module,
            id: name.to_string(),
        })?;
        module
            .downcast::<T>()
            .map_err(|_| PluginRuntimeError::InvalidModule(format!("module '{name}' has a different type")))
    }
}

/// Execution context handed to plugin code
#[derive(Clone)]
pub struct PluginContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    plugin_id: String,
    plugin_version: String,
    isolation: Isolation,
    api: PluginApi,
    logger: PluginLogger,
    timers: Timers,
    modules: ModuleLoader,
    env: BTreeMap<String, String>,
    limits: ResourceLimits,
}

impl PluginContext {
    pub fn plugin_id(&self) -> &str {
        &self.inner.plugin_id
    }

    pub fn plugin_version(&self) -> &str {
        &self.inner.plugin_version
    }

    pub fn isolation(&self) -> Isolation {
        self.inner.isolation
    }

    pub fn api(&self) -> &PluginApi {
        &self.inner.api
    }

    pub fn logger(&self) -> &PluginLogger {
        &self.inner.logger
    }

    pub fn timers(&self) -> &Timers {
        &self.inner.timers
    }

    pub fn require<T: Any + Send + Sync>(&self, name: &str) -> PluginResult<Arc<T>> {
        self.inner.modules.require(name)
    }

    /// Frozen environment snapshot
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.inner.env
    }

    pub fn env_var(&self, name: &str) -> Option<&str> {
        self.inner.env.get(name).map(String::as_str)
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.inner.limits
    }
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin_id", &self.inner.plugin_id)
            .field("isolation", &self.inner.isolation)
            .finish_non_exhaustive()
    }
}

const SECRET_MARKERS: [&str; 8] = [
    "SECRET", "TOKEN", "PASSWORD", "PASSWD", "KEY", "CREDENTIAL", "PRIVATE", "AUTH",
];

fn looks_secret(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    SECRET_MARKERS.iter().any(|marker| upper.contains(marker))
}

fn sandbox_env(plugin: &Plugin, exposed: &[String]) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = exposed
        .iter()
        .filter(|name| !looks_secret(name))
        .filter_map(|name| std::env::var(name).ok().map(|value| (name.clone(), value)))
        .collect();
    env.insert("PLUGIN_ID".to_string(), plugin.id.clone());
    env.insert("PLUGIN_VERSION".to_string(), plugin.version.clone());
    env
}

/// Run plugin code on its own task; a panic becomes a sandbox error
pub(crate) async fn isolate<T, F>(plugin_id: &str, fut: F) -> PluginResult<T>
where
    F: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(PluginRuntimeError::sandbox(plugin_id, error)),
        Err(join_error) => Err(PluginRuntimeError::sandbox_message(
            plugin_id,
            panic_message(join_error),
        )),
    }
}

fn panic_message(error: tokio::task::JoinError) -> String {
    if error.is_cancelled() {
        return "plugin task was cancelled".to_string();
    }
    let payload = error.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    format!("plugin code panicked: {detail}")
}

/// Isolation boundary for one sandboxed plugin
#[derive(Debug)]
pub struct Sandbox {
    pub id: Uuid,
    pub plugin_id: String,
    pub limits: ResourceLimits,
    pub created_at: DateTime<Utc>,
    load_timeout: Duration,
    context: PluginContext,
}

impl Sandbox {
    pub fn context(&self) -> PluginContext {
        self.context.clone()
    }

    /// Instantiate the module under the load deadline
    pub async fn execute_load(&self, module: Arc<dyn PluginModule>) -> PluginResult<PluginExports> {
        let ctx = self.context.clone();
        let load = isolate(&self.plugin_id, async move { module.instantiate(ctx).await });
        tokio::time::timeout(self.load_timeout, load)
            .await
            .map_err(|_| PluginRuntimeError::LoadTimeout {
                plugin_id: self.plugin_id.clone(),
                timeout_ms: u64::try_from(self.load_timeout.as_millis()).unwrap_or(u64::MAX),
            })?
    }

    /// Run a lifecycle callback under the cpu-time budget
    pub async fn run_callback(&self, name: &str, callback: Arc<dyn LifecycleCallback>) -> PluginResult<()> {
        let ctx = self.context.clone();
        let run = isolate(&self.plugin_id, async move { callback.call(ctx).await });
        tokio::time::timeout(self.limits.max_cpu_time, run)
            .await
            .map_err(|_| {
                PluginRuntimeError::sandbox_message(
                    &self.plugin_id,
                    format!("{name} exceeded the {:?} execution budget", self.limits.max_cpu_time),
                )
            })?
    }

    /// Cancel every timer; the context stays valid for code still holding it
    pub fn destroy(&self) {
        let cleared = self.context.timers().clear_all();
        tracing::debug!(plugin_id = %self.plugin_id, sandbox_id = %self.id, cleared, "Sandbox destroyed");
    }
}

/// Builds sandboxes and trusted contexts
#[derive(Debug)]
pub struct SandboxFactory {
    config: SandboxConfig,
    modules: Arc<HostModules>,
    redactor: Option<Arc<Redactor>>,
}

impl SandboxFactory {
    pub fn new(config: SandboxConfig, modules: HostModules, redactor: Option<Arc<Redactor>>) -> Self {
        Self {
            config,
            modules: Arc::new(modules),
            redactor,
        }
    }

    pub fn create_sandbox(&self, plugin: &Plugin, api: PluginApi) -> PluginResult<Sandbox> {
        if self.config.max_memory_bytes == 0 || self.config.max_cpu_time_ms == 0 {
            return Err(PluginRuntimeError::sandbox_message(
                &plugin.id,
                "sandbox limits must be non-zero",
            ));
        }

        let limits = ResourceLimits::from_config(&self.config);
        let context = PluginContext {
            inner: Arc::new(ContextInner {
                plugin_id: plugin.id.clone(),
                plugin_version: plugin.version.clone(),
                isolation: Isolation::Sandboxed,
                api,
                logger: PluginLogger::new(&plugin.id, self.redactor.clone()),
                timers: Timers::new(Some(TimerPolicy {
                    max_delay: self.config.max_timer_delay(),
                    min_interval: self.config.min_timer_interval(),
                })),
                modules: ModuleLoader {
                    plugin_id: plugin.id.clone(),
                    allowlist: Some(self.config.allowed_modules.iter().cloned().collect()),
                    modules: self.modules.clone(),
                },
                env: sandbox_env(plugin, &self.config.exposed_env),
                limits: limits.clone(),
            }),
        };

        let sandbox = Sandbox {
            id: Uuid::new_v4(),
            plugin_id: plugin.id.clone(),
            limits,
            created_at: Utc::now(),
            load_timeout: self.config.load_timeout(),
            context,
        };
        tracing::debug!(plugin_id = %plugin.id, sandbox_id = %sandbox.id, "Sandbox created");
        Ok(sandbox)
    }

    /// Context for a plugin that opted out of sandboxing
    pub fn trusted_context(&self, plugin: &Plugin, api: PluginApi) -> PluginContext {
        PluginContext {
            inner: Arc::new(ContextInner {
                plugin_id: plugin.id.clone(),
                plugin_version: plugin.version.clone(),
                isolation: Isolation::Trusted,
                api,
                logger: PluginLogger::new(&plugin.id, self.redactor.clone()),
                timers: Timers::new(None),
                modules: ModuleLoader {
                    plugin_id: plugin.id.clone(),
                    allowlist: None,
                    modules: self.modules.clone(),
                },
                env: std::env::vars_os()
                    .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
                    .collect(),
                limits: ResourceLimits::unrestricted(),
            }),
        }
    }
}
