//! Hook pipeline
//!
//! Handlers for a hook run one after another in descending priority, each
//! seeing the value produced by the previous one. A handler that fails,
//! panics or runs past the hook timeout is skipped and the walk continues
//! with the last good value.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{PluginResult, PluginRuntimeError};
use crate::metrics::RuntimeMetrics;
use crate::module::HookHandler;
use crate::registry::{ExecutionOutcome, PluginRegistry};
use crate::sandbox::isolate;

/// Context passed to every hook handler
#[derive(Debug, Clone)]
pub struct HookContext {
    pub hook_name: String,
    /// Plugin owning the handler being invoked
    pub plugin_id: String,
    /// Caller-supplied context
    pub context: Value,
    /// Cancelled when the handler exceeds the hook timeout
    pub cancellation: CancellationToken,
}

impl HookContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// One handler attached to a hook
#[derive(Clone)]
pub struct HookRegistration {
    pub plugin_id: String,
    pub handler: Arc<dyn HookHandler>,
    pub priority: i32,
    pub registered_at: DateTime<Utc>,
}

/// Introspection view of a [`HookRegistration`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookInfo {
    pub plugin_id: String,
    pub priority: i32,
    pub registered_at: DateTime<Utc>,
}

pub struct HookPipeline {
    hooks: RwLock<HashMap<String, Vec<HookRegistration>>>,
    registry: Arc<PluginRegistry>,
    metrics: Arc<RuntimeMetrics>,
    timeout: Duration,
}

impl HookPipeline {
    pub fn new(registry: Arc<PluginRegistry>, metrics: Arc<RuntimeMetrics>, timeout: Duration) -> Self {
        Self {
            hooks: RwLock::new(HashMap::new()),
            registry,
            metrics,
            timeout,
        }
    }

    /// Attach a handler. The hook must be declared in the plugin's manifest.
    /// A plugin has at most one handler per hook; registering again replaces
    /// it without moving it within its priority group.
    pub async fn register_hook(
        &self,
        hook_name: &str,
        plugin_id: &str,
        handler: Arc<dyn HookHandler>,
        priority: i32,
    ) -> PluginResult<()> {
        self.insert(hook_name, plugin_id, handler, priority, None).await
    }

    /// [`register_hook`](Self::register_hook) on behalf of plugin code.
    /// Rejected once `scope` is cancelled.
    pub(crate) async fn register_scoped(
        &self,
        hook_name: &str,
        plugin_id: &str,
        handler: Arc<dyn HookHandler>,
        priority: i32,
        scope: &CancellationToken,
    ) -> PluginResult<()> {
        self.insert(hook_name, plugin_id, handler, priority, Some(scope)).await
    }

    async fn insert(
        &self,
        hook_name: &str,
        plugin_id: &str,
        handler: Arc<dyn HookHandler>,
        priority: i32,
        scope: Option<&CancellationToken>,
    ) -> PluginResult<()> {
        let plugin = self.registry.get(plugin_id).await?;
        if !plugin.declares_hook(hook_name) {
            return Err(PluginRuntimeError::InvalidOperation(format!(
                "hook '{hook_name}' is not declared by plugin {plugin_id}"
            )));
        }

        let mut hooks = self.hooks.write().await;
        // Checked under the write lock: teardown revokes before it unregisters
        if scope.is_some_and(CancellationToken::is_cancelled) {
            return Err(PluginRuntimeError::revoked(plugin_id));
        }
        let registration = HookRegistration {
            plugin_id: plugin_id.to_string(),
            handler,
            priority,
            registered_at: Utc::now(),
        };
        let entries = hooks.entry(hook_name.to_string()).or_default();
        match entries.iter_mut().find(|e| e.plugin_id == plugin_id) {
            Some(existing) => *existing = registration,
            None => entries.push(registration),
        }
        // Stable: equal priorities keep insertion order
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));
        debug!(hook = hook_name, plugin_id, priority, "Hook registered");
        Ok(())
    }

    pub async fn unregister_hook(&self, hook_name: &str, plugin_id: &str) -> usize {
        let mut hooks = self.hooks.write().await;
        let Some(entries) = hooks.get_mut(hook_name) else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|e| e.plugin_id != plugin_id);
        let removed = before - entries.len();
        if entries.is_empty() {
            hooks.remove(hook_name);
        }
        removed
    }

    /// Remove every handler owned by `plugin_id`
    pub async fn unregister_plugin(&self, plugin_id: &str) -> usize {
        let mut hooks = self.hooks.write().await;
        let mut removed = 0;
        for entries in hooks.values_mut() {
            let before = entries.len();
            entries.retain(|e| e.plugin_id != plugin_id);
            removed += before - entries.len();
        }
        hooks.retain(|_, entries| !entries.is_empty());
        removed
    }

    /// Run every handler of `hook_name` over `data`.
    ///
    /// Never fails: an unknown hook returns `data` unchanged.
    pub async fn execute_hook(&self, hook_name: &str, data: Value, context: Value) -> Value {
        let snapshot = match self.hooks.read().await.get(hook_name) {
            Some(entries) => entries.clone(),
            None => return data,
        };

        let mut current = data;
        for entry in snapshot {
            let token = CancellationToken::new();
            let ctx = HookContext {
                hook_name: hook_name.to_string(),
                plugin_id: entry.plugin_id.clone(),
                context: context.clone(),
                cancellation: token.clone(),
            };
            let handler = entry.handler.clone();
            let input = current.clone();

            self.metrics.hook_executed();
            let run = isolate(&entry.plugin_id, async move { handler.handle(input, ctx).await });
            let outcome = match tokio::time::timeout(self.timeout, run).await {
                Ok(Ok(Some(replacement))) => {
                    current = replacement;
                    ExecutionOutcome::Success
                }
                Ok(Ok(None)) => ExecutionOutcome::Success,
                Ok(Err(e)) => {
                    warn!(hook = hook_name, plugin_id = %entry.plugin_id, error = %e, "Hook handler failed");
                    self.metrics.hook_failed();
                    ExecutionOutcome::Error
                }
                Err(_) => {
                    // The task keeps running; the token asks it to stop
                    token.cancel();
                    warn!(
                        hook = hook_name,
                        plugin_id = %entry.plugin_id,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "Hook handler timed out"
                    );
                    self.metrics.hook_timed_out();
                    ExecutionOutcome::Timeout
                }
            };
            self.registry.record_execution(&entry.plugin_id, outcome).await;
        }
        current
    }

    /// hook name -> handlers in execution order
    pub async fn get_hooks(&self) -> BTreeMap<String, Vec<HookInfo>> {
        self.hooks
            .read()
            .await
            .iter()
            .map(|(name, entries)| {
                let infos = entries
                    .iter()
                    .map(|e| HookInfo {
                        plugin_id: e.plugin_id.clone(),
                        priority: e.priority,
                        registered_at: e.registered_at,
                    })
                    .collect();
                (name.clone(), infos)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension_point::ExtensionPointRegistry;
    use crate::manifest::PluginManifest;
    use crate::module::hook_fn;
    use crate::resolver::DependencyResolver;
    use futures::FutureExt;
    use serde_json::json;

    const HOOK: &str = "entity.beforeSave";

    async fn setup(plugins: &[&str], timeout: Duration) -> (HookPipeline, Arc<PluginRegistry>) {
        let registry = Arc::new(PluginRegistry::new(
            Arc::new(ExtensionPointRegistry::with_defaults()),
            Arc::new(DependencyResolver::new()),
        ));
        for id in plugins {
            registry
                .register(&PluginManifest::new(*id, "1.0.0", "main").with_id(*id).with_hook(HOOK))
                .await
                .unwrap();
        }
        let pipeline = HookPipeline::new(registry.clone(), Arc::new(RuntimeMetrics::default()), timeout);
        (pipeline, registry)
    }

    fn append(tag: &'static str) -> Arc<dyn HookHandler> {
        hook_fn(move |data, _| {
            async move {
                let mut trail = data.as_array().cloned().unwrap_or_default();
                trail.push(json!(tag));
                Ok(Some(Value::Array(trail)))
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_priority_order_is_descending() {
        let (pipeline, _) = setup(&["p5", "p10", "p1"], Duration::from_secs(1)).await;
        pipeline.register_hook(HOOK, "p5", append("p5"), 5).await.unwrap();
        pipeline.register_hook(HOOK, "p10", append("p10"), 10).await.unwrap();
        pipeline.register_hook(HOOK, "p1", append("p1"), 1).await.unwrap();

        let out = pipeline.execute_hook(HOOK, json!([]), Value::Null).await;
        assert_eq!(out, json!(["p10", "p5", "p1"]));
    }

    #[tokio::test]
    async fn test_equal_priorities_keep_insertion_order() {
        let (pipeline, _) = setup(&["a", "b"], Duration::from_secs(1)).await;
        pipeline.register_hook(HOOK, "a", append("a"), 0).await.unwrap();
        pipeline.register_hook(HOOK, "b", append("b"), 0).await.unwrap();
        assert_eq!(pipeline.execute_hook(HOOK, json!([]), Value::Null).await, json!(["a", "b"]));
    }

    #[tokio::test]
    async fn test_reregistering_keeps_position_among_equals() {
        let (pipeline, _) = setup(&["a", "b"], Duration::from_secs(1)).await;
        pipeline.register_hook(HOOK, "a", append("a"), 0).await.unwrap();
        pipeline.register_hook(HOOK, "b", append("b"), 0).await.unwrap();
        pipeline.register_hook(HOOK, "a", append("a2"), 0).await.unwrap();

        assert_eq!(pipeline.get_hooks().await[HOOK].len(), 2);
        assert_eq!(pipeline.execute_hook(HOOK, json!([]), Value::Null).await, json!(["a2", "b"]));

        // A priority change still reorders
        pipeline.register_hook(HOOK, "b", append("b"), 9).await.unwrap();
        assert_eq!(pipeline.execute_hook(HOOK, json!([]), Value::Null).await, json!(["b", "a2"]));
    }

    #[tokio::test]
    async fn test_revoked_scope_cannot_register() {
        let (pipeline, _) = setup(&["a"], Duration::from_secs(1)).await;
        let scope = CancellationToken::new();
        pipeline.register_scoped(HOOK, "a", append("a"), 0, &scope).await.unwrap();
        pipeline.unregister_plugin("a").await;

        scope.cancel();
        assert!(matches!(
            pipeline.register_scoped(HOOK, "a", append("late"), 0, &scope).await,
            Err(PluginRuntimeError::InvalidOperation(_))
        ));
        assert!(pipeline.get_hooks().await.is_empty());
    }

    #[tokio::test]
    async fn test_failing_handler_is_skipped() {
        let (pipeline, registry) = setup(&["first", "broken", "last"], Duration::from_secs(1)).await;
        pipeline.register_hook(HOOK, "first", append("first"), 3).await.unwrap();
        pipeline
            .register_hook(
                HOOK,
                "broken",
                hook_fn(|_, _| async { Err(anyhow::anyhow!("database unavailable")) }.boxed()),
                2,
            )
            .await
            .unwrap();
        pipeline.register_hook(HOOK, "last", append("last"), 1).await.unwrap();

        let out = pipeline.execute_hook(HOOK, json!([]), Value::Null).await;
        assert_eq!(out, json!(["first", "last"]));
        assert_eq!(registry.get("broken").await.unwrap().metrics.errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_handler_times_out_and_is_cancelled() {
        let (pipeline, registry) = setup(&["hung", "after"], Duration::from_millis(200)).await;
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
        let seen_tx = Arc::new(parking_lot::Mutex::new(Some(seen_tx)));
        pipeline
            .register_hook(
                HOOK,
                "hung",
                hook_fn(move |_, ctx| {
                    let seen_tx = seen_tx.clone();
                    async move {
                        ctx.cancellation.cancelled().await;
                        if let Some(tx) = seen_tx.lock().take() {
                            let _ = tx.send(());
                        }
                        futures::future::pending::<()>().await;
                        Ok(None)
                    }
                    .boxed()
                }),
                10,
            )
            .await
            .unwrap();
        pipeline.register_hook(HOOK, "after", append("after"), 1).await.unwrap();

        let started = tokio::time::Instant::now();
        let out = pipeline.execute_hook(HOOK, json!([]), Value::Null).await;
        assert_eq!(out, json!(["after"]));
        assert!(started.elapsed() < Duration::from_millis(300));
        seen_rx.await.unwrap();
        assert_eq!(registry.get("hung").await.unwrap().metrics.timeouts, 1);
    }

    #[tokio::test]
    async fn test_unknown_hook_returns_input() {
        let (pipeline, _) = setup(&[], Duration::from_secs(1)).await;
        assert_eq!(pipeline.execute_hook("nope", json!({"a": 1}), Value::Null).await, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_undeclared_hook_is_rejected() {
        let (pipeline, _) = setup(&["a"], Duration::from_secs(1)).await;
        let err = pipeline
            .register_hook("entity.afterDelete", "a", append("a"), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginRuntimeError::InvalidOperation(_)));
        assert!(matches!(
            pipeline.register_hook(HOOK, "ghost", append("g"), 0).await,
            Err(PluginRuntimeError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_unregister() {
        let (pipeline, _) = setup(&["a", "b"], Duration::from_secs(1)).await;
        pipeline.register_hook(HOOK, "a", append("a"), 0).await.unwrap();
        pipeline.register_hook(HOOK, "b", append("b"), 0).await.unwrap();

        assert_eq!(pipeline.unregister_hook(HOOK, "a").await, 1);
        assert_eq!(pipeline.unregister_hook(HOOK, "a").await, 0);
        assert_eq!(pipeline.get_hooks().await[HOOK].len(), 1);
        assert_eq!(pipeline.unregister_plugin("b").await, 1);
        assert!(pipeline.get_hooks().await.is_empty());
    }
}
