#![allow(dead_code)]

use futures::FutureExt;
use parking_lot::Mutex;
use plugin_runtime_core::{
    callback, hook_fn, module_fn, Extension, MethodTable, PluginContext, PluginExports, PluginManifest,
    PluginModule, PluginRuntime, PluginRuntimeBuilder, RuntimeConfig,
};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;

pub fn config(dir: &Path) -> RuntimeConfig {
    RuntimeConfig {
        plugin_dir: dir.to_path_buf(),
        ..RuntimeConfig::default()
    }
}

pub async fn runtime(dir: &Path) -> PluginRuntime {
    PluginRuntime::builder(config(dir)).build().await.unwrap()
}

pub async fn runtime_with(dir: &Path, f: impl FnOnce(PluginRuntimeBuilder) -> PluginRuntimeBuilder) -> PluginRuntime {
    f(PluginRuntime::builder(config(dir))).build().await.unwrap()
}

pub fn manifest(id: &str, main: &str) -> PluginManifest {
    PluginManifest::new(id, "1.0.0", main).with_id(id)
}

pub fn noop_module() -> Arc<dyn PluginModule> {
    module_fn(|_| async { Ok(PluginExports::new()) }.boxed())
}

/// Extension answering `process` with `tag`
pub fn processor(tag: &'static str) -> Arc<dyn Extension> {
    MethodTable::new()
        .method("process", move |_| async move { Ok(json!(tag)) }.boxed())
        .into_extension()
}

/// Module exporting one `ENTITY_PROCESSOR` extension
pub fn processor_module(tag: &'static str) -> Arc<dyn PluginModule> {
    module_fn(move |_| async move { Ok(PluginExports::new().extension("ENTITY_PROCESSOR", processor(tag))) }.boxed())
}

/// Module whose `entity.beforeSave` handler appends `priority` to an array
pub fn appending_module(priority: i32) -> Arc<dyn PluginModule> {
    module_fn(move |_| {
        async move {
            let handler = hook_fn(move |data, _| {
                async move {
                    let mut items = data.as_array().cloned().unwrap_or_default();
                    items.push(json!(priority));
                    Ok(Some(Value::Array(items)))
                }
                .boxed()
            });
            Ok(PluginExports::new().hook("entity.beforeSave", priority, handler))
        }
        .boxed()
    })
}

/// Records lifecycle callbacks in call order
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: &str) {
        self.0.lock().push(entry.to_string());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

/// Module with every lifecycle export, logging each call
pub fn recording_module(log: CallLog) -> Arc<dyn PluginModule> {
    module_fn(move |_| {
        let log = log.clone();
        async move {
            let step = |name: &'static str| {
                let log = log.clone();
                callback(move |_| {
                    log.push(name);
                    async { Ok(()) }.boxed()
                })
            };
            Ok(PluginExports::new()
                .on_initialize(step("initialize"))
                .on_activate(step("activate"))
                .on_deactivate(step("deactivate"))
                .on_cleanup(step("cleanup")))
        }
        .boxed()
    })
}

/// Module that hands its context to the test
#[derive(Clone, Default)]
pub struct ContextSlot(Arc<Mutex<Option<PluginContext>>>);

impl ContextSlot {
    pub fn module(&self) -> Arc<dyn PluginModule> {
        let slot = self.clone();
        module_fn(move |ctx| {
            *slot.0.lock() = Some(ctx);
            async { Ok(PluginExports::new()) }.boxed()
        })
    }

    pub fn get(&self) -> PluginContext {
        self.0.lock().clone().unwrap()
    }
}
