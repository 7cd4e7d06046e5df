//! WebAssembly plugin support
//!
//! `.wasm` plugins run in a wasmtime instance with a memory cap, a fuel
//! budget per call and an import allowlist. Values cross the boundary as
//! JSON written into guest memory.
//!
//! Guest ABI:
//! - `memory` and `alloc(len: i32) -> i32` are required exports
//! - `initialize`, `activate`, `deactivate`, `cleanup` are optional
//!   `() -> i32` exports; `0` means success
//! - `hook:<name>[@<priority>](ptr, len) -> i64` receives
//!   `{"data": .., "context": ..}` and returns the replacement data
//! - `ext:<point>:<method>(ptr, len) -> i64` receives the argument array
//! - results are packed as `(ptr << 32) | len`; `len == 0` means no value
//! - host import `env.log(level, ptr, len)` writes to the plugin logger

use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;
use wasmtime::{Caller, Config, Engine, Extern, Instance, Linker, Memory, Module, Store, StoreLimits, StoreLimitsBuilder};

use crate::config::SandboxConfig;
use crate::error::{PluginResult, PluginRuntimeError};
use crate::hooks::HookContext;
use crate::logging::{PluginLogLevel, PluginLogger};
use crate::module::{Extension, HookExport, HookHandler, LifecycleCallback, PluginExports, PluginModule};
use crate::sandbox::PluginContext;

/// Largest message accepted from `env.log`
const MAX_LOG_BYTES: usize = 16 * 1024;

/// WASM runtime configuration
#[derive(Debug, Clone)]
pub struct WasmConfig {
    /// Linear memory cap per instance (bytes)
    pub max_memory_bytes: usize,
    /// Fuel available to each call
    pub fuel_per_call: u64,
    /// Import namespaces a module may use
    pub allowed_imports: Vec<String>,
}

impl WasmConfig {
    pub fn from_sandbox(config: &SandboxConfig) -> Self {
        Self {
            max_memory_bytes: config.max_memory_bytes,
            fuel_per_call: config.wasm_fuel_per_call,
            allowed_imports: config.wasm_allowed_imports.clone(),
        }
    }
}

impl Default for WasmConfig {
    fn default() -> Self {
        Self::from_sandbox(&SandboxConfig::default())
    }
}

/// Shared wasmtime engine plus policy
pub struct WasmRuntime {
    engine: Engine,
    config: WasmConfig,
}

impl WasmRuntime {
    pub fn new(config: WasmConfig) -> PluginResult<Self> {
        let mut engine_config = Config::new();
        engine_config.consume_fuel(true);
        let engine = Engine::new(&engine_config)
            .map_err(|e| PluginRuntimeError::ConfigurationError(format!("wasm engine: {e}")))?;
        Ok(Self { engine, config })
    }

    /// Compile a module and check its imports against the allowlist
    pub fn compile(&self, plugin_id: &str, bytes: &[u8]) -> PluginResult<WasmPluginModule> {
        let module = Module::new(&self.engine, bytes)
            .map_err(|e| PluginRuntimeError::InvalidModule(format!("plugin {plugin_id}: {e:#}")))?;

        let allowed: HashSet<&str> = self.config.allowed_imports.iter().map(String::as_str).collect();
        if let Some(import) = module.imports().find(|i| !allowed.contains(i.module())) {
            return Err(PluginRuntimeError::ModuleNotAllowed {
                plugin_id: plugin_id.to_string(),
                module: import.module().to_string(),
            });
        }

        debug!(plugin_id, exports = module.exports().len(), "WASM module compiled");
        Ok(WasmPluginModule {
            plugin_id: plugin_id.to_string(),
            engine: self.engine.clone(),
            module,
            config: self.config.clone(),
        })
    }
}

struct HostState {
    limits: StoreLimits,
    logger: PluginLogger,
}

/// Compiled module, instantiated once per load
pub struct WasmPluginModule {
    plugin_id: String,
    engine: Engine,
    module: Module,
    config: WasmConfig,
}

fn host_log(mut caller: Caller<'_, HostState>, level: i32, ptr: i32, len: i32) {
    let Some(memory) = caller.get_export("memory").and_then(Extern::into_memory) else {
        return;
    };
    let len = usize::try_from(len).unwrap_or(0).min(MAX_LOG_BYTES);
    let mut buf = vec![0u8; len];
    if memory.read(&caller, ptr as u32 as usize, &mut buf).is_ok() {
        let message = String::from_utf8_lossy(&buf);
        caller.data_mut().logger.log(PluginLogLevel::from_code(level), &message);
    }
}

async fn blocking<T, F>(f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| anyhow!("wasm call aborted: {e}"))?
}

impl WasmPluginModule {
    fn instantiate_blocking(&self, logger: PluginLogger, memory_cap: usize) -> anyhow::Result<PluginExports> {
        let wasm = self.create_instance(logger, memory_cap)?;
        Ok(self.collect_exports(&wasm))
    }

    fn create_instance(&self, logger: PluginLogger, memory_cap: usize) -> anyhow::Result<Arc<WasmInstance>> {
        let limits = StoreLimitsBuilder::new()
            .memory_size(memory_cap.min(self.config.max_memory_bytes))
            .build();
        let mut store = Store::new(&self.engine, HostState { limits, logger });
        store.limiter(|state| &mut state.limits);
        store.add_fuel(self.config.fuel_per_call)?;

        let mut linker = Linker::new(&self.engine);
        linker.func_wrap("env", "log", host_log)?;
        let instance = linker
            .instantiate(&mut store, &self.module)
            .context("instantiating wasm module")?;
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| anyhow!("module does not export `memory`"))?;

        Ok(Arc::new(WasmInstance {
            store: Mutex::new(store),
            instance,
            memory,
            fuel_per_call: self.config.fuel_per_call,
        }))
    }

    fn collect_exports(&self, wasm: &Arc<WasmInstance>) -> PluginExports {
        let mut exports = PluginExports::new();
        let mut extensions: BTreeMap<String, HashMap<String, String>> = BTreeMap::new();

        for export in self.module.exports() {
            let name = export.name();
            let lifecycle = || -> Arc<dyn LifecycleCallback> {
                Arc::new(WasmLifecycle {
                    wasm: wasm.clone(),
                    export: name.to_string(),
                })
            };
            match name {
                "initialize" => exports.initialize = Some(lifecycle()),
                "activate" => exports.activate = Some(lifecycle()),
                "deactivate" => exports.deactivate = Some(lifecycle()),
                "cleanup" => exports.cleanup = Some(lifecycle()),
                _ => {
                    if let Some(spec) = name.strip_prefix("hook:") {
                        let (hook, priority) = parse_hook_export(spec);
                        let handler: Arc<dyn HookHandler> = Arc::new(WasmHook {
                            wasm: wasm.clone(),
                            export: name.to_string(),
                        });
                        exports.hooks.insert(hook.to_string(), HookExport { handler, priority });
                    } else if let Some((point, method)) =
                        name.strip_prefix("ext:").and_then(|rest| rest.rsplit_once(':'))
                    {
                        extensions
                            .entry(point.to_string())
                            .or_default()
                            .insert(method.to_string(), name.to_string());
                    }
                }
            }
        }

        for (point, methods) in extensions {
            let implementation: Arc<dyn Extension> = Arc::new(WasmExtension {
                wasm: wasm.clone(),
                methods,
            });
            exports.extensions.insert(point, implementation);
        }
        debug!(plugin_id = %self.plugin_id, ?exports, "WASM exports collected");
        exports
    }
}

/// `name@priority` -> (name, priority); priority defaults to 0
fn parse_hook_export(spec: &str) -> (&str, i32) {
    match spec.rsplit_once('@') {
        Some((name, priority)) => match priority.parse() {
            Ok(priority) => (name, priority),
            Err(_) => (spec, 0),
        },
        None => (spec, 0),
    }
}

#[async_trait]
impl PluginModule for WasmPluginModule {
    async fn instantiate(&self, ctx: PluginContext) -> anyhow::Result<PluginExports> {
        let module = WasmPluginModule {
            plugin_id: self.plugin_id.clone(),
            engine: self.engine.clone(),
            module: self.module.clone(),
            config: self.config.clone(),
        };
        let logger = ctx.logger().clone();
        let memory_cap = ctx.limits().max_memory_bytes;
        blocking(move || module.instantiate_blocking(logger, memory_cap)).await
    }
}

/// One live instance; calls are serialized by the store lock
pub(crate) struct WasmInstance {
    store: Mutex<Store<HostState>>,
    instance: Instance,
    memory: Memory,
    fuel_per_call: u64,
}

impl WasmInstance {
    fn refuel(&self, store: &mut Store<HostState>) -> anyhow::Result<()> {
        let remaining = store.consume_fuel(0)?;
        if remaining < self.fuel_per_call {
            store.add_fuel(self.fuel_per_call - remaining)?;
        }
        Ok(())
    }

    /// Call a `() -> i32` export; non-zero is an error
    pub(crate) fn call_unit(&self, export: &str) -> anyhow::Result<()> {
        let mut store = self.store.lock();
        self.refuel(&mut store)?;
        let func = self.instance.get_typed_func::<(), i32>(&mut *store, export)?;
        match func.call(&mut *store, ())? {
            0 => Ok(()),
            code => Err(anyhow!("{export} returned {code}")),
        }
    }

    /// Call a `(ptr, len) -> i64` export with a JSON argument
    pub(crate) fn call_json(&self, export: &str, input: &Value) -> anyhow::Result<Option<Value>> {
        let bytes = serde_json::to_vec(input)?;
        let len = i32::try_from(bytes.len()).context("argument too large")?;

        let mut store = self.store.lock();
        self.refuel(&mut store)?;
        let alloc = self.instance.get_typed_func::<i32, i32>(&mut *store, "alloc")?;
        let ptr = alloc.call(&mut *store, len)?;
        self.memory.write(&mut *store, ptr as u32 as usize, &bytes)?;

        let func = self.instance.get_typed_func::<(i32, i32), i64>(&mut *store, export)?;
        let packed = func.call(&mut *store, (ptr, len))? as u64;
        let out_ptr = (packed >> 32) as usize;
        let out_len = (packed & 0xffff_ffff) as usize;
        if out_len == 0 {
            return Ok(None);
        }

        let mut out = vec![0u8; out_len];
        self.memory.read(&*store, out_ptr, &mut out)?;
        let value = serde_json::from_slice(&out).context("guest returned invalid JSON")?;
        Ok(Some(value))
    }
}

struct WasmLifecycle {
    wasm: Arc<WasmInstance>,
    export: String,
}

#[async_trait]
impl LifecycleCallback for WasmLifecycle {
    async fn call(&self, _ctx: PluginContext) -> anyhow::Result<()> {
        let wasm = self.wasm.clone();
        let export = self.export.clone();
        blocking(move || wasm.call_unit(&export)).await
    }
}

struct WasmHook {
    wasm: Arc<WasmInstance>,
    export: String,
}

#[async_trait]
impl HookHandler for WasmHook {
    async fn handle(&self, data: Value, ctx: HookContext) -> anyhow::Result<Option<Value>> {
        let wasm = self.wasm.clone();
        let export = self.export.clone();
        let input = serde_json::json!({ "data": data, "context": ctx.context });
        blocking(move || wasm.call_json(&export, &input)).await
    }
}

struct WasmExtension {
    wasm: Arc<WasmInstance>,
    /// method -> export name
    methods: HashMap<String, String>,
}

#[async_trait]
impl Extension for WasmExtension {
    fn implements(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    async fn invoke(&self, method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        let export = self
            .methods
            .get(method)
            .cloned()
            .ok_or_else(|| anyhow!("method {method} is not exported"))?;
        let wasm = self.wasm.clone();
        let result = blocking(move || wasm.call_json(&export, &Value::Array(args))).await?;
        Ok(result.unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    const GUEST: &str = r#"
        (module
          (import "env" "log" (func $log (param i32 i32 i32)))
          (memory (export "memory") 1)
          (global $heap (mut i32) (i32.const 1024))
          (data (i32.const 16) "\"wasm-ok\"")
          (data (i32.const 32) "initialized")
          (func (export "alloc") (param $len i32) (result i32)
            (local $ptr i32)
            global.get $heap
            local.set $ptr
            global.get $heap
            local.get $len
            i32.add
            global.set $heap
            local.get $ptr)
          (func (export "initialize") (result i32)
            i32.const 2
            i32.const 32
            i32.const 11
            call $log
            i32.const 0)
          (func (export "activate") (result i32)
            i32.const 3)
          (func (export "hook:entity.beforeSave@7") (param i32 i32) (result i64)
            i64.const 16
            i64.const 32
            i64.shl
            i64.const 9
            i64.or)
          (func (export "hook:entity.audit") (param i32 i32) (result i64)
            i64.const 0)
          (func (export "ext:ENTITY_PROCESSOR:process") (param $ptr i32) (param $len i32) (result i64)
            local.get $ptr
            i64.extend_i32_u
            i64.const 32
            i64.shl
            local.get $len
            i64.extend_i32_u
            i64.or)
          (func (export "spin") (result i32)
            (loop $forever
              br $forever)
            i32.const 0)
          (func (export "grow") (result i32)
            i32.const 100
            memory.grow))
    "#;

    fn runtime(fuel: u64) -> WasmRuntime {
        WasmRuntime::new(WasmConfig {
            max_memory_bytes: 2 * 65536,
            fuel_per_call: fuel,
            allowed_imports: vec!["env".to_string()],
        })
        .unwrap()
    }

    fn instantiate(fuel: u64) -> (PluginExports, Arc<WasmInstance>) {
        let module = runtime(fuel).compile("guest", GUEST.as_bytes()).unwrap();
        let wasm = module
            .create_instance(PluginLogger::new("guest", None), usize::MAX)
            .unwrap();
        (module.collect_exports(&wasm), wasm)
    }

    fn hook_ctx() -> HookContext {
        HookContext {
            hook_name: "entity.beforeSave".to_string(),
            plugin_id: "guest".to_string(),
            context: Value::Null,
            cancellation: CancellationToken::new(),
        }
    }

    #[test]
    fn test_exports_follow_naming_convention() {
        let (exports, _) = instantiate(1_000_000);
        assert!(exports.initialize.is_some());
        assert!(exports.activate.is_some());
        assert!(exports.deactivate.is_none());
        assert_eq!(exports.hooks["entity.beforeSave"].priority, 7);
        assert_eq!(exports.hooks["entity.audit"].priority, 0);
        assert!(exports.extensions["ENTITY_PROCESSOR"].implements("process"));
        assert!(!exports.extensions["ENTITY_PROCESSOR"].implements("validate"));
    }

    #[tokio::test]
    async fn test_hook_and_extension_calls() {
        let (exports, _) = instantiate(1_000_000);

        let hook = exports.hooks["entity.beforeSave"].handler.clone();
        assert_eq!(hook.handle(json!({"a": 1}), hook_ctx()).await.unwrap(), Some(json!("wasm-ok")));

        let unchanged = exports.hooks["entity.audit"].handler.clone();
        assert_eq!(unchanged.handle(json!(1), hook_ctx()).await.unwrap(), None);

        let ext = exports.extensions["ENTITY_PROCESSOR"].clone();
        let echoed = ext.invoke("process", vec![json!({"id": 5}), json!("x")]).await.unwrap();
        assert_eq!(echoed, json!([{"id": 5}, "x"]));
    }

    #[test]
    fn test_lifecycle_return_codes() {
        let (_, wasm) = instantiate(1_000_000);
        wasm.call_unit("initialize").unwrap();
        let err = wasm.call_unit("activate").unwrap_err();
        assert!(err.to_string().contains("returned 3"));
    }

    #[test]
    fn test_fuel_stops_runaway_guest() {
        let (_, wasm) = instantiate(10_000);
        assert!(wasm.call_unit("spin").is_err());
        // Refuelled for the next call
        wasm.call_unit("initialize").unwrap();
    }

    #[test]
    fn test_memory_cap_denies_growth() {
        let (_, wasm) = instantiate(1_000_000);
        let err = wasm.call_unit("grow").unwrap_err();
        assert!(err.to_string().contains("returned -1"));
    }

    #[test]
    fn test_foreign_imports_are_rejected() {
        let wat = r#"
            (module
              (import "wasi_snapshot_preview1" "fd_write" (func (param i32 i32 i32 i32) (result i32)))
              (memory (export "memory") 1))
        "#;
        match runtime(1_000).compile("sneaky", wat.as_bytes()) {
            Err(PluginRuntimeError::ModuleNotAllowed { plugin_id, module }) => {
                assert_eq!(plugin_id, "sneaky");
                assert_eq!(module, "wasi_snapshot_preview1");
            }
            Err(other) => panic!("expected ModuleNotAllowed, got {other:?}"),
            Ok(_) => panic!("module with a foreign import compiled"),
        }
    }

    #[test]
    fn test_invalid_bytes() {
        assert!(matches!(
            runtime(1_000).compile("bad", b"\0asm\x02garbage"),
            Err(PluginRuntimeError::InvalidModule(_))
        ));
    }

    #[test]
    fn test_parse_hook_export() {
        assert_eq!(parse_hook_export("a.b@10"), ("a.b", 10));
        assert_eq!(parse_hook_export("a.b@-2"), ("a.b", -2));
        assert_eq!(parse_hook_export("a.b"), ("a.b", 0));
        assert_eq!(parse_hook_export("user@host"), ("user@host", 0));
    }
}
