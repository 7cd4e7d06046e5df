//! Plugin and extension runtime
//!
//! Lets third-party code extend host workflows through declared contracts
//! without destabilizing the host process:
//! - validated plugin registration with dependency resolution
//! - a lifecycle state machine (load, activate, deactivate, unload, remove)
//! - sandboxed execution with resource limits, a module allowlist and
//!   a WebAssembly backend
//! - ordered data-transforming **hooks** and broadcast **extensions**, both
//!   with fault isolation and timeouts
//! - a permission-checked API surface for plugin code
//! - package install and update with rollback
//!
//! # Example
//!
//! ```rust,no_run
//! use futures::FutureExt;
//! use plugin_runtime_core::{
//!     module_fn, MethodTable, PluginExports, PluginManifest, PluginRuntime, RuntimeConfig,
//! };
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = PluginRuntime::builder(RuntimeConfig::load(None)?)
//!         .with_module(
//!             "audit-trail",
//!             module_fn(|_ctx| {
//!                 async {
//!                     let processor = MethodTable::new()
//!                         .method("process", |args| async move { Ok(json!({ "seen": args.len() })) }.boxed())
//!                         .into_extension();
//!                     Ok(PluginExports::new().extension("ENTITY_PROCESSOR", processor))
//!                 }
//!                 .boxed()
//!             }),
//!         )
//!         .build()
//!         .await?;
//!
//!     let manifest = PluginManifest::new("Audit trail", "1.0.0", "audit-trail")
//!         .with_id("audit-trail")
//!         .with_permission("ENTITY_READ")
//!         .with_extension_point("ENTITY_PROCESSOR");
//!     runtime.register_plugin(&manifest).await?;
//!     runtime.activate_plugin("audit-trail").await?;
//!
//!     let results = runtime
//!         .execute_extension("ENTITY_PROCESSOR", "process", vec![json!({ "id": 1 })])
//!         .await?;
//!     println!("{results:?}");
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod audit;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod extension_point;
pub mod extensions;
pub mod hooks;
pub mod lifecycle;
pub mod logging;
pub mod manifest;
pub mod metrics;
pub mod module;
pub mod plugin;
pub mod registry;
pub mod resolver;
pub mod runtime;
pub mod sandbox;
pub mod security;
pub mod store;
pub mod wasm;

pub use api::{DataRequest, DataService, DataServices, HttpResponse, NoDataServices, PluginApi};
pub use audit::{AuditEntry, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use config::{LogConfig, RuntimeConfig, SandboxConfig};
pub use error::*;
pub use events::{PluginEvent, RuntimeEvent};
pub use extension_point::{ExtensionPoint, ExtensionPointInfo};
pub use extensions::ExtensionResult;
pub use hooks::{HookContext, HookInfo};
pub use manifest::PluginManifest;
pub use metrics::MetricsSnapshot;
pub use module::{
    callback, hook_fn, module_fn, Extension, HookHandler, LifecycleCallback, MethodTable, PluginExports,
    PluginModule,
};
pub use plugin::{Plugin, PluginFilter, PluginMetrics, PluginStatus};
pub use resolver::is_version_compatible;
pub use runtime::{PluginRuntime, PluginRuntimeBuilder};
pub use sandbox::{Isolation, PluginContext, ResourceLimits};
pub use security::{Permission, PermissionSet};
pub use store::{pack_package, ConfigStore, FilesystemPluginStore, MemoryConfigStore, PluginStore};
