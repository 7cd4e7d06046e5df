mod common;

use common::*;
use futures::FutureExt;
use plugin_runtime_core::{
    callback, hook_fn, module_fn, Permission, PluginExports, PluginFilter, PluginManifest, PluginRuntime,
    PluginRuntimeError, PluginStatus, RuntimeConfig, RuntimeEvent, SandboxConfig,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_end_to_end_extension_permissions() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime_with(dir.path(), |b| b.with_module("a-main", processor_module("from-a"))).await;

    let a = manifest("plugin-a", "a-main")
        .with_permission("ENTITY_READ")
        .with_extension_point("ENTITY_PROCESSOR");
    assert_eq!(runtime.register_plugin(&a).await.unwrap().status, PluginStatus::Registered);
    assert_eq!(runtime.load_plugin("plugin-a").await.unwrap().status, PluginStatus::Loaded);
    assert_eq!(runtime.activate_plugin("plugin-a").await.unwrap().status, PluginStatus::Active);

    let b = manifest("plugin-b", "b-main").with_extension_point("ENTITY_PROCESSOR");
    runtime.register_plugin(&b).await.unwrap();
    let err = runtime
        .register_extension("plugin-b", "ENTITY_PROCESSOR", processor("from-b"))
        .await
        .unwrap_err();
    match &err {
        PluginRuntimeError::Permission { plugin_id, point_id, missing } => {
            assert_eq!(plugin_id, "plugin-b");
            assert_eq!(point_id, "ENTITY_PROCESSOR");
            assert_eq!(missing, &vec![Permission::EntityRead]);
        }
        other => panic!("expected a permission error, got {other:?}"),
    }
    assert!(err.to_string().contains("ENTITY_READ"));

    let results = runtime
        .execute_extension("ENTITY_PROCESSOR", "process", vec![json!({"id": 1})])
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].plugin_id, "plugin-a");
    assert_eq!(results[0].result, json!("from-a"));
}

#[tokio::test]
async fn test_registration_rules() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime(dir.path()).await;

    runtime.register_plugin(&manifest("dup", "main")).await.unwrap();
    match runtime.register_plugin(&manifest("dup", "main")).await {
        Err(PluginRuntimeError::Validation(errors)) => {
            assert_eq!(errors.len(), 1);
            assert!(errors[0].contains("already registered"));
        }
        other => panic!("expected a validation error, got {other:?}"),
    }

    let broken = PluginManifest::new("", "one", "")
        .with_id("broken")
        .with_extension_point("NOPE")
        .with_permission("ROOT_ACCESS");
    match runtime.register_plugin(&broken).await {
        Err(PluginRuntimeError::Validation(errors)) => assert_eq!(errors.len(), 5, "{errors:?}"),
        other => panic!("expected a validation error, got {other:?}"),
    }
    assert!(matches!(
        runtime.get_plugin("broken").await,
        Err(PluginRuntimeError::NotFound { .. })
    ));

    let generated = runtime
        .register_plugin(&PluginManifest::new("No id", "1.0.0", "main"))
        .await
        .unwrap();
    assert!(uuid::Uuid::parse_str(&generated.id).is_ok());
}

#[tokio::test]
async fn test_dependencies_are_checked() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime(dir.path()).await;
    runtime
        .register_plugin(&PluginManifest::new("core", "2.3.1", "main").with_id("core"))
        .await
        .unwrap();

    let ok = manifest("ext", "main").with_dependency("core", "^2.3.0");
    runtime.register_plugin(&ok).await.unwrap();
    assert_eq!(runtime.dependents_of("core"), vec!["ext".to_string()]);

    let too_new = manifest("needs-three", "main").with_dependency("core", "3.0.0");
    assert!(matches!(
        runtime.register_plugin(&too_new).await,
        Err(PluginRuntimeError::Dependency(_))
    ));
    let missing = manifest("needs-ghost", "main").with_dependency("ghost", "1.0.0");
    assert!(matches!(
        runtime.register_plugin(&missing).await,
        Err(PluginRuntimeError::Dependency(_))
    ));
}

#[tokio::test]
async fn test_lifecycle_callbacks_and_events() {
    let dir = tempfile::tempdir().unwrap();
    let log = CallLog::default();
    let runtime = runtime_with(dir.path(), |b| b.with_module("rec", recording_module(log.clone()))).await;
    let mut events = runtime.subscribe();

    runtime.register_plugin(&manifest("rec", "rec")).await.unwrap();
    // Activation from REGISTERED loads first
    runtime.activate_plugin("rec").await.unwrap();
    // Idempotent
    assert_eq!(runtime.activate_plugin("rec").await.unwrap().status, PluginStatus::Active);
    assert_eq!(runtime.load_plugin("rec").await.unwrap().status, PluginStatus::Active);
    let unloaded = runtime.unload_plugin("rec").await.unwrap();
    assert_eq!(unloaded.status, PluginStatus::Registered);
    assert_eq!(runtime.unload_plugin("rec").await.unwrap().status, PluginStatus::Registered);

    assert_eq!(log.entries(), vec!["initialize", "activate", "deactivate", "cleanup"]);

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name());
    }
    assert_eq!(
        names,
        vec![
            "pluginRegistered",
            "pluginLoaded",
            "pluginActivated",
            "pluginDeactivated",
            "pluginUnloaded"
        ]
    );
    assert_eq!(runtime.get_plugin("rec").await.unwrap().metrics.activations, 1);
}

#[tokio::test]
async fn test_deactivate_on_loaded_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let log = CallLog::default();
    let runtime = runtime_with(dir.path(), |b| b.with_module("rec", recording_module(log.clone()))).await;
    runtime.register_plugin(&manifest("rec", "rec")).await.unwrap();
    let loaded = runtime.load_plugin("rec").await.unwrap();

    let same = runtime.deactivate_plugin("rec").await.unwrap();
    assert_eq!(same.status, PluginStatus::Loaded);
    assert_eq!(same.updated_at, loaded.updated_at);
    assert_eq!(log.entries(), vec!["initialize"]);
}

#[tokio::test]
async fn test_failed_activation_tears_everything_down() {
    let dir = tempfile::tempdir().unwrap();
    let module = module_fn(|_| {
        async {
            Ok(PluginExports::new()
                .on_activate(callback(|_| async { Err(anyhow::anyhow!("license expired")) }.boxed()))
                .hook("entity.beforeSave", 1, hook_fn(|_, _| async { Ok(None) }.boxed()))
                .extension("ENTITY_PROCESSOR", processor("x")))
        }
        .boxed()
    });
    let runtime = runtime_with(dir.path(), |b| b.with_module("flaky", module)).await;
    let m = manifest("flaky", "flaky")
        .with_permission("ENTITY_READ")
        .with_extension_point("ENTITY_PROCESSOR")
        .with_hook("entity.beforeSave");
    runtime.register_plugin(&m).await.unwrap();
    runtime.load_plugin("flaky").await.unwrap();
    assert_eq!(runtime.get_hooks().await["entity.beforeSave"].len(), 1);

    let err = runtime.activate_plugin("flaky").await.unwrap_err();
    assert!(matches!(err, PluginRuntimeError::Sandbox { .. }));

    let plugin = runtime.get_plugin("flaky").await.unwrap();
    assert_eq!(plugin.status, PluginStatus::Failed);
    assert!(plugin.error.unwrap().contains("license expired"));
    assert_eq!(plugin.metrics.load_failures, 1);
    assert!(runtime.get_hooks().await.is_empty());

    let metrics = runtime.get_metrics().await;
    assert_eq!(metrics.registered_extensions, 0);
    assert_eq!(metrics.counters.lifecycle_failures, 1);

    // FAILED unloads straight back to REGISTERED
    assert_eq!(runtime.unload_plugin("flaky").await.unwrap().status, PluginStatus::Registered);
}

fn explode() -> anyhow::Result<PluginExports> {
    panic!("bad init")
}

#[tokio::test]
async fn test_load_failures() {
    let dir = tempfile::tempdir().unwrap();
    let undeclared = module_fn(|_| {
        async { Ok(PluginExports::new().hook("entity.afterDelete", 0, hook_fn(|_, _| async { Ok(None) }.boxed()))) }
            .boxed()
    });
    let panicking = module_fn(|_| async { explode() }.boxed());
    let runtime = runtime_with(dir.path(), |b| {
        b.with_module("undeclared", undeclared).with_module("panicking", panicking)
    })
    .await;

    runtime.register_plugin(&manifest("no-code", "missing-entry")).await.unwrap();
    assert!(matches!(
        runtime.load_plugin("no-code").await,
        Err(PluginRuntimeError::NotFound { .. })
    ));

    runtime.register_plugin(&manifest("undeclared", "undeclared")).await.unwrap();
    assert!(matches!(
        runtime.load_plugin("undeclared").await,
        Err(PluginRuntimeError::InvalidOperation(_))
    ));

    runtime.register_plugin(&manifest("panicking", "panicking")).await.unwrap();
    match runtime.load_plugin("panicking").await {
        Err(PluginRuntimeError::Sandbox { message, .. }) => assert!(message.contains("bad init")),
        other => panic!("expected a sandbox error, got {other:?}"),
    }

    let failed = runtime.get_plugins(&PluginFilter::status(PluginStatus::Failed)).await;
    assert_eq!(failed.len(), 3);
    assert!(runtime.get_hooks().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_slow_instantiation_hits_the_load_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let config = RuntimeConfig {
        plugin_dir: dir.path().to_path_buf(),
        sandbox: SandboxConfig {
            load_timeout_ms: 100,
            ..SandboxConfig::default()
        },
        ..RuntimeConfig::default()
    };
    let slow = module_fn(|_| {
        async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(PluginExports::new())
        }
        .boxed()
    });
    let runtime = PluginRuntime::builder(config).with_module("slow", slow).build().await.unwrap();
    runtime.register_plugin(&manifest("slow", "slow")).await.unwrap();

    match runtime.load_plugin("slow").await {
        Err(PluginRuntimeError::LoadTimeout { plugin_id, timeout_ms }) => {
            assert_eq!(plugin_id, "slow");
            assert_eq!(timeout_ms, 100);
        }
        other => panic!("expected a load timeout, got {other:?}"),
    }
    assert_eq!(runtime.get_plugin("slow").await.unwrap().status, PluginStatus::Failed);
}

fn stale_handler() -> Arc<dyn plugin_runtime_core::HookHandler> {
    hook_fn(|_, _| async { Ok(Some(json!("stale"))) }.boxed())
}

fn registering_manifest(id: &str) -> PluginManifest {
    manifest(id, id)
        .with_hook("entity.beforeSave")
        .with_extension_point("ENTITY_PROCESSOR")
        .with_permission("ENTITY_READ")
}

#[tokio::test(start_paused = true)]
async fn test_code_outliving_a_load_timeout_cannot_register() {
    let dir = tempfile::tempdir().unwrap();
    let config = RuntimeConfig {
        plugin_dir: dir.path().to_path_buf(),
        sandbox: SandboxConfig {
            load_timeout_ms: 100,
            ..SandboxConfig::default()
        },
        ..RuntimeConfig::default()
    };
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let done_tx = Arc::new(parking_lot::Mutex::new(Some(done_tx)));
    let slow = module_fn(move |ctx| {
        let done_tx = done_tx.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let hook = ctx.api().register_hook("entity.beforeSave", 0, stale_handler()).await;
            let extension = ctx.api().register_extension("ENTITY_PROCESSOR", processor("stale")).await;
            if let Some(tx) = done_tx.lock().take() {
                let _ = tx.send((hook, extension));
            }
            Ok(PluginExports::new())
        }
        .boxed()
    });
    let runtime = PluginRuntime::builder(config).with_module("slow", slow).build().await.unwrap();
    runtime.register_plugin(&registering_manifest("slow")).await.unwrap();

    assert!(matches!(
        runtime.load_plugin("slow").await,
        Err(PluginRuntimeError::LoadTimeout { .. })
    ));

    // The detached task wakes up after teardown and tries to register
    let (hook, extension) = done_rx.await.unwrap();
    assert!(matches!(hook, Err(PluginRuntimeError::InvalidOperation(_))));
    assert!(matches!(extension, Err(PluginRuntimeError::InvalidOperation(_))));

    assert!(runtime.get_hooks().await.is_empty());
    assert_eq!(runtime.execute_hook("entity.beforeSave", json!(1), json!({})).await, json!(1));
    assert!(runtime
        .execute_extension("ENTITY_PROCESSOR", "process", vec![])
        .await
        .unwrap()
        .is_empty());
    assert_eq!(runtime.get_plugin("slow").await.unwrap().status, PluginStatus::Failed);
}

#[tokio::test]
async fn test_api_handles_are_revoked_on_unload() {
    let dir = tempfile::tempdir().unwrap();
    let slot = ContextSlot::default();
    let runtime = runtime_with(dir.path(), |b| b.with_module("kept", slot.module())).await;
    runtime.register_plugin(&registering_manifest("kept")).await.unwrap();
    runtime.activate_plugin("kept").await.unwrap();

    let first = slot.get();
    assert!(!first.api().is_revoked());
    first.api().register_hook("entity.beforeSave", 0, stale_handler()).await.unwrap();

    runtime.unload_plugin("kept").await.unwrap();
    assert!(first.api().is_revoked());
    assert!(matches!(
        first.api().register_hook("entity.beforeSave", 0, stale_handler()).await,
        Err(PluginRuntimeError::InvalidOperation(_))
    ));
    assert!(matches!(
        first.api().register_extension("ENTITY_PROCESSOR", processor("stale")).await,
        Err(PluginRuntimeError::InvalidOperation(_))
    ));
    assert!(runtime.get_hooks().await.is_empty());
    assert!(runtime.get_extension_points().await.iter().all(|p| p.plugins.is_empty()));

    // A new load issues a fresh handle; the old one stays revoked
    runtime.load_plugin("kept").await.unwrap();
    let second = slot.get();
    second.api().register_hook("entity.beforeSave", 0, stale_handler()).await.unwrap();
    assert!(first.api().register_hook("entity.beforeSave", 0, stale_handler()).await.is_err());
    assert_eq!(runtime.get_hooks().await["entity.beforeSave"].len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_trusted_plugins_skip_the_load_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let config = RuntimeConfig {
        plugin_dir: dir.path().to_path_buf(),
        sandbox: SandboxConfig {
            load_timeout_ms: 100,
            ..SandboxConfig::default()
        },
        ..RuntimeConfig::default()
    };
    let slow = module_fn(|_| {
        async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(PluginExports::new())
        }
        .boxed()
    });
    let runtime = PluginRuntime::builder(config).with_module("slow", slow).build().await.unwrap();
    runtime
        .register_plugin(&manifest("trusted", "slow").trusted())
        .await
        .unwrap();
    assert_eq!(runtime.load_plugin("trusted").await.unwrap().status, PluginStatus::Loaded);
}

#[tokio::test]
async fn test_remove_requires_registered() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime_with(dir.path(), |b| b.with_module("noop", noop_module())).await;
    runtime.register_plugin(&manifest("gone", "noop")).await.unwrap();
    runtime.activate_plugin("gone").await.unwrap();

    assert!(matches!(
        runtime.remove_plugin("gone").await,
        Err(PluginRuntimeError::InvalidState(_))
    ));
    runtime.unload_plugin("gone").await.unwrap();

    let mut events = runtime.subscribe();
    runtime.remove_plugin("gone").await.unwrap();
    match events.recv().await.unwrap() {
        RuntimeEvent::PluginRemoved { plugin_id } => assert_eq!(plugin_id, "gone"),
        other => panic!("unexpected event {}", other.name()),
    }
    assert!(matches!(
        runtime.get_plugin("gone").await,
        Err(PluginRuntimeError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_hook_priority_order() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime_with(dir.path(), |b| {
        b.with_module("p5", appending_module(5))
            .with_module("p10", appending_module(10))
            .with_module("p1", appending_module(1))
    })
    .await;
    for main in ["p5", "p10", "p1"] {
        runtime
            .register_plugin(&manifest(main, main).with_hook("entity.beforeSave"))
            .await
            .unwrap();
        runtime.activate_plugin(main).await.unwrap();
    }

    let out = runtime.execute_hook("entity.beforeSave", json!([]), json!({})).await;
    assert_eq!(out, json!([10, 5, 1]));

    let hooks = runtime.get_hooks().await;
    let priorities: Vec<i32> = hooks["entity.beforeSave"].iter().map(|h| h.priority).collect();
    assert_eq!(priorities, vec![10, 5, 1]);

    // Unknown hooks pass data through
    assert_eq!(runtime.execute_hook("nobody.listens", json!(42), json!(null)).await, json!(42));
}

#[tokio::test(start_paused = true)]
async fn test_hook_faults_are_contained() {
    let dir = tempfile::tempdir().unwrap();
    let failing = module_fn(|_| {
        async {
            Ok(PluginExports::new().hook(
                "entity.beforeSave",
                7,
                hook_fn(|_, _| async { Err(anyhow::anyhow!("validation service down")) }.boxed()),
            ))
        }
        .boxed()
    });
    let stuck = module_fn(|_| {
        async {
            Ok(PluginExports::new().hook(
                "entity.beforeSave",
                6,
                hook_fn(|_, _| futures::future::pending().boxed()),
            ))
        }
        .boxed()
    });
    let runtime = runtime_with(dir.path(), |b| {
        b.with_module("p10", appending_module(10))
            .with_module("failing", failing)
            .with_module("stuck", stuck)
            .with_module("p1", appending_module(1))
    })
    .await;
    for (id, main) in [("p10", "p10"), ("failing", "failing"), ("stuck", "stuck"), ("p1", "p1")] {
        runtime
            .register_plugin(&manifest(id, main).with_hook("entity.beforeSave"))
            .await
            .unwrap();
        runtime.activate_plugin(id).await.unwrap();
    }

    let started = tokio::time::Instant::now();
    let out = runtime.execute_hook("entity.beforeSave", json!([]), json!({})).await;
    assert_eq!(out, json!([10, 1]));
    let timeout = runtime.config().hook_timeout();
    assert!(started.elapsed() <= timeout + Duration::from_millis(50));

    assert_eq!(runtime.get_plugin("failing").await.unwrap().metrics.errors, 1);
    assert_eq!(runtime.get_plugin("stuck").await.unwrap().metrics.timeouts, 1);
    let counters = runtime.get_metrics().await.counters;
    assert_eq!(counters.hook_failures, 1);
    assert_eq!(counters.hook_timeouts, 1);
}

#[tokio::test]
async fn test_extension_failures_are_excluded() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime(dir.path()).await;
    for id in ["one", "two", "three"] {
        let m = manifest(id, "unused")
            .with_permission("ENTITY_READ")
            .with_extension_point("ENTITY_PROCESSOR");
        runtime.register_plugin(&m).await.unwrap();
    }
    let broken = plugin_runtime_core::MethodTable::new()
        .method("process", |_| async { Err(anyhow::anyhow!("boom")) }.boxed())
        .into_extension();
    runtime.register_extension("one", "ENTITY_PROCESSOR", processor("1")).await.unwrap();
    runtime.register_extension("two", "ENTITY_PROCESSOR", broken).await.unwrap();
    runtime.register_extension("three", "ENTITY_PROCESSOR", processor("3")).await.unwrap();

    let results = runtime
        .execute_extension("ENTITY_PROCESSOR", "process", vec![])
        .await
        .unwrap();
    let tagged: Vec<(&str, &serde_json::Value)> =
        results.iter().map(|r| (r.plugin_id.as_str(), &r.result)).collect();
    assert_eq!(tagged, vec![("one", &json!("1")), ("three", &json!("3"))]);

    assert_eq!(runtime.unregister_extension("two", "ENTITY_PROCESSOR").await, 1);
    assert_eq!(runtime.unregister_extension("two", "ENTITY_PROCESSOR").await, 0);
}

#[tokio::test]
async fn test_custom_extension_points() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime_with(dir.path(), |b| {
        b.with_extension_point(
            plugin_runtime_core::ExtensionPoint::new("REPORT_RENDERER", "Renders reports")
                .with_methods(["render"])
                .requires(Permission::AnalyticsRead),
        )
    })
    .await;
    runtime
        .define_extension_point(plugin_runtime_core::ExtensionPoint::new("LATE_POINT", "Defined after start"))
        .await;

    let ids: Vec<String> = runtime.get_extension_points().await.into_iter().map(|p| p.id).collect();
    assert!(ids.contains(&"REPORT_RENDERER".to_string()));
    assert!(ids.contains(&"LATE_POINT".to_string()));
    assert_eq!(ids.len(), 8);

    let m = manifest("renderer", "unused").with_extension_point("REPORT_RENDERER");
    runtime.register_plugin(&m).await.unwrap();
    assert!(matches!(
        runtime.register_extension("renderer", "REPORT_RENDERER", processor("r")).await,
        Err(PluginRuntimeError::Permission { .. })
    ));
}
