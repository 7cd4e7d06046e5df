//! Runtime-wide counters

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::plugin::{PluginMetrics, PluginStatus};

/// Lock-free counters shared by the pipeline, dispatcher and lifecycle manager
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    hook_executions: AtomicU64,
    hook_failures: AtomicU64,
    hook_timeouts: AtomicU64,
    extension_executions: AtomicU64,
    extension_failures: AtomicU64,
    extension_timeouts: AtomicU64,
    lifecycle_failures: AtomicU64,
}

impl RuntimeMetrics {
    pub fn hook_executed(&self) {
        self.hook_executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hook_failed(&self) {
        self.hook_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hook_timed_out(&self) {
        self.hook_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn extension_executed(&self) {
        self.extension_executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn extension_failed(&self) {
        self.extension_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn extension_timed_out(&self) {
        self.extension_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lifecycle_failed(&self) {
        self.lifecycle_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counters(&self) -> RuntimeCounters {
        RuntimeCounters {
            hook_executions: self.hook_executions.load(Ordering::Relaxed),
            hook_failures: self.hook_failures.load(Ordering::Relaxed),
            hook_timeouts: self.hook_timeouts.load(Ordering::Relaxed),
            extension_executions: self.extension_executions.load(Ordering::Relaxed),
            extension_failures: self.extension_failures.load(Ordering::Relaxed),
            extension_timeouts: self.extension_timeouts.load(Ordering::Relaxed),
            lifecycle_failures: self.lifecycle_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`RuntimeMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeCounters {
    pub hook_executions: u64,
    pub hook_failures: u64,
    pub hook_timeouts: u64,
    pub extension_executions: u64,
    pub extension_failures: u64,
    pub extension_timeouts: u64,
    pub lifecycle_failures: u64,
}

/// Result of `PluginRuntime::get_metrics`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_plugins: usize,
    /// Plugin count per status (statuses with no plugins are included as 0)
    pub by_status: BTreeMap<String, usize>,
    pub extension_points: usize,
    pub registered_extensions: usize,
    pub hooks: usize,
    pub hook_handlers: usize,
    pub counters: RuntimeCounters,
    pub plugins: BTreeMap<String, PluginMetrics>,
}

impl MetricsSnapshot {
    pub fn count(&self, status: PluginStatus) -> usize {
        self.by_status.get(&status.to_string()).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_snapshot() {
        let metrics = RuntimeMetrics::default();
        metrics.hook_executed();
        metrics.hook_executed();
        metrics.hook_timed_out();
        metrics.lifecycle_failed();

        let counters = metrics.counters();
        assert_eq!(counters.hook_executions, 2);
        assert_eq!(counters.hook_timeouts, 1);
        assert_eq!(counters.lifecycle_failures, 1);
        assert_eq!(counters.extension_executions, 0);
    }
}
