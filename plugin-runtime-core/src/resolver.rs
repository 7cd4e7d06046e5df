//! Dependency resolution between plugins
//!
//! Compatibility is deliberately narrower than full semver ranges: the major
//! version must match and the available version must not be older than the
//! required one. Range operators are accepted and ignored.

use parking_lot::RwLock;
use semver::Version;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{PluginResult, PluginRuntimeError};

/// Parse a version, stripping range operators and padding missing components
pub fn normalize_version(raw: &str) -> Option<Version> {
    let trimmed = raw
        .trim()
        .trim_start_matches(['^', '~', '=', '>', 'v', 'V'])
        .trim();
    let (core, rest) = match trimmed.find(['-', '+']) {
        Some(idx) => trimmed.split_at(idx),
        None => (trimmed, ""),
    };
    let mut parts: Vec<&str> = core.split('.').collect();
    if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    while parts.len() < 3 {
        parts.push("0");
    }
    Version::parse(&format!("{}{}", parts.join("."), rest)).ok()
}

/// Equal major, and the available minor/patch is at least the required one
pub fn is_version_compatible(available: &str, required: &str) -> bool {
    let (Some(available), Some(required)) = (normalize_version(available), normalize_version(required))
    else {
        return false;
    };
    available.major == required.major
        && (available.minor > required.minor
            || (available.minor == required.minor && available.patch >= required.patch))
}

/// Tracks who depends on whom
#[derive(Debug, Default)]
pub struct DependencyResolver {
    dependents: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check required and peer dependencies against `installed` (id -> version).
    ///
    /// Every unmet constraint is reported in one error.
    pub fn check(
        &self,
        dependencies: &BTreeMap<String, String>,
        peer_dependencies: &BTreeMap<String, String>,
        installed: &HashMap<String, String>,
    ) -> PluginResult<()> {
        let mut problems = Vec::new();

        for (id, range) in dependencies {
            match installed.get(id) {
                None => problems.push(format!("dependency {id}@{range} is not registered")),
                Some(version) if !is_version_compatible(version, range) => problems.push(format!(
                    "dependency {id}@{range} is incompatible with registered version {version}"
                )),
                Some(_) => {}
            }
        }

        for (id, range) in peer_dependencies {
            if let Some(version) = installed.get(id) {
                if !is_version_compatible(version, range) {
                    problems.push(format!(
                        "peer dependency {id}@{range} is incompatible with registered version {version}"
                    ));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(PluginRuntimeError::Dependency(problems))
        }
    }

    /// Record `plugin_id` as a dependent of each of its dependencies
    pub fn record<'a>(&self, plugin_id: &str, dependencies: impl IntoIterator<Item = &'a String>) {
        let mut dependents = self.dependents.write();
        for dependency in dependencies {
            dependents
                .entry(dependency.clone())
                .or_default()
                .insert(plugin_id.to_string());
        }
    }

    /// Undo [`record`](Self::record) for the given dependencies
    pub fn forget_dependencies_of<'a>(
        &self,
        plugin_id: &str,
        dependencies: impl IntoIterator<Item = &'a String>,
    ) {
        let mut dependents = self.dependents.write();
        for dependency in dependencies {
            if let Some(set) = dependents.get_mut(dependency) {
                set.remove(plugin_id);
                if set.is_empty() {
                    dependents.remove(dependency);
                }
            }
        }
    }

    pub fn dependents_of(&self, plugin_id: &str) -> Vec<String> {
        self.dependents
            .read()
            .get(plugin_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop every entry mentioning `plugin_id`
    pub fn forget(&self, plugin_id: &str) {
        let mut dependents = self.dependents.write();
        dependents.remove(plugin_id);
        for set in dependents.values_mut() {
            set.remove(plugin_id);
        }
        dependents.retain(|_, set| !set.is_empty());
    }
}
