//! Plugin security and permission management
//!
//! Permissions are a closed vocabulary. Manifests carry them as strings so
//! that unknown names can be reported during validation instead of failing
//! deserialization.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Plugin permission types
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    /// Read host entities
    EntityRead,
    /// Create or update host entities
    EntityWrite,
    /// Delete host entities
    EntityDelete,
    /// Query analytics and reports
    AnalyticsRead,
    /// Record analytics events
    AnalyticsWrite,
    /// Send notifications through host channels
    NotificationSend,
    /// Start host workflows
    WorkflowExecute,
    /// Outbound network access (subject to the sandbox allowlist)
    NetworkAccess,
}

/// Granted permission set
pub type PermissionSet = BTreeSet<Permission>;

impl Permission {
    pub const ALL: [Permission; 8] = [
        Permission::EntityRead,
        Permission::EntityWrite,
        Permission::EntityDelete,
        Permission::AnalyticsRead,
        Permission::AnalyticsWrite,
        Permission::NotificationSend,
        Permission::WorkflowExecute,
        Permission::NetworkAccess,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EntityRead => "ENTITY_READ",
            Self::EntityWrite => "ENTITY_WRITE",
            Self::EntityDelete => "ENTITY_DELETE",
            Self::AnalyticsRead => "ANALYTICS_READ",
            Self::AnalyticsWrite => "ANALYTICS_WRITE",
            Self::NotificationSend => "NOTIFICATION_SEND",
            Self::WorkflowExecute => "WORKFLOW_EXECUTE",
            Self::NetworkAccess => "NETWORK_ACCESS",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a permission name is outside the vocabulary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPermission(pub String);

impl fmt::Display for UnknownPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown permission '{}'", self.0)
    }
}

impl std::error::Error for UnknownPermission {}

impl FromStr for Permission {
    type Err = UnknownPermission;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Permission::ALL
            .iter()
            .copied()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownPermission(s.to_string()))
    }
}

/// Required permissions absent from the granted set, in vocabulary order
pub fn missing_permissions(granted: &PermissionSet, required: &PermissionSet) -> Vec<Permission> {
    required.difference(granted).copied().collect()
}
