//! Runtime and plugin event channels
//!
//! Host-facing lifecycle events are a typed enum over one broadcast channel.
//! Plugin-to-plugin events use one channel per `(source, name)` topic, and a
//! plugin can only ever publish under its own id.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::plugin::Plugin;

/// Lifecycle events emitted to the host
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
pub enum RuntimeEvent {
    PluginRegistered(Plugin),
    PluginLoaded(Plugin),
    PluginActivated(Plugin),
    PluginDeactivated(Plugin),
    PluginUnloaded(Plugin),
    #[serde(rename_all = "camelCase")]
    PluginRemoved { plugin_id: String },
    PluginInstalled(Plugin),
    #[serde(rename_all = "camelCase")]
    PluginUpdated {
        previous_version: String,
        plugin: Plugin,
    },
    #[serde(rename_all = "camelCase")]
    ExtensionRegistered { plugin_id: String, point_id: String },
}

impl RuntimeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PluginRegistered(_) => "pluginRegistered",
            Self::PluginLoaded(_) => "pluginLoaded",
            Self::PluginActivated(_) => "pluginActivated",
            Self::PluginDeactivated(_) => "pluginDeactivated",
            Self::PluginUnloaded(_) => "pluginUnloaded",
            Self::PluginRemoved { .. } => "pluginRemoved",
            Self::PluginInstalled(_) => "pluginInstalled",
            Self::PluginUpdated { .. } => "pluginUpdated",
            Self::ExtensionRegistered { .. } => "extensionRegistered",
        }
    }

    pub fn plugin_id(&self) -> &str {
        match self {
            Self::PluginRegistered(p)
            | Self::PluginLoaded(p)
            | Self::PluginActivated(p)
            | Self::PluginDeactivated(p)
            | Self::PluginUnloaded(p)
            | Self::PluginInstalled(p)
            | Self::PluginUpdated { plugin: p, .. } => &p.id,
            Self::PluginRemoved { plugin_id } | Self::ExtensionRegistered { plugin_id, .. } => {
                plugin_id
            }
        }
    }
}

/// Broadcast hub for [`RuntimeEvent`]s
pub struct EventHub {
    sender: broadcast::Sender<RuntimeEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn emit(&self, event: RuntimeEvent) {
        debug!(event = event.name(), plugin_id = event.plugin_id(), "Runtime event");
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.sender.subscribe()
    }
}

/// Event published by a plugin (or the host) on a namespaced topic
#[derive(Debug, Clone, Serialize)]
pub struct PluginEvent {
    /// Publishing plugin id, or [`HOST_SOURCE`]
    pub source: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub emitted_at: DateTime<Utc>,
}

/// Source id used for host-published events
pub const HOST_SOURCE: &str = "host";

/// `(source, name)`; kept as a pair so no id or name can alias another topic
type TopicKey = (String, String);

fn topic_key(source: &str, name: &str) -> TopicKey {
    (source.to_string(), name.to_string())
}

/// Per-topic channels keyed by source and event name
pub struct PluginEventBus {
    topics: RwLock<HashMap<TopicKey, broadcast::Sender<PluginEvent>>>,
    capacity: usize,
}

impl PluginEventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Publish `name` from `source`, returning how many subscribers received it
    pub async fn publish(&self, source: &str, name: &str, payload: serde_json::Value) -> usize {
        let topics = self.topics.read().await;
        let Some(sender) = topics.get(&topic_key(source, name)) else {
            return 0;
        };
        let event = PluginEvent {
            source: source.to_string(),
            name: name.to_string(),
            payload,
            emitted_at: Utc::now(),
        };
        sender.send(event).unwrap_or(0)
    }

    pub async fn subscribe(&self, source: &str, name: &str) -> broadcast::Receiver<PluginEvent> {
        let mut topics = self.topics.write().await;
        topics
            .entry(topic_key(source, name))
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Close every topic published by `source`; subscribers see the channel end
    pub async fn close_source(&self, source: &str) -> usize {
        let mut topics = self.topics.write().await;
        let before = topics.len();
        topics.retain(|(owner, _), _| owner != source);
        before - topics.len()
    }
}
