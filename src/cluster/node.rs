//! Node records tracked by the membership tracker.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Reachability of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
    Busy,
    Unknown,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStatus::Online => "online",
            NodeStatus::Offline => "offline",
            NodeStatus::Busy => "busy",
            NodeStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Resource telemetry reported by a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeResources {
    pub cpu_usage: Option<f64>,
    pub memory_total: Option<u64>,
    pub memory_used: Option<u64>,
    pub gpu_name: Option<String>,
    pub gpu_memory: Option<u64>,
}

/// One inference-serving backend.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub status: NodeStatus,
    pub models: BTreeSet<String>,
    pub resources: NodeResources,
    #[serde(skip)]
    pub last_seen: Instant,
    pub last_seen_at: DateTime<Utc>,
    /// One-way message latency of the last heartbeat, in milliseconds.
    pub latency_ms: Option<u64>,
}

impl Node {
    /// A node record that has not been heard from yet.
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16, name: Option<String>) -> Self {
        let id = id.into();
        Self {
            name: name.unwrap_or_else(|| id.clone()),
            id,
            host: host.into(),
            port,
            status: NodeStatus::Unknown,
            models: BTreeSet::new(),
            resources: NodeResources::default(),
            last_seen: Instant::now(),
            last_seen_at: Utc::now(),
            latency_ms: None,
        }
    }

    /// Identifier used for nodes added by address.
    pub fn address_id(host: &str, port: u16) -> String {
        format!("{host}:{port}")
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn is_online(&self) -> bool {
        self.status == NodeStatus::Online
    }

    pub fn serves(&self, model: &str) -> bool {
        self.models.contains(model)
    }

    pub(crate) fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.last_seen_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_node_defaults() {
        let node = Node::new(Node::address_id("10.0.0.2", 11434), "10.0.0.2", 11434, None);
        assert_eq!(node.id, "10.0.0.2:11434");
        assert_eq!(node.name, node.id);
        assert_eq!(node.status, NodeStatus::Unknown);
        assert_eq!(node.base_url(), "http://10.0.0.2:11434");
        assert!(!node.is_online());
    }

    #[test]
    fn test_node_serializes_camel_case_without_instant() {
        let mut node = Node::new("gpu-a", "10.0.0.2", 11434, Some("GPU A".to_string()));
        node.models.insert("llama3".to_string());
        node.latency_ms = Some(12);
        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(value["status"], "unknown");
        assert_eq!(value["latencyMs"], 12);
        assert!(value.get("lastSeen").is_none());
        assert!(value.get("lastSeenAt").is_some());
        assert!(node.serves("llama3"));
    }
}
