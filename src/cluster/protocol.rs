//! Heartbeat and discovery wire messages.
//!
//! ```json
//! {"type": "heartbeat", "nodeId": "gpu-a", "payload": {...}, "timestamp": 1700000000000}
//! ```
//!
//! The payload schema belongs to the node, so it is read leniently: unknown
//! fields are ignored and a malformed field only loses that field.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cluster::node::{NodeResources, NodeStatus};
use crate::error::Result;

/// Kind of cluster message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Heartbeat,
    Discover,
    Announce,
    Status,
}

/// A message exchanged over the discovery channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub node_id: String,
    #[serde(default)]
    pub payload: Value,
    /// Sender wall clock, epoch milliseconds.
    pub timestamp: i64,
}

impl ClusterMessage {
    /// A message stamped with the current wall clock.
    pub fn new(kind: MessageKind, node_id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            node_id: node_id.into(),
            payload,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// The node-defined payload, read leniently.
    pub fn node_payload(&self) -> NodePayload {
        NodePayload::from_value(&self.payload)
    }
}

/// Fields of interest in a node payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodePayload {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub name: Option<String>,
    /// `None` when the payload does not mention models at all.
    pub models: Option<Vec<String>>,
    pub resources: Option<NodeResources>,
    pub status: Option<NodeStatus>,
}

impl NodePayload {
    pub fn from_value(payload: &Value) -> Self {
        let text = |key: &str| payload.get(key).and_then(Value::as_str).map(str::to_string);

        // Models are either plain names or objects carrying a `name`.
        let models = payload.get("models").and_then(Value::as_array).map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(name) => Some(name.clone()),
                    Value::Object(map) => map.get("name").and_then(Value::as_str).map(str::to_string),
                    _ => None,
                })
                .collect()
        });

        Self {
            host: text("host"),
            port: payload
                .get("port")
                .and_then(Value::as_u64)
                .and_then(|port| u16::try_from(port).ok()),
            name: text("name"),
            models,
            resources: payload
                .get("resources")
                .and_then(|value| serde_json::from_value(value.clone()).ok()),
            status: payload
                .get("status")
                .and_then(|value| serde_json::from_value(value.clone()).ok()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_wire_message() {
        let raw = br#"{"type":"heartbeat","nodeId":"gpu-a","payload":{"models":["llama3"]},"timestamp":1700000000000}"#;
        let message = ClusterMessage::from_slice(raw).unwrap();
        assert_eq!(message.kind, MessageKind::Heartbeat);
        assert_eq!(message.node_id, "gpu-a");
        assert_eq!(message.timestamp, 1_700_000_000_000);
        assert_eq!(message.node_payload().models, Some(vec!["llama3".to_string()]));
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let raw = br#"{"type":"gossip","nodeId":"gpu-a","timestamp":0}"#;
        assert!(ClusterMessage::from_slice(raw).is_err());
    }

    #[test]
    fn test_payload_is_read_leniently() {
        let payload = NodePayload::from_value(&json!({
            "host": "10.0.0.9",
            "port": 99999,
            "models": [{"name": "qwen"}, "llama3", 42],
            "resources": {"cpuUsage": 0.5, "gpuName": "A100"},
            "status": "busy",
            "extra": true
        }));
        assert_eq!(payload.host.as_deref(), Some("10.0.0.9"));
        assert_eq!(payload.port, None);
        assert_eq!(
            payload.models,
            Some(vec!["qwen".to_string(), "llama3".to_string()])
        );
        let resources = payload.resources.unwrap();
        assert_eq!(resources.cpu_usage, Some(0.5));
        assert_eq!(resources.gpu_name.as_deref(), Some("A100"));
        assert_eq!(payload.status, Some(NodeStatus::Busy));
    }

    #[test]
    fn test_missing_models_is_distinct_from_empty() {
        assert_eq!(NodePayload::from_value(&json!({})).models, None);
        assert_eq!(
            NodePayload::from_value(&json!({"models": []})).models,
            Some(Vec::new())
        );
        assert_eq!(NodePayload::from_value(&Value::Null), NodePayload::default());
    }

    #[test]
    fn test_new_message_serializes_type_field() {
        let message = ClusterMessage::new(MessageKind::Announce, "gpu-b", json!({}));
        let value: Value = serde_json::from_slice(&message.to_vec().unwrap()).unwrap();
        assert_eq!(value["type"], "announce");
        assert_eq!(value["nodeId"], "gpu-b");
    }
}
