//! Authoritative view of the inference fleet.
//!
//! The tracker owns the node map. It is fed by heartbeat and discovery
//! messages and by explicit `add_node`/`remove_node` calls, and a periodic
//! sweep marks silent nodes offline. Changes are published on a broadcast
//! channel as [`MembershipEvent`]s.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cluster::node::{Node, NodeStatus};
use crate::cluster::protocol::{ClusterMessage, MessageKind, NodePayload};
use crate::config::cluster::{
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_NODE_TIMEOUT, EVENT_CHANNEL_CAPACITY,
};
use crate::config::StaticNode;
use crate::reliability::metrics::{record_node_offline, record_node_online};
use crate::reliability::{ScheduledTask, Scheduler};

/// Membership timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    /// Period of the node-timeout sweep.
    #[serde(with = "crate::config::duration_secs")]
    pub heartbeat_interval: Duration,
    /// Silence after which a node is marked offline.
    #[serde(with = "crate::config::duration_secs")]
    pub node_timeout: Duration,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            node_timeout: DEFAULT_NODE_TIMEOUT,
        }
    }
}

/// A change in fleet membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MembershipEvent {
    NodeOnline { node_id: String },
    NodeOffline { node_id: String },
    NodeRemoved { node_id: String },
    /// The set of online nodes serving `model` went from empty to non-empty.
    ModelAvailable { model: String },
}

/// Aggregate fleet counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStats {
    pub total_nodes: usize,
    pub online_nodes: usize,
    /// Sum of advertised models over all nodes.
    pub total_models: usize,
    pub unique_models: usize,
}

/// Tracks which nodes exist, what they serve and whether they are reachable.
#[derive(Debug)]
pub struct MembershipTracker {
    config: MembershipConfig,
    pub(crate) nodes: RwLock<HashMap<String, Node>>,
    events: broadcast::Sender<MembershipEvent>,
    sweep_task: Mutex<Option<ScheduledTask>>,
}

fn online_models(nodes: &HashMap<String, Node>) -> BTreeSet<String> {
    nodes
        .values()
        .filter(|node| node.is_online())
        .flat_map(|node| node.models.iter().cloned())
        .collect()
}

fn online_count(nodes: &HashMap<String, Node>) -> usize {
    nodes.values().filter(|node| node.is_online()).count()
}

/// Host and port for a node first heard of through a message.
fn address_of(node_id: &str, payload: &NodePayload) -> (String, u16) {
    let (id_host, id_port) = match node_id.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().ok()),
        None => (node_id.to_string(), None),
    };
    let host = payload.host.clone().unwrap_or(id_host);
    let port = payload.port.or(id_port).unwrap_or(0);
    (host, port)
}

impl MembershipTracker {
    pub fn new(config: MembershipConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            config,
            nodes: RwLock::new(HashMap::new()),
            events,
            sweep_task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &MembershipConfig {
        &self.config
    }

    /// Start the periodic timeout sweep.
    pub fn start(self: &Arc<Self>, scheduler: &Scheduler) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = scheduler.schedule_every("membership-sweep", self.config.heartbeat_interval, move || {
            let weak = weak.clone();
            async move {
                if let Some(tracker) = weak.upgrade() {
                    tracker.sweep();
                }
            }
        });
        if let Some(previous) = self.sweep_task.lock().replace(task) {
            previous.cancel();
        }
    }

    /// Stop the sweep started by [`start`](Self::start).
    pub fn stop(&self) {
        if let Some(task) = self.sweep_task.lock().take() {
            task.cancel();
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    fn publish(&self, events: Vec<MembershipEvent>) {
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }

    /// Apply a heartbeat, discovery, announce or status message.
    pub fn handle_message(&self, message: &ClusterMessage) {
        let payload = message.node_payload();
        // Sender clocks are untrusted; skewed or extreme timestamps read as zero.
        let latency_ms = u64::try_from(Utc::now().timestamp_millis().saturating_sub(message.timestamp)).unwrap_or(0);

        let mut events = Vec::new();
        let online = {
            let mut nodes = self.nodes.write();
            let models_before = online_models(&nodes);

            match nodes.get_mut(&message.node_id) {
                Some(node) => {
                    let was_online = node.is_online();
                    node.touch();
                    if let Some(resources) = payload.resources.clone() {
                        node.resources = resources;
                    }
                    if let Some(models) = payload.models.clone() {
                        node.models = models.into_iter().collect();
                    }
                    if let Some(name) = payload.name.clone() {
                        node.name = name;
                    }
                    node.latency_ms = Some(latency_ms);
                    node.status = match message.kind {
                        MessageKind::Status => payload.status.unwrap_or(NodeStatus::Online),
                        _ => NodeStatus::Online,
                    };

                    if node.is_online() && !was_online {
                        info!(node_id = %node.id, "Node is online");
                        events.push(MembershipEvent::NodeOnline {
                            node_id: node.id.clone(),
                        });
                    } else if !node.is_online() && was_online {
                        warn!(node_id = %node.id, status = %node.status, "Node reported it is not available");
                    }
                }
                None if message.kind == MessageKind::Status => {
                    debug!(node_id = %message.node_id, "Ignoring status from unknown node");
                    return;
                }
                None => {
                    let (host, port) = address_of(&message.node_id, &payload);
                    let mut node = Node::new(message.node_id.clone(), host, port, payload.name.clone());
                    node.models = payload.models.clone().unwrap_or_default().into_iter().collect();
                    node.resources = payload.resources.clone().unwrap_or_default();
                    node.latency_ms = Some(latency_ms);
                    node.status = NodeStatus::Online;
                    info!(node_id = %node.id, kind = ?message.kind, models = node.models.len(), "Discovered node");
                    events.push(MembershipEvent::NodeOnline {
                        node_id: node.id.clone(),
                    });
                    nodes.insert(node.id.clone(), node);
                }
            }

            let models_after = online_models(&nodes);
            for model in models_after.difference(&models_before) {
                debug!(model = %model, "Model became available");
                events.push(MembershipEvent::ModelAvailable {
                    model: model.clone(),
                });
            }
            online_count(&nodes)
        };

        if events
            .iter()
            .any(|event| matches!(event, MembershipEvent::NodeOnline { .. }))
        {
            record_node_online(online);
        }
        self.publish(events);
    }

    /// Register a node by address. It stays `unknown` until it is heard from.
    pub fn add_node(&self, host: &str, port: u16, name: Option<&str>) -> String {
        self.add_node_with_models(host, port, name, std::iter::empty())
    }

    /// Register a node from static configuration.
    pub fn add_static(&self, node: &StaticNode) -> String {
        self.add_node_with_models(&node.host, node.port, node.name.as_deref(), node.models.iter().cloned())
    }

    fn add_node_with_models(
        &self,
        host: &str,
        port: u16,
        name: Option<&str>,
        models: impl IntoIterator<Item = String>,
    ) -> String {
        let id = Node::address_id(host, port);
        let mut node = Node::new(id.clone(), host, port, name.map(str::to_string));
        node.models = models.into_iter().collect();

        let mut nodes = self.nodes.write();
        if nodes.contains_key(&id) {
            debug!(node_id = %id, "Node already registered");
        } else {
            info!(node_id = %id, "Added node");
            nodes.insert(id.clone(), node);
        }
        id
    }

    /// Forget a node. Returns whether it was known.
    pub fn remove_node(&self, node_id: &str) -> bool {
        let removed = self.nodes.write().remove(node_id);
        match removed {
            Some(node) => {
                info!(node_id = %node.id, "Removed node");
                self.publish(vec![MembershipEvent::NodeRemoved {
                    node_id: node.id,
                }]);
                true
            }
            None => false,
        }
    }

    /// Mark nodes silent for longer than `node_timeout` offline.
    /// Returns the ids that went offline.
    pub fn sweep(&self) -> Vec<String> {
        let now = Instant::now();
        let (offline, online) = {
            let mut nodes = self.nodes.write();
            let mut offline = Vec::new();
            for node in nodes.values_mut() {
                let reachable = matches!(node.status, NodeStatus::Online | NodeStatus::Busy);
                if reachable && now.saturating_duration_since(node.last_seen) > self.config.node_timeout {
                    warn!(
                        node_id = %node.id,
                        silent_secs = now.saturating_duration_since(node.last_seen).as_secs(),
                        "Node timed out, marking offline"
                    );
                    node.status = NodeStatus::Offline;
                    offline.push(node.id.clone());
                }
            }
            offline.sort();
            (offline, online_count(&nodes))
        };

        for _ in &offline {
            record_node_offline(online);
        }
        self.publish(
            offline
                .iter()
                .map(|node_id| MembershipEvent::NodeOffline {
                    node_id: node_id.clone(),
                })
                .collect(),
        );
        offline
    }

    pub fn get_stats(&self) -> ClusterStats {
        let nodes = self.nodes.read();
        let unique: BTreeSet<&String> = nodes.values().flat_map(|node| node.models.iter()).collect();
        ClusterStats {
            total_nodes: nodes.len(),
            online_nodes: online_count(&nodes),
            total_models: nodes.values().map(|node| node.models.len()).sum(),
            unique_models: unique.len(),
        }
    }

    /// Snapshot of every node, ordered by id.
    pub fn get_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.read().values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn get_node(&self, node_id: &str) -> Option<Node> {
        self.nodes.read().get(node_id).cloned()
    }
}

impl Drop for MembershipTracker {
    fn drop(&mut self) {
        self.stop();
    }
}
