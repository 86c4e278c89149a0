//! Node selection for a request.

use crate::cluster::membership::MembershipTracker;
use crate::cluster::node::Node;
use crate::error::{AppError, Result};

impl MembershipTracker {
    /// Online nodes serving `model`, lowest latency first.
    ///
    /// Nodes that have not reported a latency sort last; ties break on id so
    /// the order is stable.
    pub fn candidates_for_model(&self, model: &str) -> Vec<Node> {
        let mut candidates: Vec<Node> = self
            .nodes
            .read()
            .values()
            .filter(|node| node.is_online() && node.serves(model))
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            (a.latency_ms.is_none(), a.latency_ms, &a.id).cmp(&(b.latency_ms.is_none(), b.latency_ms, &b.id))
        });
        candidates
    }

    /// The lowest-latency online node serving `model`.
    ///
    /// An empty candidate set is `NoCapacity`, which callers must keep distinct
    /// from an open circuit.
    pub fn select_for_model(&self, model: &str) -> Result<Node> {
        self.candidates_for_model(model)
            .into_iter()
            .next()
            .ok_or_else(|| AppError::NoCapacity {
                model: model.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use crate::cluster::membership::{MembershipConfig, MembershipTracker};
    use crate::cluster::node::NodeStatus;
    use crate::cluster::protocol::{ClusterMessage, MessageKind};
    use crate::error::AppError;
    use serde_json::json;

    fn tracker_with(nodes: &[(&str, Option<u64>, &[&str])]) -> std::sync::Arc<MembershipTracker> {
        let tracker = MembershipTracker::new(MembershipConfig::default());
        for (id, _, models) in nodes {
            tracker.handle_message(&ClusterMessage::new(
                MessageKind::Heartbeat,
                *id,
                json!({ "models": models }),
            ));
        }
        {
            let mut map = tracker.nodes.write();
            for (id, latency, _) in nodes {
                if let Some(node) = map.get_mut(*id) {
                    node.latency_ms = *latency;
                }
            }
        }
        tracker
    }

    #[test]
    fn test_picks_lowest_latency_online_node() {
        let tracker = tracker_with(&[
            ("slow", Some(80), &["llama3"]),
            ("fast", Some(5), &["llama3"]),
            ("unmeasured", None, &["llama3"]),
            ("other", Some(1), &["qwen"]),
        ]);

        let ids: Vec<String> = tracker
            .candidates_for_model("llama3")
            .into_iter()
            .map(|node| node.id)
            .collect();
        assert_eq!(ids, vec!["fast", "slow", "unmeasured"]);
        assert_eq!(tracker.select_for_model("llama3").unwrap().id, "fast");
    }

    #[test]
    fn test_offline_nodes_are_not_candidates() {
        let tracker = tracker_with(&[("a", Some(5), &["llama3"])]);
        tracker.nodes.write().get_mut("a").unwrap().status = NodeStatus::Offline;

        match tracker.select_for_model("llama3") {
            Err(AppError::NoCapacity { model }) => assert_eq!(model, "llama3"),
            other => panic!("expected NoCapacity, got {other:?}"),
        }
    }
}
