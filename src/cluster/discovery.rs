//! Feeding the membership tracker.
//!
//! Two sources run as scheduler tasks:
//! - a UDP listener receiving JSON [`ClusterMessage`] datagrams from nodes
//! - a prober for statically configured nodes, which turns a successful
//!   liveness probe into a heartbeat so nodes without a discovery agent stay
//!   routable

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::cluster::membership::MembershipTracker;
use crate::cluster::protocol::{ClusterMessage, MessageKind};
use crate::config::cluster::MAX_DATAGRAM_BYTES;
use crate::config::StaticNode;
use crate::error::Result;
use crate::reliability::{ScheduledTask, Scheduler};
use crate::upstream::Connector;

/// Bind the discovery socket and start the listener task.
///
/// Returns the task handle and the bound address.
pub async fn start_discovery(
    tracker: Arc<MembershipTracker>,
    bind_addr: &str,
    scheduler: &Scheduler,
) -> Result<(ScheduledTask, SocketAddr)> {
    let socket = UdpSocket::bind(bind_addr).await?;
    let local_addr = socket.local_addr()?;
    info!(addr = %local_addr, "Cluster discovery listening");

    let task = scheduler.spawn("cluster-discovery", move |token| async move {
        let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => match ClusterMessage::from_slice(&buf[..len]) {
                        Ok(message) => {
                            debug!(peer = %peer, node_id = %message.node_id, kind = ?message.kind, "Cluster message");
                            tracker.handle_message(&message);
                        }
                        Err(e) => warn!(peer = %peer, error = %e, "Ignoring malformed cluster message"),
                    },
                    Err(e) => warn!(error = %e, "Discovery socket receive failed"),
                },
            }
        }
        debug!("Cluster discovery stopped");
    });

    Ok((task, local_addr))
}

/// Probe statically configured nodes every `interval`, reporting each
/// successful probe as a heartbeat carrying the configured models.
pub fn start_static_prober<C: Connector>(
    tracker: Arc<MembershipTracker>,
    nodes: Vec<StaticNode>,
    connector: Arc<C>,
    interval: Duration,
    scheduler: &Scheduler,
) -> ScheduledTask {
    let nodes = Arc::new(nodes);
    scheduler.schedule_every("static-node-probe", interval, move || {
        let tracker = Arc::clone(&tracker);
        let nodes = Arc::clone(&nodes);
        let connector = Arc::clone(&connector);
        async move {
            probe_static_nodes(&tracker, &nodes, connector.as_ref()).await;
        }
    })
}

/// One probing round. Returns how many nodes answered.
pub async fn probe_static_nodes<C: Connector>(
    tracker: &MembershipTracker,
    nodes: &[StaticNode],
    connector: &C,
) -> usize {
    let mut alive = 0;
    for node in nodes {
        let id = tracker.add_static(node);
        let base_url = format!("http://{}:{}", node.host, node.port);
        let outcome = match connector.connect(&base_url).await {
            Ok(connection) => connector.probe(&connection).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => {
                alive += 1;
                tracker.handle_message(&ClusterMessage::new(
                    MessageKind::Heartbeat,
                    id,
                    json!({ "models": node.models }),
                ));
            }
            Err(e) => debug!(node_id = %id, error = %e, "Static node probe failed"),
        }
    }
    alive
}
