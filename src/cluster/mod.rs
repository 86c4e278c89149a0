//! Cluster membership: which inference nodes exist, what they serve, and
//! whether they are reachable.

pub mod discovery;
pub mod membership;
pub mod node;
pub mod protocol;
pub mod selection;

pub use discovery::{probe_static_nodes, start_discovery, start_static_prober};
pub use membership::{ClusterStats, MembershipConfig, MembershipEvent, MembershipTracker};
pub use node::{Node, NodeResources, NodeStatus};
pub use protocol::{ClusterMessage, MessageKind, NodePayload};
