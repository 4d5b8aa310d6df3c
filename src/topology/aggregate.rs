//! Discovery aggregation
//!
//! Merges the per-account discovery snapshots into one organization graph.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::graph::NetworkGraph;
use crate::error::GraphError;

/// What to do when two accounts report the same network id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Keep the node from the later snapshot and record the conflict
    #[default]
    LastWriteWins,
    /// Fail the merge
    Reject,
}

/// A network id claimed by two different accounts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConflict {
    pub network_id: String,
    pub kept_account: String,
    pub dropped_account: String,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub graph: NetworkGraph,
    pub conflicts: Vec<NetworkConflict>,
}

/// Union the nodes and peerings of every snapshot.
///
/// Nodes are merged first so peerings that cross account snapshots resolve.
/// Re-reporting an id from the same account is not a conflict.
pub fn merge_snapshots(
    name: &str,
    snapshots: &[NetworkGraph],
    policy: ConflictPolicy,
) -> Result<MergeOutcome, GraphError> {
    let mut graph = NetworkGraph::new(name);
    let mut conflicts = Vec::new();

    for snapshot in snapshots {
        for node in snapshot.nodes() {
            if let Some(existing) = graph.node(&node.id) {
                if existing.account != node.account {
                    match policy {
                        ConflictPolicy::Reject => {
                            return Err(GraphError::DuplicateNetwork {
                                network_id: node.id.clone(),
                                first_account: existing.account.clone(),
                                second_account: node.account.clone(),
                            });
                        }
                        ConflictPolicy::LastWriteWins => {
                            warn!(
                                network = %node.id,
                                kept_account = %node.account,
                                dropped_account = %existing.account,
                                "Network reported by more than one account"
                            );
                            conflicts.push(NetworkConflict {
                                network_id: node.id.clone(),
                                kept_account: node.account.clone(),
                                dropped_account: existing.account.clone(),
                            });
                        }
                    }
                }
            }
            graph.add_node(node.clone());
        }
    }

    for snapshot in snapshots {
        for (key, attributes) in snapshot.edges() {
            graph.add_edge_with(key.first(), key.second(), attributes.clone())?;
        }
    }

    info!(
        snapshots = snapshots.len(),
        networks = graph.node_count(),
        peerings = graph.edge_count(),
        conflicts = conflicts.len(),
        "Merged discovery snapshots"
    );

    Ok(MergeOutcome { graph, conflicts })
}
