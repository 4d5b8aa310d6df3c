//! Network Topology
//!
//! The organization-wide graph of VPCs and peering connections that every
//! deployment and cleanup run is driven from.
//!
//! - **graph**: `NetworkGraph` and its node-link document
//! - **diff**: presence/absence comparison between snapshots
//! - **aggregate**: merge per-account discovery snapshots

mod aggregate;
mod diff;
mod graph;

pub use aggregate::{merge_snapshots, ConflictPolicy, MergeOutcome, NetworkConflict};
pub use diff::{diff_edges, diff_nodes, NetworkDiff};
pub use graph::{
    Attributes, EdgeKey, GraphMeta, NetworkGraph, NetworkNode, NodeLink, NodeLinkDocument,
};
