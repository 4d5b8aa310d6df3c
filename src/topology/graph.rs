//! Network Topology Graph
//!
//! Undirected simple graph of VPCs (nodes) and peering connections (edges),
//! persisted as a node-link JSON document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{CarveError, GraphError};

/// Attributes not modelled explicitly, carried through untouched
pub type Attributes = BTreeMap<String, Value>;

/// A VPC discovered in one account and region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkNode {
    pub id: String,
    #[serde(rename = "Account")]
    pub account: String,
    #[serde(rename = "Region")]
    pub region: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    /// Internal address of the deployed endpoint
    #[serde(rename = "PrivateEndpoint", default, skip_serializing_if = "Option::is_none")]
    pub private_endpoint: Option<String>,
    #[serde(rename = "ApiGatewayUrl", default, skip_serializing_if = "Option::is_none")]
    pub api_gateway_url: Option<String>,
    #[serde(flatten)]
    pub extra: Attributes,
}

impl NetworkNode {
    pub fn new(
        id: impl Into<String>,
        account: impl Into<String>,
        region: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            account: account.into(),
            region: region.into(),
            name: name.into(),
            private_endpoint: None,
            api_gateway_url: None,
            extra: Attributes::new(),
        }
    }

    pub fn with_endpoint(mut self, private_endpoint: &str, api_gateway_url: &str) -> Self {
        self.private_endpoint = Some(private_endpoint.to_string());
        self.api_gateway_url = Some(api_gateway_url.to_string());
        self
    }
}

/// Unordered pair of network ids, stored smallest first
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EdgeKey(String, String);

impl EdgeKey {
    pub fn new(a: impl Into<String>, b: impl Into<String>) -> Self {
        let (a, b) = (a.into(), b.into());
        if a <= b {
            Self(a, b)
        } else {
            Self(b, a)
        }
    }

    pub fn first(&self) -> &str {
        &self.0
    }

    pub fn second(&self) -> &str {
        &self.1
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0 == id || self.1 == id
    }

    /// The endpoint that is not `id`
    pub fn other(&self, id: &str) -> Option<&str> {
        if self.0 == id {
            Some(&self.1)
        } else if self.1 == id {
            Some(&self.0)
        } else {
            None
        }
    }
}

impl std::fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} <-> {}", self.0, self.1)
    }
}

/// Graph level attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GraphMeta {
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "CreatedAt", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Attributes,
}

/// A peering link in the node-link document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeLink {
    pub source: String,
    pub target: String,
    #[serde(flatten)]
    pub attributes: Attributes,
}

/// Persisted form of a `NetworkGraph`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeLinkDocument {
    #[serde(default)]
    pub directed: bool,
    #[serde(default)]
    pub multigraph: bool,
    #[serde(default)]
    pub graph: GraphMeta,
    #[serde(default)]
    pub nodes: Vec<NetworkNode>,
    #[serde(default, alias = "edges")]
    pub links: Vec<NodeLink>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NetworkGraph {
    meta: GraphMeta,
    nodes: BTreeMap<String, NetworkNode>,
    edges: BTreeMap<EdgeKey, Attributes>,
}

impl NetworkGraph {
    /// Create an empty graph stamped with the current time
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            meta: GraphMeta {
                name: name.into(),
                created_at: Some(Utc::now()),
                extra: Attributes::new(),
            },
            nodes: BTreeMap::new(),
            edges: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.meta.name = name.into();
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.meta.created_at
    }

    pub fn meta(&self) -> &GraphMeta {
        &self.meta
    }

    /// Insert or replace a node, returning the node it replaced
    pub fn add_node(&mut self, node: NetworkNode) -> Option<NetworkNode> {
        self.nodes.insert(node.id.clone(), node)
    }

    /// Add a peering between two existing networks.
    ///
    /// Returns `false` when the pair was already peered.
    pub fn add_edge(&mut self, a: &str, b: &str) -> Result<bool, GraphError> {
        self.add_edge_with(a, b, Attributes::new())
    }

    pub fn add_edge_with(
        &mut self,
        a: &str,
        b: &str,
        attributes: Attributes,
    ) -> Result<bool, GraphError> {
        if a == b {
            return Err(GraphError::SelfLoop(a.to_string()));
        }
        for id in [a, b] {
            if !self.nodes.contains_key(id) {
                return Err(GraphError::UnknownNode {
                    source_id: a.to_string(),
                    target_id: b.to_string(),
                    missing: id.to_string(),
                });
            }
        }

        Ok(self.edges.insert(EdgeKey::new(a, b), attributes).is_none())
    }

    /// Remove a node and every peering that touches it
    pub fn remove_node(&mut self, id: &str) -> Option<NetworkNode> {
        let removed = self.nodes.remove(id)?;
        self.edges.retain(|key, _| !key.contains(id));
        Some(removed)
    }

    pub fn remove_edge(&mut self, a: &str, b: &str) -> bool {
        self.edges.remove(&EdgeKey::new(a, b)).is_some()
    }

    pub fn node(&self, id: &str) -> Option<&NetworkNode> {
        self.nodes.get(id)
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn contains_edge(&self, a: &str, b: &str) -> bool {
        self.edges.contains_key(&EdgeKey::new(a, b))
    }

    /// Nodes in id order
    pub fn nodes(&self) -> impl Iterator<Item = &NetworkNode> {
        self.nodes.values()
    }

    /// Edges in key order
    pub fn edges(&self) -> impl Iterator<Item = (&EdgeKey, &Attributes)> {
        self.edges.iter()
    }

    pub fn node_ids(&self) -> BTreeSet<&str> {
        self.nodes.keys().map(String::as_str).collect()
    }

    pub fn edge_keys(&self) -> BTreeSet<&EdgeKey> {
        self.edges.keys().collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn degree(&self, id: &str) -> usize {
        self.edges.keys().filter(|key| key.contains(id)).count()
    }

    /// Networks peered with `id`, sorted
    pub fn peers_of(&self, id: &str) -> Vec<&str> {
        self.edges.keys().filter_map(|key| key.other(id)).collect()
    }

    /// Networks without any peering, sorted
    pub fn isolates(&self) -> Vec<&str> {
        let connected: BTreeSet<&str> = self
            .edges
            .keys()
            .flat_map(|key| [key.first(), key.second()])
            .collect();

        self.nodes
            .keys()
            .map(String::as_str)
            .filter(|id| !connected.contains(id))
            .collect()
    }

    /// Drop every isolated node, returning how many were removed
    pub fn remove_isolates(&mut self) -> usize {
        let isolated: Vec<String> = self.isolates().into_iter().map(str::to_string).collect();
        for id in &isolated {
            self.nodes.remove(id);
        }
        isolated.len()
    }

    /// The star around `id`: only peerings that touch it, then isolates pruned.
    ///
    /// A network with no peers yields an empty graph.
    pub fn peer_subgraph(&self, id: &str) -> NetworkGraph {
        let mut sub = self.clone();
        sub.edges.retain(|key, _| key.contains(id));
        sub.remove_isolates();
        sub
    }

    /// Unique owning accounts
    pub fn accounts(&self) -> BTreeSet<&str> {
        self.nodes.values().map(|n| n.account.as_str()).collect()
    }

    /// Unique regions with at least one network
    pub fn regions(&self) -> BTreeSet<&str> {
        self.nodes.values().map(|n| n.region.as_str()).collect()
    }

    pub fn to_node_link(&self) -> NodeLinkDocument {
        NodeLinkDocument {
            directed: false,
            multigraph: false,
            graph: self.meta.clone(),
            nodes: self.nodes.values().cloned().collect(),
            links: self
                .edges
                .iter()
                .map(|(key, attributes)| NodeLink {
                    source: key.first().to_string(),
                    target: key.second().to_string(),
                    attributes: attributes.clone(),
                })
                .collect(),
        }
    }

    /// Rebuild a graph, enforcing the simple-graph invariants
    pub fn from_node_link(doc: NodeLinkDocument) -> Result<Self, GraphError> {
        let mut graph = Self {
            meta: doc.graph,
            nodes: BTreeMap::new(),
            edges: BTreeMap::new(),
        };

        for node in doc.nodes {
            graph.add_node(node);
        }
        for link in doc.links {
            graph.add_edge_with(&link.source, &link.target, link.attributes)?;
        }

        Ok(graph)
    }

    pub fn to_json(&self) -> Result<String, CarveError> {
        Ok(serde_json::to_string(&self.to_node_link())?)
    }

    pub fn to_json_pretty(&self) -> Result<String, CarveError> {
        Ok(serde_json::to_string_pretty(&self.to_node_link())?)
    }

    pub fn from_json(json: &str) -> Result<Self, CarveError> {
        let doc: NodeLinkDocument = serde_json::from_str(json)?;
        Ok(Self::from_node_link(doc)?)
    }
}
