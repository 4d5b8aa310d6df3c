//! Snapshot differ
//!
//! Presence/absence comparison of networks and peerings between two
//! snapshots. Attribute changes on elements present in both are ignored.

use std::fmt;
use tracing::warn;

use super::graph::{EdgeKey, NetworkGraph, NetworkNode};

/// Networks present in `a` but absent from `b`, sorted by id
pub fn diff_nodes<'a>(a: &'a NetworkGraph, b: &NetworkGraph) -> Vec<&'a NetworkNode> {
    a.nodes().filter(|n| !b.contains_node(&n.id)).collect()
}

/// Peerings present in `a` but absent from `b`, sorted by endpoint ids
pub fn diff_edges<'a>(a: &'a NetworkGraph, b: &NetworkGraph) -> Vec<&'a EdgeKey> {
    a.edges()
        .map(|(key, _)| key)
        .filter(|key| !b.contains_edge(key.first(), key.second()))
        .collect()
}

/// Both directions of a snapshot comparison
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkDiff {
    pub left_name: String,
    pub right_name: String,
    pub only_in_left: Vec<NetworkNode>,
    pub only_in_right: Vec<NetworkNode>,
    pub peerings_only_in_left: Vec<EdgeKey>,
    pub peerings_only_in_right: Vec<EdgeKey>,
}

impl NetworkDiff {
    pub fn between(left: &NetworkGraph, right: &NetworkGraph) -> Self {
        Self {
            left_name: left.name().to_string(),
            right_name: right.name().to_string(),
            only_in_left: diff_nodes(left, right).into_iter().cloned().collect(),
            only_in_right: diff_nodes(right, left).into_iter().cloned().collect(),
            peerings_only_in_left: diff_edges(left, right).into_iter().cloned().collect(),
            peerings_only_in_right: diff_edges(right, left).into_iter().cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.only_in_left.is_empty()
            && self.only_in_right.is_empty()
            && self.peerings_only_in_left.is_empty()
            && self.peerings_only_in_right.is_empty()
    }

    /// Emit one warning per difference
    pub fn log(&self) {
        for (present, absent, nodes) in [
            (&self.left_name, &self.right_name, &self.only_in_left),
            (&self.right_name, &self.left_name, &self.only_in_right),
        ] {
            for node in nodes {
                warn!(
                    network = %node.id,
                    account = %node.account,
                    region = %node.region,
                    present_in = %present,
                    absent_from = %absent,
                    "VPC difference detected"
                );
            }
        }

        for (present, absent, edges) in [
            (&self.left_name, &self.right_name, &self.peerings_only_in_left),
            (&self.right_name, &self.left_name, &self.peerings_only_in_right),
        ] {
            for edge in edges {
                warn!(
                    peering = %edge,
                    present_in = %present,
                    absent_from = %absent,
                    "Peering difference detected"
                );
            }
        }
    }
}

impl fmt::Display for NetworkDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "'{}' and '{}' are identical", self.left_name, self.right_name);
        }

        for (present, absent, nodes) in [
            (&self.left_name, &self.right_name, &self.only_in_left),
            (&self.right_name, &self.left_name, &self.only_in_right),
        ] {
            for node in nodes {
                writeln!(
                    f,
                    "VPC {} ({} / {} / {}) in '{}' but not in '{}'",
                    node.id, node.name, node.account, node.region, present, absent
                )?;
            }
        }

        for (present, absent, edges) in [
            (&self.left_name, &self.right_name, &self.peerings_only_in_left),
            (&self.right_name, &self.left_name, &self.peerings_only_in_right),
        ] {
            for edge in edges {
                writeln!(f, "peering {} in '{}' but not in '{}'", edge, present, absent)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn graph(name: &str, nodes: &[&str], edges: &[(&str, &str)]) -> NetworkGraph {
        let mut g = NetworkGraph::new(name);
        for id in nodes {
            g.add_node(NetworkNode::new(*id, "111", "us-east-1", *id));
        }
        for (a, b) in edges {
            g.add_edge(a, b).unwrap();
        }
        g
    }

    #[test]
    fn test_diff_nodes_is_one_directional() {
        let a = graph("a", &["vpc-1", "vpc-2", "vpc-3"], &[]);
        let b = graph("b", &["vpc-2", "vpc-4"], &[]);

        let ids = |v: Vec<&NetworkNode>| v.into_iter().map(|n| n.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(diff_nodes(&a, &b)), vec!["vpc-1", "vpc-3"]);
        assert_eq!(ids(diff_nodes(&b, &a)), vec!["vpc-4"]);
    }

    #[test]
    fn test_union_of_both_directions_is_symmetric_difference() {
        let cases = [
            (vec!["x", "y", "z"], vec!["y", "w"]),
            (vec!["x"], vec!["x"]),
            (vec![], vec!["q"]),
            (vec!["m", "n"], vec![]),
        ];

        for (left, right) in cases {
            let a = graph("a", &left, &[]);
            let b = graph("b", &right, &[]);

            let union: BTreeSet<&str> = diff_nodes(&a, &b)
                .into_iter()
                .chain(diff_nodes(&b, &a))
                .map(|n| n.id.as_str())
                .collect();
            let expected: BTreeSet<&str> = a
                .node_ids()
                .symmetric_difference(&b.node_ids())
                .copied()
                .collect();

            assert_eq!(union, expected);
            assert_eq!(union.is_empty(), a.node_ids() == b.node_ids());
        }
    }

    #[test]
    fn test_diff_edges_compares_unordered_pairs() {
        let a = graph("a", &["vpc-1", "vpc-2", "vpc-3"], &[("vpc-2", "vpc-1"), ("vpc-1", "vpc-3")]);
        let b = graph("b", &["vpc-1", "vpc-2", "vpc-3"], &[("vpc-1", "vpc-2")]);

        let only_a = diff_edges(&a, &b);
        assert_eq!(only_a, vec![&EdgeKey::new("vpc-1", "vpc-3")]);
        assert!(diff_edges(&b, &a).is_empty());
    }

    #[test]
    fn test_attribute_changes_are_ignored() {
        let a = graph("a", &["vpc-1"], &[]);
        let mut b = NetworkGraph::new("b");
        b.add_node(NetworkNode::new("vpc-1", "999", "eu-west-1", "renamed"));

        assert!(NetworkDiff::between(&a, &b).is_empty());
    }

    #[test]
    fn test_network_diff_report() {
        let a = graph("old", &["vpc-1", "vpc-2"], &[("vpc-1", "vpc-2")]);
        let b = graph("new", &["vpc-2", "vpc-3"], &[("vpc-2", "vpc-3")]);

        let diff = NetworkDiff::between(&a, &b);
        assert!(!diff.is_empty());
        assert_eq!(diff.only_in_left[0].id, "vpc-1");
        assert_eq!(diff.only_in_right[0].id, "vpc-3");
        assert_eq!(diff.peerings_only_in_left, vec![EdgeKey::new("vpc-1", "vpc-2")]);
        assert_eq!(diff.peerings_only_in_right, vec![EdgeKey::new("vpc-2", "vpc-3")]);

        let report = diff.to_string();
        assert!(report.contains("VPC vpc-1"));
        assert!(report.contains("peering vpc-2 <-> vpc-3 in 'new' but not in 'old'"));
    }
}
