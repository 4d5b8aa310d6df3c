//! Safe-delete allowlist
//!
//! Names of managed stacks that back something in the deployed snapshot.
//! Cleanup may only delete a discovered stack whose name is absent from
//! its account's set.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::adapter::StackRecord;
use crate::config::CarveConfig;
use crate::error::Result;
use crate::topology::NetworkGraph;

/// account id -> protected stack names
pub type SafeAllowlist = BTreeMap<String, BTreeSet<String>>;

/// Per-account unit of cleanup work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupTask {
    pub account: String,
    pub safe_stack_names: BTreeSet<String>,
}

/// Build the allowlist for every organization account.
///
/// The hub account keeps one shared private link stack per region used by
/// the graph; each network's owning account keeps its endpoint stack.
/// Fails when no hub account is configured.
pub fn build_safe_allowlist<'a, I>(
    graph: &NetworkGraph,
    org_accounts: I,
    config: &CarveConfig,
) -> Result<SafeAllowlist>
where
    I: IntoIterator<Item = &'a str>,
{
    let hub = config.require_hub_account()?;
    let mut allowlist: SafeAllowlist = org_accounts
        .into_iter()
        .map(|account| (account.to_string(), BTreeSet::new()))
        .collect();

    for region in graph.regions() {
        allowlist
            .entry(hub.to_string())
            .or_default()
            .insert(config.privatelink_stack_name(region));
    }

    for node in graph.nodes() {
        allowlist
            .entry(node.account.clone())
            .or_default()
            .insert(config.endpoint_stack_name(&node.id));
    }

    Ok(allowlist)
}

pub fn cleanup_tasks(allowlist: &SafeAllowlist) -> Vec<CleanupTask> {
    allowlist
        .iter()
        .map(|(account, names)| CleanupTask {
            account: account.clone(),
            safe_stack_names: names.clone(),
        })
        .collect()
}

pub fn is_protected(allowlist: &SafeAllowlist, account: &str, stack_name: &str) -> bool {
    allowlist
        .get(account)
        .map(|names| names.contains(stack_name))
        .unwrap_or(false)
}

/// Discovered stacks that are not on their account's allowlist
pub fn compute_deletion_set(discovered: &[StackRecord], allowlist: &SafeAllowlist) -> Vec<StackRecord> {
    let mut deletions: Vec<StackRecord> = discovered
        .iter()
        .filter(|record| !is_protected(allowlist, &record.account, &record.name))
        .cloned()
        .collect();
    deletions.sort_by(|a, b| {
        (&a.account, &a.region, &a.name).cmp(&(&b.account, &b.region, &b.name))
    });
    deletions
}
