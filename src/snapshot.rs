//! Snapshot persistence
//!
//! Topology snapshots are node-link JSON documents in Carve's object store.
//! Keys embed a unix timestamp (`carve-discovered-1700000000.json`) so the
//! newest snapshot under a prefix can be found without reading them all.
//! Once written, a snapshot is never modified.

use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::adapter::ObjectStore;
use crate::config::CarveConfig;
use crate::error::{CarveError, Result};
use crate::topology::{merge_snapshots, ConflictPolicy, NetworkGraph};

pub struct SnapshotStore {
    store: Arc<dyn ObjectStore>,
    config: Arc<CarveConfig>,
}

impl SnapshotStore {
    pub fn new(store: Arc<dyn ObjectStore>, config: Arc<CarveConfig>) -> Self {
        Self { store, config }
    }

    pub fn discovered_key(&self, name: &str) -> String {
        format!("{}{}.json", self.config.discovered_prefix, name)
    }

    pub fn deployed_key(&self, name: &str) -> String {
        format!("{}{}.json", self.config.deployed_prefix, name)
    }

    /// Persist an aggregated discovery result, returning its key
    pub async fn save_discovered(&self, graph: &NetworkGraph) -> Result<String> {
        let key = self.discovered_key(graph.name());
        self.put_graph(&key, graph).await?;
        Ok(key)
    }

    /// Persist `graph` as the snapshot a deployment run is driven from.
    ///
    /// The stored copy is renamed `<name>-deployed-<ts>`, `ts` in unix
    /// milliseconds and strictly above every existing deployed snapshot's, so
    /// `latest_deployed` always finds this one. The renamed graph is returned
    /// along with its key.
    pub async fn save_deployed(&self, graph: &NetworkGraph) -> Result<(String, NetworkGraph)> {
        let base = if graph.name().is_empty() {
            "carve"
        } else {
            graph.name()
        };
        let mut ts = Utc::now().timestamp_millis();
        if let Some(newest) = self.latest_deployed().await?.as_deref().and_then(key_timestamp) {
            ts = ts.max(newest.saturating_add(1));
        }
        let mut deployed = graph.clone();
        deployed.set_name(format!("{}-deployed-{}", base, ts));

        let key = self.deployed_key(deployed.name());
        self.put_graph(&key, &deployed).await?;
        Ok((key, deployed))
    }

    /// Per-account snapshot written by a discovery worker
    pub async fn save_account_discovery(&self, account: &str, graph: &NetworkGraph) -> Result<String> {
        let key = format!("{}{}.json", self.config.discovery_prefix, account);
        self.put_graph(&key, graph).await?;
        Ok(key)
    }

    /// Load and validate a snapshot.
    ///
    /// A missing key, unreadable JSON or a dangling peering are all
    /// `SnapshotLoad`; an unreadable snapshot is never an empty graph.
    pub async fn load(&self, key: &str) -> Result<NetworkGraph> {
        let body = self
            .store
            .get(key)
            .await
            .map_err(|e| CarveError::snapshot_load(key, e))?
            .ok_or_else(|| CarveError::snapshot_load(key, "no such key"))?;

        let text = String::from_utf8(body).map_err(|e| CarveError::snapshot_load(key, e))?;
        let mut graph =
            NetworkGraph::from_json(&text).map_err(|e| CarveError::snapshot_load(key, e))?;
        if graph.name().is_empty() {
            graph.set_name(key_stem(key));
        }
        Ok(graph)
    }

    /// Key of the newest snapshot under `prefix`
    pub async fn latest(&self, prefix: &str) -> Result<Option<String>> {
        let keys = self.store.list(prefix).await?;
        Ok(keys
            .into_iter()
            .filter(|k| k.ends_with(".json"))
            .filter_map(|k| key_timestamp(&k).map(|ts| (ts, k)))
            .max()
            .map(|(_, k)| k))
    }

    /// Newest deployed snapshot, if any deployment has run
    pub async fn latest_deployed(&self) -> Result<Option<String>> {
        let prefix = self.config.deployed_prefix.clone();
        self.latest(&prefix).await
    }

    /// Load `key`, or fall back to a fresh discovery when it cannot be read
    pub async fn load_or_else<F, Fut>(&self, key: &str, fallback: F) -> Result<NetworkGraph>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<NetworkGraph>>,
    {
        match self.load(key).await {
            Ok(graph) => Ok(graph),
            Err(err @ CarveError::SnapshotLoad { .. }) => {
                warn!(key = %key, error = %err, "Snapshot unusable, running fresh discovery");
                fallback().await
            }
            Err(err) => Err(err),
        }
    }

    async fn put_graph(&self, key: &str, graph: &NetworkGraph) -> Result<()> {
        let body = graph.to_json()?;
        self.store.put(key, body.into_bytes()).await?;
        info!(
            key = %key,
            networks = graph.node_count(),
            peerings = graph.edge_count(),
            "Saved topology snapshot"
        );
        Ok(())
    }
}

/// Merge every per-account discovery snapshot into `carve-discovered-<ms>`
/// and persist it. Returns the key of the merged snapshot.
pub async fn finalize_discovery(
    snapshots: &SnapshotStore,
    policy: ConflictPolicy,
) -> Result<String> {
    let prefix = snapshots.config.discovery_prefix.clone();
    let keys = snapshots.store.list(&prefix).await?;
    info!(accounts = keys.len(), "Finalizing discovery");

    let mut accounts = Vec::with_capacity(keys.len());
    for key in &keys {
        accounts.push(snapshots.load(key).await?);
    }

    let name = format!("carve-discovered-{}", Utc::now().timestamp_millis());
    let merged = merge_snapshots(&name, &accounts, policy)?;
    snapshots.save_discovered(&merged.graph).await
}

/// Read a node-link snapshot from disk. The graph is named after the file
/// stem when the document carries no name.
pub fn read_graph_file(path: &Path) -> Result<NetworkGraph> {
    let display = path.display().to_string();
    let text = std::fs::read_to_string(path).map_err(|e| CarveError::snapshot_load(&display, e))?;
    let mut graph =
        NetworkGraph::from_json(&text).map_err(|e| CarveError::snapshot_load(&display, e))?;

    if graph.name().is_empty() {
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            graph.set_name(stem);
        }
    }
    Ok(graph)
}

pub fn write_graph_file(path: &Path, graph: &NetworkGraph) -> Result<()> {
    let json = graph.to_json_pretty()?;
    std::fs::write(path, json).map_err(|e| CarveError::snapshot_load(path.display().to_string(), e))
}

fn key_stem(key: &str) -> String {
    let file = key.rsplit('/').next().unwrap_or(key);
    file.strip_suffix(".json").unwrap_or(file).to_string()
}

/// Trailing `-<digits>` of the key's file stem
fn key_timestamp(key: &str) -> Option<i64> {
    key_stem(key).rsplit('-').next()?.parse().ok()
}
