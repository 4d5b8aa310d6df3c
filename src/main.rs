//! Carve CLI
//!
//! Local tooling over topology snapshot files.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use carve_engine::snapshot::{read_graph_file, write_graph_file};
use carve_engine::topology::{merge_snapshots, ConflictPolicy, NetworkDiff};

/// Carve - multi-account VPC endpoint topology tooling
#[derive(Parser, Debug)]
#[command(name = "carve", version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compare two snapshots in both directions
    Diff { left: PathBuf, right: PathBuf },

    /// List networks with no peerings
    Isolates { graph: PathBuf },

    /// Print the peering star around one network as node-link JSON
    Peers { graph: PathBuf, network: String },

    /// Merge per-account snapshots into one graph
    Merge {
        /// Output file; the merged graph is named after its stem
        out: PathBuf,

        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Fail when two accounts report the same network id
        #[arg(long, default_value = "false")]
        strict: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries command output, logs go to stderr
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .json()
        .init();

    let args = Args::parse();

    match args.command {
        Command::Diff { left, right } => {
            let left = read_graph_file(&left).context("Failed to load left snapshot")?;
            let right = read_graph_file(&right).context("Failed to load right snapshot")?;

            let diff = NetworkDiff::between(&left, &right);
            diff.log();
            println!("{}", diff);
        }
        Command::Isolates { graph } => {
            let graph = read_graph_file(&graph).context("Failed to load snapshot")?;
            for id in graph.isolates() {
                println!("{}", id);
            }
        }
        Command::Peers { graph, network } => {
            let graph = read_graph_file(&graph).context("Failed to load snapshot")?;
            if !graph.contains_node(&network) {
                bail!("network {} is not in {}", network, graph.name());
            }
            let star = graph.peer_subgraph(&network);
            println!("{}", star.to_json_pretty()?);
        }
        Command::Merge { out, inputs, strict } => {
            let snapshots = inputs
                .iter()
                .map(|path| {
                    read_graph_file(path).with_context(|| format!("Failed to load {}", path.display()))
                })
                .collect::<Result<Vec<_>>>()?;

            let name = out
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("carve-merged")
                .to_string();
            let policy = if strict {
                ConflictPolicy::Reject
            } else {
                ConflictPolicy::LastWriteWins
            };

            let merged = merge_snapshots(&name, &snapshots, policy).context("Merge failed")?;
            write_graph_file(&out, &merged.graph)
                .with_context(|| format!("Failed to write {}", out.display()))?;

            info!(
                out = %out.display(),
                networks = merged.graph.node_count(),
                peerings = merged.graph.edge_count(),
                conflicts = merged.conflicts.len(),
                "Wrote merged snapshot"
            );
        }
    }

    Ok(())
}
