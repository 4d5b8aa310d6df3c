//! Error types for Carve
//!
//! Credential failures abort a whole run, adapter failures ride the step
//! payload back to the scheduler, and snapshot load failures force a fresh
//! discovery.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Topology invariants
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("peering {source_id} <-> {target_id} references unknown network {missing}")]
    UnknownNode {
        source_id: String,
        target_id: String,
        missing: String,
    },

    #[error("network {0} cannot be peered with itself")]
    SelfLoop(String),

    #[error("network {network_id} reported by both account {first_account} and account {second_account}")]
    DuplicateNetwork {
        network_id: String,
        first_account: String,
        second_account: String,
    },
}

/// A single cloud call that failed for one target.
///
/// Serializable so it can be attached to a step payload instead of aborting
/// sibling branches.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{operation} failed: {message}")]
pub struct AdapterError {
    pub operation: String,
    pub message: String,
}

impl AdapterError {
    pub fn new(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// One account that could not be assumed during a parallel broker call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialFailure {
    pub account: String,
    pub message: String,
}

/// Top level error taxonomy
#[derive(Debug, Error)]
pub enum CarveError {
    #[error("failed to assume role {role_arn}: {message}")]
    Credential { role_arn: String, message: String },

    #[error("credential acquisition failed for {} account(s): {}", failures.len(), summarize(failures))]
    CredentialBatch { failures: Vec<CredentialFailure> },

    #[error("role pattern {0} has no wildcard account segment (expected arn:<partition>:iam::*:role/<name>)")]
    InvalidRolePattern(String),

    #[error(transparent)]
    AdapterCall(#[from] AdapterError),

    #[error("failed to load snapshot {key}: {reason}")]
    SnapshotLoad { key: String, reason: String },

    #[error("refusing to delete {stack_name} in account {account}: name is on the safe allowlist")]
    ReconciliationViolation { account: String, stack_name: String },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CarveError {
    pub fn snapshot_load(key: impl Into<String>, reason: impl ToString) -> Self {
        Self::SnapshotLoad {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

fn summarize(failures: &[CredentialFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.account, f.message))
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T, E = CarveError> = std::result::Result<T, E>;
