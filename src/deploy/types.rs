//! Deployment Types
//!
//! Everything a deployment step needs travels in `DeployPayload`; no state
//! is kept between invocations.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::adapter::{ChangeSetStatus, Credentials, ExecutionStatus, StackRecord, StackStatus};
use crate::error::AdapterError;

/// Step of the per-network deployment state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeployAction {
    DescribeStack,
    CreateBootstrapStack,
    CreateChangeSet,
    DescribeChangeSet,
    ExecuteChangeSet,
    DescribeChangeSetExecution,
    Complete,
    ReportFailure,
}

impl DeployAction {
    pub fn is_terminal(self) -> bool {
        matches!(self, DeployAction::Complete | DeployAction::ReportFailure)
    }
}

impl std::fmt::Display for DeployAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// One network that needs endpoint infrastructure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentTarget {
    pub account: String,
    pub region: String,
    pub network_id: String,
    pub network_name: String,
    /// Deployed snapshot this target was emitted from
    pub snapshot_name: String,
    pub credentials: Credentials,
    pub role_pattern: String,
    /// Shared by every target of one run; seeds the provider idempotency tokens
    pub run_id: Uuid,
}

impl DeploymentTarget {
    /// Client request token for one kind of mutating call
    pub fn client_token(&self, call: &str) -> String {
        format!("carve-{}-{}", call, self.run_id.simple())
    }

    /// Changesets are named per run so concurrent runs never share one
    pub fn change_set_name(&self) -> String {
        format!("carve-{}", self.run_id)
    }
}

/// Payload handed back and forth between the scheduler and the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployPayload {
    pub target: DeploymentTarget,
    pub stack_name: String,
    #[serde(default)]
    pub stack_id: Option<String>,
    #[serde(default)]
    pub stack_status: Option<StackStatus>,
    /// Set once this run has created the bootstrap stack
    #[serde(default)]
    pub bootstrapped: bool,
    #[serde(default)]
    pub change_set_name: Option<String>,
    #[serde(default)]
    pub change_set_status: Option<ChangeSetStatus>,
    #[serde(default)]
    pub execution_status: Option<ExecutionStatus>,
    /// Action the scheduler should invoke next
    pub next: DeployAction,
    #[serde(default)]
    pub poll_attempts: u32,
    #[serde(default)]
    pub retries: u32,
    /// Last failed adapter call; cleared by the next successful step
    #[serde(default)]
    pub error: Option<AdapterError>,
    /// Why the branch ended in `ReportFailure`
    #[serde(default)]
    pub failure: Option<String>,
}

impl DeployPayload {
    pub fn new(target: DeploymentTarget, stack_name: String) -> Self {
        Self {
            target,
            stack_name,
            stack_id: None,
            stack_status: None,
            bootstrapped: false,
            change_set_name: None,
            change_set_status: None,
            execution_status: None,
            next: DeployAction::DescribeStack,
            poll_attempts: 0,
            retries: 0,
            error: None,
            failure: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.next.is_terminal()
    }

    /// The endpoint stack as last observed
    pub fn stack_record(&self) -> Option<StackRecord> {
        let id = self.stack_id.clone()?;
        let status = self.stack_status?;
        Some(StackRecord {
            name: self.stack_name.clone(),
            id,
            region: self.target.region.clone(),
            account: self.target.account.clone(),
            status,
        })
    }
}
