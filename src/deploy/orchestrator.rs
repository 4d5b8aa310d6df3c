//! Deployment Orchestrator
//!
//! Drives one network's endpoint stack through
//! describe -> (bootstrap) -> changeset -> execute, one step per invocation.
//! Each step is a function of the incoming payload and the result of a
//! single adapter call.

use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::types::{DeployAction, DeployPayload, DeploymentTarget};
use crate::adapter::{
    ChangeSetRequest, ChangeSetStatus, CloudAdapter, ExecutionStatus, ObjectStore, Parameter,
    StackRequest, Tag,
};
use crate::config::CarveConfig;
use crate::credentials::CredentialBroker;
use crate::error::{AdapterError, Result};
use crate::snapshot::SnapshotStore;

/// Tag keys the provider reserves for itself
const RESERVED_TAG_PREFIX: &str = "aws:";

pub struct DeploymentOrchestrator {
    adapter: Arc<dyn CloudAdapter>,
    snapshots: SnapshotStore,
    broker: CredentialBroker,
    config: Arc<CarveConfig>,
    tags: OnceCell<Vec<Tag>>,
}

impl DeploymentOrchestrator {
    pub fn new(
        adapter: Arc<dyn CloudAdapter>,
        store: Arc<dyn ObjectStore>,
        config: Arc<CarveConfig>,
    ) -> Self {
        Self {
            broker: CredentialBroker::new(adapter.clone(), &config),
            snapshots: SnapshotStore::new(store, config.clone()),
            adapter,
            config,
            tags: OnceCell::new(),
        }
    }

    /// Begin a deployment from the discovered snapshot at `graph_key`.
    ///
    /// Persists the snapshot as deployed, assumes `role` (or the default
    /// Carve role) in every owning account, and returns one payload per
    /// network for the scheduler to fan out.
    pub async fn start_deployment(
        &self,
        graph_key: &str,
        role: Option<&str>,
    ) -> Result<Vec<DeployPayload>> {
        let graph = self.snapshots.load(graph_key).await?;
        let (deployed_key, deployed) = self.snapshots.save_deployed(&graph).await?;

        let role_pattern = role
            .map(str::to_string)
            .unwrap_or_else(|| self.config.role_pattern());
        let sessions = self
            .broker
            .parallel_assume(deployed.accounts(), &role_pattern)
            .await?;

        let run_id = Uuid::new_v4();
        let mut payloads = Vec::with_capacity(deployed.node_count());
        for node in deployed.nodes() {
            // parallel_assume succeeded for every owning account
            let Some(credentials) = sessions.get(&node.account) else {
                continue;
            };
            let target = DeploymentTarget {
                account: node.account.clone(),
                region: node.region.clone(),
                network_id: node.id.clone(),
                network_name: node.name.clone(),
                snapshot_name: deployed.name().to_string(),
                credentials: credentials.clone(),
                role_pattern: role_pattern.clone(),
                run_id,
            };
            let stack_name = self.config.endpoint_stack_name(&node.id);
            payloads.push(DeployPayload::new(target, stack_name));
        }

        info!(
            snapshot = %deployed_key,
            run_id = %run_id,
            targets = payloads.len(),
            "Deployment started"
        );
        Ok(payloads)
    }

    /// Run a single step
    pub async fn step(&self, action: DeployAction, mut payload: DeployPayload) -> DeployPayload {
        let outcome = match action {
            DeployAction::DescribeStack => self.describe_stack(&mut payload).await,
            DeployAction::CreateBootstrapStack => self.create_bootstrap_stack(&mut payload).await,
            DeployAction::CreateChangeSet => self.create_change_set(&mut payload).await,
            DeployAction::DescribeChangeSet => self.describe_change_set(&mut payload).await,
            DeployAction::ExecuteChangeSet => self.execute_change_set(&mut payload).await,
            DeployAction::DescribeChangeSetExecution => {
                self.describe_execution(&mut payload).await
            }
            DeployAction::Complete | DeployAction::ReportFailure => return payload,
        };

        match outcome {
            Ok(()) => {
                payload.error = None;
                // a describe that leads back to create is not progress
                if payload.next != DeployAction::CreateBootstrapStack {
                    payload.retries = 0;
                }
            }
            Err(e) => self.record_error(action, &mut payload, e),
        }
        payload
    }

    /// Step a payload until it reaches a terminal action
    pub async fn drive(&self, mut payload: DeployPayload) -> DeployPayload {
        while !payload.is_finished() {
            let action = payload.next;
            payload = self.step(action, payload).await;
        }
        payload
    }

    async fn describe_stack(&self, payload: &mut DeployPayload) -> std::result::Result<(), AdapterError> {
        let target = &payload.target;
        let found = self
            .adapter
            .describe_stack(&payload.stack_name, &target.region, &target.credentials)
            .await?;

        match found {
            None if payload.bootstrapped => {
                // created but not yet visible
                self.poll(payload, DeployAction::DescribeStack);
            }
            None => {
                payload.stack_status = None;
                payload.next = DeployAction::CreateBootstrapStack;
            }
            Some(stack) => {
                payload.stack_id = Some(stack.stack_id);
                payload.stack_status = Some(stack.status);

                if stack.status.is_in_progress() {
                    self.poll(payload, DeployAction::DescribeStack);
                } else if stack.status.is_ready() {
                    payload.poll_attempts = 0;
                    payload.next = DeployAction::CreateChangeSet;
                } else {
                    let reason = stack
                        .status_reason
                        .map(|r| format!(": {}", r))
                        .unwrap_or_default();
                    fail(payload, format!("stack is {}{}", stack.status, reason));
                }
            }
        }
        Ok(())
    }

    async fn create_bootstrap_stack(
        &self,
        payload: &mut DeployPayload,
    ) -> std::result::Result<(), AdapterError> {
        // never create over a stack that has been observed
        if payload.stack_status.is_some() {
            warn!(stack = %payload.stack_name, "Stack already exists, skipping bootstrap");
            payload.next = DeployAction::DescribeStack;
            return Ok(());
        }

        let target = &payload.target;
        let request = StackRequest {
            stack_name: payload.stack_name.clone(),
            region: target.region.clone(),
            template_url: self.config.bootstrap_template_url(),
            parameters: vec![
                Parameter::new("OrganizationsId", &self.config.organization_id),
                Parameter::new("VpcName", &target.network_name),
            ],
            tags: self.deployment_tags().await?,
            client_token: Some(target.client_token("bootstrap")),
        };
        let stack_id = self.adapter.create_stack(&request, &target.credentials).await?;

        info!(
            account = %target.account,
            region = %target.region,
            stack = %payload.stack_name,
            "Created bootstrap stack"
        );
        payload.stack_id = Some(stack_id);
        payload.bootstrapped = true;
        payload.poll_attempts = 0;
        payload.next = DeployAction::DescribeStack;
        Ok(())
    }

    async fn create_change_set(&self, payload: &mut DeployPayload) -> std::result::Result<(), AdapterError> {
        let target = &payload.target;
        let change_set_name = target.change_set_name();
        let request = ChangeSetRequest {
            stack_name: payload.stack_name.clone(),
            change_set_name: change_set_name.clone(),
            region: target.region.clone(),
            template_url: self.config.endpoint_template_url(),
            parameters: vec![
                Parameter::new("OrganizationsId", &self.config.organization_id),
                Parameter::new("VpcId", &target.network_id),
            ],
            tags: self.deployment_tags().await?,
            client_token: Some(target.client_token("changeset")),
        };
        self.adapter.create_change_set(&request, &target.credentials).await?;

        payload.change_set_name = Some(change_set_name);
        payload.change_set_status = None;
        payload.poll_attempts = 0;
        payload.next = DeployAction::DescribeChangeSet;
        Ok(())
    }

    async fn describe_change_set(&self, payload: &mut DeployPayload) -> std::result::Result<(), AdapterError> {
        let Some(change_set_name) = payload.change_set_name.clone() else {
            payload.next = DeployAction::CreateChangeSet;
            return Ok(());
        };
        let target = &payload.target;
        let description = self
            .adapter
            .describe_change_set(&payload.stack_name, &change_set_name, &target.region, &target.credentials)
            .await?;

        payload.change_set_status = Some(description.status);
        payload.execution_status = Some(description.execution_status);

        if description.has_no_changes() {
            info!(stack = %payload.stack_name, "No changes to deploy");
            payload.next = DeployAction::Complete;
            return Ok(());
        }

        match description.status {
            ChangeSetStatus::CreatePending | ChangeSetStatus::CreateInProgress => {
                self.poll(payload, DeployAction::DescribeChangeSet);
            }
            ChangeSetStatus::CreateComplete
                if description.execution_status == ExecutionStatus::Available =>
            {
                payload.poll_attempts = 0;
                payload.next = DeployAction::ExecuteChangeSet;
            }
            status => {
                let reason = description.status_reason.unwrap_or_default();
                fail(payload, format!("changeset {:?}: {}", status, reason));
            }
        }
        Ok(())
    }

    async fn execute_change_set(&self, payload: &mut DeployPayload) -> std::result::Result<(), AdapterError> {
        let Some(change_set_name) = payload.change_set_name.clone() else {
            payload.next = DeployAction::CreateChangeSet;
            return Ok(());
        };
        let target = &payload.target;
        let token = target.client_token("execute");
        self.adapter
            .execute_change_set(
                &payload.stack_name,
                &change_set_name,
                &target.region,
                Some(token.as_str()),
                &target.credentials,
            )
            .await?;

        info!(
            account = %target.account,
            region = %target.region,
            stack = %payload.stack_name,
            change_set = %change_set_name,
            "Executing changeset"
        );
        payload.poll_attempts = 0;
        payload.next = DeployAction::DescribeChangeSetExecution;
        Ok(())
    }

    async fn describe_execution(&self, payload: &mut DeployPayload) -> std::result::Result<(), AdapterError> {
        let Some(change_set_name) = payload.change_set_name.clone() else {
            payload.next = DeployAction::CreateChangeSet;
            return Ok(());
        };
        let target = &payload.target;
        let description = self
            .adapter
            .describe_change_set(&payload.stack_name, &change_set_name, &target.region, &target.credentials)
            .await?;

        payload.execution_status = Some(description.execution_status);
        match description.execution_status {
            ExecutionStatus::ExecuteComplete => {
                info!(
                    account = %payload.target.account,
                    region = %payload.target.region,
                    stack = %payload.stack_name,
                    "Endpoint deployed"
                );
                payload.next = DeployAction::Complete;
            }
            ExecutionStatus::ExecuteFailed | ExecutionStatus::Obsolete => {
                let reason = description.status_reason.unwrap_or_default();
                fail(
                    payload,
                    format!("changeset execution {:?}: {}", description.execution_status, reason),
                );
            }
            _ => self.poll(payload, DeployAction::DescribeChangeSetExecution),
        }
        Ok(())
    }

    /// Stack tags for this orchestrator, fetched once
    async fn deployment_tags(&self) -> std::result::Result<Vec<Tag>, AdapterError> {
        let tags = self
            .tags
            .get_or_try_init(|| async {
                let tags = self.adapter.deployment_tags().await?;
                Ok::<_, AdapterError>(
                    tags.into_iter()
                        .filter(|t| !t.key.starts_with(RESERVED_TAG_PREFIX))
                        .collect(),
                )
            })
            .await?;
        Ok(tags.clone())
    }

    /// Re-enter `action` on the next invocation, up to the poll limit
    fn poll(&self, payload: &mut DeployPayload, action: DeployAction) {
        payload.poll_attempts += 1;
        if payload.poll_attempts > self.config.max_poll_attempts {
            fail(
                payload,
                format!("{} still pending after {} polls", action, self.config.max_poll_attempts),
            );
        } else {
            payload.next = action;
        }
    }

    /// Route the branch back for another attempt, until retries run out
    fn record_error(&self, action: DeployAction, payload: &mut DeployPayload, e: AdapterError) {
        payload.retries += 1;
        warn!(
            account = %payload.target.account,
            region = %payload.target.region,
            stack = %payload.stack_name,
            action = %action,
            attempt = payload.retries,
            error = %e,
            "Deployment step failed"
        );
        if payload.retries > self.config.max_step_retries {
            fail(payload, e.to_string());
        } else {
            payload.next = retry_action(action);
        }
        payload.error = Some(e);
    }
}

/// Step to re-enter after `action` failed.
///
/// A failed create may still have landed, or lost a race with another run,
/// so the stack is described again before any further create.
fn retry_action(action: DeployAction) -> DeployAction {
    match action {
        DeployAction::CreateBootstrapStack => DeployAction::DescribeStack,
        other => other,
    }
}

fn fail(payload: &mut DeployPayload, reason: String) {
    error!(
        account = %payload.target.account,
        region = %payload.target.region,
        stack = %payload.stack_name,
        reason = %reason,
        "Deployment failed"
    );
    payload.failure = Some(reason);
    payload.next = DeployAction::ReportFailure;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::memory::InMemoryCloud;
    use crate::adapter::StackStatus;
    use crate::topology::{NetworkGraph, NetworkNode};

    const GRAPH_KEY: &str = "discovered/carve-discovered-100.json";

    fn config() -> CarveConfig {
        CarveConfig {
            organization_id: "o-abc".to_string(),
            template_bucket: "carve-templates".to_string(),
            max_poll_attempts: 5,
            max_step_retries: 2,
            ..CarveConfig::default()
        }
    }

    async fn setup(config: CarveConfig) -> (Arc<InMemoryCloud>, DeploymentOrchestrator) {
        let cloud = Arc::new(InMemoryCloud::new());
        let mut graph = NetworkGraph::new("carve-discovered-100");
        graph.add_node(NetworkNode::new("vpc-a", "111", "us-east-1", "alpha"));
        graph.add_node(NetworkNode::new("vpc-b", "222", "us-west-2", "bravo"));
        graph.add_edge("vpc-a", "vpc-b").unwrap();
        cloud
            .put(GRAPH_KEY, graph.to_json().unwrap().into_bytes())
            .await
            .unwrap();

        let orchestrator = DeploymentOrchestrator::new(cloud.clone(), cloud.clone(), Arc::new(config));
        (cloud, orchestrator)
    }

    async fn first_target(orchestrator: &DeploymentOrchestrator) -> DeployPayload {
        orchestrator
            .start_deployment(GRAPH_KEY, None)
            .await
            .unwrap()
            .into_iter()
            .find(|p| p.target.network_id == "vpc-a")
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_deployment_emits_one_target_per_network() {
        let (cloud, orchestrator) = setup(config()).await;
        let payloads = orchestrator.start_deployment(GRAPH_KEY, None).await.unwrap();

        assert_eq!(payloads.len(), 2);
        assert_eq!(cloud.call_count("AssumeRole"), 2);
        assert!(cloud
            .calls("AssumeRole")
            .contains(&"arn:aws:iam::111:role/carve-lambda-o-abc".to_string()));

        let a = payloads.iter().find(|p| p.target.network_id == "vpc-a").unwrap();
        assert_eq!(a.stack_name, "carve-managed-endpoint-vpc-a");
        assert_eq!(a.next, DeployAction::DescribeStack);
        assert!(a.target.snapshot_name.starts_with("carve-discovered-100-deployed-"));
        assert_eq!(payloads[0].target.run_id, payloads[1].target.run_id);

        assert!(cloud
            .calls("PutObject")
            .iter()
            .any(|key| key.starts_with("deployment/deployed_graphs/carve-discovered-100-deployed-")));
    }

    #[tokio::test]
    async fn test_fresh_network_is_bootstrapped_and_deployed() {
        let (cloud, orchestrator) = setup(config()).await;
        cloud.set_tags(vec![Tag::new("team", "net"), Tag::new("aws:cloudformation:stack-name", "x")]);

        let done = orchestrator.drive(first_target(&orchestrator).await).await;

        assert_eq!(done.next, DeployAction::Complete, "{:?}", done.failure);
        assert_eq!(cloud.call_count("CreateStack"), 1);
        assert_eq!(cloud.call_count("ExecuteChangeSet"), 1);
        assert_eq!(
            cloud.stack("111", "us-east-1", "carve-managed-endpoint-vpc-a").unwrap().status,
            StackStatus::UpdateComplete
        );
        assert_eq!(
            cloud.stack_tags("111", "us-east-1", "carve-managed-endpoint-vpc-a"),
            vec![Tag::new("team", "net")]
        );
    }

    #[tokio::test]
    async fn test_existing_stack_never_triggers_create() {
        let (cloud, orchestrator) = setup(config()).await;
        cloud.seed_stack("111", "us-east-1", "carve-managed-endpoint-vpc-a", StackStatus::UpdateComplete);

        let mut payload = first_target(&orchestrator).await;
        // even a misdirected bootstrap step is turned away once the stack is seen
        payload = orchestrator.step(DeployAction::DescribeStack, payload).await;
        assert_eq!(payload.next, DeployAction::CreateChangeSet);
        payload = orchestrator.step(DeployAction::CreateBootstrapStack, payload).await;
        assert_eq!(payload.next, DeployAction::DescribeStack);

        let done = orchestrator.drive(payload).await;
        assert_eq!(done.next, DeployAction::Complete);
        assert_eq!(cloud.call_count("CreateStack"), 0);
    }

    #[tokio::test]
    async fn test_unchanged_deployment_skips_execution() {
        let (cloud, orchestrator) = setup(config()).await;
        let first = orchestrator.drive(first_target(&orchestrator).await).await;
        assert_eq!(first.next, DeployAction::Complete);

        let second = orchestrator.drive(first_target(&orchestrator).await).await;
        assert_eq!(second.next, DeployAction::Complete);
        assert_eq!(cloud.call_count("ExecuteChangeSet"), 1);
        assert_eq!(cloud.call_count("CreateStack"), 1);
    }

    #[tokio::test]
    async fn test_status_polls_reenter_the_same_step() {
        let mut cfg = config();
        cfg.max_poll_attempts = 10;
        let (cloud, orchestrator) = setup(cfg).await;
        cloud.settle_after(2);

        let mut payload = first_target(&orchestrator).await;
        payload = orchestrator.step(payload.next, payload).await;
        assert_eq!(payload.next, DeployAction::CreateBootstrapStack);
        payload = orchestrator.step(payload.next, payload).await;
        assert_eq!(payload.next, DeployAction::DescribeStack);

        payload = orchestrator.step(payload.next, payload).await;
        assert_eq!(payload.next, DeployAction::DescribeStack);
        assert_eq!(payload.stack_status, Some(StackStatus::CreateInProgress));
        assert_eq!(payload.poll_attempts, 1);

        let done = orchestrator.drive(payload).await;
        assert_eq!(done.next, DeployAction::Complete);
    }

    #[tokio::test]
    async fn test_poll_limit_reports_failure() {
        let (cloud, orchestrator) = setup(config()).await;
        cloud.settle_after(50);

        let done = orchestrator.drive(first_target(&orchestrator).await).await;
        assert_eq!(done.next, DeployAction::ReportFailure);
        assert!(done.failure.unwrap().contains("still pending"));
    }

    #[tokio::test]
    async fn test_adapter_error_rides_the_payload() {
        let (cloud, orchestrator) = setup(config()).await;
        let mut payload = first_target(&orchestrator).await;
        payload = orchestrator.step(payload.next, payload).await;
        payload = orchestrator.step(payload.next, payload).await;
        payload = orchestrator.step(payload.next, payload).await;
        assert_eq!(payload.next, DeployAction::CreateChangeSet);

        cloud.fail_next("CreateChangeSet", 1);
        payload = orchestrator.step(payload.next, payload).await;
        assert_eq!(payload.next, DeployAction::CreateChangeSet);
        assert_eq!(payload.error.as_ref().unwrap().operation, "CreateChangeSet");
        assert_eq!(payload.retries, 1);

        payload = orchestrator.step(payload.next, payload).await;
        assert!(payload.error.is_none());
        assert_eq!(payload.next, DeployAction::DescribeChangeSet);
    }

    #[tokio::test]
    async fn test_concurrent_runs_converge_on_one_stack() {
        let (cloud, orchestrator) = setup(config()).await;
        let first = first_target(&orchestrator).await;
        let second = first_target(&orchestrator).await;
        assert_ne!(first.target.run_id, second.target.run_id);

        // both observe no stack before either creates it
        let first = orchestrator.step(DeployAction::DescribeStack, first).await;
        let second = orchestrator.step(DeployAction::DescribeStack, second).await;
        assert_eq!(second.next, DeployAction::CreateBootstrapStack);
        let first = orchestrator.step(DeployAction::CreateBootstrapStack, first).await;
        assert!(first.bootstrapped);

        let second = orchestrator.step(DeployAction::CreateBootstrapStack, second).await;
        assert_eq!(second.next, DeployAction::DescribeStack);
        assert!(second.error.as_ref().unwrap().message.contains("AlreadyExists"));

        let second = orchestrator.drive(second).await;
        assert_eq!(second.next, DeployAction::Complete, "{:?}", second.failure);
        assert!(!second.bootstrapped);
        assert_eq!(cloud.call_count("CreateStack"), 2);

        let first = orchestrator.drive(first).await;
        assert_eq!(first.next, DeployAction::Complete, "{:?}", first.failure);
        assert_eq!(cloud.call_count("CreateStack"), 2);
    }

    #[tokio::test]
    async fn test_failing_create_still_exhausts_retries() {
        let (cloud, orchestrator) = setup(config()).await;
        cloud.fail_next("CreateStack", 10);

        let done = orchestrator.drive(first_target(&orchestrator).await).await;
        assert_eq!(done.next, DeployAction::ReportFailure);
        assert_eq!(done.retries, 3);
        assert_eq!(cloud.call_count("CreateStack"), 3);
        assert_eq!(cloud.call_count("DescribeStack"), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_reports_failure() {
        let (cloud, orchestrator) = setup(config()).await;
        cloud.fail_next("DescribeStack", 10);

        let done = orchestrator.drive(first_target(&orchestrator).await).await;
        assert_eq!(done.next, DeployAction::ReportFailure);
        assert_eq!(done.retries, 3);
        assert!(done.error.is_some());
        assert_eq!(cloud.call_count("CreateStack"), 0);
    }

    #[tokio::test]
    async fn test_rolled_back_stack_reports_failure() {
        let (cloud, orchestrator) = setup(config()).await;
        cloud.seed_stack("111", "us-east-1", "carve-managed-endpoint-vpc-a", StackStatus::RollbackComplete);

        let done = orchestrator.drive(first_target(&orchestrator).await).await;
        assert_eq!(done.next, DeployAction::ReportFailure);
        assert!(done.failure.unwrap().contains("ROLLBACK_COMPLETE"));
        assert_eq!(cloud.call_count("CreateChangeSet"), 0);
    }

    #[tokio::test]
    async fn test_tags_fetched_once_per_orchestrator() {
        let (cloud, orchestrator) = setup(config()).await;
        let payloads = orchestrator.start_deployment(GRAPH_KEY, None).await.unwrap();
        for payload in payloads {
            orchestrator.drive(payload).await;
        }
        assert_eq!(cloud.call_count("ListTags"), 1);
    }

    #[tokio::test]
    async fn test_missing_snapshot_fails_start() {
        let (_, orchestrator) = setup(config()).await;
        let err = orchestrator
            .start_deployment("discovered/missing.json", None)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::CarveError::SnapshotLoad { .. }));
    }
}
