//! Cleanup Reconciler
//!
//! Retires managed stacks that no longer back any network in the most
//! recently deployed snapshot. Discovery runs one task per account and
//! region; deletion of each stack is independent and reports its own
//! outcome.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::allowlist::{
    build_safe_allowlist, cleanup_tasks, compute_deletion_set, CleanupTask, SafeAllowlist,
};
use crate::adapter::{CloudAdapter, Credentials, ObjectStore, StackRecord, StackStatus};
use crate::config::CarveConfig;
use crate::credentials::CredentialBroker;
use crate::error::{CarveError, Result};
use crate::snapshot::SnapshotStore;

/// A stack selected for deletion, with its account's allowlist so the
/// delete step can re-check it without shared state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionRequest {
    pub stack: StackRecord,
    pub safe_stack_names: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeletionOutcome {
    /// The provider accepted the delete call
    Deleted,
    /// The stack is on the allowlist
    Refused { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionResult {
    pub stack: StackRecord,
    #[serde(flatten)]
    pub outcome: DeletionOutcome,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupReport {
    pub deploy_key: String,
    /// Unprotected managed stacks found across all reachable accounts
    pub candidates: usize,
    /// Accounts whose role could not be assumed for discovery
    pub unreachable_accounts: Vec<String>,
    pub results: Vec<DeletionResult>,
}

impl CleanupReport {
    fn count(&self, matches: impl Fn(&DeletionOutcome) -> bool) -> usize {
        self.results.iter().filter(|r| matches(&r.outcome)).count()
    }

    pub fn deleted(&self) -> usize {
        self.count(|o| matches!(o, DeletionOutcome::Deleted))
    }

    pub fn refused(&self) -> usize {
        self.count(|o| matches!(o, DeletionOutcome::Refused { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, DeletionOutcome::Failed { .. }))
    }
}

pub struct CleanupReconciler {
    adapter: Arc<dyn CloudAdapter>,
    broker: CredentialBroker,
    snapshots: SnapshotStore,
    config: Arc<CarveConfig>,
    limit: Arc<Semaphore>,
}

impl CleanupReconciler {
    pub fn new(
        adapter: Arc<dyn CloudAdapter>,
        store: Arc<dyn ObjectStore>,
        config: Arc<CarveConfig>,
    ) -> Self {
        Self {
            broker: CredentialBroker::new(adapter.clone(), &config),
            snapshots: SnapshotStore::new(store, config.clone()),
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            adapter,
            config,
        }
    }

    /// Deployed snapshot key to clean up after; the newest one when not given
    pub async fn resolve_deploy_key(&self, deploy_key: Option<&str>) -> Result<String> {
        match deploy_key {
            Some(key) => Ok(key.to_string()),
            None => self
                .snapshots
                .latest_deployed()
                .await?
                .ok_or_else(|| CarveError::snapshot_load(&self.config.deployed_prefix, "no deployed snapshot")),
        }
    }

    /// Load the deployed snapshot and build the per-run allowlist
    pub async fn build_allowlist(&self, deploy_key: &str) -> Result<SafeAllowlist> {
        self.config.require_hub_account()?;
        let graph = self.snapshots.load(deploy_key).await?;
        let accounts = self.adapter.list_organization_accounts().await?;

        let allowlist = build_safe_allowlist(&graph, accounts.keys().map(String::as_str), &self.config)?;
        info!(
            deploy_key = %deploy_key,
            accounts = allowlist.len(),
            protected = allowlist.values().map(BTreeSet::len).sum::<usize>(),
            "Built safe allowlist"
        );
        Ok(allowlist)
    }

    /// One cleanup task per organization account
    pub async fn cleanup_deployments(&self, deploy_key: Option<&str>) -> Result<Vec<CleanupTask>> {
        let key = self.resolve_deploy_key(deploy_key).await?;
        let allowlist = self.build_allowlist(&key).await?;
        Ok(cleanup_tasks(&allowlist))
    }

    /// Find the account's managed stacks in every enabled region and return
    /// those not protected by the task's allowlist
    pub async fn discover_stacks(&self, task: &CleanupTask) -> Result<Vec<DeletionRequest>> {
        let credentials = self
            .broker
            .assume_role(&self.config.role_pattern(), &task.account, "carve-cleanup")
            .await?;

        let discovered = self.discover_account(&task.account, credentials).await;
        let allowlist = SafeAllowlist::from([(task.account.clone(), task.safe_stack_names.clone())]);

        Ok(compute_deletion_set(&discovered, &allowlist)
            .into_iter()
            .map(|stack| DeletionRequest {
                stack,
                safe_stack_names: task.safe_stack_names.clone(),
            })
            .collect())
    }

    /// Query every enabled region of one account concurrently
    async fn discover_account(&self, account: &str, credentials: Credentials) -> Vec<StackRecord> {
        let prefix = self.config.managed_prefix();
        let mut join_set = JoinSet::new();

        for region in self.config.enabled_regions() {
            let adapter = self.adapter.clone();
            let limit = self.limit.clone();
            let credentials = credentials.clone();
            let account = account.to_string();
            let prefix = prefix.clone();

            join_set.spawn(async move {
                let Ok(_permit) = limit.acquire_owned().await else {
                    return Vec::new();
                };
                discover_managed_stacks(adapter.as_ref(), &account, &region, &credentials, &prefix).await
            });
        }

        let mut stacks = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(found) => stacks.extend(found),
                Err(e) => error!(account = %account, error = %e, "Stack discovery task panicked"),
            }
        }
        stacks
    }

    /// Delete one stack unless it is protected.
    ///
    /// The shared bucket stack has its bucket emptied first; the provider
    /// refuses to delete a stack whose bucket still holds objects.
    pub async fn delete_stack(&self, stack: &StackRecord, safe_stack_names: &BTreeSet<String>) -> DeletionResult {
        if safe_stack_names.contains(&stack.name) {
            let violation = CarveError::ReconciliationViolation {
                account: stack.account.clone(),
                stack_name: stack.name.clone(),
            };
            error!(
                account = %stack.account,
                region = %stack.region,
                stack = %stack.name,
                "Refusing to delete protected stack"
            );
            return DeletionResult {
                stack: stack.clone(),
                outcome: DeletionOutcome::Refused {
                    reason: violation.to_string(),
                },
            };
        }

        let outcome = match self.try_delete(stack).await {
            Ok(()) => {
                info!(
                    account = %stack.account,
                    region = %stack.region,
                    stack = %stack.name,
                    "Deleting stack"
                );
                DeletionOutcome::Deleted
            }
            Err(e) => {
                warn!(
                    account = %stack.account,
                    region = %stack.region,
                    stack = %stack.name,
                    error = %e,
                    "Stack deletion failed"
                );
                DeletionOutcome::Failed { error: e.to_string() }
            }
        };

        DeletionResult {
            stack: stack.clone(),
            outcome,
        }
    }

    async fn try_delete(&self, stack: &StackRecord) -> Result<()> {
        let credentials = self
            .broker
            .assume_role(
                &self.config.role_pattern(),
                &stack.account,
                &format!("carve-cleanup-{}", stack.region),
            )
            .await?;

        if stack.name == self.config.bucket_stack_name(&stack.region) {
            let bucket = self.config.managed_bucket_name(&stack.region);
            let removed = self
                .adapter
                .empty_bucket(&bucket, &stack.region, &credentials)
                .await?;
            info!(bucket = %bucket, objects = removed, "Emptied managed bucket");
        }

        self.adapter
            .delete_stack(&stack.name, &stack.region, &credentials)
            .await?;
        Ok(())
    }

    /// Delete every stack independently; one failure never stops the others
    pub async fn delete_stacks(&self, stacks: &[StackRecord], allowlist: &SafeAllowlist) -> Vec<DeletionResult> {
        let empty = BTreeSet::new();
        join_all(stacks.iter().map(|stack| {
            let safe = allowlist.get(&stack.account).unwrap_or(&empty);
            self.delete_stack(stack, safe)
        }))
        .await
    }

    /// Poll a deletion by stack id; deleted stacks are only visible by id
    pub async fn describe_delete_stack(&self, stack: &StackRecord) -> Result<StackRecord> {
        let credentials = self
            .broker
            .assume_role(
                &self.config.role_pattern(),
                &stack.account,
                &format!("carve-deploy-{}", stack.region),
            )
            .await?;

        let status = self
            .adapter
            .describe_stack(&stack.id, &stack.region, &credentials)
            .await?
            .map(|d| d.status)
            .unwrap_or(StackStatus::DeleteComplete);

        Ok(StackRecord {
            status,
            ..stack.clone()
        })
    }

    /// A complete cleanup pass in-process
    pub async fn run(&self, deploy_key: Option<&str>) -> Result<CleanupReport> {
        self.config.require_hub_account()?;
        let key = self.resolve_deploy_key(deploy_key).await?;
        let allowlist = Arc::new(self.build_allowlist(&key).await?);

        let mut report = CleanupReport {
            deploy_key: key,
            ..CleanupReport::default()
        };

        let mut discovered = Vec::new();
        let tasks = cleanup_tasks(&allowlist);
        let per_account = join_all(tasks.iter().map(|task| self.discover_stacks(task))).await;
        for (task, result) in tasks.iter().zip(per_account) {
            match result {
                Ok(requests) => discovered.extend(requests.into_iter().map(|r| r.stack)),
                Err(e) => {
                    warn!(account = %task.account, error = %e, "Skipping account for cleanup");
                    report.unreachable_accounts.push(task.account.clone());
                }
            }
        }

        let deletions = compute_deletion_set(&discovered, &allowlist);
        report.candidates = discovered.len();
        report.results = self.delete_stacks(&deletions, &allowlist).await;

        info!(
            deploy_key = %report.deploy_key,
            deleted = report.deleted(),
            refused = report.refused(),
            failed = report.failed(),
            unreachable = report.unreachable_accounts.len(),
            "Cleanup finished"
        );
        Ok(report)
    }
}

/// Live managed stacks in one account and region.
///
/// A region that cannot be queried is logged and treated as empty.
pub async fn discover_managed_stacks(
    adapter: &dyn CloudAdapter,
    account: &str,
    region: &str,
    credentials: &Credentials,
    prefix: &str,
) -> Vec<StackRecord> {
    match adapter.list_stacks_by_prefix(prefix, region, credentials).await {
        Ok(stacks) => stacks
            .into_iter()
            .filter(|s| !s.status.is_deleted())
            .map(|s| StackRecord::from_summary(s, account, region))
            .collect(),
        Err(e) => {
            warn!(account = %account, region = %region, error = %e, "Cannot list stacks");
            Vec::new()
        }
    }
}

/// Flatten per-account deletion lists into one fan-out list
pub fn organize_deletions(per_account: Vec<Vec<DeletionRequest>>) -> Vec<DeletionRequest> {
    per_account.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::memory::InMemoryCloud;
    use crate::topology::{NetworkGraph, NetworkNode};

    const DEPLOY_KEY: &str = "deployment/deployed_graphs/net-deployed-100.json";

    fn config() -> CarveConfig {
        CarveConfig {
            organization_id: "o-abc".to_string(),
            hub_account: "999".to_string(),
            regions: vec!["us-east-1".to_string(), "us-west-2".to_string()],
            ..CarveConfig::default()
        }
    }

    async fn setup() -> (Arc<InMemoryCloud>, CleanupReconciler, CarveConfig) {
        let cloud = Arc::new(InMemoryCloud::new());
        for account in ["111", "222", "999"] {
            cloud.add_account(account, &format!("acct-{}", account));
        }

        let mut graph = NetworkGraph::new("net-deployed-100");
        graph.add_node(NetworkNode::new("net-42", "111", "us-east-1", "forty-two"));
        cloud.put(DEPLOY_KEY, graph.to_json().unwrap().into_bytes()).await.unwrap();

        let cfg = config();
        let reconciler = CleanupReconciler::new(cloud.clone(), cloud.clone(), Arc::new(cfg.clone()));
        (cloud, reconciler, cfg)
    }

    #[tokio::test]
    async fn test_cleanup_deployments_uses_latest_snapshot() {
        let (_, reconciler, cfg) = setup().await;
        let tasks = reconciler.cleanup_deployments(None).await.unwrap();

        assert_eq!(tasks.len(), 3);
        let task_111 = tasks.iter().find(|t| t.account == "111").unwrap();
        assert!(task_111.safe_stack_names.contains(&cfg.endpoint_stack_name("net-42")));
    }

    #[tokio::test]
    async fn test_unset_hub_account_deletes_nothing() {
        let (cloud, _, cfg) = setup().await;
        let privatelink = cfg.privatelink_stack_name("us-east-1");
        cloud.seed_stack("999", "us-east-1", &privatelink, StackStatus::CreateComplete);
        cloud.seed_stack("111", "us-east-1", &cfg.endpoint_stack_name("net-old"), StackStatus::CreateComplete);

        let unset = CarveConfig {
            hub_account: String::new(),
            ..cfg.clone()
        };
        let reconciler = CleanupReconciler::new(cloud.clone(), cloud.clone(), Arc::new(unset));

        assert!(matches!(reconciler.run(None).await, Err(CarveError::Config(_))));
        assert!(matches!(
            reconciler.cleanup_deployments(Some(DEPLOY_KEY)).await,
            Err(CarveError::Config(_))
        ));
        assert_eq!(cloud.call_count("ListStacks"), 0);
        assert_eq!(cloud.call_count("DeleteStack"), 0);
        assert!(cloud.stack("999", "us-east-1", &privatelink).is_some());
    }

    #[tokio::test]
    async fn test_no_deployed_snapshot_is_a_load_error() {
        let cloud = Arc::new(InMemoryCloud::new());
        let reconciler = CleanupReconciler::new(cloud.clone(), cloud, Arc::new(config()));
        assert!(matches!(
            reconciler.run(None).await,
            Err(CarveError::SnapshotLoad { .. })
        ));
    }

    #[tokio::test]
    async fn test_discovery_queries_every_region_and_tolerates_failures() {
        let (cloud, reconciler, cfg) = setup().await;
        cloud.seed_stack("111", "us-east-1", &cfg.endpoint_stack_name("net-42"), StackStatus::UpdateComplete);
        cloud.seed_stack("111", "us-west-2", &cfg.endpoint_stack_name("net-old"), StackStatus::CreateComplete);
        cloud.seed_stack("111", "us-west-2", "unrelated-stack", StackStatus::CreateComplete);
        cloud.fail_region("111", "us-east-1");

        let task = CleanupTask {
            account: "111".to_string(),
            safe_stack_names: BTreeSet::from([cfg.endpoint_stack_name("net-42")]),
        };
        let requests = reconciler.discover_stacks(&task).await.unwrap();

        assert_eq!(cloud.call_count("ListStacks"), 2);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].stack.name, cfg.endpoint_stack_name("net-old"));
        assert_eq!(requests[0].safe_stack_names, task.safe_stack_names);
    }

    #[tokio::test]
    async fn test_protected_stack_is_refused() {
        let (cloud, reconciler, cfg) = setup().await;
        let name = cfg.endpoint_stack_name("net-42");
        let id = cloud.seed_stack("111", "us-east-1", &name, StackStatus::UpdateComplete);
        let record = StackRecord {
            name: name.clone(),
            id,
            region: "us-east-1".to_string(),
            account: "111".to_string(),
            status: StackStatus::UpdateComplete,
        };

        let result = reconciler.delete_stack(&record, &BTreeSet::from([name.clone()])).await;

        assert!(matches!(result.outcome, DeletionOutcome::Refused { .. }));
        assert_eq!(cloud.call_count("DeleteStack"), 0);
        assert!(cloud.stack("111", "us-east-1", &name).is_some());
    }

    #[tokio::test]
    async fn test_bucket_stack_is_emptied_before_delete() {
        let (cloud, reconciler, cfg) = setup().await;
        let name = cfg.bucket_stack_name("us-west-2");
        let bucket = cfg.managed_bucket_name("us-west-2");
        cloud.seed_stack("999", "us-west-2", &name, StackStatus::CreateComplete);
        cloud.attach_bucket("999", "us-west-2", &name, &bucket, &["flowlogs/1", "flowlogs/2"]);

        let report = reconciler.run(Some(DEPLOY_KEY)).await.unwrap();

        assert_eq!(report.deleted(), 1);
        assert_eq!(bucket, "carve-managed-bucket-o-abc-us-west-2");
        assert_eq!(cloud.bucket_len(&bucket), 0);
        assert!(cloud.stack("999", "us-west-2", &name).is_none());
    }

    #[tokio::test]
    async fn test_failed_delete_does_not_abort_batch() {
        let (cloud, reconciler, cfg) = setup().await;
        cloud.seed_stack("111", "us-east-1", &cfg.endpoint_stack_name("net-a"), StackStatus::CreateComplete);
        cloud.seed_stack("222", "us-east-1", &cfg.endpoint_stack_name("net-b"), StackStatus::CreateComplete);
        cloud.fail_next("DeleteStack", 1);

        let report = reconciler.run(Some(DEPLOY_KEY)).await.unwrap();

        assert_eq!(report.candidates, 2);
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.deleted(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_account_is_reported() {
        let (cloud, reconciler, cfg) = setup().await;
        cloud.seed_stack("111", "us-east-1", &cfg.endpoint_stack_name("net-old"), StackStatus::CreateComplete);
        cloud.deny_account("222");

        let report = reconciler.run(Some(DEPLOY_KEY)).await.unwrap();

        assert_eq!(report.unreachable_accounts, vec!["222".to_string()]);
        assert_eq!(report.deleted(), 1);
    }

    #[tokio::test]
    async fn test_describe_delete_stack_by_id() {
        let (cloud, reconciler, cfg) = setup().await;
        let name = cfg.endpoint_stack_name("net-old");
        let id = cloud.seed_stack("111", "us-east-1", &name, StackStatus::CreateComplete);
        let record = StackRecord {
            name,
            id,
            region: "us-east-1".to_string(),
            account: "111".to_string(),
            status: StackStatus::CreateComplete,
        };

        let result = reconciler.delete_stack(&record, &BTreeSet::new()).await;
        assert_eq!(result.outcome, DeletionOutcome::Deleted);

        let polled = reconciler.describe_delete_stack(&record).await.unwrap();
        assert_eq!(polled.status, StackStatus::DeleteComplete);
    }

    #[test]
    fn test_organize_deletions_flattens() {
        let request = |name: &str| DeletionRequest {
            stack: StackRecord {
                name: name.to_string(),
                id: format!("id-{}", name),
                region: "us-east-1".to_string(),
                account: "111".to_string(),
                status: StackStatus::CreateComplete,
            },
            safe_stack_names: BTreeSet::new(),
        };
        let flat = organize_deletions(vec![vec![request("a"), request("b")], vec![], vec![request("c")]]);
        assert_eq!(flat.len(), 3);
    }

    #[test]
    fn test_outcome_wire_format() {
        let result = DeletionResult {
            stack: StackRecord {
                name: "s".to_string(),
                id: "i".to_string(),
                region: "r".to_string(),
                account: "a".to_string(),
                status: StackStatus::DeleteInProgress,
            },
            outcome: DeletionOutcome::Failed {
                error: "boom".to_string(),
            },
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["error"], "boom");
    }
}
