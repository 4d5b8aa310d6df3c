//! Scheduler entry point
//!
//! The durable workflow scheduler invokes Carve with one JSON event per
//! step and gets JSON back. Steps that fan out return a list, which the
//! scheduler expands into parallel branches.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::adapter::{CloudAdapter, ObjectStore, StackRecord};
use crate::cleanup::{organize_deletions, CleanupReconciler, CleanupTask, DeletionRequest};
use crate::config::CarveConfig;
use crate::deploy::{DeployAction, DeployPayload, DeploymentOrchestrator};
use crate::error::Result;
use crate::snapshot::{finalize_discovery, SnapshotStore};
use crate::topology::ConflictPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum WorkflowEvent {
    /// Merge per-account discovery into one snapshot
    FinalizeDiscovery {
        #[serde(default)]
        policy: ConflictPolicy,
    },
    /// Fan a discovered snapshot out into deployment payloads
    StartDeployment {
        graph_key: String,
        #[serde(default)]
        role: Option<String>,
    },
    Deploy {
        step: DeployAction,
        payload: DeployPayload,
    },
    /// Fan out one cleanup task per account
    CleanupDeployments {
        #[serde(default)]
        deploy_key: Option<String>,
    },
    DiscoverStacks {
        task: CleanupTask,
    },
    OrganizeDeletions {
        per_account: Vec<Vec<DeletionRequest>>,
    },
    DeleteStack {
        request: DeletionRequest,
    },
    DescribeDeleteStack {
        stack: StackRecord,
    },
}

pub struct Workflow {
    snapshots: SnapshotStore,
    deployer: DeploymentOrchestrator,
    reconciler: CleanupReconciler,
}

impl Workflow {
    pub fn new(adapter: Arc<dyn CloudAdapter>, store: Arc<dyn ObjectStore>, config: Arc<CarveConfig>) -> Self {
        Self {
            snapshots: SnapshotStore::new(store.clone(), config.clone()),
            deployer: DeploymentOrchestrator::new(adapter.clone(), store.clone(), config.clone()),
            reconciler: CleanupReconciler::new(adapter, store, config),
        }
    }

    pub async fn handle(&self, event: WorkflowEvent) -> Result<Value> {
        let output = match event {
            WorkflowEvent::FinalizeDiscovery { policy } => {
                let key = finalize_discovery(&self.snapshots, policy).await?;
                serde_json::json!({ "discovery": key })
            }
            WorkflowEvent::StartDeployment { graph_key, role } => {
                let payloads = self
                    .deployer
                    .start_deployment(&graph_key, role.as_deref())
                    .await?;
                serde_json::to_value(payloads)?
            }
            WorkflowEvent::Deploy { step, payload } => {
                serde_json::to_value(self.deployer.step(step, payload).await)?
            }
            WorkflowEvent::CleanupDeployments { deploy_key } => {
                let tasks = self.reconciler.cleanup_deployments(deploy_key.as_deref()).await?;
                serde_json::to_value(tasks)?
            }
            WorkflowEvent::DiscoverStacks { task } => {
                serde_json::to_value(self.reconciler.discover_stacks(&task).await?)?
            }
            WorkflowEvent::OrganizeDeletions { per_account } => {
                serde_json::to_value(organize_deletions(per_account))?
            }
            WorkflowEvent::DeleteStack { request } => {
                let result = self
                    .reconciler
                    .delete_stack(&request.stack, &request.safe_stack_names)
                    .await;
                serde_json::to_value(result)?
            }
            WorkflowEvent::DescribeDeleteStack { stack } => {
                serde_json::to_value(self.reconciler.describe_delete_stack(&stack).await?)?
            }
        };
        Ok(output)
    }

    /// Raw scheduler invocation
    pub async fn handle_json(&self, event: &str) -> Result<String> {
        let event: WorkflowEvent = serde_json::from_str(event)?;
        info!(action = %action_name(&event), "Workflow step");
        let output = self.handle(event).await?;
        Ok(serde_json::to_string(&output)?)
    }
}

fn action_name(event: &WorkflowEvent) -> &'static str {
    match event {
        WorkflowEvent::FinalizeDiscovery { .. } => "FinalizeDiscovery",
        WorkflowEvent::StartDeployment { .. } => "StartDeployment",
        WorkflowEvent::Deploy { .. } => "Deploy",
        WorkflowEvent::CleanupDeployments { .. } => "CleanupDeployments",
        WorkflowEvent::DiscoverStacks { .. } => "DiscoverStacks",
        WorkflowEvent::OrganizeDeletions { .. } => "OrganizeDeletions",
        WorkflowEvent::DeleteStack { .. } => "DeleteStack",
        WorkflowEvent::DescribeDeleteStack { .. } => "DescribeDeleteStack",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::memory::InMemoryCloud;
    use crate::adapter::StackStatus;
    use crate::cleanup::{DeletionOutcome, DeletionResult};
    use crate::error::CarveError;
    use std::collections::BTreeSet;
    use crate::topology::{NetworkGraph, NetworkNode};

    fn workflow() -> (Arc<InMemoryCloud>, Workflow) {
        let cloud = Arc::new(InMemoryCloud::new());
        let config = CarveConfig {
            organization_id: "o-abc".to_string(),
            hub_account: "999".to_string(),
            regions: vec!["us-east-1".to_string()],
            ..CarveConfig::default()
        };
        let workflow = Workflow::new(cloud.clone(), cloud.clone(), Arc::new(config));
        (cloud, workflow)
    }

    #[test]
    fn test_event_tags() {
        let event: WorkflowEvent =
            serde_json::from_str(r#"{"action":"CleanupDeployments"}"#).unwrap();
        assert!(matches!(event, WorkflowEvent::CleanupDeployments { deploy_key: None }));

        let event: WorkflowEvent =
            serde_json::from_str(r#"{"action":"StartDeployment","graph_key":"discovered/g.json"}"#).unwrap();
        assert!(matches!(event, WorkflowEvent::StartDeployment { role: None, .. }));
    }

    #[tokio::test]
    async fn test_unknown_action_is_rejected() {
        let (_, workflow) = workflow();
        let err = workflow.handle_json(r#"{"action":"Reboot"}"#).await.unwrap_err();
        assert!(matches!(err, CarveError::Serialization(_)));
    }

    async fn send(workflow: &Workflow, event: WorkflowEvent) -> Value {
        let out = workflow
            .handle_json(&serde_json::to_string(&event).unwrap())
            .await
            .unwrap();
        serde_json::from_str(&out).unwrap()
    }

    #[tokio::test]
    async fn test_finalize_discovery_over_json() {
        let (cloud, workflow) = workflow();
        let mut graph = NetworkGraph::new("account-111");
        graph.add_node(NetworkNode::new("vpc-a", "111", "us-east-1", "alpha"));
        cloud
            .put("discovery/111.json", graph.to_json().unwrap().into_bytes())
            .await
            .unwrap();

        let out = workflow
            .handle_json(r#"{"action":"FinalizeDiscovery","policy":"reject"}"#)
            .await
            .unwrap();
        let out: Value = serde_json::from_str(&out).unwrap();
        let key = out["discovery"].as_str().unwrap();
        assert!(key.starts_with("discovered/carve-discovered-"));
        assert!(cloud.get(key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_steps_over_json() {
        let (cloud, workflow) = workflow();
        cloud.add_account("111", "one");
        cloud.seed_stack("111", "us-east-1", "carve-managed-endpoint-vpc-a", StackStatus::CreateComplete);
        cloud.seed_stack("111", "us-east-1", "carve-managed-endpoint-vpc-old", StackStatus::CreateComplete);
        let safe: BTreeSet<String> = ["carve-managed-endpoint-vpc-a".to_string()].into();

        // a request naming a protected stack is turned away at the delete step
        let protected = cloud.stack("111", "us-east-1", "carve-managed-endpoint-vpc-a").unwrap();
        let out = send(&workflow, WorkflowEvent::DeleteStack {
            request: DeletionRequest {
                stack: protected.clone(),
                safe_stack_names: safe.clone(),
            },
        })
        .await;
        assert_eq!(out["outcome"], "refused");
        let result: DeletionResult = serde_json::from_value(out).unwrap();
        assert!(matches!(result.outcome, DeletionOutcome::Refused { .. }));
        assert!(cloud.stack("111", "us-east-1", &protected.name).is_some());
        assert_eq!(cloud.call_count("DeleteStack"), 0);

        let stale = cloud.stack("111", "us-east-1", "carve-managed-endpoint-vpc-old").unwrap();
        let out = send(&workflow, WorkflowEvent::DeleteStack {
            request: DeletionRequest {
                stack: stale.clone(),
                safe_stack_names: safe,
            },
        })
        .await;
        assert_eq!(out["outcome"], "deleted");

        let mut record = stale;
        for _ in 0..5 {
            let out = send(&workflow, WorkflowEvent::DescribeDeleteStack { stack: record.clone() }).await;
            record = serde_json::from_value(out).unwrap();
            if record.status.is_deleted() {
                break;
            }
        }
        assert!(record.status.is_deleted());
        assert!(cloud.stack("111", "us-east-1", "carve-managed-endpoint-vpc-old").is_none());
    }

    #[tokio::test]
    async fn test_scheduler_loop_over_json() {
        let (cloud, workflow) = workflow();
        cloud.add_account("111", "one");
        cloud.add_account("999", "hub");
        let mut graph = NetworkGraph::new("carve-discovered-5");
        graph.add_node(NetworkNode::new("vpc-a", "111", "us-east-1", "alpha"));
        cloud
            .put("discovered/carve-discovered-5.json", graph.to_json().unwrap().into_bytes())
            .await
            .unwrap();

        let out = workflow
            .handle_json(r#"{"action":"StartDeployment","graph_key":"discovered/carve-discovered-5.json"}"#)
            .await
            .unwrap();
        let payloads: Vec<DeployPayload> = serde_json::from_str(&out).unwrap();
        assert_eq!(payloads.len(), 1);

        let mut payload = payloads.into_iter().next().unwrap();
        for _ in 0..20 {
            if payload.is_finished() {
                break;
            }
            let event = WorkflowEvent::Deploy {
                step: payload.next,
                payload,
            };
            let out = workflow.handle_json(&serde_json::to_string(&event).unwrap()).await.unwrap();
            payload = serde_json::from_str(&out).unwrap();
        }
        assert_eq!(payload.next, DeployAction::Complete);

        let tasks = workflow
            .handle(WorkflowEvent::CleanupDeployments { deploy_key: None })
            .await
            .unwrap();
        let tasks: Vec<CleanupTask> = serde_json::from_value(tasks).unwrap();
        let mut per_account = Vec::new();
        for task in tasks {
            let found = workflow.handle(WorkflowEvent::DiscoverStacks { task }).await.unwrap();
            per_account.push(serde_json::from_value::<Vec<DeletionRequest>>(found).unwrap());
        }
        let deletions = workflow
            .handle(WorkflowEvent::OrganizeDeletions { per_account })
            .await
            .unwrap();
        // the freshly deployed endpoint is protected
        assert_eq!(deletions, serde_json::json!([]));
    }
}
