//! Carve Engine Library
//!
//! Multi-account VPC endpoint deployment and cleanup: topology snapshots,
//! cross-account credentials, a step-driven deployment state machine and a
//! cleanup reconciler that never deletes infrastructure still in use.

pub mod adapter;
pub mod cleanup;
pub mod config;
pub mod credentials;
pub mod deploy;
pub mod error;
pub mod snapshot;
pub mod topology;
pub mod workflow;

pub use cleanup::CleanupReconciler;
pub use config::CarveConfig;
pub use credentials::CredentialBroker;
pub use deploy::DeploymentOrchestrator;
pub use error::{CarveError, Result};
pub use topology::NetworkGraph;
pub use workflow::{Workflow, WorkflowEvent};
