//! Endpoint Deployment
//!
//! Fans a deployed snapshot out into one `DeployPayload` per network and
//! steps each payload through the stack/changeset lifecycle. The external
//! scheduler owns the loop: it invokes `step` with `payload.next` until a
//! terminal action comes back.

mod orchestrator;
mod types;

pub use orchestrator::DeploymentOrchestrator;
pub use types::{DeployAction, DeployPayload, DeploymentTarget};
