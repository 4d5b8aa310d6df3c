//! Cloud Provider Adapters
//!
//! Trait-based seams for every call Carve makes to the provider: role
//! assumption, stack and changeset lifecycle, organization listing and
//! object storage. Concrete SDK bindings live outside this crate;
//! `memory::InMemoryCloud` is a scripted implementation for tests, built
//! with the `test-support` feature.

#[cfg(any(test, feature = "test-support"))]
pub mod memory;
mod types;

pub use types::*;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::AdapterError;

/// Provider calls scoped to accounts, regions and stacks
#[async_trait]
pub trait CloudAdapter: Send + Sync {
    /// Exchange the caller's identity for temporary credentials in `role_arn`
    async fn assume_role(
        &self,
        role_arn: &str,
        session_name: &str,
        ttl: Duration,
    ) -> Result<Credentials, AdapterError>;

    /// Every member account of the organization, id -> name
    async fn list_organization_accounts(&self) -> Result<BTreeMap<String, String>, AdapterError>;

    /// Tags to stamp on every stack Carve creates
    async fn deployment_tags(&self) -> Result<Vec<Tag>, AdapterError>;

    /// Look a stack up by name or id; `None` when it does not exist
    async fn describe_stack(
        &self,
        stack: &str,
        region: &str,
        credentials: &Credentials,
    ) -> Result<Option<StackDescription>, AdapterError>;

    /// Returns the new stack id
    async fn create_stack(
        &self,
        request: &StackRequest,
        credentials: &Credentials,
    ) -> Result<String, AdapterError>;

    async fn create_change_set(
        &self,
        request: &ChangeSetRequest,
        credentials: &Credentials,
    ) -> Result<ChangeSetRef, AdapterError>;

    async fn describe_change_set(
        &self,
        stack_name: &str,
        change_set_name: &str,
        region: &str,
        credentials: &Credentials,
    ) -> Result<ChangeSetDescription, AdapterError>;

    async fn execute_change_set(
        &self,
        stack_name: &str,
        change_set_name: &str,
        region: &str,
        client_token: Option<&str>,
        credentials: &Credentials,
    ) -> Result<(), AdapterError>;

    async fn delete_stack(
        &self,
        stack_name: &str,
        region: &str,
        credentials: &Credentials,
    ) -> Result<(), AdapterError>;

    /// Live (not deleted) stacks whose name starts with `prefix`
    async fn list_stacks_by_prefix(
        &self,
        prefix: &str,
        region: &str,
        credentials: &Credentials,
    ) -> Result<Vec<StackSummary>, AdapterError>;

    /// Delete every object in `bucket`, returning how many were removed
    async fn empty_bucket(
        &self,
        bucket: &str,
        region: &str,
        credentials: &Credentials,
    ) -> Result<usize, AdapterError>;
}

/// Carve's own object storage, used for snapshots
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// `None` when the key does not exist
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, AdapterError>;

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), AdapterError>;

    async fn delete(&self, key: &str) -> Result<(), AdapterError>;

    /// Keys under `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>, AdapterError>;
}
