//! In-memory provider
//!
//! A scripted `CloudAdapter` + `ObjectStore` that models just enough of the
//! provider to exercise the workflows: per-account stacks and changesets
//! that settle after a configurable number of polls, client-token
//! idempotency, buckets that block stack deletion until emptied, and
//! failure injection per operation, account or region.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use super::*;
use crate::error::AdapterError;

#[derive(Debug, Clone)]
struct MemChangeSet {
    id: String,
    template_url: String,
    parameters: Vec<Parameter>,
    status: ChangeSetStatus,
    status_reason: Option<String>,
    execution_status: ExecutionStatus,
    change_count: usize,
    pending_polls: u32,
}

#[derive(Debug, Clone)]
struct MemStack {
    id: String,
    name: String,
    account: String,
    region: String,
    status: StackStatus,
    /// Template and parameters last applied
    applied: Option<(String, Vec<Parameter>)>,
    tags: Vec<Tag>,
    change_sets: BTreeMap<String, MemChangeSet>,
    pending_polls: u32,
    /// Bucket that must be empty before the stack can be deleted
    bucket: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    accounts: BTreeMap<String, String>,
    tags: Vec<Tag>,
    issued: BTreeMap<String, String>,
    stacks: Vec<MemStack>,
    buckets: BTreeMap<String, BTreeSet<String>>,
    objects: BTreeMap<String, Vec<u8>>,
    seen_tokens: BTreeSet<String>,
    denied_accounts: BTreeSet<String>,
    crashing_accounts: BTreeSet<String>,
    failing_regions: BTreeSet<(String, String)>,
    failing_ops: BTreeMap<String, u32>,
    calls: Vec<(String, String)>,
    settle_after: u32,
}

#[derive(Debug, Default)]
pub struct InMemoryCloud {
    state: Mutex<State>,
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not hide state from the others
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_account(&self, id: &str, name: &str) {
        self.lock().accounts.insert(id.to_string(), name.to_string());
    }

    pub fn set_tags(&self, tags: Vec<Tag>) {
        self.lock().tags = tags;
    }

    /// Number of describe calls an in-progress operation needs before it settles
    pub fn settle_after(&self, polls: u32) {
        self.lock().settle_after = polls;
    }

    /// Make role assumption in `account` fail
    pub fn deny_account(&self, account: &str) {
        self.lock().denied_accounts.insert(account.to_string());
    }

    /// Make role assumption in `account` panic
    pub fn crash_account(&self, account: &str) {
        self.lock().crashing_accounts.insert(account.to_string());
    }

    /// Make stack listing fail in one account and region
    pub fn fail_region(&self, account: &str, region: &str) {
        self.lock()
            .failing_regions
            .insert((account.to_string(), region.to_string()));
    }

    /// Make the next `times` calls of `operation` fail
    pub fn fail_next(&self, operation: &str, times: u32) {
        self.lock().failing_ops.insert(operation.to_string(), times);
    }

    /// Place an existing stack, returning its id
    pub fn seed_stack(&self, account: &str, region: &str, name: &str, status: StackStatus) -> String {
        let id = stack_id(account, region, name);
        self.lock().stacks.push(MemStack {
            id: id.clone(),
            name: name.to_string(),
            account: account.to_string(),
            region: region.to_string(),
            status,
            applied: None,
            tags: Vec::new(),
            change_sets: BTreeMap::new(),
            pending_polls: 0,
            bucket: None,
        });
        id
    }

    /// Tie `bucket` to a stack so the stack cannot be deleted while it holds objects
    pub fn attach_bucket(&self, account: &str, region: &str, stack_name: &str, bucket: &str, keys: &[&str]) {
        let mut state = self.lock();
        state
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .extend(keys.iter().map(|k| k.to_string()));
        if let Some(stack) = live_stack_mut(&mut state.stacks, account, region, stack_name) {
            stack.bucket = Some(bucket.to_string());
        }
    }

    pub fn bucket_len(&self, bucket: &str) -> usize {
        self.lock().buckets.get(bucket).map(BTreeSet::len).unwrap_or(0)
    }

    /// Current record for a live stack
    pub fn stack(&self, account: &str, region: &str, name: &str) -> Option<StackRecord> {
        let state = self.lock();
        state
            .stacks
            .iter()
            .find(|s| s.account == account && s.region == region && s.name == name && !s.status.is_deleted())
            .map(to_record)
    }

    /// Names of live stacks in an account, sorted
    pub fn live_stack_names(&self, account: &str) -> Vec<String> {
        let state = self.lock();
        let mut names: Vec<String> = state
            .stacks
            .iter()
            .filter(|s| s.account == account && !s.status.is_deleted())
            .map(|s| s.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn stack_tags(&self, account: &str, region: &str, name: &str) -> Vec<Tag> {
        let state = self.lock();
        state
            .stacks
            .iter()
            .find(|s| s.account == account && s.region == region && s.name == name && !s.status.is_deleted())
            .map(|s| s.tags.clone())
            .unwrap_or_default()
    }

    /// How many times `operation` was invoked
    pub fn call_count(&self, operation: &str) -> usize {
        self.lock().calls.iter().filter(|(op, _)| op == operation).count()
    }

    /// Targets passed to `operation`, in call order
    pub fn calls(&self, operation: &str) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|(op, _)| op == operation)
            .map(|(_, target)| target.clone())
            .collect()
    }

    /// Record the call and apply any injected failure
    fn enter(&self, state: &mut State, operation: &str, target: &str) -> Result<(), AdapterError> {
        state.calls.push((operation.to_string(), target.to_string()));
        if let Some(remaining) = state.failing_ops.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(AdapterError::new(operation, "injected failure"));
            }
        }
        Ok(())
    }
}

fn stack_id(account: &str, region: &str, name: &str) -> String {
    format!(
        "arn:aws:cloudformation:{}:{}:stack/{}/{}",
        region,
        account,
        name,
        Uuid::new_v4()
    )
}

/// Provider idempotency tokens are scoped to one stack
fn scoped_token(account: &str, region: &str, stack_name: &str, token: &str) -> String {
    format!("{}/{}/{}/{}", account, region, stack_name, token)
}

fn to_record(stack: &MemStack) -> StackRecord {
    StackRecord {
        name: stack.name.clone(),
        id: stack.id.clone(),
        region: stack.region.clone(),
        account: stack.account.clone(),
        status: stack.status,
    }
}

fn live_stack_mut<'a>(
    stacks: &'a mut [MemStack],
    account: &str,
    region: &str,
    name: &str,
) -> Option<&'a mut MemStack> {
    stacks
        .iter_mut()
        .find(|s| s.account == account && s.region == region && s.name == name && !s.status.is_deleted())
}

fn account_for(state: &State, operation: &str, credentials: &Credentials) -> Result<String, AdapterError> {
    if credentials.is_expired() {
        return Err(AdapterError::new(operation, "ExpiredToken: the security token has expired"));
    }
    state
        .issued
        .get(&credentials.access_key_id)
        .cloned()
        .ok_or_else(|| AdapterError::new(operation, "InvalidClientTokenId"))
}

/// Advance an in-progress stack one poll
fn settle_stack(stack: &mut MemStack) {
    if !stack.status.is_in_progress() {
        return;
    }
    if stack.pending_polls > 0 {
        stack.pending_polls -= 1;
        return;
    }
    stack.status = match stack.status {
        StackStatus::CreateInProgress => StackStatus::CreateComplete,
        StackStatus::UpdateInProgress => StackStatus::UpdateComplete,
        StackStatus::DeleteInProgress => StackStatus::DeleteComplete,
        other => other,
    };
}

#[async_trait]
impl CloudAdapter for InMemoryCloud {
    async fn assume_role(
        &self,
        role_arn: &str,
        session_name: &str,
        ttl: Duration,
    ) -> Result<Credentials, AdapterError> {
        let mut state = self.lock();
        self.enter(&mut state, "AssumeRole", role_arn)?;

        let account = role_arn.split(':').nth(4).unwrap_or_default().to_string();
        if account.is_empty() || account == "*" {
            return Err(AdapterError::new("AssumeRole", format!("malformed role arn {}", role_arn)));
        }
        if state.crashing_accounts.contains(&account) {
            drop(state);
            panic!("AssumeRole crashed in account {}", account);
        }
        if state.denied_accounts.contains(&account) {
            return Err(AdapterError::new(
                "AssumeRole",
                format!("AccessDenied: {} is not authorized to assume {}", session_name, role_arn),
            ));
        }

        let access_key_id = format!("ASIA{}", Uuid::new_v4().simple());
        state.issued.insert(access_key_id.clone(), account);

        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(900));
        Ok(Credentials {
            access_key_id,
            secret_access_key: Uuid::new_v4().to_string(),
            session_token: Uuid::new_v4().to_string(),
            expiration: Utc::now() + ttl,
        })
    }

    async fn list_organization_accounts(&self) -> Result<BTreeMap<String, String>, AdapterError> {
        let mut state = self.lock();
        self.enter(&mut state, "ListAccounts", "organization")?;
        Ok(state.accounts.clone())
    }

    async fn deployment_tags(&self) -> Result<Vec<Tag>, AdapterError> {
        let mut state = self.lock();
        self.enter(&mut state, "ListTags", "self")?;
        Ok(state.tags.clone())
    }

    async fn describe_stack(
        &self,
        stack: &str,
        region: &str,
        credentials: &Credentials,
    ) -> Result<Option<StackDescription>, AdapterError> {
        let mut state = self.lock();
        self.enter(&mut state, "DescribeStack", stack)?;
        let account = account_for(&state, "DescribeStack", credentials)?;

        // ids match deleted stacks too, names only live ones
        let found = state.stacks.iter_mut().find(|s| {
            s.account == account
                && s.region == region
                && (s.id == stack || (s.name == stack && !s.status.is_deleted()))
        });

        Ok(found.map(|s| {
            settle_stack(s);
            StackDescription {
                stack_id: s.id.clone(),
                stack_name: s.name.clone(),
                status: s.status,
                status_reason: None,
            }
        }))
    }

    async fn create_stack(
        &self,
        request: &StackRequest,
        credentials: &Credentials,
    ) -> Result<String, AdapterError> {
        let mut state = self.lock();
        self.enter(&mut state, "CreateStack", &request.stack_name)?;
        let account = account_for(&state, "CreateStack", credentials)?;

        let token = request
            .client_token
            .as_deref()
            .map(|t| scoped_token(&account, &request.region, &request.stack_name, t));
        if let Some(existing) =
            live_stack_mut(&mut state.stacks, &account, &request.region, &request.stack_name)
        {
            let id = existing.id.clone();
            return match token {
                Some(ref t) if state.seen_tokens.contains(t) => Ok(id),
                _ => Err(AdapterError::new(
                    "CreateStack",
                    format!("AlreadyExistsException: stack [{}] already exists", request.stack_name),
                )),
            };
        }

        if let Some(t) = token {
            state.seen_tokens.insert(t);
        }
        let id = stack_id(&account, &request.region, &request.stack_name);
        let pending_polls = state.settle_after;
        state.stacks.push(MemStack {
            id: id.clone(),
            name: request.stack_name.clone(),
            account,
            region: request.region.clone(),
            status: StackStatus::CreateInProgress,
            applied: Some((request.template_url.clone(), request.parameters.clone())),
            tags: request.tags.clone(),
            change_sets: BTreeMap::new(),
            pending_polls,
            bucket: None,
        });

        Ok(id)
    }

    async fn create_change_set(
        &self,
        request: &ChangeSetRequest,
        credentials: &Credentials,
    ) -> Result<ChangeSetRef, AdapterError> {
        let mut state = self.lock();
        self.enter(&mut state, "CreateChangeSet", &request.stack_name)?;
        let account = account_for(&state, "CreateChangeSet", credentials)?;
        let pending_polls = state.settle_after;

        let stack = live_stack_mut(&mut state.stacks, &account, &request.region, &request.stack_name)
            .ok_or_else(|| {
                AdapterError::new(
                    "CreateChangeSet",
                    format!("ValidationError: stack [{}] does not exist", request.stack_name),
                )
            })?;

        if let Some(existing) = stack.change_sets.get(&request.change_set_name) {
            return Ok(ChangeSetRef {
                change_set_id: existing.id.clone(),
                stack_id: stack.id.clone(),
            });
        }

        let unchanged = stack
            .applied
            .as_ref()
            .map(|(url, params)| *url == request.template_url && *params == request.parameters)
            .unwrap_or(false);

        let change_set = MemChangeSet {
            id: format!("{}/changeSet/{}", stack.id, request.change_set_name),
            template_url: request.template_url.clone(),
            parameters: request.parameters.clone(),
            status: ChangeSetStatus::CreatePending,
            status_reason: unchanged.then(|| {
                "The submitted information didn't contain changes. Submit different information to create a change set."
                    .to_string()
            }),
            execution_status: ExecutionStatus::Unavailable,
            change_count: if unchanged { 0 } else { 1 },
            pending_polls,
        };
        let reference = ChangeSetRef {
            change_set_id: change_set.id.clone(),
            stack_id: stack.id.clone(),
        };
        stack.tags = request.tags.clone();
        stack
            .change_sets
            .insert(request.change_set_name.clone(), change_set);

        Ok(reference)
    }

    async fn describe_change_set(
        &self,
        stack_name: &str,
        change_set_name: &str,
        region: &str,
        credentials: &Credentials,
    ) -> Result<ChangeSetDescription, AdapterError> {
        let mut state = self.lock();
        self.enter(&mut state, "DescribeChangeSet", stack_name)?;
        let account = account_for(&state, "DescribeChangeSet", credentials)?;

        let stack = live_stack_mut(&mut state.stacks, &account, region, stack_name).ok_or_else(|| {
            AdapterError::new("DescribeChangeSet", format!("stack [{}] does not exist", stack_name))
        })?;
        let stack_id = stack.id.clone();
        let stack_status = &mut stack.status;
        let applied = &mut stack.applied;

        let cs = stack.change_sets.get_mut(change_set_name).ok_or_else(|| {
            AdapterError::new(
                "DescribeChangeSet",
                format!("ChangeSetNotFound: {}", change_set_name),
            )
        })?;

        if cs.pending_polls > 0 {
            cs.pending_polls -= 1;
            if cs.status == ChangeSetStatus::CreatePending {
                cs.status = ChangeSetStatus::CreateInProgress;
            }
        } else {
            match cs.status {
                ChangeSetStatus::CreatePending | ChangeSetStatus::CreateInProgress => {
                    if cs.change_count == 0 {
                        cs.status = ChangeSetStatus::Failed;
                    } else {
                        cs.status = ChangeSetStatus::CreateComplete;
                        cs.execution_status = ExecutionStatus::Available;
                    }
                }
                _ => {}
            }
            if cs.execution_status == ExecutionStatus::ExecuteInProgress {
                cs.execution_status = ExecutionStatus::ExecuteComplete;
                *stack_status = StackStatus::UpdateComplete;
                *applied = Some((cs.template_url.clone(), cs.parameters.clone()));
            }
        }

        Ok(ChangeSetDescription {
            change_set_name: change_set_name.to_string(),
            stack_id,
            status: cs.status,
            status_reason: cs.status_reason.clone(),
            execution_status: cs.execution_status,
            change_count: cs.change_count,
        })
    }

    async fn execute_change_set(
        &self,
        stack_name: &str,
        change_set_name: &str,
        region: &str,
        client_token: Option<&str>,
        credentials: &Credentials,
    ) -> Result<(), AdapterError> {
        let mut state = self.lock();
        self.enter(&mut state, "ExecuteChangeSet", stack_name)?;
        let account = account_for(&state, "ExecuteChangeSet", credentials)?;

        if let Some(token) = client_token {
            if !state
                .seen_tokens
                .insert(scoped_token(&account, region, stack_name, token))
            {
                return Ok(());
            }
        }
        let pending_polls = state.settle_after;

        let stack = live_stack_mut(&mut state.stacks, &account, region, stack_name).ok_or_else(|| {
            AdapterError::new("ExecuteChangeSet", format!("stack [{}] does not exist", stack_name))
        })?;
        let cs = stack.change_sets.get_mut(change_set_name).ok_or_else(|| {
            AdapterError::new("ExecuteChangeSet", format!("ChangeSetNotFound: {}", change_set_name))
        })?;
        if cs.execution_status != ExecutionStatus::Available {
            return Err(AdapterError::new(
                "ExecuteChangeSet",
                format!("InvalidChangeSetStatus: {:?}", cs.execution_status),
            ));
        }

        cs.execution_status = ExecutionStatus::ExecuteInProgress;
        cs.pending_polls = pending_polls;
        stack.status = StackStatus::UpdateInProgress;
        stack.pending_polls = pending_polls;
        Ok(())
    }

    async fn delete_stack(
        &self,
        stack_name: &str,
        region: &str,
        credentials: &Credentials,
    ) -> Result<(), AdapterError> {
        let mut state = self.lock();
        self.enter(&mut state, "DeleteStack", stack_name)?;
        let account = account_for(&state, "DeleteStack", credentials)?;

        let bucket = state
            .stacks
            .iter()
            .find(|s| s.account == account && s.region == region && s.name == stack_name && !s.status.is_deleted())
            .and_then(|s| s.bucket.clone());
        let bucket_busy = bucket
            .as_ref()
            .and_then(|b| state.buckets.get(b))
            .map(|objects| !objects.is_empty())
            .unwrap_or(false);

        // deleting a missing stack is a no-op at the provider
        if let Some(stack) = live_stack_mut(&mut state.stacks, &account, region, stack_name) {
            stack.status = if bucket_busy {
                StackStatus::DeleteFailed
            } else {
                StackStatus::DeleteComplete
            };
        }
        Ok(())
    }

    async fn list_stacks_by_prefix(
        &self,
        prefix: &str,
        region: &str,
        credentials: &Credentials,
    ) -> Result<Vec<StackSummary>, AdapterError> {
        let mut state = self.lock();
        self.enter(&mut state, "ListStacks", region)?;
        let account = account_for(&state, "ListStacks", credentials)?;

        if state
            .failing_regions
            .contains(&(account.clone(), region.to_string()))
        {
            return Err(AdapterError::new(
                "ListStacks",
                format!("could not reach {} in {}", region, account),
            ));
        }

        Ok(state
            .stacks
            .iter()
            .filter(|s| {
                s.account == account
                    && s.region == region
                    && s.name.starts_with(prefix)
                    && !s.status.is_deleted()
            })
            .map(|s| StackSummary {
                stack_id: s.id.clone(),
                stack_name: s.name.clone(),
                status: s.status,
            })
            .collect())
    }

    async fn empty_bucket(
        &self,
        bucket: &str,
        _region: &str,
        credentials: &Credentials,
    ) -> Result<usize, AdapterError> {
        let mut state = self.lock();
        self.enter(&mut state, "EmptyBucket", bucket)?;
        account_for(&state, "EmptyBucket", credentials)?;

        Ok(state
            .buckets
            .get_mut(bucket)
            .map(|objects| {
                let n = objects.len();
                objects.clear();
                n
            })
            .unwrap_or(0))
    }
}

#[async_trait]
impl ObjectStore for InMemoryCloud {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, AdapterError> {
        let mut state = self.lock();
        self.enter(&mut state, "GetObject", key)?;
        Ok(state.objects.get(key).cloned())
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), AdapterError> {
        let mut state = self.lock();
        self.enter(&mut state, "PutObject", key)?;
        state.objects.insert(key.to_string(), body);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AdapterError> {
        let mut state = self.lock();
        self.enter(&mut state, "DeleteObject", key)?;
        state.objects.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, AdapterError> {
        let mut state = self.lock();
        self.enter(&mut state, "ListObjects", prefix)?;
        Ok(state
            .objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
