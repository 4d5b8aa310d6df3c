//! Credential Broker
//!
//! Temporary per-account sessions for cross-account work. Role ARNs are
//! given as a pattern with a `*` account segment
//! (`arn:aws:iam::*:role/carve-lambda-o-abc`) and specialized per account.
//! `parallel_assume` is all-or-nothing: callers either get a session for
//! every account or an error naming each account that failed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::adapter::{CloudAdapter, Credentials};
use crate::config::CarveConfig;
use crate::error::{CarveError, CredentialFailure, Result};

/// Session labels allow `[\w+=,.@-]`, up to 64 characters
const MAX_SESSION_LABEL: usize = 64;

#[derive(Clone)]
pub struct CredentialBroker {
    adapter: Arc<dyn CloudAdapter>,
    ttl: Duration,
    limit: Arc<Semaphore>,
}

impl CredentialBroker {
    pub fn new(adapter: Arc<dyn CloudAdapter>, config: &CarveConfig) -> Self {
        Self {
            adapter,
            ttl: config.session_ttl(),
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Assume `pattern` in a single account
    pub async fn assume_role(&self, pattern: &str, account: &str, label: &str) -> Result<Credentials> {
        let role_arn = role_for_account(pattern, account)?;
        assume(self.adapter.as_ref(), &role_arn, label, self.ttl).await
    }

    /// Assume `pattern` in every account concurrently.
    ///
    /// Waits for every account before returning. Any failure fails the whole
    /// call and no partial map is returned.
    pub async fn parallel_assume<I>(&self, accounts: I, pattern: &str) -> Result<BTreeMap<String, Credentials>>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        // Reject a bad pattern before any call is issued
        role_for_account(pattern, "000000000000")?;

        let mut join_set = JoinSet::new();
        let mut pending = BTreeSet::new();
        for account in accounts {
            let account: String = account.into();
            pending.insert(account.clone());
            let adapter = self.adapter.clone();
            let limit = self.limit.clone();
            let pattern = pattern.to_string();
            let ttl = self.ttl;

            join_set.spawn(async move {
                let result = match limit.acquire_owned().await {
                    Ok(_permit) => {
                        let label = format!("carve_session_{}", account);
                        match role_for_account(&pattern, &account) {
                            Ok(role_arn) => assume(adapter.as_ref(), &role_arn, &label, ttl).await,
                            Err(e) => Err(e),
                        }
                    }
                    Err(e) => Err(CarveError::Credential {
                        role_arn: pattern.clone(),
                        message: e.to_string(),
                    }),
                };
                (account, result)
            });
        }

        let mut sessions = BTreeMap::new();
        let mut failures = Vec::new();

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((account, Ok(credentials))) => {
                    pending.remove(&account);
                    sessions.insert(account, credentials);
                }
                Ok((account, Err(e))) => {
                    pending.remove(&account);
                    warn!(account = %account, error = %e, "Role assumption failed");
                    failures.push(CredentialFailure {
                        account,
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    error!(error = %e, "Role assumption task did not complete");
                }
            }
        }

        // accounts whose task panicked or was cancelled never reported back
        for account in pending {
            failures.push(CredentialFailure {
                account,
                message: "internal error: role assumption task did not complete".to_string(),
            });
        }

        if !failures.is_empty() {
            failures.sort_by(|a, b| a.account.cmp(&b.account));
            return Err(CarveError::CredentialBatch { failures });
        }

        info!(accounts = sessions.len(), "Assumed roles in all accounts");
        Ok(sessions)
    }
}

async fn assume(
    adapter: &dyn CloudAdapter,
    role_arn: &str,
    label: &str,
    ttl: Duration,
) -> Result<Credentials> {
    let session = session_label(label);
    debug!(role = %role_arn, session = %session, "Assuming role");

    adapter
        .assume_role(role_arn, &session, ttl)
        .await
        .map_err(|e| CarveError::Credential {
            role_arn: role_arn.to_string(),
            message: e.message,
        })
}

/// Replace the wildcard account segment of `pattern` with `account`
pub fn role_for_account(pattern: &str, account: &str) -> Result<String> {
    let segments: Vec<&str> = pattern.splitn(6, ':').collect();
    match segments.as_slice() {
        ["arn", partition, "iam", "", "*", resource] if resource.starts_with("role/") => {
            Ok(format!("arn:{}:iam::{}:{}", partition, account, resource))
        }
        _ => Err(CarveError::InvalidRolePattern(pattern.to_string())),
    }
}

fn session_label(label: &str) -> String {
    label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "_+=,.@-".contains(c) {
                c
            } else {
                '_'
            }
        })
        .take(MAX_SESSION_LABEL)
        .collect()
}
