//! Carve configuration
//!
//! A single explicit value handed to every component at construction.
//! `from_env` is the only place the process environment is read.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::error::{CarveError, Result};

/// Regions that lack services Carve depends on
const UNAVAILABLE_REGIONS: &[&str] = &["af-south-1", "eu-south-1", "ap-east-1", "me-south-1"];

const DEFAULT_REGIONS: &[&str] = &[
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
    "ca-central-1",
    "eu-central-1",
    "eu-west-1",
    "eu-west-2",
    "eu-west-3",
    "eu-north-1",
    "ap-south-1",
    "ap-northeast-1",
    "ap-northeast-2",
    "ap-southeast-1",
    "ap-southeast-2",
    "sa-east-1",
];

/// Default lifetime of assumed-role sessions
pub const DEFAULT_SESSION_TTL_SECS: u64 = 900;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CarveConfig {
    /// Prefix applied to every managed resource name
    pub resource_prefix: String,
    /// Organization id, embedded in role and bucket names
    pub organization_id: String,
    /// Overrides the organization id in bucket names when set
    pub unique_id: Option<String>,
    /// Account that runs Carve and owns the shared per-region stacks
    pub hub_account: String,
    /// Region the Carve control plane runs in
    pub home_region: String,
    /// Regions to operate in, before removing unavailable ones
    pub regions: Vec<String>,
    pub unavailable_regions: Vec<String>,
    /// Role ARN pattern with a `*` account segment; derived when unset
    pub role_pattern: Option<String>,
    pub session_ttl_secs: u64,
    /// Bucket holding deployment templates
    pub template_bucket: String,
    pub bootstrap_template_key: String,
    pub endpoint_template_key: String,
    /// Object store prefixes for snapshots
    pub discovery_prefix: String,
    pub discovered_prefix: String,
    pub deployed_prefix: String,
    pub max_concurrency: usize,
    pub max_poll_attempts: u32,
    pub max_step_retries: u32,
}

impl Default for CarveConfig {
    fn default() -> Self {
        Self {
            resource_prefix: String::new(),
            organization_id: String::new(),
            unique_id: None,
            hub_account: String::new(),
            home_region: "us-east-1".to_string(),
            regions: DEFAULT_REGIONS.iter().map(|r| r.to_string()).collect(),
            unavailable_regions: UNAVAILABLE_REGIONS.iter().map(|r| r.to_string()).collect(),
            role_pattern: None,
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
            template_bucket: String::new(),
            bootstrap_template_key: "deployment/carve-vpc-endpoint-bootstrap.cfn.yml".to_string(),
            endpoint_template_key: "deployment/carve-vpc.sam.yml".to_string(),
            discovery_prefix: "discovery/".to_string(),
            discovered_prefix: "discovered/".to_string(),
            deployed_prefix: "deployment/deployed_graphs/".to_string(),
            max_concurrency: 16,
            max_poll_attempts: 120,
            max_step_retries: 3,
        }
    }
}

impl CarveConfig {
    /// Build a configuration from `CARVE_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = env::var("CARVE_RESOURCE_PREFIX") {
            config.resource_prefix = v;
        }
        if let Ok(v) = env::var("CARVE_ORGANIZATION_ID") {
            config.organization_id = v;
        }
        config.unique_id = env::var("CARVE_UNIQUE_ID").ok().filter(|v| !v.is_empty());
        if let Ok(v) = env::var("CARVE_HUB_ACCOUNT") {
            config.hub_account = v;
        }
        if let Ok(v) = env::var("CARVE_HOME_REGION") {
            config.home_region = v;
        }
        if let Ok(v) = env::var("CARVE_REGIONS") {
            let regions = split_list(&v);
            if !regions.is_empty() {
                config.regions = regions;
            }
        }
        config.role_pattern = env::var("CARVE_ROLE_PATTERN").ok().filter(|v| !v.is_empty());
        if let Some(ttl) = env::var("CARVE_SESSION_TTL")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            config.session_ttl_secs = ttl;
        }
        if let Ok(v) = env::var("CARVE_TEMPLATE_BUCKET") {
            config.template_bucket = v;
        }
        if let Some(n) = env::var("CARVE_MAX_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
        {
            config.max_concurrency = n.max(1);
        }

        config
    }

    /// Hub account id; cleanup cannot protect the shared stacks without it
    pub fn require_hub_account(&self) -> Result<&str> {
        let hub = self.hub_account.trim();
        if hub.is_empty() {
            return Err(CarveError::Config(
                "hub account is not set (CARVE_HUB_ACCOUNT)".to_string(),
            ));
        }
        Ok(hub)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    /// Configured regions minus the unavailable ones, in configured order
    pub fn enabled_regions(&self) -> Vec<String> {
        self.regions
            .iter()
            .filter(|r| !self.unavailable_regions.contains(r))
            .cloned()
            .collect()
    }

    /// Prefix shared by every stack Carve manages
    pub fn managed_prefix(&self) -> String {
        format!("{}carve-managed-", self.resource_prefix)
    }

    /// Endpoint stack deployed for one network
    pub fn endpoint_stack_name(&self, network_id: &str) -> String {
        format!("{}endpoint-{}", self.managed_prefix(), network_id)
    }

    /// Shared private link stack in the hub account, one per region
    pub fn privatelink_stack_name(&self, region: &str) -> String {
        format!("{}privatelink-{}", self.managed_prefix(), region)
    }

    /// Shared storage stack in the hub account, one per region
    pub fn bucket_stack_name(&self, region: &str) -> String {
        format!("{}bucket-{}", self.managed_prefix(), region)
    }

    /// Bucket backing `bucket_stack_name(region)`
    pub fn managed_bucket_name(&self, region: &str) -> String {
        let unique = self
            .unique_id
            .as_deref()
            .unwrap_or(self.organization_id.as_str());
        format!(
            "{}carve-managed-bucket-{}-{}",
            self.resource_prefix, unique, region
        )
    }

    /// Role pattern to assume in member accounts
    pub fn role_pattern(&self) -> String {
        self.role_pattern.clone().unwrap_or_else(|| {
            format!(
                "arn:aws:iam::*:role/{}carve-lambda-{}",
                self.resource_prefix, self.organization_id
            )
        })
    }

    pub fn bootstrap_template_url(&self) -> String {
        self.template_url(&self.bootstrap_template_key)
    }

    pub fn endpoint_template_url(&self) -> String {
        self.template_url(&self.endpoint_template_key)
    }

    fn template_url(&self, key: &str) -> String {
        format!("https://s3.amazonaws.com/{}/{}", self.template_bucket, key)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CarveConfig {
        CarveConfig {
            resource_prefix: "acme-".to_string(),
            organization_id: "o-abc123".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_stack_names_share_managed_prefix() {
        let cfg = config();
        let prefix = cfg.managed_prefix();
        assert_eq!(prefix, "acme-carve-managed-");
        assert_eq!(
            cfg.endpoint_stack_name("vpc-0a1b"),
            "acme-carve-managed-endpoint-vpc-0a1b"
        );
        assert!(cfg.privatelink_stack_name("us-east-1").starts_with(&prefix));
        assert!(cfg.bucket_stack_name("us-east-1").starts_with(&prefix));
    }

    #[test]
    fn test_bucket_name_prefers_unique_id() {
        let mut cfg = config();
        assert_eq!(
            cfg.managed_bucket_name("eu-west-1"),
            "acme-carve-managed-bucket-o-abc123-eu-west-1"
        );

        cfg.unique_id = Some("u42".to_string());
        assert_eq!(
            cfg.managed_bucket_name("eu-west-1"),
            "acme-carve-managed-bucket-u42-eu-west-1"
        );
    }

    #[test]
    fn test_default_role_pattern() {
        let cfg = config();
        assert_eq!(
            cfg.role_pattern(),
            "arn:aws:iam::*:role/acme-carve-lambda-o-abc123"
        );
    }

    #[test]
    fn test_enabled_regions_drop_unavailable() {
        let cfg = CarveConfig {
            regions: vec![
                "us-east-1".to_string(),
                "af-south-1".to_string(),
                "eu-west-1".to_string(),
            ],
            ..Default::default()
        };
        assert_eq!(cfg.enabled_regions(), vec!["us-east-1", "eu-west-1"]);
    }

    #[test]
    fn test_require_hub_account() {
        assert!(matches!(config().require_hub_account(), Err(CarveError::Config(_))));

        let cfg = CarveConfig {
            hub_account: " 123456789012 ".to_string(),
            ..config()
        };
        assert_eq!(cfg.require_hub_account().unwrap(), "123456789012");
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list(" a, b,,c "), vec!["a", "b", "c"]);
        assert!(split_list("").is_empty());
    }
}
