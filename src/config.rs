//! Pipeline configuration.
//!
//! One `CrmConfig` is constructed at process start (from env vars, a JSON
//! file, or CLI overrides) and passed by reference into every component.
//! There is no module-level credential or setting state.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::CrmError;

/// Env var holding the CRM organization id (basic-auth username).
pub const ENV_ORG_ID: &str = "API_ORG_ID";
/// Env var holding the CRM API key (basic-auth password).
pub const ENV_API_KEY: &str = "API_API_KEY";

/// Bounded retry settings for a single request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    4_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Main extraction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrmConfig {
    /// Basic-auth username (organization id).
    pub org_id: String,
    /// Basic-auth password (API key).
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Value sent in the `NEON-API-VERSION` header.
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Page size for listing endpoints.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Worker-pool size for per-account and per-event fan-out.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Minimum wall-clock duration of one API call, in milliseconds. Calls
    /// that return faster sleep the remainder to stay under the quota.
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_base_url() -> String {
    "https://api.neoncrm.com/v2".to_string()
}

fn default_api_version() -> String {
    "2.8".to_string()
}

fn default_page_size() -> u32 {
    5000
}

fn default_max_concurrency() -> usize {
    4
}

fn default_pacing_ms() -> u64 {
    500
}

impl CrmConfig {
    /// Build a config from the environment. Credentials are required;
    /// everything else falls back to the defaults above.
    pub fn from_env() -> Result<Self, CrmError> {
        let org_id = std::env::var(ENV_ORG_ID)
            .map_err(|_| CrmError::Config(format!("{} is not set", ENV_ORG_ID)))?;
        let api_key = std::env::var(ENV_API_KEY)
            .map_err(|_| CrmError::Config(format!("{} is not set", ENV_API_KEY)))?;
        Ok(Self::new(org_id, api_key))
    }

    pub fn new(org_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            org_id: org_id.into(),
            api_key: api_key.into(),
            base_url: default_base_url(),
            api_version: default_api_version(),
            page_size: default_page_size(),
            max_concurrency: default_max_concurrency(),
            pacing_ms: default_pacing_ms(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }
}
