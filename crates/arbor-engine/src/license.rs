//! Account editions: the license client seam and a TTL cache over it.
//!
//! The cache serves stale data when a refresh fails. Only an account that was
//! never looked up successfully surfaces [`ArborError::LicenseUnavailable`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use arbor_types::{ArborError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Edition {
    Free,
    Team,
    Enterprise,
}

impl std::fmt::Display for Edition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Edition::Free => "FREE",
            Edition::Team => "TEAM",
            Edition::Enterprise => "ENTERPRISE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleLicense {
    pub module: String,
    pub edition: Edition,
}

/// The highest edition held through any module, FREE when none is paid.
pub fn resolve_edition(licenses: &[ModuleLicense]) -> Edition {
    licenses
        .iter()
        .map(|l| l.edition)
        .max()
        .unwrap_or(Edition::Free)
}

// ---------------------------------------------------------------------------
// LicenseClient
// ---------------------------------------------------------------------------

#[async_trait]
pub trait LicenseClient: Send + Sync {
    async fn module_licenses(&self, account_id: &str) -> Result<Vec<ModuleLicense>>;
}

/// Fixed editions per account, for local runs and tests.
#[derive(Debug, Clone)]
pub struct StaticLicenseClient {
    default_edition: Edition,
    accounts: HashMap<String, Edition>,
}

impl StaticLicenseClient {
    pub fn new(default_edition: Edition) -> Self {
        Self {
            default_edition,
            accounts: HashMap::new(),
        }
    }

    pub fn with_account(mut self, account_id: impl Into<String>, edition: Edition) -> Self {
        self.accounts.insert(account_id.into(), edition);
        self
    }
}

impl Default for StaticLicenseClient {
    fn default() -> Self {
        Self::new(Edition::Free)
    }
}

#[async_trait]
impl LicenseClient for StaticLicenseClient {
    async fn module_licenses(&self, account_id: &str) -> Result<Vec<ModuleLicense>> {
        let edition = self
            .accounts
            .get(account_id)
            .copied()
            .unwrap_or(self.default_edition);
        Ok(vec![ModuleLicense {
            module: "CORE".into(),
            edition,
        }])
    }
}

// ---------------------------------------------------------------------------
// EditionCache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct CachedEdition {
    edition: Edition,
    fetched_at: Instant,
}

pub struct EditionCache {
    client: Arc<dyn LicenseClient>,
    ttl: Duration,
    entries: DashMap<String, CachedEdition>,
}

impl EditionCache {
    pub fn new(client: Arc<dyn LicenseClient>, ttl: Duration) -> Self {
        Self {
            client,
            ttl,
            entries: DashMap::new(),
        }
    }

    pub async fn edition(&self, account_id: &str) -> Result<Edition> {
        let cached = self.entries.get(account_id).map(|e| *e.value());
        if let Some(entry) = cached {
            if entry.fetched_at.elapsed() < self.ttl {
                return Ok(entry.edition);
            }
        }

        match self.client.module_licenses(account_id).await {
            Ok(licenses) => {
                let edition = resolve_edition(&licenses);
                self.entries.insert(
                    account_id.to_string(),
                    CachedEdition {
                        edition,
                        fetched_at: Instant::now(),
                    },
                );
                tracing::debug!(account = %account_id, %edition, "Edition refreshed");
                Ok(edition)
            }
            Err(e) => match cached {
                Some(entry) => {
                    tracing::warn!(
                        account = %account_id,
                        edition = %entry.edition,
                        error = %e,
                        "License refresh failed, serving stale edition"
                    );
                    Ok(entry.edition)
                }
                None => Err(ArborError::LicenseUnavailable {
                    account: account_id.to_string(),
                    message: e.to_string(),
                }),
            },
        }
    }

    pub fn invalidate(&self, account_id: &str) {
        self.entries.remove(account_id);
    }
}
