//! Hierarchy Resolution
//!
//! Resolves an account into its effective chain (itself, plus its parent for
//! a delegated sub-account) and the configuration actually enforced for it.
//!
//! Resolutions are cached for a short TTL. The cache only serves
//! configuration (permissions and ceilings); the ledger re-reads balances on
//! every reservation, so a stale entry can never admit spend past the
//! authoritative balance.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::account::{Account, ResourceLimits};
use crate::clock::Clock;
use crate::error::QuotaError;
use crate::permission::PermissionSet;
use crate::store::{AccountStore, StoreTimeout};

/// Resolver cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HierarchyConfig {
    /// Lifetime of a cached resolution
    pub cache_ttl_secs: u64,

    /// Entries kept before the cache is pruned
    pub cache_capacity: usize,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 30,
            cache_capacity: 10_000,
        }
    }
}

/// Hierarchy-adjusted ceilings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveLimits {
    /// Field-wise tightest of the account's and its parent's limits
    pub limits: ResourceLimits,

    /// Smaller of the account's and its parent's available balance at
    /// resolution time; informational, the ledger decides admission
    pub monthly_tokens_available: u64,
}

/// Effective account chain and configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHierarchy {
    pub account: Account,
    pub parent: Option<Account>,
    pub effective_permissions: PermissionSet,
    pub effective_limits: EffectiveLimits,
}

impl ResolvedHierarchy {
    /// Build the effective view of `account` under `parent`
    pub fn new(account: Account, parent: Option<Account>) -> Self {
        let (effective_permissions, limits, available) = match &parent {
            Some(parent) => (
                account.permissions.restrict_to(&parent.permissions),
                account.limits.tightest(&parent.limits),
                account.available().min(parent.available()),
            ),
            None => (
                account.permissions.clone(),
                account.limits,
                account.available(),
            ),
        };
        Self {
            account,
            parent,
            effective_permissions,
            effective_limits: EffectiveLimits {
                limits,
                monthly_tokens_available: available,
            },
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account.id
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent.as_ref().map(|p| p.id.as_str())
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    resolved: ResolvedHierarchy,
    cached_at: DateTime<Utc>,
}

/// Account-chain resolver with a TTL cache
pub struct HierarchyResolver {
    accounts: Arc<dyn AccountStore>,
    timeout: StoreTimeout,
    clock: Arc<dyn Clock>,
    config: HierarchyConfig,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl std::fmt::Debug for HierarchyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HierarchyResolver")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HierarchyResolver {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        config: HierarchyConfig,
        timeout: StoreTimeout,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            accounts,
            timeout,
            clock,
            config,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve `account_id` into its effective chain and configuration
    ///
    /// Fails with `AccountNotFound` for an unknown id and `HierarchyInvalid`
    /// when the stored chain breaks the two-level rule.
    pub async fn resolve(&self, account_id: &str) -> Result<ResolvedHierarchy, QuotaError> {
        let now = self.clock.now();
        if let Some(hit) = self.cached(account_id, now).await {
            return Ok(hit);
        }

        let account = self
            .load(account_id)
            .await?
            .ok_or_else(|| QuotaError::AccountNotFound(account_id.to_string()))?;

        let parent = match account.parent_id.as_deref() {
            None => None,
            Some(parent_id) if parent_id == account.id => {
                return Err(QuotaError::HierarchyInvalid(format!(
                    "account '{account_id}' is its own parent"
                )));
            }
            Some(parent_id) => {
                let parent = self.load(parent_id).await?.ok_or_else(|| {
                    QuotaError::HierarchyInvalid(format!(
                        "parent '{parent_id}' of '{account_id}' does not exist"
                    ))
                })?;
                if !parent.is_top_level() {
                    return Err(QuotaError::HierarchyInvalid(format!(
                        "parent '{parent_id}' of '{account_id}' is itself a sub-account"
                    )));
                }
                Some(parent)
            }
        };

        let resolved = ResolvedHierarchy::new(account, parent);
        self.store_cached(resolved.clone(), now).await;
        Ok(resolved)
    }

    /// Drop cached resolutions of `account_id` and of its sub-accounts
    pub async fn invalidate(&self, account_id: &str) {
        let mut cache = self.cache.write().await;
        cache.retain(|id, entry| {
            id != account_id && entry.resolved.parent_id() != Some(account_id)
        });
        debug!(account_id = %account_id, "Hierarchy cache invalidated");
    }

    /// Number of cached resolutions
    pub async fn cached_len(&self) -> usize {
        self.cache.read().await.len()
    }

    async fn load(&self, id: &str) -> Result<Option<Account>, QuotaError> {
        Ok(self
            .timeout
            .run("load_account", self.accounts.load_account(id))
            .await?)
    }

    fn ttl(&self) -> Duration {
        Duration::seconds(self.config.cache_ttl_secs.min(i64::MAX as u64) as i64)
    }

    async fn cached(&self, account_id: &str, now: DateTime<Utc>) -> Option<ResolvedHierarchy> {
        let cache = self.cache.read().await;
        let entry = cache.get(account_id)?;
        (now < entry.cached_at + self.ttl()).then(|| entry.resolved.clone())
    }

    async fn store_cached(&self, resolved: ResolvedHierarchy, now: DateTime<Utc>) {
        if self.config.cache_ttl_secs == 0 {
            return;
        }
        let ttl = self.ttl();
        let mut cache = self.cache.write().await;
        if cache.len() >= self.config.cache_capacity {
            cache.retain(|_, entry| now < entry.cached_at + ttl);
            if cache.len() >= self.config.cache_capacity {
                cache.clear();
            }
        }
        cache.insert(
            resolved.account.id.clone(),
            CacheEntry {
                resolved,
                cached_at: now,
            },
        );
    }
}
