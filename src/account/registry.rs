//! Account Registry
//!
//! Entry point for the account-management collaborator. Creation enforces
//! the two-level hierarchy rule so malformed chains never reach request
//! handling; configuration updates invalidate cached resolutions.

use std::sync::Arc;
use tracing::{debug, info};

use super::{Account, ResourceLimits};
use crate::error::{QuotaError, StoreError};
use crate::hierarchy::HierarchyResolver;
use crate::metrics;
use crate::permission::PermissionSet;
use crate::store::{AccountStore, StoreTimeout};

/// Default attempts for a conditional account update
pub const DEFAULT_MAX_CAS_RETRIES: u32 = 16;

/// Creates accounts and updates their configuration
pub struct AccountRegistry {
    accounts: Arc<dyn AccountStore>,
    resolver: Arc<HierarchyResolver>,
    timeout: StoreTimeout,
    max_cas_retries: u32,
}

impl std::fmt::Debug for AccountRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountRegistry")
            .field("max_cas_retries", &self.max_cas_retries)
            .finish_non_exhaustive()
    }
}

impl AccountRegistry {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        resolver: Arc<HierarchyResolver>,
        timeout: StoreTimeout,
    ) -> Self {
        Self {
            accounts,
            resolver,
            timeout,
            max_cas_retries: DEFAULT_MAX_CAS_RETRIES,
        }
    }

    pub fn with_max_cas_retries(mut self, retries: u32) -> Self {
        self.max_cas_retries = retries.max(1);
        self
    }

    /// Validate and store a new account
    ///
    /// The parent, if any, must exist and be top-level. Balance bookkeeping
    /// fields start from zero whatever the caller passed.
    pub async fn create_account(&self, account: Account) -> Result<Account, QuotaError> {
        if account.id.trim().is_empty() {
            return Err(QuotaError::InvalidRequest("account id is empty".to_string()));
        }
        if account.monthly_limit == 0 {
            return Err(QuotaError::InvalidRequest(format!(
                "account '{}' needs a positive monthly limit",
                account.id
            )));
        }

        if let Some(parent_id) = account.parent_id.as_deref() {
            if parent_id == account.id {
                return Err(QuotaError::HierarchyInvalid(format!(
                    "account '{}' cannot be its own parent",
                    account.id
                )));
            }
            let parent = self.load(parent_id).await?.ok_or_else(|| {
                QuotaError::HierarchyInvalid(format!("parent '{parent_id}' does not exist"))
            })?;
            if !parent.is_top_level() {
                return Err(QuotaError::HierarchyInvalid(format!(
                    "parent '{parent_id}' is a sub-account; hierarchy depth is limited to two"
                )));
            }
        }

        let account = Account {
            tokens_reserved: 0,
            pending_reservations: 0,
            version: 0,
            ..account
        };

        match self
            .timeout
            .run("insert_account", self.accounts.insert_account(&account))
            .await
        {
            Ok(()) => {}
            Err(StoreError::Conflict(id)) => {
                return Err(QuotaError::InvalidRequest(format!(
                    "account '{id}' already exists"
                )));
            }
            Err(err) => return Err(err.into()),
        }

        info!(
            account_id = %account.id,
            parent_id = ?account.parent_id,
            tier = ?account.tier,
            monthly_limit = account.monthly_limit,
            "Account created"
        );
        Ok(account)
    }

    /// Replace an account's resource limits
    pub async fn update_limits(
        &self,
        account_id: &str,
        limits: ResourceLimits,
    ) -> Result<Account, QuotaError> {
        self.update(account_id, |account| account.limits = limits)
            .await
    }

    /// Replace an account's permission set
    pub async fn update_permissions(
        &self,
        account_id: &str,
        permissions: PermissionSet,
    ) -> Result<Account, QuotaError> {
        self.update(account_id, move |account| {
            account.permissions = permissions.clone()
        })
        .await
    }

    async fn update<F>(&self, account_id: &str, apply: F) -> Result<Account, QuotaError>
    where
        F: Fn(&mut Account),
    {
        for _ in 0..self.max_cas_retries {
            let current = self
                .load(account_id)
                .await?
                .ok_or_else(|| QuotaError::AccountNotFound(account_id.to_string()))?;

            let mut next = current.clone();
            apply(&mut next);

            let swapped = self
                .timeout
                .run(
                    "swap_account",
                    self.accounts.swap_account(&next, current.version),
                )
                .await?;
            if swapped {
                self.resolver.invalidate(account_id).await;
                next.version = current.version + 1;
                debug!(account_id = %account_id, "Account configuration updated");
                return Ok(next);
            }
            metrics::CAS_CONFLICTS_TOTAL
                .with_label_values(&["account"])
                .inc();
        }

        Err(QuotaError::StoreUnavailable(format!(
            "account '{account_id}' too contended to update"
        )))
    }

    async fn load(&self, id: &str) -> Result<Option<Account>, QuotaError> {
        Ok(self
            .timeout
            .run("load_account", self.accounts.load_account(id))
            .await?)
    }
}
