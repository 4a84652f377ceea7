//! Factor persistence collaborator.
//!
//! The on-disk container formats (legacy keysets, consolidated stash) are
//! owned by the storage component; the core only consumes the capability
//! "which usable factors exist for this account". Storage failures are
//! infrastructure errors and are mapped to `AuthError::Internal` at the
//! session boundary.

use crate::factor::AuthFactor;
use anyhow::{Result, bail};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

#[async_trait]
pub trait FactorStore: Send + Sync {
    /// All configured factors for the account, in stable label order.
    async fn load_factors(&self, obfuscated_account_id: &str) -> Result<Vec<AuthFactor>>;

    /// Persist a factor, replacing any existing factor with the same label.
    async fn save_factor(&self, obfuscated_account_id: &str, factor: AuthFactor) -> Result<()>;

    /// Remove the factor under `label`.
    ///
    /// # Errors
    /// Fails when no factor with that label exists.
    async fn remove_factor(&self, obfuscated_account_id: &str, label: &str) -> Result<()>;
}

/// Process-local store, used on development hosts and in tests.
pub struct InMemoryFactorStore {
    accounts: Mutex<HashMap<String, BTreeMap<String, AuthFactor>>>,
}

impl InMemoryFactorStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            accounts: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryFactorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FactorStore for InMemoryFactorStore {
    async fn load_factors(&self, obfuscated_account_id: &str) -> Result<Vec<AuthFactor>> {
        let accounts = self.accounts.lock().await;
        Ok(accounts
            .get(obfuscated_account_id)
            .map(|factors| factors.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn save_factor(&self, obfuscated_account_id: &str, factor: AuthFactor) -> Result<()> {
        let mut accounts = self.accounts.lock().await;
        accounts
            .entry(obfuscated_account_id.to_string())
            .or_default()
            .insert(factor.label.clone(), factor);
        Ok(())
    }

    async fn remove_factor(&self, obfuscated_account_id: &str, label: &str) -> Result<()> {
        let mut accounts = self.accounts.lock().await;
        let removed = accounts
            .get_mut(obfuscated_account_id)
            .and_then(|factors| factors.remove(label));
        if removed.is_none() {
            bail!("no factor with label {label:?} for account {obfuscated_account_id}");
        }
        Ok(())
    }
}
