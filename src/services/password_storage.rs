//! Saving and loading stored SSH secrets
//!
//! Passwords go to the vault when one is enabled, otherwise to the OS
//! keychain. When the keychain cannot take a password it is kept in the
//! profile's plaintext field instead. Loading a keychain hit clears that
//! field so the secret lives in one place only.

use super::config_service::ProfileStore;
use super::secret_store::SecretStore;
use crate::models::{ScopeKey, SecretKind, SshProfile};
use crate::utils::error::{Result, SshSessionError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Where a saved password ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredIn {
    Vault,
    Keychain,
    Profile,
}

pub struct PasswordStorage {
    keychain: Arc<dyn SecretStore>,
    vault: Option<Arc<dyn SecretStore>>,
    profiles: Arc<dyn ProfileStore>,
    timeout: Duration,
}

impl PasswordStorage {
    pub fn new(keychain: Arc<dyn SecretStore>, profiles: Arc<dyn ProfileStore>) -> Self {
        Self {
            keychain,
            vault: None,
            profiles,
            timeout: Duration::from_secs(3),
        }
    }

    /// Route every secret through `vault` instead of the keychain
    pub fn with_vault(mut self, vault: Arc<dyn SecretStore>) -> Self {
        self.vault = Some(vault);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn vault_enabled(&self) -> bool {
        self.vault.is_some()
    }

    pub async fn save_password(
        &self,
        profile: &mut SshProfile,
        password: &str,
        username: Option<&str>,
    ) -> Result<StoredIn> {
        let account = account_for(profile, username);

        if let Some(vault) = &self.vault {
            vault
                .set(SecretKind::Password, &scope_for(profile, account.as_deref()), password)
                .await?;
            self.clear_plaintext(profile)?;
            return Ok(StoredIn::Vault);
        }

        let Some(account) = account else {
            return self.keep_plaintext(profile, password);
        };

        let scope = scope_for(profile, Some(&account));
        match self
            .bounded(self.keychain.set(SecretKind::Password, &scope, password))
            .await
        {
            Ok(()) => {
                self.clear_plaintext(profile)?;
                tracing::info!("Saved password for {} in the keychain", scope);
                Ok(StoredIn::Keychain)
            }
            Err(e) => {
                tracing::warn!("Keychain failed to save password, falling back to profile: {}", e);
                self.keep_plaintext(profile, password)
            }
        }
    }

    pub async fn delete_password(&self, profile: &mut SshProfile, username: Option<&str>) -> Result<()> {
        let account = account_for(profile, username);
        let had_plaintext = profile.password.take().is_some();

        if let Some(vault) = &self.vault {
            vault
                .delete(SecretKind::Password, &scope_for(profile, account.as_deref()))
                .await?;
        } else if let Some(account) = account {
            let scope = scope_for(profile, Some(&account));
            if let Err(e) = self.bounded(self.keychain.delete(SecretKind::Password, &scope)).await {
                tracing::warn!("Keychain failed to delete password for {}: {}", scope, e);
            }
        }

        if had_plaintext {
            if let Err(e) = self.profiles.save_profile(profile) {
                tracing::warn!("Could not save profile {}: {}", profile.name, e);
            }
        }
        Ok(())
    }

    /// Stored password for `profile`, if any
    pub async fn load_password(&self, profile: &mut SshProfile, username: Option<&str>) -> Result<Option<String>> {
        let account = account_for(profile, username);

        if let Some(vault) = &self.vault {
            return vault
                .get(SecretKind::Password, &scope_for(profile, account.as_deref()))
                .await;
        }

        let Some(account) = account else {
            return Ok(profile.password.clone());
        };

        let scope = scope_for(profile, Some(&account));
        match self.bounded(self.keychain.get(SecretKind::Password, &scope)).await {
            Ok(Some(password)) => {
                if profile.password.is_some() {
                    tracing::info!("Password for {} now lives in the keychain", scope);
                    self.clear_plaintext(profile)?;
                }
                Ok(Some(password))
            }
            Ok(None) => Ok(profile.password.clone()),
            Err(e) => {
                tracing::warn!("Could not load password from keychain: {}", e);
                Ok(profile.password.clone())
            }
        }
    }

    pub async fn save_private_key_passphrase(&self, key_id: &str, passphrase: &str) -> Result<()> {
        let scope = ScopeKey::private_key(key_id);
        match &self.vault {
            Some(vault) => vault.set(SecretKind::KeyPassphrase, &scope, passphrase).await,
            None => {
                self.bounded(self.keychain.set(SecretKind::KeyPassphrase, &scope, passphrase))
                    .await
            }
        }
    }

    pub async fn delete_private_key_passphrase(&self, key_id: &str) -> Result<()> {
        let scope = ScopeKey::private_key(key_id);
        match &self.vault {
            Some(vault) => vault.delete(SecretKind::KeyPassphrase, &scope).await,
            None => self.bounded(self.keychain.delete(SecretKind::KeyPassphrase, &scope)).await,
        }
    }

    /// Stored passphrase for a private key; store failures read as none
    pub async fn load_private_key_passphrase(&self, key_id: &str) -> Option<String> {
        let scope = ScopeKey::private_key(key_id);
        let found = match &self.vault {
            Some(vault) => vault.get(SecretKind::KeyPassphrase, &scope).await,
            None => self.bounded(self.keychain.get(SecretKind::KeyPassphrase, &scope)).await,
        };
        found.unwrap_or_else(|e| {
            tracing::debug!("Passphrase lookup for {} failed: {}", key_id, e);
            None
        })
    }

    fn keep_plaintext(&self, profile: &mut SshProfile, password: &str) -> Result<StoredIn> {
        profile.password = Some(password.to_string());
        self.profiles.save_profile(profile)?;
        tracing::info!("Saved password in profile {}", profile.name);
        Ok(StoredIn::Profile)
    }

    fn clear_plaintext(&self, profile: &mut SshProfile) -> Result<()> {
        if profile.password.take().is_some() {
            self.profiles.save_profile(profile)?;
        }
        Ok(())
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .unwrap_or(Err(SshSessionError::SecretStoreTimeout))
    }
}

fn account_for(profile: &SshProfile, username: Option<&str>) -> Option<String> {
    username
        .map(str::to_string)
        .or_else(|| Some(profile.username.clone()))
        .filter(|u| !u.is_empty())
}

fn scope_for(profile: &SshProfile, account: Option<&str>) -> ScopeKey {
    let scope = ScopeKey::new(profile.host.clone(), profile.port);
    match account {
        Some(user) => scope.with_user(user),
        None => scope,
    }
}
