//! Credential resolution
//!
//! Sources are tried in order and the first hit wins. Store failures and
//! timeouts count as a miss for that source; resolution never errors.

use super::config_service::ProfileStore;
use super::secret_store::SecretStore;
use crate::models::{CredentialRecord, CredentialSourceKind, ResolvedCredential, ScopeKey, SecretKind, DEFAULT_SSH_PORT};
use crate::utils::error::{Result, SshSessionError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// One place a secret can come from
#[derive(Clone)]
pub enum CredentialSource {
    /// Typed in earlier in this process
    Runtime(Arc<dyn SecretStore>),
    /// Enumerable scoped records
    Vault(Arc<dyn SecretStore>),
    /// OS store, queried by canonical service keys
    Keychain(Arc<dyn SecretStore>),
    /// Plaintext `password` field of saved profiles
    Profile(Arc<dyn ProfileStore>),
}

impl CredentialSource {
    pub fn kind(&self) -> CredentialSourceKind {
        match self {
            Self::Runtime(_) => CredentialSourceKind::Runtime,
            Self::Vault(_) => CredentialSourceKind::Vault,
            Self::Keychain(_) => CredentialSourceKind::Keychain,
            Self::Profile(_) => CredentialSourceKind::Profile,
        }
    }

    async fn lookup(&self, scope: &ScopeKey, preferred_user: Option<&str>) -> Result<Option<ResolvedCredential>> {
        match self {
            Self::Runtime(store) | Self::Vault(store) => {
                let records = store.list(SecretKind::Password).await?;
                Ok(pick_record(&records, scope, preferred_user).map(|r| ResolvedCredential {
                    user: r
                        .scope
                        .user
                        .clone()
                        .or_else(|| preferred_user.map(str::to_string))
                        .or_else(|| scope.user.clone())
                        .unwrap_or_default(),
                    password: r.secret.clone(),
                    source: self.kind(),
                }))
            }
            Self::Keychain(store) => {
                let Some(user) = preferred_user.map(str::to_string).or_else(|| scope.user.clone()) else {
                    return Ok(None);
                };
                for key in keychain_keys(scope, &user) {
                    if let Some(password) = store.get(SecretKind::Password, &key).await? {
                        tracing::debug!("Keychain hit under {}", key);
                        return Ok(Some(ResolvedCredential {
                            user,
                            password,
                            source: CredentialSourceKind::Keychain,
                        }));
                    }
                }
                Ok(None)
            }
            Self::Profile(profiles) => {
                let Some(user) = preferred_user else {
                    return Ok(None);
                };
                let hit = profiles.list_profiles()?.into_iter().find_map(|p| {
                    let password = p.password.clone()?;
                    (p.username == user && scope.matches_endpoint(&p.scope_key())).then_some(password)
                });
                Ok(hit.map(|password| ResolvedCredential {
                    user: user.to_string(),
                    password,
                    source: CredentialSourceKind::Profile,
                }))
            }
        }
    }
}

/// First endpoint match, narrowed to the preferred user when one is given
fn pick_record<'a>(
    records: &'a [CredentialRecord],
    scope: &ScopeKey,
    preferred_user: Option<&str>,
) -> Option<&'a CredentialRecord> {
    let mut candidates = records.iter().filter(|r| scope.matches_endpoint(&r.scope));
    match preferred_user {
        Some(user) => candidates.find(|r| r.scope.user.as_deref().map_or(true, |u| u == user)),
        None => candidates.next(),
    }
}

/// Service keys tried against the OS store: host:port, bare host, host:22
fn keychain_keys(scope: &ScopeKey, user: &str) -> Vec<ScopeKey> {
    let mut keys = Vec::with_capacity(3);
    for port in [scope.port, None, Some(DEFAULT_SSH_PORT)] {
        let key = ScopeKey::new(scope.host.clone(), port).with_user(user);
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}

/// Ordered credential lookup
pub struct CredentialResolver {
    sources: Vec<CredentialSource>,
    lookup_timeout: Duration,
}

impl CredentialResolver {
    pub fn new(sources: Vec<CredentialSource>) -> Self {
        Self {
            sources,
            lookup_timeout: Duration::from_secs(3),
        }
    }

    /// Bound on each source lookup
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    /// Resolver with no sources; every lookup misses
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn sources(&self) -> &[CredentialSource] {
        &self.sources
    }

    /// Find a password for `scope`
    ///
    /// `scope.host` is required. Returns `None` when nothing matched.
    pub async fn resolve(&self, scope: &ScopeKey, preferred_user: Option<&str>) -> Option<ResolvedCredential> {
        if scope.host.is_empty() {
            tracing::warn!("Credential lookup without a host");
            return None;
        }

        for source in &self.sources {
            let kind = source.kind();
            match self.bounded(source.lookup(scope, preferred_user)).await {
                Ok(Some(found)) => {
                    tracing::info!("Credential for {} resolved from {}", scope, kind.as_str());
                    return Some(found);
                }
                Ok(None) => {}
                Err(e) if e.is_credential_miss() => {
                    tracing::warn!("{} store skipped for {}: {}", kind.as_str(), scope, e);
                }
                Err(e) => {
                    tracing::warn!("{} lookup failed for {}: {}", kind.as_str(), scope, e);
                }
            }
        }

        tracing::debug!("No stored credential for {}", scope);
        None
    }

    /// Find a private key passphrase by key id
    pub async fn resolve_passphrase(&self, key_id: &str) -> Option<String> {
        let scope = ScopeKey::private_key(key_id);
        for source in &self.sources {
            let store = match source {
                CredentialSource::Runtime(s) | CredentialSource::Vault(s) | CredentialSource::Keychain(s) => s,
                CredentialSource::Profile(_) => continue,
            };
            match self.bounded(store.get(SecretKind::KeyPassphrase, &scope)).await {
                Ok(Some(passphrase)) => return Some(passphrase),
                Ok(None) => {}
                Err(e) => tracing::warn!("Passphrase lookup in {} failed: {}", store.source().as_str(), e),
            }
        }
        None
    }

    /// Cache a secret the user typed in, so later sessions to the same scope reuse it
    pub async fn remember(&self, kind: SecretKind, scope: &ScopeKey, secret: &str) {
        for source in &self.sources {
            if let CredentialSource::Runtime(store) = source {
                if let Err(e) = store.set(kind, scope, secret).await {
                    tracing::warn!("Could not cache secret for {}: {}", scope, e);
                }
            }
        }
    }

    /// Drop a cached secret the server rejected
    pub async fn forget(&self, kind: SecretKind, scope: &ScopeKey) {
        for source in &self.sources {
            if let CredentialSource::Runtime(store) = source {
                let _ = store.delete(kind, scope).await;
            }
        }
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.lookup_timeout, fut)
            .await
            .unwrap_or(Err(SshSessionError::SecretStoreTimeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SshProfile;
    use crate::services::config_service::MemoryProfileStore;
    use crate::services::secret_store::{KeychainStore, MemoryStore};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Keyed by exact keychain service + account, like the OS store
    #[derive(Default)]
    struct ExactStore {
        entries: Mutex<HashMap<(String, String), String>>,
        queried: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SecretStore for ExactStore {
        fn source(&self) -> CredentialSourceKind {
            CredentialSourceKind::Keychain
        }

        async fn get(&self, kind: SecretKind, scope: &ScopeKey) -> Result<Option<String>> {
            let service = KeychainStore::service_key(kind, scope);
            self.queried.lock().push(service.clone());
            let account = scope.user.clone().unwrap_or_default();
            Ok(self.entries.lock().get(&(service, account)).cloned())
        }

        async fn set(&self, kind: SecretKind, scope: &ScopeKey, secret: &str) -> Result<()> {
            let key = (KeychainStore::service_key(kind, scope), scope.user.clone().unwrap_or_default());
            self.entries.lock().insert(key, secret.to_string());
            Ok(())
        }

        async fn delete(&self, _kind: SecretKind, _scope: &ScopeKey) -> Result<()> {
            Ok(())
        }
    }

    struct StuckStore;

    #[async_trait]
    impl SecretStore for StuckStore {
        fn source(&self) -> CredentialSourceKind {
            CredentialSourceKind::Keychain
        }

        async fn get(&self, _kind: SecretKind, _scope: &ScopeKey) -> Result<Option<String>> {
            std::future::pending().await
        }

        async fn set(&self, _kind: SecretKind, _scope: &ScopeKey, _secret: &str) -> Result<()> {
            Ok(())
        }

        async fn delete(&self, _kind: SecretKind, _scope: &ScopeKey) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_vault_secret_without_port_matches_port_22() {
        let vault = Arc::new(MemoryStore::vault());
        vault
            .set(SecretKind::Password, &ScopeKey::new("10.0.0.5", None).with_user("bob"), "s3cret")
            .await
            .unwrap();
        let resolver = CredentialResolver::new(vec![CredentialSource::Vault(vault)]);

        let scope = ScopeKey::new("10.0.0.5", Some(22)).with_user("bob");
        let found = resolver.resolve(&scope, Some("bob")).await.unwrap();

        assert_eq!(found.user, "bob");
        assert_eq!(found.password, "s3cret");
        assert_eq!(found.source, CredentialSourceKind::Vault);
    }

    #[tokio::test]
    async fn test_vault_secret_for_other_port_not_used_without_port() {
        let vault = Arc::new(MemoryStore::vault());
        vault
            .set(SecretKind::Password, &ScopeKey::new("srv", Some(2222)).with_user("bob"), "container-pw")
            .await
            .unwrap();
        let resolver = CredentialResolver::new(vec![CredentialSource::Vault(vault)]);

        let found = resolver.resolve(&ScopeKey::new("srv", None).with_user("bob"), Some("bob")).await;
        assert!(found.is_none());

        let found = resolver
            .resolve(&ScopeKey::new("srv", Some(2222)).with_user("bob"), Some("bob"))
            .await
            .unwrap();
        assert_eq!(found.password, "container-pw");
    }

    #[tokio::test]
    async fn test_vault_filters_by_preferred_user() {
        let vault = Arc::new(MemoryStore::vault());
        vault
            .set(SecretKind::Password, &ScopeKey::new("h", Some(22)).with_user("alice"), "a")
            .await
            .unwrap();
        vault
            .set(SecretKind::Password, &ScopeKey::new("h", Some(22)).with_user("bob"), "b")
            .await
            .unwrap();
        let resolver = CredentialResolver::new(vec![CredentialSource::Vault(vault)]);

        let scope = ScopeKey::new("h", Some(22));
        assert_eq!(resolver.resolve(&scope, Some("bob")).await.unwrap().password, "b");
        assert_eq!(resolver.resolve(&scope, None).await.unwrap().user, "alice");
    }

    #[tokio::test]
    async fn test_keychain_falls_back_to_bare_host_key() {
        let keychain = Arc::new(ExactStore::default());
        keychain
            .set(SecretKind::Password, &ScopeKey::new("srv", None).with_user("bob"), "pw")
            .await
            .unwrap();
        let resolver = CredentialResolver::new(vec![CredentialSource::Keychain(keychain.clone())]);

        let found = resolver
            .resolve(&ScopeKey::new("srv", Some(2222)), Some("bob"))
            .await
            .unwrap();
        assert_eq!(found.password, "pw");
        assert_eq!(*keychain.queried.lock(), vec!["ssh@srv:2222".to_string(), "ssh@srv".to_string()]);
    }

    #[tokio::test]
    async fn test_keychain_tries_port_22_when_no_port_given() {
        let keychain = Arc::new(ExactStore::default());
        keychain
            .set(SecretKind::Password, &ScopeKey::new("srv", Some(22)).with_user("bob"), "pw")
            .await
            .unwrap();
        let resolver = CredentialResolver::new(vec![CredentialSource::Keychain(keychain)]);

        let found = resolver.resolve(&ScopeKey::new("srv", None), Some("bob")).await;
        assert_eq!(found.map(|c| c.password), Some("pw".to_string()));
    }

    #[tokio::test]
    async fn test_stuck_store_is_a_miss() {
        let profiles = Arc::new(MemoryProfileStore::new(vec![
            SshProfile::new("A", "srv", "bob").with_password("fallback"),
        ]));
        let resolver = CredentialResolver::new(vec![
            CredentialSource::Keychain(Arc::new(StuckStore)),
            CredentialSource::Profile(profiles),
        ])
        .with_timeout(Duration::from_millis(50));

        let found = resolver.resolve(&ScopeKey::new("srv", None), Some("bob")).await.unwrap();
        assert_eq!(found.source, CredentialSourceKind::Profile);
        assert_eq!(found.password, "fallback");
    }

    #[tokio::test]
    async fn test_profile_fallback_needs_preferred_user() {
        let profiles = Arc::new(MemoryProfileStore::new(vec![
            SshProfile::new("A", "srv", "bob").with_password("fallback"),
        ]));
        let resolver = CredentialResolver::new(vec![CredentialSource::Profile(profiles)]);

        assert!(resolver.resolve(&ScopeKey::new("srv", None), None).await.is_none());
        assert!(resolver.resolve(&ScopeKey::new("srv", None), Some("bob")).await.is_some());
    }

    #[tokio::test]
    async fn test_runtime_wins_over_vault() {
        let runtime = Arc::new(MemoryStore::runtime());
        let vault = Arc::new(MemoryStore::vault());
        let scope = ScopeKey::new("h", Some(22)).with_user("u");
        vault.set(SecretKind::Password, &scope, "stored").await.unwrap();

        let resolver = CredentialResolver::new(vec![
            CredentialSource::Runtime(runtime),
            CredentialSource::Vault(vault),
        ]);
        resolver.remember(SecretKind::Password, &scope, "typed").await;

        let found = resolver.resolve(&scope, Some("u")).await.unwrap();
        assert_eq!(found.password, "typed");
        assert_eq!(found.source, CredentialSourceKind::Runtime);

        resolver.forget(SecretKind::Password, &scope).await;
        assert_eq!(resolver.resolve(&scope, Some("u")).await.unwrap().password, "stored");
    }

    #[tokio::test]
    async fn test_no_match_is_none() {
        let resolver = CredentialResolver::new(vec![CredentialSource::Vault(Arc::new(MemoryStore::vault()))]);
        assert!(resolver.resolve(&ScopeKey::new("h", None), Some("u")).await.is_none());
        assert!(resolver.resolve(&ScopeKey::new("", None), Some("u")).await.is_none());
    }

    #[tokio::test]
    async fn test_resolve_passphrase() {
        let vault = Arc::new(MemoryStore::vault());
        vault
            .set(SecretKind::KeyPassphrase, &ScopeKey::private_key("key-1"), "pp")
            .await
            .unwrap();
        let resolver = CredentialResolver::new(vec![CredentialSource::Vault(vault)]);

        assert_eq!(resolver.resolve_passphrase("key-1").await, Some("pp".to_string()));
        assert_eq!(resolver.resolve_passphrase("key-2").await, None);
    }
}
