//! Secret store backends
//!
//! Three backends share one capability: the OS keychain (via `keyring`),
//! an in-memory vault holding scoped records, and the runtime cache of
//! secrets typed in during this process.

use crate::models::{CredentialRecord, CredentialSourceKind, ScopeKey, SecretKind};
use crate::utils::error::{Result, SshSessionError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;

/// Account used for private key passphrases in the keychain
const KEY_PASSPHRASE_ACCOUNT: &str = "user";

/// Storage for secrets keyed by scope
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Source this store reports hits as
    fn source(&self) -> CredentialSourceKind;

    async fn get(&self, kind: SecretKind, scope: &ScopeKey) -> Result<Option<String>>;

    async fn set(&self, kind: SecretKind, scope: &ScopeKey, secret: &str) -> Result<()>;

    async fn delete(&self, kind: SecretKind, scope: &ScopeKey) -> Result<()>;

    /// All records of `kind`; stores that cannot enumerate return nothing
    async fn list(&self, _kind: SecretKind) -> Result<Vec<CredentialRecord>> {
        Ok(Vec::new())
    }
}

/// OS-native secret store
pub struct KeychainStore {
    timeout: Duration,
}

impl KeychainStore {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Keychain service name: `ssh@host` or `ssh@host:port`, `ssh-private-key:id` for passphrases
    pub fn service_key(kind: SecretKind, scope: &ScopeKey) -> String {
        match kind {
            SecretKind::Password => match scope.port {
                Some(port) => format!("ssh@{}:{}", scope.host, port),
                None => format!("ssh@{}", scope.host),
            },
            SecretKind::KeyPassphrase => format!("ssh-private-key:{}", scope.host),
        }
    }

    fn account(kind: SecretKind, scope: &ScopeKey) -> Option<String> {
        match kind {
            SecretKind::Password => scope.user.clone(),
            SecretKind::KeyPassphrase => Some(KEY_PASSPHRASE_ACCOUNT.to_string()),
        }
    }

    /// Run a blocking keyring call off the runtime, bounded by the store timeout
    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> std::result::Result<T, keyring::Error> + Send + 'static,
    {
        let task = tokio::task::spawn_blocking(op);
        match tokio::time::timeout(self.timeout, task).await {
            Err(_) => Err(SshSessionError::SecretStoreTimeout),
            Ok(Err(join)) => Err(SshSessionError::SecretStoreUnavailable(join.to_string())),
            Ok(Ok(Err(e))) => Err(SshSessionError::SecretStoreUnavailable(e.to_string())),
            Ok(Ok(Ok(value))) => Ok(value),
        }
    }
}

impl Default for KeychainStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

#[async_trait]
impl SecretStore for KeychainStore {
    fn source(&self) -> CredentialSourceKind {
        CredentialSourceKind::Keychain
    }

    async fn get(&self, kind: SecretKind, scope: &ScopeKey) -> Result<Option<String>> {
        let Some(account) = Self::account(kind, scope) else {
            return Ok(None);
        };
        let service = Self::service_key(kind, scope);
        tracing::debug!("Keychain get: service={}, account={}", service, account);

        self.run(move || {
            let entry = keyring::Entry::new(&service, &account)?;
            match entry.get_password() {
                Ok(secret) => Ok(Some(secret)),
                Err(keyring::Error::NoEntry) => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn set(&self, kind: SecretKind, scope: &ScopeKey, secret: &str) -> Result<()> {
        let account = Self::account(kind, scope)
            .ok_or_else(|| SshSessionError::SecretStoreUnavailable("no account for keychain entry".into()))?;
        let service = Self::service_key(kind, scope);
        let secret = secret.to_string();
        tracing::info!("Keychain store: service={}, account={}", service, account);

        self.run(move || keyring::Entry::new(&service, &account)?.set_password(&secret))
            .await
    }

    async fn delete(&self, kind: SecretKind, scope: &ScopeKey) -> Result<()> {
        let Some(account) = Self::account(kind, scope) else {
            return Ok(());
        };
        let service = Self::service_key(kind, scope);

        self.run(move || {
            let entry = keyring::Entry::new(&service, &account)?;
            match entry.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                Err(e) => Err(e),
            }
        })
        .await
    }
}

/// In-memory scoped record store
///
/// Lookups use scope matching, so a record saved without a port answers
/// queries for any port on that host.
pub struct MemoryStore {
    source: CredentialSourceKind,
    records: Mutex<Vec<CredentialRecord>>,
}

impl MemoryStore {
    pub fn new(source: CredentialSourceKind) -> Self {
        Self {
            source,
            records: Mutex::new(Vec::new()),
        }
    }

    /// Vault-style store
    pub fn vault() -> Self {
        Self::new(CredentialSourceKind::Vault)
    }

    /// Secrets entered during this process
    pub fn runtime() -> Self {
        Self::new(CredentialSourceKind::Runtime)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    fn insert(&self, kind: SecretKind, scope: &ScopeKey, secret: &str) {
        let mut records = self.records.lock();
        records.retain(|r| !(r.kind == kind && r.scope == *scope));
        records.push(CredentialRecord {
            source: self.source,
            kind,
            scope: scope.clone(),
            secret: secret.to_string(),
        });
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    fn source(&self) -> CredentialSourceKind {
        self.source
    }

    async fn get(&self, kind: SecretKind, scope: &ScopeKey) -> Result<Option<String>> {
        let records = self.records.lock();
        Ok(records
            .iter()
            .find(|r| r.kind == kind && scope.matches(&r.scope))
            .map(|r| r.secret.clone()))
    }

    async fn set(&self, kind: SecretKind, scope: &ScopeKey, secret: &str) -> Result<()> {
        self.insert(kind, scope, secret);
        Ok(())
    }

    async fn delete(&self, kind: SecretKind, scope: &ScopeKey) -> Result<()> {
        self.records.lock().retain(|r| !(r.kind == kind && r.scope == *scope));
        Ok(())
    }

    async fn list(&self, kind: SecretKind) -> Result<Vec<CredentialRecord>> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect())
    }
}
