use serde::{Deserialize, Serialize};
use std::fmt;

/// Vault secret type for SSH passwords
pub const VAULT_SECRET_TYPE_PASSWORD: &str = "ssh:password";
/// Vault secret type for private key passphrases
pub const VAULT_SECRET_TYPE_PASSPHRASE: &str = "ssh:key-passphrase";

/// What a stored secret unlocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecretKind {
    Password,
    /// Scope host carries the private key id, user and port are unset
    KeyPassphrase,
}

impl SecretKind {
    pub fn vault_type(&self) -> &'static str {
        match self {
            Self::Password => VAULT_SECRET_TYPE_PASSWORD,
            Self::KeyPassphrase => VAULT_SECRET_TYPE_PASSPHRASE,
        }
    }
}

/// Where a credential came from, in resolution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CredentialSourceKind {
    /// Entered by the user earlier in this process
    Runtime,
    /// Vault-style secure store
    Vault,
    /// OS-native secret store
    Keychain,
    /// Plaintext field saved in the profile
    Profile,
}

impl CredentialSourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Runtime => "runtime",
            Self::Vault => "vault",
            Self::Keychain => "keychain",
            Self::Profile => "profile",
        }
    }

    /// Whether a hit from this source should be moved into a secret store
    pub fn should_migrate(&self) -> bool {
        matches!(self, Self::Profile)
    }
}

/// Credential scope: user, host and optional port
///
/// Matching is by value. A stored scope without a port acts as a wildcard so
/// secrets recorded before the port was known keep resolving. A query
/// without a port only matches stored scopes without one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl ScopeKey {
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            user: None,
            host: host.into(),
            port,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Scope for a private key passphrase
    pub fn private_key(key_id: impl Into<String>) -> Self {
        Self::new(key_id, None)
    }

    /// Same host and a compatible port
    pub fn matches_endpoint(&self, stored: &ScopeKey) -> bool {
        if !self.host.eq_ignore_ascii_case(&stored.host) {
            return false;
        }
        match (self.port, stored.port) {
            (Some(a), Some(b)) => a == b,
            (_, None) => true,
            (None, Some(_)) => false,
        }
    }

    /// Endpoint match plus user match when both sides name a user
    pub fn matches(&self, stored: &ScopeKey) -> bool {
        if !self.matches_endpoint(stored) {
            return false;
        }
        match (&self.user, &stored.user) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

/// A stored secret
#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub source: CredentialSourceKind,
    pub kind: SecretKind,
    pub scope: ScopeKey,
    pub secret: String,
}

impl CredentialRecord {
    pub fn password(source: CredentialSourceKind, scope: ScopeKey, secret: impl Into<String>) -> Self {
        Self {
            source,
            kind: SecretKind::Password,
            scope,
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("source", &self.source)
            .field("kind", &self.kind)
            .field("scope", &self.scope)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Result of a successful credential lookup
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedCredential {
    pub user: String,
    pub password: String,
    pub source: CredentialSourceKind,
}

impl fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedCredential")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("source", &self.source)
            .finish()
    }
}
