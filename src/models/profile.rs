use super::AuthMethod;
use super::credential::ScopeKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_SSH_PORT: u16 = 22;

/// Saved SSH connection profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshProfile {
    /// Unique identifier
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,

    /// Profile name
    pub name: String,

    /// SSH host
    pub host: String,

    /// SSH port; absent means 22 on the wire but stays absent for credential scoping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Username
    pub username: String,

    /// Authentication method
    #[serde(default)]
    pub auth_method: AuthMethod,

    /// Profile to tunnel through (ProxyJump)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jump_host: Option<Uuid>,

    /// Share one transport between tabs opened on this profile
    #[serde(default = "default_reuse_session")]
    pub reuse_session: bool,

    /// Plaintext password fallback, cleared once migrated to a secret store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Per-profile override of the global close confirmation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warn_on_close: Option<bool>,

    /// Expected server host key fingerprint (SHA256)
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,

    /// Whether to verify the server's host key
    #[serde(default = "default_verify_host_key")]
    pub verify_host_key: bool,

    /// Creation timestamp
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_reuse_session() -> bool {
    true
}

fn default_verify_host_key() -> bool {
    true
}

impl SshProfile {
    pub fn new(name: impl Into<String>, host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            host: host.into(),
            port: None,
            username: username.into(),
            auth_method: AuthMethod::default(),
            jump_host: None,
            reuse_session: default_reuse_session(),
            password: None,
            warn_on_close: None,
            host_key_fingerprint: None,
            verify_host_key: default_verify_host_key(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_auth_method(mut self, auth_method: AuthMethod) -> Self {
        self.auth_method = auth_method;
        self
    }

    pub fn with_jump_host(mut self, jump_profile_id: Uuid) -> Self {
        self.jump_host = Some(jump_profile_id);
        self
    }

    pub fn with_reuse_session(mut self, reuse: bool) -> Self {
        self.reuse_session = reuse;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_host_key_verification(mut self, verify: bool, fingerprint: Option<String>) -> Self {
        self.verify_host_key = verify;
        self.host_key_fingerprint = fingerprint;
        self
    }

    /// Port used on the wire
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_SSH_PORT)
    }

    /// Credential scope for this profile, as the password was recorded
    pub fn scope_key(&self) -> ScopeKey {
        ScopeKey::new(self.host.clone(), self.port).with_user(self.username.clone())
    }

    /// Update the last modified timestamp
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Get a display string for the profile
    pub fn display_name(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.effective_port())
    }
}
