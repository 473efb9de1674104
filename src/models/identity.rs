use super::SshProfile;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Multiplexer lookup key for an SSH transport
///
/// Two shared identities are equal when host, port and effective user match.
/// A unique identity never equals anything but itself, which keeps a
/// dedicated transport out of reach of other tabs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ConnectionIdentity {
    Shared { host: String, port: u16, user: String },
    Unique { token: Uuid },
}

impl ConnectionIdentity {
    pub fn shared(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self::Shared {
            host: host.into().to_ascii_lowercase(),
            port,
            user: user.into(),
        }
    }

    pub fn unique() -> Self {
        Self::Unique { token: Uuid::new_v4() }
    }

    /// Identity a profile resolves to; a fresh unique token when reuse is off
    pub fn for_profile(profile: &SshProfile, reuse_allowed: bool) -> Self {
        if reuse_allowed && profile.reuse_session {
            Self::shared(profile.host.clone(), profile.effective_port(), profile.username.clone())
        } else {
            Self::unique()
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, Self::Shared { .. })
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared { host, port, user } => write!(f, "{}@{}:{}", user, host, port),
            Self::Unique { token } => write!(f, "dedicated:{}", token),
        }
    }
}
