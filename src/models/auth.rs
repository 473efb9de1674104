use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// SSH authentication method configured on a profile
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthMethod {
    /// Password authentication, secret resolved from the credential sources
    #[default]
    Password,
    /// Public key authentication
    PublicKey {
        private_key_path: PathBuf,
        passphrase_required: bool,
    },
    /// Server-driven challenge/response (OTP, 2FA)
    #[serde(rename = "keyboard-interactive")]
    KeyboardInteractive,
}

impl AuthMethod {
    pub fn is_password(&self) -> bool {
        matches!(self, Self::Password)
    }

    pub fn is_public_key(&self) -> bool {
        matches!(self, Self::PublicKey { .. })
    }

    pub fn is_keyboard_interactive(&self) -> bool {
        matches!(self, Self::KeyboardInteractive)
    }

    pub fn public_key(path: impl Into<PathBuf>, passphrase_required: bool) -> Self {
        Self::PublicKey {
            private_key_path: path.into(),
            passphrase_required,
        }
    }

    /// Method name as advertised in SSH_MSG_USERAUTH_FAILURE
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::PublicKey { .. } => "publickey",
            Self::KeyboardInteractive => "keyboard-interactive",
        }
    }
}
