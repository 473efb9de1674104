use thiserror::Error;

#[derive(Debug, Error)]
pub enum SshSessionError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Jump host unresolved: {0}")]
    JumpHostUnresolved(String),

    #[error("Could not open forwarded channel through jump host: {0}")]
    JumpChannelFailed(String),

    #[error("Jump host chain loops back on itself: {0}")]
    JumpChainCycle(String),

    #[error("A keyboard-interactive prompt is already outstanding for this session")]
    ConcurrentPromptViolation,

    #[error("Expected {expected} keyboard-interactive answers, got {got}")]
    InvalidResponseShape { expected: usize, got: usize },

    #[error("Secret store did not answer in time")]
    SecretStoreTimeout,

    #[error("Secret store unavailable: {0}")]
    SecretStoreUnavailable(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Session destroyed")]
    SessionDestroyed,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    #[error("Invalid port number: {0}")]
    InvalidPort(u16),

    #[error("Invalid host address: {0}")]
    InvalidHost(String),

    #[error("Private key file not found: {0}")]
    KeyFileNotFound(String),

    #[error("Private key file permissions too open: {0}")]
    KeyFilePermission(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] toml::de::Error),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::ser::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SshSessionError>;

impl From<russh::Error> for SshSessionError {
    fn from(err: russh::Error) -> Self {
        Self::TransportError(err.to_string())
    }
}

impl SshSessionError {
    /// Errors that tear down the session they were raised on
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentPromptViolation
                | Self::TransportError(_)
                | Self::AuthenticationFailed(_)
                | Self::JumpHostUnresolved(_)
                | Self::JumpChannelFailed(_)
                | Self::JumpChainCycle(_)
        )
    }

    /// Secret store failures are reported as "no credential", never as a hard error
    pub fn is_credential_miss(&self) -> bool {
        matches!(self, Self::SecretStoreTimeout | Self::SecretStoreUnavailable(_))
    }

    /// Copy of this error for a second caller awaiting the same in-flight start
    pub fn for_waiter(&self) -> Self {
        match self {
            Self::AuthenticationFailed(m) => Self::AuthenticationFailed(m.clone()),
            Self::TransportError(m) => Self::TransportError(m.clone()),
            Self::JumpHostUnresolved(m) => Self::JumpHostUnresolved(m.clone()),
            Self::JumpChannelFailed(m) => Self::JumpChannelFailed(m.clone()),
            Self::JumpChainCycle(m) => Self::JumpChainCycle(m.clone()),
            Self::ConcurrentPromptViolation => Self::ConcurrentPromptViolation,
            Self::InvalidResponseShape { expected, got } => Self::InvalidResponseShape {
                expected: *expected,
                got: *got,
            },
            Self::SecretStoreTimeout => Self::SecretStoreTimeout,
            Self::SecretStoreUnavailable(m) => Self::SecretStoreUnavailable(m.clone()),
            Self::Cancelled => Self::Cancelled,
            Self::SessionDestroyed => Self::SessionDestroyed,
            Self::ChannelClosed => Self::ChannelClosed,
            Self::ProfileNotFound(m) => Self::ProfileNotFound(m.clone()),
            Self::InvalidPort(p) => Self::InvalidPort(*p),
            Self::InvalidHost(m) => Self::InvalidHost(m.clone()),
            Self::KeyFileNotFound(m) => Self::KeyFileNotFound(m.clone()),
            Self::KeyFilePermission(m) => Self::KeyFilePermission(m.clone()),
            Self::ConfigError(m) => Self::ConfigError(m.clone()),
            other => Self::TransportError(other.to_string()),
        }
    }
}
