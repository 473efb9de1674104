pub mod auth;
pub mod credential;
pub mod identity;
pub mod log;
pub mod profile;
pub mod session;

// Re-export main types
pub use auth::AuthMethod;
pub use credential::{CredentialRecord, CredentialSourceKind, ResolvedCredential, ScopeKey, SecretKind};
pub use identity::ConnectionIdentity;
pub use log::{LogLevel, SessionEvent, SessionLog};
pub use profile::{SshProfile, DEFAULT_SSH_PORT};
pub use session::{ChannelState, ServiceMessage, ServiceMessageKind, SessionInfo, SessionState};
