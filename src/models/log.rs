use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session lifecycle journal entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLog {
    /// Unique log entry ID
    pub id: Uuid,

    /// Transport session ID
    pub session_id: Uuid,

    /// Connection identity the session is registered under
    pub identity: String,

    /// Profile name
    pub profile_name: String,

    /// Log level
    pub level: LogLevel,

    /// Event type
    pub event: SessionEvent,

    /// Optional message
    pub message: Option<String>,

    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

/// Log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// Session lifecycle events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionEvent {
    /// New session registered
    Created,

    /// Existing live session handed to another consumer
    Reused { ref_count: u32 },

    /// Transport connect started
    ConnectAttempt,

    /// Jump session acquired for tunnelling
    JumpAcquired { via: String },

    /// Forwarded channel through the jump host failed
    JumpChannelFailed { via: String },

    /// Credential lookup hit
    CredentialResolved { source: String },

    /// No credential source had a secret
    CredentialMiss,

    /// Plaintext profile password moved into a secret store
    CredentialMigrated { to: String },

    /// Authentication succeeded
    AuthSuccess { method: String },

    /// Authentication failed
    AuthFailed { method: String },

    /// Keyboard-interactive prompt published
    PromptRaised { prompts: usize },

    /// Outstanding prompt cancelled by destruction
    PromptCancelled,

    /// Session reached the open state
    Opened,

    /// Start failed before open
    StartFailed,

    /// Session destroyed
    Destroyed,

    /// Shell channel opened on the session
    ShellOpened,

    /// Shell channel ended
    ShellClosed,

    /// Multiplexed attempt failed, retried on a dedicated transport
    FallbackToDedicated,
}

impl SessionLog {
    pub fn new(
        session_id: Uuid,
        identity: impl Into<String>,
        profile_name: impl Into<String>,
        level: LogLevel,
        event: SessionEvent,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            identity: identity.into(),
            profile_name: profile_name.into(),
            level,
            event,
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Format for display
    pub fn format(&self) -> String {
        let timestamp = self.timestamp.format("%Y-%m-%d %H:%M:%S");
        let level = match self.level {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
        };

        let event_desc = match &self.event {
            SessionEvent::Created => "Session created".to_string(),
            SessionEvent::Reused { ref_count } => format!("Session reused (refs: {})", ref_count),
            SessionEvent::ConnectAttempt => "Connection attempt".to_string(),
            SessionEvent::JumpAcquired { via } => format!("Tunnelling via {}", via),
            SessionEvent::JumpChannelFailed { via } => format!("Forward through {} failed", via),
            SessionEvent::CredentialResolved { source } => format!("Credential from {}", source),
            SessionEvent::CredentialMiss => "No stored credential".to_string(),
            SessionEvent::CredentialMigrated { to } => format!("Password moved to {}", to),
            SessionEvent::AuthSuccess { method } => format!("Authenticated ({})", method),
            SessionEvent::AuthFailed { method } => format!("Authentication failed ({})", method),
            SessionEvent::PromptRaised { prompts } => format!("Prompt with {} field(s)", prompts),
            SessionEvent::PromptCancelled => "Prompt cancelled".to_string(),
            SessionEvent::Opened => "Open".to_string(),
            SessionEvent::StartFailed => "Start failed".to_string(),
            SessionEvent::Destroyed => "Destroyed".to_string(),
            SessionEvent::ShellOpened => "Shell opened".to_string(),
            SessionEvent::ShellClosed => "Shell closed".to_string(),
            SessionEvent::FallbackToDedicated => "Falling back to dedicated connection".to_string(),
        };

        let msg_part = self.message.as_ref()
            .map(|m| format!(" - {}", m))
            .unwrap_or_default();

        format!(
            "[{}] {} | {} ({}) | {}{} (session: {})",
            timestamp,
            level,
            self.profile_name,
            self.identity,
            event_desc,
            msg_part,
            self.session_id
        )
    }
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}
