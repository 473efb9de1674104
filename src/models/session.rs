use super::ConnectionIdentity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// SSH transport session lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Destroyed,
}

impl SessionState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(self, Self::Destroyed)
    }

    pub fn display_str(&self) -> &'static str {
        match self {
            Self::Connecting => "Connecting...",
            Self::Open => "Open",
            Self::Destroyed => "Destroyed",
        }
    }
}

/// Shell channel lifecycle, independent of the transport
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChannelState {
    NotStarted,
    Running,
    Ended,
}

/// Severity of a service message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServiceMessageKind {
    Info,
    /// Pre-auth banner sent by the server
    Banner,
    Warning,
    Error,
}

/// Structured transport-level notice for the tab to render
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceMessage {
    /// Session the notice originated on (a jump host for relayed notices)
    pub session_id: Uuid,
    pub kind: ServiceMessageKind,
    pub text: String,
}

impl ServiceMessage {
    pub fn new(session_id: Uuid, kind: ServiceMessageKind, text: impl Into<String>) -> Self {
        Self {
            session_id,
            kind,
            text: text.into(),
        }
    }
}

/// Point-in-time view of a registered session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub profile_id: Uuid,
    pub profile_name: String,
    pub identity: ConnectionIdentity,
    pub state: SessionState,
    pub ref_count: u32,
    /// Sessions this one was tunnelled through, nearest first
    pub jump_chain: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl SessionInfo {
    /// Format session age for display
    pub fn format_age(&self) -> String {
        let age = Utc::now() - self.created_at;
        let hours = age.num_hours();
        let minutes = age.num_minutes() % 60;
        let seconds = age.num_seconds() % 60;

        if hours > 0 {
            format!("{}h {}m", hours, minutes)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else {
            format!("{}s", seconds)
        }
    }
}
