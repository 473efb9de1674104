//! Transport capability consumed by the session layer
//!
//! The wire protocol lives behind these traits. `RusshTransport` is the
//! production implementation; tests script their own.

use crate::utils::error::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

/// Where to connect and how to check the server
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub verify_host_key: bool,
    pub host_key_fingerprint: Option<String>,
}

/// One authentication attempt
#[derive(Clone)]
pub enum AuthAttempt {
    Password(String),
    PublicKey {
        private_key_path: PathBuf,
        passphrase: Option<String>,
    },
    KeyboardInteractive,
}

impl AuthAttempt {
    pub fn method_name(&self) -> &'static str {
        match self {
            Self::Password(_) => "password",
            Self::PublicKey { .. } => "publickey",
            Self::KeyboardInteractive => "keyboard-interactive",
        }
    }
}

impl std::fmt::Debug for AuthAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(<redacted>)"),
            Self::PublicKey { private_key_path, passphrase } => f
                .debug_struct("PublicKey")
                .field("private_key_path", private_key_path)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
            Self::KeyboardInteractive => f.write_str("KeyboardInteractive"),
        }
    }
}

/// One field of a keyboard-interactive challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptField {
    pub prompt: String,
    /// true = show input, false = mask it
    pub echo: bool,
}

impl PromptField {
    pub fn new(prompt: impl Into<String>, echo: bool) -> Self {
        Self {
            prompt: prompt.into(),
            echo,
        }
    }
}

/// Server-issued keyboard-interactive challenge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Challenge {
    pub name: String,
    pub instructions: String,
    pub prompts: Vec<PromptField>,
}

/// Server verdict on an authentication step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Success,
    Rejected {
        /// Methods the server still accepts
        remaining_methods: Vec<String>,
    },
    Challenge(Challenge),
}

/// Transport-level notice raised after connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportNotice {
    Banner(String),
    Disconnected(String),
    /// Challenge raised outside an authentication round
    Challenge(Challenge),
}

pub type NoticeSender = mpsc::UnboundedSender<TransportNotice>;

/// Channel to open on an authenticated connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSpec {
    /// Interactive session channel (PTY + shell)
    Session,
    /// Forwarded TCP channel, used to reach the next hop of a jump chain
    DirectTcpip {
        host: String,
        port: u16,
        originator_host: String,
        originator_port: u16,
    },
}

impl ChannelSpec {
    pub fn direct_tcpip(host: impl Into<String>, port: u16) -> Self {
        Self::DirectTcpip {
            host: host.into(),
            port,
            originator_host: "127.0.0.1".to_string(),
            originator_port: 0,
        }
    }
}

/// What a channel read produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Data(Vec<u8>),
    ExtendedData(Vec<u8>),
    ExitStatus(u32),
    Eof,
    Closed,
}

/// Byte stream an outer transport can run over
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelStream for T {}

/// Opens connections
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to `target`, directly or over `tunnel` when given
    async fn connect(
        &self,
        target: &ConnectTarget,
        tunnel: Option<Box<dyn TunnelStream>>,
        notices: NoticeSender,
    ) -> Result<Box<dyn TransportConnection>>;
}

/// A connected (possibly not yet authenticated) transport
#[async_trait]
pub trait TransportConnection: Send + Sync {
    async fn authenticate(&mut self, user: &str, attempt: AuthAttempt) -> Result<AuthOutcome>;

    /// Answer the last keyboard-interactive challenge
    async fn respond_keyboard_interactive(&mut self, answers: Vec<String>) -> Result<AuthOutcome>;

    async fn open_channel(&self, spec: ChannelSpec) -> Result<Box<dyn TransportChannel>>;

    async fn disconnect(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// An open channel
#[async_trait]
pub trait TransportChannel: Send {
    async fn request_pty(&mut self, term: &str, cols: u32, rows: u32) -> Result<()>;

    async fn request_shell(&mut self) -> Result<()>;

    async fn write(&mut self, data: &[u8]) -> Result<()>;

    async fn window_change(&mut self, cols: u32, rows: u32) -> Result<()>;

    /// Next event; `None` once the channel is gone
    async fn read(&mut self) -> Option<ChannelEvent>;

    async fn close(&mut self) -> Result<()>;

    /// Turn a forwarded channel into a stream for the next hop
    fn into_stream(self: Box<Self>) -> Box<dyn TunnelStream>;
}
