//! russh-backed transport

use super::config_service::SshSettings;
use super::transport::{
    AuthAttempt, AuthOutcome, Challenge, ChannelEvent, ChannelSpec, ConnectTarget, NoticeSender, PromptField,
    Transport, TransportChannel, TransportConnection, TransportNotice, TunnelStream,
};
use crate::utils::error::{Result, SshSessionError};
use async_trait::async_trait;
use russh::client::{self, AuthResult, DisconnectReason, Handle, KeyboardInteractiveAuthResponse, Msg};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, ChannelMsg, Disconnect, MethodKind, MethodSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Missed keepalives before the server is considered gone
const KEEPALIVE_MAX: usize = 3;

/// Production transport speaking SSH through russh
pub struct RusshTransport {
    keepalive_interval: Option<Duration>,
}

impl RusshTransport {
    pub fn new(settings: &SshSettings) -> Self {
        Self {
            keepalive_interval: Some(settings.keepalive_interval()).filter(|d| !d.is_zero()),
        }
    }

    fn client_config(&self) -> Arc<client::Config> {
        Arc::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: self.keepalive_interval,
            keepalive_max: KEEPALIVE_MAX,
            ..<client::Config as Default>::default()
        })
    }
}

#[async_trait]
impl Transport for RusshTransport {
    async fn connect(
        &self,
        target: &ConnectTarget,
        tunnel: Option<Box<dyn TunnelStream>>,
        notices: NoticeSender,
    ) -> Result<Box<dyn TransportConnection>> {
        let handler = ClientHandler {
            host: target.host.clone(),
            verify_host_key: target.verify_host_key,
            expected_fingerprint: target.host_key_fingerprint.clone(),
            notices,
        };
        let config = self.client_config();

        let handle = match tunnel {
            Some(stream) => {
                tracing::info!("Connecting to {}:{} through tunnel", target.host, target.port);
                client::connect_stream(config, stream, handler).await?
            }
            None => {
                tracing::info!("Connecting to {}:{}", target.host, target.port);
                client::connect(config, (target.host.as_str(), target.port), handler).await?
            }
        };

        tracing::debug!("SSH handshake with {}:{} complete", target.host, target.port);
        Ok(Box::new(RusshConnection { handle }))
    }
}

struct RusshConnection {
    handle: Handle<ClientHandler>,
}

#[async_trait]
impl TransportConnection for RusshConnection {
    async fn authenticate(&mut self, user: &str, attempt: AuthAttempt) -> Result<AuthOutcome> {
        tracing::debug!("Authenticating {} with {}", user, attempt.method_name());
        match attempt {
            AuthAttempt::Password(password) => {
                let result = self.handle.authenticate_password(user, password).await?;
                Ok(auth_outcome(result))
            }
            AuthAttempt::PublicKey {
                private_key_path,
                passphrase,
            } => {
                let path = expand_tilde(&private_key_path);
                let key = russh::keys::load_secret_key(&path, passphrase.as_deref()).map_err(|e| {
                    SshSessionError::AuthenticationFailed(format!("Failed to load key {}: {}", path.display(), e))
                })?;
                let key = PrivateKeyWithHashAlg::new(Arc::new(key), None);
                let result = self.handle.authenticate_publickey(user, key).await?;
                Ok(auth_outcome(result))
            }
            AuthAttempt::KeyboardInteractive => {
                let response = self
                    .handle
                    .authenticate_keyboard_interactive_start(user, None::<String>)
                    .await?;
                Ok(kbi_outcome(response))
            }
        }
    }

    async fn respond_keyboard_interactive(&mut self, answers: Vec<String>) -> Result<AuthOutcome> {
        let response = self.handle.authenticate_keyboard_interactive_respond(answers).await?;
        Ok(kbi_outcome(response))
    }

    async fn open_channel(&self, spec: ChannelSpec) -> Result<Box<dyn TransportChannel>> {
        let channel = match spec {
            ChannelSpec::Session => self.handle.channel_open_session().await?,
            ChannelSpec::DirectTcpip {
                host,
                port,
                originator_host,
                originator_port,
            } => {
                self.handle
                    .channel_open_direct_tcpip(host, port as u32, originator_host, originator_port as u32)
                    .await?
            }
        };
        Ok(Box::new(RusshChannel { channel }))
    }

    async fn disconnect(&self) -> Result<()> {
        self.handle.disconnect(Disconnect::ByApplication, "", "English").await?;
        tracing::info!("Disconnected from SSH server");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}

struct RusshChannel {
    channel: Channel<Msg>,
}

#[async_trait]
impl TransportChannel for RusshChannel {
    async fn request_pty(&mut self, term: &str, cols: u32, rows: u32) -> Result<()> {
        self.channel.request_pty(false, term, cols, rows, 0, 0, &[]).await?;
        Ok(())
    }

    async fn request_shell(&mut self) -> Result<()> {
        self.channel.request_shell(false).await?;
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.channel.data(data).await?;
        Ok(())
    }

    async fn window_change(&mut self, cols: u32, rows: u32) -> Result<()> {
        self.channel.window_change(cols, rows, 0, 0).await?;
        Ok(())
    }

    async fn read(&mut self) -> Option<ChannelEvent> {
        loop {
            let event = match self.channel.wait().await? {
                ChannelMsg::Data { data } => ChannelEvent::Data(data.to_vec()),
                ChannelMsg::ExtendedData { data, .. } => ChannelEvent::ExtendedData(data.to_vec()),
                ChannelMsg::ExitStatus { exit_status } => ChannelEvent::ExitStatus(exit_status),
                ChannelMsg::Eof => ChannelEvent::Eof,
                ChannelMsg::Close => ChannelEvent::Closed,
                _ => continue,
            };
            return Some(event);
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.channel.close().await?;
        Ok(())
    }

    fn into_stream(self: Box<Self>) -> Box<dyn TunnelStream> {
        Box::new(self.channel.into_stream())
    }
}

fn auth_outcome(result: AuthResult) -> AuthOutcome {
    match result {
        AuthResult::Success => AuthOutcome::Success,
        AuthResult::Failure { remaining_methods, .. } => AuthOutcome::Rejected {
            remaining_methods: method_names(&remaining_methods),
        },
    }
}

fn kbi_outcome(response: KeyboardInteractiveAuthResponse) -> AuthOutcome {
    match response {
        KeyboardInteractiveAuthResponse::Success => AuthOutcome::Success,
        KeyboardInteractiveAuthResponse::Failure { remaining_methods, .. } => AuthOutcome::Rejected {
            remaining_methods: method_names(&remaining_methods),
        },
        KeyboardInteractiveAuthResponse::InfoRequest {
            name,
            instructions,
            prompts,
        } => AuthOutcome::Challenge(Challenge {
            name,
            instructions,
            prompts: prompts.into_iter().map(|p| PromptField::new(p.prompt, p.echo)).collect(),
        }),
    }
}

fn method_names(methods: &MethodSet) -> Vec<String> {
    methods
        .iter()
        .filter_map(|kind| match kind {
            MethodKind::Password => Some("password"),
            MethodKind::PublicKey => Some("publickey"),
            MethodKind::KeyboardInteractive => Some("keyboard-interactive"),
            MethodKind::HostBased => Some("hostbased"),
            _ => None,
        })
        .map(str::to_string)
        .collect()
}

fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match directories::BaseDirs::new() {
            Some(dirs) => dirs.home_dir().join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Host key check plus forwarding of banners and disconnects
struct ClientHandler {
    host: String,
    verify_host_key: bool,
    expected_fingerprint: Option<String>,
    notices: NoticeSender,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl std::future::Future<Output = std::result::Result<bool, Self::Error>> + Send {
        use russh::keys::ssh_key::HashAlg;
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        let verify = self.verify_host_key;
        let expected = self.expected_fingerprint.clone();
        let host = self.host.clone();

        async move {
            tracing::info!("Server key fingerprint for {}: {}", host, fingerprint);

            if !verify {
                tracing::warn!("Host key verification disabled for {}", host);
                return Ok(true);
            }

            match expected {
                Some(expected) if expected == fingerprint => Ok(true),
                Some(expected) => {
                    tracing::error!("Server key mismatch for {}! Expected {}, got {}", host, expected, fingerprint);
                    Err(russh::Error::UnknownKey)
                }
                None => {
                    tracing::warn!(
                        "First connection to {}; add fingerprint {} to the profile to pin it",
                        host,
                        fingerprint
                    );
                    Ok(true)
                }
            }
        }
    }

    fn auth_banner(
        &mut self,
        banner: &str,
        _session: &mut client::Session,
    ) -> impl std::future::Future<Output = std::result::Result<(), Self::Error>> + Send {
        let _ = self.notices.send(TransportNotice::Banner(banner.to_string()));
        async { Ok(()) }
    }

    fn disconnected(
        &mut self,
        reason: DisconnectReason<Self::Error>,
    ) -> impl std::future::Future<Output = std::result::Result<(), Self::Error>> + Send {
        let (text, result) = match reason {
            DisconnectReason::ReceivedDisconnect(_) => ("server closed the connection".to_string(), Ok(())),
            DisconnectReason::Error(e) => (e.to_string(), Err(e)),
        };
        tracing::info!("{}: {}", self.host, text);
        let _ = self.notices.send(TransportNotice::Disconnected(text));
        async move { result }
    }
}
