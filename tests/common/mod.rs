//! Scripted in-process transport shared by the integration tests
//!
//! Each host gets a `HostScript` describing how it authenticates, whether
//! it forwards TCP and what its shell prints. Every connect, forward and
//! shell write is recorded for assertions.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use ssh_session_manager::models::{CredentialSourceKind, ServiceMessage, SessionEvent, SessionLog, SshProfile};
use ssh_session_manager::services::config_service::{MemoryProfileStore, SshSettings};
use ssh_session_manager::services::credential_resolver::{CredentialResolver, CredentialSource};
use ssh_session_manager::services::log_service::Notifier;
use ssh_session_manager::services::multiplexer::{SessionContext, SessionMultiplexer};
use ssh_session_manager::services::password_storage::PasswordStorage;
use ssh_session_manager::services::secret_store::MemoryStore;
use ssh_session_manager::services::ssh_session::SshSession;
use ssh_session_manager::services::transport::{
    AuthAttempt, AuthOutcome, Challenge, ChannelEvent, ChannelSpec, ConnectTarget, NoticeSender, PromptField,
    Transport, TransportChannel, TransportConnection, TransportNotice, TunnelStream,
};
use ssh_session_manager::utils::error::{Result, SshSessionError};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub enum AuthScript {
    AcceptAll,
    /// Only this password is accepted
    Password(String),
    /// Challenge rounds with the answers each expects
    KeyboardInteractive(Vec<(Challenge, Vec<String>)>),
}

#[derive(Debug, Clone)]
pub struct HostScript {
    pub auth: AuthScript,
    pub connect_delay: Option<Duration>,
    pub hang_on_connect: bool,
    pub fail_connect: bool,
    /// Refuse only this many connects, then accept
    pub fail_first_connects: usize,
    pub refuse_forwarding: bool,
    /// Answer to `pwd`; `None` leaves the probe unanswered
    pub pwd: Option<String>,
    /// Directory announced through OSC 7 when the shell starts
    pub osc7_cwd: Option<String>,
    pub banner: Option<String>,
}

impl Default for HostScript {
    fn default() -> Self {
        Self {
            auth: AuthScript::AcceptAll,
            connect_delay: None,
            hang_on_connect: false,
            fail_connect: false,
            fail_first_connects: 0,
            refuse_forwarding: false,
            pwd: None,
            osc7_cwd: None,
            banner: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRecord {
    pub host: String,
    pub port: u16,
    pub tunnelled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRecord {
    pub via: String,
    pub host: String,
    pub port: u16,
}

#[derive(Default)]
struct MockState {
    scripts: Mutex<HashMap<String, HostScript>>,
    connects: Mutex<Vec<ConnectRecord>>,
    forwards: Mutex<Vec<ForwardRecord>>,
    notices: Mutex<Vec<(String, NoticeSender)>>,
    passwords: Mutex<Vec<String>>,
    written: Mutex<Vec<(String, Vec<u8>)>>,
    resizes: Mutex<Vec<(u32, u32)>>,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, host: &str, script: HostScript) {
        self.state.scripts.lock().insert(host.to_string(), script);
    }

    fn script_for(&self, host: &str) -> HostScript {
        self.state.scripts.lock().get(host).cloned().unwrap_or_default()
    }

    pub fn connects(&self) -> Vec<ConnectRecord> {
        self.state.connects.lock().clone()
    }

    pub fn connect_count(&self, host: &str) -> usize {
        self.state.connects.lock().iter().filter(|c| c.host == host).count()
    }

    pub fn forwards(&self) -> Vec<ForwardRecord> {
        self.state.forwards.lock().clone()
    }

    /// Passwords offered with password auth, in order
    pub fn passwords_tried(&self) -> Vec<String> {
        self.state.passwords.lock().clone()
    }

    /// Everything shells on `host` received, concatenated
    pub fn written_to(&self, host: &str) -> Vec<u8> {
        self.state
            .written
            .lock()
            .iter()
            .filter(|(h, _)| h == host)
            .flat_map(|(_, data)| data.clone())
            .collect()
    }

    pub fn resizes(&self) -> Vec<(u32, u32)> {
        self.state.resizes.lock().clone()
    }

    /// Simulate the server dropping every connection to `host`
    pub fn drop_connections(&self, host: &str, reason: &str) {
        for (h, tx) in self.state.notices.lock().iter() {
            if h == host {
                let _ = tx.send(TransportNotice::Disconnected(reason.to_string()));
            }
        }
    }

    /// Push a challenge to `host` outside any authentication round
    pub fn send_challenge(&self, host: &str, challenge: Challenge) {
        for (h, tx) in self.state.notices.lock().iter() {
            if h == host {
                let _ = tx.send(TransportNotice::Challenge(challenge.clone()));
            }
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        target: &ConnectTarget,
        tunnel: Option<Box<dyn TunnelStream>>,
        notices: NoticeSender,
    ) -> Result<Box<dyn TransportConnection>> {
        let script = self.script_for(&target.host);
        self.state.connects.lock().push(ConnectRecord {
            host: target.host.clone(),
            port: target.port,
            tunnelled: tunnel.is_some(),
        });
        let attempt = self.connect_count(&target.host);

        if let Some(delay) = script.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if script.hang_on_connect {
            std::future::pending::<()>().await;
        }
        if script.fail_connect || attempt <= script.fail_first_connects {
            return Err(SshSessionError::TransportError(format!(
                "connection refused by {}",
                target.host
            )));
        }
        if let Some(banner) = &script.banner {
            let _ = notices.send(TransportNotice::Banner(banner.clone()));
        }
        self.state.notices.lock().push((target.host.clone(), notices));

        let (closed, _) = watch::channel(false);
        Ok(Box::new(MockConnection {
            host: target.host.clone(),
            script,
            state: self.state.clone(),
            round: 0,
            closed,
            _tunnel: Mutex::new(tunnel),
        }))
    }
}

struct MockConnection {
    host: String,
    script: HostScript,
    state: Arc<MockState>,
    round: usize,
    closed: watch::Sender<bool>,
    _tunnel: Mutex<Option<Box<dyn TunnelStream>>>,
}

fn rejected(method: &str) -> AuthOutcome {
    AuthOutcome::Rejected {
        remaining_methods: vec![method.to_string()],
    }
}

#[async_trait]
impl TransportConnection for MockConnection {
    async fn authenticate(&mut self, _user: &str, attempt: AuthAttempt) -> Result<AuthOutcome> {
        if let AuthAttempt::Password(password) = &attempt {
            self.state.passwords.lock().push(password.clone());
        }
        let outcome = match (&self.script.auth, attempt) {
            (AuthScript::AcceptAll, _) => AuthOutcome::Success,
            (AuthScript::Password(expected), AuthAttempt::Password(given)) if *expected == given => {
                AuthOutcome::Success
            }
            (AuthScript::Password(_), _) => rejected("password"),
            (AuthScript::KeyboardInteractive(rounds), AuthAttempt::KeyboardInteractive) => {
                self.round = 0;
                match rounds.first() {
                    Some((challenge, _)) => AuthOutcome::Challenge(challenge.clone()),
                    None => AuthOutcome::Success,
                }
            }
            (AuthScript::KeyboardInteractive(_), _) => rejected("keyboard-interactive"),
        };
        Ok(outcome)
    }

    async fn respond_keyboard_interactive(&mut self, answers: Vec<String>) -> Result<AuthOutcome> {
        let AuthScript::KeyboardInteractive(rounds) = &self.script.auth else {
            return Ok(rejected("password"));
        };
        match rounds.get(self.round) {
            Some((_, expected)) if *expected == answers => {
                self.round += 1;
                Ok(match rounds.get(self.round) {
                    Some((challenge, _)) => AuthOutcome::Challenge(challenge.clone()),
                    None => AuthOutcome::Success,
                })
            }
            _ => Ok(rejected("keyboard-interactive")),
        }
    }

    async fn open_channel(&self, spec: ChannelSpec) -> Result<Box<dyn TransportChannel>> {
        if *self.closed.borrow() {
            return Err(SshSessionError::ChannelClosed);
        }
        match spec {
            ChannelSpec::Session => Ok(Box::new(MockShell {
                host: self.host.clone(),
                script: self.script.clone(),
                state: self.state.clone(),
                pending: VecDeque::new(),
                closed: self.closed.subscribe(),
                ended: false,
            })),
            ChannelSpec::DirectTcpip { host, port, .. } => {
                if self.script.refuse_forwarding {
                    return Err(SshSessionError::TransportError(format!(
                        "{}: administratively prohibited",
                        self.host
                    )));
                }
                self.state.forwards.lock().push(ForwardRecord {
                    via: self.host.clone(),
                    host,
                    port,
                });
                let (stream, _) = tokio::io::duplex(1024);
                Ok(Box::new(MockForward { stream }))
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.closed.send_replace(true);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

struct MockShell {
    host: String,
    script: HostScript,
    state: Arc<MockState>,
    pending: VecDeque<ChannelEvent>,
    closed: watch::Receiver<bool>,
    ended: bool,
}

#[async_trait]
impl TransportChannel for MockShell {
    async fn request_pty(&mut self, _term: &str, _cols: u32, _rows: u32) -> Result<()> {
        Ok(())
    }

    async fn request_shell(&mut self) -> Result<()> {
        let mut greeting = format!("Welcome to {}\r\n", self.host);
        if let Some(cwd) = &self.script.osc7_cwd {
            greeting.push_str(&format!("\x1b]7;file://{}{}\x07", self.host, cwd));
        }
        greeting.push_str("$ ");
        self.pending.push_back(ChannelEvent::Data(greeting.into_bytes()));
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.state.written.lock().push((self.host.clone(), data.to_vec()));
        let text = String::from_utf8_lossy(data);
        if text.contains("pwd\r") {
            if let Some(path) = &self.script.pwd {
                self.pending
                    .push_back(ChannelEvent::Data(format!("pwd\r\n{}\r\n$ ", path).into_bytes()));
            }
        }
        if data.contains(&0x04) || text.ends_with("exit\r") {
            self.pending.push_back(ChannelEvent::ExitStatus(0));
            self.pending.push_back(ChannelEvent::Eof);
            self.pending.push_back(ChannelEvent::Closed);
        }
        Ok(())
    }

    async fn window_change(&mut self, cols: u32, rows: u32) -> Result<()> {
        self.state.resizes.lock().push((cols, rows));
        Ok(())
    }

    async fn read(&mut self) -> Option<ChannelEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        if self.ended {
            return None;
        }
        loop {
            if *self.closed.borrow_and_update() {
                break;
            }
            if self.closed.changed().await.is_err() {
                break;
            }
        }
        self.ended = true;
        Some(ChannelEvent::Closed)
    }

    async fn close(&mut self) -> Result<()> {
        self.ended = true;
        self.pending.clear();
        Ok(())
    }

    fn into_stream(self: Box<Self>) -> Box<dyn TunnelStream> {
        let (stream, _) = tokio::io::duplex(64);
        Box::new(stream)
    }
}

struct MockForward {
    stream: tokio::io::DuplexStream,
}

#[async_trait]
impl TransportChannel for MockForward {
    async fn request_pty(&mut self, _term: &str, _cols: u32, _rows: u32) -> Result<()> {
        Err(SshSessionError::ChannelClosed)
    }

    async fn request_shell(&mut self) -> Result<()> {
        Err(SshSessionError::ChannelClosed)
    }

    async fn write(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn window_change(&mut self, _cols: u32, _rows: u32) -> Result<()> {
        Ok(())
    }

    async fn read(&mut self) -> Option<ChannelEvent> {
        None
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn into_stream(self: Box<Self>) -> Box<dyn TunnelStream> {
        Box::new(self.stream)
    }
}

/// Notifier that keeps everything it is told
#[derive(Default)]
pub struct RecordingNotifier {
    entries: Mutex<Vec<SessionLog>>,
    messages: Mutex<Vec<ServiceMessage>>,
}

impl RecordingNotifier {
    pub fn entries(&self) -> Vec<SessionLog> {
        self.entries.lock().clone()
    }

    pub fn count(&self, event: &SessionEvent) -> usize {
        self.entries.lock().iter().filter(|e| &e.event == event).count()
    }

    pub fn message_texts(&self) -> Vec<String> {
        self.messages.lock().iter().map(|m| m.text.clone()).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn session_event(&self, entry: SessionLog) {
        self.entries.lock().push(entry);
    }

    fn service_message(&self, message: &ServiceMessage) {
        self.messages.lock().push(message.clone());
    }
}

pub fn test_settings() -> SshSettings {
    SshSettings {
        cwd_probe_timeout_ms: 1000,
        connect_timeout_secs: 5,
        secret_store_timeout_ms: 500,
        ..SshSettings::default()
    }
}

/// A multiplexer wired to a `MockTransport` and in-memory stores
pub struct Harness {
    pub multiplexer: SessionMultiplexer,
    pub transport: MockTransport,
    pub notifier: Arc<RecordingNotifier>,
    pub profiles: Arc<MemoryProfileStore>,
    pub runtime: Arc<MemoryStore>,
    pub vault: Arc<MemoryStore>,
    pub keychain: Arc<MemoryStore>,
}

impl Harness {
    pub fn new(profiles: Vec<SshProfile>) -> Self {
        Self::with_settings(profiles, test_settings())
    }

    pub fn with_settings(profiles: Vec<SshProfile>, settings: SshSettings) -> Self {
        Self::build(profiles, settings, None)
    }

    /// Sessions move working plaintext passwords into the vault, or into
    /// the keychain when `use_vault` is false
    pub fn with_migration(profiles: Vec<SshProfile>, use_vault: bool) -> Self {
        Self::build(profiles, test_settings(), Some(use_vault))
    }

    fn build(profiles: Vec<SshProfile>, settings: SshSettings, migrate: Option<bool>) -> Self {
        let transport = MockTransport::new();
        let profiles = Arc::new(MemoryProfileStore::new(profiles));
        let runtime = Arc::new(MemoryStore::runtime());
        let vault = Arc::new(MemoryStore::vault());
        let keychain = Arc::new(MemoryStore::new(CredentialSourceKind::Keychain));
        let notifier = Arc::new(RecordingNotifier::default());

        let credentials = CredentialResolver::new(vec![
            CredentialSource::Runtime(runtime.clone()),
            CredentialSource::Vault(vault.clone()),
            CredentialSource::Keychain(keychain.clone()),
            CredentialSource::Profile(profiles.clone()),
        ])
        .with_timeout(settings.secret_store_timeout());

        let password_storage = migrate.map(|use_vault| {
            let storage = PasswordStorage::new(keychain.clone(), profiles.clone())
                .with_timeout(settings.secret_store_timeout());
            let storage = if use_vault { storage.with_vault(vault.clone()) } else { storage };
            Arc::new(storage)
        });

        let multiplexer = SessionMultiplexer::new(SessionContext {
            transport: Arc::new(transport.clone()),
            credentials: Arc::new(credentials),
            profiles: profiles.clone(),
            notifier: notifier.clone(),
            password_storage,
            settings,
        });

        Self {
            multiplexer,
            transport,
            notifier,
            profiles,
            runtime,
            vault,
            keychain,
        }
    }

    /// Shared session for `profile`, started
    pub async fn open(&self, profile: &SshProfile) -> Arc<SshSession> {
        let session = self.multiplexer.get_or_create(profile, true);
        session.start().await.expect("session should start");
        session
    }
}

pub fn challenge(prompts: &[(&str, bool)]) -> Challenge {
    Challenge {
        name: "Verification".to_string(),
        instructions: String::new(),
        prompts: prompts.iter().map(|(text, echo)| PromptField::new(*text, *echo)).collect(),
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
