//! Shared SSH transport session
//!
//! One `SshSession` owns one authenticated transport. Tabs and dependent
//! sessions (those tunnelled through it) each hold one reference; the
//! session tears itself down when the last reference goes away, when its
//! transport dies, or when a jump host it runs through is destroyed.

use super::keyboard_interactive::{AuthenticatorState, KeyboardInteractiveAuthenticator, KeyboardInteractivePrompt};
use super::multiplexer::SessionMultiplexer;
use super::password_storage::StoredIn;
use super::transport::{
    AuthAttempt, AuthOutcome, Challenge, ChannelSpec, ConnectTarget, PromptField, TransportChannel,
    TransportConnection, TransportNotice, TunnelStream,
};
use crate::models::{
    AuthMethod, ConnectionIdentity, CredentialSourceKind, LogLevel, ResolvedCredential, ScopeKey, SecretKind,
    ServiceMessage, ServiceMessageKind, SessionEvent, SessionInfo, SessionLog, SessionState, SshProfile,
};
use crate::services::validation_service::ValidationService;
use crate::utils::error::{Result, SshSessionError};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, watch};
use uuid::Uuid;

const MESSAGE_CHANNEL_CAPACITY: usize = 64;

struct Lifecycle {
    state: SessionState,
    ref_count: u32,
    /// Set exactly once, by whichever path tears the session down first
    destroying: bool,
}

pub struct SshSession {
    id: Uuid,
    profile: SshProfile,
    identity: ConnectionIdentity,
    created_at: DateTime<Utc>,
    multiplexer: SessionMultiplexer,
    lifecycle: Mutex<Lifecycle>,
    connection: RwLock<Option<Arc<dyn TransportConnection>>>,
    /// Outcome of the first `start()`, replayed to later callers
    start_outcome: tokio::sync::Mutex<Option<Result<()>>>,
    /// Error that tore the session down while `start()` was in flight
    fatal: Mutex<Option<SshSessionError>>,
    authenticator: KeyboardInteractiveAuthenticator,
    messages_tx: Mutex<Option<broadcast::Sender<ServiceMessage>>>,
    destroyed_tx: watch::Sender<bool>,
    /// Jump sessions this one holds a reference on
    jumps: Mutex<Vec<Arc<SshSession>>>,
    /// Sessions tunnelled through this one
    dependents: Mutex<Vec<Weak<SshSession>>>,
}

impl SshSession {
    /// New session in `Connecting` with one reference, owned by the caller
    pub(crate) fn new(multiplexer: SessionMultiplexer, profile: SshProfile, identity: ConnectionIdentity) -> Arc<Self> {
        let id = Uuid::new_v4();
        let (messages_tx, _) = broadcast::channel(MESSAGE_CHANNEL_CAPACITY);
        let (destroyed_tx, _) = watch::channel(false);

        Arc::new(Self {
            id,
            profile,
            identity,
            created_at: Utc::now(),
            multiplexer,
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Connecting,
                ref_count: 1,
                destroying: false,
            }),
            connection: RwLock::new(None),
            start_outcome: tokio::sync::Mutex::new(None),
            fatal: Mutex::new(None),
            authenticator: KeyboardInteractiveAuthenticator::new(id),
            messages_tx: Mutex::new(Some(messages_tx)),
            destroyed_tx,
            jumps: Mutex::new(Vec::new()),
            dependents: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn profile(&self) -> &SshProfile {
        &self.profile
    }

    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.lock().state
    }

    pub fn is_open(&self) -> bool {
        let lc = self.lifecycle.lock();
        lc.state.is_open() && !lc.destroying
    }

    pub fn is_destroyed(&self) -> bool {
        let lc = self.lifecycle.lock();
        lc.destroying || lc.state.is_destroyed()
    }

    /// Connecting or open, and not on its way down
    pub fn is_live(&self) -> bool {
        let lc = self.lifecycle.lock();
        !lc.destroying && !lc.state.is_destroyed()
    }

    pub fn ref_count(&self) -> u32 {
        self.lifecycle.lock().ref_count
    }

    /// Take a reference
    pub fn add_ref(&self) -> u32 {
        let mut lc = self.lifecycle.lock();
        if lc.destroying {
            tracing::warn!("Session {}: ref taken on a destroyed session", self.id);
        }
        lc.ref_count = lc.ref_count.saturating_add(1);
        tracing::debug!("Session {} ref count increased to {}", self.id, lc.ref_count);
        lc.ref_count
    }

    /// Take a reference only if the session can still be handed out
    pub(crate) fn try_acquire(&self) -> Option<u32> {
        let mut lc = self.lifecycle.lock();
        if lc.destroying || lc.state.is_destroyed() {
            return None;
        }
        lc.ref_count = lc.ref_count.saturating_add(1);
        Some(lc.ref_count)
    }

    /// Release a reference; the last one schedules destruction
    ///
    /// Destruction runs on the next scheduler tick when a runtime is
    /// available, so a caller still using the session in the same
    /// operation is not torn down under its feet. A reference taken in
    /// between cancels it.
    pub fn unref(self: &Arc<Self>) -> u32 {
        let count = {
            let mut lc = self.lifecycle.lock();
            if lc.ref_count == 0 {
                tracing::warn!("Session {} ref count already 0, not decrementing", self.id);
                return 0;
            }
            lc.ref_count -= 1;
            lc.ref_count
        };
        tracing::debug!("Session {} ref count decreased to {}", self.id, count);

        if count == 0 {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let session = self.clone();
                    handle.spawn(async move {
                        tokio::task::yield_now().await;
                        session.destroy_if_unreferenced();
                    });
                }
                Err(_) => self.destroy_if_unreferenced(),
            }
        }
        count
    }

    fn destroy_if_unreferenced(&self) {
        {
            let mut lc = self.lifecycle.lock();
            if lc.ref_count > 0 || lc.destroying {
                return;
            }
            lc.destroying = true;
        }
        self.finish_destroy();
    }

    /// Tear the session down; later calls do nothing
    ///
    /// Closes the transport, fails any outstanding prompt, destroys every
    /// session tunnelled through this one and releases the references held
    /// on jump sessions.
    pub fn destroy(&self) {
        {
            let mut lc = self.lifecycle.lock();
            if lc.destroying {
                return;
            }
            lc.destroying = true;
        }
        self.finish_destroy();
    }

    fn finish_destroy(&self) {
        self.lifecycle.lock().state = SessionState::Destroyed;
        tracing::info!("Destroying session {} ({})", self.id, self.identity);

        self.destroyed_tx.send_replace(true);
        self.authenticator.cancel();
        self.messages_tx.lock().take();

        if let Some(connection) = self.connection.write().take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = connection.disconnect().await {
                        tracing::debug!("Disconnect after destroy failed: {}", e);
                    }
                });
            }
        }

        let dependents = std::mem::take(&mut *self.dependents.lock());
        for dependent in dependents.iter().filter_map(Weak::upgrade) {
            tracing::info!("Session {}: jump host {} went away", dependent.id, self.id);
            dependent.destroy();
        }

        let jumps = std::mem::take(&mut *self.jumps.lock());
        for jump in &jumps {
            jump.unref();
        }

        self.multiplexer.unregister(&self.identity, self.id);
        self.journal(LogLevel::Info, SessionEvent::Destroyed, None);
    }

    /// Destroy the session because of `error`, reported to a `start()` in flight
    fn abort(&self, error: SshSessionError) {
        tracing::error!("Session {} aborted: {}", self.id, error);
        self.emit_service_message(ServiceMessageKind::Error, format!("{}: {}", self.profile.host, error));
        *self.fatal.lock() = Some(error);
        self.destroy();
    }

    /// Watch flipping to `true` on destruction
    pub fn subscribe_destroyed(&self) -> watch::Receiver<bool> {
        self.destroyed_tx.subscribe()
    }

    /// Resolves once the session is destroyed, immediately if it already is
    pub async fn destroyed(&self) {
        wait_destroyed(self.subscribe_destroyed()).await
    }

    /// Service messages emitted after this call
    pub fn subscribe_messages(&self) -> broadcast::Receiver<ServiceMessage> {
        match &*self.messages_tx.lock() {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        }
    }

    /// Keyboard-interactive and password prompts emitted after this call
    pub fn subscribe_prompts(&self) -> broadcast::Receiver<KeyboardInteractivePrompt> {
        self.authenticator.subscribe()
    }

    /// Prompt currently waiting for answers
    pub fn outstanding_prompt(&self) -> Option<KeyboardInteractivePrompt> {
        self.authenticator.outstanding()
    }

    pub fn emit_service_message(&self, kind: ServiceMessageKind, text: impl Into<String>) {
        self.publish_message(ServiceMessage::new(self.id, kind, text));
    }

    fn publish_message(&self, message: ServiceMessage) {
        self.multiplexer.context().notifier.service_message(&message);
        if let Some(tx) = &*self.messages_tx.lock() {
            let _ = tx.send(message);
        }
    }

    /// Authenticated transport, once open
    pub fn connection(&self) -> Option<Arc<dyn TransportConnection>> {
        if !self.is_open() {
            return None;
        }
        self.connection.read().clone()
    }

    /// Open a channel on the transport
    pub async fn open_channel(&self, spec: ChannelSpec) -> Result<Box<dyn TransportChannel>> {
        let connection = match self.connection() {
            Some(connection) => connection,
            None if self.is_destroyed() => return Err(SshSessionError::SessionDestroyed),
            None => return Err(SshSessionError::TransportError("session is not open yet".into())),
        };
        connection.open_channel(spec).await
    }

    /// Jump sessions this one runs through, nearest first
    pub fn jump_chain(&self) -> Vec<Uuid> {
        let mut chain = Vec::new();
        let mut current = self.jumps.lock().first().cloned();
        while let Some(jump) = current {
            chain.push(jump.id);
            current = jump.jumps.lock().first().cloned();
        }
        chain
    }

    pub fn info(&self) -> SessionInfo {
        let (state, ref_count) = {
            let lc = self.lifecycle.lock();
            (lc.state, lc.ref_count)
        };
        SessionInfo {
            id: self.id,
            profile_id: self.profile.id,
            profile_name: self.profile.name.clone(),
            identity: self.identity.clone(),
            state,
            ref_count,
            jump_chain: self.jump_chain(),
            created_at: self.created_at,
        }
    }

    /// Connect and authenticate, tunnelling through the jump host if one is set
    ///
    /// Concurrent and later callers wait for the first attempt and get its
    /// outcome. Destroying the session aborts an attempt in flight with
    /// `Cancelled`. Any failure destroys the session, which releases the
    /// jump references taken on the way.
    pub fn start(self: &Arc<Self>) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.start_once())
    }

    async fn start_once(self: &Arc<Self>) -> Result<()> {
        let mut outcome = self.start_outcome.lock().await;
        if let Some(previous) = &*outcome {
            return match previous {
                Ok(()) if self.is_destroyed() => Err(SshSessionError::SessionDestroyed),
                Ok(()) => Ok(()),
                Err(e) => Err(e.for_waiter()),
            };
        }
        if self.is_destroyed() {
            return Err(SshSessionError::SessionDestroyed);
        }

        tracing::info!("Starting session {} ({})", self.id, self.identity);
        let destroyed = self.subscribe_destroyed();
        let result = tokio::select! {
            result = self.run_start() => result,
            _ = wait_destroyed(destroyed) => Err(SshSessionError::Cancelled),
        };
        let result = match result {
            Err(SshSessionError::Cancelled) => Err(self.fatal.lock().take().unwrap_or(SshSessionError::Cancelled)),
            other => other,
        };

        match &result {
            Ok(()) => {
                tracing::info!("Session {} open", self.id);
                self.journal(LogLevel::Info, SessionEvent::Opened, None);
            }
            Err(e) => {
                tracing::warn!("Session {} failed to start: {}", self.id, e);
                self.journal(LogLevel::Error, SessionEvent::StartFailed, Some(e.to_string()));
                self.destroy();
            }
        }

        *outcome = Some(match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(e.for_waiter()),
        });
        result
    }

    async fn run_start(self: &Arc<Self>) -> Result<()> {
        let context = self.multiplexer.context();
        ValidationService::new().check_jump_chain(&self.profile, context.profiles.as_ref())?;

        let tunnel = match self.profile.jump_host {
            Some(jump_id) => Some(self.open_jump_tunnel(jump_id).await?),
            None => None,
        };

        self.journal(LogLevel::Info, SessionEvent::ConnectAttempt, None);
        let target = ConnectTarget {
            host: self.profile.host.clone(),
            port: self.profile.effective_port(),
            verify_host_key: self.profile.verify_host_key && context.settings.verify_host_keys,
            host_key_fingerprint: self.profile.host_key_fingerprint.clone(),
        };

        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        self.spawn_notice_forwarder(notices_rx);

        let connect = context.transport.connect(&target, tunnel, notices_tx);
        let mut connection = tokio::time::timeout(context.settings.connect_timeout(), connect)
            .await
            .map_err(|_| {
                SshSessionError::TransportError(format!("connection to {}:{} timed out", target.host, target.port))
            })??;

        if let Err(e) = self.authenticate(connection.as_mut()).await {
            let _ = connection.disconnect().await;
            return Err(e);
        }

        let connection: Arc<dyn TransportConnection> = Arc::from(connection);
        let mut lc = self.lifecycle.lock();
        if lc.destroying {
            drop(lc);
            tokio::spawn(async move {
                let _ = connection.disconnect().await;
            });
            return Err(SshSessionError::Cancelled);
        }
        *self.connection.write() = Some(connection);
        lc.state = SessionState::Open;
        Ok(())
    }

    /// Acquire the jump session and open a forwarded channel to our target through it
    async fn open_jump_tunnel(self: &Arc<Self>, jump_id: Uuid) -> Result<Box<dyn TunnelStream>> {
        let context = self.multiplexer.context();
        let jump_profile = context.profiles.get_profile(jump_id)?.ok_or_else(|| {
            SshSessionError::JumpHostUnresolved(format!(
                "{}: jump host \"{}\" not found in your config",
                self.profile.host, jump_id
            ))
        })?;

        let jump = self.multiplexer.get_or_create(&jump_profile, true);
        self.jumps.lock().push(jump.clone());
        jump.dependents.lock().push(Arc::downgrade(self));

        // The jump may have been destroyed between acquiring and linking
        if jump.is_destroyed() {
            return Err(SshSessionError::JumpHostUnresolved(format!(
                "jump host {} went away",
                jump_profile.name
            )));
        }

        let relay = self.spawn_jump_relay(&jump);
        let started = jump.start().await;
        relay.abort();
        started?;

        self.journal(
            LogLevel::Info,
            SessionEvent::JumpAcquired {
                via: jump_profile.name.clone(),
            },
            None,
        );

        let spec = ChannelSpec::direct_tcpip(self.profile.host.clone(), self.profile.effective_port());
        match jump.open_channel(spec).await {
            Ok(channel) => {
                tracing::debug!(
                    "Forwarded channel to {}:{} open via {}",
                    self.profile.host,
                    self.profile.effective_port(),
                    jump_profile.name
                );
                Ok(channel.into_stream())
            }
            Err(e) => {
                jump.emit_service_message(
                    ServiceMessageKind::Error,
                    format!("Could not set up port forward on {}", jump_profile.name),
                );
                self.journal(
                    LogLevel::Error,
                    SessionEvent::JumpChannelFailed {
                        via: jump_profile.name.clone(),
                    },
                    Some(e.to_string()),
                );
                Err(SshSessionError::JumpChannelFailed(format!(
                    "{}:{} via {}: {}",
                    self.profile.host,
                    self.profile.effective_port(),
                    jump_profile.name,
                    e
                )))
            }
        }
    }

    /// Re-publish the jump session's prompts and messages while it starts
    fn spawn_jump_relay(self: &Arc<Self>, jump: &Arc<SshSession>) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let mut prompts = jump.subscribe_prompts();
        let mut messages = jump.subscribe_messages();

        tokio::spawn(async move {
            let mut prompts_open = true;
            let mut messages_open = true;
            while prompts_open || messages_open {
                tokio::select! {
                    prompt = prompts.recv(), if prompts_open => match prompt {
                        Ok(prompt) => match weak.upgrade() {
                            Some(session) => session.authenticator.relay(prompt),
                            None => break,
                        },
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => prompts_open = false,
                    },
                    message = messages.recv(), if messages_open => match message {
                        Ok(message) => match weak.upgrade() {
                            Some(session) => session.publish_message(message),
                            None => break,
                        },
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => messages_open = false,
                    },
                }
            }
        })
    }

    /// Turn transport notices into service messages; a disconnect destroys the session
    fn spawn_notice_forwarder(self: &Arc<Self>, mut notices: mpsc::UnboundedReceiver<TransportNotice>) {
        let weak = Arc::downgrade(self);
        let destroyed = self.subscribe_destroyed();

        tokio::spawn(async move {
            let mut destroyed = std::pin::pin!(wait_destroyed(destroyed));
            loop {
                let notice = tokio::select! {
                    notice = notices.recv() => notice,
                    _ = &mut destroyed => break,
                };
                let Some(session) = weak.upgrade() else { break };
                match notice {
                    Some(TransportNotice::Banner(text)) => {
                        session.emit_service_message(ServiceMessageKind::Banner, text);
                    }
                    Some(TransportNotice::Disconnected(reason)) => {
                        session.emit_service_message(
                            ServiceMessageKind::Error,
                            format!("{}: connection closed ({})", session.profile.host, reason),
                        );
                        session.destroy();
                        break;
                    }
                    Some(TransportNotice::Challenge(challenge)) => {
                        if session.authenticator.state() == AuthenticatorState::AwaitingResponse {
                            session.abort(SshSessionError::ConcurrentPromptViolation);
                            break;
                        }
                        tracing::warn!(
                            "Session {}: ignoring challenge \"{}\" outside authentication",
                            session.id,
                            challenge.name
                        );
                    }
                    None => break,
                }
            }
        });
    }

    async fn authenticate(&self, connection: &mut dyn TransportConnection) -> Result<()> {
        let method = self.profile.auth_method.clone();
        let user = self.profile.username.clone();

        let outcome = match &method {
            AuthMethod::Password => return self.authenticate_password(connection).await,
            AuthMethod::PublicKey {
                private_key_path,
                passphrase_required,
            } => {
                let passphrase = if *passphrase_required {
                    Some(self.key_passphrase(&private_key_path.to_string_lossy()).await?)
                } else {
                    None
                };
                let attempt = AuthAttempt::PublicKey {
                    private_key_path: private_key_path.clone(),
                    passphrase,
                };
                connection.authenticate(&user, attempt).await?
            }
            AuthMethod::KeyboardInteractive => {
                let auto_fill = self.resolve_password().await.map(|c| c.password);
                let first = connection.authenticate(&user, AuthAttempt::KeyboardInteractive).await?;
                self.authenticator
                    .authenticate(connection, first, auto_fill.as_deref())
                    .await?
            }
        };

        match outcome {
            AuthOutcome::Success => {
                self.auth_succeeded(method.wire_name());
                Ok(())
            }
            AuthOutcome::Rejected { remaining_methods }
                if remaining_methods.iter().any(|m| m == "keyboard-interactive") && !method.is_keyboard_interactive() =>
            {
                self.try_keyboard_interactive(connection, None).await
            }
            _ => Err(self.auth_failed(method.wire_name())),
        }
    }

    async fn authenticate_password(&self, connection: &mut dyn TransportConnection) -> Result<()> {
        let context = self.multiplexer.context();
        let user = self.profile.username.clone();
        let scope = self.profile.scope_key();
        let mut candidate = self.resolve_password().await;
        let mut prompts_left = context.settings.max_password_prompts;
        let mut tried_keyboard_interactive = false;

        loop {
            let (password, source) = match candidate.take() {
                Some(found) => (found.password, Some(found.source)),
                None => {
                    if prompts_left == 0 {
                        return Err(self.auth_failed("password"));
                    }
                    prompts_left -= 1;
                    let text = format!("Password for {}@{}: ", user, self.profile.host);
                    (self.prompt_secret(text).await?, None)
                }
            };

            let outcome = connection.authenticate(&user, AuthAttempt::Password(password.clone())).await?;
            let outcome = match outcome {
                AuthOutcome::Challenge(challenge) => {
                    self.authenticator
                        .authenticate(connection, AuthOutcome::Challenge(challenge), Some(&password))
                        .await?
                }
                other => other,
            };

            match outcome {
                AuthOutcome::Success => {
                    match source {
                        None => self.remember_password(&scope, &password).await,
                        Some(source) => self.migrate_password(source, &password).await,
                    }
                    self.auth_succeeded("password");
                    return Ok(());
                }
                AuthOutcome::Rejected { remaining_methods } => {
                    self.journal(
                        LogLevel::Warning,
                        SessionEvent::AuthFailed {
                            method: "password".into(),
                        },
                        None,
                    );
                    if source == Some(CredentialSourceKind::Runtime) {
                        context.credentials.forget(SecretKind::Password, &scope).await;
                    }

                    let offers_kbi = remaining_methods.iter().any(|m| m == "keyboard-interactive");
                    if offers_kbi && !tried_keyboard_interactive {
                        tried_keyboard_interactive = true;
                        match self.try_keyboard_interactive(connection, Some(&password)).await {
                            Ok(()) => {
                                match source {
                                    None => self.remember_password(&scope, &password).await,
                                    Some(source) => self.migrate_password(source, &password).await,
                                }
                                return Ok(());
                            }
                            Err(SshSessionError::AuthenticationFailed(_)) => {}
                            Err(e) => return Err(e),
                        }
                    }

                    if !offers_kbi && !remaining_methods.iter().any(|m| m == "password") {
                        return Err(self.auth_failed("password"));
                    }
                    self.emit_service_message(ServiceMessageKind::Warning, "Password rejected");
                }
                AuthOutcome::Challenge(_) => return Err(self.auth_failed("password")),
            }
        }
    }

    async fn try_keyboard_interactive(
        &self,
        connection: &mut dyn TransportConnection,
        auto_fill: Option<&str>,
    ) -> Result<()> {
        tracing::debug!("Session {}: trying keyboard-interactive", self.id);
        let first = connection
            .authenticate(&self.profile.username, AuthAttempt::KeyboardInteractive)
            .await?;
        match self.authenticator.authenticate(connection, first, auto_fill).await? {
            AuthOutcome::Success => {
                self.auth_succeeded("keyboard-interactive");
                Ok(())
            }
            _ => Err(self.auth_failed("keyboard-interactive")),
        }
    }

    async fn resolve_password(&self) -> Option<ResolvedCredential> {
        let context = self.multiplexer.context();
        let found = context
            .credentials
            .resolve(&self.profile.scope_key(), Some(self.profile.username.as_str()))
            .await;
        match &found {
            Some(credential) => self.journal(
                LogLevel::Info,
                SessionEvent::CredentialResolved {
                    source: credential.source.as_str().to_string(),
                },
                None,
            ),
            None => self.journal(LogLevel::Info, SessionEvent::CredentialMiss, None),
        }
        found
    }

    async fn key_passphrase(&self, key_id: &str) -> Result<String> {
        let credentials = &self.multiplexer.context().credentials;
        if let Some(passphrase) = credentials.resolve_passphrase(key_id).await {
            return Ok(passphrase);
        }
        let passphrase = self.prompt_secret(format!("Passphrase for {}: ", key_id)).await?;
        credentials
            .remember(SecretKind::KeyPassphrase, &ScopeKey::private_key(key_id), &passphrase)
            .await;
        Ok(passphrase)
    }

    /// Move a working plaintext password out of the profile
    ///
    /// A profile hit is saved through the password storage, which clears the
    /// plaintext field once a secret store took it. A keychain hit for a
    /// profile still carrying a plaintext copy drops that copy.
    async fn migrate_password(&self, source: CredentialSourceKind, password: &str) {
        let context = self.multiplexer.context();
        let Some(storage) = &context.password_storage else {
            return;
        };
        let mut stored = match context.profiles.get_profile(self.profile.id) {
            Ok(Some(stored)) => stored,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Session {}: could not read profile for migration: {}", self.id, e);
                return;
            }
        };

        let migrated = if source.should_migrate() {
            storage
                .save_password(&mut stored, password, Some(self.profile.username.as_str()))
                .await
                .map(|place| place != StoredIn::Profile)
        } else if source == CredentialSourceKind::Keychain && stored.password.is_some() {
            storage
                .load_password(&mut stored, Some(self.profile.username.as_str()))
                .await
                .map(|_| stored.password.is_none())
        } else {
            return;
        };

        match migrated {
            Ok(true) => {
                let to = if storage.vault_enabled() { "vault" } else { "keychain" };
                tracing::info!("Session {}: password for {} moved to the {}", self.id, self.identity, to);
                self.journal(LogLevel::Info, SessionEvent::CredentialMigrated { to: to.to_string() }, None);
            }
            Ok(false) => {}
            Err(e) => tracing::warn!("Session {}: password migration failed: {}", self.id, e),
        }
    }

    async fn remember_password(&self, scope: &ScopeKey, password: &str) {
        self.multiplexer
            .context()
            .credentials
            .remember(SecretKind::Password, scope, password)
            .await;
    }

    /// Ask for one masked secret through the prompt stream
    async fn prompt_secret(&self, text: String) -> Result<String> {
        let challenge = Challenge {
            name: self.profile.name.clone(),
            instructions: String::new(),
            prompts: vec![PromptField::new(text, false)],
        };
        self.journal(LogLevel::Info, SessionEvent::PromptRaised { prompts: 1 }, None);

        match self.authenticator.ask(challenge).await {
            Ok(mut answers) => Ok(answers.pop().unwrap_or_default()),
            Err(e) => {
                self.journal(LogLevel::Warning, SessionEvent::PromptCancelled, None);
                Err(e)
            }
        }
    }

    fn auth_succeeded(&self, method: &str) {
        tracing::info!("Session {}: authenticated with {}", self.id, method);
        self.journal(
            LogLevel::Info,
            SessionEvent::AuthSuccess {
                method: method.to_string(),
            },
            None,
        );
    }

    fn auth_failed(&self, method: &str) -> SshSessionError {
        self.journal(
            LogLevel::Error,
            SessionEvent::AuthFailed {
                method: method.to_string(),
            },
            None,
        );
        SshSessionError::AuthenticationFailed(format!(
            "{}@{}: {} authentication rejected",
            self.profile.username, self.profile.host, method
        ))
    }

    pub(crate) fn journal(&self, level: LogLevel, event: SessionEvent, message: Option<String>) {
        let mut entry = SessionLog::new(self.id, self.identity.to_string(), self.profile.name.clone(), level, event);
        if let Some(message) = message {
            entry = entry.with_message(message);
        }
        self.multiplexer.context().notifier.session_event(entry);
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("state", &self.state())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// Resolves once the destruction watch reads `true` or its sender is gone
pub(crate) async fn wait_destroyed(mut destroyed: watch::Receiver<bool>) {
    loop {
        if *destroyed.borrow_and_update() {
            return;
        }
        if destroyed.changed().await.is_err() {
            return;
        }
    }
}
