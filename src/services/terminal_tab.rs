//! Terminal tab orchestration
//!
//! A tab asks the multiplexer for a session, runs one shell on it and turns
//! everything the session and shell produce into a single event stream.
//! Opening tries a shared session first and falls back once to a dedicated
//! one.

use super::keyboard_interactive::KeyboardInteractivePrompt;
use super::multiplexer::SessionMultiplexer;
use super::shell_session::ShellSession;
use super::ssh_session::SshSession;
use crate::models::{ConnectionIdentity, LogLevel, SessionEvent, SessionLog, SshProfile};
use crate::utils::error::{Result, SshSessionError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 512;
/// Input bytes kept for explicit-termination detection
const RECENT_INPUT_LEN: usize = 32;
const CTRL_D: u8 = 0x04;

/// What a tab shows
#[derive(Debug, Clone)]
pub enum TabEvent {
    /// Bytes for the terminal, shell output and rendered service lines
    Output(Vec<u8>),
    /// Prompt waiting for answers
    Prompt(KeyboardInteractivePrompt),
    /// The shell went away without the tab closing it
    Closed { explicit: bool },
}

/// Result of asking whether a tab may close
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCheck {
    Close,
    /// Ask the user first
    Confirm(String),
}

/// Rolling window over the last bytes typed into a tab
#[derive(Debug, Default)]
pub struct RecentInput {
    bytes: Vec<u8>,
}

impl RecentInput {
    pub fn push(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
        if self.bytes.len() > RECENT_INPUT_LEN {
            let excess = self.bytes.len() - RECENT_INPUT_LEN;
            self.bytes.drain(..excess);
        }
    }

    /// Last byte was Ctrl-D, or the input ends with `exit` + Enter
    pub fn is_explicit_termination(&self) -> bool {
        self.bytes.last() == Some(&CTRL_D) || self.bytes.ends_with(b"exit\r")
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}

/// Render a service message as a terminal line
pub fn service_line(text: &str) -> String {
    let tag = console::style(" SSH ").black().on_white().force_styling(true);
    format!("\r{} {}\r\n", tag, text.replace('\n', "\r\n      "))
}

fn error_line(text: &str) -> String {
    let tag = console::style(" X ").black().on_red().force_styling(true);
    format!("{} {}\r\n", tag, console::style(text).red().force_styling(true))
}

struct TabShared {
    events: broadcast::Sender<TabEvent>,
    active_prompt: Mutex<Option<KeyboardInteractivePrompt>>,
    recent_input: Mutex<RecentInput>,
    closing: AtomicBool,
}

impl TabShared {
    fn emit(&self, event: TabEvent) {
        let _ = self.events.send(event);
    }

    fn write(&self, text: String) {
        self.emit(TabEvent::Output(text.into_bytes()));
    }
}

pub struct TerminalTab {
    id: Uuid,
    profile: SshProfile,
    multiplexer: SessionMultiplexer,
    size: Mutex<(u32, u32)>,
    shell: Mutex<Option<Arc<ShellSession>>>,
    handlers: Mutex<Vec<JoinHandle<()>>>,
    shared: Arc<TabShared>,
}

impl TerminalTab {
    pub fn new(multiplexer: SessionMultiplexer, profile: SshProfile, cols: u32, rows: u32) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            id: Uuid::new_v4(),
            profile,
            multiplexer,
            size: Mutex::new((cols, rows)),
            shell: Mutex::new(None),
            handlers: Mutex::new(Vec::new()),
            shared: Arc::new(TabShared {
                events,
                active_prompt: Mutex::new(None),
                recent_input: Mutex::new(RecentInput::default()),
                closing: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn profile(&self) -> &SshProfile {
        &self.profile
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TabEvent> {
        self.shared.events.subscribe()
    }

    /// Transport session the shell runs on
    pub fn session(&self) -> Option<Arc<SshSession>> {
        self.shell.lock().as_ref().map(|s| s.parent().clone())
    }

    pub fn shell(&self) -> Option<Arc<ShellSession>> {
        self.shell.lock().clone()
    }

    pub fn is_open(&self) -> bool {
        self.shell.lock().as_ref().map_or(false, |s| s.is_running())
    }

    pub fn active_prompt(&self) -> Option<KeyboardInteractivePrompt> {
        self.shared.active_prompt.lock().clone()
    }

    /// Connect and start a shell, on a shared session if possible
    pub async fn open(&self) -> Result<()> {
        self.shared.closing.store(false, Ordering::SeqCst);
        self.shared.recent_input.lock().clear();

        let first = match self.open_with(true).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        tracing::warn!("Tab {}: shared session failed ({}), retrying dedicated", self.id, first);
        self.journal_fallback(&first);
        self.detach();

        match self.open_with(false).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!("SSH session initialization failed: {}", e);
                self.shared.write(error_line(&e.to_string()));
                self.detach();
                Err(e)
            }
        }
    }

    async fn open_with(&self, multiplex: bool) -> Result<()> {
        let settings = &self.multiplexer.context().settings;
        let session = self.multiplexer.get_or_create(&self.profile, multiplex);
        self.attach_session(&session);

        // The shell adopts our reference; dropping it releases the session
        let shell = Arc::new(ShellSession::new(session.clone(), settings.cwd_probe_timeout()));

        if !session.is_open() {
            self.shared
                .write(service_line(&format!("Connecting to {}", session.profile().name)));
            session.start().await?;
        }

        let (cols, rows) = *self.size.lock();
        shell.start(cols, rows).await?;
        self.attach_shell(&shell);

        *self.shell.lock() = Some(shell);
        Ok(())
    }

    fn attach_session(&self, session: &Arc<SshSession>) {
        let shared = self.shared.clone();
        let mut messages = session.subscribe_messages();
        let mut prompts = session.subscribe_prompts();
        if let Some(prompt) = session.outstanding_prompt() {
            *shared.active_prompt.lock() = Some(prompt.clone());
            shared.emit(TabEvent::Prompt(prompt));
        }

        let handle = tokio::spawn(async move {
            let mut messages_open = true;
            let mut prompts_open = true;
            while messages_open || prompts_open {
                tokio::select! {
                    message = messages.recv(), if messages_open => match message {
                        Ok(message) => shared.write(service_line(&message.text)),
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => messages_open = false,
                    },
                    prompt = prompts.recv(), if prompts_open => match prompt {
                        Ok(prompt) => {
                            *shared.active_prompt.lock() = Some(prompt.clone());
                            shared.emit(TabEvent::Prompt(prompt));
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => prompts_open = false,
                    },
                }
            }
            shared.active_prompt.lock().take();
        });
        self.handlers.lock().push(handle);
    }

    fn attach_shell(&self, shell: &Arc<ShellSession>) {
        let shared = self.shared.clone();
        let mut output = shell.subscribe_output();
        let shell = shell.clone();
        let host = self.profile.host.clone();

        let handle = tokio::spawn(async move {
            loop {
                match output.recv().await {
                    Ok(data) => shared.emit(TabEvent::Output(data)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Tab output lagged by {} chunk(s)", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            shell.ended().await;

            if !shared.closing.load(Ordering::SeqCst) {
                shared.write(format!("\r\n{}", service_line(&format!("{}: session closed", host))));
                let explicit = shared.recent_input.lock().is_explicit_termination();
                shared.emit(TabEvent::Closed { explicit });
            }
        });
        self.handlers.lock().push(handle);
    }

    fn journal_fallback(&self, error: &SshSessionError) {
        let entry = SessionLog::new(
            Uuid::nil(),
            ConnectionIdentity::for_profile(&self.profile, true).to_string(),
            self.profile.name.clone(),
            LogLevel::Warning,
            SessionEvent::FallbackToDedicated,
        )
        .with_message(error.to_string());
        self.multiplexer.context().notifier.session_event(entry);
    }

    /// Send keyboard input to the shell
    pub fn write_input(&self, data: &[u8]) -> Result<()> {
        self.shared.recent_input.lock().push(data);
        let shell = self.shell().ok_or(SshSessionError::ChannelClosed)?;
        shell.write(data)
    }

    pub fn resize(&self, cols: u32, rows: u32) {
        *self.size.lock() = (cols, rows);
        if let Some(shell) = self.shell() {
            shell.resize(cols, rows);
        }
    }

    /// Whether the user typed something that ends the shell on purpose
    pub fn is_explicitly_terminated(&self) -> bool {
        self.shared.recent_input.lock().is_explicit_termination()
    }

    /// Close policy: an open tab asks first when `warn_on_close` is on
    ///
    /// The profile's setting wins over the global one.
    pub fn can_close(&self) -> CloseCheck {
        if !self.is_open() {
            return CloseCheck::Close;
        }
        let warn = self
            .profile
            .warn_on_close
            .unwrap_or(self.multiplexer.context().settings.warn_on_close);
        if !warn {
            return CloseCheck::Close;
        }
        CloseCheck::Confirm(format!("Disconnect from {}?", self.profile.host))
    }

    /// Remote working directory
    ///
    /// Tries a `pwd` probe, then the last OSC 7 report, then `/`.
    pub async fn working_directory(&self) -> String {
        let Some(shell) = self.shell() else {
            return "/".to_string();
        };
        let probed = shell.get_working_directory().await;
        if !probed.trim().is_empty() {
            return probed.trim().to_string();
        }
        shell.reported_cwd().unwrap_or_else(|| "/".to_string())
    }

    /// Drop the current shell and session and open again
    pub async fn reconnect(&self) -> Result<()> {
        tracing::info!("Tab {}: reconnecting to {}", self.id, self.profile.display_name());
        self.close();
        self.open().await
    }

    /// Close the shell and release the session reference
    pub fn close(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        self.detach();
    }

    fn detach(&self) {
        for handle in self.handlers.lock().drain(..) {
            handle.abort();
        }
        if let Some(shell) = self.shell.lock().take() {
            shell.destroy();
        }
        self.shared.active_prompt.lock().take();
    }
}

impl Drop for TerminalTab {
    fn drop(&mut self) {
        self.close();
    }
}
