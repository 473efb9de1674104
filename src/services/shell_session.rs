//! Per-tab shell channel
//!
//! A `ShellSession` runs one PTY channel on a shared or dedicated
//! `SshSession`. A single pump task owns the channel; writes and resizes
//! reach it over an mpsc queue and output fans out on a broadcast. The
//! shell ends when the tab destroys it or, immediately, when the parent
//! session is destroyed.

use super::ssh_session::{wait_destroyed, SshSession};
use super::transport::{ChannelEvent, ChannelSpec, TransportChannel};
use crate::models::{ChannelState, LogLevel, SessionEvent};
use crate::utils::error::{Result, SshSessionError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use url::Url;
use uuid::Uuid;

const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Terminal type requested for the PTY
pub const TERM: &str = "xterm-256color";

enum ShellCommand {
    Write(Vec<u8>),
    Resize { cols: u32, rows: u32 },
    Close,
}

struct ShellShared {
    state: Mutex<ChannelState>,
    output_tx: Mutex<Option<broadcast::Sender<Vec<u8>>>>,
    commands: Mutex<Option<mpsc::UnboundedSender<ShellCommand>>>,
    ended_tx: watch::Sender<bool>,
    osc: Mutex<Osc7Tracker>,
    reported_cwd: Mutex<Option<String>>,
}

impl ShellShared {
    fn publish(&self, data: Vec<u8>) {
        if let Some(cwd) = self.osc.lock().feed(&data) {
            tracing::trace!("Shell reported cwd {}", cwd);
            *self.reported_cwd.lock() = Some(cwd);
        }
        if let Some(tx) = &*self.output_tx.lock() {
            let _ = tx.send(data);
        }
    }

    /// Move to `Ended` and close every stream; returns false if already ended
    fn end(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state == ChannelState::Ended {
                return false;
            }
            *state = ChannelState::Ended;
        }
        self.commands.lock().take();
        self.output_tx.lock().take();
        self.ended_tx.send_replace(true);
        true
    }
}

pub struct ShellSession {
    id: Uuid,
    parent: Arc<SshSession>,
    shared: Arc<ShellShared>,
    released: AtomicBool,
    cwd_probe_timeout: Duration,
    probed_cwd: Mutex<Option<String>>,
}

impl ShellSession {
    /// Wrap `parent`, adopting one reference the caller already holds on it
    ///
    /// The reference is released when the shell session is destroyed.
    pub fn new(parent: Arc<SshSession>, cwd_probe_timeout: Duration) -> Self {
        let (output_tx, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let (ended_tx, _) = watch::channel(false);

        Self {
            id: Uuid::new_v4(),
            parent,
            shared: Arc::new(ShellShared {
                state: Mutex::new(ChannelState::NotStarted),
                output_tx: Mutex::new(Some(output_tx)),
                commands: Mutex::new(None),
                ended_tx,
                osc: Mutex::new(Osc7Tracker::default()),
                reported_cwd: Mutex::new(None),
            }),
            released: AtomicBool::new(false),
            cwd_probe_timeout,
            probed_cwd: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn parent(&self) -> &Arc<SshSession> {
        &self.parent
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ChannelState::Running && !self.parent.is_destroyed()
    }

    /// Open the channel, request a PTY and a shell, and start forwarding output
    pub async fn start(&self, cols: u32, rows: u32) -> Result<()> {
        match self.state() {
            ChannelState::NotStarted => {}
            ChannelState::Running => return Ok(()),
            ChannelState::Ended => return Err(SshSessionError::ChannelClosed),
        }
        if self.parent.is_destroyed() {
            return Err(SshSessionError::SessionDestroyed);
        }

        let mut channel = self.parent.open_channel(ChannelSpec::Session).await?;
        channel.request_pty(TERM, cols, rows).await?;
        channel.request_shell().await?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        {
            let mut state = self.shared.state.lock();
            if *state != ChannelState::NotStarted {
                return Err(SshSessionError::ChannelClosed);
            }
            *state = ChannelState::Running;
            *self.shared.commands.lock() = Some(commands_tx);
        }

        tracing::info!("Shell {} open on session {}", self.id, self.parent.id());
        self.parent.journal(LogLevel::Info, SessionEvent::ShellOpened, None);

        let shared = self.shared.clone();
        let parent = Arc::downgrade(&self.parent);
        let parent_destroyed = self.parent.subscribe_destroyed();
        let shell_id = self.id;
        tokio::spawn(pump(shell_id, channel, commands_rx, parent, parent_destroyed, shared));
        Ok(())
    }

    /// Send input to the shell
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if self.parent.is_destroyed() {
            return Err(SshSessionError::SessionDestroyed);
        }
        self.send(ShellCommand::Write(data.to_vec()))
    }

    /// Best-effort window size change; ignored unless the channel is running
    pub fn resize(&self, cols: u32, rows: u32) {
        if !self.is_running() {
            return;
        }
        let _ = self.send(ShellCommand::Resize { cols, rows });
    }

    fn send(&self, command: ShellCommand) -> Result<()> {
        let commands = self.shared.commands.lock();
        let tx = commands.as_ref().ok_or(SshSessionError::ChannelClosed)?;
        tx.send(command).map_err(|_| SshSessionError::ChannelClosed)
    }

    /// Output chunks produced after this call
    pub fn subscribe_output(&self) -> broadcast::Receiver<Vec<u8>> {
        match &*self.shared.output_tx.lock() {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        }
    }

    /// Resolves once the shell has ended
    pub async fn ended(&self) {
        wait_destroyed(self.shared.ended_tx.subscribe()).await
    }

    /// Probe the remote working directory with `pwd`
    ///
    /// Collects output for the probe window and returns the last line that
    /// looks like an absolute path, or an empty string if none arrived.
    pub async fn get_working_directory(&self) -> String {
        let mut output = self.subscribe_output();
        if self.write(b"pwd\r").is_err() {
            return String::new();
        }

        let mut collected = Vec::new();
        let window = tokio::time::sleep(self.cwd_probe_timeout);
        tokio::pin!(window);
        loop {
            tokio::select! {
                _ = &mut window => break,
                chunk = output.recv() => match chunk {
                    Ok(chunk) => collected.extend_from_slice(&chunk),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        match last_absolute_path(&String::from_utf8_lossy(&collected)) {
            Some(path) => {
                *self.probed_cwd.lock() = Some(path.clone());
                path
            }
            None => String::new(),
        }
    }

    /// Last directory the shell reported through OSC 7
    pub fn reported_cwd(&self) -> Option<String> {
        self.shared.reported_cwd.lock().clone()
    }

    /// Last successful `pwd` probe result
    pub fn cached_cwd(&self) -> Option<String> {
        self.probed_cwd.lock().clone()
    }

    /// End the shell and release the parent reference; later calls do nothing
    pub fn destroy(&self) {
        if let Some(tx) = &*self.shared.commands.lock() {
            let _ = tx.send(ShellCommand::Close);
        }
        if self.shared.end() {
            tracing::info!("Shell {} closed", self.id);
            self.parent.journal(LogLevel::Info, SessionEvent::ShellClosed, None);
        }
        if !self.released.swap(true, Ordering::SeqCst) {
            self.parent.unref();
        }
    }
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        self.destroy();
    }
}

enum Step {
    Command(Option<ShellCommand>),
    Event(Option<ChannelEvent>),
    ParentGone,
}

/// Sole owner of the channel
async fn pump(
    shell_id: Uuid,
    mut channel: Box<dyn TransportChannel>,
    mut commands: mpsc::UnboundedReceiver<ShellCommand>,
    parent: Weak<SshSession>,
    parent_destroyed: watch::Receiver<bool>,
    shared: Arc<ShellShared>,
) {
    let parent_gone = wait_destroyed(parent_destroyed);
    tokio::pin!(parent_gone);

    loop {
        let step = tokio::select! {
            command = commands.recv() => Step::Command(command),
            event = channel.read() => Step::Event(event),
            _ = &mut parent_gone => Step::ParentGone,
        };

        match step {
            Step::Command(Some(ShellCommand::Write(data))) => {
                if let Err(e) = channel.write(&data).await {
                    tracing::warn!("Shell {} write failed: {}", shell_id, e);
                    break;
                }
            }
            Step::Command(Some(ShellCommand::Resize { cols, rows })) => {
                if let Err(e) = channel.window_change(cols, rows).await {
                    tracing::debug!("Shell {} resize failed: {}", shell_id, e);
                }
            }
            Step::Command(Some(ShellCommand::Close)) | Step::Command(None) => {
                let _ = channel.close().await;
                break;
            }
            Step::Event(Some(ChannelEvent::Data(data))) | Step::Event(Some(ChannelEvent::ExtendedData(data))) => {
                shared.publish(data);
            }
            Step::Event(Some(ChannelEvent::ExitStatus(code))) => {
                tracing::debug!("Shell {} exited with status {}", shell_id, code);
            }
            Step::Event(Some(ChannelEvent::Eof)) => {}
            Step::Event(Some(ChannelEvent::Closed)) | Step::Event(None) => break,
            Step::ParentGone => {
                tracing::info!("Shell {}: parent session destroyed", shell_id);
                break;
            }
        }
    }

    if shared.end() {
        tracing::info!("Shell {} ended", shell_id);
        if let Some(parent) = parent.upgrade() {
            parent.journal(LogLevel::Info, SessionEvent::ShellClosed, None);
        }
    }
}

/// Last line of `output` that starts with `/`
pub fn last_absolute_path(output: &str) -> Option<String> {
    output
        .replace('\r', "")
        .split('\n')
        .map(str::trim)
        .filter(|line| line.starts_with('/'))
        .last()
        .map(str::to_string)
}

/// Incremental parser for `ESC ] 7 ; file://host/path` reports
#[derive(Default)]
pub struct Osc7Tracker {
    pending: Vec<u8>,
}

const OSC7_PREFIX: &[u8] = b"\x1b]7;";
const MAX_PENDING: usize = 4096;

impl Osc7Tracker {
    /// Feed output; returns the last complete report's path
    pub fn feed(&mut self, data: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(data);
        let mut found = None;

        loop {
            let Some(start) = find(&self.pending, OSC7_PREFIX) else {
                // Keep a possible partial prefix at the tail
                let keep = self.pending.len().min(OSC7_PREFIX.len() - 1);
                self.pending.drain(..self.pending.len() - keep);
                break;
            };

            let body_start = start + OSC7_PREFIX.len();
            let terminator = self.pending[body_start..]
                .iter()
                .enumerate()
                .find_map(|(i, b)| match b {
                    0x07 => Some((i, 1)),
                    0x1b if self.pending.get(body_start + i + 1) == Some(&b'\\') => Some((i, 2)),
                    _ => None,
                });

            match terminator {
                Some((len, term_len)) => {
                    let body = String::from_utf8_lossy(&self.pending[body_start..body_start + len]).to_string();
                    if let Some(path) = parse_file_url(&body) {
                        found = Some(path);
                    }
                    self.pending.drain(..body_start + len + term_len);
                }
                None => {
                    self.pending.drain(..start);
                    if self.pending.len() > MAX_PENDING {
                        self.pending.clear();
                    }
                    break;
                }
            }
        }

        found
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Path of a `file://host/path` report, percent-decoded
fn parse_file_url(report: &str) -> Option<String> {
    let url = Url::parse(report).ok()?;
    if url.scheme() != "file" {
        return None;
    }
    let decoded = urlencoding::decode_binary(url.path().as_bytes());
    Some(String::from_utf8_lossy(&decoded).into_owned())
}
