//! Keyboard-interactive authentication
//!
//! ```text
//! idle ──challenge──▶ awaiting-response ──N answers──▶ idle
//!                            │
//!                            └──session destroyed──▶ cancelled
//! ```
//!
//! At most one prompt is outstanding per session. The password prompt
//! raised when no stored credential resolves travels the same path.

use super::transport::{AuthOutcome, Challenge, PromptField, TransportConnection};
use crate::utils::error::{Result, SshSessionError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

/// Capacity of the prompt broadcast
const PROMPT_CHANNEL_CAPACITY: usize = 16;

/// Upper bound on challenge rounds in one authentication
const MAX_ROUNDS: usize = 16;

type Responder = oneshot::Sender<Vec<String>>;

/// A challenge awaiting answers
///
/// Clones share the pending response; the first accepted `respond` wins
/// and every clone goes stale.
#[derive(Clone)]
pub struct KeyboardInteractivePrompt {
    pub id: Uuid,
    /// Session that raised the prompt; a jump host for relayed prompts
    pub session_id: Uuid,
    pub name: String,
    pub instructions: String,
    pub prompts: Vec<PromptField>,
    responder: Arc<Mutex<Option<Responder>>>,
}

impl KeyboardInteractivePrompt {
    fn new(session_id: Uuid, challenge: Challenge) -> (Self, oneshot::Receiver<Vec<String>>) {
        let (tx, rx) = oneshot::channel();
        let prompt = Self {
            id: Uuid::new_v4(),
            session_id,
            name: challenge.name,
            instructions: challenge.instructions,
            prompts: challenge.prompts,
            responder: Arc::new(Mutex::new(Some(tx))),
        };
        (prompt, rx)
    }

    /// Supply one answer per prompt, in order
    ///
    /// A wrong answer count is rejected and the prompt stays pending.
    pub fn respond(&self, answers: Vec<String>) -> Result<()> {
        if answers.len() != self.prompts.len() {
            return Err(SshSessionError::InvalidResponseShape {
                expected: self.prompts.len(),
                got: answers.len(),
            });
        }

        let sender = self.responder.lock().take().ok_or(SshSessionError::Cancelled)?;
        sender.send(answers).map_err(|_| SshSessionError::Cancelled)
    }

    /// Still waiting for answers
    pub fn is_pending(&self) -> bool {
        self.responder
            .lock()
            .as_ref()
            .map_or(false, |tx| !tx.is_closed())
    }

    /// Abandon the prompt; the waiting authentication fails with `Cancelled`
    pub fn cancel(&self) {
        self.responder.lock().take();
    }

    /// Single masked field asking for a password
    pub fn is_password_prompt(&self) -> bool {
        is_password_challenge(&self.prompts)
    }
}

impl fmt::Debug for KeyboardInteractivePrompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyboardInteractivePrompt")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("name", &self.name)
            .field("prompts", &self.prompts)
            .field("pending", &self.is_pending())
            .finish()
    }
}

fn is_password_challenge(prompts: &[PromptField]) -> bool {
    prompts.len() == 1 && !prompts[0].echo && prompts[0].prompt.to_lowercase().contains("password")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticatorState {
    Idle,
    AwaitingResponse,
    Cancelled,
}

struct Inner {
    state: AuthenticatorState,
    outstanding: Option<KeyboardInteractivePrompt>,
    prompts_tx: Option<broadcast::Sender<KeyboardInteractivePrompt>>,
}

/// Per-session prompt state machine and fan-out
pub struct KeyboardInteractiveAuthenticator {
    session_id: Uuid,
    inner: Mutex<Inner>,
}

impl KeyboardInteractiveAuthenticator {
    pub fn new(session_id: Uuid) -> Self {
        let (prompts_tx, _) = broadcast::channel(PROMPT_CHANNEL_CAPACITY);
        Self {
            session_id,
            inner: Mutex::new(Inner {
                state: AuthenticatorState::Idle,
                outstanding: None,
                prompts_tx: Some(prompts_tx),
            }),
        }
    }

    pub fn state(&self) -> AuthenticatorState {
        self.inner.lock().state
    }

    /// Prompts published after this call; closed once the session is destroyed
    pub fn subscribe(&self) -> broadcast::Receiver<KeyboardInteractivePrompt> {
        let inner = self.inner.lock();
        match &inner.prompts_tx {
            Some(tx) => tx.subscribe(),
            None => closed_receiver(),
        }
    }

    /// Prompt currently waiting for answers, for subscribers that attached late
    pub fn outstanding(&self) -> Option<KeyboardInteractivePrompt> {
        self.inner.lock().outstanding.clone()
    }

    /// Publish a challenge and return the pending answers
    pub fn publish(&self, challenge: Challenge) -> Result<oneshot::Receiver<Vec<String>>> {
        let mut inner = self.inner.lock();
        match inner.state {
            AuthenticatorState::Cancelled => return Err(SshSessionError::Cancelled),
            AuthenticatorState::AwaitingResponse => {
                tracing::error!("Session {}: second prompt while one is outstanding", self.session_id);
                return Err(SshSessionError::ConcurrentPromptViolation);
            }
            AuthenticatorState::Idle => {}
        }

        let (prompt, rx) = KeyboardInteractivePrompt::new(self.session_id, challenge);
        tracing::info!(
            "Session {}: keyboard-interactive prompt with {} field(s)",
            self.session_id,
            prompt.prompts.len()
        );
        inner.state = AuthenticatorState::AwaitingResponse;
        inner.outstanding = Some(prompt.clone());
        if let Some(tx) = &inner.prompts_tx {
            let _ = tx.send(prompt);
        }
        Ok(rx)
    }

    /// Publish a challenge and wait for its answers
    pub async fn ask(&self, challenge: Challenge) -> Result<Vec<String>> {
        let rx = self.publish(challenge)?;
        let answers = rx.await;

        let mut inner = self.inner.lock();
        inner.outstanding = None;
        match answers {
            Ok(answers) if inner.state == AuthenticatorState::AwaitingResponse => {
                inner.state = AuthenticatorState::Idle;
                tracing::debug!("Session {}: prompt answered", self.session_id);
                Ok(answers)
            }
            Ok(_) => Err(SshSessionError::Cancelled),
            Err(_) => {
                // Dropped without answers: either the tab detached or the session went away
                if inner.state != AuthenticatorState::Cancelled {
                    inner.state = AuthenticatorState::Idle;
                }
                tracing::info!("Session {}: prompt cancelled", self.session_id);
                Err(SshSessionError::Cancelled)
            }
        }
    }

    /// Re-publish a prompt raised elsewhere in the jump chain
    pub fn relay(&self, prompt: KeyboardInteractivePrompt) {
        let inner = self.inner.lock();
        if let Some(tx) = &inner.prompts_tx {
            let _ = tx.send(prompt);
        }
    }

    /// Session is going away: fail any outstanding prompt and close the stream
    pub fn cancel(&self) {
        let mut inner = self.inner.lock();
        inner.state = AuthenticatorState::Cancelled;
        if let Some(prompt) = inner.outstanding.take() {
            prompt.cancel();
        }
        inner.prompts_tx = None;
    }

    /// Drive keyboard-interactive rounds to completion
    ///
    /// On the first round a lone masked password prompt is answered with
    /// `auto_fill` without surfacing it. Rounds without prompts are answered
    /// with zero responses.
    pub async fn authenticate(
        &self,
        connection: &mut dyn TransportConnection,
        first: AuthOutcome,
        auto_fill: Option<&str>,
    ) -> Result<AuthOutcome> {
        let mut outcome = first;
        for round in 0..MAX_ROUNDS {
            let challenge = match outcome {
                AuthOutcome::Challenge(challenge) => challenge,
                done => return Ok(done),
            };

            let answers = if challenge.prompts.is_empty() {
                Vec::new()
            } else if let (0, Some(password)) = (round, auto_fill) {
                if is_password_challenge(&challenge.prompts) {
                    tracing::debug!("Session {}: answering password prompt from stored credential", self.session_id);
                    vec![password.to_string()]
                } else {
                    self.ask(challenge).await?
                }
            } else {
                self.ask(challenge).await?
            };

            outcome = connection.respond_keyboard_interactive(answers).await?;
        }

        Err(SshSessionError::AuthenticationFailed(format!(
            "keyboard-interactive exceeded {} rounds",
            MAX_ROUNDS
        )))
    }
}

fn closed_receiver() -> broadcast::Receiver<KeyboardInteractivePrompt> {
    let (tx, rx) = broadcast::channel(1);
    drop(tx);
    rx
}
