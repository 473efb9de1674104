//! Session multiplexer
//!
//! Registry from connection identity to the live session serving it. The
//! registry holds weak entries only; sessions are kept alive by the
//! references their consumers hold. The registry lock is taken for lookup
//! and registration and never held across an await.

use super::config_service::{ProfileStore, SshSettings};
use super::credential_resolver::CredentialResolver;
use super::log_service::Notifier;
use super::password_storage::PasswordStorage;
use super::ssh_session::SshSession;
use super::transport::Transport;
use crate::models::{ConnectionIdentity, LogLevel, SessionEvent, SessionInfo, SshProfile};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// Collaborators every session of a multiplexer shares
pub struct SessionContext {
    pub transport: Arc<dyn Transport>,
    pub credentials: Arc<CredentialResolver>,
    pub profiles: Arc<dyn ProfileStore>,
    pub notifier: Arc<dyn Notifier>,
    /// Where plaintext profile passwords move after a successful login
    pub password_storage: Option<Arc<PasswordStorage>>,
    pub settings: SshSettings,
}

struct RegistryEntry {
    session_id: Uuid,
    session: Weak<SshSession>,
}

struct MultiplexerInner {
    context: SessionContext,
    registry: Mutex<HashMap<ConnectionIdentity, RegistryEntry>>,
}

/// Shared handle to the session registry
#[derive(Clone)]
pub struct SessionMultiplexer {
    inner: Arc<MultiplexerInner>,
}

impl SessionMultiplexer {
    pub fn new(context: SessionContext) -> Self {
        Self {
            inner: Arc::new(MultiplexerInner {
                context,
                registry: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.inner.context
    }

    /// Session for `profile`, with one reference taken for the caller
    ///
    /// With reuse allowed (by the caller and the profile) a live session
    /// registered under the same identity is returned, even one whose
    /// `start()` is still in flight. Otherwise a new session is created and
    /// registered. The caller is expected to `start()` it and to `unref()`
    /// it when done.
    pub fn get_or_create(&self, profile: &SshProfile, reuse_allowed: bool) -> Arc<SshSession> {
        let identity = ConnectionIdentity::for_profile(profile, reuse_allowed);
        let mut registry = self.inner.registry.lock();
        // Dropping the last strong handle unregisters, so never do it under the lock
        let mut stale = None;

        if identity.is_shared() {
            if let Some(existing) = registry.get(&identity).and_then(|e| e.session.upgrade()) {
                match existing.try_acquire() {
                    Some(ref_count) => {
                        drop(registry);
                        tracing::info!("Reusing session {} for {} (refs: {})", existing.id(), identity, ref_count);
                        existing.journal(LogLevel::Info, SessionEvent::Reused { ref_count }, None);
                        return existing;
                    }
                    None => stale = Some(existing),
                }
            }
        }

        registry.retain(|_, entry| entry.session.strong_count() > 0);

        let session = SshSession::new(self.clone(), profile.clone(), identity.clone());
        registry.insert(
            identity.clone(),
            RegistryEntry {
                session_id: session.id(),
                session: Arc::downgrade(&session),
            },
        );
        drop(registry);
        drop(stale);

        tracing::info!("Created session {} for {}", session.id(), identity);
        session.journal(LogLevel::Info, SessionEvent::Created, None);
        session
    }

    /// Live session registered under `identity`, without taking a reference
    pub fn find(&self, identity: &ConnectionIdentity) -> Option<Arc<SshSession>> {
        let found = self.inner.registry.lock().get(identity).and_then(|e| e.session.upgrade());
        found.filter(|s| s.is_live())
    }

    /// Drop the entry for `identity` if it still points at `session_id`
    pub(crate) fn unregister(&self, identity: &ConnectionIdentity, session_id: Uuid) {
        let mut registry = self.inner.registry.lock();
        if registry.get(identity).map_or(false, |e| e.session_id == session_id) {
            registry.remove(identity);
            tracing::debug!("Unregistered session {} ({})", session_id, identity);
        }
    }

    /// Snapshot of every registered live session
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.live_sessions().iter().map(|s| s.info()).collect()
    }

    pub fn len(&self) -> usize {
        self.live_sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroy every registered session
    pub fn shutdown(&self) {
        let sessions = self.live_sessions();
        tracing::info!("Shutting down {} session(s)", sessions.len());
        for session in sessions {
            session.destroy();
        }
    }

    fn live_sessions(&self) -> Vec<Arc<SshSession>> {
        let upgraded: Vec<_> = self
            .inner
            .registry
            .lock()
            .values()
            .filter_map(|e| e.session.upgrade())
            .collect();
        upgraded.into_iter().filter(|s| s.is_live()).collect()
    }
}
