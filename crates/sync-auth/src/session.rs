//! Session manager.
//!
//! Owns the session value and the state machine behind it. The dispatcher
//! only ever reads the token through [`SessionManager::token`].

use crate::authenticator::{Authenticator, SessionGrant};
use crate::cache::{CachedSession, SessionCache};
use crate::session_fsm::{
    RefreshConfig, SessionMachine, SessionMachineInput, SessionState,
};
use crate::{AuthError, AuthResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use sync_core::{SyncEvent, SyncEventSink};
use sync_durable_store::DurableQueueStore;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Snapshot of the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub state: SessionState,
    /// Present only while `Authenticated` or `Ready`.
    pub session_token: Option<String>,
    pub user_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    fn disconnected() -> Self {
        Self {
            state: SessionState::Disconnected,
            session_token: None,
            user_id: None,
            expires_at: None,
        }
    }
}

struct SessionInner {
    machine: SessionMachine,
    session_token: Option<String>,
    user_id: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

impl SessionInner {
    fn snapshot(&self) -> Session {
        Session {
            state: SessionState::from(self.machine.state()),
            session_token: self.session_token.clone(),
            user_id: self.user_id.clone(),
            expires_at: self.expires_at,
        }
    }
}

pub struct SessionManager {
    inner: Mutex<SessionInner>,
    authenticator: Arc<dyn Authenticator>,
    store: Arc<DurableQueueStore>,
    cache: SessionCache,
    entity_tables: Vec<String>,
    refresh_config: RefreshConfig,
    sink: Arc<dyn SyncEventSink>,
    watch: watch::Sender<Session>,
}

impl SessionManager {
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        store: Arc<DurableQueueStore>,
        entity_tables: Vec<String>,
        sink: Arc<dyn SyncEventSink>,
    ) -> Self {
        Self::with_refresh_config(
            authenticator,
            store,
            entity_tables,
            sink,
            RefreshConfig::default(),
        )
    }

    pub fn with_refresh_config(
        authenticator: Arc<dyn Authenticator>,
        store: Arc<DurableQueueStore>,
        entity_tables: Vec<String>,
        sink: Arc<dyn SyncEventSink>,
        refresh_config: RefreshConfig,
    ) -> Self {
        let (watch, _) = watch::channel(Session::disconnected());
        Self {
            inner: Mutex::new(SessionInner {
                machine: SessionMachine::new(),
                session_token: None,
                user_id: None,
                expires_at: None,
            }),
            authenticator,
            cache: SessionCache::new(store.clone()),
            store,
            entity_tables,
            refresh_config,
            sink,
            watch,
        }
    }

    pub fn state(&self) -> SessionState {
        let inner = self.inner.lock().expect("lock poisoned");
        SessionState::from(inner.machine.state())
    }

    pub fn snapshot(&self) -> Session {
        self.inner.lock().expect("lock poisoned").snapshot()
    }

    /// Current token, only while `Authenticated` or `Ready`.
    pub fn token(&self) -> Option<String> {
        let inner = self.inner.lock().expect("lock poisoned");
        if SessionState::from(inner.machine.state()).has_token() {
            inner.session_token.clone()
        } else {
            None
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Receives every session change.
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.watch.subscribe()
    }

    /// Apply `input`, then let `update` adjust the session fields. Leaving
    /// the token-holding states always drops the token.
    fn transition(
        &self,
        input: &SessionMachineInput,
        update: impl FnOnce(&mut SessionInner),
    ) -> AuthResult<SessionState> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let old_state = SessionState::from(inner.machine.state());

        inner.machine.consume(input).map_err(|_| {
            AuthError::InvalidStateTransition(format!(
                "Cannot apply {:?} in state {:?}",
                input,
                inner.machine.state()
            ))
        })?;

        update(&mut *inner);
        let new_state = SessionState::from(inner.machine.state());
        if !new_state.has_token() {
            inner.session_token = None;
        }
        let snapshot = inner.snapshot();
        drop(inner);

        if old_state != new_state {
            debug!(old_state = ?old_state, new_state = ?new_state, "Session state transition");
        }
        self.watch.send_replace(snapshot);
        Ok(new_state)
    }

    fn apply_grant(inner: &mut SessionInner, grant: &SessionGrant) {
        inner.session_token = Some(grant.session_token.clone());
        inner.user_id = Some(grant.user_id.clone());
        inner.expires_at = Some(grant.expires_at);
    }

    /// Establish a session for `user_id`, using the cached session when it
    /// is still valid for that user.
    ///
    /// Ends in `Authenticated`; call [`SessionManager::mark_ready`] once the
    /// local state is loaded.
    pub async fn connect(&self, user_id: &str) -> AuthResult<Session> {
        let current = self.snapshot();
        match current.state {
            SessionState::Authenticated | SessionState::Ready
                if current.user_id.as_deref() == Some(user_id) =>
            {
                return Ok(current);
            }
            SessionState::Authenticated | SessionState::Ready => {
                info!(user_id, "Switching user; dropping current session");
                self.logout().await?;
            }
            SessionState::Deauthenticated if current.user_id.as_deref() != Some(user_id) => {
                self.logout().await?;
            }
            _ => {}
        }

        if self.state() == SessionState::Disconnected {
            if let Some(session) = self.try_cached(user_id).await? {
                return Ok(session);
            }
        }

        self.challenge(user_id).await?;
        Ok(self.snapshot())
    }

    async fn try_cached(&self, user_id: &str) -> AuthResult<Option<Session>> {
        let Some(cached) = self.cache.load().await else {
            return Ok(None);
        };

        if !cached.is_valid_for(user_id, Utc::now()) {
            info!(
                cached_user = %cached.user_id,
                user_id,
                expired = cached.expires_at <= Utc::now(),
                "Cached session unusable; clearing cached state"
            );
            self.cache.clear().await;
            self.store.clear_tables(&self.entity_tables).await;
            return Ok(None);
        }

        self.transition(&SessionMachineInput::CachedSessionFound, |_| {})?;
        let grant = SessionGrant {
            session_token: cached.session_token,
            user_id: cached.user_id,
            expires_at: cached.expires_at,
        };
        self.transition(&SessionMachineInput::CachedSessionAccepted, |inner| {
            Self::apply_grant(inner, &grant)
        })?;
        info!(user_id, "Resumed cached session");
        Ok(Some(self.snapshot()))
    }

    /// Connectivity then credential challenge, from `Disconnected`,
    /// `Connected` or `Deauthenticated`.
    async fn challenge(&self, user_id: &str) -> AuthResult<()> {
        let token = match self.authenticator.obtain_connectivity_token().await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Connectivity challenge failed");
                return Err(match e {
                    AuthError::ConnectivityUnavailable(_) => e,
                    other if other.is_transient() => {
                        AuthError::ConnectivityUnavailable(other.to_string())
                    }
                    other => other,
                });
            }
        };

        match self.state() {
            SessionState::Disconnected => {
                self.transition(&SessionMachineInput::ConnectivityAcquired, |inner| {
                    inner.user_id = Some(user_id.to_string());
                })?;
            }
            SessionState::Deauthenticated => {
                self.transition(&SessionMachineInput::ChallengeStarted, |_| {})?;
            }
            _ => {}
        }

        match self.authenticator.authenticate(&token, user_id).await {
            Ok(grant) => {
                self.transition(&SessionMachineInput::SessionIssued, |inner| {
                    Self::apply_grant(inner, &grant)
                })?;
                self.cache
                    .save(&CachedSession {
                        user_id: grant.user_id.clone(),
                        session_token: grant.session_token.clone(),
                        expires_at: grant.expires_at,
                    })
                    .await;
                Ok(())
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Credential challenge failed transiently");
                self.transition(&SessionMachineInput::CredentialRejected, |_| {})?;
                Err(e)
            }
            Err(e) => {
                warn!(error = %e, "Credentials rejected");
                self.transition(&SessionMachineInput::CredentialRejected, |_| {})?;
                Err(match e {
                    AuthError::CredentialsRejected(_) => e,
                    other => AuthError::CredentialsRejected(other.to_string()),
                })
            }
        }
    }

    /// `Authenticated → Ready`.
    pub fn mark_ready(&self) -> AuthResult<()> {
        self.transition(&SessionMachineInput::LocalStateReady, |_| {})?;
        let user_id = self.snapshot().user_id.unwrap_or_default();
        info!(user_id = %user_id, "Session ready");
        self.sink.emit(SyncEvent::SessionReady { user_id });
        Ok(())
    }

    /// Token rejected by the service. Returns false when the session was
    /// not holding a token, so one expiry triggers one reauthentication.
    pub async fn mark_stale(&self, reason: &str) -> bool {
        if self
            .transition(&SessionMachineInput::TokenRejected, |_| {})
            .is_err()
        {
            return false;
        }
        self.cache.clear().await;
        warn!(reason, "Session deauthenticated");
        self.sink.emit(SyncEvent::SessionDeauthenticated {
            reason: reason.to_string(),
        });
        true
    }

    /// Run the challenge again after [`SessionManager::mark_stale`], retrying
    /// transient failures with backoff. Ends in `Ready`.
    pub async fn reauthenticate(&self) -> AuthResult<Session> {
        let user_id = self.snapshot().user_id.ok_or(AuthError::NotLoggedIn)?;
        let mut last_error = None;

        for attempt in 0..self.refresh_config.max_retries {
            match self.state() {
                SessionState::Ready => return Ok(self.snapshot()),
                SessionState::Deauthenticated | SessionState::Connected => {}
                other => {
                    return Err(AuthError::InvalidStateTransition(format!(
                        "Cannot reauthenticate in state {other:?}"
                    )))
                }
            }

            match self.challenge(&user_id).await {
                Ok(()) => {
                    self.mark_ready()?;
                    info!(user_id = %user_id, attempt = attempt + 1, "Reauthenticated");
                    return Ok(self.snapshot());
                }
                Err(e) if e.is_transient() => {
                    last_error = Some(e);
                    if attempt + 1 < self.refresh_config.max_retries {
                        let delay = self.refresh_config.delay_for_attempt(attempt);
                        debug!(
                            attempt = attempt + 1,
                            max_retries = self.refresh_config.max_retries,
                            delay_ms = delay.as_millis() as u64,
                            "Reauthentication failed with transient error, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        warn!(
            "Reauthentication failed after {} attempts",
            self.refresh_config.max_retries
        );
        Err(last_error.unwrap_or(AuthError::RefreshExhausted(
            self.refresh_config.max_retries,
        )))
    }

    /// Drop the session and its cache. The operation queue is untouched.
    pub async fn logout(&self) -> AuthResult<()> {
        let input = match self.state() {
            SessionState::Disconnected => return Ok(()),
            SessionState::Connected => SessionMachineInput::ConnectionLost,
            _ => SessionMachineInput::LoggedOut,
        };
        self.transition(&input, |inner| {
            inner.user_id = None;
            inner.expires_at = None;
        })?;
        self.cache.clear().await;
        info!("Logged out");
        Ok(())
    }
}
