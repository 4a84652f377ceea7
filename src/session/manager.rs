//! Process-wide session registry.
//!
//! Flow Overview:
//! 1) `start_session` creates an unauthenticated session and hands back its
//!    tokens.
//! 2) Every later operation checks the session out through a fair (FIFO)
//!    per-session lock: concurrent requests for one token queue, they never
//!    interleave.
//! 3) A per-session watchdog task observes the deadline through a watch
//!    channel and posts expiry through the same lock, so a timer firing
//!    against an in-flight operation is resolved by queue order, not by a
//!    wall-clock race.
//!
//! Teardown drops every session, making all tokens permanently
//! unresolvable.

use crate::error::AuthError;
use crate::factor::{AuthFactor, AuthInput, AuthIntents, FactorType};
use crate::session::token::{BroadcastToken, SessionToken};
use crate::session::{AuthSession, FactorDescription, SessionOptions, SessionServices, obfuscate_account_id};
use regex::Regex;
use secrecy::SecretString;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

struct SessionEntry {
    session: Arc<AsyncMutex<AuthSession>>,
    obfuscated_account_id: String,
    is_ephemeral: bool,
}

/// Registry owning every live [`AuthSession`].
pub struct AuthSessionManager {
    services: SessionServices,
    sessions: std::sync::Mutex<HashMap<SessionToken, SessionEntry>>,
    // Handed to per-session watchdogs so they never keep the registry
    // alive past teardown.
    weak: Weak<AuthSessionManager>,
}

impl AuthSessionManager {
    #[must_use]
    pub fn new(services: SessionServices) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            services,
            sessions: std::sync::Mutex::new(HashMap::new()),
            weak: weak.clone(),
        })
    }

    /// Allocate a new unauthenticated session for `account_id`.
    ///
    /// # Errors
    /// `InvalidArgument` for malformed account ids, or when the ephemeral
    /// flag conflicts with an existing live session for the same identity.
    pub fn start_session(
        &self,
        account_id: &str,
        options: SessionOptions,
    ) -> Result<(SessionToken, BroadcastToken), AuthError> {
        if !valid_account_id(account_id) {
            return Err(AuthError::InvalidArgument(
                "account id must be a non-empty printable identifier".to_string(),
            ));
        }
        let obfuscated = obfuscate_account_id(account_id);

        let (deadline_tx, deadline_rx) = watch::channel(None);
        let session = AuthSession::new(account_id, options, self.services.clone(), deadline_tx)?;
        let token = session.token();
        let broadcast_token = session.broadcast_token();

        {
            let mut sessions = lock_registry(&self.sessions)?;
            let conflicting = sessions.values().any(|entry| {
                entry.obfuscated_account_id == obfuscated
                    && entry.is_ephemeral != options.is_ephemeral()
            });
            if conflicting {
                return Err(AuthError::InvalidArgument(
                    "ephemeral flag conflicts with a live session for this account".to_string(),
                ));
            }
            if sessions.contains_key(&token) {
                return Err(AuthError::Internal("session token collision".to_string()));
            }
            sessions.insert(
                token,
                SessionEntry {
                    session: Arc::new(AsyncMutex::new(session)),
                    obfuscated_account_id: obfuscated.clone(),
                    is_ephemeral: options.is_ephemeral(),
                },
            );
        }

        tokio::spawn(watchdog(self.weak.clone(), token, deadline_rx));
        debug!(account = %obfuscated, "session started");
        Ok((token, broadcast_token))
    }

    /// Run `operation` with exclusive access to the session. Requests for
    /// the same token queue in FIFO order; the operation is never invoked
    /// for an unknown or invalidated token.
    ///
    /// # Errors
    /// `SessionNotFound` when the token does not resolve.
    pub async fn run_when_available<F, R>(
        &self,
        token: &SessionToken,
        operation: F,
    ) -> Result<R, AuthError>
    where
        F: FnOnce(&mut AuthSession) -> R + Send,
        R: Send,
    {
        let mut session = self.checkout(token).await?;
        Ok(operation(&mut session))
    }

    /// Typed wrapper over [`Self::run_when_available`] for authentication.
    ///
    /// # Errors
    /// As [`AuthSession::authenticate`], plus `SessionNotFound`.
    pub async fn authenticate(
        &self,
        token: &SessionToken,
        labels: &[String],
        input: &AuthInput,
    ) -> Result<AuthIntents, AuthError> {
        let mut session = self.checkout(token).await?;
        session.authenticate(labels, input).await
    }

    /// # Errors
    /// As [`AuthSession::extend`], plus `SessionNotFound`.
    pub async fn extend(
        &self,
        token: &SessionToken,
        duration: Duration,
    ) -> Result<Duration, AuthError> {
        let mut session = self.checkout(token).await?;
        session.extend(duration)
    }

    /// # Errors
    /// As [`AuthSession::on_user_created`], plus `SessionNotFound`.
    pub async fn on_user_created(&self, token: &SessionToken) -> Result<AuthIntents, AuthError> {
        let mut session = self.checkout(token).await?;
        session.on_user_created()
    }

    /// Remaining authorization time; `None` means unbounded (never
    /// authenticated).
    ///
    /// # Errors
    /// `SessionNotFound` when the token does not resolve.
    pub async fn remaining(&self, token: &SessionToken) -> Result<Option<Duration>, AuthError> {
        let session = self.checkout(token).await?;
        Ok(session.remaining())
    }

    /// # Errors
    /// As [`AuthSession::list_factors`], plus `SessionNotFound`.
    pub async fn list_factors(
        &self,
        token: &SessionToken,
    ) -> Result<Vec<FactorDescription>, AuthError> {
        let mut session = self.checkout(token).await?;
        session.list_factors().await
    }

    /// List configured factors for an account without holding a session.
    /// No intent filter applies; every persisted factor is reported.
    ///
    /// # Errors
    /// `InvalidArgument` for malformed account ids, `Internal` on storage
    /// failure.
    pub async fn list_account_factors(
        &self,
        account_id: &str,
    ) -> Result<Vec<FactorDescription>, AuthError> {
        if !valid_account_id(account_id) {
            return Err(AuthError::InvalidArgument(
                "account id must be a non-empty printable identifier".to_string(),
            ));
        }
        let obfuscated = obfuscate_account_id(account_id);
        let factors = self
            .services
            .store
            .load_factors(&obfuscated)
            .await
            .map_err(|err| AuthError::Internal(format!("factor storage failed: {err}")))?;
        Ok(factors
            .iter()
            .map(|factor| {
                super::describe_factor(factor, &obfuscated, self.services.rate_limiter())
            })
            .collect())
    }

    /// # Errors
    /// As [`AuthSession::add_factor`], plus `SessionNotFound`.
    pub async fn add_factor(
        &self,
        token: &SessionToken,
        factor: AuthFactor,
    ) -> Result<(), AuthError> {
        let mut session = self.checkout(token).await?;
        session.add_factor(factor).await
    }

    /// # Errors
    /// As [`AuthSession::remove_factor`], plus `SessionNotFound`.
    pub async fn remove_factor(&self, token: &SessionToken, label: &str) -> Result<(), AuthError> {
        let mut session = self.checkout(token).await?;
        session.remove_factor(label).await
    }

    /// # Errors
    /// As [`AuthSession::add_credential_verifier`], plus `SessionNotFound`.
    pub async fn add_credential_verifier(
        &self,
        token: &SessionToken,
        label: &str,
        kind: FactorType,
        secret: &SecretString,
    ) -> Result<(), AuthError> {
        let mut session = self.checkout(token).await?;
        session.add_credential_verifier(label, kind, secret)
    }

    /// Remove the session and resolve its timer. Idempotent: the caller's
    /// goal is "this token must stop working", which an already-gone token
    /// satisfies.
    ///
    /// # Errors
    /// `Internal` only on registry lock poisoning.
    pub async fn invalidate(&self, token: &SessionToken) -> Result<(), AuthError> {
        let Some(session) = self.session_arc(token)? else {
            return Ok(());
        };
        // Queue behind any in-flight operation: invalidation happens
        // strictly before or after it, never interleaved.
        let mut session = session.lock_owned().await;
        session.invalidate();
        drop(session);
        self.remove_entry(token)?;
        debug!("session invalidated");
        Ok(())
    }

    /// Drop all sessions, invalidating every token.
    ///
    /// # Errors
    /// `Internal` only on registry lock poisoning.
    pub fn shutdown(&self) -> Result<(), AuthError> {
        let mut sessions = lock_registry(&self.sessions)?;
        let count = sessions.len();
        sessions.clear();
        if count > 0 {
            debug!(count, "registry teardown dropped live sessions");
        }
        Ok(())
    }

    /// Number of live sessions.
    ///
    /// # Errors
    /// `Internal` only on registry lock poisoning.
    pub fn session_count(&self) -> Result<usize, AuthError> {
        Ok(lock_registry(&self.sessions)?.len())
    }

    async fn checkout(
        &self,
        token: &SessionToken,
    ) -> Result<OwnedMutexGuard<AuthSession>, AuthError> {
        let Some(session) = self.session_arc(token)? else {
            return Err(AuthError::SessionNotFound);
        };
        // The tokio mutex is fair: waiters are served FIFO, which is what
        // makes this a queue rather than a pollable lock.
        let session = session.lock_owned().await;
        if session.is_invalidated() {
            return Err(AuthError::SessionNotFound);
        }
        Ok(session)
    }

    fn session_arc(
        &self,
        token: &SessionToken,
    ) -> Result<Option<Arc<AsyncMutex<AuthSession>>>, AuthError> {
        let sessions = lock_registry(&self.sessions)?;
        Ok(sessions.get(token).map(|entry| entry.session.clone()))
    }

    fn remove_entry(&self, token: &SessionToken) -> Result<(), AuthError> {
        let mut sessions = lock_registry(&self.sessions)?;
        sessions.remove(token);
        Ok(())
    }

    /// Invalidate the session if its deadline has passed. Returns whether
    /// the session is gone (expired now, or already removed).
    async fn reap_if_expired(&self, token: &SessionToken) -> Result<bool, AuthError> {
        let Some(session) = self.session_arc(token)? else {
            return Ok(true);
        };
        let mut session = session.lock_owned().await;
        if session.is_invalidated() {
            return Ok(true);
        }
        if !session.deadline_passed() {
            // Extended while we waited for the lock; the watchdog re-reads
            // the new deadline.
            return Ok(false);
        }
        session.invalidate();
        drop(session);
        self.remove_entry(token)?;
        debug!("session expired");
        Ok(true)
    }
}

async fn watchdog(
    manager: Weak<AuthSessionManager>,
    token: SessionToken,
    mut deadline_rx: watch::Receiver<Option<Instant>>,
) {
    loop {
        let deadline = *deadline_rx.borrow_and_update();
        match deadline {
            None => {
                // No timer armed yet; wait for the first authentication.
                if deadline_rx.changed().await.is_err() {
                    return;
                }
            }
            Some(at) => {
                tokio::select! {
                    () = tokio::time::sleep_until(at) => {
                        let Some(manager) = manager.upgrade() else {
                            return;
                        };
                        match manager.reap_if_expired(&token).await {
                            Ok(true) => return,
                            Ok(false) => {}
                            Err(err) => {
                                warn!("session expiry check failed: {err}");
                                return;
                            }
                        }
                    }
                    changed = deadline_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

fn valid_account_id(account_id: &str) -> bool {
    Regex::new(r"^\S{1,256}$").is_ok_and(|regex| regex.is_match(account_id))
}

fn lock_registry<'a>(
    sessions: &'a std::sync::Mutex<HashMap<SessionToken, SessionEntry>>,
) -> Result<std::sync::MutexGuard<'a, HashMap<SessionToken, SessionEntry>>, AuthError> {
    sessions
        .lock()
        .map_err(|_| AuthError::Internal("session registry lock poisoned".to_string()))
}
