//! Authentication sessions.
//!
//! Flow Overview:
//! 1) A session starts unauthenticated, bound to one account, with a
//!    declared intent.
//! 2) Factor verification grants intents; the first success arms a
//!    five-minute timeout.
//! 3) `extend` moves the deadline forward (never backward); expiry or
//!    explicit invalidation makes the token permanently unresolvable.
//!
//! Security boundaries:
//! - A failed authentication leaves the session exactly as it was: no
//!   partial intent grants, no timer changes.
//! - Ephemeral sessions never touch persistent factor storage; they are
//!   satisfied only by in-memory credential verifiers.
//! - The intent set grows monotonically and is reset only by destruction.

pub mod manager;
pub mod token;

use crate::challenge::delegate::ChallengeAlgorithm;
use crate::error::AuthError;
use crate::factor::dispatch::VerificationDispatch;
use crate::factor::lockout::{self, LockoutPolicy};
use crate::factor::rate_limiter::RateLimiter;
use crate::factor::store::FactorStore;
use crate::factor::verifier::CredentialVerifier;
use crate::factor::{AuthFactor, AuthInput, AuthIntent, AuthIntents, FactorMetadata, FactorRef, FactorType};
use crate::signal::{AuthEvent, AuthSource, SignalSink};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use secrecy::SecretString;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use self::token::{BroadcastToken, SessionToken};
use tokio::sync::watch;
use tokio::time::Instant;
use utoipa::ToSchema;

/// Timeout armed on the first successful authentication.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Stable, non-reversible account identifier used towards collaborators
/// and logs. The raw account id never leaves the session layer.
#[must_use]
pub fn obfuscate_account_id(account_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(account_id.as_bytes());
    format!("u-{}", URL_SAFE_NO_PAD.encode(hasher.finalize()))
}

/// Collaborator bundle shared by every session.
#[derive(Clone)]
pub struct SessionServices {
    store: Arc<dyn FactorStore>,
    rate_limiter: Arc<dyn RateLimiter>,
    dispatch: Arc<VerificationDispatch>,
    signals: Arc<dyn SignalSink>,
}

impl SessionServices {
    #[must_use]
    pub fn new(
        store: Arc<dyn FactorStore>,
        rate_limiter: Arc<dyn RateLimiter>,
        dispatch: Arc<VerificationDispatch>,
        signals: Arc<dyn SignalSink>,
    ) -> Self {
        Self {
            store,
            rate_limiter,
            dispatch,
            signals,
        }
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &dyn RateLimiter {
        self.rate_limiter.as_ref()
    }

    #[must_use]
    pub fn dispatch(&self) -> &VerificationDispatch {
        self.dispatch.as_ref()
    }
}

/// Options declared when starting a session.
#[derive(Clone, Copy, Debug)]
pub struct SessionOptions {
    intent: AuthIntent,
    is_ephemeral: bool,
}

impl SessionOptions {
    #[must_use]
    pub fn new(intent: AuthIntent) -> Self {
        Self {
            intent,
            is_ephemeral: false,
        }
    }

    #[must_use]
    pub fn ephemeral(mut self, is_ephemeral: bool) -> Self {
        self.is_ephemeral = is_ephemeral;
        self
    }

    #[must_use]
    pub fn intent(&self) -> AuthIntent {
        self.intent
    }

    #[must_use]
    pub fn is_ephemeral(&self) -> bool {
        self.is_ephemeral
    }
}

/// One factor as reported to callers. Secret material never appears here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
pub struct FactorDescription {
    pub label: String,
    pub kind: FactorType,
    pub lockout_policy: LockoutPolicy,
    /// Milliseconds until the factor accepts attempts; `u64::MAX` = now.
    pub time_available_ms: u64,
    /// Milliseconds until the limiter lease expires; `u64::MAX` = never.
    pub time_expiring_ms: u64,
    /// Signature algorithms, for challenge-response factors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub algorithms: Option<Vec<ChallengeAlgorithm>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionState {
    Unauthenticated,
    Authenticated,
    Invalidated,
}

enum Candidate {
    Verifier(CredentialVerifier),
    Persisted(AuthFactor),
}

impl Candidate {
    fn kind(&self) -> FactorType {
        match self {
            Self::Verifier(verifier) => verifier.kind(),
            Self::Persisted(factor) => factor.kind,
        }
    }
}

/// Per-session authentication state machine.
///
/// Mutated only while checked out through
/// [`manager::AuthSessionManager::run_when_available`] (or the manager's
/// typed wrappers), which guarantees at most one accessor at a time.
pub struct AuthSession {
    token: SessionToken,
    broadcast_token: BroadcastToken,
    account_id: String,
    obfuscated_account_id: String,
    is_ephemeral: bool,
    requested_intent: AuthIntent,
    state: SessionState,
    authorized_intents: AuthIntents,
    deadline: Option<Instant>,
    deadline_tx: watch::Sender<Option<Instant>>,
    // Lazily loaded; dropped on any factor add/remove to force a reload.
    configured_factors: Option<BTreeMap<String, AuthFactor>>,
    verifiers: BTreeMap<String, CredentialVerifier>,
    services: SessionServices,
}

impl AuthSession {
    pub(crate) fn new(
        account_id: &str,
        options: SessionOptions,
        services: SessionServices,
        deadline_tx: watch::Sender<Option<Instant>>,
    ) -> Result<Self, AuthError> {
        let token = SessionToken::generate()
            .map_err(|err| AuthError::Internal(format!("token generation failed: {err}")))?;
        Ok(Self {
            token,
            broadcast_token: BroadcastToken::generate(),
            account_id: account_id.to_string(),
            obfuscated_account_id: obfuscate_account_id(account_id),
            is_ephemeral: options.is_ephemeral,
            requested_intent: options.intent,
            state: SessionState::Unauthenticated,
            authorized_intents: AuthIntents::EMPTY,
            deadline: None,
            deadline_tx,
            configured_factors: None,
            verifiers: BTreeMap::new(),
            services,
        })
    }

    #[must_use]
    pub fn token(&self) -> SessionToken {
        self.token
    }

    #[must_use]
    pub fn broadcast_token(&self) -> BroadcastToken {
        self.broadcast_token
    }

    #[must_use]
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    #[must_use]
    pub fn obfuscated_account_id(&self) -> &str {
        &self.obfuscated_account_id
    }

    #[must_use]
    pub fn is_ephemeral(&self) -> bool {
        self.is_ephemeral
    }

    #[must_use]
    pub fn requested_intent(&self) -> AuthIntent {
        self.requested_intent
    }

    #[must_use]
    pub fn authorized_intents(&self) -> AuthIntents {
        self.authorized_intents
    }

    pub(crate) fn is_invalidated(&self) -> bool {
        self.state == SessionState::Invalidated
    }

    pub(crate) fn invalidate(&mut self) {
        self.state = SessionState::Invalidated;
    }

    pub(crate) fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= Instant::now())
    }

    /// Remaining authorization time. `None` means unbounded: the session
    /// has never been authenticated and carries no timer yet.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Verify the given factor labels against the supplied input and, on
    /// the first success, grant the factor's intents to this session.
    ///
    /// Multiple labels are accepted only as a fallback group: every label
    /// must resolve to the same factor type, and candidates are tried in
    /// listed order.
    ///
    /// # Errors
    /// Session-layer errors (`SessionNotFound`, `InvalidArgument`) plus the
    /// verification taxonomy, passed through unchanged.
    pub async fn authenticate(
        &mut self,
        labels: &[String],
        input: &AuthInput,
    ) -> Result<AuthIntents, AuthError> {
        if self.is_invalidated() {
            return Err(AuthError::SessionNotFound);
        }
        if labels.is_empty() {
            return Err(AuthError::InvalidArgument(
                "at least one factor label is required".to_string(),
            ));
        }

        let candidates = self.resolve_candidates(labels).await?;
        if candidates
            .iter()
            .any(|candidate| candidate.kind() != candidates[0].kind())
        {
            return Err(AuthError::InvalidArgument(
                "multiple labels must form a fallback group of one factor type".to_string(),
            ));
        }

        let mut last_failure = None;
        let mut success = None;
        for candidate in candidates {
            let outcome = match &candidate {
                Candidate::Verifier(verifier) => verifier
                    .verify(input)
                    .map(|()| (verifier.label().to_string(), verifier.kind(), self.verifier_intents())),
                Candidate::Persisted(factor) => {
                    let dispatch = self.services.dispatch.clone();
                    dispatch
                        .verify(&self.obfuscated_account_id, factor, input)
                        .await
                        .map(|granted| (factor.label.clone(), factor.kind, granted))
                }
            };
            match outcome {
                Ok(won) => {
                    success = Some(won);
                    break;
                }
                Err(err) => last_failure = Some(err),
            }
        }

        let Some((label, kind, granted)) = success else {
            return Err(last_failure
                .unwrap_or_else(|| AuthError::Internal("no verification candidates".to_string())));
        };

        self.apply_success(granted);
        self.services.signals.authenticated(&AuthEvent {
            broadcast_token: self.broadcast_token,
            obfuscated_account_id: self.obfuscated_account_id.clone(),
            source: AuthSource::Factor { label, kind },
        });
        Ok(self.authorized_intents)
    }

    /// Trivial grant for the entity that just provisioned this account.
    /// Single-use by design.
    ///
    /// # Errors
    /// `InvalidArgument` when the session already holds intents.
    pub fn on_user_created(&mut self) -> Result<AuthIntents, AuthError> {
        if self.is_invalidated() {
            return Err(AuthError::SessionNotFound);
        }
        if !self.authorized_intents.is_empty() {
            return Err(AuthError::InvalidArgument(
                "the account-creation grant is single-use".to_string(),
            ));
        }
        self.apply_success(AuthIntents::single(AuthIntent::Decrypt).with(AuthIntent::VerifyOnly));
        self.services.signals.authenticated(&AuthEvent {
            broadcast_token: self.broadcast_token,
            obfuscated_account_id: self.obfuscated_account_id.clone(),
            source: AuthSource::NewAccount,
        });
        Ok(self.authorized_intents)
    }

    /// Move the deadline to `max(current, now + duration)`. The max guards
    /// against a racing earlier extension producing a shorter deadline.
    ///
    /// # Errors
    /// `Unauthenticated` when no timer is armed yet.
    pub fn extend(&mut self, duration: Duration) -> Result<Duration, AuthError> {
        if self.is_invalidated() {
            return Err(AuthError::SessionNotFound);
        }
        if self.authorized_intents.is_empty() {
            return Err(AuthError::Unauthenticated);
        }
        let current = self.deadline.ok_or_else(|| {
            AuthError::Internal("authenticated session without a deadline".to_string())
        })?;
        let now = Instant::now();
        let requested = now.checked_add(duration).ok_or_else(|| {
            AuthError::InvalidArgument("extension duration too large".to_string())
        })?;
        let deadline = requested.max(current);
        self.deadline = Some(deadline);
        self.deadline_tx.send_replace(Some(deadline));
        Ok(deadline.saturating_duration_since(now))
    }

    /// Factors usable under this session's requested intent. A persisted
    /// factor and a verifier sharing a label count as one logical factor.
    ///
    /// # Errors
    /// `Internal` when factor storage fails.
    pub async fn list_factors(&mut self) -> Result<Vec<FactorDescription>, AuthError> {
        if self.is_invalidated() {
            return Err(AuthError::SessionNotFound);
        }
        let requested = self.requested_intent;
        let mut described: BTreeMap<String, FactorDescription> = BTreeMap::new();

        if !self.is_ephemeral {
            self.load_configured_factors().await?;
            let factors = self.configured_factors.as_ref().ok_or_else(|| {
                AuthError::Internal("factor cache missing after load".to_string())
            })?;
            let rate_limiter = self.services.rate_limiter.as_ref();
            for factor in factors.values() {
                if !factor.kind.authorized_intents().contains(requested) {
                    continue;
                }
                described.insert(factor.label.clone(), describe_factor(
                    factor,
                    &self.obfuscated_account_id,
                    rate_limiter,
                ));
            }
        }

        let verifier_intents = self.verifier_intents();
        for verifier in self.verifiers.values() {
            if described.contains_key(verifier.label()) {
                continue;
            }
            if !verifier_intents.contains(requested) {
                continue;
            }
            described.insert(
                verifier.label().to_string(),
                FactorDescription {
                    label: verifier.label().to_string(),
                    kind: verifier.kind(),
                    lockout_policy: LockoutPolicy::None,
                    time_available_ms: lockout::NEVER_MS,
                    time_expiring_ms: lockout::NEVER_MS,
                    algorithms: None,
                },
            );
        }

        Ok(described.into_values().collect())
    }

    /// Persist a new factor and drop the cache so the next use reloads.
    ///
    /// # Errors
    /// `Unauthenticated` without a prior Decrypt-grade success;
    /// `InvalidArgument` on ephemeral sessions or empty labels.
    pub async fn add_factor(&mut self, factor: AuthFactor) -> Result<(), AuthError> {
        self.require_decrypt_grade()?;
        if factor.label.trim().is_empty() {
            return Err(AuthError::InvalidArgument(
                "factor label must not be empty".to_string(),
            ));
        }
        self.services
            .store
            .save_factor(&self.obfuscated_account_id, factor)
            .await
            .map_err(|err| AuthError::Internal(format!("factor storage failed: {err}")))?;
        self.configured_factors = None;
        Ok(())
    }

    /// Remove a configured factor. The last factor of a persistent account
    /// cannot be removed: that would lock the account out of itself.
    ///
    /// # Errors
    /// `NoSuchFactor` for unknown labels; `InvalidArgument` for the last
    /// factor; otherwise as [`Self::add_factor`].
    pub async fn remove_factor(&mut self, label: &str) -> Result<(), AuthError> {
        self.require_decrypt_grade()?;
        self.load_configured_factors().await?;
        let factors = self
            .configured_factors
            .as_ref()
            .ok_or_else(|| AuthError::Internal("factor cache missing after load".to_string()))?;
        if !factors.contains_key(label) {
            return Err(AuthError::NoSuchFactor(label.to_string()));
        }
        if factors.len() == 1 {
            return Err(AuthError::InvalidArgument(
                "cannot remove the last configured factor".to_string(),
            ));
        }
        self.services
            .store
            .remove_factor(&self.obfuscated_account_id, label)
            .await
            .map_err(|err| AuthError::Internal(format!("factor storage failed: {err}")))?;
        self.configured_factors = None;
        Ok(())
    }

    /// Install an in-memory verifier for a knowledge factor. On ephemeral
    /// sessions this is the only authentication path; on persistent ones it
    /// shadows a configured factor for lightweight checks.
    ///
    /// # Errors
    /// `InvalidArgument` for non-knowledge factor types.
    pub fn add_credential_verifier(
        &mut self,
        label: &str,
        kind: FactorType,
        secret: &SecretString,
    ) -> Result<(), AuthError> {
        if self.is_invalidated() {
            return Err(AuthError::SessionNotFound);
        }
        let verifier = CredentialVerifier::new(label, kind, secret)?;
        self.verifiers
            .insert(verifier.label().to_string(), verifier);
        Ok(())
    }

    fn require_decrypt_grade(&self) -> Result<(), AuthError> {
        if self.is_invalidated() {
            return Err(AuthError::SessionNotFound);
        }
        if self.is_ephemeral {
            return Err(AuthError::InvalidArgument(
                "ephemeral sessions cannot manage persistent factors".to_string(),
            ));
        }
        if !self.authorized_intents.contains(AuthIntent::Decrypt) {
            return Err(AuthError::Unauthenticated);
        }
        Ok(())
    }

    fn verifier_intents(&self) -> AuthIntents {
        // An ephemeral account has no sealed material; possession of the
        // session secret is full ownership.
        if self.is_ephemeral {
            AuthIntents::single(AuthIntent::Decrypt).with(AuthIntent::VerifyOnly)
        } else {
            AuthIntents::single(AuthIntent::VerifyOnly)
        }
    }

    fn apply_success(&mut self, granted: AuthIntents) {
        self.state = SessionState::Authenticated;
        self.authorized_intents = self.authorized_intents.union(granted);
        if self.deadline.is_none() {
            let deadline = Instant::now() + SESSION_TIMEOUT;
            self.deadline = Some(deadline);
            self.deadline_tx.send_replace(Some(deadline));
        }
    }

    async fn resolve_candidates(&mut self, labels: &[String]) -> Result<Vec<Candidate>, AuthError> {
        let mut candidates = Vec::with_capacity(labels.len());
        for label in labels {
            if let Some(verifier) = self.verifiers.get(label) {
                candidates.push(Candidate::Verifier(verifier.clone()));
                continue;
            }
            if self.is_ephemeral {
                return Err(AuthError::NoSuchFactor(label.clone()));
            }
            self.load_configured_factors().await?;
            let factors = self.configured_factors.as_ref().ok_or_else(|| {
                AuthError::Internal("factor cache missing after load".to_string())
            })?;
            match factors.get(label) {
                Some(factor) => candidates.push(Candidate::Persisted(factor.clone())),
                None => return Err(AuthError::NoSuchFactor(label.clone())),
            }
        }
        Ok(candidates)
    }

    async fn load_configured_factors(&mut self) -> Result<(), AuthError> {
        if self.configured_factors.is_some() {
            return Ok(());
        }
        let factors = self
            .services
            .store
            .load_factors(&self.obfuscated_account_id)
            .await
            .map_err(|err| AuthError::Internal(format!("factor storage failed: {err}")))?;
        self.configured_factors = Some(
            factors
                .into_iter()
                .map(|factor| (factor.label.clone(), factor))
                .collect(),
        );
        Ok(())
    }
}

pub(crate) fn describe_factor(
    factor: &AuthFactor,
    obfuscated_account_id: &str,
    rate_limiter: &dyn RateLimiter,
) -> FactorDescription {
    let status = if factor.lockout_policy != LockoutPolicy::None && rate_limiter.is_enabled() {
        let factor_ref = FactorRef {
            obfuscated_account_id,
            label: &factor.label,
        };
        lockout::evaluate(
            factor.lockout_policy,
            rate_limiter.delay_seconds(&factor_ref),
            rate_limiter.expiration_seconds(&factor_ref),
        )
    } else {
        lockout::evaluate(factor.lockout_policy, lockout::NO_DELAY, None)
    };
    FactorDescription {
        label: factor.label.clone(),
        kind: factor.kind,
        lockout_policy: factor.lockout_policy,
        time_available_ms: status.time_available_ms,
        time_expiring_ms: status.time_expiring_ms,
        algorithms: match &factor.metadata {
            FactorMetadata::SmartCard { public_key, .. } => Some(public_key.algorithms.clone()),
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::ChallengeCredentialsHelper;
    use crate::challenge::backend::SoftwareSealingBackend;
    use crate::factor::rate_limiter::NoopRateLimiter;
    use crate::factor::store::InMemoryFactorStore;
    use crate::signal::TracingSignalSink;

    fn services_with_store(store: Arc<InMemoryFactorStore>) -> SessionServices {
        let rate_limiter = Arc::new(NoopRateLimiter);
        let helper = Arc::new(ChallengeCredentialsHelper::new(Arc::new(
            SoftwareSealingBackend::new(),
        )));
        SessionServices::new(
            store,
            rate_limiter.clone(),
            Arc::new(VerificationDispatch::new(rate_limiter, helper)),
            Arc::new(TracingSignalSink),
        )
    }

    fn session(options: SessionOptions, store: Arc<InMemoryFactorStore>) -> AuthSession {
        let (deadline_tx, _deadline_rx) = watch::channel(None);
        AuthSession::new("user@example.com", options, services_with_store(store), deadline_tx)
            .expect("session")
    }

    async fn store_with_password(secret: &str) -> Arc<InMemoryFactorStore> {
        let store = Arc::new(InMemoryFactorStore::new());
        store
            .save_factor(
                &obfuscate_account_id("user@example.com"),
                AuthFactor::with_secret(
                    "pw",
                    FactorType::Password,
                    &SecretString::from(secret.to_string()),
                    LockoutPolicy::None,
                ),
            )
            .await
            .expect("save");
        store
    }

    fn secret(value: &str) -> AuthInput {
        AuthInput::Secret(SecretString::from(value.to_string()))
    }

    #[tokio::test]
    async fn first_success_grants_intents_and_arms_timer() {
        let store = store_with_password("hunter2").await;
        let mut session = session(SessionOptions::new(AuthIntent::Decrypt), store);
        assert_eq!(session.remaining(), None);

        let intents = session
            .authenticate(&["pw".to_string()], &secret("hunter2"))
            .await
            .expect("authenticate");
        assert!(intents.contains(AuthIntent::Decrypt));
        assert!(intents.contains(AuthIntent::VerifyOnly));
        assert!(intents.contains(AuthIntent::WebAuthn));
        assert!(session.remaining().is_some());
    }

    #[tokio::test]
    async fn failure_leaves_session_untouched() {
        let store = store_with_password("hunter2").await;
        let mut session = session(SessionOptions::new(AuthIntent::Decrypt), store);

        let err = session
            .authenticate(&["pw".to_string()], &secret("wrong"))
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::WrongSecret);
        assert!(session.authorized_intents().is_empty());
        assert_eq!(session.remaining(), None);
    }

    #[tokio::test]
    async fn unknown_label_is_no_such_factor() {
        let store = store_with_password("hunter2").await;
        let mut session = session(SessionOptions::new(AuthIntent::Decrypt), store);
        let err = session
            .authenticate(&["ghost".to_string()], &secret("hunter2"))
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::NoSuchFactor("ghost".to_string()));
    }

    #[tokio::test]
    async fn extend_requires_prior_authentication() {
        let store = Arc::new(InMemoryFactorStore::new());
        let mut session = session(SessionOptions::new(AuthIntent::Decrypt), store);
        assert_eq!(
            session.extend(Duration::from_secs(60)),
            Err(AuthError::Unauthenticated)
        );
        assert_eq!(session.remaining(), None);
    }

    #[tokio::test]
    async fn extend_never_shortens_the_deadline() {
        let store = store_with_password("hunter2").await;
        let mut session = session(SessionOptions::new(AuthIntent::Decrypt), store);
        session
            .authenticate(&["pw".to_string()], &secret("hunter2"))
            .await
            .expect("authenticate");

        let before = session.remaining().expect("remaining");
        let after = session.extend(Duration::from_secs(1)).expect("extend");
        assert!(after >= before - Duration::from_secs(1));

        let extended = session.extend(SESSION_TIMEOUT * 2).expect("extend");
        assert!(extended > before);
    }

    #[tokio::test]
    async fn account_creation_grant_is_single_use() {
        let store = Arc::new(InMemoryFactorStore::new());
        let mut session = session(SessionOptions::new(AuthIntent::Decrypt), store);
        let intents = session.on_user_created().expect("grant");
        assert!(intents.contains(AuthIntent::Decrypt));
        assert!(intents.contains(AuthIntent::VerifyOnly));
        assert!(!intents.contains(AuthIntent::WebAuthn));
        assert!(session.remaining().is_some());
        assert!(matches!(
            session.on_user_created(),
            Err(AuthError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn ephemeral_sessions_only_use_verifiers() {
        let store = store_with_password("hunter2").await;
        let mut session = session(
            SessionOptions::new(AuthIntent::Decrypt).ephemeral(true),
            store,
        );

        // The persisted factor is invisible to an ephemeral session.
        let err = session
            .authenticate(&["pw".to_string()], &secret("hunter2"))
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::NoSuchFactor("pw".to_string()));

        session
            .add_credential_verifier(
                "guest",
                FactorType::Password,
                &SecretString::from("guest-secret".to_string()),
            )
            .expect("verifier");
        let intents = session
            .authenticate(&["guest".to_string()], &secret("guest-secret"))
            .await
            .expect("authenticate");
        assert!(intents.contains(AuthIntent::Decrypt));
        assert!(intents.contains(AuthIntent::VerifyOnly));
    }

    #[tokio::test]
    async fn verifier_on_persistent_session_is_verify_only() {
        let store = Arc::new(InMemoryFactorStore::new());
        let mut session = session(SessionOptions::new(AuthIntent::VerifyOnly), store);
        session
            .add_credential_verifier(
                "pw",
                FactorType::Password,
                &SecretString::from("light".to_string()),
            )
            .expect("verifier");
        let intents = session
            .authenticate(&["pw".to_string()], &secret("light"))
            .await
            .expect("authenticate");
        assert!(intents.contains(AuthIntent::VerifyOnly));
        assert!(!intents.contains(AuthIntent::Decrypt));
    }

    #[tokio::test]
    async fn intent_set_grows_monotonically() {
        let store = store_with_password("hunter2").await;
        let mut session = session(SessionOptions::new(AuthIntent::VerifyOnly), store);
        session
            .add_credential_verifier(
                "light",
                FactorType::Password,
                &SecretString::from("shadow".to_string()),
            )
            .expect("verifier");

        let first = session
            .authenticate(&["light".to_string()], &secret("shadow"))
            .await
            .expect("authenticate");
        assert!(!first.contains(AuthIntent::Decrypt));

        let second = session
            .authenticate(&["pw".to_string()], &secret("hunter2"))
            .await
            .expect("authenticate");
        assert!(second.contains(AuthIntent::Decrypt));
        assert!(second.contains(AuthIntent::VerifyOnly));

        // A later verify-only success must not shrink the set.
        let third = session
            .authenticate(&["light".to_string()], &secret("shadow"))
            .await
            .expect("authenticate");
        assert_eq!(third, second);
    }

    #[tokio::test]
    async fn mixed_fallback_group_is_rejected() {
        let store = store_with_password("hunter2").await;
        let mut session = session(SessionOptions::new(AuthIntent::Decrypt), store.clone());
        store
            .save_factor(
                &obfuscate_account_id("user@example.com"),
                AuthFactor::with_secret(
                    "pin",
                    FactorType::Pin,
                    &SecretString::from("1234".to_string()),
                    LockoutPolicy::AttemptLimited,
                ),
            )
            .await
            .expect("save");
        let err = session
            .authenticate(
                &["pw".to_string(), "pin".to_string()],
                &secret("hunter2"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn fallback_group_accepts_first_success() {
        let store = store_with_password("current").await;
        store
            .save_factor(
                &obfuscate_account_id("user@example.com"),
                AuthFactor::with_secret(
                    "pw-legacy",
                    FactorType::Password,
                    &SecretString::from("current".to_string()),
                    LockoutPolicy::None,
                ),
            )
            .await
            .expect("save");
        let mut session = session(SessionOptions::new(AuthIntent::Decrypt), store);
        // First label holds a different secret, second one matches.
        let intents = session
            .authenticate(
                &["pw-other".to_string(), "pw-legacy".to_string()],
                &secret("current"),
            )
            .await;
        // "pw-other" does not exist, so resolution fails before dispatch.
        assert_eq!(
            intents.unwrap_err(),
            AuthError::NoSuchFactor("pw-other".to_string())
        );

        let intents = session
            .authenticate(
                &["pw".to_string(), "pw-legacy".to_string()],
                &secret("current"),
            )
            .await
            .expect("authenticate");
        assert!(intents.contains(AuthIntent::Decrypt));
    }

    #[tokio::test]
    async fn listing_respects_requested_intent_and_dedups_labels() {
        let store = store_with_password("hunter2").await;
        let mut session = session(SessionOptions::new(AuthIntent::Decrypt), store);
        // Shadow the persisted password with a verifier under the same
        // label: still one logical factor.
        session
            .add_credential_verifier(
                "pw",
                FactorType::Password,
                &SecretString::from("shadow".to_string()),
            )
            .expect("verifier");
        let listed = session.list_factors().await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].label, "pw");
        assert_eq!(listed[0].kind, FactorType::Password);
        // The verifier alone is verify-grade, so under a Decrypt intent the
        // persisted factor is what qualifies the label.
        assert_eq!(listed[0].time_available_ms, lockout::NEVER_MS);
    }

    #[tokio::test]
    async fn factor_management_requires_decrypt_grade() {
        let store = store_with_password("hunter2").await;
        let mut session = session(SessionOptions::new(AuthIntent::Decrypt), store);
        let pin = AuthFactor::with_secret(
            "pin",
            FactorType::Pin,
            &SecretString::from("1234".to_string()),
            LockoutPolicy::AttemptLimited,
        );
        assert_eq!(
            session.add_factor(pin.clone()).await,
            Err(AuthError::Unauthenticated)
        );

        session
            .authenticate(&["pw".to_string()], &secret("hunter2"))
            .await
            .expect("authenticate");
        session.add_factor(pin).await.expect("add");

        let listed = session.list_factors().await.expect("list");
        assert_eq!(listed.len(), 2);

        session.remove_factor("pin").await.expect("remove");
        let err = session.remove_factor("pw").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn obfuscated_ids_are_stable_and_distinct() {
        assert_eq!(
            obfuscate_account_id("user@example.com"),
            obfuscate_account_id("user@example.com")
        );
        assert_ne!(
            obfuscate_account_id("user@example.com"),
            obfuscate_account_id("other@example.com")
        );
        assert!(obfuscate_account_id("user@example.com").starts_with("u-"));
    }
}
