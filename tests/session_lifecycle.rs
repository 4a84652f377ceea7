//! End-to-end exercises of the session authority through its public API.

use anyhow::Result;
use async_trait::async_trait;
use custode::challenge::ChallengeCredentialsHelper;
use custode::challenge::backend::{
    HardwareError, PcrMap, SealingBackend, SoftwareSealingBackend, software_signature,
};
use custode::challenge::delegate::{
    ChallengeAlgorithm, ChallengeError, KeyChallengeRequest, KeyChallengeService, PublicKeyInfo,
};
use custode::error::AuthError;
use custode::factor::dispatch::VerificationDispatch;
use custode::factor::lockout::{LockoutPolicy, NEVER_MS, NO_DELAY};
use custode::factor::rate_limiter::{NoopRateLimiter, RateLimiter};
use custode::factor::store::{FactorStore, InMemoryFactorStore};
use custode::factor::{
    AuthFactor, AuthInput, AuthIntent, AuthIntents, FactorMetadata, FactorRef, FactorType,
};
use custode::session::manager::AuthSessionManager;
use custode::session::token::SessionToken;
use custode::session::{SessionOptions, SessionServices, obfuscate_account_id};
use custode::signal::TracingSignalSink;
use secrecy::SecretString;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const ACCOUNT: &str = "a@ex.com";

struct FixedDelayLimiter {
    delay: u32,
}

impl RateLimiter for FixedDelayLimiter {
    fn is_enabled(&self) -> bool {
        true
    }

    fn delay_seconds(&self, _factor: &FactorRef<'_>) -> u32 {
        self.delay
    }

    fn expiration_seconds(&self, _factor: &FactorRef<'_>) -> Option<u32> {
        None
    }

    fn has_any_credential(&self) -> bool {
        true
    }
}

/// Counts storage reads so tests can prove ephemeral sessions never touch
/// persistent factor storage.
struct CountingStore {
    inner: InMemoryFactorStore,
    loads: AtomicUsize,
}

impl CountingStore {
    fn new() -> Self {
        Self {
            inner: InMemoryFactorStore::new(),
            loads: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl FactorStore for CountingStore {
    async fn load_factors(&self, obfuscated_account_id: &str) -> Result<Vec<AuthFactor>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load_factors(obfuscated_account_id).await
    }

    async fn save_factor(&self, obfuscated_account_id: &str, factor: AuthFactor) -> Result<()> {
        self.inner.save_factor(obfuscated_account_id, factor).await
    }

    async fn remove_factor(&self, obfuscated_account_id: &str, label: &str) -> Result<()> {
        self.inner.remove_factor(obfuscated_account_id, label).await
    }
}

/// Signs every challenge with its own key, like a card that does not know
/// which credential the host expects.
struct SoftwareDelegate {
    key_spki_der: Vec<u8>,
}

#[async_trait]
impl KeyChallengeService for SoftwareDelegate {
    async fn challenge(&self, request: KeyChallengeRequest) -> Result<Vec<u8>, ChallengeError> {
        Ok(software_signature(
            &self.key_spki_der,
            &request.payload,
            request.algorithm,
        ))
    }
}

/// Backend whose lightweight signature check is permanently unavailable,
/// forcing the dispatch fallback onto the full decrypt cycle.
struct NoLightweightBackend {
    inner: SoftwareSealingBackend,
}

#[async_trait]
impl SealingBackend for NoLightweightBackend {
    async fn seal(
        &self,
        secret: &[u8],
        default_pcr_map: &PcrMap,
        extended_pcr_map: &PcrMap,
    ) -> Result<Vec<u8>, HardwareError> {
        self.inner.seal(secret, default_pcr_map, extended_pcr_map).await
    }

    async fn unseal(
        &self,
        blob: &[u8],
        locked_to_single_user: bool,
    ) -> Result<Vec<u8>, HardwareError> {
        self.inner.unseal(blob, locked_to_single_user).await
    }

    async fn verify_challenge_signature(
        &self,
        _public_key: &PublicKeyInfo,
        _payload: &[u8],
        _signature: &[u8],
        _algorithm: ChallengeAlgorithm,
    ) -> Result<bool, HardwareError> {
        Err(HardwareError::Transient(
            "lightweight verification unsupported".to_string(),
        ))
    }
}

fn manager_with(
    store: Arc<dyn FactorStore>,
    rate_limiter: Arc<dyn RateLimiter>,
    backend: Arc<dyn SealingBackend>,
) -> Arc<AuthSessionManager> {
    let helper = Arc::new(ChallengeCredentialsHelper::new(backend));
    let dispatch = Arc::new(VerificationDispatch::new(rate_limiter.clone(), helper));
    AuthSessionManager::new(SessionServices::new(
        store,
        rate_limiter,
        dispatch,
        Arc::new(TracingSignalSink),
    ))
}

async fn manager_with_password(secret: &str) -> Arc<AuthSessionManager> {
    let store = Arc::new(InMemoryFactorStore::new());
    store
        .save_factor(
            &obfuscate_account_id(ACCOUNT),
            AuthFactor::with_secret(
                "pw",
                FactorType::Password,
                &SecretString::from(secret.to_string()),
                LockoutPolicy::None,
            ),
        )
        .await
        .expect("save");
    manager_with(
        store,
        Arc::new(NoopRateLimiter),
        Arc::new(SoftwareSealingBackend::new()),
    )
}

fn secret_input(value: &str) -> AuthInput {
    AuthInput::Secret(SecretString::from(value.to_string()))
}

#[tokio::test]
async fn password_full_auth_then_invalidate() {
    let manager = manager_with_password("secret").await;
    let (token, broadcast) = manager
        .start_session(ACCOUNT, SessionOptions::new(AuthIntent::Decrypt))
        .expect("start");
    assert_ne!(token.to_string(), broadcast.to_string());

    let intents = manager
        .authenticate(&token, &["pw".to_string()], &secret_input("secret"))
        .await
        .expect("authenticate");
    assert_eq!(intents, AuthIntents::full());

    manager.invalidate(&token).await.expect("invalidate");
    let result = manager.run_when_available(&token, |_session| ()).await;
    assert_eq!(result.unwrap_err(), AuthError::SessionNotFound);
}

#[tokio::test]
async fn forged_tokens_never_resolve() {
    let manager = manager_with_password("secret").await;
    let forged = SessionToken::generate().expect("token");
    assert_eq!(
        manager
            .run_when_available(&forged, |_session| ())
            .await
            .unwrap_err(),
        AuthError::SessionNotFound
    );
}

#[tokio::test]
async fn extend_on_unauthenticated_session_fails_and_changes_nothing() {
    let manager = manager_with_password("secret").await;
    let (token, _) = manager
        .start_session(ACCOUNT, SessionOptions::new(AuthIntent::Decrypt))
        .expect("start");

    assert_eq!(
        manager
            .extend(&token, Duration::from_secs(60))
            .await
            .unwrap_err(),
        AuthError::Unauthenticated
    );
    // Still unbounded afterwards.
    assert_eq!(manager.remaining(&token).await.expect("remaining"), None);
}

#[tokio::test]
async fn locked_out_pin_short_circuits_with_correct_secret() {
    let store = Arc::new(InMemoryFactorStore::new());
    store
        .save_factor(
            &obfuscate_account_id(ACCOUNT),
            AuthFactor::with_secret(
                "pin",
                FactorType::Pin,
                &SecretString::from("1234".to_string()),
                LockoutPolicy::AttemptLimited,
            ),
        )
        .await
        .expect("save");
    let manager = manager_with(
        store,
        Arc::new(FixedDelayLimiter { delay: 30 }),
        Arc::new(SoftwareSealingBackend::new()),
    );
    let (token, _) = manager
        .start_session(ACCOUNT, SessionOptions::new(AuthIntent::Decrypt))
        .expect("start");

    // The secret is correct; LockedOut proves the comparison never ran.
    let err = manager
        .authenticate(&token, &["pin".to_string()], &secret_input("1234"))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        AuthError::LockedOut {
            time_available_ms: 30_000
        }
    );
    // Failure leaves the session untouched.
    assert_eq!(manager.remaining(&token).await.expect("remaining"), None);
}

#[tokio::test]
async fn never_locked_pin_reports_sentinel_countdown() {
    let store = Arc::new(InMemoryFactorStore::new());
    store
        .save_factor(
            &obfuscate_account_id(ACCOUNT),
            AuthFactor::with_secret(
                "pin",
                FactorType::Pin,
                &SecretString::from("1234".to_string()),
                LockoutPolicy::AttemptLimited,
            ),
        )
        .await
        .expect("save");
    let manager = manager_with(
        store,
        Arc::new(FixedDelayLimiter { delay: NO_DELAY }),
        Arc::new(SoftwareSealingBackend::new()),
    );
    let (token, _) = manager
        .start_session(ACCOUNT, SessionOptions::new(AuthIntent::Decrypt))
        .expect("start");

    let listed = manager.list_factors(&token).await.expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].lockout_policy, LockoutPolicy::AttemptLimited);
    assert_eq!(listed[0].time_available_ms, NEVER_MS);

    // The sentinel means "no active delay": verification proceeds.
    let intents = manager
        .authenticate(&token, &["pin".to_string()], &secret_input("1234"))
        .await
        .expect("authenticate");
    assert!(intents.contains(AuthIntent::Decrypt));
}

#[tokio::test]
async fn ephemeral_sessions_never_touch_factor_storage() {
    let store = Arc::new(CountingStore::new());
    let manager = manager_with(
        store.clone(),
        Arc::new(NoopRateLimiter),
        Arc::new(SoftwareSealingBackend::new()),
    );
    let (token, _) = manager
        .start_session(
            "guest@ex.com",
            SessionOptions::new(AuthIntent::Decrypt).ephemeral(true),
        )
        .expect("start");

    manager
        .add_credential_verifier(
            &token,
            "guest",
            FactorType::Password,
            &SecretString::from("guest-secret".to_string()),
        )
        .await
        .expect("verifier");
    let intents = manager
        .authenticate(&token, &["guest".to_string()], &secret_input("guest-secret"))
        .await
        .expect("authenticate");
    assert!(intents.contains(AuthIntent::Decrypt));

    manager.list_factors(&token).await.expect("list");
    assert_eq!(store.loads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn account_creation_grant_and_monotonic_growth() {
    let manager = manager_with_password("secret").await;
    let (token, _) = manager
        .start_session(ACCOUNT, SessionOptions::new(AuthIntent::Decrypt))
        .expect("start");

    let granted = manager.on_user_created(&token).await.expect("grant");
    assert!(granted.contains(AuthIntent::Decrypt));
    assert!(granted.contains(AuthIntent::VerifyOnly));
    assert!(!granted.contains(AuthIntent::WebAuthn));
    assert!(manager.remaining(&token).await.expect("remaining").is_some());

    // Re-authentication with a full factor widens the set, never narrows.
    let after = manager
        .authenticate(&token, &["pw".to_string()], &secret_input("secret"))
        .await
        .expect("authenticate");
    assert_eq!(after, AuthIntents::full());
}

#[tokio::test]
async fn smart_card_authenticates_via_lightweight_check() {
    let key_spki_der = vec![4, 7, 11];
    let delegate: Arc<dyn KeyChallengeService> = Arc::new(SoftwareDelegate {
        key_spki_der: key_spki_der.clone(),
    });
    let public_key = PublicKeyInfo::new(
        key_spki_der,
        vec![
            ChallengeAlgorithm::RsassaPkcs1V15Sha1,
            ChallengeAlgorithm::RsassaPkcs1V15Sha256,
        ],
    );

    let backend = Arc::new(SoftwareSealingBackend::new());
    let helper = ChallengeCredentialsHelper::new(backend.clone());
    let (sealed, _passkey) = helper
        .generate_new(
            &obfuscate_account_id(ACCOUNT),
            &public_key,
            &PcrMap::new(),
            &PcrMap::new(),
            delegate.as_ref(),
        )
        .await
        .expect("generate");

    let store = Arc::new(InMemoryFactorStore::new());
    store
        .save_factor(
            &obfuscate_account_id(ACCOUNT),
            AuthFactor {
                label: "card".to_string(),
                kind: FactorType::SmartCard,
                metadata: FactorMetadata::SmartCard {
                    public_key: public_key.clone(),
                    sealed,
                },
                lockout_policy: LockoutPolicy::None,
            },
        )
        .await
        .expect("save");
    let manager = manager_with(store, Arc::new(NoopRateLimiter), backend);
    let (token, _) = manager
        .start_session(ACCOUNT, SessionOptions::new(AuthIntent::Decrypt))
        .expect("start");

    let intents = manager
        .authenticate(
            &token,
            &["card".to_string()],
            &AuthInput::SmartCard {
                delegate: delegate.clone(),
            },
        )
        .await
        .expect("authenticate");
    assert_eq!(intents, AuthIntents::full());

    // A different card signs with the wrong key: verify-grade rejection.
    let wrong_card: Arc<dyn KeyChallengeService> = Arc::new(SoftwareDelegate {
        key_spki_der: vec![9, 9, 9],
    });
    let (second, _) = manager
        .start_session(ACCOUNT, SessionOptions::new(AuthIntent::Decrypt))
        .expect("start");
    let err = manager
        .authenticate(
            &second,
            &["card".to_string()],
            &AuthInput::SmartCard { delegate: wrong_card },
        )
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::WrongSecret);
}

#[tokio::test]
async fn smart_card_falls_back_to_decrypt_when_lightweight_unavailable() {
    let key_spki_der = vec![1, 2, 3];
    let delegate: Arc<dyn KeyChallengeService> = Arc::new(SoftwareDelegate {
        key_spki_der: key_spki_der.clone(),
    });
    let public_key = PublicKeyInfo::new(
        key_spki_der,
        vec![ChallengeAlgorithm::RsassaPkcs1V15Sha512],
    );

    let backend = Arc::new(NoLightweightBackend {
        inner: SoftwareSealingBackend::new(),
    });
    let helper = ChallengeCredentialsHelper::new(backend.clone());
    let (sealed, _passkey) = helper
        .generate_new(
            &obfuscate_account_id(ACCOUNT),
            &public_key,
            &PcrMap::new(),
            &PcrMap::new(),
            delegate.as_ref(),
        )
        .await
        .expect("generate");

    let store = Arc::new(InMemoryFactorStore::new());
    store
        .save_factor(
            &obfuscate_account_id(ACCOUNT),
            AuthFactor {
                label: "card".to_string(),
                kind: FactorType::SmartCard,
                metadata: FactorMetadata::SmartCard {
                    public_key,
                    sealed,
                },
                lockout_policy: LockoutPolicy::None,
            },
        )
        .await
        .expect("save");
    let manager = manager_with(store, Arc::new(NoopRateLimiter), backend);
    let (token, _) = manager
        .start_session(ACCOUNT, SessionOptions::new(AuthIntent::Decrypt))
        .expect("start");

    let intents = manager
        .authenticate(
            &token,
            &["card".to_string()],
            &AuthInput::SmartCard { delegate },
        )
        .await
        .expect("authenticate");
    assert_eq!(intents, AuthIntents::full());
}

#[tokio::test]
async fn account_listing_requires_no_session() {
    let manager = manager_with_password("secret").await;
    let listed = manager
        .list_account_factors(ACCOUNT)
        .await
        .expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].label, "pw");

    assert!(matches!(
        manager.list_account_factors("has space").await,
        Err(AuthError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn factor_management_round_trip_through_manager() {
    let manager = manager_with_password("secret").await;
    let (token, _) = manager
        .start_session(ACCOUNT, SessionOptions::new(AuthIntent::Decrypt))
        .expect("start");
    manager
        .authenticate(&token, &["pw".to_string()], &secret_input("secret"))
        .await
        .expect("authenticate");

    manager
        .add_factor(
            &token,
            AuthFactor::with_secret(
                "pin",
                FactorType::Pin,
                &SecretString::from("2468".to_string()),
                LockoutPolicy::AttemptLimited,
            ),
        )
        .await
        .expect("add");

    let listed = manager.list_factors(&token).await.expect("list");
    let labels: Vec<&str> = listed.iter().map(|factor| factor.label.as_str()).collect();
    assert_eq!(labels, ["pin", "pw"]);

    // The new factor is immediately usable on a fresh session.
    let (fresh, _) = manager
        .start_session(ACCOUNT, SessionOptions::new(AuthIntent::Decrypt))
        .expect("start");
    manager
        .authenticate(&fresh, &["pin".to_string()], &secret_input("2468"))
        .await
        .expect("authenticate");

    manager.remove_factor(&token, "pin").await.expect("remove");
    assert_eq!(
        manager
            .remove_factor(&token, "pw")
            .await
            .unwrap_err(),
        AuthError::InvalidArgument("cannot remove the last configured factor".to_string())
    );
}
