//! Auth factors: the typed credentials configured for an account, the
//! intents they can authorize, and the inputs callers present.

pub mod biometrics;
pub mod dispatch;
pub mod lockout;
pub mod rate_limiter;
pub mod store;
pub mod verifier;

use self::lockout::LockoutPolicy;
use self::rate_limiter::RateLimiter;
use crate::challenge::backend::SealedSecret;
use crate::challenge::delegate::{KeyChallengeService, PublicKeyInfo};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use utoipa::ToSchema;

/// Declared purpose of a session. Gates which factors are usable and what a
/// successful authentication allows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuthIntent {
    /// Unlock the account's protected storage.
    Decrypt,
    /// Prove the secret is correct without unlocking anything.
    VerifyOnly,
    /// Gate platform WebAuthn assertions.
    WebAuthn,
}

impl AuthIntent {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Decrypt => "decrypt",
            Self::VerifyOnly => "verify_only",
            Self::WebAuthn => "web_authn",
        }
    }

    const ALL: [Self; 3] = [Self::Decrypt, Self::VerifyOnly, Self::WebAuthn];
}

/// Set of authorized intents. Grows monotonically over a session's life and
/// is reset only by session destruction.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthIntents(u8);

impl AuthIntents {
    pub const EMPTY: Self = Self(0);

    #[must_use]
    pub fn single(intent: AuthIntent) -> Self {
        Self(Self::bit(intent))
    }

    #[must_use]
    pub fn full() -> Self {
        Self::EMPTY
            .with(AuthIntent::Decrypt)
            .with(AuthIntent::VerifyOnly)
            .with(AuthIntent::WebAuthn)
    }

    #[must_use]
    pub fn with(self, intent: AuthIntent) -> Self {
        Self(self.0 | Self::bit(intent))
    }

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub fn contains(self, intent: AuthIntent) -> bool {
        self.0 & Self::bit(intent) != 0
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Stable enumeration for display and wire encoding.
    #[must_use]
    pub fn to_vec(self) -> Vec<AuthIntent> {
        AuthIntent::ALL
            .into_iter()
            .filter(|intent| self.contains(*intent))
            .collect()
    }

    fn bit(intent: AuthIntent) -> u8 {
        match intent {
            AuthIntent::Decrypt => 0b001,
            AuthIntent::VerifyOnly => 0b010,
            AuthIntent::WebAuthn => 0b100,
        }
    }
}

impl fmt::Debug for AuthIntents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.to_vec().iter().map(|intent| intent.as_str()))
            .finish()
    }
}

/// Closed set of factor types. Each maps to exactly one verification
/// strategy; adding a type is a compile-time exhaustiveness failure at the
/// dispatch point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FactorType {
    Password,
    Pin,
    SmartCard,
    Fingerprint,
    Kiosk,
    Recovery,
    LegacyFingerprint,
}

impl FactorType {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::Pin => "pin",
            Self::SmartCard => "smart_card",
            Self::Fingerprint => "fingerprint",
            Self::Kiosk => "kiosk",
            Self::Recovery => "recovery",
            Self::LegacyFingerprint => "legacy_fingerprint",
        }
    }

    /// Intents a successful verification of this factor type authorizes.
    ///
    /// Full-auth capable types grant everything; biometric types are
    /// verify-grade and never authorize `Decrypt`.
    #[must_use]
    pub fn authorized_intents(self) -> AuthIntents {
        match self {
            Self::Password | Self::Pin | Self::SmartCard => AuthIntents::full(),
            Self::Kiosk | Self::Recovery => AuthIntents::single(AuthIntent::Decrypt)
                .with(AuthIntent::VerifyOnly),
            Self::Fingerprint => {
                AuthIntents::single(AuthIntent::VerifyOnly).with(AuthIntent::WebAuthn)
            }
            Self::LegacyFingerprint => AuthIntents::single(AuthIntent::VerifyOnly),
        }
    }

    /// Whether the factor's secret is a caller-supplied knowledge secret,
    /// which is what in-memory credential verifiers can hold.
    #[must_use]
    pub fn is_knowledge_factor(self) -> bool {
        matches!(self, Self::Password | Self::Pin | Self::Recovery)
    }
}

/// SHA-256 digest of a factor secret. Raw secrets never reach factor
/// storage or the session registry; only digests are stored and compared.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretDigest([u8; 32]);

impl SecretDigest {
    #[must_use]
    pub fn of_secret(secret: &SecretString) -> Self {
        Self::of_bytes(secret.expose_secret().as_bytes())
    }

    #[must_use]
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }
}

impl fmt::Debug for SecretDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretDigest(<redacted>)")
    }
}

/// Type-specific persisted factor metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum FactorMetadata {
    /// Knowledge factors (password, PIN, recovery code).
    Secret { digest: SecretDigest },
    /// Challenge-response smart card.
    SmartCard {
        public_key: PublicKeyInfo,
        sealed: SealedSecret,
    },
    /// Template lives in the biometrics service, not here.
    Fingerprint,
    /// Derived from the account identity; no stored secret.
    Kiosk,
}

/// A configured credential for an account.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthFactor {
    /// Unique per account; the stable identifier callers target.
    pub label: String,
    pub kind: FactorType,
    pub metadata: FactorMetadata,
    pub lockout_policy: LockoutPolicy,
}

impl AuthFactor {
    /// Knowledge-factor constructor; hashes the secret on the way in.
    #[must_use]
    pub fn with_secret(
        label: impl Into<String>,
        kind: FactorType,
        secret: &SecretString,
        lockout_policy: LockoutPolicy,
    ) -> Self {
        Self {
            label: label.into(),
            kind,
            metadata: FactorMetadata::Secret {
                digest: SecretDigest::of_secret(secret),
            },
            lockout_policy,
        }
    }
}

/// User-supplied input for one authentication attempt.
pub enum AuthInput {
    /// Knowledge secret (password, PIN, recovery code).
    Secret(SecretString),
    /// Challenge-response attempt; the delegate proves key possession.
    SmartCard {
        delegate: Arc<dyn KeyChallengeService>,
    },
    /// Raw sample forwarded to the biometrics service.
    Fingerprint { sample: Vec<u8> },
    /// Kiosk entry; the secret is derived from the account identity.
    Kiosk,
}

impl fmt::Debug for AuthInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Secret(_) => "Secret(<redacted>)",
            Self::SmartCard { .. } => "SmartCard",
            Self::Fingerprint { .. } => "Fingerprint(<sample>)",
            Self::Kiosk => "Kiosk",
        };
        f.write_str(label)
    }
}

/// Identifies a factor towards the hardware rate limiter.
#[derive(Clone, Copy, Debug)]
pub struct FactorRef<'a> {
    pub obfuscated_account_id: &'a str,
    pub label: &'a str,
}

/// Factor types usable with the currently wired collaborators.
#[must_use]
pub fn supported_factor_types(
    rate_limiter: &dyn RateLimiter,
    has_challenge_delegate: bool,
    has_biometrics: bool,
) -> Vec<FactorType> {
    let mut types = vec![FactorType::Password, FactorType::Kiosk, FactorType::Recovery];
    if rate_limiter.is_enabled() {
        types.push(FactorType::Pin);
    }
    if has_challenge_delegate {
        types.push(FactorType::SmartCard);
    }
    if has_biometrics {
        types.push(FactorType::Fingerprint);
        types.push(FactorType::LegacyFingerprint);
    }
    types.sort();
    types
}

#[cfg(test)]
mod tests {
    use super::rate_limiter::NoopRateLimiter;
    use super::*;

    #[test]
    fn intents_union_is_monotonic() {
        let verify = AuthIntents::single(AuthIntent::VerifyOnly);
        let all = verify.union(AuthIntents::full());
        assert!(all.contains(AuthIntent::Decrypt));
        assert!(all.contains(AuthIntent::VerifyOnly));
        assert!(all.contains(AuthIntent::WebAuthn));
        // Union never removes an intent.
        assert_eq!(all.union(verify), all);
    }

    #[test]
    fn empty_intents() {
        assert!(AuthIntents::EMPTY.is_empty());
        assert!(!AuthIntents::full().is_empty());
        assert_eq!(AuthIntents::EMPTY.to_vec(), Vec::<AuthIntent>::new());
    }

    #[test]
    fn password_is_full_auth_capable() {
        let intents = FactorType::Password.authorized_intents();
        assert!(intents.contains(AuthIntent::Decrypt));
        assert!(intents.contains(AuthIntent::VerifyOnly));
        assert!(intents.contains(AuthIntent::WebAuthn));
    }

    #[test]
    fn legacy_fingerprint_is_verify_only() {
        let intents = FactorType::LegacyFingerprint.authorized_intents();
        assert!(!intents.contains(AuthIntent::Decrypt));
        assert!(intents.contains(AuthIntent::VerifyOnly));
        assert!(!intents.contains(AuthIntent::WebAuthn));
    }

    #[test]
    fn secret_digest_is_stable_and_distinct() {
        let first = SecretDigest::of_bytes(b"secret");
        let second = SecretDigest::of_bytes(b"secret");
        let other = SecretDigest::of_bytes(b"other");
        assert_eq!(first, second);
        assert_ne!(first, other);
    }

    #[test]
    fn auth_input_debug_never_leaks() {
        let input = AuthInput::Secret(SecretString::from("hunter2".to_string()));
        assert_eq!(format!("{input:?}"), "Secret(<redacted>)");
    }

    #[test]
    fn supported_types_without_hardware() {
        let types = supported_factor_types(&NoopRateLimiter, false, false);
        assert!(types.contains(&FactorType::Password));
        assert!(types.contains(&FactorType::Kiosk));
        assert!(types.contains(&FactorType::Recovery));
        assert!(!types.contains(&FactorType::Pin));
        assert!(!types.contains(&FactorType::SmartCard));
        assert!(!types.contains(&FactorType::Fingerprint));
    }
}
