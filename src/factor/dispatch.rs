//! Verification strategy dispatch.
//!
//! One exhaustive match converts `(factor, input)` into a verdict without
//! the caller knowing storage or hardware details. Adding a factor type
//! fails compilation here instead of silently missing a branch.
//!
//! Security boundaries:
//! - Rate-limited factors consult the limiter *before* any secret
//!   comparison; an active delay short-circuits to `LockedOut` so a locked
//!   factor never burns another attempt.
//! - Fatal and transient hardware classes pass through unchanged; callers
//!   rely on the distinction to decide whether to re-prompt.

use crate::challenge::ChallengeCredentialsHelper;
use crate::challenge::backend::HardwareError;
use crate::error::AuthError;
use crate::factor::biometrics::BiometricsService;
use crate::factor::lockout::{self, LockoutPolicy};
use crate::factor::rate_limiter::RateLimiter;
use crate::factor::{AuthFactor, AuthInput, AuthIntents, FactorMetadata, FactorRef, FactorType, SecretDigest};
use std::sync::Arc;
use tracing::debug;

pub struct VerificationDispatch {
    rate_limiter: Arc<dyn RateLimiter>,
    challenge_helper: Arc<ChallengeCredentialsHelper>,
    biometrics: Option<Arc<dyn BiometricsService>>,
}

impl VerificationDispatch {
    #[must_use]
    pub fn new(
        rate_limiter: Arc<dyn RateLimiter>,
        challenge_helper: Arc<ChallengeCredentialsHelper>,
    ) -> Self {
        Self {
            rate_limiter,
            challenge_helper,
            biometrics: None,
        }
    }

    #[must_use]
    pub fn with_biometrics(mut self, biometrics: Arc<dyn BiometricsService>) -> Self {
        self.biometrics = Some(biometrics);
        self
    }

    #[must_use]
    pub fn has_biometrics(&self) -> bool {
        self.biometrics.is_some()
    }

    /// Verify `input` against one configured factor.
    ///
    /// # Errors
    /// `LockedOut` before verification for rate-limited factors with an
    /// active delay; otherwise the strategy's own failure taxonomy
    /// (`WrongSecret`, `NoSuchFactor` at the resolution layer,
    /// `HardwareTransient`, `HardwareFatal`, `InvalidArgument`).
    pub async fn verify(
        &self,
        obfuscated_account_id: &str,
        factor: &AuthFactor,
        input: &AuthInput,
    ) -> Result<AuthIntents, AuthError> {
        if factor.lockout_policy != LockoutPolicy::None && self.rate_limiter.is_enabled() {
            let factor_ref = FactorRef {
                obfuscated_account_id,
                label: &factor.label,
            };
            let delay = self.rate_limiter.delay_seconds(&factor_ref);
            if lockout::is_delay_active(delay) {
                let status = lockout::evaluate(
                    factor.lockout_policy,
                    delay,
                    self.rate_limiter.expiration_seconds(&factor_ref),
                );
                debug!(
                    label = %factor.label,
                    policy = factor.lockout_policy.as_str(),
                    "factor locked out, skipping verification"
                );
                return Err(AuthError::LockedOut {
                    time_available_ms: status.time_available_ms,
                });
            }
        }

        match factor.kind {
            FactorType::Password | FactorType::Pin | FactorType::Recovery => {
                self.verify_secret(factor, input)
            }
            FactorType::Kiosk => Self::verify_kiosk(obfuscated_account_id, factor, input),
            FactorType::SmartCard => {
                self.verify_smart_card(obfuscated_account_id, factor, input)
                    .await
            }
            FactorType::Fingerprint | FactorType::LegacyFingerprint => {
                self.verify_fingerprint(obfuscated_account_id, factor, input)
                    .await
            }
        }
    }

    fn verify_secret(
        &self,
        factor: &AuthFactor,
        input: &AuthInput,
    ) -> Result<AuthIntents, AuthError> {
        let FactorMetadata::Secret { digest } = &factor.metadata else {
            return Err(metadata_mismatch(factor));
        };
        let AuthInput::Secret(secret) = input else {
            return Err(AuthError::InvalidArgument(format!(
                "factor {:?} takes a knowledge secret",
                factor.label
            )));
        };
        if SecretDigest::of_secret(secret) == *digest {
            Ok(factor.kind.authorized_intents())
        } else {
            Err(AuthError::WrongSecret)
        }
    }

    fn verify_kiosk(
        obfuscated_account_id: &str,
        factor: &AuthFactor,
        input: &AuthInput,
    ) -> Result<AuthIntents, AuthError> {
        let FactorMetadata::Kiosk = &factor.metadata else {
            return Err(metadata_mismatch(factor));
        };
        // The kiosk secret is derived from the (public) account identity;
        // presenting the identity is the authentication.
        let derived = SecretDigest::of_bytes(obfuscated_account_id.as_bytes());
        match input {
            AuthInput::Kiosk => Ok(factor.kind.authorized_intents()),
            AuthInput::Secret(secret) => {
                if SecretDigest::of_secret(secret) == derived {
                    Ok(factor.kind.authorized_intents())
                } else {
                    Err(AuthError::WrongSecret)
                }
            }
            _ => Err(AuthError::InvalidArgument(format!(
                "factor {:?} takes a kiosk input",
                factor.label
            ))),
        }
    }

    async fn verify_smart_card(
        &self,
        obfuscated_account_id: &str,
        factor: &AuthFactor,
        input: &AuthInput,
    ) -> Result<AuthIntents, AuthError> {
        let FactorMetadata::SmartCard { public_key, sealed } = &factor.metadata else {
            return Err(metadata_mismatch(factor));
        };
        let AuthInput::SmartCard { delegate } = input else {
            return Err(AuthError::InvalidArgument(format!(
                "factor {:?} takes a challenge-response delegate",
                factor.label
            )));
        };

        // Lightweight check first; it is cheaper but not always available.
        match self
            .challenge_helper
            .verify_key(obfuscated_account_id, public_key, delegate.as_ref())
            .await
        {
            Ok(true) => return Ok(factor.kind.authorized_intents()),
            Ok(false) => return Err(AuthError::WrongSecret),
            Err(err) => {
                debug!(
                    label = %factor.label,
                    "lightweight key verification unavailable, falling back to decrypt: {err}"
                );
            }
        }

        // Single-user lock state belongs to the mount lifecycle, not here.
        self.challenge_helper
            .decrypt(
                obfuscated_account_id,
                public_key,
                sealed,
                false,
                delegate.as_ref(),
            )
            .await
            .map(|_passkey| factor.kind.authorized_intents())
            .map_err(AuthError::from)
    }

    async fn verify_fingerprint(
        &self,
        obfuscated_account_id: &str,
        factor: &AuthFactor,
        input: &AuthInput,
    ) -> Result<AuthIntents, AuthError> {
        let FactorMetadata::Fingerprint = &factor.metadata else {
            return Err(metadata_mismatch(factor));
        };
        let AuthInput::Fingerprint { sample } = input else {
            return Err(AuthError::InvalidArgument(format!(
                "factor {:?} takes a fingerprint sample",
                factor.label
            )));
        };
        let Some(biometrics) = &self.biometrics else {
            return Err(AuthError::HardwareFatal);
        };
        match biometrics
            .match_sample(obfuscated_account_id, sample)
            .await
        {
            Ok(true) => Ok(factor.kind.authorized_intents()),
            Ok(false) => Err(AuthError::WrongSecret),
            Err(HardwareError::Transient(_)) => Err(AuthError::HardwareTransient),
            Err(HardwareError::Fatal(_)) => Err(AuthError::HardwareFatal),
        }
    }
}

fn metadata_mismatch(factor: &AuthFactor) -> AuthError {
    AuthError::Internal(format!(
        "factor {:?} has metadata inconsistent with type {}",
        factor.label,
        factor.kind.as_str()
    ))
}
