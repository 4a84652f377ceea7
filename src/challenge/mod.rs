//! Challenge-response credential orchestration.
//!
//! Flow Overview:
//! 1) `GenerateNew` mints a random secret seed, has the delegate sign a
//!    fresh salt, seals the seed in the security module, and derives the
//!    passkey from signature + seed.
//! 2) `Decrypt` reverses that: re-sign the stored salt, unseal the seed,
//!    re-derive the passkey.
//! 3) `VerifyKey` is a cheap usability probe: sign a nonce and check the
//!    signature against the stored public key, without touching the sealed
//!    seed.
//!
//! Security boundaries:
//! - The raw passkey is only ever returned to the caller; it is never
//!   persisted and the sealed blob alone cannot reproduce it.
//! - One operation may be in flight per helper. A newer operation preempts
//!   the outstanding one, which resolves with a cancellation failure
//!   distinguishable from hardware errors. This models the deliberately
//!   small pool of hardware crypto sessions.

pub mod backend;
pub mod delegate;

use self::backend::{HardwareError, PcrMap, SealedSecret, SealingBackend};
use self::delegate::{
    ChallengeAlgorithm, ChallengeError, KeyChallengeRequest, KeyChallengeService, PublicKeyInfo,
};
use crate::error::AuthError;
use anyhow::Context;
use rand::{RngCore, rngs::OsRng};
use secrecy::{ExposeSecret, SecretBox};
use sha2::{Digest, Sha256};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Internal retry budget for transient hardware/delegate failures.
pub const RETRY_ATTEMPTS: u32 = 3;

const SALT_LEN: usize = 32;
const SEED_LEN: usize = 32;

pub(crate) fn random_bytes(len: usize) -> anyhow::Result<Vec<u8>> {
    let mut bytes = vec![0u8; len];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to gather entropy")?;
    Ok(bytes)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    /// A newer operation preempted this one.
    #[error("operation cancelled by a newer request")]
    Cancelled,

    /// Transient failures exhausted the retry budget; the caller may try
    /// again later.
    #[error("transient hardware failure, retry budget exhausted")]
    Transient,

    /// The hardware or delegate rejected the operation; retrying requires
    /// user action.
    #[error("fatal failure: {0}")]
    Fatal(String),

    /// The delegate no longer supports the algorithm the credential was
    /// generated with.
    #[error("algorithm {0:?} is not supported by the delegate")]
    UnsupportedAlgorithm(ChallengeAlgorithm),
}

impl From<CredentialError> for AuthError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Cancelled => Self::Cancelled,
            CredentialError::Transient => Self::HardwareTransient,
            CredentialError::Fatal(_) | CredentialError::UnsupportedAlgorithm(_) => {
                Self::HardwareFatal
            }
        }
    }
}

/// Raw key material recovered from a challenge credential. Never persisted.
pub struct Passkey {
    bytes: SecretBox<[u8; 32]>,
}

impl Passkey {
    fn derive(signature: &[u8], seed: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(signature);
        hasher.update(seed);
        let digest: [u8; 32] = hasher.finalize().into();
        Self {
            bytes: SecretBox::new(Box::new(digest)),
        }
    }

    #[must_use]
    pub fn expose(&self) -> &[u8; 32] {
        self.bytes.expose_secret()
    }
}

impl fmt::Debug for Passkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passkey(<redacted>)")
    }
}

/// Single-flight orchestrator for challenge-response credentials.
pub struct ChallengeCredentialsHelper {
    backend: Arc<dyn SealingBackend>,
    // Generation counter doubling as the preemption broadcast. A completion
    // is honored only while its generation is still current.
    preemption: watch::Sender<u64>,
}

impl ChallengeCredentialsHelper {
    #[must_use]
    pub fn new(backend: Arc<dyn SealingBackend>) -> Self {
        let (preemption, _) = watch::channel(0);
        Self {
            backend,
            preemption,
        }
    }

    /// Create a fresh challenge credential.
    ///
    /// Returns the sealed representation (to be persisted by the caller)
    /// and the raw passkey (to be used immediately).
    ///
    /// # Errors
    /// `Cancelled` on preemption, `Transient`/`Fatal` per the hardware and
    /// delegate outcome classes.
    pub async fn generate_new(
        &self,
        account_id: &str,
        public_key: &PublicKeyInfo,
        default_pcr_map: &PcrMap,
        extended_pcr_map: &PcrMap,
        delegate: &dyn KeyChallengeService,
    ) -> Result<(SealedSecret, Passkey), CredentialError> {
        self.single_flight(self.generate_new_inner(
            account_id,
            public_key,
            default_pcr_map,
            extended_pcr_map,
            delegate,
        ))
        .await
    }

    /// Recover the passkey of an existing challenge credential.
    ///
    /// # Errors
    /// `UnsupportedAlgorithm` when the delegate dropped the salt algorithm
    /// chosen at generation time; otherwise as [`Self::generate_new`].
    pub async fn decrypt(
        &self,
        account_id: &str,
        public_key: &PublicKeyInfo,
        sealed: &SealedSecret,
        locked_to_single_user: bool,
        delegate: &dyn KeyChallengeService,
    ) -> Result<Passkey, CredentialError> {
        self.single_flight(self.decrypt_inner(
            account_id,
            public_key,
            sealed,
            locked_to_single_user,
            delegate,
        ))
        .await
    }

    /// Cheap check that the key is present and usable, without
    /// reconstructing the passkey. Intended as a pre-filter before a full
    /// [`Self::decrypt`].
    ///
    /// # Errors
    /// As [`Self::generate_new`].
    pub async fn verify_key(
        &self,
        account_id: &str,
        public_key: &PublicKeyInfo,
        delegate: &dyn KeyChallengeService,
    ) -> Result<bool, CredentialError> {
        self.single_flight(self.verify_key_inner(account_id, public_key, delegate))
            .await
    }

    async fn generate_new_inner(
        &self,
        account_id: &str,
        public_key: &PublicKeyInfo,
        default_pcr_map: &PcrMap,
        extended_pcr_map: &PcrMap,
        delegate: &dyn KeyChallengeService,
    ) -> Result<(SealedSecret, Passkey), CredentialError> {
        let algorithm = public_key
            .strongest_algorithm()
            .ok_or_else(|| CredentialError::Fatal("key supports no known algorithm".to_string()))?;
        let salt = random_bytes(SALT_LEN)
            .map_err(|err| CredentialError::Fatal(format!("entropy source failed: {err}")))?;
        let signature = self
            .challenge_with_retry(delegate, account_id, public_key, salt.clone(), algorithm)
            .await?;

        let seed = random_bytes(SEED_LEN)
            .map_err(|err| CredentialError::Fatal(format!("entropy source failed: {err}")))?;
        let blob =
            hardware_with_retry(|| self.backend.seal(&seed, default_pcr_map, extended_pcr_map))
                .await?;

        debug!(algorithm = algorithm.as_str(), "generated challenge credential");
        let passkey = Passkey::derive(&signature, &seed);
        Ok((
            SealedSecret {
                salt,
                salt_algorithm: algorithm,
                blob,
            },
            passkey,
        ))
    }

    async fn decrypt_inner(
        &self,
        account_id: &str,
        public_key: &PublicKeyInfo,
        sealed: &SealedSecret,
        locked_to_single_user: bool,
        delegate: &dyn KeyChallengeService,
    ) -> Result<Passkey, CredentialError> {
        if !public_key.algorithms.contains(&sealed.salt_algorithm) {
            return Err(CredentialError::UnsupportedAlgorithm(sealed.salt_algorithm));
        }
        let signature = self
            .challenge_with_retry(
                delegate,
                account_id,
                public_key,
                sealed.salt.clone(),
                sealed.salt_algorithm,
            )
            .await?;
        let seed =
            hardware_with_retry(|| self.backend.unseal(&sealed.blob, locked_to_single_user))
                .await?;
        Ok(Passkey::derive(&signature, &seed))
    }

    async fn verify_key_inner(
        &self,
        account_id: &str,
        public_key: &PublicKeyInfo,
        delegate: &dyn KeyChallengeService,
    ) -> Result<bool, CredentialError> {
        let algorithm = public_key
            .strongest_algorithm()
            .ok_or_else(|| CredentialError::Fatal("key supports no known algorithm".to_string()))?;
        let nonce = random_bytes(SALT_LEN)
            .map_err(|err| CredentialError::Fatal(format!("entropy source failed: {err}")))?;
        let signature = self
            .challenge_with_retry(delegate, account_id, public_key, nonce.clone(), algorithm)
            .await?;
        hardware_with_retry(|| {
            self.backend
                .verify_challenge_signature(public_key, &nonce, &signature, algorithm)
        })
        .await
    }

    async fn challenge_with_retry(
        &self,
        delegate: &dyn KeyChallengeService,
        account_id: &str,
        public_key: &PublicKeyInfo,
        payload: Vec<u8>,
        algorithm: ChallengeAlgorithm,
    ) -> Result<Vec<u8>, CredentialError> {
        for attempt in 1..=RETRY_ATTEMPTS {
            let request = KeyChallengeRequest {
                account_id: account_id.to_string(),
                key_spki_der: public_key.key_spki_der.clone(),
                payload: payload.clone(),
                algorithm,
            };
            match delegate.challenge(request).await {
                Ok(signature) => return Ok(signature),
                Err(ChallengeError::Unavailable(reason)) => {
                    warn!(attempt, "signing delegate unavailable: {reason}");
                }
                Err(ChallengeError::Refused(reason)) => {
                    return Err(CredentialError::Fatal(reason));
                }
            }
        }
        Err(CredentialError::Transient)
    }

    /// Run `work` under the single-flight regime: bump the generation
    /// (cancelling any outstanding operation) and resolve with `Cancelled`
    /// if a later operation bumps it again first.
    async fn single_flight<T>(
        &self,
        work: impl Future<Output = Result<T, CredentialError>>,
    ) -> Result<T, CredentialError> {
        let (generation, receiver) = self.preempt();
        tokio::select! {
            biased;
            () = Self::preempted(generation, receiver) => Err(CredentialError::Cancelled),
            result = work => result,
        }
    }

    fn preempt(&self) -> (u64, watch::Receiver<u64>) {
        let mut generation = 0;
        // send_modify runs under the channel lock, so increment-and-read is
        // atomic even with concurrent starters.
        self.preemption.send_modify(|current| {
            *current += 1;
            generation = *current;
        });
        (generation, self.preemption.subscribe())
    }

    async fn preempted(generation: u64, mut receiver: watch::Receiver<u64>) {
        loop {
            if *receiver.borrow_and_update() > generation {
                return;
            }
            if receiver.changed().await.is_err() {
                // The sender lives as long as the helper; a closed channel
                // means the helper is gone and nothing can preempt us.
                std::future::pending::<()>().await;
            }
        }
    }
}

async fn hardware_with_retry<T, F, Fut>(mut op: F) -> Result<T, CredentialError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, HardwareError>>,
{
    for attempt in 1..=RETRY_ATTEMPTS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(HardwareError::Transient(reason)) => {
                warn!(attempt, "security module busy: {reason}");
            }
            Err(HardwareError::Fatal(reason)) => return Err(CredentialError::Fatal(reason)),
        }
    }
    Err(CredentialError::Transient)
}
