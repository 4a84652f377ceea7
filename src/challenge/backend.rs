//! Sealing backend contract for the device security module.
//!
//! The backend performs the actual cryptographic sealing/unsealing; custode
//! only consumes pass/fail/retry-class results. Errors are split into
//! transient failures (communication errors, busy crypto sessions) that are
//! worth an internal retry, and fatal ones (vulnerable or mis-provisioned
//! hardware) that surface immediately.

use crate::challenge::delegate::{ChallengeAlgorithm, PublicKeyInfo};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tokio::sync::Mutex;

/// Platform configuration register values a sealed secret is bound to.
pub type PcrMap = BTreeMap<u32, Vec<u8>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HardwareError {
    /// Communication failure or busy crypto session; retrying may succeed.
    #[error("hardware communication failure: {0}")]
    Transient(String),

    /// The hardware rejected the operation; retrying requires user action
    /// such as a firmware update.
    #[error("hardware failure: {0}")]
    Fatal(String),
}

/// Persisted representation of a challenge-protected secret.
///
/// The caller stores this next to the factor metadata; the raw passkey is
/// never persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedSecret {
    /// Salt whose delegate signature feeds the passkey derivation.
    pub salt: Vec<u8>,
    /// Algorithm the salt was signed with at generation time. Decryption
    /// requires the delegate to still support it.
    pub salt_algorithm: ChallengeAlgorithm,
    /// Opaque hardware-sealed blob holding the secret seed.
    pub blob: Vec<u8>,
}

#[async_trait]
pub trait SealingBackend: Send + Sync {
    /// Seal `secret` so that unsealing succeeds while *either* PCR map is
    /// satisfied. The either/or binding tolerates a firmware transition
    /// window without re-provisioning the credential.
    async fn seal(
        &self,
        secret: &[u8],
        default_pcr_map: &PcrMap,
        extended_pcr_map: &PcrMap,
    ) -> Result<Vec<u8>, HardwareError>;

    /// Reverse [`SealingBackend::seal`].
    async fn unseal(&self, blob: &[u8], locked_to_single_user: bool)
    -> Result<Vec<u8>, HardwareError>;

    /// Check a delegate signature against the credential's public key.
    async fn verify_challenge_signature(
        &self,
        public_key: &PublicKeyInfo,
        payload: &[u8],
        signature: &[u8],
        algorithm: ChallengeAlgorithm,
    ) -> Result<bool, HardwareError>;
}

/// Digest-based stand-in for a delegate signature, used by the software
/// backend and by test delegates. Real hardware verifies real RSA
/// signatures instead.
#[must_use]
pub fn software_signature(
    key_spki_der: &[u8],
    payload: &[u8],
    algorithm: ChallengeAlgorithm,
) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(key_spki_der);
    hasher.update(payload);
    hasher.update(algorithm.as_str().as_bytes());
    hasher.finalize().to_vec()
}

/// In-memory sealing backend for development hosts without a security
/// module.
///
/// Provides no hardware binding: blobs are random handles into process
/// memory and PCR maps are recorded but not enforced. Do not use where a
/// real security module is available.
pub struct SoftwareSealingBackend {
    sealed: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl SoftwareSealingBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sealed: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for SoftwareSealingBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SealingBackend for SoftwareSealingBackend {
    async fn seal(
        &self,
        secret: &[u8],
        _default_pcr_map: &PcrMap,
        _extended_pcr_map: &PcrMap,
    ) -> Result<Vec<u8>, HardwareError> {
        let handle = super::random_bytes(32)
            .map_err(|err| HardwareError::Fatal(format!("entropy source failed: {err}")))?;
        let mut sealed = self.sealed.lock().await;
        sealed.insert(handle.clone(), secret.to_vec());
        Ok(handle)
    }

    async fn unseal(
        &self,
        blob: &[u8],
        _locked_to_single_user: bool,
    ) -> Result<Vec<u8>, HardwareError> {
        let sealed = self.sealed.lock().await;
        sealed
            .get(blob)
            .cloned()
            .ok_or_else(|| HardwareError::Fatal("unknown sealed blob".to_string()))
    }

    async fn verify_challenge_signature(
        &self,
        public_key: &PublicKeyInfo,
        payload: &[u8],
        signature: &[u8],
        algorithm: ChallengeAlgorithm,
    ) -> Result<bool, HardwareError> {
        let expected = software_signature(&public_key.key_spki_der, payload, algorithm);
        Ok(signature == expected.as_slice())
    }
}
