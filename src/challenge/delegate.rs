//! Signing delegate contract for challenge-response credentials.
//!
//! The delegate is an external component (typically a smart-card middleware
//! in the user's session) that proves possession of the private key by
//! signing payloads we choose. Custode only supplies and consumes the
//! handle; the delegate's wire transport is owned by the embedder.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Signature algorithms a challenge key may support.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeAlgorithm {
    RsassaPkcs1V15Sha1,
    RsassaPkcs1V15Sha256,
    RsassaPkcs1V15Sha384,
    RsassaPkcs1V15Sha512,
}

impl ChallengeAlgorithm {
    /// Strongest digest first. Used when picking the salt algorithm for a
    /// freshly generated credential.
    pub const PREFERENCE: [Self; 4] = [
        Self::RsassaPkcs1V15Sha512,
        Self::RsassaPkcs1V15Sha384,
        Self::RsassaPkcs1V15Sha256,
        Self::RsassaPkcs1V15Sha1,
    ];

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::RsassaPkcs1V15Sha1 => "rsassa_pkcs1_v1_5_sha1",
            Self::RsassaPkcs1V15Sha256 => "rsassa_pkcs1_v1_5_sha256",
            Self::RsassaPkcs1V15Sha384 => "rsassa_pkcs1_v1_5_sha384",
            Self::RsassaPkcs1V15Sha512 => "rsassa_pkcs1_v1_5_sha512",
        }
    }
}

/// Public half of a challenge-response credential.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyInfo {
    /// SubjectPublicKeyInfo, DER encoded.
    pub key_spki_der: Vec<u8>,
    /// Algorithms the key holder can sign with, in no particular order.
    pub algorithms: Vec<ChallengeAlgorithm>,
}

impl PublicKeyInfo {
    #[must_use]
    pub fn new(key_spki_der: Vec<u8>, algorithms: Vec<ChallengeAlgorithm>) -> Self {
        Self {
            key_spki_der,
            algorithms,
        }
    }

    /// Pick the strongest algorithm this key supports.
    #[must_use]
    pub fn strongest_algorithm(&self) -> Option<ChallengeAlgorithm> {
        ChallengeAlgorithm::PREFERENCE
            .into_iter()
            .find(|candidate| self.algorithms.contains(candidate))
    }
}

/// One signature request round-tripped through the delegate.
#[derive(Clone, Debug)]
pub struct KeyChallengeRequest {
    /// Obfuscated account the credential belongs to. The delegate never
    /// sees the raw account identifier.
    pub account_id: String,
    pub key_spki_der: Vec<u8>,
    pub payload: Vec<u8>,
    pub algorithm: ChallengeAlgorithm,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChallengeError {
    /// The delegate could not be reached or was busy; the request may be
    /// retried.
    #[error("signing delegate unavailable: {0}")]
    Unavailable(String),

    /// The delegate rejected the request outright (unknown key, user
    /// declined, unsupported algorithm). Retrying cannot help.
    #[error("signing delegate refused the challenge: {0}")]
    Refused(String),
}

/// RPC-shaped signing delegate.
#[async_trait]
pub trait KeyChallengeService: Send + Sync {
    /// Sign `request.payload` with the key identified by
    /// `request.key_spki_der` using `request.algorithm`.
    async fn challenge(&self, request: KeyChallengeRequest) -> Result<Vec<u8>, ChallengeError>;
}
