//! In-memory credential verifier.
//!
//! A verifier holds the digest of one knowledge secret for the lifetime of
//! a session. Ephemeral sessions have no persistent storage and are
//! satisfied only by verifiers; persistent sessions may install one as a
//! lightweight shadow of a configured factor for verify-only checks.

use crate::error::AuthError;
use crate::factor::{AuthInput, FactorType, SecretDigest};
use secrecy::SecretString;

#[derive(Clone, Debug)]
pub struct CredentialVerifier {
    label: String,
    kind: FactorType,
    digest: SecretDigest,
}

impl CredentialVerifier {
    /// Build a verifier for a knowledge factor.
    ///
    /// # Errors
    /// `InvalidArgument` for factor types whose secret is not a
    /// caller-supplied knowledge secret.
    pub fn new(
        label: impl Into<String>,
        kind: FactorType,
        secret: &SecretString,
    ) -> Result<Self, AuthError> {
        if !kind.is_knowledge_factor() {
            return Err(AuthError::InvalidArgument(format!(
                "factor type {} cannot back an in-memory verifier",
                kind.as_str()
            )));
        }
        Ok(Self {
            label: label.into(),
            kind,
            digest: SecretDigest::of_secret(secret),
        })
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn kind(&self) -> FactorType {
        self.kind
    }

    /// Compare the input against the held digest.
    ///
    /// # Errors
    /// `WrongSecret` on mismatch; `InvalidArgument` when the input shape
    /// does not fit a knowledge factor.
    pub fn verify(&self, input: &AuthInput) -> Result<(), AuthError> {
        let AuthInput::Secret(secret) = input else {
            return Err(AuthError::InvalidArgument(
                "verifier-backed factors take a knowledge secret".to_string(),
            ));
        };
        if SecretDigest::of_secret(secret) == self.digest {
            Ok(())
        } else {
            Err(AuthError::WrongSecret)
        }
    }
}
