//! Biometrics service collaborator.
//!
//! Fingerprint templates and matching live in a dedicated service next to
//! the sensor; the core only forwards samples and consumes match results.

use crate::challenge::backend::HardwareError;
use async_trait::async_trait;

#[async_trait]
pub trait BiometricsService: Send + Sync {
    /// Match a raw sample against the account's enrolled templates.
    async fn match_sample(
        &self,
        obfuscated_account_id: &str,
        sample: &[u8],
    ) -> Result<bool, HardwareError>;
}
