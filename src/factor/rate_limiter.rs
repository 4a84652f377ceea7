//! Hardware rate limiter capability view.
//!
//! The real limiter is the security module's credential-guard feature; the
//! core only reads its counters. Counter reads are cheap register lookups,
//! so the trait stays synchronous.

use crate::factor::FactorRef;

pub trait RateLimiter: Send + Sync {
    /// Whether the hardware limiter is provisioned at all. PIN factors are
    /// unusable without it.
    fn is_enabled(&self) -> bool;

    /// Seconds until the factor accepts attempts again. `u32::MAX` is the
    /// "no active delay" sentinel.
    fn delay_seconds(&self, factor: &FactorRef<'_>) -> u32;

    /// Seconds until the limiter lease for this factor expires, if the
    /// limiter tracks leases.
    fn expiration_seconds(&self, factor: &FactorRef<'_>) -> Option<u32>;

    /// Whether any rate-limited credential exists on the device.
    fn has_any_credential(&self) -> bool;
}

/// Limiter stand-in for devices without the hardware feature.
#[derive(Clone, Copy, Debug)]
pub struct NoopRateLimiter;

impl RateLimiter for NoopRateLimiter {
    fn is_enabled(&self) -> bool {
        false
    }

    fn delay_seconds(&self, _factor: &FactorRef<'_>) -> u32 {
        0
    }

    fn expiration_seconds(&self, _factor: &FactorRef<'_>) -> Option<u32> {
        None
    }

    fn has_any_credential(&self) -> bool {
        false
    }
}
