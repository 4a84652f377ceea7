//! Session tokens.
//!
//! The primary token is the only handle that can mutate a session; the
//! broadcast token is a second unguessable identifier safe to hand to
//! lower-trust observers such as UI surfaces. Raw primary tokens are only
//! returned to the caller; they never appear in logs.

use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::{RngCore, rngs::OsRng};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

const TOKEN_LEN: usize = 16;

/// Opaque 128-bit session handle. Never reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionToken([u8; TOKEN_LEN]);

impl SessionToken {
    /// Draw a fresh token from the OS entropy source.
    ///
    /// # Errors
    /// Fails when the entropy source does.
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; TOKEN_LEN];
        OsRng
            .try_fill_bytes(&mut bytes)
            .context("failed to generate session token")?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&URL_SAFE_NO_PAD.encode(self.0))
    }
}

// Tokens are credentials; Debug output stays redacted so they cannot leak
// through logs.
impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(<redacted>)")
    }
}

impl FromStr for SessionToken {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let decoded = URL_SAFE_NO_PAD
            .decode(value.trim().as_bytes())
            .context("invalid session token encoding")?;
        let bytes: [u8; TOKEN_LEN] = decoded
            .try_into()
            .map_err(|_| anyhow!("invalid session token length"))?;
        Ok(Self(bytes))
    }
}

impl Serialize for SessionToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SessionToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(D::Error::custom)
    }
}

/// Observer-safe session identifier. Cannot be used to mutate the session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BroadcastToken(Uuid);

impl BroadcastToken {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for BroadcastToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Serialize for BroadcastToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BroadcastToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self(Uuid::parse_str(&value).map_err(D::Error::custom)?))
    }
}
