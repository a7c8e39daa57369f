//! Parsing of keys presented by callers.

use std::fmt;

use data_encoding::BASE32_NOPAD;
use uuid::Uuid;
use zeroize::Zeroize;

use crate::digest::{CURRENT_VERSION, SECRET_LEN};
use crate::error::{ApiKeyError, Result};

/// Base32 payload length in bytes: UUID (16) + secret.
pub(crate) const PAYLOAD_LEN: usize = 16 + SECRET_LEN;

/// A key as presented on a request, split into its components.
///
/// The secret is wiped from memory when the value is dropped.
pub struct PresentedKey {
    pub id: Uuid,
    pub version: i16,
    secret: [u8; SECRET_LEN],
}

impl PresentedKey {
    pub fn secret(&self) -> &[u8; SECRET_LEN] {
        &self.secret
    }

    /// Split `{prefix}_v{version}_{payload}` and decode the payload.
    ///
    /// The prefix itself may contain underscores; the version and payload
    /// never do.
    pub fn parse(token: &str, expected_prefix: &str) -> Result<Self> {
        let mut parts = token.rsplitn(3, '_');
        let (Some(payload), Some(version), Some(prefix)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ApiKeyError::InvalidFormat);
        };

        if prefix != expected_prefix {
            return Err(ApiKeyError::InvalidPrefix {
                expected: expected_prefix.to_string(),
                got: prefix.to_string(),
            });
        }

        let version = version
            .strip_prefix('v')
            .and_then(|v| v.parse::<i16>().ok())
            .ok_or(ApiKeyError::InvalidFormat)?;
        if version != CURRENT_VERSION {
            return Err(ApiKeyError::UnsupportedVersion(version));
        }

        // Tokens are issued lowercase; accept either case.
        let mut decoded = BASE32_NOPAD
            .decode(payload.to_ascii_uppercase().as_bytes())
            .map_err(|_| ApiKeyError::InvalidEncoding)?;
        if decoded.len() != PAYLOAD_LEN {
            decoded.zeroize();
            return Err(ApiKeyError::InvalidFormat);
        }

        let mut id_bytes = [0u8; 16];
        id_bytes.copy_from_slice(&decoded[..16]);
        let mut secret = [0u8; SECRET_LEN];
        secret.copy_from_slice(&decoded[16..]);
        decoded.zeroize();

        Ok(Self {
            id: Uuid::from_bytes(id_bytes),
            version,
            secret,
        })
    }
}

impl fmt::Debug for PresentedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresentedKey")
            .field("id", &self.id)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl Drop for PresentedKey {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}
