//! SHA3-512 digests of key secrets.

use std::fmt;

use data_encoding::{HEXLOWER, HEXLOWER_PERMISSIVE};
use sha3::{Digest, Sha3_512};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::{ApiKeyError, Result};

/// Current version of the digest algorithm.
pub const CURRENT_VERSION: i16 = 1;

/// Length of a secret in bytes.
pub const SECRET_LEN: usize = 32;

/// Length of a digest in bytes.
pub const DIGEST_LEN: usize = 64;

/// One-way digest of a key secret, the only form in which a secret is stored.
///
/// Equality is only exposed through [`KeyDigest::ct_eq`] so that callers
/// cannot accidentally compare digests in variable time.
#[derive(Clone)]
pub struct KeyDigest([u8; DIGEST_LEN]);

impl KeyDigest {
    /// Compute the digest for a secret.
    ///
    /// The key id, algorithm version and optional deployment context are
    /// hashed ahead of the secret, so a digest copied onto another key id,
    /// version or deployment never verifies.
    pub fn compute(
        id: Uuid,
        version: i16,
        context: Option<Uuid>,
        secret: &[u8; SECRET_LEN],
    ) -> Self {
        let mut hasher = Sha3_512::new();
        hasher.update(id.as_bytes());
        hasher.update(version.to_le_bytes());
        if let Some(ctx) = context {
            hasher.update(ctx.as_bytes());
        }
        // Secret last.
        hasher.update(secret);

        let mut out = [0u8; DIGEST_LEN];
        out.copy_from_slice(&hasher.finalize());
        Self(out)
    }

    /// Decode a digest previously produced by [`KeyDigest::to_hex`].
    pub fn from_hex(encoded: &str) -> Result<Self> {
        let bytes = HEXLOWER_PERMISSIVE
            .decode(encoded.as_bytes())
            .map_err(|_| ApiKeyError::InvalidDigest)?;
        let out: [u8; DIGEST_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ApiKeyError::InvalidDigest)?;
        Ok(Self(out))
    }

    pub fn to_hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }

    /// Constant-time comparison.
    pub fn ct_eq(&self, other: &KeyDigest) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl fmt::Debug for KeyDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyDigest({}..)", HEXLOWER.encode(&self.0[..4]))
    }
}
