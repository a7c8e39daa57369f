//! The persisted half of an API key.

use uuid::Uuid;

use crate::digest::KeyDigest;

/// What a credential store keeps for one key: never the secret itself.
#[derive(Debug, Clone)]
pub struct StoredKey {
    /// Key identifier (UUIDv7), also embedded in the token.
    pub id: Uuid,
    /// Digest algorithm version the key was minted with.
    pub version: i16,
    pub digest: KeyDigest,
}

impl StoredKey {
    pub fn new(id: Uuid, version: i16, digest: KeyDigest) -> Self {
        Self {
            id,
            version,
            digest,
        }
    }
}
