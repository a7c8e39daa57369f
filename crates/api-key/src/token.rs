//! Minting and verification of API keys.

use std::fmt;

use data_encoding::BASE32_NOPAD;
use rand::RngCore;
use uuid::Uuid;
use zeroize::{Zeroize, Zeroizing};

use crate::digest::{CURRENT_VERSION, KeyDigest, SECRET_LEN};
use crate::error::Result;
use crate::presented::{PAYLOAD_LEN, PresentedKey};
use crate::stored::StoredKey;

/// Mints and checks keys for one deployment.
#[derive(Debug, Clone)]
pub struct KeyMinter {
    prefix: String,
    /// Optional deployment id bound into every digest.
    context: Option<Uuid>,
}

impl Default for KeyMinter {
    fn default() -> Self {
        Self::new("sk")
    }
}

impl KeyMinter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: Uuid) -> Self {
        self.context = Some(context);
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn context(&self) -> Option<Uuid> {
        self.context
    }

    /// Generate a fresh key: a UUIDv7 id plus 256 bits from the OS RNG.
    pub fn mint(&self) -> IssuedKey {
        let id = Uuid::now_v7();

        let mut secret = [0u8; SECRET_LEN];
        rand::rngs::OsRng.fill_bytes(&mut secret);

        let mut payload = [0u8; PAYLOAD_LEN];
        payload[..16].copy_from_slice(id.as_bytes());
        payload[16..].copy_from_slice(&secret);

        let token = Zeroizing::new(format!(
            "{}_v{}_{}",
            self.prefix,
            CURRENT_VERSION,
            BASE32_NOPAD.encode(&payload).to_ascii_lowercase()
        ));
        let digest = KeyDigest::compute(id, CURRENT_VERSION, self.context, &secret);

        payload.zeroize();
        secret.zeroize();

        IssuedKey {
            token,
            stored: StoredKey::new(id, CURRENT_VERSION, digest),
        }
    }

    /// Parse a presented token against this minter's prefix.
    pub fn parse(&self, token: &str) -> Result<PresentedKey> {
        PresentedKey::parse(token, &self.prefix)
    }

    /// Check a presented key against what the store holds for its id.
    pub fn verify(&self, presented: &PresentedKey, stored: &StoredKey) -> bool {
        if presented.id != stored.id || presented.version != stored.version {
            return false;
        }
        let computed =
            KeyDigest::compute(presented.id, presented.version, self.context, presented.secret());
        computed.ct_eq(&stored.digest)
    }
}

/// A freshly minted key. The raw token exists only here and is wiped on drop;
/// it must be shown to the owner once and never persisted.
pub struct IssuedKey {
    token: Zeroizing<String>,
    stored: StoredKey,
}

impl IssuedKey {
    pub fn reveal(&self) -> &str {
        &self.token
    }

    pub fn stored(&self) -> &StoredKey {
        &self.stored
    }
}

impl fmt::Debug for IssuedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedKey")
            .field("token", &"<redacted>")
            .field("stored", &self.stored)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_token_shape() {
        let issued = KeyMinter::new("sk").mint();

        let parts: Vec<&str> = issued.reveal().split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "sk");
        assert_eq!(parts[1], "v1");
        // 48 bytes -> ceil(48 * 8 / 5) base32 chars
        assert_eq!(parts[2].len(), 77);
        assert_eq!(parts[2], parts[2].to_ascii_lowercase());
    }

    #[test]
    fn every_mint_is_unique() {
        let minter = KeyMinter::default();
        let a = minter.mint();
        let b = minter.mint();
        assert_ne!(a.stored().id, b.stored().id);
        assert_ne!(a.reveal(), b.reveal());
    }

    #[test]
    fn minted_key_verifies() {
        let minter = KeyMinter::new("sk");
        let issued = minter.mint();

        let presented = minter.parse(issued.reveal()).unwrap();
        assert!(minter.verify(&presented, issued.stored()));
    }

    #[test]
    fn tampered_digest_fails() {
        let minter = KeyMinter::new("sk");
        let issued = minter.mint();
        let other = minter.mint();

        let presented = minter.parse(issued.reveal()).unwrap();
        let forged = StoredKey::new(issued.stored().id, 1, other.stored().digest.clone());
        assert!(!minter.verify(&presented, &forged));
    }

    #[test]
    fn key_from_another_deployment_fails() {
        let ours = KeyMinter::new("sk").with_context(Uuid::new_v4());
        let theirs = KeyMinter::new("sk").with_context(Uuid::new_v4());
        let issued = theirs.mint();

        let presented = ours.parse(issued.reveal()).unwrap();
        assert!(!ours.verify(&presented, issued.stored()));
    }

    #[test]
    fn id_mismatch_fails() {
        let minter = KeyMinter::new("sk");
        let issued = minter.mint();
        let presented = minter.parse(issued.reveal()).unwrap();

        let mut stored = issued.stored().clone();
        stored.id = Uuid::new_v4();
        assert!(!minter.verify(&presented, &stored));
    }

    #[test]
    fn debug_redacts_token() {
        let issued = KeyMinter::new("sk").mint();
        assert!(!format!("{issued:?}").contains(issued.reveal()));
    }
}
