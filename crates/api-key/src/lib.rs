//! API key minting, parsing and verification.
//!
//! Keys look like `{prefix}_v{version}_{base32(uuid || secret)}`, e.g.
//! `sk_v1_ab3k...`. Only a [`StoredKey`] (id, version, SHA3-512 digest) is
//! ever persisted; the raw token lives in an [`IssuedKey`] long enough to be
//! shown to its owner once.
//!
//! - Digests bind the key id, algorithm version and an optional deployment
//!   context, so stored digests cannot be moved between keys.
//! - Digests are compared in constant time.
//! - Secrets are zeroized when the holding value is dropped.
//!
//! # Example
//!
//! ```rust
//! use api_key::KeyMinter;
//!
//! let minter = KeyMinter::new("sk");
//! let issued = minter.mint();
//!
//! // Persist issued.stored(), hand issued.reveal() to the caller.
//! let stored = issued.stored().clone();
//!
//! let presented = minter.parse(issued.reveal()).unwrap();
//! assert_eq!(presented.id, stored.id);
//! assert!(minter.verify(&presented, &stored));
//! ```

mod digest;
mod error;
mod presented;
mod stored;
mod token;

pub use digest::{CURRENT_VERSION, DIGEST_LEN, KeyDigest, SECRET_LEN};
pub use error::{ApiKeyError, Result};
pub use presented::PresentedKey;
pub use stored::StoredKey;
pub use token::{IssuedKey, KeyMinter};
