//! API key verification and rotation.
//!
//! Only the digest of a key is stored. A presented key is parsed, its live
//! credential fetched by key id and the digest compared in constant time.
//! Unknown, revoked and malformed keys are indistinguishable to the caller.

use std::sync::Arc;
use std::time::Duration;

use api_key::{IssuedKey, KeyDigest, KeyMinter, StoredKey};
use rusqlite::{OptionalExtension, TransactionBehavior, params};
use uuid::Uuid;

use crate::accounts::fetch_account;
use crate::clock::Clock;
use crate::context::{BackgroundTasks, Context};
use crate::error::{AdmissionError, Stage, StoreError, bounded};
use crate::model::AccountId;
use crate::store::SqliteStore;

/// A live credential row.
#[derive(Debug, Clone)]
pub struct Credential {
    pub account_id: AccountId,
    pub key: StoredKey,
    pub created_at: i64,
    pub last_used_at: Option<i64>,
}

impl SqliteStore {
    /// The unrevoked credential with this key id, if any.
    pub async fn live_credential(&self, key_id: Uuid) -> Result<Option<Credential>, StoreError> {
        self.call(move |conn| {
            let row = conn
                .query_row(
                    "SELECT account_id, digest, version, created_at, last_used_at
                     FROM credentials WHERE key_id = ?1 AND revoked = 0",
                    [key_id.to_string()],
                    |row| {
                        Ok((
                            row.get::<_, AccountId>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i16>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, Option<i64>>(4)?,
                        ))
                    },
                )
                .optional()?;

            let Some((account_id, digest, version, created_at, last_used_at)) = row else {
                return Ok(None);
            };
            Ok(Some(Credential {
                account_id,
                key: StoredKey::new(key_id, version, KeyDigest::from_hex(&digest)?),
                created_at,
                last_used_at,
            }))
        })
        .await
    }

    /// The account's live credential, if it has one.
    pub async fn live_credential_for(
        &self,
        account_id: AccountId,
    ) -> Result<Option<Uuid>, StoreError> {
        self.call(move |conn| {
            let key_id: Option<String> = conn
                .query_row(
                    "SELECT key_id FROM credentials WHERE account_id = ?1 AND revoked = 0",
                    [account_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(key_id.and_then(|id| Uuid::parse_str(&id).ok()))
        })
        .await
    }

    pub async fn touch_credential(&self, key_id: Uuid, now: i64) -> Result<(), StoreError> {
        self.call(move |conn| {
            conn.execute(
                "UPDATE credentials SET last_used_at = ?2 WHERE key_id = ?1",
                params![key_id.to_string(), now],
            )?;
            Ok(())
        })
        .await
    }

    /// Revoke every credential of the account and store `key` as its only
    /// live one, in one transaction.
    pub async fn replace_credential(
        &self,
        account_id: AccountId,
        key: StoredKey,
        now: i64,
    ) -> Result<(), StoreError> {
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if fetch_account(&tx, account_id)?.is_none() {
                return Err(StoreError::UnknownAccount(account_id));
            }
            let revoked = tx.execute(
                "UPDATE credentials SET revoked = 1 WHERE account_id = ?1 AND revoked = 0",
                [account_id],
            )?;
            tx.execute(
                "INSERT INTO credentials (key_id, account_id, digest, version, revoked, created_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                params![
                    key.id.to_string(),
                    account_id,
                    key.digest.to_hex(),
                    key.version,
                    now
                ],
            )?;
            tx.commit()?;
            log::info!(
                "Rotated API key for account {account_id} ({revoked} revoked, new key {})",
                key.id
            );
            Ok(())
        })
        .await
    }

    /// Revoke without issuing a replacement.
    pub async fn revoke_credentials(&self, account_id: AccountId) -> Result<usize, StoreError> {
        self.call(move |conn| {
            Ok(conn.execute(
                "UPDATE credentials SET revoked = 1 WHERE account_id = ?1 AND revoked = 0",
                [account_id],
            )?)
        })
        .await
    }
}

/// Maps a presented key to the account that owns it.
#[derive(Clone)]
pub struct CredentialVerifier {
    store: SqliteStore,
    minter: KeyMinter,
    clock: Arc<dyn Clock>,
    background: BackgroundTasks,
    timeout: Duration,
}

impl CredentialVerifier {
    pub fn new(ctx: &Context) -> Self {
        Self {
            store: ctx.store.clone(),
            minter: ctx.minter.clone(),
            clock: ctx.clock.clone(),
            background: ctx.background.clone(),
            timeout: ctx.store_timeout,
        }
    }

    /// Resolve `raw` to its account or fail with `Unauthorized`.
    ///
    /// Updating the last-used stamp is detached and never delays the caller.
    pub async fn verify(&self, raw: &str) -> Result<AccountId, AdmissionError> {
        let presented = match self.minter.parse(raw.trim()) {
            Ok(presented) => presented,
            Err(e) => {
                log::debug!("rejecting malformed API key: {e}");
                return Err(AdmissionError::Unauthorized);
            }
        };

        let credential = bounded(
            Stage::Credential,
            self.timeout,
            self.store.live_credential(presented.id),
        )
        .await?
        .ok_or(AdmissionError::Unauthorized)?;

        if !self.minter.verify(&presented, &credential.key) {
            log::debug!("digest mismatch for key {}", presented.id);
            return Err(AdmissionError::Unauthorized);
        }

        let store = self.store.clone();
        let key_id = credential.key.id;
        let now = self.clock.unix_secs();
        self.background
            .spawn("credential touch", async move { store.touch_credential(key_id, now).await });

        Ok(credential.account_id)
    }

    /// Mint a key for the account, revoking any previous one.
    ///
    /// The returned token is the only copy; it is never persisted.
    pub async fn rotate(&self, account_id: AccountId) -> Result<IssuedKey, StoreError> {
        let issued = self.minter.mint();
        self.store
            .replace_credential(account_id, issued.stored().clone(), self.clock.unix_secs())
            .await?;
        Ok(issued)
    }
}
