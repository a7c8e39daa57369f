//! Idempotent balance debits and credits.
//!
//! Every balance change is a ledger entry whose idempotency key is unique per
//! account at the storage level. A debit reads and writes the balance inside one
//! `BEGIN IMMEDIATE` transaction, so concurrent debits of the same account
//! serialize on the database write lock. A unique violation on the ledger
//! insert means another attempt with the same key already committed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::{OptionalExtension, TransactionBehavior, params};

use crate::clock::Clock;
use crate::context::Context;
use crate::error::{AdmissionError, Stage, StoreError, bounded};
use crate::model::{AccountId, LedgerEntry, LedgerKind};
use crate::plans::REQUEST_UNIT;
use crate::store::{SqliteStore, is_busy, is_unique_violation};

/// Result of one debit attempt that reached the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebitOutcome {
    Charged(i64),
    /// This account already has a ledger entry with this idempotency key.
    AlreadyBilled,
    /// Nothing written; the balance at the time of the check.
    Insufficient { balance: i64 },
}

/// Lock contention past the deadline becomes `DeadlineExceeded`.
fn classify(err: rusqlite::Error) -> StoreError {
    if is_busy(&err) {
        StoreError::DeadlineExceeded
    } else {
        StoreError::Sqlite(err)
    }
}

impl SqliteStore {
    pub async fn ledger_entry_exists(
        &self,
        account_id: AccountId,
        idempotency_key: &str,
    ) -> Result<bool, StoreError> {
        let key = idempotency_key.to_string();
        self.call(move |conn| {
            Ok(conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM ledger_entries
                 WHERE account_id = ?1 AND idempotency_key = ?2)",
                params![account_id, key],
                |row| row.get(0),
            )?)
        })
        .await
    }

    /// Debit `price` and append the matching ledger entry, atomically.
    ///
    /// The transaction must commit before `deadline`: waiting on the write
    /// lock is capped at the time left and the deadline is checked again
    /// right before commit. On `DeadlineExceeded` nothing was written.
    pub async fn debit(
        &self,
        account_id: AccountId,
        price: i64,
        idempotency_key: &str,
        reason: String,
        now: i64,
        deadline: Instant,
    ) -> Result<DebitOutcome, StoreError> {
        if price <= 0 {
            return Err(StoreError::InvalidAmount(price));
        }
        let key = idempotency_key.to_string();
        self.call(move |conn| {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(StoreError::DeadlineExceeded);
            }
            conn.busy_timeout(remaining)?;

            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(classify)?;

            let balance: i64 = tx
                .query_row(
                    "SELECT balance FROM accounts WHERE account_id = ?1",
                    [account_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(classify)?
                .ok_or(StoreError::UnknownAccount(account_id))?;

            if balance < price {
                return Ok(DebitOutcome::Insufficient { balance });
            }

            tx.execute(
                "UPDATE accounts SET balance = balance - ?2 WHERE account_id = ?1",
                params![account_id, price],
            )
            .map_err(classify)?;

            match tx.execute(
                "INSERT INTO ledger_entries (account_id, amount, kind, reason, idempotency_key, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![account_id, -price, LedgerKind::Deduct.as_str(), reason, key, now],
            ) {
                Ok(_) => {}
                // Dropping the transaction rolls back the balance update.
                Err(e) if is_unique_violation(&e) => return Ok(DebitOutcome::AlreadyBilled),
                Err(e) => return Err(classify(e)),
            }

            if Instant::now() >= deadline {
                return Err(StoreError::DeadlineExceeded);
            }
            tx.commit().map_err(classify)?;
            Ok(DebitOutcome::Charged(price))
        })
        .await
    }

    /// Add funds through a `topup` ledger entry.
    ///
    /// Returns `false` when the account already has an entry with this key, in
    /// which case the balance is left alone.
    pub async fn credit(
        &self,
        account_id: AccountId,
        amount: i64,
        idempotency_key: &str,
        reason: &str,
        now: i64,
    ) -> Result<bool, StoreError> {
        if amount <= 0 {
            return Err(StoreError::InvalidAmount(amount));
        }
        let key = idempotency_key.to_string();
        let reason = reason.to_string();
        self.call(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(classify)?;

            let updated = tx.execute(
                "UPDATE accounts SET balance = balance + ?2 WHERE account_id = ?1",
                params![account_id, amount],
            )?;
            if updated == 0 {
                return Err(StoreError::UnknownAccount(account_id));
            }

            match tx.execute(
                "INSERT INTO ledger_entries (account_id, amount, kind, reason, idempotency_key, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![account_id, amount, LedgerKind::Topup.as_str(), reason, key, now],
            ) {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => return Ok(false),
                Err(e) => return Err(e.into()),
            }
            tx.commit()?;
            log::info!("Credited {amount} to account {account_id}");
            Ok(true)
        })
        .await
    }

    pub async fn ledger_entries(&self, account_id: AccountId) -> Result<Vec<LedgerEntry>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT entry_id, account_id, amount, kind, reason, idempotency_key, created_at
                 FROM ledger_entries WHERE account_id = ?1 ORDER BY entry_id",
            )?;
            let rows = stmt.query_map([account_id], |row| {
                let kind: String = row.get(3)?;
                Ok(LedgerEntry {
                    entry_id: row.get(0)?,
                    account_id: row.get(1)?,
                    amount: row.get(2)?,
                    kind: kind.parse().unwrap_or(LedgerKind::Deduct),
                    reason: row.get(4)?,
                    idempotency_key: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }
}

/// Charges one unit of work exactly once per idempotency key.
#[derive(Clone)]
pub struct BillingEngine {
    store: SqliteStore,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl BillingEngine {
    pub fn new(ctx: &Context) -> Self {
        Self {
            store: ctx.store.clone(),
            clock: ctx.clock.clone(),
            timeout: ctx.store_timeout,
        }
    }

    /// Charge the request price of `plan_code` to the account.
    ///
    /// Returns the amount charged: zero for a replayed idempotency key or a
    /// plan without a price (no ledger entry is written for free requests).
    pub async fn charge(
        &self,
        account_id: AccountId,
        plan_code: &str,
        idempotency_key: &str,
    ) -> Result<i64, AdmissionError> {
        let billed = bounded(
            Stage::Billing,
            self.timeout,
            self.store.ledger_entry_exists(account_id, idempotency_key),
        )
        .await?;
        if billed {
            log::debug!("request {idempotency_key} already billed");
            return Ok(0);
        }

        let price = bounded(
            Stage::Billing,
            self.timeout,
            self.store.plan_price(plan_code, REQUEST_UNIT),
        )
        .await?;
        let Some(price) = price.filter(|p| *p > 0) else {
            return Ok(0);
        };

        // No outer timeout here: the deadline is enforced inside the
        // transaction so a reported timeout never hides a commit.
        let deadline = Instant::now() + self.timeout;
        let outcome = self
            .store
            .debit(
                account_id,
                price,
                idempotency_key,
                format!("API request to {plan_code}"),
                self.clock.unix_secs(),
                deadline,
            )
            .await
            .map_err(|e| AdmissionError::from_store(Stage::Billing, e))?;

        match outcome {
            DebitOutcome::Charged(amount) => {
                log::debug!("charged {amount} to account {account_id} for {idempotency_key}");
                Ok(amount)
            }
            DebitOutcome::AlreadyBilled => {
                log::debug!("request {idempotency_key} billed concurrently");
                Ok(0)
            }
            DebitOutcome::Insufficient { balance } => {
                Err(AdmissionError::InsufficientBalance { balance, price })
            }
        }
    }

    pub async fn credit(
        &self,
        account_id: AccountId,
        amount: i64,
        idempotency_key: &str,
        reason: &str,
    ) -> Result<bool, StoreError> {
        self.store
            .credit(account_id, amount, idempotency_key, reason, self.clock.unix_secs())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Identity, Plan};
    use crate::store::test_support::temp_store;

    async fn funded(balance: i64, price: Option<i64>) -> (tempfile::TempDir, Context, AccountId) {
        let (dir, store) = temp_store().await;
        let account = store
            .get_or_create_account(
                Identity {
                    external_id: "billing".into(),
                    email: "b@example.com".into(),
                    display_name: None,
                },
                0,
            )
            .await
            .unwrap();
        store
            .upsert_plan(
                Plan {
                    code: "pro".into(),
                    name: "Pro".into(),
                    rate_limit: None,
                    price,
                },
                0,
            )
            .await
            .unwrap();
        if balance > 0 {
            assert!(
                store
                    .credit(account.account_id, balance, "seed", "seed", 0)
                    .await
                    .unwrap()
            );
        }
        (dir, Context::new(store), account.account_id)
    }

    async fn balance(ctx: &Context, id: AccountId) -> i64 {
        ctx.store.account(id).await.unwrap().unwrap().balance
    }

    #[tokio::test]
    async fn charges_once_per_key() {
        let (_dir, ctx, id) = funded(100, Some(30)).await;
        let engine = BillingEngine::new(&ctx);

        assert_eq!(engine.charge(id, "pro", "req-1").await.unwrap(), 30);
        assert_eq!(engine.charge(id, "pro", "req-1").await.unwrap(), 0);
        assert_eq!(balance(&ctx, id).await, 70);

        let entries = ctx.store.ledger_entries(id).await.unwrap();
        let debit = entries.last().unwrap();
        assert_eq!(debit.amount, -30);
        assert_eq!(debit.kind, LedgerKind::Deduct);
        assert_eq!(debit.reason, "API request to pro");
        assert_eq!(debit.idempotency_key, "req-1");
    }

    #[tokio::test]
    async fn same_key_from_another_account_is_charged() {
        let (_dir, ctx, first) = funded(100, Some(30)).await;
        let second = ctx
            .store
            .get_or_create_account(
                Identity {
                    external_id: "billing-2".into(),
                    email: "c@example.com".into(),
                    display_name: None,
                },
                0,
            )
            .await
            .unwrap()
            .account_id;
        assert!(ctx.store.credit(second, 100, "seed", "seed", 0).await.unwrap());
        let engine = BillingEngine::new(&ctx);

        assert_eq!(engine.charge(first, "pro", "order-42").await.unwrap(), 30);
        assert_eq!(engine.charge(second, "pro", "order-42").await.unwrap(), 30);
        assert_eq!(engine.charge(second, "pro", "order-42").await.unwrap(), 0);

        assert_eq!(balance(&ctx, first).await, 70);
        assert_eq!(balance(&ctx, second).await, 70);
        let debits = ctx
            .store
            .ledger_entries(second)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == LedgerKind::Deduct)
            .count();
        assert_eq!(debits, 1);
    }

    #[tokio::test]
    async fn insufficient_balance_leaves_state_alone() {
        let (_dir, ctx, id) = funded(10, Some(30)).await;
        let engine = BillingEngine::new(&ctx);

        let err = engine.charge(id, "pro", "req-1").await.unwrap_err();
        assert!(matches!(
            err,
            AdmissionError::InsufficientBalance {
                balance: 10,
                price: 30
            }
        ));
        assert_eq!(balance(&ctx, id).await, 10);
        assert!(!ctx.store.ledger_entry_exists(id, "req-1").await.unwrap());
    }

    #[tokio::test]
    async fn unpriced_and_zero_priced_plans_are_free() {
        for price in [None, Some(0)] {
            let (_dir, ctx, id) = funded(0, price).await;
            let engine = BillingEngine::new(&ctx);
            assert_eq!(engine.charge(id, "pro", "free-1").await.unwrap(), 0);
            assert!(ctx.store.ledger_entries(id).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn duplicate_insert_is_already_billed() {
        let (_dir, ctx, id) = funded(100, Some(30)).await;
        let deadline = || Instant::now() + Duration::from_secs(2);

        let first = ctx
            .store
            .debit(id, 30, "dup", "r".into(), 0, deadline())
            .await
            .unwrap();
        // Skips the existence pre-check, so only the constraint catches it.
        let second = ctx
            .store
            .debit(id, 30, "dup", "r".into(), 0, deadline())
            .await
            .unwrap();

        assert_eq!(first, DebitOutcome::Charged(30));
        assert_eq!(second, DebitOutcome::AlreadyBilled);
        assert_eq!(balance(&ctx, id).await, 70);
    }

    #[tokio::test]
    async fn expired_deadline_commits_nothing() {
        let (_dir, ctx, id) = funded(100, Some(30)).await;
        let err = ctx
            .store
            .debit(id, 30, "late", "r".into(), 0, Instant::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DeadlineExceeded));
        assert_eq!(balance(&ctx, id).await, 100);
    }

    #[tokio::test]
    async fn lock_contention_times_out_without_commit() {
        let (_dir, ctx, id) = funded(100, Some(30)).await;
        let ctx = ctx.with_store_timeout(Duration::from_millis(150));
        let engine = BillingEngine::new(&ctx);

        let blocker = rusqlite::Connection::open(ctx.store.path()).unwrap();
        blocker.execute_batch("BEGIN IMMEDIATE").unwrap();

        let err = engine.charge(id, "pro", "blocked").await.unwrap_err();
        assert!(matches!(
            err,
            AdmissionError::Timeout {
                stage: Stage::Billing
            }
        ));
        assert!(err.is_retryable());

        blocker.execute_batch("ROLLBACK").unwrap();
        assert_eq!(balance(&ctx, id).await, 100);
        // The retry with the same key goes through.
        assert_eq!(engine.charge(id, "pro", "blocked").await.unwrap(), 30);
    }

    #[tokio::test]
    async fn credit_is_idempotent() {
        let (_dir, ctx, id) = funded(0, Some(30)).await;
        let engine = BillingEngine::new(&ctx);

        assert!(engine.credit(id, 50, "topup-1", "manual").await.unwrap());
        assert!(!engine.credit(id, 50, "topup-1", "manual").await.unwrap());
        assert_eq!(balance(&ctx, id).await, 50);

        assert!(matches!(
            engine.credit(id, 0, "topup-2", "manual").await,
            Err(StoreError::InvalidAmount(0))
        ));
        assert!(matches!(
            engine.credit(999, 5, "topup-3", "manual").await,
            Err(StoreError::UnknownAccount(999))
        ));
    }
}
