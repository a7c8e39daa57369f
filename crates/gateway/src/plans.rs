//! Plan catalogue, subscriptions and per-request plan resolution.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::{OptionalExtension, TransactionBehavior, params};

use crate::clock::Clock;
use crate::context::Context;
use crate::error::{AdmissionError, Stage, StoreError, bounded};
use crate::model::{AccountId, ActivePlan, Plan, Subscription};
use crate::store::SqliteStore;

/// Price unit charged by the admission pipeline.
pub const REQUEST_UNIT: &str = "request";

impl SqliteStore {
    /// The account's most recent subscription with the active flag set,
    /// joined to its plan and current request price. Expiry is not checked.
    pub async fn flagged_subscription(
        &self,
        account_id: AccountId,
    ) -> Result<Option<ActivePlan>, StoreError> {
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT s.subscription_id, s.plan_code, s.active, s.started_at, s.expires_at,
                            p.name, p.rate_limit,
                            (SELECT pp.price FROM plan_prices pp
                             WHERE pp.plan_code = p.code AND pp.unit = ?2 AND pp.active = 1
                             ORDER BY pp.price_id DESC LIMIT 1)
                     FROM subscriptions s
                     JOIN plans p ON p.code = s.plan_code
                     WHERE s.account_id = ?1 AND s.active = 1
                     ORDER BY s.started_at DESC, s.subscription_id DESC
                     LIMIT 1",
                    params![account_id, REQUEST_UNIT],
                    |row| {
                        let plan_code: String = row.get(1)?;
                        Ok(ActivePlan {
                            subscription: Subscription {
                                subscription_id: row.get(0)?,
                                account_id,
                                plan_code: plan_code.clone(),
                                active: row.get(2)?,
                                started_at: row.get(3)?,
                                expires_at: row.get(4)?,
                            },
                            plan: Plan {
                                code: plan_code,
                                name: row.get(5)?,
                                rate_limit: row.get(6)?,
                                price: row.get(7)?,
                            },
                        })
                    },
                )
                .optional()?)
        })
        .await
    }

    /// Current active price of `plan_code` for `unit`, if any.
    pub async fn plan_price(
        &self,
        plan_code: &str,
        unit: &'static str,
    ) -> Result<Option<i64>, StoreError> {
        let plan_code = plan_code.to_string();
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT price FROM plan_prices
                     WHERE plan_code = ?1 AND unit = ?2 AND active = 1
                     ORDER BY price_id DESC LIMIT 1",
                    params![plan_code, unit],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }

    pub async fn plan(&self, code: &str) -> Result<Option<Plan>, StoreError> {
        let code = code.to_string();
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT p.code, p.name, p.rate_limit,
                            (SELECT pp.price FROM plan_prices pp
                             WHERE pp.plan_code = p.code AND pp.unit = ?2 AND pp.active = 1
                             ORDER BY pp.price_id DESC LIMIT 1)
                     FROM plans p WHERE p.code = ?1",
                    params![code, REQUEST_UNIT],
                    |row| {
                        Ok(Plan {
                            code: row.get(0)?,
                            name: row.get(1)?,
                            rate_limit: row.get(2)?,
                            price: row.get(3)?,
                        })
                    },
                )
                .optional()?)
        })
        .await
    }

    /// Create or replace a plan and its request price.
    ///
    /// Refused with [`StoreError::PlanInUse`] while a live subscription
    /// references an existing plan of that code.
    pub async fn upsert_plan(&self, plan: Plan, now: i64) -> Result<(), StoreError> {
        if let Some(price) = plan.price.filter(|p| *p < 0) {
            return Err(StoreError::InvalidAmount(price));
        }
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let in_use: bool = tx.query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM subscriptions
                    WHERE plan_code = ?1 AND active = 1
                      AND (expires_at IS NULL OR expires_at > ?2))",
                params![plan.code, now],
                |row| row.get(0),
            )?;
            if in_use {
                return Err(StoreError::PlanInUse(plan.code));
            }

            tx.execute(
                "INSERT INTO plans (code, name, rate_limit, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(code) DO UPDATE SET
                    name = excluded.name,
                    rate_limit = excluded.rate_limit,
                    updated_at = excluded.updated_at",
                params![plan.code, plan.name, plan.rate_limit, now],
            )?;
            tx.execute(
                "UPDATE plan_prices SET active = 0 WHERE plan_code = ?1 AND unit = ?2",
                params![plan.code, REQUEST_UNIT],
            )?;
            if let Some(price) = plan.price {
                tx.execute(
                    "INSERT INTO plan_prices (plan_code, unit, price, active, created_at)
                     VALUES (?1, ?2, ?3, 1, ?4)",
                    params![plan.code, REQUEST_UNIT, price, now],
                )?;
            }
            tx.commit()?;
            log::info!("Upserted plan {} ({})", plan.code, plan.name);
            Ok(())
        })
        .await
    }

    /// Subscribe the account to a plan, deactivating its earlier subscriptions.
    pub async fn subscribe(
        &self,
        account_id: AccountId,
        plan_code: &str,
        started_at: i64,
        expires_at: Option<i64>,
    ) -> Result<Subscription, StoreError> {
        let plan_code = plan_code.to_string();
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if crate::accounts::fetch_account(&tx, account_id)?.is_none() {
                return Err(StoreError::UnknownAccount(account_id));
            }
            let known: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM plans WHERE code = ?1)",
                [&plan_code],
                |row| row.get(0),
            )?;
            if !known {
                return Err(StoreError::UnknownPlan(plan_code));
            }

            tx.execute(
                "UPDATE subscriptions SET active = 0 WHERE account_id = ?1 AND active = 1",
                [account_id],
            )?;
            tx.execute(
                "INSERT INTO subscriptions (account_id, plan_code, active, started_at, expires_at)
                 VALUES (?1, ?2, 1, ?3, ?4)",
                params![account_id, plan_code, started_at, expires_at],
            )?;
            let subscription_id = tx.last_insert_rowid();
            tx.commit()?;

            log::info!("Subscribed account {account_id} to {plan_code}");
            Ok(Subscription {
                subscription_id,
                account_id,
                plan_code,
                active: true,
                started_at,
                expires_at,
            })
        })
        .await
    }
}

/// Maps an account to its active plan, re-evaluated on every request.
#[derive(Clone)]
pub struct PlanResolver {
    store: SqliteStore,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl PlanResolver {
    pub fn new(ctx: &Context) -> Self {
        Self {
            store: ctx.store.clone(),
            clock: ctx.clock.clone(),
            timeout: ctx.store_timeout,
        }
    }

    /// Fails with `NoActivePlan` when nothing is subscribed and with
    /// `PlanExpired` when the expiry has passed, whatever the active flag says.
    pub async fn resolve(&self, account_id: AccountId) -> Result<ActivePlan, AdmissionError> {
        let active = bounded(
            Stage::Plan,
            self.timeout,
            self.store.flagged_subscription(account_id),
        )
        .await?
        .ok_or(AdmissionError::NoActivePlan)?;

        if !active.subscription.is_active_at(self.clock.unix_secs()) {
            return Err(AdmissionError::PlanExpired);
        }
        Ok(active)
    }
}
