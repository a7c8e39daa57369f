//! Append-only usage log and the per-account usage report.
//!
//! Records are written by detached background tasks after billing has
//! committed; a failed append is logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::params;
use serde::Serialize;

use crate::clock::Clock;
use crate::context::{BackgroundTasks, Context};
use crate::error::{AdmissionError, Stage, StoreError, bounded};
use crate::model::{Account, AccountId, UsageRecord};
use crate::store::SqliteStore;

const EXPIRY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Aggregate usage plus the current plan, as returned by `GET /api/usage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageReport {
    pub account_id: AccountId,
    pub balance: i64,
    pub plan_code: Option<String>,
    pub plan_name: Option<String>,
    pub rate_limit: Option<u32>,
    pub request_count: u64,
    pub total_cost: i64,
    /// UTC, `%Y-%m-%d %H:%M:%S`.
    pub plan_expires_at: Option<String>,
}

impl SqliteStore {
    pub async fn append_usage(&self, record: UsageRecord) -> Result<(), StoreError> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO usage_records (account_id, plan_code, endpoint, cost, request_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.account_id,
                    record.plan_code,
                    record.endpoint,
                    record.cost,
                    record.request_id,
                    record.created_at
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Request count and summed cost of every recorded request.
    pub async fn usage_totals(&self, account_id: AccountId) -> Result<(u64, i64), StoreError> {
        self.call(move |conn| {
            let (count, cost): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(cost), 0) FROM usage_records WHERE account_id = ?1",
                [account_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok((u64::try_from(count).unwrap_or_default(), cost))
        })
        .await
    }

    pub async fn usage_records(&self, account_id: AccountId) -> Result<Vec<UsageRecord>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT account_id, plan_code, endpoint, cost, request_id, created_at
                 FROM usage_records WHERE account_id = ?1 ORDER BY record_id",
            )?;
            let rows = stmt.query_map([account_id], |row| {
                Ok(UsageRecord {
                    account_id: row.get(0)?,
                    plan_code: row.get(1)?,
                    endpoint: row.get(2)?,
                    cost: row.get(3)?,
                    request_id: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }
}

#[derive(Clone)]
pub struct UsageRecorder {
    store: SqliteStore,
    clock: Arc<dyn Clock>,
    background: BackgroundTasks,
    timeout: Duration,
}

impl UsageRecorder {
    pub fn new(ctx: &Context) -> Self {
        Self {
            store: ctx.store.clone(),
            clock: ctx.clock.clone(),
            background: ctx.background.clone(),
            timeout: ctx.store_timeout,
        }
    }

    /// Schedule the append and return immediately.
    pub fn record(
        &self,
        account_id: AccountId,
        plan_code: Option<String>,
        endpoint: &str,
        cost: i64,
        request_id: &str,
    ) {
        let record = UsageRecord {
            account_id,
            plan_code,
            endpoint: endpoint.to_string(),
            cost,
            request_id: request_id.to_string(),
            created_at: self.clock.unix_secs(),
        };
        let store = self.store.clone();
        self.background
            .spawn("usage append", async move { store.append_usage(record).await });
    }

    /// Read-only summary for an already authenticated account. An account
    /// without a plan still gets a report.
    pub async fn report(&self, account: &Account) -> Result<UsageReport, AdmissionError> {
        let id = account.account_id;
        let plan = bounded(Stage::Usage, self.timeout, self.store.flagged_subscription(id)).await?;
        let (request_count, total_cost) =
            bounded(Stage::Usage, self.timeout, self.store.usage_totals(id)).await?;

        let mut report = UsageReport {
            account_id: id,
            balance: account.balance,
            plan_code: None,
            plan_name: None,
            rate_limit: None,
            request_count,
            total_cost,
            plan_expires_at: None,
        };
        if let Some(active) = plan {
            report.plan_expires_at = active
                .subscription
                .expires_at
                .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
                .map(|at| at.format(EXPIRY_FORMAT).to_string());
            report.plan_code = Some(active.plan.code);
            report.plan_name = Some(active.plan.name);
            report.rate_limit = active.plan.rate_limit;
        }
        Ok(report)
    }
}
