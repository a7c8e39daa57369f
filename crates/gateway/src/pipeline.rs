//! The admission pipeline.
//!
//! Stages run strictly in order and the first rejection short-circuits the
//! rest: credential, account lock, plan, rate limit, billing. The usage record
//! is scheduled only after billing has committed.

use std::time::Duration;

use crate::billing::BillingEngine;
use crate::context::Context;
use crate::credentials::CredentialVerifier;
use crate::error::{AdmissionError, Stage, bounded};
use crate::model::{Account, AccountId};
use crate::plans::PlanResolver;
use crate::ratelimit::{RateLimiter, RateStatus};
use crate::store::SqliteStore;
use crate::usage::UsageRecorder;

/// Who is calling: a raw key still to be verified, or an account already
/// resolved by an earlier layer.
#[derive(Debug, Clone, Copy)]
pub enum Caller<'a> {
    RawKey(&'a str),
    Account(AccountId),
}

/// An admitted request.
#[derive(Debug, Clone)]
pub struct Admission {
    pub account_id: AccountId,
    pub plan_code: String,
    /// Zero for free plans and replayed idempotency keys.
    pub cost: i64,
    pub rate: RateStatus,
    pub idempotency_key: String,
}

#[derive(Clone)]
pub struct AdmissionPipeline {
    store: SqliteStore,
    timeout: Duration,
    verifier: CredentialVerifier,
    plans: PlanResolver,
    limiter: RateLimiter,
    billing: BillingEngine,
    usage: UsageRecorder,
}

impl AdmissionPipeline {
    pub fn new(ctx: &Context) -> Self {
        Self {
            store: ctx.store.clone(),
            timeout: ctx.store_timeout,
            verifier: CredentialVerifier::new(ctx),
            plans: PlanResolver::new(ctx),
            limiter: RateLimiter::new(ctx),
            billing: BillingEngine::new(ctx),
            usage: UsageRecorder::new(ctx),
        }
    }

    pub fn verifier(&self) -> &CredentialVerifier {
        &self.verifier
    }

    pub fn usage(&self) -> &UsageRecorder {
        &self.usage
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Verify a raw key and load its unlocked account.
    pub async fn authenticate(&self, raw_key: &str) -> Result<Account, AdmissionError> {
        let account_id = self.verifier.verify(raw_key).await?;
        self.load_unlocked(account_id).await
    }

    async fn load_unlocked(&self, account_id: AccountId) -> Result<Account, AdmissionError> {
        let account = bounded(Stage::Account, self.timeout, self.store.account(account_id))
            .await?
            .ok_or(AdmissionError::Unauthorized)?;
        if account.locked {
            log::debug!("account {account_id} is locked");
            return Err(AdmissionError::AccountLocked);
        }
        Ok(account)
    }

    /// Run every stage for one request.
    ///
    /// On rejection nothing beyond what already committed is left behind:
    /// a rate-limit increment is kept, a debit is only made by the final stage.
    pub async fn admit(
        &self,
        caller: Caller<'_>,
        idempotency_key: &str,
        endpoint: &str,
    ) -> Result<Admission, AdmissionError> {
        let account = match caller {
            Caller::RawKey(raw) => self.authenticate(raw).await?,
            Caller::Account(account_id) => self.load_unlocked(account_id).await?,
        };
        let account_id = account.account_id;

        let active = self.plans.resolve(account_id).await?;
        let rate = self.limiter.check(account_id, active.plan.rate_limit).await?;
        let cost = self
            .billing
            .charge(account_id, &active.plan.code, idempotency_key)
            .await?;

        self.usage.record(
            account_id,
            Some(active.plan.code.clone()),
            endpoint,
            cost,
            idempotency_key,
        );

        log::debug!("admitted {idempotency_key} for account {account_id} at cost {cost}");
        Ok(Admission {
            account_id,
            plan_code: active.plan.code,
            cost,
            rate,
            idempotency_key: idempotency_key.to_string(),
        })
    }
}
