//! Admission properties against a real SQLite database.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use gateway::billing::BillingEngine;
use gateway::clock::ManualClock;
use gateway::context::Context;
use gateway::counter::MemoryCounterStore;
use gateway::credentials::CredentialVerifier;
use gateway::error::AdmissionError;
use gateway::model::{AccountId, Identity, Plan};
use gateway::pipeline::{AdmissionPipeline, Caller};
use gateway::store::SqliteStore;
use tempfile::TempDir;

const START: i64 = 1_700_000_040;

struct Harness {
    _dir: TempDir,
    ctx: Context,
    clock: Arc<ManualClock>,
    account_id: AccountId,
}

impl Harness {
    async fn new(rate_limit: Option<u32>, price: Option<i64>, balance: i64) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("gateway.sqlite"));
        store.init().await.unwrap();

        let account = store
            .get_or_create_account(
                Identity {
                    external_id: "oauth|1".into(),
                    email: "dev@example.com".into(),
                    display_name: Some("Dev".into()),
                },
                START,
            )
            .await
            .unwrap();
        store
            .upsert_plan(
                Plan {
                    code: "pro".into(),
                    name: "Pro".into(),
                    rate_limit,
                    price,
                },
                START,
            )
            .await
            .unwrap();
        store
            .subscribe(account.account_id, "pro", START, None)
            .await
            .unwrap();
        if balance > 0 {
            store
                .credit(account.account_id, balance, "initial", "initial funds", START)
                .await
                .unwrap();
        }

        let clock = Arc::new(ManualClock::at(START));
        let ctx = Context::new(store)
            .with_clock(clock.clone())
            .with_counters(Arc::new(MemoryCounterStore::new()))
            .with_rate_window(Duration::from_secs(60));
        Self {
            _dir: dir,
            ctx,
            clock,
            account_id: account.account_id,
        }
    }

    async fn balance(&self) -> i64 {
        self.ctx
            .store
            .account(self.account_id)
            .await
            .unwrap()
            .unwrap()
            .balance
    }

    async fn debit_count(&self) -> usize {
        self.ctx
            .store
            .ledger_entries(self.account_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.amount < 0)
            .count()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicates_bill_exactly_once() {
    let h = Harness::new(None, Some(30), 100).await;
    let engine = BillingEngine::new(&h.ctx);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = engine.clone();
        let account_id = h.account_id;
        handles.push(tokio::spawn(async move {
            engine.charge(account_id, "pro", "same-request").await
        }));
    }

    let mut charges = Vec::new();
    for handle in handles {
        charges.push(handle.await.unwrap().unwrap());
    }
    charges.sort_unstable();

    assert_eq!(charges.iter().filter(|c| **c == 30).count(), 1);
    assert_eq!(charges.iter().filter(|c| **c == 0).count(), 15);
    assert_eq!(h.balance().await, 70);
    assert_eq!(h.debit_count().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_debits_never_overdraw() {
    let h = Harness::new(None, Some(30), 100).await;
    let engine = BillingEngine::new(&h.ctx);

    let mut handles = Vec::new();
    for i in 0..10 {
        let engine = engine.clone();
        let account_id = h.account_id;
        handles.push(tokio::spawn(async move {
            engine.charge(account_id, "pro", &format!("req-{i}")).await
        }));
    }

    let mut charged = 0;
    let mut refused = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(30) => charged += 1,
            Err(AdmissionError::InsufficientBalance { .. }) => refused += 1,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert_eq!(charged, 3);
    assert_eq!(refused, 7);
    assert_eq!(h.balance().await, 10);
}

#[tokio::test]
async fn sequential_requests_drain_balance() {
    let h = Harness::new(None, Some(30), 100).await;
    let pipeline = AdmissionPipeline::new(&h.ctx);
    let caller = Caller::Account(h.account_id);

    for key in ["r1", "r2", "r3"] {
        let admission = pipeline.admit(caller, key, "/api/request").await.unwrap();
        assert_eq!(admission.cost, 30);
    }
    assert_eq!(h.balance().await, 10);

    let err = pipeline.admit(caller, "r4", "/api/request").await.unwrap_err();
    assert!(matches!(
        err,
        AdmissionError::InsufficientBalance {
            balance: 10,
            price: 30
        }
    ));
    assert_eq!(h.balance().await, 10);

    // A retry of an already billed request is admitted for free.
    assert_eq!(
        pipeline.admit(caller, "r2", "/api/request").await.unwrap().cost,
        0
    );
    assert_eq!(h.balance().await, 10);
}

#[tokio::test]
async fn rate_limit_rolls_over_with_the_window() {
    let h = Harness::new(Some(3), None, 0).await;
    let pipeline = AdmissionPipeline::new(&h.ctx);
    let caller = Caller::Account(h.account_id);

    for i in 0..3 {
        pipeline
            .admit(caller, &format!("a{i}"), "/api/request")
            .await
            .unwrap();
    }
    let err = pipeline.admit(caller, "a3", "/api/request").await.unwrap_err();
    assert!(matches!(
        err,
        AdmissionError::RateLimitExceeded {
            ceiling: 3,
            window_secs: 60
        }
    ));

    h.clock.advance(TimeDelta::seconds(60));
    let admission = pipeline.admit(caller, "b0", "/api/request").await.unwrap();
    assert_eq!(admission.rate.used, 1);
}

#[tokio::test]
async fn rotation_cuts_off_the_old_key_immediately() {
    let h = Harness::new(None, None, 0).await;
    let verifier = CredentialVerifier::new(&h.ctx);
    let pipeline = AdmissionPipeline::new(&h.ctx);

    let old = verifier.rotate(h.account_id).await.unwrap();
    pipeline
        .admit(Caller::RawKey(old.reveal()), "k1", "/api/request")
        .await
        .unwrap();

    let new = verifier.rotate(h.account_id).await.unwrap();
    assert!(matches!(
        pipeline
            .admit(Caller::RawKey(old.reveal()), "k2", "/api/request")
            .await,
        Err(AdmissionError::Unauthorized)
    ));
    pipeline
        .admit(Caller::RawKey(new.reveal()), "k3", "/api/request")
        .await
        .unwrap();
}

#[tokio::test]
async fn expired_subscription_with_active_flag_is_rejected() {
    let h = Harness::new(None, None, 0).await;
    h.ctx
        .store
        .subscribe(h.account_id, "pro", START - 100, Some(START - 1))
        .await
        .unwrap();

    let pipeline = AdmissionPipeline::new(&h.ctx);
    let err = pipeline
        .admit(Caller::Account(h.account_id), "x", "/api/request")
        .await
        .unwrap_err();
    assert!(matches!(err, AdmissionError::PlanExpired));
    assert_eq!(err.http_status(), 403);
}

#[tokio::test]
async fn free_plan_writes_no_ledger_entry() {
    let h = Harness::new(None, None, 0).await;
    let pipeline = AdmissionPipeline::new(&h.ctx);

    let admission = pipeline
        .admit(Caller::Account(h.account_id), "free", "/api/request")
        .await
        .unwrap();
    assert_eq!(admission.cost, 0);
    assert!(h.ctx.store.ledger_entries(h.account_id).await.unwrap().is_empty());

    h.ctx.background.drain().await;
    let records = h.ctx.store.usage_records(h.account_id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].cost, 0);
}
