/// Integration tests for subscription reconciliation.
///
/// Drives the reconciler with a scripted in-process verifier and records
/// what it publishes on the bus.
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sc_protocol::{
    ReceiptRecord, SubscriptionStatus, SubscriptionType, UsageCounters, VerifyReceiptResponse,
};
use status_client::bus::{StatusBus, SubscriptionHandle};
use status_client::events::{EventName, StatusEvent};
use status_client::reconciler::{
    ReconcileOutcome, ReconcilerConfig, SubscriptionReconciler, VerificationError,
    VerificationState,
};
use status_client::verifier::{ReceiptVerifier, VerifierError, VerifyOptions};

// ---------------------------------------------------------------------------
// Scripted verifier
// ---------------------------------------------------------------------------

enum Scripted {
    Respond(VerifyReceiptResponse),
    Fail(VerifierError),
    Hang,
    Delayed(Duration, Box<Scripted>),
}

#[derive(Clone, Default)]
struct ScriptedVerifier {
    script: Arc<Mutex<VecDeque<Scripted>>>,
    calls: Arc<Mutex<Vec<(String, bool)>>>,
}

impl ScriptedVerifier {
    fn push(&self, step: Scripted) {
        self.script.lock().unwrap().push_back(step);
    }
}

impl ReceiptVerifier for ScriptedVerifier {
    async fn verify_receipt(
        &self,
        receipt: &str,
        options: &VerifyOptions,
    ) -> Result<VerifyReceiptResponse, VerifierError> {
        self.calls
            .lock()
            .unwrap()
            .push((receipt.to_owned(), options.exclude_sandbox));
        let mut step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .expect("verifier called more often than scripted");
        while let Scripted::Delayed(delay, next) = step {
            tokio::time::sleep(delay).await;
            step = *next;
        }
        match step {
            Scripted::Respond(response) => Ok(response),
            Scripted::Fail(e) => Err(e),
            Scripted::Hang => std::future::pending().await,
            Scripted::Delayed(..) => unreachable!("delays are unwrapped above"),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn at(ts: &str) -> DateTime<Utc> {
    ts.parse().unwrap()
}

fn monthly_until(expires: &str) -> ReceiptRecord {
    let expires = at(expires).timestamp_millis();
    ReceiptRecord {
        product_id: "com.example.pro.monthly".to_owned(),
        transaction_id: "1000000000000001".to_owned(),
        purchase_date_ms: expires - 30 * 24 * 3600 * 1000,
        expires_date_ms: Some(expires),
    }
}

fn response(status: i64, records: Vec<ReceiptRecord>) -> VerifyReceiptResponse {
    VerifyReceiptResponse {
        status,
        environment: None,
        latest_receipt_info: Some(records),
    }
}

fn config() -> ReconcilerConfig {
    ReconcilerConfig {
        products: HashMap::from([
            (
                "com.example.pro.monthly".to_owned(),
                SubscriptionType::Monthly,
            ),
            ("com.example.pro.annual".to_owned(), SubscriptionType::Annual),
        ]),
        ..ReconcilerConfig::default()
    }
}

struct Harness {
    verifier: ScriptedVerifier,
    reconciler: SubscriptionReconciler<ScriptedVerifier>,
    events: Arc<Mutex<Vec<StatusEvent>>>,
    _handles: Vec<SubscriptionHandle>,
}

fn harness() -> Harness {
    let bus = StatusBus::new();
    let events: Arc<Mutex<Vec<StatusEvent>>> = Arc::default();
    let handles: Vec<SubscriptionHandle> = [
        EventName::SubscriptionUpdated,
        EventName::UsageUpdated,
        EventName::VerificationFailed,
    ]
    .into_iter()
    .map(|name| {
        let sink = Arc::clone(&events);
        bus.subscribe(name, move |event| {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        })
    })
    .collect();
    let verifier = ScriptedVerifier::default();
    let reconciler = SubscriptionReconciler::new(verifier.clone(), config(), bus);
    Harness {
        verifier,
        reconciler,
        events,
        _handles: handles,
    }
}

impl Harness {
    fn event_names(&self) -> Vec<EventName> {
        self.events.lock().unwrap().iter().map(StatusEvent::name).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn active_receipt_before_expiry_is_subscribed() {
    let h = harness();
    h.verifier
        .push(Scripted::Respond(response(0, vec![monthly_until("2025-01-01T00:00:00Z")])));

    let outcome = h
        .reconciler
        .reconcile_at("receipt-blob", at("2024-12-15T00:00:00Z"))
        .await
        .unwrap();

    assert_eq!(outcome, ReconcileOutcome::Changed);
    let status = h.reconciler.current().unwrap();
    assert!(status.is_subscribed);
    assert_eq!(status.subscription_type, Some(SubscriptionType::Monthly));
    assert_eq!(status.expiry_date, Some(at("2025-01-01T00:00:00Z")));
    assert_eq!(
        h.reconciler.verification_state(),
        VerificationState::Verified {
            at: at("2024-12-15T00:00:00Z")
        }
    );
    assert_eq!(h.event_names(), vec![EventName::SubscriptionUpdated]);
}

#[tokio::test(start_paused = true)]
async fn timeout_keeps_cached_status() {
    let h = harness();
    h.verifier
        .push(Scripted::Respond(response(0, vec![monthly_until("2025-01-01T00:00:00Z")])));
    h.verifier.push(Scripted::Hang);
    let now = at("2024-12-15T00:00:00Z");

    h.reconciler.reconcile_at("receipt-blob", now).await.unwrap();
    let before = h.reconciler.current();

    let err = h
        .reconciler
        .reconcile_at("receipt-blob", now)
        .await
        .unwrap_err();
    assert!(matches!(err, VerificationError::Timeout(_)));
    assert_eq!(h.reconciler.current(), before);

    match h.reconciler.verification_state() {
        VerificationState::Failed { retained, .. } => assert_eq!(retained, before),
        other => panic!("expected failed state, got {other:?}"),
    }
    let events = h.events.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[1],
        StatusEvent::VerificationFailed { retained, .. } if *retained == before
    ));
}

#[tokio::test]
async fn identical_result_publishes_nothing() {
    let h = harness();
    let now = at("2024-12-15T00:00:00Z");
    for _ in 0..3 {
        h.verifier
            .push(Scripted::Respond(response(0, vec![monthly_until("2025-01-01T00:00:00Z")])));
    }

    assert_eq!(
        h.reconciler.reconcile_at("r", now).await.unwrap(),
        ReconcileOutcome::Changed
    );
    assert_eq!(
        h.reconciler.reconcile_at("r", now).await.unwrap(),
        ReconcileOutcome::Unchanged
    );
    assert_eq!(
        h.reconciler.reconcile_at("r", now).await.unwrap(),
        ReconcileOutcome::Unchanged
    );
    assert_eq!(h.event_names(), vec![EventName::SubscriptionUpdated]);
}

#[tokio::test]
async fn expired_status_code_unsubscribes() {
    let h = harness();
    let now = at("2024-12-15T00:00:00Z");
    h.verifier
        .push(Scripted::Respond(response(0, vec![monthly_until("2025-01-01T00:00:00Z")])));
    h.verifier.push(Scripted::Respond(response(
        21006,
        vec![monthly_until("2025-01-01T00:00:00Z")],
    )));

    h.reconciler.reconcile_at("r", now).await.unwrap();
    h.reconciler.reconcile_at("r", now).await.unwrap();

    let status = h.reconciler.current().unwrap();
    assert!(!status.is_subscribed);
    assert_eq!(status.subscription_type, None);
    assert_eq!(
        h.event_names(),
        vec![EventName::SubscriptionUpdated, EventName::SubscriptionUpdated]
    );
}

#[tokio::test]
async fn no_recognized_product_fails_closed() {
    let h = harness();
    let mut record = monthly_until("2030-01-01T00:00:00Z");
    record.product_id = "com.other.app".to_owned();
    h.verifier.push(Scripted::Respond(response(0, vec![record])));

    h.reconciler
        .reconcile_at("r", at("2024-12-15T00:00:00Z"))
        .await
        .unwrap();
    assert_eq!(
        h.reconciler.current(),
        Some(SubscriptionStatus::unsubscribed())
    );
}

#[tokio::test]
async fn rejected_receipt_is_not_authoritative() {
    let h = harness();
    h.verifier.push(Scripted::Respond(response(21002, vec![])));

    let err = h
        .reconciler
        .reconcile_at("r", at("2024-12-15T00:00:00Z"))
        .await
        .unwrap_err();
    assert!(matches!(err, VerificationError::Rejected(21002)));
    assert_eq!(h.reconciler.current(), None);
    assert_eq!(h.event_names(), vec![EventName::VerificationFailed]);
}

#[tokio::test]
async fn transport_failure_is_reported() {
    let h = harness();
    h.verifier.push(Scripted::Fail(VerifierError::Transport(
        "connection refused".to_owned(),
    )));

    let err = h.reconciler.reconcile("r").await.unwrap_err();
    assert!(matches!(
        err,
        VerificationError::Verifier(VerifierError::Transport(_))
    ));
    assert!(matches!(
        h.reconciler.verification_state(),
        VerificationState::Failed { retained: None, .. }
    ));
    assert_eq!(h.verifier.calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn usage_follows_subscription_changes() {
    let h = harness();
    h.reconciler.apply_usage_counters(UsageCounters {
        current_usage: 2,
        limit: 3,
        reset_date: None,
    });
    let usage = h.reconciler.usage().unwrap();
    assert_eq!(usage.limit, Some(3));
    assert_eq!(usage.remaining_conversations, Some(1));

    h.verifier
        .push(Scripted::Respond(response(0, vec![monthly_until("2025-01-01T00:00:00Z")])));
    h.reconciler
        .reconcile_at("r", at("2024-12-15T00:00:00Z"))
        .await
        .unwrap();

    let usage = h.reconciler.usage().unwrap();
    assert!(usage.is_subscribed);
    assert_eq!(usage.limit, None);
    assert_eq!(usage.remaining_conversations, None);
    assert_eq!(
        h.event_names(),
        vec![
            EventName::UsageUpdated,
            EventName::SubscriptionUpdated,
            EventName::UsageUpdated,
        ]
    );
}

#[tokio::test]
async fn repeated_counters_publish_once() {
    let h = harness();
    let counters = UsageCounters {
        current_usage: 5,
        limit: 3,
        reset_date: Some(at("2025-01-01T00:00:00Z")),
    };
    h.reconciler.apply_usage_counters(counters.clone());
    h.reconciler.apply_usage_counters(counters);

    let usage = h.reconciler.usage().unwrap();
    assert_eq!(usage.remaining_conversations, Some(0));
    assert_eq!(h.event_names(), vec![EventName::UsageUpdated]);
}

// ---------------------------------------------------------------------------
// Overlapping verifications
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn slow_older_result_does_not_overwrite_newer_one() {
    let h = harness();
    let now = at("2024-12-15T00:00:00Z");
    h.verifier.push(Scripted::Delayed(
        Duration::from_millis(200),
        Box::new(Scripted::Respond(response(
            0,
            vec![monthly_until("2024-12-01T00:00:00Z")],
        ))),
    ));
    h.verifier
        .push(Scripted::Respond(response(0, vec![monthly_until("2025-01-01T00:00:00Z")])));

    let (older, newer) = tokio::join!(h.reconciler.reconcile_at("r", now), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let outcome = h.reconciler.reconcile_at("r", now).await;
        assert!(h.reconciler.current().unwrap().is_subscribed);
        outcome
    });

    assert_eq!(newer.unwrap(), ReconcileOutcome::Changed);
    assert_eq!(older.unwrap(), ReconcileOutcome::Superseded);
    let status = h.reconciler.current().unwrap();
    assert!(status.is_subscribed);
    assert_eq!(status.expiry_date, Some(at("2025-01-01T00:00:00Z")));
    assert_eq!(h.event_names(), vec![EventName::SubscriptionUpdated]);
}

#[tokio::test(start_paused = true)]
async fn late_failure_of_older_verification_is_ignored() {
    let h = harness();
    let now = at("2024-12-15T00:00:00Z");
    h.verifier.push(Scripted::Delayed(
        Duration::from_millis(200),
        Box::new(Scripted::Fail(VerifierError::Http(503))),
    ));
    h.verifier
        .push(Scripted::Respond(response(0, vec![monthly_until("2025-01-01T00:00:00Z")])));

    let (older, newer) = tokio::join!(h.reconciler.reconcile_at("r", now), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.reconciler.reconcile_at("r", now).await
    });

    assert_eq!(newer.unwrap(), ReconcileOutcome::Changed);
    assert!(matches!(
        older,
        Err(VerificationError::Verifier(VerifierError::Http(503)))
    ));
    assert_eq!(
        h.reconciler.verification_state(),
        VerificationState::Verified { at: now }
    );
    assert_eq!(h.event_names(), vec![EventName::SubscriptionUpdated]);
}
