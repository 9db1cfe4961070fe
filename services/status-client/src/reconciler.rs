//! Canonical subscription state.
//!
//! The reconciler is the only writer of [`SubscriptionStatus`]. It turns
//! verification results into that status and publishes
//! `subscription_updated` / `usage_updated` only when something actually
//! changed. Verification failures never clear the cache: a failed check keeps
//! the last known status and reports the failure instead.
//!
//! Verifications may overlap. Each one takes a ticket before calling the
//! verifier, and a result is dropped if a later-issued verification has
//! already been applied. Events leave in the same order as the state changes
//! that produced them. Listeners may read the reconciler but must not feed
//! counters back into it from inside a callback.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sc_protocol::{
    SubscriptionStatus, SubscriptionType, UsageCounters, UsageStats, VerifyReceiptResponse,
    receipt_status,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bus::StatusBus;
use crate::events::StatusEvent;
use crate::verifier::{ReceiptVerifier, VerifierError, VerifyOptions};

pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum VerificationState {
    Unverified,
    Verified {
        at: DateTime<Utc>,
    },
    Failed {
        error: String,
        /// Status still in effect after the failure.
        retained: Option<SubscriptionStatus>,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("verification timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Verifier(#[from] VerifierError),
    #[error("receipt rejected with status {0}")]
    Rejected(i64),
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Recognized product ids.
    pub products: HashMap<String, SubscriptionType>,
    pub options: VerifyOptions,
    pub timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            products: HashMap::new(),
            options: VerifyOptions::default(),
            timeout: DEFAULT_VERIFY_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Changed,
    Unchanged,
    /// A later-issued verification was applied first; this result was dropped.
    Superseded,
}

#[derive(Debug)]
struct State {
    current: Option<SubscriptionStatus>,
    counters: Option<UsageCounters>,
    usage: Option<UsageStats>,
    verification: VerificationState,
    /// Last ticket handed out.
    issued: u64,
    /// Ticket of the newest applied verification result.
    applied: u64,
}

pub struct SubscriptionReconciler<V> {
    verifier: V,
    config: ReconcilerConfig,
    bus: StatusBus,
    state: Mutex<State>,
    /// Serializes mutate-then-publish. Always taken before `state`.
    publish_gate: Mutex<()>,
}

impl<V: ReceiptVerifier> SubscriptionReconciler<V> {
    pub fn new(verifier: V, config: ReconcilerConfig, bus: StatusBus) -> Self {
        Self {
            verifier,
            config,
            bus,
            state: Mutex::new(State {
                current: None,
                counters: None,
                usage: None,
                verification: VerificationState::Unverified,
                issued: 0,
                applied: 0,
            }),
            publish_gate: Mutex::new(()),
        }
    }

    pub async fn reconcile(&self, receipt: &str) -> Result<ReconcileOutcome, VerificationError> {
        self.reconcile_at(receipt, Utc::now()).await
    }

    /// Verify `receipt` and fold the result into the cached status, judging
    /// expiry against `now`.
    pub async fn reconcile_at(
        &self,
        receipt: &str,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, VerificationError> {
        let ticket = {
            let mut state = self.lock();
            state.issued += 1;
            state.issued
        };
        let verified = tokio::time::timeout(
            self.config.timeout,
            self.verifier.verify_receipt(receipt, &self.config.options),
        )
        .await;

        let response = match verified {
            Err(_) => Err(VerificationError::Timeout(self.config.timeout)),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(response)) if !receipt_status::is_authoritative(response.status) => {
                Err(VerificationError::Rejected(response.status))
            }
            Ok(Ok(response)) => Ok(response),
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                self.record_failure(&e, ticket, now);
                return Err(e);
            }
        };

        let status = derive_status(&response, &self.config.products, now);
        let _gate = self.gate();
        let (events, outcome) = {
            let mut state = self.lock();
            if ticket < state.applied {
                debug!(ticket, applied = state.applied, "dropping superseded verification result");
                return Ok(ReconcileOutcome::Superseded);
            }
            state.applied = ticket;
            state.verification = VerificationState::Verified { at: now };
            if state.current.as_ref() == Some(&status) {
                (Vec::new(), ReconcileOutcome::Unchanged)
            } else {
                info!(
                    subscribed = status.is_subscribed,
                    kind = ?status.subscription_type,
                    expiry = ?status.expiry_date,
                    "subscription status changed"
                );
                state.current = Some(status.clone());
                let mut events = vec![StatusEvent::SubscriptionUpdated { status }];
                events.extend(refresh_usage(&mut state));
                (events, ReconcileOutcome::Changed)
            }
        };

        if outcome == ReconcileOutcome::Unchanged {
            debug!("subscription status unchanged");
        }
        // Publish with the state lock released; listeners may read back.
        for event in events {
            self.bus.publish(event);
        }
        Ok(outcome)
    }

    /// Store server-reported usage counters.
    pub fn apply_usage_counters(&self, counters: UsageCounters) {
        let _gate = self.gate();
        let event = {
            let mut state = self.lock();
            state.counters = Some(counters);
            refresh_usage(&mut state)
        };
        if let Some(event) = event {
            self.bus.publish(event);
        }
    }

    pub fn current(&self) -> Option<SubscriptionStatus> {
        self.lock().current.clone()
    }

    pub fn usage(&self) -> Option<UsageStats> {
        self.lock().usage.clone()
    }

    pub fn verification_state(&self) -> VerificationState {
        self.lock().verification.clone()
    }

    pub fn verifier(&self) -> &V {
        &self.verifier
    }

    fn record_failure(&self, error: &VerificationError, ticket: u64, now: DateTime<Utc>) {
        let _gate = self.gate();
        let retained = {
            let mut state = self.lock();
            if ticket < state.applied {
                debug!(ticket, error = %error, "ignoring failure of superseded verification");
                return;
            }
            let retained = state.current.clone();
            state.verification = VerificationState::Failed {
                error: error.to_string(),
                retained: retained.clone(),
                at: now,
            };
            retained
        };
        warn!(error = %error, retained = ?retained, "receipt verification failed");
        self.bus.publish(StatusEvent::VerificationFailed {
            error: error.to_string(),
            retained,
        });
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn gate(&self) -> MutexGuard<'_, ()> {
        self.publish_gate.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<V> std::fmt::Debug for SubscriptionReconciler<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionReconciler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Recompute usage from the cached status and counters. Returns the event to
/// publish when the derived value changed.
fn refresh_usage(state: &mut State) -> Option<StatusEvent> {
    let counters = state.counters.as_ref()?;
    let subscription = state.current.clone().unwrap_or_default();
    let usage = UsageStats::derive(&subscription, counters);
    if state.usage.as_ref() == Some(&usage) {
        return None;
    }
    state.usage = Some(usage.clone());
    Some(StatusEvent::UsageUpdated { usage })
}

/// Map an authoritative verification response to a subscription status.
///
/// Only records whose product id is in `products` count. The one with the
/// latest expiry wins; the receipt is active when that expiry is after `now`
/// and the response status is `0`.
pub fn derive_status(
    response: &VerifyReceiptResponse,
    products: &HashMap<String, SubscriptionType>,
    now: DateTime<Utc>,
) -> SubscriptionStatus {
    let latest = response
        .latest_receipt_info
        .iter()
        .flatten()
        .filter_map(|record| {
            let kind = products.get(&record.product_id)?;
            Some((*kind, record.expires_at()?))
        })
        .max_by_key(|(_, expiry)| *expiry);

    let Some((kind, expiry)) = latest else {
        return SubscriptionStatus::unsubscribed();
    };
    let is_subscribed = response.status == receipt_status::OK && expiry > now;
    SubscriptionStatus {
        is_subscribed,
        subscription_type: is_subscribed.then_some(kind),
        expiry_date: Some(expiry),
    }
}
