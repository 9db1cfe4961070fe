//! Glue between the inbound envelope stream, the reconciler and the bus.

use std::sync::Arc;

use sc_protocol::{EnvelopeType, MessageEnvelope};
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::bus::{StatusBus, SubscriptionHandle};
use crate::connection::{EnvelopeStream, wait_for_shutdown};
use crate::events::{EventName, StatusEvent};
use crate::reconciler::SubscriptionReconciler;
use crate::verifier::ReceiptVerifier;

/// Routes subscription and usage envelopes to the reconciler.
pub struct EnvelopeDispatcher<V> {
    reconciler: Arc<SubscriptionReconciler<V>>,
    receipt: Option<String>,
}

impl<V: ReceiptVerifier> EnvelopeDispatcher<V> {
    pub fn new(reconciler: Arc<SubscriptionReconciler<V>>, receipt: Option<String>) -> Self {
        Self {
            reconciler,
            receipt,
        }
    }

    pub async fn handle(&self, envelope: &MessageEnvelope) {
        match envelope.envelope_type() {
            Some(EnvelopeType::SubscriptionUpdated) => {
                let Some(receipt) = self.receipt.as_deref() else {
                    debug!("subscription update ignored: no receipt configured");
                    return;
                };
                info!("server reported subscription change; re-verifying");
                // Failures are published on the bus by the reconciler.
                let _ = self.reconciler.reconcile(receipt).await;
            }
            Some(EnvelopeType::UsageUpdated) => match envelope.usage_counters() {
                Ok(counters) => self.reconciler.apply_usage_counters(counters),
                Err(e) => warn!(error = %e, "discarding usage update"),
            },
            _ => {}
        }
    }

    pub async fn run(&self, mut stream: EnvelopeStream, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                () = wait_for_shutdown(&mut shutdown) => break,
                next = stream.next() => match next {
                    Some(envelope) => self.handle(&envelope).await,
                    None => break,
                },
            }
        }
        debug!("envelope dispatcher stopped");
    }
}

/// Log every bus event. Returns the handles; dropping them stops logging.
pub fn register_logging_listeners(bus: &StatusBus) -> Vec<SubscriptionHandle> {
    vec![
        bus.subscribe(EventName::Connected, |event| {
            if let StatusEvent::Connected { url } = event {
                info!(url = %url, "connected");
            }
            Ok(())
        }),
        bus.subscribe(EventName::Reconnecting, |event| {
            if let StatusEvent::Reconnecting { attempt, delay_ms } = event {
                info!(attempt, delay_ms, "reconnecting");
            }
            Ok(())
        }),
        bus.subscribe(EventName::Disconnected, |event| {
            if let StatusEvent::Disconnected { reason } = event {
                warn!(reason = %reason, "disconnected");
            }
            Ok(())
        }),
        bus.subscribe(EventName::Closed, |event| {
            if let StatusEvent::Closed { reason, error } = event {
                info!(reason = ?reason, error = ?error, "closed");
            }
            Ok(())
        }),
        bus.subscribe(EventName::ConversationStatus, |event| {
            if let StatusEvent::ConversationStatus {
                conversation_id,
                status,
            } = event
            {
                info!(
                    conversation_id = %conversation_id,
                    status = ?status.status,
                    progress = ?status.progress,
                    error = ?status.error,
                    "conversation status"
                );
            }
            Ok(())
        }),
        bus.subscribe(EventName::SubscriptionUpdated, |event| {
            if let StatusEvent::SubscriptionUpdated { status } = event {
                info!(
                    subscribed = status.is_subscribed,
                    kind = ?status.subscription_type,
                    expiry = ?status.expiry_date,
                    "subscription"
                );
            }
            Ok(())
        }),
        bus.subscribe(EventName::UsageUpdated, |event| {
            if let StatusEvent::UsageUpdated { usage } = event {
                info!(
                    current = usage.current_usage,
                    limit = ?usage.limit,
                    remaining = ?usage.remaining_conversations,
                    "usage"
                );
            }
            Ok(())
        }),
        bus.subscribe(EventName::VerificationFailed, |event| {
            if let StatusEvent::VerificationFailed { error, .. } = event {
                warn!(error = %error, "verification failed");
            }
            Ok(())
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::ReconcilerConfig;
    use crate::verifier::{VerifierError, VerifyOptions};
    use sc_protocol::VerifyReceiptResponse;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingVerifier {
        calls: AtomicUsize,
    }

    impl ReceiptVerifier for CountingVerifier {
        async fn verify_receipt(
            &self,
            _receipt: &str,
            _options: &VerifyOptions,
        ) -> Result<VerifyReceiptResponse, VerifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(VerifyReceiptResponse {
                status: 0,
                environment: None,
                latest_receipt_info: None,
            })
        }
    }

    fn dispatcher(receipt: Option<&str>) -> EnvelopeDispatcher<CountingVerifier> {
        let reconciler = Arc::new(SubscriptionReconciler::new(
            CountingVerifier::default(),
            ReconcilerConfig::default(),
            StatusBus::new(),
        ));
        EnvelopeDispatcher::new(reconciler, receipt.map(str::to_owned))
    }

    fn calls(d: &EnvelopeDispatcher<CountingVerifier>) -> usize {
        d.reconciler.verifier().calls.load(Ordering::SeqCst)
    }

    fn envelope(kind: EnvelopeType, payload: serde_json::Value) -> MessageEnvelope {
        let serde_json::Value::Object(map) = payload else {
            unreachable!()
        };
        MessageEnvelope::new(kind, map)
    }

    #[tokio::test]
    async fn subscription_update_triggers_reverification() {
        let d = dispatcher(Some("receipt"));
        d.handle(&envelope(EnvelopeType::SubscriptionUpdated, serde_json::json!({})))
            .await;
        assert_eq!(calls(&d), 1);
        assert!(d.reconciler.current().is_some());
    }

    #[tokio::test]
    async fn subscription_update_without_receipt_is_ignored() {
        let d = dispatcher(None);
        d.handle(&envelope(EnvelopeType::SubscriptionUpdated, serde_json::json!({})))
            .await;
        assert_eq!(calls(&d), 0);
    }

    #[tokio::test]
    async fn usage_update_applies_counters() {
        let d = dispatcher(None);
        d.handle(&envelope(
            EnvelopeType::UsageUpdated,
            serde_json::json!({ "currentUsage": 1, "limit": 3 }),
        ))
        .await;
        let usage = d.reconciler.usage().unwrap();
        assert_eq!(usage.remaining_conversations, Some(2));
    }

    #[tokio::test]
    async fn malformed_usage_update_is_dropped() {
        let d = dispatcher(None);
        d.handle(&envelope(
            EnvelopeType::UsageUpdated,
            serde_json::json!({ "currentUsage": "lots" }),
        ))
        .await;
        assert!(d.reconciler.usage().is_none());
    }
}
