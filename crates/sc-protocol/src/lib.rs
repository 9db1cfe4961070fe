// sc-protocol: Status channel wire types and serialization.
//
// Every server -> client frame is a JSON `MessageEnvelope` with a `type`
// discriminator, an RFC 3339 `timestamp` and an opaque `payload` object.
// Payload shapes for the known envelope types live here too, along with the
// receipt-verification request/response types consumed by the reconciler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Envelope types
// ---------------------------------------------------------------------------

/// Known `type` values.
pub mod envelope_types {
    pub const CONVERSATION_STATUS: &str = "conversation_status";
    pub const SUBSCRIPTION_UPDATED: &str = "subscription_updated";
    pub const USAGE_UPDATED: &str = "usage_updated";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
}

/// The fixed set of envelope types both ends agree on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    ConversationStatus,
    SubscriptionUpdated,
    UsageUpdated,
    Ping,
    Pong,
}

impl EnvelopeType {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeType::ConversationStatus => envelope_types::CONVERSATION_STATUS,
            EnvelopeType::SubscriptionUpdated => envelope_types::SUBSCRIPTION_UPDATED,
            EnvelopeType::UsageUpdated => envelope_types::USAGE_UPDATED,
            EnvelopeType::Ping => envelope_types::PING,
            EnvelopeType::Pong => envelope_types::PONG,
        }
    }

    /// Returns `None` for types this client does not understand.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            envelope_types::CONVERSATION_STATUS => Some(EnvelopeType::ConversationStatus),
            envelope_types::SUBSCRIPTION_UPDATED => Some(EnvelopeType::SubscriptionUpdated),
            envelope_types::USAGE_UPDATED => Some(EnvelopeType::UsageUpdated),
            envelope_types::PING => Some(EnvelopeType::Ping),
            envelope_types::PONG => Some(EnvelopeType::Pong),
            _ => None,
        }
    }
}

impl std::fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// MessageEnvelope
// ---------------------------------------------------------------------------

/// The wire-level unit of communication.
///
/// ```json
/// { "type": "conversation_status", "timestamp": "2024-06-01T12:00:00Z", "payload": { ... } }
/// ```
///
/// `type` is kept as a raw string so that frames with unknown types still
/// parse and can be discarded with a log instead of failing the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl MessageEnvelope {
    /// Build an envelope stamped with the current time.
    pub fn new(kind: EnvelopeType, payload: Map<String, Value>) -> Self {
        Self::with_timestamp(kind, Utc::now(), payload)
    }

    pub fn with_timestamp(
        kind: EnvelopeType,
        timestamp: DateTime<Utc>,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            kind: kind.as_str().to_owned(),
            timestamp,
            payload,
        }
    }

    /// Build an envelope whose payload is the JSON object form of `payload`.
    pub fn from_payload<T: Serialize>(
        kind: EnvelopeType,
        timestamp: DateTime<Utc>,
        payload: &T,
    ) -> Result<Self, EnvelopeError> {
        match serde_json::to_value(payload)? {
            Value::Object(map) => Ok(Self::with_timestamp(kind, timestamp, map)),
            _ => Err(EnvelopeError::PayloadNotObject(kind.as_str().to_owned())),
        }
    }

    /// Parse and validate a text frame.
    pub fn from_json(text: &str) -> Result<Self, EnvelopeError> {
        let envelope: MessageEnvelope = serde_json::from_str(text)?;
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.kind.trim().is_empty() {
            return Err(EnvelopeError::EmptyType);
        }
        Ok(())
    }

    pub fn envelope_type(&self) -> Option<EnvelopeType> {
        EnvelopeType::parse(&self.kind)
    }

    pub fn is(&self, kind: EnvelopeType) -> bool {
        self.kind == kind.as_str()
    }

    /// Decode the payload of a `conversation_status` envelope.
    pub fn conversation_update(&self) -> Result<ConversationUpdate, EnvelopeError> {
        let update: ConversationUpdate = self.decode_payload()?;
        update.validate()?;
        Ok(update)
    }

    /// Decode the payload of a `usage_updated` envelope.
    pub fn usage_counters(&self) -> Result<UsageCounters, EnvelopeError> {
        self.decode_payload()
    }

    fn decode_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, EnvelopeError> {
        serde_json::from_value(Value::Object(self.payload.clone())).map_err(|source| {
            EnvelopeError::Payload {
                kind: self.kind.clone(),
                source,
            }
        })
    }
}

/// A malformed envelope. Always non-fatal: callers log and discard.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("invalid envelope JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope type is empty")]
    EmptyType,
    #[error("unknown envelope type '{0}'")]
    UnknownType(String),
    #[error("invalid '{kind}' payload: {source}")]
    Payload {
        kind: String,
        source: serde_json::Error,
    },
    #[error("'{0}' payload is not a JSON object")]
    PayloadNotObject(String),
    #[error("progress {0} is outside 0..=100")]
    ProgressOutOfRange(u8),
    #[error("conversationId is empty")]
    EmptyConversationId,
}

// ---------------------------------------------------------------------------
// Conversation status
// ---------------------------------------------------------------------------

/// Server-side processing state of one conversation analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationState {
    Waiting,
    Processing,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationStatus {
    pub status: ConversationState,
    /// Percent complete, 0..=100.
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub error: Option<String>,
    /// Seconds.
    #[serde(default)]
    pub estimated_time_remaining: Option<u64>,
}

impl ConversationStatus {
    pub fn new(status: ConversationState) -> Self {
        Self {
            status,
            progress: None,
            error: None,
            estimated_time_remaining: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            ConversationState::Completed | ConversationState::Error
        )
    }
}

/// Payload of a `conversation_status` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationUpdate {
    pub conversation_id: String,
    #[serde(flatten)]
    pub status: ConversationStatus,
}

impl ConversationUpdate {
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.conversation_id.is_empty() {
            return Err(EnvelopeError::EmptyConversationId);
        }
        match self.status.progress {
            Some(p) if p > 100 => Err(EnvelopeError::ProgressOutOfRange(p)),
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription / usage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionType {
    Monthly,
    Annual,
}

/// Canonical subscription state. Only the reconciler produces these.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatus {
    pub is_subscribed: bool,
    pub subscription_type: Option<SubscriptionType>,
    pub expiry_date: Option<DateTime<Utc>>,
}

impl SubscriptionStatus {
    pub fn unsubscribed() -> Self {
        Self::default()
    }
}

/// Server-reported usage counters (payload of `usage_updated`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageCounters {
    pub current_usage: u32,
    pub limit: u32,
    #[serde(default)]
    pub reset_date: Option<DateTime<Utc>>,
}

/// Read-only usage snapshot derived from subscription state and counters.
///
/// `limit` and `remaining_conversations` are `None` for subscribers, who are
/// not capped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub is_subscribed: bool,
    pub current_usage: u32,
    pub limit: Option<u32>,
    pub remaining_conversations: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_date: Option<DateTime<Utc>>,
}

impl UsageStats {
    pub fn derive(subscription: &SubscriptionStatus, counters: &UsageCounters) -> Self {
        let (limit, remaining) = if subscription.is_subscribed {
            (None, None)
        } else {
            (
                Some(counters.limit),
                Some(counters.limit.saturating_sub(counters.current_usage)),
            )
        };
        Self {
            is_subscribed: subscription.is_subscribed,
            current_usage: counters.current_usage,
            limit,
            remaining_conversations: remaining,
            reset_date: counters.reset_date,
        }
    }
}

// ---------------------------------------------------------------------------
// Receipt verification
// ---------------------------------------------------------------------------

/// Status codes returned by the receipt verification service.
///
/// | Code  | Meaning                                              |
/// |-------|------------------------------------------------------|
/// | 0     | valid receipt                                        |
/// | 21006 | valid receipt, subscription expired                  |
/// | 21007 | sandbox receipt sent to the production endpoint      |
/// | 21008 | production receipt sent to the sandbox endpoint      |
/// | other | rejected or service failure; not authoritative       |
pub mod receipt_status {
    pub const OK: i64 = 0;
    pub const SUBSCRIPTION_EXPIRED: i64 = 21006;
    pub const SANDBOX_RECEIPT: i64 = 21007;
    pub const PRODUCTION_RECEIPT: i64 = 21008;

    /// True when the status is a definitive answer about the receipt.
    pub fn is_authoritative(status: i64) -> bool {
        status == OK || status == SUBSCRIPTION_EXPIRED
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptEnvironment {
    Production,
    Sandbox,
}

/// Request body posted to the verification endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReceiptRequest {
    #[serde(rename = "receipt-data")]
    pub receipt_data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(rename = "exclude-old-transactions", default)]
    pub exclude_old_transactions: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReceiptResponse {
    pub status: i64,
    #[serde(default)]
    pub environment: Option<ReceiptEnvironment>,
    /// Sorted by purchase time by the verifier; consumers must not rely on it.
    #[serde(default)]
    pub latest_receipt_info: Option<Vec<ReceiptRecord>>,
}

/// One in-app purchase record. Millisecond fields arrive as strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptRecord {
    pub product_id: String,
    pub transaction_id: String,
    #[serde(with = "millis")]
    pub purchase_date_ms: i64,
    #[serde(default, with = "opt_millis", skip_serializing_if = "Option::is_none")]
    pub expires_date_ms: Option<i64>,
}

impl ReceiptRecord {
    pub fn purchased_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.purchase_date_ms)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_date_ms.and_then(DateTime::from_timestamp_millis)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MillisRepr {
    Number(i64),
    Text(String),
}

impl MillisRepr {
    fn into_millis<E: serde::de::Error>(self) -> Result<i64, E> {
        match self {
            MillisRepr::Number(n) => Ok(n),
            MillisRepr::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| E::custom(format!("invalid millisecond timestamp '{s}'"))),
        }
    }
}

mod millis {
    use super::MillisRepr;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        MillisRepr::deserialize(deserializer)?.into_millis()
    }
}

mod opt_millis {
    use super::MillisRepr;
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(value: &Option<i64>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_str(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<i64>, D::Error> {
        Option::<MillisRepr>::deserialize(deserializer)?
            .map(MillisRepr::into_millis)
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn envelope_parses_type_timestamp_and_payload() {
        let env = MessageEnvelope::from_json(
            r#"{"type":"conversation_status","timestamp":"2024-06-01T12:00:00Z","payload":{"conversationId":"c1","status":"waiting"}}"#,
        )
        .unwrap();
        assert_eq!(env.envelope_type(), Some(EnvelopeType::ConversationStatus));
        assert_eq!(env.timestamp, ts("2024-06-01T12:00:00Z"));
        assert_eq!(env.payload["conversationId"], "c1");
    }

    #[test]
    fn envelope_accepts_offset_timestamps() {
        let env = MessageEnvelope::from_json(
            r#"{"type":"ping","timestamp":"2024-06-01T14:00:00+02:00","payload":{}}"#,
        )
        .unwrap();
        assert_eq!(env.timestamp, ts("2024-06-01T12:00:00Z"));
    }

    #[test]
    fn envelope_without_payload_defaults_to_empty_object() {
        let env =
            MessageEnvelope::from_json(r#"{"type":"ping","timestamp":"2024-06-01T12:00:00Z"}"#)
                .unwrap();
        assert!(env.payload.is_empty());
    }

    #[test]
    fn empty_type_is_rejected() {
        let err =
            MessageEnvelope::from_json(r#"{"type":"  ","timestamp":"2024-06-01T12:00:00Z"}"#)
                .unwrap_err();
        assert!(matches!(err, EnvelopeError::EmptyType));
    }

    #[test]
    fn bad_timestamp_is_rejected() {
        let err = MessageEnvelope::from_json(r#"{"type":"ping","timestamp":"yesterday"}"#)
            .unwrap_err();
        assert!(matches!(err, EnvelopeError::Json(_)));
    }

    #[test]
    fn unknown_type_still_parses() {
        let env = MessageEnvelope::from_json(
            r#"{"type":"mystery","timestamp":"2024-06-01T12:00:00Z","payload":{}}"#,
        )
        .unwrap();
        assert_eq!(env.envelope_type(), None);
    }

    #[test]
    fn conversation_update_decodes_optional_fields() {
        let env = MessageEnvelope::from_json(
            r#"{"type":"conversation_status","timestamp":"2024-06-01T12:00:00Z",
                "payload":{"conversationId":"c1","status":"processing","progress":40,"estimatedTimeRemaining":90}}"#,
        )
        .unwrap();
        let update = env.conversation_update().unwrap();
        assert_eq!(update.conversation_id, "c1");
        assert_eq!(update.status.status, ConversationState::Processing);
        assert_eq!(update.status.progress, Some(40));
        assert_eq!(update.status.estimated_time_remaining, Some(90));
        assert_eq!(update.status.error, None);
    }

    #[test]
    fn conversation_update_rejects_progress_over_100() {
        let env = MessageEnvelope::from_json(
            r#"{"type":"conversation_status","timestamp":"2024-06-01T12:00:00Z",
                "payload":{"conversationId":"c1","status":"processing","progress":140}}"#,
        )
        .unwrap();
        assert!(matches!(
            env.conversation_update(),
            Err(EnvelopeError::ProgressOutOfRange(140))
        ));
    }

    #[test]
    fn conversation_update_rejects_unknown_status() {
        let env = MessageEnvelope::from_json(
            r#"{"type":"conversation_status","timestamp":"2024-06-01T12:00:00Z",
                "payload":{"conversationId":"c1","status":"exploded"}}"#,
        )
        .unwrap();
        assert!(matches!(
            env.conversation_update(),
            Err(EnvelopeError::Payload { .. })
        ));
    }

    #[test]
    fn subscription_status_serializes_camel_case() {
        let status = SubscriptionStatus {
            is_subscribed: true,
            subscription_type: Some(SubscriptionType::Annual),
            expiry_date: Some(ts("2025-01-01T00:00:00Z")),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["isSubscribed"], true);
        assert_eq!(json["subscriptionType"], "annual");
        assert_eq!(json["expiryDate"], "2025-01-01T00:00:00Z");
    }

    #[test]
    fn usage_stats_caps_free_users() {
        let counters = UsageCounters {
            current_usage: 2,
            limit: 3,
            reset_date: None,
        };
        let stats = UsageStats::derive(&SubscriptionStatus::unsubscribed(), &counters);
        assert_eq!(stats.limit, Some(3));
        assert_eq!(stats.remaining_conversations, Some(1));

        let over = UsageCounters {
            current_usage: 5,
            ..counters
        };
        let stats = UsageStats::derive(&SubscriptionStatus::unsubscribed(), &over);
        assert_eq!(stats.remaining_conversations, Some(0));
    }

    #[test]
    fn usage_stats_uncapped_for_subscribers() {
        let sub = SubscriptionStatus {
            is_subscribed: true,
            subscription_type: Some(SubscriptionType::Monthly),
            expiry_date: None,
        };
        let stats = UsageStats::derive(
            &sub,
            &UsageCounters {
                current_usage: 12,
                limit: 3,
                reset_date: None,
            },
        );
        assert!(stats.is_subscribed);
        assert_eq!(stats.current_usage, 12);
        assert_eq!(stats.limit, None);
        assert_eq!(stats.remaining_conversations, None);
    }

    #[test]
    fn receipt_record_accepts_string_and_number_millis() {
        let record: ReceiptRecord = serde_json::from_value(json!({
            "product_id": "pro.monthly",
            "transaction_id": "1000",
            "purchase_date_ms": "1700000000000",
            "expires_date_ms": 1702592000000_i64,
            "original_transaction_id": "999"
        }))
        .unwrap();
        assert_eq!(record.purchase_date_ms, 1_700_000_000_000);
        assert_eq!(record.expires_date_ms, Some(1_702_592_000_000));
        assert_eq!(
            record.expires_at().unwrap(),
            ts("2023-12-14T22:13:20Z")
        );
    }

    #[test]
    fn receipt_record_rejects_garbage_millis() {
        let result: Result<ReceiptRecord, _> = serde_json::from_value(json!({
            "product_id": "pro.monthly",
            "transaction_id": "1000",
            "purchase_date_ms": "soon"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn verify_request_uses_hyphenated_keys() {
        let req = VerifyReceiptRequest {
            receipt_data: "base64".to_owned(),
            password: None,
            exclude_old_transactions: true,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["receipt-data"], "base64");
        assert_eq!(json["exclude-old-transactions"], true);
        assert!(json.get("password").is_none());
    }

    #[test]
    fn authoritative_statuses() {
        assert!(receipt_status::is_authoritative(0));
        assert!(receipt_status::is_authoritative(21006));
        assert!(!receipt_status::is_authoritative(21007));
        assert!(!receipt_status::is_authoritative(21002));
    }
}
