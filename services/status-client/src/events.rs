use sc_protocol::{ConversationStatus, SubscriptionStatus, UsageStats};
use serde::Serialize;

/// Names subscribers register under on the [`StatusBus`](crate::bus::StatusBus).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    Connected,
    Reconnecting,
    Disconnected,
    Closed,
    ConversationStatus,
    SubscriptionUpdated,
    UsageUpdated,
    VerificationFailed,
}

impl EventName {
    pub fn as_str(self) -> &'static str {
        match self {
            EventName::Connected => "connected",
            EventName::Reconnecting => "reconnecting",
            EventName::Disconnected => "disconnected",
            EventName::Closed => "closed",
            EventName::ConversationStatus => "conversation_status",
            EventName::SubscriptionUpdated => "subscription_updated",
            EventName::UsageUpdated => "usage_updated",
            EventName::VerificationFailed => "verification_failed",
        }
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// `close()` was called.
    Requested,
    /// The consecutive-failure cap was reached.
    RetriesExhausted,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    Connected {
        url: String,
    },
    Reconnecting {
        /// 1-based number of the attempt that will run after `delay_ms`.
        attempt: u32,
        delay_ms: u64,
    },
    Disconnected {
        reason: String,
    },
    Closed {
        reason: CloseReason,
        error: Option<String>,
    },
    ConversationStatus {
        conversation_id: String,
        status: ConversationStatus,
    },
    SubscriptionUpdated {
        status: SubscriptionStatus,
    },
    UsageUpdated {
        usage: UsageStats,
    },
    VerificationFailed {
        error: String,
        /// The cached status that stays in effect.
        retained: Option<SubscriptionStatus>,
    },
}

impl StatusEvent {
    pub fn name(&self) -> EventName {
        match self {
            StatusEvent::Connected { .. } => EventName::Connected,
            StatusEvent::Reconnecting { .. } => EventName::Reconnecting,
            StatusEvent::Disconnected { .. } => EventName::Disconnected,
            StatusEvent::Closed { .. } => EventName::Closed,
            StatusEvent::ConversationStatus { .. } => EventName::ConversationStatus,
            StatusEvent::SubscriptionUpdated { .. } => EventName::SubscriptionUpdated,
            StatusEvent::UsageUpdated { .. } => EventName::UsageUpdated,
            StatusEvent::VerificationFailed { .. } => EventName::VerificationFailed,
        }
    }
}
