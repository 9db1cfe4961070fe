// sc-test-utils: Shared test utilities for the status channel.
//
// Provides a scripted mock status server, a listener that never completes a
// handshake (for reconnect tests), and a tiny client for self-tests.

pub mod flaky_listener;
pub mod mock_status_server;
pub mod mock_ws_client;

pub use flaky_listener::FlakyListener;
pub use mock_status_server::{AfterFrames, Frame, MockStatusServer, SessionScript};
pub use mock_ws_client::MockWsClient;

use sc_protocol::{EnvelopeType, MessageEnvelope};

/// Build a `conversation_status` envelope at `timestamp` (RFC 3339).
pub fn conversation_envelope(
    conversation_id: &str,
    status: &str,
    progress: Option<u8>,
    timestamp: &str,
) -> MessageEnvelope {
    let payload = serde_json::json!({
        "conversationId": conversation_id,
        "status": status,
        "progress": progress,
    });
    let serde_json::Value::Object(map) = payload else {
        unreachable!("json! object literal")
    };
    MessageEnvelope::with_timestamp(
        EnvelopeType::ConversationStatus,
        timestamp.parse().expect("RFC 3339 timestamp"),
        map,
    )
}
