//! Latest processing state per conversation.
//!
//! Last write wins by envelope timestamp: an update is stored only when it is
//! strictly newer than what is already held for that conversation, so
//! duplicates and late arrivals after a reconnect are dropped. A discarded
//! conversation keeps its last timestamp as a floor, so a stale replay cannot
//! bring it back.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use sc_protocol::{ConversationStatus, EnvelopeType, MessageEnvelope};
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::bus::StatusBus;
use crate::connection::{EnvelopeStream, wait_for_shutdown};
use crate::events::StatusEvent;

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedConversation {
    pub status: ConversationStatus,
    /// Timestamp of the envelope that produced `status`.
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Not strictly newer than the stored update.
    Stale,
    /// Not a `conversation_status` envelope.
    Ignored,
    Malformed,
}

#[derive(Debug, Default)]
struct Conversations {
    live: HashMap<String, TrackedConversation>,
    /// Last `updated_at` of each discarded conversation.
    discarded: HashMap<String, DateTime<Utc>>,
}

impl Conversations {
    fn high_water(&self, conversation_id: &str) -> Option<DateTime<Utc>> {
        self.live
            .get(conversation_id)
            .map(|c| c.updated_at)
            .or_else(|| self.discarded.get(conversation_id).copied())
    }
}

#[derive(Clone, Default)]
pub struct ConversationTracker {
    bus: StatusBus,
    conversations: Arc<RwLock<Conversations>>,
}

impl ConversationTracker {
    pub fn new(bus: StatusBus) -> Self {
        Self {
            bus,
            conversations: Arc::default(),
        }
    }

    pub fn apply(&self, envelope: &MessageEnvelope) -> ApplyOutcome {
        if !envelope.is(EnvelopeType::ConversationStatus) {
            return ApplyOutcome::Ignored;
        }
        let update = match envelope.conversation_update() {
            Ok(update) => update,
            Err(e) => {
                warn!(error = %e, "discarding conversation status");
                return ApplyOutcome::Malformed;
            }
        };

        {
            let mut conversations = self.write();
            if let Some(stored) = conversations.high_water(&update.conversation_id) {
                if envelope.timestamp <= stored {
                    debug!(
                        conversation_id = %update.conversation_id,
                        timestamp = %envelope.timestamp,
                        stored = %stored,
                        "stale conversation status dropped"
                    );
                    return ApplyOutcome::Stale;
                }
            }
            conversations.discarded.remove(&update.conversation_id);
            conversations.live.insert(
                update.conversation_id.clone(),
                TrackedConversation {
                    status: update.status.clone(),
                    updated_at: envelope.timestamp,
                },
            );
        }

        debug!(
            conversation_id = %update.conversation_id,
            status = ?update.status.status,
            progress = ?update.status.progress,
            "conversation status updated"
        );
        self.bus.publish(StatusEvent::ConversationStatus {
            conversation_id: update.conversation_id,
            status: update.status,
        });
        ApplyOutcome::Applied
    }

    /// Apply envelopes from `stream` until `shutdown` flips to true or the
    /// stream ends.
    pub async fn run(&self, mut stream: EnvelopeStream, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                () = wait_for_shutdown(&mut shutdown) => break,
                next = stream.next() => match next {
                    Some(envelope) => {
                        self.apply(&envelope);
                    }
                    None => break,
                },
            }
        }
        info!(tracked = self.len(), "conversation tracker stopped");
    }

    pub fn get(&self, conversation_id: &str) -> Option<TrackedConversation> {
        self.read().live.get(conversation_id).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, TrackedConversation> {
        self.read().live.clone()
    }

    /// Forget a conversation. Returns the entry that was removed, if any.
    /// Later updates for it are accepted only when newer than that entry.
    pub fn discard(&self, conversation_id: &str) -> Option<TrackedConversation> {
        let mut conversations = self.write();
        let removed = conversations.live.remove(conversation_id)?;
        conversations
            .discarded
            .insert(conversation_id.to_owned(), removed.updated_at);
        Some(removed)
    }

    pub fn len(&self) -> usize {
        self.read().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().live.is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, Conversations> {
        self.conversations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Conversations> {
        self.conversations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ConversationTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationTracker")
            .field("tracked", &self.len())
            .finish_non_exhaustive()
    }
}
