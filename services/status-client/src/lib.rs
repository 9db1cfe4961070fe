// status-client: Library entry point.
// Exposes modules for integration testing.

pub mod bus;
pub mod config;
pub mod connection;
pub mod events;
pub mod reconciler;
pub mod runtime;
pub mod tracker;
pub mod verifier;

pub use bus::{StatusBus, SubscriberError, SubscriptionHandle};
pub use connection::{ConnectOptions, ConnectionManager, ConnectionState, EnvelopeStream, SendError};
pub use events::{CloseReason, EventName, StatusEvent};
pub use reconciler::{SubscriptionReconciler, VerificationState};
pub use tracker::{ApplyOutcome, ConversationTracker};
