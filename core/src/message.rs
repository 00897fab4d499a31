//! Message types for the outbox and inbox tables.
//!
//! Payloads are opaque bytes: the relay never interprets them beyond
//! handing them to the broker or to an inbox handler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier of an outbox or inbox message.
///
/// Outbox ids are assigned by the business operation that writes the row.
/// Inbox ids are the natural identity of the causing event, so a redelivered
/// event collides with the row it already produced.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Create a message id from any string-like value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random (v4 UUID) message id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<uuid::Uuid> for MessageId {
    fn from(id: uuid::Uuid) -> Self {
        Self(id.to_string())
    }
}

/// A not-yet-delivered event waiting in the outbox.
///
/// # Lifecycle
///
/// ```text
/// unclaimed ──claim──► leased ──publish + mark──► processed
///     ▲                   │
///     └──lease expires────┘
/// ```
///
/// `processed` flips from `false` to `true` exactly once. `reserved_until`
/// is a lease that may be rewritten while the row is unprocessed and is
/// ignored afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboxMessage {
    /// Caller-assigned unique id, also used as the broker record key
    pub id: MessageId,
    /// Routing key; the harvester publishes to the topic of this name
    pub event_type: String,
    /// Opaque event payload
    pub payload: Vec<u8>,
    /// Whether the message has been delivered to the broker
    pub processed: bool,
    /// Lease held by a harvester, if any
    pub reserved_until: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    /// Create a fresh, unprocessed and unleased outbox message.
    #[must_use]
    pub fn new(id: MessageId, event_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id,
            event_type: event_type.into(),
            payload,
            processed: false,
            reserved_until: None,
        }
    }

    /// Whether a harvester may claim this message at `now`.
    ///
    /// A message is claimable while unprocessed and either never leased or
    /// holding a lease that has run out (`reserved_until <= now`).
    #[must_use]
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        !self.processed && self.reserved_until.is_none_or(|until| until <= now)
    }
}

/// An incoming event absorbed into the inbox, waiting to be applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboxMessage {
    /// Natural identity of the causing event
    pub id: MessageId,
    /// Topic / event type the message arrived on
    pub event_type: String,
    /// Opaque event payload
    pub payload: Vec<u8>,
    /// Whether the handler has been applied
    pub processed: bool,
}

impl InboxMessage {
    /// Create a fresh, unprocessed inbox message.
    #[must_use]
    pub fn new(id: MessageId, event_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id,
            event_type: event_type.into(),
            payload,
            processed: false,
        }
    }
}

/// Result of adding a message to the inbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// The message was new and has been stored
    Inserted,
    /// A message with the same id was already present; nothing changed
    Duplicate,
}
