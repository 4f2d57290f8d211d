//! # Message Records
//!
//! The per-message bookkeeping that survives a whole publish campaign:
//! a stable [`MessageId`], the caller's payload, and the delivery
//! tracking fields the tracker mutates as broker events arrive. Records
//! are owned by the campaign aggregate and never copied across attempts;
//! only their sequence-number bookkeeping is reset when a new attempt
//! starts.

use crate::status::SendStatus;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Campaign-unique message identifier, generated once and stable across
/// retries. Broker return events carry no sequence number, so they are
/// correlated through this id instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tracking record for one logical message across every attempt of a
/// campaign.
///
/// `sequence_number` and `acknowledged` are scoped to the current
/// attempt and reset when the next one starts; `id`, `send_count` and
/// `description` carry the message's history across attempts.
#[derive(Debug, Serialize)]
pub struct MessageState<T> {
    pub id: MessageId,
    #[serde(skip_serializing)]
    pub payload: Arc<T>,
    pub status: SendStatus,
    /// Session-assigned publish sequence number for the current attempt;
    /// 0 while unset.
    pub sequence_number: u64,
    /// Number of attempts in which this message has been written to a
    /// session. Anything above 1 on a `Success` message means a
    /// duplicate may exist downstream.
    pub send_count: u32,
    /// Whether a broker confirmation settled this message in the current
    /// attempt. Stays false for `PossiblyLost`, which is assigned at
    /// session release without any broker event.
    pub acknowledged: bool,
    /// Diagnostic attached by the settling event, empty for a clean ack.
    pub description: String,
}

impl<T> MessageState<T> {
    pub(crate) fn new(payload: T) -> Self {
        Self {
            id: MessageId::new(),
            payload: Arc::new(payload),
            status: SendStatus::PendingSend,
            sequence_number: 0,
            send_count: 0,
            acknowledged: false,
            description: String::new(),
        }
    }

    /// Borrow the caller-supplied payload.
    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub(crate) fn mark_transmitted(&mut self, sequence_number: u64) {
        self.sequence_number = sequence_number;
        self.status = SendStatus::PendingResponse;
        self.send_count += 1;
    }

    pub(crate) fn resolve(&mut self, status: SendStatus, description: &str) {
        self.status = status;
        self.description = description.to_string();
        self.acknowledged = true;
    }

    pub(crate) fn mark_possibly_lost(&mut self, description: &str) {
        self.status = SendStatus::PossiblyLost;
        self.description = description.to_string();
    }

    pub(crate) fn reset_for_next_attempt(&mut self) {
        self.sequence_number = 0;
        self.acknowledged = false;
    }
}

// The payload sits behind an Arc, so cloning a record must not require
// T: Clone the way a derived impl would.
impl<T> Clone for MessageState<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            payload: Arc::clone(&self.payload),
            status: self.status,
            sequence_number: self.sequence_number,
            send_count: self.send_count,
            acknowledged: self.acknowledged,
            description: self.description.clone(),
        }
    }
}

/// Transmit view of one retryable message, handed to the publish loop.
/// The payload is shared with the campaign record, not copied.
#[derive(Debug)]
pub struct OutboundMessage<T> {
    pub id: MessageId,
    pub payload: Arc<T>,
    /// Transmissions recorded before this attempt; anything above 0
    /// marks the envelope as republished.
    pub send_count: u32,
}

impl<T> Clone for OutboundMessage<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            payload: Arc::clone(&self.payload),
            send_count: self.send_count,
        }
    }
}
