//! Transport port for confirm-mode publishing.
//!
//! This module defines the [`PublishTransport`] and [`PublishSession`]
//! traits the publish driver runs against. A session is one channel
//! opened in publisher-confirmation mode: it assigns monotonically
//! increasing sequence numbers at publish time and reports outcomes
//! asynchronously as [`SessionEvent`]s through the
//! [`SessionEventSink`] installed when the session was opened.

use crate::message::MessageId;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;

/// Reply code a broker uses for a clean, caller-requested close.
pub const REPLY_CODE_SUCCESS: u16 = 200;

/// Reply code a broker uses when the destination exchange does not
/// exist (the AMQP `NOT_FOUND` channel exception).
pub const REPLY_CODE_NOT_FOUND: u16 = 404;

/// Addressable publish target: an exchange plus the routing key every
/// message of the campaign is published under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub exchange: String,
    pub routing_key: String,
}

impl Destination {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.exchange, self.routing_key)
    }
}

/// Wire view of one transmit: the serialized payload plus the metadata
/// the broker echoes back or a consumer may inspect.
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    /// Campaign-stable message id, carried so the broker's return events
    /// can be correlated without a sequence number.
    pub message_id: MessageId,
    /// Serialized payload bytes.
    pub body: Vec<u8>,
    /// Set when the message was already transmitted in an earlier
    /// attempt, so consumers can apply their own deduplication.
    pub republished: bool,
}

/// Asynchronous broker event delivered on the transport's own I/O task.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Positive confirmation. With `multiple` set it covers every
    /// outstanding sequence number up to and including `sequence`.
    Ack { sequence: u64, multiple: bool },
    /// Negative confirmation, same cumulative semantics as `Ack`.
    Nack { sequence: u64, multiple: bool },
    /// The broker could not route the message to any queue. Fired
    /// before the matching ack for the same message.
    Return {
        message_id: MessageId,
        reply_code: u16,
        reply_text: String,
    },
    /// The session closed. `reply_code` distinguishes a clean close
    /// ([`REPLY_CODE_SUCCESS`]) from a broker-initiated one, and
    /// [`REPLY_CODE_NOT_FOUND`] specifically from other failures.
    Shutdown { reply_code: u16, reply_text: String },
}

/// Receiver for a session's confirmation events.
///
/// The driver installs one sink per attempt; the campaign tracker
/// implements this trait and serializes every delivered event through
/// its own lock. Implementations must not block: delivery happens on
/// the transport's I/O task.
pub trait SessionEventSink: Send + Sync {
    fn deliver(&self, event: SessionEvent);
}

/// Failure of a single publish call, as observed at the call site.
/// Everything the broker reports asynchronously instead arrives through
/// the [`SessionEventSink`].
#[derive(Debug, thiserror::Error)]
pub enum PublishFault<E> {
    /// The destination exchange does not exist. The broker closes the
    /// channel with a 404-class reply; nothing further can be published
    /// on this session.
    #[error("exchange not found: {reply_text}")]
    ExchangeNotFound { reply_text: String },

    /// The session closed while the publish was in flight.
    #[error("session closed (reply code {reply_code}): {reply_text}")]
    SessionClosed { reply_code: u16, reply_text: String },

    /// Transport-specific failure.
    #[error("publish failed: {0:?}")]
    Other(E),
}

/// One channel opened in publisher-confirmation mode.
///
/// Sequence numbers start at 1 and increase by one per publish, scoped
/// to this session. [`next_sequence`](Self::next_sequence) exposes the
/// number the next publish call will consume, so the caller can index
/// the message for confirmation lookup before the transmit happens;
/// otherwise an early confirmation could arrive for a sequence number
/// nothing knows about yet.
#[async_trait::async_trait]
pub trait PublishSession: Send {
    /// The error type for this implementation.
    type Error: Debug + Send + Sync + 'static;

    /// The sequence number the next `publish` call will be assigned.
    fn next_sequence(&self) -> u64;

    /// Transmit one envelope to the session's destination.
    ///
    /// The broker's accept/reject decision is not part of the result;
    /// it arrives later as a [`SessionEvent`]. An `Ok` here only means
    /// the envelope was written to the session.
    async fn publish(&mut self, envelope: MessageEnvelope)
        -> Result<(), PublishFault<Self::Error>>;

    /// Release the session. Consumes the session so a close happens at
    /// most once; events already in flight may still reach the sink
    /// while the close is underway.
    async fn close(self) -> Result<(), Self::Error>;
}

/// Factory for confirm-mode publish sessions.
#[async_trait::async_trait]
pub trait PublishTransport: Send + Sync {
    /// The error type for this implementation.
    type Error: Debug + Send + Sync + 'static;

    /// The session type this transport opens.
    type Session: PublishSession<Error = Self::Error>;

    /// Open a fresh session against `destination` with confirmations
    /// enabled, delivering its events to `sink` for the session's whole
    /// lifetime.
    async fn open_session(
        &self,
        destination: &Destination,
        sink: Arc<dyn SessionEventSink>,
    ) -> Result<Self::Session, Self::Error>;
}
