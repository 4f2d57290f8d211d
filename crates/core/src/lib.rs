//! # bulk-publish-core
//!
//! Transport-agnostic bulk publishing with broker confirmations.
//! Tracks every message of a batch through transmission, confirmation
//! and resubmission, and reports the final outcome of each one.
//!
//! ## Architecture
//!
//! This crate defines the publishing algorithm and the ports a broker
//! transport implements. It has ZERO dependencies on any concrete
//! broker client; adapters live in their own crates.
//!
//! ## Modules
//!
//! - [`status`]: [`SendStatus`], the per-message delivery state machine
//! - [`message`]: [`MessageState`] records and [`MessageId`]
//! - [`tracker`]: [`ConfirmationTracker`], the campaign aggregate fed
//!   by broker events
//! - [`publisher`]: [`BulkPublisher`], the campaign driver
//! - [`report`]: [`CampaignReport`] handed back to callers
//! - [`transport`]: [`PublishTransport`] and [`PublishSession`] ports
//! - [`config`]: [`BatchPolicy`] and [`RetryPolicy`]
//!
//! ## Usage
//!
//! ```rust
//! use bulk_publish_core::{BatchPolicy, Destination, RetryPolicy};
//! use std::time::Duration;
//!
//! let destination = Destination::new("orders", "orders.created");
//! let policy = BatchPolicy::new(50, Duration::from_secs(1)).unwrap();
//! let retry = RetryPolicy::new(2, Duration::from_secs(1));
//!
//! assert_eq!(destination.to_string(), "orders/orders.created");
//! assert_eq!(policy.message_batch_size(), 50);
//! assert_eq!(retry.retry_limit, 2);
//! ```

pub mod config;
pub mod message;
pub mod publisher;
pub mod report;
pub mod status;
pub mod tracker;
pub mod transport;

pub use config::{BatchPolicy, PolicyError, RetryPolicy};
pub use message::{MessageId, MessageState, OutboundMessage};
pub use publisher::BulkPublisher;
pub use report::{CampaignReport, StatusCount};
pub use status::SendStatus;
pub use tracker::{ConfirmWait, ConfirmationTracker};
pub use transport::{
    Destination, MessageEnvelope, PublishFault, PublishSession, PublishTransport, SessionEvent,
    SessionEventSink, REPLY_CODE_NOT_FOUND, REPLY_CODE_SUCCESS,
};
