//! # bulk-publish-local
//!
//! In-process [`PublishTransport`] backed by a scriptable broker
//! double. Useful for exercising the whole publish flow, confirm
//! handling included, without a broker on the network.
//!
//! [`PublishTransport`]: bulk_publish_core::PublishTransport

pub mod broker;
pub mod transport;

pub use broker::{LocalBroker, LocalBrokerBuilder, LocalBrokerError, ReceivedMessage};
pub use transport::{LocalSession, LocalTransport};
