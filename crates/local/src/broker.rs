//! # Local Broker
//!
//! In-process broker double for exercising the publish flow without a
//! real broker. Routes published messages to named queues through
//! exchange bindings and confirms them the way a broker in confirm
//! mode would, with scriptable misbehavior keyed by publish ordinal:
//! nack one publish, return another, drop the session on a third.

use bulk_publish_core::{Destination, MessageEnvelope, MessageId, REPLY_CODE_NOT_FOUND};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// A message as it landed in a queue.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: MessageId,
    pub body: Vec<u8>,
    pub republished: bool,
    pub received_at: DateTime<Utc>,
}

/// Scripted broker behavior, keyed by the broker-wide publish ordinal
/// (1-based, counted across every session the broker ever serves).
#[derive(Debug, Clone, Default)]
pub(crate) struct DeliveryScript {
    /// Publishes to reject with a nack instead of an ack.
    pub(crate) nack_ordinals: HashSet<u64>,
    /// Publishes to hand back as unroutable even when a binding exists.
    pub(crate) return_ordinals: HashSet<u64>,
    /// Close the session when this publish arrives; the message is not
    /// accepted.
    pub(crate) close_on: Option<(u64, u16, String)>,
    /// Accept this publish, then drop the session: the shutdown shows
    /// up asynchronously rather than as a publish failure.
    pub(crate) shutdown_after: Option<(u64, u16, String)>,
    /// Confirm cumulatively once this many publishes of a session have
    /// accumulated, instead of acking each one.
    pub(crate) cumulative_every: Option<u64>,
    /// Delay before each ack or nack reaches the session's event sink.
    pub(crate) confirm_delay: Duration,
    /// Never confirm anything.
    pub(crate) withhold_confirms: bool,
    /// Withhold confirms for publishes up to this ordinal only, as if
    /// they were lost when the broker went away.
    pub(crate) withhold_until: Option<u64>,
}

#[derive(Debug)]
struct BrokerState {
    exchanges: HashSet<String>,
    /// (exchange, routing key) -> queue.
    bindings: HashMap<(String, String), String>,
    queues: HashMap<String, Vec<ReceivedMessage>>,
    publish_ordinal: u64,
}

/// What the broker decided about one accepted publish.
#[derive(Debug, Clone)]
pub(crate) struct RouteDecision {
    /// Broker-wide ordinal of this publish.
    pub(crate) ordinal: u64,
    /// The message could not be routed and must be handed back.
    pub(crate) returned: bool,
    /// The broker refuses the message outright.
    pub(crate) nacked: bool,
    /// The broker accepted the publish and then dropped the session.
    pub(crate) shutdown: Option<(u16, String)>,
}

/// The broker drops the session instead of accepting the publish.
#[derive(Debug, Clone)]
pub(crate) struct CloseDirective {
    pub(crate) reply_code: u16,
    pub(crate) reply_text: String,
}

/// In-memory broker shared by every session of a [`LocalTransport`].
///
/// [`LocalTransport`]: crate::transport::LocalTransport
#[derive(Debug)]
pub struct LocalBroker {
    state: Mutex<BrokerState>,
    script: DeliveryScript,
}

impl LocalBroker {
    /// Create a builder with no exchanges and well-behaved delivery.
    pub fn builder() -> LocalBrokerBuilder {
        LocalBrokerBuilder::new()
    }

    /// Declare an exchange. Publishing to an undeclared exchange closes
    /// the session with reply code 404.
    pub fn declare_exchange(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.exchanges.insert(name.to_string());
    }

    /// Bind a queue to an exchange under a routing key. Messages
    /// published without a matching binding are handed back as
    /// unroutable.
    pub fn bind_queue(&self, exchange: &str, routing_key: &str, queue: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .bindings
            .insert((exchange.to_string(), routing_key.to_string()), queue.to_string());
        state.queues.entry(queue.to_string()).or_default();
    }

    /// Everything a queue has received, in arrival order.
    pub fn queued_messages(&self, queue: &str) -> Vec<ReceivedMessage> {
        let state = self.state.lock().unwrap();
        state.queues.get(queue).cloned().unwrap_or_default()
    }

    /// Number of messages a queue has received.
    pub fn message_count(&self, queue: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.queues.get(queue).map_or(0, |messages| messages.len())
    }

    /// Publishes the broker has numbered so far, across all sessions.
    /// Publishes refused for a missing exchange never get a number.
    pub fn publish_count(&self) -> u64 {
        self.state.lock().unwrap().publish_ordinal
    }

    pub(crate) fn script(&self) -> &DeliveryScript {
        &self.script
    }

    /// Accept one publish: check the exchange, consume an ordinal, and
    /// either route the message, hand it back, refuse it, or drop the
    /// session per the script.
    pub(crate) fn accept(
        &self,
        destination: &Destination,
        envelope: MessageEnvelope,
    ) -> Result<RouteDecision, CloseDirective> {
        let mut state = self.state.lock().unwrap();

        if !state.exchanges.contains(&destination.exchange) {
            return Err(CloseDirective {
                reply_code: REPLY_CODE_NOT_FOUND,
                reply_text: format!("NOT_FOUND - no exchange '{}'", destination.exchange),
            });
        }

        state.publish_ordinal += 1;
        let ordinal = state.publish_ordinal;

        if let Some((close_at, reply_code, reply_text)) = &self.script.close_on {
            if ordinal == *close_at {
                debug!("scripted close at publish {}: {}", ordinal, reply_text);
                return Err(CloseDirective {
                    reply_code: *reply_code,
                    reply_text: reply_text.clone(),
                });
            }
        }

        let shutdown = self.script.shutdown_after.as_ref().and_then(|(at, code, text)| {
            if ordinal == *at {
                debug!("scripted shutdown after publish {}: {}", ordinal, text);
                Some((*code, text.clone()))
            } else {
                None
            }
        });

        if self.script.nack_ordinals.contains(&ordinal) {
            debug!("scripted nack at publish {}", ordinal);
            return Ok(RouteDecision {
                ordinal,
                returned: false,
                nacked: true,
                shutdown,
            });
        }

        let binding = if self.script.return_ordinals.contains(&ordinal) {
            None
        } else {
            state
                .bindings
                .get(&(destination.exchange.clone(), destination.routing_key.clone()))
                .cloned()
        };

        match binding {
            Some(queue) => {
                state.queues.entry(queue).or_default().push(ReceivedMessage {
                    message_id: envelope.message_id,
                    body: envelope.body,
                    republished: envelope.republished,
                    received_at: Utc::now(),
                });
                Ok(RouteDecision {
                    ordinal,
                    returned: false,
                    nacked: false,
                    shutdown,
                })
            }
            None => {
                debug!("publish {} is unroutable, handing it back", ordinal);
                Ok(RouteDecision {
                    ordinal,
                    returned: true,
                    nacked: false,
                    shutdown,
                })
            }
        }
    }
}

/// Builder for [`LocalBroker`].
#[derive(Debug, Default)]
pub struct LocalBrokerBuilder {
    exchanges: Vec<String>,
    bindings: Vec<(String, String, String)>,
    script: DeliveryScript,
}

impl LocalBrokerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an exchange.
    pub fn exchange(mut self, name: &str) -> Self {
        self.exchanges.push(name.to_string());
        self
    }

    /// Bind a queue to an exchange under a routing key.
    pub fn bind(mut self, exchange: &str, routing_key: &str, queue: &str) -> Self {
        self.bindings
            .push((exchange.to_string(), routing_key.to_string(), queue.to_string()));
        self
    }

    /// Nack the nth publish the broker sees instead of acking it.
    pub fn nack_on(mut self, ordinal: u64) -> Self {
        self.script.nack_ordinals.insert(ordinal);
        self
    }

    /// Hand the nth publish back as unroutable even if a binding
    /// matches it.
    pub fn return_on(mut self, ordinal: u64) -> Self {
        self.script.return_ordinals.insert(ordinal);
        self
    }

    /// Close the session when the nth publish arrives.
    pub fn close_on(mut self, ordinal: u64, reply_code: u16, reply_text: &str) -> Self {
        self.script.close_on = Some((ordinal, reply_code, reply_text.to_string()));
        self
    }

    /// Accept the nth publish, then drop the session out of band.
    pub fn shutdown_after(mut self, ordinal: u64, reply_code: u16, reply_text: &str) -> Self {
        self.script.shutdown_after = Some((ordinal, reply_code, reply_text.to_string()));
        self
    }

    /// Confirm cumulatively once `group` publishes of a session have
    /// accumulated. Confirms for a final partial group are never
    /// emitted, like a broker that batches aggressively.
    pub fn cumulative_every(mut self, group: u64) -> Self {
        self.script.cumulative_every = if group == 0 { None } else { Some(group) };
        self
    }

    /// Delay each ack and nack on its way to the event sink.
    pub fn confirm_delay(mut self, delay: Duration) -> Self {
        self.script.confirm_delay = delay;
        self
    }

    /// Accept publishes but never confirm them.
    pub fn withhold_confirms(mut self) -> Self {
        self.script.withhold_confirms = true;
        self
    }

    /// Withhold confirms for the first `ordinal` publishes only, as if
    /// the broker died before they went out; later publishes confirm
    /// normally.
    pub fn withhold_confirms_until(mut self, ordinal: u64) -> Self {
        self.script.withhold_until = Some(ordinal);
        self
    }

    pub fn build(self) -> LocalBroker {
        let broker = LocalBroker {
            state: Mutex::new(BrokerState {
                exchanges: self.exchanges.into_iter().collect(),
                bindings: HashMap::new(),
                queues: HashMap::new(),
                publish_ordinal: 0,
            }),
            script: self.script,
        };
        for (exchange, routing_key, queue) in self.bindings {
            broker.bind_queue(&exchange, &routing_key, &queue);
        }
        broker
    }
}

/// Errors from [`LocalBroker`] sessions.
#[derive(Debug, Error)]
pub enum LocalBrokerError {
    /// The session's event pipeline is gone.
    #[error("Event pipeline closed")]
    EventPipelineClosed,
}
