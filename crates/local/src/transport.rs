//! # Local Transport
//!
//! [`PublishTransport`] adapter over [`LocalBroker`]. Each session
//! numbers its publishes from 1 and pushes the broker's confirmations,
//! returns and shutdowns through an ordered event pipeline into the
//! caller's sink, the way a broker channel dispatches callbacks.
//! Closing the session drains the pipeline before returning, so every
//! event the broker emitted is applied before the caller moves on.

use crate::broker::{LocalBroker, LocalBrokerError};
use async_trait::async_trait;
use bulk_publish_core::{
    Destination, MessageEnvelope, PublishFault, PublishSession, PublishTransport, SessionEvent,
    SessionEventSink, REPLY_CODE_NOT_FOUND, REPLY_CODE_SUCCESS,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Transport backed by an in-process [`LocalBroker`].
#[derive(Debug, Clone)]
pub struct LocalTransport {
    broker: Arc<LocalBroker>,
}

impl LocalTransport {
    pub fn new(broker: Arc<LocalBroker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl PublishTransport for LocalTransport {
    type Error = LocalBrokerError;
    type Session = LocalSession;

    async fn open_session(
        &self,
        destination: &Destination,
        sink: Arc<dyn SessionEventSink>,
    ) -> Result<LocalSession, LocalBrokerError> {
        let (events, mut receiver) = mpsc::unbounded_channel::<SessionEvent>();
        let delay = self.broker.script().confirm_delay;
        let forwarder = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                if !delay.is_zero()
                    && matches!(event, SessionEvent::Ack { .. } | SessionEvent::Nack { .. })
                {
                    tokio::time::sleep(delay).await;
                }
                sink.deliver(event);
            }
        });

        Ok(LocalSession {
            broker: Arc::clone(&self.broker),
            destination: destination.clone(),
            events,
            forwarder,
            next_sequence: 1,
            unconfirmed: 0,
            closed: None,
        })
    }
}

/// One publish session against the local broker.
#[derive(Debug)]
pub struct LocalSession {
    broker: Arc<LocalBroker>,
    destination: Destination,
    events: mpsc::UnboundedSender<SessionEvent>,
    forwarder: JoinHandle<()>,
    next_sequence: u64,
    /// Publishes accumulated towards the next cumulative confirm.
    unconfirmed: u64,
    /// Set once the broker dropped the session.
    closed: Option<(u16, String)>,
}

impl LocalSession {
    fn send_event(&self, event: SessionEvent) -> Result<(), PublishFault<LocalBrokerError>> {
        self.events
            .send(event)
            .map_err(|_| PublishFault::Other(LocalBrokerError::EventPipelineClosed))
    }
}

#[async_trait]
impl PublishSession for LocalSession {
    type Error = LocalBrokerError;

    fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    async fn publish(
        &mut self,
        envelope: MessageEnvelope,
    ) -> Result<(), PublishFault<LocalBrokerError>> {
        if let Some((reply_code, reply_text)) = &self.closed {
            return Err(PublishFault::SessionClosed {
                reply_code: *reply_code,
                reply_text: reply_text.clone(),
            });
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let message_id = envelope.message_id.clone();

        let decision = match self.broker.accept(&self.destination, envelope) {
            Ok(decision) => decision,
            Err(directive) => {
                self.closed = Some((directive.reply_code, directive.reply_text.clone()));
                let _ = self.send_event(SessionEvent::Shutdown {
                    reply_code: directive.reply_code,
                    reply_text: directive.reply_text.clone(),
                });
                return if directive.reply_code == REPLY_CODE_NOT_FOUND {
                    Err(PublishFault::ExchangeNotFound {
                        reply_text: directive.reply_text,
                    })
                } else {
                    Err(PublishFault::SessionClosed {
                        reply_code: directive.reply_code,
                        reply_text: directive.reply_text,
                    })
                };
            }
        };

        // A broker hands an unroutable message back before it confirms
        // it, so the return goes down the pipeline first.
        if decision.returned {
            self.send_event(SessionEvent::Return {
                message_id,
                reply_code: 312,
                reply_text: "NO_ROUTE".to_string(),
            })?;
        }

        let script = self.broker.script();
        let withheld = script.withhold_confirms
            || script
                .withhold_until
                .map_or(false, |until| decision.ordinal <= until);
        if !withheld {
            if decision.nacked {
                self.send_event(SessionEvent::Nack {
                    sequence,
                    multiple: false,
                })?;
            } else if let Some(group) = script.cumulative_every {
                self.unconfirmed += 1;
                if self.unconfirmed >= group {
                    self.unconfirmed = 0;
                    self.send_event(SessionEvent::Ack {
                        sequence,
                        multiple: true,
                    })?;
                }
            } else {
                self.send_event(SessionEvent::Ack {
                    sequence,
                    multiple: false,
                })?;
            }
        }

        // The broker took this publish and then dropped the session;
        // the caller only finds out through the event pipeline or on
        // its next publish.
        if let Some((reply_code, reply_text)) = decision.shutdown {
            self.closed = Some((reply_code, reply_text.clone()));
            let _ = self.send_event(SessionEvent::Shutdown {
                reply_code,
                reply_text,
            });
        }
        Ok(())
    }

    async fn close(self) -> Result<(), LocalBrokerError> {
        let LocalSession {
            events,
            forwarder,
            closed,
            ..
        } = self;
        if closed.is_none() {
            let _ = events.send(SessionEvent::Shutdown {
                reply_code: REPLY_CODE_SUCCESS,
                reply_text: "Goodbye".to_string(),
            });
        }
        // Dropping the sender lets the forwarder drain what is queued
        // and exit; awaiting it makes the drain visible to the caller.
        drop(events);
        let _ = forwarder.await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulk_publish_core::MessageId;
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingSink {
        events: Mutex<Vec<SessionEvent>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
            })
        }

        fn events(&self) -> Vec<SessionEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl SessionEventSink for RecordingSink {
        fn deliver(&self, event: SessionEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn envelope() -> MessageEnvelope {
        MessageEnvelope {
            message_id: MessageId::new(),
            body: b"{}".to_vec(),
            republished: false,
        }
    }

    fn transport(broker: LocalBroker) -> LocalTransport {
        LocalTransport::new(Arc::new(broker))
    }

    #[tokio::test]
    async fn test_publish_acks_each_message_in_order() {
        let transport = transport(
            LocalBroker::builder()
                .exchange("orders")
                .bind("orders", "orders.created", "orders-queue")
                .build(),
        );
        let sink = RecordingSink::new();
        let destination = Destination::new("orders", "orders.created");

        let mut session = transport
            .open_session(&destination, sink.clone())
            .await
            .unwrap();
        assert_eq!(session.next_sequence(), 1);
        session.publish(envelope()).await.unwrap();
        assert_eq!(session.next_sequence(), 2);
        session.publish(envelope()).await.unwrap();
        session.close().await.unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 3);
        assert!(matches!(
            events[0],
            SessionEvent::Ack {
                sequence: 1,
                multiple: false
            }
        ));
        assert!(matches!(
            events[1],
            SessionEvent::Ack {
                sequence: 2,
                multiple: false
            }
        ));
        assert!(matches!(
            events[2],
            SessionEvent::Shutdown {
                reply_code: REPLY_CODE_SUCCESS,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unroutable_publish_returns_before_acking() {
        let transport = transport(LocalBroker::builder().exchange("orders").build());
        let sink = RecordingSink::new();
        let destination = Destination::new("orders", "orders.created");

        let mut session = transport
            .open_session(&destination, sink.clone())
            .await
            .unwrap();
        let sent = envelope();
        let sent_id = sent.message_id.clone();
        session.publish(sent).await.unwrap();
        session.close().await.unwrap();

        let events = sink.events();
        match &events[0] {
            SessionEvent::Return {
                message_id,
                reply_code,
                reply_text,
            } => {
                assert_eq!(*message_id, sent_id);
                assert_eq!(*reply_code, 312);
                assert_eq!(reply_text, "NO_ROUTE");
            }
            other => panic!("expected a return first, got {:?}", other),
        }
        assert!(matches!(
            events[1],
            SessionEvent::Ack {
                sequence: 1,
                multiple: false
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_exchange_faults_and_shuts_down() {
        let transport = transport(LocalBroker::builder().build());
        let sink = RecordingSink::new();
        let destination = Destination::new("orders", "orders.created");

        let mut session = transport
            .open_session(&destination, sink.clone())
            .await
            .unwrap();
        let fault = session.publish(envelope()).await.unwrap_err();
        assert!(matches!(fault, PublishFault::ExchangeNotFound { .. }));

        // Further publishes fail without reaching the broker.
        let fault = session.publish(envelope()).await.unwrap_err();
        assert!(matches!(
            fault,
            PublishFault::SessionClosed {
                reply_code: REPLY_CODE_NOT_FOUND,
                ..
            }
        ));
        session.close().await.unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            SessionEvent::Shutdown {
                reply_code: REPLY_CODE_NOT_FOUND,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_cumulative_confirms_cover_the_group() {
        let transport = transport(
            LocalBroker::builder()
                .exchange("orders")
                .bind("orders", "orders.created", "orders-queue")
                .cumulative_every(3)
                .build(),
        );
        let sink = RecordingSink::new();
        let destination = Destination::new("orders", "orders.created");

        let mut session = transport
            .open_session(&destination, sink.clone())
            .await
            .unwrap();
        for _ in 0..3 {
            session.publish(envelope()).await.unwrap();
        }
        session.close().await.unwrap();

        let confirms: Vec<SessionEvent> = sink
            .events()
            .into_iter()
            .filter(|event| matches!(event, SessionEvent::Ack { .. }))
            .collect();
        assert_eq!(confirms.len(), 1);
        assert!(matches!(
            confirms[0],
            SessionEvent::Ack {
                sequence: 3,
                multiple: true
            }
        ));
    }

    #[tokio::test]
    async fn test_scripted_close_emits_shutdown_with_the_reply() {
        let transport = transport(
            LocalBroker::builder()
                .exchange("orders")
                .bind("orders", "orders.created", "orders-queue")
                .close_on(2, 320, "CONNECTION_FORCED - broker restart")
                .build(),
        );
        let sink = RecordingSink::new();
        let destination = Destination::new("orders", "orders.created");

        let mut session = transport
            .open_session(&destination, sink.clone())
            .await
            .unwrap();
        session.publish(envelope()).await.unwrap();
        let fault = session.publish(envelope()).await.unwrap_err();
        assert!(matches!(
            fault,
            PublishFault::SessionClosed {
                reply_code: 320,
                ..
            }
        ));
        session.close().await.unwrap();

        let events = sink.events();
        // Ack for the first publish, then the forced shutdown; no
        // clean-close event after a broker-initiated one.
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], SessionEvent::Ack { sequence: 1, .. }));
        assert!(matches!(
            events[1],
            SessionEvent::Shutdown {
                reply_code: 320,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_shutdown_after_lands_behind_the_confirm() {
        let transport = transport(
            LocalBroker::builder()
                .exchange("orders")
                .bind("orders", "orders.created", "orders-queue")
                .shutdown_after(1, 320, "CONNECTION_FORCED - broker restart")
                .build(),
        );
        let sink = RecordingSink::new();
        let destination = Destination::new("orders", "orders.created");

        let mut session = transport
            .open_session(&destination, sink.clone())
            .await
            .unwrap();
        // The doomed publish itself succeeds.
        session.publish(envelope()).await.unwrap();
        let fault = session.publish(envelope()).await.unwrap_err();
        assert!(matches!(
            fault,
            PublishFault::SessionClosed {
                reply_code: 320,
                ..
            }
        ));
        session.close().await.unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], SessionEvent::Ack { sequence: 1, .. }));
        assert!(matches!(
            events[1],
            SessionEvent::Shutdown {
                reply_code: 320,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_withheld_confirms_emit_nothing() {
        let transport = transport(
            LocalBroker::builder()
                .exchange("orders")
                .bind("orders", "orders.created", "orders-queue")
                .withhold_confirms()
                .build(),
        );
        let sink = RecordingSink::new();
        let destination = Destination::new("orders", "orders.created");

        let mut session = transport
            .open_session(&destination, sink.clone())
            .await
            .unwrap();
        session.publish(envelope()).await.unwrap();
        session.close().await.unwrap();

        // Only the clean shutdown comes through.
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SessionEvent::Shutdown { .. }));
    }

    #[tokio::test]
    async fn test_confirm_delay_defers_acks_without_reordering() {
        let transport = transport(
            LocalBroker::builder()
                .exchange("orders")
                .bind("orders", "orders.created", "orders-queue")
                .confirm_delay(Duration::from_millis(10))
                .build(),
        );
        let sink = RecordingSink::new();
        let destination = Destination::new("orders", "orders.created");

        let mut session = transport
            .open_session(&destination, sink.clone())
            .await
            .unwrap();
        session.publish(envelope()).await.unwrap();
        session.publish(envelope()).await.unwrap();
        assert!(sink.events().is_empty());
        // Closing drains the pipeline, delays included.
        session.close().await.unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], SessionEvent::Ack { sequence: 1, .. }));
        assert!(matches!(events[1], SessionEvent::Ack { sequence: 2, .. }));
    }
}
