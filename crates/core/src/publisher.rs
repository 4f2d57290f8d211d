//! # Bulk Publisher
//!
//! The campaign driver. Feeds a batch of messages through a publish
//! session in confirm mode, checkpoints on confirmations at batch
//! boundaries, and resubmits whatever is still retryable until the
//! retry policy is exhausted. Broker events land on the tracker through
//! the session's event sink while this loop runs; the loop itself only
//! publishes and waits.

use crate::config::{BatchPolicy, RetryPolicy};
use crate::message::OutboundMessage;
use crate::report::CampaignReport;
use crate::tracker::{ConfirmWait, ConfirmationTracker};
use crate::transport::{
    Destination, MessageEnvelope, PublishFault, PublishSession, PublishTransport, SessionEventSink,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Publishes batches of messages with at-least-once delivery.
///
/// The transport is shared and long-lived; each campaign opens its own
/// session per attempt so interruptions never leak state across
/// attempts.
pub struct BulkPublisher<Tr> {
    transport: Arc<Tr>,
}

impl<Tr> BulkPublisher<Tr>
where
    Tr: PublishTransport,
{
    pub fn new(transport: Arc<Tr>) -> Self {
        Self { transport }
    }

    /// Publish a batch in a single attempt and report every outcome.
    pub async fn send_messages<T>(
        &self,
        destination: &Destination,
        payloads: Vec<T>,
        policy: &BatchPolicy,
    ) -> CampaignReport<T>
    where
        T: Serialize + Send + Sync + 'static,
    {
        self.run_campaign(destination, payloads, policy, None).await
    }

    /// Publish a batch, resubmitting retryable messages until they are
    /// settled or the retry limit is spent.
    pub async fn send_messages_with_retry<T>(
        &self,
        destination: &Destination,
        payloads: Vec<T>,
        policy: &BatchPolicy,
        retry: &RetryPolicy,
    ) -> CampaignReport<T>
    where
        T: Serialize + Send + Sync + 'static,
    {
        self.run_campaign(destination, payloads, policy, Some(retry)).await
    }

    /// Publish one message in a single attempt.
    pub async fn send_message<T>(
        &self,
        destination: &Destination,
        payload: T,
        policy: &BatchPolicy,
    ) -> CampaignReport<T>
    where
        T: Serialize + Send + Sync + 'static,
    {
        self.run_campaign(destination, vec![payload], policy, None).await
    }

    /// Publish one message with retries.
    pub async fn send_message_with_retry<T>(
        &self,
        destination: &Destination,
        payload: T,
        policy: &BatchPolicy,
        retry: &RetryPolicy,
    ) -> CampaignReport<T>
    where
        T: Serialize + Send + Sync + 'static,
    {
        self.run_campaign(destination, vec![payload], policy, Some(retry))
            .await
    }

    async fn run_campaign<T>(
        &self,
        destination: &Destination,
        payloads: Vec<T>,
        policy: &BatchPolicy,
        retry: Option<&RetryPolicy>,
    ) -> CampaignReport<T>
    where
        T: Serialize + Send + Sync + 'static,
    {
        let mut tracker = ConfirmationTracker::register(payloads);
        let max_attempts = retry.map_or(1, |policy| policy.retry_limit.saturating_add(1));
        let retry_period = retry.map_or(Duration::ZERO, |policy| policy.retry_period);

        let mut attempt = 1u32;
        loop {
            let outbound = tracker.retryable_messages();
            if outbound.is_empty() {
                break;
            }
            info!(
                "publish attempt {} of {}: {} message(s) to {}",
                attempt,
                max_attempts,
                outbound.len(),
                destination
            );
            self.run_attempt(destination, &tracker, outbound, policy).await;

            if attempt >= max_attempts || !tracker.should_retry() {
                break;
            }
            if !retry_period.is_zero() {
                sleep(retry_period).await;
            }
            tracker = tracker.next_attempt_tracker();
            attempt += 1;
        }

        let report = tracker.final_report();
        if report.all_delivered() {
            info!(
                "campaign to {} delivered all {} message(s) in {} attempt(s)",
                destination,
                report.states.len(),
                report.attempts_made
            );
        } else {
            warn!(
                "campaign to {} ended with undelivered messages after {} attempt(s)",
                destination, report.attempts_made
            );
        }
        report
    }

    /// One pass over the retryable messages: open a session, publish
    /// each message under a fresh sequence number, checkpoint at batch
    /// boundaries, then release the session. Any interruption ends the
    /// pass early; the tracker decides what that means per message.
    async fn run_attempt<T>(
        &self,
        destination: &Destination,
        tracker: &ConfirmationTracker<T>,
        outbound: Vec<OutboundMessage<T>>,
        policy: &BatchPolicy,
    ) where
        T: Serialize + Send + Sync + 'static,
    {
        let sink: Arc<dyn SessionEventSink> = Arc::new(tracker.clone());
        let mut session = match self.transport.open_session(destination, sink).await {
            Ok(session) => session,
            Err(error) => {
                error!("failed to open a publish session to {}: {:?}", destination, error);
                tracker.apply_unexpected_error(format!("{:?}", error));
                return;
            }
        };

        let mut since_checkpoint = 0usize;
        for message in outbound {
            if tracker.interrupted() {
                break;
            }

            let body = match serde_json::to_vec(message.payload.as_ref()) {
                Ok(body) => body,
                Err(error) => {
                    error!("failed to serialize message {}: {}", message.id, error);
                    tracker.apply_unexpected_error(format!(
                        "failed to serialize message {}: {}",
                        message.id, error
                    ));
                    break;
                }
            };

            // Index the transmission before handing it to the session:
            // the broker can confirm faster than publish returns.
            let sequence_number = session.next_sequence();
            tracker.record_transmission(&message.id, sequence_number);

            let envelope = MessageEnvelope {
                message_id: message.id.clone(),
                body,
                republished: message.send_count > 0,
            };
            match session.publish(envelope).await {
                Ok(()) => {}
                Err(PublishFault::ExchangeNotFound { reply_text }) => {
                    warn!("no exchange for {}: {}", destination, reply_text);
                    tracker.apply_no_exchange_found(&format!("exchange not found: {}", reply_text));
                    break;
                }
                Err(PublishFault::SessionClosed {
                    reply_code,
                    reply_text,
                }) => {
                    warn!(
                        "publish session to {} closed with reply code {}: {}",
                        destination, reply_code, reply_text
                    );
                    tracker.apply_channel_closed(&format!(
                        "session closed with reply code {}: {}",
                        reply_code, reply_text
                    ));
                    break;
                }
                Err(PublishFault::Other(error)) => {
                    error!("publish failed for message {}: {:?}", message.id, error);
                    tracker.apply_unexpected_error(format!("{:?}", error));
                    break;
                }
            }

            since_checkpoint += 1;
            if since_checkpoint >= policy.message_batch_size() {
                since_checkpoint = 0;
                if !self.checkpoint(tracker, policy).await {
                    break;
                }
            }
        }

        if !tracker.interrupted()
            && self.checkpoint(tracker, policy).await
            && !policy.safety_period().is_zero()
        {
            // Confirms are in; linger briefly so late returns still
            // land before the session goes away.
            sleep(policy.safety_period()).await;
        }

        if let Err(error) = session.close().await {
            debug!("closing the publish session returned an error: {:?}", error);
        }
        tracker.close_attempt();
    }

    /// Wait for every outstanding confirmation of this attempt. Returns
    /// false when the attempt cannot usefully continue.
    async fn checkpoint<T>(&self, tracker: &ConfirmationTracker<T>, policy: &BatchPolicy) -> bool {
        match tracker.await_confirmations(policy.confirm_timeout()).await {
            ConfirmWait::Confirmed => true,
            ConfirmWait::Interrupted => false,
            ConfirmWait::TimedOut => {
                warn!(
                    "confirmations still outstanding after {:?}",
                    policy.confirm_timeout()
                );
                tracker.apply_channel_closed("confirmation checkpoint timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::SendStatus;
    use crate::transport::SessionEvent;
    use async_trait::async_trait;

    #[derive(Debug)]
    struct FakeError;

    /// Confirms every publish synchronously through the sink.
    struct AckTransport;

    struct AckSession {
        sink: Arc<dyn SessionEventSink>,
        next: u64,
    }

    #[async_trait]
    impl PublishSession for AckSession {
        type Error = FakeError;

        fn next_sequence(&self) -> u64 {
            self.next
        }

        async fn publish(
            &mut self,
            _envelope: MessageEnvelope,
        ) -> Result<(), PublishFault<FakeError>> {
            let sequence = self.next;
            self.next += 1;
            self.sink.deliver(SessionEvent::Ack {
                sequence,
                multiple: false,
            });
            Ok(())
        }

        async fn close(self) -> Result<(), FakeError> {
            Ok(())
        }
    }

    #[async_trait]
    impl PublishTransport for AckTransport {
        type Error = FakeError;
        type Session = AckSession;

        async fn open_session(
            &self,
            _destination: &Destination,
            sink: Arc<dyn SessionEventSink>,
        ) -> Result<AckSession, FakeError> {
            Ok(AckSession { sink, next: 1 })
        }
    }

    /// Never opens a session.
    struct FailingTransport;

    #[async_trait]
    impl PublishTransport for FailingTransport {
        type Error = FakeError;
        type Session = AckSession;

        async fn open_session(
            &self,
            _destination: &Destination,
            _sink: Arc<dyn SessionEventSink>,
        ) -> Result<AckSession, FakeError> {
            Err(FakeError)
        }
    }

    #[tokio::test]
    async fn test_delivers_every_message_once() {
        let publisher = BulkPublisher::new(Arc::new(AckTransport));
        let destination = Destination::new("orders", "created");
        let policy = BatchPolicy::new(1, Duration::ZERO).unwrap();

        let report = publisher
            .send_messages(&destination, vec!["a", "b", "c"], &policy)
            .await;

        assert!(report.all_delivered());
        assert_eq!(report.attempts_made, 1);
        assert!(report.states.iter().all(|s| s.send_count == 1));
        assert!(!report.has_possible_duplicates());
    }

    #[tokio::test]
    async fn test_empty_batch_never_touches_the_transport() {
        let publisher = BulkPublisher::new(Arc::new(FailingTransport));
        let destination = Destination::new("orders", "created");
        let policy = BatchPolicy::default();

        let report = publisher
            .send_messages(&destination, Vec::<&str>::new(), &policy)
            .await;

        assert!(report.states.is_empty());
        assert!(!report.interrupted);
        assert_eq!(report.attempts_made, 1);
    }

    #[tokio::test]
    async fn test_failed_session_open_interrupts_the_campaign() {
        let publisher = BulkPublisher::new(Arc::new(FailingTransport));
        let destination = Destination::new("orders", "created");
        let policy = BatchPolicy::new(1, Duration::ZERO).unwrap();

        let report = publisher
            .send_message(&destination, "payload", &policy)
            .await;

        assert!(report.interrupted);
        assert!(report.unexpected_error.is_some());
        assert_eq!(report.states[0].status, SendStatus::PendingSend);
        assert_eq!(report.states[0].send_count, 0);
    }
}
