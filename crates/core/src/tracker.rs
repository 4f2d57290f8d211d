//! # Confirmation Tracker
//!
//! The campaign aggregate. One tracker owns every [`MessageState`] of a
//! publish campaign and is the only place broker events touch them: the
//! publish loop records transmissions on one task while the transport's
//! I/O task delivers confirmations, returns and shutdowns concurrently,
//! and a single lock around the aggregate serializes them all.
//!
//! Three views exist over the same records:
//!
//! - the canonical list, in submission order, never reordered;
//! - a sequence-number index scoped to the current attempt, rebuilt
//!   empty when the next attempt starts;
//! - a message-id index that persists across attempts, narrowed to the
//!   still-retryable records at each derivation.
//!
//! Discarding the sequence index between attempts is what makes retries
//! idempotent: a confirmation for an old attempt's sequence number can
//! no longer resolve anything. Handles additionally carry the attempt
//! they serve, so a whole event delivered through a previous attempt's
//! sink is dropped outright.

use crate::message::{MessageId, MessageState, OutboundMessage};
use crate::report::CampaignReport;
use crate::status::SendStatus;
use crate::transport::{SessionEvent, SessionEventSink, REPLY_CODE_NOT_FOUND, REPLY_CODE_SUCCESS};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

/// Outcome of a bounded wait for outstanding confirmations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmWait {
    /// Every message transmitted this attempt is settled.
    Confirmed,
    /// The attempt was interrupted while waiting.
    Interrupted,
    /// The bound lapsed with confirmations still outstanding.
    TimedOut,
}

struct CampaignState<T> {
    /// Canonical records in submission order.
    states: Vec<MessageState<T>>,
    /// Sequence number -> index into `states`, current attempt only.
    /// Ordered so cumulative confirmations apply in increasing sequence
    /// order.
    by_sequence: BTreeMap<u64, usize>,
    /// Message id -> index into `states`, narrowed to retryable records
    /// when an attempt is derived.
    by_id: HashMap<MessageId, usize>,
    /// Highest sequence number settled by a cumulative confirmation.
    /// Everything at or below it was already swept, so the next range
    /// apply starts one past it.
    confirmed_watermark: u64,
    /// Attempt the sequence index belongs to.
    current_attempt: u32,
    interruption_reason: Option<String>,
    unexpected_error: Option<String>,
    started_at: DateTime<Utc>,
}

struct TrackerShared<T> {
    state: Mutex<CampaignState<T>>,
    /// Broker events delivered to this campaign, counted outside the
    /// lock. Includes events that no longer matched a pending record.
    events_delivered: AtomicU64,
    /// Wakes checkpoint waiters whenever a record settles or the
    /// attempt is interrupted.
    progress: Notify,
}

/// Handle to one campaign's tracking state.
///
/// Cloning is cheap and shares the aggregate; each handle remembers the
/// attempt it was derived for, and apply operations arriving through a
/// stale handle are ignored.
pub struct ConfirmationTracker<T> {
    shared: Arc<TrackerShared<T>>,
    attempt: u32,
}

impl<T> Clone for ConfirmationTracker<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            attempt: self.attempt,
        }
    }
}

impl<T> ConfirmationTracker<T> {
    /// Build the campaign: one `PendingSend` record per payload, in the
    /// given order, each with a fresh campaign-unique id.
    pub fn register(payloads: Vec<T>) -> Self {
        let states: Vec<MessageState<T>> = payloads.into_iter().map(MessageState::new).collect();
        let by_id = states
            .iter()
            .enumerate()
            .map(|(index, state)| (state.id.clone(), index))
            .collect();

        Self {
            shared: Arc::new(TrackerShared {
                state: Mutex::new(CampaignState {
                    states,
                    by_sequence: BTreeMap::new(),
                    by_id,
                    confirmed_watermark: 0,
                    current_attempt: 1,
                    interruption_reason: None,
                    unexpected_error: None,
                    started_at: Utc::now(),
                }),
                events_delivered: AtomicU64::new(0),
                progress: Notify::new(),
            }),
            attempt: 1,
        }
    }

    /// The attempt this handle serves, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Attempts started so far across the campaign.
    pub fn attempts_made(&self) -> u32 {
        self.shared.state.lock().unwrap().current_attempt
    }

    /// Number of messages tracked by the campaign.
    pub fn message_count(&self) -> usize {
        self.shared.state.lock().unwrap().states.len()
    }

    /// Broker events delivered to this campaign so far.
    pub fn confirmation_events(&self) -> u64 {
        self.shared.events_delivered.load(Ordering::Relaxed)
    }

    /// Index a transmission under its session sequence number and move
    /// the record to `PendingResponse`, bumping its send count.
    ///
    /// Must happen before the actual transmit: the broker may confirm
    /// faster than the publish call returns, and the confirmation needs
    /// the index entry to land on.
    pub fn record_transmission(&self, message_id: &MessageId, sequence_number: u64) {
        let mut state = self.shared.state.lock().unwrap();
        debug_assert_eq!(self.attempt, state.current_attempt);
        debug_assert!(
            state
                .by_sequence
                .keys()
                .next_back()
                .map_or(true, |last| sequence_number > *last),
            "sequence numbers must increase within an attempt"
        );

        let index = match state.by_id.get(message_id) {
            Some(&index) => index,
            None => {
                warn!("transmission recorded for unknown message {}", message_id);
                return;
            }
        };
        state.states[index].mark_transmitted(sequence_number);
        state.by_sequence.insert(sequence_number, index);
    }

    /// Apply an ack (`status = Success`) or nack (`status = Failed`).
    ///
    /// With `multiple` set, every record still awaiting a response with
    /// a sequence number up to and including `sequence_number` settles
    /// in increasing order and the watermark advances; otherwise only
    /// the exact sequence number settles. Records that are no longer
    /// `PendingResponse` are left alone: a returned message keeps
    /// `Unroutable` when its ack arrives afterwards.
    pub fn apply_confirmation(
        &self,
        sequence_number: u64,
        multiple: bool,
        status: SendStatus,
        description: &str,
    ) {
        if !matches!(status, SendStatus::Success | SendStatus::Failed) {
            warn!("ignoring confirmation carrying non-confirmation status {}", status);
            return;
        }
        self.shared.events_delivered.fetch_add(1, Ordering::Relaxed);

        let mut settled = 0usize;
        {
            let mut state = self.shared.state.lock().unwrap();
            if self.attempt != state.current_attempt {
                trace!(
                    "dropping confirmation for sequence {} from attempt {}",
                    sequence_number, self.attempt
                );
                return;
            }

            let indexes: Vec<usize> = if multiple {
                // A cumulative confirmation below the watermark has
                // nothing left to sweep; the range would be inverted.
                let from = state.confirmed_watermark + 1;
                if sequence_number < from {
                    Vec::new()
                } else {
                    state
                        .by_sequence
                        .range(from..=sequence_number)
                        .map(|(_, &index)| index)
                        .collect()
                }
            } else {
                state
                    .by_sequence
                    .get(&sequence_number)
                    .copied()
                    .into_iter()
                    .collect()
            };

            for index in indexes {
                let record = &mut state.states[index];
                if record.status.accepts_confirmation() {
                    record.resolve(status, description);
                    settled += 1;
                }
            }

            if multiple {
                state.confirmed_watermark = state.confirmed_watermark.max(sequence_number);
            }
        }

        if settled > 0 {
            self.shared.progress.notify_waiters();
        } else {
            trace!("confirmation for sequence {} settled nothing", sequence_number);
        }
    }

    /// Apply a broker return: the message could not be routed to any
    /// queue. Keyed by message id because returns carry no sequence
    /// number. Settles any still-retryable record as `Unroutable`; the
    /// matching ack that follows is then ignored.
    pub fn apply_return(&self, message_id: &MessageId, description: &str) {
        self.shared.events_delivered.fetch_add(1, Ordering::Relaxed);

        let mut settled = false;
        {
            let mut state = self.shared.state.lock().unwrap();
            if self.attempt != state.current_attempt {
                trace!("dropping return for {} from attempt {}", message_id, self.attempt);
                return;
            }

            let index = match state.by_id.get(message_id) {
                Some(&index) => index,
                None => {
                    trace!("return for unknown message {}", message_id);
                    return;
                }
            };
            let record = &mut state.states[index];
            if record.status.can_retry() {
                record.resolve(SendStatus::Unroutable, description);
                settled = true;
            }
        }

        if settled {
            self.shared.progress.notify_waiters();
        }
    }

    /// The destination exchange does not exist: settle every
    /// not-yet-settled record of the attempt as `NoExchangeFound` and
    /// interrupt the attempt. Records settled in earlier attempts
    /// (`Success`, `Unroutable`) are never overwritten.
    pub fn apply_no_exchange_found(&self, description: &str) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if self.attempt != state.current_attempt {
                trace!("dropping exchange-not-found from attempt {}", self.attempt);
                return;
            }

            let indexes: Vec<usize> = state.by_id.values().copied().collect();
            for index in indexes {
                let record = &mut state.states[index];
                if record.status.can_retry() {
                    record.resolve(SendStatus::NoExchangeFound, description);
                }
            }
            if state.interruption_reason.is_none() {
                state.interruption_reason = Some(description.to_string());
            }
        }
        self.shared.progress.notify_waiters();
    }

    /// Record an unexpected session closure. Message statuses stay
    /// untouched; whatever is still `PendingResponse` becomes
    /// `PossiblyLost` when the attempt closes. The first recorded
    /// reason wins so the report stays deterministic when a publish
    /// fault and its shutdown event both arrive.
    pub fn apply_channel_closed(&self, reason: &str) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if self.attempt != state.current_attempt {
                trace!("dropping session closure from attempt {}", self.attempt);
                return;
            }
            if state.interruption_reason.is_none() {
                state.interruption_reason = Some(reason.to_string());
            } else {
                debug!("additional session closure ignored: {}", reason);
            }
        }
        self.shared.progress.notify_waiters();
    }

    /// Record a transport error thrown at the attempt boundary. Like a
    /// session closure, this interrupts the attempt without touching
    /// message statuses.
    pub fn apply_unexpected_error(&self, error: impl std::fmt::Display) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if self.attempt != state.current_attempt {
                return;
            }
            if state.unexpected_error.is_none() {
                state.unexpected_error = Some(error.to_string());
            }
        }
        self.shared.progress.notify_waiters();
    }

    /// Whether the current attempt has been interrupted by a session
    /// closure, an exchange-not-found or an unexpected error.
    pub fn interrupted(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.interruption_reason.is_some() || state.unexpected_error.is_some()
    }

    /// True while at least one record could still be resubmitted.
    pub fn should_retry(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.states.iter().any(|record| record.status.can_retry())
    }

    /// The retryable records in canonical order, as transmit views for
    /// the next publish pass.
    pub fn retryable_messages(&self) -> Vec<OutboundMessage<T>> {
        let state = self.shared.state.lock().unwrap();
        state
            .states
            .iter()
            .filter(|record| record.status.can_retry())
            .map(|record| OutboundMessage {
                id: record.id.clone(),
                payload: Arc::clone(&record.payload),
                send_count: record.send_count,
            })
            .collect()
    }

    /// Settle everything still `PendingResponse` as `PossiblyLost`.
    /// Called when the attempt releases its session: whatever the
    /// broker never answered for has an unknown outcome and is retried
    /// rather than dropped.
    pub fn close_attempt(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if self.attempt != state.current_attempt {
            return;
        }
        for record in state.states.iter_mut() {
            if record.status == SendStatus::PendingResponse {
                record.mark_possibly_lost("no confirmation before the session was released");
            }
        }
    }

    /// Derive the tracker for the next attempt: same records, sequence
    /// index cleared, id index narrowed to the retryable records, their
    /// per-attempt fields reset. Interruption diagnostics are cleared;
    /// they describe one attempt, and the new one starts clean.
    pub fn next_attempt_tracker(&self) -> Self {
        let next_attempt;
        {
            let mut state = self.shared.state.lock().unwrap();
            state.by_sequence.clear();
            state.confirmed_watermark = 0;
            state.interruption_reason = None;
            state.unexpected_error = None;
            state.current_attempt += 1;
            next_attempt = state.current_attempt;

            let retryable: Vec<(MessageId, usize)> = state
                .states
                .iter()
                .enumerate()
                .filter(|(_, record)| record.status.can_retry())
                .map(|(index, record)| (record.id.clone(), index))
                .collect();
            for (_, index) in &retryable {
                state.states[*index].reset_for_next_attempt();
            }
            state.by_id = retryable.into_iter().collect();
        }

        Self {
            shared: Arc::clone(&self.shared),
            attempt: next_attempt,
        }
    }

    /// Wait until every message transmitted this attempt is settled,
    /// bounded by `timeout`. Returns early when the attempt is
    /// interrupted. Only the publish loop suspends here; event delivery
    /// never blocks on it.
    pub async fn await_confirmations(&self, timeout: Duration) -> ConfirmWait {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.progress.notified();
            tokio::pin!(notified);
            // Register for wakeups before re-checking, so a record that
            // settles between the check and the await still wakes us.
            notified.as_mut().enable();

            {
                let state = self.shared.state.lock().unwrap();
                if state.interruption_reason.is_some() || state.unexpected_error.is_some() {
                    return ConfirmWait::Interrupted;
                }
                let outstanding = state
                    .states
                    .iter()
                    .any(|record| record.status == SendStatus::PendingResponse);
                if !outstanding {
                    return ConfirmWait::Confirmed;
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return ConfirmWait::TimedOut;
            }
        }
    }

    /// Snapshot the campaign as its final report.
    pub fn final_report(&self) -> CampaignReport<T> {
        let state = self.shared.state.lock().unwrap();
        CampaignReport {
            states: state.states.clone(),
            attempts_made: state.current_attempt,
            interrupted: state.interruption_reason.is_some() || state.unexpected_error.is_some(),
            interruption_reason: state.interruption_reason.clone(),
            unexpected_error: state.unexpected_error.clone(),
            started_at: state.started_at,
            finished_at: Utc::now(),
        }
    }
}

impl<T: Send + Sync + 'static> SessionEventSink for ConfirmationTracker<T> {
    fn deliver(&self, event: SessionEvent) {
        match event {
            SessionEvent::Ack { sequence, multiple } => {
                self.apply_confirmation(sequence, multiple, SendStatus::Success, "");
            }
            SessionEvent::Nack { sequence, multiple } => {
                self.apply_confirmation(sequence, multiple, SendStatus::Failed, "rejected by broker");
            }
            SessionEvent::Return {
                message_id,
                reply_code,
                reply_text,
            } => {
                let description =
                    format!("returned by broker (reply code {}): {}", reply_code, reply_text);
                self.apply_return(&message_id, &description);
            }
            SessionEvent::Shutdown {
                reply_code,
                reply_text,
            } => {
                if reply_code == REPLY_CODE_SUCCESS {
                    return;
                }
                let reason = format!("session closed with reply code {}: {}", reply_code, reply_text);
                if reply_code == REPLY_CODE_NOT_FOUND {
                    self.apply_no_exchange_found(&reason);
                } else {
                    self.apply_channel_closed(&reason);
                }
            }
        }
    }
}
