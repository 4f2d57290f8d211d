//! # Campaign Report
//!
//! Immutable snapshot handed back when a campaign finishes: the final
//! record of every message plus the campaign-level diagnostics. The
//! helpers answer the questions callers actually ask afterwards, such
//! as which messages may have been delivered twice and which outcomes
//! are still unknown.

use crate::message::MessageState;
use crate::status::SendStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Final outcome of a publish campaign.
#[derive(Debug, Serialize)]
pub struct CampaignReport<T> {
    /// One record per registered message, in submission order.
    pub states: Vec<MessageState<T>>,
    /// Attempts started, including the first.
    pub attempts_made: u32,
    /// Whether the last attempt ended by interruption rather than by
    /// settling every message.
    pub interrupted: bool,
    /// Why the last attempt was cut short, if it was.
    pub interruption_reason: Option<String>,
    /// Transport error that aborted the last attempt, if any.
    pub unexpected_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl<T> Clone for CampaignReport<T> {
    fn clone(&self) -> Self {
        Self {
            states: self.states.clone(),
            attempts_made: self.attempts_made,
            interrupted: self.interrupted,
            interruption_reason: self.interruption_reason.clone(),
            unexpected_error: self.unexpected_error.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// How many messages ended in one status, with one description kept as
/// an example of what the broker said.
#[derive(Debug, Clone, Serialize)]
pub struct StatusCount {
    pub status: SendStatus,
    pub count: usize,
    pub sample_description: Option<String>,
}

impl<T> CampaignReport<T> {
    /// Retries performed beyond the initial attempt.
    pub fn retries_made(&self) -> u32 {
        self.attempts_made.saturating_sub(1)
    }

    /// Wall-clock time the campaign took.
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    /// True when every message was confirmed delivered.
    pub fn all_delivered(&self) -> bool {
        self.states.iter().all(|state| state.status == SendStatus::Success)
    }

    /// Messages transmitted more than once, whatever their outcome.
    pub fn republished_count(&self) -> usize {
        self.states.iter().filter(|state| state.send_count > 1).count()
    }

    /// Messages confirmed delivered after more than one transmission.
    /// Consumers may have seen these more than once, so they are the
    /// candidates for downstream deduplication.
    pub fn possible_duplicates(&self) -> Vec<&MessageState<T>> {
        self.states
            .iter()
            .filter(|state| state.status == SendStatus::Success && state.send_count > 1)
            .collect()
    }

    pub fn has_possible_duplicates(&self) -> bool {
        self.states
            .iter()
            .any(|state| state.status == SendStatus::Success && state.send_count > 1)
    }

    /// Messages whose delivery outcome is unknown: transmitted at least
    /// once but never answered by the broker.
    pub fn unresolved(&self) -> Vec<&MessageState<T>> {
        self.states
            .iter()
            .filter(|state| {
                matches!(
                    state.status,
                    SendStatus::PendingResponse | SendStatus::PossiblyLost
                )
            })
            .collect()
    }

    pub fn has_unknown_outcomes(&self) -> bool {
        !self.unresolved().is_empty()
    }

    /// Per-status totals over the final records, skipping statuses no
    /// message ended in.
    pub fn status_counts(&self) -> Vec<StatusCount> {
        SendStatus::ALL
            .iter()
            .filter_map(|status| {
                let mut count = 0;
                let mut sample_description = None;
                for state in &self.states {
                    if state.status == *status {
                        count += 1;
                        if sample_description.is_none() && !state.description.is_empty() {
                            sample_description = Some(state.description.clone());
                        }
                    }
                }
                if count == 0 {
                    None
                } else {
                    Some(StatusCount {
                        status: *status,
                        count,
                        sample_description,
                    })
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageState;

    fn record(status: SendStatus, send_count: u32, description: &str) -> MessageState<&'static str> {
        let mut state = MessageState::new("payload");
        for sequence in 1..=send_count as u64 {
            state.mark_transmitted(sequence);
        }
        if status != SendStatus::PendingResponse && status != SendStatus::PendingSend {
            if status == SendStatus::PossiblyLost {
                state.mark_possibly_lost(description);
            } else {
                state.resolve(status, description);
            }
        }
        state
    }

    fn report(states: Vec<MessageState<&'static str>>, attempts_made: u32) -> CampaignReport<&'static str> {
        let started_at = Utc::now();
        CampaignReport {
            states,
            attempts_made,
            interrupted: false,
            interruption_reason: None,
            unexpected_error: None,
            started_at,
            finished_at: started_at,
        }
    }

    #[test]
    fn test_status_counts_skip_absent_statuses() {
        let report = report(
            vec![
                record(SendStatus::Success, 1, ""),
                record(SendStatus::Success, 1, ""),
                record(SendStatus::Unroutable, 1, "returned by broker (reply code 312): NO_ROUTE"),
            ],
            1,
        );

        let counts = report.status_counts();
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[0].status, SendStatus::Success);
        assert_eq!(counts[0].count, 2);
        assert_eq!(counts[0].sample_description, None);
        assert_eq!(counts[1].status, SendStatus::Unroutable);
        assert_eq!(counts[1].count, 1);
        assert!(counts[1]
            .sample_description
            .as_deref()
            .is_some_and(|d| d.contains("NO_ROUTE")));
    }

    #[test]
    fn test_possible_duplicates_need_success_and_a_resend() {
        let report = report(
            vec![
                record(SendStatus::Success, 2, ""),
                record(SendStatus::Success, 1, ""),
                record(SendStatus::Failed, 3, "rejected by broker"),
            ],
            3,
        );

        assert!(report.has_possible_duplicates());
        assert_eq!(report.possible_duplicates().len(), 1);
        assert_eq!(report.possible_duplicates()[0].send_count, 2);
        // Republished counts any resend, delivered or not.
        assert_eq!(report.republished_count(), 2);
    }

    #[test]
    fn test_unresolved_covers_unanswered_transmissions() {
        let report = report(
            vec![
                record(SendStatus::Success, 1, ""),
                record(SendStatus::PendingResponse, 1, ""),
                record(SendStatus::PossiblyLost, 1, "no confirmation before the session was released"),
                record(SendStatus::PendingSend, 0, ""),
            ],
            1,
        );

        assert!(report.has_unknown_outcomes());
        assert_eq!(report.unresolved().len(), 2);
        assert!(!report.all_delivered());
    }

    #[test]
    fn test_retries_made_is_attempts_beyond_the_first() {
        assert_eq!(report(vec![], 1).retries_made(), 0);
        assert_eq!(report(vec![], 3).retries_made(), 2);
    }

    #[test]
    fn test_all_delivered() {
        let delivered = report(
            vec![record(SendStatus::Success, 1, ""), record(SendStatus::Success, 2, "")],
            2,
        );
        assert!(delivered.all_delivered());
        assert!(delivered.has_possible_duplicates());
    }
}
