//! # Send Status
//!
//! Per-message delivery status across a publish campaign. A message moves
//! from `PendingSend` to `PendingResponse` when it is written to the
//! session, and from there to one of the settled statuses as broker
//! events arrive. `PossiblyLost` marks messages whose attempt ended
//! without any confirmation; `NoExchangeFound` settles the whole attempt
//! when the destination exchange does not exist.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Delivery status of one message within a publish campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendStatus {
    /// Not yet written to a session in any attempt.
    PendingSend,
    /// Written to the current attempt's session, confirmation outstanding.
    PendingResponse,
    /// Positively confirmed by the broker.
    Success,
    /// Negatively confirmed (nack). Retried on the next attempt.
    Failed,
    /// Returned by the broker: no queue is bound for the routing key.
    Unroutable,
    /// The attempt ended before any confirmation arrived. The true
    /// outcome is unknown; the message is retried rather than dropped.
    PossiblyLost,
    /// The destination exchange does not exist. Settles every message of
    /// the attempt and stops the campaign.
    NoExchangeFound,
}

impl SendStatus {
    /// All statuses in declaration order, for report summaries.
    pub const ALL: [SendStatus; 7] = [
        SendStatus::PendingSend,
        SendStatus::PendingResponse,
        SendStatus::Success,
        SendStatus::Failed,
        SendStatus::Unroutable,
        SendStatus::PossiblyLost,
        SendStatus::NoExchangeFound,
    ];

    /// True when a message in this status is resubmitted on the next
    /// attempt. `Success` and `Unroutable` are settled for good
    /// (retrying a returned message will not make it routable), and
    /// `NoExchangeFound` stops the campaign outright.
    pub fn can_retry(&self) -> bool {
        !matches!(
            self,
            SendStatus::Success | SendStatus::Unroutable | SendStatus::NoExchangeFound
        )
    }

    /// True while the campaign still owes this message an outcome.
    pub fn is_pending(&self) -> bool {
        matches!(self, SendStatus::PendingSend | SendStatus::PendingResponse)
    }

    /// True when an ack or nack for this message's sequence number may
    /// still be applied. A return settles the message first, so a later
    /// ack for the same sequence number must find this false.
    pub fn accepts_confirmation(&self) -> bool {
        matches!(self, SendStatus::PendingResponse)
    }

    /// True when no further event can change this status within the
    /// current attempt.
    pub fn is_settled(&self) -> bool {
        !self.is_pending()
    }
}

impl fmt::Display for SendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendStatus::PendingSend => write!(f, "PENDING_SEND"),
            SendStatus::PendingResponse => write!(f, "PENDING_RESPONSE"),
            SendStatus::Success => write!(f, "SUCCESS"),
            SendStatus::Failed => write!(f, "FAILED"),
            SendStatus::Unroutable => write!(f, "UNROUTABLE"),
            SendStatus::PossiblyLost => write!(f, "POSSIBLY_LOST"),
            SendStatus::NoExchangeFound => write!(f, "NO_EXCHANGE_FOUND"),
        }
    }
}

impl FromStr for SendStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING_SEND" => Ok(SendStatus::PendingSend),
            "PENDING_RESPONSE" => Ok(SendStatus::PendingResponse),
            "SUCCESS" => Ok(SendStatus::Success),
            "FAILED" => Ok(SendStatus::Failed),
            "UNROUTABLE" => Ok(SendStatus::Unroutable),
            "POSSIBLY_LOST" => Ok(SendStatus::PossiblyLost),
            "NO_EXCHANGE_FOUND" => Ok(SendStatus::NoExchangeFound),
            _ => Err(format!("Invalid SendStatus: {}", s)),
        }
    }
}
