//! Core identifier and enum types shared across the courier.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Database ID of an org (tenant).
pub type OrgId = i64;

/// Database ID of a channel.
pub type ChannelId = i64;

/// Database ID of a contact.
pub type ContactId = i64;

/// Database ID of a contact URN row.
pub type ContactUrnId = i64;

/// Database ID of a message.
pub type MsgId = i64;

/// Lifecycle status of a message.
///
/// `errored` is retryable; `failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MsgStatusValue {
    /// Created but not yet handed to anything.
    Pending,
    /// Sitting on a delivery queue.
    Queued,
    /// Accepted by the downstream gateway.
    Wired,
    /// Reported sent by the gateway.
    Sent,
    /// Confirmed delivered to the handset.
    Delivered,
    /// Send failed but may be retried.
    Errored,
    /// Send failed permanently.
    Failed,
}

impl MsgStatusValue {
    /// Stable string form used in the database and queue payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Wired => "wired",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Errored => "errored",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for MsgStatusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MsgStatusValue {
    type Err = UnknownStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "wired" => Ok(Self::Wired),
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "errored" => Ok(Self::Errored),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownStatusError(other.to_owned())),
        }
    }
}

/// A status string that does not name any known message status.
///
/// Handlers hit this when a gateway callback carries a code outside the
/// mapping they maintain; the offending value is preserved for the error
/// message.
#[derive(Debug, thiserror::Error)]
#[error("unknown message status '{0}'")]
pub struct UnknownStatusError(pub String);

/// Delivery priority tier of a message.
///
/// Default always preempts bulk at pop time; within a tier delivery is
/// FIFO by push order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MsgPriority {
    /// Low-priority batch traffic.
    Bulk,
    /// Normal interactive traffic.
    Default,
}

impl MsgPriority {
    /// Tier index used in queue key names (bulk = 0, default = 1).
    pub fn tier(self) -> u8 {
        match self {
            Self::Bulk => 0,
            Self::Default => 1,
        }
    }

    /// Stable string form used in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bulk => "bulk",
            Self::Default => "default",
        }
    }
}

impl fmt::Display for MsgPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MsgPriority {
    type Err = UnknownPriorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bulk" => Ok(Self::Bulk),
            "default" => Ok(Self::Default),
            other => Err(UnknownPriorityError(other.to_owned())),
        }
    }
}

/// A priority string outside the two known tiers.
#[derive(Debug, thiserror::Error)]
#[error("unknown message priority '{0}'")]
pub struct UnknownPriorityError(pub String);

/// Direction of a message relative to the courier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Received from a gateway.
    In,
    /// Bound for a gateway.
    Out,
}

impl Direction {
    /// Stable string form used in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
        }
    }
}
