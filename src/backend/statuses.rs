//! Status updates flowing back from gateways, with their request logs.

use tracing::debug;

use super::{contacts, Backend, BackendError};
use crate::backend::messages::Msg;
use crate::channels::Channel;
use crate::types::{ChannelId, MsgId, MsgStatusValue};

/// One logged HTTP round trip (or failure) against a gateway.
#[derive(Debug, Clone)]
pub struct ChannelLog {
    /// Human-readable label, e.g. "Message Sent".
    pub description: String,
    /// Whether this round trip failed.
    pub is_error: bool,
    /// Request URL.
    pub url: Option<String>,
    /// Raw request body.
    pub request: Option<String>,
    /// Raw response body.
    pub response: Option<String>,
    /// Wall-clock duration of the round trip.
    pub elapsed_ms: Option<i64>,
    /// Error description when the round trip failed.
    pub error: Option<String>,
}

impl ChannelLog {
    /// Start a log entry with a description.
    pub fn new(description: &str) -> Self {
        Self {
            description: description.to_owned(),
            is_error: false,
            url: None,
            request: None,
            response: None,
            elapsed_ms: None,
            error: None,
        }
    }

    /// Record the HTTP round trip.
    pub fn with_round_trip(
        mut self,
        url: &str,
        request: &str,
        response: &str,
        elapsed_ms: i64,
    ) -> Self {
        self.url = Some(url.to_owned());
        self.request = Some(request.to_owned());
        self.response = Some(response.to_owned());
        self.elapsed_ms = Some(elapsed_ms);
        self
    }

    /// Mark the entry as failed with an error description.
    pub fn with_error(mut self, error: &str) -> Self {
        self.is_error = true;
        self.error = Some(error.to_owned());
        self
    }
}

/// A pending status change for one message, referenced by database ID or
/// by the gateway's external ID.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    /// Channel the callback arrived on.
    pub channel_id: ChannelId,
    /// The channel's UUID.
    pub channel_uuid: String,
    /// Database ID of the message, when known.
    pub msg_id: Option<MsgId>,
    /// Gateway-assigned ID of the message, when that is all the callback
    /// carries.
    pub external_id: Option<String>,
    /// The new status.
    pub status: MsgStatusValue,
    /// Round-trip logs accumulated while producing this status.
    pub logs: Vec<ChannelLog>,
}

impl StatusUpdate {
    /// Build a status update for a popped message, for when no channel
    /// struct is at hand.
    pub fn for_msg(msg: &Msg, status: MsgStatusValue) -> Self {
        Self {
            channel_id: msg.channel_id,
            channel_uuid: msg.channel_uuid.clone(),
            msg_id: (msg.id != 0).then_some(msg.id),
            external_id: None,
            status,
            logs: Vec::new(),
        }
    }

    /// Replace the status.
    pub fn set_status(&mut self, status: MsgStatusValue) {
        self.status = status;
    }

    /// Set the gateway-assigned external ID learned from the send.
    pub fn set_external_id(&mut self, external_id: &str) {
        self.external_id = Some(external_id.to_owned());
    }

    /// Append a round-trip log.
    pub fn add_log(&mut self, log: ChannelLog) {
        self.logs.push(log);
    }
}

impl Backend {
    /// Start a status update referencing a message by database ID.
    pub fn new_msg_status_for_id(
        &self,
        channel: &Channel,
        msg_id: MsgId,
        status: MsgStatusValue,
    ) -> StatusUpdate {
        StatusUpdate {
            channel_id: channel.id,
            channel_uuid: channel.uuid.clone(),
            msg_id: Some(msg_id),
            external_id: None,
            status,
            logs: Vec::new(),
        }
    }

    /// Start a status update referencing a message by gateway external ID.
    pub fn new_msg_status_for_external_id(
        &self,
        channel: &Channel,
        external_id: &str,
        status: MsgStatusValue,
    ) -> StatusUpdate {
        StatusUpdate {
            channel_id: channel.id,
            channel_uuid: channel.uuid.clone(),
            msg_id: None,
            external_id: Some(external_id.to_owned()),
            status,
            logs: Vec::new(),
        }
    }

    /// Persist a status update and its logs.
    ///
    /// A first transition into wired, sent or delivered stamps `sent_on`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::MsgNotFound`] naming the reference when no
    /// message matches, [`BackendError::StatusWithoutRef`] when the
    /// update carries no reference at all, or [`BackendError::Database`]
    /// on SQLite failure.
    pub async fn write_msg_status(&self, update: &StatusUpdate) -> Result<(), BackendError> {
        let msg_id = match update.msg_id {
            Some(id) => id,
            None => {
                let external_id = update
                    .external_id
                    .as_deref()
                    .ok_or(BackendError::StatusWithoutRef)?;
                let row: Option<(i64,)> = sqlx::query_as(
                    "SELECT id FROM msgs WHERE channel_id = ?1 AND external_id = ?2",
                )
                .bind(update.channel_id)
                .bind(external_id)
                .fetch_optional(self.pool())
                .await?;
                row.ok_or_else(|| BackendError::MsgNotFound(external_id.to_owned()))?
                    .0
            }
        };

        let marks_sent = matches!(
            update.status,
            MsgStatusValue::Wired | MsgStatusValue::Sent | MsgStatusValue::Delivered
        );
        let changed = sqlx::query(
            "UPDATE msgs SET status = ?1, \
             sent_on = CASE WHEN ?2 AND sent_on IS NULL THEN datetime('now') ELSE sent_on END, \
             external_id = COALESCE(?3, external_id) \
             WHERE id = ?4",
        )
        .bind(update.status.as_str())
        .bind(marks_sent)
        .bind(&update.external_id)
        .bind(msg_id)
        .execute(self.pool())
        .await?;
        if changed.rows_affected() == 0 {
            return Err(BackendError::MsgNotFound(msg_id.to_string()));
        }

        for log in &update.logs {
            sqlx::query(
                "INSERT INTO channel_logs (msg_id, channel_id, description, is_error, url, \
                 request, response, elapsed_ms, error) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )
            .bind(msg_id)
            .bind(update.channel_id)
            .bind(&log.description)
            .bind(log.is_error)
            .bind(&log.url)
            .bind(&log.request)
            .bind(&log.response)
            .bind(log.elapsed_ms)
            .bind(&log.error)
            .execute(self.pool())
            .await?;
        }

        debug!(msg_id, status = %update.status, "message status written");
        Ok(())
    }

    /// Stop the contact behind a message; future outbound sends to any of
    /// its URNs fail fast at `write_msg`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Database`] on SQLite failure.
    pub async fn stop_msg_contact(&self, msg: &Msg) -> Result<(), BackendError> {
        match msg.contact_id {
            Some(contact_id) => contacts::stop_contact(self.pool(), contact_id).await,
            None => contacts::stop_contact_for_urn(self.pool(), msg.org_id, &msg.urn).await,
        }
    }
}
