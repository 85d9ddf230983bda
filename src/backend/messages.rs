//! Message model, fluent builder, and the write path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::{contacts, urns, Backend, BackendError};
use crate::channels::Channel;
use crate::types::{
    ChannelId, ContactId, ContactUrnId, Direction, MsgId, MsgPriority, MsgStatusValue, OrgId,
};
use crate::urns::Urn;

/// A message moving through the courier, in either direction.
///
/// Doubles as the queue payload: `write_msg` serializes the whole struct
/// and sender workers deserialize it back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Msg {
    /// Database ID; 0 until written.
    pub id: MsgId,
    /// Stable external UUID.
    pub uuid: String,
    /// Owning org.
    pub org_id: OrgId,
    /// Channel the message arrived on or leaves through.
    pub channel_id: ChannelId,
    /// The channel's UUID, used as the queue destination key.
    pub channel_uuid: String,
    /// The channel's type tag, used to find the sending handler.
    pub channel_type: String,
    /// The channel's throughput limit in messages per second.
    pub channel_tps: u32,
    /// Resolved contact; set by `write_msg`.
    pub contact_id: Option<ContactId>,
    /// Resolved URN row; set by `write_msg`.
    pub contact_urn_id: Option<ContactUrnId>,
    /// Direction relative to the courier.
    pub direction: Direction,
    /// The remote endpoint.
    pub urn: Urn,
    /// Message body.
    pub text: String,
    /// Attachment URLs.
    pub attachments: Vec<String>,
    /// Delivery priority tier.
    pub priority: MsgPriority,
    /// Lifecycle status.
    pub status: MsgStatusValue,
    /// Gateway-assigned ID, if any.
    pub external_id: Option<String>,
    /// When the gateway says the message was received.
    pub received_on: Option<DateTime<Utc>>,
    /// When the courier first saw the message.
    pub created_on: DateTime<Utc>,
}

impl Msg {
    fn for_channel(
        channel: &Channel,
        urn: &Urn,
        text: &str,
        direction: Direction,
        priority: MsgPriority,
    ) -> Self {
        Self {
            id: 0,
            uuid: Uuid::new_v4().to_string(),
            org_id: channel.org_id,
            channel_id: channel.id,
            channel_uuid: channel.uuid.clone(),
            channel_type: channel.channel_type.clone(),
            channel_tps: channel.max_tps,
            contact_id: None,
            contact_urn_id: None,
            direction,
            urn: urn.clone(),
            text: text.to_owned(),
            attachments: Vec::new(),
            priority,
            status: MsgStatusValue::Pending,
            external_id: None,
            received_on: None,
            created_on: Utc::now(),
        }
    }

    /// Set the gateway-assigned external ID.
    pub fn with_external_id(mut self, external_id: &str) -> Self {
        self.external_id = Some(external_id.to_owned());
        self
    }

    /// Set the gateway-reported receive time.
    pub fn with_received_on(mut self, received_on: DateTime<Utc>) -> Self {
        self.received_on = Some(received_on);
        self
    }

    /// Append an attachment URL.
    pub fn with_attachment(mut self, url: &str) -> Self {
        self.attachments.push(url.to_owned());
        self
    }
}

impl Backend {
    /// Start building a message received from a gateway.
    pub fn new_incoming_msg(&self, channel: &Channel, urn: &Urn, text: &str) -> Msg {
        Msg::for_channel(channel, urn, text, Direction::In, MsgPriority::Default)
    }

    /// Start building a message bound for a gateway.
    pub fn new_outgoing_msg(
        &self,
        channel: &Channel,
        urn: &Urn,
        text: &str,
        priority: MsgPriority,
    ) -> Msg {
        Msg::for_channel(channel, urn, text, Direction::Out, priority)
    }

    /// Persist a message and queue it for its next hop.
    ///
    /// Resolves the contact and URN first (an inbound message also pins
    /// its channel as the URN's preferred channel), then writes the row
    /// and pushes the serialized message onto the delivery queue (out)
    /// or the inbound queue (in). An outbound message to a stopped
    /// contact short-circuits to `failed` and is never queued.
    ///
    /// # Errors
    ///
    /// Surfaces resolver, database and queue errors unchanged.
    pub async fn write_msg(&self, msg: &mut Msg) -> Result<(), BackendError> {
        let (contact, contact_urn) =
            contacts::contact_for_urn(self.pool(), msg.org_id, msg.channel_id, &msg.urn).await?;

        if msg.direction == Direction::In {
            urns::set_preferred_urn(self.pool(), msg.channel_id, &contact, &msg.urn).await?;
        }

        msg.contact_id = Some(contact.id);
        msg.contact_urn_id = Some(contact_urn.id);

        if msg.direction == Direction::Out && contact.is_stopped {
            msg.status = MsgStatusValue::Failed;
            self.insert_msg(msg, None).await?;
            debug!(msg_uuid = %msg.uuid, contact_id = contact.id, "contact stopped, send failed");
            return Ok(());
        }

        let queued_on = Utc::now();
        msg.status = match msg.direction {
            Direction::In => MsgStatusValue::Pending,
            Direction::Out => MsgStatusValue::Queued,
        };
        self.insert_msg(msg, Some(queued_on)).await?;

        let payload = serde_json::to_string(msg)?;
        match msg.direction {
            Direction::Out => {
                self.outgoing_queue()
                    .push(&msg.channel_uuid, msg.channel_tps, &payload, msg.priority)
                    .await?;
            }
            Direction::In => {
                // Inbound consumption is the application's own pace; no
                // per-channel rate applies.
                self.incoming_queue()
                    .push(&msg.channel_uuid, 0, &payload, MsgPriority::Default)
                    .await?;
            }
        }

        debug!(
            msg_uuid = %msg.uuid,
            direction = msg.direction.as_str(),
            channel = %msg.channel_uuid,
            "message written and queued"
        );
        Ok(())
    }

    async fn insert_msg(
        &self,
        msg: &mut Msg,
        queued_on: Option<DateTime<Utc>>,
    ) -> Result<(), BackendError> {
        let attachments = if msg.attachments.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&msg.attachments)?)
        };
        let inserted = sqlx::query(
            "INSERT INTO msgs (uuid, org_id, channel_id, contact_id, contact_urn_id, direction, \
             text, attachments, priority, status, external_id, received_on, queued_on, created_on) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        )
        .bind(&msg.uuid)
        .bind(msg.org_id)
        .bind(msg.channel_id)
        .bind(msg.contact_id)
        .bind(msg.contact_urn_id)
        .bind(msg.direction.as_str())
        .bind(&msg.text)
        .bind(attachments)
        .bind(msg.priority.as_str())
        .bind(msg.status.as_str())
        .bind(&msg.external_id)
        .bind(msg.received_on.map(|t| t.to_rfc3339()))
        .bind(queued_on.map(|t| t.to_rfc3339()))
        .bind(msg.created_on.to_rfc3339())
        .execute(self.pool())
        .await?;
        msg.id = inserted.last_insert_rowid();
        Ok(())
    }
}
