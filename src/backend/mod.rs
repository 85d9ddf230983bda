//! The narrow interface gateway handlers program against.
//!
//! The backend composes the contact/URN resolver and the work queue
//! behind one struct so handlers never touch Redis or SQLite directly.
//! Message and status operations live in [`messages`] and [`statuses`];
//! the resolver lives in [`contacts`] and [`urns`].

pub mod contacts;
pub mod messages;
pub mod statuses;
pub mod urns;

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::channels::{self, Channel};
use crate::queue::{Pop, QueueError, WorkQueue, WorkerToken};

/// Errors from the backend facade and resolver.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Queue operation failed.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Payload or config serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A URN's identity is claimed by a contact that does not carry it.
    #[error("URN '{identity}' not present for contact {contact_id}")]
    UrnMissing {
        /// The contact claiming the identity.
        contact_id: i64,
        /// The claimed identity.
        identity: String,
    },

    /// The requested contact was not found.
    #[error("contact not found: {0}")]
    ContactNotFound(i64),

    /// No active channel matches the given UUID.
    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    /// No message matches the given reference.
    #[error("no message matching '{0}'")]
    MsgNotFound(String),

    /// A status update referenced neither a message ID nor an external ID.
    #[error("status update carries neither message id nor external id")]
    StatusWithoutRef,
}

/// Facade over the relational store and the work queues.
pub struct Backend {
    db: SqlitePool,
    outgoing: Arc<dyn WorkQueue>,
    incoming: Arc<dyn WorkQueue>,
}

impl Backend {
    /// Build a backend over a SQLite pool and the two logical queues:
    /// `outgoing` carries sends to gateways, `incoming` carries received
    /// messages to the surrounding application.
    pub fn new(db: SqlitePool, outgoing: Arc<dyn WorkQueue>, incoming: Arc<dyn WorkQueue>) -> Self {
        Self {
            db,
            outgoing,
            incoming,
        }
    }

    /// Apply the bundled schema migrations.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Database`] if a statement fails.
    pub async fn migrate(&self) -> Result<(), BackendError> {
        sqlx::raw_sql(include_str!("../../migrations/001_schema.sql"))
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// The underlying SQLite pool, for the surrounding application.
    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Load an active channel by UUID.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::ChannelNotFound`] when no active channel
    /// matches, or [`BackendError::Database`] on SQLite failure.
    pub async fn channel_for_uuid(&self, uuid: &str) -> Result<Channel, BackendError> {
        channels::channel_for_uuid(&self.db, uuid).await
    }

    /// Take the next eligible outbound send, fairly across destinations.
    pub async fn pop_outgoing(&self) -> Result<Pop, QueueError> {
        self.outgoing.pop().await
    }

    /// Record completion of a popped outbound send.
    pub async fn complete_outgoing(&self, token: &WorkerToken) -> Result<(), QueueError> {
        self.outgoing.complete(token).await
    }

    /// The outbound delivery queue.
    pub fn outgoing_queue(&self) -> Arc<dyn WorkQueue> {
        Arc::clone(&self.outgoing)
    }

    pub(crate) fn incoming_queue(&self) -> &Arc<dyn WorkQueue> {
        &self.incoming
    }
}
