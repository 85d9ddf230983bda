//! Contact resolution and persistence.

use sqlx::SqlitePool;
use tracing::trace;
use uuid::Uuid;

use super::urns::{self, ContactUrn};
use super::BackendError;
use crate::types::{ChannelId, ContactId, OrgId};
use crate::urns::Urn;

/// An org-scoped person owning one or more URNs.
#[derive(Debug, Clone)]
pub struct Contact {
    /// Database ID.
    pub id: ContactId,
    /// Stable external UUID.
    pub uuid: String,
    /// Owning org.
    pub org_id: OrgId,
    /// Display name, if known.
    pub name: Option<String>,
    /// Whether the contact has opted out of future sends.
    pub is_stopped: bool,
}

type ContactRow = (i64, String, i64, Option<String>, bool);

/// Resolve the contact and URN row for an inbound address, creating both
/// when the identity has never been seen in this org.
///
/// An existing claim reconciles the URN row (channel, contact, display)
/// against the supplied values; a new identity creates the contact and
/// URN together in one transaction so the contact never exists without
/// a URN.
///
/// # Errors
///
/// Returns [`BackendError::Database`] on SQLite failure.
pub async fn contact_for_urn(
    db: &SqlitePool,
    org_id: OrgId,
    channel_id: ChannelId,
    urn: &Urn,
) -> Result<(Contact, ContactUrn), BackendError> {
    let claim: Option<(i64,)> =
        sqlx::query_as("SELECT contact_id FROM contact_urns WHERE org_id = ?1 AND identity = ?2")
            .bind(org_id)
            .bind(urn.identity())
            .fetch_optional(db)
            .await?;

    if let Some((contact_id,)) = claim {
        let contact = load_contact(db, contact_id).await?;
        let contact_urn = urns::contact_urn_for_urn(db, org_id, channel_id, contact_id, urn).await?;
        return Ok((contact, contact_urn));
    }

    let contact_uuid = Uuid::new_v4().to_string();
    let name = urn.display().map(str::to_owned);

    let mut tx = db.begin().await?;
    let inserted = sqlx::query("INSERT INTO contacts (uuid, org_id, name) VALUES (?1, ?2, ?3)")
        .bind(&contact_uuid)
        .bind(org_id)
        .bind(&name)
        .execute(&mut *tx)
        .await?;
    let contact_id = inserted.last_insert_rowid();

    let inserted = sqlx::query(
        "INSERT INTO contact_urns (org_id, contact_id, identity, scheme, path, display, priority, channel_id) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )
    .bind(org_id)
    .bind(contact_id)
    .bind(urn.identity())
    .bind(urn.scheme())
    .bind(urn.path())
    .bind(urn.display())
    .bind(urns::DEFAULT_PRIORITY)
    .bind(channel_id)
    .execute(&mut *tx)
    .await?;
    let urn_id = inserted.last_insert_rowid();
    tx.commit().await?;

    trace!(contact_id, identity = %urn.identity(), "contact created");

    let contact = Contact {
        id: contact_id,
        uuid: contact_uuid,
        org_id,
        name,
        is_stopped: false,
    };
    let contact_urn = ContactUrn {
        id: urn_id,
        org_id,
        contact_id,
        identity: urn.identity(),
        scheme: urn.scheme().to_owned(),
        path: urn.path().to_owned(),
        display: urn.display().map(str::to_owned),
        priority: urns::DEFAULT_PRIORITY,
        channel_id: Some(channel_id),
    };
    Ok((contact, contact_urn))
}

/// Load a contact by ID.
///
/// # Errors
///
/// Returns [`BackendError::ContactNotFound`] if no contact matches,
/// or [`BackendError::Database`] on SQLite failure.
pub async fn load_contact(db: &SqlitePool, contact_id: ContactId) -> Result<Contact, BackendError> {
    let row: ContactRow = sqlx::query_as(
        "SELECT id, uuid, org_id, name, is_stopped FROM contacts WHERE id = ?1",
    )
    .bind(contact_id)
    .fetch_optional(db)
    .await?
    .ok_or(BackendError::ContactNotFound(contact_id))?;
    Ok(Contact {
        id: row.0,
        uuid: row.1,
        org_id: row.2,
        name: row.3,
        is_stopped: row.4,
    })
}

/// Mark a contact as stopped; future outbound sends to it fail fast.
///
/// # Errors
///
/// Returns [`BackendError::Database`] on SQLite failure.
pub async fn stop_contact(db: &SqlitePool, contact_id: ContactId) -> Result<(), BackendError> {
    sqlx::query(
        "UPDATE contacts SET is_stopped = 1, modified_on = datetime('now') WHERE id = ?1",
    )
    .bind(contact_id)
    .execute(db)
    .await?;
    trace!(contact_id, "contact stopped");
    Ok(())
}

/// Stop whichever contact claims the given identity in the org, if any.
///
/// # Errors
///
/// Returns [`BackendError::Database`] on SQLite failure.
pub async fn stop_contact_for_urn(
    db: &SqlitePool,
    org_id: OrgId,
    urn: &Urn,
) -> Result<(), BackendError> {
    let claim: Option<(i64,)> =
        sqlx::query_as("SELECT contact_id FROM contact_urns WHERE org_id = ?1 AND identity = ?2")
            .bind(org_id)
            .bind(urn.identity())
            .fetch_optional(db)
            .await?;
    if let Some((contact_id,)) = claim {
        stop_contact(db, contact_id).await?;
    }
    Ok(())
}
