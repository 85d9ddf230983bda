//! Contact URN rows and the preferred-URN ordering rules.
//!
//! `(org_id, identity)` is unique; the highest-priority URN of a contact
//! is its preferred URN. Receiving on a channel pins that channel as the
//! URN's affinity.

use sqlx::SqlitePool;
use tracing::trace;

use super::contacts::Contact;
use super::BackendError;
use crate::types::{ChannelId, ContactId, ContactUrnId, OrgId};
use crate::urns::{Urn, TEL_SCHEME};

/// Priority assigned to a contact's preferred URN.
pub const PREFERRED_PRIORITY: i64 = 99;

/// Priority assigned to newly created URNs and the first non-preferred slot.
pub const DEFAULT_PRIORITY: i64 = 50;

/// A persisted URN row.
#[derive(Debug, Clone)]
pub struct ContactUrn {
    /// Database ID.
    pub id: ContactUrnId,
    /// Owning org.
    pub org_id: OrgId,
    /// Owning contact.
    pub contact_id: ContactId,
    /// Canonical identity (`scheme:path`), unique per org.
    pub identity: String,
    /// URN scheme.
    pub scheme: String,
    /// Scheme-specific path.
    pub path: String,
    /// Optional display name.
    pub display: Option<String>,
    /// Ordering priority; higher is more preferred.
    pub priority: i64,
    /// Channel last used to send or receive on this URN.
    pub channel_id: Option<ChannelId>,
}

type UrnRow = (
    i64,
    i64,
    i64,
    String,
    String,
    String,
    Option<String>,
    i64,
    Option<i64>,
);

fn row_to_urn(row: UrnRow) -> ContactUrn {
    ContactUrn {
        id: row.0,
        org_id: row.1,
        contact_id: row.2,
        identity: row.3,
        scheme: row.4,
        path: row.5,
        display: row.6,
        priority: row.7,
        channel_id: row.8,
    }
}

const SELECT_COLUMNS: &str =
    "id, org_id, contact_id, identity, scheme, path, display, priority, channel_id";

/// All URN rows for a contact, most preferred first.
///
/// # Errors
///
/// Returns [`BackendError::Database`] on SQLite failure.
pub async fn contact_urns_for_contact(
    db: &SqlitePool,
    contact_id: ContactId,
) -> Result<Vec<ContactUrn>, BackendError> {
    let rows: Vec<UrnRow> = sqlx::query_as(&format!(
        "SELECT {SELECT_COLUMNS} FROM contact_urns WHERE contact_id = ?1 ORDER BY priority DESC"
    ))
    .bind(contact_id)
    .fetch_all(db)
    .await?;
    Ok(rows.into_iter().map(row_to_urn).collect())
}

/// Get or create the URN row for `(org, identity)`, reconciling channel,
/// contact and display against the supplied values.
///
/// # Errors
///
/// Returns [`BackendError::Database`] on SQLite failure.
pub async fn contact_urn_for_urn(
    db: &SqlitePool,
    org_id: OrgId,
    channel_id: ChannelId,
    contact_id: ContactId,
    urn: &Urn,
) -> Result<ContactUrn, BackendError> {
    let existing: Option<UrnRow> = sqlx::query_as(&format!(
        "SELECT {SELECT_COLUMNS} FROM contact_urns \
         WHERE org_id = ?1 AND identity = ?2 ORDER BY priority DESC LIMIT 1"
    ))
    .bind(org_id)
    .bind(urn.identity())
    .fetch_optional(db)
    .await?;

    let mut contact_urn = match existing {
        Some(row) => row_to_urn(row),
        None => {
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
            .bind(DEFAULT_PRIORITY)
            .bind(channel_id)
            .execute(db)
            .await?;
            trace!(identity = %urn.identity(), contact_id, "contact urn created");
            return Ok(ContactUrn {
                id: inserted.last_insert_rowid(),
                org_id,
                contact_id,
                identity: urn.identity(),
                scheme: urn.scheme().to_owned(),
                path: urn.path().to_owned(),
                display: urn.display().map(str::to_owned),
                priority: DEFAULT_PRIORITY,
                channel_id: Some(channel_id),
            });
        }
    };

    let display = urn.display().map(str::to_owned);
    if contact_urn.channel_id != Some(channel_id)
        || contact_urn.contact_id != contact_id
        || contact_urn.display != display
    {
        contact_urn.channel_id = Some(channel_id);
        contact_urn.contact_id = contact_id;
        contact_urn.display = display;
        update_contact_urn(db, &contact_urn).await?;
    }

    Ok(contact_urn)
}

/// Persist the mutable fields of a URN row.
///
/// # Errors
///
/// Returns [`BackendError::Database`] on SQLite failure.
pub async fn update_contact_urn(db: &SqlitePool, urn: &ContactUrn) -> Result<(), BackendError> {
    sqlx::query(
        "UPDATE contact_urns \
         SET channel_id = ?1, contact_id = ?2, display = ?3, priority = ?4 \
         WHERE id = ?5",
    )
    .bind(urn.channel_id)
    .bind(urn.contact_id)
    .bind(&urn.display)
    .bind(urn.priority)
    .bind(urn.id)
    .execute(db)
    .await?;
    Ok(())
}

/// Make the given URN the contact's preferred URN and the given channel
/// its affinity.
///
/// With a single matching URN this only syncs display and channel. With
/// several, the target takes priority 99 and the rest descend from 50;
/// telephone URNs additionally inherit the new channel affinity when the
/// target is itself a telephone URN, since a phone reachable on one SMS
/// channel is reachable on it for all its numbers.
///
/// # Errors
///
/// Returns [`BackendError::UrnMissing`] when the contact has no URNs at
/// all, or [`BackendError::Database`] on SQLite failure.
pub async fn set_preferred_urn(
    db: &SqlitePool,
    channel_id: ChannelId,
    contact: &Contact,
    urn: &Urn,
) -> Result<(), BackendError> {
    let mut rows = contact_urns_for_contact(db, contact.id).await?;
    if rows.is_empty() {
        return Err(BackendError::UrnMissing {
            contact_id: contact.id,
            identity: urn.identity(),
        });
    }

    let identity = urn.identity();
    let display = urn.display().map(str::to_owned);

    if rows.len() == 1 && rows[0].identity == identity {
        let row = &mut rows[0];
        if row.display != display || row.channel_id != Some(channel_id) {
            row.display = display;
            row.channel_id = Some(channel_id);
            update_contact_urn(db, row).await?;
        }
        return Ok(());
    }

    let mut next_priority = DEFAULT_PRIORITY;
    for row in &mut rows {
        if row.identity == identity {
            row.priority = PREFERRED_PRIORITY;
            row.channel_id = Some(channel_id);
        } else {
            row.priority = next_priority;
            next_priority -= 1;
            if row.scheme == TEL_SCHEME && urn.scheme() == TEL_SCHEME {
                row.channel_id = Some(channel_id);
            }
        }
        update_contact_urn(db, row).await?;
    }

    trace!(contact_id = contact.id, identity = %identity, "preferred urn updated");
    Ok(())
}
