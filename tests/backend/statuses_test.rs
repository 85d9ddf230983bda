//! Tests for status updates and channel logs.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use postrider::backend::messages::Msg;
use postrider::backend::statuses::{ChannelLog, StatusUpdate};
use postrider::backend::{Backend, BackendError};
use postrider::channels::{self, Channel};
use postrider::queue::{Pop, QueueError, WorkQueue, WorkerToken};
use postrider::types::{MsgPriority, MsgStatusValue};
use postrider::urns::Urn;

/// Discards queue traffic; these tests only exercise the store.
struct NullQueue;

#[async_trait]
impl WorkQueue for NullQueue {
    async fn push(
        &self,
        _channel_uuid: &str,
        _rate: u32,
        _payload: &str,
        _priority: MsgPriority,
    ) -> Result<(), QueueError> {
        Ok(())
    }

    async fn pop(&self) -> Result<Pop, QueueError> {
        Ok(Pop::Empty)
    }

    async fn complete(&self, _token: &WorkerToken) -> Result<(), QueueError> {
        Ok(())
    }

    async fn dethrottle(&self) -> Result<u64, QueueError> {
        Ok(0)
    }
}

struct Fixture {
    pool: SqlitePool,
    backend: Backend,
    channel: Channel,
}

async fn setup() -> Fixture {
    let opts = SqliteConnectOptions::new()
        .filename(":memory:")
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(opts)
        .await
        .expect("pool should connect");
    sqlx::raw_sql(include_str!("../../migrations/001_schema.sql"))
        .execute(&pool)
        .await
        .expect("schema should apply");

    let org_id = sqlx::query("INSERT INTO orgs (name) VALUES ('testing')")
        .execute(&pool)
        .await
        .expect("org should insert")
        .last_insert_rowid();
    sqlx::query(
        "INSERT INTO channels (uuid, channel_type, org_id, address, max_tps) \
         VALUES ('chan-a', 'KN', ?1, '+12065551212', 10)",
    )
    .bind(org_id)
    .execute(&pool)
    .await
    .expect("channel should insert");
    let channel = channels::channel_for_uuid(&pool, "chan-a")
        .await
        .expect("channel should load");

    let backend = Backend::new(
        pool.clone(),
        Arc::new(NullQueue) as Arc<dyn WorkQueue>,
        Arc::new(NullQueue) as Arc<dyn WorkQueue>,
    );

    Fixture {
        pool,
        backend,
        channel,
    }
}

async fn written_outgoing_msg(f: &Fixture) -> Msg {
    let mut msg = f.backend.new_outgoing_msg(
        &f.channel,
        &Urn::tel("+15551234"),
        "hello",
        MsgPriority::Default,
    );
    f.backend.write_msg(&mut msg).await.expect("write should succeed");
    msg
}

async fn status_and_sent_on(pool: &SqlitePool, id: i64) -> (String, Option<String>) {
    sqlx::query_as("SELECT status, sent_on FROM msgs WHERE id = ?1")
        .bind(id)
        .fetch_one(pool)
        .await
        .expect("msg row should exist")
}

#[tokio::test]
async fn status_by_id_updates_row_and_stamps_sent_on() {
    let f = setup().await;
    let msg = written_outgoing_msg(&f).await;

    let update = f
        .backend
        .new_msg_status_for_id(&f.channel, msg.id, MsgStatusValue::Wired);
    f.backend
        .write_msg_status(&update)
        .await
        .expect("status write should succeed");

    let (status, sent_on) = status_and_sent_on(&f.pool, msg.id).await;
    assert_eq!(status, "wired");
    assert!(sent_on.is_some());
}

#[tokio::test]
async fn status_by_external_id_finds_the_message() {
    let f = setup().await;
    let msg = written_outgoing_msg(&f).await;

    // The send learned the gateway's ID; a later callback only has that.
    let mut wired = f
        .backend
        .new_msg_status_for_id(&f.channel, msg.id, MsgStatusValue::Wired);
    wired.set_external_id("SM123");
    f.backend
        .write_msg_status(&wired)
        .await
        .expect("status write should succeed");

    let delivered =
        f.backend
            .new_msg_status_for_external_id(&f.channel, "SM123", MsgStatusValue::Delivered);
    f.backend
        .write_msg_status(&delivered)
        .await
        .expect("status write should succeed");

    let (status, _) = status_and_sent_on(&f.pool, msg.id).await;
    assert_eq!(status, "delivered");
}

#[tokio::test]
async fn unknown_external_id_errors_naming_the_value() {
    let f = setup().await;
    written_outgoing_msg(&f).await;

    let update =
        f.backend
            .new_msg_status_for_external_id(&f.channel, "ext-999", MsgStatusValue::Delivered);
    let err = f
        .backend
        .write_msg_status(&update)
        .await
        .expect_err("unknown external id should fail");
    assert!(matches!(err, BackendError::MsgNotFound(_)));
    assert!(err.to_string().contains("ext-999"));
}

#[tokio::test]
async fn update_without_any_reference_is_rejected() {
    let f = setup().await;
    let unsaved = f
        .backend
        .new_incoming_msg(&f.channel, &Urn::tel("+15551234"), "hello");
    let update = StatusUpdate::for_msg(&unsaved, MsgStatusValue::Wired);

    let err = f
        .backend
        .write_msg_status(&update)
        .await
        .expect_err("missing reference should fail");
    assert!(matches!(err, BackendError::StatusWithoutRef));
}

#[tokio::test]
async fn round_trip_logs_are_persisted() {
    let f = setup().await;
    let msg = written_outgoing_msg(&f).await;

    let mut update = f
        .backend
        .new_msg_status_for_id(&f.channel, msg.id, MsgStatusValue::Errored);
    update.add_log(
        ChannelLog::new("Message Sent")
            .with_round_trip("https://gateway.example/send", "to=+15551234", "FAIL", 87)
            .with_error("gateway rejected the sender"),
    );
    f.backend
        .write_msg_status(&update)
        .await
        .expect("status write should succeed");

    let row: (i64, bool, Option<String>, Option<String>) = sqlx::query_as(
        "SELECT msg_id, is_error, url, error FROM channel_logs WHERE msg_id = ?1",
    )
    .bind(msg.id)
    .fetch_one(&f.pool)
    .await
    .expect("log row should exist");
    assert_eq!(row.0, msg.id);
    assert!(row.1);
    assert_eq!(row.2.as_deref(), Some("https://gateway.example/send"));
    assert_eq!(row.3.as_deref(), Some("gateway rejected the sender"));
}

#[tokio::test]
async fn stop_msg_contact_flags_the_contact() {
    let f = setup().await;
    let mut msg = f
        .backend
        .new_incoming_msg(&f.channel, &Urn::tel("+15551234"), "STOP");
    f.backend.write_msg(&mut msg).await.expect("write should succeed");

    f.backend
        .stop_msg_contact(&msg)
        .await
        .expect("stop should succeed");

    let row: (bool,) = sqlx::query_as("SELECT is_stopped FROM contacts WHERE id = ?1")
        .bind(msg.contact_id.expect("contact should be resolved"))
        .fetch_one(&f.pool)
        .await
        .expect("contact row should exist");
    assert!(row.0);
}
