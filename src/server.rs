//! Server wiring: handler dispatch, the sender worker pool, and shutdown.
//!
//! The registry is sealed at construction, so every handler is known
//! before the first worker spawns. Workers loop pop → dispatch → write
//! status → complete; an in-flight pop finishes before a worker exits.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::messages::Msg;
use crate::backend::statuses::{ChannelLog, StatusUpdate};
use crate::backend::Backend;
use crate::channels::{ChannelRequest, HandlerRegistry};
use crate::queue::dethrottler::start_dethrottler;
use crate::queue::Pop;
use crate::types::MsgStatusValue;

/// How long an idle worker sleeps before polling again.
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// How long a worker backs off after a queue error.
const ERROR_WAIT: Duration = Duration::from_secs(1);

/// The courier server: backend, handler registry, and worker pool.
pub struct Server {
    backend: Arc<Backend>,
    registry: Arc<HandlerRegistry>,
    workers: usize,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    /// Build a server over a backend and a fully populated registry.
    ///
    /// The registry is sealed here; all handler registration must happen
    /// before the server is constructed.
    pub fn new(backend: Arc<Backend>, mut registry: HandlerRegistry, workers: usize) -> Self {
        registry.seal();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            backend,
            registry: Arc::new(registry),
            workers: workers.max(1),
            shutdown_tx,
            shutdown_rx,
            tasks: Vec::new(),
        }
    }

    /// The backend facade, for the surrounding HTTP layer.
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    /// The sealed handler registry.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Spawn the dethrottler and the sender worker pool.
    ///
    /// Idempotent; calling it on a started server does nothing.
    pub fn start(&mut self) {
        if !self.tasks.is_empty() {
            return;
        }

        self.tasks.push(start_dethrottler(
            self.backend.outgoing_queue(),
            self.shutdown_rx.clone(),
        ));

        for id in 0..self.workers {
            self.tasks.push(tokio::spawn(sender_worker(
                id,
                Arc::clone(&self.backend),
                Arc::clone(&self.registry),
                self.shutdown_rx.clone(),
            )));
        }

        info!(
            workers = self.workers,
            handlers = self.registry.len(),
            "server started"
        );
    }

    /// Signal shutdown and join every background task.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!("server stopped");
    }

    /// Dispatch an inbound-message request to the channel's handler.
    ///
    /// # Errors
    ///
    /// Surfaces channel lookup failures, an unregistered channel type,
    /// and the handler's own errors.
    pub async fn handle_receive(
        &self,
        channel_uuid: &str,
        request: &ChannelRequest,
    ) -> anyhow::Result<Vec<Msg>> {
        let channel = self.backend.channel_for_uuid(channel_uuid).await?;
        let handler = self
            .registry
            .handler(&channel.channel_type)
            .ok_or_else(|| anyhow::anyhow!("no handler for channel type '{}'", channel.channel_type))?;
        handler.receive_msg(&self.backend, &channel, request).await
    }

    /// Dispatch a status callback to the channel's handler.
    ///
    /// # Errors
    ///
    /// Surfaces channel lookup failures, an unregistered channel type,
    /// and the handler's own errors.
    pub async fn handle_status(
        &self,
        channel_uuid: &str,
        request: &ChannelRequest,
    ) -> anyhow::Result<Vec<StatusUpdate>> {
        let channel = self.backend.channel_for_uuid(channel_uuid).await?;
        let handler = self
            .registry
            .handler(&channel.channel_type)
            .ok_or_else(|| anyhow::anyhow!("no handler for channel type '{}'", channel.channel_type))?;
        handler.status_msg(&self.backend, &channel, request).await
    }
}

/// One sender worker: pop outbound sends and dispatch them until told to
/// stop.
async fn sender_worker(
    id: usize,
    backend: Arc<Backend>,
    registry: Arc<HandlerRegistry>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(worker = id, "sender worker started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match backend.pop_outgoing().await {
            Ok(Pop::Item { token, payload }) => {
                send_item(&backend, &registry, &payload).await;
                if let Err(e) = backend.complete_outgoing(&token).await {
                    warn!(worker = id, error = %e, "failed to mark send complete");
                }
            }
            Ok(Pop::Retry) => {}
            Ok(Pop::Empty) => {
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_WAIT) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
            Err(e) => {
                warn!(worker = id, error = %e, "pop failed");
                tokio::select! {
                    _ = tokio::time::sleep(ERROR_WAIT) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
        }
    }

    debug!(worker = id, "sender worker stopped");
}

/// Decode one popped payload, dispatch it to its handler, and write the
/// resulting status. Dispatch failures become an errored status so the
/// message is visible for retry rather than silently lost.
async fn send_item(backend: &Backend, registry: &HandlerRegistry, payload: &str) {
    let msg: Msg = match serde_json::from_str(payload) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(error = %e, "dropping undecodable queue payload");
            return;
        }
    };

    let update = match registry.handler(&msg.channel_type) {
        Some(handler) => match handler.send_msg(backend, &msg).await {
            Ok(update) => update,
            Err(e) => {
                warn!(msg_uuid = %msg.uuid, error = %e, "send failed");
                let mut update = StatusUpdate::for_msg(&msg, MsgStatusValue::Errored);
                update.add_log(ChannelLog::new("Message Send").with_error(&e.to_string()));
                update
            }
        },
        None => {
            warn!(
                msg_uuid = %msg.uuid,
                channel_type = %msg.channel_type,
                "no handler registered for channel type"
            );
            let mut update = StatusUpdate::for_msg(&msg, MsgStatusValue::Errored);
            update.add_log(
                ChannelLog::new("Message Send")
                    .with_error(&format!("no handler for channel type '{}'", msg.channel_type)),
            );
            update
        }
    };

    if let Err(e) = backend.write_msg_status(&update).await {
        warn!(msg_uuid = %msg.uuid, error = %e, "failed to write send status");
    }
}
