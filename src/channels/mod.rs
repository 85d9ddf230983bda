//! Channel model, the handler contract, and the handler registry.
//!
//! A channel is one configured gateway endpoint; a handler is the code
//! that speaks that gateway's dialect. Handlers see only the backend
//! facade and this module's types; the registry is explicit and closed
//! before the server starts, so there is no hidden process-wide state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::info;

use crate::backend::messages::Msg;
use crate::backend::statuses::StatusUpdate;
use crate::backend::{Backend, BackendError};
use crate::types::{ChannelId, OrgId};

/// A configured messaging endpoint.
#[derive(Debug, Clone)]
pub struct Channel {
    /// Database ID.
    pub id: ChannelId,
    /// Stable external UUID, used as the queue destination key.
    pub uuid: String,
    /// Channel type tag, e.g. `KN`.
    pub channel_type: String,
    /// Owning org.
    pub org_id: OrgId,
    /// Gateway-side address (sender number, bot name, ...).
    pub address: String,
    /// Vendor-specific configuration bag.
    pub config: serde_json::Value,
    /// Throughput limit in messages per second; 0 means unlimited.
    pub max_tps: u32,
}

impl Channel {
    /// String config value for a key, with a default.
    pub fn config_str(&self, key: &str, default: &str) -> String {
        self.config
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or(default)
            .to_owned()
    }

    /// Boolean config value for a key, with a default.
    pub fn config_bool(&self, key: &str, default: bool) -> bool {
        self.config
            .get(key)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(default)
    }
}

/// Load an active channel by UUID.
///
/// # Errors
///
/// Returns [`BackendError::ChannelNotFound`] when no active channel
/// matches, [`BackendError::Serialization`] when its config bag is not
/// valid JSON, or [`BackendError::Database`] on SQLite failure.
pub async fn channel_for_uuid(db: &SqlitePool, uuid: &str) -> Result<Channel, BackendError> {
    let row: Option<(i64, String, String, i64, String, String, i64)> = sqlx::query_as(
        "SELECT id, uuid, channel_type, org_id, address, config, max_tps \
         FROM channels WHERE uuid = ?1 AND is_active = 1",
    )
    .bind(uuid)
    .fetch_optional(db)
    .await?;
    let row = row.ok_or_else(|| BackendError::ChannelNotFound(uuid.to_owned()))?;
    Ok(Channel {
        id: row.0,
        uuid: row.1,
        channel_type: row.2,
        org_id: row.3,
        address: row.4,
        config: serde_json::from_str(&row.5)?,
        max_tps: u32::try_from(row.6).unwrap_or(0),
    })
}

/// A vendor-neutral view of an inbound gateway request.
///
/// The surrounding HTTP layer fills this from the wire; handlers parse
/// it however their gateway requires. The core never interprets it.
#[derive(Debug, Clone, Default)]
pub struct ChannelRequest {
    /// HTTP method.
    pub method: String,
    /// Query and form parameters, merged.
    pub params: HashMap<String, String>,
    /// Raw request body.
    pub body: String,
}

impl ChannelRequest {
    /// Look up a parameter by name.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

/// The contract a gateway handler implements.
///
/// Handlers parse vendor requests into messages and statuses, hand them
/// to the [`Backend`], and translate outbound messages into gateway
/// sends. They decide terminal-vs-retryable from the gateway response;
/// the core does not.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    /// The channel type tag this handler serves, e.g. `KN`.
    fn channel_type(&self) -> &str;

    /// Human-readable handler name for logs.
    fn name(&self) -> &str;

    /// Register this handler's routes; called once at registration.
    fn initialize(&self, registry: &mut HandlerRegistry) -> anyhow::Result<()>;

    /// Parse an inbound-message request, write the messages, and return
    /// them for the reply body.
    async fn receive_msg(
        &self,
        backend: &Backend,
        channel: &Channel,
        request: &ChannelRequest,
    ) -> anyhow::Result<Vec<Msg>>;

    /// Parse a status callback, write the statuses, and return them for
    /// the reply body.
    async fn status_msg(
        &self,
        backend: &Backend,
        channel: &Channel,
        request: &ChannelRequest,
    ) -> anyhow::Result<Vec<StatusUpdate>>;

    /// Deliver one outbound message to the gateway.
    async fn send_msg(&self, backend: &Backend, msg: &Msg) -> anyhow::Result<StatusUpdate>;
}

/// Which of the two handler entry points a route feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// Inbound messages.
    Receive,
    /// Status callbacks.
    Status,
}

/// One HTTP route a handler asked for, e.g. `POST .../receive`.
///
/// The surrounding HTTP layer mounts these under its own URL scheme and
/// dispatches through [`crate::server::Server::handle_receive`] and
/// [`crate::server::Server::handle_status`].
#[derive(Debug, Clone)]
pub struct Route {
    /// Channel type tag of the owning handler.
    pub channel_type: String,
    /// HTTP method.
    pub method: String,
    /// Trailing path segment, e.g. `receive` or `status`.
    pub action: String,
    /// Which handler entry point the route feeds.
    pub kind: RouteKind,
}

/// Errors from handler registration.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Two handlers claimed the same channel type.
    #[error("handler for channel type '{0}' already registered")]
    Duplicate(String),

    /// Registration was attempted after the server started.
    #[error("registration is closed once the server has started")]
    Sealed,

    /// The handler's own initialization failed.
    #[error("handler initialization failed: {0}")]
    Init(anyhow::Error),
}

/// Explicit registry of handlers by channel type, plus their routes.
///
/// Populated before the server is constructed; the server seals it so
/// late registration is an error instead of a race.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ChannelHandler>>,
    routes: Vec<Route>,
    sealed: bool,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, running its `initialize` to collect routes.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Sealed`] after the server has started,
    /// [`RegistryError::Duplicate`] for a repeated channel type, or
    /// [`RegistryError::Init`] when the handler's own setup fails.
    pub fn register(&mut self, handler: Arc<dyn ChannelHandler>) -> Result<(), RegistryError> {
        if self.sealed {
            return Err(RegistryError::Sealed);
        }
        let channel_type = handler.channel_type().to_owned();
        if self.handlers.contains_key(&channel_type) {
            return Err(RegistryError::Duplicate(channel_type));
        }
        handler.initialize(self).map_err(RegistryError::Init)?;
        info!(channel_type = %channel_type, name = handler.name(), "channel handler registered");
        self.handlers.insert(channel_type, handler);
        Ok(())
    }

    /// Record a receive route for a handler.
    pub fn add_receive_route(&mut self, handler: &dyn ChannelHandler, method: &str, action: &str) {
        self.routes.push(Route {
            channel_type: handler.channel_type().to_owned(),
            method: method.to_owned(),
            action: action.to_owned(),
            kind: RouteKind::Receive,
        });
    }

    /// Record a status route for a handler.
    pub fn add_status_route(&mut self, handler: &dyn ChannelHandler, method: &str, action: &str) {
        self.routes.push(Route {
            channel_type: handler.channel_type().to_owned(),
            method: method.to_owned(),
            action: action.to_owned(),
            kind: RouteKind::Status,
        });
    }

    /// Look up the handler for a channel type.
    pub fn handler(&self, channel_type: &str) -> Option<&Arc<dyn ChannelHandler>> {
        self.handlers.get(channel_type)
    }

    /// All registered routes.
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub(crate) fn seal(&mut self) {
        self.sealed = true;
    }
}
