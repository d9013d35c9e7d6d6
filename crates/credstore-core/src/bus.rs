//! In-process bus for request dispatch and lifecycle event fan-out
//!
//! Handlers are registered per request type and looked up by `TypeId`.
//! Events go out over a tokio broadcast channel; having no subscribers
//! is not an error.

use crate::error::{Error, Result};
use crate::events::SecretEvent;
use crate::models::{
    AddSecretCommand, DeleteSecretCommand, GetSecretQuery, GetSecretsQuery, Secret,
    UpdateSecretCommand,
};
use async_trait::async_trait;
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::broadcast;
use tracing::{debug, trace};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A request that can be dispatched on the bus
pub trait Message: Send + 'static {
    type Output: Send + 'static;
}

impl Message for GetSecretQuery {
    type Output = Secret;
}

impl Message for GetSecretsQuery {
    type Output = Vec<Secret>;
}

impl Message for AddSecretCommand {
    type Output = Secret;
}

impl Message for UpdateSecretCommand {
    type Output = Secret;
}

impl Message for DeleteSecretCommand {
    /// Number of rows removed
    type Output = u64;
}

/// Handles one request type
#[async_trait]
pub trait Handler<M: Message>: Send + Sync {
    async fn handle(&self, message: M) -> Result<M::Output>;
}

/// Sink for lifecycle events published after commit
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: SecretEvent) -> Result<()>;
}

type HandlerMap = HashMap<TypeId, Box<dyn Any + Send + Sync>>;

/// Handler registry plus event channel
pub struct Bus {
    handlers: RwLock<HandlerMap>,
    events: broadcast::Sender<SecretEvent>,
}

impl Bus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            handlers: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Register `handler` for `M`, replacing any previous handler
    pub fn add_handler<M, H>(&self, handler: Arc<H>)
    where
        M: Message,
        H: Handler<M> + 'static,
    {
        let handler: Arc<dyn Handler<M>> = handler;
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if handlers
            .insert(TypeId::of::<M>(), Box::new(handler))
            .is_some()
        {
            debug!(message_type = type_name::<M>(), "Replaced bus handler");
        }
    }

    pub fn has_handler<M: Message>(&self) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&TypeId::of::<M>())
    }

    /// Route `message` to its registered handler
    pub async fn dispatch<M: Message>(&self, message: M) -> Result<M::Output> {
        let handler = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            handlers
                .get(&TypeId::of::<M>())
                .and_then(|h| h.downcast_ref::<Arc<dyn Handler<M>>>())
                .cloned()
        };

        let handler = handler.ok_or_else(|| Error::handler_not_found(type_name::<M>()))?;
        trace!(message_type = type_name::<M>(), "Dispatching");
        handler.handle(message).await
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SecretEvent> {
        self.events.subscribe()
    }

    /// Publisher that does not keep the bus alive.
    ///
    /// Handlers registered on the bus usually own the store that publishes,
    /// so the store must only hold this weak handle.
    pub fn publisher(self: &Arc<Self>) -> Arc<dyn EventPublisher> {
        Arc::new(BusPublisher {
            bus: Arc::downgrade(self),
        })
    }
}

/// Weak handle to a [`Bus`]; events published after the bus is gone are dropped
struct BusPublisher {
    bus: Weak<Bus>,
}

#[async_trait]
impl EventPublisher for BusPublisher {
    async fn publish(&self, event: SecretEvent) -> Result<()> {
        match self.bus.upgrade() {
            Some(bus) => bus.publish(event).await,
            None => {
                debug!(event = event.kind(), "Bus dropped, discarding event");
                Ok(())
            }
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for Bus {
    async fn publish(&self, event: SecretEvent) -> Result<()> {
        let kind = event.kind();
        match self.events.send(event) {
            Ok(receivers) => debug!(event = kind, receivers, "Published event"),
            Err(_) => trace!(event = kind, "No event subscribers"),
        }
        Ok(())
    }
}
