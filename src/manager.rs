//! High-level entry point for the realtime channel.
//!
//! `RealtimeManager` wires the configuration, transport, registry and
//! connection kernel together; `start()` spawns the kernel task and returns a
//! cheaply cloneable `RealtimeInstance` that the rest of the application uses:
//!
//! ```ignore
//! let instance = RealtimeManager::from_config(Config::from_env()).start();
//!
//! let _orders = instance.subscribe("/topic/orders", |msg| {
//!     // refresh the orders table
//! });
//!
//! let mut status = instance.watch_status();
//! while status.changed().await.is_ok() {
//!     println!("realtime: {}", *status.borrow());
//! }
//! ```
//!
//! Every independent page of the dashboard registers its own topics through
//! `subscribe` or the scoped [`TopicBinding`] helper without knowing about
//! the connection lifecycle; registrations survive reconnects.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    config::Config,
    connection::{publish_status, Command, ConnectionKernel},
    registry::{EntryId, Handler, SubscriptionRegistry, TopicMessage},
    state::ConnectionStatus,
    transport::{StompTransport, Transport},
};

/// Builder for the realtime channel.
pub struct RealtimeManager<T: Transport = StompTransport> {
    config: Config,
    transport: T,
}

impl RealtimeManager<StompTransport> {
    /// Creates a manager using the production STOMP-over-WebSocket transport.
    pub fn from_config(config: Config) -> Self {
        RealtimeManager {
            config,
            transport: StompTransport,
        }
    }
}

impl<T: Transport> RealtimeManager<T> {
    /// Creates a manager with a custom transport (tests, alternative brokers).
    pub fn with_transport(config: Config, transport: T) -> Self {
        RealtimeManager { config, transport }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts the connection kernel and returns the consumer-facing handle.
    ///
    /// Never fails: a bad base URL falls back to the local default endpoint.
    /// Status is `Connecting` immediately; the actual connection proceeds
    /// asynchronously on a spawned task, so this must be called within a
    /// tokio runtime.
    pub fn start(self) -> RealtimeInstance {
        let endpoint = self.config.endpoint();
        let retry_delay = self.config.retry_delay();

        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let status_tx = Arc::new(status_tx);
        let registry = Arc::new(SubscriptionRegistry::new());
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let kernel = ConnectionKernel::new(
            self.transport,
            endpoint,
            retry_delay,
            Arc::clone(&registry),
            Arc::clone(&status_tx),
            command_rx,
            cancel.clone(),
        );
        tokio::spawn(kernel.run());

        RealtimeInstance {
            shared: Arc::new(Shared {
                registry,
                command_tx,
                status_tx,
                status_rx,
                cancel,
            }),
        }
    }
}

struct Shared {
    registry: Arc<SubscriptionRegistry>,
    command_tx: mpsc::UnboundedSender<Command>,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    status_rx: watch::Receiver<ConnectionStatus>,
    cancel: CancellationToken,
}

/// Handle to a running realtime channel.
///
/// Cloning is cheap; all clones share the one physical connection and the one
/// subscription registry.
#[derive(Clone)]
pub struct RealtimeInstance {
    shared: Arc<Shared>,
}

impl RealtimeInstance {
    /// Registers a handler for a topic.
    ///
    /// Returns synchronously; if the connection is currently up, the physical
    /// subscription is attached asynchronously, otherwise it is attached on
    /// the next successful (re)connect. The returned guard unsubscribes when
    /// dropped or when [`Subscription::unsubscribe`] is called.
    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        handler: impl Fn(&TopicMessage) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe_handler(topic.into(), Arc::new(handler))
    }

    fn subscribe_handler(&self, topic: String, handler: Handler) -> Subscription {
        let id = self.shared.registry.insert(topic, handler);
        // Harmless while disconnected: the kernel skips entries that the
        // reconnect sweep already attached.
        if self.shared.command_tx.send(Command::Attach(id)).is_err() {
            debug!("Connection kernel is gone; subscription stays detached");
        }
        Subscription {
            shared: Arc::clone(&self.shared),
            id,
            released: AtomicBool::new(false),
        }
    }

    /// Scoped registration gated by an `enabled` flag.
    ///
    /// While enabled, exactly one active subscription for the pair exists;
    /// disabling or dropping the binding guarantees unsubscription.
    pub fn bind_topic(
        &self,
        topic: impl Into<String>,
        handler: impl Fn(&TopicMessage) + Send + Sync + 'static,
    ) -> TopicBinding {
        self.bind_topic_when(topic, handler, true)
    }

    /// Like [`bind_topic`](Self::bind_topic), with an initial enabled state.
    pub fn bind_topic_when(
        &self,
        topic: impl Into<String>,
        handler: impl Fn(&TopicMessage) + Send + Sync + 'static,
        enabled: bool,
    ) -> TopicBinding {
        let mut binding = TopicBinding {
            instance: self.clone(),
            topic: topic.into(),
            handler: Arc::new(handler),
            active: None,
        };
        binding.set_enabled(enabled);
        binding
    }

    /// Latest connection status; propagation from the kernel is immediate.
    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status_rx.borrow()
    }

    /// Watch receiver for push-style status consumers.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status_rx.clone()
    }

    /// Stops the channel.
    ///
    /// Idempotent. Status becomes `Disconnected` on every exit path, even if
    /// the kernel already exited, and all physical handles are released.
    pub fn stop(&self) {
        self.shared.cancel.cancel();
        self.shared.registry.clear_attachments();
        publish_status(&self.shared.status_tx, ConnectionStatus::Disconnected);
    }

    #[cfg(test)]
    pub(crate) fn attached_entries(&self) -> usize {
        self.shared.registry.attached_ids().len()
    }

    #[cfg(test)]
    pub(crate) fn registered_entries(&self) -> usize {
        self.shared.registry.len()
    }
}

/// Capability to revoke one registration.
///
/// Unsubscription is immediate from the registry's point of view: after
/// [`unsubscribe`](Self::unsubscribe) returns, the handler receives no more
/// messages, even if the broker-side detach is still in flight or fails.
pub struct Subscription {
    shared: Arc<Shared>,
    id: EntryId,
    released: AtomicBool,
}

impl Subscription {
    /// Removes the registration. Calling this more than once has no effect
    /// beyond the first call.
    pub fn unsubscribe(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.shared.registry.remove(self.id) {
            // Best effort; a failed detach must not block removal, and the
            // next reconnect sweep reconciles the attached set anyway.
            if self
                .shared
                .command_tx
                .send(Command::Detach(handle))
                .is_err()
            {
                debug!("Connection kernel is gone; skipping broker-side detach");
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Scoped `(topic, handler)` registration that can be suspended and resumed
/// without losing its configuration.
pub struct TopicBinding {
    instance: RealtimeInstance,
    topic: String,
    handler: Handler,
    active: Option<Subscription>,
}

impl TopicBinding {
    /// Enables or disables the registration. Idempotent in both directions.
    pub fn set_enabled(&mut self, enabled: bool) {
        match (enabled, self.active.is_some()) {
            (true, false) => {
                self.active = Some(
                    self.instance
                        .subscribe_handler(self.topic.clone(), Arc::clone(&self.handler)),
                );
            }
            (false, true) => {
                // Dropping the guard unsubscribes.
                self.active = None;
            }
            _ => {}
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.active.is_some()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}
