//! Connection kernel: owns the single broker link and its retry loop.
//!
//! The kernel runs on one tokio task. It connects, runs the reattachment
//! sweep, publishes status transitions over a watch channel, services
//! attach/detach requests from the registry side, dispatches inbound
//! messages, and on transport closure waits a fixed delay before trying
//! again. Retry is infinite: this is an interactive dashboard channel that is
//! expected to eventually recover, so there is no backoff growth and no
//! give-up threshold.

use std::{sync::Arc, time::Duration};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    registry::{reconcile, EntryId, PhysicalHandle, SubscriptionRegistry},
    state::ConnectionStatus,
    transport::{LinkEvent, Transport, TransportLink},
};

/// Requests sent from the subscribe/unsubscribe side to the kernel.
#[derive(Debug)]
pub(crate) enum Command {
    /// Attach a physical subscription for a registered entry.
    Attach(EntryId),
    /// Best-effort release of a handle whose entry was already removed.
    Detach(PhysicalHandle),
}

pub(crate) struct ConnectionKernel<T: Transport> {
    transport: T,
    endpoint: String,
    retry_delay: Duration,
    registry: Arc<SubscriptionRegistry>,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
}

/// Why the per-link drive loop ended.
enum LinkExit {
    /// Transport closed; retry after the fixed delay.
    Closed(String),
    /// Shutdown requested or all instance handles dropped.
    Stopped,
}

impl<T: Transport> ConnectionKernel<T> {
    pub(crate) fn new(
        transport: T,
        endpoint: String,
        retry_delay: Duration,
        registry: Arc<SubscriptionRegistry>,
        status_tx: Arc<watch::Sender<ConnectionStatus>>,
        commands: mpsc::UnboundedReceiver<Command>,
        cancel: CancellationToken,
    ) -> Self {
        ConnectionKernel {
            transport,
            endpoint,
            retry_delay,
            registry,
            status_tx,
            commands,
            cancel,
        }
    }

    /// Runs until stopped. Guarantees `Disconnected` status and no remaining
    /// physical handles on every exit path.
    pub(crate) async fn run(mut self) {
        info!("Realtime channel connecting to {}", self.endpoint);
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.set_status(ConnectionStatus::Connecting);

            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.transport.connect(&self.endpoint) => result,
            };

            match connected {
                Ok(mut link) => {
                    self.sweep_reattach(&mut link).await;
                    self.set_status(ConnectionStatus::Connected);

                    let exit = self.drive(&mut link).await;
                    let released = self.registry.clear_attachments();
                    debug!("Released {} physical subscription(s)", released.len());

                    match exit {
                        LinkExit::Closed(reason) => {
                            warn!("Realtime connection lost: {reason}");
                            self.set_status(ConnectionStatus::Disconnected);
                        }
                        LinkExit::Stopped => {
                            link.close().await;
                            break;
                        }
                    }
                }
                Err(e) => {
                    warn!("Realtime connection attempt failed: {e}");
                    self.set_status(ConnectionStatus::Disconnected);
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }

        self.registry.clear_attachments();
        self.set_status(ConnectionStatus::Disconnected);
        info!("Realtime channel stopped");
    }

    /// Re-attaches every registered entry on a fresh link.
    ///
    /// Stale handles should not normally survive a reconnect boundary (they
    /// are cleared when the previous link ends), but a handle left behind is
    /// tolerated: it is detached first so no entry ever holds two physical
    /// subscriptions.
    async fn sweep_reattach(&mut self, link: &mut T::Link) {
        for id in self.registry.attached_ids() {
            if let Some(stale) = self.registry.take_physical(id) {
                debug!("Detaching stale subscription {}", stale.wire_id());
                if let Err(e) = link.detach(&stale).await {
                    warn!("Stale subscription detach failed: {e}");
                }
            }
        }

        let plan = reconcile(&self.registry.attached_ids(), &self.registry.ids());
        for id in plan.detach {
            // Unreachable after the stale sweep above, but harmless.
            if let Some(stale) = self.registry.take_physical(id) {
                let _ = link.detach(&stale).await;
            }
        }
        for id in plan.attach {
            self.attach_entry(link, id).await;
        }
    }

    /// Attaches one entry; failure leaves it detached for the next sweep.
    async fn attach_entry(&mut self, link: &mut T::Link, id: EntryId) {
        let Some(topic) = self.registry.topic_of(id) else {
            return; // unsubscribed in the meantime
        };
        if self.registry.is_attached(id) {
            return;
        }

        let handle = PhysicalHandle::for_entry(id);
        match link.attach(&handle, &topic).await {
            Ok(()) => {
                debug!("Attached {} to {topic}", handle.wire_id());
                if let Err(orphan) = self.registry.set_attached(id, handle) {
                    // Entry unsubscribed while the attach was in flight.
                    if let Err(e) = link.detach(&orphan).await {
                        warn!("Detach of orphaned subscription failed: {e}");
                    }
                }
            }
            Err(e) => {
                warn!("Subscription to {topic} failed (will retry on reconnect): {e}");
            }
        }
    }

    /// Services one live link until closure or shutdown.
    async fn drive(&mut self, link: &mut T::Link) -> LinkExit {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return LinkExit::Stopped,

                command = self.commands.recv() => match command {
                    Some(Command::Attach(id)) => self.attach_entry(link, id).await,
                    Some(Command::Detach(handle)) => {
                        if let Err(e) = link.detach(&handle).await {
                            warn!("Unsubscribe from broker failed: {e}");
                        }
                    }
                    // All instance handles dropped; nothing can subscribe again.
                    None => return LinkExit::Stopped,
                },

                event = link.next_event() => match event {
                    LinkEvent::Message(message) => {
                        self.registry.dispatch(
                            message.subscription.as_deref(),
                            &message.topic,
                            message.payload,
                        );
                    }
                    LinkEvent::ProtocolError(reason) => {
                        warn!("Broker protocol error (connection kept): {reason}");
                    }
                    LinkEvent::Closed(reason) => return LinkExit::Closed(reason),
                },
            }
        }
    }

    /// Publishes a status transition, logging only actual changes.
    fn set_status(&self, next: ConnectionStatus) {
        publish_status(&self.status_tx, next);
    }
}

/// Shared status update path for the kernel and `stop()`.
pub(crate) fn publish_status(tx: &watch::Sender<ConnectionStatus>, next: ConnectionStatus) {
    let changed = tx.send_if_modified(|current| {
        if *current != next {
            *current = next;
            true
        } else {
            false
        }
    });
    if changed {
        info!("Realtime connection status: {next}");
    }
}
