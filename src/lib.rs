//! fleetlink — realtime subscription multiplexer for the fleet dashboard
//!
//! Maintains one STOMP-over-WebSocket connection to the backend broker and
//! fans broker messages out to per-topic handlers. The connection reconnects
//! forever on a fixed delay; registered subscriptions survive reconnects and
//! are re-attached automatically. Consumers observe the link through a
//! tri-state [`ConnectionStatus`] watch channel.
//!
//! Entry point is [`RealtimeManager`]; see the [`manager`] module docs for a
//! usage sketch.

pub mod config;
mod connection;
pub mod error;
pub mod frame;
pub mod manager;
pub mod registry;
pub mod state;
pub mod transport;

pub use config::Config;
pub use error::RealtimeError;
pub use manager::{RealtimeInstance, RealtimeManager, Subscription, TopicBinding};
pub use registry::{Handler, PhysicalHandle, TopicMessage};
pub use state::ConnectionStatus;
pub use transport::{InboundMessage, LinkEvent, StompTransport, Transport, TransportLink};
