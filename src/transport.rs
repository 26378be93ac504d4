//! Broker transport abstraction and the production STOMP implementation.
//!
//! The connection kernel only depends on the `Transport`/`TransportLink` trait
//! pair, so it can be exercised against a scripted fake in tests. The
//! production implementation speaks minimal STOMP 1.2 over a WebSocket opened
//! with `tokio-tungstenite`: `connect` performs the WebSocket upgrade plus the
//! CONNECT/CONNECTED session handshake, and the link translates wire frames
//! into [`LinkEvent`]s.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, trace, warn};
use url::Url;

use crate::{
    error::RealtimeError,
    frame::{self, Frame, FrameCommand},
    registry::PhysicalHandle,
};

/// How long the broker gets to answer CONNECT with CONNECTED.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// One inbound broker message as seen by the kernel.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Wire id of the physical subscription this message was delivered on.
    pub subscription: Option<String>,
    /// Destination topic the broker routed the message to.
    pub topic: String,
    /// Opaque payload; decoding is the consumer's responsibility.
    pub payload: Bytes,
}

/// Events a live link yields to the connection kernel.
#[derive(Debug)]
pub enum LinkEvent {
    /// A message arrived on a subscribed topic.
    Message(InboundMessage),
    /// The broker or codec reported a protocol-level problem. The link stays
    /// usable; the kernel logs and carries on.
    ProtocolError(String),
    /// The transport closed. The kernel moves to `Disconnected` and retries.
    Closed(String),
}

/// Factory for physical connections to the broker.
#[async_trait]
pub trait Transport: Send + 'static {
    type Link: TransportLink;

    /// Opens the transport and completes the session handshake.
    async fn connect(&mut self, endpoint: &str) -> Result<Self::Link, RealtimeError>;
}

/// One live broker session.
#[async_trait]
pub trait TransportLink: Send {
    /// Attaches a physical subscription for a topic.
    async fn attach(&mut self, handle: &PhysicalHandle, topic: &str) -> Result<(), RealtimeError>;

    /// Releases a physical subscription.
    async fn detach(&mut self, handle: &PhysicalHandle) -> Result<(), RealtimeError>;

    /// Waits for the next link event. Cancel-safe.
    async fn next_event(&mut self) -> LinkEvent;

    /// Best-effort graceful teardown.
    async fn close(&mut self);
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Production transport: STOMP 1.2 over WebSocket.
#[derive(Debug, Default)]
pub struct StompTransport;

#[async_trait]
impl Transport for StompTransport {
    type Link = StompLink;

    async fn connect(&mut self, endpoint: &str) -> Result<StompLink, RealtimeError> {
        let host = Url::parse(endpoint)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| "localhost".to_string());

        debug!("Opening WebSocket to {endpoint}");
        let (ws, _response) = connect_async(endpoint).await?;
        let (mut sink, mut stream) = ws.split();

        sink.send(Message::Text(frame_text(&frame::connect(&host))))
            .await?;

        // The session is up once the broker answers with CONNECTED.
        let handshake = async {
            loop {
                match read_frame(&mut stream).await {
                    FrameRead::Frame(f) if f.command == FrameCommand::Connected => {
                        return Ok(());
                    }
                    FrameRead::Frame(f) if f.command == FrameCommand::Error => {
                        return Err(RealtimeError::Protocol(error_frame_reason(&f)));
                    }
                    FrameRead::Frame(f) => {
                        trace!("Ignoring {:?} frame during handshake", f.command);
                    }
                    FrameRead::Skip => {}
                    FrameRead::Malformed(reason) => {
                        warn!("Malformed frame during handshake: {reason}");
                    }
                    FrameRead::Closed(reason) => return Err(RealtimeError::Closed(reason)),
                }
            }
        };
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake).await {
            Ok(result) => result?,
            Err(_) => return Err(RealtimeError::HandshakeTimeout(HANDSHAKE_TIMEOUT)),
        }

        debug!("STOMP session established with {host}");
        Ok(StompLink { sink, stream })
    }
}

/// A live STOMP session over WebSocket.
pub struct StompLink {
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl TransportLink for StompLink {
    async fn attach(&mut self, handle: &PhysicalHandle, topic: &str) -> Result<(), RealtimeError> {
        self.sink
            .send(Message::Text(frame_text(&frame::subscribe(
                handle.wire_id(),
                topic,
            ))))
            .await?;
        Ok(())
    }

    async fn detach(&mut self, handle: &PhysicalHandle) -> Result<(), RealtimeError> {
        self.sink
            .send(Message::Text(frame_text(&frame::unsubscribe(
                handle.wire_id(),
            ))))
            .await?;
        Ok(())
    }

    async fn next_event(&mut self) -> LinkEvent {
        loop {
            match read_frame(&mut self.stream).await {
                FrameRead::Frame(f) => match f.command {
                    FrameCommand::Message => match f.header_value("destination") {
                        Some(destination) => {
                            return LinkEvent::Message(InboundMessage {
                                subscription: f.header_value("subscription").map(str::to_string),
                                topic: destination.to_string(),
                                payload: f.body.clone(),
                            });
                        }
                        None => {
                            return LinkEvent::ProtocolError(
                                "MESSAGE frame without destination header".into(),
                            );
                        }
                    },
                    FrameCommand::Error => {
                        return LinkEvent::ProtocolError(error_frame_reason(&f));
                    }
                    other => {
                        trace!("Ignoring inbound {:?} frame", other);
                    }
                },
                FrameRead::Skip => {}
                FrameRead::Malformed(reason) => return LinkEvent::ProtocolError(reason),
                FrameRead::Closed(reason) => return LinkEvent::Closed(reason),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self
            .sink
            .send(Message::Text(frame_text(&frame::disconnect())))
            .await
        {
            debug!("DISCONNECT frame not delivered: {e}");
        }
        if let Err(e) = self.sink.close().await {
            debug!("WebSocket close failed: {e}");
        }
    }
}

fn frame_text(frame: &Frame) -> String {
    String::from_utf8_lossy(&frame.encode()).into_owned()
}

fn error_frame_reason(frame: &Frame) -> String {
    frame
        .header_value("message")
        .map(str::to_string)
        .unwrap_or_else(|| String::from_utf8_lossy(&frame.body).into_owned())
}

enum FrameRead {
    Frame(Frame),
    /// Heartbeat or non-frame WebSocket message; read again.
    Skip,
    Malformed(String),
    Closed(String),
}

async fn read_frame(stream: &mut SplitStream<WsStream>) -> FrameRead {
    let raw = match stream.next().await {
        Some(Ok(Message::Text(text))) => Bytes::from(text.into_bytes()),
        Some(Ok(Message::Binary(bin))) => Bytes::from(bin),
        Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
            return FrameRead::Skip;
        }
        Some(Ok(Message::Close(close))) => {
            let reason = close
                .map(|c| c.reason.into_owned())
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| "closed by peer".to_string());
            return FrameRead::Closed(reason);
        }
        Some(Err(e)) => return FrameRead::Closed(e.to_string()),
        None => return FrameRead::Closed("stream ended".to_string()),
    };

    match Frame::parse(&raw) {
        Ok(Some(frame)) => FrameRead::Frame(frame),
        Ok(None) => FrameRead::Skip,
        Err(e) => FrameRead::Malformed(e.to_string()),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_frame_reason_prefers_message_header() {
        let f = Frame::new(FrameCommand::Error).header("message", "bad destination");
        assert_eq!(error_frame_reason(&f), "bad destination");
    }

    #[test]
    fn test_error_frame_reason_falls_back_to_body() {
        let f = Frame {
            body: Bytes::from_static(b"boom"),
            ..Frame::new(FrameCommand::Error)
        };
        assert_eq!(error_frame_reason(&f), "boom");
    }
}
