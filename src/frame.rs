//! STOMP 1.2 frame codec.
//!
//! The realtime channel only needs a handful of frames: `CONNECT`/`CONNECTED`
//! for the session handshake, `SUBSCRIBE`/`UNSUBSCRIBE` for topic attachment,
//! `MESSAGE`/`ERROR` inbound, and `DISCONNECT` on teardown. Each WebSocket
//! text message carries exactly one frame; newline-only messages are
//! heartbeats and decode to `None`.
//!
//! Header values are escaped per STOMP 1.2 (`\\`, `\n`, `\r`, `\c`), except in
//! `CONNECT`/`CONNECTED` frames, which STOMP 1.2 requires to stay unescaped.

use bytes::Bytes;

use crate::error::RealtimeError;

/// Frame types the channel sends or understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCommand {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Disconnect,
    Message,
    Error,
    Receipt,
}

impl FrameCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameCommand::Connect => "CONNECT",
            FrameCommand::Connected => "CONNECTED",
            FrameCommand::Subscribe => "SUBSCRIBE",
            FrameCommand::Unsubscribe => "UNSUBSCRIBE",
            FrameCommand::Disconnect => "DISCONNECT",
            FrameCommand::Message => "MESSAGE",
            FrameCommand::Error => "ERROR",
            FrameCommand::Receipt => "RECEIPT",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "CONNECT" => Some(FrameCommand::Connect),
            "CONNECTED" => Some(FrameCommand::Connected),
            "SUBSCRIBE" => Some(FrameCommand::Subscribe),
            "UNSUBSCRIBE" => Some(FrameCommand::Unsubscribe),
            "DISCONNECT" => Some(FrameCommand::Disconnect),
            "MESSAGE" => Some(FrameCommand::Message),
            "ERROR" => Some(FrameCommand::Error),
            "RECEIPT" => Some(FrameCommand::Receipt),
            _ => None,
        }
    }

    /// CONNECT and CONNECTED frames use raw header values (STOMP 1.2 §frames).
    fn escapes_headers(&self) -> bool {
        !matches!(self, FrameCommand::Connect | FrameCommand::Connected)
    }
}

/// A single STOMP frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub command: FrameCommand,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Frame {
    pub fn new(command: FrameCommand) -> Self {
        Frame {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Builder-style header append.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First value for a header name, per STOMP repeated-header semantics.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Serializes the frame, NUL-terminated.
    pub fn encode(&self) -> Bytes {
        let escape = self.command.escapes_headers();
        let mut out = Vec::with_capacity(64 + self.body.len());
        out.extend_from_slice(self.command.as_str().as_bytes());
        out.push(b'\n');
        for (name, value) in &self.headers {
            if escape {
                out.extend_from_slice(escape_header(name).as_bytes());
                out.push(b':');
                out.extend_from_slice(escape_header(value).as_bytes());
            } else {
                out.extend_from_slice(name.as_bytes());
                out.push(b':');
                out.extend_from_slice(value.as_bytes());
            }
            out.push(b'\n');
        }
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out.push(b'\0');
        Bytes::from(out)
    }

    /// Parses one frame from a WebSocket message payload.
    ///
    /// Returns `Ok(None)` for heartbeats (empty or EOL-only payloads).
    pub fn parse(input: &[u8]) -> Result<Option<Frame>, RealtimeError> {
        // Trailing NUL terminates the frame; EOLs after it are permitted.
        let mut end = input.len();
        while end > 0 && (input[end - 1] == b'\n' || input[end - 1] == b'\r') {
            end -= 1;
        }
        let input = &input[..end];
        let input = match input.last() {
            Some(b'\0') => &input[..input.len() - 1],
            _ => input,
        };
        if input.iter().all(|b| *b == b'\n' || *b == b'\r') {
            return Ok(None);
        }

        let (head, body) = split_head(input);
        let head = std::str::from_utf8(head)
            .map_err(|_| RealtimeError::Protocol("frame header is not valid UTF-8".into()))?;

        let mut lines = head.lines();
        let command_line = lines
            .next()
            .ok_or_else(|| RealtimeError::Protocol("empty frame".into()))?;
        let command = FrameCommand::from_str(command_line.trim_end_matches('\r')).ok_or_else(
            || RealtimeError::Protocol(format!("unknown frame command {command_line:?}")),
        )?;

        let mut headers = Vec::new();
        for line in lines {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let (name, value) = line.split_once(':').ok_or_else(|| {
                RealtimeError::Protocol(format!("malformed header line {line:?}"))
            })?;
            if command.escapes_headers() {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        Ok(Some(Frame {
            command,
            headers,
            body: Bytes::copy_from_slice(body),
        }))
    }
}

/// Splits raw frame bytes into the header block and the body.
fn split_head(input: &[u8]) -> (&[u8], &[u8]) {
    let mut i = 0;
    while i < input.len() {
        if input[i] == b'\n' {
            let rest = &input[i + 1..];
            if rest.first() == Some(&b'\n') {
                return (&input[..i], &rest[1..]);
            }
            if rest.len() >= 2 && rest[0] == b'\r' && rest[1] == b'\n' {
                return (&input[..i], &rest[2..]);
            }
        }
        i += 1;
    }
    (input, &[])
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(escaped: &str) -> Result<String, RealtimeError> {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            other => {
                return Err(RealtimeError::Protocol(format!(
                    "invalid header escape sequence \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

/// CONNECT frame opening a session; heartbeats are disabled on both sides.
pub fn connect(host: &str) -> Frame {
    Frame::new(FrameCommand::Connect)
        .header("accept-version", "1.2")
        .header("host", host)
        .header("heart-beat", "0,0")
}

/// SUBSCRIBE frame attaching a physical subscription.
pub fn subscribe(id: &str, destination: &str) -> Frame {
    Frame::new(FrameCommand::Subscribe)
        .header("id", id)
        .header("destination", destination)
        .header("ack", "auto")
}

/// UNSUBSCRIBE frame releasing a physical subscription.
pub fn unsubscribe(id: &str) -> Frame {
    Frame::new(FrameCommand::Unsubscribe).header("id", id)
}

/// DISCONNECT frame for graceful teardown.
pub fn disconnect() -> Frame {
    Frame::new(FrameCommand::Disconnect)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_subscribe() {
        let frame = subscribe("sub-1", "/topic/orders");
        let encoded = frame.encode();
        assert_eq!(
            &encoded[..],
            b"SUBSCRIBE\nid:sub-1\ndestination:/topic/orders\nack:auto\n\n\0"
        );
    }

    #[test]
    fn test_parse_message_round_trip() {
        let frame = Frame::new(FrameCommand::Message)
            .header("destination", "/topic/orders")
            .header("subscription", "sub-3")
            .header("message-id", "42");
        let frame = Frame {
            body: Bytes::from_static(b"{\"entityId\":7}"),
            ..frame
        };

        let parsed = Frame::parse(&frame.encode()).unwrap().unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_parse_heartbeat() {
        assert!(Frame::parse(b"\n").unwrap().is_none());
        assert!(Frame::parse(b"\r\n").unwrap().is_none());
        assert!(Frame::parse(b"").unwrap().is_none());
    }

    #[test]
    fn test_parse_crlf_frame() {
        let raw = b"CONNECTED\r\nversion:1.2\r\n\r\n\0";
        let parsed = Frame::parse(raw).unwrap().unwrap();
        assert_eq!(parsed.command, FrameCommand::Connected);
        assert_eq!(parsed.header_value("version"), Some("1.2"));
    }

    #[test]
    fn test_header_escaping_round_trip() {
        let frame = Frame::new(FrameCommand::Message).header("destination", "a:b\nc\\d");
        let parsed = Frame::parse(&frame.encode()).unwrap().unwrap();
        assert_eq!(parsed.header_value("destination"), Some("a:b\nc\\d"));
    }

    #[test]
    fn test_connect_headers_not_escaped() {
        let frame = connect("localhost");
        let encoded = frame.encode();
        let text = std::str::from_utf8(&encoded[..encoded.len() - 1]).unwrap();
        assert!(text.contains("host:localhost"));
        assert!(text.contains("heart-beat:0,0"));
    }

    #[test]
    fn test_parse_rejects_unknown_command() {
        assert!(Frame::parse(b"NONSENSE\n\n\0").is_err());
    }

    #[test]
    fn test_parse_rejects_malformed_header() {
        assert!(Frame::parse(b"MESSAGE\nno-colon-here\n\n\0").is_err());
    }

    #[test]
    fn test_parse_rejects_bad_escape() {
        assert!(Frame::parse(b"MESSAGE\ndestination:bad\\z\n\n\0").is_err());
    }

    #[test]
    fn test_repeated_header_first_wins() {
        let raw = b"MESSAGE\ndestination:/topic/a\ndestination:/topic/b\n\n\0";
        let parsed = Frame::parse(raw).unwrap().unwrap();
        assert_eq!(parsed.header_value("destination"), Some("/topic/a"));
    }
}
