//! STOMP 1.2 frames as carried in WebSocket text messages.
//!
//! A frame is `COMMAND\nheader:value\n...\n\nbody\0`. A bare EOL between
//! frames is a heartbeat.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const NULL: char = '\0';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StompCommand {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl StompCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            StompCommand::Connect => "CONNECT",
            StompCommand::Stomp => "STOMP",
            StompCommand::Connected => "CONNECTED",
            StompCommand::Send => "SEND",
            StompCommand::Subscribe => "SUBSCRIBE",
            StompCommand::Unsubscribe => "UNSUBSCRIBE",
            StompCommand::Disconnect => "DISCONNECT",
            StompCommand::Message => "MESSAGE",
            StompCommand::Receipt => "RECEIPT",
            StompCommand::Error => "ERROR",
        }
    }

    // CONNECT and CONNECTED headers are sent verbatim (STOMP 1.2 §Value Encoding)
    fn escapes_headers(&self) -> bool {
        !matches!(self, StompCommand::Connect | StompCommand::Connected)
    }
}

impl fmt::Display for StompCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StompCommand {
    type Err = StompError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let command = match s {
            "CONNECT" => StompCommand::Connect,
            "STOMP" => StompCommand::Stomp,
            "CONNECTED" => StompCommand::Connected,
            "SEND" => StompCommand::Send,
            "SUBSCRIBE" => StompCommand::Subscribe,
            "UNSUBSCRIBE" => StompCommand::Unsubscribe,
            "DISCONNECT" => StompCommand::Disconnect,
            "MESSAGE" => StompCommand::Message,
            "RECEIPT" => StompCommand::Receipt,
            "ERROR" => StompCommand::Error,
            other => return Err(StompError::UnknownCommand(other.to_owned())),
        };
        Ok(command)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StompError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("malformed header line: {0}")]
    MalformedHeader(String),
    #[error("invalid escape sequence in header")]
    InvalidEscape,
    #[error("frame is missing its NUL terminator")]
    Unterminated,
    #[error("invalid content-length: {0}")]
    InvalidContentLength(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: StompCommand,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StompFrame {
    pub fn new(command: StompCommand) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First occurrence wins, as the protocol requires for repeated headers.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn connect(host: &str, access_token: &str, heart_beat: HeartBeat) -> Self {
        StompFrame::new(StompCommand::Connect)
            .header("accept-version", "1.2,1.1,1.0")
            .header("host", host)
            .header("heart-beat", heart_beat.to_string())
            .header("Authorization", format!("Bearer {access_token}"))
    }

    pub fn connected(heart_beat: HeartBeat) -> Self {
        StompFrame::new(StompCommand::Connected)
            .header("version", "1.2")
            .header("heart-beat", heart_beat.to_string())
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        StompFrame::new(StompCommand::Subscribe)
            .header("id", id)
            .header("destination", destination)
    }

    pub fn unsubscribe(id: &str) -> Self {
        StompFrame::new(StompCommand::Unsubscribe).header("id", id)
    }

    pub fn send(destination: &str, body: impl Into<String>) -> Self {
        StompFrame::new(StompCommand::Send)
            .header("destination", destination)
            .with_body(body)
    }

    pub fn message(destination: &str, subscription: &str, message_id: &str, body: &str) -> Self {
        StompFrame::new(StompCommand::Message)
            .header("destination", destination)
            .header("subscription", subscription)
            .header("message-id", message_id)
            .with_body(body)
    }

    pub fn error(message: &str) -> Self {
        StompFrame::new(StompCommand::Error).header("message", message)
    }

    pub fn disconnect() -> Self {
        StompFrame::new(StompCommand::Disconnect)
    }

    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push(NULL);
        out
    }
}

/// Decodes every frame in one transport message. Heartbeat EOLs are
/// skipped, so a heartbeat-only message yields an empty vector.
pub fn decode_frames(text: &str) -> Result<Vec<StompFrame>, StompError> {
    let mut frames = Vec::new();
    let mut rest = text;
    loop {
        rest = rest.trim_start_matches(['\n', '\r']);
        if rest.is_empty() {
            return Ok(frames);
        }
        let (frame, remaining) = decode_one(rest)?;
        frames.push(frame);
        rest = remaining;
    }
}

fn decode_one(input: &str) -> Result<(StompFrame, &str), StompError> {
    let (command_line, mut rest) = split_line(input).ok_or(StompError::Unterminated)?;
    let command: StompCommand = command_line.parse()?;
    let escape = command.escapes_headers();

    let mut headers = Vec::new();
    loop {
        let (line, remaining) = split_line(rest).ok_or(StompError::Unterminated)?;
        rest = remaining;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| StompError::MalformedHeader(line.to_owned()))?;
        if escape {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_owned(), value.to_owned()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(name, _)| name == "content-length")
        .map(|(_, value)| {
            value
                .trim()
                .parse::<usize>()
                .map_err(|_| StompError::InvalidContentLength(value.clone()))
        })
        .transpose()?;

    let (body, remaining) = match content_length {
        Some(len) => {
            if rest.len() < len || !rest.is_char_boundary(len) || !rest[len..].starts_with(NULL) {
                return Err(StompError::Unterminated);
            }
            (&rest[..len], &rest[len + 1..])
        }
        None => {
            let end = rest.find(NULL).ok_or(StompError::Unterminated)?;
            (&rest[..end], &rest[end + 1..])
        }
    };

    let frame = StompFrame {
        command,
        headers,
        body: body.to_owned(),
    };
    Ok((frame, remaining))
}

fn split_line(input: &str) -> Option<(&str, &str)> {
    let end = input.find('\n')?;
    let line = input[..end].strip_suffix('\r').unwrap_or(&input[..end]);
    Some((line, &input[end + 1..]))
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, StompError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(StompError::InvalidEscape),
        }
    }
    Ok(out)
}

// region heart-beat

/// `heart-beat` header value: (can send every, wants to receive every), ms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartBeat {
    pub outgoing_ms: u64,
    pub incoming_ms: u64,
}

impl HeartBeat {
    pub fn symmetric(interval: Duration) -> Self {
        let ms = interval.as_millis() as u64;
        Self {
            outgoing_ms: ms,
            incoming_ms: ms,
        }
    }

    pub fn parse(value: Option<&str>) -> Self {
        let Some((cx, cy)) = value.and_then(|v| v.split_once(',')) else {
            return Self::default();
        };
        Self {
            outgoing_ms: cx.trim().parse().unwrap_or(0),
            incoming_ms: cy.trim().parse().unwrap_or(0),
        }
    }

    /// Negotiated (send every, expect traffic every) for the client side.
    pub fn negotiate(client: HeartBeat, server: HeartBeat) -> (Option<Duration>, Option<Duration>) {
        let pick = |ours: u64, theirs: u64| {
            (ours != 0 && theirs != 0).then(|| Duration::from_millis(ours.max(theirs)))
        };
        (
            pick(client.outgoing_ms, server.incoming_ms),
            pick(client.incoming_ms, server.outgoing_ms),
        )
    }
}

impl fmt::Display for HeartBeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.outgoing_ms, self.incoming_ms)
    }
}

// endregion

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_send_with_content_length() {
        let frame = StompFrame::send("/pub/app/send.7", r#"{"content":"hi"}"#);
        assert_eq!(
            frame.encode(),
            "SEND\ndestination:/pub/app/send.7\ncontent-length:16\n\n{\"content\":\"hi\"}\0"
        );
    }

    #[test]
    fn decodes_message_and_skips_heartbeats() {
        let text = "\n\nMESSAGE\ndestination:/sub/chat.7\nsubscription:sub-1\nmessage-id:m1\n\nhello\0\n";
        let frames = decode_frames(text).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command, StompCommand::Message);
        assert_eq!(frames[0].get("subscription"), Some("sub-1"));
        assert_eq!(frames[0].body, "hello");

        assert!(decode_frames("\n").unwrap().is_empty());
    }

    #[test]
    fn decodes_several_frames_in_one_message() {
        let text = format!(
            "{}{}",
            StompFrame::subscribe("sub-1", "/sub/chat.1").encode(),
            StompFrame::subscribe("sub-2", "/sub/chat.2").encode()
        );
        let frames = decode_frames(&text).unwrap();
        let ids: Vec<_> = frames.iter().filter_map(|f| f.get("id")).collect();
        assert_eq!(ids, ["sub-1", "sub-2"]);
    }

    #[test]
    fn content_length_allows_nul_free_body_with_colons() {
        let frame = StompFrame::message("/sub/chat.1", "sub-1", "m:1", "a:b\nc");
        let decoded = decode_frames(&frame.encode()).unwrap();
        assert_eq!(decoded, vec![frame.header("content-length", "5")]);
    }

    #[test]
    fn connect_headers_are_not_escaped() {
        let frame = StompFrame::connect("example.org", "A1", HeartBeat::default());
        let encoded = frame.encode();
        assert!(encoded.contains("Authorization:Bearer A1\n"));
        assert!(encoded.contains("host:example.org\n"));
    }

    #[test]
    fn rejects_unterminated_frames() {
        assert_eq!(
            decode_frames("MESSAGE\nsubscription:sub-1\n\nbody"),
            Err(StompError::Unterminated)
        );
        assert!(matches!(
            decode_frames("BOGUS\n\n\0"),
            Err(StompError::UnknownCommand(_))
        ));
    }

    #[test]
    fn heart_beat_negotiation() {
        let client = HeartBeat::symmetric(Duration::from_secs(4));
        let server = HeartBeat::parse(Some("10000,0"));
        let (send, expect) = HeartBeat::negotiate(client, server);
        assert_eq!(send, None);
        assert_eq!(expect, Some(Duration::from_secs(10)));

        let (send, expect) = HeartBeat::negotiate(client, HeartBeat::parse(None));
        assert_eq!((send, expect), (None, None));
    }
}
