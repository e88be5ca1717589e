/// STOMP 1.2 text frames, the protocol the push channel speaks over WebSocket
use crate::error::{Result, SyncError};
use std::fmt;

/// Protocol versions offered on CONNECT
pub const ACCEPT_VERSION: &str = "1.2,1.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Send,
    Message,
    Receipt,
    Error,
    Disconnect,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Send => "SEND",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Disconnect => "DISCONNECT",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "CONNECT" | "STOMP" => Command::Connect,
            "CONNECTED" => Command::Connected,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "SEND" => Command::Send,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            "DISCONNECT" => Command::Disconnect,
            _ => return None,
        })
    }

    /// CONNECT and CONNECTED headers are sent verbatim
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StompFrame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of `key`; repeated headers keep the first occurrence
    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Serialize to wire text, NUL-terminated
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (k, v) in &self.headers {
            if escape {
                out.push_str(&escape_header(k));
                out.push(':');
                out.push_str(&escape_header(v));
            } else {
                out.push_str(k);
                out.push(':');
                out.push_str(v);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parse one frame. Returns `Ok(None)` for heart-beats (bare end-of-line).
    pub fn decode(raw: &str) -> Result<Option<Self>> {
        let raw = raw.trim_start_matches(['\r', '\n']);
        if raw.is_empty() || raw == "\0" {
            return Ok(None);
        }

        let (head, rest) = split_head(raw)
            .ok_or_else(|| SyncError::Protocol("STOMP frame without header terminator".to_string()))?;

        let mut lines = head.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));
        let command_line = lines.next().unwrap_or_default();
        let command = Command::parse(command_line)
            .ok_or_else(|| SyncError::Protocol(format!("Unknown STOMP command: {}", command_line)))?;

        let escape = command.escapes_headers();
        let mut headers = Vec::new();
        for line in lines {
            let (k, v) = line
                .split_once(':')
                .ok_or_else(|| SyncError::Protocol(format!("Malformed STOMP header: {}", line)))?;
            if escape {
                headers.push((unescape_header(k)?, unescape_header(v)?));
            } else {
                headers.push((k.to_string(), v.to_string()));
            }
        }

        let mut frame = StompFrame {
            command,
            headers,
            body: String::new(),
        };

        let body = match frame.get("content-length").map(str::parse::<usize>) {
            Some(Ok(len)) => rest
                .get(..len)
                .ok_or_else(|| SyncError::Protocol("STOMP body shorter than content-length".to_string()))?,
            Some(Err(_)) => {
                return Err(SyncError::Protocol("Invalid STOMP content-length".to_string()));
            }
            None => rest.split('\0').next().unwrap_or_default(),
        };
        frame.body = body.to_string();
        Ok(Some(frame))
    }
}

fn split_head(raw: &str) -> Option<(&str, &str)> {
    let lf = raw.find("\n\n").map(|i| (i, 2));
    let crlf = raw.find("\r\n\r\n").map(|i| (i, 4));
    let (i, sep) = match (lf, crlf) {
        (Some(a), Some(b)) => a.min(b),
        (a, b) => a.or(b)?,
    };
    Some((&raw[..i], &raw[i + sep..]))
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

fn unescape_header(raw: &str) -> Result<String> {
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
            other => {
                return Err(SyncError::Protocol(format!(
                    "Invalid STOMP header escape: \\{}",
                    other.map(String::from).unwrap_or_default()
                )));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_frame_encoding() {
        let frame = StompFrame::new(Command::Send)
            .header("destination", "/app/chat")
            .header("content-type", "application/json")
            .body(r#"{"receiverId":7}"#);
        let wire = frame.encode();
        assert!(wire.starts_with("SEND\ndestination:/app/chat\n"));
        assert!(wire.contains("content-length:16\n"));
        assert!(wire.ends_with("\n\n{\"receiverId\":7}\0"));
    }

    #[test]
    fn test_message_frame_decoding() {
        let wire = "MESSAGE\r\ndestination:/user/queue/messages\r\nsubscription:sub-0\r\nmessage-id:1\r\n\r\n{\"id\":1}\0";
        let frame = StompFrame::decode(wire).unwrap().unwrap();
        assert_eq!(frame.command, Command::Message);
        assert_eq!(frame.get("subscription"), Some("sub-0"));
        assert_eq!(frame.body, "{\"id\":1}");
    }

    #[test]
    fn test_header_escaping_round_trip() {
        let frame = StompFrame::new(Command::Message)
            .header("note", "a:b\\c\nd")
            .header("destination", "/topic/x");
        let wire = frame.encode();
        assert!(wire.contains("note:a\\cb\\\\c\\nd\n"));
        let decoded = StompFrame::decode(&wire).unwrap().unwrap();
        assert_eq!(decoded.get("note"), Some("a:b\\c\nd"));
    }

    #[test]
    fn test_connect_headers_are_not_escaped() {
        let frame = StompFrame::new(Command::Connect).header("Authorization", "Bearer a:b");
        assert!(frame.encode().contains("Authorization:Bearer a:b\n"));
    }

    #[test]
    fn test_content_length_allows_nul_in_body() {
        let wire = "MESSAGE\ncontent-length:3\n\na\0b\0";
        let frame = StompFrame::decode(wire).unwrap().unwrap();
        assert_eq!(frame.body, "a\0b");
    }

    #[test]
    fn test_heartbeats_and_garbage() {
        assert!(StompFrame::decode("\n").unwrap().is_none());
        assert!(StompFrame::decode("\r\n\r\n").unwrap().is_none());
        assert!(StompFrame::decode("NOPE\n\n\0").is_err());
        assert!(StompFrame::decode("MESSAGE\nbad-header\n\n\0").is_err());
        assert!(StompFrame::decode("MESSAGE\nx:\\t\n\n\0").is_err());
    }
}
