//! ESL wire format.
//!
//! Every message is a block of `Name: value` header lines ended by a blank
//! line, optionally followed by `Content-Length` bytes of body. Plain-text
//! events nest the same format inside the body, with URL-encoded values.

use std::collections::HashMap;
use std::fmt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

#[derive(Debug)]
pub enum EslError {
    Io(std::io::Error),
    /// The switch refused our password
    Auth(String),
    /// Something arrived that does not follow the framing rules
    Protocol(String),
    /// The switch closed the socket
    Closed,
}

impl fmt::Display for EslError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EslError::Io(err) => write!(f, "I/O error: {}", err),
            EslError::Auth(reply) => write!(f, "authentication failed: {}", reply),
            EslError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            EslError::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for EslError {}

impl From<std::io::Error> for EslError {
    fn from(err: std::io::Error) -> Self {
        EslError::Io(err)
    }
}

/// One framed message off the socket.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EslMessage {
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

impl EslMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }

    /// `Reply-Text` of a command reply, or the body of an api response.
    pub fn reply_text(&self) -> &str {
        self.header("Reply-Text")
            .or(self.body.as_deref())
            .unwrap_or("")
            .trim()
    }

    pub fn is_error_reply(&self) -> bool {
        self.reply_text().starts_with("-ERR")
    }
}

/// A parsed `text/event-plain` event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EslEvent {
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

impl EslEvent {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn name(&self) -> Option<&str> {
        self.header("Event-Name")
    }

    pub fn subclass(&self) -> Option<&str> {
        self.header("Event-Subclass")
    }

    pub fn unique_id(&self) -> Option<&str> {
        self.header("Unique-ID").filter(|id| !id.is_empty())
    }

    /// Parse the body of a `text/event-plain` message. Header values are URL-decoded.
    pub fn parse(text: &str) -> Self {
        let (head, rest) = match text.find("\n\n") {
            Some(split) => (&text[..split], Some(&text[split + 2..])),
            None => (text, None),
        };

        let headers: HashMap<String, String> = parse_header_lines(head)
            .into_iter()
            .map(|(name, value)| {
                let decoded = urlencoding::decode(&value)
                    .map(|v| v.into_owned())
                    .unwrap_or(value);
                (name, decoded)
            })
            .collect();

        let body = match (headers.get("Content-Length"), rest) {
            (Some(len), Some(rest)) => {
                let len = len.trim().parse::<usize>().unwrap_or(rest.len());
                Some(rest.get(..len).unwrap_or(rest).to_string())
            }
            _ => None,
        };

        Self { headers, body }
    }
}

fn parse_header_lines(block: &str) -> Vec<(String, String)> {
    block
        .lines()
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Read one framed message. `Ok(None)` on a clean EOF between messages.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<EslMessage>, EslError>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = HashMap::new();
    let mut line = String::new();
    let mut saw_header = false;

    loop {
        line.clear();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            return if saw_header {
                Err(EslError::Closed)
            } else {
                Ok(None)
            };
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            if saw_header {
                break;
            }
            // Stray blank lines between messages
            continue;
        }

        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| EslError::Protocol(format!("malformed header line: {}", trimmed)))?;
        headers.insert(name.trim().to_string(), value.trim().to_string());
        saw_header = true;
    }

    let body = match headers.get("Content-Length") {
        Some(len) => {
            let len: usize = len
                .parse()
                .map_err(|_| EslError::Protocol(format!("bad Content-Length: {}", len)))?;
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf).await.map_err(|err| {
                if err.kind() == std::io::ErrorKind::UnexpectedEof {
                    EslError::Closed
                } else {
                    EslError::Io(err)
                }
            })?;
            Some(String::from_utf8_lossy(&buf).into_owned())
        }
        None => None,
    };

    Ok(Some(EslMessage { headers, body }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_header_only_message() {
        let mut wire: &[u8] = b"Content-Type: auth/request\n\n";
        let message = read_message(&mut wire).await.unwrap().unwrap();
        assert_eq!(message.content_type(), Some("auth/request"));
        assert!(message.body.is_none());
        assert!(read_message(&mut wire).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reads_body_by_content_length() {
        let mut wire: &[u8] =
            b"Content-Type: api/response\nContent-Length: 14\n\n-ERR no reply\nContent-Type: command/reply\nReply-Text: +OK\n\n";

        let api = read_message(&mut wire).await.unwrap().unwrap();
        assert_eq!(api.body.as_deref(), Some("-ERR no reply\n"));
        assert!(api.is_error_reply());

        let reply = read_message(&mut wire).await.unwrap().unwrap();
        assert_eq!(reply.reply_text(), "+OK");
        assert!(!reply.is_error_reply());
    }

    #[tokio::test]
    async fn test_truncated_message_is_closed() {
        let mut wire: &[u8] = b"Content-Type: api/response\nContent-Length: 50\n\nshort";
        assert!(matches!(read_message(&mut wire).await, Err(EslError::Closed)));
    }

    #[test]
    fn test_event_parse_decodes_values_and_body() {
        let json = r#"{"file":"/tmp/a.wav"}"#;
        let text = format!(
            "Event-Name: CUSTOM\nEvent-Subclass: mod_audio_fork%3A%3Aplay_audio\nUnique-ID: abc-123\nContent-Length: {}\n\n{}",
            json.len(),
            json
        );
        let event = EslEvent::parse(&text);
        assert_eq!(event.name(), Some("CUSTOM"));
        assert_eq!(event.subclass(), Some("mod_audio_fork::play_audio"));
        assert_eq!(event.unique_id(), Some("abc-123"));
        assert_eq!(event.body.as_deref(), Some(json));
    }
}
