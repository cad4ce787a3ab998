//! Inbound ESL connection to FreeSWITCH.
//!
//! Generic over the stream so tests can drive it through an in-memory duplex
//! pipe instead of a socket.

use crate::esl::protocol::{read_message, EslError, EslEvent, EslMessage};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct EslConnection<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
}

impl EslConnection<TcpStream> {
    /// Connect and authenticate.
    pub async fn connect(host: &str, port: u16, password: &str) -> Result<Self, EslError> {
        let addr = format!("{}:{}", host, port);
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| EslError::Protocol(format!("connect to {} timed out", addr)))??;
        stream.set_nodelay(true)?;

        let mut connection = Self::from_stream(stream);
        connection.authenticate(password).await?;
        info!(addr = %addr, "Connected to FreeSWITCH event socket");
        Ok(connection)
    }
}

impl<S> EslConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn from_stream(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// Answer the `auth/request` greeting.
    pub async fn authenticate(&mut self, password: &str) -> Result<(), EslError> {
        let greeting = self.next_message().await?;
        if greeting.content_type() != Some("auth/request") {
            return Err(EslError::Protocol(format!(
                "expected auth/request, got {:?}",
                greeting.content_type()
            )));
        }

        self.send(&format!("auth {}", password)).await?;
        let reply = self.expect("command/reply").await?;
        if !reply.reply_text().starts_with("+OK") {
            return Err(EslError::Auth(reply.reply_text().to_string()));
        }
        Ok(())
    }

    /// Run an `api` command and return its response body.
    ///
    /// A body starting with `-ERR` is returned as `Ok`; callers decide whether that
    /// counts as failure.
    pub async fn api(&mut self, command: &str) -> Result<EslMessage, EslError> {
        debug!(command = %command, "ESL api");
        self.send(&format!("api {}", command)).await?;
        self.expect("api/response").await
    }

    /// Execute a dialplan application on a channel.
    pub async fn execute(&mut self, uuid: &str, app: &str, arg: &str) -> Result<EslMessage, EslError> {
        debug!(uuid = %uuid, app = %app, arg = %arg, "ESL sendmsg execute");
        self.send(&format!(
            "sendmsg {}\ncall-command: execute\nexecute-app-name: {}\nexecute-app-arg: {}",
            uuid, app, arg
        ))
        .await?;
        self.expect("command/reply").await
    }

    /// Subscribe to plain-text events. Custom subclasses go after `CUSTOM`.
    pub async fn subscribe(&mut self, events: &str) -> Result<(), EslError> {
        self.send(&format!("event plain {}", events)).await?;
        let reply = self.expect("command/reply").await?;
        if reply.is_error_reply() {
            return Err(EslError::Protocol(format!(
                "subscription refused: {}",
                reply.reply_text()
            )));
        }
        Ok(())
    }

    /// Wait for the next event, skipping anything that isn't one.
    pub async fn next_event(&mut self) -> Result<EslEvent, EslError> {
        loop {
            let message = self.next_message().await?;
            match message.content_type() {
                Some("text/event-plain") => {
                    return Ok(EslEvent::parse(message.body.as_deref().unwrap_or("")));
                }
                Some("text/disconnect-notice") => return Err(EslError::Closed),
                other => debug!(content_type = ?other, "Skipping non-event message"),
            }
        }
    }

    async fn send(&mut self, command: &str) -> Result<(), EslError> {
        self.writer.write_all(command.as_bytes()).await?;
        self.writer.write_all(b"\n\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn next_message(&mut self) -> Result<EslMessage, EslError> {
        read_message(&mut self.reader).await?.ok_or(EslError::Closed)
    }

    /// Read until a message of `content_type` arrives. Events interleaved on a
    /// command connection are dropped.
    async fn expect(&mut self, content_type: &str) -> Result<EslMessage, EslError> {
        loop {
            let message = self.next_message().await?;
            match message.content_type() {
                Some(found) if found == content_type => return Ok(message),
                Some("text/disconnect-notice") => return Err(EslError::Closed),
                other => debug!(expected = %content_type, found = ?other, "Skipping unexpected message"),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, DuplexStream};

    /// Fake switch side: reads one command (up to the blank line) at a time.
    pub(crate) struct FakeSwitch {
        reader: BufReader<Box<dyn AsyncRead + Unpin + Send>>,
        writer: Box<dyn AsyncWrite + Unpin + Send>,
    }

    impl FakeSwitch {
        /// Serve the switch side of `stream` (a duplex end or an accepted socket).
        pub(crate) fn new<S>(stream: S) -> Self
        where
            S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        {
            let (reader, writer) = tokio::io::split(stream);
            Self {
                reader: BufReader::new(Box::new(reader)),
                writer: Box::new(writer),
            }
        }

        pub(crate) fn pair() -> (EslConnection<DuplexStream>, FakeSwitch) {
            let (client, server) = tokio::io::duplex(16 * 1024);
            (EslConnection::from_stream(client), FakeSwitch::new(server))
        }

        /// Next command, or an empty string once the client has hung up.
        pub(crate) async fn read_command(&mut self) -> String {
            let mut lines = Vec::new();
            loop {
                let mut line = String::new();
                if self.reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                    break;
                }
                let line = line.trim_end().to_string();
                if line.is_empty() {
                    break;
                }
                lines.push(line);
            }
            lines.join("\n")
        }

        pub(crate) async fn write(&mut self, raw: &str) {
            self.writer.write_all(raw.as_bytes()).await.unwrap();
        }

        pub(crate) async fn api_response(&mut self, body: &str) {
            self.write(&format!(
                "Content-Type: api/response\nContent-Length: {}\n\n{}",
                body.len(),
                body
            ))
            .await;
        }

        pub(crate) async fn reply(&mut self, text: &str) {
            self.write(&format!("Content-Type: command/reply\nReply-Text: {}\n\n", text))
                .await;
        }
    }

    #[tokio::test]
    async fn test_authenticate_and_api() {
        let (mut conn, mut switch) = FakeSwitch::pair();

        let server = tokio::spawn(async move {
            switch.write("Content-Type: auth/request\n\n").await;
            assert_eq!(switch.read_command().await, "auth ClueCon");
            switch.reply("+OK accepted").await;

            assert_eq!(switch.read_command().await, "api uuid_break abc all");
            switch.api_response("+OK\n").await;
        });

        conn.authenticate("ClueCon").await.unwrap();
        let reply = conn.api("uuid_break abc all").await.unwrap();
        assert!(!reply.is_error_reply());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_password_is_rejected() {
        let (mut conn, mut switch) = FakeSwitch::pair();

        let server = tokio::spawn(async move {
            switch.write("Content-Type: auth/request\n\n").await;
            switch.read_command().await;
            switch.reply("-ERR invalid").await;
        });

        assert!(matches!(
            conn.authenticate("wrong").await,
            Err(EslError::Auth(reply)) if reply == "-ERR invalid"
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_sends_sendmsg_block() {
        let (mut conn, mut switch) = FakeSwitch::pair();

        let server = tokio::spawn(async move {
            let command = switch.read_command().await;
            assert_eq!(
                command,
                "sendmsg abc\ncall-command: execute\nexecute-app-name: playback\nexecute-app-arg: /tmp/a.wav"
            );
            switch.reply("+OK").await;
        });

        let reply = conn.execute("abc", "playback", "/tmp/a.wav").await.unwrap();
        assert_eq!(reply.reply_text(), "+OK");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_next_event_skips_replies() {
        let (mut conn, mut switch) = FakeSwitch::pair();

        let event = "Event-Name: CHANNEL_HANGUP\nUnique-ID: abc\n\n";
        switch.reply("+OK").await;
        switch
            .write(&format!(
                "Content-Type: text/event-plain\nContent-Length: {}\n\n{}",
                event.len(),
                event
            ))
            .await;

        let parsed = conn.next_event().await.unwrap();
        assert_eq!(parsed.name(), Some("CHANNEL_HANGUP"));
        assert_eq!(parsed.unique_id(), Some("abc"));
    }
}
