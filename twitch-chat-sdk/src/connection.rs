//! TCP connection to the chat server: login handshake and line I/O.
//!
//! A [`Connection`] is split into a [`LineReader`] owned by the receive loop
//! and a [`LineWriter`] shared with the send path. The two halves of the
//! socket are independent, so a read never waits on a write or vice versa.
//! Reconnecting builds a brand new `Connection`; nothing is reused.

use std::io;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};

use crate::config::Session;
use crate::error::{ConnectError, ReadError, SendError};

/// Capabilities requested at login: IRCv3 tags, Twitch commands, JOIN/PART.
pub const CAP_REQUEST: &str = "CAP REQ :twitch.tv/tags twitch.tv/commands twitch.tv/membership";

/// Twitch allows 8 KiB of tags plus a 512 byte message; leave headroom.
const MAX_LINE_LENGTH: usize = 16 * 1024;

/// Upper bound on a single line write unless overridden per connection.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// An authenticated connection that has joined the session's channel.
pub struct Connection {
    reader: LineReader,
    writer: LineWriter,
}

impl Connection {
    pub fn is_connected(&self) -> bool {
        self.reader.is_connected()
    }

    pub fn into_split(self) -> (LineReader, LineWriter) {
        (self.reader, self.writer)
    }
}

/// Open a TCP stream to `endpoint`, log in and join the session's channel.
///
/// The handshake is written in a fixed order (CAP, PASS, NICK, USER, JOIN)
/// with a flush after every line. No retries here; the receive loop owns
/// that policy.
pub async fn connect(session: &Session, endpoint: &str) -> Result<Connection, ConnectError> {
    tracing::debug!("Connecting to {endpoint}...");
    let tcp = TcpStream::connect(endpoint)
        .await
        .map_err(|source| ConnectError::Connect {
            addr: endpoint.to_string(),
            source,
        })?;
    let _ = tcp.set_nodelay(true);
    tracing::debug!("TCP connected to {endpoint}");

    let (read, write) = tcp.into_split();
    let mut writer = LineWriter {
        inner: write,
        timeout: DEFAULT_WRITE_TIMEOUT,
    };
    login(&mut writer, session)
        .await
        .map_err(ConnectError::Handshake)?;
    tracing::info!(channel = %session.channel(), nick = %session.bot_name(), "Joined chat channel");

    Ok(Connection {
        reader: LineReader::new(read),
        writer,
    })
}

async fn login(writer: &mut LineWriter, session: &Session) -> Result<(), SendError> {
    let nick = session.bot_name();
    tracing::trace!("Beginning IRC authentication");
    writer.send_line(CAP_REQUEST).await?;
    writer
        .write_line(&format!("PASS oauth:{}", session.token()))
        .await?;
    tracing::trace!("< PASS oauth:<redacted>");
    writer.send_line(&format!("NICK {nick}")).await?;
    writer.send_line(&format!("USER {nick} 8 * :{nick}")).await?;
    writer
        .send_line(&format!("JOIN #{}", session.channel()))
        .await
}

/// Write half of a connection.
pub struct LineWriter {
    inner: OwnedWriteHalf,
    timeout: Duration,
}

impl LineWriter {
    /// Bound each line write by `timeout`. A peer that stops reading makes
    /// writes fail with `TimedOut` rather than hang.
    pub fn set_write_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Write one line plus CRLF and flush.
    pub async fn send_line(&mut self, line: &str) -> Result<(), SendError> {
        tracing::trace!("< {line}");
        self.write_line(line).await
    }

    async fn write_line(&mut self, line: &str) -> Result<(), SendError> {
        let mut buf = String::with_capacity(line.len() + 2);
        buf.push_str(line);
        buf.push_str("\r\n");
        let limit = self.timeout;
        let write = async {
            self.inner.write_all(buf.as_bytes()).await?;
            self.inner.flush().await
        };
        match tokio::time::timeout(limit, write).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(SendError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "write to chat server timed out",
            ))),
        }
    }

    /// Half-close the socket. Errors are ignored; the peer may be gone already.
    pub async fn close(&mut self) {
        let _ = tokio::time::timeout(self.timeout, self.inner.shutdown()).await;
    }
}

/// Read half of a connection, framed into lines (CRLF or LF).
pub struct LineReader {
    /// `None` once the peer closed the stream or the socket failed.
    lines: Option<FramedRead<OwnedReadHalf, LinesCodec>>,
    /// Complete lines may sit in the buffer behind a decode error.
    draining: bool,
    /// `FramedRead` yields a single `None` after a decode error, then resumes.
    recovering: bool,
}

impl LineReader {
    fn new(read: OwnedReadHalf) -> Self {
        Self {
            lines: Some(FramedRead::new(
                read,
                LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
            )),
            draining: false,
            recovering: false,
        }
    }

    /// False once the peer closed the stream or the socket failed.
    pub fn is_connected(&self) -> bool {
        self.lines.is_some()
    }

    /// Wait up to `wait` for the next line.
    ///
    /// `Ok(None)` means nothing arrived this time (or the stream just ended,
    /// see [`is_connected`](Self::is_connected)). Cancel-safe: a partially
    /// received line stays buffered for the next call.
    pub async fn read_line(&mut self, wait: Duration) -> Result<Option<String>, ReadError> {
        if self.draining
            && let Some(lines) = self.lines.as_mut()
        {
            match decode_buffered(lines) {
                Ok(Some(line)) => return Ok(Some(line)),
                Ok(None) => self.draining = false,
                Err(e) => return Err(self.on_error(e)),
            }
        }

        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let Some(lines) = self.lines.as_mut() else {
                return Ok(None);
            };
            match tokio::time::timeout_at(deadline, lines.next()).await {
                Err(_) => return Ok(None),
                Ok(Some(Ok(line))) => {
                    self.recovering = false;
                    return Ok(Some(line));
                }
                Ok(Some(Err(e))) => {
                    self.recovering = true;
                    return Err(self.on_error(e));
                }
                Ok(None) if self.recovering => self.recovering = false,
                Ok(None) => {
                    self.lines = None;
                    return Ok(None);
                }
            }
        }
    }

    fn on_error(&mut self, e: LinesCodecError) -> ReadError {
        let err = ReadError::from(e);
        match err {
            ReadError::Io(ref source) if source.kind() != io::ErrorKind::InvalidData => {
                self.lines = None;
            }
            _ => self.draining = true,
        }
        err
    }
}

/// Decode one line from what `FramedRead` already buffered, without reading.
fn decode_buffered(
    lines: &mut FramedRead<OwnedReadHalf, LinesCodec>,
) -> Result<Option<String>, LinesCodecError> {
    let mut buf = std::mem::take(lines.read_buffer_mut());
    let decoded = lines.decoder_mut().decode(&mut buf);
    *lines.read_buffer_mut() = buf;
    decoded
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    const WAIT: Duration = Duration::from_millis(200);

    async fn pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let session = Session::new("chan", "bot", "secret").unwrap();
        let (conn, accepted) = tokio::join!(connect(&session, &addr), listener.accept());
        (conn.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn handshake_is_sent_in_order() {
        let (conn, server) = pair().await;
        assert!(conn.is_connected());
        let mut lines = BufReader::new(server).lines();
        let mut got = Vec::new();
        for _ in 0..5 {
            got.push(lines.next_line().await.unwrap().unwrap());
        }
        assert_eq!(
            got,
            vec![
                CAP_REQUEST.to_string(),
                "PASS oauth:secret".to_string(),
                "NICK bot".to_string(),
                "USER bot 8 * :bot".to_string(),
                "JOIN #chan".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let session = Session::new("chan", "bot", "secret").unwrap();
        let err = connect(&session, &addr).await.err().unwrap();
        assert!(matches!(err, ConnectError::Connect { .. }));
    }

    #[tokio::test]
    async fn reads_crlf_and_lf_lines() {
        let (conn, mut server) = pair().await;
        let (mut reader, _writer) = conn.into_split();
        server.write_all(b"PING :a\r\nPING :b\n").await.unwrap();
        assert_eq!(reader.read_line(WAIT).await.unwrap().as_deref(), Some("PING :a"));
        assert_eq!(reader.read_line(WAIT).await.unwrap().as_deref(), Some("PING :b"));
    }

    #[tokio::test]
    async fn no_data_is_empty_not_error() {
        let (conn, _server) = pair().await;
        let (mut reader, _writer) = conn.into_split();
        assert_eq!(reader.read_line(Duration::from_millis(20)).await.unwrap(), None);
        assert!(reader.is_connected());
    }

    #[tokio::test]
    async fn partial_line_survives_poll_timeout() {
        let (conn, mut server) = pair().await;
        let (mut reader, _writer) = conn.into_split();
        server.write_all(b"PING :to").await.unwrap();
        assert_eq!(reader.read_line(Duration::from_millis(20)).await.unwrap(), None);
        server.write_all(b"mato\r\n").await.unwrap();
        assert_eq!(reader.read_line(WAIT).await.unwrap().as_deref(), Some("PING :tomato"));
    }

    #[tokio::test]
    async fn peer_close_marks_disconnected() {
        let (conn, server) = pair().await;
        let (mut reader, _writer) = conn.into_split();
        // The unread handshake may turn the close into a reset; either way we're done.
        drop(server);
        let read = reader.read_line(WAIT).await;
        assert!(!matches!(read, Ok(Some(_))));
        assert!(!reader.is_connected());
    }

    #[tokio::test]
    async fn overlong_line_is_read_error_but_stays_connected() {
        let (conn, mut server) = pair().await;
        let (mut reader, _writer) = conn.into_split();
        let long = "x".repeat(MAX_LINE_LENGTH + 10);
        server.write_all(long.as_bytes()).await.unwrap();
        server.write_all(b"\r\nPING :after\r\n").await.unwrap();

        let mut saw_error = false;
        let mut next = None;
        for _ in 0..5 {
            match reader.read_line(WAIT).await {
                Err(ReadError::LineTooLong) => saw_error = true,
                Ok(Some(line)) => {
                    next = Some(line);
                    break;
                }
                Ok(None) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(saw_error);
        assert!(reader.is_connected());
        assert_eq!(next.as_deref(), Some("PING :after"));
    }

    #[tokio::test]
    async fn non_utf8_line_is_skipped() {
        let (conn, mut server) = pair().await;
        let (mut reader, _writer) = conn.into_split();
        server.write_all(b"PING :\xff\xfe\r\nPING :ok\r\n").await.unwrap();

        assert!(matches!(reader.read_line(WAIT).await, Err(ReadError::Io(_))));
        assert!(reader.is_connected());
        assert_eq!(reader.read_line(WAIT).await.unwrap().as_deref(), Some("PING :ok"));
    }

    #[tokio::test]
    async fn stalled_peer_makes_writes_time_out() {
        let (conn, _server) = pair().await;
        let (_reader, mut writer) = conn.into_split();
        writer.set_write_timeout(Duration::from_millis(100));

        // The server never reads; socket buffers fill up and a write stalls.
        let line = "x".repeat(1024 * 1024);
        let outcome = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Err(e) = writer.send_line(&line).await {
                    return e;
                }
            }
        })
        .await
        .expect("write never timed out");
        assert!(matches!(outcome, SendError::Io(ref e) if e.kind() == io::ErrorKind::TimedOut));
    }

    #[tokio::test]
    async fn writer_appends_crlf() {
        let (conn, server) = pair().await;
        let (_reader, mut writer) = conn.into_split();
        let mut lines = BufReader::new(server).lines();
        for _ in 0..5 {
            lines.next_line().await.unwrap();
        }
        writer.send_line("PONG :tmi.twitch.tv").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("PONG :tmi.twitch.tv"));
    }
}
