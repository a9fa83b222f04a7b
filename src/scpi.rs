//! SCPI over TCP command socket
//!
//! This module provides the line-oriented client used for every instrument
//! exchange. A [`CommandSocket`] owns one stream to one instrument and turns
//! text commands into `\n`-terminated ASCII writes, decodes replies, and
//! replays command files line by line. Every exchange is logged as
//! `<peer> <- <line>` (sent) or `<peer> -> <line>` (received), truncated to
//! the configured display width.

use crate::error::{AppResult, CtrlError};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::Span;

/// Default maximum byte size of a single reply read
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Default display width of logged commands and replies
pub const DEFAULT_LOG_WIDTH: usize = 100;

/// Marker appended to log lines cut at the display width
pub const TRUNCATION_MARKER: &str = "...";

const LINE_END: char = '\n';
const COMMENT_MARKER: char = '#';
const QUERY_MARKER: char = '?';

/// Byte stream a [`CommandSocket`] can drive.
pub trait InstrumentIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> InstrumentIo for T {}

/// Per-connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    /// Bound on connect and on every later read or write. `None` blocks indefinitely.
    pub timeout: Option<Duration>,
    /// Maximum bytes taken by one `receive`
    pub buffer_size: usize,
    /// Characters of a command or reply shown in the log
    pub log_width: usize,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            log_width: DEFAULT_LOG_WIDTH,
        }
    }
}

impl SocketOptions {
    /// Options with the given timeout and default sizes.
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }
}

/// One replayed command and the reply it produced, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    /// Command as sent, without the line terminator
    pub command: String,
    /// Reply read after the command, for queries replayed with auto-receive
    pub response: Option<String>,
}

/// Line-oriented SCPI connection to a single instrument.
pub struct CommandSocket<S: InstrumentIo = TcpStream> {
    stream: S,
    peer: String,
    options: SocketOptions,
    span: Span,
}

impl CommandSocket<TcpStream> {
    /// Connect to an instrument at `host:port`.
    ///
    /// The timeout applies to the connect itself and to every later
    /// `send`/`receive` on the returned socket.
    pub async fn connect(host: &str, port: u16, timeout: Option<Duration>) -> AppResult<Self> {
        Self::connect_with(host, port, SocketOptions::with_timeout(timeout)).await
    }

    /// Connect with explicit buffer size and log width.
    pub async fn connect_with(host: &str, port: u16, options: SocketOptions) -> AppResult<Self> {
        let target = format!("{}:{}", host, port);
        let connecting = TcpStream::connect((host, port));
        let stream = match options.timeout {
            Some(limit) => tokio::time::timeout(limit, connecting)
                .await
                .map_err(|_| CtrlError::Timeout {
                    peer: target.clone(),
                    timeout: limit,
                })?,
            None => connecting.await,
        }
        .map_err(|source| CtrlError::Connection {
            peer: target.clone(),
            source,
        })?;

        // Commands are short and each one waits on the instrument anyway
        stream.set_nodelay(true)?;

        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or(target);

        tracing::debug!("Connected to SCPI instrument at {}", peer);

        Ok(Self::from_stream(stream, peer, options))
    }
}

impl<S: InstrumentIo> CommandSocket<S> {
    /// Wrap an already connected stream.
    ///
    /// `peer` is only used to attribute log lines.
    pub fn from_stream(stream: S, peer: impl Into<String>, options: SocketOptions) -> Self {
        let peer = peer.into();
        let span = tracing::info_span!("scpi", peer = %peer);
        Self {
            stream,
            peer,
            options,
            span,
        }
    }

    /// Attach an instrument label (e.g. `FG`) to every log line of this socket.
    pub fn labelled(mut self, label: &str) -> Self {
        self.span = tracing::info_span!("scpi", instrument = %label, peer = %self.peer);
        self
    }

    /// Address of the instrument, as used in log lines.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Send one command line and return the number of bytes written.
    ///
    /// The line terminator is appended here; `line` must not contain it.
    pub async fn send(&mut self, line: &str) -> AppResult<usize> {
        if !line.is_ascii() {
            return Err(CtrlError::Encode(line.to_string()));
        }

        let mut encoded = String::with_capacity(line.len() + 1);
        encoded.push_str(line);
        encoded.push(LINE_END);
        let bytes = encoded.as_bytes();

        let peer = self.peer.clone();
        let limit = self.options.timeout;
        let stream = &mut self.stream;
        with_timeout(limit, &peer, async {
            stream.write_all(bytes).await?;
            stream.flush().await
        })
        .await?
        .map_err(|source| CtrlError::Connection {
            peer: peer.clone(),
            source,
        })?;

        let shown = truncate_for_log(line, self.options.log_width);
        self.span.in_scope(|| tracing::info!("{} <- {}", self.peer, shown));

        Ok(bytes.len())
    }

    /// Read one reply with the trailing line terminator removed.
    ///
    /// Takes whatever the instrument sent in a single read of at most
    /// `buffer_size` bytes.
    pub async fn receive(&mut self) -> AppResult<String> {
        let mut buf = vec![0u8; self.options.buffer_size];

        let peer = self.peer.clone();
        let limit = self.options.timeout;
        let read = with_timeout(limit, &peer, self.stream.read(&mut buf))
            .await?
            .map_err(|source| CtrlError::Connection {
                peer: peer.clone(),
                source,
            })?;

        if read == 0 {
            return Err(CtrlError::ConnectionClosed(peer));
        }

        let received = &buf[..read];
        if !received.is_ascii() {
            return Err(CtrlError::Decode { peer });
        }
        let text = String::from_utf8_lossy(received);
        let reply = text.trim_end_matches(LINE_END).to_string();

        let shown = truncate_for_log(&reply, self.options.log_width);
        self.span.in_scope(|| tracing::info!("{} -> {}", self.peer, shown));

        Ok(reply)
    }

    /// Send a query and read its reply.
    pub async fn query(&mut self, line: &str) -> AppResult<String> {
        self.send(line).await?;
        self.receive().await
    }

    /// Replay command lines in order, one round trip per line.
    ///
    /// Blank lines and lines starting with `#` are skipped. With
    /// `auto_receive`, every line ending in `?` is followed by exactly one
    /// `receive` before the next line goes out.
    pub async fn replay(&mut self, contents: &str, auto_receive: bool) -> AppResult<Vec<Exchange>> {
        self.replay_lines(contents.lines(), auto_receive).await
    }

    /// Same as [`replay`](Self::replay) over an already split sequence of lines.
    pub async fn replay_lines<I, L>(&mut self, lines: I, auto_receive: bool) -> AppResult<Vec<Exchange>>
    where
        I: IntoIterator<Item = L>,
        L: AsRef<str>,
    {
        let mut exchanges = Vec::new();
        for line in lines {
            let Some(command) = command_of(line.as_ref()) else {
                continue;
            };

            self.send(command).await?;
            let response = if auto_receive && is_query(command) {
                Some(self.receive().await?)
            } else {
                None
            };

            exchanges.push(Exchange {
                command: command.to_string(),
                response,
            });
        }
        Ok(exchanges)
    }

    /// Read a command file and replay it.
    pub async fn replay_file(&mut self, path: impl AsRef<Path>, auto_receive: bool) -> AppResult<Vec<Exchange>> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| CtrlError::CommandFile {
                path: path.to_path_buf(),
                source,
            })?;

        self.span
            .in_scope(|| tracing::debug!("Replaying {}", path.display()));
        self.replay(&contents, auto_receive).await
    }

    /// Shut the connection down and release it.
    ///
    /// The write half is shut down first so the instrument sees end of
    /// stream, then the stream is dropped, which closes the read half too.
    /// Consumes the socket, so the connection is released exactly once.
    /// Sockets dropped without `close` still release the connection, only
    /// without the orderly shutdown.
    pub async fn close(self) -> AppResult<()> {
        let Self {
            mut stream,
            peer,
            span,
            ..
        } = self;

        let result = stream.shutdown().await;
        drop(stream);
        span.in_scope(|| tracing::debug!("Closed connection to {}", peer));
        result.map_err(|source| CtrlError::Connection { peer, source })
    }
}

/// Connect, replay `commands`, and close.
pub async fn send_commands<I, L>(
    commands: I,
    host: &str,
    port: u16,
    options: SocketOptions,
    auto_receive: bool,
) -> AppResult<Vec<Exchange>>
where
    I: IntoIterator<Item = L>,
    L: AsRef<str>,
{
    let mut socket = CommandSocket::connect_with(host, port, options).await?;
    let replayed = socket.replay_lines(commands, auto_receive).await;
    let closed = socket.close().await;
    let exchanges = replayed?;
    closed?;
    Ok(exchanges)
}

/// Connect, replay the commands written in the file at `path`, and close.
pub async fn send_commands_in(
    path: impl AsRef<Path>,
    host: &str,
    port: u16,
    options: SocketOptions,
    auto_receive: bool,
) -> AppResult<Vec<Exchange>> {
    let path = path.as_ref();
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| CtrlError::CommandFile {
            path: path.to_path_buf(),
            source,
        })?;
    send_commands(contents.lines(), host, port, options, auto_receive).await
}

/// Trimmed command of a line, or `None` for blank and comment lines.
pub fn command_of(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(COMMENT_MARKER) {
        None
    } else {
        Some(trimmed)
    }
}

/// True when `command` expects a reply.
pub fn is_query(command: &str) -> bool {
    command.ends_with(QUERY_MARKER)
}

/// Shorten `text` to `width` characters plus [`TRUNCATION_MARKER`] for display.
pub fn truncate_for_log(text: &str, width: usize) -> std::borrow::Cow<'_, str> {
    match text.char_indices().nth(width) {
        None => std::borrow::Cow::Borrowed(text),
        Some((cut, _)) => std::borrow::Cow::Owned(format!("{}{}", &text[..cut], TRUNCATION_MARKER)),
    }
}

async fn with_timeout<F, T>(limit: Option<Duration>, peer: &str, operation: F) -> AppResult<T>
where
    F: std::future::Future<Output = T>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, operation)
            .await
            .map_err(|_| CtrlError::Timeout {
                peer: peer.to_string(),
                timeout: limit,
            }),
        None => Ok(operation.await),
    }
}
