//! Line-oriented session transport
//!
//! A session talks to its peer over a byte stream handed to the process by
//! the super-server; for the stdio variant the peer endpoints arrive in
//! environment variables. Reads strip a trailing LF or CRLF, writes frame
//! with CRLF and flush immediately (the peer sees one line per write). An
//! idle deadline, refreshed on every read and write, terminates stalled
//! sessions.

use crate::error::{MailError, Result};
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, Stdin, Stdout,
};
use tokio::time::timeout;

/// Default idle deadline for a session.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Connection endpoints as reported by the spawning super-server.
///
/// Missing environment variables yield empty strings, never errors.
#[derive(Debug, Clone, Default)]
pub struct PeerInfo {
    pub proto: String,
    pub local_ip: String,
    pub local_port: String,
    pub local_host: String,
    pub remote_ip: String,
    pub remote_port: String,
    pub remote_host: String,
}

impl PeerInfo {
    pub fn from_env() -> Self {
        fn var(name: &str) -> String {
            std::env::var(name).unwrap_or_default()
        }
        Self {
            proto: var("PROTO"),
            local_ip: var("TCPLOCALIP"),
            local_port: var("TCPLOCALPORT"),
            local_host: var("TCPLOCALHOST"),
            remote_ip: var("TCPREMOTEIP"),
            remote_port: var("TCPREMOTEPORT"),
            remote_host: var("TCPREMOTEHOST"),
        }
    }
}

/// A buffered, line-oriented connection over any read/write pair.
pub struct Connection<R, W> {
    reader: BufReader<R>,
    writer: BufWriter<W>,
    peer: PeerInfo,
    idle_timeout: Duration,
}

impl Connection<Stdin, Stdout> {
    /// The super-server-facing transport: stdin/stdout plus environment
    /// metadata.
    pub fn from_stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), PeerInfo::from_env())
    }
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, peer: PeerInfo) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            peer,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn set_idle_timeout(&mut self, idle_timeout: Duration) {
        self.idle_timeout = idle_timeout;
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    /// Read one line, without its terminator. `None` at end of stream;
    /// `MailError::Timeout` when the idle deadline fires.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let n = match timeout(self.idle_timeout, self.reader.read_line(&mut line)).await {
            Ok(result) => result?,
            Err(_) => return Err(MailError::Timeout),
        };
        if n == 0 {
            return Ok(None);
        }
        if line.ends_with('\n') {
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
        }
        Ok(Some(line))
    }

    /// Write one line, framed with CRLF, and flush.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        let framed = format!("{}\r\n", line);
        match timeout(self.idle_timeout, async {
            self.writer.write_all(framed.as_bytes()).await?;
            self.writer.flush().await
        })
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(MailError::Timeout),
        }
        Ok(())
    }

    /// Flush buffered output and release the stream.
    pub async fn close(mut self) -> Result<()> {
        self.writer.flush().await?;
        Ok(())
    }
}
