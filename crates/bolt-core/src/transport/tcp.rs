//! TCP stream transport.
//!
//! Frames are delimited with a 4-byte big-endian length prefix. The send
//! side keeps one cached connection per target address and serializes
//! requests on it — one in-flight exchange at a time — so responses pair
//! with requests by position. Any I/O failure (or a caller abandoning an
//! exchange mid-flight) evicts the connection from the cache; the next send
//! dials fresh.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::error::{Code, Error, Result};
use crate::protocol::DEFAULT_MAX_MESSAGE_SIZE;
use crate::transport::{FrameHandler, Transport};

/// Default per-frame read timeout.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Default per-frame write timeout.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);
/// Default dial timeout.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

type ConnCache = Mutex<HashMap<String, Arc<tokio::sync::Mutex<TcpStream>>>>;

/// Length-prefixed TCP transport with a per-target connection cache.
pub struct TcpTransport {
    read_timeout: Duration,
    write_timeout: Duration,
    dial_timeout: Duration,
    max_message_size: usize,
    conns: Arc<ConnCache>,
    bound: Mutex<Option<SocketAddr>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl TcpTransport {
    /// Creates a transport with default timeouts and a 10 MiB frame cap.
    pub fn new() -> Self {
        TcpTransport {
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            conns: Arc::new(Mutex::new(HashMap::new())),
            bound: Mutex::new(None),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Sets the per-frame read timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Sets the per-frame write timeout.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Sets the dial timeout.
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Sets the maximum accepted frame size.
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// The per-frame read timeout in effect.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// The address the listener actually bound, once `listen` has bound it.
    /// Useful when listening on port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock()
    }

    /// Returns the cached connection for `addr`, dialing if absent.
    async fn connection(&self, addr: &str) -> Result<Arc<tokio::sync::Mutex<TcpStream>>> {
        if let Some(conn) = self.conns.lock().get(addr) {
            return Ok(conn.clone());
        }
        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::new(Code::Timeout, format!("dial {addr} timed out")))?
            .map_err(|e| Error::wrap(Code::Unknown, e, format!("failed to dial {addr}")))?;
        let conn = Arc::new(tokio::sync::Mutex::new(stream));
        self.conns.lock().insert(addr.to_string(), conn.clone());
        Ok(conn)
    }

    /// Runs `fut` against the context and a fallback timeout.
    ///
    /// The context firing wins with its own error (cancelled or deadline
    /// exceeded); the fallback expiring yields a timeout-coded error.
    async fn timed<T>(
        &self,
        ctx: &Context,
        limit: Duration,
        what: &str,
        fut: impl Future<Output = std::io::Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            _ = ctx.done() => Err(ctx.err().unwrap_or_else(Error::cancelled)),
            out = tokio::time::timeout(limit, fut) => match out {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(Error::wrap(Code::Unknown, e, format!("failed to {what}"))),
                Err(_) => Err(Error::new(Code::Timeout, format!("{what} timed out"))),
            },
        }
    }

    async fn exchange(&self, ctx: &Context, stream: &mut TcpStream, frame: &[u8]) -> Result<Vec<u8>> {
        let len = (frame.len() as u32).to_be_bytes();
        self.timed(ctx, self.write_timeout, "write frame", async {
            stream.write_all(&len).await?;
            stream.write_all(frame).await?;
            stream.flush().await
        })
        .await?;

        let mut len_buf = [0u8; 4];
        self.timed(
            ctx,
            self.read_timeout,
            "read response header",
            stream.read_exact(&mut len_buf),
        )
        .await?;
        let resp_len = u32::from_be_bytes(len_buf) as usize;
        if resp_len > self.max_message_size {
            return Err(Error::new(
                Code::InvalidArgument,
                format!(
                    "response of {resp_len} bytes exceeds maximum message size {}",
                    self.max_message_size
                ),
            ));
        }

        let mut response = vec![0u8; resp_len];
        self.timed(
            ctx,
            self.read_timeout,
            "read response",
            stream.read_exact(&mut response),
        )
        .await?;
        Ok(response)
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, ctx: &Context, addr: &str, frame: Vec<u8>) -> Result<Vec<u8>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::server_closed());
        }
        if addr.is_empty() {
            return Err(Error::new(Code::InvalidArgument, "target address is required"));
        }
        if frame.len() > self.max_message_size {
            return Err(Error::new(
                Code::InvalidArgument,
                format!(
                    "message of {} bytes exceeds maximum message size {}",
                    frame.len(),
                    self.max_message_size
                ),
            ));
        }

        let conn = self.connection(addr).await?;
        // One in-flight exchange per cached connection.
        let mut stream = conn.lock().await;
        // A half-finished exchange leaves unread bytes on the stream, so the
        // connection is unusable unless the exchange ran to completion. The
        // guard evicts on every exit path, including the caller's future
        // being dropped on cancellation; only success disarms it.
        let mut guard = EvictGuard {
            conns: &self.conns,
            addr,
            armed: true,
        };
        let response = self.exchange(ctx, &mut stream, &frame).await?;
        guard.armed = false;
        Ok(response)
    }

    async fn listen(&self, addr: &str, handler: FrameHandler) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::server_closed());
        }
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::wrap(Code::Unknown, e, format!("failed to listen on {addr}")))?;
        let local = listener.local_addr().ok();
        *self.bound.lock() = local;
        tracing::info!(addr = ?local, "tcp transport listening");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(Error::server_closed()),
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            if self.closed.load(Ordering::Acquire) {
                                return Err(Error::server_closed());
                            }
                            return Err(Error::wrap(Code::Unknown, e, "failed to accept"));
                        }
                    };
                    tracing::debug!(%peer, "connection accepted");
                    tokio::spawn(serve_conn(
                        stream,
                        peer,
                        handler.clone(),
                        self.read_timeout,
                        self.write_timeout,
                        self.max_message_size,
                        self.shutdown.clone(),
                    ));
                }
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.cancel();
        self.conns.lock().clear();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

/// Removes a connection from the cache on drop unless disarmed.
struct EvictGuard<'a> {
    conns: &'a ConnCache,
    addr: &'a str,
    armed: bool,
}

impl Drop for EvictGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.conns.lock().remove(self.addr);
            tracing::debug!(addr = %self.addr, "evicted connection after failed exchange");
        }
    }
}

/// Serves one accepted connection: read frame, invoke handler, write reply,
/// until EOF, timeout, or shutdown.
async fn serve_conn(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: FrameHandler,
    read_timeout: Duration,
    write_timeout: Duration,
    max_message_size: usize,
    shutdown: CancellationToken,
) {
    loop {
        let mut len_buf = [0u8; 4];
        let read = tokio::select! {
            _ = shutdown.cancelled() => return,
            r = tokio::time::timeout(read_timeout, stream.read_exact(&mut len_buf)) => r,
        };
        match read {
            Err(_) => {
                tracing::debug!(%peer, "connection idle past read timeout");
                return;
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return,
            Ok(Err(e)) => {
                tracing::debug!(%peer, error = %e, "failed to read frame header");
                return;
            }
            Ok(Ok(_)) => {}
        }

        let frame_len = u32::from_be_bytes(len_buf) as usize;
        if frame_len > max_message_size {
            tracing::warn!(%peer, frame_len, max_message_size, "inbound frame exceeds maximum message size");
            return;
        }
        let mut frame = vec![0u8; frame_len];
        match tokio::time::timeout(read_timeout, stream.read_exact(&mut frame)).await {
            Ok(Ok(_)) => {}
            _ => {
                tracing::debug!(%peer, "failed to read frame body");
                return;
            }
        }

        let response = match handler(Context::background(), frame).await {
            Ok(response) => response,
            // Best effort: the handler normally encodes failures into the
            // response envelope itself, so a raw error here is already a
            // transport-level problem.
            Err(e) => e.to_string().into_bytes(),
        };
        if response.len() > max_message_size {
            tracing::warn!(%peer, len = response.len(), "response exceeds maximum message size, dropping connection");
            return;
        }

        let resp_len = (response.len() as u32).to_be_bytes();
        let write = tokio::time::timeout(write_timeout, async {
            stream.write_all(&resp_len).await?;
            stream.write_all(&response).await?;
            stream.flush().await
        })
        .await;
        match write {
            Ok(Ok(_)) => {}
            _ => {
                tracing::debug!(%peer, "failed to write response");
                return;
            }
        }
    }
}
