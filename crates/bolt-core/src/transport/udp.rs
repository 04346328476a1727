//! UDP datagram transport.
//!
//! One datagram carries one frame, so no length prefix is involved. The
//! listen path is fully functional: each inbound datagram is handled on its
//! own task and the response is sent back to the datagram's source address.
//!
//! The send path is best-effort by nature — a connectionless socket gives no
//! way to pair a response with a request — so `send` transmits the frame and
//! then returns an explicit error stating that no reply semantics exist.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::error::{Code, Error, Result};
use crate::transport::{FrameHandler, Transport};

/// Default cap on a datagram frame (64 KiB, the practical UDP limit).
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 64 * 1024;
/// Default send timeout.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Best-effort datagram transport.
pub struct UdpTransport {
    send_timeout: Duration,
    max_message_size: usize,
    bound: Mutex<Option<SocketAddr>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl UdpTransport {
    pub fn new() -> Self {
        UdpTransport {
            send_timeout: DEFAULT_SEND_TIMEOUT,
            max_message_size: DEFAULT_MAX_DATAGRAM_SIZE,
            bound: Mutex::new(None),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Sets the send timeout.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Sets the maximum accepted datagram size.
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// The address the socket actually bound, once `listen` has bound it.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock()
    }
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, ctx: &Context, addr: &str, frame: Vec<u8>) -> Result<Vec<u8>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::server_closed());
        }
        if frame.len() > self.max_message_size {
            return Err(Error::new(
                Code::InvalidArgument,
                format!(
                    "message of {} bytes exceeds maximum datagram size {}",
                    frame.len(),
                    self.max_message_size
                ),
            ));
        }
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| Error::wrap(Code::Unknown, e, "failed to bind datagram socket"))?;
        tokio::time::timeout(self.send_timeout, socket.send_to(&frame, addr))
            .await
            .map_err(|_| Error::new(Code::Timeout, "datagram send timed out"))?
            .map_err(|e| Error::wrap(Code::Unknown, e, format!("failed to send datagram to {addr}")))?;

        // The datagram is out, but a connectionless socket cannot correlate
        // a response with this request.
        Err(Error::new(
            Code::Unknown,
            "datagram send completed, no reply semantics",
        ))
    }

    async fn listen(&self, addr: &str, handler: FrameHandler) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::server_closed());
        }
        let socket = Arc::new(
            UdpSocket::bind(addr)
                .await
                .map_err(|e| Error::wrap(Code::Unknown, e, format!("failed to listen on {addr}")))?,
        );
        let local = socket.local_addr().ok();
        *self.bound.lock() = local;
        tracing::info!(addr = ?local, "udp transport listening");

        let mut buf = vec![0u8; self.max_message_size];
        loop {
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => return Err(Error::server_closed()),
                r = socket.recv_from(&mut buf) => r,
            };
            let (len, peer) = match received {
                Ok(pair) => pair,
                Err(e) => {
                    if self.closed.load(Ordering::Acquire) {
                        return Err(Error::server_closed());
                    }
                    tracing::warn!(error = %e, "failed to receive datagram");
                    continue;
                }
            };

            let frame = buf[..len].to_vec();
            let socket = socket.clone();
            let handler = handler.clone();
            let max = self.max_message_size;
            tokio::spawn(async move {
                match handler(Context::background(), frame).await {
                    Ok(response) => {
                        if response.len() > max {
                            tracing::warn!(%peer, len = response.len(), "response exceeds maximum datagram size, dropped");
                            return;
                        }
                        if let Err(e) = socket.send_to(&response, peer).await {
                            tracing::debug!(%peer, error = %e, "failed to send response datagram");
                        }
                    }
                    Err(e) => {
                        tracing::debug!(%peer, error = %e, "datagram handler failed");
                    }
                }
            });
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.cancel();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "udp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_is_fire_and_forget() {
        let server = Arc::new(UdpTransport::new());
        let listener = server.clone();
        let handler: FrameHandler = Arc::new(|_ctx, frame| Box::pin(async move { Ok(frame) }));
        tokio::spawn(async move {
            let _ = listener.listen("127.0.0.1:0", handler).await;
        });
        let addr = loop {
            if let Some(addr) = server.local_addr() {
                break addr.to_string();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        let client = UdpTransport::new();
        let err = client
            .send(&Context::background(), &addr, b"ping".to_vec())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no reply semantics"));
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_listen_path_responds_to_source() {
        let server = Arc::new(UdpTransport::new());
        let listener = server.clone();
        let handler: FrameHandler = Arc::new(|_ctx, frame| {
            Box::pin(async move {
                let mut out = b"re:".to_vec();
                out.extend_from_slice(&frame);
                Ok(out)
            })
        });
        tokio::spawn(async move {
            let _ = listener.listen("127.0.0.1:0", handler).await;
        });
        let addr = loop {
            if let Some(addr) = server.local_addr() {
                break addr;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        // Raw socket client, since Transport::send has no reply semantics.
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.send_to(b"ping", addr).await.unwrap();
        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("listen path should answer")
            .unwrap();
        assert_eq!(&buf[..len], b"re:ping");
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_datagram_rejected() {
        let client = UdpTransport::new().with_max_message_size(32);
        let err = client
            .send(&Context::background(), "127.0.0.1:1", vec![0u8; 64])
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }
}
