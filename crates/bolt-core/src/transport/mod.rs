//! The transport port and its built-in implementations.
//!
//! A transport moves opaque frames; it knows nothing about envelopes or
//! payload codecs. The port exposes exactly two operations and a close:
//!
//! - [`Transport::send`] transmits one request frame and blocks until the
//!   paired response arrives or the context fires.
//! - [`Transport::listen`] binds and invokes the frame handler for every
//!   complete inbound frame until the transport is closed; the handler's
//!   return value is transmitted as the response.
//! - [`Transport::close`] is idempotent; further sends and listens fail with
//!   the server-closed sentinel.
//!
//! Three implementations ship: [`TcpTransport`] (length-prefixed stream
//! framing with a per-target connection cache), [`HttpTransport`] (one POST
//! per frame), and [`UdpTransport`] (listen-capable, fire-and-forget on the
//! send side).

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::context::Context;
use crate::error::Result;

mod http;
mod tcp;
mod udp;

pub use http::HttpTransport;
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

/// Callback invoked by [`Transport::listen`] for each inbound frame.
///
/// The returned bytes are transmitted back as the response frame. Transports
/// may invoke the handler concurrently; handlers must be safe for that.
pub type FrameHandler =
    Arc<dyn Fn(Context, Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>>> + Send + Sync>;

/// A duplex or request/response byte channel.
///
/// Implemented for `Arc<T>` by delegation, so a transport can be shared
/// between a server and the code that inspects it (e.g. for its bound
/// address).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transmits one request frame to `addr` and waits for the paired
    /// response, honouring the context's deadline and cancellation.
    async fn send(&self, ctx: &Context, addr: &str, frame: Vec<u8>) -> Result<Vec<u8>>;

    /// Binds to `addr` and serves inbound frames through `handler` until the
    /// transport is closed, which surfaces as the server-closed error.
    async fn listen(&self, addr: &str, handler: FrameHandler) -> Result<()>;

    /// Shuts the transport down. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Short transport name for logs.
    fn name(&self) -> &'static str;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, ctx: &Context, addr: &str, frame: Vec<u8>) -> Result<Vec<u8>> {
        (**self).send(ctx, addr, frame).await
    }

    async fn listen(&self, addr: &str, handler: FrameHandler) -> Result<()> {
        (**self).listen(addr, handler).await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}
