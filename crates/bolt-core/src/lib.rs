//! Core protocol, codecs, transports, and ports for the bolt RPC framework.
//!
//! This crate holds everything the client and server crates share:
//!
//! - [`protocol`] — request/response envelopes, the binary and text wire
//!   layouts, and the [`protocol::WireCodec`] that enforces message bounds.
//! - [`codec`] — payload codecs turning application values into envelope
//!   payload bytes.
//! - [`transport`] — the byte-channel port plus TCP, HTTP, and UDP
//!   implementations.
//! - [`error`] — the structured code/message/cause error model.
//! - [`context`] — per-call deadline, cancellation, and metadata.
//! - [`middleware`] — the around-handler contract shared by client and
//!   server.
//! - [`discovery`] / [`balancer`] — optional collaborator ports.

pub mod balancer;
pub mod codec;
pub mod context;
pub mod discovery;
pub mod error;
pub mod middleware;
pub mod protocol;
pub mod transport;

pub use codec::PayloadCodec;
pub use context::Context;
pub use error::{Code, Error, Result};
pub use middleware::{Handler, Middleware};
pub use protocol::{parse_service_method, Request, Response, WireCodec, WireFormat};
pub use transport::{FrameHandler, HttpTransport, TcpTransport, Transport, UdpTransport};
