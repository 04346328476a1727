//! The call multiplexor.
//!
//! A [`Client`] is told one target address and owns a monotonically
//! increasing sequence counter, a pending-call table, and a middleware
//! chain. Each call runs on its own task: the terminal handler encodes the
//! argument, wraps it in a request envelope, pushes the frame through the
//! transport, and decodes the paired response; middlewares wrap around that
//! exactly as they do around server handlers.
//!
//! The pending table is the single authority for completion. Whichever task
//! observes the terminal event — response, context firing, or close —
//! removes the entry and fires its one-shot sender; everyone else finds the
//! entry gone and drops their result.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;

use bolt_core::codec::PayloadCodec;
use bolt_core::context::Context;
use bolt_core::error::{Code, Error, Result};
use bolt_core::middleware::{self, Handler, Middleware};
use bolt_core::protocol::{Request, Response, WireCodec, WireFormat, DEFAULT_MAX_MESSAGE_SIZE};
use bolt_core::transport::Transport;

use crate::call::Call;

/// Default timeout injected into calls whose context carries no deadline.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

struct PendingCall {
    service_method: String,
    done: oneshot::Sender<Result<Response>>,
}

type PendingTable = Mutex<HashMap<u64, PendingCall>>;

/// An RPC client bound to one target address.
pub struct Client {
    target: String,
    transport: Arc<dyn Transport>,
    payload: PayloadCodec,
    wire_format: WireFormat,
    max_message_size: usize,
    default_timeout: Duration,
    seq: AtomicU64,
    pending: Arc<PendingTable>,
    middlewares: Mutex<Vec<Arc<dyn Middleware>>>,
    closed: Arc<AtomicBool>,
}

impl Client {
    /// Creates a client speaking the binary wire layout with JSON payloads.
    pub fn new(target: impl Into<String>, transport: impl Transport + 'static) -> Self {
        Client {
            target: target.into(),
            transport: Arc::new(transport),
            payload: PayloadCodec::default(),
            wire_format: WireFormat::default(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            default_timeout: DEFAULT_CALL_TIMEOUT,
            // Sequence 0 is reserved for error responses whose request
            // sequence could not be recovered, so allocation starts at 1.
            seq: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            middlewares: Mutex::new(Vec::new()),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sets the payload codec (must match the server's).
    pub fn with_payload_codec(mut self, payload: PayloadCodec) -> Self {
        self.payload = payload;
        self
    }

    /// Sets the envelope layout (must match the server's).
    pub fn with_wire_format(mut self, format: WireFormat) -> Self {
        self.wire_format = format;
        self
    }

    /// Sets the maximum accepted envelope size.
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// Sets the timeout injected when a caller supplies no deadline.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Appends a middleware; the first one registered runs outermost.
    pub fn use_middleware(&self, middleware: impl Middleware + 'static) {
        self.middlewares.lock().push(Arc::new(middleware));
    }

    fn wire(&self) -> WireCodec {
        WireCodec::new(self.wire_format, self.payload).with_max_message_size(self.max_message_size)
    }

    /// Invokes `service_method` and waits for the reply.
    pub async fn call<A, R>(&self, ctx: &Context, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.go::<A, R>(ctx, service_method, args).join().await
    }

    /// Like [`Client::call`], with request metadata attached.
    pub async fn call_with_metadata<A, R>(
        &self,
        ctx: &Context,
        service_method: &str,
        args: &A,
        metadata: HashMap<String, String>,
    ) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.go_with_metadata::<A, R>(ctx, service_method, args, metadata)
            .join()
            .await
    }

    /// Starts a call asynchronously, returning its handle.
    pub fn go<A, R>(&self, ctx: &Context, service_method: &str, args: &A) -> Call<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.go_with_metadata(ctx, service_method, args, HashMap::new())
    }

    /// Like [`Client::go`], with request metadata attached.
    pub fn go_with_metadata<A, R>(
        &self,
        ctx: &Context,
        service_method: &str,
        args: &A,
        metadata: HashMap<String, String>,
    ) -> Call<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let (tx, rx) = oneshot::channel();

        if self.closed.load(Ordering::Acquire) {
            let _ = tx.send(Err(Error::client_closed()));
            return Call {
                service_method: service_method.to_string(),
                seq: 0,
                done: rx,
                payload: self.payload,
                _reply: PhantomData,
            };
        }

        let payload = match self.payload.encode(args) {
            Ok(payload) => payload,
            Err(e) => {
                let _ = tx.send(Err(e));
                return Call {
                    service_method: service_method.to_string(),
                    seq: 0,
                    done: rx,
                    payload: self.payload,
                    _reply: PhantomData,
                };
            }
        };

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().insert(
            seq,
            PendingCall {
                service_method: service_method.to_string(),
                done: tx,
            },
        );

        let request = Request {
            service_method: service_method.to_string(),
            seq,
            metadata,
            payload,
        };
        let chain = {
            let middlewares = self.middlewares.lock().clone();
            middleware::compose(&middlewares, self.terminal_handler())
        };

        let pending = self.pending.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = ctx.done() => Err(ctx.err().unwrap_or_else(Error::cancelled)),
                result = chain(ctx.clone(), request) => result,
            };
            complete(&pending, seq, result);
        });

        Call {
            service_method: service_method.to_string(),
            seq,
            done: rx,
            payload: self.payload,
            _reply: PhantomData,
        }
    }

    /// Marks the client closed, fails every pending call with the
    /// client-closed sentinel, and closes the transport. A second close
    /// returns the sentinel itself.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::client_closed());
        }
        let drained: Vec<(u64, PendingCall)> = self.pending.lock().drain().collect();
        for (seq, call) in drained {
            tracing::debug!(seq, service_method = %call.service_method, "failing pending call on close");
            let _ = call.done.send(Err(Error::client_closed()));
        }
        self.transport.close().await
    }

    /// The terminal handler: envelope encode, transport exchange, envelope
    /// decode, embedded-error promotion.
    fn terminal_handler(&self) -> Handler {
        let transport = self.transport.clone();
        let wire = self.wire();
        let target = self.target.clone();
        let default_timeout = self.default_timeout;
        Arc::new(move |ctx: Context, request: Request| {
            let transport = transport.clone();
            let target = target.clone();
            Box::pin(async move {
                let frame = wire.encode_request(&request)?;
                let ctx = if ctx.deadline().is_none() {
                    ctx.with_timeout(default_timeout)
                } else {
                    ctx
                };
                let response_frame = transport.send(&ctx, &target, frame).await?;
                let response = wire.decode_response(&response_frame)?;
                if response.seq != request.seq {
                    tracing::warn!(
                        expected = request.seq,
                        got = response.seq,
                        "dropping response with mismatched sequence"
                    );
                    return Err(Error::new(Code::Unknown, "response sequence mismatch"));
                }
                if !response.error.is_empty() {
                    return Err(Error::new(Code::Unknown, response.error));
                }
                Ok(response)
            })
        })
    }
}

/// Completes a pending call exactly once: whoever removes the table entry
/// owns the completion.
fn complete(pending: &PendingTable, seq: u64, result: Result<Response>) {
    let Some(call) = pending.lock().remove(&seq) else {
        tracing::debug!(seq, "late completion for unknown call dropped");
        return;
    };
    if call.done.send(result).is_err() {
        tracing::debug!(seq, service_method = %call.service_method, "caller abandoned call before completion");
    }
}
