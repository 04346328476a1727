//! The dispatch engine.
//!
//! The server owns the service registry and hands one frame-handling
//! function to the transport's listen loop. Per frame: decode the request
//! envelope, route by the `"Service.Method"` key, materialize the argument,
//! run the middleware chain around the typed handler, and encode the
//! response envelope. A failing handler never becomes a transport failure —
//! the error is serialized into the response's error field — and a
//! panicking handler is converted to an unknown-coded error without
//! touching the listen loop.
//!
//! The registry is a copy-on-register map: registration clones the current
//! map, inserts, and swaps the shared snapshot, so concurrent frame
//! handlers read without blocking writers.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};

use bolt_core::codec::PayloadCodec;
use bolt_core::error::{Code, Error, Result};
use bolt_core::middleware::{self, Handler, Middleware};
use bolt_core::protocol::{
    parse_service_method, Request, Response, WireCodec, WireFormat, DEFAULT_MAX_MESSAGE_SIZE,
};
use bolt_core::transport::{FrameHandler, Transport};

use crate::service::Service;

type Registry = Arc<RwLock<Arc<HashMap<String, Arc<Service>>>>>;

/// An RPC server: registry, middleware chain, and one transport.
pub struct Server {
    transport: Arc<dyn Transport>,
    payload: PayloadCodec,
    wire_format: WireFormat,
    max_message_size: usize,
    services: Registry,
    middlewares: Arc<Mutex<Vec<Arc<dyn Middleware>>>>,
    closed: Arc<AtomicBool>,
}

impl Server {
    /// Creates a server speaking the binary wire layout with JSON payloads.
    pub fn new(transport: impl Transport + 'static) -> Self {
        Server {
            transport: Arc::new(transport),
            payload: PayloadCodec::default(),
            wire_format: WireFormat::default(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            services: Arc::new(RwLock::new(Arc::new(HashMap::new()))),
            middlewares: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sets the payload codec (must match the clients').
    pub fn with_payload_codec(mut self, payload: PayloadCodec) -> Self {
        self.payload = payload;
        self
    }

    /// Sets the envelope layout (must match the clients').
    pub fn with_wire_format(mut self, format: WireFormat) -> Self {
        self.wire_format = format;
        self
    }

    /// Sets the maximum accepted envelope size.
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// Appends a middleware; the first one registered runs outermost.
    pub fn use_middleware(&self, middleware: impl Middleware + 'static) {
        self.middlewares.lock().push(Arc::new(middleware));
    }

    /// Registers a service.
    ///
    /// The service name must be non-empty and not yet taken, and the service
    /// must expose at least one method.
    pub fn register(&self, service: Service) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::server_closed());
        }
        if service.name().is_empty() {
            return Err(Error::new(Code::InvalidArgument, "service name cannot be empty"));
        }
        if service.is_empty() {
            return Err(Error::new(
                Code::InvalidArgument,
                format!("service {} has no methods", service.name()),
            ));
        }

        let mut registry = self.services.write();
        if registry.contains_key(service.name()) {
            return Err(Error::new(
                Code::AlreadyExists,
                format!("service {} already registered", service.name()),
            ));
        }
        tracing::info!(
            service = %service.name(),
            methods = service.method_names().count(),
            "service registered"
        );
        let mut next = HashMap::clone(&registry);
        next.insert(service.name().to_string(), Arc::new(service));
        *registry = Arc::new(next);
        Ok(())
    }

    /// Serves requests on `addr` until the server is stopped.
    pub async fn serve(&self, addr: &str) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::server_closed());
        }
        let handler = self.frame_handler();
        self.transport.listen(addr, handler).await
    }

    /// Stops the server and closes the transport. A second stop returns the
    /// server-closed sentinel.
    pub async fn stop(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::server_closed());
        }
        self.transport.close().await
    }

    fn wire(&self) -> WireCodec {
        WireCodec::new(self.wire_format, self.payload).with_max_message_size(self.max_message_size)
    }

    /// Builds the frame-handling function handed to the transport.
    fn frame_handler(&self) -> FrameHandler {
        let wire = self.wire();
        let middlewares = self.middlewares.clone();
        let terminal = self.terminal_handler();

        Arc::new(move |ctx, frame| {
            let middlewares = middlewares.lock().clone();
            let terminal = terminal.clone();
            Box::pin(async move {
                let request = match wire.decode_request(&frame) {
                    Ok(request) => request,
                    Err(e) => {
                        let seq = wire.recover_seq(&frame);
                        tracing::warn!(seq, error = %e, "failed to decode request envelope");
                        return wire.encode_response(&Response::failure(seq, "", e.to_string()));
                    }
                };

                let service_method = request.service_method.clone();
                let seq = request.seq;
                let ctx = ctx
                    .with_service_method(&service_method)
                    .with_metadata(request.metadata.clone());

                let chain = middleware::compose(&middlewares, terminal);
                let response = match AssertUnwindSafe(chain(ctx, request)).catch_unwind().await {
                    Ok(Ok(response)) => response,
                    Ok(Err(e)) => Response::failure(seq, service_method, e.to_string()),
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        tracing::error!(
                            service_method = %service_method,
                            seq,
                            panic = %message,
                            "handler panicked"
                        );
                        let err = Error::new(Code::Unknown, format!("handler panicked: {message}"));
                        Response::failure(seq, service_method, err.to_string())
                    }
                };
                wire.encode_response(&response)
            })
        })
    }

    /// The innermost handler: route, materialize the argument, invoke.
    fn terminal_handler(&self) -> Handler {
        let services = self.services.clone();
        let payload = self.payload;
        Arc::new(move |ctx, request: Request| {
            let services = services.clone();
            Box::pin(async move {
                let Request {
                    service_method,
                    seq,
                    payload: body,
                    ..
                } = request;
                let (service_name, method_name) =
                    parse_service_method(&service_method).ok_or_else(|| {
                        Error::new(
                            Code::NotFound,
                            format!("ill-formed service method {service_method:?}"),
                        )
                    })?;

                let registry = services.read().clone();
                let service = registry
                    .get(service_name)
                    .ok_or_else(Error::service_not_found)?;
                let method = service
                    .handler(method_name)
                    .ok_or_else(Error::method_not_found)?;

                let reply = method(ctx, body, payload).await?;
                Ok(Response {
                    service_method,
                    seq,
                    metadata: HashMap::new(),
                    error: String::new(),
                    payload: reply,
                })
            })
        })
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bolt_core::context::Context;
    use serde::{Deserialize, Serialize};

    /// Transport stub for tests that exercise the frame handler directly.
    struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        async fn send(&self, _ctx: &Context, _addr: &str, _frame: Vec<u8>) -> Result<Vec<u8>> {
            Err(Error::new(Code::Unknown, "null transport"))
        }
        async fn listen(&self, _addr: &str, _handler: FrameHandler) -> Result<()> {
            Err(Error::new(Code::Unknown, "null transport"))
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
        fn name(&self) -> &'static str {
            "null"
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct HelloRequest {
        name: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct HelloResponse {
        message: String,
    }

    fn greeter() -> Service {
        Service::new("Greeter").method("SayHello", |_ctx, req: HelloRequest| async move {
            Ok(HelloResponse {
                message: format!("hi {}", req.name),
            })
        })
    }

    fn server_with_greeter() -> Server {
        let server = Server::new(NullTransport);
        server.register(greeter()).unwrap();
        server
    }

    async fn dispatch(server: &Server, request: &Request) -> Response {
        let wire = server.wire();
        let handler = server.frame_handler();
        let frame = wire.encode_request(request).unwrap();
        let response_frame = handler(Context::background(), frame).await.unwrap();
        wire.decode_response(&response_frame).unwrap()
    }

    fn hello_request(seq: u64, service_method: &str) -> Request {
        Request {
            service_method: service_method.to_string(),
            seq,
            metadata: HashMap::new(),
            payload: PayloadCodec::Json
                .encode(&HelloRequest {
                    name: "Thor".to_string(),
                })
                .unwrap(),
        }
    }

    #[tokio::test]
    async fn test_happy_path_dispatch() {
        let server = server_with_greeter();
        let response = dispatch(&server, &hello_request(7, "Greeter.SayHello")).await;
        assert_eq!(response.seq, 7);
        assert_eq!(response.service_method, "Greeter.SayHello");
        assert!(response.error.is_empty());
        let reply: HelloResponse = PayloadCodec::Json.decode(&response.payload).unwrap();
        assert_eq!(reply.message, "hi Thor");
    }

    #[tokio::test]
    async fn test_unknown_service_is_not_found() {
        let server = server_with_greeter();
        let response = dispatch(&server, &hello_request(1, "Nope.Do")).await;
        assert!(response.error.contains("not_found"), "{}", response.error);
        assert!(response.payload.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_method_is_not_found() {
        let server = server_with_greeter();
        let response = dispatch(&server, &hello_request(1, "Greeter.Shout")).await;
        assert!(response.error.contains("not_found"));
    }

    #[tokio::test]
    async fn test_ill_formed_route_is_not_found() {
        let server = server_with_greeter();
        for bad in ["Greeter.", ".SayHello", "NoSeparator"] {
            let mut request = hello_request(1, "Greeter.SayHello");
            request.service_method = bad.to_string();
            let response = dispatch(&server, &request).await;
            assert!(response.error.contains("not_found"), "{bad}: {}", response.error);
        }
    }

    #[tokio::test]
    async fn test_undecodable_argument_is_invalid_argument() {
        let server = server_with_greeter();
        let mut request = hello_request(3, "Greeter.SayHello");
        request.payload = b"not json at all".to_vec();
        let response = dispatch(&server, &request).await;
        assert!(response.error.contains("invalid_argument"));
        assert_eq!(response.seq, 3);
    }

    #[tokio::test]
    async fn test_handler_error_is_serialized_not_escalated() {
        let server = Server::new(NullTransport);
        server
            .register(
                Service::new("Greeter").method("SayHello", |_ctx, _req: HelloRequest| async {
                    Err::<HelloResponse, _>(Error::new(Code::InvalidArgument, "bad input"))
                }),
            )
            .unwrap();
        let response = dispatch(&server, &hello_request(5, "Greeter.SayHello")).await;
        assert!(response.error.contains("bad input"));
        assert_eq!(response.seq, 5);
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_unknown_error() {
        let server = Server::new(NullTransport);
        server
            .register(
                Service::new("Greeter").method("SayHello", |_ctx, req: HelloRequest| async move {
                    if req.name != "nobody" {
                        panic!("boom");
                    }
                    Ok(HelloResponse {
                        message: String::new(),
                    })
                }),
            )
            .unwrap();
        let response = dispatch(&server, &hello_request(9, "Greeter.SayHello")).await;
        assert!(response.error.contains("panicked"));
        assert!(response.error.contains("boom"));
        // The engine survives: the next dispatch still works.
        let response = dispatch(&server, &hello_request(10, "Greeter.SayHello")).await;
        assert!(response.error.contains("panicked"));
    }

    #[tokio::test]
    async fn test_undecodable_envelope_gets_best_effort_response() {
        let server = server_with_greeter();
        let handler = server.frame_handler();
        let response_frame = handler(Context::background(), b"junk frame".to_vec())
            .await
            .unwrap();
        let response = server.wire().decode_response(&response_frame).unwrap();
        assert_eq!(response.seq, 0);
        assert!(!response.error.is_empty());
    }

    #[tokio::test]
    async fn test_seq_recovered_from_broken_tail() {
        // A frame with an intact header but a garbage tail still gets its
        // sequence echoed in the error response.
        let server = server_with_greeter();
        let wire = server.wire();
        let mut frame = wire.encode_request(&hello_request(77, "Greeter.SayHello")).unwrap();
        frame.truncate(frame.len() - 3);
        let handler = server.frame_handler();
        let response_frame = handler(Context::background(), frame).await.unwrap();
        let response = wire.decode_response(&response_frame).unwrap();
        assert_eq!(response.seq, 77);
        assert!(!response.error.is_empty());
    }

    #[tokio::test]
    async fn test_context_enriched_before_middleware() {
        let server = server_with_greeter();
        let seen: Arc<Mutex<Vec<(String, Option<String>)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_mw = seen.clone();
        server.use_middleware(move |next: Handler| -> Handler {
            let seen = seen_mw.clone();
            Arc::new(move |ctx: Context, req| {
                seen.lock().push((
                    ctx.service_method().to_string(),
                    ctx.metadata().get("tenant").cloned(),
                ));
                next(ctx, req)
            })
        });

        let mut request = hello_request(2, "Greeter.SayHello");
        request
            .metadata
            .insert("tenant".to_string(), "acme".to_string());
        dispatch(&server, &request).await;

        let observed = seen.lock();
        assert_eq!(
            *observed,
            vec![(
                "Greeter.SayHello".to_string(),
                Some("acme".to_string())
            )]
        );
    }

    #[test]
    fn test_registration_rules() {
        let server = Server::new(NullTransport);

        let err = server.register(Service::new("")).unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let err = server.register(Service::new("Empty")).unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        server.register(greeter()).unwrap();
        let err = server.register(greeter()).unwrap_err();
        assert_eq!(err.code(), Code::AlreadyExists);
    }

    #[tokio::test]
    async fn test_stop_twice_returns_server_closed() {
        let server = server_with_greeter();
        server.stop().await.unwrap();
        assert!(server.stop().await.unwrap_err().is(&Error::server_closed()));
        assert!(server
            .register(greeter())
            .unwrap_err()
            .is(&Error::server_closed()));
    }
}
