//! The around-handler middleware contract.
//!
//! A middleware wraps an inner [`Handler`] and returns a handler of the same
//! shape, which makes the contract identical on the client and server sides:
//! a retry, timeout, logging, or auth middleware works on either unchanged.
//!
//! [`compose`] applies middlewares in reverse-registration order, so the
//! first-registered middleware is the outermost wrapper: with `[m1, m2, m3]`
//! the entry order around the terminal handler is m1 → m2 → m3 → handler and
//! the exit order reverses.
//!
//! Middlewares must call the inner handler at most once per logical attempt,
//! preserve the error-model code chain when re-wrapping errors, and
//! propagate cancellation from the context they receive into the context
//! they pass inward.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::context::Context;
use crate::error::Result;
use crate::protocol::{Request, Response};

/// A request handler: the unit middlewares wrap.
pub type Handler =
    Arc<dyn Fn(Context, Request) -> BoxFuture<'static, Result<Response>> + Send + Sync>;

/// An around-handler interceptor.
///
/// Implemented either as a type, or as a plain closure of shape
/// `Fn(Handler) -> Handler` through the blanket impl:
///
/// ```
/// use std::sync::Arc;
/// use bolt_core::middleware::{compose, Handler, Middleware};
/// use bolt_core::protocol::Response;
///
/// let passthrough: Arc<dyn Middleware> = Arc::new(|next: Handler| -> Handler {
///     Arc::new(move |ctx, req| next(ctx, req))
/// });
/// let middlewares = vec![passthrough];
///
/// let terminal: Handler = Arc::new(|_ctx, req| {
///     Box::pin(async move { Ok(Response::failure(req.seq, req.service_method, "")) })
/// });
/// let _chain = compose(&middlewares, terminal);
/// ```
pub trait Middleware: Send + Sync {
    /// Wraps `next`, returning the interposed handler.
    fn wrap(&self, next: Handler) -> Handler;
}

impl<F> Middleware for F
where
    F: Fn(Handler) -> Handler + Send + Sync,
{
    fn wrap(&self, next: Handler) -> Handler {
        self(next)
    }
}

/// Composes a middleware chain around a terminal handler.
///
/// Applied in reverse order so that the first-registered middleware ends up
/// outermost.
pub fn compose(middlewares: &[Arc<dyn Middleware>], terminal: Handler) -> Handler {
    let mut handler = terminal;
    for middleware in middlewares.iter().rev() {
        handler = middleware.wrap(handler);
    }
    handler
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn tracing_middleware(name: &'static str, trace: Arc<Mutex<Vec<String>>>) -> Arc<dyn Middleware> {
        Arc::new(move |next: Handler| -> Handler {
            let trace = trace.clone();
            Arc::new(move |ctx, req| {
                let next = next.clone();
                let trace = trace.clone();
                Box::pin(async move {
                    trace.lock().push(format!("{name}-enter"));
                    let result = next(ctx, req).await;
                    trace.lock().push(format!("{name}-exit"));
                    result
                })
            })
        })
    }

    #[tokio::test]
    async fn test_first_registered_is_outermost() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let middlewares: Vec<Arc<dyn Middleware>> = vec![
            tracing_middleware("m1", trace.clone()),
            tracing_middleware("m2", trace.clone()),
            tracing_middleware("m3", trace.clone()),
        ];

        let terminal_trace = trace.clone();
        let terminal: Handler = Arc::new(move |_ctx, req| {
            let trace = terminal_trace.clone();
            Box::pin(async move {
                trace.lock().push("handler".to_string());
                Ok(Response::failure(req.seq, req.service_method, ""))
            })
        });

        let chain = compose(&middlewares, terminal);
        chain(Context::background(), Request::default())
            .await
            .unwrap();

        assert_eq!(
            *trace.lock(),
            vec![
                "m1-enter", "m2-enter", "m3-enter", "handler", "m3-exit", "m2-exit", "m1-exit",
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_chain_is_terminal() {
        let terminal: Handler = Arc::new(|_ctx, req| {
            Box::pin(async move {
                let mut resp = Response::failure(req.seq, req.service_method, "");
                resp.payload = vec![1, 2, 3];
                Ok(resp)
            })
        });
        let chain = compose(&[], terminal);
        let resp = chain(Context::background(), Request::default())
            .await
            .unwrap();
        assert_eq!(resp.payload, vec![1, 2, 3]);
    }
}
