//! Per-call timeout middleware.

use std::sync::Arc;
use std::time::Duration;

use bolt_core::error::{Code, Error};
use bolt_core::middleware::{Handler, Middleware};

/// Caps every call at a fixed duration.
///
/// The inner handler runs under a child context whose deadline is at most
/// `timeout` from entry; an already-tighter caller deadline is kept. Expiry
/// surfaces as `deadline_exceeded`.
#[derive(Debug, Clone, Copy)]
pub struct Timeout {
    timeout: Duration,
}

impl Timeout {
    pub fn new(timeout: Duration) -> Self {
        Timeout { timeout }
    }
}

impl Middleware for Timeout {
    fn wrap(&self, next: Handler) -> Handler {
        let timeout = self.timeout;
        Arc::new(move |ctx, req| {
            let next = next.clone();
            Box::pin(async move {
                let inner_ctx = ctx.with_timeout(timeout);
                tokio::select! {
                    _ = inner_ctx.done() => Err(inner_ctx.err().unwrap_or_else(|| {
                        Error::new(Code::DeadlineExceeded, format!("call exceeded {timeout:?}"))
                    })),
                    result = next(inner_ctx.clone(), req) => result,
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bolt_core::context::Context;
    use bolt_core::protocol::{Request, Response};

    fn sleeping_terminal(sleep: Duration) -> Handler {
        Arc::new(move |_ctx, req| {
            Box::pin(async move {
                tokio::time::sleep(sleep).await;
                Ok(Response::failure(req.seq, req.service_method, ""))
            })
        })
    }

    #[tokio::test]
    async fn test_fast_call_passes() {
        let chain = Timeout::new(Duration::from_secs(5)).wrap(sleeping_terminal(Duration::ZERO));
        assert!(chain(Context::background(), Request::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_slow_call_times_out() {
        let chain = Timeout::new(Duration::from_millis(20))
            .wrap(sleeping_terminal(Duration::from_secs(5)));
        let err = chain(Context::background(), Request::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_caller_cancellation_propagates_inward() {
        let ctx = Context::background();
        let chain = Timeout::new(Duration::from_secs(60))
            .wrap(sleeping_terminal(Duration::from_secs(60)));
        let call = chain(ctx.clone(), Request::default());
        ctx.cancel();
        let err = tokio::time::timeout(Duration::from_millis(200), call)
            .await
            .expect("cancellation must cut the call short")
            .unwrap_err();
        assert_eq!(err.code(), Code::Cancelled);
    }
}
