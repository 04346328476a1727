//! Retry middleware.

use std::sync::Arc;
use std::time::Duration;

use bolt_core::error::{Code, Error};
use bolt_core::middleware::{Handler, Middleware};

/// Retries failed calls whose code is in the retryable set.
///
/// Each attempt is a fresh call of the inner handler with a clone of the
/// request. The inter-attempt sleep races against the call context, so a
/// cancelled or expired caller stops the retry loop immediately. A small
/// random jitter is added to the interval to avoid synchronized retry
/// storms.
#[derive(Debug, Clone)]
pub struct Retry {
    max_retries: usize,
    interval: Duration,
    retryable: Vec<Code>,
}

impl Retry {
    pub fn new() -> Self {
        Retry {
            max_retries: 3,
            interval: Duration::from_secs(1),
            retryable: vec![Code::Timeout, Code::DeadlineExceeded],
        }
    }

    /// Sets the number of retries after the initial attempt.
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the base inter-attempt interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Replaces the set of codes considered retryable.
    pub fn with_retryable(mut self, codes: impl Into<Vec<Code>>) -> Self {
        self.retryable = codes.into();
        self
    }

    fn backoff(&self) -> Duration {
        // Up to 10% jitter on top of the base interval.
        let jitter = self.interval.mul_f64(0.1 * rand::random::<f64>());
        self.interval + jitter
    }
}

impl Default for Retry {
    fn default() -> Self {
        Self::new()
    }
}

impl Middleware for Retry {
    fn wrap(&self, next: Handler) -> Handler {
        let policy = self.clone();
        Arc::new(move |ctx, req| {
            let next = next.clone();
            let policy = policy.clone();
            Box::pin(async move {
                let mut attempt = 0;
                loop {
                    if attempt > 0 {
                        tracing::debug!(
                            service_method = %req.service_method,
                            attempt,
                            "retrying call"
                        );
                        tokio::select! {
                            _ = ctx.done() => {
                                return Err(ctx.err().unwrap_or_else(Error::cancelled));
                            }
                            _ = tokio::time::sleep(policy.backoff()) => {}
                        }
                    }

                    match next(ctx.clone(), req.clone()).await {
                        Ok(response) => return Ok(response),
                        Err(e) => {
                            let retryable = policy.retryable.iter().any(|code| e.is_code(*code));
                            if !retryable || attempt == policy.max_retries {
                                return Err(e);
                            }
                            attempt += 1;
                        }
                    }
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
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A terminal that fails `failures` times before succeeding.
    fn flaky_terminal(failures: usize, code: Code) -> (Handler, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_inner = calls.clone();
        let handler: Handler = Arc::new(move |_ctx, req| {
            let calls = calls_inner.clone();
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    Err(Error::new(code, "transient"))
                } else {
                    Ok(Response::failure(req.seq, req.service_method, ""))
                }
            })
        });
        (handler, calls)
    }

    fn quick_retry() -> Retry {
        Retry::new().with_interval(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_retries_retryable_code_until_success() {
        let (terminal, calls) = flaky_terminal(2, Code::Timeout);
        let chain = quick_retry().wrap(terminal);
        chain(Context::background(), Request::default())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3, "two failures plus success");
    }

    #[tokio::test]
    async fn test_non_retryable_code_fails_immediately() {
        let (terminal, calls) = flaky_terminal(5, Code::InvalidArgument);
        let chain = quick_retry().wrap(terminal);
        let err = chain(Context::background(), Request::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let (terminal, calls) = flaky_terminal(usize::MAX, Code::Timeout);
        let chain = quick_retry().with_max_retries(2).wrap(terminal);
        let err = chain(Context::background(), Request::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Timeout);
        assert_eq!(calls.load(Ordering::SeqCst), 3, "initial attempt plus two retries");
    }

    #[tokio::test]
    async fn test_wrapped_retryable_code_is_recognized() {
        // The retry check walks the cause chain, so a wrapped timeout is
        // still retryable.
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_inner = calls.clone();
        let terminal: Handler = Arc::new(move |_ctx, req| {
            let calls = calls_inner.clone();
            Box::pin(async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::wrap(
                        Code::Unknown,
                        Error::new(Code::Timeout, "timeout"),
                        "attempt failed",
                    ))
                } else {
                    Ok(Response::failure(req.seq, req.service_method, ""))
                }
            })
        });
        let chain = quick_retry().wrap(terminal);
        chain(Context::background(), Request::default())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancellation_stops_inter_attempt_sleep() {
        let (terminal, _calls) = flaky_terminal(usize::MAX, Code::Timeout);
        let chain = Retry::new()
            .with_interval(Duration::from_secs(60))
            .wrap(terminal);
        let ctx = Context::background();
        let call = chain(ctx.clone(), Request::default());
        let cancel_ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_ctx.cancel();
        });
        let err = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .expect("cancellation must interrupt the retry sleep")
            .unwrap_err();
        assert_eq!(err.code(), Code::Cancelled);
    }
}
