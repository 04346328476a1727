//! Call logging via `tracing`.

use std::sync::Arc;

use tokio::time::Instant;

use bolt_core::middleware::{Handler, Middleware};

/// Logs every call with its outcome and elapsed time.
#[derive(Debug, Clone, Copy, Default)]
pub struct Logging;

impl Logging {
    pub fn new() -> Self {
        Logging
    }
}

impl Middleware for Logging {
    fn wrap(&self, next: Handler) -> Handler {
        Arc::new(move |ctx, req| {
            let next = next.clone();
            Box::pin(async move {
                let service_method = req.service_method.clone();
                let seq = req.seq;
                let started = Instant::now();
                tracing::debug!(service_method = %service_method, seq, "call started");

                let result = next(ctx, req).await;
                let elapsed = started.elapsed();
                match &result {
                    Ok(_) => {
                        tracing::info!(service_method = %service_method, seq, ?elapsed, "call completed")
                    }
                    Err(e) => {
                        tracing::warn!(service_method = %service_method, seq, ?elapsed, error = %e, "call failed")
                    }
                }
                result
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bolt_core::context::Context;
    use bolt_core::protocol::{Request, Response};

    #[tokio::test]
    async fn test_logging_passes_result_through() {
        let terminal: Handler = Arc::new(|_ctx, req| {
            Box::pin(async move {
                let mut resp = Response::failure(req.seq, req.service_method, "");
                resp.payload = vec![7];
                Ok(resp)
            })
        });
        let chain = Logging::new().wrap(terminal);
        let resp = chain(Context::background(), Request::default())
            .await
            .unwrap();
        assert_eq!(resp.payload, vec![7]);
    }
}
