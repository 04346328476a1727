//! Per-method call metrics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use bolt_core::middleware::{Handler, Middleware};

#[derive(Debug, Default, Clone)]
struct MethodStats {
    requests: u64,
    errors: u64,
    total_elapsed: Duration,
}

/// Accumulates request, error, and latency figures keyed by service method.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    stats: Mutex<HashMap<String, MethodStats>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, service_method: &str, elapsed: Duration, failed: bool) {
        let mut stats = self.stats.lock();
        let entry = stats.entry(service_method.to_string()).or_default();
        entry.requests += 1;
        entry.total_elapsed += elapsed;
        if failed {
            entry.errors += 1;
        }
    }

    /// Calls observed for a service method.
    pub fn request_count(&self, service_method: &str) -> u64 {
        self.stats
            .lock()
            .get(service_method)
            .map(|s| s.requests)
            .unwrap_or(0)
    }

    /// Failed calls observed for a service method.
    pub fn error_count(&self, service_method: &str) -> u64 {
        self.stats
            .lock()
            .get(service_method)
            .map(|s| s.errors)
            .unwrap_or(0)
    }

    /// Mean latency of a service method, `None` before the first call.
    pub fn average_latency(&self, service_method: &str) -> Option<Duration> {
        let stats = self.stats.lock();
        let entry = stats.get(service_method)?;
        if entry.requests == 0 {
            return None;
        }
        Some(entry.total_elapsed / entry.requests as u32)
    }
}

/// Records per-call metrics into a shared [`MetricsCollector`].
#[derive(Clone)]
pub struct Metrics {
    collector: Arc<MetricsCollector>,
}

impl Metrics {
    /// Creates the middleware and hands back the collector it feeds.
    pub fn new() -> (Self, Arc<MetricsCollector>) {
        let collector = Arc::new(MetricsCollector::new());
        (
            Metrics {
                collector: collector.clone(),
            },
            collector,
        )
    }

    /// Creates the middleware over an existing collector.
    pub fn with_collector(collector: Arc<MetricsCollector>) -> Self {
        Metrics { collector }
    }
}

impl Middleware for Metrics {
    fn wrap(&self, next: Handler) -> Handler {
        let collector = self.collector.clone();
        Arc::new(move |ctx, req| {
            let next = next.clone();
            let collector = collector.clone();
            Box::pin(async move {
                let service_method = req.service_method.clone();
                let started = Instant::now();
                let result = next(ctx, req).await;
                collector.record(&service_method, started.elapsed(), result.is_err());
                result
            })
        })
    }
}
