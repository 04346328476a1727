//! Stock middleware for the bolt RPC framework.
//!
//! Every middleware here implements the around-handler contract from
//! `bolt_core::middleware` and therefore works unchanged on a client or a
//! server.

mod logging;
mod metrics;
mod retry;
mod timeout;

pub use logging::Logging;
pub use metrics::{Metrics, MetricsCollector};
pub use retry::Retry;
pub use timeout::Timeout;
