//! RPC client: sequence allocation, response correlation, middleware.
//!
//! See [`Client`] for the call API and [`Call`] for the async handle
//! returned by [`Client::go`].

mod call;
mod client;

pub use call::Call;
pub use client::{Client, DEFAULT_CALL_TIMEOUT};
