//! RPC server: service registry, request dispatch, middleware.
//!
//! Define a [`Service`] with typed method handlers, [`Server::register`] it,
//! and [`Server::serve`] on a transport. See the crate-level tests for the
//! full client/server wiring.

mod server;
mod service;

pub use server::Server;
pub use service::Service;
