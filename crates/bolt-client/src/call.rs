//! The in-flight call handle.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

use bolt_core::codec::PayloadCodec;
use bolt_core::error::{Code, Error, Result};
use bolt_core::protocol::Response;

/// An outstanding RPC issued with [`Client::go`](crate::Client::go).
///
/// The call completes exactly once — with the response, a transport or
/// handler error, a context error, or the client-closed sentinel — and
/// [`Call::join`] consumes that single completion. Dropping the handle
/// abandons the call; the request itself is not retracted.
pub struct Call<R> {
    /// The `"Service.Method"` this call was issued against.
    pub service_method: String,
    /// The sequence number assigned to the call, 0 when the call was
    /// rejected before a sequence could be allocated.
    pub seq: u64,
    pub(crate) done: oneshot::Receiver<Result<Response>>,
    pub(crate) payload: PayloadCodec,
    pub(crate) _reply: PhantomData<fn() -> R>,
}

impl<R: DeserializeOwned> Call<R> {
    /// Waits for completion and decodes the reply.
    pub async fn join(self) -> Result<R> {
        let response = self
            .done
            .await
            .map_err(|_| Error::new(Code::Unknown, "call completed nowhere: completion dropped"))??;
        self.payload.decode(&response.payload)
    }
}
