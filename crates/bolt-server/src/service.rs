//! Service definitions: named method sets with typed handlers.
//!
//! A [`Service`] maps method names to erased handler thunks. Each thunk is
//! produced by [`Service::method`], whose trait bounds pin the admissible
//! handler shape at compile time: a call context and a deserializable
//! argument in, a serializable reply or an error out. Inside the thunk the
//! argument is materialized with the server's payload codec before the
//! typed handler runs, and the reply is encoded on the way out.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use bolt_core::codec::PayloadCodec;
use bolt_core::context::Context;
use bolt_core::error::Result;

/// Erased method thunk: decode argument, invoke, encode reply.
pub(crate) type MethodHandler =
    Arc<dyn Fn(Context, Vec<u8>, PayloadCodec) -> BoxFuture<'static, Result<Vec<u8>>> + Send + Sync>;

/// A named set of RPC methods sharing one receiver.
///
/// ```
/// use bolt_server::Service;
///
/// #[derive(serde::Deserialize)]
/// struct Ping { n: u64 }
/// #[derive(serde::Serialize)]
/// struct Pong { n: u64 }
///
/// let service = Service::new("Pinger")
///     .method("Ping", |_ctx, ping: Ping| async move { Ok(Pong { n: ping.n }) });
/// assert_eq!(service.name(), "Pinger");
/// ```
pub struct Service {
    name: String,
    methods: HashMap<String, MethodHandler>,
}

impl Service {
    /// Starts a service definition under `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Service {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    /// Adds a method.
    ///
    /// Handlers with an empty or duplicate name are skipped with a warning;
    /// method registration is append-only.
    pub fn method<Args, Reply, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        Args: DeserializeOwned + Send + 'static,
        Reply: Serialize + Send + 'static,
        F: Fn(Context, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply>> + Send + 'static,
    {
        if name.is_empty() {
            tracing::warn!(service = %self.name, "skipping method with empty name");
            return self;
        }
        if self.methods.contains_key(name) {
            tracing::warn!(service = %self.name, method = %name, "skipping duplicate method registration");
            return self;
        }

        let handler = Arc::new(handler);
        let thunk: MethodHandler = Arc::new(move |ctx, payload, codec| {
            let handler = handler.clone();
            Box::pin(async move {
                let args: Args = codec.decode(&payload)?;
                let reply = handler(ctx, args).await?;
                codec.encode(&reply)
            })
        });
        self.methods.insert(name.to_string(), thunk);
        self
    }

    /// The service name used as the routing prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether no method was admitted.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// The registered method names, in no particular order.
    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub(crate) fn handler(&self, method: &str) -> Option<MethodHandler> {
        self.methods.get(method).cloned()
    }
}
