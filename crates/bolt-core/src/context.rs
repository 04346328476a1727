//! Call context: deadline, cancellation, and request-scoped values.
//!
//! A [`Context`] travels with every call on both sides of the wire. It is
//! cheap to clone; clones share the same cancellation token, so cancelling
//! one cancels all. Deriving a child context with [`Context::with_timeout`]
//! produces a child token: cancelling the parent cancels the child but not
//! the other way around.
//!
//! The dispatch engine populates the two request-scoped values — the
//! service-method string and the request metadata — before the middleware
//! chain runs, so any middleware can read them without re-decoding the
//! envelope.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Code, Error};

/// Per-call context carrying deadline, cancellation, and metadata.
#[derive(Debug, Clone)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: CancellationToken,
    metadata: HashMap<String, String>,
    service_method: String,
}

impl Context {
    /// A context with no deadline and no values attached.
    pub fn background() -> Self {
        Context {
            deadline: None,
            cancel: CancellationToken::new(),
            metadata: HashMap::new(),
            service_method: String::new(),
        }
    }

    /// Derives a child context whose deadline is at most `timeout` from now.
    ///
    /// An already-tighter deadline is kept. The child gets its own token, so
    /// cancelling the child leaves the parent untouched.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derives a child context with the given absolute deadline (the earlier
    /// of `deadline` and any existing one wins).
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing <= deadline => existing,
            _ => deadline,
        };
        Context {
            deadline: Some(deadline),
            cancel: self.cancel.child_token(),
            metadata: self.metadata.clone(),
            service_method: self.service_method.clone(),
        }
    }

    /// Replaces the metadata map.
    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Replaces the service-method string.
    pub fn with_service_method(mut self, service_method: impl Into<String>) -> Self {
        self.service_method = service_method.into();
        self
    }

    /// Cancels this context and everything derived from it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The absolute deadline, if one is set.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline. `None` when no deadline is set; zero
    /// when it has already passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Resolves once the context is cancelled or its deadline passes.
    ///
    /// Pending forever on a context with no deadline that is never
    /// cancelled, which makes it safe to use as a `select!` arm.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }

    /// The terminal error of a fired context, `None` while it is live.
    ///
    /// Cancellation takes precedence over deadline expiry.
    pub fn err(&self) -> Option<Error> {
        if self.cancel.is_cancelled() {
            return Some(Error::new(Code::Cancelled, "context cancelled"));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Some(Error::deadline_exceeded());
            }
        }
        None
    }

    /// Request metadata, as delivered in the request envelope.
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Inserts a single metadata entry.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// The `"Service.Method"` string of the call in flight, empty outside a
    /// dispatch.
    pub fn service_method(&self) -> &str {
        &self.service_method
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}
