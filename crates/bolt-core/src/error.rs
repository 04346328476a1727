//! Structured RPC error model.
//!
//! Every failure surfaced by the framework carries a [`Code`] drawn from a
//! fixed set, a human-readable message, and an optional wrapped cause. The
//! cause chain is preserved through [`std::error::Error::source`], so callers
//! can match on a specific link with [`Error::is`] or extract the dominant
//! code with [`code_of`] without caring how many layers of wrapping happened
//! in between.
//!
//! # Example
//!
//! ```
//! use bolt_core::error::{Code, Error, code_of};
//!
//! let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out");
//! let err = Error::wrap(Code::Timeout, io, "waiting for response");
//!
//! assert_eq!(err.code(), Code::Timeout);
//! assert_eq!(code_of(&err), Code::Timeout);
//! assert!(err.to_string().contains("waiting for response"));
//! ```

use std::error::Error as StdError;
use std::fmt;

/// Result alias used throughout the framework.
pub type Result<T> = std::result::Result<T, Error>;

/// The fixed set of error codes.
///
/// The set mirrors the usual RPC taxonomy: bad input, missing route,
/// conflict, authn/authz, time, lifecycle, and a catch-all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Code {
    #[default]
    Unknown,
    InvalidArgument,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    Timeout,
    Cancelled,
    DeadlineExceeded,
}

impl Code {
    /// The canonical snake_case name of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Unknown => "unknown",
            Code::InvalidArgument => "invalid_argument",
            Code::NotFound => "not_found",
            Code::AlreadyExists => "already_exists",
            Code::PermissionDenied => "permission_denied",
            Code::Unauthenticated => "unauthenticated",
            Code::Timeout => "timeout",
            Code::Cancelled => "cancelled",
            Code::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured RPC error: code, message, optional wrapped cause.
pub struct Error {
    code: Code,
    message: String,
    cause: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given code and message.
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Error {
            code,
            message: message.into(),
            cause: None,
        }
    }

    /// Wraps a cause with an additional code and message.
    ///
    /// The cause stays reachable through the error chain, so code extraction
    /// and sentinel matching keep working across wrapping layers.
    pub fn wrap(
        code: Code,
        cause: impl Into<Box<dyn StdError + Send + Sync>>,
        message: impl Into<String>,
    ) -> Self {
        Error {
            code,
            message: message.into(),
            cause: Some(cause.into()),
        }
    }

    /// The code attached to this error (not its causes).
    pub fn code(&self) -> Code {
        self.code
    }

    /// The message attached to this error (not its causes).
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether this error or any link in its cause chain carries `code`.
    pub fn is_code(&self, code: Code) -> bool {
        if self.code == code {
            return true;
        }
        let mut cause: Option<&(dyn StdError + 'static)> = self.source();
        while let Some(err) = cause {
            if let Some(e) = err.downcast_ref::<Error>() {
                if e.code == code {
                    return true;
                }
            }
            cause = err.source();
        }
        false
    }

    /// Whether this error or any link in its cause chain matches `target`.
    ///
    /// Two links match when they carry the same code and message. This is
    /// how sentinel errors such as [`Error::client_closed`] are recognized
    /// after being wrapped.
    pub fn is(&self, target: &Error) -> bool {
        if self.code == target.code && self.message == target.message {
            return true;
        }
        let mut cause: Option<&(dyn StdError + 'static)> = self.source();
        while let Some(err) = cause {
            if let Some(e) = err.downcast_ref::<Error>() {
                if e.code == target.code && e.message == target.message {
                    return true;
                }
            }
            cause = err.source();
        }
        false
    }

    /// Sentinel: the client has been closed.
    pub fn client_closed() -> Self {
        Error::new(Code::Unknown, "client closed")
    }

    /// Sentinel: the server or transport has been closed.
    pub fn server_closed() -> Self {
        Error::new(Code::Unknown, "server closed")
    }

    /// Sentinel: no service registered under the requested name.
    pub fn service_not_found() -> Self {
        Error::new(Code::NotFound, "service not found")
    }

    /// Sentinel: the service has no method of the requested name.
    pub fn method_not_found() -> Self {
        Error::new(Code::NotFound, "method not found")
    }

    /// Sentinel: a load balancer was handed an empty instance list.
    pub fn no_available_instances() -> Self {
        Error::new(Code::NotFound, "no available service instances")
    }

    /// Sentinel: the call was cancelled.
    pub fn cancelled() -> Self {
        Error::new(Code::Cancelled, "cancelled")
    }

    /// Sentinel: the call's deadline elapsed.
    pub fn deadline_exceeded() -> Self {
        Error::new(Code::DeadlineExceeded, "deadline exceeded")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}: {}: {}", self.code, self.message, cause),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("cause", &self.cause)
            .finish()
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_ref()
            .map(|c| c.as_ref() as &(dyn StdError + 'static))
    }
}

/// Extracts the dominant code of an arbitrary error.
///
/// Walks the chain and returns the code of the first [`Error`] link found;
/// foreign errors without a structured link yield [`Code::Unknown`].
pub fn code_of(err: &(dyn StdError + 'static)) -> Code {
    if let Some(e) = err.downcast_ref::<Error>() {
        return e.code;
    }
    let mut cause = err.source();
    while let Some(link) = cause {
        if let Some(e) = link.downcast_ref::<Error>() {
            return e.code;
        }
        cause = link.source();
    }
    Code::Unknown
}
