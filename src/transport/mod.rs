//! The HTTP seam between the writer and the network.
//!
//! The writer drives a small capability set rather than a concrete client:
//! configure the request piece by piece, replace the header set, perform the
//! POST, read back status and body. Production binds the capability set to a
//! blocking HTTP client; tests bind it to an in-memory double.

use std::collections::HashMap;

#[cfg(feature = "reqwest-blocking-client")]
mod reqwest_blocking;
#[cfg(feature = "reqwest-blocking-client")]
pub use reqwest_blocking::ReqwestHandle;

/// A failure reported by the transport layer.
///
/// `message` is the short human-readable failure text (what a status line
/// would say); `detail` is the transport's verbose diagnostic output, when it
/// has any. Both end up in the writer's logs.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    pub detail: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        TransportError {
            message: message.into(),
            detail: String::new(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

/// One request parameter understood by an [`HttpHandle`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandleOption {
    /// Target URL of the POST.
    Url(String),
    /// Route the request over a Unix domain socket at this filesystem path.
    UnixSocketPath(String),
    /// Overall request timeout, in milliseconds.
    TimeoutMs(u64),
    /// Size of the request body about to be set, in bytes.
    PostFieldSize(usize),
    /// The request body.
    PostFields(Vec<u8>),
}

/// Capability set the writer requires from an HTTP POST client.
///
/// A handle is configured once with the target URL and timeout at writer
/// construction, then re-used for every batch: body and headers are replaced
/// per request, `perform` executes it, and the response accessors are valid
/// until the next `perform`. The writer's worker thread is the unique owner
/// of the handle from construction until the writer stops; dropping the
/// handle closes the connection.
pub trait HttpHandle: Send {
    /// Set a single request parameter.
    fn set_option(&mut self, option: HandleOption) -> Result<(), TransportError>;

    /// Replace the full header set for subsequent requests. Headers from
    /// earlier calls do not survive.
    fn set_headers(&mut self, headers: HashMap<String, String>) -> Result<(), TransportError>;

    /// Execute the configured POST.
    fn perform(&mut self) -> Result<(), TransportError>;

    /// HTTP status of the last response, or 0 when no status is available.
    fn response_status(&self) -> u16;

    /// Body of the last response.
    fn response_body(&self) -> Vec<u8>;
}
