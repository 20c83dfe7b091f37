use crate::transport::TransportError;

/// Errors surfaced while constructing an [`AgentWriter`].
///
/// Construction is the only fallible operation in the pipeline; once a
/// writer exists, failures are logged and absorbed rather than returned.
///
/// [`AgentWriter`]: crate::AgentWriter
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The agent URL uses a scheme the writer cannot speak.
    #[error("unsupported URL scheme in agent URL: {0}")]
    UnsupportedScheme(String),
    /// The computed agent URL is not a valid URI.
    #[error(transparent)]
    InvalidUrl(#[from] http::uri::InvalidUri),
    /// The transport handle rejected its initial configuration.
    #[error("failed to configure agent transport: {0}")]
    HandleConfiguration(#[from] TransportError),
    /// The background worker thread could not be spawned.
    #[error("cannot spawn writer worker thread: {0}")]
    WorkerSpawn(#[from] std::io::Error),
}
