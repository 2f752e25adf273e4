use thiserror::Error;

/// Library-wide error type carrying a status code.
///
/// The codes mirror the recovery policy callers are expected to apply:
/// [`Error::Unavailable`] is transient and worth retrying with backoff,
/// [`Error::StreamTerminated`] is the routine end of an operation stream,
/// and everything else is surfaced to the caller. Work completions with a
/// non-success status are *not* represented here: they indicate memory or
/// queue-pair corruption the protocol cannot recover from, and abort the
/// process instead.
#[derive(Debug, Error)]
pub enum Error {
    /// Temporary failure; the caller should retry (e.g. the arbitration
    /// lock is held by a concurrent outgoing dial, or a peer has not
    /// delivered a message yet).
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// A connection or key does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A connection for the peer is already established or requested.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// API misuse, e.g. accumulating metrics with mismatched names.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// `rdma_cm` or verbs returned an unexpected error.
    #[error("internal: {0}")]
    Internal(String),

    /// The operation stream has no more elements.
    #[error("stream terminated")]
    StreamTerminated,

    /// A payload does not fit, or a ring has no free slots.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl Error {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Error::Unavailable(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_stream_terminated(&self) -> bool {
        matches!(self, Error::StreamTerminated)
    }

    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Error::ResourceExhausted(_))
    }

    pub(crate) fn unavailable(msg: impl Into<String>) -> Self {
        Error::Unavailable(msg.into())
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}

/// Low-level FFI helpers report through `anyhow`; everything crossing the
/// library surface becomes an internal error.
impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Internal(format!("{:#}", e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("serialization: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_predicates() {
        assert!(Error::unavailable("x").is_unavailable());
        assert!(Error::StreamTerminated.is_stream_terminated());
        assert!(!Error::internal("x").is_unavailable());
        assert!(Error::ResourceExhausted("full".into()).is_resource_exhausted());
    }

    #[test]
    fn anyhow_conversion_is_internal() {
        let e: Error = anyhow::anyhow!("verbs said no").into();
        assert!(matches!(e, Error::Internal(_)));
    }
}
