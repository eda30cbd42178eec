use thiserror::Error;

/// Terminal outcome of a failed lookup.
///
/// Cloneable because one in-flight transaction fans out to every coalesced
/// waiter, and all of them observe the same outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    /// Retry budget exhausted without a matching response.
    #[error("dns lookup timed out")]
    Timeout,

    /// Socket creation or write failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The system-resolver fallback failed (no transport was available).
    #[error("system resolver failed: {0}")]
    SystemResolver(String),

    /// The query name is neither an address literal nor a valid domain name.
    #[error("invalid domain name: {0}")]
    InvalidName(String),

    /// Query serialization failed.
    #[error("protocol error: {0}")]
    Proto(String),

    /// The in-flight transaction went away before delivering an outcome.
    #[error("lookup abandoned")]
    Abandoned,
}
