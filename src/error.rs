//! Crate-wide error types.

/// Errors surfaced by the DCP engine.
///
/// Validation errors never mutate state. Host/persist/schema failures are
/// handled at the call site per the engine's error-handling policy — most
/// are logged and demoted rather than propagated here, but the type still
/// needs to exist for the cases that do bubble up.
#[derive(Debug, thiserror::Error)]
pub enum DcpError {
    /// One or more validation issues, each on its own line when displayed.
    #[error("{}", .0.join("\n"))]
    Validation(Vec<String>),

    /// A call to the host (session.get, session.messages, ...) failed.
    #[error("host error: {0}")]
    Host(String),

    /// Persistence I/O failed.
    #[error("persistence error: {0}")]
    Persist(String),

    /// The on-disk session file could not be parsed as JSON.
    #[error("schema error: {0}")]
    Schema(String),

    /// An internal invariant was violated. Fatal for the owning session only.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// The event stream or an in-flight operation was cancelled.
    #[error("cancelled")]
    Cancelled,
}
