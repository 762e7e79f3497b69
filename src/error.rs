//! Error types for the session admission and inference core.

/// Errors that can occur in the session core.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Lookup**: [`SessionNotFound`](Self::SessionNotFound),
///   [`SessionExpired`](Self::SessionExpired) — both surface identically at
///   the wire; `SessionExpired` means the id was known but its model state
///   has been reclaimed (reaper, close, or init failure).
/// - **Validation**: [`InvalidArgument`](Self::InvalidArgument) — unknown
///   propagation direction, malformed RLE, mismatched point/label lengths.
/// - **Model**: [`Backend`](Self::Backend) — any failure reported by the
///   [`ModelBackend`](crate::backend::ModelBackend). Non-retryable from the
///   caller's point of view; the core has already flushed the accelerator
///   cache and, for admission failures, freed the slot.
/// - **Durability**: [`Persistence`](Self::Persistence), [`Io`](Self::Io) —
///   queue-file save/load problems. Admission decisions proceed anyway
///   (availability over durability), so these are mostly logged, not surfaced.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying I/O error (queue file reads/writes).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No session with the given ID exists in the session table.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The session exists but its model state is gone (reaped or closed).
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// A request carried a value the core cannot act on.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The model backend reported a failure.
    #[error("model backend error: {0}")]
    Backend(String),

    /// The persisted queue image could not be written or read back.
    #[error("queue persistence error: {0}")]
    Persistence(String),
}

/// Convenience alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
