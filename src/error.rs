// =============================================================================
// Collaborator error types
// =============================================================================

use thiserror::Error;

/// Failure reported by a [`crate::store::CandleStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Failure reported by a [`crate::broadcast::ConsumerTransport`] write.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The consumer's connection has already gone away.
    #[error("consumer transport closed")]
    Closed,

    /// The consumer is not draining its outbound queue fast enough.
    #[error("consumer outbound queue full ({capacity} frames)")]
    Backlogged { capacity: usize },
}
