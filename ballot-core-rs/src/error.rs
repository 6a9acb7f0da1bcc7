//! Error types for sessions, elections and the store client

use crate::types::{LeaseId, Revision};

/// Errors surfaced by this crate
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Lease grant failed while building a session
    #[error("session: failed to create session: {0}")]
    SessionCreate(#[source] Box<Error>),

    /// The session's lease is gone, so anything attached to it is gone too
    #[error("session: session is expired")]
    SessionExpired,

    /// Proclaim/resign attempted without holding the leadership key
    #[error("election: not leader")]
    ElectionNotLeader,

    /// No candidacy key exists under the election prefix
    #[error("election: no leader")]
    ElectionNoLeader,

    /// Campaign called while tracking a resumed leader that is not ours
    #[error("election: tracking a resumed leader, resign before campaigning")]
    ElectionResumed,

    /// Mutex is held by another session
    #[error("mutex: locked by another session")]
    Locked,

    #[error("context canceled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// Requested history was discarded by compaction
    #[error("required revision has been compacted (compacted at {0})")]
    Compacted(Revision),

    #[error("requested lease {0:x} not found")]
    LeaseNotFound(LeaseId),

    /// Store could not be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Watch stream ended without delivering what we waited for
    #[error("lost watcher waiting for delete")]
    WatchLost,
}

impl Error {
    /// True for cancellation and deadline errors
    pub fn is_context(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded)
    }
}

/// Result type for store, session and election operations
pub type Result<T> = std::result::Result<T, Error>;
