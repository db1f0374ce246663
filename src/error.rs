//! Error types raised by the store.
//!
//! Transient store errors are recovered from by the coordinator: logged,
//! rolled back, batch dropped. The coordinator loop itself has no other
//! fallible path — `PriorityMessage` is a closed enum, so the "unknown
//! message type" protocol violation `spec.md` §7 describes is ruled out
//! by construction rather than checked at runtime. The one remaining
//! fatal-exception path (a coordinator thread panic) is caught at the
//! `JoinHandle` boundary in `src/lifecycle.rs`, which is where it is
//! reported on the error-reporting queue.

use thiserror::Error;

/// Errors raised by [`crate::store::Store`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}
