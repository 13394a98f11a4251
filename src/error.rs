//! Error types shared across the terminal crate.
//!
//! Replay and storage failures are surfaced with user-presentable `Display`
//! messages because the driver UI shows them verbatim in the sync status
//! panel. GPS acquisition has its own error type in [`crate::gps`].

use thiserror::Error;

/// Errors produced by the queue, sync engine, and admin API client.
#[derive(Debug, Error)]
pub enum TerminalError {
    /// Local SQLite failure. Queue writes must never fail silently, so this
    /// propagates all the way to the initiating driver action.
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    /// Filesystem failure while opening or creating the local store.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// OS keyring / session vault failure.
    #[error("session vault error: {0}")]
    Vault(String),

    /// No bearer token in the session vault. Retryable: the driver may
    /// re-authenticate before the next drain pass.
    #[error("no session token available; sign in again to resume syncing")]
    MissingToken,

    /// Replay failure against the admin dashboard (network or HTTP status),
    /// already mapped to a user-friendly message.
    #[error("{0}")]
    Api(String),

    /// Queue entries may only replay mutating verbs.
    #[error("unsupported replay method: {0}")]
    UnsupportedMethod(String),

    /// A shared lock was poisoned by a panicking thread.
    #[error("internal error: {0}")]
    Internal(String),
}

impl TerminalError {
    /// Message suitable for the per-action `last_error` column.
    pub fn replay_message(&self) -> String {
        self.to_string()
    }
}
