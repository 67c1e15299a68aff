//! Mailbox errors.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MailboxError {
    /// The mailbox has shut down and no longer accepts messages.
    #[error("Mailbox {0} is closed")]
    Closed(String),

    /// The dedicated mailbox thread could not be started.
    #[error("Failed to spawn mailbox thread: {0}")]
    Spawn(String),

    /// A synchronous call was accepted but never ran to completion
    /// (the mailbox shut down first, or the call panicked).
    #[error("Synchronous call on mailbox {0} did not complete")]
    CallFailed(String),
}
