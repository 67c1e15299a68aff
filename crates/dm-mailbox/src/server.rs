//! Mailbox on a dedicated thread.

use std::thread::{self, JoinHandle};

use tracing::{info, warn};

use crate::config::MailboxConfig;
use crate::error::MailboxError;
use crate::mailbox::{Mailbox, MailboxHandle};

/// Owns the thread that drains one mailbox.
///
/// Dropping the server shuts the mailbox down and joins its thread.
pub struct MailboxServer {
    handle: MailboxHandle,
    thread: Option<JoinHandle<()>>,
}

impl MailboxServer {
    /// Start a mailbox thread named after the mailbox.
    pub fn spawn(config: MailboxConfig) -> Result<Self, MailboxError> {
        let (mailbox, handle) = Mailbox::new(&config);
        let thread = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || mailbox.run_blocking())
            .map_err(|e| MailboxError::Spawn(e.to_string()))?;
        info!("Mailbox thread {} started", config.name);

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    /// A handle for posting to this mailbox.
    pub fn handle(&self) -> MailboxHandle {
        self.handle.clone()
    }

    /// Stop the mailbox after the messages already queued and wait for the
    /// thread to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.handle.shutdown();
        if thread.thread().id() == thread::current().id() {
            // Dropped from inside its own mailbox; the loop exits on its own
            return;
        }
        if thread.join().is_err() {
            warn!("Mailbox thread {} panicked", self.handle.name());
        } else {
            info!("Mailbox thread {} stopped", self.handle.name());
        }
    }
}

impl Drop for MailboxServer {
    fn drop(&mut self) {
        self.stop();
    }
}
