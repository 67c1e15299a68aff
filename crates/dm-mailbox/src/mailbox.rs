//! The mailbox queue and its handle.

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dm_core::{ChangeNotification, NotificationQueue};
use tokio::sync::mpsc::error::SendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::config::MailboxConfig;
use crate::error::MailboxError;

static NEXT_MAILBOX_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Mailbox whose message is being processed on this thread, 0 for none.
    static CURRENT_MAILBOX: Cell<u64> = const { Cell::new(0) };
}

/// Marks the current thread as running `id` until dropped.
struct ContextGuard {
    previous: u64,
}

impl ContextGuard {
    fn enter(id: u64) -> Self {
        let previous = CURRENT_MAILBOX.with(|current| current.replace(id));
        Self { previous }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CURRENT_MAILBOX.with(|current| current.set(self.previous));
    }
}

type Job = Box<dyn FnOnce() + Send>;

enum MailboxMessage {
    Notify(ChangeNotification),
    Call(Job),
    Shutdown,
}

/// Something with an open/close lifecycle that must run on a mailbox,
/// typically because it owns subscribers bound to that mailbox.
///
/// `close` should detach the component's subscribers: once it has run on the
/// mailbox, no further notification for them is delivered.
pub trait Component: Send + Sync {
    fn open(&self);
    fn close(&self);
}

/// Receiving side of a mailbox. Drive it with [`Mailbox::run_blocking`] on a
/// thread or [`Mailbox::run_async`] on a tokio runtime.
pub struct Mailbox {
    id: u64,
    name: Arc<str>,
    rx: mpsc::UnboundedReceiver<MailboxMessage>,
}

impl Mailbox {
    pub fn new(config: &MailboxConfig) -> (Mailbox, MailboxHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = NEXT_MAILBOX_ID.fetch_add(1, Ordering::Relaxed);
        let name: Arc<str> = Arc::from(config.name.as_str());
        let mailbox = Mailbox {
            id,
            name: name.clone(),
            rx,
        };
        (mailbox, MailboxHandle { id, name, tx })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Process messages on the calling thread until shut down.
    ///
    /// Must not be called from within an async runtime.
    pub fn run_blocking(mut self) {
        debug!("Mailbox {} running", self.name);
        while let Some(message) = self.rx.blocking_recv() {
            if !self.dispatch(message) {
                break;
            }
        }
        debug!("Mailbox {} stopped", self.name);
    }

    /// Process messages as an async task until shut down.
    pub async fn run_async(mut self) {
        debug!("Mailbox {} running (async)", self.name);
        while let Some(message) = self.rx.recv().await {
            if !self.dispatch(message) {
                break;
            }
        }
        debug!("Mailbox {} stopped", self.name);
    }

    /// Returns false when the mailbox should stop.
    fn dispatch(&self, message: MailboxMessage) -> bool {
        let _context = ContextGuard::enter(self.id);
        match message {
            MailboxMessage::Notify(notification) => {
                trace!("Mailbox {} delivering {:?}", self.name, notification);
                notification.deliver();
                true
            }
            MailboxMessage::Call(job) => {
                job();
                true
            }
            MailboxMessage::Shutdown => false,
        }
    }
}

/// Sending side of a mailbox. Cheap to clone.
#[derive(Clone)]
pub struct MailboxHandle {
    id: u64,
    name: Arc<str>,
    tx: mpsc::UnboundedSender<MailboxMessage>,
}

impl MailboxHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when called from a message this mailbox is processing.
    pub fn is_current_context(&self) -> bool {
        CURRENT_MAILBOX.with(|current| current.get() == self.id)
    }

    /// True once the mailbox has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn closed(&self) -> MailboxError {
        MailboxError::Closed(self.name.to_string())
    }

    /// Queue `job` to run on the mailbox.
    pub fn post<F>(&self, job: F) -> Result<(), MailboxError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx
            .send(MailboxMessage::Call(Box::new(job)))
            .map_err(|_| self.closed())
    }

    /// Run `job` on the mailbox and wait for its result.
    ///
    /// Runs inline when already on this mailbox. Blocks the calling thread;
    /// from async code use [`MailboxHandle::call`].
    pub fn call_sync<F, R>(&self, job: F) -> Result<R, MailboxError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current_context() {
            return Ok(job());
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.post(move || {
            let _ = reply_tx.send(job());
        })?;
        reply_rx
            .blocking_recv()
            .map_err(|_| MailboxError::CallFailed(self.name.to_string()))
    }

    /// Run `job` on the mailbox and await its result.
    pub async fn call<F, R>(&self, job: F) -> Result<R, MailboxError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current_context() {
            return Ok(job());
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.post(move || {
            let _ = reply_tx.send(job());
        })?;
        reply_rx
            .await
            .map_err(|_| MailboxError::CallFailed(self.name.to_string()))
    }

    /// Open `component` on the mailbox, returning once `open` has run.
    pub fn open<C: Component + 'static>(&self, component: &Arc<C>) -> Result<(), MailboxError> {
        let component = component.clone();
        self.call_sync(move || component.open())
    }

    /// Close `component` on the mailbox, returning once `close` has run.
    pub fn close<C: Component + 'static>(&self, component: &Arc<C>) -> Result<(), MailboxError> {
        let component = component.clone();
        self.call_sync(move || component.close())
    }

    /// Async form of [`MailboxHandle::open`].
    pub async fn open_async<C: Component + 'static>(
        &self,
        component: &Arc<C>,
    ) -> Result<(), MailboxError> {
        let component = component.clone();
        self.call(move || component.open()).await
    }

    /// Async form of [`MailboxHandle::close`].
    pub async fn close_async<C: Component + 'static>(
        &self,
        component: &Arc<C>,
    ) -> Result<(), MailboxError> {
        let component = component.clone();
        self.call(move || component.close()).await
    }

    /// Ask the mailbox to stop after the messages already queued.
    pub fn shutdown(&self) {
        if self.tx.send(MailboxMessage::Shutdown).is_err() {
            trace!("Mailbox {} already stopped", self.name);
        }
    }
}

impl NotificationQueue for MailboxHandle {
    fn post(&self, notification: ChangeNotification) -> Result<(), ChangeNotification> {
        match self.tx.send(MailboxMessage::Notify(notification)) {
            Ok(()) => Ok(()),
            Err(SendError(MailboxMessage::Notify(notification))) => {
                warn!("Mailbox {} is closed, notification not delivered", self.name);
                Err(notification)
            }
            // Only notifications are sent here
            Err(_) => Ok(()),
        }
    }

    fn is_current_context(&self) -> bool {
        MailboxHandle::is_current_context(self)
    }
}

impl fmt::Debug for MailboxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailboxHandle")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_async_mailbox_runs_jobs_in_order() {
        let (mailbox, handle) = Mailbox::new(&MailboxConfig::named("test-async"));
        let task = tokio::spawn(mailbox.run_async());

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            handle.post(move || order.lock().unwrap().push(i)).unwrap();
        }
        let log = order.clone();
        let seen = handle
            .call(move || std::mem::take(&mut *log.lock().unwrap()))
            .await
            .unwrap();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);

        handle.shutdown();
        task.await.unwrap();
        assert!(handle.is_closed());
        assert_eq!(
            handle.post(|| {}).unwrap_err(),
            MailboxError::Closed("test-async".to_string())
        );
    }

    #[tokio::test]
    async fn test_current_context_only_inside_mailbox() {
        let (mailbox, handle) = Mailbox::new(&MailboxConfig::default());
        let task = tokio::spawn(mailbox.run_async());
        assert!(!handle.is_current_context());

        let inner = handle.clone();
        let inside = handle.call(move || inner.is_current_context()).await.unwrap();
        assert!(inside);

        handle.shutdown();
        task.await.unwrap();
    }

    #[test]
    fn test_call_sync_from_plain_thread() {
        let (mailbox, handle) = Mailbox::new(&MailboxConfig::named("test-sync"));
        let thread = std::thread::spawn(move || mailbox.run_blocking());

        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let value = handle
            .call_sync(move || c.fetch_add(1, Ordering::SeqCst) + 41)
            .unwrap();
        assert_eq!(value, 41);

        // Nested synchronous call runs inline instead of deadlocking
        let inner = handle.clone();
        let nested = handle
            .call_sync(move || inner.call_sync(|| 7).unwrap())
            .unwrap();
        assert_eq!(nested, 7);

        handle.shutdown();
        thread.join().unwrap();
        assert!(handle.call_sync(|| ()).is_err());
    }
}
