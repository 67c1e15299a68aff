//! Subscribers and change notifications.
//!
//! A [`Subscriber`] binds a callback to one model point and to the execution
//! context (a [`NotificationQueue`]) the callback must run on. Every state
//! change of the point posts a [`ChangeNotification`] to that queue; the
//! owning context later calls [`ChangeNotification::deliver`], which runs the
//! callback.
//!
//! Each subscription follows a small state machine kept in the database
//! registry:
//!
//! ```text
//!                attach                 change              delivery starts
//! Unsubscribed -------> Idle <----------------> NotifyPending ------------> Notifying
//!                        ^     attach(seq == current)                          |
//!                        |                                                     |
//!                        +------- delivery done, nothing new <-----------------+
//!                                 delivery done, newer change -> NotifyPending
//!                                 detached during delivery    -> Unsubscribed
//! ```
//!
//! At most one notification is outstanding per subscription. A change that
//! happens while a notification is pending is folded into it; the callback
//! always observes the point's state at delivery time. Each posted
//! notification carries a token, so a notification left in a queue after a
//! detach or re-attach is recognised as stale and dropped.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

use crate::codec::ValueCodec;
use crate::database::{PointId, Registry};
use crate::point::ModelPoint;
use crate::sequence::SequenceNumber;

pub(crate) type SubscriberId = u64;

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// An execution context that accepts change notifications.
///
/// Implemented by the application's event loop or mailbox. `post` must not
/// block and must not deliver inline: it is called with the database lock
/// held.
pub trait NotificationQueue: Send + Sync {
    /// Queue a notification for later delivery on this context. Returning the
    /// notification back means the context is gone; the subscription is then
    /// dropped.
    fn post(&self, notification: ChangeNotification) -> Result<(), ChangeNotification>;

    /// True when called from the thread or task that drains this queue.
    fn is_current_context(&self) -> bool;
}

/// Receiving end of a notification.
pub(crate) trait Deliver: Send + Sync {
    fn deliver(self: Arc<Self>, token: u64);
}

/// A pending "this point changed" message.
///
/// It references the subscriber, never a copy of the point's data.
pub struct ChangeNotification {
    target: Weak<dyn Deliver>,
    subscriber: SubscriberId,
    token: u64,
}

impl ChangeNotification {
    /// Run the subscriber's callback. Must be called on the subscriber's
    /// execution context. Stale notifications are silently discarded.
    pub fn deliver(self) {
        match self.target.upgrade() {
            Some(target) => target.deliver(self.token),
            None => trace!("Subscriber {} is gone, dropping notification", self.subscriber),
        }
    }

    pub fn subscriber_id(&self) -> u64 {
        self.subscriber
    }
}

impl fmt::Debug for ChangeNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeNotification")
            .field("subscriber", &self.subscriber)
            .field("token", &self.token)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubState {
    /// Listed on the point, waiting for a change
    Idle,
    /// A notification is queued on the subscriber's context
    NotifyPending,
    /// The callback is running
    Notifying,
    /// Detached while the callback was running
    NotifyPendingDetach,
}

/// Registry-side state of one subscriber.
pub(crate) struct Subscription {
    pub(crate) point: PointId,
    pub(crate) state: SubState,
    /// Last sequence number the subscriber has seen
    pub(crate) seq: SequenceNumber,
    token: u64,
    queue: Arc<dyn NotificationQueue>,
    target: Weak<dyn Deliver>,
}

impl Registry {
    /// Returns false when `point` is no longer registered.
    pub(crate) fn attach(
        &mut self,
        sid: SubscriberId,
        point: PointId,
        queue: Arc<dyn NotificationQueue>,
        target: Weak<dyn Deliver>,
        initial: SequenceNumber,
    ) -> bool {
        if !self.points.contains_key(&point) {
            return false;
        }

        let existing = self.subscriptions.get(&sid).map(|sub| (sub.point, sub.state));
        match existing {
            Some((bound, state)) if bound == point => {
                if let Some(sub) = self.subscriptions.get_mut(&sid) {
                    sub.seq = initial;
                    sub.queue = queue;
                    sub.target = target;
                    if state == SubState::NotifyPendingDetach {
                        // Still inside the callback: resume as a normal delivery
                        sub.state = SubState::Notifying;
                    }
                }
                if matches!(state, SubState::Idle | SubState::NotifyPending) {
                    self.transition_to_subscribed(sid);
                }
            }
            other => {
                if let Some((bound, _)) = other {
                    self.forget(sid, bound);
                }
                self.subscriptions.insert(
                    sid,
                    Subscription {
                        point,
                        state: SubState::Idle,
                        seq: initial,
                        token: 0,
                        queue,
                        target,
                    },
                );
                self.transition_to_subscribed(sid);
            }
        }
        true
    }

    pub(crate) fn detach(&mut self, sid: SubscriberId) {
        let Some(sub) = self.subscriptions.get_mut(&sid) else {
            return;
        };
        match sub.state {
            SubState::Idle | SubState::NotifyPending => {
                let point = sub.point;
                self.forget(sid, point);
            }
            SubState::Notifying => sub.state = SubState::NotifyPendingDetach,
            SubState::NotifyPendingDetach => {}
        }
    }

    /// Remove a subscription outright.
    fn forget(&mut self, sid: SubscriberId, point: PointId) {
        if let Some(entry) = self.points.get_mut(&point) {
            entry.subscribers.retain(|s| *s != sid);
        }
        self.subscriptions.remove(&sid);
    }

    /// Idle if the subscriber is up to date, otherwise schedule a notification.
    fn transition_to_subscribed(&mut self, sid: SubscriberId) {
        let Some(sub) = self.subscriptions.get(&sid) else {
            return;
        };
        let (point, seen, state) = (sub.point, sub.seq, sub.state);
        let Some(entry) = self.points.get_mut(&point) else {
            self.subscriptions.remove(&sid);
            return;
        };

        if seen == entry.seq {
            if !entry.subscribers.contains(&sid) {
                entry.subscribers.push(sid);
            }
            if let Some(sub) = self.subscriptions.get_mut(&sid) {
                sub.state = SubState::Idle;
            }
        } else if state != SubState::NotifyPending {
            entry.subscribers.retain(|s| *s != sid);
            self.post_notification(sid);
        }
    }

    /// Called for each idle subscriber when its point changes.
    pub(crate) fn schedule_notification(&mut self, sid: SubscriberId) {
        let idle = self
            .subscriptions
            .get(&sid)
            .map(|sub| sub.state == SubState::Idle)
            .unwrap_or(false);
        if idle {
            self.post_notification(sid);
        }
    }

    fn post_notification(&mut self, sid: SubscriberId) {
        self.next_token += 1;
        let token = self.next_token;
        let Some(sub) = self.subscriptions.get_mut(&sid) else {
            return;
        };
        sub.state = SubState::NotifyPending;
        sub.token = token;

        let notification = ChangeNotification {
            target: sub.target.clone(),
            subscriber: sid,
            token,
        };
        trace!("Posting change notification to subscriber {}", sid);
        let delivered = sub.target.strong_count() > 0 && sub.queue.post(notification).is_ok();
        if !delivered {
            warn!(
                "Execution context of subscriber {} is gone, dropping its subscription",
                sid
            );
            self.subscriptions.remove(&sid);
        }
    }

    /// Start a delivery. Returns false for stale notifications.
    pub(crate) fn begin_notify(&mut self, sid: SubscriberId, token: u64) -> bool {
        let Some(point) = self.subscriptions.get(&sid).map(|sub| sub.point) else {
            return false;
        };
        let current = self.seq_of(point);
        if current.is_unknown() {
            self.subscriptions.remove(&sid);
            return false;
        }
        match self.subscriptions.get_mut(&sid) {
            Some(sub) if sub.state == SubState::NotifyPending && sub.token == token => {
                sub.seq = current;
                sub.state = SubState::Notifying;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn end_notify(&mut self, sid: SubscriberId) {
        let state = self.subscriptions.get(&sid).map(|sub| sub.state);
        match state {
            Some(SubState::Notifying) => self.transition_to_subscribed(sid),
            Some(SubState::NotifyPendingDetach) => {
                self.subscriptions.remove(&sid);
            }
            _ => {}
        }
    }

    /// Record that the subscriber has seen the point's current state.
    pub(crate) fn sync_subscriber(&mut self, sid: SubscriberId, point: PointId) {
        let current = self.seq_of(point);
        if let Some(sub) = self.subscriptions.get_mut(&sid) {
            if sub.point == point {
                sub.seq = current;
            }
        }
    }

    pub(crate) fn subscriber_seq(&self, sid: SubscriberId) -> SequenceNumber {
        self.subscriptions
            .get(&sid)
            .map(|sub| sub.seq)
            .unwrap_or(SequenceNumber::UNKNOWN)
    }
}

type Callback<C> = dyn Fn(&ModelPoint<C>, &Subscriber<C>) + Send + Sync;

struct SubscriberInner<C: ValueCodec> {
    id: SubscriberId,
    queue: Arc<dyn NotificationQueue>,
    callback: Box<Callback<C>>,
    point: Mutex<Option<ModelPoint<C>>>,
}

impl<C: ValueCodec> Deliver for SubscriberInner<C> {
    fn deliver(self: Arc<Self>, token: u64) {
        let bound = self.point.lock().clone();
        let Some(point) = bound else {
            return;
        };
        if !self.queue.is_current_context() {
            warn!(
                "Notification for {} delivered outside its subscriber's context",
                point.name()
            );
        }

        let begun = point.database().registry().begin_notify(self.id, token);
        if !begun {
            trace!("Discarding stale notification for subscriber {}", self.id);
            return;
        }

        let handle = Subscriber {
            inner: self.clone(),
        };
        (self.callback)(&point, &handle);

        point.database().registry().end_notify(self.id);
    }
}

impl<C: ValueCodec> Drop for SubscriberInner<C> {
    fn drop(&mut self) {
        if let Some(point) = self.point.get_mut().take() {
            point.database().registry().detach(self.id);
        }
    }
}

/// A change-notification callback bound to an execution context.
///
/// Cloning yields another handle to the same subscriber. Dropping the last
/// handle detaches it.
pub struct Subscriber<C: ValueCodec> {
    inner: Arc<SubscriberInner<C>>,
}

impl<C: ValueCodec> Subscriber<C> {
    /// Create an unattached subscriber whose callback runs on `queue`.
    pub fn new<Q, F>(queue: Q, callback: F) -> Self
    where
        Q: NotificationQueue + 'static,
        F: Fn(&ModelPoint<C>, &Subscriber<C>) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(SubscriberInner {
                id: NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed),
                queue: Arc::new(queue),
                callback: Box::new(callback),
                point: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The point this subscriber is attached to, if any.
    pub fn point(&self) -> Option<ModelPoint<C>> {
        self.inner.point.lock().clone()
    }

    pub fn is_attached(&self) -> bool {
        self.inner.point.lock().is_some()
    }

    /// Last sequence number this subscriber has seen, or `UNKNOWN` when
    /// unattached.
    pub fn sequence_number(&self) -> SequenceNumber {
        match self.point() {
            Some(point) => point.database().registry().subscriber_seq(self.inner.id),
            None => SequenceNumber::UNKNOWN,
        }
    }

    /// Stop notifications. Safe to call from inside the callback; a
    /// notification already queued is discarded on delivery.
    pub fn detach(&self) {
        // Slot stays locked across the registry update. Lock order: slot, then registry
        let mut slot = self.inner.point.lock();
        if let Some(point) = slot.take() {
            point.database().registry().detach(self.inner.id);
            debug!("Subscriber {} detached from {}", self.inner.id, point.name());
        }
    }

    /// Bind to `point`, detaching from a previous point first. A point that
    /// has been removed from its database leaves the subscriber unattached.
    pub(crate) fn bind(&self, point: &ModelPoint<C>, initial: SequenceNumber) {
        let mut slot = self.inner.point.lock();
        if let Some(previous) = slot.take() {
            if previous.as_point_ref() != point.as_point_ref() {
                previous.database().registry().detach(self.inner.id);
            }
        }

        let inner: Arc<SubscriberInner<C>> = self.inner.clone();
        let target: Arc<dyn Deliver> = inner;
        let target = Arc::downgrade(&target);
        let attached = point.database().registry().attach(
            self.inner.id,
            point.id(),
            self.inner.queue.clone(),
            target,
            initial,
        );
        if !attached {
            warn!(
                "Subscriber {} not attached: {} is no longer registered",
                self.inner.id,
                point.name()
            );
            return;
        }
        *slot = Some(point.clone());
        debug!(
            "Subscriber {} attached to {} (seq {})",
            self.inner.id,
            point.name(),
            initial
        );
    }
}

impl<C: ValueCodec> Clone for Subscriber<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: ValueCodec> fmt::Debug for Subscriber<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.inner.id)
            .field("attached", &self.is_attached())
            .finish()
    }
}
