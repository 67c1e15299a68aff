//! Model point handles.
//!
//! [`ModelPoint<C>`] is the typed handle used by application code; it derefs
//! to [`PointRef`], the type-erased handle used for name-based access. Both
//! are cheap to clone: they hold the owning database and the point's
//! identifier, never the data itself.
//!
//! Every operation takes the database lock for its whole duration, so a read
//! never observes a half-applied update.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::codec::{encode_to_vec, DynCodec, ValueCodec};
use crate::database::{ModelDatabase, PointEntry, PointId};
use crate::error::Result;
use crate::sequence::{LockRequest, SequenceNumber, Validity};
use crate::subscriber::Subscriber;

/// A consistent view of a point: value, validity and sequence number taken
/// under one lock hold.
///
/// When the point is invalid `value` holds the codec's default value.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<V> {
    pub value: V,
    pub validity: Validity,
    pub sequence: SequenceNumber,
}

impl<V> Snapshot<V> {
    pub fn is_valid(&self) -> bool {
        self.validity.is_valid()
    }
}

/// Type-erased handle to a registered point.
///
/// A handle whose point has been removed from the database is stale: reads
/// report an invalid default value, writes are ignored and return
/// [`SequenceNumber::UNKNOWN`], and fallible operations fail with
/// `DmError::StaleHandle`.
#[derive(Clone)]
pub struct PointRef {
    db: Arc<ModelDatabase>,
    id: PointId,
    name: Arc<str>,
}

impl PointRef {
    pub(crate) fn new(db: Arc<ModelDatabase>, id: PointId, name: Arc<str>) -> Self {
        Self { db, id, name }
    }

    pub(crate) fn id(&self) -> PointId {
        self.id
    }

    /// Run `f` on the point's state under the database lock.
    pub(crate) fn with_entry<R>(&self, f: impl FnOnce(&PointEntry) -> R) -> Option<R> {
        let registry = self.db.registry();
        registry.points.get(&self.id).map(f)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn database(&self) -> &Arc<ModelDatabase> {
        &self.db
    }

    /// True while the point is still registered.
    pub fn is_registered(&self) -> bool {
        self.with_entry(|_| ()).is_some()
    }

    /// Type name of the point's codec, empty for a stale handle.
    pub fn type_name(&self) -> String {
        self.with_entry(|entry| entry.codec.type_name().to_string())
            .unwrap_or_default()
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.with_entry(|entry| entry.codec.size()).unwrap_or(0)
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.with_entry(|entry| entry.seq)
            .unwrap_or(SequenceNumber::UNKNOWN)
    }

    pub fn validity(&self) -> Validity {
        self.with_entry(|entry| entry.validity)
            .unwrap_or(Validity::INVALID)
    }

    pub fn is_not_valid(&self) -> bool {
        !self.validity().is_valid()
    }

    pub fn is_locked(&self) -> bool {
        self.with_entry(|entry| entry.locked).unwrap_or(false)
    }

    /// Raw payload bytes, the encoded default when invalid.
    pub fn read_bytes(&self) -> Snapshot<Vec<u8>> {
        let snapshot = self.with_entry(|entry| Snapshot {
            value: if entry.validity.is_valid() {
                entry.data.clone()
            } else {
                entry.codec.default_bytes()
            },
            validity: entry.validity,
            sequence: entry.seq,
        });
        snapshot.unwrap_or(Snapshot {
            value: Vec::new(),
            validity: Validity::INVALID,
            sequence: SequenceNumber::UNKNOWN,
        })
    }

    /// Invalidate with the database's default invalid reason.
    pub fn set_invalid(&self, lock: LockRequest) -> SequenceNumber {
        self.set_invalid_state(self.db.config().default_invalid_reason, lock)
    }

    /// Invalidate with an application reason code (0 is coerced to the
    /// default reason). Setting the reason the point already has is a no-op.
    pub fn set_invalid_state(&self, reason: u8, lock: LockRequest) -> SequenceNumber {
        let validity = if reason == 0 {
            self.db.default_invalid()
        } else {
            Validity::invalid(reason)
        };
        self.db
            .registry()
            .set_invalid_state(self.id, validity, lock)
    }

    /// Bump the sequence number and notify subscribers without changing
    /// data or validity.
    pub fn touch(&self) -> SequenceNumber {
        self.db.registry().bump_and_notify(self.id)
    }

    /// Change only the lock flag. Never bumps the sequence number.
    pub fn set_lock_state(&self, lock: LockRequest) -> SequenceNumber {
        self.db.registry().set_lock_state(self.id, lock)
    }

    pub fn apply_lock(&self) -> SequenceNumber {
        self.set_lock_state(LockRequest::Lock)
    }

    pub fn remove_lock(&self) -> SequenceNumber {
        self.set_lock_state(LockRequest::Unlock)
    }

    pub(crate) fn stale(&self) -> crate::error::DmError {
        crate::error::DmError::StaleHandle(self.name.to_string())
    }
}

impl PartialEq for PointRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.db, &other.db) && self.id == other.id
    }
}

impl Eq for PointRef {}

impl fmt::Debug for PointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PointRef")
            .field("name", &self.name)
            .field("id", &self.id)
            .finish()
    }
}

impl fmt::Display for PointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Typed handle to a registered point.
pub struct ModelPoint<C: ValueCodec> {
    point: PointRef,
    codec: Arc<C>,
}

impl<C: ValueCodec> ModelPoint<C> {
    /// Register a new, invalid point in `db`.
    pub fn new(db: &Arc<ModelDatabase>, name: &str, codec: C) -> Result<Self> {
        db.create(name, codec, None)
    }

    /// Register a new point holding `value`.
    pub fn with_value(
        db: &Arc<ModelDatabase>,
        name: &str,
        codec: C,
        value: C::Value,
    ) -> Result<Self> {
        db.create(name, codec, Some(value))
    }

    pub(crate) fn from_parts(point: PointRef, codec: Arc<C>) -> Self {
        Self { point, codec }
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn as_point_ref(&self) -> &PointRef {
        &self.point
    }

    pub fn into_point_ref(self) -> PointRef {
        self.point
    }

    /// Read value, validity and sequence number atomically.
    pub fn read(&self) -> Snapshot<C::Value> {
        let raw = self.point.with_entry(|entry| {
            let data = entry.validity.is_valid().then(|| entry.data.clone());
            (data, entry.validity, entry.seq)
        });
        let (data, validity, sequence) =
            raw.unwrap_or((None, Validity::INVALID, SequenceNumber::UNKNOWN));
        let value = match data {
            Some(bytes) => self.codec.decode(&bytes),
            None => self.codec.default_value(),
        };
        Snapshot {
            value,
            validity,
            sequence,
        }
    }

    /// The current value, `None` when invalid.
    pub fn value(&self) -> Option<C::Value> {
        let snapshot = self.read();
        snapshot.is_valid().then_some(snapshot.value)
    }

    /// Store `value` and mark the point valid.
    ///
    /// Ignored while the point is locked unless `lock` is
    /// [`LockRequest::Unlock`]. Writing the value the point already holds is
    /// a no-op. Returns the resulting sequence number.
    pub fn write(&self, value: &C::Value, lock: LockRequest) -> SequenceNumber {
        let bytes = encode_to_vec(&*self.codec, value);
        self.point
            .database()
            .registry()
            .store(self.point.id(), &bytes, lock)
    }

    /// Subscribe for change notifications.
    ///
    /// If `initial` differs from the point's current sequence number a
    /// notification is scheduled immediately; pass
    /// [`SequenceNumber::UNKNOWN`] to always get one.
    pub fn attach(&self, subscriber: &Subscriber<C>, initial: SequenceNumber) {
        subscriber.bind(self, initial);
    }

    /// Unsubscribe. No-op if `subscriber` is attached elsewhere.
    pub fn detach(&self, subscriber: &Subscriber<C>) {
        let bound_here = subscriber
            .point()
            .map(|p| p.point == self.point)
            .unwrap_or(false);
        if bound_here {
            subscriber.detach();
        }
    }

    /// Read the point and record its sequence number as seen by
    /// `subscriber`, in one lock hold.
    pub fn read_and_sync(&self, subscriber: &Subscriber<C>) -> Snapshot<C::Value> {
        let raw = {
            let mut registry = self.point.database().registry();
            registry.sync_subscriber(subscriber.id(), self.point.id());
            registry.points.get(&self.point.id()).map(|entry| {
                let data = entry.validity.is_valid().then(|| entry.data.clone());
                (data, entry.validity, entry.seq)
            })
        };
        let (data, validity, sequence) =
            raw.unwrap_or((None, Validity::INVALID, SequenceNumber::UNKNOWN));
        let value = match data {
            Some(bytes) => self.codec.decode(&bytes),
            None => self.codec.default_value(),
        };
        Snapshot {
            value,
            validity,
            sequence,
        }
    }
}

impl<C: ValueCodec> Clone for ModelPoint<C> {
    fn clone(&self) -> Self {
        Self {
            point: self.point.clone(),
            codec: self.codec.clone(),
        }
    }
}

impl<C: ValueCodec> Deref for ModelPoint<C> {
    type Target = PointRef;

    fn deref(&self) -> &PointRef {
        &self.point
    }
}

impl<C: ValueCodec> fmt::Debug for ModelPoint<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelPoint")
            .field("name", &self.point.name())
            .field("type", &ValueCodec::type_name(&*self.codec))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Bool, Numeric};
    use pretty_assertions::assert_eq;

    fn apple() -> ModelPoint<Numeric<u32>> {
        ModelPoint::new(&ModelDatabase::new(), "APPLE", Numeric::new()).unwrap()
    }

    #[test]
    fn test_identical_writes_do_not_bump() {
        let point = apple();
        let first = point.write(&42, LockRequest::None);
        let second = point.write(&42, LockRequest::None);
        assert_eq!(first, second);
        assert_eq!(first, SequenceNumber::FIRST.next());
        assert_eq!(point.value(), Some(42));
    }

    #[test]
    fn test_write_to_invalid_point_always_commits() {
        let point = apple();
        // Default bytes equal the written bytes, but the point was invalid
        let seq = point.write(&0, LockRequest::None);
        assert_eq!(seq.get(), 2);
        assert!(!point.is_not_valid());
    }

    #[test]
    fn test_lock_gate() {
        let point = apple();
        point.write(&42, LockRequest::Lock);
        assert!(point.is_locked());
        let seq = point.sequence_number();

        assert_eq!(point.write(&100, LockRequest::None), seq);
        assert_eq!(point.value(), Some(42));

        // A second lock request does not pass a locked point either
        assert_eq!(point.write(&100, LockRequest::Lock), seq);
        assert_eq!(point.value(), Some(42));

        assert_eq!(point.write(&100, LockRequest::Unlock), seq.next());
        assert_eq!(point.value(), Some(100));
        assert!(!point.is_locked());
    }

    #[test]
    fn test_lock_changes_never_bump() {
        let point = apple();
        let seq = point.sequence_number();
        assert_eq!(point.apply_lock(), seq);
        assert!(point.is_locked());
        assert_eq!(point.remove_lock(), seq);
        assert_eq!(point.set_lock_state(LockRequest::None), seq);
        assert!(!point.is_locked());
    }

    #[test]
    fn test_invalidation() {
        let point = ModelPoint::with_value(&ModelDatabase::new(), "PEAR", Numeric::<i32>::new(), 5)
            .unwrap();
        let seq = point.set_invalid(LockRequest::None);
        assert_eq!(seq.get(), 2);
        assert_eq!(point.validity(), Validity::INVALID);
        assert_eq!(point.read().value, 0);
        assert_eq!(point.value(), None);

        // Same reason again is a no-op, a new reason is a change
        assert_eq!(point.set_invalid_state(1, LockRequest::None), seq);
        assert_eq!(point.set_invalid_state(0, LockRequest::None), seq);
        assert_eq!(point.set_invalid_state(22, LockRequest::None), seq.next());
        assert_eq!(point.validity().reason(), Some(22));
    }

    #[test]
    fn test_invalidation_honours_lock() {
        let point = apple();
        point.write(&1, LockRequest::Lock);
        let seq = point.set_invalid(LockRequest::None);
        assert!(!point.is_not_valid());
        assert_eq!(point.set_invalid(LockRequest::Unlock), seq.next());
        assert!(point.is_not_valid());
    }

    #[test]
    fn test_touch_always_bumps() {
        let point = apple();
        let before = point.read();
        let seq = point.touch();
        assert_eq!(seq, before.sequence.next());
        let after = point.read();
        assert_eq!(after.value, before.value);
        assert_eq!(after.validity, before.validity);
    }

    #[test]
    fn test_read_bytes() {
        let db = ModelDatabase::new();
        let flag = ModelPoint::with_value(&db, "FLAG", Bool, true).unwrap();
        assert_eq!(flag.read_bytes().value, vec![1]);
        flag.set_invalid(LockRequest::None);
        assert_eq!(flag.read_bytes().value, vec![0]);
        assert_eq!(flag.size(), 1);
        assert_eq!(flag.type_name(), "Bool");
    }
}
