//! Read-modify-write.
//!
//! The callback runs with the database lock held, so the read, the
//! modification and the resulting notification form one atomic step with
//! respect to every other operation on the database. The callback must not
//! call back into the same database.

use crate::codec::{encode_to_vec, Numeric, NumericPrimitive, ValueCodec};
use crate::database::{PointId, Registry};
use crate::point::{ModelPoint, PointRef};
use crate::sequence::{LockRequest, SequenceNumber, Validity};

/// Outcome reported by a read-modify-write callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmwResult {
    /// Leave the point untouched. No sequence bump, no notification.
    NoChange,
    /// Commit the modified value and mark the point valid.
    Changed,
    /// Mark the point invalid with the default reason.
    Invalidate,
}

impl Registry {
    fn read_modify_write<F>(
        &mut self,
        id: PointId,
        invalid: Validity,
        lock: LockRequest,
        callback: F,
    ) -> SequenceNumber
    where
        F: FnOnce(&mut [u8], Validity) -> RmwResult,
    {
        let Some(entry) = self.points.get_mut(&id) else {
            return SequenceNumber::UNKNOWN;
        };
        if !entry.admit(lock) {
            return entry.seq;
        }

        let mut scratch = entry.data.clone();
        match callback(&mut scratch, entry.validity) {
            RmwResult::NoChange => entry.seq,
            RmwResult::Changed => {
                entry.data = scratch;
                entry.validity = Validity::VALID;
                self.bump_and_notify(id)
            }
            RmwResult::Invalidate => {
                entry.validity = invalid;
                self.bump_and_notify(id)
            }
        }
    }
}

impl PointRef {
    /// Read-modify-write on the raw payload bytes.
    ///
    /// The callback sees the stored bytes even when the point is invalid;
    /// its edits are only kept when it returns [`RmwResult::Changed`].
    pub fn read_modify_write_raw<F>(&self, callback: F, lock: LockRequest) -> SequenceNumber
    where
        F: FnOnce(&mut [u8], Validity) -> RmwResult,
    {
        let invalid = self.database().default_invalid();
        self.database()
            .registry()
            .read_modify_write(self.id(), invalid, lock, callback)
    }
}

impl<C: ValueCodec> ModelPoint<C> {
    /// Atomically read, modify and write the point's value.
    ///
    /// The lock request is evaluated first: on a locked point the callback
    /// is not invoked unless `lock` is [`LockRequest::Unlock`].
    pub fn read_modify_write<F>(&self, callback: F, lock: LockRequest) -> SequenceNumber
    where
        F: FnOnce(&mut C::Value, Validity) -> RmwResult,
    {
        let codec = self.codec();
        self.read_modify_write_raw(
            |bytes, validity| {
                let mut value = codec.decode(bytes);
                let result = callback(&mut value, validity);
                if result == RmwResult::Changed {
                    codec.encode(&value, bytes);
                }
                result
            },
            lock,
        )
    }
}

impl<T: NumericPrimitive> ModelPoint<Numeric<T>> {
    /// Atomically add `by`. An invalid point counts from zero.
    pub fn increment(&self, by: T, lock: LockRequest) -> SequenceNumber {
        self.read_modify_write(
            |value, validity| {
                let base = if validity.is_valid() { *value } else { T::zero() };
                *value = base.step_up(by);
                RmwResult::Changed
            },
            lock,
        )
    }

    /// Atomically subtract `by`. An invalid point counts from zero.
    pub fn decrement(&self, by: T, lock: LockRequest) -> SequenceNumber {
        self.read_modify_write(
            |value, validity| {
                let base = if validity.is_valid() { *value } else { T::zero() };
                *value = base.step_down(by);
                RmwResult::Changed
            },
            lock,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::ModelDatabase;
    use crate::subscriber::tests::RecordingQueue;
    use crate::subscriber::Subscriber;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::thread;

    fn counter(initial: Option<u32>) -> ModelPoint<Numeric<u32>> {
        ModelDatabase::new()
            .create("COUNTER", Numeric::new(), initial)
            .unwrap()
    }

    #[test]
    fn test_no_change_never_bumps() {
        let point = counter(Some(5));
        let queue = RecordingQueue::default();
        let subscriber = Subscriber::new(queue.clone(), |_: &ModelPoint<Numeric<u32>>, _: &Subscriber<Numeric<u32>>| {});
        point.attach(&subscriber, point.sequence_number());

        let seq = point.sequence_number();
        let result = point.read_modify_write(
            |value, validity| {
                assert!(validity.is_valid());
                *value = 99;
                RmwResult::NoChange
            },
            LockRequest::None,
        );
        assert_eq!(result, seq);
        assert_eq!(point.value(), Some(5));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_changed_bumps_exactly_once() {
        let point = counter(Some(5));
        let queue = RecordingQueue::default();
        let subscriber = Subscriber::new(queue.clone(), |_: &ModelPoint<Numeric<u32>>, _: &Subscriber<Numeric<u32>>| {});
        point.attach(&subscriber, point.sequence_number());

        let seq = point.sequence_number();
        // Even an unmodified value counts as a change when reported so
        let result = point.read_modify_write(|_, _| RmwResult::Changed, LockRequest::None);
        assert_eq!(result, seq.next());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_invalidate_bumps_exactly_once() {
        let point = counter(None);
        let seq = point.sequence_number();
        let result = point.read_modify_write(|_, _| RmwResult::Invalidate, LockRequest::None);
        assert_eq!(result, seq.next());
        assert_eq!(point.validity(), Validity::INVALID);
    }

    #[test]
    fn test_changed_marks_valid() {
        let point = counter(None);
        point.read_modify_write(
            |value, validity| {
                assert!(!validity.is_valid());
                *value = 12;
                RmwResult::Changed
            },
            LockRequest::Lock,
        );
        assert_eq!(point.value(), Some(12));
        assert!(point.is_locked());
    }

    #[test]
    fn test_locked_point_skips_callback() {
        let point = counter(Some(1));
        point.apply_lock();
        let mut called = false;
        point.read_modify_write(
            |_, _| {
                called = true;
                RmwResult::Changed
            },
            LockRequest::None,
        );
        assert!(!called);

        point.increment(1, LockRequest::Unlock);
        assert_eq!(point.value(), Some(2));
        assert!(!point.is_locked());
    }

    #[test]
    fn test_increment_and_decrement() {
        let point = counter(None);
        point.increment(3, LockRequest::None);
        assert_eq!(point.value(), Some(3));
        point.decrement(1, LockRequest::None);
        assert_eq!(point.value(), Some(2));

        let wrap = ModelDatabase::new()
            .create("WRAP", Numeric::<u8>::new(), Some(0))
            .unwrap();
        wrap.decrement(1, LockRequest::None);
        assert_eq!(wrap.value(), Some(u8::MAX));
    }

    #[test]
    fn test_raw_rmw() {
        let point = counter(Some(0x0102_0304));
        point.read_modify_write_raw(
            |bytes, _| {
                bytes.reverse();
                RmwResult::Changed
            },
            LockRequest::None,
        );
        assert_eq!(point.value(), Some(0x0403_0201));
    }

    #[test]
    fn test_concurrent_increments_sum() {
        let point = counter(Some(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let point = point.clone();
                thread::spawn(move || {
                    for _ in 0..250 {
                        point.increment(1, LockRequest::None);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(point.value(), Some(1000));
        assert_eq!(point.sequence_number().get(), 1001);
    }
}
