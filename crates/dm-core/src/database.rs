//! The Model Database.
//!
//! A database owns every model point registered into it. Point state lives in
//! a single registry guarded by one coarse mutex; handles ([`PointRef`],
//! [`ModelPoint`]) carry only the database `Arc` and a point identifier.
//! Subscriptions are owned by the same registry, so a state change, the walk
//! over the point's subscribers and the scheduling of their notifications all
//! happen in one lock hold.

use parking_lot::{Mutex, MutexGuard};
use std::any;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

use crate::codec::{encode_to_vec, DynCodec, ValueCodec};
use crate::config::DatabaseConfig;
use crate::error::{DmError, Result};
use crate::point::{ModelPoint, PointRef};
use crate::sequence::{LockRequest, SequenceNumber, Validity};
use crate::subscriber::{SubscriberId, Subscription};

/// Identifier of a point within its database. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct PointId(u64);

/// State of one model point.
pub(crate) struct PointEntry {
    pub(crate) name: Arc<str>,
    pub(crate) codec: Arc<dyn DynCodec>,
    pub(crate) data: Vec<u8>,
    pub(crate) validity: Validity,
    pub(crate) locked: bool,
    pub(crate) seq: SequenceNumber,
    /// Subscribers waiting for the next change (Idle state only)
    pub(crate) subscribers: Vec<SubscriberId>,
}

impl PointEntry {
    /// Apply the lock part of an update request and report whether the
    /// data part may proceed.
    pub(crate) fn admit(&mut self, lock: LockRequest) -> bool {
        match lock {
            LockRequest::Unlock => {
                self.locked = false;
                true
            }
            LockRequest::Lock if self.locked => false,
            LockRequest::Lock => {
                self.locked = true;
                true
            }
            LockRequest::None => !self.locked,
        }
    }
}

/// Everything guarded by the database lock.
#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) points: HashMap<PointId, PointEntry>,
    by_name: HashMap<Arc<str>, PointId>,
    /// Insertion order
    order: Vec<PointId>,
    /// Name order, built on first use and dropped when the point set changes
    sorted: Option<Vec<PointId>>,
    pub(crate) subscriptions: HashMap<SubscriberId, Subscription>,
    next_point: u64,
    pub(crate) next_token: u64,
}

impl Registry {
    fn insert(
        &mut self,
        name: &str,
        codec: Arc<dyn DynCodec>,
        initial: Option<Vec<u8>>,
        invalid: Validity,
    ) -> Result<PointId> {
        if name.is_empty() {
            return Err(DmError::EmptyName);
        }
        if self.by_name.contains_key(name) {
            warn!("Model Point {} is already registered", name);
            return Err(DmError::DuplicateName(name.to_string()));
        }

        self.next_point += 1;
        let id = PointId(self.next_point);
        let name: Arc<str> = Arc::from(name);
        let (data, validity) = match initial {
            Some(bytes) => (bytes, Validity::VALID),
            None => (codec.default_bytes(), invalid),
        };

        debug!(
            "Registered Model Point {} ({}, {})",
            name,
            codec.type_name(),
            validity
        );
        self.points.insert(
            id,
            PointEntry {
                name: name.clone(),
                codec,
                data,
                validity,
                locked: false,
                seq: SequenceNumber::FIRST,
                subscribers: Vec::new(),
            },
        );
        self.by_name.insert(name, id);
        self.order.push(id);
        self.sorted = None;
        Ok(id)
    }

    fn remove(&mut self, name: &str) -> Option<PointId> {
        let id = self.by_name.remove(name)?;
        self.points.remove(&id);
        self.order.retain(|p| *p != id);
        self.sorted = None;
        self.subscriptions.retain(|_, sub| sub.point != id);
        debug!("Removed Model Point {}", name);
        Some(id)
    }

    pub(crate) fn id_of(&self, name: &str) -> Option<PointId> {
        self.by_name.get(name).copied()
    }

    fn ensure_sorted(&mut self) {
        if self.sorted.is_none() {
            let mut ids = self.order.clone();
            ids.sort_by(|a, b| self.points[a].name.cmp(&self.points[b].name));
            self.sorted = Some(ids);
        }
    }

    /// Points in name order.
    fn sorted(&mut self) -> &[PointId] {
        self.ensure_sorted();
        self.sorted.as_deref().unwrap_or(&[])
    }

    /// Advance the sequence number and schedule every idle subscriber.
    pub(crate) fn bump_and_notify(&mut self, id: PointId) -> SequenceNumber {
        let (seq, waiting) = match self.points.get_mut(&id) {
            Some(entry) => {
                entry.seq = entry.seq.next();
                (entry.seq, std::mem::take(&mut entry.subscribers))
            }
            None => return SequenceNumber::UNKNOWN,
        };
        for sid in waiting {
            self.schedule_notification(sid);
        }
        seq
    }

    pub(crate) fn seq_of(&self, id: PointId) -> SequenceNumber {
        self.points
            .get(&id)
            .map(|entry| entry.seq)
            .unwrap_or(SequenceNumber::UNKNOWN)
    }

    pub(crate) fn store(&mut self, id: PointId, bytes: &[u8], lock: LockRequest) -> SequenceNumber {
        let Some(entry) = self.points.get_mut(&id) else {
            return SequenceNumber::UNKNOWN;
        };
        if !entry.admit(lock) {
            return entry.seq;
        }
        if entry.validity.is_valid() && entry.data == bytes {
            return entry.seq;
        }
        entry.data.copy_from_slice(bytes);
        entry.validity = Validity::VALID;
        self.bump_and_notify(id)
    }

    pub(crate) fn set_invalid_state(
        &mut self,
        id: PointId,
        validity: Validity,
        lock: LockRequest,
    ) -> SequenceNumber {
        let Some(entry) = self.points.get_mut(&id) else {
            return SequenceNumber::UNKNOWN;
        };
        if !entry.admit(lock) || entry.validity == validity {
            return entry.seq;
        }
        entry.validity = validity;
        self.bump_and_notify(id)
    }

    pub(crate) fn set_lock_state(&mut self, id: PointId, lock: LockRequest) -> SequenceNumber {
        let Some(entry) = self.points.get_mut(&id) else {
            return SequenceNumber::UNKNOWN;
        };
        match lock {
            LockRequest::Lock => entry.locked = true,
            LockRequest::Unlock => entry.locked = false,
            LockRequest::None => {}
        }
        entry.seq
    }
}

/// A registry of named model points.
///
/// Databases are always shared: constructors return `Arc<ModelDatabase>` and
/// every point handle keeps its database alive.
pub struct ModelDatabase {
    config: DatabaseConfig,
    registry: OnceLock<Mutex<Registry>>,
}

impl ModelDatabase {
    /// Create an empty database with default settings.
    pub fn new() -> Arc<Self> {
        Self::with_config(DatabaseConfig::default())
    }

    pub fn with_config(config: DatabaseConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Lock the registry. The mutex itself is created on first use.
    pub(crate) fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .get_or_init(|| Mutex::new(Registry::default()))
            .lock()
    }

    pub(crate) fn default_invalid(&self) -> Validity {
        Validity::invalid(self.config.default_invalid_reason)
    }

    /// Register a new point.
    ///
    /// With `initial` set the point starts valid holding that value; otherwise
    /// it starts invalid with the configured default reason. Either way its
    /// sequence number starts at [`SequenceNumber::FIRST`].
    pub fn create<C: ValueCodec>(
        self: &Arc<Self>,
        name: &str,
        codec: C,
        initial: Option<C::Value>,
    ) -> Result<ModelPoint<C>> {
        let codec = Arc::new(codec);
        let initial = initial.map(|value| encode_to_vec(&*codec, &value));
        let erased: Arc<dyn DynCodec> = codec.clone();
        let invalid = self.default_invalid();

        let id = self.registry().insert(name, erased, initial, invalid)?;
        let point = PointRef::new(self.clone(), id, Arc::from(name));
        Ok(ModelPoint::from_parts(point, codec))
    }

    /// Unregister a point. Outstanding handles become stale and its
    /// subscriptions are dropped without a final notification.
    pub fn remove(&self, name: &str) -> bool {
        self.registry().remove(name).is_some()
    }

    /// Find a point by exact name.
    pub fn lookup(self: &Arc<Self>, name: &str) -> Option<PointRef> {
        let registry = self.registry();
        let id = registry.id_of(name)?;
        let name = registry.points[&id].name.clone();
        Some(PointRef::new(self.clone(), id, name))
    }

    /// Find a point by name and recover its typed handle.
    pub fn lookup_typed<C: ValueCodec>(self: &Arc<Self>, name: &str) -> Result<ModelPoint<C>> {
        let (id, name, codec) = {
            let registry = self.registry();
            let id = registry
                .id_of(name)
                .ok_or_else(|| DmError::NotFound(name.to_string()))?;
            let entry = &registry.points[&id];
            (id, entry.name.clone(), entry.codec.clone())
        };

        let actual = codec.type_name().to_string();
        match codec.into_any().downcast::<C>() {
            Ok(codec) => Ok(ModelPoint::from_parts(
                PointRef::new(self.clone(), id, name),
                codec,
            )),
            Err(_) => Err(DmError::TypeMismatch {
                name: name.to_string(),
                expected: any::type_name::<C>().to_string(),
                actual,
            }),
        }
    }

    /// First point in name order.
    pub fn first_by_name(self: &Arc<Self>) -> Option<PointRef> {
        let mut registry = self.registry();
        let id = *registry.sorted().first()?;
        let name = registry.points[&id].name.clone();
        Some(PointRef::new(self.clone(), id, name))
    }

    /// The point following `current` in name order.
    ///
    /// `current` may have been removed since it was obtained; iteration
    /// continues with the next remaining name.
    pub fn next_by_name(self: &Arc<Self>, current: &PointRef) -> Option<PointRef> {
        let mut registry = self.registry();
        registry.ensure_sorted();
        let ids = registry.sorted.as_deref().unwrap_or(&[]);
        let index = match ids.binary_search_by(|id| (*registry.points[id].name).cmp(current.name())) {
            Ok(i) => i + 1,
            Err(i) => i,
        };
        let id = *ids.get(index)?;
        let name = registry.points[&id].name.clone();
        Some(PointRef::new(self.clone(), id, name))
    }

    /// Names of all points in insertion order.
    pub fn names(&self) -> Vec<String> {
        let registry = self.registry();
        registry
            .order
            .iter()
            .map(|id| registry.points[id].name.to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.registry().points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ModelDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelDatabase")
            .field("config", &self.config)
            .field("points", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Bool, Numeric};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_create_and_lookup() {
        let db = ModelDatabase::new();
        let apple = db.create("APPLE", Numeric::<u32>::new(), None).unwrap();
        assert_eq!(db.len(), 1);
        assert!(apple.is_not_valid());
        assert_eq!(apple.sequence_number(), SequenceNumber::FIRST);

        let found = db.lookup("APPLE").unwrap();
        assert_eq!(found, *apple);
        assert_eq!(found.type_name(), "Uint32");
        assert!(db.lookup("apple").is_none());
    }

    #[test]
    fn test_duplicate_and_empty_names() {
        let db = ModelDatabase::new();
        db.create("APPLE", Bool, None).unwrap();
        let err = db.create("APPLE", Bool, Some(true)).unwrap_err();
        assert_eq!(err, DmError::DuplicateName("APPLE".to_string()));
        assert_eq!(db.create("", Bool, None).unwrap_err(), DmError::EmptyName);
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn test_initial_value_is_valid() {
        let db = ModelDatabase::new();
        let point = db.create("ORANGE", Numeric::<i16>::new(), Some(-7)).unwrap();
        let snapshot = point.read();
        assert_eq!(snapshot.value, -7);
        assert!(snapshot.validity.is_valid());
        assert_eq!(snapshot.sequence, SequenceNumber::FIRST);
    }

    #[test]
    fn test_configured_invalid_reason() {
        let config = DatabaseConfig {
            default_invalid_reason: 9,
            ..Default::default()
        };
        let db = ModelDatabase::with_config(config);
        let point = db.create("PEAR", Bool, None).unwrap();
        assert_eq!(point.validity().reason(), Some(9));
    }

    #[test]
    fn test_iterate_by_name() {
        let db = ModelDatabase::new();
        for name in ["cherry", "apple", "banana"] {
            db.create(name, Bool, None).unwrap();
        }
        assert_eq!(db.names(), vec!["cherry", "apple", "banana"]);

        let mut seen = Vec::new();
        let mut current = db.first_by_name();
        while let Some(point) = current {
            seen.push(point.name().to_string());
            current = db.next_by_name(&point);
        }
        assert_eq!(seen, vec!["apple", "banana", "cherry"]);
    }

    #[test]
    fn test_iteration_survives_removal() {
        let db = ModelDatabase::new();
        for name in ["a", "b", "c"] {
            db.create(name, Bool, None).unwrap();
        }
        let b = db.lookup("b").unwrap();
        assert!(db.remove("b"));
        assert!(!db.remove("b"));
        assert_eq!(db.next_by_name(&b).unwrap().name(), "c");
        assert_eq!(db.names(), vec!["a", "c"]);
    }

    #[test]
    fn test_removed_handle_is_stale() {
        let db = ModelDatabase::new();
        let point = db.create("KIWI", Numeric::<u8>::new(), Some(3)).unwrap();
        db.remove("KIWI");
        assert!(point.is_not_valid());
        assert_eq!(point.write(&4, LockRequest::None), SequenceNumber::UNKNOWN);
        assert_eq!(point.read().value, 0);

        // A new point under the same name is a different point
        let again = db.create("KIWI", Numeric::<u8>::new(), Some(5)).unwrap();
        assert_ne!(*again, *point);
        assert_eq!(again.read().value, 5);
    }

    #[test]
    fn test_lookup_typed() {
        let db = ModelDatabase::new();
        db.create("APPLE", Numeric::<u32>::new(), Some(12)).unwrap();

        let typed = db.lookup_typed::<Numeric<u32>>("APPLE").unwrap();
        assert_eq!(typed.read().value, 12);

        let err = db.lookup_typed::<Bool>("APPLE").unwrap_err();
        assert!(matches!(err, DmError::TypeMismatch { ref actual, .. } if actual == "Uint32"));
        assert_eq!(
            db.lookup_typed::<Bool>("NOPE").unwrap_err(),
            DmError::NotFound("NOPE".to_string())
        );
    }
}
