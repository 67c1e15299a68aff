//! JSON envelope.
//!
//! Every point renders to, and accepts updates from, one JSON object:
//!
//! ```text
//! { "name": "<point name>",     in/out
//!   "type": "<type name>",      out
//!   "valid": true|false,        in/out
//!   "invalid": <reason>,        in/out (out only while invalid)
//!   "seqnum": <n>,              out
//!   "locked": true|false,       in/out
//!   "val": <payload> }          in/out (out only while valid)
//! ```
//!
//! Terse output drops `type`, `seqnum` and `locked` for invalid points.
//!
//! All JSON text passes through one process-wide workspace buffer guarded by
//! its own lock and bounded by `DatabaseConfig::json_capacity`. The
//! workspace lock is always taken before a database lock.

use parking_lot::{const_mutex, Mutex};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::codec::DynCodec;
use crate::database::{ModelDatabase, PointId, Registry};
use crate::error::{DmError, Result};
use crate::point::PointRef;
use crate::sequence::{LockRequest, SequenceNumber, Validity};

static JSON_WORKSPACE: Mutex<Vec<u8>> = const_mutex(Vec::new());

/// Output options for `to_json`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonOptions {
    /// Always include `type`, `seqnum` and `locked`.
    pub verbose: bool,
    /// Indented, multi-line output.
    pub pretty: bool,
}

impl JsonOptions {
    pub fn verbose() -> Self {
        Self {
            verbose: true,
            pretty: false,
        }
    }
}

/// Result of a successful `ModelDatabase::from_json`.
#[derive(Debug, Clone)]
pub struct JsonUpdate {
    /// The point that was addressed
    pub point: PointRef,
    /// Its sequence number after the update
    pub sequence: SequenceNumber,
}

#[derive(Serialize)]
struct Envelope<'a> {
    name: &'a str,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    type_name: Option<&'a str>,
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    invalid: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seqnum: Option<SequenceNumber>,
    #[serde(skip_serializing_if = "Option::is_none")]
    locked: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    val: Option<Value>,
}

/// A parsed update request, before the point is resolved.
#[derive(Debug)]
struct UpdateRequest<'a> {
    name: &'a str,
    val: Option<&'a Value>,
    /// `Some(0)` asks for the default invalid reason
    invalidate: Option<u8>,
    lock: LockRequest,
}

impl<'a> UpdateRequest<'a> {
    fn parse(doc: &'a Value) -> Result<Self> {
        let name = doc
            .get("name")
            .and_then(Value::as_str)
            .ok_or(DmError::MissingName)?;

        let val = doc.get("val").filter(|v| !v.is_null());

        let mut invalidate = match doc.get("valid") {
            None | Some(Value::Null) => None,
            Some(Value::Bool(true)) => None,
            Some(Value::Bool(false)) => Some(0),
            Some(other) => {
                return Err(DmError::InvalidKey {
                    key: "valid",
                    reason: format!("expected true or false, got {}", other),
                })
            }
        };
        match doc.get("invalid") {
            None | Some(Value::Null) => {}
            Some(other) => {
                let reason = other
                    .as_u64()
                    .and_then(|n| u8::try_from(n).ok())
                    .ok_or_else(|| DmError::InvalidKey {
                        key: "invalid",
                        reason: format!("expected a reason code 0..=255, got {}", other),
                    })?;
                if reason > 0 {
                    invalidate = Some(reason);
                }
            }
        }

        let lock = match doc.get("locked") {
            None | Some(Value::Null) => LockRequest::None,
            Some(Value::Bool(true)) => LockRequest::Lock,
            Some(Value::Bool(false)) => LockRequest::Unlock,
            Some(other) => {
                return Err(DmError::InvalidKey {
                    key: "locked",
                    reason: format!("expected true or false, got {}", other),
                })
            }
        };

        if val.is_none() && invalidate.is_none() && lock == LockRequest::None {
            return Err(DmError::NoAction(name.to_string()));
        }

        Ok(Self {
            name,
            val,
            invalidate,
            lock,
        })
    }
}

impl Registry {
    /// Apply a JSON update in one step: unlock, then value, then
    /// invalidation, then lock. Bumps at most once.
    fn apply_update(
        &mut self,
        id: PointId,
        payload: Option<Vec<u8>>,
        invalidation: Option<Validity>,
        lock: LockRequest,
    ) -> SequenceNumber {
        let Some(entry) = self.points.get_mut(&id) else {
            return SequenceNumber::UNKNOWN;
        };
        if lock == LockRequest::Unlock {
            entry.locked = false;
        }
        if entry.locked {
            return entry.seq;
        }

        let mut changed = false;
        if let Some(bytes) = payload {
            if !entry.validity.is_valid() || entry.data != bytes {
                entry.data = bytes;
                entry.validity = Validity::VALID;
                changed = true;
            }
        }
        if let Some(validity) = invalidation {
            if entry.validity != validity {
                entry.validity = validity;
                changed = true;
            }
        }
        if lock == LockRequest::Lock {
            entry.locked = true;
        }

        if !changed {
            return entry.seq;
        }
        self.bump_and_notify(id)
    }
}

impl ModelDatabase {
    /// Update a point from a JSON request.
    ///
    /// Parsing is all-or-nothing: on error the point is left untouched and
    /// the error's message describes the problem. Writing to a locked point
    /// is not an error; the value part is simply not applied.
    pub fn from_json(self: &Arc<Self>, text: &str) -> Result<JsonUpdate> {
        let mut workspace = JSON_WORKSPACE.lock();
        let capacity = self.config().json_capacity;
        if text.len() > capacity {
            return Err(DmError::JsonTooLarge {
                size: text.len(),
                capacity,
            });
        }
        workspace.clear();
        workspace.extend_from_slice(text.as_bytes());
        let doc: Value = serde_json::from_slice(&workspace)
            .map_err(|e| DmError::MalformedJson(e.to_string()))?;
        let request = UpdateRequest::parse(&doc)?;

        let default_invalid = self.default_invalid();
        let mut registry = self.registry();
        let id = registry
            .id_of(request.name)
            .ok_or_else(|| DmError::NotFound(request.name.to_string()))?;
        let entry = &registry.points[&id];
        let name = entry.name.clone();

        let payload = match request.val {
            Some(val) => Some(entry.codec.payload_from_json(val).map_err(|reason| {
                DmError::BadPayload {
                    name: name.to_string(),
                    reason,
                }
            })?),
            None => None,
        };
        let invalidation = request.invalidate.map(|reason| match reason {
            0 => default_invalid,
            n => Validity::invalid(n),
        });

        let sequence = registry.apply_update(id, payload, invalidation, request.lock);
        drop(registry);

        debug!("JSON update of {} (seq {})", name, sequence);
        Ok(JsonUpdate {
            point: PointRef::new(self.clone(), id, name),
            sequence,
        })
    }

    /// Render the named point.
    pub fn to_json(self: &Arc<Self>, name: &str, options: JsonOptions) -> Result<String> {
        self.lookup(name)
            .ok_or_else(|| DmError::NotFound(name.to_string()))?
            .to_json(options)
    }
}

impl PointRef {
    /// Render the point's current state as a JSON envelope.
    pub fn to_json(&self, options: JsonOptions) -> Result<String> {
        let mut workspace = JSON_WORKSPACE.lock();

        let state = self.with_entry(|entry| {
            (
                entry.codec.clone(),
                entry.validity,
                entry.locked,
                entry.seq,
                entry.validity.is_valid().then(|| entry.data.clone()),
            )
        });
        let (codec, validity, locked, seq, data) = state.ok_or_else(|| self.stale())?;

        let detailed = options.verbose || validity.is_valid();
        let envelope = Envelope {
            name: self.name(),
            type_name: detailed.then(|| codec.type_name()),
            valid: validity.is_valid(),
            invalid: validity.reason(),
            seqnum: detailed.then_some(seq),
            locked: detailed.then_some(locked),
            val: data.map(|bytes| codec.payload_to_json(&bytes)),
        };

        workspace.clear();
        let written = if options.pretty {
            serde_json::to_writer_pretty(&mut *workspace, &envelope)
        } else {
            serde_json::to_writer(&mut *workspace, &envelope)
        };
        written.map_err(|e| DmError::MalformedJson(e.to_string()))?;

        let capacity = self.database().config().json_capacity;
        if workspace.len() > capacity {
            return Err(DmError::JsonTooLarge {
                size: workspace.len(),
                capacity,
            });
        }
        String::from_utf8(workspace.clone()).map_err(|e| DmError::MalformedJson(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Bool, Numeric};
    use crate::config::DatabaseConfig;
    use crate::subscriber::tests::RecordingQueue;
    use crate::subscriber::Subscriber;
    use crate::ModelPoint;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn parse(text: &str) -> Value {
        serde_json::from_str(text).unwrap()
    }

    #[test]
    fn test_write_value_from_json() {
        let db = ModelDatabase::new();
        let apple = db.create("APPLE", Numeric::<u32>::new(), None).unwrap();
        let start = apple.sequence_number();

        let update = db.from_json(r#"{"name":"APPLE","val":1234}"#).unwrap();
        assert_eq!(update.sequence, start.next());
        assert_eq!(update.point, *apple);
        assert_eq!(apple.value(), Some(1234));
    }

    #[test]
    fn test_bad_payload_leaves_point_unchanged() {
        let db = ModelDatabase::new();
        let apple = db.create("APPLE", Numeric::<u32>::new(), None).unwrap();
        let start = apple.sequence_number();

        let err = db.from_json(r#"{"name":"APPLE","val":"abc"}"#).unwrap_err();
        assert!(matches!(err, DmError::BadPayload { .. }));
        assert!(!err.to_string().is_empty());
        assert_eq!(apple.sequence_number(), start);
        assert!(apple.is_not_valid());
    }

    #[test]
    fn test_request_errors() {
        let db = ModelDatabase::new();
        db.create("APPLE", Numeric::<u32>::new(), None).unwrap();

        assert!(matches!(
            db.from_json("{not json").unwrap_err(),
            DmError::MalformedJson(_)
        ));
        assert_eq!(
            db.from_json(r#"{"val":1}"#).unwrap_err(),
            DmError::MissingName
        );
        assert_eq!(
            db.from_json(r#"{"name":7,"val":1}"#).unwrap_err(),
            DmError::MissingName
        );
        assert_eq!(
            db.from_json(r#"{"name":"PEAR","val":1}"#).unwrap_err(),
            DmError::NotFound("PEAR".to_string())
        );
        assert_eq!(
            db.from_json(r#"{"name":"APPLE"}"#).unwrap_err(),
            DmError::NoAction("APPLE".to_string())
        );
        assert!(matches!(
            db.from_json(r#"{"name":"APPLE","locked":"yes"}"#).unwrap_err(),
            DmError::InvalidKey { key: "locked", .. }
        ));
        assert!(matches!(
            db.from_json(r#"{"name":"APPLE","invalid":-1}"#).unwrap_err(),
            DmError::InvalidKey { key: "invalid", .. }
        ));
    }

    #[test]
    fn test_invalidate_from_json() {
        let db = ModelDatabase::new();
        let apple = db.create("APPLE", Numeric::<u32>::new(), Some(5)).unwrap();

        db.from_json(r#"{"name":"APPLE","invalid":42}"#).unwrap();
        assert_eq!(apple.validity().reason(), Some(42));

        db.from_json(r#"{"name":"APPLE","val":6}"#).unwrap();
        db.from_json(r#"{"name":"APPLE","valid":false}"#).unwrap();
        assert_eq!(apple.validity(), Validity::INVALID);
    }

    #[test]
    fn test_locked_point_accepts_lock_only_updates() {
        let db = ModelDatabase::new();
        let apple = db.create("APPLE", Numeric::<u32>::new(), Some(42)).unwrap();

        let locked = db.from_json(r#"{"name":"APPLE","locked":true}"#).unwrap();
        assert!(apple.is_locked());
        assert_eq!(locked.sequence, SequenceNumber::FIRST);

        // Accepted, but the value is not applied
        let ignored = db.from_json(r#"{"name":"APPLE","val":100}"#).unwrap();
        assert_eq!(ignored.sequence, SequenceNumber::FIRST);
        assert_eq!(apple.value(), Some(42));

        let unlocked = db
            .from_json(r#"{"name":"APPLE","val":100,"locked":false}"#)
            .unwrap();
        assert_eq!(unlocked.sequence, SequenceNumber::FIRST.next());
        assert_eq!(apple.value(), Some(100));
        assert!(!apple.is_locked());
    }

    #[test]
    fn test_value_and_invalidation_bump_once() {
        let db = ModelDatabase::new();
        let apple = db.create("APPLE", Numeric::<u32>::new(), Some(1)).unwrap();
        let queue = RecordingQueue::default();
        let subscriber = Subscriber::new(queue.clone(), |_: &ModelPoint<Numeric<u32>>, _: &Subscriber<Numeric<u32>>| {});
        apple.attach(&subscriber, apple.sequence_number());

        let update = db
            .from_json(r#"{"name":"APPLE","val":2,"invalid":3,"locked":true}"#)
            .unwrap();
        assert_eq!(update.sequence, SequenceNumber::FIRST.next());
        assert_eq!(apple.validity().reason(), Some(3));
        assert!(apple.is_locked());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_identical_json_write_is_a_no_op() {
        let db = ModelDatabase::new();
        let apple = db.create("APPLE", Numeric::<u32>::new(), Some(7)).unwrap();
        let update = db.from_json(r#"{"name":"APPLE","val":7}"#).unwrap();
        assert_eq!(update.sequence, SequenceNumber::FIRST);
    }

    #[test]
    fn test_terse_output() {
        let db = ModelDatabase::new();
        let apple = db.create("APPLE", Numeric::<u32>::new(), None).unwrap();
        assert_eq!(
            apple.to_json(JsonOptions::default()).unwrap(),
            r#"{"name":"APPLE","valid":false,"invalid":1}"#
        );

        apple.write(&1234, LockRequest::None);
        assert_eq!(
            apple.to_json(JsonOptions::default()).unwrap(),
            r#"{"name":"APPLE","type":"Uint32","valid":true,"seqnum":2,"locked":false,"val":1234}"#
        );
    }

    #[test]
    fn test_verbose_output() {
        let db = ModelDatabase::new();
        let flag = db.create("FLAG", Bool, None).unwrap();
        flag.apply_lock();
        let text = db.to_json("FLAG", JsonOptions::verbose()).unwrap();
        assert_eq!(
            parse(&text),
            json!({
                "name": "FLAG",
                "type": "Bool",
                "valid": false,
                "invalid": 1,
                "seqnum": 1,
                "locked": true
            })
        );

        let pretty = JsonOptions {
            verbose: true,
            pretty: true,
        };
        assert!(flag.to_json(pretty).unwrap().contains('\n'));
    }

    #[test]
    fn test_hex_output_round_trips() {
        let db = ModelDatabase::new();
        let mask = db.create("MASK", Numeric::<u16>::hex(), Some(0xBEEF)).unwrap();
        let text = mask.to_json(JsonOptions::default()).unwrap();
        assert_eq!(parse(&text)["val"], json!("0xBEEF"));

        db.from_json(r#"{"name":"MASK","val":"0x1F"}"#).unwrap();
        assert_eq!(mask.value(), Some(0x1F));
    }

    #[test]
    fn test_json_capacity() {
        let config = DatabaseConfig {
            json_capacity: 32,
            ..Default::default()
        };
        let db = ModelDatabase::with_config(config);
        let apple = db.create("APPLE", Numeric::<u32>::new(), Some(1)).unwrap();

        let long = format!(r#"{{"name":"APPLE","val":1,"pad":"{}"}}"#, "x".repeat(64));
        assert!(matches!(
            db.from_json(&long).unwrap_err(),
            DmError::JsonTooLarge { capacity: 32, .. }
        ));
        assert!(matches!(
            apple.to_json(JsonOptions::verbose()).unwrap_err(),
            DmError::JsonTooLarge { .. }
        ));
    }

    #[test]
    fn test_unknown_point() {
        let db = ModelDatabase::new();
        assert_eq!(
            db.to_json("NOPE", JsonOptions::default()).unwrap_err(),
            DmError::NotFound("NOPE".to_string())
        );
    }
}
