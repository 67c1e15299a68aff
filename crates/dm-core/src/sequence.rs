//! Sequence numbers, validity codes and lock requests.
//!
//! These are the small value types every model point carries alongside its
//! data: a monotonic change counter, a valid/invalid-with-reason flag and the
//! lock request that accompanies each update.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-point change counter.
///
/// The value `0` is reserved as [`SequenceNumber::UNKNOWN`] and is never held
/// by a model point; subscribers use it to request an immediate notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceNumber(u16);

impl SequenceNumber {
    /// Magic value for "I do not know the point's current sequence number".
    pub const UNKNOWN: SequenceNumber = SequenceNumber(0);

    /// Sequence number of a freshly created point.
    pub const FIRST: SequenceNumber = SequenceNumber(1);

    /// Wrap a raw counter value.
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    /// Get the raw counter value.
    pub const fn get(self) -> u16 {
        self.0
    }

    /// Returns true for [`SequenceNumber::UNKNOWN`].
    pub const fn is_unknown(self) -> bool {
        self.0 == 0
    }

    /// The next sequence number. Rolls over past `u16::MAX`, skipping `UNKNOWN`.
    pub fn next(self) -> Self {
        match self.0.wrapping_add(1) {
            0 => Self::FIRST,
            n => Self(n),
        }
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Valid/invalid state of a model point.
///
/// One code is reserved for "valid"; every other code is an
/// application-chosen reason for the point being invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Validity(u8);

impl Validity {
    /// The point holds a valid value.
    pub const VALID: Validity = Validity(0);

    /// Default invalid reason.
    pub const INVALID: Validity = Validity(1);

    /// Invalid with an application reason code. A reason of `0` would mean
    /// "valid", so it is coerced to the default invalid reason.
    pub const fn invalid(reason: u8) -> Self {
        if reason == 0 {
            Self::INVALID
        } else {
            Self(reason)
        }
    }

    /// Rebuild a validity from its wire code (export/import layout).
    pub const fn from_code(code: u8) -> Self {
        Self(code)
    }

    /// The wire code.
    pub const fn code(self) -> u8 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 == 0
    }

    /// The invalid reason, or `None` when valid.
    pub const fn reason(self) -> Option<u8> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0)
        }
    }
}

impl Default for Validity {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for Validity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason() {
            None => write!(f, "valid"),
            Some(reason) => write!(f, "invalid({})", reason),
        }
    }
}

/// Lock change requested together with an update.
///
/// A locked point silently ignores data updates until it is unlocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockRequest {
    /// Leave the lock state alone. The update is dropped if the point is locked.
    #[default]
    None,
    /// Lock the point as part of the update. Dropped if already locked.
    Lock,
    /// Unlock the point first, then apply the update.
    Unlock,
}
