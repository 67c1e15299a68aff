//! Binary export/import.
//!
//! A point's external form is fixed per type and carries no type tag:
//!
//! ```text
//! [validity code: 1][lock flag: 1, only when requested][payload: size()]
//! ```
//!
//! The payload bytes are copied as stored, including while the point is
//! invalid. Import replaces the whole state and always counts as a change.

use crate::error::{DmError, Result};
use crate::point::PointRef;
use crate::sequence::{SequenceNumber, Validity};

fn external_size_for(payload: usize, include_lock: bool) -> usize {
    1 + usize::from(include_lock) + payload
}

impl PointRef {
    /// Number of bytes `export_data` writes and `import_data` consumes.
    pub fn external_size(&self, include_lock: bool) -> usize {
        external_size_for(self.size(), include_lock)
    }

    /// Write the point's state to the front of `dst`.
    ///
    /// Returns the number of bytes written and the sequence number of the
    /// exported state.
    pub fn export_data(&self, dst: &mut [u8], include_lock: bool) -> Result<(usize, SequenceNumber)> {
        let registry = self.database().registry();
        let entry = registry.points.get(&self.id()).ok_or_else(|| self.stale())?;

        let needed = external_size_for(entry.data.len(), include_lock);
        if dst.len() < needed {
            return Err(DmError::BufferTooSmall {
                needed,
                available: dst.len(),
            });
        }

        dst[0] = entry.validity.code();
        let mut offset = 1;
        if include_lock {
            dst[offset] = u8::from(entry.locked);
            offset += 1;
        }
        dst[offset..needed].copy_from_slice(&entry.data);
        Ok((needed, entry.seq))
    }

    /// Replace the point's state from the front of `src`.
    ///
    /// The lock gate does not apply: import overwrites a locked point, and
    /// with `include_lock` also sets its lock flag. Always bumps the sequence
    /// number and notifies subscribers. Returns the number of bytes consumed
    /// and the new sequence number.
    pub fn import_data(&self, src: &[u8], include_lock: bool) -> Result<(usize, SequenceNumber)> {
        let mut registry = self.database().registry();
        let entry = registry
            .points
            .get_mut(&self.id())
            .ok_or_else(|| self.stale())?;

        let needed = external_size_for(entry.data.len(), include_lock);
        if src.len() < needed {
            return Err(DmError::BufferTooSmall {
                needed,
                available: src.len(),
            });
        }

        entry.validity = Validity::from_code(src[0]);
        let mut offset = 1;
        if include_lock {
            entry.locked = src[offset] != 0;
            offset += 1;
        }
        entry.data.copy_from_slice(&src[offset..needed]);
        let seq = registry.bump_and_notify(self.id());
        Ok((needed, seq))
    }
}
