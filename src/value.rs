// This module defines the value model used by the allocation unit. Every operand
// or result that flows through lowering is a value: an index into the unit's cell
// table, which in turn points at a slot holding the current handle, the data
// format and the lifetime of the value. Two values can be joined by remapping
// their cells onto one shared slot, after which an update through either value is
// visible through both. Lifetimes are position ranges over the unit's instruction
// ordering and are recomputed whenever instructions are reindexed.

//! Values, slots and lifetimes.

use crate::core::format::Format;
use crate::handle::Handle;

/// Identifier of a value. Values index the unit's cell table; two values that
/// have been joined map to the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueId(pub u32);

/// Identifier of a storage slot shared by one or more values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(pub u32);

/// Position value meaning the lifetime endpoint has not been touched.
pub const UNTOUCHED: i32 = -1;

/// Storage and lifetime shared by the values joined onto this slot.
#[derive(Debug, Clone)]
pub struct Slot<'a> {
    pub handle: Handle<'a>,
    pub format: Format,
    /// First position at which the value was used, or `UNTOUCHED`.
    pub start: i32,
    /// Last position at which the value was used, or `UNTOUCHED`.
    pub end: i32,
}

impl<'a> Slot<'a> {
    pub fn new(format: Format) -> Self {
        Self {
            handle: Handle::None,
            format,
            start: UNTOUCHED,
            end: UNTOUCHED,
        }
    }

    /// Record a use of the slot at the given position, extending the
    /// lifetime in both directions.
    pub fn use_at(&mut self, position: i32) {
        if self.start == UNTOUCHED || position < self.start {
            self.start = position;
        }
        if self.end == UNTOUCHED || position > self.end {
            self.end = position;
        }
    }

    /// Forget the recorded lifetime, ahead of a reindex recomputation.
    pub fn reset_lifetime(&mut self) {
        self.start = UNTOUCHED;
        self.end = UNTOUCHED;
    }

    /// Whether the slot no longer needs its storage at the given position.
    /// An untouched slot is always expiring, as is a query at an unknown
    /// position.
    pub fn is_expiring(&self, position: i32) -> bool {
        position == UNTOUCHED || self.end == UNTOUCHED || position >= self.end
    }

    /// Whether the slot is used strictly after the given position.
    pub fn is_used_after(&self, position: i32) -> bool {
        self.end != UNTOUCHED && self.end > position
    }

    /// Whether the lifetime covers the given position.
    pub fn is_valid_at(&self, position: i32) -> bool {
        self.start != UNTOUCHED
            && self.end != UNTOUCHED
            && self.start <= position
            && position <= self.end
    }

    /// Merge another slot's lifetime into this one.
    pub fn merge_lifetime(&mut self, other: &Slot<'a>) {
        if other.start != UNTOUCHED {
            self.use_at(other.start);
        }
        if other.end != UNTOUCHED {
            self.use_at(other.end);
        }
    }
}
