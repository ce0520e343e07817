//! Declared data access and the conflict rule.
//!
//! Work units describe what they touch as a list of [`Dependency`]s: read or
//! write access to one component type within one segment. Two dependency
//! lists [`conflicts`] when running them at the same time could race.

use serde::{Deserialize, Serialize};

use crate::meta::Meta;

/// Access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    /// Access that cannot be described; conflicts with everything.
    Unknown,
    /// Shared access.
    Read,
    /// Exclusive access.
    Write,
}

/// Access to one type in one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dependency {
    /// Access mode.
    pub kind: Kind,
    /// The accessed type; `None` only for [`Kind::Unknown`].
    pub meta: Option<Meta>,
    /// Index of the segment; `None` only for [`Kind::Unknown`].
    pub segment: Option<u32>,
}

impl Dependency {
    /// Opaque access that serializes with everything.
    pub const fn unknown() -> Self {
        Self {
            kind: Kind::Unknown,
            meta: None,
            segment: None,
        }
    }

    /// Shared access to `meta` within `segment`.
    pub const fn read(meta: Meta, segment: u32) -> Self {
        Self {
            kind: Kind::Read,
            meta: Some(meta),
            segment: Some(segment),
        }
    }

    /// Exclusive access to `meta` within `segment`.
    pub const fn write(meta: Meta, segment: u32) -> Self {
        Self {
            kind: Kind::Write,
            meta: Some(meta),
            segment: Some(segment),
        }
    }

    /// Whether these two accesses race.
    #[inline]
    fn overlaps(&self, other: &Dependency) -> bool {
        self.meta == other.meta
            && self.segment == other.segment
            && (self.kind == Kind::Write || other.kind == Kind::Write)
    }
}

/// Whether running `left` and `right` concurrently could race.
///
/// Any [`Kind::Unknown`] on either side is a conflict, even against an empty
/// list. Otherwise it is a conflict iff some pair accesses the same type in
/// the same segment and at least one of them writes.
pub fn conflicts(left: &[Dependency], right: &[Dependency]) -> bool {
    let unknown = |d: &Dependency| d.kind == Kind::Unknown;
    if left.iter().any(unknown) || right.iter().any(unknown) {
        return true;
    }
    left.iter().any(|l| right.iter().any(|r| l.overlaps(r)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
