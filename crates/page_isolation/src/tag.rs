//! Granule tag table.
//!
//! Every granule carries a [`Tag`]. Tags are stored as bytes in atomics so
//! that the verifier's advisory pass can read them without the zone lock;
//! they are only ever written while the lock is held. Writers take a
//! [`TagWriter`], which borrows the lock-guarded zone state.

use alloc::{boxed::Box, vec::Vec};
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use strum::{Display, EnumCount, EnumIter, FromRepr};

use crate::{
    error::{Corruption, IsolationError},
    frame::GranuleIndex,
    zone::ZoneState,
};

/// Migration classes a granule can carry while it takes part in ordinary
/// allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumCount, EnumIter, FromRepr)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum OrdinaryClass {
    Unmovable = 0,
    Movable = 1,
    Reclaimable = 2,
    /// Reserved for contiguous allocations; only movable occupants.
    Cma = 3,
}

impl OrdinaryClass {
    /// Classes whose free lists an allocation of this class may use once
    /// its own lists are empty, in preference order.
    #[must_use]
    pub const fn fallbacks(self) -> &'static [Self] {
        match self {
            Self::Unmovable => &[Self::Reclaimable, Self::Movable],
            Self::Movable => &[Self::Cma, Self::Reclaimable, Self::Unmovable],
            Self::Reclaimable => &[Self::Unmovable, Self::Movable],
            Self::Cma => &[],
        }
    }
}

/// Migration tag of a granule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Ordinary(OrdinaryClass),
    /// Removed from ordinary allocation; `prior` is the class it had.
    Isolated { prior: OrdinaryClass },
}

const ISOLATED_BIT: u8 = 0x80;

impl Tag {
    #[must_use]
    pub const fn is_isolated(self) -> bool {
        matches!(self, Self::Isolated { .. })
    }

    fn encode(self) -> u8 {
        match self {
            Self::Ordinary(class) => class as u8,
            Self::Isolated { prior } => ISOLATED_BIT | prior as u8,
        }
    }

    fn decode(raw: u8) -> Option<Self> {
        let class = OrdinaryClass::from_repr(raw & !ISOLATED_BIT)?;
        Some(if raw & ISOLATED_BIT == 0 {
            Self::Ordinary(class)
        } else {
            Self::Isolated { prior: class }
        })
    }
}

/// Write access to a [`GranuleTagTable`].
///
/// Built from an exclusive borrow of the zone state, which is only reachable
/// through a held zone lock.
pub(crate) struct TagWriter<'g> {
    _state: &'g mut ZoneState,
}

impl<'g> TagWriter<'g> {
    pub(crate) fn new(state: &'g mut ZoneState) -> Self {
        Self { _state: state }
    }
}

/// Tags of every granule in a zone, plus the zone's isolated-granule count.
#[derive(Debug)]
pub(crate) struct GranuleTagTable {
    first: GranuleIndex,
    granule_order: u8,
    tags: Box<[AtomicU8]>,
    /// `false` for granules made up entirely of holes. Fixed at creation.
    populated: Box<[bool]>,
    isolated: AtomicUsize,
}

impl GranuleTagTable {
    pub(crate) fn new(
        first: GranuleIndex,
        granule_order: u8,
        populated: Vec<bool>,
        class: OrdinaryClass,
    ) -> Self {
        let raw = Tag::Ordinary(class).encode();
        let tags = populated.iter().map(|_| AtomicU8::new(raw)).collect();
        Self {
            first,
            granule_order,
            tags,
            populated: populated.into_boxed_slice(),
            isolated: AtomicUsize::new(0),
        }
    }

    fn slot(&self, granule: GranuleIndex) -> Option<usize> {
        let slot = granule.get().checked_sub(self.first.get())?;
        (slot < self.tags.len()).then_some(slot)
    }

    /// Returns the tag of `granule`, or `None` if it is outside the zone.
    ///
    /// Only consistent with free-list state while the zone lock is held.
    pub(crate) fn tag_of(&self, granule: GranuleIndex) -> Option<Tag> {
        let raw = self.tags[self.slot(granule)?].load(Ordering::Acquire);
        Tag::decode(raw)
    }

    /// Returns `false` if no frame of `granule` is backed by memory.
    pub(crate) fn is_populated(&self, granule: GranuleIndex) -> bool {
        self.slot(granule).is_some_and(|slot| self.populated[slot])
    }

    pub(crate) fn isolated_count(&self) -> usize {
        self.isolated.load(Ordering::Relaxed)
    }

    fn cell(&self, granule: GranuleIndex) -> Result<&AtomicU8, Corruption> {
        self.slot(granule)
            .map(|slot| &self.tags[slot])
            .ok_or(Corruption::FrameOutOfZone {
                frame: granule.start(self.granule_order),
            })
    }

    pub(crate) fn checked_tag(&self, granule: GranuleIndex) -> Result<Tag, Corruption> {
        let raw = self.cell(granule)?.load(Ordering::Acquire);
        Tag::decode(raw).ok_or(Corruption::BadTag { granule })
    }

    /// Marks `granule` isolated, remembering its current class.
    pub(crate) fn set_isolated(
        &self,
        _writer: &TagWriter<'_>,
        granule: GranuleIndex,
    ) -> Result<(), IsolationError> {
        let cell = self.cell(granule)?;
        let prior = match self.checked_tag(granule)? {
            Tag::Ordinary(class) => class,
            Tag::Isolated { .. } => return Err(IsolationError::AlreadyIsolated { granule }),
        };
        cell.store(Tag::Isolated { prior }.encode(), Ordering::Release);
        self.isolated.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Returns `granule` to ordinary allocation as `class` and yields the
    /// class it had before isolation.
    pub(crate) fn restore(
        &self,
        _writer: &TagWriter<'_>,
        granule: GranuleIndex,
        class: OrdinaryClass,
    ) -> Result<OrdinaryClass, IsolationError> {
        let cell = self.cell(granule)?;
        let Tag::Isolated { prior } = self.checked_tag(granule)? else {
            return Err(IsolationError::NotIsolated {
                frame: granule.start(self.granule_order),
            });
        };
        if self.isolated.load(Ordering::Relaxed) == 0 {
            return Err(Corruption::IsolatedCountMismatch { granule }.into());
        }
        cell.store(Tag::Ordinary(class).encode(), Ordering::Release);
        self.isolated.fetch_sub(1, Ordering::Relaxed);
        Ok(prior)
    }
}
