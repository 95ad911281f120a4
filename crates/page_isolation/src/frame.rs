//! Frame descriptors and the per-zone frame directory.

use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;

use crate::free_area::ListKind;

/// Physical frame number.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameIndex(usize);

/// Absolute granule number (`frame number >> granule order`).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GranuleIndex(usize);

impl FrameIndex {
    #[must_use]
    pub const fn new(pfn: usize) -> Self {
        Self(pfn)
    }

    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }

    /// Returns the frame `count` frames above this one.
    #[must_use]
    pub const fn offset(self, count: usize) -> Self {
        Self(self.0 + count)
    }

    /// Returns the granule that contains this frame.
    #[must_use]
    pub const fn granule(self, granule_order: u8) -> GranuleIndex {
        GranuleIndex(self.0 >> granule_order)
    }

    #[must_use]
    pub const fn is_aligned(self, order: u8) -> bool {
        self.0 & ((1 << order) - 1) == 0
    }

    /// Returns the head of the buddy of the `order` block headed by `self`.
    #[must_use]
    pub const fn buddy(self, order: u8) -> Self {
        Self(self.0 ^ (1 << order))
    }
}

impl GranuleIndex {
    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }

    /// Returns the first frame of this granule.
    #[must_use]
    pub const fn start(self, granule_order: u8) -> FrameIndex {
        FrameIndex(self.0 << granule_order)
    }

    /// Returns the frame just past this granule.
    #[must_use]
    pub const fn end(self, granule_order: u8) -> FrameIndex {
        FrameIndex((self.0 + 1) << granule_order)
    }
}

struct Hex(usize);
impl fmt::Debug for Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

macro_rules! impl_fmt {
    ($ty:ident) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.debug_tuple(stringify!($ty)).field(&Hex(self.0)).finish()
            }
        }
        impl fmt::LowerHex for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}
impl_fmt!(FrameIndex);
impl_fmt!(GranuleIndex);

bitflags! {
    /// Per-frame attributes maintained by the owner of the frame.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameFlags: u8 {
        /// The occupant can be migrated elsewhere.
        const MOVABLE = 0x01;
        /// Firmware or early boot owns the frame; it never moves.
        const RESERVED = 0x02;
        /// A hardware error was reported for the frame.
        const POISONED = 0x04;
        /// The owner gave the frame back to the hypervisor or platform.
        const OFFLINE = 0x08;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Link {
    pub(crate) prev: Option<FrameIndex>,
    pub(crate) next: Option<FrameIndex>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Occupancy {
    /// No memory backs this frame number.
    Absent,
    /// First frame of a free block that sits on a free list.
    FreeHead {
        order: u8,
        list: ListKind,
        link: Link,
    },
    /// Non-head frame of a free block.
    FreeTail { head: FrameIndex },
    /// Head of a free block that has been unlinked and is about to be
    /// reinserted or handed out. Never visible outside the zone lock.
    Detached,
    Allocated,
}

/// Descriptor of one physical frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub(crate) occupancy: Occupancy,
    pub(crate) flags: FrameFlags,
    pub(crate) refcount: u32,
}

/// Caller-facing view of a frame's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Absent,
    /// Head of a free block of `2^order` frames.
    Free { order: u8 },
    /// Part of the free block headed by `head`.
    InFreeBlock { head: FrameIndex },
    Allocated { refcount: u32 },
    Poisoned { refcount: u32 },
    Offline { refcount: u32 },
}

impl Frame {
    pub(crate) const ABSENT: Self = Self {
        occupancy: Occupancy::Absent,
        flags: FrameFlags::empty(),
        refcount: 0,
    };

    #[must_use]
    pub fn flags(&self) -> FrameFlags {
        self.flags
    }

    #[must_use]
    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    #[must_use]
    pub fn is_present(&self) -> bool {
        !matches!(self.occupancy, Occupancy::Absent)
    }

    #[must_use]
    pub fn is_free(&self) -> bool {
        matches!(
            self.occupancy,
            Occupancy::FreeHead { .. } | Occupancy::FreeTail { .. }
        )
    }

    /// Order of the free block this frame heads, if it heads one.
    #[must_use]
    pub fn buddy_order(&self) -> Option<u8> {
        match self.occupancy {
            Occupancy::FreeHead { order, .. } => Some(order),
            _ => None,
        }
    }

    #[must_use]
    pub fn state(&self) -> FrameState {
        let refcount = self.refcount;
        match self.occupancy {
            Occupancy::Absent => FrameState::Absent,
            Occupancy::FreeHead { order, .. } => FrameState::Free { order },
            Occupancy::FreeTail { head } => FrameState::InFreeBlock { head },
            Occupancy::Detached | Occupancy::Allocated => {
                if self.flags.contains(FrameFlags::POISONED) {
                    FrameState::Poisoned { refcount }
                } else if self.flags.contains(FrameFlags::OFFLINE) {
                    FrameState::Offline { refcount }
                } else {
                    FrameState::Allocated { refcount }
                }
            }
        }
    }

    pub(crate) fn set_allocated(&mut self, flags: FrameFlags) {
        self.occupancy = Occupancy::Allocated;
        self.flags = flags;
        self.refcount = 1;
    }
}

/// Arena of frame descriptors for one zone, indexed by [`FrameIndex`].
#[derive(Debug)]
pub(crate) struct FrameDirectory {
    base: FrameIndex,
    frames: Vec<Frame>,
}

impl FrameDirectory {
    pub(crate) fn new(base: FrameIndex, count: usize) -> Self {
        let mut frames = Vec::with_capacity(count);
        frames.resize(count, Frame::ABSENT);
        Self { base, frames }
    }

    /// Converts a frame number into an arena slot, checking bounds.
    fn slot(&self, pfn: FrameIndex) -> Option<usize> {
        let slot = pfn.0.checked_sub(self.base.0)?;
        (slot < self.frames.len()).then_some(slot)
    }

    pub(crate) fn get(&self, pfn: FrameIndex) -> Option<&Frame> {
        self.slot(pfn).map(|slot| &self.frames[slot])
    }

    pub(crate) fn get_mut(&mut self, pfn: FrameIndex) -> Option<&mut Frame> {
        self.slot(pfn).map(|slot| &mut self.frames[slot])
    }

    /// Iterates over `(frame number, descriptor)` pairs in address order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (FrameIndex, &Frame)> + '_ {
        self.frames
            .iter()
            .enumerate()
            .map(|(slot, frame)| (self.base.offset(slot), frame))
    }
}
