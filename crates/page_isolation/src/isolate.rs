//! Isolation transactions.
//!
//! A range is isolated one granule at a time, each under its own
//! acquisition of the zone lock. If any granule cannot be isolated, the
//! granules this call already isolated are restored to the class they had
//! before, so a failed call leaves nothing isolated behind.

use core::ops::Range;

use bitflags::bitflags;
use mutex_api::Mutex;

use crate::{
    error::{IsolationError, log_corruption},
    frame::{Frame, FrameFlags, FrameIndex, GranuleIndex, Occupancy},
    free_area::ListKind,
    tag::{OrdinaryClass, Tag, TagWriter},
    zone::{LockedZone, Zone, ZoneKind, ZoneState},
};

bitflags! {
    /// Policy flags of an isolation request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IsolationFlags: u8 {
        /// The range is about to be taken offline. Poisoned frames, and
        /// offline frames nobody references, do not block it.
        const MEMORY_OFFLINE = 0x01;
        /// Log the descriptor of the frame that blocks isolation.
        const REPORT_FAILURE = 0x02;
    }
}

/// A request to isolate the granules covering `start..end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsolationRange {
    pub start: FrameIndex,
    pub end: FrameIndex,
    /// Class the caller intends to restore the range as.
    pub fallback: OrdinaryClass,
    pub flags: IsolationFlags,
}

impl IsolationRange {
    #[must_use]
    pub const fn new(start: FrameIndex, end: FrameIndex, fallback: OrdinaryClass) -> Self {
        Self {
            start,
            end,
            fallback,
            flags: IsolationFlags::empty(),
        }
    }

    #[must_use]
    pub const fn with_flags(mut self, flags: IsolationFlags) -> Self {
        self.flags = flags;
        self
    }
}

impl<'a, M> LockedZone<'a, M>
where
    M: Mutex<Data = ZoneState> + 'a,
{
    /// Finds a frame of `granule` whose occupant cannot be moved out of the
    /// way.
    fn find_unmovable(
        &self,
        granule: GranuleIndex,
        range: &IsolationRange,
    ) -> Option<(FrameIndex, Frame)> {
        if self.config.kind() == ZoneKind::Movable {
            return None;
        }
        if range.fallback == OrdinaryClass::Cma
            && self.tags.tag_of(granule) == Some(Tag::Ordinary(OrdinaryClass::Cma))
        {
            return None;
        }

        let granule_order = self.config.granule_order();
        let end = granule.end(granule_order);
        let mut pfn = granule.start(granule_order);
        while pfn < end {
            let frame = *self.frame(pfn)?;
            match frame.occupancy {
                Occupancy::Absent => {}
                Occupancy::FreeHead { order, .. } => {
                    pfn = pfn.offset(1 << order);
                    continue;
                }
                Occupancy::FreeTail { head } => {
                    pfn = self
                        .frame(head)
                        .and_then(Frame::buddy_order)
                        .map_or(pfn.offset(1), |order| head.offset(1 << order));
                    continue;
                }
                Occupancy::Detached | Occupancy::Allocated => {
                    if frame.flags.contains(FrameFlags::RESERVED) {
                        return Some((pfn, frame));
                    }
                    let exempt = frame.refcount == 0
                        || frame.flags.contains(FrameFlags::MOVABLE)
                        || (range.flags.contains(IsolationFlags::MEMORY_OFFLINE)
                            && frame
                                .flags
                                .intersects(FrameFlags::POISONED | FrameFlags::OFFLINE));
                    if !exempt {
                        return Some((pfn, frame));
                    }
                }
            }
            pfn = pfn.offset(1);
        }
        None
    }

    /// Takes the free pages of `granule` away from ordinary allocation and
    /// tags it isolated.
    fn isolate_granule(&mut self, granule: GranuleIndex) -> Result<(), IsolationError> {
        let Tag::Ordinary(prior) = self.tags.checked_tag(granule)? else {
            return Err(IsolationError::AlreadyIsolated { granule });
        };
        let extent = self.remove_from_free_list(granule, ListKind::Ordinary(prior))?;
        self.tags
            .set_isolated(&TagWriter::new(&mut *self.state), granule)?;
        self.state.nr_available -= extent.pages;
        log::trace!(
            "granule {granule:#x} isolated from {prior}: {} free pages in {} blocks",
            extent.pages,
            extent.blocks
        );
        Ok(())
    }
}

impl<M> Zone<M>
where
    M: Mutex<Data = ZoneState>,
{
    /// Removes every granule of `range` from ordinary allocation.
    ///
    /// Either all populated granules of the range end up isolated, or none
    /// of those this call touched do.
    pub fn isolate_range(&self, range: &IsolationRange) -> Result<(), IsolationError> {
        let granules = self.config.granules_in(range.start, range.end)?;
        for index in granules.clone() {
            if let Err(err) = self.isolate_one(GranuleIndex::new(index), range) {
                self.undo_isolation(granules.start..index)?;
                return Err(log_corruption(err));
            }
        }
        log::debug!("isolated frames {:#x}..{:#x}", range.start, range.end);
        Ok(())
    }

    fn isolate_one(&self, granule: GranuleIndex, range: &IsolationRange) -> Result<(), IsolationError> {
        if !self.tags.is_populated(granule) {
            return Ok(());
        }
        let mut zone = self.lock();
        if zone.tags.checked_tag(granule)?.is_isolated() {
            return Err(IsolationError::AlreadyIsolated { granule });
        }
        if let Some((pfn, frame)) = zone.find_unmovable(granule, range) {
            drop(zone);
            if range.flags.contains(IsolationFlags::REPORT_FAILURE) {
                log::warn!("frame {pfn:#x} blocks isolation of granule {granule:#x}: {frame:?}");
            }
            return Err(IsolationError::Busy { frame: pfn });
        }
        zone.isolate_granule(granule)
    }

    /// Restores the granules of `granules` to the class recorded when they
    /// were isolated.
    fn undo_isolation(&self, granules: Range<usize>) -> Result<(), IsolationError> {
        for index in granules {
            let granule = GranuleIndex::new(index);
            let mut zone = self.lock();
            let Some(Tag::Isolated { prior }) = zone.tag_of(granule) else {
                continue;
            };
            zone.restore_granule(granule, prior)
                .map_err(log_corruption)?;
        }
        Ok(())
    }
}
