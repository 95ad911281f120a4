//! Returning isolated granules to ordinary allocation.

use mutex_api::Mutex;

use crate::{
    error::{Corruption, IsolationError, log_corruption},
    frame::{FrameIndex, GranuleIndex, Occupancy},
    free_area::ListKind,
    tag::{OrdinaryClass, TagWriter},
    zone::{LockedZone, Zone, ZoneState},
};

impl<'a, M> LockedZone<'a, M>
where
    M: Mutex<Data = ZoneState> + 'a,
{
    /// Retags `granule` as `class` and hands its free pages back to
    /// ordinary allocation.
    ///
    /// Returns `false` if the granule was not isolated.
    pub(crate) fn restore_granule(
        &mut self,
        granule: GranuleIndex,
        class: OrdinaryClass,
    ) -> Result<bool, IsolationError> {
        if !self.tags.is_populated(granule) || !self.tags.checked_tag(granule)?.is_isolated() {
            return Ok(false);
        }

        let granule_order = self.config.granule_order();
        let start = granule.start(granule_order);
        let mergeable = match self.frame(start).map(|frame| frame.occupancy) {
            Some(Occupancy::FreeHead { order, list, .. })
                if order >= granule_order && order + 1 < self.config.max_order() =>
            {
                if list != ListKind::Isolated {
                    return Err(Corruption::MisfiledBlock { frame: start }.into());
                }
                self.query_buddy(start, order).map(|_| order)
            }
            _ => None,
        };

        let pages = if let Some(order) = mergeable {
            // The whole granule is one free block whose buddy is free; put it
            // back through the merging path so the two coalesce.
            let state = &mut *self.state;
            state.area.remove(&mut state.frames, start)?;
            self.tags
                .restore(&TagWriter::new(&mut *self.state), granule, class)?;
            let head = self.insert_free_block(start, order, true)?;
            log::trace!("granule {granule:#x} merged back into block at {head:#x}");
            1 << order
        } else {
            let extent =
                self.move_free_blocks(granule, ListKind::Isolated, ListKind::Ordinary(class))?;
            self.tags
                .restore(&TagWriter::new(&mut *self.state), granule, class)?;
            extent.pages
        };
        self.state.nr_available += pages;
        log::trace!("granule {granule:#x} restored as {class}: {pages} free pages");
        Ok(true)
    }
}

impl<M> Zone<M>
where
    M: Mutex<Data = ZoneState>,
{
    /// Returns every isolated granule of `start..end` to ordinary
    /// allocation as `class`. Granules that are not isolated are left
    /// alone, so restoring a range twice is the same as restoring it once.
    pub fn restore_range(
        &self,
        start: FrameIndex,
        end: FrameIndex,
        class: OrdinaryClass,
    ) -> Result<(), IsolationError> {
        let restored = self.restore_all_isolated_in(start, end, class)?;
        log::debug!("restored {restored} granules in {start:#x}..{end:#x} as {class}");
        Ok(())
    }

    /// Like [`Zone::restore_range`], returning the number of granules that
    /// were restored.
    pub fn restore_all_isolated_in(
        &self,
        start: FrameIndex,
        end: FrameIndex,
        class: OrdinaryClass,
    ) -> Result<usize, IsolationError> {
        let granules = self.config.granules_in(start, end)?;
        let mut restored = 0;
        for index in granules {
            let mut zone = self.lock();
            if zone
                .restore_granule(GranuleIndex::new(index), class)
                .map_err(log_corruption)?
            {
                restored += 1;
            }
        }
        Ok(restored)
    }
}
