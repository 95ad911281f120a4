//! Buddy allocator operations on a locked zone.
//!
//! Free blocks live on the list of the granule that holds their head, and a
//! free block never spans an isolated granule and an ordinary one: blocks in
//! isolated granules are capped at the granule order, and ordinary merges
//! never absorb an isolated buddy.

use core::iter;

use mutex_api::Mutex;

use crate::{
    error::{Corruption, IsolationError, Precondition},
    frame::{Frame, FrameFlags, FrameIndex, GranuleIndex, Occupancy},
    free_area::ListKind,
    tag::{OrdinaryClass, Tag},
    zone::{LockedZone, Zone, ZoneState},
};

/// Free frames moved between lists by a bulk move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct FreedExtent {
    pub(crate) pages: usize,
    pub(crate) blocks: usize,
}

impl<'a, M> LockedZone<'a, M>
where
    M: Mutex<Data = ZoneState> + 'a,
{
    pub(crate) fn checked_tag_at(&self, pfn: FrameIndex) -> Result<Tag, Corruption> {
        self.tags.checked_tag(self.granule_of(pfn))
    }

    fn list_kind_at(&self, pfn: FrameIndex) -> Result<ListKind, Corruption> {
        Ok(self.checked_tag_at(pfn)?.into())
    }

    pub(crate) fn frame_mut(&mut self, pfn: FrameIndex) -> Result<&mut Frame, Corruption> {
        self.state
            .frames
            .get_mut(pfn)
            .ok_or(Corruption::FrameOutOfZone { frame: pfn })
    }

    /// Looks up a frame named by a caller.
    fn present_frame(&self, pfn: FrameIndex) -> Result<&Frame, Precondition> {
        let frame = self
            .state
            .frames
            .get(pfn)
            .ok_or(Precondition::OutOfZone { frame: pfn })?;
        if !frame.is_present() {
            return Err(Precondition::Hole { frame: pfn });
        }
        Ok(frame)
    }

    fn take_pages(&mut self, pages: usize, isolated: bool) {
        self.state.nr_free -= pages;
        if !isolated {
            self.state.nr_available -= pages;
        }
    }

    fn give_pages(&mut self, pages: usize, isolated: bool) {
        self.state.nr_free += pages;
        if !isolated {
            self.state.nr_available += pages;
        }
    }

    /// Returns the buddy of the `order` block headed by `pfn` if it can be
    /// merged with it right now.
    ///
    /// The buddy must be inside the zone, present, and the head of a free
    /// block of exactly `order`. Across granules it must also not be
    /// isolated; below the granule order both halves share one granule and
    /// therefore one tag.
    #[must_use]
    pub fn query_buddy(&self, pfn: FrameIndex, order: u8) -> Option<FrameIndex> {
        if order + 1 >= self.config.max_order() || !pfn.is_aligned(order) {
            return None;
        }
        let buddy = pfn.buddy(order);
        let frame = self.state.frames.get(buddy)?;
        if frame.buddy_order() != Some(order) {
            return None;
        }
        if order >= self.config.granule_order()
            && self.tags.tag_of(self.granule_of(buddy))?.is_isolated()
        {
            return None;
        }
        Some(buddy)
    }

    /// Frees the `order` block at `head`, merging it with free buddies, and
    /// returns the head of the block that ends up on a free list.
    ///
    /// Free page counters are left to the caller.
    pub(crate) fn insert_free_block(
        &mut self,
        head: FrameIndex,
        order: u8,
        to_tail: bool,
    ) -> Result<FrameIndex, IsolationError> {
        let limit = if self.checked_tag_at(head)?.is_isolated() {
            self.config.granule_order()
        } else {
            self.config.max_order() - 1
        };

        let mut head = head;
        let mut order = order;
        while order < limit {
            let Some(buddy) = self.query_buddy(head, order) else {
                break;
            };
            let state = &mut *self.state;
            state.area.remove(&mut state.frames, buddy)?;
            head = head.min(buddy);
            order += 1;
        }

        let kind = self.list_kind_at(head)?;
        let state = &mut *self.state;
        state
            .area
            .insert(&mut state.frames, head, order, kind, to_tail)?;
        Ok(head)
    }

    /// Unlinks the free block containing `target` and splits it until
    /// `target` heads a detached block of `target_order`. The other halves go
    /// back on the free lists of their granules.
    ///
    /// Returns `false` without changing anything if `target` is not free.
    fn carve_out(&mut self, target: FrameIndex, target_order: u8) -> Result<bool, IsolationError> {
        let frame = self
            .state
            .frames
            .get(target)
            .ok_or(Corruption::FrameOutOfZone { frame: target })?;
        let mut head = match frame.occupancy {
            Occupancy::FreeHead { .. } => target,
            Occupancy::FreeTail { head } => head,
            _ => return Ok(false),
        };

        let state = &mut *self.state;
        let (mut order, _) = state.area.remove(&mut state.frames, head)?;
        if order < target_order {
            return Err(Corruption::BlockCrossesGranule { frame: head }.into());
        }
        while order > target_order {
            order -= 1;
            let upper = head.offset(1 << order);
            let (keep, spare) = if target >= upper {
                (upper, head)
            } else {
                (head, upper)
            };
            let kind = self.list_kind_at(spare)?;
            let state = &mut *self.state;
            state
                .area
                .insert(&mut state.frames, spare, order, kind, false)?;
            head = keep;
        }
        self.frame_mut(target)?.occupancy = Occupancy::Detached;
        Ok(true)
    }

    /// Splits a free block that covers `granule` and more, so that the
    /// granule's part becomes one block on the `kind` list.
    fn split_straddling(&mut self, granule: GranuleIndex, kind: ListKind) -> Result<(), IsolationError> {
        let granule_order = self.config.granule_order();
        let start = granule.start(granule_order);
        let straddles = match self.frame(start).map(|frame| frame.occupancy) {
            Some(Occupancy::FreeHead { order, .. }) => order > granule_order,
            Some(Occupancy::FreeTail { .. }) => true,
            _ => false,
        };
        if !straddles || !self.carve_out(start, granule_order)? {
            return Ok(());
        }
        let state = &mut *self.state;
        state
            .area
            .insert(&mut state.frames, start, granule_order, kind, false)?;
        Ok(())
    }

    /// Moves every free block of `granule` from the `from` lists to the `to`
    /// lists, keeping each block's order.
    pub(crate) fn move_free_blocks(
        &mut self,
        granule: GranuleIndex,
        from: ListKind,
        to: ListKind,
    ) -> Result<FreedExtent, IsolationError> {
        let granule_order = self.config.granule_order();
        let end = granule.end(granule_order);
        let mut extent = FreedExtent::default();
        let mut pfn = granule.start(granule_order);
        while pfn < end {
            let frame = self
                .state
                .frames
                .get(pfn)
                .ok_or(Corruption::FrameOutOfZone { frame: pfn })?;
            match frame.occupancy {
                Occupancy::FreeHead { order, list, .. } => {
                    let block_end = pfn.offset(1 << order);
                    if block_end > end {
                        return Err(Corruption::BlockCrossesGranule { frame: pfn }.into());
                    }
                    if list != from {
                        return Err(Corruption::MisfiledBlock { frame: pfn }.into());
                    }
                    let state = &mut *self.state;
                    state.area.remove(&mut state.frames, pfn)?;
                    state.area.insert(&mut state.frames, pfn, order, to, true)?;
                    extent.pages += 1 << order;
                    extent.blocks += 1;
                    pfn = block_end;
                }
                Occupancy::FreeTail { .. } => {
                    return Err(Corruption::BlockCrossesGranule { frame: pfn }.into());
                }
                Occupancy::Detached => {
                    return Err(Corruption::BrokenFreeList { frame: pfn }.into());
                }
                Occupancy::Absent | Occupancy::Allocated => pfn = pfn.offset(1),
            }
        }
        Ok(extent)
    }

    /// Takes the free pages of `granule` off the `from` lists and parks them
    /// on the isolated lists. Blocks reaching outside the granule are split
    /// first.
    pub(crate) fn remove_from_free_list(
        &mut self,
        granule: GranuleIndex,
        from: ListKind,
    ) -> Result<FreedExtent, IsolationError> {
        self.split_straddling(granule, from)?;
        self.move_free_blocks(granule, from, ListKind::Isolated)
    }

    /// Finds and unlinks a free block of `order` for an allocation of
    /// `class`. Isolated lists are never searched.
    fn take_block(
        &mut self,
        order: u8,
        class: OrdinaryClass,
    ) -> Result<Option<FrameIndex>, IsolationError> {
        let kinds = iter::once(class)
            .chain(class.fallbacks().iter().copied())
            .map(ListKind::Ordinary);
        for kind in kinds {
            for found in order..self.config.max_order() {
                let Some(head) = self.state.area.first(found, kind) else {
                    continue;
                };
                let state = &mut *self.state;
                state.area.remove(&mut state.frames, head)?;

                let mut split = found;
                while split > order {
                    split -= 1;
                    let spare = head.offset(1 << split);
                    let spare_kind = self.list_kind_at(spare)?;
                    let state = &mut *self.state;
                    state
                        .area
                        .insert(&mut state.frames, spare, split, spare_kind, false)?;
                }
                return Ok(Some(head));
            }
        }
        Ok(None)
    }

    fn mark_allocated(
        &mut self,
        head: FrameIndex,
        order: u8,
        flags: FrameFlags,
    ) -> Result<(), IsolationError> {
        for i in 0..1_usize << order {
            self.frame_mut(head.offset(i))?.set_allocated(flags);
        }
        Ok(())
    }

    /// Frees one block that lies within a single granule.
    fn release_block(&mut self, head: FrameIndex, order: u8) -> Result<(), IsolationError> {
        let isolated = self.checked_tag_at(head)?.is_isolated();
        self.insert_free_block(head, order, false)?;
        self.give_pages(1 << order, isolated);
        Ok(())
    }
}

impl<M> Zone<M>
where
    M: Mutex<Data = ZoneState>,
{
    /// Allocates a block of `2^order` frames for `class`.
    ///
    /// Returns `Ok(None)` if no block is available outside isolated
    /// granules.
    pub fn alloc(
        &self,
        order: u8,
        class: OrdinaryClass,
    ) -> Result<Option<FrameIndex>, IsolationError> {
        if order >= self.config.max_order() {
            return Err(Precondition::BadOrder { order }.into());
        }
        let mut zone = self.lock();
        let Some(head) = zone.take_block(order, class)? else {
            return Ok(None);
        };
        let flags = match class {
            OrdinaryClass::Movable | OrdinaryClass::Cma => FrameFlags::MOVABLE,
            OrdinaryClass::Unmovable | OrdinaryClass::Reclaimable => FrameFlags::empty(),
        };
        zone.mark_allocated(head, order, flags)?;
        zone.take_pages(1 << order, false);
        Ok(Some(head))
    }

    /// Takes the free frame `pfn` off the free lists and hands it to the
    /// caller with `flags`.
    pub fn claim_frame(&self, pfn: FrameIndex, flags: FrameFlags) -> Result<(), IsolationError> {
        let mut zone = self.lock();
        zone.present_frame(pfn)?;
        let isolated = zone.checked_tag_at(pfn)?.is_isolated();
        if !zone.carve_out(pfn, 0)? {
            return Err(Precondition::NotFree { frame: pfn }.into());
        }
        zone.mark_allocated(pfn, 0, flags)?;
        zone.take_pages(1, isolated);
        Ok(())
    }

    /// Frees the `2^order` frames at `head`.
    ///
    /// Blocks larger than a granule are freed granule by granule, and
    /// poisoned frames are kept off the free lists.
    pub fn free(&self, head: FrameIndex, order: u8) -> Result<(), IsolationError> {
        if order >= self.config.max_order() {
            return Err(Precondition::BadOrder { order }.into());
        }
        if !head.is_aligned(order) {
            return Err(Precondition::Misaligned { frame: head }.into());
        }

        let mut zone = self.lock();
        for i in 0..1_usize << order {
            let pfn = head.offset(i);
            if zone.present_frame(pfn)?.occupancy != Occupancy::Allocated {
                return Err(Precondition::NotAllocated { frame: pfn }.into());
            }
        }

        let chunk = order.min(self.config.granule_order());
        for offset in (0..1_usize << order).step_by(1 << chunk) {
            let chunk_head = head.offset(offset);
            let poisoned = (0..1_usize << chunk).any(|i| {
                zone.frame(chunk_head.offset(i))
                    .is_some_and(|frame| frame.flags.contains(FrameFlags::POISONED))
            });
            if !poisoned {
                zone.release_block(chunk_head, chunk)?;
                continue;
            }
            for i in 0..1_usize << chunk {
                let pfn = chunk_head.offset(i);
                let frame = zone.frame_mut(pfn)?;
                if frame.flags.contains(FrameFlags::POISONED) {
                    frame.refcount = 0;
                } else {
                    zone.release_block(pfn, 0)?;
                }
            }
        }
        Ok(())
    }

    /// Records a hardware error on `pfn`. A free frame is taken off the free
    /// lists so that it is never handed out again.
    pub fn poison_frame(&self, pfn: FrameIndex) -> Result<(), IsolationError> {
        let mut zone = self.lock();
        let was_free = zone.present_frame(pfn)?.is_free();
        if was_free {
            let isolated = zone.checked_tag_at(pfn)?.is_isolated();
            zone.carve_out(pfn, 0)?;
            let frame = zone.frame_mut(pfn)?;
            frame.occupancy = Occupancy::Allocated;
            frame.flags = FrameFlags::POISONED;
            frame.refcount = 0;
            zone.take_pages(1, isolated);
        } else {
            zone.frame_mut(pfn)?.flags |= FrameFlags::POISONED;
        }
        log::info!("frame {pfn:#x} poisoned (was free: {was_free})");
        Ok(())
    }

    /// Marks the allocated frame `pfn` as handed back to the platform. Its
    /// reference is dropped; the frame stays out of the free lists.
    pub fn set_offline(&self, pfn: FrameIndex) -> Result<(), IsolationError> {
        let mut zone = self.lock();
        if zone.present_frame(pfn)?.occupancy != Occupancy::Allocated {
            return Err(Precondition::NotAllocated { frame: pfn }.into());
        }
        let frame = zone.frame_mut(pfn)?;
        frame.flags |= FrameFlags::OFFLINE;
        frame.refcount = 0;
        Ok(())
    }
}
