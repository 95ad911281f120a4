use alloc::vec::Vec;
use core::ops::Range;

use mutex_api::Mutex;
use page_isolation_params::{GRANULE_ORDER, MAX_ORDER};

use crate::{
    error::{ConfigError, Precondition},
    frame::{Frame, FrameDirectory, FrameIndex, FrameState, GranuleIndex},
    free_area::{FreeArea, ListKind},
    tag::{GranuleTagTable, OrdinaryClass, Tag},
};

/// Allocation policy of a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ZoneKind {
    #[default]
    Normal,
    /// Only movable allocations are placed here, so nothing in the zone can
    /// block isolation.
    Movable,
}

/// Geometry of a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneConfig {
    base: FrameIndex,
    frames: usize,
    granule_order: u8,
    max_order: u8,
    kind: ZoneKind,
}

impl ZoneConfig {
    /// A zone of `frames` frames starting at `base`, with the default
    /// granule and buddy orders.
    #[must_use]
    pub const fn new(base: FrameIndex, frames: usize) -> Self {
        Self {
            base,
            frames,
            granule_order: GRANULE_ORDER,
            max_order: MAX_ORDER,
            kind: ZoneKind::Normal,
        }
    }

    #[must_use]
    pub const fn with_granule_order(mut self, granule_order: u8) -> Self {
        self.granule_order = granule_order;
        self
    }

    #[must_use]
    pub const fn with_max_order(mut self, max_order: u8) -> Self {
        self.max_order = max_order;
        self
    }

    #[must_use]
    pub const fn with_kind(mut self, kind: ZoneKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frames == 0 {
            return Err(ConfigError::Empty);
        }
        if self.max_order == 0 || u32::from(self.max_order) >= usize::BITS / 2 {
            return Err(ConfigError::MaxOrder {
                max_order: self.max_order,
            });
        }
        if self.granule_order >= self.max_order {
            return Err(ConfigError::GranuleOrder {
                granule_order: self.granule_order,
                max_order: self.max_order,
            });
        }
        if !self.base.is_aligned(self.max_order - 1) {
            return Err(ConfigError::UnalignedBase { base: self.base });
        }
        if self.frames % self.granule_frames() != 0 {
            return Err(ConfigError::PartialGranule {
                frames: self.frames,
            });
        }
        Ok(())
    }

    #[must_use]
    pub const fn base(&self) -> FrameIndex {
        self.base
    }

    #[must_use]
    pub const fn end(&self) -> FrameIndex {
        self.base.offset(self.frames)
    }

    #[must_use]
    pub const fn frames(&self) -> usize {
        self.frames
    }

    #[must_use]
    pub const fn granule_order(&self) -> u8 {
        self.granule_order
    }

    #[must_use]
    pub const fn granule_frames(&self) -> usize {
        1 << self.granule_order
    }

    #[must_use]
    pub const fn max_order(&self) -> u8 {
        self.max_order
    }

    #[must_use]
    pub const fn kind(&self) -> ZoneKind {
        self.kind
    }

    #[must_use]
    pub const fn granule_of(&self, pfn: FrameIndex) -> GranuleIndex {
        pfn.granule(self.granule_order)
    }

    /// Checks a caller-supplied frame range and returns the granules it
    /// covers.
    pub fn granules_in(
        &self,
        start: FrameIndex,
        end: FrameIndex,
    ) -> Result<Range<usize>, Precondition> {
        if start >= end {
            return Err(Precondition::Empty);
        }
        for pfn in [start, end] {
            if !pfn.is_aligned(self.granule_order) {
                return Err(Precondition::Misaligned { frame: pfn });
            }
        }
        if start < self.base {
            return Err(Precondition::OutOfZone { frame: start });
        }
        if end > self.end() {
            return Err(Precondition::OutOfZone { frame: end });
        }
        Ok(self.granule_of(start).get()..self.granule_of(end).get())
    }
}

/// Allocator state guarded by the zone lock.
#[derive(Debug)]
pub struct ZoneState {
    pub(crate) frames: FrameDirectory,
    pub(crate) area: FreeArea,
    /// Free frames, isolated or not.
    pub(crate) nr_free: usize,
    /// Free frames that ordinary allocation may hand out.
    pub(crate) nr_available: usize,
}

/// A free buddy block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FreeBlock {
    pub head: FrameIndex,
    pub order: u8,
}

/// One allocation domain: a buddy allocator, its granule tags and the lock
/// that serializes every change to either.
#[derive(Debug)]
pub struct Zone<M> {
    pub(crate) config: ZoneConfig,
    pub(crate) tags: GranuleTagTable,
    state: M,
}

impl<M> Zone<M>
where
    M: Mutex<Data = ZoneState>,
{
    /// Creates a zone in which every frame is present and free and every
    /// granule carries `class`.
    pub fn new(config: ZoneConfig, class: OrdinaryClass) -> Result<Self, ConfigError> {
        Self::with_holes(config, class, &[])
    }

    /// Creates a zone whose frames in `holes` are not backed by memory.
    pub fn with_holes(
        config: ZoneConfig,
        class: OrdinaryClass,
        holes: &[Range<FrameIndex>],
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let is_hole = |pfn: FrameIndex| holes.iter().any(|hole| hole.contains(&pfn));
        let mut frames = FrameDirectory::new(config.base, config.frames);
        let mut area = FreeArea::new(config.max_order);
        let kind = ListKind::Ordinary(class);

        let mut populated = Vec::with_capacity(config.frames >> config.granule_order);
        let mut nr_free = 0;
        let mut pfn = config.base;
        while pfn < config.end() {
            if is_hole(pfn) {
                pfn = pfn.offset(1);
                continue;
            }
            let mut order = config.max_order - 1;
            while !pfn.is_aligned(order)
                || pfn.offset(1 << order) > config.end()
                || (1..1_usize << order).any(|i| is_hole(pfn.offset(i)))
            {
                order -= 1;
            }
            area.insert(&mut frames, pfn, order, kind, true)?;
            nr_free += 1 << order;
            pfn = pfn.offset(1 << order);
        }

        let mut granule = config.granule_of(config.base);
        while granule.start(config.granule_order) < config.end() {
            let start = granule.start(config.granule_order).get();
            let end = granule.end(config.granule_order).get();
            populated.push((start..end).any(|pfn| !is_hole(FrameIndex::new(pfn))));
            granule = GranuleIndex::new(granule.get() + 1);
        }
        if nr_free == 0 {
            return Err(ConfigError::Empty);
        }

        let tags = GranuleTagTable::new(
            config.granule_of(config.base),
            config.granule_order,
            populated,
            class,
        );
        let state = ZoneState {
            frames,
            area,
            nr_free,
            nr_available: nr_free,
        };
        Ok(Self {
            config,
            tags,
            state: M::new(state),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ZoneConfig {
        &self.config
    }

    /// Acquires the zone lock.
    #[must_use]
    pub fn lock(&self) -> LockedZone<'_, M> {
        LockedZone {
            config: &self.config,
            tags: &self.tags,
            state: self.state.lock(),
        }
    }

    /// Current tag of `granule`, read without the zone lock.
    #[must_use]
    pub fn tag_of(&self, granule: GranuleIndex) -> Option<Tag> {
        self.tags.tag_of(granule)
    }

    #[must_use]
    pub fn isolated_count(&self) -> usize {
        self.tags.isolated_count()
    }

    #[must_use]
    pub fn free_pages(&self) -> usize {
        self.lock().state.nr_free
    }

    #[must_use]
    pub fn available_pages(&self) -> usize {
        self.lock().state.nr_available
    }

    #[must_use]
    pub fn frame_state(&self, pfn: FrameIndex) -> Option<FrameState> {
        self.lock().state.frames.get(pfn).map(Frame::state)
    }

    /// Snapshot of every free block, in address order.
    #[must_use]
    pub fn free_blocks(&self) -> Vec<FreeBlock> {
        let zone = self.lock();
        zone.state
            .frames
            .iter()
            .filter_map(|(head, frame)| frame.buddy_order().map(|order| FreeBlock { head, order }))
            .collect()
    }
}

/// A locked zone. Every operation that reads or changes free lists or
/// granule tags goes through this guard; dropping it releases the lock.
pub struct LockedZone<'a, M>
where
    M: Mutex<Data = ZoneState> + 'a,
{
    pub(crate) config: &'a ZoneConfig,
    pub(crate) tags: &'a GranuleTagTable,
    pub(crate) state: M::Guard<'a>,
}

impl<'a, M> LockedZone<'a, M>
where
    M: Mutex<Data = ZoneState> + 'a,
{
    pub(crate) fn granule_of(&self, pfn: FrameIndex) -> GranuleIndex {
        self.config.granule_of(pfn)
    }

    #[must_use]
    pub fn frame(&self, pfn: FrameIndex) -> Option<&Frame> {
        self.state.frames.get(pfn)
    }

    #[must_use]
    pub fn tag_of(&self, granule: GranuleIndex) -> Option<Tag> {
        self.tags.tag_of(granule)
    }

    /// Number of free blocks of `order` that ordinary allocation of `class`
    /// would find first.
    #[must_use]
    pub fn free_count(&self, order: u8, class: OrdinaryClass) -> usize {
        self.state.area.len(order, ListKind::Ordinary(class))
    }

    /// Number of isolated free blocks of `order`.
    #[must_use]
    pub fn isolated_free_count(&self, order: u8) -> usize {
        self.state.area.len(order, ListKind::Isolated)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    pub(crate) type TestZone = Zone<StdMutex<ZoneState>>;

    /// 4 granules of 4 frames, blocks up to 8 frames.
    pub(crate) fn small_config() -> ZoneConfig {
        ZoneConfig::new(FrameIndex::new(0), 16)
            .with_granule_order(2)
            .with_max_order(4)
    }

    pub(crate) fn small_zone(class: OrdinaryClass) -> TestZone {
        TestZone::new(small_config(), class).unwrap()
    }

    pub(crate) fn blocks(zone: &TestZone) -> Vec<(usize, u8)> {
        zone.free_blocks()
            .into_iter()
            .map(|block| (block.head.get(), block.order))
            .collect()
    }

    /// No two free buddies of the same order may both remain unmerged.
    pub(crate) fn assert_buddy_invariant(zone: &TestZone) {
        let max_order = zone.config().max_order();
        let free = blocks(zone);
        for &(head, order) in &free {
            if order + 1 >= max_order {
                continue;
            }
            let buddy = head ^ (1 << order);
            assert!(
                !free.contains(&(buddy, order)),
                "free buddies {head:#x} and {buddy:#x} of order {order} were not merged: {free:?}"
            );
        }
    }

    #[test]
    fn new_zone_is_maximally_merged() {
        let zone = small_zone(OrdinaryClass::Movable);
        assert_eq!(blocks(&zone), [(0, 3), (8, 3)]);
        assert_eq!(zone.free_pages(), 16);
        assert_eq!(zone.available_pages(), 16);
        assert_eq!(zone.isolated_count(), 0);
        for g in 0..4 {
            assert_eq!(
                zone.tag_of(GranuleIndex::new(g)),
                Some(Tag::Ordinary(OrdinaryClass::Movable))
            );
        }
        assert_buddy_invariant(&zone);
    }

    #[test]
    fn holes_split_the_initial_blocks() {
        let holes = [FrameIndex::new(2)..FrameIndex::new(3), FrameIndex::new(8)..FrameIndex::new(12)];
        let zone = TestZone::with_holes(small_config(), OrdinaryClass::Movable, &holes).unwrap();
        assert_eq!(blocks(&zone), [(0, 1), (3, 0), (4, 2), (12, 2)]);
        assert_eq!(zone.free_pages(), 11);
        assert_eq!(zone.frame_state(FrameIndex::new(2)), Some(FrameState::Absent));
        assert!(zone.tags.is_populated(GranuleIndex::new(0)));
        assert!(!zone.tags.is_populated(GranuleIndex::new(2)));
        assert_buddy_invariant(&zone);
    }

    #[test]
    fn config_validation() {
        let ok = small_config();
        assert_eq!(ok.validate(), Ok(()));
        assert_eq!(
            ok.with_granule_order(4).validate(),
            Err(ConfigError::GranuleOrder {
                granule_order: 4,
                max_order: 4
            })
        );
        assert_eq!(
            ZoneConfig::new(FrameIndex::new(4), 16)
                .with_granule_order(2)
                .with_max_order(4)
                .validate(),
            Err(ConfigError::UnalignedBase {
                base: FrameIndex::new(4)
            })
        );
        assert_eq!(
            ZoneConfig::new(FrameIndex::new(0), 18)
                .with_granule_order(2)
                .with_max_order(4)
                .validate(),
            Err(ConfigError::PartialGranule { frames: 18 })
        );
        assert_eq!(
            ZoneConfig::new(FrameIndex::new(0), 0).validate(),
            Err(ConfigError::Empty)
        );
    }

    #[test]
    fn range_preconditions() {
        let config = small_config();
        let f = FrameIndex::new;
        assert_eq!(config.granules_in(f(4), f(12)), Ok(1..3));
        assert_eq!(config.granules_in(f(4), f(4)), Err(Precondition::Empty));
        assert_eq!(config.granules_in(f(8), f(4)), Err(Precondition::Empty));
        assert_eq!(
            config.granules_in(f(4), f(9)),
            Err(Precondition::Misaligned { frame: f(9) })
        );
        assert_eq!(
            config.granules_in(f(4), f(20)),
            Err(Precondition::OutOfZone { frame: f(20) })
        );
    }

    #[test]
    fn default_geometry_comes_from_params() {
        let config = ZoneConfig::new(FrameIndex::new(0), 4096);
        assert_eq!(config.granule_order(), GRANULE_ORDER);
        assert_eq!(config.max_order(), MAX_ORDER);
        assert_eq!(config.validate(), Ok(()));
    }
}
