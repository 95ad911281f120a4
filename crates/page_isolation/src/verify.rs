//! Checking that an isolated range holds nothing but free or exempt frames.

use mutex_api::Mutex;

use crate::{
    error::{Corruption, IsolationError},
    frame::{FrameFlags, FrameIndex, GranuleIndex, Occupancy},
    isolate::IsolationFlags,
    tag::Tag,
    zone::{LockedZone, Zone, ZoneState},
};

impl<'a, M> LockedZone<'a, M>
where
    M: Mutex<Data = ZoneState> + 'a,
{
    fn check_isolated(
        &self,
        start: FrameIndex,
        end: FrameIndex,
        flags: IsolationFlags,
    ) -> Result<(), IsolationError> {
        let offlining = flags.contains(IsolationFlags::MEMORY_OFFLINE);
        let mut pfn = start;
        while pfn < end {
            let frame = self
                .frame(pfn)
                .ok_or(Corruption::FrameOutOfZone { frame: pfn })?;
            let passes = match frame.occupancy {
                Occupancy::Absent => true,
                Occupancy::FreeHead { order, .. } => {
                    pfn = pfn.offset(1 << order);
                    continue;
                }
                Occupancy::Allocated => {
                    offlining
                        && (frame.flags.contains(FrameFlags::POISONED)
                            || (frame.flags.contains(FrameFlags::OFFLINE) && frame.refcount == 0))
                }
                Occupancy::FreeTail { .. } | Occupancy::Detached => false,
            };
            if !passes {
                return Err(IsolationError::NotIsolated { frame: pfn });
            }
            pfn = pfn.offset(1);
        }
        Ok(())
    }
}

impl<M> Zone<M>
where
    M: Mutex<Data = ZoneState>,
{
    /// Checks that `start..end` is isolated and that every frame in it is
    /// free, a hole, or (with [`IsolationFlags::MEMORY_OFFLINE`]) poisoned or
    /// offline.
    ///
    /// Nothing is changed. Per-CPU page caches are not visible here; drain
    /// them first.
    pub fn verify_isolated(
        &self,
        start: FrameIndex,
        end: FrameIndex,
        flags: IsolationFlags,
    ) -> Result<(), IsolationError> {
        let granules = self.config.granules_in(start, end)?;
        let granule_order = self.config.granule_order();

        // Tags can be read without the lock; a stale read only fails early.
        for index in granules {
            let granule = GranuleIndex::new(index);
            if self.tags.is_populated(granule)
                && !self.tags.tag_of(granule).is_some_and(Tag::is_isolated)
            {
                let frame = granule.start(granule_order);
                log::debug!("verify {start:#x}..{end:#x}: granule at {frame:#x} is not isolated");
                return Err(IsolationError::NotIsolated { frame });
            }
        }

        let zone = self.lock();
        zone.check_isolated(start, end, flags).inspect_err(|err| {
            log::debug!("verify {start:#x}..{end:#x} failed: {err}");
        })
    }
}
