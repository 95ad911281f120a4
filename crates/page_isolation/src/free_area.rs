//! Per-order free lists threaded through the frame directory.

use alloc::vec::Vec;

use strum::EnumCount as _;

use crate::{
    error::Corruption,
    frame::{FrameDirectory, FrameIndex, Link, Occupancy},
    tag::{OrdinaryClass, Tag},
};

/// Which free list of an order a block sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ListKind {
    Ordinary(OrdinaryClass),
    Isolated,
}

impl ListKind {
    const COUNT: usize = OrdinaryClass::COUNT + 1;

    const fn index(self) -> usize {
        match self {
            Self::Ordinary(class) => class as usize,
            Self::Isolated => OrdinaryClass::COUNT,
        }
    }
}

impl From<Tag> for ListKind {
    fn from(tag: Tag) -> Self {
        match tag {
            Tag::Ordinary(class) => Self::Ordinary(class),
            Tag::Isolated { .. } => Self::Isolated,
        }
    }
}

/// Doubly-linked list of free block heads.
#[derive(Debug, Default)]
struct FreeList {
    head: Option<FrameIndex>,
    tail: Option<FrameIndex>,
    len: usize,
}

fn link_mut(frames: &mut FrameDirectory, pfn: FrameIndex) -> Result<&mut Link, Corruption> {
    match frames.get_mut(pfn).map(|frame| &mut frame.occupancy) {
        Some(Occupancy::FreeHead { link, .. }) => Ok(link),
        _ => Err(Corruption::BrokenFreeList { frame: pfn }),
    }
}

impl FreeList {
    fn push_front(&mut self, frames: &mut FrameDirectory, pfn: FrameIndex) -> Result<(), Corruption> {
        let old_head = self.head;
        *link_mut(frames, pfn)? = Link {
            prev: None,
            next: old_head,
        };
        match old_head {
            Some(old) => link_mut(frames, old)?.prev = Some(pfn),
            None => self.tail = Some(pfn),
        }
        self.head = Some(pfn);
        self.len += 1;
        Ok(())
    }

    fn push_back(&mut self, frames: &mut FrameDirectory, pfn: FrameIndex) -> Result<(), Corruption> {
        let old_tail = self.tail;
        *link_mut(frames, pfn)? = Link {
            prev: old_tail,
            next: None,
        };
        match old_tail {
            Some(old) => link_mut(frames, old)?.next = Some(pfn),
            None => self.head = Some(pfn),
        }
        self.tail = Some(pfn);
        self.len += 1;
        Ok(())
    }

    fn unlink(&mut self, frames: &mut FrameDirectory, pfn: FrameIndex) -> Result<(), Corruption> {
        let Link { prev, next } = *link_mut(frames, pfn)?;
        match prev {
            // Link `prev` forward to `next`.
            Some(p) => link_mut(frames, p)?.next = next,
            None => self.head = next,
        }
        match next {
            // Link `next` back to `prev`.
            Some(n) => link_mut(frames, n)?.prev = prev,
            None => self.tail = prev,
        }
        self.len = self
            .len
            .checked_sub(1)
            .ok_or(Corruption::BrokenFreeList { frame: pfn })?;
        Ok(())
    }
}

/// Free lists of one zone, indexed by order and [`ListKind`].
#[derive(Debug)]
pub(crate) struct FreeArea {
    lists: Vec<[FreeList; ListKind::COUNT]>,
}

impl FreeArea {
    pub(crate) fn new(max_order: u8) -> Self {
        let lists = (0..max_order).map(|_| Default::default()).collect();
        Self { lists }
    }

    fn list_mut(&mut self, order: u8, kind: ListKind) -> &mut FreeList {
        &mut self.lists[usize::from(order)][kind.index()]
    }

    /// Number of blocks of `order` on the `kind` list.
    pub(crate) fn len(&self, order: u8, kind: ListKind) -> usize {
        self.lists
            .get(usize::from(order))
            .map_or(0, |lists| lists[kind.index()].len)
    }

    /// First block of `order` on the `kind` list.
    pub(crate) fn first(&self, order: u8, kind: ListKind) -> Option<FrameIndex> {
        self.lists.get(usize::from(order))?[kind.index()].head
    }

    /// Turns `2^order` frames starting at `head` into a free block and puts
    /// it on the `kind` list, at the head or the tail.
    pub(crate) fn insert(
        &mut self,
        frames: &mut FrameDirectory,
        head: FrameIndex,
        order: u8,
        kind: ListKind,
        to_tail: bool,
    ) -> Result<(), Corruption> {
        for i in 1..1_usize << order {
            let pfn = head.offset(i);
            let frame = frames
                .get_mut(pfn)
                .ok_or(Corruption::FrameOutOfZone { frame: pfn })?;
            frame.occupancy = Occupancy::FreeTail { head };
            frame.flags = Default::default();
            frame.refcount = 0;
        }
        let frame = frames
            .get_mut(head)
            .ok_or(Corruption::FrameOutOfZone { frame: head })?;
        frame.occupancy = Occupancy::FreeHead {
            order,
            list: kind,
            link: Link::default(),
        };
        frame.flags = Default::default();
        frame.refcount = 0;

        let list = self.list_mut(order, kind);
        if to_tail {
            list.push_back(frames, head)
        } else {
            list.push_front(frames, head)
        }
    }

    /// Takes the block headed by `head` off its free list.
    ///
    /// The head is left [`Occupancy::Detached`]; the caller reinserts the
    /// block or hands its frames out before releasing the zone lock.
    pub(crate) fn remove(
        &mut self,
        frames: &mut FrameDirectory,
        head: FrameIndex,
    ) -> Result<(u8, ListKind), Corruption> {
        let Some(Occupancy::FreeHead { order, list, .. }) =
            frames.get(head).map(|frame| frame.occupancy)
        else {
            return Err(Corruption::BrokenFreeList { frame: head });
        };
        self.list_mut(order, list).unlink(frames, head)?;
        if let Some(frame) = frames.get_mut(head) {
            frame.occupancy = Occupancy::Detached;
        }
        Ok((order, list))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    const MOVABLE: ListKind = ListKind::Ordinary(OrdinaryClass::Movable);

    fn directory() -> FrameDirectory {
        let mut frames = FrameDirectory::new(FrameIndex::new(0), 16);
        for pfn in 0..16 {
            *frames.get_mut(FrameIndex::new(pfn)).unwrap() = Frame {
                occupancy: Occupancy::Allocated,
                flags: Default::default(),
                refcount: 1,
            };
        }
        frames
    }

    fn walk(area: &FreeArea, frames: &FrameDirectory, order: u8, kind: ListKind) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cur = area.first(order, kind);
        while let Some(pfn) = cur {
            out.push(pfn.get());
            let Some(Occupancy::FreeHead { link, .. }) = frames.get(pfn).map(|f| f.occupancy) else {
                panic!("list points at non-head frame {pfn:?}");
            };
            cur = link.next;
        }
        out
    }

    #[test]
    fn insert_marks_tails() {
        let mut frames = directory();
        let mut area = FreeArea::new(4);
        area.insert(&mut frames, FrameIndex::new(4), 2, MOVABLE, false)
            .unwrap();

        assert_eq!(frames.get(FrameIndex::new(4)).unwrap().buddy_order(), Some(2));
        for pfn in 5..8 {
            assert_eq!(
                frames.get(FrameIndex::new(pfn)).unwrap().occupancy,
                Occupancy::FreeTail {
                    head: FrameIndex::new(4)
                }
            );
        }
        assert_eq!(area.len(2, MOVABLE), 1);
        assert_eq!(area.len(2, ListKind::Isolated), 0);
    }

    #[test]
    fn head_and_tail_placement() {
        let mut frames = directory();
        let mut area = FreeArea::new(4);
        area.insert(&mut frames, FrameIndex::new(0), 0, MOVABLE, false)
            .unwrap();
        area.insert(&mut frames, FrameIndex::new(1), 0, MOVABLE, false)
            .unwrap();
        area.insert(&mut frames, FrameIndex::new(2), 0, MOVABLE, true)
            .unwrap();
        assert_eq!(walk(&area, &frames, 0, MOVABLE), [1, 0, 2]);
    }

    #[test]
    fn remove_from_middle_and_ends() {
        let mut frames = directory();
        let mut area = FreeArea::new(4);
        for pfn in 0..4 {
            area.insert(&mut frames, FrameIndex::new(pfn), 0, MOVABLE, true)
                .unwrap();
        }

        assert_eq!(
            area.remove(&mut frames, FrameIndex::new(1)).unwrap(),
            (0, MOVABLE)
        );
        assert_eq!(walk(&area, &frames, 0, MOVABLE), [0, 2, 3]);
        area.remove(&mut frames, FrameIndex::new(0)).unwrap();
        area.remove(&mut frames, FrameIndex::new(3)).unwrap();
        assert_eq!(walk(&area, &frames, 0, MOVABLE), [2]);
        assert_eq!(area.len(0, MOVABLE), 1);
        assert_eq!(
            frames.get(FrameIndex::new(3)).unwrap().occupancy,
            Occupancy::Detached
        );
    }

    #[test]
    fn removing_a_non_free_frame_is_corruption() {
        let mut frames = directory();
        let mut area = FreeArea::new(4);
        assert_eq!(
            area.remove(&mut frames, FrameIndex::new(3)),
            Err(Corruption::BrokenFreeList {
                frame: FrameIndex::new(3)
            })
        );
    }
}
