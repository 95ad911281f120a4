//! Property tests over random sequences of allocator and isolation calls.

use std::{
    collections::HashSet,
    ops::Range,
    sync::{Barrier, Mutex as StdMutex},
    thread,
};

use mutex_api::{Mutex, SpinMutex};
use quickcheck::{Arbitrary, Gen, QuickCheck};

use crate::{
    FrameFlags, FrameIndex, FrameState, GranuleIndex, IsolationError, IsolationFlags,
    IsolationRange, OrdinaryClass, Tag, Zone, ZoneConfig, ZoneState,
};

const MAX_TESTS: u64 = 300;

const GRANULE_ORDER: u8 = 2;
const MAX_ORDER: u8 = 5;
const GRANULES: usize = 16;
const FRAMES: usize = GRANULES << GRANULE_ORDER;

const CLASSES: [OrdinaryClass; 4] = [
    OrdinaryClass::Unmovable,
    OrdinaryClass::Movable,
    OrdinaryClass::Reclaimable,
    OrdinaryClass::Cma,
];

fn config() -> ZoneConfig {
    ZoneConfig::new(FrameIndex::new(0), FRAMES)
        .with_granule_order(GRANULE_ORDER)
        .with_max_order(MAX_ORDER)
}

/// A partial hole in G1 and G2, and G4..G8 missing entirely.
fn holes() -> [Range<FrameIndex>; 2] {
    [
        FrameIndex::new(6)..FrameIndex::new(9),
        FrameIndex::new(16)..FrameIndex::new(32),
    ]
}

fn class(g: &mut Gen) -> OrdinaryClass {
    *g.choose(&CLASSES).unwrap()
}

/// Frame range of `len` granules starting at granule `first`, clipped to the
/// zone.
fn granule_range(first: usize, len: usize) -> (FrameIndex, FrameIndex) {
    let end = (first + len).min(GRANULES);
    (
        GranuleIndex::new(first).start(GRANULE_ORDER),
        GranuleIndex::new(end).start(GRANULE_ORDER),
    )
}

#[derive(Clone, Debug)]
enum Op {
    Alloc { order: u8, class: OrdinaryClass },
    /// Given `n` live allocations, frees the one at `index % n`.
    Free { index: usize },
    Claim { pfn: usize },
    Poison { pfn: usize },
    /// Given `n` live allocations, hands the one at `index % n` to the
    /// platform for good.
    Offline { index: usize },
    Isolate {
        first: usize,
        len: usize,
        fallback: OrdinaryClass,
        flags: IsolationFlags,
    },
    Restore {
        first: usize,
        len: usize,
        class: OrdinaryClass,
    },
}

impl Arbitrary for Op {
    fn arbitrary(g: &mut Gen) -> Self {
        match u8::arbitrary(g) % 8 {
            0 | 1 => Self::Alloc {
                order: u8::arbitrary(g) % MAX_ORDER,
                class: class(g),
            },
            2 => Self::Free {
                index: usize::arbitrary(g),
            },
            3 => Self::Claim {
                pfn: usize::arbitrary(g) % FRAMES,
            },
            4 => {
                if u8::arbitrary(g) % 2 == 0 {
                    Self::Poison {
                        pfn: usize::arbitrary(g) % FRAMES,
                    }
                } else {
                    Self::Offline {
                        index: usize::arbitrary(g),
                    }
                }
            }
            5 | 6 => Self::Isolate {
                first: usize::arbitrary(g) % GRANULES,
                len: 1 + usize::arbitrary(g) % 4,
                fallback: class(g),
                flags: IsolationFlags::from_bits_truncate(u8::arbitrary(g)),
            },
            _ => Self::Restore {
                first: usize::arbitrary(g) % GRANULES,
                len: 1 + usize::arbitrary(g) % 4,
                class: class(g),
            },
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Snapshot {
    blocks: Vec<(usize, u8)>,
    tags: Vec<Option<Tag>>,
    free: usize,
    available: usize,
}

fn snapshot<M>(zone: &Zone<M>) -> Snapshot
where
    M: Mutex<Data = ZoneState>,
{
    Snapshot {
        blocks: zone
            .free_blocks()
            .into_iter()
            .map(|block| (block.head.get(), block.order))
            .collect(),
        tags: (0..GRANULES)
            .map(|index| zone.tag_of(GranuleIndex::new(index)))
            .collect(),
        free: zone.free_pages(),
        available: zone.available_pages(),
    }
}

fn is_isolated<M>(zone: &Zone<M>, pfn: FrameIndex) -> bool
where
    M: Mutex<Data = ZoneState>,
{
    zone.tag_of(pfn.granule(GRANULE_ORDER))
        .is_some_and(Tag::is_isolated)
}

/// Every granule of `start..end` that has memory is isolated.
fn range_is_isolated<M>(zone: &Zone<M>, start: FrameIndex, end: FrameIndex) -> bool
where
    M: Mutex<Data = ZoneState>,
{
    (start.get()..end.get()).all(|pfn| {
        let pfn = FrameIndex::new(pfn);
        !zone.tags.is_populated(pfn.granule(GRANULE_ORDER)) || is_isolated(zone, pfn)
    })
}

/// Counters agree with the free lists, and no isolated free block reaches
/// past its granule.
fn counters_match<M>(zone: &Zone<M>) -> bool
where
    M: Mutex<Data = ZoneState>,
{
    let mut free = 0;
    let mut available = 0;
    for block in zone.free_blocks() {
        let pages = 1 << block.order;
        free += pages;
        if is_isolated(zone, block.head) {
            if block.order > GRANULE_ORDER {
                return false;
            }
        } else {
            available += pages;
        }
    }
    free == zone.free_pages() && available == zone.available_pages()
}

fn buddies_merged<M>(zone: &Zone<M>) -> bool
where
    M: Mutex<Data = ZoneState>,
{
    let blocks = zone.free_blocks();
    blocks.iter().all(|block| {
        block.order + 1 >= MAX_ORDER
            || !blocks.iter().any(|other| {
                other.order == block.order && other.head == block.head.buddy(block.order)
            })
    })
}

/// Every frame of `start..end` would pass verification with `flags`.
fn range_passes<M>(zone: &Zone<M>, start: FrameIndex, end: FrameIndex, flags: IsolationFlags) -> bool
where
    M: Mutex<Data = ZoneState>,
{
    let offlining = flags.contains(IsolationFlags::MEMORY_OFFLINE);
    (start.get()..end.get()).all(|pfn| match zone.frame_state(FrameIndex::new(pfn)) {
        Some(FrameState::Absent | FrameState::Free { .. } | FrameState::InFreeBlock { .. }) => {
            true
        }
        Some(FrameState::Poisoned { .. } | FrameState::Offline { refcount: 0 }) => offlining,
        _ => false,
    })
}

fn present_frames<M>(zone: &Zone<M>) -> usize
where
    M: Mutex<Data = ZoneState>,
{
    (0..FRAMES)
        .filter(|&pfn| zone.frame_state(FrameIndex::new(pfn)) != Some(FrameState::Absent))
        .count()
}

fn run_on<M>(zone: &Zone<M>, ops: Vec<Op>) -> bool
where
    M: Mutex<Data = ZoneState>,
{
    let present = present_frames(zone);
    let mut live = Vec::new();
    // Frames that never return to the free lists.
    let mut lost = HashSet::new();

    for op in ops {
        match op {
            Op::Alloc { order, class } => {
                if let Some(head) = zone.alloc(order, class).unwrap() {
                    live.push((head, order));
                }
            }
            Op::Free { index } => {
                if !live.is_empty() {
                    let (head, order) = live.swap_remove(index % live.len());
                    zone.free(head, order).unwrap();
                }
            }
            Op::Claim { pfn } => {
                let pfn = FrameIndex::new(pfn);
                if zone.claim_frame(pfn, FrameFlags::MOVABLE).is_ok() {
                    live.push((pfn, 0));
                }
            }
            Op::Poison { pfn } => {
                if zone.poison_frame(FrameIndex::new(pfn)).is_ok() {
                    lost.insert(pfn);
                }
            }
            Op::Offline { index } => {
                if !live.is_empty() {
                    let (head, order) = live.swap_remove(index % live.len());
                    zone.set_offline(head).unwrap();
                    lost.extend(head.get()..head.get() + (1 << order));
                }
            }
            Op::Isolate {
                first,
                len,
                fallback,
                flags,
            } => {
                let (start, end) = granule_range(first, len);
                let before = snapshot(zone);
                let range = IsolationRange::new(start, end, fallback).with_flags(flags);
                match zone.isolate_range(&range) {
                    Ok(()) => {
                        if !range_is_isolated(zone, start, end) {
                            return false;
                        }
                        for verify_flags in [IsolationFlags::empty(), IsolationFlags::MEMORY_OFFLINE]
                        {
                            let verified = zone.verify_isolated(start, end, verify_flags);
                            if verified.is_ok() != range_passes(zone, start, end, verify_flags) {
                                return false;
                            }
                        }
                    }
                    Err(err) => {
                        if !err.is_retryable() || snapshot(zone) != before {
                            return false;
                        }
                    }
                }
            }
            Op::Restore { first, len, class } => {
                let (start, end) = granule_range(first, len);
                zone.restore_range(start, end, class).unwrap();
                let once = snapshot(zone);
                zone.restore_range(start, end, class).unwrap();
                if snapshot(zone) != once {
                    return false;
                }
            }
        }
        if !counters_match(zone) {
            return false;
        }
    }

    let end = FrameIndex::new(FRAMES);
    zone.restore_range(FrameIndex::new(0), end, OrdinaryClass::Movable)
        .unwrap();
    if zone.isolated_count() != 0 || !buddies_merged(zone) {
        return false;
    }

    for (head, order) in live {
        zone.free(head, order).unwrap();
    }
    let expected = present - lost.len();
    counters_match(zone)
        && buddies_merged(zone)
        && zone.free_pages() == expected
        && zone.available_pages() == expected
}

fn run<M>(ops: Vec<Op>) -> bool
where
    M: Mutex<Data = ZoneState>,
{
    let zone = Zone::<M>::new(config(), OrdinaryClass::Movable).unwrap();
    let clean = !ops
        .iter()
        .any(|op| matches!(op, Op::Poison { .. } | Op::Offline { .. }));
    run_on(&zone, ops) && (!clean || zone.free_blocks().len() == FRAMES >> (MAX_ORDER - 1))
}

fn run_with_holes<M>(ops: Vec<Op>) -> bool
where
    M: Mutex<Data = ZoneState>,
{
    let zone = Zone::<M>::with_holes(config(), OrdinaryClass::Movable, &holes()).unwrap();
    run_on(&zone, ops)
}

#[test]
fn random_isolation_keeps_the_allocator_consistent() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(run::<StdMutex<ZoneState>> as fn(_) -> bool);
}

#[test]
fn random_isolation_around_holes() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(run_with_holes::<StdMutex<ZoneState>> as fn(_) -> bool);
}

#[test]
fn spin_zone_behaves_like_std_zone() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS / 3);
    qc.quickcheck(run::<SpinMutex<ZoneState>> as fn(_) -> bool);
}

#[test]
fn spin_zone_round_trip() {
    let zone = crate::SpinZone::new(config(), OrdinaryClass::Movable).unwrap();
    let (start, end) = granule_range(4, 4);
    zone.isolate_range(&IsolationRange::new(start, end, OrdinaryClass::Movable))
        .unwrap();
    assert_eq!(zone.isolated_count(), 4);
    zone.verify_isolated(start, end, IsolationFlags::MEMORY_OFFLINE)
        .unwrap();
    zone.restore_range(start, end, OrdinaryClass::Movable)
        .unwrap();
    assert_eq!(zone.free_blocks().len(), FRAMES >> (MAX_ORDER - 1));
    assert_eq!(zone.available_pages(), FRAMES);
}

const CHURN_OPS: usize = 2000;

/// Allocating threads race one thread that isolates and restores random
/// ranges. Unmovable allocations make some isolations fail and roll back.
fn churn<M>()
where
    M: Mutex<Data = ZoneState> + Sync,
{
    let zone = Zone::<M>::new(config(), OrdinaryClass::Movable).unwrap();
    let barrier = Barrier::new(3);

    thread::scope(|s| {
        for class in [OrdinaryClass::Movable, OrdinaryClass::Unmovable] {
            let zone = &zone;
            let barrier = &barrier;
            s.spawn(move || {
                let mut rng = Gen::new(64);
                let mut live = Vec::new();
                barrier.wait();
                for _ in 0..CHURN_OPS {
                    if live.len() < 8 && bool::arbitrary(&mut rng) {
                        let order = u8::arbitrary(&mut rng) % 3;
                        if let Some(head) = zone.alloc(order, class).unwrap() {
                            assert!(matches!(
                                zone.frame_state(head),
                                Some(FrameState::Allocated { refcount: 1 })
                            ));
                            live.push((head, order));
                        }
                    } else if !live.is_empty() {
                        let index = usize::arbitrary(&mut rng) % live.len();
                        let (head, order) = live.swap_remove(index);
                        zone.free(head, order).unwrap();
                    }
                }
                for (head, order) in live {
                    zone.free(head, order).unwrap();
                }
            });
        }

        s.spawn(|| {
            let mut rng = Gen::new(64);
            barrier.wait();
            for _ in 0..CHURN_OPS / 10 {
                let first = usize::arbitrary(&mut rng) % GRANULES;
                let (start, end) = granule_range(first, 1 + usize::arbitrary(&mut rng) % 4);
                let range = IsolationRange::new(start, end, OrdinaryClass::Movable);
                match zone.isolate_range(&range) {
                    Ok(()) => assert!(range_is_isolated(&zone, start, end)),
                    Err(err) => assert!(matches!(err, IsolationError::Busy { .. }), "{err}"),
                }
                zone.restore_range(start, end, OrdinaryClass::Movable)
                    .unwrap();
            }
        });
    });

    assert_eq!(zone.isolated_count(), 0);
    assert_eq!(zone.free_pages(), FRAMES);
    assert_eq!(zone.available_pages(), FRAMES);
    assert!(buddies_merged(&zone));
    assert_eq!(zone.free_blocks().len(), FRAMES >> (MAX_ORDER - 1));
}

#[test]
fn allocation_races_isolation() {
    churn::<StdMutex<ZoneState>>();
}

#[test]
fn allocation_races_isolation_on_spin_zone() {
    churn::<SpinMutex<ZoneState>>();
}
