use crate::frame::{FrameIndex, GranuleIndex};

/// Errors returned by the isolation, restoration and verification paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IsolationError {
    #[error("granule {granule:#x} is already isolated")]
    AlreadyIsolated { granule: GranuleIndex },
    #[error("frame {frame:#x} holds an unmovable occupant")]
    Busy { frame: FrameIndex },
    #[error("frame {frame:#x} is neither free nor exempt in an isolated range")]
    NotIsolated { frame: FrameIndex },
    #[error("precondition violated: {0}")]
    PreconditionViolation(#[from] Precondition),
    #[error("allocator state corrupted: {0}")]
    Corruption(#[from] Corruption),
}

impl IsolationError {
    /// Returns `true` if retrying the same request later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::AlreadyIsolated { .. } | Self::Busy { .. })
    }
}

/// Logs `err` if it reports corruption and passes it on.
pub(crate) fn log_corruption(err: IsolationError) -> IsolationError {
    if let IsolationError::Corruption(corruption) = err {
        log::error!("page isolation: {corruption}");
    }
    err
}

/// Caller mistakes. Retrying the same request cannot succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Precondition {
    #[error("empty frame range")]
    Empty,
    #[error("frame {frame:#x} is not aligned to a granule")]
    Misaligned { frame: FrameIndex },
    #[error("frame {frame:#x} is outside the zone")]
    OutOfZone { frame: FrameIndex },
    #[error("no memory backs frame {frame:#x}")]
    Hole { frame: FrameIndex },
    #[error("order {order} is not a valid buddy order")]
    BadOrder { order: u8 },
    #[error("frame {frame:#x} is not free")]
    NotFree { frame: FrameIndex },
    #[error("frame {frame:#x} is not allocated")]
    NotAllocated { frame: FrameIndex },
}

/// Broken internal invariants. Never repaired automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Corruption {
    #[error("free list link at frame {frame:#x} does not point at a free block")]
    BrokenFreeList { frame: FrameIndex },
    #[error("free block at frame {frame:#x} sits on the wrong free list")]
    MisfiledBlock { frame: FrameIndex },
    #[error("free block at frame {frame:#x} crosses a granule boundary")]
    BlockCrossesGranule { frame: FrameIndex },
    #[error("frame {frame:#x} is inside a free block but has no head")]
    OrphanTail { frame: FrameIndex },
    #[error("frame {frame:#x} referenced outside the zone")]
    FrameOutOfZone { frame: FrameIndex },
    #[error("granule {granule:#x} has an invalid tag")]
    BadTag { granule: GranuleIndex },
    #[error("isolated granule count disagrees with granule {granule:#x}")]
    IsolatedCountMismatch { granule: GranuleIndex },
}

/// Invalid zone geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("zone has no frames")]
    Empty,
    #[error("granule order {granule_order} must be below max order {max_order}")]
    GranuleOrder { granule_order: u8, max_order: u8 },
    #[error("max order {max_order} is too large")]
    MaxOrder { max_order: u8 },
    #[error("zone base {base:#x} is not aligned to the largest buddy block")]
    UnalignedBase { base: FrameIndex },
    #[error("zone of {frames} frames is not a whole number of granules")]
    PartialGranule { frames: usize },
    #[error("zone geometry does not fit its frame directory: {0}")]
    Geometry(#[from] Corruption),
}
