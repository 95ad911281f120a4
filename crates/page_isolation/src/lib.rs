//! Page isolation for a buddy page allocator.
//!
//! A zone is divided into granules of `2^granule_order` frames. Isolating a
//! range of granules takes their free pages away from ordinary allocation
//! while leaving them free, so that the range can later be handed out as one
//! contiguous allocation or taken offline. [`Zone::isolate_range`] is all or
//! nothing, [`Zone::restore_range`] undoes it, and
//! [`Zone::verify_isolated`] checks that a range holds no busy frames.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub use self::{
    error::{ConfigError, Corruption, IsolationError, Precondition},
    frame::{Frame, FrameFlags, FrameIndex, FrameState, GranuleIndex},
    isolate::{IsolationFlags, IsolationRange},
    retry::{RetryPolicy, isolate_with_retry},
    tag::{OrdinaryClass, Tag},
    zone::{FreeBlock, LockedZone, Zone, ZoneConfig, ZoneKind, ZoneState},
};

mod buddy;
mod error;
mod frame;
mod free_area;
mod isolate;
mod restore;
mod retry;
mod tag;
mod verify;
mod zone;

#[cfg(test)]
mod tests;

/// A zone guarded by a spin lock, for use without an operating system.
pub type SpinZone = Zone<mutex_api::SpinMutex<ZoneState>>;
