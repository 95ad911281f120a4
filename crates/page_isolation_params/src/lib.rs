#![no_std]

/// Number of distinct buddy orders; the largest free block is
/// `1 << (MAX_ORDER - 1)` frames.
pub const MAX_ORDER: u8 = 11;

/// Order of an isolation granule (512 frames, 2 MiB with 4 KiB frames).
pub const GRANULE_ORDER: u8 = 9;

/// Attempts made by the retrying isolation helper before giving up.
pub const ISOLATE_RETRIES: u32 = 5;

const _: () = assert!(GRANULE_ORDER < MAX_ORDER);
