//! Geometry and limit constants for the verifier.
//!
//! # Design Decisions
//!
//! Sector arithmetic uses `u64` byte offsets and `u32` sector counts: a
//! single I/O is capped at 1 MiB, so counts never approach `u32::MAX`, while
//! device offsets routinely exceed 32 bits. All invariants are verified at
//! compile time via `const` assertions.

// Compile-time proof that u32 -> usize is safe on this platform.
const _: () = assert!(
    size_of::<usize>() >= size_of::<u32>(),
    "Platform must have at least 32-bit addressing"
);

/// The atomic addressing grain of a block device.
pub const SECTOR_SIZE: u32 = 512;

/// log2([`SECTOR_SIZE`]); sector/byte conversions are shifts, never divides.
pub const SECTOR_SHIFT: u32 = 9;

/// Direct I/O buffer alignment. O_DIRECT wants page alignment; 4 KiB covers
/// every kernel/device combination we target.
pub const BUFFER_ALIGN: usize = 4096;

/// Largest single I/O in bytes.
pub const IO_SIZE_MAX: u32 = 1 << 20; // 1 MiB

/// Largest single I/O in sectors.
pub const IO_SECTORS_MAX: u32 = IO_SIZE_MAX >> SECTOR_SHIFT;

/// Bounds on the configured in-flight window.
pub const IO_DEPTH_MIN: u32 = 1;
pub const IO_DEPTH_MAX: u32 = 512;

/// Default in-flight window when the CLI does not override it.
pub const IO_DEPTH_DEFAULT: u32 = 32;

/// Completions reaped from the kernel per batch. Bounding the reap preserves
/// fairness between completion processing and new submissions.
pub const REAP_BATCH_MAX: u32 = 128;

/// Pattern strings are short ASCII tags tiled across sectors.
pub const PATTERN_LEN_MIN: usize = 1;
pub const PATTERN_LEN_MAX: usize = 512;

/// Default wall-clock interval between WRITE and VERIFY phases.
pub const PHASE_INTERVAL_DEFAULT_SECS: u64 = 5 * 60;

/// Converts a sector number to a byte offset.
#[inline]
pub const fn sector_to_byte(sector: u64) -> u64 {
    assert!(sector <= u64::MAX >> SECTOR_SHIFT, "sector_to_byte overflow");
    sector << SECTOR_SHIFT
}

/// Converts a byte count or offset to sectors.
///
/// # Panics
///
/// Panics if `bytes` is not sector-aligned (truncation would hide a bug).
#[inline]
pub const fn byte_to_sector(bytes: u64) -> u64 {
    assert!(
        bytes & ((SECTOR_SIZE as u64) - 1) == 0,
        "byte_to_sector: unaligned byte count"
    );
    bytes >> SECTOR_SHIFT
}

// =============================================================================
// Compile-time design integrity assertions
// =============================================================================

const _: () = assert!(SECTOR_SIZE.is_power_of_two());
const _: () = assert!(1 << SECTOR_SHIFT == SECTOR_SIZE);

const _: () = assert!(BUFFER_ALIGN.is_power_of_two());
const _: () = assert!(BUFFER_ALIGN >= SECTOR_SIZE as usize);

const _: () = assert!(IO_SIZE_MAX.is_power_of_two());
const _: () = assert!(IO_SIZE_MAX.is_multiple_of(SECTOR_SIZE));
const _: () = assert!(IO_SECTORS_MAX == 2048);

const _: () = assert!(IO_DEPTH_MIN >= 1);
const _: () = assert!(IO_DEPTH_MIN <= IO_DEPTH_DEFAULT);
const _: () = assert!(IO_DEPTH_DEFAULT <= IO_DEPTH_MAX);

const _: () = assert!(REAP_BATCH_MAX > 0);
const _: () = assert!(REAP_BATCH_MAX <= IO_DEPTH_MAX);

const _: () = assert!(PATTERN_LEN_MIN >= 1);
const _: () = assert!(PATTERN_LEN_MAX <= SECTOR_SIZE as usize);
// Phase offsets are stored as i16; every value in [0, PATTERN_LEN_MAX) fits.
const _: () = assert!(PATTERN_LEN_MAX <= i16::MAX as usize);
