//! Read verification against the expected-state registry.
//!
//! Given the bytes a read returned, reconstructs what the registry says the
//! device should hold and compares. Gap sub-ranges (never written, or
//! forfeited after a concurrent-overlap eviction) are unconstrained and
//! skipped; any byte difference in a covered sub-range is corruption and is
//! reported with the exact offending offset.

use crate::constants::{sector_to_byte, SECTOR_SIZE};
use crate::expect::{ExpectedRegistry, Segment, SectorRange};

/// A verification finding: the device returned bytes that contradict the
/// registry's claim. This is the output the tool exists to produce.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "sector {mismatch_sector} (read [{read_start}, +{read_count}), device byte {device_offset}): \
     expected {expected:#04x} got {actual:#04x} (pattern {pattern:?} phase {phase})"
)]
pub struct Mismatch {
    /// First sector of the read that detected the corruption.
    pub read_start: u64,
    /// Sector count of that read.
    pub read_count: u32,
    /// Sector containing the first differing byte.
    pub mismatch_sector: u64,
    /// Absolute device byte offset of the first differing byte.
    pub device_offset: u64,
    pub expected: u8,
    pub actual: u8,
    /// Pattern text of the violated claim.
    pub pattern: String,
    /// Pattern phase at the start of the violated sub-range.
    pub phase: i16,
}

/// Walks read buffers against the registry. Owns its counters; callers
/// aggregate by asking.
#[derive(Debug, Default)]
pub struct Verifier {
    nverified: u64,
    sectors_verified: u64,
    sectors_skipped: u64,
}

impl Verifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads verified so far.
    #[inline]
    pub fn nverified(&self) -> u64 {
        self.nverified
    }

    /// Sectors compared against a claim.
    #[inline]
    pub fn sectors_verified(&self) -> u64 {
        self.sectors_verified
    }

    /// Sectors skipped as gaps.
    #[inline]
    pub fn sectors_skipped(&self) -> u64 {
        self.sectors_skipped
    }

    /// Verifies `buf`, the result of reading `range`, against `registry`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is not exactly `range.count() * 512` bytes: a short
    /// read on a direct-I/O block device is itself a device failure and must
    /// be caught before the buffer reaches the verifier.
    pub fn verify(
        &mut self,
        registry: &ExpectedRegistry,
        buf: &[u8],
        range: SectorRange,
    ) -> Result<(), Mismatch> {
        assert_eq!(buf.len() as u64, sector_to_byte(range.count() as u64));

        for segment in registry.coverage(range) {
            match segment {
                Segment::Gap(gap) => {
                    self.sectors_skipped += gap.count() as u64;
                }
                Segment::Covered {
                    range: sub,
                    pattern,
                    phase,
                } => {
                    let buf_start = sector_to_byte(sub.start() - range.start()) as usize;
                    let buf_end = buf_start + sector_to_byte(sub.count() as u64) as usize;
                    let observed = &buf[buf_start..buf_end];

                    if let Some((at, expected, actual)) =
                        first_difference(observed, pattern.text().as_bytes(), phase)
                    {
                        let device_offset = sector_to_byte(sub.start()) + at as u64;
                        return Err(Mismatch {
                            read_start: range.start(),
                            read_count: range.count(),
                            mismatch_sector: sub.start() + at as u64 / SECTOR_SIZE as u64,
                            device_offset,
                            expected,
                            actual,
                            pattern: pattern.text().to_string(),
                            phase,
                        });
                    }

                    self.sectors_verified += sub.count() as u64;
                }
            }
        }

        self.nverified += 1;
        Ok(())
    }
}

/// Compares `observed` against `text` tiled from `phase`. Returns
/// `(offset, expected, actual)` of the first difference, or `None` if equal.
///
/// The rotated pattern is materialized once, then the aligned interior is
/// compared a whole pattern-length at a time with a byte-level tail.
fn first_difference(observed: &[u8], text: &[u8], phase: i16) -> Option<(usize, u8, u8)> {
    let len = text.len();
    assert!(len >= 1);
    assert!((phase as usize) < len);

    let mut rotated = vec![0u8; len];
    for (i, b) in rotated.iter_mut().enumerate() {
        *b = text[(phase as usize + i) % len];
    }

    let mut chunks = observed.chunks_exact(len);
    let mut offset = 0usize;
    for chunk in &mut chunks {
        if chunk != rotated.as_slice() {
            let at = chunk
                .iter()
                .zip(rotated.iter())
                .position(|(a, b)| a != b)
                .expect("chunk differed but no differing byte found");
            return Some((offset + at, rotated[at], chunk[at]));
        }
        offset += len;
    }

    let tail = chunks.remainder();
    if let Some(at) = tail
        .iter()
        .zip(rotated.iter())
        .position(|(a, b)| a != b)
    {
        return Some((offset + at, rotated[at], tail[at]));
    }

    None
}
