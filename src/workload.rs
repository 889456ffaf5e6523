//! Workload generation: an infinite lazy stream of `(sector, nsectors)`.
//!
//! Sizes come from a weight-quota scan over the configured mix; sectors come
//! from a Zipf draw over the target span. The Zipf hot set concentrates
//! rewrites on the same regions, which is the point: overlapping rewrites
//! are the expected-state registry's hard case.

use crate::constants::IO_SECTORS_MAX;
use crate::rand::{Uniform, Zipf};

/// Spatial skew of the sector draw. fio's default for skewed disk workloads.
pub const ZIPF_THETA: f64 = 0.9;

/// One entry of the configured size mix, with its observed I/O count.
#[derive(Debug, Clone)]
pub struct SizeClass {
    nsectors: u32,
    percent: u8,
    nios: u64,
}

impl SizeClass {
    #[inline]
    pub fn nsectors(&self) -> u32 {
        self.nsectors
    }

    #[inline]
    pub fn percent(&self) -> u8 {
        self.percent
    }

    /// I/Os issued at this size so far.
    #[inline]
    pub fn nios(&self) -> u64 {
        self.nios
    }
}

/// Produces `(sector, nsectors)` pairs, forever.
///
/// # Size selection
///
/// Classes are scanned in descending percent order; the first class whose
/// observed share `100·nios/total` is below its configured percent wins.
/// When every class is at quota, the size falls through to a uniform draw in
/// `[1, IO_SECTORS_MAX]`, so the empirical distribution converges to the
/// configured mix while still covering the tail.
///
/// # Post-conditions (asserted)
///
/// `base <= sector`, `sector + nsectors <= base + span`, `nsectors >= 1`.
#[derive(Debug)]
pub struct Workload {
    base_sector: u64,
    /// Full target span in sectors, as configured.
    span_sectors: u64,
    /// Zipf item space: the span minus one maximum I/O, so any draw plus any
    /// size stays inside the target.
    draw_span: u64,
    size_rand: Uniform,
    sector_rand: Zipf,
    total_ios: u64,
    classes: Vec<SizeClass>,
}

impl Workload {
    /// # Panics
    ///
    /// - `span_sectors` must exceed one maximum I/O
    /// - every mix entry must have `1 <= nsectors <= IO_SECTORS_MAX` and a
    ///   non-zero percent (the config layer enforces the Σ ≤ 100 rule)
    pub fn new(base_sector: u64, span_sectors: u64, sizes: &[(u32, u8)], seed: u32) -> Self {
        assert!(span_sectors > IO_SECTORS_MAX as u64);

        let draw_span = span_sectors - IO_SECTORS_MAX as u64;

        let mut classes: Vec<SizeClass> = sizes
            .iter()
            .map(|&(nsectors, percent)| {
                assert!(nsectors >= 1);
                assert!(nsectors <= IO_SECTORS_MAX);
                assert!(percent >= 1);
                SizeClass {
                    nsectors,
                    percent,
                    nios: 0,
                }
            })
            .collect();
        classes.sort_by(|a, b| b.percent.cmp(&a.percent));

        Self {
            base_sector,
            span_sectors,
            draw_span,
            size_rand: Uniform::new(seed, 1, IO_SECTORS_MAX as u64),
            sector_rand: Zipf::new(ZIPF_THETA, draw_span, seed),
            total_ios: 0,
            classes,
        }
    }

    /// Draws the next `(sector, nsectors)`.
    pub fn next_io(&mut self) -> (u64, u32) {
        self.total_ios += 1;

        let mut nsectors: u32 = 0;
        for class in &mut self.classes {
            if 100 * class.nios / self.total_ios < class.percent as u64 {
                nsectors = class.nsectors;
                class.nios += 1;
                break;
            }
        }

        if nsectors == 0 {
            nsectors = self.size_rand.next() as u32;
            assert!(nsectors >= 1 && nsectors <= IO_SECTORS_MAX);

            // Uniform draws still count against a matching class's quota.
            if let Some(class) = self.classes.iter_mut().find(|c| c.nsectors == nsectors) {
                class.nios += 1;
            }
        }

        let drawn = self.sector_rand.next();
        assert!(drawn < self.draw_span);
        let sector = self.base_sector + drawn;

        assert!(sector >= self.base_sector);
        assert!(sector + nsectors as u64 <= self.base_sector + self.span_sectors);
        assert!(nsectors >= 1);

        (sector, nsectors)
    }

    #[inline]
    pub fn total_ios(&self) -> u64 {
        self.total_ios
    }

    /// Size classes with observed counts, in descending percent order.
    pub fn classes(&self) -> &[SizeClass] {
        &self.classes
    }
}
