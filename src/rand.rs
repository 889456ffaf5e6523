//! Deterministic random sources for workload generation.
//!
//! Ported from fio's Tausworthe generator and Zipf distribution so that a
//! run is reproducible from a single `u32` seed: the same seed replays the
//! same sector/size stream, which turns any corruption finding into a
//! repeatable test case.

/// Three-register Tausworthe PRNG (fio's `__rand`, itself from the kernel's
/// old `prandom`). Period ~2^88.
#[derive(Debug, Clone)]
pub struct Tausworthe {
    s1: u32,
    s2: u32,
    s3: u32,
}

impl Tausworthe {
    pub const RAND_MAX: u32 = u32::MAX;

    /// Seeds the three registers.
    ///
    /// Register seeding follows fio byte for byte — including its
    /// `(2^31) + (2^17) + (2^7)` initializer, which in C is XOR rather than
    /// exponentiation and evaluates to 53. Kept as-is so streams match the
    /// lineage.
    pub fn new(seed: u32) -> Self {
        const INIT: u64 = (2 ^ 31) + (2 ^ 17) + (2 ^ 7);

        let lcg = |x: u64, seed: u32| -> u64 { x.wrapping_mul(69069) ^ seed as u64 };
        let seed_reg = |x: u32, m: u32| -> u32 { if x < m { x + m } else { x } };

        let s1 = seed_reg(lcg(INIT, seed) as u32, 1);
        let s2 = seed_reg(lcg(s1 as u64, seed) as u32, 7);
        let s3 = seed_reg(lcg(s2 as u64, seed) as u32, 15);

        Self { s1, s2, s3 }
    }

    pub fn next(&mut self) -> u32 {
        let tausworthe =
            |s: u32, a: u32, b: u32, c: u32, d: u32| -> u32 { ((s & c) << d) ^ (((s << a) ^ s) >> b) };

        self.s1 = tausworthe(self.s1, 13, 19, 4294967294, 12);
        self.s2 = tausworthe(self.s2, 2, 25, 4294967288, 4);
        self.s3 = tausworthe(self.s3, 3, 11, 4294967280, 17);

        self.s1 ^ self.s2 ^ self.s3
    }
}

/// Zipf distribution over `[0, nitems)`, fio variant.
///
/// Raw Zipf ranks cluster the hot items at the low end of the space; fio
/// scatters them by multiplying with a 64-bit golden-ratio prime and adding
/// a per-instance random offset, so the hot set lands at reproducible but
/// arbitrary positions. Overlapping rewrites of those hot positions are
/// exactly the traffic this tool wants to generate.
#[derive(Debug, Clone)]
pub struct Zipf {
    rand: Tausworthe,
    theta: f64,
    nitems: u64,
    /// Precalculated zeta(min(nitems, ZETA_ITEMS_MAX), theta).
    zetan: f64,
    /// Precalculated zeta(2, theta).
    zeta2: f64,
    rand_off: u64,
    seed: u32,
}

impl Zipf {
    /// Caps the zeta precalculation; beyond ~10M items the sum has long
    /// converged for any theta worth running.
    const ZETA_ITEMS_MAX: u64 = 10_000_000;

    const GR_PRIME_64: u64 = 0x9e37_ffff_fffc_0001;

    /// # Panics
    ///
    /// Panics if `nitems == 0` or `theta` is not in `(0, 1)`.
    pub fn new(theta: f64, nitems: u64, seed: u32) -> Self {
        assert!(nitems >= 1);
        assert!(theta > 0.0 && theta < 1.0);

        let mut rand = Tausworthe::new(seed);

        let n = nitems.min(Self::ZETA_ITEMS_MAX);
        let mut zetan = 0.0f64;
        for i in 1..=n {
            zetan += (1.0 / i as f64).powf(theta);
        }

        let zeta2 = 1.0f64.powf(theta) + 0.5f64.powf(theta);
        let rand_off = rand.next() as u64;

        Self {
            rand,
            theta,
            nitems,
            zetan,
            zeta2,
            rand_off,
            seed,
        }
    }

    pub fn next(&mut self) -> u64 {
        let n = self.nitems;
        let alpha = 1.0 / (1.0 - self.theta);
        let eta = (1.0 - (2.0 / n as f64).powf(1.0 - self.theta)) / (1.0 - self.zeta2 / self.zetan);

        let rand_uni = self.rand.next() as f64 / Tausworthe::RAND_MAX as f64;
        let rand_z = rand_uni * self.zetan;

        let val: u64 = if rand_z < 1.0 {
            1
        } else if rand_z < 1.0 + 0.5f64.powf(self.theta) {
            2
        } else {
            1 + (n as f64 * (eta * rand_uni - eta + 1.0).powf(alpha)) as u64
        };

        let result = (val - 1)
            .wrapping_mul(Self::GR_PRIME_64)
            .wrapping_add(self.rand_off)
            % self.nitems;
        assert!(result < self.nitems);
        result
    }

    #[inline]
    pub fn seed(&self) -> u32 {
        self.seed
    }
}

/// Uniform distribution over the closed range `[min, max]`.
#[derive(Debug, Clone)]
pub struct Uniform {
    rand: Tausworthe,
    min: u64,
    max: u64,
}

impl Uniform {
    /// # Panics
    ///
    /// Panics if `min > max`.
    pub fn new(seed: u32, min: u64, max: u64) -> Self {
        assert!(min <= max);
        Self {
            rand: Tausworthe::new(seed),
            min,
            max,
        }
    }

    pub fn next(&mut self) -> u64 {
        let span = self.max - self.min + 1;
        let value = self.min + (self.rand.next() as u64) % span;
        assert!(value >= self.min && value <= self.max);
        value
    }

    #[inline]
    pub fn min(&self) -> u64 {
        self.min
    }

    #[inline]
    pub fn max(&self) -> u64 {
        self.max
    }
}
