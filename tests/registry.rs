//! End-to-end registry and verifier scenarios with literal values.

use blkverify::constants::sector_to_byte;
use blkverify::expect::{ExpectedRegistry, Pattern, SectorRange, Segment};
use blkverify::verify::Verifier;

fn range(start: u64, count: u32) -> SectorRange {
    SectorRange::new(start, count)
}

/// Renders the device bytes the registry claims for `probe`, gaps filled
/// with `gap_fill`.
fn render(registry: &ExpectedRegistry, probe: SectorRange, gap_fill: u8) -> Vec<u8> {
    let mut buf = vec![gap_fill; sector_to_byte(probe.count() as u64) as usize];
    for segment in registry.coverage(probe) {
        if let Segment::Covered {
            range: sub,
            pattern,
            phase,
        } = segment
        {
            let start = sector_to_byte(sub.start() - probe.start()) as usize;
            let end = start + sector_to_byte(sub.count() as u64) as usize;
            Pattern::with_phase(pattern.text(), phase).fill(&mut buf[start..end]);
        }
    }
    buf
}

#[test]
fn two_disjoint_writes_then_wide_verify() {
    let mut registry = ExpectedRegistry::new();

    registry.record_write(range(1000, 500), Pattern::new("A"));
    assert_eq!(registry.len(), 1);

    registry.record_write(range(2000, 500), Pattern::new("B"));
    assert_eq!(registry.len(), 2);

    // A read spanning both intervals and the gaps around them verifies:
    // gap bytes are unconstrained.
    let probe = range(1000, 3000);
    let buf = render(&registry, probe, 0xC3);
    let mut verifier = Verifier::new();
    verifier.verify(&registry, &buf, probe).unwrap();
    assert_eq!(verifier.sectors_verified(), 1000);
    assert_eq!(verifier.sectors_skipped(), 2000);
}

#[test]
fn exact_overwrite_updates_pattern_in_place() {
    let mut registry = ExpectedRegistry::new();
    registry.record_write(range(1000, 500), Pattern::new("A"));
    registry.record_write(range(1000, 500), Pattern::new("B"));

    assert_eq!(registry.len(), 1);
    let iv = registry.iter().next().unwrap();
    assert_eq!(iv.range, range(1000, 500));
    assert_eq!(iv.pattern.text(), "B");
    assert_eq!(iv.pattern.phase(), 0);
}

#[test]
fn interior_rewrite_splits_into_three() {
    let mut registry = ExpectedRegistry::new();
    registry.record_write(range(1000, 2000), Pattern::new("A"));
    registry.record_write(range(1300, 200), Pattern::new("A"));

    assert_eq!(registry.len(), 3);
    let ivs: Vec<_> = registry.iter().collect();

    assert_eq!(ivs[0].range, range(1000, 300));
    assert_eq!(ivs[0].pattern.phase(), 0);

    assert_eq!(ivs[1].range, range(1300, 200));
    assert_eq!(ivs[1].pattern.phase(), 0);

    assert_eq!(ivs[2].range, range(1500, 1500));
    // len("A") == 1, so every phase folds to 0.
    assert_eq!(ivs[2].pattern.phase(), 0);

    for iv in &ivs {
        assert_eq!(iv.pattern.text(), "A");
    }
}

#[test]
fn interior_rewrite_suffix_phase_uses_distance_from_original_start() {
    // Same shape as above but with a pattern long enough to expose the
    // suffix phase arithmetic: the suffix starts 500 sectors past the
    // original interval's start.
    let p = Pattern::new("abcdefghijk"); // len 11
    let mut registry = ExpectedRegistry::new();
    registry.record_write(range(1000, 2000), p.clone());
    registry.record_write(range(1300, 200), Pattern::new("Z"));

    let ivs: Vec<_> = registry.iter().collect();
    assert_eq!(ivs[2].range, range(1500, 1500));
    assert_eq!(ivs[2].pattern.phase(), ((500u64 * 512) % 11) as i16);
    // The suffix's first byte is what the original write placed there.
    assert_eq!(ivs[2].pattern.byte_at(0), p.byte_at(500 * 512));
}

#[test]
fn large_write_swallows_small() {
    let mut registry = ExpectedRegistry::new();
    registry.record_write(range(1000, 100), Pattern::new("X"));
    registry.record_write(range(1000, 500), Pattern::new("Y"));

    assert_eq!(registry.len(), 1);
    let iv = registry.iter().next().unwrap();
    assert_eq!(iv.range, range(1000, 500));
    assert_eq!(iv.pattern.text(), "Y");
    assert_eq!(iv.pattern.phase(), 0);
}

#[test]
fn phase_preserved_under_repeated_truncation() {
    const S: u64 = 4096;
    const N: u32 = 64;
    const K: u32 = 17;
    let p = Pattern::new("0123456789abc"); // L = 13
    let l = p.len() as u64;

    let mut registry = ExpectedRegistry::new();
    registry.record_write(range(S, N), p.clone());
    registry.record_write(range(S, K), Pattern::new("Q"));

    let residual = registry
        .iter()
        .find(|iv| iv.range.start() == S + K as u64)
        .expect("residual missing");
    assert_eq!(residual.range, range(S + K as u64, N - K));
    assert_eq!(
        residual.pattern.phase(),
        ((K as u64 * 512) % l) as i16
    );

    // Every surviving sector still reads what the original write put there.
    for j in 0..(N - K) as u64 {
        assert_eq!(
            residual.pattern.byte_at(j * 512),
            p.byte_at((K as u64 + j) * 512),
        );
    }

    // Truncate again: phases accumulate.
    registry.record_write(range(S + K as u64, 5), Pattern::new("R"));
    let residual = registry
        .iter()
        .find(|iv| iv.range.start() == S + K as u64 + 5)
        .expect("second residual missing");
    assert_eq!(
        residual.pattern.phase(),
        (((K as u64 + 5) * 512) % l) as i16
    );
    assert_eq!(residual.pattern.byte_at(0), p.byte_at((K as u64 + 5) * 512));
}

#[test]
fn forfeited_region_verifies_as_gap() {
    let mut registry = ExpectedRegistry::new();
    registry.record_write(range(1000, 500), Pattern::new("A"));
    registry.record_write(range(1200, 500), Pattern::new("B"));

    // Two in-flight writes overlapped; on completion the whole region's
    // claims are forfeited.
    let evicted = registry.evict_overlapping(range(1000, 700));
    assert_eq!(evicted, 2);
    assert!(registry.is_empty());

    // Any bytes in [1000, 1699] now verify: the region is a gap.
    let probe = range(1000, 700);
    let garbage = vec![0x5Au8; sector_to_byte(700) as usize];
    let mut verifier = Verifier::new();
    verifier.verify(&registry, &garbage, probe).unwrap();
    assert_eq!(verifier.sectors_skipped(), 700);

    // A subsequent clean write re-establishes expectation.
    registry.record_write(range(1100, 100), Pattern::new("C"));
    let buf = render(&registry, probe, 0x00);
    verifier.verify(&registry, &buf, probe).unwrap();
    assert_eq!(verifier.sectors_verified(), 100);
}

#[test]
fn overwrite_storm_preserves_disjointness_and_content() {
    // Deterministic storm of overlapping writes; after each write the
    // registry must stay disjoint and agree with a per-sector shadow model.
    use std::collections::HashMap;

    let mut registry = ExpectedRegistry::new();
    let mut shadow: HashMap<u64, u8> = HashMap::new();
    let mut rand = blkverify::rand::Tausworthe::new(7);

    for i in 0..500 {
        let start = (rand.next() % 4000) as u64;
        let count = 1 + rand.next() % 64;
        let r = range(start, count);
        let p = Pattern::tag(start, count);

        // Shadow: first byte of each sector, as the write lays it down.
        for s in start..=r.end() {
            let offset = sector_to_byte(s - start);
            shadow.insert(s, p.byte_at(offset));
        }
        registry.record_write(r, p);

        if i % 50 == 0 {
            let ivs: Vec<_> = registry.iter().collect();
            for pair in ivs.windows(2) {
                assert!(pair[0].range.end() < pair[1].range.start());
            }
        }
    }

    // Every covered sector's first expected byte matches the shadow.
    for iv in registry.iter() {
        for s in iv.range.start()..=iv.range.end() {
            let offset = sector_to_byte(s - iv.range.start());
            assert_eq!(
                iv.pattern.byte_at(offset),
                shadow[&s],
                "sector {s} diverged from shadow"
            );
        }
    }
}
