//! CLI value grammars.
//!
//! The binary's flag surface is clap's job; the two non-trivial value
//! grammars live here so they are unit-testable and reusable:
//!
//! - `blocksize`: `bs:pct[,bs:pct…]` — byte sizes with target percentages
//! - `runtime`: `<num><unit>` with unit in `s`, `m`, `h`, `d`

use std::time::Duration;

use crate::constants::{IO_SIZE_MAX, SECTOR_SHIFT, SECTOR_SIZE};

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("blocksize entry {entry:?}: expected <bytes>:<percent>")]
    SizeMixSyntax { entry: String },

    #[error("blocksize {bytes} is not a multiple of {SECTOR_SIZE}")]
    SizeMixUnaligned { bytes: u64 },

    #[error("blocksize {bytes} is out of range (512..={IO_SIZE_MAX})")]
    SizeMixOutOfRange { bytes: u64 },

    #[error("blocksize {bytes} listed twice")]
    SizeMixDuplicate { bytes: u64 },

    #[error("percent {percent} is out of range (1..=100)")]
    PercentOutOfRange { percent: u64 },

    #[error("size mix percentages sum to {sum}, exceeding 100")]
    PercentSumExceeded { sum: u64 },

    #[error("runtime {input:?}: expected <number><s|m|h|d>")]
    RuntimeSyntax { input: String },

    #[error("runtime must be non-zero")]
    RuntimeZero,
}

/// Parses `bs:pct[,bs:pct…]` into `(nsectors, percent)` entries.
///
/// Sizes are given in bytes on the command line (as users think of block
/// sizes) and converted to sectors here.
pub fn parse_size_mix(input: &str) -> Result<Vec<(u32, u8)>, ConfigError> {
    let mut mix: Vec<(u32, u8)> = Vec::new();
    let mut sum: u64 = 0;

    for entry in input.split(',') {
        let entry = entry.trim();
        let (bytes, percent) = entry
            .split_once(':')
            .ok_or_else(|| ConfigError::SizeMixSyntax {
                entry: entry.to_string(),
            })?;

        let bytes: u64 = bytes.parse().map_err(|_| ConfigError::SizeMixSyntax {
            entry: entry.to_string(),
        })?;
        let percent: u64 = percent.parse().map_err(|_| ConfigError::SizeMixSyntax {
            entry: entry.to_string(),
        })?;

        if !bytes.is_multiple_of(SECTOR_SIZE as u64) {
            return Err(ConfigError::SizeMixUnaligned { bytes });
        }
        if bytes < SECTOR_SIZE as u64 || bytes > IO_SIZE_MAX as u64 {
            return Err(ConfigError::SizeMixOutOfRange { bytes });
        }
        if !(1..=100).contains(&percent) {
            return Err(ConfigError::PercentOutOfRange { percent });
        }

        let nsectors = (bytes >> SECTOR_SHIFT) as u32;
        if mix.iter().any(|&(ns, _)| ns == nsectors) {
            return Err(ConfigError::SizeMixDuplicate { bytes });
        }

        sum += percent;
        if sum > 100 {
            return Err(ConfigError::PercentSumExceeded { sum });
        }

        mix.push((nsectors, percent as u8));
    }

    Ok(mix)
}

/// Parses `<num><unit>` where unit is `s`, `m`, `h`, or `d`.
pub fn parse_runtime(input: &str) -> Result<Duration, ConfigError> {
    let input = input.trim();
    let syntax = || ConfigError::RuntimeSyntax {
        input: input.to_string(),
    };

    if input.len() < 2 {
        return Err(syntax());
    }

    let (digits, unit) = input.split_at(input.len() - 1);
    let value: u64 = digits.parse().map_err(|_| syntax())?;

    let secs = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 60 * 60,
        "d" => value * 60 * 60 * 24,
        _ => return Err(syntax()),
    };

    if secs == 0 {
        return Err(ConfigError::RuntimeZero);
    }

    Ok(Duration::from_secs(secs))
}
