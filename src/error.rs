//! Error taxonomy.
//!
//! Three classes, per the tool's purpose:
//!
//! 1. **Integrity findings** ([`Error::Integrity`]): the verifier observed
//!    bytes that differ from the expected-state model. This is the tool's
//!    product, not an incidental failure; the binary logs diagnostics and
//!    aborts so the failing state is preserved.
//! 2. **Environmental failures** (everything else here): cannot open or
//!    probe the target, kernel rejected setup or submission. Fatal at first
//!    occurrence, reported with context.
//! 3. Transient kernel signals (`EAGAIN` on the completion source) never
//!    surface as errors; backends absorb them and the loop re-polls.
//!
//! Invariant violations (double-registered intervals, short direct I/O) are
//! fail-stop panics, not `Err` values: they mean the process state can no
//! longer be trusted.

use std::path::PathBuf;

use crate::verify::Mismatch;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to probe size of {path}: {source}")]
    SizeProbe {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{path}: target is empty or smaller than one maximum I/O")]
    TargetTooSmall { path: PathBuf },

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error("data integrity violation: {0}")]
    Integrity(#[from] Mismatch),
}

pub type Result<T> = std::result::Result<T, Error>;
