//! Binary per-I/O trace log.
//!
//! Every submitted I/O appends one fixed-width record to a file in the
//! diagnostics directory. When the verifier finds a mismatch, the records
//! overlapping the failed range are dumped before the process aborts: the
//! trace answers "which writes and reads ever touched these sectors, and
//! when". Replay tooling is out of scope; the format exists for post-mortem
//! reading.

use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::constants::sector_to_byte;
use crate::expect::SectorRange;

/// One trace entry. Fixed width on disk: 19 bytes, little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRecord {
    /// Seconds since the Unix epoch at submission.
    pub timestamp: u64,
    pub sector: u64,
    pub nsectors: u16,
    pub is_read: bool,
}

impl TraceRecord {
    pub const ENCODED_LEN: usize = 8 + 8 + 2 + 1;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..8].copy_from_slice(&self.timestamp.to_le_bytes());
        out[8..16].copy_from_slice(&self.sector.to_le_bytes());
        out[16..18].copy_from_slice(&self.nsectors.to_le_bytes());
        out[18] = self.is_read as u8;
        out
    }

    /// # Panics
    ///
    /// Panics if the read flag byte is neither 0 nor 1 (a torn or foreign
    /// file; the trace is only ever read by its own writer).
    pub fn decode(bytes: &[u8; Self::ENCODED_LEN]) -> Self {
        let flag = bytes[18];
        assert!(flag <= 1, "corrupt trace record: flag byte {flag}");
        Self {
            timestamp: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            sector: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            nsectors: u16::from_le_bytes(bytes[16..18].try_into().unwrap()),
            is_read: flag == 1,
        }
    }

    fn range(&self) -> SectorRange {
        SectorRange::new(self.sector, self.nsectors as u32)
    }
}

/// Append-only trace writer with a post-mortem dump.
pub struct TraceLog {
    path: PathBuf,
    writer: BufWriter<File>,
    nrecords: u64,
}

impl TraceLog {
    /// Creates (or truncates) `dir/blkverify.trace`.
    pub fn create(dir: &Path) -> std::io::Result<Self> {
        let path = dir.join("blkverify.trace");
        let file = File::create(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            nrecords: 0,
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn nrecords(&self) -> u64 {
        self.nrecords
    }

    /// Appends one record; timestamps it now.
    pub fn append(&mut self, sector: u64, nsectors: u16, is_read: bool) -> std::io::Result<()> {
        assert!(nsectors >= 1);

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock before Unix epoch")
            .as_secs();

        let record = TraceRecord {
            timestamp,
            sector,
            nsectors,
            is_read,
        };
        self.writer.write_all(&record.encode())?;
        self.nrecords += 1;
        Ok(())
    }

    /// Dumps every record overlapping `range` via `tracing`, with a summary
    /// of the non-overlapping traffic between hits. Called on an integrity
    /// finding, before abort.
    pub fn dump_overlapping(&mut self, range: SectorRange) -> std::io::Result<()> {
        self.writer.flush()?;

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(0))?;

        let mut nreads = 0u64;
        let mut nwrites = 0u64;
        let mut bytes_read = 0u64;
        let mut bytes_written = 0u64;
        let mut hits = 0u64;

        let mut buf = [0u8; TraceRecord::ENCODED_LEN];
        loop {
            match file.read_exact(&mut buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let record = TraceRecord::decode(&buf);

            if record.range().overlaps(&range) {
                if nreads + nwrites > 0 {
                    tracing::error!(
                        nreads,
                        bytes_read,
                        nwrites,
                        bytes_written,
                        "intervening traffic"
                    );
                    nreads = 0;
                    nwrites = 0;
                    bytes_read = 0;
                    bytes_written = 0;
                }
                hits += 1;
                tracing::error!(
                    timestamp = record.timestamp,
                    op = if record.is_read { "R" } else { "W" },
                    sector = record.sector,
                    nsectors = record.nsectors,
                    "trace hit"
                );
            } else if record.is_read {
                nreads += 1;
                bytes_read += sector_to_byte(record.nsectors as u64);
            } else {
                nwrites += 1;
                bytes_written += sector_to_byte(record.nsectors as u64);
            }
        }

        tracing::error!(hits, range = %range, "trace dump complete");
        Ok(())
    }
}
