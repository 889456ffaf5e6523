//! Target device access: open, size probe, fd handoff.

use std::fs::{File, OpenOptions};
#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use crate::constants::{byte_to_sector, SECTOR_SIZE};
use crate::error::Error;

/// `BLKGETSIZE64`: size-in-bytes ioctl for block devices.
/// `_IOR(0x12, 114, size_t)` — not exported by libc.
#[cfg(target_os = "linux")]
const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

/// An open verification target.
///
/// Holds the device (or image file) open for the process lifetime; the fd is
/// handed to the I/O engine for every submission. Direct I/O is the normal
/// mode against real devices and is switched off only for tests on
/// filesystems that reject O_DIRECT.
///
/// # Invariants
///
/// - `fd >= 0`
/// - `size_bytes > 0` and sector-aligned (probed size is truncated down)
#[derive(Debug)]
pub struct Device {
    file: File,
    fd: RawFd,
    path: PathBuf,
    size_bytes: u64,
}

/// Configuration for opening a target.
pub struct Options<'a> {
    pub path: &'a Path,
    pub direct_io: bool,
}

impl Device {
    /// Opens the target read-write and probes its capacity.
    ///
    /// Block devices are sized via `BLKGETSIZE64`; regular files (test
    /// images) fall back to their metadata length, truncated to a sector
    /// multiple.
    ///
    /// # Errors
    ///
    /// [`Error::Open`] / [`Error::SizeProbe`] with path context, or
    /// [`Error::TargetTooSmall`] for targets that cannot hold a single
    /// maximum-size I/O.
    pub fn open(opts: Options<'_>) -> Result<Self, Error> {
        assert!(!opts.path.as_os_str().is_empty());

        let mut oo = OpenOptions::new();
        oo.read(true).write(true);

        #[cfg(target_os = "linux")]
        if opts.direct_io {
            oo.custom_flags(libc::O_DIRECT);
        }

        let file = oo.open(opts.path).map_err(|source| Error::Open {
            path: opts.path.to_path_buf(),
            source,
        })?;

        let fd = file.as_raw_fd();
        assert!(fd >= 0);

        let probed = probe_size(&file, opts.path)?;
        let size_bytes = probed - probed % SECTOR_SIZE as u64;

        if byte_to_sector(size_bytes) < crate::constants::IO_SECTORS_MAX as u64 {
            return Err(Error::TargetTooSmall {
                path: opts.path.to_path_buf(),
            });
        }

        let device = Self {
            file,
            fd,
            path: opts.path.to_path_buf(),
            size_bytes,
        };
        device.assert_invariants();

        Ok(device)
    }

    #[inline]
    fn assert_invariants(&self) {
        assert!(self.fd >= 0);
        assert!(self.size_bytes > 0);
        assert!(self.size_bytes.is_multiple_of(SECTOR_SIZE as u64));
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.assert_invariants();
        self.fd
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Target capacity in bytes (sector-aligned).
    #[inline]
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Target capacity in sectors.
    #[inline]
    pub fn nsectors(&self) -> u64 {
        byte_to_sector(self.size_bytes)
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

fn probe_size(file: &File, path: &Path) -> Result<u64, Error> {
    let meta = file.metadata().map_err(|source| Error::SizeProbe {
        path: path.to_path_buf(),
        source,
    })?;

    if meta.file_type().is_block_device() {
        #[cfg(target_os = "linux")]
        {
            let mut size: u64 = 0;
            // SAFETY: fd is valid for the lifetime of `file`; BLKGETSIZE64
            // writes a u64 through the pointer.
            let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
            if rc < 0 {
                return Err(Error::SizeProbe {
                    path: path.to_path_buf(),
                    source: std::io::Error::last_os_error(),
                });
            }
            return Ok(size);
        }
        #[cfg(not(target_os = "linux"))]
        {
            return Err(Error::SizeProbe {
                path: path.to_path_buf(),
                source: std::io::Error::other("block device sizing unsupported on this platform"),
            });
        }
    }

    Ok(meta.len())
}
