//! Synchronous pread/pwrite backend.
//!
//! Each operation executes at push time and its completion is parked until
//! the next drain. Deterministic and portable: used for tests, and as the
//! platform default where no kernel async binding is available. The
//! [`IoCore`](super::IoCore) state machine is identical either way, so the
//! verifier's semantics do not depend on which backend is underneath.

use std::collections::VecDeque;
use std::io;

use super::{IoBackend, Operation};

pub struct SyncBackend {
    entries: u32,
    /// Completions executed but not yet drained: `(user_data, result)`.
    ready: VecDeque<(u64, i32)>,
}

impl IoBackend for SyncBackend {
    const ENTRIES_MIN: u32 = 1;
    const ENTRIES_MAX: u32 = 4096;

    fn new(entries: u32) -> io::Result<Self> {
        assert!(entries >= Self::ENTRIES_MIN);
        assert!(entries <= Self::ENTRIES_MAX);

        Ok(Self {
            entries,
            ready: VecDeque::with_capacity(entries as usize),
        })
    }

    unsafe fn try_push(&mut self, op: &Operation, user_data: u64) -> Result<(), ()> {
        if self.ready.len() >= self.entries as usize {
            return Err(());
        }

        let result = match *op {
            Operation::Read {
                fd,
                buf,
                len,
                offset,
            } => {
                // SAFETY: Caller guarantees `buf[0..len]` is valid for writes
                // until completion; completion is immediate here.
                let rc = unsafe {
                    libc::pread(
                        fd,
                        buf.as_ptr().cast(),
                        len as usize,
                        offset as libc::off_t,
                    )
                };
                syscall_result(rc)
            }
            Operation::Write {
                fd,
                buf,
                len,
                offset,
            } => {
                // SAFETY: Caller guarantees `buf[0..len]` is valid for reads
                // until completion.
                let rc = unsafe {
                    libc::pwrite(
                        fd,
                        buf.as_ptr().cast(),
                        len as usize,
                        offset as libc::off_t,
                    )
                };
                syscall_result(rc)
            }
            Operation::Nop => 0,
        };

        self.ready.push_back((user_data, result));
        Ok(())
    }

    fn flush(&mut self, _wait_for_one: bool) -> io::Result<()> {
        // Work already happened at push time; completions are parked in
        // `ready` and the next drain delivers them.
        Ok(())
    }

    fn drain<F: FnMut(u64, i32)>(&mut self, mut f: F) {
        while let Some((user_data, result)) = self.ready.pop_front() {
            f(user_data, result);
        }
    }
}

/// Maps a raw syscall return to the completion convention: byte count on
/// success, negated errno on failure.
fn syscall_result(rc: isize) -> i32 {
    if rc < 0 {
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
        -errno
    } else {
        assert!(rc <= i32::MAX as isize);
        rc as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::IoBuf;
    use crate::io::{Completion, IoCore};
    use core::ffi::c_void;
    use core::ptr::NonNull;
    use std::cell::Cell;
    use std::io::{Read as _, Seek, SeekFrom};
    use std::os::unix::io::AsRawFd;

    thread_local! {
        static DONE: Cell<bool> = const { Cell::new(false) };
    }

    unsafe fn done_cb(_ctx: *mut c_void, completion: &mut Completion) {
        assert!(completion.result >= 0, "I/O failed: {}", -completion.result);
        DONE.with(|b| b.set(true));
    }

    #[test]
    fn write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync_backend_roundtrip");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.set_len(4096).unwrap();
        let fd = file.as_raw_fd();

        let mut io: IoCore<SyncBackend> = IoCore::new(4).unwrap();

        let mut wbuf = IoBuf::for_sectors(1);
        wbuf.as_mut_slice().fill(0x5A);
        let mut write = Completion::new();

        DONE.with(|b| b.set(false));
        io.submit(
            &mut write,
            crate::io::Operation::Write {
                fd,
                buf: NonNull::new(wbuf.as_mut_ptr()).unwrap(),
                len: 512,
                offset: 512,
            },
            core::ptr::null_mut(),
            done_cb,
        );
        io.tick().unwrap();
        DONE.with(|b| assert!(b.get()));
        assert_eq!(write.result, 512);

        let mut rbuf = IoBuf::for_sectors(1);
        let mut read = Completion::new();

        DONE.with(|b| b.set(false));
        io.submit(
            &mut read,
            crate::io::Operation::Read {
                fd,
                buf: NonNull::new(rbuf.as_mut_ptr()).unwrap(),
                len: 512,
                offset: 512,
            },
            core::ptr::null_mut(),
            done_cb,
        );
        io.tick().unwrap();
        DONE.with(|b| assert!(b.get()));
        assert_eq!(read.result, 512);
        assert!(rbuf.as_slice().iter().all(|&b| b == 0x5A));

        // Cross-check with buffered file I/O.
        let mut f = std::fs::File::open(&path).unwrap();
        f.seek(SeekFrom::Start(512)).unwrap();
        let mut check = [0u8; 512];
        f.read_exact(&mut check).unwrap();
        assert!(check.iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn write_on_readonly_fd_yields_negated_errno() {
        let mut io: IoCore<SyncBackend> = IoCore::new(4).unwrap();
        let mut buf = IoBuf::for_sectors(1);
        let mut completion = Completion::new();

        unsafe fn expect_err_cb(_ctx: *mut c_void, completion: &mut Completion) {
            assert_eq!(completion.result, -libc::EBADF);
        }

        // pwrite on a read-only descriptor fails with EBADF. The fd stays
        // open for the whole test, so no other thread can recycle it.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readonly");
        std::fs::write(&path, [0u8; 512]).unwrap();
        let file = std::fs::File::open(&path).unwrap();
        let fd = file.as_raw_fd();

        io.submit(
            &mut completion,
            crate::io::Operation::Write {
                fd,
                buf: NonNull::new(buf.as_mut_ptr()).unwrap(),
                len: 512,
                offset: 0,
            },
            core::ptr::null_mut(),
            expect_err_cb,
        );
        io.tick().unwrap();
        assert!(completion.is_idle());
    }

    #[test]
    fn short_read_past_eof_reports_zero() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(512).unwrap();
        let fd = file.as_raw_fd();

        let mut io: IoCore<SyncBackend> = IoCore::new(4).unwrap();
        let mut buf = IoBuf::for_sectors(1);
        let mut completion = Completion::new();

        unsafe fn expect_zero_cb(_ctx: *mut c_void, completion: &mut Completion) {
            assert_eq!(completion.result, 0);
        }

        io.submit(
            &mut completion,
            crate::io::Operation::Read {
                fd,
                buf: NonNull::new(buf.as_mut_ptr()).unwrap(),
                len: 512,
                offset: 4096,
            },
            core::ptr::null_mut(),
            expect_zero_cb,
        );
        io.tick().unwrap();
    }
}
