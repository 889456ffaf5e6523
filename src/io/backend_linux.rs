#![cfg(target_os = "linux")]

//! io_uring backend.
//!
//! The completion ring plays the role the eventfd counter plays for libaio:
//! a readiness source that is drained in bounded batches until it reports
//! empty. Reaping is capped at [`REAP_BATCH_MAX`] entries per pass so a
//! completion storm cannot starve submission of refill I/O.

use std::io;

use io_uring::{opcode, types, IoUring};

use crate::constants::REAP_BATCH_MAX;
use crate::io::{IoBackend, Operation};

pub struct UringBackend {
    ring: IoUring,
}

impl IoBackend for UringBackend {
    const ENTRIES_MIN: u32 = 1;
    const ENTRIES_MAX: u32 = 4096;

    fn new(entries: u32) -> io::Result<Self> {
        assert!(entries >= Self::ENTRIES_MIN);
        assert!(entries <= Self::ENTRIES_MAX);
        assert!(entries.is_power_of_two());

        let ring = IoUring::new(entries)?;
        Ok(Self { ring })
    }

    unsafe fn try_push(&mut self, op: &Operation, user_data: u64) -> Result<(), ()> {
        let sqe = match *op {
            Operation::Read {
                fd,
                buf,
                len,
                offset,
            } => opcode::Read::new(types::Fd(fd), buf.as_ptr(), len)
                .offset(offset)
                .build()
                .user_data(user_data),
            Operation::Write {
                fd,
                buf,
                len,
                offset,
            } => opcode::Write::new(types::Fd(fd), buf.as_ptr(), len)
                .offset(offset)
                .build()
                .user_data(user_data),
            Operation::Nop => opcode::Nop::new().build().user_data(user_data),
        };

        // SAFETY: Caller guarantees the buffers described by `op` stay valid
        // and immovable until the corresponding completion is reaped.
        unsafe { self.ring.submission().push(&sqe).map_err(|_| ()) }
    }

    fn flush(&mut self, wait_for_one: bool) -> io::Result<()> {
        if wait_for_one {
            self.ring.submit_and_wait(1)?;
        } else {
            self.ring.submit()?;
        }
        Ok(())
    }

    fn drain<F: FnMut(u64, i32)>(&mut self, mut f: F) {
        loop {
            let mut reaped: u32 = 0;
            let mut cq = self.ring.completion();
            for cqe in &mut cq {
                f(cqe.user_data(), cqe.result());
                reaped += 1;
                if reaped == REAP_BATCH_MAX {
                    break;
                }
            }
            drop(cq);
            if reaped == 0 {
                break;
            }
        }
    }
}
