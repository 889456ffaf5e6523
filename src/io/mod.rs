//! Async direct-I/O submission/completion multiplexing.
//!
//! The API is split into:
//! - [`IoBackend`]: what the verifier demands of a kernel async-I/O binding
//! - [`Operation`]: read/write description (fd, aligned buffer, offset)
//! - [`Completion`]: per-op state and callback
//! - [`IoCore`]: submission queues, inflight accounting, completion drain
//!
//! # Safety / Ownership
//!
//! `Completion` values must have a stable address while an operation is in
//! flight or queued. Buffers are caller-owned; this layer stores raw pointers
//! and identifies completions via `user_data` (`Completion*` cast to `u64`).

pub mod backend_sync;

#[cfg(target_os = "linux")]
pub mod backend_linux;

use core::ffi::c_void;
use core::ptr::NonNull;
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;

use crate::constants::{BUFFER_ALIGN, IO_SIZE_MAX, SECTOR_SIZE};

/// Platform-default backend: io_uring where available, synchronous
/// pread/pwrite elsewhere.
#[cfg(target_os = "linux")]
pub use backend_linux::UringBackend as DefaultBackend;
#[cfg(not(target_os = "linux"))]
pub use backend_sync::SyncBackend as DefaultBackend;

/// Platform-default I/O instance. Use this type alias for portable code.
pub type Io = IoCore<DefaultBackend>;

/// Backend abstraction over a kernel async-I/O binding.
///
/// Callers queue operations, flush them to the kernel, then drain
/// completions. This is the narrow contract the engine demands of libaio,
/// io_uring, or any equivalent: aligned-direct-I/O submission and a
/// counter-style completion source that can be drained to empty.
pub trait IoBackend {
    /// Minimum supported queue entries for this backend.
    const ENTRIES_MIN: u32;
    /// Maximum supported queue entries for this backend (inclusive).
    const ENTRIES_MAX: u32;

    /// Initialize the backend with a fixed queue depth.
    fn new(entries: u32) -> io::Result<Self>
    where
        Self: Sized;

    /// Queue an operation for submission.
    ///
    /// # Safety
    ///
    /// - `op` must describe memory regions that remain valid until completion
    /// - `user_data` must be retrievable via [`drain`](Self::drain) to
    ///   identify the completion
    ///
    /// Returns `Err(())` if the submission queue is full; caller should flush
    /// and retry.
    unsafe fn try_push(&mut self, op: &Operation, user_data: u64) -> Result<(), ()>;

    /// Submit queued operations to the kernel.
    ///
    /// If `wait_for_one` is true, blocks until at least one completion is
    /// available.
    fn flush(&mut self, wait_for_one: bool) -> io::Result<()>;

    /// Process all available completions without blocking.
    ///
    /// Invokes `f(user_data, result)` for each completion, where `result` is
    /// the byte count on success or a negated errno on failure. Backends reap
    /// in bounded batches ([`REAP_BATCH_MAX`](crate::constants::REAP_BATCH_MAX))
    /// and loop until the completion source reports empty.
    fn drain<F: FnMut(u64, i32)>(&mut self, f: F);
}

/// Lifecycle state of a [`Completion`].
/// State machine: `Idle -> Queued -> Submitted -> Completed -> Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    /// Available for use. Initial and terminal state.
    Idle,
    /// Queued locally, not yet submitted to kernel.
    Queued,
    /// Submitted to kernel, awaiting completion.
    Submitted,
    /// Kernel reported completion; result is available.
    Completed,
}

/// Describes a single direct I/O.
///
/// # Buffer Ownership
///
/// `Read` and `Write` hold raw pointers to caller-owned buffers. Buffers must
/// remain valid and immovable until completion. `len` is `u32`: a single I/O
/// never exceeds [`IO_SIZE_MAX`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// No operation. Sentinel for uninitialized [`Completion`]s.
    Nop,
    /// Read from `fd` at byte `offset` into `buf[0..len]`.
    Read {
        fd: RawFd,
        buf: NonNull<u8>,
        len: u32,
        offset: u64,
    },
    /// Write `buf[0..len]` to `fd` at byte `offset`.
    Write {
        fd: RawFd,
        buf: NonNull<u8>,
        len: u32,
        offset: u64,
    },
}

impl Operation {
    /// Returns `true` if this is an actual I/O (not [`Nop`](Self::Nop)).
    #[inline]
    pub fn is_active(&self) -> bool {
        !matches!(self, Operation::Nop)
    }

    /// Returns `true` for reads.
    #[inline]
    pub fn is_read(&self) -> bool {
        matches!(self, Operation::Read { .. })
    }

    /// Asserts the direct-I/O invariants for this operation.
    ///
    /// # Panics
    ///
    /// Panics on invalid fd, zero or oversized length, sector-unaligned
    /// length or offset, or a buffer that is not page-aligned.
    pub fn validate(&self) {
        match *self {
            Operation::Read {
                fd,
                buf,
                len,
                offset,
            }
            | Operation::Write {
                fd,
                buf,
                len,
                offset,
            } => {
                assert!(fd >= 0, "file descriptor must be non-negative");
                assert!(len > 0, "length must be positive");
                assert!(len <= IO_SIZE_MAX, "length exceeds maximum I/O size");
                assert!(
                    len.is_multiple_of(SECTOR_SIZE),
                    "length must be a sector multiple"
                );
                assert!(
                    offset.is_multiple_of(SECTOR_SIZE as u64),
                    "offset must be a sector multiple"
                );
                assert!(
                    (buf.as_ptr() as usize).is_multiple_of(BUFFER_ALIGN),
                    "buffer must be page-aligned for direct I/O"
                );
            }
            Operation::Nop => {}
        }
    }
}

/// Callback signature for completion notification.
///
/// # Safety
///
/// Called from [`Completion::complete`]. The `context` pointer must be valid
/// for the chosen callback, and the [`Completion`] is already back in
/// [`Idle`](CompletionState::Idle).
pub type CompletionCallback = unsafe fn(*mut c_void, &mut Completion);

/// Tracks the lifecycle of a single I/O operation.
///
/// Typical flow: create in `Idle`, submit via [`IoCore`], and the registered
/// callback fires once the kernel reports the result.
pub struct Completion {
    state: CompletionState,

    /// Result from the kernel: byte count on success, negated errno on failure.
    pub result: i32,
    /// The operation that was performed.
    pub op: Operation,

    /// User-provided context passed to the callback.
    pub context: *mut c_void,
    /// Callback invoked when the operation completes.
    pub callback: Option<CompletionCallback>,
}

impl Completion {
    /// Creates a new completion in the `Idle` state.
    pub const fn new() -> Self {
        Self {
            state: CompletionState::Idle,
            result: 0,
            op: Operation::Nop,
            context: core::ptr::null_mut(),
            callback: None,
        }
    }

    #[inline]
    pub fn state(&self) -> CompletionState {
        self.state
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.state == CompletionState::Idle
    }

    /// Resets the completion for reuse.
    ///
    /// # Panics
    ///
    /// Panics if the completion is queued or submitted.
    pub fn reset(&mut self) {
        assert!(self.state == CompletionState::Idle || self.state == CompletionState::Completed);

        self.state = CompletionState::Idle;
        self.result = 0;
        self.op = Operation::Nop;
        self.context = core::ptr::null_mut();
        self.callback = None;

        assert!(self.is_idle());
    }

    /// Invokes the callback (if any) and transitions to `Idle`.
    ///
    /// # Panics
    ///
    /// Panics if not in `Completed` state.
    #[inline]
    pub fn complete(&mut self) {
        assert!(self.state == CompletionState::Completed);

        let cb = self.callback.take();
        let ctx = self.context;

        self.state = CompletionState::Idle;
        assert!(self.is_idle());

        if let Some(cb) = cb {
            // SAFETY: Caller guaranteed context validity at submission.
            unsafe { cb(ctx, self) };
        }
    }

    fn set_queued(&mut self) {
        assert!(self.state == CompletionState::Idle);
        self.state = CompletionState::Queued;
    }

    fn set_submitted(&mut self) {
        assert!(self.state == CompletionState::Queued || self.state == CompletionState::Idle);
        self.state = CompletionState::Submitted;
    }

    fn set_completed(&mut self) {
        assert!(self.state == CompletionState::Submitted);
        self.state = CompletionState::Completed;
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

/// Manages I/O submission and completion.
///
/// Wraps an [`IoBackend`] and queues locally when the backend is full, so a
/// submission burst larger than the kernel queue degrades to FIFO overflow
/// instead of an error.
///
/// # Invariants
///
/// - `inflight <= capacity` (enforced by overflow queuing)
/// - `total_completed <= total_submitted`
/// - Must be idle (no in-flight or queued operations) before drop
pub struct IoCore<B: IoBackend> {
    backend: B,
    /// Operations waiting for backend capacity, FIFO.
    overflow: VecDeque<NonNull<Completion>>,
    /// Operations submitted to the backend but not yet completed.
    inflight: u32,
    /// Maximum concurrent operations the backend supports.
    capacity: u32,

    // Metrics.
    total_submitted: u64,
    total_completed: u64,
}

impl<B: IoBackend> IoCore<B> {
    /// Creates a new I/O core with the specified queue depth.
    ///
    /// # Panics
    ///
    /// Panics if `entries` is outside `[ENTRIES_MIN, ENTRIES_MAX]` or not a
    /// power of two.
    pub fn new(entries: u32) -> io::Result<Self> {
        assert!(entries >= B::ENTRIES_MIN);
        assert!(entries <= B::ENTRIES_MAX);
        assert!(entries.is_power_of_two());

        Ok(Self {
            backend: B::new(entries)?,
            overflow: VecDeque::new(),
            inflight: 0,
            capacity: entries,
            total_submitted: 0,
            total_completed: 0,
        })
    }

    /// Returns `true` if no operations are in-flight or queued.
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.inflight == 0 && self.overflow.is_empty()
    }

    /// Live gauge of submitted-minus-completed, including local overflow.
    #[inline]
    pub fn pending(&self) -> u64 {
        self.total_submitted - self.total_completed
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    pub fn total_submitted(&self) -> u64 {
        self.total_submitted
    }

    #[inline]
    pub fn total_completed(&self) -> u64 {
        self.total_completed
    }

    /// Performs one iteration of the I/O loop: submit pending ops, flush, and
    /// reap completions. Returns the number of completions delivered.
    ///
    /// Blocks if any operations are in-flight (waits for at least one
    /// completion); returns immediately when idle.
    pub fn tick(&mut self) -> io::Result<u32> {
        let old_completed = self.total_completed;

        self.fill_from_overflow();
        self.backend.flush(self.inflight > 0)?;
        let reaped = self.drain_completions();

        assert!(self.total_completed == old_completed + reaped as u64);
        Ok(reaped)
    }

    /// Submits an I/O operation with a raw callback.
    ///
    /// # Panics
    ///
    /// - `completion` must be idle
    /// - `op` must be active and pass [`Operation::validate`]
    ///
    /// # Safety (Caller Obligations)
    ///
    /// - `completion` must not move or drop until its callback runs
    /// - `ctx` must remain valid until the callback is invoked
    /// - Any buffer in `op` must outlive the operation
    pub fn submit(
        &mut self,
        completion: &mut Completion,
        op: Operation,
        ctx: *mut c_void,
        cb: CompletionCallback,
    ) {
        assert!(completion.is_idle());
        assert!(op.is_active());

        op.validate();
        completion.reset();
        completion.op = op;
        completion.context = ctx;
        completion.callback = Some(cb);
        completion.result = 0;

        self.enqueue(completion);
        self.total_submitted += 1;
    }

    /// Submits an operation, queuing locally if the backend is full.
    #[inline]
    fn enqueue(&mut self, completion: &mut Completion) {
        let old_inflight = self.inflight;
        if self.try_submit_one(completion).is_ok() {
            completion.set_submitted();
            self.inflight += 1;
            assert!(self.inflight == old_inflight + 1);
            assert!(self.inflight <= self.capacity);
        } else {
            completion.set_queued();
            self.overflow.push_back(NonNull::from(completion));
            assert!(self.inflight == old_inflight);
        }
    }

    /// Attempts to push directly to the backend (no overflow queuing).
    #[inline]
    #[allow(clippy::result_unit_err)] // Simple full/accepted; matches IoBackend::try_push.
    fn try_submit_one(&mut self, completion: &mut Completion) -> Result<(), ()> {
        if self.inflight >= self.capacity {
            return Err(());
        }
        let user_data = completion as *mut Completion as u64;
        // SAFETY: Caller ensures completion and its buffers outlive the op.
        unsafe { self.backend.try_push(&completion.op, user_data) }
    }

    /// Submits overflowed operations until the backend is full or the queue
    /// is empty.
    fn fill_from_overflow(&mut self) {
        while let Some(mut node) = self.overflow.pop_front() {
            // SAFETY: Node came from our overflow queue; the caller keeps
            // queued completions alive and immovable.
            let completion = unsafe { node.as_mut() };
            assert!(completion.state() == CompletionState::Queued);
            let old_inflight = self.inflight;

            match self.try_submit_one(completion) {
                Ok(()) => {
                    completion.set_submitted();
                    self.inflight += 1;
                    assert!(self.inflight == old_inflight + 1);
                }
                Err(()) => {
                    // Backend is full; put it back (front, to keep FIFO order).
                    self.overflow.push_front(node);
                    assert!(self.inflight == old_inflight);
                    break;
                }
            }
        }
    }

    /// Reaps all available completions from the backend.
    fn drain_completions(&mut self) -> u32 {
        let mut reaped: u32 = 0;

        self.backend.drain(|user_data, result| {
            assert!(user_data != 0);
            // SAFETY: user_data was set to a valid Completion pointer in
            // try_submit_one; the caller keeps it alive until this callback.
            let completion = unsafe { &mut *(user_data as *mut Completion) };
            assert!(completion.state() == CompletionState::Submitted);

            completion.result = result;
            completion.set_completed();
            completion.complete();
            reaped += 1;
        });

        assert!(reaped <= self.inflight);
        self.inflight -= reaped;
        self.total_completed += reaped as u64;
        reaped
    }
}

impl<B: IoBackend> Drop for IoCore<B> {
    fn drop(&mut self) {
        // It is a logic error to drop the I/O system with in-flight ops.
        assert!(self.is_idle(), "IoCore dropped with in-flight operations");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Backend that accepts up to `entries` ops and completes them all on
    /// `flush`, with `result = len`. Exercises the IoCore state machine
    /// without touching a file.
    struct MockBackend {
        entries: u32,
        queued: Vec<(u64, i32)>,
        ready: VecDeque<(u64, i32)>,
    }

    impl IoBackend for MockBackend {
        const ENTRIES_MIN: u32 = 1;
        const ENTRIES_MAX: u32 = 4096;

        fn new(entries: u32) -> io::Result<Self> {
            Ok(Self {
                entries,
                queued: Vec::new(),
                ready: VecDeque::new(),
            })
        }

        unsafe fn try_push(&mut self, op: &Operation, user_data: u64) -> Result<(), ()> {
            if self.queued.len() + self.ready.len() >= self.entries as usize {
                return Err(());
            }
            let len = match *op {
                Operation::Read { len, .. } | Operation::Write { len, .. } => len as i32,
                Operation::Nop => 0,
            };
            self.queued.push((user_data, len));
            Ok(())
        }

        fn flush(&mut self, _wait_for_one: bool) -> io::Result<()> {
            self.ready.extend(self.queued.drain(..));
            Ok(())
        }

        fn drain<F: FnMut(u64, i32)>(&mut self, mut f: F) {
            while let Some((user_data, result)) = self.ready.pop_front() {
                f(user_data, result);
            }
        }
    }

    thread_local! {
        static COMPLETED: Cell<u32> = const { Cell::new(0) };
    }

    unsafe fn count_cb(_ctx: *mut c_void, completion: &mut Completion) {
        assert!(completion.is_idle());
        assert!(completion.result > 0);
        COMPLETED.with(|c| c.set(c.get() + 1));
    }

    fn write_op(buf: &crate::buffer::IoBuf, offset: u64) -> Operation {
        Operation::Write {
            fd: 0,
            buf: NonNull::new(buf.as_ptr() as *mut u8).unwrap(),
            len: buf.len() as u32,
            offset,
        }
    }

    #[test]
    fn submit_complete_single() {
        COMPLETED.with(|c| c.set(0));

        let mut io: IoCore<MockBackend> = IoCore::new(8).unwrap();
        let buf = crate::buffer::IoBuf::for_sectors(1);
        let mut completion = Completion::new();

        io.submit(
            &mut completion,
            write_op(&buf, 0),
            core::ptr::null_mut(),
            count_cb,
        );
        assert_eq!(io.pending(), 1);
        assert!(!io.is_idle());

        let reaped = io.tick().unwrap();
        assert_eq!(reaped, 1);
        assert_eq!(io.pending(), 0);
        assert!(io.is_idle());
        COMPLETED.with(|c| assert_eq!(c.get(), 1));
        assert!(completion.is_idle());
        assert_eq!(completion.result, 512);
    }

    #[test]
    fn overflow_queues_beyond_capacity() {
        COMPLETED.with(|c| c.set(0));

        let mut io: IoCore<MockBackend> = IoCore::new(2).unwrap();
        let bufs: Vec<_> = (0..5).map(|_| crate::buffer::IoBuf::for_sectors(1)).collect();
        let mut completions: Vec<Completion> = (0..5).map(|_| Completion::new()).collect();

        for (i, completion) in completions.iter_mut().enumerate() {
            io.submit(
                completion,
                write_op(&bufs[i], (i as u64) * 512),
                core::ptr::null_mut(),
                count_cb,
            );
        }
        assert_eq!(io.pending(), 5);

        // Two fit the backend; three overflowed locally.
        assert_eq!(
            completions
                .iter()
                .filter(|c| c.state() == CompletionState::Queued)
                .count(),
            3
        );

        let mut total = 0;
        while !io.is_idle() {
            total += io.tick().unwrap();
        }
        assert_eq!(total, 5);
        assert_eq!(io.pending(), 0);
        COMPLETED.with(|c| assert_eq!(c.get(), 5));
    }

    #[test]
    fn tick_when_idle_is_noop() {
        let mut io: IoCore<MockBackend> = IoCore::new(4).unwrap();
        assert_eq!(io.tick().unwrap(), 0);
        assert!(io.is_idle());
    }

    #[test]
    #[should_panic(expected = "length must be a sector multiple")]
    fn submit_rejects_unaligned_len() {
        let mut io: IoCore<MockBackend> = IoCore::new(4).unwrap();
        let buf = crate::buffer::IoBuf::for_sectors(1);
        let mut completion = Completion::new();
        let op = Operation::Write {
            fd: 0,
            buf: NonNull::new(buf.as_ptr() as *mut u8).unwrap(),
            len: 100,
            offset: 0,
        };
        io.submit(&mut completion, op, core::ptr::null_mut(), count_cb);
    }

    #[test]
    #[should_panic(expected = "offset must be a sector multiple")]
    fn submit_rejects_unaligned_offset() {
        let mut io: IoCore<MockBackend> = IoCore::new(4).unwrap();
        let buf = crate::buffer::IoBuf::for_sectors(1);
        let mut completion = Completion::new();
        let op = Operation::Write {
            fd: 0,
            buf: NonNull::new(buf.as_ptr() as *mut u8).unwrap(),
            len: 512,
            offset: 33,
        };
        io.submit(&mut completion, op, core::ptr::null_mut(), count_cb);
    }

    #[test]
    fn completion_state_machine() {
        let mut completion = Completion::new();
        assert!(completion.is_idle());

        completion.set_queued();
        assert_eq!(completion.state(), CompletionState::Queued);

        completion.set_submitted();
        assert_eq!(completion.state(), CompletionState::Submitted);

        completion.set_completed();
        assert_eq!(completion.state(), CompletionState::Completed);

        completion.complete();
        assert!(completion.is_idle());
    }

    #[test]
    #[should_panic(expected = "assertion failed")]
    fn complete_from_idle_panics() {
        let mut completion = Completion::new();
        completion.complete();
    }
}
