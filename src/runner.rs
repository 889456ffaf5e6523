//! Phase-driven verification loop.
//!
//! One thread owns everything: the I/O engine, the expected-state registry,
//! the verifier, the timers. The loop alternates WRITE and VERIFY phases on
//! a timer, keeping `iodepth` I/Os in flight within a phase and draining to
//! zero at every switch so that verify reads are ordered after all recorded
//! writes.
//!
//! # Completion flow
//!
//! The engine's completion callback does the minimum: validate the transfer
//! and mark the slot done. Verification, registry updates, and refill
//! submission all happen from the loop turn after the drain returns, so no
//! callback ever re-enters submission.
//!
//! # Concurrent-write hazard
//!
//! If two in-flight writes overlap, the on-disk outcome is undefined and the
//! registry cannot reason about it. Submission scans the slot pool for
//! overlapping in-flight writes and demotes both sides to non-unique; a
//! non-unique completion evicts every stored claim it overlaps instead of
//! recording one, leaving the region a gap until a later clean write.

use core::ffi::c_void;
use std::time::{Duration, Instant};

use crate::buffer::IoBuf;
use crate::constants::{sector_to_byte, IO_DEPTH_MAX, IO_DEPTH_MIN, IO_SECTORS_MAX};
use crate::device::Device;
use crate::error::Error;
use crate::expect::{ExpectedRegistry, Pattern, SectorRange};
use crate::io::{Completion, IoBackend, IoCore, Operation};
use crate::stats::IoStats;
use crate::trace::TraceLog;
use crate::verify::Verifier;
use crate::workload::Workload;

/// Operating mode. Transitions only via the drain barrier in [`Runner::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Write,
    Verify,
}

impl Phase {
    #[inline]
    fn other(self) -> Phase {
        match self {
            Phase::Write => Phase::Verify,
            Phase::Verify => Phase::Write,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Inflight,
    /// Completion delivered; awaiting loop-turn processing.
    Done,
}

/// One in-flight I/O: owns its buffer from submission until the loop turn
/// that consumes the completion.
struct IoSlot {
    completion: Completion,
    state: SlotState,
    buf: Option<IoBuf>,
    range: Option<SectorRange>,
    pattern: Option<Pattern>,
    is_read: bool,
    /// Cleared when this write overlaps another in-flight write.
    unique: bool,
    submitted_at: Instant,
}

impl IoSlot {
    fn new() -> Self {
        Self {
            completion: Completion::new(),
            state: SlotState::Free,
            buf: None,
            range: None,
            pattern: None,
            is_read: false,
            unique: true,
            submitted_at: Instant::now(),
        }
    }
}

/// Validates the kernel's result and parks the slot for loop-turn
/// processing. Runs inside the engine drain; must not submit.
///
/// # Safety
///
/// `ctx` must point to the [`IoSlot`] that owns `completion`, pinned in the
/// runner's slot pool.
unsafe fn io_complete_trampoline(ctx: *mut c_void, completion: &mut Completion) {
    assert!(!ctx.is_null());

    // SAFETY: ctx was set to the owning slot at submission; the pool is a
    // boxed slice that never moves.
    let slot = unsafe { &mut *(ctx as *mut IoSlot) };
    assert!(slot.state == SlotState::Inflight);

    let range = slot.range.expect("in-flight slot without a range");
    if completion.result < 0 {
        let errno = -completion.result;
        panic!(
            "{} failed: errno={errno} range={range}",
            if slot.is_read { "read" } else { "write" },
        );
    }

    // Short direct I/O against a block device is a device failure, full stop.
    let expected = slot.buf.as_ref().expect("in-flight slot without a buffer").len();
    let transferred = completion.result as usize;
    if transferred != expected {
        panic!(
            "short {}: {transferred} != {expected} at range={range}",
            if slot.is_read { "read" } else { "write" },
        );
    }

    slot.state = SlotState::Done;
}

/// Loop configuration.
pub struct RunnerOptions {
    /// Target in-flight window, `1..=512`.
    pub iodepth: u32,
    /// Workload seed; one seed reproduces the whole run.
    pub seed: u32,
    /// Fraction of the device's sectors to target, `1..=100`.
    pub percent: u8,
    /// Size mix as `(nsectors, percent)`; may be empty.
    pub size_mix: Vec<(u32, u8)>,
    /// Wall-clock interval between phase switches.
    pub phase_interval: Duration,
    /// Total wall-clock runtime.
    pub runtime: Duration,
}

/// The phase controller: owns the device, the engine, and all verification
/// state.
pub struct Runner<B: IoBackend> {
    io: IoCore<B>,
    device: Device,
    registry: ExpectedRegistry,
    verifier: Verifier,
    workload: Workload,
    stats: IoStats,
    trace: Option<TraceLog>,

    slots: Box<[IoSlot]>,
    free: Vec<u16>,

    phase: Phase,
    mode_switching: bool,
    runtime_complete: bool,
    phase_interval: Duration,
    runtime: Duration,
    phase_deadline: Instant,
    runtime_deadline: Instant,
}

impl<B: IoBackend> Runner<B> {
    /// # Panics
    ///
    /// Panics if `iodepth` or `percent` is out of range.
    ///
    /// # Errors
    ///
    /// Engine setup failure, or a target whose configured fraction is too
    /// small to hold a maximum-size I/O.
    pub fn new(
        device: Device,
        trace: Option<TraceLog>,
        opts: RunnerOptions,
    ) -> Result<Self, Error> {
        assert!(opts.iodepth >= IO_DEPTH_MIN);
        assert!(opts.iodepth <= IO_DEPTH_MAX);
        assert!(opts.percent >= 1 && opts.percent <= 100);

        let span = device.nsectors() * opts.percent as u64 / 100;
        if span <= IO_SECTORS_MAX as u64 {
            return Err(Error::TargetTooSmall {
                path: device.path().to_path_buf(),
            });
        }

        let workload = Workload::new(0, span, &opts.size_mix, opts.seed);
        let io = IoCore::new(opts.iodepth.next_power_of_two())?;

        let slots: Box<[IoSlot]> = (0..opts.iodepth).map(|_| IoSlot::new()).collect();
        let free: Vec<u16> = (0..opts.iodepth as u16).rev().collect();

        let now = Instant::now();
        Ok(Self {
            io,
            device,
            registry: ExpectedRegistry::new(),
            verifier: Verifier::new(),
            workload,
            stats: IoStats::new(),
            trace,
            slots,
            free,
            phase: Phase::Write,
            mode_switching: false,
            runtime_complete: false,
            phase_interval: opts.phase_interval,
            runtime: opts.runtime,
            phase_deadline: now,
            runtime_deadline: now,
        })
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn registry(&self) -> &ExpectedRegistry {
        &self.registry
    }

    pub fn verifier(&self) -> &Verifier {
        &self.verifier
    }

    pub fn stats(&self) -> &IoStats {
        &self.stats
    }

    pub fn workload(&self) -> &Workload {
        &self.workload
    }

    /// Drives the loop until the runtime expires or an integrity finding
    /// surfaces.
    ///
    /// On any error, remaining in-flight I/O is drained (results discarded)
    /// before returning, so the engine is idle at teardown; the caller
    /// decides how loudly to die.
    pub fn run(&mut self) -> Result<(), Error> {
        let result = self.run_inner();
        if result.is_err() {
            self.drain_quietly();
        }
        result
    }

    fn run_inner(&mut self) -> Result<(), Error> {
        let now = Instant::now();
        self.phase_deadline = now + self.phase_interval;
        self.runtime_deadline = now + self.runtime;

        tracing::info!(
            target_sectors = self.device.nsectors(),
            iodepth = self.slots.len(),
            "verification loop starting in write phase"
        );

        self.fill_window()?;

        loop {
            self.io.tick().map_err(Error::Io)?;

            let completed = self.collect_completed();
            for idx in completed {
                self.process_completion(idx)?;
            }

            let now = Instant::now();
            if now >= self.runtime_deadline {
                self.runtime_complete = true;
            }
            if !self.mode_switching && !self.runtime_complete && now >= self.phase_deadline {
                self.mode_switching = true;
                tracing::info!(phase = ?self.phase, "phase switch requested; draining");
            }

            if self.runtime_complete {
                if self.io.pending() == 0 {
                    break;
                }
                // Keep ticking until the window drains.
            } else if self.mode_switching {
                if self.io.pending() == 0 {
                    self.switch_phase();
                    self.fill_window()?;
                }
            } else {
                self.fill_window()?;
            }
        }

        self.log_stats("runtime complete");
        Ok(())
    }

    /// Flips the phase at the drain barrier and re-arms the timer.
    fn switch_phase(&mut self) {
        assert!(self.mode_switching);
        assert!(self.io.pending() == 0);
        assert!(self.free.len() == self.slots.len());

        self.mode_switching = false;
        self.phase = self.phase.other();
        self.phase_deadline = Instant::now() + self.phase_interval;

        self.log_stats("phase switch");
        tracing::info!(phase = ?self.phase, "entering phase");
    }

    /// Submits fresh I/Os of the current phase until the window is full.
    fn fill_window(&mut self) -> Result<(), Error> {
        while self.submit_one()? {}
        Ok(())
    }

    /// Submits one I/O drawn from the workload. Returns `false` when the
    /// window is already full.
    fn submit_one(&mut self) -> Result<bool, Error> {
        if self.free.is_empty() {
            return Ok(false);
        }
        let (sector, nsectors) = self.workload.next_io();
        self.submit_io(sector, nsectors)?;
        Ok(true)
    }

    /// Submits a specific I/O of the current phase.
    fn submit_io(&mut self, sector: u64, nsectors: u32) -> Result<(), Error> {
        let idx = self.free.pop().expect("submit_io with a full window");
        let range = SectorRange::new(sector, nsectors);
        let is_read = self.phase == Phase::Verify;

        let mut unique = true;
        if !is_read {
            // Concurrent-write hazard: demote both sides to non-unique.
            for (i, slot) in self.slots.iter_mut().enumerate() {
                if i == idx as usize || slot.state == SlotState::Free || slot.is_read {
                    continue;
                }
                let in_flight = slot.range.expect("busy slot without a range");
                if in_flight.overlaps(&range) {
                    slot.unique = false;
                    unique = false;
                }
            }
        }

        if let Some(trace) = &mut self.trace {
            trace.append(sector, nsectors as u16, is_read).map_err(Error::Io)?;
        }

        let mut buf = IoBuf::for_sectors(nsectors);
        let pattern = if is_read {
            None
        } else {
            let pattern = Pattern::tag(sector, nsectors);
            pattern.fill(buf.as_mut_slice());
            Some(pattern)
        };

        let fd = self.device.fd();
        let slot = &mut self.slots[idx as usize];
        assert!(slot.state == SlotState::Free);
        assert!(slot.completion.is_idle());

        slot.buf = Some(buf);
        slot.range = Some(range);
        slot.pattern = pattern;
        slot.is_read = is_read;
        slot.unique = unique;
        slot.submitted_at = Instant::now();
        slot.state = SlotState::Inflight;

        let buf = slot.buf.as_mut().expect("buffer just stored");
        let op = if is_read {
            Operation::Read {
                fd,
                buf: core::ptr::NonNull::new(buf.as_mut_ptr()).expect("buffer pointer is null"),
                len: buf.len() as u32,
                offset: sector_to_byte(sector),
            }
        } else {
            Operation::Write {
                fd,
                buf: core::ptr::NonNull::new(buf.as_mut_ptr()).expect("buffer pointer is null"),
                len: buf.len() as u32,
                offset: sector_to_byte(sector),
            }
        };

        let ctx = (slot as *mut IoSlot).cast::<c_void>();
        self.io.submit(&mut slot.completion, op, ctx, io_complete_trampoline);

        Ok(())
    }

    /// Indices of slots whose completions arrived during the last drain.
    fn collect_completed(&self) -> Vec<u16> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state == SlotState::Done)
            .map(|(i, _)| i as u16)
            .collect()
    }

    /// Consumes one completed slot: verify reads, record or evict for
    /// writes, release the buffer, return the slot to the free list.
    fn process_completion(&mut self, idx: u16) -> Result<(), Error> {
        let slot = &mut self.slots[idx as usize];
        assert!(slot.state == SlotState::Done);

        let range = slot.range.take().expect("done slot without a range");
        let buf = slot.buf.take().expect("done slot without a buffer");
        let pattern = slot.pattern.take();
        let is_read = slot.is_read;
        let unique = slot.unique;
        let latency_us = slot.submitted_at.elapsed().as_micros() as u64;

        slot.state = SlotState::Free;
        slot.unique = true;
        self.free.push(idx);

        if is_read {
            self.stats.record_read(buf.len() as u64, latency_us);
            if let Err(mismatch) = self.verifier.verify(&self.registry, buf.as_slice(), range) {
                tracing::error!(%mismatch, "integrity violation");
                if let Some(trace) = &mut self.trace {
                    if let Err(err) = trace.dump_overlapping(range) {
                        tracing::error!(%err, "trace dump failed");
                    }
                }
                return Err(Error::Integrity(mismatch));
            }
        } else {
            self.stats.record_write(buf.len() as u64, latency_us);
            let pattern = pattern.expect("write slot without a pattern");
            if unique {
                self.registry.record_write(range, pattern);
            } else {
                let evicted = self.registry.evict_overlapping(range);
                tracing::warn!(
                    range = %range,
                    evicted,
                    "overlapping in-flight writes; claims forfeited"
                );
            }
        }

        Ok(())
    }

    /// Drains remaining in-flight I/O, discarding results. Used on the error
    /// path so the engine is idle before teardown.
    fn drain_quietly(&mut self) {
        loop {
            for idx in self.collect_completed() {
                let slot = &mut self.slots[idx as usize];
                slot.range = None;
                slot.buf = None;
                slot.pattern = None;
                slot.state = SlotState::Free;
                slot.unique = true;
                self.free.push(idx);
            }
            if self.io.pending() == 0 {
                break;
            }
            if self.io.tick().is_err() {
                break;
            }
        }
    }

    fn log_stats(&self, context: &str) {
        tracing::info!(
            context,
            phase = ?self.phase,
            nwrites = self.stats.nwrites(),
            nreads = self.stats.nreads(),
            bytes_written = self.stats.bytes_written(),
            bytes_read = self.stats.bytes_read(),
            write_latency_avg_us = self.stats.write_latency_avg_us(),
            read_latency_avg_us = self.stats.read_latency_avg_us(),
            reads_verified = self.verifier.nverified(),
            sectors_verified = self.verifier.sectors_verified(),
            sectors_skipped = self.verifier.sectors_skipped(),
            intervals = self.registry.len(),
            covered_sectors = self.registry.covered_sectors(),
            "stats"
        );
    }
}
