//! blkverify — point it at a production-candidate storage stack and let it
//! prove, byte for byte, that reads return what writes stored.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use blkverify::config;
use blkverify::constants::{IO_DEPTH_DEFAULT, PHASE_INTERVAL_DEFAULT_SECS};
use blkverify::device::{Device, Options as DeviceOptions};
use blkverify::error::Error;
use blkverify::runner::{Runner, RunnerOptions};
use blkverify::trace::TraceLog;

#[derive(Parser)]
#[command(
    name = "blkverify",
    about = "Block-device data-integrity verifier: random direct-I/O writes, \
             overlap-aware expected state, byte-for-byte read verification"
)]
struct Cli {
    /// Block device (or image file) to verify. Its contents are destroyed.
    #[arg(long)]
    disk: PathBuf,

    /// Target in-flight window.
    #[arg(long, default_value_t = IO_DEPTH_DEFAULT, value_parser = clap::value_parser!(u32).range(1..=512))]
    iodepth: u32,

    /// Fraction of the device's sectors to target.
    #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(u8).range(1..=100))]
    percent: u8,

    /// Size mix: bs:pct[,bs:pct...], bs in bytes (sector multiples), Σpct <= 100.
    #[arg(long, default_value = "8192:20,4096:10")]
    blocksize: String,

    /// Total runtime: <num><unit>, unit in s|m|h|d.
    #[arg(long, default_value = "1h")]
    runtime: String,

    /// Wall-clock seconds between write and verify phases.
    #[arg(long, default_value_t = PHASE_INTERVAL_DEFAULT_SECS)]
    phase_interval: u64,

    /// Workload seed; the same seed replays the same I/O stream.
    #[arg(long, default_value_t = 1)]
    seed: u32,

    /// Diagnostics directory for the per-I/O trace log.
    #[arg(long)]
    logpath: Option<PathBuf>,

    /// Open the target without O_DIRECT (image-file testing only).
    #[arg(long)]
    no_direct: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(Error::Integrity(mismatch)) => {
            tracing::error!(%mismatch, "integrity failure; aborting to preserve state");
            // Abort rather than exit: a core dump at the failing state is
            // worth more than a clean shutdown.
            std::process::abort();
        }
        Err(err) => {
            tracing::error!(%err, "fatal");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Error> {
    let size_mix = config::parse_size_mix(&cli.blocksize)?;
    let runtime = config::parse_runtime(&cli.runtime)?;

    let device = Device::open(DeviceOptions {
        path: &cli.disk,
        direct_io: !cli.no_direct,
    })?;

    tracing::info!(
        disk = %device.path().display(),
        size_bytes = device.size_bytes(),
        sectors = device.nsectors(),
        "target opened"
    );

    let trace = match &cli.logpath {
        Some(dir) => Some(TraceLog::create(dir)?),
        None => None,
    };

    let mut runner: Runner<blkverify::io::DefaultBackend> = Runner::new(
        device,
        trace,
        RunnerOptions {
            iodepth: cli.iodepth,
            seed: cli.seed,
            percent: cli.percent,
            size_mix,
            phase_interval: Duration::from_secs(cli.phase_interval),
            runtime,
        },
    )?;

    runner.run()
}
