//! storsampd - Host storage metrics sampler daemon.
//!
//! Samples mounted filesystems on a fixed interval and prints one JSON
//! record per (device, mountpoint) pair to stdout, one line per record.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use storsamp::{Config, StorageSampler};

#[cfg(target_os = "linux")]
use storsamp::probe::{LinuxDeviceMapper, LinuxProbe, RealFs, effective_supported_filesystems};
#[cfg(not(target_os = "linux"))]
use storsamp::probe::{MockMapper, MockProbe};

/// Host storage metrics sampler daemon.
#[derive(Parser)]
#[command(name = "storsampd", about = "Host storage metrics sampler daemon", version)]
struct Args {
    /// Path to a JSON configuration file. Command-line flags override it.
    #[arg(short, long)]
    config: Option<String>,

    /// Sampling interval in seconds. Zero disables sampling.
    #[arg(short, long)]
    interval: Option<i64>,

    /// Path to /proc filesystem (for testing/mocking).
    #[arg(long, default_value = "/proc")]
    proc_path: String,

    /// Host root prefix when running containerized with the host
    /// filesystem bind-mounted (e.g. /host). Implies containerized mode.
    #[arg(long, value_name = "PATH")]
    host_root: Option<String>,

    /// Device-name substring to exclude from sampling. Repeatable.
    #[arg(long = "ignore-device", value_name = "SUBSTRING")]
    ignored_devices: Vec<String>,

    /// Restrict sampling to this filesystem type. Repeatable; names
    /// outside the built-in supported set are dropped.
    #[arg(long = "filesystem", value_name = "FSTYPE")]
    filesystems: Vec<String>,

    /// Sample once and exit.
    #[arg(long)]
    once: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("storsampd={}", level).parse().unwrap())
        .add_directive(format!("storsamp={}", level).parse().unwrap());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Builds the effective configuration from an optional file plus flags.
fn load_config(args: &Args) -> Result<Config, String> {
    let mut config = match &args.config {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .map_err(|e| format!("can't read config file '{}': {}", path, e))?;
            serde_json::from_str(&content)
                .map_err(|e| format!("invalid config file '{}': {}", path, e))?
        }
        None => Config::default(),
    };

    if let Some(interval) = args.interval {
        config.sample_rate_secs = interval;
    }
    if let Some(root) = &args.host_root {
        config.is_containerized = true;
        config.override_host_root = Some(root.into());
    }
    if !args.ignored_devices.is_empty() {
        config.file_devices_ignored = args.ignored_devices.clone();
    }
    if !args.filesystems.is_empty() {
        config.custom_supported_filesystems = args.filesystems.clone();
    }
    Ok(config)
}

fn main() {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    info!("storsampd {} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Config: interval={}s, proc={}, containerized={}",
        config.sample_rate_secs, args.proc_path, config.is_containerized
    );

    #[cfg(target_os = "linux")]
    let mut sampler = {
        let supported = effective_supported_filesystems(&config.custom_supported_filesystems);
        let probe = LinuxProbe::new(
            RealFs::new(),
            &args.proc_path,
            config.override_host_root.clone(),
            supported,
        );
        let mapper = LinuxDeviceMapper::new(config.override_host_root.clone());
        StorageSampler::new(config, probe, mapper)
    };
    #[cfg(not(target_os = "linux"))]
    let mut sampler = {
        warn!("no native storage probe for this platform, running with an empty probe");
        StorageSampler::new(config, MockProbe::new(), MockMapper::new())
    };

    if sampler.is_disabled() {
        info!("sampling disabled by configuration, exiting");
        return;
    }
    sampler.on_startup();

    let interval = sampler.interval();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    info!("Starting sampling loop");

    let mut cycle_count: u64 = 0;
    let stdout = std::io::stdout();

    while running.load(Ordering::SeqCst) {
        match sampler.sample() {
            Ok(batch) => {
                cycle_count += 1;
                debug!("Cycle #{}: {} samples", cycle_count, batch.len());

                use std::io::Write;
                let mut out = stdout.lock();
                for sample in &batch {
                    match serde_json::to_string(sample) {
                        Ok(line) => {
                            if let Err(e) = writeln!(out, "{}", line) {
                                error!("Failed to write sample: {}", e);
                                running.store(false, Ordering::SeqCst);
                                break;
                            }
                        }
                        Err(e) => error!("Failed to encode sample: {}", e),
                    }
                }
            }
            Err(e) => {
                error!("Sampling cycle failed: {}", e);
            }
        }

        if args.once {
            break;
        }

        // Sleep with periodic checks for shutdown signal
        let sleep_interval = Duration::from_millis(100);
        let mut remaining = interval;
        while remaining > Duration::ZERO && running.load(Ordering::SeqCst) {
            let sleep_time = remaining.min(sleep_interval);
            std::thread::sleep(sleep_time);
            remaining = remaining.saturating_sub(sleep_time);
        }
    }

    info!("Shutdown complete");
}
