use anyhow::{anyhow, bail, Result};
use clap::Parser;
use log::{error, info, warn};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

#[cfg(unix)]
use nix::fcntl::{flock, FlockArg};
#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use ptpsync::clock::SystemClock;
use ptpsync::config::PtpConfig;
use ptpsync::datasets::ClockIdentity;
use ptpsync::drift::{FileDriftStore, NoDriftStore};
use ptpsync::net::{self, UdpNetwork};
use ptpsync::protocol::PtpPort;
use ptpsync::status::{self, SyncStatus};
use ptpsync::traits::DriftStore;

/// Set from the signal handler, polled by the main loop.
static STEP_REQUESTED: AtomicBool = AtomicBool::new(false);
static DUMP_REQUESTED: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Network interface (default: first non-loopback IPv4 interface)
    #[arg(short, long)]
    interface: Option<String>,

    /// Never become master
    #[arg(short, long, default_value_t = false)]
    slave_only: bool,

    /// PTP domain number
    #[arg(short, long)]
    domain: Option<u8>,

    /// Debug logging
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    /// Print the effective configuration as JSON and exit
    #[arg(long, default_value_t = false)]
    dump_config: bool,
}

fn load_config(args: &Args) -> Result<PtpConfig> {
    let mut config = match &args.config {
        Some(path) => PtpConfig::load(path)?,
        None => PtpConfig::default(),
    };

    if let Some(interface) = &args.interface {
        config.global.interface = Some(interface.clone());
    }
    if args.slave_only {
        config.ptpengine.slave_only = true;
    }
    if let Some(domain) = args.domain {
        config.ptpengine.domain_number = domain;
    }

    config.validate()?;
    Ok(config)
}

fn acquire_singleton_lock(path: &Path) -> Result<File> {
    let file = File::create(path).map_err(|e| anyhow!("Failed to create lock file {}: {}", path.display(), e))?;

    #[cfg(unix)]
    {
        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(_) => {}
            Err(nix::errno::Errno::EAGAIN) => {
                bail!("Another instance of ptpsync is already running! (Lockfile: {})", path.display())
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(file)
}

#[cfg(unix)]
extern "C" fn on_operator_signal(signal: libc::c_int) {
    match signal {
        libc::SIGUSR1 => STEP_REQUESTED.store(true, Ordering::SeqCst),
        libc::SIGUSR2 => DUMP_REQUESTED.store(true, Ordering::SeqCst),
        _ => {}
    }
}

/// SIGUSR1 steps the clock to the current offset, SIGUSR2 dumps the counters.
#[cfg(unix)]
fn install_operator_signals() -> Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let action = SigAction::new(
        SigHandler::Handler(on_operator_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // The handler only touches atomics.
    unsafe {
        sigaction(Signal::SIGUSR1, &action)?;
        sigaction(Signal::SIGUSR2, &action)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn install_operator_signals() -> Result<()> {
    Ok(())
}

fn enable_realtime_priority() {
    #[cfg(unix)]
    {
        unsafe {
            let policy = libc::SCHED_FIFO;
            let param = libc::sched_param { sched_priority: 50 };

            if libc::sched_setscheduler(0, policy, &param) == 0 {
                info!("Realtime priority (SCHED_FIFO, 50) enabled successfully.");
            } else {
                let err = std::io::Error::last_os_error();
                warn!("Failed to set realtime priority: {}. Latency might suffer.", err);
            }
        }
    }
}

fn notify_systemd(state: &str) {
    #[cfg(target_os = "linux")]
    {
        let notify = match state {
            "ready" => sd_notify::NotifyState::Ready,
            _ => sd_notify::NotifyState::Stopping,
        };
        if let Err(e) = sd_notify::notify(false, &[notify]) {
            log::debug!("sd_notify failed: {}", e);
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = state;
}

fn write_status(path: Option<&Path>, status: &Arc<RwLock<SyncStatus>>, counters: &ptpsync::counters::PortCounters) {
    let Some(path) = path else {
        return;
    };
    let snapshot = match status.read() {
        Ok(s) => s.clone(),
        Err(_) => return,
    };
    if let Err(e) = status::write_status_file(path, &snapshot, counters) {
        warn!("Failed to write status file: {:#}", e);
    }
}

fn run<C, D>(
    config: PtpConfig,
    clock: C,
    drift_store: D,
    network: UdpNetwork,
    identity: ClockIdentity,
    running: Arc<AtomicBool>,
) -> Result<()>
where
    C: SystemClock,
    D: DriftStore,
{
    let status = Arc::new(RwLock::new(SyncStatus::default()));
    let status_file = config.global.status_file.clone();
    let status_interval = Duration::from_secs(config.global.statistics_interval.max(1) as u64);

    let mut port = PtpPort::new(config, identity, clock, network, drift_store, status.clone());

    notify_systemd("ready");
    info!("Starting PTP loop...");

    let mut last = Instant::now();
    let mut last_status = Instant::now();

    while running.load(Ordering::SeqCst) {
        port.wait();

        let now = Instant::now();
        port.run_iteration(now - last);
        last = now;

        if STEP_REQUESTED.swap(false, Ordering::SeqCst) {
            port.step_now();
        }
        if DUMP_REQUESTED.swap(false, Ordering::SeqCst) {
            port.dump_counters();
        }

        if last_status.elapsed() >= status_interval {
            write_status(status_file.as_deref(), &status, port.counters());
            last_status = Instant::now();
        }
    }

    notify_systemd("stopping");
    port.shutdown();
    write_status(status_file.as_deref(), &status, port.counters());
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::builder()
        .format_timestamp(None)
        .filter_level(level)
        .parse_default_env()
        .init();

    let config = load_config(&args)?;
    if args.dump_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let _lock_file = match acquire_singleton_lock(&config.global.lock_file) {
        Ok(f) => f,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;
    install_operator_signals()?;

    enable_realtime_priority();

    let clock = match ptpsync::clock::LinuxClock::new() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to initialize system clock adjustment: {}", e);
            error!("Ensure you are running as root.");
            return Err(e);
        }
    };
    info!("System clock control initialized.");

    let interface = net::find_interface(config.global.interface.as_deref())?;
    info!("Selected Interface: {} ({})", interface.name, interface.address);
    let identity = interface.clock_identity();
    info!("Clock identity {}", identity);

    let network = UdpNetwork::new(interface, config.ptpengine.ip_mode)?;

    let result = match config.clock.drift_file.clone() {
        Some(path) => run(config, clock, FileDriftStore::new(path), network, identity, running),
        None => run(config, clock, NoDriftStore, network, identity, running),
    };

    info!("Exiting.");
    result
}
