//! The PTP port: state machine, message handling and clock discipline.
//!
//! `PtpPort` owns every piece of per-port state (data sets, foreign masters,
//! grants, servo, filters, timers, counters) along with the clock, network and
//! drift store it drives. The daemon loop calls `wait` and then
//! `run_iteration`, which sweeps timers, runs the state actions (including a
//! deferred BMC) and drains a batch of received datagrams.
//!
//! Handlers never return errors; collaborator failures are logged and counted.

mod clock_update;
mod receive;
mod signaling;
mod state;
mod transmit;

#[cfg(test)]
mod tests;

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::bmc::BmcOptions;
use crate::clock::SystemClock;
use crate::config::PtpConfig;
use crate::counters::PortCounters;
use crate::datasets::{
    ClockIdentity, ClockQuality, CurrentDs, Datasets, DefaultDs, ParentDs, PortDs, PortIdentity, PortState,
    CLOCK_CLASS_SLAVE_ONLY,
};
use crate::filter::{build_outlier_filter, DelayFilter, OffsetFilter, OutlierFilter};
use crate::foreign::{ForeignKey, ForeignMasterTable};
use crate::ptp::PTP_VERSION;
use crate::servo::PiServo;
use crate::status::SyncStatus;
use crate::time::TimeInternal;
use crate::timer::{IntervalTimers, TimerService};
use crate::traits::{DriftStore, PtpNetwork};
use crate::unicast::{GrantLimits, UnicastGrantTable};

/// Datagrams handled per iteration before timers get another look.
const RECV_BATCH: usize = 32;
/// Longest the loop sleeps without a timer deadline.
const MAX_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct SyncExchange {
    waiting_for_follow_up: bool,
    sequence_id: u16,
    last_sequence_id: Option<u16>,
    /// t2
    receive_time: TimeInternal,
    correction: TimeInternal,
    /// Last master-to-slave delay, needed for E2E path delay.
    delay_ms: Option<TimeInternal>,
}

#[derive(Debug, Default)]
struct DelayExchange {
    waiting_for_response: bool,
    sequence_id: u16,
    /// t3
    send_time: TimeInternal,
}

#[derive(Debug, Default)]
struct PdelayExchange {
    waiting_for_response: bool,
    waiting_for_follow_up: bool,
    sequence_id: u16,
    t1: TimeInternal,
    t2: TimeInternal,
    t4: TimeInternal,
    correction: TimeInternal,
}

#[derive(Debug, Default)]
struct SequenceIds {
    sync: u16,
    announce: u16,
    delay_req: u16,
    pdelay_req: u16,
    signaling: u16,
}

/// Seconds for a log2 message interval. The range keeps 0x7f from overflowing.
fn log_interval_secs(log_interval: i8) -> f64 {
    2f64.powi(log_interval.clamp(-8, 16) as i32)
}

fn next_sequence(id: &mut u16) -> u16 {
    let current = *id;
    *id = id.wrapping_add(1);
    current
}

pub struct PtpPort<C, N, D, T = IntervalTimers>
where
    C: SystemClock,
    N: PtpNetwork,
    D: DriftStore,
    T: TimerService,
{
    config: PtpConfig,
    ds: Datasets,

    clock: C,
    net: N,
    drift_store: D,
    timers: T,
    status: Arc<RwLock<SyncStatus>>,

    foreign: ForeignMasterTable,
    best_master: Option<ForeignKey>,
    record_update: bool,

    /// Configured masters we request service from.
    destinations: UnicastGrantTable,
    /// Slaves we granted service to.
    slaves: UnicastGrantTable,

    servo: PiServo,
    offset_filter: OffsetFilter,
    delay_filter: DelayFilter,
    peer_delay_filter: DelayFilter,
    outlier_ms: Box<dyn OutlierFilter>,
    outlier_sm: Box<dyn OutlierFilter>,

    counters: PortCounters,
    sync: SyncExchange,
    delay: DelayExchange,
    pdelay: PdelayExchange,
    sequences: SequenceIds,
    rng: StdRng,

    uptime: Duration,
    calibrated: bool,
    past_startup: bool,
    stepped_once: bool,
    panic_mode: bool,
    panic_over: bool,
    announce_grace_used: u32,
    consecutive_max_delay: u32,
    drift_cache: Option<f64>,
    frequency_ppb: f64,
}

impl<C, N, D> PtpPort<C, N, D, IntervalTimers>
where
    C: SystemClock,
    N: PtpNetwork,
    D: DriftStore,
{
    pub fn new(
        config: PtpConfig,
        clock_identity: ClockIdentity,
        clock: C,
        net: N,
        drift_store: D,
        status: Arc<RwLock<SyncStatus>>,
    ) -> Self {
        Self::with_timers(config, clock_identity, clock, net, drift_store, IntervalTimers::new(), status)
    }
}

impl<C, N, D, T> PtpPort<C, N, D, T>
where
    C: SystemClock,
    N: PtpNetwork,
    D: DriftStore,
    T: TimerService,
{
    pub fn with_timers(
        config: PtpConfig,
        clock_identity: ClockIdentity,
        clock: C,
        net: N,
        drift_store: D,
        timers: T,
        status: Arc<RwLock<SyncStatus>>,
    ) -> Self {
        let ds = initial_datasets(&config, clock_identity);
        let limits = GrantLimits::from_config(&config.ptpengine, &config.unicast);
        let e = &config.ptpengine;

        let mut seed = [0u8; 32];
        seed[..8].copy_from_slice(&clock_identity.0);

        PtpPort {
            foreign: ForeignMasterTable::new(e.max_foreign_records, e.announce_receipt_timeout),
            destinations: UnicastGrantTable::new(config.unicast.max_destinations, limits),
            slaves: UnicastGrantTable::new(config.unicast.max_destinations, limits),
            servo: PiServo::new(&config.servo),
            outlier_ms: build_outlier_filter(&config.filter.outlier),
            outlier_sm: build_outlier_filter(&config.filter.outlier),
            offset_filter: OffsetFilter::default(),
            delay_filter: DelayFilter::default(),
            peer_delay_filter: DelayFilter::default(),
            best_master: None,
            record_update: false,
            counters: PortCounters::default(),
            sync: SyncExchange::default(),
            delay: DelayExchange::default(),
            pdelay: PdelayExchange::default(),
            sequences: SequenceIds::default(),
            rng: StdRng::from_seed(seed),
            uptime: Duration::ZERO,
            calibrated: false,
            past_startup: false,
            stepped_once: false,
            panic_mode: false,
            panic_over: false,
            announce_grace_used: 0,
            consecutive_max_delay: 0,
            drift_cache: None,
            frequency_ppb: 0.0,
            ds,
            config,
            clock,
            net,
            drift_store,
            timers,
            status,
        }
    }

    // ========================================================================
    // EVENT LOOP
    // ========================================================================

    /// How long the loop may sleep before the next timer is due.
    pub fn next_timeout(&self) -> Duration {
        self.timers.next_deadline().map(|d| d.min(MAX_WAIT)).unwrap_or(MAX_WAIT)
    }

    /// Block on the network until data arrives or the next timer is due.
    pub fn wait(&mut self) -> bool {
        let timeout = self.next_timeout();
        match self.net.wait(timeout) {
            Ok(ready) => ready,
            Err(e) => {
                self.counters.message_recv_errors += 1;
                debug!("[Net] wait failed: {:#}", e);
                false
            }
        }
    }

    /// One pass: timers, state actions, then received datagrams.
    pub fn run_iteration(&mut self, elapsed: Duration) {
        self.uptime += elapsed;
        self.timers.tick(elapsed);
        self.do_state();

        for _ in 0..RECV_BATCH {
            match self.net.recv_packet() {
                Ok(Some(packet)) => self.handle_packet(packet),
                Ok(None) => break,
                Err(e) => {
                    self.counters.message_recv_errors += 1;
                    debug!("[Net] receive failed: {:#}", e);
                    break;
                }
            }
        }

        self.publish_status();
    }

    /// Leave through DISABLED so grants get cancelled and drift saved.
    pub fn shutdown(&mut self) {
        if self.state() != PortState::Disabled {
            info!("[PTP] Shutting down");
            self.to_state(PortState::Disabled);
        }
        self.publish_status();
    }

    // ========================================================================
    // OPERATOR ACTIONS
    // ========================================================================

    /// Step the clock by the current offset, ignoring the step policy.
    pub fn step_now(&mut self) {
        if !self.state().is_slave_like() {
            warn!("[PTP] Manual clock step ignored in state {}", self.state());
            return;
        }
        let offset = self.ds.current_ds.offset_from_master;
        info!("[PTP] Manual clock step by {} requested", -offset);
        self.step_clock(offset);
    }

    pub fn dump_counters(&self) {
        info!(
            "[PTP] State {}, best master {}",
            self.state(),
            self.best_master
                .map(|k| format!("{} at {}", k.port_identity, k.address))
                .unwrap_or_else(|| "none".to_string())
        );
        self.counters.dump();
    }

    pub fn clear_counters(&mut self) {
        info!("[PTP] Counters cleared");
        self.counters.clear();
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn state(&self) -> PortState {
        self.ds.port_ds.port_state
    }

    pub fn datasets(&self) -> &Datasets {
        &self.ds
    }

    pub fn counters(&self) -> &PortCounters {
        &self.counters
    }

    pub fn servo(&self) -> &PiServo {
        &self.servo
    }

    pub fn best_master(&self) -> Option<ForeignKey> {
        self.best_master
    }

    pub fn foreign_masters(&self) -> &ForeignMasterTable {
        &self.foreign
    }

    pub fn grants_to_slaves(&self) -> &UnicastGrantTable {
        &self.slaves
    }

    pub fn unicast_destinations(&self) -> &UnicastGrantTable {
        &self.destinations
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn network(&mut self) -> &mut N {
        &mut self.net
    }

    pub fn uptime(&self) -> Duration {
        self.uptime
    }

    fn bmc_options(&self) -> BmcOptions {
        let e = &self.config.ptpengine;
        BmcOptions {
            domain_number: self.ds.default_ds.domain_number,
            any_domain: e.any_domain,
            prefer_configured_domain: e.prefer_configured_domain,
            prefer_lower_domain: e.prefer_lower_domain,
            slave_only: self.ds.default_ds.slave_only,
        }
    }

    fn parent_address(&self) -> Option<Ipv4Addr> {
        if self.state().is_slave_like() {
            self.best_master.map(|k| k.address)
        } else {
            None
        }
    }

    fn own_port_identity(&self) -> PortIdentity {
        self.ds.port_ds.port_identity
    }

    fn publish_status(&self) {
        let Ok(mut status) = self.status.write() else {
            return;
        };
        let ds = &self.ds;
        let slave_like = self.state().is_slave_like();

        status.port_state = self.state().to_string();
        status.offset_ns = ds.current_ds.offset_from_master.to_nanos();
        status.mean_path_delay_ns = ds.current_ds.mean_path_delay.to_nanos();
        status.frequency_ppb = self.frequency_ppb;
        status.observed_drift_ppb = self.servo.observed_drift();
        status.parent_port_identity = slave_like.then(|| ds.parent_ds.parent_port_identity.to_string());
        status.grandmaster_identity = Some(ds.parent_ds.grandmaster_identity.to_string());
        status.steps_removed = ds.current_ds.steps_removed;
        status.current_utc_offset = ds.time_properties_ds.current_utc_offset;
        status.servo_stable = self.servo.is_stable();
        status.settled = self.past_startup || self.counters.offset_updates > 0;
        status.updated_ts = self.clock.now().seconds.max(0) as u64;
    }
}

fn initial_datasets(config: &PtpConfig, clock_identity: ClockIdentity) -> Datasets {
    let e = &config.ptpengine;
    let clock_class = if e.slave_only { CLOCK_CLASS_SLAVE_ONLY } else { e.clock_class };
    let port_identity = PortIdentity::new(clock_identity, e.port_number);

    let default_ds = DefaultDs {
        two_step_flag: true,
        clock_identity,
        number_ports: 1,
        clock_quality: ClockQuality {
            clock_class,
            clock_accuracy: e.clock_accuracy,
            offset_scaled_log_variance: e.offset_scaled_log_variance,
        },
        priority1: e.priority1,
        priority2: e.priority2,
        domain_number: e.domain_number,
        slave_only: e.slave_only,
    };

    Datasets {
        parent_ds: ParentDs {
            parent_port_identity: PortIdentity::new(clock_identity, 0),
            parent_stats: false,
            grandmaster_identity: clock_identity,
            grandmaster_clock_quality: default_ds.clock_quality,
            grandmaster_priority1: default_ds.priority1,
            grandmaster_priority2: default_ds.priority2,
        },
        default_ds,
        current_ds: CurrentDs::default(),
        time_properties_ds: e.time_properties,
        port_ds: PortDs {
            port_identity,
            port_state: PortState::Initializing,
            log_min_delay_req_interval: e.log_min_delay_req_interval,
            peer_mean_path_delay: TimeInternal::ZERO,
            log_announce_interval: e.log_announce_interval,
            announce_receipt_timeout: e.announce_receipt_timeout,
            log_sync_interval: e.log_sync_interval,
            delay_mechanism: e.delay_mechanism,
            log_min_pdelay_req_interval: e.log_min_pdelay_req_interval,
            version_number: PTP_VERSION,
        },
    }
}
