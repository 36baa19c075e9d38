//! State transitions, per-state timer handling and BMC application.

use log::{debug, error, info, warn};

use super::{log_interval_secs, DelayExchange, PdelayExchange, PtpPort, SyncExchange};
use crate::bmc::{self, ComparisonDataset, RecommendedState};
use crate::clock::SystemClock;
use crate::datasets::{DelayMechanism, PortState};
use crate::drift;
use crate::ptp::MessageType;
use crate::timer::{PtpTimer, TimerService};
use crate::traits::{DriftStore, PtpNetwork};

/// Unicast grant bookkeeping runs on a fixed one-second tick.
const GRANT_TICK_SECS: f64 = 1.0;

impl<C, N, D, T> PtpPort<C, N, D, T>
where
    C: SystemClock,
    N: PtpNetwork,
    D: DriftStore,
    T: TimerService,
{
    // ========================================================================
    // TRANSITIONS
    // ========================================================================

    /// The only writer of the port state. Exit actions of `from` run before
    /// entry actions of `to`, so timers are always stopped before re-arming.
    pub(super) fn to_state(&mut self, to: PortState) {
        let from = self.state();
        self.counters.state_transitions += 1;
        if from == to {
            debug!("[PTP] Re-entering {}", to);
        } else {
            info!("[PTP] State change {} -> {}", from, to);
        }

        self.exit_state(from, to);
        self.ds.port_ds.port_state = to;
        self.enter_state(from, to);
    }

    fn exit_state(&mut self, from: PortState, to: PortState) {
        match from {
            PortState::Master => {
                self.timers.stop(PtpTimer::SyncInterval);
                self.timers.stop(PtpTimer::AnnounceInterval);
                self.timers.stop(PtpTimer::PdelayReqInterval);
                // DISABLED cancels every grant itself
                if !matches!(to, PortState::Master | PortState::Disabled) {
                    self.cancel_slave_grants();
                }
            }
            PortState::Slave | PortState::Uncalibrated => {
                if to.is_slave_like() {
                    return;
                }
                for timer in [
                    PtpTimer::AnnounceReceipt,
                    PtpTimer::SyncReceipt,
                    PtpTimer::DelayReceipt,
                    PtpTimer::DelayReqInterval,
                    PtpTimer::PdelayReqInterval,
                    PtpTimer::ClockUpdate,
                    PtpTimer::Calibration,
                ] {
                    self.timers.stop(timer);
                }
                self.save_drift();
                self.cancel_parent_grants();
            }
            PortState::Listening => {
                self.timers.stop(PtpTimer::AnnounceReceipt);
                if to != PortState::Listening {
                    self.counters.listen_count = 0;
                }
            }
            PortState::Passive => {
                self.timers.stop(PtpTimer::AnnounceReceipt);
                self.timers.stop(PtpTimer::PdelayReqInterval);
            }
            PortState::PreMaster => {
                self.timers.stop(PtpTimer::Qualification);
            }
            PortState::Faulty => {
                self.timers.stop(PtpTimer::FaultRetry);
            }
            PortState::Initializing | PortState::Disabled => {}
        }
    }

    fn enter_state(&mut self, from: PortState, to: PortState) {
        if to == PortState::Listening {
            self.restore_configured_intervals();
        }
        let log_announce = self.ds.port_ds.log_announce_interval;
        let announce_receipt =
            self.ds.port_ds.announce_receipt_timeout as f64 * log_interval_secs(log_announce);
        let p2p = self.ds.port_ds.delay_mechanism == DelayMechanism::P2P;

        match to {
            PortState::Initializing => self.initialize(),
            PortState::Faulty => {
                let retry = self.config.ptpengine.fault_retry_interval.max(1) as f64;
                warn!("[PTP] Port faulty, re-initializing in {} s", retry);
                self.timers.start(PtpTimer::FaultRetry, retry);
            }
            PortState::Disabled => {
                self.cancel_all_grants();
                self.best_master = None;
                for timer in PtpTimer::ALL {
                    self.timers.stop(timer);
                }
            }
            PortState::Listening => {
                self.best_master = None;
                self.servo.reset();
                self.announce_grace_used = 0;
                self.timers.start(PtpTimer::AnnounceReceipt, announce_receipt);
            }
            PortState::PreMaster => {
                self.best_master = None;
                let steps = self.ds.current_ds.steps_removed as f64 + 1.0;
                self.timers
                    .start(PtpTimer::Qualification, steps * log_interval_secs(log_announce));
            }
            PortState::Master => {
                self.best_master = None;
                self.timers.start(
                    PtpTimer::SyncInterval,
                    log_interval_secs(self.ds.port_ds.log_sync_interval),
                );
                self.timers.start(PtpTimer::AnnounceInterval, log_interval_secs(log_announce));
                if p2p {
                    self.start_pdelay_timer();
                }
            }
            PortState::Passive => {
                self.timers.start(PtpTimer::AnnounceReceipt, announce_receipt);
                if p2p {
                    self.start_pdelay_timer();
                }
            }
            PortState::Uncalibrated => {
                if from.is_slave_like() && from != PortState::Uncalibrated {
                    // new parent while tracking: keep the clock, restart the exchange
                    debug!("[PTP] Parent changed, recalibrating");
                }
                self.sync = SyncExchange::default();
                self.delay = DelayExchange::default();
                self.pdelay = PdelayExchange::default();
                self.offset_filter.reset();

                let log_sync = self.ds.port_ds.log_sync_interval;
                let sync_receipt =
                    self.ds.port_ds.announce_receipt_timeout as f64 * log_interval_secs(log_sync);
                self.timers.start(PtpTimer::AnnounceReceipt, announce_receipt);
                self.timers.start(PtpTimer::SyncReceipt, sync_receipt);
                // Delay_Req timer starts on the first Sync
                self.timers.stop(PtpTimer::DelayReqInterval);
                if p2p {
                    self.start_pdelay_timer();
                }

                let timeout = self.config.clock.clock_update_timeout;
                if timeout > 0 {
                    self.timers.start(PtpTimer::ClockUpdate, timeout as f64);
                }
                let calibration = self.config.ptpengine.calibration_delay;
                if calibration > 0 {
                    self.calibrated = false;
                    self.timers.start(PtpTimer::Calibration, calibration as f64);
                } else {
                    self.calibrated = true;
                }

                if !from.is_slave_like() {
                    self.restore_drift();
                }
            }
            PortState::Slave => {
                info!(
                    "[PTP] Synchronizing to {} (grandmaster {})",
                    self.ds.parent_ds.parent_port_identity, self.ds.parent_ds.grandmaster_identity
                );
            }
        }
    }

    /// Drop message intervals learned from a former parent or grant.
    fn restore_configured_intervals(&mut self) {
        let engine = &self.config.ptpengine;
        self.ds.port_ds.log_announce_interval = engine.log_announce_interval;
        self.ds.port_ds.log_sync_interval = engine.log_sync_interval;
        self.servo.set_interval(engine.log_sync_interval);
    }

    fn start_pdelay_timer(&mut self) {
        let interval = log_interval_secs(self.ds.port_ds.log_min_pdelay_req_interval);
        self.timers.start(PtpTimer::PdelayReqInterval, interval);
    }

    /// INITIALIZING entry: reset everything, then go LISTENING (or FAULTY/DISABLED).
    pub(super) fn initialize(&mut self) {
        info!("[PTP] Initializing port {}", self.ds.port_ds.port_identity);

        for timer in PtpTimer::ALL {
            self.timers.stop(timer);
        }

        self.servo.reset();
        self.restore_configured_intervals();
        self.offset_filter.reset();
        self.delay_filter.reset();
        self.peer_delay_filter.reset();
        self.outlier_ms.reset();
        self.outlier_sm.reset();
        self.foreign.clear();
        self.best_master = None;
        self.record_update = false;
        self.sync = SyncExchange::default();
        self.delay = DelayExchange::default();
        self.pdelay = PdelayExchange::default();
        self.calibrated = false;
        self.panic_mode = false;
        self.ds.port_ds.peer_mean_path_delay = Default::default();

        let configured = self.config.ptpengine.time_properties;
        bmc::m1(&mut self.ds, &configured);

        self.destinations.init_unicast_grant_table(&self.config.unicast.destinations);
        self.slaves.init_unicast_grant_table(&[]);

        if let Err(e) = self.net.reset() {
            error!("[Net] Network reset failed: {:#}", e);
            self.to_state(PortState::Faulty);
            return;
        }

        let stats = self.config.global.statistics_interval;
        if stats > 0 {
            self.timers.start(PtpTimer::Statistics, stats as f64);
        }
        if self.config.unicast.negotiation {
            self.timers.start(PtpTimer::UnicastGrant, GRANT_TICK_SECS);
        }

        if self.config.ptpengine.port_disabled {
            self.to_state(PortState::Disabled);
        } else {
            self.to_state(PortState::Listening);
        }
    }

    // ========================================================================
    // STATE ACTIONS
    // ========================================================================

    pub(super) fn do_state(&mut self) {
        match self.state() {
            PortState::Initializing => {
                self.initialize();
                return;
            }
            PortState::Faulty => {
                if self.timers.expired(PtpTimer::FaultRetry) {
                    self.to_state(PortState::Initializing);
                }
                return;
            }
            PortState::Disabled => return,
            _ => {}
        }

        if self.record_update {
            self.record_update = false;
            self.apply_bmc();
        }

        self.handle_announce_receipt_timeout();

        match self.state() {
            PortState::Slave | PortState::Uncalibrated => self.do_slave_timers(),
            PortState::Master => {
                if self.timers.expired(PtpTimer::SyncInterval) {
                    self.issue_sync();
                }
                if self.timers.expired(PtpTimer::AnnounceInterval) {
                    self.issue_announce();
                }
                if self.timers.expired(PtpTimer::PdelayReqInterval) {
                    self.issue_pdelay_req();
                }
            }
            PortState::PreMaster => {
                if self.timers.expired(PtpTimer::Qualification) {
                    self.to_state(PortState::Master);
                }
            }
            PortState::Passive => {
                if self.timers.expired(PtpTimer::PdelayReqInterval) {
                    self.issue_pdelay_req();
                }
            }
            _ => {}
        }

        if self.timers.expired(PtpTimer::UnicastGrant) {
            self.unicast_grant_tick();
        }

        if self.timers.expired(PtpTimer::PanicMode) {
            self.timers.stop(PtpTimer::PanicMode);
            if self.panic_mode {
                warn!("[Clock] Panic mode timeout, clock updates resume");
                self.panic_mode = false;
                self.panic_over = true;
            }
        }

        if self.timers.expired(PtpTimer::Statistics) {
            self.log_statistics();
        }
    }

    fn handle_announce_receipt_timeout(&mut self) {
        let state = self.state();
        if !matches!(
            state,
            PortState::Listening | PortState::Passive | PortState::Uncalibrated | PortState::Slave
        ) {
            return;
        }
        if !self.timers.expired(PtpTimer::AnnounceReceipt) {
            return;
        }

        self.counters.announce_timeouts += 1;

        let grace = self.config.ptpengine.announce_timeout_grace_period;
        if let Some(best) = self.best_master {
            if self.announce_grace_used < grace {
                self.announce_grace_used += 1;
                warn!(
                    "[PTP] Announce receipt timeout from {} ({}/{} grace periods)",
                    best.port_identity, self.announce_grace_used, grace
                );
                // Hand over only when someone else qualifies; otherwise keep the parent.
                let threshold = self.config.ptpengine.foreign_master_threshold;
                let alternative = self
                    .foreign
                    .eligible(self.uptime, threshold)
                    .iter()
                    .any(|r| r.key != best);
                if alternative {
                    self.foreign.disqualify(&best);
                    self.record_update = true;
                }
                return;
            }
        }

        self.announce_grace_used = 0;
        self.foreign.clear();

        if self.ds.default_ds.slave_only {
            if state == PortState::Listening {
                self.counters.listen_count += 1;
                if self.counters.listen_count >= self.config.ptpengine.max_listen {
                    warn!(
                        "[PTP] Still no master after {} listening periods, resetting port",
                        self.counters.listen_count
                    );
                    self.counters.listen_count = 0;
                    self.counters.reset_count += 1;
                    self.to_state(PortState::Initializing);
                    return;
                }
                info!("[PTP] No master heard, still listening");
            } else {
                warn!("[PTP] Announce receipt timeout, lost master");
            }
            self.to_state(PortState::Listening);
        } else {
            info!("[PTP] Announce receipt timeout, taking over as master");
            let configured = self.config.ptpengine.time_properties;
            bmc::m1(&mut self.ds, &configured);
            self.to_state(PortState::PreMaster);
        }
    }

    fn do_slave_timers(&mut self) {
        if self.timers.expired(PtpTimer::SyncReceipt) {
            self.counters.sync_timeouts += 1;
            warn!("[PTP] No Sync received from master, back to listening");
            self.to_state(PortState::Listening);
            return;
        }
        if self.timers.expired(PtpTimer::ClockUpdate) {
            self.counters.clock_update_timeouts += 1;
            warn!(
                "[PTP] No clock update for {} s, back to listening",
                self.config.clock.clock_update_timeout
            );
            self.to_state(PortState::Listening);
            return;
        }
        if self.timers.expired(PtpTimer::Calibration) {
            self.timers.stop(PtpTimer::Calibration);
            self.calibrated = true;
            info!("[PTP] Calibration delay elapsed");
        }
        if self.timers.expired(PtpTimer::DelayReceipt) {
            self.timers.stop(PtpTimer::DelayReceipt);
            self.counters.delay_timeouts += 1;
            self.delay.waiting_for_response = false;
            warn!("[PTP] No Delay_Resp received for Delay_Req {}", self.delay.sequence_id);
        }
        if self.timers.expired(PtpTimer::DelayReqInterval) {
            self.issue_delay_req();
        }
        if self.timers.expired(PtpTimer::PdelayReqInterval) {
            self.issue_pdelay_req();
        }
    }

    fn log_statistics(&self) {
        let ds = &self.ds;
        match self.state() {
            PortState::Slave | PortState::Uncalibrated => info!(
                "[PTP] {} to {}: offset {} ns, path delay {} ns, freq {:.3} ppb",
                self.state(),
                ds.parent_ds.parent_port_identity,
                ds.current_ds.offset_from_master.to_nanos(),
                ds.current_ds.mean_path_delay.to_nanos(),
                self.frequency_ppb
            ),
            state => info!(
                "[PTP] {}: {} foreign masters, {} grants to slaves",
                state,
                self.foreign.len(),
                self.slaves
                    .rows()
                    .filter(|r| r.is_granted(MessageType::Sync))
                    .count()
            ),
        }
    }

    // ========================================================================
    // BMC
    // ========================================================================

    /// Run the BMC over the current foreign records and apply the result.
    pub(super) fn apply_bmc(&mut self) {
        let removed = self.foreign.purge_stale(self.uptime);
        self.counters.foreign_removed += removed as u32;

        let state = self.state();
        let options = self.bmc_options();
        let local = ComparisonDataset::from_local(&self.ds.default_ds, self.ds.port_ds.port_identity);
        let threshold = self.config.ptpengine.foreign_master_threshold;

        let (decision, best) = {
            let records = self.foreign.eligible(self.uptime, threshold);
            let decision = bmc::decide(&local, &records, &options, state);
            let best = decision.best.and_then(|k| self.foreign.get(&k)).cloned();
            (decision, best)
        };
        if decision.ties > 0 {
            warn!("[BMC] {} indistinguishable Announce pairs, ordered by address", decision.ties);
            self.counters.protocol_errors += decision.ties;
        }

        let configured = self.config.ptpengine.time_properties;
        match decision.state {
            RecommendedState::Master => {
                bmc::m1(&mut self.ds, &configured);
                if !matches!(state, PortState::Master | PortState::PreMaster) {
                    self.to_state(PortState::PreMaster);
                }
            }
            RecommendedState::Passive => {
                if let Some(record) = &best {
                    bmc::p1(&mut self.ds, &record.header, &record.announce, &configured);
                    self.best_master = Some(record.key);
                }
                if state != PortState::Passive {
                    self.to_state(PortState::Passive);
                }
            }
            RecommendedState::Slave => {
                let Some(record) = best else {
                    return;
                };
                let changed = self.best_master != Some(record.key);
                let granted = self.granted_announce_interval(&record.key);
                bmc::s1(&mut self.ds, &record.header, &record.announce, granted);
                self.best_master = Some(record.key);

                if changed {
                    self.counters.best_master_changes += 1;
                    info!(
                        "[BMC] New best master {} at {}, grandmaster {} (p1 {}, class {})",
                        record.key.port_identity,
                        record.key.address,
                        record.announce.grandmaster_identity,
                        record.announce.grandmaster_priority1,
                        record.announce.grandmaster_clock_quality.clock_class
                    );
                }
                if !state.is_slave_like() || changed {
                    self.to_state(PortState::Uncalibrated);
                }
            }
            RecommendedState::Listening => {
                if state != PortState::Listening {
                    self.to_state(PortState::Listening);
                }
            }
            RecommendedState::Faulty => {
                error!("[BMC] Comparison against own data set failed, port faulty");
                self.counters.protocol_errors += 1;
                self.to_state(PortState::Faulty);
            }
        }
    }

    // ========================================================================
    // DRIFT
    // ========================================================================

    pub(super) fn save_drift(&mut self) {
        let drift_ppb = self.servo.observed_drift();
        let clock_class = self.ds.default_ds.clock_quality.clock_class;
        if !drift::should_save(self.state(), clock_class, drift_ppb, self.servo.running_max_output()) {
            return;
        }
        let method = self.config.clock.drift_handling;
        self.drift_cache = Some(drift::save_drift(&mut self.drift_store, method, drift_ppb));
    }

    pub(super) fn restore_drift(&mut self) {
        let method = self.config.clock.drift_handling;
        let drift_ppb = drift::restore_drift(method, self.drift_cache, &self.clock, &mut self.drift_store);
        self.servo.set_observed_drift(drift_ppb);
        let applied = -self.servo.observed_drift();
        if drift_ppb != 0.0 {
            info!("[Drift] Restored observed drift {:.0} ppb", drift_ppb);
        }
        self.set_frequency(applied);
    }
}
