use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use super::PtpPort;
use crate::clock::MockSystemClock;
use crate::config::{DriftRecovery, IpMode, PtpConfig};
use crate::datasets::{ClockIdentity, DelayMechanism, PortIdentity, PortState};
use crate::foreign::tests::announce_from;
use crate::ptp::{self, Body, Header, Message, MessageType, SignalingBody, SignalingTlv};
use crate::status::SyncStatus;
use crate::time::TimeInternal;
use crate::timer::{IntervalTimers, PtpTimer, TimerService};
use crate::traits::{Channel, Destination, MockDriftStore, MockPtpNetwork, ReceivedPacket};

const LOCAL_ID: u8 = 0x50;
const MASTER_ID: u8 = 0x10;
const STEP: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerCall {
    Start(PtpTimer),
    Stop(PtpTimer),
}

/// IntervalTimers that also records every start/stop.
struct RecordingTimers {
    inner: IntervalTimers,
    log: Rc<RefCell<Vec<TimerCall>>>,
}

impl TimerService for RecordingTimers {
    fn start(&mut self, timer: PtpTimer, interval: f64) {
        self.log.borrow_mut().push(TimerCall::Start(timer));
        self.inner.start(timer, interval);
    }

    fn stop(&mut self, timer: PtpTimer) {
        self.log.borrow_mut().push(TimerCall::Stop(timer));
        self.inner.stop(timer);
    }

    fn expired(&mut self, timer: PtpTimer) -> bool {
        self.inner.expired(timer)
    }

    fn is_running(&self, timer: PtpTimer) -> bool {
        self.inner.is_running(timer)
    }

    fn tick(&mut self, elapsed: Duration) {
        self.inner.tick(elapsed)
    }

    fn next_deadline(&self) -> Option<Duration> {
        self.inner.next_deadline()
    }
}

type TestPort = PtpPort<MockSystemClock, MockPtpNetwork, MockDriftStore, RecordingTimers>;

struct Harness {
    port: TestPort,
    now: Arc<Mutex<TimeInternal>>,
    inbox: Arc<Mutex<VecDeque<ReceivedPacket>>>,
    sent: Arc<Mutex<Vec<(Destination, Vec<u8>)>>>,
    steps: Arc<Mutex<Vec<TimeInternal>>>,
    frequencies: Arc<Mutex<Vec<f64>>>,
    timer_log: Rc<RefCell<Vec<TimerCall>>>,
    status: Arc<RwLock<SyncStatus>>,
}

fn harness_with_store(config: PtpConfig, mut drift_store: MockDriftStore) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();

    let now = Arc::new(Mutex::new(TimeInternal::new(1_700_000_000, 0)));
    let inbox = Arc::new(Mutex::new(VecDeque::new()));
    let sent = Arc::new(Mutex::new(Vec::new()));
    let steps = Arc::new(Mutex::new(Vec::new()));
    let frequencies = Arc::new(Mutex::new(Vec::new()));

    let mut clock = MockSystemClock::new();
    let n = now.clone();
    clock.expect_now().returning(move || *n.lock().unwrap());
    let f = frequencies.clone();
    clock.expect_adjust_frequency().returning(move |ppb| {
        f.lock().unwrap().push(ppb);
        Ok(())
    });
    let s = steps.clone();
    clock.expect_step_clock().returning(move |offset| {
        s.lock().unwrap().push(offset);
        Ok(())
    });
    clock.expect_frequency().returning(|| Ok(0.0));

    let mut net = MockPtpNetwork::new();
    let i = inbox.clone();
    net.expect_recv_packet().returning(move || Ok(i.lock().unwrap().pop_front()));
    let o = sent.clone();
    net.expect_send().returning(move |_, data, destination| {
        o.lock().unwrap().push((destination, data.to_vec()));
        Ok(None)
    });
    net.expect_reset().returning(|| Ok(()));
    net.expect_wait().returning(|_| Ok(false));

    drift_store.expect_save().returning(|_| Ok(()));

    let timer_log = Rc::new(RefCell::new(Vec::new()));
    let timers = RecordingTimers {
        inner: IntervalTimers::new(),
        log: timer_log.clone(),
    };
    let status = Arc::new(RwLock::new(SyncStatus::default()));

    let port = PtpPort::with_timers(
        config,
        ClockIdentity([LOCAL_ID; 8]),
        clock,
        net,
        drift_store,
        timers,
        status.clone(),
    );

    let mut h = Harness {
        port,
        now,
        inbox,
        sent,
        steps,
        frequencies,
        timer_log,
        status,
    };
    h.port.run_iteration(Duration::ZERO);
    h
}

fn harness(config: PtpConfig) -> Harness {
    let mut store = MockDriftStore::new();
    store.expect_load().returning(|| Ok(None));
    harness_with_store(config, store)
}

impl Harness {
    fn deliver(&mut self, message: Message, source: Ipv4Addr, receive_time: TimeInternal) {
        self.deliver_raw(message.encode(), message.message_type().is_event(), source, receive_time);
    }

    fn deliver_raw(&mut self, data: Vec<u8>, event: bool, source: Ipv4Addr, receive_time: TimeInternal) {
        self.inbox.lock().unwrap().push_back(ReceivedPacket {
            data,
            timestamp: receive_time,
            source,
            channel: if event { Channel::Event } else { Channel::General },
        });
        self.port.run_iteration(Duration::ZERO);
    }

    fn advance(&mut self, seconds: f64) {
        let steps = (seconds / STEP.as_secs_f64()).round() as u32;
        for _ in 0..steps {
            {
                let mut now = self.now.lock().unwrap();
                *now = *now + TimeInternal::from(STEP);
            }
            self.port.run_iteration(STEP);
        }
    }

    fn now(&self) -> TimeInternal {
        *self.now.lock().unwrap()
    }

    fn sent(&self) -> Vec<(Destination, Message)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(d, data)| (*d, ptp::decode(data).unwrap()))
            .collect()
    }

    fn sent_of(&self, message_type: MessageType) -> Vec<(Destination, Message)> {
        self.sent()
            .into_iter()
            .filter(|(_, m)| m.message_type() == message_type)
            .collect()
    }

    fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }

    /// Two qualifying Announces from a better master, then one iteration for the BMC.
    fn become_slave(&mut self) {
        let source = master_address();
        for seq in 0..2 {
            let at = self.now();
            self.deliver(announce(MASTER_ID, 100, 6, seq), source, at);
        }
        self.port.run_iteration(Duration::ZERO);
        assert_eq!(self.port.state(), PortState::Uncalibrated);
    }

    /// Announce receipt timeout with nobody on the wire, then qualification.
    fn become_master(&mut self) {
        self.advance(12.1);
        assert_eq!(self.port.state(), PortState::PreMaster);
        self.advance(2.1);
        assert_eq!(self.port.state(), PortState::Master);
    }

    /// One Sync a second from the parent, and nothing else.
    fn sync_for(&mut self, seq: &mut u16, seconds: u32) {
        for _ in 0..seconds {
            *seq += 1;
            self.sync_one_step(*seq, 1_000);
            self.advance(1.0);
        }
    }

    fn sync_one_step(&mut self, seq: u16, offset_ns: i64) {
        let t2 = self.now();
        let t1 = t2 - TimeInternal::from_nanos(offset_ns);
        let message = Message::new(
            header(MASTER_ID, seq),
            Body::Sync {
                origin_timestamp: t1.to_wire(),
            },
        );
        self.deliver(message, master_address(), t2);
    }
}

fn master_address() -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, 1)
}

fn identity(id: u8) -> PortIdentity {
    PortIdentity::new(ClockIdentity([id; 8]), 1)
}

fn header(id: u8, seq: u16) -> Header {
    Header {
        source_port_identity: identity(id),
        sequence_id: seq,
        log_message_interval: 0,
        ..Default::default()
    }
}

fn announce(id: u8, priority1: u8, clock_class: u8, seq: u16) -> Message {
    let (mut h, body) = announce_from(id, priority1, clock_class);
    h.sequence_id = seq;
    h.log_message_interval = 1;
    Message::new(h, Body::Announce(body))
}

// ============================================================================
// STATE MACHINE
// ============================================================================

#[test]
fn test_initialize_enters_listening() {
    let h = harness(PtpConfig::default());
    assert_eq!(h.port.state(), PortState::Listening);
    assert_eq!(h.port.datasets().current_ds.steps_removed, 0);
    assert!(h.timer_log.borrow().contains(&TimerCall::Start(PtpTimer::AnnounceReceipt)));
}

#[test]
fn test_silent_network_makes_master() {
    let mut h = harness(PtpConfig::default());
    h.become_master();

    h.advance(2.5);
    let announces = h.sent_of(MessageType::Announce);
    assert!(!announces.is_empty());
    let (destination, message) = &announces[0];
    assert_eq!(*destination, Destination::Multicast);
    match &message.body {
        Body::Announce(a) => {
            assert_eq!(a.grandmaster_identity, ClockIdentity([LOCAL_ID; 8]));
            assert_eq!(a.grandmaster_priority1, 128);
        }
        other => panic!("expected Announce, got {:?}", other),
    }

    // two-step: every Sync is followed by a Follow_Up with the same sequence id
    let syncs = h.sent_of(MessageType::Sync);
    let follow_ups = h.sent_of(MessageType::FollowUp);
    assert!(syncs.len() >= 2);
    assert_eq!(syncs.len(), follow_ups.len());
    assert!(syncs[0].1.header.flags.two_step);
    assert_eq!(syncs[0].1.header.sequence_id, follow_ups[0].1.header.sequence_id);
}

#[test]
fn test_exit_stops_timers_before_entry_starts() {
    let mut h = harness(PtpConfig::default());
    h.timer_log.borrow_mut().clear();
    h.advance(12.1);
    assert_eq!(h.port.state(), PortState::PreMaster);

    let log = h.timer_log.borrow();
    let stop = log
        .iter()
        .position(|c| *c == TimerCall::Stop(PtpTimer::AnnounceReceipt))
        .unwrap();
    let start = log
        .iter()
        .position(|c| *c == TimerCall::Start(PtpTimer::Qualification))
        .unwrap();
    assert!(stop < start);
    assert!(h.port.counters().state_transitions >= 2);
}

#[test]
fn test_slave_only_resets_after_max_listen() {
    let mut config = PtpConfig::default();
    config.ptpengine.slave_only = true;
    config.ptpengine.max_listen = 2;
    let mut h = harness(config);
    assert_eq!(h.port.datasets().default_ds.clock_quality.clock_class, 255);

    h.advance(12.1);
    assert_eq!(h.port.state(), PortState::Listening);
    assert_eq!(h.port.counters().listen_count, 1);
    assert_eq!(h.port.counters().reset_count, 0);

    h.advance(12.1);
    assert_eq!(h.port.state(), PortState::Listening);
    assert_eq!(h.port.counters().reset_count, 1);
    assert_eq!(h.port.counters().listen_count, 0);
    assert!(h.sent_of(MessageType::Announce).is_empty());
}

#[test]
fn test_better_master_makes_slave() {
    let mut h = harness(PtpConfig::default());
    h.become_slave();

    let ds = h.port.datasets();
    assert_eq!(ds.parent_ds.parent_port_identity, identity(MASTER_ID));
    assert_eq!(ds.parent_ds.grandmaster_priority1, 100);
    assert_eq!(ds.current_ds.steps_removed, 1);
    assert_eq!(h.port.best_master().map(|k| k.address), Some(master_address()));
    assert_eq!(h.port.counters().best_master_changes, 1);

    h.sync_one_step(1, 2_000);
    assert_eq!(h.port.state(), PortState::Slave);
    assert_eq!(h.port.counters().offset_updates, 1);
    assert_eq!(h.port.datasets().current_ds.offset_from_master.to_nanos(), 2_000);
    assert_eq!(h.status.read().unwrap().port_state, "SLAVE");
}

#[test]
fn test_lost_master_returns_to_listening() {
    let mut config = PtpConfig::default();
    config.ptpengine.slave_only = true;
    let mut h = harness(config);
    h.become_slave();
    h.sync_one_step(1, 1_000);
    assert_eq!(h.port.state(), PortState::Slave);

    // SyncReceipt (6 s at log 0) fires before the Announce receipt timeout
    h.advance(6.1);
    assert_eq!(h.port.state(), PortState::Listening);
    assert_eq!(h.port.counters().sync_timeouts, 1);
    assert_eq!(h.port.best_master(), None);
}

#[test]
fn test_pre_master_ignores_unqualified_announce() {
    let mut h = harness(PtpConfig::default());
    h.advance(12.1);
    assert_eq!(h.port.state(), PortState::PreMaster);

    let at = h.now();
    h.deliver(announce(0x60, 250, 248, 0), Ipv4Addr::new(10, 0, 0, 6), at);
    h.port.run_iteration(Duration::ZERO);
    assert_eq!(h.port.state(), PortState::PreMaster);

    h.advance(2.1);
    assert_eq!(h.port.state(), PortState::Master);
}

#[test]
fn test_master_only_clock_defers_as_passive() {
    let mut config = PtpConfig::default();
    config.ptpengine.clock_class = 6;
    let mut h = harness(config);

    let source = master_address();
    for seq in 0..2 {
        let at = h.now();
        h.deliver(announce(MASTER_ID, 100, 6, seq), source, at);
    }
    h.port.run_iteration(Duration::ZERO);
    assert_eq!(h.port.state(), PortState::Passive);

    let ds = h.port.datasets();
    assert_eq!(ds.parent_ds.parent_port_identity, identity(MASTER_ID));
    assert_eq!(ds.parent_ds.grandmaster_priority1, 100);
    assert_eq!(h.port.best_master().map(|k| k.address), Some(source));

    h.clear_sent();
    h.advance(3.0);
    assert!(h.sent_of(MessageType::Sync).is_empty());
    assert!(h.sent_of(MessageType::Announce).is_empty());

    // silent master: take over
    h.advance(9.1);
    assert_eq!(h.port.state(), PortState::PreMaster);
}

#[test]
fn test_announce_grace_period_keeps_parent() {
    let mut config = PtpConfig::default();
    config.ptpengine.slave_only = true;
    config.ptpengine.announce_timeout_grace_period = 3;
    let mut h = harness(config);
    h.become_slave();

    // Announce receipt timeout is 12 s at log 1; Syncs keep coming
    let mut seq = 0;
    h.sync_for(&mut seq, 13);
    assert_eq!(h.port.state(), PortState::Slave);
    assert_eq!(h.port.counters().announce_timeouts, 1);
    assert_eq!(h.port.best_master().map(|k| k.address), Some(master_address()));
    assert_eq!(h.port.datasets().parent_ds.parent_port_identity, identity(MASTER_ID));

    h.sync_for(&mut seq, 33);
    assert_eq!(h.port.state(), PortState::Slave);
    assert_eq!(h.port.counters().announce_timeouts, 3);

    h.sync_for(&mut seq, 4);
    assert_eq!(h.port.state(), PortState::Listening);
    assert_eq!(h.port.counters().announce_timeouts, 4);
    assert_eq!(h.port.best_master(), None);
}

#[test]
fn test_clock_update_timeout_returns_to_listening() {
    let mut config = PtpConfig::default();
    config.ptpengine.slave_only = true;
    config.clock.clock_update_timeout = 3;
    let mut h = harness(config);
    h.become_slave();
    h.sync_one_step(1, 1_000);
    assert_eq!(h.port.state(), PortState::Slave);

    h.advance(2.5);
    assert_eq!(h.port.state(), PortState::Slave);
    h.advance(0.7);
    assert_eq!(h.port.state(), PortState::Listening);
    assert_eq!(h.port.counters().clock_update_timeouts, 1);
    assert_eq!(h.port.counters().sync_timeouts, 0);
}

#[test]
fn test_listening_restores_configured_announce_interval() {
    let mut config = PtpConfig::default();
    config.ptpengine.slave_only = true;
    let mut h = harness(config);

    let source = master_address();
    for seq in 0..2 {
        let mut message = announce(MASTER_ID, 100, 6, seq);
        message.header.log_message_interval = 3;
        let at = h.now();
        h.deliver(message, source, at);
    }
    h.port.run_iteration(Duration::ZERO);
    assert_eq!(h.port.state(), PortState::Uncalibrated);
    assert_eq!(h.port.datasets().port_ds.log_announce_interval, 3);

    // no Sync: SyncReceipt (6 s) drops the master
    h.advance(6.1);
    assert_eq!(h.port.state(), PortState::Listening);
    assert_eq!(h.port.datasets().port_ds.log_announce_interval, 1);

    // listening timeout back at 6 x 2 s
    h.advance(12.1);
    assert_eq!(h.port.counters().listen_count, 1);
}

// ============================================================================
// RECEIVE PATH
// ============================================================================

#[test]
fn test_header_checks_count_errors() {
    let mut h = harness(PtpConfig::default());
    let at = h.now();

    h.deliver_raw(vec![0u8; 10], false, master_address(), at);
    assert_eq!(h.port.counters().message_format_errors, 1);

    let mut data = announce(MASTER_ID, 100, 6, 0).encode();
    data[1] = 1;
    h.deliver_raw(data, false, master_address(), at);
    assert_eq!(h.port.counters().version_mismatch_errors, 1);

    let mut message = announce(MASTER_ID, 100, 6, 0);
    message.header.domain_number = 7;
    h.deliver(message, master_address(), at);
    assert_eq!(h.port.counters().domain_mismatch_errors, 1);

    let pdelay = Message::new(
        header(MASTER_ID, 3),
        Body::PdelayReq {
            origin_timestamp: Default::default(),
        },
    );
    h.deliver(pdelay, master_address(), at);
    assert_eq!(h.port.counters().delay_mechanism_mismatch_errors, 1);

    assert_eq!(h.port.counters().announce_messages_received, 0);
    assert!(h.port.foreign_masters().is_empty());
}

#[test]
fn test_foreign_table_overflow_is_counted() {
    let mut config = PtpConfig::default();
    config.ptpengine.max_foreign_records = 2;
    let mut h = harness(config);
    let at = h.now();

    for id in [0x11, 0x12, 0x13] {
        h.deliver(announce(id, 128, 248, 0), Ipv4Addr::new(10, 0, 0, id), at);
    }
    assert_eq!(h.port.foreign_masters().len(), 2);
    assert_eq!(h.port.counters().foreign_added, 2);
    assert_eq!(h.port.counters().foreign_overflows, 1);
}

#[test]
fn test_sync_sequence_serial_arithmetic() {
    let mut config = PtpConfig::default();
    config.ptpengine.sync_sequence_checking = true;
    let mut h = harness(config);
    h.become_slave();

    for seq in [1, 2, 3, 7] {
        h.sync_one_step(seq, 1_000);
    }
    assert_eq!(h.port.counters().offset_updates, 4);
    assert_eq!(h.port.counters().sequence_mismatch_errors, 0);

    h.sync_one_step(5, 1_000);
    assert_eq!(h.port.counters().offset_updates, 4);
    assert_eq!(h.port.counters().sequence_mismatch_errors, 1);
    assert_eq!(h.port.counters().consecutive_sequence_errors, 1);

    h.sync_one_step(8, 1_000);
    assert_eq!(h.port.counters().offset_updates, 5);
    assert_eq!(h.port.counters().consecutive_sequence_errors, 0);
}

#[test]
fn test_sequence_errors_escalate_to_listening() {
    let mut config = PtpConfig::default();
    config.ptpengine.sync_sequence_checking = true;
    config.ptpengine.max_sequence_errors = 2;
    let mut h = harness(config);
    h.become_slave();

    h.sync_one_step(10, 1_000);
    for _ in 0..3 {
        h.sync_one_step(10, 1_000);
    }
    assert_eq!(h.port.state(), PortState::Listening);
    assert_eq!(h.port.counters().sequence_mismatch_errors, 3);
    assert_eq!(h.port.counters().protocol_errors, 1);
}

#[test]
fn test_e2e_delay_measurement() {
    let mut h = harness(PtpConfig::default());
    h.become_slave();
    h.clear_sent();

    // master-to-slave 10 us of which 4 us is path delay
    h.sync_one_step(1, 10_000);
    // randomized between 0.5 and 1.5 intervals
    for _ in 0..20 {
        if !h.sent_of(MessageType::DelayReq).is_empty() {
            break;
        }
        h.advance(0.1);
    }
    let requests = h.sent_of(MessageType::DelayReq);
    assert_eq!(requests.len(), 1);
    let (destination, request) = &requests[0];
    assert_eq!(*destination, Destination::Multicast);

    // t3 is the mock clock at send time, slave-to-master -2 us
    let t3 = h.now();
    let response = Message::new(
        Header {
            sequence_id: request.header.sequence_id,
            ..header(MASTER_ID, 0)
        },
        Body::DelayResp(ptp::DelayRespBody {
            receive_timestamp: (t3 - TimeInternal::from_nanos(2_000)).to_wire(),
            requesting_port_identity: identity(LOCAL_ID),
        }),
    );
    let t4 = h.now();
    h.deliver(response, master_address(), t4);
    assert_eq!(h.port.datasets().current_ds.mean_path_delay.to_nanos(), 4_000);
}

fn p2p_config() -> PtpConfig {
    let mut config = PtpConfig::default();
    config.ptpengine.delay_mechanism = DelayMechanism::P2P;
    config
}

/// Slave on a P2P port, returning the first Pdelay_Req sent and its send time.
fn first_pdelay_req(h: &mut Harness) -> (Message, TimeInternal) {
    h.become_slave();
    h.clear_sent();
    for _ in 0..30 {
        if !h.sent_of(MessageType::PdelayReq).is_empty() {
            break;
        }
        h.advance(0.1);
    }
    let requests = h.sent_of(MessageType::PdelayReq);
    assert_eq!(requests.len(), 1);
    let (destination, request) = requests[0].clone();
    assert_eq!(destination, Destination::PeerMulticast);
    assert!(h.sent_of(MessageType::DelayReq).is_empty());
    (request, h.now())
}

fn pdelay_resp(request: &Message, t2: TimeInternal, two_step: bool, correction_ns: i64) -> Message {
    let mut h = Header {
        sequence_id: request.header.sequence_id,
        correction_field: correction_ns << 16,
        ..header(MASTER_ID, 0)
    };
    h.flags.two_step = two_step;
    Message::new(
        h,
        Body::PdelayResp(ptp::PdelayRespBody {
            request_receipt_timestamp: t2.to_wire(),
            requesting_port_identity: identity(LOCAL_ID),
        }),
    )
}

#[test]
fn test_p2p_one_step_peer_delay() {
    let mut h = harness(p2p_config());
    let (request, t1) = first_pdelay_req(&mut h);

    // one-step responder: 2 us turnaround folded into the correction
    let t4 = t1 + TimeInternal::from_nanos(10_000);
    let response = pdelay_resp(&request, t1 + TimeInternal::from_nanos(4_000), false, 2_000);
    h.deliver(response, master_address(), t4);
    assert_eq!(h.port.datasets().port_ds.peer_mean_path_delay.to_nanos(), 4_000);

    // offset uses the peer delay
    h.sync_one_step(1, 10_000);
    assert_eq!(h.port.datasets().current_ds.offset_from_master.to_nanos(), 6_000);
}

#[test]
fn test_p2p_two_step_peer_delay() {
    let mut h = harness(p2p_config());
    let (request, t1) = first_pdelay_req(&mut h);

    let t2 = t1 + TimeInternal::from_nanos(3_000);
    let t3 = t2 + TimeInternal::from_nanos(5_000);
    let t4 = t3 + TimeInternal::from_nanos(3_500);
    let response = pdelay_resp(&request, t2, true, 0);
    h.deliver(response, master_address(), t4);
    assert!(h.port.datasets().port_ds.peer_mean_path_delay.is_zero());

    let mut fh = header(MASTER_ID, request.header.sequence_id);
    fh.correction_field = 500 << 16;
    let follow_up = Message::new(
        fh,
        Body::PdelayRespFollowUp(ptp::PdelayRespFollowUpBody {
            response_origin_timestamp: t3.to_wire(),
            requesting_port_identity: identity(LOCAL_ID),
        }),
    );
    let at = h.now();
    h.deliver(follow_up, master_address(), at);
    // ((t4 - t3) + (t2 - t1) - correction) / 2
    assert_eq!(h.port.datasets().port_ds.peer_mean_path_delay.to_nanos(), 3_000);

    h.sync_one_step(1, 8_000);
    assert_eq!(h.port.datasets().current_ds.offset_from_master.to_nanos(), 5_000);
}

// ============================================================================
// CLOCK DISCIPLINE
// ============================================================================

#[test]
fn test_step_once_steps_a_single_time() {
    let mut config = PtpConfig::default();
    config.clock.step_threshold_ns = 100_000_000;
    config.clock.step_once = true;
    let mut h = harness(config);
    h.become_slave();

    h.sync_one_step(1, 500_000_000);
    assert_eq!(*h.steps.lock().unwrap(), vec![TimeInternal::from_nanos(-500_000_000)]);
    assert_eq!(h.port.counters().clock_steps, 1);
    assert!(h.port.datasets().current_ds.offset_from_master.is_zero());

    // still off by 500 ms but no more steps: slew at the servo limit
    h.frequencies.lock().unwrap().clear();
    h.sync_one_step(2, 500_000_000);
    h.sync_one_step(3, 500_000_000);
    assert_eq!(h.steps.lock().unwrap().len(), 1);
    let max = h.port.servo().max_output();
    assert_eq!(*h.frequencies.lock().unwrap(), vec![-max, -max]);
}

#[test]
fn test_no_reset_clock_never_steps() {
    let mut config = PtpConfig::default();
    config.clock.no_reset_clock = true;
    let mut h = harness(config);
    h.become_slave();

    h.sync_one_step(1, -3_000_000_000);
    assert!(h.steps.lock().unwrap().is_empty());
    let max = h.port.servo().max_output();
    assert_eq!(h.frequencies.lock().unwrap().last().copied(), Some(max));
}

#[test]
fn test_no_adjust_leaves_clock_alone() {
    let mut config = PtpConfig::default();
    config.clock.no_adjust = true;
    let mut h = harness(config);
    h.become_slave();
    h.sync_one_step(1, 5_000);
    h.sync_one_step(2, 2_000_000_000);
    assert!(h.steps.lock().unwrap().is_empty());
    assert!(h.frequencies.lock().unwrap().is_empty());
    assert_eq!(h.port.counters().offset_updates, 2);
}

#[test]
fn test_max_offset_blocks_update() {
    let mut config = PtpConfig::default();
    config.clock.max_offset_ns = 1_000_000;
    let mut h = harness(config);
    h.become_slave();
    h.sync_one_step(1, 5_000_000);
    assert_eq!(h.port.counters().offset_updates, 0);
    assert_eq!(h.port.state(), PortState::Uncalibrated);
}

#[test]
fn test_panic_mode_holds_updates() {
    let mut config = PtpConfig::default();
    config.clock.enable_panic_mode = true;
    config.clock.panic_mode_exit_threshold_ns = 1_000_000;
    let mut h = harness(config);
    h.become_slave();

    h.sync_one_step(1, 3_000_000_000);
    assert_eq!(h.port.counters().panic_mode_entries, 1);
    assert!(h.steps.lock().unwrap().is_empty());

    h.sync_one_step(2, 3_000_000_000);
    assert_eq!(h.port.counters().offset_updates, 0);

    // back under the exit threshold: updates resume
    h.sync_one_step(3, 200_000);
    assert_eq!(h.port.counters().offset_updates, 1);
}

#[test]
fn test_drift_restored_from_file_on_uncalibrated() {
    let mut config = PtpConfig::default();
    config.clock.drift_handling = DriftRecovery::File;
    let mut store = MockDriftStore::new();
    store.expect_load().times(1).returning(|| Ok(Some(250.0)));
    let mut h = harness_with_store(config, store);

    h.become_slave();
    assert_eq!(h.port.servo().observed_drift(), 250.0);
    assert_eq!(h.frequencies.lock().unwrap().last().copied(), Some(-250.0));
}

#[test]
fn test_manual_step_uses_current_offset() {
    let mut config = PtpConfig::default();
    config.clock.step_threshold_ns = 1_000_000_000;
    let mut h = harness(config);
    h.become_slave();
    h.sync_one_step(1, 40_000);
    h.port.step_now();
    assert_eq!(*h.steps.lock().unwrap(), vec![TimeInternal::from_nanos(-40_000)]);
}

// ============================================================================
// MASTER ROLE / NEGOTIATION
// ============================================================================

#[test]
fn test_master_answers_delay_req() {
    let mut h = harness(PtpConfig::default());
    h.become_master();
    h.clear_sent();

    let rx = h.now();
    let request = Message::new(
        header(0x20, 9),
        Body::DelayReq {
            origin_timestamp: Default::default(),
        },
    );
    h.deliver(request, Ipv4Addr::new(10, 0, 0, 2), rx);

    let responses = h.sent_of(MessageType::DelayResp);
    assert_eq!(responses.len(), 1);
    let (destination, response) = &responses[0];
    assert_eq!(*destination, Destination::Multicast);
    assert_eq!(response.header.sequence_id, 9);
    match &response.body {
        Body::DelayResp(body) => {
            assert_eq!(body.requesting_port_identity, identity(0x20));
            assert_eq!(body.receive_timestamp, rx.to_wire());
        }
        other => panic!("expected Delay_Resp, got {:?}", other),
    }
}

fn negotiation_config() -> PtpConfig {
    let mut config = PtpConfig::default();
    config.ptpengine.ip_mode = IpMode::Unicast;
    config.unicast.negotiation = true;
    config
}

fn request(seq: u16, tlvs: Vec<SignalingTlv>) -> Message {
    Message::new(
        header(0x30, seq),
        Body::Signaling(SignalingBody {
            target_port_identity: PortIdentity::ALL_ONES,
            tlvs,
        }),
    )
}

#[test]
fn test_grant_request_granted_and_denied() {
    let mut h = harness(negotiation_config());
    h.become_master();
    h.clear_sent();

    let slave = Ipv4Addr::new(10, 0, 0, 3);
    let at = h.now();
    h.deliver(
        request(
            1,
            vec![
                SignalingTlv::RequestUnicast {
                    message_type: MessageType::Sync,
                    log_interval: -2,
                    duration: 60,
                },
                SignalingTlv::RequestUnicast {
                    message_type: MessageType::Announce,
                    log_interval: 9,
                    duration: 60,
                },
            ],
        ),
        slave,
        at,
    );

    let replies = h.sent_of(MessageType::Signaling);
    assert_eq!(replies.len(), 1);
    let (destination, reply) = &replies[0];
    assert_eq!(*destination, Destination::Unicast(slave));
    match &reply.body {
        Body::Signaling(body) => {
            assert_eq!(body.target_port_identity, identity(0x30));
            assert_eq!(
                body.tlvs,
                vec![
                    // interval raised to the configured minimum
                    SignalingTlv::GrantUnicast {
                        message_type: MessageType::Sync,
                        log_interval: 0,
                        duration: 60,
                        renewal_invited: true,
                    },
                    SignalingTlv::GrantUnicast {
                        message_type: MessageType::Announce,
                        log_interval: 9,
                        duration: 0,
                        renewal_invited: false,
                    },
                ]
            );
        }
        other => panic!("expected Signaling, got {:?}", other),
    }
    assert_eq!(h.port.counters().unicast_grants_granted, 1);
    assert_eq!(h.port.counters().unicast_grants_denied, 1);

    // Sync now goes to the granted slave only
    h.clear_sent();
    h.advance(1.5);
    let syncs = h.sent_of(MessageType::Sync);
    assert!(!syncs.is_empty());
    assert!(syncs.iter().all(|(d, _)| *d == Destination::Unicast(slave)));
    assert!(h.sent_of(MessageType::Announce).is_empty());
}

#[test]
fn test_request_denied_when_not_master() {
    let mut h = harness(negotiation_config());
    let at = h.now();
    h.deliver(
        request(
            1,
            vec![SignalingTlv::RequestUnicast {
                message_type: MessageType::Sync,
                log_interval: 0,
                duration: 60,
            }],
        ),
        Ipv4Addr::new(10, 0, 0, 3),
        at,
    );
    assert_eq!(h.port.counters().unicast_grants_denied, 1);
    assert!(h.port.grants_to_slaves().is_empty());
}

#[test]
fn test_granted_service_expires() {
    let mut h = harness(negotiation_config());
    h.become_master();

    let at = h.now();
    h.deliver(
        request(
            1,
            vec![SignalingTlv::RequestUnicast {
                message_type: MessageType::Sync,
                log_interval: 0,
                duration: 3,
            }],
        ),
        Ipv4Addr::new(10, 0, 0, 3),
        at,
    );
    assert!(h.port.grants_to_slaves().rows().any(|r| r.is_granted(MessageType::Sync)));

    h.advance(5.0);
    assert!(!h.port.grants_to_slaves().rows().any(|r| r.is_granted(MessageType::Sync)));
}

#[test]
fn test_canceled_slave_grant_stops_service() {
    let mut h = harness(negotiation_config());
    h.become_master();
    let slave = Ipv4Addr::new(10, 0, 0, 3);
    let at = h.now();
    h.deliver(
        request(
            1,
            vec![SignalingTlv::RequestUnicast {
                message_type: MessageType::Sync,
                log_interval: 0,
                duration: 60,
            }],
        ),
        slave,
        at,
    );
    h.advance(1.5);
    assert!(!h.sent_of(MessageType::Sync).is_empty());

    h.port.cancel_slave_grants();
    h.clear_sent();
    h.advance(1.5);
    assert!(h.sent_of(MessageType::Sync).is_empty());
    // CANCEL is repeated until acknowledged
    assert!(!h.sent_of(MessageType::Signaling).is_empty());
}

#[test]
fn test_shutdown_cancels_grants() {
    let mut h = harness(negotiation_config());
    h.become_master();
    let slave = Ipv4Addr::new(10, 0, 0, 3);
    let at = h.now();
    h.deliver(
        request(
            1,
            vec![SignalingTlv::RequestUnicast {
                message_type: MessageType::Sync,
                log_interval: 0,
                duration: 60,
            }],
        ),
        slave,
        at,
    );
    h.clear_sent();

    h.port.shutdown();
    assert_eq!(h.port.state(), PortState::Disabled);
    let cancels = h.sent_of(MessageType::Signaling);
    assert_eq!(cancels.len(), 1);
    assert_eq!(cancels[0].0, Destination::Unicast(slave));
    match &cancels[0].1.body {
        Body::Signaling(body) => assert_eq!(
            body.tlvs,
            vec![SignalingTlv::CancelUnicast {
                message_type: MessageType::Sync
            }]
        ),
        other => panic!("expected Signaling, got {:?}", other),
    }
    assert_eq!(h.port.counters().unicast_grants_cancel_sent, 1);
    assert!(h.port.grants_to_slaves().rows().all(|r| !r.is_granted(MessageType::Sync)));
}

#[test]
fn test_slave_requests_grants_from_destinations() {
    let mut config = negotiation_config();
    config.ptpengine.slave_only = true;
    config.unicast.destinations = vec![master_address()];
    let mut h = harness(config);

    h.advance(1.2);
    let requests = h.sent_of(MessageType::Signaling);
    assert_eq!(requests.len(), 1);
    let (destination, message) = &requests[0];
    assert_eq!(*destination, Destination::Unicast(master_address()));
    match &message.body {
        Body::Signaling(body) => {
            assert_eq!(body.target_port_identity, PortIdentity::ALL_ONES);
            // no parent yet: only Announce is requested
            assert_eq!(body.tlvs.len(), 1);
            assert!(matches!(
                body.tlvs[0],
                SignalingTlv::RequestUnicast {
                    message_type: MessageType::Announce,
                    ..
                }
            ));
        }
        other => panic!("expected Signaling, got {:?}", other),
    }
}
