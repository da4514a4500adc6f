//! SESS — race session coordinator.
//!
//! Joins a broadcast room, exchanges ordered/deduplicated messages over a
//! dumb pipe, drives the pairing → sync → armed → running → finished state
//! machine, and converts a local crossing into the peer's monotonic-clock
//! domain to compute the final split.

use std::collections::HashMap;

use timer_types::{
    channel_name, decode_nanos, encode_nanos, MessageHeader, RaceMessage, RacePayload, Role,
};
use uuid::Uuid;

use crate::error::{TimerError, TimerResult};
use crate::room_code::generate_room_code;
use crate::sync::{Quality, Sync, SyncStatus};
use crate::transport::{NullTransport, Transport};

const SYNC_BURST_MAX_PINGS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Pairing,
    Syncing,
    Ready,
    Armed,
    Running,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FinishOutcome {
    pub split_nanos: i64,
    pub uncertainty_ms: f64,
}

/// PTS→uptime conversion per §4.3: `uptimeNanos + round((triggerPts -
/// ptsSeconds) * 1e9)`.
pub fn crossing_to_local_nanos(trigger_pts: f64, pts_seconds: f64, uptime_nanos: i64) -> i64 {
    uptime_nanos + ((trigger_pts - pts_seconds) * 1e9).round() as i64
}

pub struct Sess {
    role: Role,
    session_id: String,
    sender_id: String,
    seq: u64,
    state: SessionState,

    transport: Box<dyn Transport>,
    sync: Sync,

    last_seq_by_sender: HashMap<String, u64>,
    partner_connected: bool,
    offset_nanos: i64,
    t_start_local: Option<i64>,
    finish_outcome: Option<FinishOutcome>,

    pings_sent: u32,
}

impl Sess {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            session_id: String::new(),
            sender_id: Uuid::new_v4().to_string(),
            seq: 1,
            state: SessionState::Idle,
            transport: Box::new(NullTransport::default()),
            sync: Sync::new(),
            last_seq_by_sender: HashMap::new(),
            partner_connected: false,
            offset_nanos: 0,
            t_start_local: None,
            finish_outcome: None,
            pings_sent: 0,
        }
    }

    pub fn with_transport(role: Role, transport: Box<dyn Transport>) -> Self {
        let mut sess = Self::new(role);
        sess.transport = transport;
        sess
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.sync.status()
    }

    pub fn finish_outcome(&self) -> Option<FinishOutcome> {
        self.finish_outcome
    }

    fn next_seq(&mut self) -> u64 {
        let s = self.seq;
        self.seq += 1;
        s
    }

    fn build_message(&mut self, payload: RacePayload) -> RaceMessage {
        let header = MessageHeader {
            session_id: self.session_id.clone(),
            sender_id: self.sender_id.clone(),
            seq: self.next_seq(),
        };
        RaceMessage::new(header, payload)
    }

    fn send(&mut self, payload: RacePayload) -> TimerResult<()> {
        if !self.transport.is_connected() {
            return Err(TimerError::TransportUnavailable);
        }
        let msg = self.build_message(payload);
        if self.transport.send(&msg) {
            Ok(())
        } else {
            Err(TimerError::TransportUnavailable)
        }
    }

    /// Generates a room code, connects to `race-<code>`, and announces
    /// this device's role. Returns the code so the operator can relay it
    /// to the peer device.
    pub fn create_room(&mut self) -> String {
        let code = generate_room_code();
        self.session_id = code.clone();
        self.transport.connect(&channel_name(&code));
        let _ = self.send(RacePayload::RoleConfirm { role: self.role });
        self.state = SessionState::Pairing;
        code
    }

    /// Joins an existing room. The joiner adopts the room code itself as
    /// the session identifier — the creator never transmits a separate
    /// `sessionId` out of band, so both sides need a value they can agree
    /// on without a handshake; see DESIGN.md for the reasoning.
    pub fn join_room(&mut self, code: &str) {
        let code = code.to_uppercase();
        self.session_id = code.clone();
        self.transport.connect(&channel_name(&code));
        let _ = self.send(RacePayload::RoleConfirm { role: self.role });
        self.state = SessionState::Pairing;
    }

    /// Resets SYNC and the sync-burst counter, called when entering
    /// `syncing` and again on manual retry.
    pub fn start_sync(&mut self) {
        self.sync.reset();
        self.pings_sent = 0;
        self.state = SessionState::Syncing;
    }

    /// Called by the control loop on a ~30ms cadence while `syncing`.
    /// Returns the next `syncPing` to send, or `None` once the burst is
    /// exhausted or the state has moved on.
    pub fn tick_sync_burst(&mut self) -> Option<RaceMessage> {
        if self.state != SessionState::Syncing || self.pings_sent >= SYNC_BURST_MAX_PINGS {
            return None;
        }
        self.pings_sent += 1;
        let t1 = self.sync.now_nanos();
        Some(self.build_message(RacePayload::SyncPing { t1: encode_nanos(t1) }))
    }

    pub fn arm(&mut self) -> TimerResult<()> {
        if self.state != SessionState::Ready {
            return Err(TimerError::WrongState("arm"));
        }
        if !self.partner_connected {
            return Err(TimerError::PartnerMissing);
        }
        self.state = SessionState::Armed;
        Ok(())
    }

    /// Converts a DET crossing into this device's own monotonic-clock
    /// domain, then runs the start/finish pipeline appropriate to this
    /// device's role.
    pub fn on_crossing(
        &mut self,
        trigger_pts: f64,
        pts_seconds: f64,
        uptime_nanos: i64,
    ) -> TimerResult<Option<FinishOutcome>> {
        let t_cross_local = crossing_to_local_nanos(trigger_pts, pts_seconds, uptime_nanos);
        match self.role {
            Role::Start => {
                if self.state != SessionState::Armed {
                    return Err(TimerError::WrongState("start_crossing"));
                }
                self.send(RacePayload::StartEvent { t_start: encode_nanos(t_cross_local) })?;
                self.state = SessionState::Running;
                Ok(None)
            }
            Role::Finish => {
                if self.state != SessionState::Running {
                    return Err(TimerError::WrongState("finish_crossing"));
                }
                let status = self.sync.status();
                if !status.is_ready {
                    return Err(TimerError::SyncNotReady);
                }
                let Some(t_start_local) = self.t_start_local else {
                    return Err(TimerError::PartnerMissing);
                };
                let split_nanos = if t_cross_local >= t_start_local {
                    t_cross_local - t_start_local
                } else {
                    tracing::warn!(
                        "SESS: finish crossing preceded start in finish domain, clamping split to 0"
                    );
                    0
                };
                let outcome = FinishOutcome { split_nanos, uncertainty_ms: status.uncertainty_ms };
                let _ = self.send(RacePayload::FinishResult {
                    split_nanos: encode_nanos(split_nanos),
                    uncertainty_ms: status.uncertainty_ms,
                });
                self.state = SessionState::Finished;
                self.finish_outcome = Some(outcome);
                if split_nanos == 0 {
                    return Err(TimerError::ImplausibleSplit);
                }
                Ok(Some(outcome))
            }
        }
    }

    /// Dispatches an inbound message, after applying dedup/ordering and
    /// session-id filtering: stale or replayed messages, and messages for
    /// a different session, never change observable state.
    pub fn on_message(&mut self, msg: RaceMessage) {
        if msg.header.session_id != self.session_id {
            return;
        }
        let last = self.last_seq_by_sender.get(&msg.header.sender_id).copied().unwrap_or(0);
        if msg.header.seq <= last {
            return;
        }
        self.last_seq_by_sender.insert(msg.header.sender_id.clone(), msg.header.seq);

        match msg.payload {
            RacePayload::RoleConfirm { .. } => {
                self.partner_connected = true;
                if self.state == SessionState::Pairing {
                    self.state = SessionState::Syncing;
                }
            }
            RacePayload::Ready { .. } => {
                self.partner_connected = true;
            }
            RacePayload::SyncPing { t1 } => {
                let Some(t1) = decode_nanos(&t1) else { return };
                let (t2, t3) = self.sync.handle_ping(t1);
                let _ = self.send(RacePayload::SyncPong {
                    t1: encode_nanos(t1),
                    t2: encode_nanos(t2),
                    t3: encode_nanos(t3),
                });
            }
            RacePayload::SyncPong { t1, t2, t3 } => {
                let (Some(t1), Some(t2), Some(t3)) =
                    (decode_nanos(&t1), decode_nanos(&t2), decode_nanos(&t3))
                else {
                    return;
                };
                let t4 = self.sync.now_nanos();
                self.sync.add_sample(t1, t2, t3, t4);
                let status = self.sync.status();
                if status.is_ready && self.state == SessionState::Syncing {
                    self.offset_nanos = status.offset_nanos;
                    self.state = SessionState::Ready;
                }
            }
            RacePayload::StartEvent { t_start } => {
                if self.state == SessionState::Finished {
                    return; // arrived after our own finishResult: ignored
                }
                let Some(t_start_remote) = decode_nanos(&t_start) else { return };
                self.t_start_local =
                    Some(self.sync.convert_remote_to_local(t_start_remote, self.offset_nanos));
                if matches!(self.state, SessionState::Armed | SessionState::Ready) {
                    self.state = SessionState::Running;
                }
            }
            RacePayload::FinishResult { split_nanos, uncertainty_ms } => {
                if let Some(split_nanos) = decode_nanos(&split_nanos) {
                    self.finish_outcome = Some(FinishOutcome { split_nanos, uncertainty_ms });
                }
                self.state = SessionState::Finished;
            }
            RacePayload::Heartbeat {} => {}
        }
    }

    pub fn sync_quality(&self) -> Quality {
        self.sync.status().quality
    }

    /// Idempotent: cancels the pending sync burst, disconnects, and resets
    /// SYNC. Does not itself reset DET — that is the caller's
    /// responsibility via the SPSC configuration channel described in the
    /// concurrency model, since DET is owned by the camera thread.
    ///
    /// Cancelling while `running` yields `finished` with no result rather
    /// than `idle`, and returns `Err(TimerError::Aborted)` so the caller can
    /// distinguish a cancelled run from a normal disconnect.
    pub fn disconnect(&mut self) -> TimerResult<()> {
        self.transport.disconnect();
        self.sync.reset();
        self.pings_sent = 0;
        self.partner_connected = false;
        self.t_start_local = None;
        let was_running = self.state == SessionState::Running;
        if was_running {
            self.finish_outcome = None;
            self.state = SessionState::Finished;
            tracing::warn!("SESS: session aborted mid-run");
            return Err(TimerError::Aborted);
        }
        self.state = SessionState::Idle;
        Ok(())
    }

    /// Returns to `ready`, clearing run-scoped state. A no-op if the
    /// session never reached `ready`.
    pub fn reset(&mut self) {
        if matches!(
            self.state,
            SessionState::Ready
                | SessionState::Armed
                | SessionState::Running
                | SessionState::Finished
        ) {
            self.t_start_local = None;
            self.finish_outcome = None;
            self.state = SessionState::Ready;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// A `Transport` that appends sent messages to a shared outbox instead
    /// of delivering them anywhere, so a test can drain one side's outbox
    /// and feed it into the other side's `on_message` — enough to drive the
    /// real pairing/sync/crossing pipeline without a real socket.
    struct CapturingTransport {
        connected: bool,
        sent: Arc<Mutex<Vec<RaceMessage>>>,
    }

    impl Transport for CapturingTransport {
        fn connect(&mut self, _channel: &str) {
            self.connected = true;
        }
        fn disconnect(&mut self) {
            self.connected = false;
        }
        fn is_connected(&self) -> bool {
            self.connected
        }
        fn send(&mut self, msg: &RaceMessage) -> bool {
            if !self.connected {
                return false;
            }
            self.sent.lock().unwrap().push(msg.clone());
            true
        }
    }

    fn deliver(outbox: &Arc<Mutex<Vec<RaceMessage>>>, to: &mut Sess) {
        for msg in outbox.lock().unwrap().drain(..).collect::<Vec<_>>() {
            to.on_message(msg);
        }
    }

    /// Drives two paired `Sess` instances all the way from room creation
    /// through a ready sync, exercising `on_crossing` for both roles end to
    /// end: pairing, the sync burst reaching `isReady`, arm gating, the
    /// start/finish role split in `on_crossing`, and `finish_outcome`
    /// storage — not just the isolated arithmetic it relies on.
    #[test]
    fn full_race_drives_on_crossing_for_both_roles() {
        let start_out = Arc::new(Mutex::new(Vec::new()));
        let finish_out = Arc::new(Mutex::new(Vec::new()));
        let mut start = Sess::with_transport(
            Role::Start,
            Box::new(CapturingTransport { connected: false, sent: start_out.clone() }),
        );
        let mut finish = Sess::with_transport(
            Role::Finish,
            Box::new(CapturingTransport { connected: false, sent: finish_out.clone() }),
        );

        let code = start.create_room();
        finish.join_room(&code);
        deliver(&start_out, &mut finish);
        deliver(&finish_out, &mut start);
        assert_eq!(start.state(), SessionState::Syncing);
        assert_eq!(finish.state(), SessionState::Syncing);

        start.start_sync();
        finish.start_sync();
        for _ in 0..100 {
            if let Some(ping) = start.tick_sync_burst() {
                finish.on_message(ping);
            }
            if let Some(ping) = finish.tick_sync_burst() {
                start.on_message(ping);
            }
            deliver(&start_out, &mut finish);
            deliver(&finish_out, &mut start);
            if start.sync_status().is_ready && finish.sync_status().is_ready {
                break;
            }
        }
        assert_eq!(start.state(), SessionState::Ready);
        assert_eq!(finish.state(), SessionState::Ready);
        let offset = finish.sync_status().offset_nanos;

        start.arm().unwrap();
        finish.arm().unwrap();

        // Start crossing at uptime 5_000_000_000ns in its own domain; with
        // trigger_pts == pts_seconds the PTS correction term is zero.
        let start_result = start.on_crossing(5.0, 5.0, 5_000_000_000).unwrap();
        assert!(start_result.is_none());
        assert_eq!(start.state(), SessionState::Running);
        deliver(&start_out, &mut finish);
        assert_eq!(finish.state(), SessionState::Running);

        // Finish crossing 10s later (finish's own local domain).
        let outcome = finish.on_crossing(15.0, 15.0, 15_000_000_000).unwrap().expect("finish outcome");
        assert_eq!(finish.state(), SessionState::Finished);
        assert_eq!(outcome.split_nanos, 10_000_000_000 + offset);
        assert_eq!(finish.finish_outcome(), Some(outcome));
    }

    #[test]
    fn finish_crossing_before_armed_is_rejected() {
        let mut finish = Sess::new(Role::Finish);
        assert_eq!(
            finish.on_crossing(1.0, 1.0, 1_000_000_000),
            Err(TimerError::WrongState("finish_crossing"))
        );
    }

    #[test]
    fn disconnect_mid_running_surfaces_aborted() {
        let mut sess = Sess::new(Role::Start);
        sess.state = SessionState::Running;
        assert_eq!(sess.disconnect(), Err(TimerError::Aborted));
        assert_eq!(sess.state(), SessionState::Finished);
        assert_eq!(sess.finish_outcome(), None);
    }

    #[test]
    fn disconnect_when_idle_is_a_plain_reset() {
        let mut sess = Sess::new(Role::Start);
        sess.state = SessionState::Ready;
        assert_eq!(sess.disconnect(), Ok(()));
        assert_eq!(sess.state(), SessionState::Idle);
    }

    #[test]
    fn dedup_drops_replayed_and_stale_messages() {
        let mut sess = Sess::new(Role::Finish);
        sess.session_id = "ROOM01".into();
        sess.transport.connect("race-ROOM01");

        let mut deliveries = 0;
        for seq in [1, 1, 1] {
            let msg = RaceMessage::new(
                MessageHeader {
                    session_id: "ROOM01".into(),
                    sender_id: "peer".into(),
                    seq,
                },
                RacePayload::RoleConfirm { role: Role::Start },
            );
            let before = sess.partner_connected;
            sess.on_message(msg);
            if !before && sess.partner_connected {
                deliveries += 1;
            }
        }
        assert_eq!(deliveries, 1);
    }

    #[test]
    fn wrong_session_id_is_dropped() {
        let mut sess = Sess::new(Role::Finish);
        sess.session_id = "ROOM01".into();
        let msg = RaceMessage::new(
            MessageHeader { session_id: "OTHER1".into(), sender_id: "peer".into(), seq: 1 },
            RacePayload::RoleConfirm { role: Role::Start },
        );
        sess.on_message(msg);
        assert!(!sess.partner_connected);
    }
}
