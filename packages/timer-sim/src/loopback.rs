//! A `Transport` pair that wires two `Sess` instances directly together,
//! standing in for the broadcast relay during a synthetic race: messages
//! sent on one side queue up until `LoopbackBus::pump` hands them to the
//! other, mirroring the relay's non-blocking, best-effort delivery.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use timer_core::{Sess, Transport};
use timer_types::RaceMessage;

type Wire = Arc<Mutex<VecDeque<RaceMessage>>>;

pub struct LoopbackTransport {
    connected: bool,
    outbox: Wire,
}

impl Transport for LoopbackTransport {
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
        self.outbox.lock().unwrap().push_back(msg.clone());
        true
    }
}

pub struct LoopbackBus {
    a_to_b: Wire,
    b_to_a: Wire,
}

impl LoopbackBus {
    pub fn new_pair() -> (LoopbackTransport, LoopbackTransport, LoopbackBus) {
        let a_to_b: Wire = Arc::new(Mutex::new(VecDeque::new()));
        let b_to_a: Wire = Arc::new(Mutex::new(VecDeque::new()));
        let ta = LoopbackTransport { connected: false, outbox: a_to_b.clone() };
        let tb = LoopbackTransport { connected: false, outbox: b_to_a.clone() };
        (ta, tb, LoopbackBus { a_to_b, b_to_a })
    }

    /// Drains everything in flight and delivers it to the matching peer.
    /// Call after any `Sess` operation that might have sent a message.
    pub fn pump(&self, sess_a: &mut Sess, sess_b: &mut Sess) {
        while let Some(msg) = self.a_to_b.lock().unwrap().pop_front() {
            sess_b.on_message(msg);
        }
        while let Some(msg) = self.b_to_a.lock().unwrap().pop_front() {
            sess_a.on_message(msg);
        }
    }
}
