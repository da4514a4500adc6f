//! Transport shim — a thin adapter over any ordered, best-effort broadcast
//! bus. SESS never talks to a concrete transport directly; it talks to
//! this trait, so the broadcast relay (or a loopback pair for testing) can
//! be swapped in without touching session logic.

use timer_types::RaceMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Send-side of the shim. `connect`/`disconnect` join/leave a named
/// channel; `send` is best-effort and returns `false` (never panics, never
/// blocks) if nothing could be sent.
pub trait Transport: Send {
    fn connect(&mut self, channel: &str);
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;
    fn send(&mut self, msg: &RaceMessage) -> bool;
}

/// A transport that always reports itself connected but drops every
/// message — useful as the initial state of a session before `createRoom`
/// / `joinRoom` has been called, and in tests that don't care about wire
/// delivery.
#[derive(Default)]
pub struct NullTransport {
    connected: bool,
}

impl Transport for NullTransport {
    fn connect(&mut self, _channel: &str) {
        self.connected = true;
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn send(&mut self, _msg: &RaceMessage) -> bool {
        self.connected
    }
}
