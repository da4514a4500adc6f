//! Wire types shared between the race-session coordinator and the broadcast
//! transport: the message envelope exchanged between the two paired devices,
//! and the room-code alphabet used to name a broadcast channel.
//!
//! Nanosecond timestamps are transmitted as decimal strings — a JSON number
//! cannot hold a 64-bit nanosecond count without losing precision.

use serde::{Deserialize, Serialize};

/// Which end of the gate a device is timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Start,
    Finish,
}

impl Role {
    pub fn other(self) -> Role {
        match self {
            Role::Start => Role::Finish,
            Role::Finish => Role::Start,
        }
    }
}

/// Header carried by every race message: identifies the session, the
/// sending device, and this sender's monotonic sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "senderId")]
    pub sender_id: String,
    pub seq: u64,
}

/// The tagged payload variants. `#[serde(tag = "type")]` renders the variant
/// name as the envelope's `"type"` field, matching the wire format exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RacePayload {
    #[serde(rename = "syncPing")]
    SyncPing { t1: String },
    #[serde(rename = "syncPong")]
    SyncPong { t1: String, t2: String, t3: String },
    #[serde(rename = "roleConfirm")]
    RoleConfirm { role: Role },
    #[serde(rename = "ready")]
    Ready { role: Role },
    #[serde(rename = "startEvent")]
    StartEvent {
        #[serde(rename = "tStart")]
        t_start: String,
    },
    #[serde(rename = "finishResult")]
    FinishResult {
        #[serde(rename = "splitNanos")]
        split_nanos: String,
        #[serde(rename = "uncertaintyMs")]
        uncertainty_ms: f64,
    },
    #[serde(rename = "heartbeat")]
    Heartbeat {},
}

impl RacePayload {
    pub fn type_tag(&self) -> &'static str {
        match self {
            RacePayload::SyncPing { .. } => "syncPing",
            RacePayload::SyncPong { .. } => "syncPong",
            RacePayload::RoleConfirm { .. } => "roleConfirm",
            RacePayload::Ready { .. } => "ready",
            RacePayload::StartEvent { .. } => "startEvent",
            RacePayload::FinishResult { .. } => "finishResult",
            RacePayload::Heartbeat {} => "heartbeat",
        }
    }
}

/// A complete race message: header plus tagged payload, flattened to a
/// single JSON object on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceMessage {
    #[serde(flatten)]
    pub header: MessageHeader,
    #[serde(flatten)]
    pub payload: RacePayload,
}

impl RaceMessage {
    pub fn new(header: MessageHeader, payload: RacePayload) -> Self {
        Self { header, payload }
    }
}

/// Encode a nanosecond timestamp as the decimal string the wire format
/// requires.
pub fn encode_nanos(n: i64) -> String {
    n.to_string()
}

/// Decode a decimal nanosecond string. Returns `None` on anything that
/// isn't a plain base-10 integer — callers drop the input silently per the
/// "malformed sample inputs are rejected silently" failure semantics.
pub fn decode_nanos(s: &str) -> Option<i64> {
    s.parse::<i64>().ok()
}

/// Unambiguous 32-character alphabet for 6-character room codes: excludes
/// characters easily confused when read aloud or handwritten (0/O, 1/I/L).
pub const ROOM_CODE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const ROOM_CODE_LEN: usize = 6;

/// Validate that `code` is exactly [`ROOM_CODE_LEN`] characters, all drawn
/// from [`ROOM_CODE_ALPHABET`]. Does not allocate.
pub fn is_valid_room_code(code: &str) -> bool {
    code.len() == ROOM_CODE_LEN && code.bytes().all(|b| ROOM_CODE_ALPHABET.contains(&b))
}

/// Channel name a room code maps to on the broadcast transport.
pub fn channel_name(room_code: &str) -> String {
    format!("race-{room_code}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_with_flattened_header() {
        let msg = RaceMessage::new(
            MessageHeader {
                session_id: "s1".into(),
                sender_id: "dev-a".into(),
                seq: 3,
            },
            RacePayload::SyncPing {
                t1: encode_nanos(1_234_567_890),
            },
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "syncPing");
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["seq"], 3);
        assert_eq!(json["t1"], "1234567890");

        let back: RaceMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn nanos_round_trip() {
        assert_eq!(decode_nanos(&encode_nanos(-42)), Some(-42));
        assert_eq!(decode_nanos("not a number"), None);
    }

    #[test]
    fn room_code_validation() {
        assert!(is_valid_room_code("AB23XZ"));
        assert!(!is_valid_room_code("AB23X")); // too short
        assert!(!is_valid_room_code("AB23O1")); // O/1 not in alphabet
    }
}
