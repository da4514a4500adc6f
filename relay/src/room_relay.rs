//! Connection handling for the opaque room relay. Two devices exchange a
//! room code out of band, each joins the corresponding Socket.IO room, and
//! every message one sends is broadcast verbatim to the other — the relay
//! never parses `type`, `sessionId`, or any other field of the envelope,
//! it only needs the room code to route.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use socketioxide::extract::{Data, SocketRef};
use tokio::sync::RwLock;
use tracing::{info, warn};

use timer_types::{channel_name, is_valid_room_code};

/// Maps a connected socket to the room channel it has joined, so a
/// "message" event can be routed without the client repeating the room
/// code on every send.
pub type RoomRegistry = Arc<RwLock<HashMap<String, String>>>;

pub fn new_registry() -> RoomRegistry {
    Arc::new(RwLock::new(HashMap::new()))
}

#[derive(Debug, Deserialize)]
struct JoinRequest {
    #[serde(rename = "roomCode")]
    room_code: String,
}

pub async fn on_connect(socket: SocketRef, rooms: RoomRegistry) {
    let socket_id = socket.id.to_string();
    info!("relay: socket {socket_id} connected");

    socket.on_disconnect({
        let rooms = rooms.clone();
        let socket_id = socket_id.clone();
        move |_: SocketRef| {
            let rooms = rooms.clone();
            let socket_id = socket_id.clone();
            async move {
                let left = rooms.write().await.remove(&socket_id);
                if let Some(channel) = left {
                    info!("relay: socket {socket_id} disconnected, left {channel}");
                } else {
                    info!("relay: socket {socket_id} disconnected");
                }
            }
        }
    });

    socket.on("join", {
        let rooms = rooms.clone();
        move |s: SocketRef, Data::<JoinRequest>(req)| {
            let rooms = rooms.clone();
            async move {
                let code = req.room_code.trim().to_uppercase();
                if !is_valid_room_code(&code) {
                    warn!("relay: socket {} sent malformed room code {:?}", s.id, req.room_code);
                    let _ = s.emit("join-error", &json!({ "error": "invalid room code" }));
                    return;
                }

                let channel = channel_name(&code);
                if let Err(e) = s.join(channel.clone()) {
                    warn!("relay: socket {} failed to join {channel}: {e}", s.id);
                    let _ = s.emit("join-error", &json!({ "error": "join failed" }));
                    return;
                }
                rooms.write().await.insert(s.id.to_string(), channel.clone());
                info!("relay: socket {} joined {channel}", s.id);
                let _ = s.emit("joined", &json!({ "channel": channel }));
            }
        }
    });

    socket.on("message", {
        let rooms = rooms.clone();
        move |s: SocketRef, Data::<Value>(envelope)| {
            let rooms = rooms.clone();
            async move {
                let Some(channel) = rooms.read().await.get(&s.id.to_string()).cloned() else {
                    warn!("relay: socket {} sent a message before joining a room", s.id);
                    return;
                };
                if let Err(e) = s.to(channel.clone()).emit("message", &envelope) {
                    warn!("relay: broadcast to {channel} failed: {e}");
                }
            }
        }
    });

    socket.on("leave", {
        let rooms = rooms.clone();
        move |s: SocketRef, _: Data<Value>| {
            let rooms = rooms.clone();
            async move {
                if let Some(channel) = rooms.write().await.remove(&s.id.to_string()) {
                    let _ = s.leave(channel.clone());
                    info!("relay: socket {} left {channel}", s.id);
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_starts_empty() {
        let rooms = new_registry();
        assert!(rooms.read().await.is_empty());
    }
}
