//! SHA-256 chained append-only log of DET/SESS lifecycle events
//! (calibration complete, armed, triggered, finish result). Tampering with
//! any entry breaks the chain, since each block's hash folds in the
//! previous block's hash. Not part of any DET/SYNC/SESS invariant — purely
//! an operator-facing audit trail layered on top.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RaceEventType {
    CalibrationComplete,
    Armed,
    Triggered,
    FinishResult,
    SessionEvent,
}

impl std::fmt::Display for RaceEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_string(self).unwrap_or_default();
        write!(f, "{}", s.trim_matches('"'))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditBlock {
    pub block_seq: u64,
    pub session_id: String,
    pub timestamp_ms: u64,
    pub prev_hash: String,
    pub event_type: RaceEventType,
    pub payload_json: String,
    pub block_hash: String,
}

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

impl AuditBlock {
    fn compute_hash(
        prev_hash: &str,
        timestamp_ms: u64,
        event_type: &RaceEventType,
        payload_json: &str,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(prev_hash.as_bytes());
        hasher.update(timestamp_ms.to_le_bytes());
        hasher.update(event_type.to_string().as_bytes());
        hasher.update(payload_json.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn new(
        block_seq: u64,
        session_id: String,
        timestamp_ms: u64,
        prev_hash: String,
        event_type: RaceEventType,
        payload_json: String,
    ) -> Self {
        let block_hash = Self::compute_hash(&prev_hash, timestamp_ms, &event_type, &payload_json);
        Self { block_seq, session_id, timestamp_ms, prev_hash, event_type, payload_json, block_hash }
    }

    pub fn verify(&self) -> bool {
        let expected =
            Self::compute_hash(&self.prev_hash, self.timestamp_ms, &self.event_type, &self.payload_json);
        expected == self.block_hash
    }
}

#[derive(Default)]
struct AuditState {
    block_seq: u64,
    last_hash: String,
}

/// Append-only SHA-256 chained audit logger. Writes JSON lines to a
/// configured path, falling back to stdout logging when the path is
/// unavailable (e.g. running off-device in the simulator) — never blocks
/// a race on a logging failure.
#[derive(Clone)]
pub struct RaceAuditLog {
    state: Arc<RwLock<AuditState>>,
    session_id: Arc<RwLock<String>>,
    path: Arc<str>,
}

impl RaceAuditLog {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            state: Arc::new(RwLock::new(AuditState {
                block_seq: 0,
                last_hash: GENESIS_HASH.to_string(),
            })),
            session_id: Arc::new(RwLock::new(String::new())),
            path: path.into().into(),
        }
    }

    pub async fn set_session(&self, id: String) {
        *self.session_id.write().await = id;
    }

    pub async fn append(&self, event_type: RaceEventType, payload: serde_json::Value) {
        let timestamp_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let payload_json = payload.to_string();
        let session_id = self.session_id.read().await.clone();

        let block = {
            let mut state = self.state.write().await;
            let block = AuditBlock::new(
                state.block_seq,
                session_id,
                timestamp_ms,
                state.last_hash.clone(),
                event_type,
                payload_json,
            );
            state.last_hash = block.block_hash.clone();
            state.block_seq += 1;
            block
        };
        debug_assert!(block.verify(), "audit block hash mismatch immediately after creation");

        let line = match serde_json::to_string(&block) {
            Ok(l) => format!("{l}\n"),
            Err(e) => {
                warn!("audit: failed to serialize block: {e}");
                return;
            }
        };

        match OpenOptions::new().create(true).append(true).open(self.path.as_ref()).await {
            Ok(mut f) => {
                if let Err(e) = f.write_all(line.as_bytes()).await {
                    warn!("audit: write failed: {e}");
                }
            }
            Err(e) => {
                info!("audit[{}]: {} — {}", block.block_seq, block.event_type, block.block_hash);
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("audit: could not open {}: {e}", self.path);
                }
            }
        }
    }

    pub async fn log_finish_result(&self, split_nanos: i64, uncertainty_ms: f64) {
        self.append(
            RaceEventType::FinishResult,
            serde_json::json!({ "splitNanos": split_nanos, "uncertaintyMs": uncertainty_ms }),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chain_hashes_verify_and_link() {
        let dir = std::env::temp_dir().join(format!("audit_test_{}", uuid::Uuid::new_v4()));
        let log = RaceAuditLog::new(dir.to_string_lossy().to_string());
        log.set_session("ROOM01".into()).await;
        log.append(RaceEventType::Armed, serde_json::json!({})).await;
        log.log_finish_result(10_001_000_500, 10.0).await;

        let contents = tokio::fs::read_to_string(&dir).await.unwrap();
        let blocks: Vec<AuditBlock> =
            contents.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].verify());
        assert!(blocks[1].verify());
        assert_eq!(blocks[1].prev_hash, blocks[0].block_hash);
        let _ = tokio::fs::remove_file(&dir).await;
    }
}
