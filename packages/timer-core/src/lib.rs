//! Core photo-finish timing components: the slit-scan crossing detector
//! (DET), the NTP-style clock synchronizer (SYNC), and the race session
//! coordinator (SESS) that ties them together over a broadcast transport.

pub mod audit;
pub mod clock;
pub mod det;
pub mod error;
pub mod room_code;
pub mod sess;
pub mod sync;
pub mod transport;

pub use audit::{RaceAuditLog, RaceEventType};
pub use det::{CrossingInfo, Det, DetResult, DetState, Frame};
pub use error::{TimerError, TimerResult};
pub use sess::{crossing_to_local_nanos, FinishOutcome, Sess, SessionState};
pub use sync::{Quality, Sync, SyncStatus};
pub use transport::{ConnectionState, NullTransport, Transport};
