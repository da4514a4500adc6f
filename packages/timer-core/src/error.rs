use thiserror::Error;

/// Tagged errors returned by DET, SYNC, and SESS. Never a panic — every
/// fallible operation returns one of these instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimerError {
    #[error("arm/process attempted before calibration completed")]
    NotCalibrated,
    #[error("operation invalid for current state: {0}")]
    WrongState(&'static str),
    #[error("frame dimensions changed or buffer unreadable")]
    InvalidFrame,
    #[error("debug frame export attempted with no buffered frames")]
    NoDebugFrames,
    #[error("send attempted while transport disconnected")]
    TransportUnavailable,
    #[error("action requires a confirmed partner")]
    PartnerMissing,
    #[error("split computation attempted before sync reached isReady")]
    SyncNotReady,
    #[error("finish timestamp did not exceed start timestamp")]
    ImplausibleSplit,
    #[error("session cancelled mid-run")]
    Aborted,
}

pub type TimerResult<T> = Result<T, TimerError>;
