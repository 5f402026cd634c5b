use thiserror::Error;

/// A single failed sensor read. Counted by the aggregator, never treated as "no motion".
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SensorError {
    #[error("sensor read timed out")]
    Timeout,

    #[error("sensor I/O error: {0}")]
    Io(String),

    #[error("invalid sensor reading: {0}")]
    InvalidReading(String),
}

impl From<std::io::Error> for SensorError {
    fn from(e: std::io::Error) -> Self {
        SensorError::Io(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CameraError {
    #[error("camera unavailable: {0}")]
    Unavailable(String),

    #[error("camera write failed: {0}")]
    Write(String),
}

/// Errors surfaced by the segment recorder
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    #[error("recording hardware unavailable: {0}")]
    HardwareUnavailable(String),

    #[error("segment write failed: {0}")]
    SegmentWrite(String),

    #[error("recorder task is not running")]
    RecorderGone,
}

impl From<CameraError> for RecordError {
    fn from(e: CameraError) -> Self {
        match e {
            CameraError::Unavailable(msg) => RecordError::HardwareUnavailable(msg),
            CameraError::Write(msg) => RecordError::SegmentWrite(msg),
        }
    }
}
