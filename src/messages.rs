use crate::error::{RecordError, SensorError};
use crate::storage::SegmentFile;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Commands for the SegmentRecorder service
pub enum RecorderCommand {
    Start(oneshot::Sender<Result<PathBuf, RecordError>>),
    Stop(oneshot::Sender<Result<Option<SegmentFile>, RecordError>>),
}

/// Commands for the PruneService
pub enum PruneCommand {
    /// Run a pass now and reply once it has finished
    RunNow(oneshot::Sender<()>),
}

/// Trigger state (observable via watch channel)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerState {
    Idle,
    Recording,
}

/// One reading from a sensor backend. Ephemeral, never persisted.
#[derive(Clone, Debug, PartialEq)]
pub struct MotionSample {
    pub at: Instant,
    pub present: bool,
    pub source: String,
}

impl MotionSample {
    pub fn now(source: &str, present: bool) -> Self {
        Self {
            at: Instant::now(),
            present,
            source: source.to_string(),
        }
    }
}

/// What a poller hands to the aggregator after each poll.
/// `Ok(None)` means the backend had nothing to report this tick.
#[derive(Debug)]
pub struct SensorReport {
    pub source: String,
    pub result: Result<Option<MotionSample>, SensorError>,
}

/// Aggregated "motion present right now" signal
#[derive(Clone, Debug, PartialEq)]
pub struct MotionSignal {
    pub present: bool,
    /// Time of the freshest positive sample when present, emission time otherwise.
    pub at: Instant,
    pub source: Option<String>,
}

/// Input queue of the trigger controller
#[derive(Debug)]
pub enum ControllerEvent {
    Motion(MotionSignal),
    /// Raised by the recorder when a session died underneath the controller
    RecordingFailed(RecordError),
    Shutdown(oneshot::Sender<()>),
}

/// Typed events for the observability surface. The service loop formats them.
#[derive(Clone, Debug, PartialEq)]
pub enum CoreEvent {
    StateChanged(TriggerState),
    RecordingStarted {
        first_segment: PathBuf,
    },
    RecordingStopped {
        segments: u32,
    },
    RecordingFailed(RecordError),
    SegmentFinalized {
        path: PathBuf,
        sequence: u32,
        duration: Duration,
        size_bytes: u64,
    },
    SegmentWriteFailed {
        path: PathBuf,
        error: String,
    },
    SensorDegraded {
        source: String,
        consecutive_failures: u32,
    },
    SensorRecovered {
        source: String,
    },
    AllSensorsDown,
    AggregatorStalled {
        silent_for: Duration,
    },
    SegmentsPruned {
        deleted: usize,
        free_bytes: u64,
    },
    StorageExhausted {
        free_bytes: u64,
        min_free_bytes: u64,
    },
    StorageRecovered {
        free_bytes: u64,
    },
    StorageUnavailable {
        error: String,
    },
    /// Result of the one-off distance sensor read at startup
    StartupCheck {
        source: String,
        healthy: bool,
        detail: String,
    },
}

pub type EventSink = mpsc::UnboundedSender<CoreEvent>;

/// Send an event, ignoring a closed receiver (service is shutting down).
pub fn emit(events: &EventSink, event: CoreEvent) {
    let _ = events.send(event);
}
