pub mod ffmpeg;
pub mod frame;
pub mod simulated;

pub use ffmpeg::FfmpegCamera;
pub use frame::PreviewFrame;
pub use simulated::SimulatedCamera;
#[cfg(test)]
pub use simulated::SimulatedCameraControl;

use crate::config::{CameraBackend, CameraConfig};
use crate::error::CameraError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Where the capture stream should be written
#[derive(Debug, Clone, PartialEq)]
pub enum OutputTarget {
    /// One file, hard-capped at `max_duration`
    File { path: PathBuf, max_duration: Duration },
    /// Let the muxer cut `<dir>/<pattern>` every `segment_len`, numbering from `first_index`
    Segments {
        dir: PathBuf,
        pattern: String,
        segment_len: Duration,
        first_index: u32,
    },
}

/// Asynchronous notifications from the capture pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum CameraEvent {
    /// The muxer closed a segment file (segmented output only)
    SegmentClosed { path: PathBuf },
    /// The capture stream died; the current output is unusable
    Failed { reason: String },
}

/// Camera capability: open the device, route its encoded stream to an
/// output, close it again
#[async_trait]
pub trait Camera: Send {
    fn is_open(&self) -> bool;

    async fn open(&mut self, events: mpsc::Sender<CameraEvent>) -> Result<(), CameraError>;

    async fn start_output(&mut self, target: OutputTarget) -> Result<(), CameraError>;

    /// Stop writing and flush the current output. Safe to call with no output.
    async fn stop_output(&mut self) -> Result<(), CameraError>;

    async fn close(&mut self) -> Result<(), CameraError>;
}

pub fn build_camera(
    config: &CameraConfig,
    preview: watch::Sender<Option<PreviewFrame>>,
    preview_fps: Option<u32>,
) -> Box<dyn Camera> {
    match config.backend {
        CameraBackend::Ffmpeg => Box::new(FfmpegCamera::new(config.clone(), preview, preview_fps)),
        CameraBackend::Simulated => {
            tracing::warn!("Camera simulation active; segments contain placeholder bytes");
            Box::new(SimulatedCamera::new(64 * 1024))
        }
    }
}
