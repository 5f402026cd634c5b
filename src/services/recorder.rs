use crate::camera::{Camera, CameraEvent, OutputTarget};
use crate::config::RotationMode;
use crate::error::RecordError;
use crate::messages::{ControllerEvent, CoreEvent, EventSink, RecorderCommand, emit};
use crate::services::PruneHandle;
use crate::storage::{
    SegmentFile, StorageIndex, segment_file_name, segment_pattern, session_stamp,
};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// A session gives up after this many segments in a row end in a write failure
const MAX_CONSECUTIVE_WRITE_FAILURES: u32 = 3;

/// How long a new session waits for the pruner to make room
const PRUNE_BEFORE_START_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct RecorderSettings {
    pub output_dir: PathBuf,
    pub segment_len: Duration,
    pub rotation_mode: RotationMode,
    pub extension: String,
}

#[derive(Debug)]
struct OpenSegment {
    sequence: u32,
    path: PathBuf,
    started: Instant,
    start_time: DateTime<Utc>,
}

#[derive(Debug)]
struct RecordingSession {
    stamp: String,
    current: OpenSegment,
    finalized: u32,
    consecutive_failures: u32,
}

/// Owns the camera while a recording session is open and cuts the stream
/// into fixed-length segment files
///
/// This service:
/// - Opens the camera on Start, closes it on Stop
/// - Rotates segments at the configured length, either itself (stop and
///   restart the output) or by following the muxer's segment list
/// - Registers every closed segment with the storage index
/// - Runs a prune pass before each session and wakes the pruner after
///   each finalized segment
pub struct SegmentRecorder {
    settings: RecorderSettings,
    cmd_rx: mpsc::Receiver<RecorderCommand>,
    camera: Box<dyn Camera>,
    camera_tx: mpsc::Sender<CameraEvent>,
    camera_rx: mpsc::Receiver<CameraEvent>,
    index: StorageIndex,
    prune: PruneHandle,
    controller: mpsc::UnboundedSender<ControllerEvent>,
    events: EventSink,
    session: Option<RecordingSession>,
}

impl SegmentRecorder {
    pub fn new(
        settings: RecorderSettings,
        cmd_rx: mpsc::Receiver<RecorderCommand>,
        camera: Box<dyn Camera>,
        index: StorageIndex,
        prune: PruneHandle,
        controller: mpsc::UnboundedSender<ControllerEvent>,
        events: EventSink,
    ) -> Self {
        let (camera_tx, camera_rx) = mpsc::channel(64);
        Self {
            settings,
            cmd_rx,
            camera,
            camera_tx,
            camera_rx,
            index,
            prune,
            controller,
            events,
            session: None,
        }
    }

    pub async fn run(mut self) {
        loop {
            let rotate_at = self.rotation_deadline();

            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        // Every handle is gone; close out whatever is open
                        if let Err(e) = self.stop().await {
                            tracing::warn!("Failed to stop recording on exit: {}", e);
                        }
                        break;
                    }
                },

                Some(event) = self.camera_rx.recv() => {
                    self.handle_camera_event(event).await;
                }

                _ = tokio::time::sleep_until(rotate_at.unwrap_or_else(Instant::now)), if rotate_at.is_some() => {
                    self.advance_segment(None).await;
                }
            }
        }
    }

    /// Only self-rotating sessions have a deadline; the muxer cuts segmented output
    fn rotation_deadline(&self) -> Option<Instant> {
        if self.settings.rotation_mode != RotationMode::Rotate {
            return None;
        }
        self.session
            .as_ref()
            .map(|s| s.current.started + self.settings.segment_len)
    }

    async fn handle_command(&mut self, cmd: RecorderCommand) {
        match cmd {
            RecorderCommand::Start(reply) => {
                let result = self.start().await;
                let _ = reply.send(result);
            }
            RecorderCommand::Stop(reply) => {
                let result = self.stop().await;
                let _ = reply.send(result);
            }
        }
    }

    fn open_segment(&self, stamp: &str, sequence: u32) -> OpenSegment {
        let name = segment_file_name(stamp, sequence, &self.settings.extension);
        OpenSegment {
            sequence,
            path: self.settings.output_dir.join(name),
            started: Instant::now(),
            start_time: Utc::now(),
        }
    }

    fn target_for(&self, stamp: &str, sequence: u32) -> OutputTarget {
        match self.settings.rotation_mode {
            RotationMode::Rotate => OutputTarget::File {
                path: self
                    .settings
                    .output_dir
                    .join(segment_file_name(stamp, sequence, &self.settings.extension)),
                max_duration: self.settings.segment_len,
            },
            RotationMode::FfmpegSegment => OutputTarget::Segments {
                dir: self.settings.output_dir.clone(),
                pattern: segment_pattern(stamp, &self.settings.extension),
                segment_len: self.settings.segment_len,
                first_index: sequence,
            },
        }
    }

    async fn start(&mut self) -> Result<PathBuf, RecordError> {
        if let Some(session) = &self.session {
            tracing::debug!("Already recording to {:?}", session.current.path);
            return Ok(session.current.path.clone());
        }

        // Make room before anything is written
        match tokio::time::timeout(PRUNE_BEFORE_START_TIMEOUT, self.prune.prune_now()).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!("Pruner is not running; starting without a pass"),
            Err(_) => tracing::warn!("Prune pass before recording timed out"),
        }

        if !self.camera.is_open() {
            self.camera.open(self.camera_tx.clone()).await?;
        }
        // Leftovers from a previous session refer to files already handled
        while self.camera_rx.try_recv().is_ok() {}

        let stamp = session_stamp(Utc::now());
        if let Err(e) = self.camera.start_output(self.target_for(&stamp, 0)).await {
            if let Err(close_err) = self.camera.close().await {
                tracing::debug!("Failed to close camera after start error: {}", close_err);
            }
            return Err(e.into());
        }

        let current = self.open_segment(&stamp, 0);
        let first_segment = current.path.clone();
        self.session = Some(RecordingSession {
            stamp,
            current,
            finalized: 0,
            consecutive_failures: 0,
        });

        tracing::info!("Recording started: {:?}", first_segment);
        emit(
            &self.events,
            CoreEvent::RecordingStarted {
                first_segment: first_segment.clone(),
            },
        );
        Ok(first_segment)
    }

    async fn stop(&mut self) -> Result<Option<SegmentFile>, RecordError> {
        // Boundaries that were already reported count before the final one
        while let Ok(event) = self.camera_rx.try_recv() {
            self.handle_camera_event(event).await;
        }

        let Some(mut session) = self.session.take() else {
            return Ok(None);
        };

        let stopped = self.camera.stop_output().await;

        // The muxer may report segments closed during its flush
        while let Ok(event) = self.camera_rx.try_recv() {
            if let CameraEvent::SegmentClosed { path } = event {
                if path == session.current.path {
                    self.roll(&mut session);
                }
            }
        }

        if let Err(e) = &stopped {
            self.report_write_failure(&session.current.path, &e.to_string());
        }
        let last = self.finalize(session.current);
        if last.is_some() {
            session.finalized += 1;
        }

        if let Err(e) = self.camera.close().await {
            tracing::warn!("Failed to close camera: {}", e);
        }

        tracing::info!("Recording stopped after {} segments", session.finalized);
        emit(
            &self.events,
            CoreEvent::RecordingStopped {
                segments: session.finalized,
            },
        );
        self.prune.wake();
        Ok(last)
    }

    async fn handle_camera_event(&mut self, event: CameraEvent) {
        match event {
            CameraEvent::SegmentClosed { path } => {
                let Some(mut session) = self.session.take() else {
                    tracing::debug!("Segment {:?} closed outside a session", path);
                    return;
                };
                if path == session.current.path {
                    session.consecutive_failures = 0;
                    self.roll(&mut session);
                } else {
                    tracing::debug!(
                        "Ignoring close of {:?}; current segment is {:?}",
                        path,
                        session.current.path
                    );
                }
                self.session = Some(session);
            }
            CameraEvent::Failed { reason } => {
                if self.session.is_none() {
                    tracing::debug!("Camera failure outside a session: {}", reason);
                    return;
                }
                tracing::warn!("Capture stream failed: {}", reason);
                self.advance_segment(Some(reason)).await;
            }
        }
    }

    /// Close the current segment and move on to the next one.
    ///
    /// Used at every self-timed boundary and whenever the stream breaks
    /// early. If the output cannot be restarted the session ends.
    async fn advance_segment(&mut self, failure: Option<String>) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        let mut error = failure;
        if let Err(e) = self.camera.stop_output().await {
            error.get_or_insert(e.to_string());
        }
        match &error {
            Some(error) => {
                self.report_write_failure(&session.current.path, error);
                session.consecutive_failures += 1;
            }
            None => session.consecutive_failures = 0,
        }

        self.roll(&mut session);

        if session.consecutive_failures >= MAX_CONSECUTIVE_WRITE_FAILURES {
            let reason = error.unwrap_or_default();
            self.abort_session(session, RecordError::SegmentWrite(reason))
                .await;
            return;
        }

        let target = self.target_for(&session.stamp, session.current.sequence);
        match self.camera.start_output(target).await {
            Ok(()) => {
                session.current.started = Instant::now();
                session.current.start_time = Utc::now();
                tracing::debug!("Writing segment {:?}", session.current.path);
                self.session = Some(session);
            }
            Err(e) => self.abort_session(session, e.into()).await,
        }
    }

    /// Swap in the next segment and finalize the one that just closed
    fn roll(&self, session: &mut RecordingSession) -> Option<SegmentFile> {
        let next = self.open_segment(&session.stamp, session.current.sequence + 1);
        let closed = std::mem::replace(&mut session.current, next);
        let file = self.finalize(closed);
        if file.is_some() {
            session.finalized += 1;
        }
        file
    }

    fn finalize(&self, segment: OpenSegment) -> Option<SegmentFile> {
        // The writer caps every output at the segment length
        let duration = segment.started.elapsed().min(self.settings.segment_len);

        let meta = match std::fs::metadata(&segment.path) {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return None,
            Err(e) => {
                tracing::debug!("Nothing written to {:?}: {}", segment.path, e);
                return None;
            }
        };

        let end_time = segment.start_time
            + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        let file = SegmentFile {
            path: segment.path,
            sequence: segment.sequence,
            start_time: segment.start_time,
            end_time,
            duration,
            size_bytes: meta.len(),
        };

        if !self.index.register(file.clone()) {
            return None;
        }

        tracing::info!(
            "Segment {:?} finalized ({:.1}s, {} bytes, ended {})",
            file.path,
            file.duration.as_secs_f64(),
            file.size_bytes,
            file.end_time.format("%H:%M:%S%.3f")
        );
        emit(
            &self.events,
            CoreEvent::SegmentFinalized {
                path: file.path.clone(),
                sequence: file.sequence,
                duration: file.duration,
                size_bytes: file.size_bytes,
            },
        );
        self.prune.wake();
        Some(file)
    }

    fn report_write_failure(&self, path: &Path, error: &str) {
        tracing::error!("Segment {:?} failed to write: {}", path, error);
        emit(
            &self.events,
            CoreEvent::SegmentWriteFailed {
                path: path.to_path_buf(),
                error: error.to_string(),
            },
        );
    }

    async fn abort_session(&mut self, session: RecordingSession, error: RecordError) {
        tracing::error!(
            "Recording aborted after {} segments: {}",
            session.finalized,
            error
        );

        if let Err(e) = self.camera.stop_output().await {
            tracing::debug!("Failed to stop output while aborting: {}", e);
        }
        self.finalize(session.current);
        if let Err(e) = self.camera.close().await {
            tracing::debug!("Failed to close camera while aborting: {}", e);
        }

        emit(&self.events, CoreEvent::RecordingFailed(error.clone()));
        let _ = self.controller.send(ControllerEvent::RecordingFailed(error));
    }
}

/// Handle for communicating with the SegmentRecorder
#[derive(Clone)]
pub struct RecorderHandle {
    tx: mpsc::Sender<RecorderCommand>,
}

impl RecorderHandle {
    pub fn new(tx: mpsc::Sender<RecorderCommand>) -> Self {
        Self { tx }
    }

    /// Open a session; returns the path of the first segment
    pub async fn start(&self) -> Result<PathBuf, RecordError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RecorderCommand::Start(reply))
            .await
            .map_err(|_| RecordError::RecorderGone)?;
        rx.await.map_err(|_| RecordError::RecorderGone)?
    }

    /// Close the session; returns the last finalized segment, if any
    pub async fn stop(&self) -> Result<Option<SegmentFile>, RecordError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RecorderCommand::Stop(reply))
            .await
            .map_err(|_| RecordError::RecorderGone)?;
        rx.await.map_err(|_| RecordError::RecorderGone)?
    }
}
