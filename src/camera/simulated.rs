use super::{Camera, CameraEvent, OutputTarget};
use crate::error::CameraError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct ControlState {
    unavailable: bool,
    fail_next_stop: bool,
    opens: usize,
    events: Option<mpsc::Sender<CameraEvent>>,
}

#[derive(Debug)]
struct ActiveOutput {
    path: PathBuf,
    started: Instant,
    cap: Duration,
}

/// Knobs for steering a `SimulatedCamera` from the outside
#[cfg(test)]
#[derive(Clone, Debug)]
pub struct SimulatedCameraControl {
    state: Arc<Mutex<ControlState>>,
}

#[cfg(test)]
impl SimulatedCameraControl {
    /// Make `open` and `start_output` fail as if the device vanished
    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.state).unavailable = unavailable;
    }

    pub fn fail_next_stop(&self) {
        lock(&self.state).fail_next_stop = true;
    }

    pub fn opens(&self) -> usize {
        lock(&self.state).opens
    }

    /// Report a broken stream on the event channel
    pub async fn break_stream(&self, reason: &str) {
        let events = lock(&self.state).events.clone();
        if let Some(events) = events {
            let _ = events
                .send(CameraEvent::Failed {
                    reason: reason.to_string(),
                })
                .await;
        }
    }
}

/// Camera stand-in that writes placeholder bytes at a fixed rate
pub struct SimulatedCamera {
    control: Arc<Mutex<ControlState>>,
    bytes_per_second: u64,
    open: bool,
    active: Arc<Mutex<Option<ActiveOutput>>>,
    splitter: Option<JoinHandle<()>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn expand_pattern(pattern: &str, index: u32) -> String {
    pattern.replace("%05d", &format!("{:05}", index))
}

/// Write the bytes a real encoder would have produced for the elapsed time
fn fill(output: &ActiveOutput, bytes_per_second: u64) -> std::io::Result<()> {
    let elapsed = output.started.elapsed().min(output.cap);
    let len = (elapsed.as_secs_f64() * bytes_per_second as f64) as usize;
    std::fs::write(&output.path, vec![0u8; len])
}

fn begin(path: &Path, cap: Duration) -> Result<ActiveOutput, CameraError> {
    std::fs::File::create(path).map_err(|e| CameraError::Write(e.to_string()))?;
    Ok(ActiveOutput {
        path: path.to_path_buf(),
        started: Instant::now(),
        cap,
    })
}

impl SimulatedCamera {
    pub fn new(bytes_per_second: u64) -> Self {
        Self {
            control: Arc::new(Mutex::new(ControlState::default())),
            bytes_per_second,
            open: false,
            active: Arc::new(Mutex::new(None)),
            splitter: None,
        }
    }

    /// A camera plus the knobs that make it misbehave
    #[cfg(test)]
    pub fn with_control(bytes_per_second: u64) -> (Self, SimulatedCameraControl) {
        let camera = Self::new(bytes_per_second);
        let control = SimulatedCameraControl {
            state: camera.control.clone(),
        };
        (camera, control)
    }

    fn check_available(&self) -> Result<(), CameraError> {
        if lock(&self.control).unavailable {
            return Err(CameraError::Unavailable("simulated device missing".to_string()));
        }
        Ok(())
    }

    fn spawn_splitter(&mut self, dir: PathBuf, pattern: String, segment_len: Duration, first_index: u32) {
        let active = self.active.clone();
        let events = lock(&self.control).events.clone();
        let bytes_per_second = self.bytes_per_second;

        self.splitter = Some(tokio::spawn(async move {
            let mut index = first_index;
            loop {
                tokio::time::sleep(segment_len).await;
                index += 1;
                let next = dir.join(expand_pattern(&pattern, index));

                let closed = {
                    let mut slot = lock(&active);
                    let Some(current) = slot.as_ref() else {
                        break;
                    };
                    if let Err(e) = fill(current, bytes_per_second) {
                        tracing::warn!("Simulated camera failed to write {:?}: {}", current.path, e);
                    }
                    let closed = current.path.clone();
                    match begin(&next, segment_len) {
                        Ok(output) => *slot = Some(output),
                        Err(e) => {
                            tracing::warn!("Simulated camera failed to open {:?}: {}", next, e);
                            *slot = None;
                        }
                    }
                    closed
                };

                if let Some(events) = &events {
                    if events.send(CameraEvent::SegmentClosed { path: closed }).await.is_err() {
                        break;
                    }
                }
            }
        }));
    }
}

#[async_trait]
impl Camera for SimulatedCamera {
    fn is_open(&self) -> bool {
        self.open
    }

    async fn open(&mut self, events: mpsc::Sender<CameraEvent>) -> Result<(), CameraError> {
        self.check_available()?;
        let mut control = lock(&self.control);
        control.opens += 1;
        control.events = Some(events);
        tracing::debug!("Simulated camera opened ({} opens)", control.opens);
        self.open = true;
        Ok(())
    }

    async fn start_output(&mut self, target: OutputTarget) -> Result<(), CameraError> {
        self.check_available()?;
        if !self.open {
            return Err(CameraError::Unavailable("camera is not open".to_string()));
        }

        match target {
            OutputTarget::File { path, max_duration } => {
                *lock(&self.active) = Some(begin(&path, max_duration)?);
            }
            OutputTarget::Segments {
                dir,
                pattern,
                segment_len,
                first_index,
            } => {
                let first = dir.join(expand_pattern(&pattern, first_index));
                *lock(&self.active) = Some(begin(&first, segment_len)?);
                self.spawn_splitter(dir, pattern, segment_len, first_index);
            }
        }
        Ok(())
    }

    async fn stop_output(&mut self) -> Result<(), CameraError> {
        if let Some(splitter) = self.splitter.take() {
            splitter.abort();
        }
        let Some(output) = lock(&self.active).take() else {
            return Ok(());
        };

        let written = fill(&output, self.bytes_per_second);
        if std::mem::take(&mut lock(&self.control).fail_next_stop) {
            return Err(CameraError::Write("simulated encoder error".to_string()));
        }
        written.map_err(|e| CameraError::Write(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), CameraError> {
        self.stop_output().await?;
        self.open = false;
        Ok(())
    }
}
