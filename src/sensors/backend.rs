use crate::error::SensorError;
use crate::messages::MotionSample;
use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    /// Polled distance sensor (ToF)
    Distance,
    /// Radar or lidar presence output
    Presence,
    /// Frame differencing on camera preview
    Vision,
}

impl SensorKind {
    /// Radar/lidar-class sensors that make vision optional
    pub fn is_ranging(self) -> bool {
        matches!(self, SensorKind::Distance | SensorKind::Presence)
    }
}

/// Source of motion/presence samples
///
/// Each backend is polled from its own task at `poll_interval()`. A poll
/// blocks at most for one bounded hardware read.
#[async_trait]
pub trait SensorBackend: Send {
    fn id(&self) -> &str;

    fn kind(&self) -> SensorKind;

    fn poll_interval(&self) -> Duration;

    /// `Ok(None)`: nothing to report this tick (no target, no new frame).
    /// `Err(_)`: the read itself failed.
    async fn poll(&mut self) -> Result<Option<MotionSample>, SensorError>;
}

pub fn interval_for_hz(hz: u32) -> Duration {
    Duration::from_secs_f64(1.0 / hz.max(1) as f64)
}
