use super::backend::{SensorBackend, SensorKind};
use crate::error::SensorError;
use crate::messages::MotionSample;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Raw distance source, in millimetres. `Ok(None)` means no target in range.
#[async_trait]
pub trait DistanceReader: Send {
    async fn read_mm(&mut self) -> Result<Option<f32>, SensorError>;
}

/// Reads a Linux IIO distance/proximity channel from sysfs
pub struct IioDistanceReader {
    path: PathBuf,
    scale_mm: f32,
}

impl IioDistanceReader {
    pub fn new(path: PathBuf, scale_mm: f32) -> Self {
        Self { path, scale_mm }
    }
}

#[async_trait]
impl DistanceReader for IioDistanceReader {
    async fn read_mm(&mut self) -> Result<Option<f32>, SensorError> {
        let raw = tokio::time::timeout(READ_TIMEOUT, tokio::fs::read_to_string(&self.path))
            .await
            .map_err(|_| SensorError::Timeout)??;

        let value: f32 = raw
            .trim()
            .parse()
            .map_err(|_| SensorError::InvalidReading(raw.trim().to_string()))?;

        // Drivers report 0 (or negative) when nothing is in range
        if value <= 0.0 {
            return Ok(None);
        }
        Ok(Some(value * self.scale_mm))
    }
}

/// Time-of-flight motion detector
///
/// Smooths readings with an EMA and reports motion only when the distance
/// moves at least `hysteresis_mm` away from the last stable value.
pub struct TofBackend {
    id: String,
    interval: Duration,
    reader: Box<dyn DistanceReader>,
    smooth_alpha: f32,
    hysteresis_mm: f32,
    smoothed_mm: Option<f32>,
    stable_mm: Option<f32>,
}

impl TofBackend {
    pub fn new(
        id: &str,
        interval: Duration,
        reader: Box<dyn DistanceReader>,
        smooth_alpha: f32,
        hysteresis_mm: f32,
    ) -> Self {
        Self {
            id: id.to_string(),
            interval,
            reader,
            smooth_alpha,
            hysteresis_mm,
            smoothed_mm: None,
            stable_mm: None,
        }
    }

    fn smooth(&mut self, raw_mm: f32) -> f32 {
        let current = match self.smoothed_mm {
            Some(prev) if self.smooth_alpha > 0.0 => {
                self.smooth_alpha * raw_mm + (1.0 - self.smooth_alpha) * prev
            }
            _ => raw_mm,
        };
        self.smoothed_mm = Some(current);
        current
    }

    /// Feed one distance; true when it counts as movement
    fn observe(&mut self, raw_mm: f32) -> bool {
        let current = self.smooth(raw_mm);

        let Some(stable) = self.stable_mm else {
            tracing::debug!("[{}] baseline distance {:.1}mm", self.id, current);
            self.stable_mm = Some(current);
            return false;
        };

        if (current - stable).abs() >= self.hysteresis_mm {
            tracing::debug!("[{}] motion {:.1}mm -> {:.1}mm", self.id, stable, current);
            self.stable_mm = Some(current);
            return true;
        }
        false
    }
}

#[async_trait]
impl SensorBackend for TofBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SensorKind {
        SensorKind::Distance
    }

    fn poll_interval(&self) -> Duration {
        self.interval
    }

    async fn poll(&mut self) -> Result<Option<MotionSample>, SensorError> {
        let Some(raw_mm) = self.reader.read_mm().await? else {
            return Ok(None);
        };
        let moved = self.observe(raw_mm);
        Ok(Some(MotionSample::now(&self.id, moved)))
    }
}
