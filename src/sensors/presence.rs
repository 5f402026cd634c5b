use super::backend::{SensorBackend, SensorKind};
use crate::error::SensorError;
use crate::messages::MotionSample;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Radar or lidar module exposing a digital presence output (e.g. a GPIO
/// `value` file under sysfs)
pub struct PresenceBackend {
    id: String,
    interval: Duration,
    path: PathBuf,
    active_low: bool,
}

impl PresenceBackend {
    pub fn new(id: &str, interval: Duration, path: PathBuf, active_low: bool) -> Self {
        Self {
            id: id.to_string(),
            interval,
            path,
            active_low,
        }
    }

    fn decode(&self, raw: &str) -> Result<bool, SensorError> {
        let level = match raw.trim() {
            "1" => true,
            "0" => false,
            other => return Err(SensorError::InvalidReading(other.to_string())),
        };
        Ok(level != self.active_low)
    }
}

#[async_trait]
impl SensorBackend for PresenceBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SensorKind {
        SensorKind::Presence
    }

    fn poll_interval(&self) -> Duration {
        self.interval
    }

    async fn poll(&mut self) -> Result<Option<MotionSample>, SensorError> {
        let raw = tokio::time::timeout(READ_TIMEOUT, tokio::fs::read_to_string(&self.path))
            .await
            .map_err(|_| SensorError::Timeout)??;

        let present = self.decode(&raw)?;
        Ok(Some(MotionSample::now(&self.id, present)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_gpio_level() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("value");
        let mut radar = PresenceBackend::new("radar", Duration::from_millis(125), path.clone(), false);

        std::fs::write(&path, "1\n").unwrap();
        assert!(radar.poll().await.unwrap().unwrap().present);

        std::fs::write(&path, "0\n").unwrap();
        assert!(!radar.poll().await.unwrap().unwrap().present);

        std::fs::write(&path, "high").unwrap();
        assert!(matches!(radar.poll().await, Err(SensorError::InvalidReading(_))));
    }

    #[test]
    fn test_active_low_inverts() {
        let radar = PresenceBackend::new("radar", Duration::from_millis(125), PathBuf::new(), true);
        assert_eq!(radar.decode("0"), Ok(true));
        assert_eq!(radar.decode("1"), Ok(false));
    }
}
