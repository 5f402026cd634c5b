use crate::config::Config;
use crate::messages::CoreEvent;
use crate::sensors::tof::DistanceReader;
use crate::sensors::{IioDistanceReader, SensorBackend, SensorKind, build_backends, interval_for_hz};
use anyhow::Result;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Distance readings kept for the closest/median/farthest summary
const WINDOW: usize = 16;

/// Read the distance sensor once and report whether it answered.
///
/// "No target in range" is a healthy answer; only a failed read is not.
pub async fn startup_check(source: &str, reader: &mut dyn DistanceReader) -> CoreEvent {
    let (healthy, detail) = match reader.read_mm().await {
        Ok(Some(mm)) => (true, format!("{:.0}mm", mm)),
        Ok(None) => (true, "no target in range".to_string()),
        Err(e) => (false, e.to_string()),
    };

    if healthy {
        tracing::info!("Distance sensor {} OK: {}", source, detail);
    } else {
        tracing::error!("Distance sensor {} failed its startup read: {}", source, detail);
    }
    CoreEvent::StartupCheck {
        source: source.to_string(),
        healthy,
        detail,
    }
}

#[derive(Debug, Default)]
struct DistanceWindow {
    readings: VecDeque<f32>,
}

impl DistanceWindow {
    fn push(&mut self, mm: f32) {
        if self.readings.len() == WINDOW {
            self.readings.pop_front();
        }
        self.readings.push_back(mm);
    }

    /// (closest, median, farthest)
    fn summary(&self) -> Option<(f32, f32, f32)> {
        let mut sorted: Vec<f32> = self.readings.iter().copied().collect();
        sorted.sort_by(f32::total_cmp);

        let (&closest, &farthest) = (sorted.first()?, sorted.last()?);
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 1 {
            sorted[mid]
        } else {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        };
        Some((closest, median, farthest))
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct SensorTestReport {
    pub polls: u64,
    pub readings: u64,
    pub errors: u64,
}

/// Poll the non-vision sensors with the camera off and log every reading.
///
/// Runs until `samples` polls have been made, or until Ctrl+C.
pub async fn run_sensor_test(config: &Config, samples: Option<u64>) -> Result<()> {
    let sensor = &config.sensor;
    let interval = interval_for_hz(sensor.poll_hz);

    // Nothing feeds the preview here, so vision is left out
    let (_preview_tx, preview_rx) = watch::channel(None);
    let backends: Vec<_> = build_backends(config, preview_rx)
        .into_iter()
        .filter(|b| b.kind() != SensorKind::Vision)
        .collect();

    let raw: Option<Box<dyn DistanceReader>> = if sensor.simulate {
        None
    } else {
        tracing::info!(
            "Sensor test: reading {:?} at {} Hz",
            sensor.distance_path,
            sensor.poll_hz
        );
        Some(Box::new(IioDistanceReader::new(
            sensor.distance_path.clone(),
            sensor.distance_scale_mm,
        )))
    };
    for backend in &backends {
        tracing::info!("Sensor test: polling {} ({:?})", backend.id(), backend.kind());
    }

    tokio::select! {
        report = sensor_test(raw, backends, interval, samples) => {
            tracing::info!(
                "Sensor test finished: {} polls, {} readings, {} errors",
                report.polls,
                report.readings,
                report.errors
            );
        }
        _ = tokio::signal::ctrl_c() => tracing::info!("Sensor test interrupted"),
    }
    Ok(())
}

async fn sensor_test(
    mut raw: Option<Box<dyn DistanceReader>>,
    mut backends: Vec<Box<dyn SensorBackend>>,
    interval: Duration,
    samples: Option<u64>,
) -> SensorTestReport {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut window = DistanceWindow::default();
    let mut report = SensorTestReport::default();

    while samples.is_none_or(|limit| report.polls < limit) {
        ticker.tick().await;
        report.polls += 1;
        let n = report.polls;

        if let Some(reader) = raw.as_mut() {
            match reader.read_mm().await {
                Ok(Some(mm)) => {
                    report.readings += 1;
                    window.push(mm);
                    tracing::info!("#{} raw distance {:.1}mm", n, mm);
                    if let Some((closest, median, farthest)) = window.summary() {
                        tracing::info!(
                            "#{} closest={:.1}mm median={:.1}mm farthest={:.1}mm (last {})",
                            n,
                            closest,
                            median,
                            farthest,
                            window.readings.len()
                        );
                    }
                }
                Ok(None) => {
                    report.readings += 1;
                    tracing::info!("#{} no target in range", n);
                }
                Err(e) => {
                    report.errors += 1;
                    tracing::error!("#{} distance read failed: {}", n, e);
                }
            }
        }

        for backend in backends.iter_mut() {
            match backend.poll().await {
                Ok(Some(sample)) => {
                    report.readings += 1;
                    tracing::info!("#{} [{}] present={}", n, backend.id(), sample.present);
                }
                Ok(None) => {
                    report.readings += 1;
                    tracing::info!("#{} [{}] nothing to report", n, backend.id());
                }
                Err(e) => {
                    report.errors += 1;
                    tracing::error!("#{} [{}] read failed: {}", n, backend.id(), e);
                }
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SensorError;
    use crate::sensors::SimulatedBackend;
    use async_trait::async_trait;

    struct ScriptedReader(VecDeque<Result<Option<f32>, SensorError>>);

    #[async_trait]
    impl DistanceReader for ScriptedReader {
        async fn read_mm(&mut self) -> Result<Option<f32>, SensorError> {
            self.0.pop_front().unwrap_or(Ok(None))
        }
    }

    fn reader(readings: Vec<Result<Option<f32>, SensorError>>) -> Box<dyn DistanceReader> {
        Box::new(ScriptedReader(readings.into()))
    }

    #[test]
    fn test_window_summary_matches_sorted_readings() {
        let mut window = DistanceWindow::default();
        assert_eq!(window.summary(), None);

        for mm in [500.0, 300.0, 900.0] {
            window.push(mm);
        }
        assert_eq!(window.summary(), Some((300.0, 500.0, 900.0)));

        window.push(700.0);
        assert_eq!(window.summary(), Some((300.0, 600.0, 900.0)));
    }

    #[test]
    fn test_window_forgets_oldest_reading() {
        let mut window = DistanceWindow::default();
        window.push(10.0);
        for _ in 0..WINDOW {
            window.push(800.0);
        }
        assert_eq!(window.summary(), Some((800.0, 800.0, 800.0)));
    }

    #[tokio::test]
    async fn test_startup_check_reports_failed_read() {
        let mut failing = reader(vec![Err(SensorError::Timeout)]);
        let event = startup_check("tof", &mut *failing).await;
        assert_eq!(
            event,
            CoreEvent::StartupCheck {
                source: "tof".to_string(),
                healthy: false,
                detail: "sensor read timed out".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_startup_check_accepts_empty_range() {
        let mut empty = reader(vec![Ok(None)]);
        let event = startup_check("tof", &mut *empty).await;
        assert!(matches!(event, CoreEvent::StartupCheck { healthy: true, .. }));

        let mut ranged = reader(vec![Ok(Some(612.4))]);
        let event = startup_check("tof", &mut *ranged).await;
        assert!(matches!(
            event,
            CoreEvent::StartupCheck { healthy: true, ref detail, .. } if detail == "612mm"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sensor_test_logs_readings_and_errors() {
        let raw = reader(vec![
            Ok(Some(600.0)),
            Err(SensorError::Timeout),
            Ok(None),
            Ok(Some(420.0)),
        ]);
        let presence = SimulatedBackend::from_pattern(
            "radar",
            SensorKind::Presence,
            Duration::from_millis(125),
            "1x01",
        );

        let started = tokio::time::Instant::now();
        let report = sensor_test(
            Some(raw),
            vec![Box::new(presence)],
            Duration::from_millis(125),
            Some(4),
        )
        .await;

        assert_eq!(
            report,
            SensorTestReport {
                polls: 4,
                readings: 6,
                errors: 2,
            }
        );
        // First tick is immediate, then one per interval
        assert_eq!(started.elapsed(), Duration::from_millis(375));
    }
}
