use crate::aggregator::{MotionAggregator, select_backends, spawn_pollers};
use crate::camera::build_camera;
use crate::config::{Config, HooksConfig};
use crate::diagnostics;
use crate::hooks;
use crate::messages::{ControllerEvent, CoreEvent, TriggerState};
use crate::sensors::{IioDistanceReader, build_backends};
use crate::services::{
    PruneHandle, PruneService, RecorderHandle, RecorderSettings, SegmentRecorder,
    StoragePruner, TriggerController,
};
use crate::storage::{FsSpaceGauge, StorageIndex};

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Upper bound for finalizing the open segment on shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

pub struct App {
    config: Config,
    events_rx: mpsc::UnboundedReceiver<CoreEvent>,
    controller: mpsc::UnboundedSender<ControllerEvent>,
    state_rx: watch::Receiver<TriggerState>,
    tasks: Vec<JoinHandle<()>>,
}

/// The configured hook for an event, with its label and environment
fn hook_for<'a>(
    hooks: &'a HooksConfig,
    event: &CoreEvent,
) -> Option<(&'static str, &'a str, Vec<(&'static str, String)>)> {
    let (label, command, mut env) = match event {
        CoreEvent::RecordingStarted { first_segment } => (
            "recording_start",
            hooks.on_recording_start.as_deref()?,
            vec![("MOTIONCAM_SEGMENT", first_segment.display().to_string())],
        ),
        CoreEvent::RecordingStopped { segments } => (
            "recording_stop",
            hooks.on_recording_stop.as_deref()?,
            vec![("MOTIONCAM_SEGMENTS", segments.to_string())],
        ),
        CoreEvent::RecordingFailed(error) => (
            "recording_stop",
            hooks.on_recording_stop.as_deref()?,
            vec![("MOTIONCAM_ERROR", error.to_string())],
        ),
        CoreEvent::StorageExhausted { free_bytes, .. } => (
            "storage_low",
            hooks.on_storage_low.as_deref()?,
            vec![("MOTIONCAM_FREE_BYTES", free_bytes.to_string())],
        ),
        CoreEvent::StorageUnavailable { error } => (
            "storage_low",
            hooks.on_storage_low.as_deref()?,
            vec![("MOTIONCAM_ERROR", error.clone())],
        ),
        CoreEvent::StartupCheck {
            source,
            healthy,
            detail,
        } => (
            "startup",
            hooks.on_startup.as_deref()?,
            vec![
                ("MOTIONCAM_SENSOR", source.clone()),
                ("MOTIONCAM_SENSOR_OK", if *healthy { "1" } else { "0" }.to_string()),
                ("MOTIONCAM_SENSOR_DETAIL", detail.clone()),
            ],
        ),
        _ => return None,
    };
    env.push(("MOTIONCAM_EVENT", label.to_string()));
    Some((label, command, env))
}

impl App {
    pub async fn new(config: Config) -> Result<Self> {
        let service = &config.service;
        std::fs::create_dir_all(&service.output_dir).with_context(|| {
            format!("Failed to create output directory: {:?}", service.output_dir)
        })?;
        let index = StorageIndex::rebuild(
            &service.output_dir,
            &config.camera.container,
            service.segment_len(),
        )?;
        tracing::info!(
            "Found {} existing segments in {:?}",
            index.len(),
            service.output_dir
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (controller_tx, controller_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(TriggerState::Idle);
        let (preview_tx, preview_rx) = watch::channel(None);
        let (prune_tx, prune_rx) = mpsc::channel(4);
        let prune_wake = Arc::new(Notify::new());
        let mut tasks = Vec::new();

        // The distance sensor answers before anything depends on it
        let startup = if config.sensor.simulate {
            CoreEvent::StartupCheck {
                source: "sim".to_string(),
                healthy: true,
                detail: "simulated".to_string(),
            }
        } else {
            let mut reader = IioDistanceReader::new(
                config.sensor.distance_path.clone(),
                config.sensor.distance_scale_mm,
            );
            diagnostics::startup_check("tof", &mut reader).await
        };
        let _ = events_tx.send(startup);

        // Camera and recorder
        let preview_fps = config
            .motion
            .vision_active()
            .then_some(config.motion.vision_motion_fps);
        let camera = build_camera(&config.camera, preview_tx, preview_fps);
        let (recorder_tx, recorder_rx) = mpsc::channel(10);
        let settings = RecorderSettings {
            output_dir: service.output_dir.clone(),
            segment_len: service.segment_len(),
            rotation_mode: config.camera.rotation_mode,
            extension: config.camera.container.clone(),
        };
        let recorder = SegmentRecorder::new(
            settings,
            recorder_rx,
            camera,
            index.clone(),
            PruneHandle::new(prune_tx, prune_wake.clone()),
            controller_tx.clone(),
            events_tx.clone(),
        );
        tasks.push(tokio::spawn(recorder.run()));

        // Trigger controller
        let heartbeat = Duration::from_millis(service.heartbeat_ms);
        let controller = TriggerController::new(
            service.inactivity(),
            heartbeat,
            controller_rx,
            RecorderHandle::new(recorder_tx),
            state_tx,
            events_tx.clone(),
        );
        tasks.push(tokio::spawn(controller.run()));

        // Sensors and aggregation
        let backends = select_backends(&config.motion, build_backends(&config, preview_rx));
        for backend in &backends {
            tracing::info!("Motion source: {} ({:?})", backend.id(), backend.kind());
        }
        let aggregator = MotionAggregator::new(
            &backends,
            config.sensor.failure_threshold,
            heartbeat,
            events_tx.clone(),
        );
        let (report_tx, report_rx) = mpsc::channel(64);
        tasks.extend(spawn_pollers(backends, report_tx));
        tasks.push(tokio::spawn(aggregator.run(report_rx, controller_tx.clone())));

        // Storage
        let pruner = StoragePruner::new(index, Arc::new(FsSpaceGauge), service.min_free_bytes());
        let prune = PruneService::new(
            pruner,
            Duration::from_secs(service.prune_interval_seconds),
            prune_rx,
            prune_wake,
            events_tx,
        );
        tasks.push(tokio::spawn(prune.run()));

        tracing::info!(
            "Ready! Recording to {:?} in {}s segments, stopping after {}s without motion",
            service.output_dir,
            service.segment_seconds,
            service.inactivity_seconds
        );

        Ok(Self {
            config,
            events_rx,
            controller: controller_tx,
            state_rx,
            tasks,
        })
    }

    #[cfg(test)]
    pub fn state(&self) -> watch::Receiver<TriggerState> {
        self.state_rx.clone()
    }

    pub async fn run(mut self) -> Result<()> {
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        loop {
            tokio::select! {
                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event);
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received Ctrl+C, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, shutting down");
                    break;
                }
            }
        }

        self.shutdown().await
    }

    /// Stop recording (finalizing the open segment) and stop every task
    pub async fn shutdown(mut self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        if self.controller.send(ControllerEvent::Shutdown(reply)).is_ok() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, done).await {
                Ok(_) => tracing::debug!("Trigger controller finished"),
                Err(_) => tracing::warn!("Timed out waiting for recording to stop"),
            }
        }

        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        Ok(())
    }

    fn handle_event(&self, event: CoreEvent) {
        match &event {
            CoreEvent::StateChanged(state) => tracing::debug!("Trigger state: {:?}", state),
            CoreEvent::RecordingFailed(e) => tracing::error!("Recording failed: {}", e),
            CoreEvent::SensorDegraded {
                source,
                consecutive_failures,
            } => tracing::warn!(
                "Sensor {} degraded after {} failed reads",
                source,
                consecutive_failures
            ),
            CoreEvent::SensorRecovered { source } => tracing::info!("Sensor {} recovered", source),
            CoreEvent::AllSensorsDown => {
                tracing::error!("All motion sources are failing; recording cannot be triggered")
            }
            CoreEvent::StartupCheck {
                source, healthy, ..
            } => tracing::debug!("Startup check of {}: healthy={}", source, healthy),
            CoreEvent::SegmentsPruned {
                deleted,
                free_bytes,
            } => tracing::info!(
                "Pruned {} segments, {} MiB free",
                deleted,
                free_bytes / (1024 * 1024)
            ),
            other => tracing::debug!("{:?}", other),
        }

        if let Some((label, command, env)) = hook_for(&self.config.hooks, &event) {
            hooks::run_hook(label, command, env);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CameraBackend;
    use crate::error::RecordError;
    use std::path::PathBuf;

    #[test]
    fn test_hooks_follow_recording_and_storage_events() {
        let hooks = HooksConfig {
            on_recording_start: Some("led on".to_string()),
            on_recording_stop: Some("led off".to_string()),
            on_storage_low: None,
            on_startup: Some("status".to_string()),
        };

        let started = CoreEvent::RecordingStarted {
            first_segment: PathBuf::from("/videos/a_00000.mp4"),
        };
        let (label, command, env) = hook_for(&hooks, &started).unwrap();
        assert_eq!((label, command), ("recording_start", "led on"));
        assert!(env.contains(&("MOTIONCAM_EVENT", "recording_start".to_string())));

        let failed = CoreEvent::RecordingFailed(RecordError::HardwareUnavailable("gone".into()));
        assert_eq!(hook_for(&hooks, &failed).unwrap().1, "led off");

        let low = CoreEvent::StorageExhausted {
            free_bytes: 1,
            min_free_bytes: 2,
        };
        assert!(hook_for(&hooks, &low).is_none());
        assert!(hook_for(&hooks, &CoreEvent::AllSensorsDown).is_none());
    }

    #[test]
    fn test_startup_hook_carries_sensor_health() {
        let hooks = HooksConfig {
            on_startup: Some("status".to_string()),
            ..HooksConfig::default()
        };

        let failed = CoreEvent::StartupCheck {
            source: "tof".to_string(),
            healthy: false,
            detail: "sensor read timed out".to_string(),
        };
        let (label, command, env) = hook_for(&hooks, &failed).unwrap();
        assert_eq!((label, command), ("startup", "status"));
        assert!(env.contains(&("MOTIONCAM_SENSOR_OK", "0".to_string())));
        assert!(env.contains(&("MOTIONCAM_SENSOR", "tof".to_string())));

        let passed = CoreEvent::StartupCheck {
            source: "tof".to_string(),
            healthy: true,
            detail: "612mm".to_string(),
        };
        let (_, _, env) = hook_for(&hooks, &passed).unwrap();
        assert!(env.contains(&("MOTIONCAM_SENSOR_OK", "1".to_string())));

        assert!(hook_for(&HooksConfig::default(), &passed).is_none());
    }

    #[tokio::test]
    async fn test_startup_check_runs_against_missing_sensor() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.service.output_dir = dir.path().join("videos");
        config.camera.backend = CameraBackend::Simulated;
        config.motion.enable_vision_motion = false;
        config.sensor.distance_path = dir.path().join("no_such_sensor");

        let mut app = App::new(config).await.unwrap();

        match app.events_rx.recv().await {
            Some(CoreEvent::StartupCheck {
                source, healthy, ..
            }) => {
                assert_eq!(source, "tof");
                assert!(!healthy);
            }
            other => panic!("expected startup check, got {:?}", other),
        }
        app.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_pipeline_records_one_burst() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.service.output_dir = dir.path().to_path_buf();
        config.service.min_free_mb = 0;
        config.camera.backend = CameraBackend::Simulated;
        config.motion.enable_vision_motion = false;
        config.sensor.simulate = true;
        // 1s of presence at 8 Hz, then a long quiet stretch
        config.sensor.simulate_pattern = format!("{}{}", "1".repeat(8), "0".repeat(400));
        config.validate().unwrap();

        let app = App::new(config).await.unwrap();
        let mut state = app.state();

        state
            .wait_for(|s| *s == TriggerState::Recording)
            .await
            .unwrap();
        state.wait_for(|s| *s == TriggerState::Idle).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let index = StorageIndex::rebuild(dir.path(), "mp4", Duration::from_secs(30)).unwrap();
        let segments = index.snapshot();
        assert_eq!(segments.len(), 1);
        assert!(segments[0].size_bytes > 0);

        app.shutdown().await.unwrap();
    }
}
