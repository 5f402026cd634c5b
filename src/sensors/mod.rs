pub mod backend;
pub mod presence;
pub mod simulated;
pub mod tof;
pub mod vision;

pub use backend::{SensorBackend, SensorKind, interval_for_hz};
pub use presence::PresenceBackend;
pub use simulated::SimulatedBackend;
pub use tof::{IioDistanceReader, TofBackend};
pub use vision::VisionBackend;

use crate::camera::PreviewFrame;
use crate::config::Config;
use tokio::sync::watch;

/// Build every backend the configuration enables. The motion policy
/// (vision suppression) is applied afterwards by the aggregator.
pub fn build_backends(
    config: &Config,
    preview: watch::Receiver<Option<PreviewFrame>>,
) -> Vec<Box<dyn SensorBackend>> {
    let sensor = &config.sensor;
    let motion = &config.motion;
    let poll_interval = interval_for_hz(sensor.poll_hz);
    let mut backends: Vec<Box<dyn SensorBackend>> = Vec::new();

    if sensor.simulate {
        tracing::warn!("Sensor simulation active; presence readings are scripted");
        backends.push(Box::new(
            SimulatedBackend::from_pattern(
                "sim",
                SensorKind::Distance,
                poll_interval,
                &sensor.simulate_pattern,
            )
            .looping(),
        ));
    } else {
        let reader = IioDistanceReader::new(sensor.distance_path.clone(), sensor.distance_scale_mm);
        backends.push(Box::new(TofBackend::new(
            "tof",
            poll_interval,
            Box::new(reader),
            sensor.smooth_alpha,
            sensor.hysteresis_mm,
        )));

        if let Some(path) = sensor.presence_path.as_ref().filter(|_| motion.has_radar_or_lidar) {
            backends.push(Box::new(PresenceBackend::new(
                "radar",
                poll_interval,
                path.clone(),
                sensor.presence_active_low,
            )));
        }
    }

    if motion.enable_vision_motion {
        backends.push(Box::new(VisionBackend::new(
            "vision",
            interval_for_hz(motion.vision_motion_fps),
            preview,
            motion.vision_motion_sensitivity,
            motion.vision_motion_fraction,
        )));
    }

    backends
}
