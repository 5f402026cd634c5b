use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub camera: CameraConfig,

    #[serde(default)]
    pub motion: MotionConfig,

    #[serde(default)]
    pub sensor: SensorConfig,

    #[serde(default)]
    pub hooks: HooksConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default = "default_min_free_mb")]
    pub min_free_mb: u64,

    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: u64,

    #[serde(default = "default_inactivity_seconds")]
    pub inactivity_seconds: u64,

    #[serde(default = "default_prune_interval_seconds")]
    pub prune_interval_seconds: u64,

    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraBackend {
    Ffmpeg,
    Simulated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationMode {
    /// External muxer enforces segment boundaries, no gap between segments
    FfmpegSegment,
    /// Recorder restarts the capture stream at each boundary (short gap)
    Rotate,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CameraConfig {
    #[serde(default = "default_camera_backend")]
    pub backend: CameraBackend,

    #[serde(default = "default_device")]
    pub device: PathBuf,

    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    #[serde(default = "default_fps")]
    pub fps: u32,

    #[serde(default = "default_codec")]
    pub codec: String,

    #[serde(default = "default_container")]
    pub container: String,

    #[serde(default = "default_rotation_mode")]
    pub rotation_mode: RotationMode,

    #[serde(default = "default_preview_width")]
    pub preview_width: u32,

    #[serde(default = "default_preview_height")]
    pub preview_height: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MotionConfig {
    #[serde(default = "default_true")]
    pub enable_vision_motion: bool,

    #[serde(default = "default_true")]
    pub disable_vision_if_radar_or_lidar: bool,

    #[serde(default)]
    pub has_radar_or_lidar: bool,

    #[serde(default = "default_vision_fps")]
    pub vision_motion_fps: u32,

    #[serde(default = "default_vision_sensitivity")]
    pub vision_motion_sensitivity: u32,

    #[serde(default = "default_vision_fraction")]
    pub vision_motion_fraction: f32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SensorConfig {
    #[serde(default = "default_poll_hz")]
    pub poll_hz: u32,

    #[serde(default)]
    pub simulate: bool,

    /// `1` present, `0` absent, `x` failed read; replayed in a loop
    #[serde(default = "default_simulate_pattern")]
    pub simulate_pattern: String,

    #[serde(default = "default_distance_path")]
    pub distance_path: PathBuf,

    #[serde(default = "default_distance_scale")]
    pub distance_scale_mm: f32,

    #[serde(default = "default_smooth_alpha")]
    pub smooth_alpha: f32,

    #[serde(default = "default_hysteresis_mm")]
    pub hysteresis_mm: f32,

    #[serde(default)]
    pub presence_path: Option<PathBuf>,

    #[serde(default)]
    pub presence_active_low: bool,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HooksConfig {
    #[serde(default)]
    pub on_recording_start: Option<String>,

    #[serde(default)]
    pub on_recording_stop: Option<String>,

    #[serde(default)]
    pub on_storage_low: Option<String>,

    /// Runs once after the startup distance sensor check
    #[serde(default)]
    pub on_startup: Option<String>,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./videos")
}

fn default_min_free_mb() -> u64 {
    1024
}

fn default_segment_seconds() -> u64 {
    30
}

fn default_inactivity_seconds() -> u64 {
    10
}

fn default_prune_interval_seconds() -> u64 {
    60
}

fn default_heartbeat_ms() -> u64 {
    1000
}

fn default_camera_backend() -> CameraBackend {
    CameraBackend::Ffmpeg
}

fn default_device() -> PathBuf {
    PathBuf::from("/dev/video0")
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

fn default_fps() -> u32 {
    30
}

fn default_codec() -> String {
    "h264".to_string()
}

fn default_container() -> String {
    "mp4".to_string()
}

fn default_rotation_mode() -> RotationMode {
    RotationMode::Rotate
}

fn default_preview_width() -> u32 {
    160
}

fn default_preview_height() -> u32 {
    90
}

fn default_true() -> bool {
    true
}

fn default_vision_fps() -> u32 {
    5
}

fn default_vision_sensitivity() -> u32 {
    25
}

fn default_vision_fraction() -> f32 {
    0.02
}

fn default_poll_hz() -> u32 {
    8
}

fn default_simulate_pattern() -> String {
    // ~1s of presence, then ~30s of an empty room at 8 Hz
    format!("{}{}", "1".repeat(8), "0".repeat(240))
}

fn default_distance_path() -> PathBuf {
    PathBuf::from("/sys/bus/iio/devices/iio:device0/in_distance_raw")
}

fn default_distance_scale() -> f32 {
    1.0
}

fn default_smooth_alpha() -> f32 {
    0.25
}

fn default_hysteresis_mm() -> f32 {
    40.0
}

fn default_failure_threshold() -> u32 {
    5
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            min_free_mb: default_min_free_mb(),
            segment_seconds: default_segment_seconds(),
            inactivity_seconds: default_inactivity_seconds(),
            prune_interval_seconds: default_prune_interval_seconds(),
            heartbeat_ms: default_heartbeat_ms(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            backend: default_camera_backend(),
            device: default_device(),
            ffmpeg_path: default_ffmpeg_path(),
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            codec: default_codec(),
            container: default_container(),
            rotation_mode: default_rotation_mode(),
            preview_width: default_preview_width(),
            preview_height: default_preview_height(),
        }
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            enable_vision_motion: true,
            disable_vision_if_radar_or_lidar: true,
            has_radar_or_lidar: false,
            vision_motion_fps: default_vision_fps(),
            vision_motion_sensitivity: default_vision_sensitivity(),
            vision_motion_fraction: default_vision_fraction(),
        }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            poll_hz: default_poll_hz(),
            simulate: false,
            simulate_pattern: default_simulate_pattern(),
            distance_path: default_distance_path(),
            distance_scale_mm: default_distance_scale(),
            smooth_alpha: default_smooth_alpha(),
            hysteresis_mm: default_hysteresis_mm(),
            presence_path: None,
            presence_active_low: false,
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl ServiceConfig {
    pub fn segment_len(&self) -> Duration {
        Duration::from_secs(self.segment_seconds)
    }

    pub fn inactivity(&self) -> Duration {
        Duration::from_secs(self.inactivity_seconds)
    }

    pub fn min_free_bytes(&self) -> u64 {
        self.min_free_mb * 1024 * 1024
    }
}

impl MotionConfig {
    /// Vision is skipped entirely when a radar/lidar sensor is fitted and config says so
    pub fn vision_active(&self) -> bool {
        self.enable_vision_motion
            && !(self.has_radar_or_lidar && self.disable_vision_if_radar_or_lidar)
    }
}

impl Config {
    /// Load configuration from an explicit path, or from the default location
    /// (~/.config/motioncam/config.json), creating it with defaults if missing
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file not found: {:?}", p);
                }
                p.to_path_buf()
            }
            None => Self::config_path()?,
        };

        if !config_path.exists() {
            tracing::info!(
                "Config file not found at {:?}, creating default config",
                config_path
            );
            let config = Self::default();
            config.save_to(&config_path)?;
            return Ok(config);
        }

        let contents = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;

        tracing::info!("Loaded config from {:?}", config_path);
        Ok(config)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = self.to_json()?;

        std::fs::write(config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        tracing::info!("Saved config to {:?}", config_path);
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize config")
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
            PathBuf::from(dir)
        } else {
            let home = std::env::var("HOME").context("HOME environment variable not set")?;
            PathBuf::from(home).join(".config")
        };

        Ok(config_dir.join("motioncam").join("config.json"))
    }

    pub fn validate(&self) -> Result<()> {
        let service = &self.service;
        if service.output_dir.as_os_str().is_empty() {
            anyhow::bail!("service.output_dir cannot be empty");
        }
        if service.segment_seconds == 0 {
            anyhow::bail!("service.segment_seconds must be > 0");
        }
        if service.inactivity_seconds == 0 {
            anyhow::bail!("service.inactivity_seconds must be > 0");
        }
        if service.prune_interval_seconds == 0 || service.heartbeat_ms == 0 {
            anyhow::bail!("service.prune_interval_seconds and service.heartbeat_ms must be > 0");
        }

        if self.camera.fps == 0 || self.camera.width == 0 || self.camera.height == 0 {
            anyhow::bail!("camera.width, camera.height and camera.fps must be > 0");
        }
        if self.camera.container.is_empty() {
            anyhow::bail!("camera.container cannot be empty");
        }

        let motion = &self.motion;
        if motion.vision_active() {
            if motion.vision_motion_fps == 0 {
                anyhow::bail!("motion.vision_motion_fps must be > 0");
            }
            if self.camera.preview_width == 0 || self.camera.preview_height == 0 {
                anyhow::bail!("camera.preview_width and camera.preview_height must be > 0");
            }
        }
        if motion.vision_motion_sensitivity > 255 {
            anyhow::bail!("motion.vision_motion_sensitivity must be within 0..=255");
        }
        if !(motion.vision_motion_fraction > 0.0 && motion.vision_motion_fraction <= 1.0) {
            anyhow::bail!("motion.vision_motion_fraction must be within (0, 1]");
        }

        let sensor = &self.sensor;
        if sensor.poll_hz == 0 {
            anyhow::bail!("sensor.poll_hz must be > 0");
        }
        if !(0.0..=1.0).contains(&sensor.smooth_alpha) {
            anyhow::bail!("sensor.smooth_alpha must be within [0, 1]");
        }
        if sensor.failure_threshold == 0 {
            anyhow::bail!("sensor.failure_threshold must be > 0");
        }
        if sensor.simulate {
            if sensor.simulate_pattern.is_empty()
                || !sensor.simulate_pattern.chars().all(|c| matches!(c, '0' | '1' | 'x'))
            {
                anyhow::bail!("sensor.simulate_pattern must be a non-empty string of 0, 1 and x");
            }
        } else if motion.has_radar_or_lidar && sensor.presence_path.is_none() {
            anyhow::bail!("sensor.presence_path is required when motion.has_radar_or_lidar is set");
        }

        Ok(())
    }
}
