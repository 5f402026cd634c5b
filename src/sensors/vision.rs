use super::backend::{SensorBackend, SensorKind};
use crate::camera::PreviewFrame;
use crate::error::SensorError;
use crate::messages::MotionSample;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::watch;

/// Only every Nth pixel in each direction is compared
const DOWNSAMPLE: u32 = 4;

/// Frame-differencing motion estimator over camera preview frames
pub struct VisionBackend {
    id: String,
    interval: Duration,
    frames: watch::Receiver<Option<PreviewFrame>>,
    sensitivity: f32,
    min_fraction: f32,
    last_seq: Option<u64>,
    previous: Option<Vec<f32>>,
}

impl VisionBackend {
    pub fn new(
        id: &str,
        interval: Duration,
        frames: watch::Receiver<Option<PreviewFrame>>,
        sensitivity: u32,
        min_fraction: f32,
    ) -> Self {
        Self {
            id: id.to_string(),
            interval,
            frames,
            sensitivity: sensitivity as f32,
            min_fraction,
            last_seq: None,
            previous: None,
        }
    }

    fn downsample(frame: &PreviewFrame) -> Vec<f32> {
        let mut gray = Vec::new();
        for y in (0..frame.height).step_by(DOWNSAMPLE as usize) {
            for x in (0..frame.width).step_by(DOWNSAMPLE as usize) {
                gray.push(frame.gray(x, y));
            }
        }
        gray
    }

    /// Fraction of sampled pixels that changed by more than the sensitivity.
    /// `None` while there is no baseline to compare against.
    pub fn score(&mut self, frame: &PreviewFrame) -> Option<f32> {
        if frame.rgb.len() < PreviewFrame::byte_len(frame.width, frame.height) {
            return None;
        }
        let gray = Self::downsample(frame);
        let previous = self.previous.replace(gray);
        let previous = previous?;
        let current = self.previous.as_ref()?;

        if previous.len() != current.len() || current.is_empty() {
            return None;
        }

        let moving = previous
            .iter()
            .zip(current)
            .filter(|(a, b)| (*a - *b).abs() > self.sensitivity)
            .count();
        Some(moving as f32 / current.len() as f32)
    }
}

#[async_trait]
impl SensorBackend for VisionBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SensorKind {
        SensorKind::Vision
    }

    fn poll_interval(&self) -> Duration {
        self.interval
    }

    async fn poll(&mut self) -> Result<Option<MotionSample>, SensorError> {
        let frame = self.frames.borrow().clone();

        // Camera off: nothing to compare, and the next frame starts a new baseline
        let Some(frame) = frame else {
            self.previous = None;
            self.last_seq = None;
            return Ok(None);
        };

        if self.last_seq == Some(frame.seq) {
            return Ok(None);
        }
        self.last_seq = Some(frame.seq);

        match self.score(&frame) {
            Some(score) => Ok(Some(MotionSample::now(&self.id, score > self.min_fraction))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn frame(seq: u64, fill: impl Fn(u32, u32) -> u8) -> PreviewFrame {
        let (width, height) = (16, 8);
        let mut rgb = Vec::with_capacity(PreviewFrame::byte_len(width, height));
        for y in 0..height {
            for x in 0..width {
                let v = fill(x, y);
                rgb.extend_from_slice(&[v, v, v]);
            }
        }
        PreviewFrame {
            seq,
            width,
            height,
            rgb: Arc::from(rgb),
        }
    }

    #[tokio::test]
    async fn test_no_frames_means_no_sample() {
        let (_tx, rx) = watch::channel(None);
        let mut vision = VisionBackend::new("vision", Duration::from_millis(200), rx, 25, 0.02);
        assert_eq!(vision.poll().await, Ok(None));
    }

    #[tokio::test]
    async fn test_detects_change_between_frames() {
        let (tx, rx) = watch::channel(None);
        let mut vision = VisionBackend::new("vision", Duration::from_millis(200), rx, 25, 0.02);

        tx.send_replace(Some(frame(1, |_, _| 100)));
        assert_eq!(vision.poll().await, Ok(None)); // baseline only

        // Same frame again: nothing new
        assert_eq!(vision.poll().await, Ok(None));

        tx.send_replace(Some(frame(2, |_, _| 101)));
        assert!(!vision.poll().await.unwrap().unwrap().present);

        tx.send_replace(Some(frame(3, |x, _| if x < 8 { 200 } else { 101 })));
        assert!(vision.poll().await.unwrap().unwrap().present);
    }

    #[test]
    fn test_sensitivity_controls_threshold() {
        let (_tx, rx) = watch::channel(None);
        let mut strict = VisionBackend::new("vision", Duration::from_millis(200), rx, 60, 0.02);

        strict.score(&frame(1, |_, _| 100));
        // A 50-level change is below a sensitivity of 60
        assert_eq!(strict.score(&frame(2, |_, _| 150)), Some(0.0));
        assert_eq!(strict.score(&frame(3, |_, _| 250)), Some(1.0));
    }

    #[tokio::test]
    async fn test_camera_off_resets_baseline() {
        let (tx, rx) = watch::channel(None);
        let mut vision = VisionBackend::new("vision", Duration::from_millis(200), rx, 25, 0.02);

        tx.send_replace(Some(frame(1, |_, _| 0)));
        vision.poll().await.unwrap();
        tx.send_replace(None);
        assert_eq!(vision.poll().await, Ok(None));

        // First frame after the gap must not be compared with the stale one
        tx.send_replace(Some(frame(2, |_, _| 255)));
        assert_eq!(vision.poll().await, Ok(None));
    }
}
