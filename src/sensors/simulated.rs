use super::backend::{SensorBackend, SensorKind};
use crate::error::SensorError;
use crate::messages::MotionSample;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Deterministic scripted backend for development and tests
///
/// Steps are replayed in order; once exhausted the backend either loops or
/// keeps reporting absence.
pub struct SimulatedBackend {
    id: String,
    kind: SensorKind,
    interval: Duration,
    script: Vec<Result<bool, SensorError>>,
    position: usize,
    looping: bool,
    polls: Arc<AtomicUsize>,
}

impl SimulatedBackend {
    pub fn new(
        id: &str,
        kind: SensorKind,
        interval: Duration,
        script: Vec<Result<bool, SensorError>>,
    ) -> Self {
        Self {
            id: id.to_string(),
            kind,
            interval,
            script,
            position: 0,
            looping: false,
            polls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Parse a pattern of `1` (present), `0` (absent) and `x` (failed read)
    pub fn from_pattern(id: &str, kind: SensorKind, interval: Duration, pattern: &str) -> Self {
        let script = pattern
            .chars()
            .filter_map(|c| match c {
                '1' => Some(Ok(true)),
                '0' => Some(Ok(false)),
                'x' => Some(Err(SensorError::Timeout)),
                _ => None,
            })
            .collect();
        Self::new(id, kind, interval, script)
    }

    pub fn looping(mut self) -> Self {
        self.looping = true;
        self
    }

    pub fn poll_counter(&self) -> Arc<AtomicUsize> {
        self.polls.clone()
    }
}

#[async_trait]
impl SensorBackend for SimulatedBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SensorKind {
        self.kind
    }

    fn poll_interval(&self) -> Duration {
        self.interval
    }

    async fn poll(&mut self) -> Result<Option<MotionSample>, SensorError> {
        self.polls.fetch_add(1, Ordering::Relaxed);

        if self.position >= self.script.len() {
            if !self.looping || self.script.is_empty() {
                return Ok(Some(MotionSample::now(&self.id, false)));
            }
            self.position = 0;
        }

        let step = self.script[self.position].clone();
        self.position += 1;

        step.map(|present| Some(MotionSample::now(&self.id, present)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn present(backend: &mut SimulatedBackend) -> Result<bool, SensorError> {
        backend.poll().await.map(|s| s.is_some_and(|s| s.present))
    }

    #[tokio::test]
    async fn test_pattern_replays_then_reports_absence() {
        let mut backend =
            SimulatedBackend::from_pattern("sim", SensorKind::Distance, Duration::from_millis(125), "1x0");

        assert_eq!(present(&mut backend).await, Ok(true));
        assert_eq!(present(&mut backend).await, Err(SensorError::Timeout));
        assert_eq!(present(&mut backend).await, Ok(false));
        assert_eq!(present(&mut backend).await, Ok(false));
        assert_eq!(backend.poll_counter().load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn test_looping_pattern_wraps() {
        let mut backend =
            SimulatedBackend::from_pattern("sim", SensorKind::Presence, Duration::from_millis(125), "10")
                .looping();

        let seen: Vec<bool> = [
            present(&mut backend).await,
            present(&mut backend).await,
            present(&mut backend).await,
        ]
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
        assert_eq!(seen, vec![true, false, true]);
    }
}
