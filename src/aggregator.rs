use crate::config::MotionConfig;
use crate::messages::{
    ControllerEvent, CoreEvent, EventSink, MotionSample, MotionSignal, SensorReport, emit,
};
use crate::sensors::{SensorBackend, SensorKind};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Drop backends the motion policy excludes. Excluded backends are never polled.
pub fn select_backends(
    motion: &MotionConfig,
    backends: Vec<Box<dyn SensorBackend>>,
) -> Vec<Box<dyn SensorBackend>> {
    let has_ranging = backends.iter().any(|b| b.kind().is_ranging());

    backends
        .into_iter()
        .filter(|b| {
            if b.kind() != SensorKind::Vision {
                return true;
            }
            if !motion.enable_vision_motion {
                return false;
            }
            if motion.has_radar_or_lidar && motion.disable_vision_if_radar_or_lidar {
                if has_ranging {
                    tracing::info!(
                        "Vision motion disabled because radar/lidar is present (per config)"
                    );
                    return false;
                }
                tracing::warn!("Radar/lidar configured but no ranging backend built; keeping vision");
            }
            true
        })
        .collect()
}

/// Spawn one polling task per backend; each reports into `tx` at its own rate
pub fn spawn_pollers(
    backends: Vec<Box<dyn SensorBackend>>,
    tx: mpsc::Sender<SensorReport>,
) -> Vec<JoinHandle<()>> {
    backends
        .into_iter()
        .map(|backend| tokio::spawn(poll_loop(backend, tx.clone())))
        .collect()
}

async fn poll_loop(mut backend: Box<dyn SensorBackend>, tx: mpsc::Sender<SensorReport>) {
    let mut ticker = tokio::time::interval(backend.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::debug!(
        "Polling {} ({:?}) every {:?}",
        backend.id(),
        backend.kind(),
        backend.poll_interval()
    );

    loop {
        ticker.tick().await;
        let result = backend.poll().await;
        let report = SensorReport {
            source: backend.id().to_string(),
            result,
        };
        if tx.send(report).await.is_err() {
            break;
        }
    }
}

#[derive(Debug)]
struct SourceState {
    id: String,
    freshness: Duration,
    last: Option<MotionSample>,
    consecutive_failures: u32,
    total_failures: u64,
    degraded: bool,
}

impl SourceState {
    fn fresh_presence(&self, now: Instant) -> Option<&MotionSample> {
        self.last
            .as_ref()
            .filter(|s| s.present && now.saturating_duration_since(s.at) <= self.freshness)
    }
}

/// OR-combines the latest fresh sample of every source into one signal
///
/// A failed poll is never read as absence: it leaves the source's previous
/// sample in place (which then ages out) and only feeds the failure counters.
pub struct MotionAggregator {
    sources: Vec<SourceState>,
    failure_threshold: u32,
    heartbeat: Duration,
    last_present: bool,
    all_down: bool,
    events: EventSink,
}

impl MotionAggregator {
    pub fn new(
        backends: &[Box<dyn SensorBackend>],
        failure_threshold: u32,
        heartbeat: Duration,
        events: EventSink,
    ) -> Self {
        let sources = backends
            .iter()
            .map(|b| SourceState {
                id: b.id().to_string(),
                freshness: b.poll_interval(),
                last: None,
                consecutive_failures: 0,
                total_failures: 0,
                degraded: false,
            })
            .collect();

        Self {
            sources,
            failure_threshold: failure_threshold.max(1),
            heartbeat,
            last_present: false,
            all_down: false,
            events,
        }
    }

    pub fn current(&self, now: Instant) -> MotionSignal {
        let freshest = self
            .sources
            .iter()
            .filter_map(|s| s.fresh_presence(now))
            .max_by_key(|s| s.at);

        match freshest {
            Some(sample) => MotionSignal {
                present: true,
                at: sample.at,
                source: Some(sample.source.clone()),
            },
            None => MotionSignal {
                present: false,
                at: now,
                source: None,
            },
        }
    }

    /// Apply one poll result. Returns a signal when motion was sampled or
    /// the combined value changed.
    pub fn record(&mut self, report: SensorReport, now: Instant) -> Option<MotionSignal> {
        let Some(idx) = self.sources.iter().position(|s| s.id == report.source) else {
            tracing::warn!("Report from unknown sensor {}", report.source);
            return None;
        };

        let mut sampled_motion = false;
        match report.result {
            Ok(sample) => {
                self.mark_healthy(idx);
                if let Some(sample) = sample {
                    sampled_motion = sample.present;
                    self.sources[idx].last = Some(sample);
                }
            }
            Err(e) => self.mark_failed(idx, &e.to_string()),
        }

        let signal = self.current(now);
        if sampled_motion || signal.present != self.last_present {
            self.last_present = signal.present;
            return Some(signal);
        }
        None
    }

    /// Periodic signal so the controller can tell the aggregator is alive
    pub fn heartbeat(&mut self, now: Instant) -> MotionSignal {
        let signal = self.current(now);
        self.last_present = signal.present;
        signal
    }

    fn mark_healthy(&mut self, idx: usize) {
        let source = &mut self.sources[idx];
        source.consecutive_failures = 0;
        if !source.degraded {
            return;
        }
        source.degraded = false;
        let id = source.id.clone();
        self.all_down = false;
        emit(&self.events, CoreEvent::SensorRecovered { source: id });
    }

    fn mark_failed(&mut self, idx: usize, error: &str) {
        let threshold = self.failure_threshold;
        let source = &mut self.sources[idx];
        source.consecutive_failures += 1;
        source.total_failures += 1;

        tracing::debug!(
            "[{}] poll failed ({} in a row, {} total): {}",
            source.id,
            source.consecutive_failures,
            source.total_failures,
            error
        );

        if source.degraded || source.consecutive_failures < threshold {
            return;
        }
        source.degraded = true;
        let event = CoreEvent::SensorDegraded {
            source: source.id.clone(),
            consecutive_failures: source.consecutive_failures,
        };
        emit(&self.events, event);

        if !self.all_down && self.sources.iter().all(|s| s.degraded) {
            self.all_down = true;
            emit(&self.events, CoreEvent::AllSensorsDown);
        }
    }

    pub async fn run(
        mut self,
        mut reports: mpsc::Receiver<SensorReport>,
        out: mpsc::UnboundedSender<ControllerEvent>,
    ) {
        if self.sources.is_empty() {
            self.all_down = true;
            emit(&self.events, CoreEvent::AllSensorsDown);
        }

        let mut heartbeat = tokio::time::interval(self.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reports_open = true;

        loop {
            let signal = tokio::select! {
                report = reports.recv(), if reports_open => match report {
                    Some(report) => self.record(report, Instant::now()),
                    None => {
                        reports_open = false;
                        None
                    }
                },
                _ = heartbeat.tick() => Some(self.heartbeat(Instant::now())),
            };

            if let Some(signal) = signal {
                if out.send(ControllerEvent::Motion(signal)).is_err() {
                    break;
                }
            }
        }
    }
}
