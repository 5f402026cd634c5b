use crate::messages::TriggerState;
use std::time::Duration;
use tokio::time::Instant;

/// What the controller must do after feeding the machine an input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    StartRecording,
    StopRecording,
}

/// IDLE/RECORDING trigger logic, free of I/O and clocks.
///
/// Every input carries its own timestamp so the machine can be driven by
/// real or simulated time. Within one evaluation tick, motion must be fed
/// before the deadline is checked; that ordering is what makes motion win a
/// tie against the inactivity timeout.
#[derive(Debug)]
pub struct TriggerStateMachine {
    state: TriggerState,
    last_motion: Option<Instant>,
    inactivity: Duration,
}

impl TriggerStateMachine {
    pub fn new(inactivity: Duration) -> Self {
        Self {
            state: TriggerState::Idle,
            last_motion: None,
            inactivity,
        }
    }

    pub fn state(&self) -> TriggerState {
        self.state
    }

    /// When the inactivity timer will fire if nothing else happens
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            TriggerState::Recording => self.last_motion.map(|t| t + self.inactivity),
            TriggerState::Idle => None,
        }
    }

    pub fn on_motion(&mut self, at: Instant) -> Transition {
        // Samples from different backends may arrive slightly out of order
        self.last_motion = Some(self.last_motion.map_or(at, |prev| prev.max(at)));

        match self.state {
            TriggerState::Idle => {
                self.state = TriggerState::Recording;
                Transition::StartRecording
            }
            TriggerState::Recording => Transition::None,
        }
    }

    /// The recorder confirmed the session is open; the window starts now
    pub fn recording_started(&mut self, now: Instant) {
        if self.state == TriggerState::Recording {
            self.last_motion = Some(self.last_motion.map_or(now, |prev| prev.max(now)));
        }
    }

    /// Starting failed or the session died; the next trigger tries again
    pub fn recording_failed(&mut self) {
        self.state = TriggerState::Idle;
        self.last_motion = None;
    }

    pub fn on_tick(&mut self, now: Instant) -> Transition {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                self.state = TriggerState::Idle;
                self.last_motion = None;
                Transition::StopRecording
            }
            _ => Transition::None,
        }
    }

    /// Shutdown counts as an immediate end of motion
    pub fn shutdown(&mut self) -> Transition {
        let was = self.state;
        self.state = TriggerState::Idle;
        self.last_motion = None;
        match was {
            TriggerState::Recording => Transition::StopRecording,
            TriggerState::Idle => Transition::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    /// Drive the machine on a 100ms tick grid and return when it stopped
    fn stop_time(motions: &[f64], inactivity: u64, horizon: f64) -> Option<f64> {
        let t0 = Instant::now();
        let mut machine = TriggerStateMachine::new(Duration::from_secs(inactivity));
        let mut pending = motions.to_vec();

        for step in 0..=(horizon * 10.0) as u64 {
            let t = step as f64 / 10.0;
            let now = t0 + secs(t);
            while pending.first().is_some_and(|m| *m <= t + 1e-9) {
                let m = pending.remove(0);
                machine.on_motion(t0 + secs(m));
            }
            if machine.on_tick(now) == Transition::StopRecording {
                return Some(t);
            }
        }
        None
    }

    #[test]
    fn test_idle_motion_starts_recording() {
        let now = Instant::now();
        let mut machine = TriggerStateMachine::new(Duration::from_secs(10));

        assert_eq!(machine.state(), TriggerState::Idle);
        assert_eq!(machine.on_tick(now), Transition::None);
        assert_eq!(machine.on_motion(now), Transition::StartRecording);
        assert_eq!(machine.state(), TriggerState::Recording);
        assert_eq!(machine.on_motion(now + secs(1.0)), Transition::None);
        assert_eq!(machine.deadline(), Some(now + secs(11.0)));
    }

    #[test]
    fn test_motion_extends_window() {
        // Motion at 0s and 8s with 10s inactivity stops at 18s, not 10s
        assert_eq!(stop_time(&[0.0, 8.0], 10, 30.0), Some(18.0));
    }

    #[test]
    fn test_single_motion_stops_after_inactivity() {
        assert_eq!(stop_time(&[0.0], 10, 30.0), Some(10.0));
        assert_eq!(stop_time(&[2.5], 10, 30.0), Some(12.5));
    }

    #[test]
    fn test_continuous_motion_never_stops() {
        let motions: Vec<f64> = (0..300).map(|i| i as f64 * 0.125).collect();
        assert_eq!(stop_time(&motions, 10, 37.0), None);
    }

    #[test]
    fn test_motion_beats_timeout_in_same_tick() {
        let t0 = Instant::now();
        let mut machine = TriggerStateMachine::new(Duration::from_secs(10));
        machine.on_motion(t0);

        // Deadline and a new motion sample land in the same tick
        let tick = t0 + secs(10.0);
        machine.on_motion(tick);
        assert_eq!(machine.on_tick(tick), Transition::None);
        assert_eq!(machine.state(), TriggerState::Recording);
    }

    #[test]
    fn test_out_of_order_sample_does_not_shorten_window() {
        let t0 = Instant::now();
        let mut machine = TriggerStateMachine::new(Duration::from_secs(10));
        machine.on_motion(t0 + secs(5.0));
        machine.on_motion(t0 + secs(4.0));
        assert_eq!(machine.deadline(), Some(t0 + secs(15.0)));
    }

    #[test]
    fn test_failed_start_reverts_to_idle_and_retries() {
        let t0 = Instant::now();
        let mut machine = TriggerStateMachine::new(Duration::from_secs(10));

        assert_eq!(machine.on_motion(t0), Transition::StartRecording);
        machine.recording_failed();
        assert_eq!(machine.state(), TriggerState::Idle);
        assert_eq!(machine.on_tick(t0 + secs(20.0)), Transition::None);

        assert_eq!(machine.on_motion(t0 + secs(21.0)), Transition::StartRecording);
    }

    #[test]
    fn test_recording_started_restarts_window_from_open_time() {
        let t0 = Instant::now();
        let mut machine = TriggerStateMachine::new(Duration::from_secs(10));
        machine.on_motion(t0);
        // Camera took 2s to open
        machine.recording_started(t0 + secs(2.0));
        assert_eq!(machine.on_tick(t0 + secs(11.0)), Transition::None);
        assert_eq!(machine.on_tick(t0 + secs(12.0)), Transition::StopRecording);
    }

    #[test]
    fn test_shutdown_stops_only_when_recording() {
        let mut machine = TriggerStateMachine::new(Duration::from_secs(10));
        assert_eq!(machine.shutdown(), Transition::None);
        machine.on_motion(Instant::now());
        assert_eq!(machine.shutdown(), Transition::StopRecording);
        assert_eq!(machine.state(), TriggerState::Idle);
    }
}
