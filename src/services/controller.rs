use crate::messages::{ControllerEvent, CoreEvent, EventSink, TriggerState, emit};
use crate::services::RecorderHandle;
use crate::trigger::{Transition, TriggerStateMachine};
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

/// How often the inactivity deadline is evaluated
pub const TICK: Duration = Duration::from_millis(200);

/// The aggregator counts as stalled after this many silent heartbeats
const STALL_HEARTBEATS: u32 = 3;

/// Drives the trigger state machine from aggregated motion and tells the
/// recorder when to start and stop
pub struct TriggerController {
    machine: TriggerStateMachine,
    inbox: mpsc::UnboundedReceiver<ControllerEvent>,
    recorder: RecorderHandle,
    state: watch::Sender<TriggerState>,
    events: EventSink,
    stall_after: Duration,
    last_signal: Instant,
    stalled: bool,
}

impl TriggerController {
    pub fn new(
        inactivity: Duration,
        heartbeat: Duration,
        inbox: mpsc::UnboundedReceiver<ControllerEvent>,
        recorder: RecorderHandle,
        state: watch::Sender<TriggerState>,
        events: EventSink,
    ) -> Self {
        Self {
            machine: TriggerStateMachine::new(inactivity),
            inbox,
            recorder,
            state,
            events,
            stall_after: heartbeat * STALL_HEARTBEATS,
            last_signal: Instant::now(),
            stalled: false,
        }
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                event = self.inbox.recv() => {
                    let flow = match event {
                        Some(event) => self.handle(event).await,
                        None => {
                            self.shutdown().await;
                            ControlFlow::Break(())
                        }
                    };
                    if flow.is_break() {
                        break;
                    }
                }

                _ = ticker.tick() => {
                    // Motion that arrived during this tick counts before the deadline
                    if self.drain().await.is_break() {
                        break;
                    }
                    self.evaluate(Instant::now()).await;
                }
            }
        }

        tracing::debug!("Trigger controller stopped");
    }

    async fn drain(&mut self) -> ControlFlow<()> {
        while let Ok(event) = self.inbox.try_recv() {
            if self.handle(event).await.is_break() {
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn handle(&mut self, event: ControllerEvent) -> ControlFlow<()> {
        match event {
            ControllerEvent::Motion(signal) => {
                self.last_signal = Instant::now();
                if std::mem::take(&mut self.stalled) {
                    tracing::info!("Motion aggregator is reporting again");
                }
                if signal.present {
                    tracing::trace!("Motion from {:?}", signal.source);
                    if self.machine.on_motion(signal.at) == Transition::StartRecording {
                        self.start_recording().await;
                    }
                }
            }
            ControllerEvent::RecordingFailed(error) => {
                if self.machine.state() == TriggerState::Recording {
                    tracing::warn!("Recording session lost: {}", error);
                    self.machine.recording_failed();
                    self.publish();
                }
            }
            ControllerEvent::Shutdown(reply) => {
                self.shutdown().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn evaluate(&mut self, now: Instant) {
        if self.machine.on_tick(now) == Transition::StopRecording {
            self.stop_recording().await;
        }

        let silent_for = now.saturating_duration_since(self.last_signal);
        if !self.stalled && silent_for >= self.stall_after {
            self.stalled = true;
            tracing::warn!("No motion signal for {:?}", silent_for);
            emit(&self.events, CoreEvent::AggregatorStalled { silent_for });
        }
    }

    async fn start_recording(&mut self) {
        tracing::info!("Motion detected, starting recording");
        self.publish();

        match self.recorder.start().await {
            Ok(path) => {
                tracing::debug!("First segment: {:?}", path);
                self.machine.recording_started(Instant::now());
            }
            Err(e) => {
                tracing::error!("Failed to start recording: {}", e);
                self.machine.recording_failed();
                emit(&self.events, CoreEvent::RecordingFailed(e));
                self.publish();
            }
        }
    }

    async fn stop_recording(&mut self) {
        tracing::info!("No motion, stopping recording");
        self.publish();

        match self.recorder.stop().await {
            Ok(Some(last)) => tracing::debug!("Last segment: {:?}", last.path),
            Ok(None) => tracing::debug!("Recorder had no open session"),
            Err(e) => tracing::error!("Failed to stop recording: {}", e),
        }
    }

    async fn shutdown(&mut self) {
        if self.machine.shutdown() == Transition::StopRecording {
            self.stop_recording().await;
        }
    }

    /// Mirror the machine's state on the watch channel
    fn publish(&self) {
        let state = self.machine.state();
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            emit(&self.events, CoreEvent::StateChanged(state));
        }
    }
}
