use super::announcer::{Announcer, control_query};
use super::notice::PendingNotice;
use crate::config::DispatchConfig;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, event, info_span};

/// Where a delivery is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeliveryPhase {
    Admitted,
    WaitingToStart,
    Sending,
    WaitingForDeviceIdle,
    Finished,
}

impl DeliveryPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Admitted,
            1 => Self::WaitingToStart,
            2 => Self::Sending,
            3 => Self::WaitingForDeviceIdle,
            _ => Self::Finished,
        }
    }
}

/// How a finished delivery ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeliveryOutcome {
    /// The device went idle after the notice (or output was switched off).
    Delivered,
    /// The device never went idle after the notice was sent.
    TimedOut,
    /// Nothing was sent: the device stayed busy before sending, or the
    /// dispatcher was shutting down.
    Yielded,
}

/// Timing of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliverySettings {
    /// Pause before each device-idle wait starts polling.
    pub settle_delay: Duration,
    /// Pause between the control request and the completion wait.
    pub post_send_pause: Duration,
    /// Wall-clock bound of each device-idle wait.
    pub completion_timeout: Duration,
    pub poll_interval: Duration,
}

impl From<&DispatchConfig> for DeliverySettings {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            settle_delay: config.settle_delay(),
            post_send_pause: config.http_timeout(),
            completion_timeout: config.completion_timeout(),
            poll_interval: config.poll_interval(),
        }
    }
}

/// Live output switches shared by every delivery.
#[derive(Debug)]
pub struct OutputSwitches {
    active: AtomicBool,
    voice_enabled: AtomicBool,
}

impl OutputSwitches {
    pub fn new(active: bool, voice_enabled: bool) -> Self {
        Self {
            active: AtomicBool::new(active),
            voice_enabled: AtomicBool::new(voice_enabled),
        }
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub fn set_voice_enabled(&self, enabled: bool) {
        self.voice_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn voice_enabled(&self) -> bool {
        self.voice_enabled.load(Ordering::SeqCst)
    }

    /// Devices are only driven by the active instance with voice on.
    pub fn is_live(&self) -> bool {
        self.is_active() && self.voice_enabled()
    }
}

#[derive(Debug, Default)]
struct DeliveryState {
    phase: AtomicU8,
    finished: AtomicBool,
    timed_out: AtomicBool,
    yielded: AtomicBool,
}

impl DeliveryState {
    fn enter(&self, phase: DeliveryPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    fn finish(&self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::TimedOut => self.timed_out.store(true, Ordering::Release),
            DeliveryOutcome::Yielded => self.yielded.store(true, Ordering::Release),
            DeliveryOutcome::Delivered => {}
        }
        self.enter(DeliveryPhase::Finished);
        self.finished.store(true, Ordering::Release);
    }
}

/// A notice being announced by its own task.
pub struct NoticeDelivery {
    notice: PendingNotice,
    state: Arc<DeliveryState>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl NoticeDelivery {
    /// Admits `notice` and starts its task.
    pub fn start(
        notice: PendingNotice,
        announcer: Arc<dyn Announcer>,
        switches: Arc<OutputSwitches>,
        settings: DeliverySettings,
        cancel: CancellationToken,
    ) -> Self {
        let state = Arc::new(DeliveryState::default());
        let run = DeliveryRun {
            notice: notice.clone(),
            state: state.clone(),
            announcer,
            switches,
            settings,
            cancel: cancel.clone(),
        };
        let span = info_span!("delivery", address = %notice.address, key_time = %notice.key_time);
        let handle = tokio::spawn(run.run().instrument(span));

        Self {
            notice,
            state,
            cancel,
            handle,
        }
    }

    pub fn notice(&self) -> &PendingNotice {
        &self.notice
    }

    pub fn phase(&self) -> DeliveryPhase {
        DeliveryPhase::from_u8(self.state.phase.load(Ordering::Acquire))
    }

    pub fn is_finished(&self) -> bool {
        self.state.finished.load(Ordering::Acquire)
    }

    /// `None` while still running.
    pub fn outcome(&self) -> Option<DeliveryOutcome> {
        if !self.is_finished() {
            return None;
        }
        if self.state.timed_out.load(Ordering::Acquire) {
            Some(DeliveryOutcome::TimedOut)
        } else if self.state.yielded.load(Ordering::Acquire) {
            Some(DeliveryOutcome::Yielded)
        } else {
            Some(DeliveryOutcome::Delivered)
        }
    }

    /// Asks the task to stop at its next wait. A request already on the
    /// wire is left to finish.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Lets the task run on unobserved.
    pub fn detach(self) -> PendingNotice {
        drop(self.handle);
        self.notice
    }
}

struct DeliveryRun {
    notice: PendingNotice,
    state: Arc<DeliveryState>,
    announcer: Arc<dyn Announcer>,
    switches: Arc<OutputSwitches>,
    settings: DeliverySettings,
    cancel: CancellationToken,
}

impl DeliveryRun {
    async fn run(self) {
        let outcome = self.phases().await;
        event!(Level::DEBUG, outcome = ?outcome, "delivery finished");
        self.state.finish(outcome);
    }

    async fn phases(&self) -> DeliveryOutcome {
        self.state.enter(DeliveryPhase::WaitingToStart);
        if !self.wait_for_idle().await {
            event!(Level::INFO, "device busy before sending; notice yielded");
            return DeliveryOutcome::Yielded;
        }

        if self.cancel.is_cancelled() {
            return DeliveryOutcome::Yielded;
        }
        self.state.enter(DeliveryPhase::Sending);
        self.send().await;
        if !self.pause(self.settings.post_send_pause).await {
            return DeliveryOutcome::Yielded;
        }

        self.state.enter(DeliveryPhase::WaitingForDeviceIdle);
        if self.wait_for_idle().await {
            DeliveryOutcome::Delivered
        } else if self.cancel.is_cancelled() {
            DeliveryOutcome::Yielded
        } else {
            event!(Level::WARN, "device did not go idle in time");
            DeliveryOutcome::TimedOut
        }
    }

    async fn send(&self) {
        let Some(query) = control_query(&self.notice.parameter, &self.notice.message) else {
            return;
        };
        if !self.switches.is_live() {
            event!(Level::INFO, query = %query, "output off; control request skipped");
            return;
        }
        match self.announcer.control(&self.notice.address, &query).await {
            Ok(body) => event!(Level::DEBUG, body = %body, "control request sent"),
            Err(err) => event!(Level::WARN, error = %err, "control request failed"),
        }
    }

    /// Polls until the device reports idle. False on timeout or cancellation.
    async fn wait_for_idle(&self) -> bool {
        if !self.pause(self.settings.settle_delay).await {
            return false;
        }
        if !self.switches.is_live() {
            return true;
        }

        let deadline = Instant::now() + self.settings.completion_timeout;
        loop {
            match timeout_at(deadline, self.announcer.is_idle(&self.notice.address)).await {
                Ok(Ok(true)) => return true,
                Ok(Ok(false)) => {}
                Ok(Err(err)) => {
                    event!(Level::WARN, error = %err, "status poll failed; polling again");
                }
                Err(_) => return false,
            }
            if Instant::now() + self.settings.poll_interval >= deadline {
                return false;
            }
            if !self.pause(self.settings.poll_interval).await {
                return false;
            }
        }
    }

    /// Sleeps unless cancelled first; false when cancelled.
    async fn pause(&self, duration: Duration) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if duration.is_zero() {
            return true;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = sleep(duration) => true,
        }
    }
}
