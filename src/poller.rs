use std::time::Duration;

use log::debug;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::coordinator::Coordinator;
use crate::error::RefreshError;
use crate::state::RawDeviceState;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Periodic refresh timer for one device.
pub struct PollHandle {
    coordinator: Coordinator,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

/// Refreshes the coordinator every `period`. The first tick fires one period
/// from now since setup already fetched once.
pub fn spawn_polling(coordinator: Coordinator, period: Duration) -> PollHandle {
    let (stop, mut stopped) = oneshot::channel();
    let task = tokio::spawn({
        let coordinator = coordinator.clone();
        async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticks.tick() => {
                        // failures are logged and published by the coordinator
                        if let Err(RefreshError::ShutDown) = coordinator.refresh().await {
                            break;
                        }
                    }
                }
            }
            debug!("Polling stopped for {}", coordinator.device().name);
        }
    });

    PollHandle {
        coordinator,
        stop: Some(stop),
        task,
    }
}

impl PollHandle {
    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Out-of-schedule refresh. Joins one already running.
    pub async fn request_refresh(&self) -> Result<RawDeviceState, RefreshError> {
        self.coordinator.refresh().await
    }

    /// Stops the timer and tears the coordinator down.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = self.task.await;
        self.coordinator.shutdown().await;
    }
}
