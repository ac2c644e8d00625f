//! Per-device sync coordinator.
//!
//! A [`Coordinator`] owns the session to one mower and the bookkeeping around
//! it. Refreshes are serialized: a request that arrives while one is running
//! joins it instead of issuing a second transport call. Results are applied
//! and fanned out to subscribers while the session is still held, so
//! subscribers see them in completion order.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::FutureExt as _;
use futures::future::{BoxFuture, Shared};
use log::{debug, info, warn};
use tokio::sync::broadcast;

use crate::error::{CommandError, RefreshError, SessionError, SetupError};
use crate::messages::SyncEvent;
use crate::session::{Connector, DeviceSession};
use crate::state::{CommandName, DeviceRef, RawDeviceState};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

const EVENT_CAPACITY: usize = 16;

type RefreshResult = Result<RawDeviceState, RefreshError>;
type InFlight = Shared<BoxFuture<'static, RefreshResult>>;

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorOptions {
    /// Bound applied to every transport call.
    pub timeout: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        CoordinatorOptions {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Mutable per-device bookkeeping. Only written by the refresh that currently
/// holds the session.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorRuntime {
    pub last_state: Option<RawDeviceState>,
    pub consecutive_failures: u32,
    pub last_success: Option<Instant>,
    pub refresh_in_flight: bool,
}

/// Cheap cloneable handle; all clones drive the same device.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    device: DeviceRef,
    connector: Arc<dyn Connector>,
    timeout: Duration,
    session: tokio::sync::Mutex<Option<Box<dyn DeviceSession>>>,
    runtime: Mutex<CoordinatorRuntime>,
    in_flight: Mutex<Option<InFlight>>,
    closing: AtomicBool,
    events: broadcast::Sender<SyncEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn bounded<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, SessionError>>,
) -> Result<T, SessionError> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(SessionError::Timeout),
    }
}

fn sync_failed(device: &DeviceRef, source: SessionError) -> SetupError {
    SetupError::SessionSyncFailed {
        device: device.to_string(),
        source,
    }
}

impl Coordinator {
    /// Finds the device, opens a session and fetches the first report.
    /// Polling must not start unless this succeeds.
    pub async fn setup(
        device: DeviceRef,
        connector: Arc<dyn Connector>,
        options: CoordinatorOptions,
    ) -> Result<Self, SetupError> {
        let timeout = options.timeout;

        match bounded(timeout, connector.locate(&device)).await {
            Ok(true) => {}
            Ok(false) | Err(SessionError::NotFound(_)) => {
                return Err(SetupError::DeviceNotFound(device.to_string()));
            }
            Err(source) => return Err(sync_failed(&device, source)),
        }

        let mut session = match bounded(timeout, connector.connect(&device)).await {
            Ok(session) => session,
            Err(SessionError::NotFound(_)) => {
                return Err(SetupError::DeviceNotFound(device.to_string()));
            }
            Err(source) => return Err(sync_failed(&device, source)),
        };

        let initial = match bounded(timeout, session.send_command(CommandName::GetReportCfg)).await
        {
            Ok(()) => session.current_state().ok_or_else(|| {
                SessionError::FieldMissing("device report".to_string())
            }),
            Err(err) => Err(err),
        };
        let initial = match initial {
            Ok(state) => state,
            Err(source) => {
                if let Err(err) = bounded(timeout, session.close()).await {
                    debug!("Closing session to {} failed: {}", device, err);
                }
                return Err(sync_failed(&device, source));
            }
        };

        info!("Set up mower {}", device);
        debug!("Initial mower data: {:?}", initial);

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let runtime = CoordinatorRuntime {
            last_state: Some(initial),
            last_success: Some(Instant::now()),
            ..Default::default()
        };

        Ok(Coordinator {
            inner: Arc::new(Inner {
                device,
                connector,
                timeout,
                session: tokio::sync::Mutex::new(Some(session)),
                runtime: Mutex::new(runtime),
                in_flight: Mutex::new(None),
                closing: AtomicBool::new(false),
                events,
            }),
        })
    }

    pub fn device(&self) -> &DeviceRef {
        &self.inner.device
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn last_state(&self) -> Option<RawDeviceState> {
        lock(&self.inner.runtime).last_state.clone()
    }

    pub fn runtime(&self) -> CoordinatorRuntime {
        lock(&self.inner.runtime).clone()
    }

    /// Fetches a fresh report. Joins the refresh already running, if any.
    /// Must be called from within a tokio runtime.
    pub async fn refresh(&self) -> Result<RawDeviceState, RefreshError> {
        let pending = {
            let mut slot = lock(&self.inner.in_flight);
            match slot.as_ref() {
                Some(pending) => {
                    debug!("Refresh of {} already in flight", self.inner.device.name);
                    pending.clone()
                }
                None => {
                    // completes even if every waiter is dropped
                    lock(&self.inner.runtime).refresh_in_flight = true;
                    let inner = Arc::clone(&self.inner);
                    let task = tokio::spawn(async move {
                        let result = inner.run_refresh().await;
                        lock(&inner.runtime).refresh_in_flight = false;
                        lock(&inner.in_flight).take();
                        result
                    });
                    let pending = task
                        .map(|joined| {
                            joined.unwrap_or_else(|err| {
                                Err(RefreshError::LinkError(format!("refresh task failed: {err}")))
                            })
                        })
                        .boxed()
                        .shared();
                    *slot = Some(pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    /// Sends one command to the device. Does not refresh.
    pub async fn execute(&self, command: CommandName) -> Result<(), CommandError> {
        let failed = |reason: String| CommandError::CommandFailed { command, reason };

        if self.inner.closing.load(Ordering::Acquire) {
            return Err(failed("coordinator is shut down".to_string()));
        }
        let mut session = self.inner.session.lock().await;
        let session = session
            .as_deref_mut()
            .ok_or_else(|| failed("session closed".to_string()))?;

        bounded(self.inner.timeout, session.send_command(command))
            .await
            .map_err(|err| failed(err.to_string()))?;
        info!("Sent {} to {}", command, self.inner.device.name);
        Ok(())
    }

    /// Stops accepting work, lets a running refresh finish and closes the
    /// session.
    pub async fn shutdown(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        let pending = lock(&self.inner.in_flight).clone();
        if let Some(pending) = pending {
            let _ = pending.await;
        }

        let mut session = self.inner.session.lock().await;
        if let Some(mut session) = session.take() {
            if let Err(err) = bounded(self.inner.timeout, session.close()).await {
                warn!("Closing session to {} failed: {}", self.inner.device, err);
            }
        }
        info!("Stopped syncing mower {}", self.inner.device);
    }
}

impl Inner {
    async fn run_refresh(&self) -> RefreshResult {
        let mut session = self.session.lock().await;
        if self.closing.load(Ordering::Acquire) {
            return Err(RefreshError::ShutDown);
        }
        let Some(session) = session.as_deref_mut() else {
            return Err(RefreshError::ShutDown);
        };

        let result = self.fetch(session).await;

        let mut runtime = lock(&self.runtime);
        match result {
            Ok(state) => {
                runtime.consecutive_failures = 0;
                runtime.last_state = Some(state.clone());
                runtime.last_success = Some(Instant::now());
                debug!("Updated mower {}", self.device.name);
                debug!("Mower data: {:?}", state);
                self.publish(SyncEvent::Updated(state.clone()));
                Ok(state)
            }
            Err(err) => {
                runtime.consecutive_failures = runtime.consecutive_failures.saturating_add(1);
                warn!(
                    "Updating mower {} failed ({}): {} [{} consecutive]",
                    self.device.name,
                    err.kind(),
                    err,
                    runtime.consecutive_failures
                );
                self.publish(SyncEvent::UpdateFailed(err.clone()));
                Err(err)
            }
        }
    }

    async fn fetch(&self, session: &mut dyn DeviceSession) -> RefreshResult {
        let timeout = self.timeout;

        match bounded(timeout, self.connector.locate(&self.device)).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(RefreshError::DeviceUnreachable(format!(
                    "could not find {}",
                    self.device
                )));
            }
            Err(err) => return Err(RefreshError::from_session(err, timeout)),
        }

        bounded(timeout, session.send_command(CommandName::GetReportCfg))
            .await
            .map_err(|err| RefreshError::from_session(err, timeout))?;

        session
            .current_state()
            .ok_or_else(|| RefreshError::ProtocolFieldMissing("device report".to_string()))
    }

    fn publish(&self, event: SyncEvent) {
        if self.events.send(event).is_err() {
            debug!("No subscribers for {}", self.device.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConnector, Reply};
    use crate::state::WorkMode;

    fn device() -> DeviceRef {
        DeviceRef::new("Luba-VS1234", "AA:BB:CC:DD:EE:FF".parse().unwrap())
    }

    async fn ready(mock: &MockConnector, initial: RawDeviceState) -> Coordinator {
        mock.queue(Reply::Report(initial));
        Coordinator::setup(device(), Arc::new(mock.clone()), CoordinatorOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_setup_fetches_initial_state() {
        let mock = MockConnector::new();
        let coordinator = ready(&mock, RawDeviceState::new(WorkMode::Ready, 1)).await;

        let runtime = coordinator.runtime();
        assert_eq!(runtime.last_state, Some(RawDeviceState::new(WorkMode::Ready, 1)));
        assert_eq!(runtime.consecutive_failures, 0);
        assert!(runtime.last_success.is_some());
        assert!(!runtime.refresh_in_flight);
        assert_eq!(mock.report_calls(), 1);
    }

    #[tokio::test]
    async fn test_setup_unreachable_device() {
        let mock = MockConnector::new();
        mock.set_hidden(true);
        let result =
            Coordinator::setup(device(), Arc::new(mock.clone()), CoordinatorOptions::default())
                .await;
        assert!(matches!(result, Err(SetupError::DeviceNotFound(_))));
        assert_eq!(mock.report_calls(), 0);
    }

    #[tokio::test]
    async fn test_setup_connect_failure() {
        let mock = MockConnector::new();
        mock.fail_connect(SessionError::Link("pairing refused".to_string()));
        let result =
            Coordinator::setup(device(), Arc::new(mock.clone()), CoordinatorOptions::default())
                .await;
        assert!(matches!(
            result,
            Err(SetupError::SessionSyncFailed {
                source: SessionError::Link(_),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_setup_initial_fetch_failure_closes_session() {
        let mock = MockConnector::new();
        mock.queue(Reply::Fail(SessionError::FieldMissing("dev".to_string())));
        let result =
            Coordinator::setup(device(), Arc::new(mock.clone()), CoordinatorOptions::default())
                .await;
        assert!(matches!(result, Err(SetupError::SessionSyncFailed { .. })));
        assert!(mock.is_closed());
    }

    #[tokio::test]
    async fn test_refresh_updates_and_notifies() {
        let mock = MockConnector::new();
        let coordinator = ready(&mock, RawDeviceState::new(WorkMode::Ready, 1)).await;
        let mut events = coordinator.subscribe();

        mock.queue(Reply::Report(RawDeviceState::new(WorkMode::Working, 0)));
        let state = coordinator.refresh().await.unwrap();
        assert_eq!(state.mode, WorkMode::Working);
        assert_eq!(coordinator.last_state(), Some(state.clone()));

        match events.recv().await.unwrap() {
            SyncEvent::Updated(update) => assert_eq!(update, state),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failures_then_success_resets_counter() {
        let mock = MockConnector::new();
        let initial = RawDeviceState::new(WorkMode::Ready, 1);
        let coordinator = ready(&mock, initial.clone()).await;

        mock.queue(Reply::Fail(SessionError::Link("reset".to_string())));
        mock.queue(Reply::Fail(SessionError::FieldMissing("dev".to_string())));
        mock.queue(Reply::Fail(SessionError::NotFound("gone".to_string())));
        assert!(matches!(coordinator.refresh().await, Err(RefreshError::LinkError(_))));
        assert!(matches!(
            coordinator.refresh().await,
            Err(RefreshError::ProtocolFieldMissing(_))
        ));
        assert!(matches!(
            coordinator.refresh().await,
            Err(RefreshError::DeviceUnreachable(_))
        ));

        let runtime = coordinator.runtime();
        assert_eq!(runtime.consecutive_failures, 3);
        assert_eq!(runtime.last_state, Some(initial));

        let fresh = RawDeviceState::new(WorkMode::Pause, 0);
        mock.queue(Reply::Report(fresh.clone()));
        coordinator.refresh().await.unwrap();

        let runtime = coordinator.runtime();
        assert_eq!(runtime.consecutive_failures, 0);
        assert_eq!(runtime.last_state, Some(fresh));
    }

    #[tokio::test]
    async fn test_hidden_device_is_unreachable() {
        let mock = MockConnector::new();
        let coordinator = ready(&mock, RawDeviceState::new(WorkMode::Ready, 1)).await;

        mock.set_hidden(true);
        let err = coordinator.refresh().await.unwrap_err();
        assert_eq!(err.kind(), "device_unreachable");
        // never asked the device for a report
        assert_eq!(mock.report_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_one_failure() {
        let mock = MockConnector::new();
        let initial = RawDeviceState::new(WorkMode::Working, 0);
        let coordinator = ready(&mock, initial.clone()).await;
        let mut events = coordinator.subscribe();

        mock.queue(Reply::Hang);
        let err = coordinator.refresh().await.unwrap_err();
        assert_eq!(err, RefreshError::Timeout(DEFAULT_TIMEOUT));

        let runtime = coordinator.runtime();
        assert_eq!(runtime.consecutive_failures, 1);
        assert_eq!(runtime.last_state, Some(initial));
        assert!(matches!(
            events.recv().await.unwrap(),
            SyncEvent::UpdateFailed(RefreshError::Timeout(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refreshes_coalesce() {
        let mock = MockConnector::new();
        let coordinator = ready(&mock, RawDeviceState::new(WorkMode::Ready, 1)).await;

        let fresh = RawDeviceState::new(WorkMode::Working, 0);
        mock.queue(Reply::Delayed(Duration::from_secs(5), fresh.clone()));
        let (first, second) = tokio::join!(coordinator.refresh(), coordinator.refresh());

        assert_eq!(first.unwrap(), fresh);
        assert_eq!(second.unwrap(), fresh);
        assert_eq!(mock.report_calls(), 2);

        // once finished, the next request goes to the device again
        mock.queue(Reply::Report(RawDeviceState::new(WorkMode::Returning, 0)));
        coordinator.refresh().await.unwrap();
        assert_eq!(mock.report_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_failing_refreshes_coalesce() {
        let mock = MockConnector::new();
        let initial = RawDeviceState::new(WorkMode::Ready, 1);
        let coordinator = ready(&mock, initial.clone()).await;

        mock.queue(Reply::DelayedFail(
            Duration::from_secs(5),
            SessionError::Link("connection reset".to_string()),
        ));
        let (first, second) = tokio::join!(coordinator.refresh(), coordinator.refresh());

        let expected = Err(RefreshError::LinkError("connection reset".to_string()));
        assert_eq!(first, expected);
        assert_eq!(second, expected);
        assert_eq!(mock.report_calls(), 2);

        let runtime = coordinator.runtime();
        assert_eq!(runtime.consecutive_failures, 1);
        assert_eq!(runtime.last_state, Some(initial));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_refresh_does_not_block_commands() {
        let mock = MockConnector::new();
        let coordinator = ready(&mock, RawDeviceState::new(WorkMode::Ready, 1)).await;

        let fresh = RawDeviceState::new(WorkMode::Working, 0);
        mock.queue(Reply::Delayed(Duration::from_secs(5), fresh.clone()));
        let abandoned =
            tokio::time::timeout(Duration::from_secs(1), coordinator.refresh()).await;
        assert!(abandoned.is_err());

        let docked = tokio::time::timeout(
            Duration::from_secs(300),
            coordinator.execute(CommandName::ReturnToDock),
        )
        .await;
        assert!(matches!(docked, Ok(Ok(()))));
        assert_eq!(mock.commands(), vec![CommandName::ReturnToDock]);

        let runtime = coordinator.runtime();
        assert!(!runtime.refresh_in_flight);
        assert_eq!(runtime.last_state, Some(fresh));
        assert_eq!(mock.report_calls(), 2);
    }

    #[tokio::test]
    async fn test_setup_locate_not_found() {
        let mock = MockConnector::new();
        mock.fail_locate(SessionError::NotFound("no such peripheral".to_string()));
        let result =
            Coordinator::setup(device(), Arc::new(mock.clone()), CoordinatorOptions::default())
                .await;
        assert!(matches!(result, Err(SetupError::DeviceNotFound(_))));
    }

    #[tokio::test]
    async fn test_events_follow_completion_order() {
        let mock = MockConnector::new();
        let coordinator = ready(&mock, RawDeviceState::new(WorkMode::Ready, 1)).await;
        let mut events = coordinator.subscribe();

        mock.queue(Reply::Report(RawDeviceState::new(WorkMode::Working, 0)));
        mock.queue(Reply::Fail(SessionError::Link("reset".to_string())));
        mock.queue(Reply::Report(RawDeviceState::new(WorkMode::Returning, 0)));
        for _ in 0..3 {
            let _ = coordinator.refresh().await;
        }

        assert!(matches!(events.recv().await.unwrap(), SyncEvent::Updated(s) if s.mode == WorkMode::Working));
        assert!(matches!(events.recv().await.unwrap(), SyncEvent::UpdateFailed(_)));
        assert!(matches!(events.recv().await.unwrap(), SyncEvent::Updated(s) if s.mode == WorkMode::Returning));
    }

    #[tokio::test]
    async fn test_shutdown_closes_session_and_rejects_work() {
        let mock = MockConnector::new();
        let coordinator = ready(&mock, RawDeviceState::new(WorkMode::Ready, 1)).await;

        coordinator.shutdown().await;
        assert!(mock.is_closed());

        assert_eq!(coordinator.refresh().await, Err(RefreshError::ShutDown));
        assert_eq!(coordinator.runtime().consecutive_failures, 0);
        assert!(coordinator.execute(CommandName::ReturnToDock).await.is_err());
        assert!(mock.commands().is_empty());

        // second call is a no-op
        coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_running_refresh() {
        let mock = MockConnector::new();
        let coordinator = ready(&mock, RawDeviceState::new(WorkMode::Ready, 1)).await;

        let fresh = RawDeviceState::new(WorkMode::Working, 0);
        mock.queue(Reply::Delayed(Duration::from_secs(5), fresh.clone()));
        let refreshing = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh().await }
        });
        while mock.report_calls() < 2 {
            tokio::task::yield_now().await;
        }

        coordinator.shutdown().await;
        assert_eq!(refreshing.await.unwrap(), Ok(fresh.clone()));
        assert_eq!(coordinator.last_state(), Some(fresh));
        assert!(mock.is_closed());
    }
}
