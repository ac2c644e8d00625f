//! Scriptable connector and session for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::SessionError;
use crate::session::{Connector, DeviceSession};
use crate::state::{CommandName, DeviceRef, RawDeviceState};

/// How the next `get_report_cfg` is answered.
pub enum Reply {
    Report(RawDeviceState),
    Delayed(Duration, RawDeviceState),
    DelayedFail(Duration, SessionError),
    Fail(SessionError),
    Hang,
}

#[derive(Default)]
struct MockInner {
    hidden: bool,
    fail_locate: Option<SessionError>,
    fail_connect: Option<SessionError>,
    fail_commands: bool,
    replies: VecDeque<Reply>,
    commands: Vec<CommandName>,
    report_calls: usize,
    state: Option<RawDeviceState>,
    closed: bool,
}

#[derive(Clone, Default)]
pub struct MockConnector {
    inner: Arc<Mutex<MockInner>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `locate` report the device as absent (or present again).
    pub fn set_hidden(&self, hidden: bool) {
        self.inner.lock().unwrap().hidden = hidden;
    }

    /// Makes the next `locate` fail with `error`.
    pub fn fail_locate(&self, error: SessionError) {
        self.inner.lock().unwrap().fail_locate = Some(error);
    }

    pub fn fail_connect(&self, error: SessionError) {
        self.inner.lock().unwrap().fail_connect = Some(error);
    }

    pub fn fail_commands(&self, fail: bool) {
        self.inner.lock().unwrap().fail_commands = fail;
    }

    pub fn queue(&self, reply: Reply) {
        self.inner.lock().unwrap().replies.push_back(reply);
    }

    /// Every command sent, excluding report requests.
    pub fn commands(&self) -> Vec<CommandName> {
        self.inner
            .lock()
            .unwrap()
            .commands
            .iter()
            .copied()
            .filter(|c| *c != CommandName::GetReportCfg)
            .collect()
    }

    pub fn report_calls(&self) -> usize {
        self.inner.lock().unwrap().report_calls
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn locate(&self, _device: &DeviceRef) -> Result<bool, SessionError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(error) = inner.fail_locate.take() {
            return Err(error);
        }
        Ok(!inner.hidden)
    }

    async fn connect(&self, device: &DeviceRef) -> Result<Box<dyn DeviceSession>, SessionError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.hidden {
            return Err(SessionError::NotFound(device.to_string()));
        }
        if let Some(error) = inner.fail_connect.take() {
            return Err(error);
        }
        Ok(Box::new(MockSession {
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MockSession {
    inner: Arc<Mutex<MockInner>>,
}

#[async_trait]
impl DeviceSession for MockSession {
    async fn send_command(&mut self, command: CommandName) -> Result<(), SessionError> {
        let reply = {
            let mut inner = self.inner.lock().unwrap();
            inner.commands.push(command);
            if command != CommandName::GetReportCfg {
                if inner.fail_commands {
                    return Err(SessionError::Link("write rejected".to_string()));
                }
                return Ok(());
            }
            inner.report_calls += 1;
            inner.replies.pop_front()
        };

        let state = match reply {
            None => return Ok(()),
            Some(Reply::Report(state)) => state,
            Some(Reply::Delayed(delay, state)) => {
                tokio::time::sleep(delay).await;
                state
            }
            Some(Reply::Fail(error)) => return Err(error),
            Some(Reply::DelayedFail(delay, error)) => {
                tokio::time::sleep(delay).await;
                return Err(error);
            }
            Some(Reply::Hang) => {
                futures::future::pending::<()>().await;
                return Err(SessionError::Timeout);
            }
        };
        self.inner.lock().unwrap().state = Some(state);
        Ok(())
    }

    fn current_state(&self) -> Option<RawDeviceState> {
        self.inner.lock().unwrap().state.clone()
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.inner.lock().unwrap().closed = true;
        Ok(())
    }
}
