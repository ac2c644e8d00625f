//! Boundary to the transport that actually talks to the mower.
//!
//! A [`Connector`] finds devices and opens sessions; a [`DeviceSession`] is one
//! open connection. The coordinator owns exactly one session per device and
//! never shares it.

use async_trait::async_trait;

use crate::error::SessionError;
use crate::state::{CommandName, DeviceRef, RawDeviceState};

#[async_trait]
pub trait Connector: Send + Sync {
    /// Whether the device is currently visible on the transport.
    async fn locate(&self, device: &DeviceRef) -> Result<bool, SessionError>;

    /// Open a session to the device.
    async fn connect(&self, device: &DeviceRef) -> Result<Box<dyn DeviceSession>, SessionError>;
}

#[async_trait]
pub trait DeviceSession: Send {
    /// Send a command and wait for the device to accept it. For
    /// [`CommandName::GetReportCfg`] this also waits for the report, so
    /// [`current_state`](Self::current_state) reflects it afterwards.
    async fn send_command(&mut self, command: CommandName) -> Result<(), SessionError>;

    /// Snapshot from the most recent successful report.
    fn current_state(&self) -> Option<RawDeviceState>;

    async fn close(&mut self) -> Result<(), SessionError>;
}
