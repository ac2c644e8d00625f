use std::time::Duration;

use thiserror::Error;

use crate::state::CommandName;

/// Failures reported by a device session or connector.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("device not found: {0}")]
    NotFound(String),

    #[error("link error: {0}")]
    Link(String),

    #[error("expected field missing: {0}")]
    FieldMissing(String),

    #[error("timed out")]
    Timeout,
}

impl From<btleplug::Error> for SessionError {
    fn from(err: btleplug::Error) -> Self {
        let message = err.to_string();
        match err {
            btleplug::Error::DeviceNotFound => SessionError::NotFound(message),
            btleplug::Error::TimedOut(_) => SessionError::Timeout,
            btleplug::Error::NoSuchCharacteristic => SessionError::FieldMissing(message),
            _ => SessionError::Link(message),
        }
    }
}

/// Setup failures. Either one blocks activation until setup is retried.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("could not find mower {0}")]
    DeviceNotFound(String),

    #[error("unable to sync with mower {device}")]
    SessionSyncFailed {
        device: String,
        #[source]
        source: SessionError,
    },
}

/// A failed refresh. Recoverable: the next tick tries again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
    #[error("device unreachable: {0}")]
    DeviceUnreachable(String),

    #[error("link error: {0}")]
    LinkError(String),

    #[error("protocol field missing: {0}")]
    ProtocolFieldMissing(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("coordinator is shut down")]
    ShutDown,
}

impl RefreshError {
    /// Stable name of the error kind, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            RefreshError::DeviceUnreachable(_) => "device_unreachable",
            RefreshError::LinkError(_) => "link_error",
            RefreshError::ProtocolFieldMissing(_) => "protocol_field_missing",
            RefreshError::Timeout(_) => "timeout",
            RefreshError::ShutDown => "shut_down",
        }
    }

    pub(crate) fn from_session(err: SessionError, timeout: Duration) -> Self {
        match err {
            SessionError::NotFound(msg) => RefreshError::DeviceUnreachable(msg),
            SessionError::Link(msg) => RefreshError::LinkError(msg),
            SessionError::FieldMissing(msg) => RefreshError::ProtocolFieldMissing(msg),
            SessionError::Timeout => RefreshError::Timeout(timeout),
        }
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command {command} failed: {reason}")]
    CommandFailed { command: CommandName, reason: String },
}
