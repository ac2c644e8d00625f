use crate::error::RefreshError;
use crate::state::RawDeviceState;

/// Fan-out from a coordinator to its subscribers, in completion order.
#[derive(Clone, Debug)]
pub enum SyncEvent {
    Updated(RawDeviceState),
    UpdateFailed(RefreshError),
}

/// What an MQTT command asks a mower to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MowerAction {
    Start,
    Pause,
    Dock,
    Refresh,
}

impl MowerAction {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        match std::str::from_utf8(payload).ok()?.trim().to_lowercase().as_str() {
            "start" | "start_mowing" => Some(MowerAction::Start),
            "pause" => Some(MowerAction::Pause),
            "dock" | "return_to_dock" => Some(MowerAction::Dock),
            "refresh" => Some(MowerAction::Refresh),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MowerRequest {
    /// Sanitized device name taken from the command topic.
    pub device: String,
    pub action: MowerAction,
}
