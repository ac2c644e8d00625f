use serde_derive::Serialize;

use crate::state::{RawDeviceState, WorkMode};

/// What the mower is doing, as shown to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    Mowing,
    Paused,
    Docked,
    Error,
    #[default]
    Unknown,
}

/// Maps a raw snapshot to an activity. Rules are checked in order and the
/// first match wins; when nothing matches, `previous` is kept.
pub fn derive_activity(raw: &RawDeviceState, previous: ActivityState) -> ActivityState {
    match (raw.mode, raw.charge_state) {
        (WorkMode::Pause, _) => ActivityState::Paused,
        // idle off the dock
        (WorkMode::Ready, 0) => ActivityState::Paused,
        (WorkMode::Working | WorkMode::Returning, _) => ActivityState::Mowing,
        (WorkMode::Lock, _) => ActivityState::Error,
        (WorkMode::Ready, _) => ActivityState::Docked,
        _ => previous,
    }
}
