use serde_derive::Serialize;

use crate::activity::{ActivityState, derive_activity};
use crate::coordinator::Coordinator;
use crate::error::CommandError;
use crate::state::{CommandName, RawDeviceState, WorkMode};

/// User-facing view of one mower: tracks the displayed activity and turns
/// start/pause/dock into device commands.
pub struct LawnMower {
    coordinator: Coordinator,
    activity: ActivityState,
}

#[derive(Debug, Clone, Serialize)]
pub struct MowerStatus {
    pub name: String,
    pub activity: ActivityState,
    pub mode: Option<WorkMode>,
    pub charge_state: Option<u32>,
    pub consecutive_failures: u32,
}

impl LawnMower {
    pub fn new(coordinator: Coordinator) -> Self {
        let activity = coordinator
            .last_state()
            .map(|state| derive_activity(&state, ActivityState::Unknown))
            .unwrap_or_default();
        LawnMower {
            coordinator,
            activity,
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Activity for the latest known state, falling back to the last one shown.
    pub fn activity(&self) -> ActivityState {
        match self.coordinator.last_state() {
            Some(state) => derive_activity(&state, self.activity),
            None => self.activity,
        }
    }

    /// Called for every successful coordinator update.
    pub fn handle_update(&mut self, state: &RawDeviceState) -> ActivityState {
        self.activity = derive_activity(state, self.activity);
        self.activity
    }

    pub fn status(&self) -> MowerStatus {
        let runtime = self.coordinator.runtime();
        let last_state = runtime.last_state.as_ref();
        MowerStatus {
            name: self.coordinator.device().name.clone(),
            activity: self.activity(),
            mode: last_state.map(|s| s.mode),
            charge_state: last_state.map(|s| s.charge_state),
            consecutive_failures: runtime.consecutive_failures,
        }
    }

    /// Resumes a paused job, otherwise starts a new one.
    pub async fn start_mowing(&self) -> Result<(), CommandError> {
        let command = match self.coordinator.last_state() {
            Some(state) if state.mode == WorkMode::Pause => CommandName::ResumeExecuteTask,
            _ => CommandName::StartWorkJob,
        };
        self.coordinator.execute(command).await
    }

    pub async fn dock(&self) -> Result<(), CommandError> {
        self.coordinator.execute(CommandName::ReturnToDock).await
    }

    pub async fn pause(&self) -> Result<(), CommandError> {
        self.coordinator.execute(CommandName::PauseExecuteTask).await
    }
}
