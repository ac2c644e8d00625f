use std::fmt;

use mac_address::MacAddress;
use serde_derive::{Deserialize, Serialize};

/// One physical mower bound to this process: a display name plus its
/// Bluetooth address. Fixed once setup has been called with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRef {
    pub name: String,
    pub address: MacAddress,
}

impl DeviceRef {
    pub fn new(name: impl Into<String>, address: MacAddress) -> Self {
        DeviceRef {
            name: name.into(),
            address,
        }
    }
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// Operating mode as reported in the device's `sys_status` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum WorkMode {
    NotActive,
    Online,
    Offline,
    Disable,
    Initialization,
    Ready,
    Unconnected,
    Working,
    Returning,
    Charging,
    Updating,
    Lock,
    Pause,
    ManualMowing,
    UpdateSuccess,
    OtaUpgradeFail,
    JobDraw,
    ObstacleDraw,
    ChannelDraw,
    EraserDraw,
    EditBoundary,
    LocationError,
    BoundaryJump,
    ChargingPause,
    Other(u8),
}

impl From<u8> for WorkMode {
    fn from(code: u8) -> Self {
        match code {
            0 => WorkMode::NotActive,
            1 => WorkMode::Online,
            2 => WorkMode::Offline,
            8 => WorkMode::Disable,
            10 => WorkMode::Initialization,
            11 => WorkMode::Ready,
            12 => WorkMode::Unconnected,
            13 => WorkMode::Working,
            14 => WorkMode::Returning,
            15 => WorkMode::Charging,
            16 => WorkMode::Updating,
            17 => WorkMode::Lock,
            19 => WorkMode::Pause,
            20 => WorkMode::ManualMowing,
            22 => WorkMode::UpdateSuccess,
            23 => WorkMode::OtaUpgradeFail,
            31 => WorkMode::JobDraw,
            32 => WorkMode::ObstacleDraw,
            34 => WorkMode::ChannelDraw,
            35 => WorkMode::EraserDraw,
            36 => WorkMode::EditBoundary,
            37 => WorkMode::LocationError,
            38 => WorkMode::BoundaryJump,
            39 => WorkMode::ChargingPause,
            other => WorkMode::Other(other),
        }
    }
}

impl From<WorkMode> for u8 {
    fn from(mode: WorkMode) -> Self {
        match mode {
            WorkMode::NotActive => 0,
            WorkMode::Online => 1,
            WorkMode::Offline => 2,
            WorkMode::Disable => 8,
            WorkMode::Initialization => 10,
            WorkMode::Ready => 11,
            WorkMode::Unconnected => 12,
            WorkMode::Working => 13,
            WorkMode::Returning => 14,
            WorkMode::Charging => 15,
            WorkMode::Updating => 16,
            WorkMode::Lock => 17,
            WorkMode::Pause => 19,
            WorkMode::ManualMowing => 20,
            WorkMode::UpdateSuccess => 22,
            WorkMode::OtaUpgradeFail => 23,
            WorkMode::JobDraw => 31,
            WorkMode::ObstacleDraw => 32,
            WorkMode::ChannelDraw => 34,
            WorkMode::EraserDraw => 35,
            WorkMode::EditBoundary => 36,
            WorkMode::LocationError => 37,
            WorkMode::BoundaryJump => 38,
            WorkMode::ChargingPause => 39,
            WorkMode::Other(code) => code,
        }
    }
}

/// Last snapshot read from the device. Only a device session produces these;
/// fields other than mode and charge state are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDeviceState {
    #[serde(rename = "sys_status")]
    pub mode: WorkMode,
    /// Zero while undocked, non-zero while sitting on the charger.
    pub charge_state: u32,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RawDeviceState {
    pub fn new(mode: WorkMode, charge_state: u32) -> Self {
        RawDeviceState {
            mode,
            charge_state,
            extra: serde_json::Map::new(),
        }
    }
}

/// Commands understood by the device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandName {
    ResumeExecuteTask,
    StartWorkJob,
    ReturnToDock,
    PauseExecuteTask,
    GetReportCfg,
}

impl CommandName {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandName::ResumeExecuteTask => "resume_execute_task",
            CommandName::StartWorkJob => "start_work_job",
            CommandName::ReturnToDock => "return_to_dock",
            CommandName::PauseExecuteTask => "pause_execute_task",
            CommandName::GetReportCfg => "get_report_cfg",
        }
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
