use serde_json::json;

use crate::error::SessionError;
use crate::state::{CommandName, RawDeviceState};

/// Turns commands into frames for the write characteristic and report
/// notifications back into device state.
pub trait FrameCodec: Send + Sync {
    fn encode(&self, command: CommandName) -> Vec<u8>;

    fn decode_report(&self, frame: &[u8]) -> Result<RawDeviceState, SessionError>;
}

/// JSON frames: `{"command": "<name>"}` out, a flat report object in.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonFrameCodec;

impl FrameCodec for JsonFrameCodec {
    fn encode(&self, command: CommandName) -> Vec<u8> {
        json!({ "command": command.as_str() }).to_string().into_bytes()
    }

    fn decode_report(&self, frame: &[u8]) -> Result<RawDeviceState, SessionError> {
        serde_json::from_slice(frame).map_err(|err| match err.classify() {
            serde_json::error::Category::Data => SessionError::FieldMissing(err.to_string()),
            _ => SessionError::Link(format!("malformed report: {err}")),
        })
    }
}
