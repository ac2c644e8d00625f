use std::time::Duration;

use mac_address::MacAddress;
use serde_derive::Deserialize;

use luba_sync::coordinator::{CoordinatorOptions, DEFAULT_TIMEOUT};
use luba_sync::poller::DEFAULT_INTERVAL;
use luba_sync::state::DeviceRef;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub devices: Option<Vec<MowerDevice>>,
    pub poll: Option<PollConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MowerDevice {
    pub address: MacAddress,
    pub name: String,
}

impl MowerDevice {
    pub fn device_ref(&self) -> DeviceRef {
        DeviceRef::new(self.name.clone(), self.address)
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct PollConfig {
    pub interval_seconds: Option<u64>,
    pub timeout_seconds: Option<u64>,
    pub setup_retry_seconds: Option<u64>,
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        match self.interval_seconds {
            Some(seconds) => Duration::from_secs(seconds.max(1)),
            None => DEFAULT_INTERVAL,
        }
    }

    pub fn setup_retry(&self) -> Duration {
        Duration::from_secs(self.setup_retry_seconds.unwrap_or(30))
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            timeout: match self.timeout_seconds {
                Some(seconds) => Duration::from_secs(seconds.max(1)),
                None => DEFAULT_TIMEOUT,
            },
        }
    }
}
