use std::time::Duration;
use btleplug::api::BDAddr;
use serde::{Deserialize, Serialize};

use crate::device::constants::{
    BACKOFF_BASE, COMMAND_TIMEOUT, CONNECTION_TIMEOUT, EXTENDED_COOLDOWN, EXTENDED_COOLDOWN_AFTER, FAILURE_COOLDOWN,
    IDLE_DISCONNECT, INFO_INTERVAL, MAX_CONCURRENT_CONNECTS, POWER_STATE_INTERVAL, RETRY_COUNT, SCAN_INTERVAL,
    UNAVAILABLE_THRESHOLD,
};
use crate::device::types::{DeviceDescriptor, Generation};
use crate::error::ConfigError;

/// Durations are written the humantime way: "500ms", "10s", "30m".
mod duration_format {
    use std::time::Duration;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let value = String::deserialize(deserializer)?;
        humantime::parse_duration(&value).map_err(D::Error::custom)
    }
}

/// Addresses are written as "AA:BB:CC:DD:EE:FF".
mod address_format {
    use std::str::FromStr;
    use btleplug::api::BDAddr;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(address: &BDAddr, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&address.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BDAddr, D::Error> {
        let value = String::deserialize(deserializer)?;
        BDAddr::from_str(&value).map_err(|err| D::Error::custom(format!("invalid address {:?}: {}", value, err)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    #[serde(with = "address_format")]
    pub address: BDAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Overrides the generation guessed from the advertisement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<Generation>,
    /// Required to switch V1 lighthouses, printed on the back of the device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pair_id: Option<u32>,
}

impl DeviceConfig {
    pub fn new(address: BDAddr) -> Self {
        DeviceConfig { address, name: None, generation: None, pair_id: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionConfig {
    #[serde(with = "duration_format")]
    pub connection_timeout: Duration,
    #[serde(with = "duration_format")]
    pub command_timeout: Duration,
    pub retry_count: u32,
    #[serde(with = "duration_format")]
    pub backoff_base: Duration,
    #[serde(with = "duration_format")]
    pub idle_disconnect: Duration,
    pub max_concurrent_connects: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            connection_timeout: Duration::from_millis(CONNECTION_TIMEOUT),
            command_timeout: Duration::from_millis(COMMAND_TIMEOUT),
            retry_count: RETRY_COUNT,
            backoff_base: Duration::from_millis(BACKOFF_BASE),
            idle_disconnect: Duration::from_millis(IDLE_DISCONNECT),
            max_concurrent_connects: MAX_CONCURRENT_CONNECTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PollConfig {
    #[serde(with = "duration_format")]
    pub power_state_interval: Duration,
    #[serde(with = "duration_format")]
    pub info_interval: Duration,
    pub unavailable_threshold: u32,
    #[serde(with = "duration_format")]
    pub scan_interval: Duration,
    #[serde(with = "duration_format")]
    pub failure_cooldown: Duration,
    #[serde(with = "duration_format")]
    pub extended_cooldown: Duration,
    pub extended_cooldown_after: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            power_state_interval: Duration::from_millis(POWER_STATE_INTERVAL),
            info_interval: Duration::from_millis(INFO_INTERVAL),
            unavailable_threshold: UNAVAILABLE_THRESHOLD,
            scan_interval: Duration::from_millis(SCAN_INTERVAL),
            failure_cooldown: Duration::from_millis(FAILURE_COOLDOWN),
            extended_cooldown: Duration::from_millis(EXTENDED_COOLDOWN),
            extended_cooldown_after: EXTENDED_COOLDOWN_AFTER,
        }
    }
}

impl PollConfig {
    /// How long to wait before the next poll of a device whose last `failures` polls
    /// failed in a row. Never shorter than the power state interval.
    pub fn poll_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return self.power_state_interval;
        }

        let cooldown = if failures >= self.extended_cooldown_after {
            self.extended_cooldown
        } else {
            self.failure_cooldown.saturating_mul(1u32 << (failures - 1).min(16)).min(self.extended_cooldown)
        };
        cooldown.max(self.power_state_interval)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Replaces the built-in name prefixes when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovery_prefix: Option<String>,
    pub devices: Vec<DeviceConfig>,
    pub connection: ConnectionConfig,
    pub polling: PollConfig,
}

fn check(field: &'static str, ok: bool, reason: &str) -> Result<(), ConfigError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange { field, reason: reason.to_string() })
    }
}

impl Config {
    /// Range checks only; whether the values make sense for a given setup is up to the user.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let connection = &self.connection;
        let polling = &self.polling;

        check("connection.retryCount", (1..=10).contains(&connection.retry_count), "must be between 1 and 10")?;
        check("connection.connectionTimeout", !connection.connection_timeout.is_zero(), "must not be zero")?;
        check("connection.commandTimeout", !connection.command_timeout.is_zero(), "must not be zero")?;
        check("connection.idleDisconnect", !connection.idle_disconnect.is_zero(), "must not be zero")?;
        check("connection.maxConcurrentConnects", connection.max_concurrent_connects >= 1, "must be at least 1")?;
        check("polling.powerStateInterval", !polling.power_state_interval.is_zero(), "must not be zero")?;
        check("polling.infoInterval", !polling.info_interval.is_zero(), "must not be zero")?;
        check("polling.scanInterval", !polling.scan_interval.is_zero(), "must not be zero")?;
        check("polling.unavailableThreshold", polling.unavailable_threshold >= 1, "must be at least 1")?;
        check("polling.extendedCooldownAfter", polling.extended_cooldown_after >= 1, "must be at least 1")?;
        check(
            "polling.extendedCooldown",
            polling.extended_cooldown >= polling.failure_cooldown,
            "must not be shorter than polling.failureCooldown",
        )?;
        check(
            "connection.idleDisconnect",
            connection.idle_disconnect < polling.power_state_interval,
            "must be shorter than polling.powerStateInterval, otherwise polling never releases the link",
        )?;

        if let Some(prefix) = &self.discovery_prefix {
            check("discoveryPrefix", !prefix.is_empty(), "must not be empty")?;
        }

        for (index, device) in self.devices.iter().enumerate() {
            let duplicate = self.devices[..index].iter().any(|other| other.address == device.address);
            check("devices", !duplicate, &format!("{} is listed more than once", device.address))?;
        }

        Ok(())
    }

    pub fn device(&self, address: BDAddr) -> Option<&DeviceConfig> {
        self.devices.iter().find(|device| device.address == address)
    }

    /// Remembers a discovered lighthouse. Returns false if it was already configured.
    pub fn add_discovered(&mut self, descriptor: &DeviceDescriptor) -> bool {
        if self.device(descriptor.address).is_some() {
            return false;
        }

        self.devices.push(DeviceConfig {
            address: descriptor.address,
            name: descriptor.name.clone(),
            generation: match descriptor.generation {
                Generation::Unknown => None,
                generation => Some(generation),
            },
            pair_id: None,
        });
        true
    }
}
