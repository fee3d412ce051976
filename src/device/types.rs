use std::time::SystemTime;
use btleplug::api::BDAddr;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Generation {
    /// HTC Vive base station 1.0
    V1,
    /// Valve Index base station 2.0
    V2,
    Unknown,
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let result = match self {
            Generation::V1 => "V1",
            Generation::V2 => "V2",
            Generation::Unknown => "unknown",
        };

        write!(f, "{}", result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    Standby,
    Sleep,
    Unknown,
}

impl PowerState {
    pub fn is_known(&self) -> bool {
        *self != PowerState::Unknown
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let result = match self {
            PowerState::On => "on",
            PowerState::Standby => "standby",
            PowerState::Sleep => "sleep",
            PowerState::Unknown => "unknown",
        };

        write!(f, "{}", result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Retrying,
    Failed,
}

/// One observation of a lighthouse advertisement. A newer observation replaces the
/// descriptor instead of updating it.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDescriptor {
    pub address: BDAddr,
    pub generation: Generation,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub last_seen: SystemTime,
}

/// Metadata decoded from a single attribute read. Every field the generation's
/// layout carries is present; fields the layout does not carry are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeReport {
    pub firmware: Option<String>,
    pub model: Option<String>,
    pub hardware: Option<String>,
    pub manufacturer: Option<String>,
    pub channel: Option<u32>,
    pub power_code: Option<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceAttributes {
    pub firmware: Option<String>,
    pub model: Option<String>,
    pub hardware: Option<String>,
    pub manufacturer: Option<String>,
    pub channel: Option<u32>,
    pub pair_id: Option<u32>,
    pub power_state: PowerState,
    pub power_code: Option<u8>,
    pub last_refresh: Option<SystemTime>,
    pub stale: bool,
}

impl DeviceAttributes {
    pub fn new(pair_id: Option<u32>) -> Self {
        DeviceAttributes {
            firmware: None,
            model: None,
            hardware: None,
            manufacturer: None,
            channel: None,
            pair_id,
            power_state: PowerState::Unknown,
            power_code: None,
            last_refresh: None,
            stale: false,
        }
    }

    /// Pair ids are shown the way they are printed on the back of a V1 lighthouse.
    pub fn pair_id_label(&self) -> Option<String> {
        self.pair_id.map(|pair_id| format!("0x{:08X}", pair_id))
    }
}

impl Default for DeviceAttributes {
    fn default() -> Self {
        DeviceAttributes::new(None)
    }
}
