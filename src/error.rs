use std::io;
use std::str::Utf8Error;
use std::time::Duration;
use thiserror::Error;
use btleplug;
use btleplug::api::BDAddr;
use serde_json;
use uuid::Uuid;

use crate::device::types::{Generation, PowerState};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },

    #[error("Config value {field} is out of range: {reason}")]
    OutOfRange { field: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Config file problem: {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Lighthouse command failed: {source}")]
    DeviceError { #[from] source: DeviceError },

    #[error("Failed to start the tokio runtime: {source}")]
    Runtime { source: io::Error },
}

/// Failures reported by a [`crate::transport::Transport`] implementation.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("No usable bluetooth adapter")]
    Unavailable,

    #[error("Device {address} has not been seen by the adapter")]
    DeviceNotFound { address: BDAddr },

    #[error("Device does not expose characteristic {uuid}")]
    MissingCharacteristic { uuid: Uuid },

    #[error("Transport operation timed out")]
    Timeout,

    #[error("Link to the device was lost")]
    Disconnected,

    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },
}

impl TransportError {
    /// Errors that say something about the link rather than about the device's capabilities.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Timeout | TransportError::Disconnected | TransportError::DeviceNotFound { .. } => true,
            TransportError::Btle { source } => !matches!(
                source,
                btleplug::Error::PermissionDenied | btleplug::Error::NotSupported(_)
            ),
            TransportError::Unavailable | TransportError::MissingCharacteristic { .. } => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("{generation} lighthouses do not support the {state} power state")]
    UnsupportedState { generation: Generation, state: PowerState },

    #[error("{generation} lighthouses do not support {operation}")]
    UnsupportedOperation { generation: Generation, operation: &'static str },

    #[error("Malformed response from device: {reason}")]
    MalformedResponse { reason: String },

    #[error("Expected a {expected} lighthouse but the device speaks the {found} protocol")]
    ProtocolMismatch { expected: Generation, found: Generation },

    #[error("Could not connect to {address} after {attempts} attempts")]
    ConnectionFailed { address: BDAddr, attempts: u32 },

    #[error("Command to {address} got no response within {timeout:?}")]
    CommandTimeout { address: BDAddr, timeout: Duration },

    #[error("The bluetooth adapter is missing or disabled")]
    TransportUnavailable,

    #[error("V1 lighthouses need a pair id to accept power commands")]
    MissingPairId,

    #[error("Lost the link to {address} while running a command")]
    LinkLost { address: BDAddr },

    #[error("No lighthouse with address {address} is known")]
    UnknownDevice { address: BDAddr },

    #[error("The operation was cancelled")]
    Cancelled,

    #[error("Error communicating with device: {source}")]
    Transport { source: TransportError },
}

impl From<TransportError> for DeviceError {
    fn from(source: TransportError) -> Self {
        match source {
            TransportError::Unavailable => DeviceError::TransportUnavailable,
            source => DeviceError::Transport { source },
        }
    }
}

impl DeviceError {
    /// True for the single root cause that takes every device down at once.
    pub fn is_transport_fault(&self) -> bool {
        matches!(self, DeviceError::TransportUnavailable)
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        DeviceError::MalformedResponse { reason: reason.into() }
    }
}
