use std::io;
use std::str::Utf8Error;
use thiserror::Error;
use btleplug;
use serde_json;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to determine path to the chat client's log; pass --log-path")]
    NoLogPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("No bluetooth adapter available")]
    NoAdapter,

    #[error("Unknown device {id}")]
    UnknownDevice { id: String },

    #[error("Characteristic {uuid} is not available")]
    MissingCharacteristic { uuid: uuid::Uuid },

    /// A GATT status code. btleplug reports failures without the ATT status, so the btleplug
    /// transport never produces this; transports that see raw ATT errors do.
    #[error("GATT protocol error {code:#04x}")]
    Protocol { code: u8 },

    #[error("Link to device is closed")]
    Closed,
}

impl TransportError {
    pub fn protocol_code(&self) -> Option<u8> {
        match self {
            TransportError::Protocol { code } => Some(*code),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("No peripheral named {name:?} was found")]
    DeviceNotFound { name: String },

    #[error("Timed out connecting to the peripheral")]
    ConnectTimeout,

    #[error("Link dropped during stabilization check {check}")]
    UnstableLink { check: u32 },

    #[error("Service discovery failed (protocol error: {code:?}): {reason}")]
    ServiceDiscoveryFailed { code: Option<u8>, reason: String },

    #[error("Peripheral exposes no usable writable characteristic")]
    NoWritableEndpoint,

    #[error("Connecting was cancelled")]
    Cancelled,

    #[error("Failed to connect: {source}")]
    Transport { #[from] source: TransportError },
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("Not connected to the peripheral")]
    NotConnected,

    #[error("Failed to write to the command characteristic: {source}")]
    SendFailed { #[from] source: TransportError },

    #[error("Writing to the command characteristic took too long")]
    WriteTimeout,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconnectError {
    #[error("Gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Reconnecting was cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start (bluetooth): {source}")]
    Transport { #[from] source: TransportError },

    #[error("Failed to establish the initial link: {source}")]
    InitialConnect { #[from] source: ConnectError },

    #[error("Failed to start (runtime): {source}")]
    Runtime { source: io::Error },
}
