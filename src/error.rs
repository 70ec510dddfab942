//! Error type shared by every fallible operation in the crate.
//!
//! Decode-level problems never surface here: malformed or unmodelled bytes
//! arriving from a hub are logged and dropped.  Errors are reserved for
//! things a caller asked for and did not get.

use thiserror::Error;

use crate::types::HubVariant;

/// Main error type for hub operations.
#[derive(Error, Debug)]
pub enum Error {
    // ── Discovery ─────────────────────────────────────────────────────────────
    /// Advertisement data matched no known hub variant.
    #[error("Unrecognized peripheral: advertisement matches no known hub type")]
    UnrecognizedPeripheral,

    // ── Transport ─────────────────────────────────────────────────────────────
    /// The BLE binding reported a failure (connect, discover, read, write).
    #[error("Transport error: {0}")]
    Transport(String),

    /// A GATT service or characteristic the protocol relies on is missing.
    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(uuid::Uuid),

    /// Operation requires a connected hub.
    #[error("Hub is not connected")]
    NotConnected,

    #[error("Already connecting")]
    AlreadyConnecting,

    #[error("Already connected")]
    AlreadyConnected,

    // ── Timing ────────────────────────────────────────────────────────────────
    /// A bounded wait expired.
    #[error("waitFor timed out after {elapsed_ms}ms")]
    Timeout {
        /// Time spent polling before giving up.
        elapsed_ms: u64,
    },

    // ── Protocol inconsistency ────────────────────────────────────────────────
    /// Manual attach found a different device type already on the port.
    #[error(
        "Already a different type of device attached to portId {port_id}. \
         Only use this method when you are certain what's attached."
    )]
    PortTypeConflict {
        /// The occupied port.
        port_id: u8,
    },

    /// No port of that name exists on this hub.
    #[error("Port {0} does not exist on this hub")]
    UnknownPort(String),

    /// No device is attached to the requested port.
    #[error("No device attached to port {0}")]
    NoDevice(String),

    /// The device a handle pointed at has been detached or replaced.
    #[error("Device is not connected")]
    DeviceDetached,

    /// A virtual port needs two attached ports carrying the same device type.
    #[error("Cannot create virtual port: {0}")]
    VirtualPort(String),

    // ── Capability ────────────────────────────────────────────────────────────
    /// The device kind or hub variant cannot perform the command.
    #[error("{0}")]
    Unsupported(String),

    /// An argument fell outside what the hub accepts.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Hub firmware is older than the minimum the protocol supports.
    #[error(
        "Your {variant} firmware version ({found}) is outdated, please update to \
         {required} using the official LEGO app"
    )]
    FirmwareOutdated {
        variant: HubVariant,
        found: String,
        required: String,
    },
}

impl Error {
    /// Returns true for bounded waits that expired.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Returns true for disagreements between caller expectations and the
    /// state reported by the hub.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Error::PortTypeConflict { .. }
                | Error::UnknownPort(_)
                | Error::NoDevice(_)
                | Error::DeviceDetached
                | Error::VirtualPort(_)
        )
    }

    /// Returns true when the failure came from the BLE link.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::CharacteristicNotFound(_) | Error::NotConnected
        )
    }
}

#[cfg(feature = "ble")]
impl From<btleplug::Error> for Error {
    fn from(err: btleplug::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

/// Result type alias for hub operations.
pub type Result<T> = std::result::Result<T, Error>;
