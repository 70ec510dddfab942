//! GATT UUIDs, wire constants and frame encoders for LPF2 and WeDo 2.0 hubs.
//!
//! LPF2 hubs (everything except the WeDo 2.0 Smart Hub) multiplex the whole
//! protocol over one characteristic, [`LPF2_ALL_CHARACTERISTIC`].  Every
//! frame there is length-prefixed:
//!
//! ```text
//! byte 0 : total frame length, including this byte
//! byte 1 : hub id (always 0x00)
//! byte 2 : message type (see [`message_type`])
//! byte 3…: type-specific payload
//! ```
//!
//! The WeDo 2.0 hub predates LPF2 and spreads its protocol over one
//! characteristic per purpose in the `0000XXXX-1212-efde-1523-785feabcd123`
//! namespace.

use uuid::Uuid;

use crate::types::HubVariant;

// ── Services ─────────────────────────────────────────────────────────────────

/// Primary service advertised by WeDo 2.0 Smart Hubs.
pub const WEDO2_SMART_HUB_SERVICE: Uuid =
    Uuid::from_u128(0x00001523_1212_efde_1523_785feabcd123);

/// Secondary WeDo 2.0 service carrying the input/output characteristics.
pub const WEDO2_SMART_HUB_2_SERVICE: Uuid =
    Uuid::from_u128(0x00004f0e_1212_efde_1523_785feabcd123);

/// Service advertised by every LPF2 hub.
pub const LPF2_HUB_SERVICE: Uuid = Uuid::from_u128(0x00001623_1212_efde_1623_785feabcd123);

/// Standard GATT battery service (`0x180f`).
pub const BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);

/// Standard GATT device information service (`0x180a`).
pub const DEVICE_INFORMATION_SERVICE: Uuid =
    Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);

// ── Characteristics ──────────────────────────────────────────────────────────

/// The single bidirectional LPF2 characteristic.
pub const LPF2_ALL_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x00001624_1212_efde_1623_785feabcd123);

pub const WEDO2_NAME_ID: Uuid = Uuid::from_u128(0x00001524_1212_efde_1523_785feabcd123);
pub const WEDO2_BUTTON: Uuid = Uuid::from_u128(0x00001526_1212_efde_1523_785feabcd123);
/// Attach/detach notifications.
pub const WEDO2_PORT_TYPE: Uuid = Uuid::from_u128(0x00001527_1212_efde_1523_785feabcd123);
pub const WEDO2_LOW_VOLTAGE_ALERT: Uuid = Uuid::from_u128(0x00001528_1212_efde_1523_785feabcd123);
pub const WEDO2_HIGH_CURRENT_ALERT: Uuid =
    Uuid::from_u128(0x00001529_1212_efde_1523_785feabcd123);
pub const WEDO2_LOW_SIGNAL_ALERT: Uuid = Uuid::from_u128(0x0000152a_1212_efde_1523_785feabcd123);
/// Writing `[0x00]` switches the hub off.
pub const WEDO2_DISCONNECT: Uuid = Uuid::from_u128(0x0000152b_1212_efde_1523_785feabcd123);
pub const WEDO2_SENSOR_VALUE: Uuid = Uuid::from_u128(0x00001560_1212_efde_1523_785feabcd123);
pub const WEDO2_VALUE_FORMAT: Uuid = Uuid::from_u128(0x00001561_1212_efde_1523_785feabcd123);
/// Input format (subscription) commands.
pub const WEDO2_PORT_TYPE_WRITE: Uuid = Uuid::from_u128(0x00001563_1212_efde_1523_785feabcd123);
/// Output commands.
pub const WEDO2_MOTOR_VALUE_WRITE: Uuid =
    Uuid::from_u128(0x00001565_1212_efde_1523_785feabcd123);

/// Standard battery level characteristic (`0x2a19`).
pub const BATTERY_LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

/// Standard firmware revision string characteristic (`0x2a26`).
pub const FIRMWARE_REVISION: Uuid = Uuid::from_u128(0x00002a26_0000_1000_8000_00805f9b34fb);

// ── Advertisement ────────────────────────────────────────────────────────────

/// Index of the hub-type byte in raw manufacturer data (company id included).
pub const MANUFACTURER_DATA_HUB_TYPE_INDEX: usize = 3;

/// Hub-type bytes found at [`MANUFACTURER_DATA_HUB_TYPE_INDEX`].
pub mod manufacturer_id {
    pub const DUPLO_TRAIN_BASE: u8 = 32;
    pub const MOVE_HUB: u8 = 64;
    pub const HUB: u8 = 65;
    pub const REMOTE_CONTROL: u8 = 66;
    pub const MARIO: u8 = 67;
    pub const TECHNIC_MEDIUM_HUB: u8 = 128;
    pub const TECHNIC_SMALL_HUB: u8 = 131;
}

// ── Message vocabulary ───────────────────────────────────────────────────────

/// LPF2 message type codes (byte 2 of every frame).
pub mod message_type {
    pub const HUB_PROPERTIES: u8 = 0x01;
    pub const HUB_ACTIONS: u8 = 0x02;
    pub const HUB_ALERTS: u8 = 0x03;
    pub const HUB_ATTACHED_IO: u8 = 0x04;
    pub const GENERIC_ERROR: u8 = 0x05;
    pub const PORT_INFORMATION_REQUEST: u8 = 0x21;
    pub const PORT_MODE_INFORMATION_REQUEST: u8 = 0x22;
    pub const PORT_INPUT_FORMAT_SETUP_SINGLE: u8 = 0x41;
    pub const PORT_INFORMATION: u8 = 0x43;
    pub const PORT_MODE_INFORMATION: u8 = 0x44;
    pub const PORT_VALUE_SINGLE: u8 = 0x45;
    pub const PORT_VALUE_COMBINED: u8 = 0x46;
    pub const PORT_INPUT_FORMAT_SINGLE: u8 = 0x47;
    pub const VIRTUAL_PORT_SETUP: u8 = 0x61;
    pub const PORT_OUTPUT_COMMAND: u8 = 0x81;
    pub const PORT_OUTPUT_COMMAND_FEEDBACK: u8 = 0x82;
}

/// Hub property ids (byte 3 of `HUB_PROPERTIES`).
pub mod hub_property {
    pub const ADVERTISING_NAME: u8 = 0x01;
    pub const BUTTON_STATE: u8 = 0x02;
    pub const FW_VERSION: u8 = 0x03;
    pub const HW_VERSION: u8 = 0x04;
    pub const RSSI: u8 = 0x05;
    pub const BATTERY_VOLTAGE: u8 = 0x06;
    pub const PRIMARY_MAC_ADDRESS: u8 = 0x0d;
}

/// Operations on a hub property (byte 4 of `HUB_PROPERTIES`).
pub mod property_operation {
    pub const SET: u8 = 0x01;
    pub const ENABLE_UPDATES: u8 = 0x02;
    pub const DISABLE_UPDATES: u8 = 0x03;
    pub const RESET: u8 = 0x04;
    pub const REQUEST_UPDATE: u8 = 0x05;
    pub const UPDATE_UPSTREAM: u8 = 0x06;
}

/// Sub-events of `HUB_ATTACHED_IO` (byte 4).
pub mod attach_event {
    pub const DETACHED: u8 = 0x00;
    pub const ATTACHED: u8 = 0x01;
    pub const ATTACHED_VIRTUAL: u8 = 0x02;
}

/// Kinds of `PORT_INFORMATION_REQUEST`.
pub mod port_information {
    pub const VALUE: u8 = 0x00;
    pub const MODE_INFO: u8 = 0x01;
    pub const MODE_COMBINATIONS: u8 = 0x02;
}

/// Kinds of `PORT_MODE_INFORMATION_REQUEST`.
pub mod mode_information {
    pub const NAME: u8 = 0x00;
    pub const RAW: u8 = 0x01;
    pub const PCT: u8 = 0x02;
    pub const SI: u8 = 0x03;
    pub const SYMBOL: u8 = 0x04;
    pub const VALUE_FORMAT: u8 = 0x80;

    /// Every kind requested when port diagnostics are enabled.
    pub const ALL: [u8; 6] = [NAME, RAW, PCT, SI, SYMBOL, VALUE_FORMAT];
}

/// Output sub-commands carried after `[0x81, port, 0x11]`.
pub mod output_subcommand {
    pub const SET_ACC_TIME: u8 = 0x05;
    pub const SET_DEC_TIME: u8 = 0x06;
    pub const START_SPEED: u8 = 0x07;
    pub const START_SPEED_SYNCHRONIZED: u8 = 0x08;
    pub const START_SPEED_FOR_TIME: u8 = 0x09;
    pub const START_SPEED_FOR_TIME_SYNCHRONIZED: u8 = 0x0a;
    pub const START_SPEED_FOR_DEGREES: u8 = 0x0b;
    pub const START_SPEED_FOR_DEGREES_SYNCHRONIZED: u8 = 0x0c;
    pub const GOTO_ABSOLUTE_POSITION: u8 = 0x0d;
    pub const GOTO_ABSOLUTE_POSITION_SYNCHRONIZED: u8 = 0x0e;
    pub const WRITE_DIRECT_MODE_DATA: u8 = 0x51;
}

/// "Execute immediately, request command feedback".
pub const STARTUP_AND_COMPLETION: u8 = 0x11;

/// Longest name a hub accepts.
pub const MAX_HUB_NAME_LEN: usize = 14;

// ── Outbound messages ────────────────────────────────────────────────────────

/// A ready-to-write byte message and the characteristic it goes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub characteristic: Uuid,
    pub payload: Vec<u8>,
}

impl Outbound {
    /// Frame an LPF2 message body for [`LPF2_ALL_CHARACTERISTIC`].
    pub fn lpf2(body: &[u8]) -> Self {
        Self {
            characteristic: LPF2_ALL_CHARACTERISTIC,
            payload: frame(body),
        }
    }

    /// A WeDo 2.0 message written verbatim to `characteristic`.
    pub fn raw(characteristic: Uuid, payload: Vec<u8>) -> Self {
        Self {
            characteristic,
            payload,
        }
    }
}

/// Prefix `body` with the two-byte LPF2 header.
///
/// Byte 0 is the total frame length, so it can only be filled in once the
/// frame is assembled:
///
/// ```
/// # use poweredup_rs::protocol::frame;
/// assert_eq!(frame(&[0x02, 0x01]), vec![0x04, 0x00, 0x02, 0x01]);
/// ```
pub fn frame(body: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(body.len() + 2);
    bytes.extend_from_slice(&[0x00, 0x00]);
    bytes.extend_from_slice(body);
    bytes[0] = bytes.len() as u8;
    bytes
}

// ── Command encoders ─────────────────────────────────────────────────────────

/// Write raw mode data to the device on `port_id`.
///
/// LPF2: `[len, 0x00, 0x81, port, 0x11, 0x51, mode, …data]` on the LPF2
/// characteristic.  WeDo 2.0: `[len, 0x00, port, 0x01, 0x02, …data]` on the
/// motor value characteristic; the legacy protocol has no mode byte.
pub fn write_direct(variant: HubVariant, port_id: u8, mode: u8, data: &[u8]) -> Outbound {
    if variant.is_wedo2() {
        let mut body = vec![port_id, 0x01, 0x02];
        body.extend_from_slice(data);
        return Outbound::raw(WEDO2_MOTOR_VALUE_WRITE, frame(&body));
    }
    let mut body = vec![
        message_type::PORT_OUTPUT_COMMAND,
        port_id,
        STARTUP_AND_COMPLETION,
        output_subcommand::WRITE_DIRECT_MODE_DATA,
        mode,
    ];
    body.extend_from_slice(data);
    Outbound::lpf2(&body)
}

/// `[0x81, port, 0x11, …subcommand]`, the output command envelope used by
/// tacho and absolute motors.
pub fn output_command(port_id: u8, subcommand: &[u8]) -> Outbound {
    let mut body = vec![message_type::PORT_OUTPUT_COMMAND, port_id, STARTUP_AND_COMPLETION];
    body.extend_from_slice(subcommand);
    Outbound::lpf2(&body)
}

/// Enable or disable value notifications for `mode` on `port_id`.
///
/// WeDo 2.0 embeds the device type code and uses a fixed 11-byte layout.
pub fn port_input_format(
    variant: HubVariant,
    port_id: u8,
    device_type: u16,
    mode: u8,
    enable: bool,
) -> Outbound {
    let enable = u8::from(enable);
    if variant.is_wedo2() {
        return Outbound::raw(
            WEDO2_PORT_TYPE_WRITE,
            vec![
                0x01,
                0x02,
                port_id,
                device_type as u8,
                mode,
                0x01,
                0x00,
                0x00,
                0x00,
                0x00,
                enable,
            ],
        );
    }
    Outbound::lpf2(&[
        message_type::PORT_INPUT_FORMAT_SETUP_SINGLE,
        port_id,
        mode,
        0x01,
        0x00,
        0x00,
        0x00,
        enable,
    ])
}

/// Ask the hub to report a property once.
pub fn request_hub_property(property: u8) -> Outbound {
    Outbound::lpf2(&[
        message_type::HUB_PROPERTIES,
        property,
        property_operation::REQUEST_UPDATE,
    ])
}

/// Ask the hub to push a property whenever it changes.
pub fn enable_hub_property_reports(property: u8) -> Outbound {
    Outbound::lpf2(&[
        message_type::HUB_PROPERTIES,
        property,
        property_operation::ENABLE_UPDATES,
    ])
}

/// Switch the hub off.
pub fn shutdown(variant: HubVariant) -> Outbound {
    if variant.is_wedo2() {
        Outbound::raw(WEDO2_DISCONNECT, vec![0x00])
    } else {
        Outbound::lpf2(&[message_type::HUB_ACTIONS, 0x01])
    }
}

/// Rename the hub.  The caller validates the length.
pub fn set_hub_name(variant: HubVariant, name: &str) -> Outbound {
    if variant.is_wedo2() {
        return Outbound::raw(WEDO2_NAME_ID, name.as_bytes().to_vec());
    }
    let mut body = vec![
        message_type::HUB_PROPERTIES,
        hub_property::ADVERTISING_NAME,
        property_operation::SET,
    ];
    body.extend_from_slice(name.as_bytes());
    Outbound::lpf2(&body)
}

/// Combine two attached ports into one virtual port.
pub fn create_virtual_port(first_port_id: u8, second_port_id: u8) -> Outbound {
    Outbound::lpf2(&[
        message_type::VIRTUAL_PORT_SETUP,
        0x01,
        first_port_id,
        second_port_id,
    ])
}

/// `PORT_INFORMATION_REQUEST` of the given kind (see [`port_information`]).
pub fn port_information_request(port_id: u8, kind: u8) -> Outbound {
    Outbound::lpf2(&[message_type::PORT_INFORMATION_REQUEST, port_id, kind])
}

pub fn mode_information_request(port_id: u8, mode: u8, kind: u8) -> Outbound {
    Outbound::lpf2(&[
        message_type::PORT_MODE_INFORMATION_REQUEST,
        port_id,
        mode,
        kind,
    ])
}
