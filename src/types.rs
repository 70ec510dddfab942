//! Enumerations and event types produced and consumed by the hub driver.

use std::fmt;

use serde::Serialize;

use crate::device::DeviceType;

// ── Hub variant ──────────────────────────────────────────────────────────────

/// Which family member a discovered peripheral is.
///
/// Fixed at discovery time.  Picks the port-name map, the wire protocol
/// (legacy WeDo 2.0 vs LPF2) and a few decoder quirks.
///
/// | Variant | Code | Manufacturer id | Protocol |
/// |---|---|---|---|
/// | `Unknown` | 0 | | |
/// | `WeDo2SmartHub` | 1 | (service match) | WeDo 2.0 |
/// | `MoveHub` | 2 | 64 | LPF2 |
/// | `Hub` | 3 | 65 | LPF2 |
/// | `RemoteControl` | 4 | 66 | LPF2 |
/// | `DuploTrainBase` | 5 | 32 | LPF2 |
/// | `TechnicMediumHub` | 6 | 128 | LPF2 |
/// | `Mario` | 7 | 67 | LPF2 |
/// | `TechnicSmallHub` | 8 | 131 | LPF2 |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HubVariant {
    Unknown,
    WeDo2SmartHub,
    MoveHub,
    Hub,
    RemoteControl,
    DuploTrainBase,
    TechnicMediumHub,
    Mario,
    TechnicSmallHub,
}

impl HubVariant {
    /// Numeric hub type code.
    pub fn code(self) -> u8 {
        match self {
            HubVariant::Unknown => 0,
            HubVariant::WeDo2SmartHub => 1,
            HubVariant::MoveHub => 2,
            HubVariant::Hub => 3,
            HubVariant::RemoteControl => 4,
            HubVariant::DuploTrainBase => 5,
            HubVariant::TechnicMediumHub => 6,
            HubVariant::Mario => 7,
            HubVariant::TechnicSmallHub => 8,
        }
    }

    /// `true` for the legacy WeDo 2.0 protocol, whose payloads put values
    /// two bytes earlier than LPF2 and which uses per-purpose characteristics.
    pub fn is_wedo2(self) -> bool {
        self == HubVariant::WeDo2SmartHub
    }
}

impl fmt::Display for HubVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HubVariant::Unknown => "Unknown",
            HubVariant::WeDo2SmartHub => "WeDo 2.0 Smart Hub",
            HubVariant::MoveHub => "Move Hub",
            HubVariant::Hub => "Hub",
            HubVariant::RemoteControl => "Remote Control",
            HubVariant::DuploTrainBase => "Duplo Train Base",
            HubVariant::TechnicMediumHub => "Technic Medium Hub",
            HubVariant::Mario => "Mario",
            HubVariant::TechnicSmallHub => "Technic Small Hub",
        };
        f.write_str(name)
    }
}

// ── Connection state ─────────────────────────────────────────────────────────

/// Connection lifecycle of a hub or of an attached device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

// ── Colors ───────────────────────────────────────────────────────────────────

/// LED and sensor color palette.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum Color {
    Black = 0,
    Pink = 1,
    Purple = 2,
    Blue = 3,
    LightBlue = 4,
    Cyan = 5,
    Green = 6,
    Yellow = 7,
    Orange = 8,
    Red = 9,
    White = 10,
    None = 255,
}

impl Color {
    pub fn from_code(code: u8) -> Option<Color> {
        Some(match code {
            0 => Color::Black,
            1 => Color::Pink,
            2 => Color::Purple,
            3 => Color::Blue,
            4 => Color::LightBlue,
            5 => Color::Cyan,
            6 => Color::Green,
            7 => Color::Yellow,
            8 => Color::Orange,
            9 => Color::Red,
            10 => Color::White,
            255 => Color::None,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

// ── Buttons ──────────────────────────────────────────────────────────────────

/// Hub button and remote-control button states.
///
/// Codes outside the known set are kept as [`ButtonState::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ButtonState {
    Released,
    Up,
    Pressed,
    Stop,
    Down,
    Other(u8),
}

impl ButtonState {
    pub fn from_code(code: u8) -> ButtonState {
        match code {
            0 => ButtonState::Released,
            1 => ButtonState::Up,
            2 => ButtonState::Pressed,
            127 => ButtonState::Stop,
            255 => ButtonState::Down,
            other => ButtonState::Other(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            ButtonState::Released => 0,
            ButtonState::Up => 1,
            ButtonState::Pressed => 2,
            ButtonState::Stop => 127,
            ButtonState::Down => 255,
            ButtonState::Other(code) => code,
        }
    }
}

// ── Motor settings ───────────────────────────────────────────────────────────

/// What a tacho motor does once a timed or positioned move completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum BrakingStyle {
    Float,
    Hold,
    #[default]
    Brake,
}

impl BrakingStyle {
    pub fn code(self) -> u8 {
        match self {
            BrakingStyle::Float => 0,
            BrakingStyle::Hold => 126,
            BrakingStyle::Brake => 127,
        }
    }
}

/// Built-in sounds of the Duplo train base speaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DuploTrainBaseSound {
    Brake,
    StationDeparture,
    WaterRefill,
    Horn,
    Steam,
}

impl DuploTrainBaseSound {
    pub fn code(self) -> u8 {
        match self {
            DuploTrainBaseSound::Brake => 3,
            DuploTrainBaseSound::StationDeparture => 5,
            DuploTrainBaseSound::WaterRefill => 7,
            DuploTrainBaseSound::Horn => 9,
            DuploTrainBaseSound::Steam => 10,
        }
    }
}

/// Output of a Power Functions IR receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PfOutput {
    Red,
    Blue,
}

// ── Device events ────────────────────────────────────────────────────────────

/// A decoded sensor reading or device lifecycle notification.
///
/// Every variant has a stable event name (see [`DeviceEvent::name`]) which
/// doubles as the key of the device's mode table: listening for `"tilt"`
/// subscribes the device to the mode that produces `Tilt` readings.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum DeviceEvent {
    Color { color: Color },
    /// Millimetres.
    Distance { distance: i32 },
    DistanceCount { count: u32 },
    Reflect { reflect: u8 },
    Ambient { ambient: u8 },
    RgbIntensity { red: u16, green: u16, blue: u16 },
    ColorAndDistance { color: Color, distance: i32 },
    /// Degrees.  `z` is only reported by three-axis tilt sensors.
    Tilt { x: i32, y: i32, z: Option<i32> },
    ImpactCount { count: u32 },
    /// mG on LPF2 hubs, raw bytes on Mario.
    Accel { x: i32, y: i32, z: i32 },
    /// Degrees per second.
    Gyro { x: i32, y: i32, z: i32 },
    /// Milliamps (LPF2) or amps (WeDo 2.0).
    Current { current: f64 },
    /// Volts.
    Voltage { voltage: f64 },
    Rotate { degrees: i32 },
    Absolute { angle: i32 },
    /// Newtons.
    Force { force: f64 },
    Touched { touched: bool },
    Tapped { tapped: u8 },
    FastDistance { distance: u16 },
    Intensity { intensity: u8 },
    Rgb { red: u16, green: u16, blue: u16 },
    Speed { speed: i16 },
    RemoteButton { state: ButtonState },
    /// Exactly one of `barcode` or `color` is set.
    Barcode { barcode: Option<u16>, color: Option<u16> },
    Gesture { gesture: u8 },
    Pants { pants: u8 },
    /// Raw passthrough for device types without a dedicated decoder.
    Receive { message: Vec<u8> },
    /// The device left its port.
    Detach,
}

impl DeviceEvent {
    /// The event name this reading is published under.
    pub fn name(&self) -> &'static str {
        match self {
            DeviceEvent::Color { .. } => "color",
            DeviceEvent::Distance { .. } => "distance",
            DeviceEvent::DistanceCount { .. } => "distanceCount",
            DeviceEvent::Reflect { .. } => "reflect",
            DeviceEvent::Ambient { .. } => "ambient",
            DeviceEvent::RgbIntensity { .. } => "rgbIntensity",
            DeviceEvent::ColorAndDistance { .. } => "colorAndDistance",
            DeviceEvent::Tilt { .. } => "tilt",
            DeviceEvent::ImpactCount { .. } => "impactCount",
            DeviceEvent::Accel { .. } => "accel",
            DeviceEvent::Gyro { .. } => "gyro",
            DeviceEvent::Current { .. } => "current",
            DeviceEvent::Voltage { .. } => "voltage",
            DeviceEvent::Rotate { .. } => "rotate",
            DeviceEvent::Absolute { .. } => "absolute",
            DeviceEvent::Force { .. } => "force",
            DeviceEvent::Touched { .. } => "touched",
            DeviceEvent::Tapped { .. } => "tapped",
            DeviceEvent::FastDistance { .. } => "fastDistance",
            DeviceEvent::Intensity { .. } => "intensity",
            DeviceEvent::Rgb { .. } => "rgb",
            DeviceEvent::Speed { .. } => "speed",
            DeviceEvent::RemoteButton { .. } => "remoteButton",
            DeviceEvent::Barcode { .. } => "barcode",
            DeviceEvent::Gesture { .. } => "gesture",
            DeviceEvent::Pants { .. } => "pants",
            DeviceEvent::Receive { .. } => "receive",
            DeviceEvent::Detach => "detach",
        }
    }
}

// ── Hub events ───────────────────────────────────────────────────────────────

/// Identity of an attached device as reported in attach/detach events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub port_id: u8,
    pub port_name: Option<String>,
    pub device_type: DeviceType,
    pub is_virtual: bool,
}

/// Events published on a hub.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum HubEvent {
    Connect,
    Disconnect,
    Attach(DeviceInfo),
    Detach(DeviceInfo),
    Button { state: ButtonState },
    Rssi { rssi: i8 },
    BatteryLevel { level: u8 },
    /// A device reading re-published hub-wide, tagged with its origin.
    Device {
        port_id: u8,
        port_name: Option<String>,
        reading: DeviceEvent,
    },
}

impl HubEvent {
    /// The event name this hub event is published under.
    pub fn name(&self) -> &'static str {
        match self {
            HubEvent::Connect => "connect",
            HubEvent::Disconnect => "disconnect",
            HubEvent::Attach(_) => "attach",
            HubEvent::Detach(_) => "detach",
            HubEvent::Button { .. } => "button",
            HubEvent::Rssi { .. } => "rssi",
            HubEvent::BatteryLevel { .. } => "batteryLevel",
            HubEvent::Device { reading, .. } => reading.name(),
        }
    }
}
