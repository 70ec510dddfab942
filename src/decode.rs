//! Sensor value decoders.
//!
//! [`decode`] is the single entry point: given the device type, its active
//! mode, the hub variant and a raw value report, it returns the semantic
//! reading or `None` when the report carries nothing usable.  Decoding never
//! fails loudly; short or out-of-range payloads simply produce no event.
//!
//! WeDo 2.0 value reports carry the payload two bytes earlier than LPF2
//! `PORT_VALUE_SINGLE` frames (`[len, 0x00, 0x45, port, …]`).  Decoders that
//! support both read at [`Offsets::at`].
//!
//! | Family | Modes |
//! |---|---|
//! | Tacho / absolute motors | `rotate` 2, `absolute` 3 |
//! | Current / voltage | `current` 0, `voltage` 0 |
//! | Color & distance | `color` 0 … `colorAndDistance` 8 |
//! | Tilt (WeDo, Move hub, Technic hub) | `tilt` 0, `impactCount` 1 |
//! | Technic hub IMU | `accel` 0, `gyro` 0 |
//! | Technic sensors | color, distance, force |
//! | Duplo train base | color sensor, speedometer |
//! | Remote, Mario | `remoteButton`, `accel`/`gesture`, `barcode`/`rgb`, `pants` |

use crate::device::DeviceType;
use crate::parse::{read_i16_le, read_i32_le, read_i8, read_u16_le, read_u32_le, read_u8};
use crate::types::{ButtonState, Color, DeviceEvent, HubVariant};
use crate::util::{normalize_angle, parse_color};

/// Byte offset selector for decoders shared by both protocol generations.
#[derive(Debug, Clone, Copy)]
struct Offsets {
    wedo2: bool,
}

impl Offsets {
    fn new(variant: HubVariant) -> Self {
        Self {
            wedo2: variant.is_wedo2(),
        }
    }

    /// Offset of the `n`th payload byte.
    fn at(self, n: usize) -> usize {
        if self.wedo2 {
            2 + n
        } else {
            4 + n
        }
    }
}

/// Decode a value report for `device_type` in `mode`.
pub fn decode(
    device_type: DeviceType,
    mode: Option<u8>,
    variant: HubVariant,
    message: &[u8],
) -> Option<DeviceEvent> {
    use DeviceType::*;

    let off = Offsets::new(variant);
    match device_type {
        MediumLinearMotor | MoveHubMediumLinearMotor => tacho_motor(mode?, off, message),
        TechnicLargeLinearMotor
        | TechnicXLargeLinearMotor
        | TechnicMediumAngularMotor
        | TechnicLargeAngularMotor
        | TechnicSmallAngularMotor
        | TechnicMediumAngularMotorGrey
        | TechnicLargeAngularMotorGrey => absolute_motor(mode?, off, message),
        CurrentSensor => current(mode?, variant, message),
        VoltageSensor => voltage(mode?, variant, message),
        ColorDistanceSensor => color_distance(mode?, off, message),
        TiltSensor => tilt(mode?, off, message),
        MoveHubTiltSensor => move_hub_tilt(mode?, message),
        TechnicMediumHubTiltSensor => technic_hub_tilt(mode?, message),
        TechnicMediumHubAccelerometer => accelerometer(mode?, message),
        TechnicMediumHubGyroSensor => gyro(mode?, message),
        MotionSensor => motion(mode?, off, message),
        TechnicColorSensor => technic_color(mode?, message),
        TechnicDistanceSensor => technic_distance(mode?, message),
        TechnicForceSensor => technic_force(mode?, off, message),
        DuploTrainBaseColorSensor => duplo_color(mode?, message),
        DuploTrainBaseSpeedometer => duplo_speed(mode?, message),
        RemoteControlButton | RemoteControlRssi => remote_button(mode?, message),
        MarioAccelerometer => mario_accel(mode?, message),
        MarioBarcodeSensor => mario_barcode(mode?, message),
        MarioPantsSensor => mario_pants(mode?, message),
        _ => Some(DeviceEvent::Receive {
            message: message.to_vec(),
        }),
    }
}

// ── Motors ───────────────────────────────────────────────────────────────────

fn tacho_motor(mode: u8, off: Offsets, msg: &[u8]) -> Option<DeviceEvent> {
    match mode {
        2 => Some(DeviceEvent::Rotate {
            degrees: read_i32_le(msg, off.at(0))?,
        }),
        _ => None,
    }
}

fn absolute_motor(mode: u8, off: Offsets, msg: &[u8]) -> Option<DeviceEvent> {
    match mode {
        3 => Some(DeviceEvent::Absolute {
            angle: normalize_angle(i32::from(read_i16_le(msg, off.at(0))?)),
        }),
        _ => tacho_motor(mode, off, msg),
    }
}

// ── Hub power sensors ────────────────────────────────────────────────────────

fn current(mode: u8, variant: HubVariant, msg: &[u8]) -> Option<DeviceEvent> {
    if mode != 0 {
        return None;
    }
    let current = if variant.is_wedo2() {
        f64::from(read_i16_le(msg, 2)?) / 1000.0
    } else {
        let max_value = match variant {
            HubVariant::TechnicMediumHub => 4175.0,
            _ => 2444.0,
        };
        let max_raw = 4095.0;
        f64::from(read_u16_le(msg, 4)?) * max_value / max_raw
    };
    Some(DeviceEvent::Current { current })
}

fn voltage(mode: u8, variant: HubVariant, msg: &[u8]) -> Option<DeviceEvent> {
    if mode != 0 {
        return None;
    }
    let voltage = if variant.is_wedo2() {
        f64::from(read_i16_le(msg, 2)?) / 40.0
    } else {
        let max_value = match variant {
            HubVariant::DuploTrainBase | HubVariant::RemoteControl => 6.4,
            _ => 9.615,
        };
        let max_raw = match variant {
            HubVariant::DuploTrainBase => 3047.0,
            HubVariant::RemoteControl => 3200.0,
            HubVariant::TechnicMediumHub => 4095.0,
            _ => 3893.0,
        };
        f64::from(read_u16_le(msg, 4)?) * max_value / max_raw
    };
    Some(DeviceEvent::Voltage { voltage })
}

// ── Color & distance ─────────────────────────────────────────────────────────

/// A palette color from a sensor byte, or `None` for "nothing detected".
fn sensor_color(raw: u8) -> Option<Color> {
    if raw <= 10 {
        Color::from_code(parse_color(raw))
    } else {
        None
    }
}

/// Inches-ish raw units to millimetres, clamped at 0.
fn raw_distance_mm(raw: u8) -> i32 {
    ((f64::from(raw) * 25.4).floor() as i32 - 20).max(0)
}

fn color_distance(mode: u8, off: Offsets, msg: &[u8]) -> Option<DeviceEvent> {
    if off.wedo2 && mode != 0 {
        return None;
    }
    match mode {
        0 => Some(DeviceEvent::Color {
            color: sensor_color(read_u8(msg, off.at(0))?)?,
        }),
        1 => {
            let raw = read_u8(msg, 4)?;
            (raw <= 10).then(|| DeviceEvent::Distance {
                distance: raw_distance_mm(raw),
            })
        }
        2 if msg.len() == 8 => Some(DeviceEvent::DistanceCount {
            count: read_u32_le(msg, 4)?,
        }),
        3 => Some(DeviceEvent::Reflect {
            reflect: read_u8(msg, 4)?,
        }),
        4 => Some(DeviceEvent::Ambient {
            ambient: read_u8(msg, 4)?,
        }),
        6 if msg.len() == 10 => Some(DeviceEvent::RgbIntensity {
            red: read_u16_le(msg, 4)?,
            green: read_u16_le(msg, 6)?,
            blue: read_u16_le(msg, 8)?,
        }),
        8 => {
            let color = read_u8(msg, 4)?;
            let mut distance = f64::from(read_u8(msg, 5)?);
            let partial = read_u8(msg, 7)?;
            if partial > 0 {
                distance += 1.0 / f64::from(partial);
            }
            if color > 10 {
                return None;
            }
            Some(DeviceEvent::ColorAndDistance {
                color: Color::from_code(color)?,
                distance: (distance * 25.4).floor() as i32 - 20,
            })
        }
        _ => None,
    }
}

fn motion(mode: u8, off: Offsets, msg: &[u8]) -> Option<DeviceEvent> {
    if mode != 0 {
        return None;
    }
    let mut distance = i32::from(read_u8(msg, off.at(0))?);
    if read_u8(msg, off.at(1))? == 1 {
        distance += 255;
    }
    Some(DeviceEvent::Distance {
        distance: distance * 10,
    })
}

// ── Tilt & IMU ───────────────────────────────────────────────────────────────

fn tilt(mode: u8, off: Offsets, msg: &[u8]) -> Option<DeviceEvent> {
    if mode != 0 {
        return None;
    }
    Some(DeviceEvent::Tilt {
        x: i32::from(read_i8(msg, off.at(0))?),
        y: i32::from(read_i8(msg, off.at(1))?),
        z: None,
    })
}

fn move_hub_tilt(mode: u8, msg: &[u8]) -> Option<DeviceEvent> {
    if mode != 0 {
        return None;
    }
    Some(DeviceEvent::Tilt {
        x: -i32::from(read_i8(msg, 4)?),
        y: i32::from(read_i8(msg, 5)?),
        z: None,
    })
}

fn technic_hub_tilt(mode: u8, msg: &[u8]) -> Option<DeviceEvent> {
    match mode {
        0 => {
            let mut z = -i32::from(read_i16_le(msg, 4)?);
            let y = i32::from(read_i16_le(msg, 6)?);
            let x = i32::from(read_i16_le(msg, 8)?);
            // Firmware 1.1.00.0000 reports z off by 180° at ±90° pitch.
            if y == 90 || y == -90 {
                z = y.signum() * (z + 180);
                if z > 180 {
                    z -= 360;
                }
                if z < -180 {
                    z += 360;
                }
            }
            Some(DeviceEvent::Tilt { x, y, z: Some(z) })
        }
        1 if msg.len() == 8 => Some(DeviceEvent::ImpactCount {
            count: read_u32_le(msg, 4)?,
        }),
        _ => None,
    }
}

fn xyz(msg: &[u8], scale: impl Fn(i16) -> i32) -> Option<(i32, i32, i32)> {
    Some((
        scale(read_i16_le(msg, 4)?),
        scale(read_i16_le(msg, 6)?),
        scale(read_i16_le(msg, 8)?),
    ))
}

fn accelerometer(mode: u8, msg: &[u8]) -> Option<DeviceEvent> {
    if mode != 0 {
        return None;
    }
    let (x, y, z) = xyz(msg, |v| (f64::from(v) / 4.096).round() as i32)?;
    Some(DeviceEvent::Accel { x, y, z })
}

fn gyro(mode: u8, msg: &[u8]) -> Option<DeviceEvent> {
    if mode != 0 {
        return None;
    }
    let (x, y, z) = xyz(msg, |v| (f64::from(v) * 7.0 / 400.0).round() as i32)?;
    Some(DeviceEvent::Gyro { x, y, z })
}

// ── Technic sensors ──────────────────────────────────────────────────────────

fn technic_color(mode: u8, msg: &[u8]) -> Option<DeviceEvent> {
    match mode {
        0 => Some(DeviceEvent::Color {
            color: sensor_color(read_u8(msg, 4)?)?,
        }),
        1 => Some(DeviceEvent::Reflect {
            reflect: read_u8(msg, 4)?,
        }),
        2 => Some(DeviceEvent::Ambient {
            ambient: read_u8(msg, 4)?,
        }),
        _ => None,
    }
}

fn technic_distance(mode: u8, msg: &[u8]) -> Option<DeviceEvent> {
    match mode {
        0 => Some(DeviceEvent::Distance {
            distance: i32::from(read_u16_le(msg, 4)?),
        }),
        1 => Some(DeviceEvent::FastDistance {
            distance: read_u16_le(msg, 4)?,
        }),
        _ => None,
    }
}

fn technic_force(mode: u8, off: Offsets, msg: &[u8]) -> Option<DeviceEvent> {
    match mode {
        0 => Some(DeviceEvent::Force {
            force: f64::from(read_u8(msg, off.at(0))?) / 10.0,
        }),
        1 => Some(DeviceEvent::Touched {
            touched: read_u8(msg, 4)? != 0,
        }),
        2 => Some(DeviceEvent::Tapped {
            tapped: read_u8(msg, 4)?,
        }),
        _ => None,
    }
}

// ── Duplo train base ─────────────────────────────────────────────────────────

fn duplo_color(mode: u8, msg: &[u8]) -> Option<DeviceEvent> {
    match mode {
        0 => Some(DeviceEvent::Intensity {
            intensity: read_u8(msg, 4)?,
        }),
        1 => Some(DeviceEvent::Color {
            color: sensor_color(read_u8(msg, 4)?)?,
        }),
        2 => Some(DeviceEvent::Reflect {
            reflect: read_u8(msg, 4)?,
        }),
        3 => Some(DeviceEvent::Rgb {
            red: read_u16_le(msg, 4)? / 4,
            green: read_u16_le(msg, 6)? / 4,
            blue: read_u16_le(msg, 8)? / 4,
        }),
        _ => None,
    }
}

fn duplo_speed(mode: u8, msg: &[u8]) -> Option<DeviceEvent> {
    match mode {
        0 => Some(DeviceEvent::Speed {
            speed: read_i16_le(msg, 4)?,
        }),
        _ => None,
    }
}

// ── Remote control & Mario ───────────────────────────────────────────────────

fn remote_button(mode: u8, msg: &[u8]) -> Option<DeviceEvent> {
    match mode {
        0 => Some(DeviceEvent::RemoteButton {
            state: ButtonState::from_code(read_u8(msg, 4)?),
        }),
        _ => None,
    }
}

fn mario_accel(mode: u8, msg: &[u8]) -> Option<DeviceEvent> {
    match mode {
        0 => Some(DeviceEvent::Accel {
            x: i32::from(read_u8(msg, 4)?),
            y: i32::from(read_u8(msg, 5)?),
            z: i32::from(read_u8(msg, 6)?),
        }),
        1 => Some(DeviceEvent::Gesture {
            gesture: read_u8(msg, 4)?,
        }),
        _ => None,
    }
}

fn mario_barcode(mode: u8, msg: &[u8]) -> Option<DeviceEvent> {
    const NONE: u16 = 0xffff;
    match mode {
        0 => {
            let barcode = read_u16_le(msg, 4)?;
            let color = read_u16_le(msg, 6)?;
            match (barcode, color) {
                (NONE, NONE) => None,
                (barcode, NONE) => Some(DeviceEvent::Barcode {
                    barcode: Some(barcode),
                    color: None,
                }),
                (NONE, color) => Some(DeviceEvent::Barcode {
                    barcode: None,
                    color: Some(color),
                }),
                _ => None,
            }
        }
        1 => Some(DeviceEvent::Rgb {
            red: u16::from(read_u8(msg, 4)?),
            green: u16::from(read_u8(msg, 5)?),
            blue: u16::from(read_u8(msg, 6)?),
        }),
        _ => None,
    }
}

fn mario_pants(mode: u8, msg: &[u8]) -> Option<DeviceEvent> {
    match mode {
        0 => Some(DeviceEvent::Pants {
            pants: read_u8(msg, 4)?,
        }),
        _ => None,
    }
}
