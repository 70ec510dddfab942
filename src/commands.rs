//! Per-device command encoders.
//!
//! Each function validates that the device (and its hub) can perform the
//! command, applies any subscription the command needs, and returns the
//! frames to write in order.  Nothing here touches the transport; the
//! [`DeviceRef`](crate::hub::DeviceRef) handle sends the frames and, for
//! motions that report completion, waits on the device's feedback queue.

use crate::device::{Device, DeviceType, MotorTier};
use crate::error::{Error, Result};
use crate::protocol::{
    output_command, output_subcommand, port_information, port_information_request, write_direct,
    Outbound, WEDO2_MOTOR_VALUE_WRITE, WEDO2_PORT_TYPE_WRITE,
};
use crate::types::{Color, DuploTrainBaseSound, PfOutput};
use crate::util::{map_speed, normalize_angle};

/// One value for a single motor, or one per motor of a virtual pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorTarget {
    Single(i32),
    Pair(i32, i32),
}

impl From<i32> for MotorTarget {
    fn from(value: i32) -> Self {
        MotorTarget::Single(value)
    }
}

impl From<(i32, i32)> for MotorTarget {
    fn from((first, second): (i32, i32)) -> Self {
        MotorTarget::Pair(first, second)
    }
}

/// One pixel of the Technic 3×3 color light matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pixel {
    pub color: Color,
    /// 0..=10
    pub brightness: u8,
}

impl Pixel {
    pub fn new(color: Color, brightness: u8) -> Self {
        Self { color, brightness }
    }

    fn code(self) -> u8 {
        match self.color {
            Color::None => Color::None.code(),
            color => color.code() + (self.brightness.min(10) << 4),
        }
    }
}

/// Contents for the 3×3 color light matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matrix {
    /// Every pixel the same color at full brightness.
    Uniform(Color),
    Pixels([Pixel; 9]),
}

// ── Validation ───────────────────────────────────────────────────────────────

fn unsupported(device: &Device, what: &str) -> Error {
    Error::Unsupported(format!(
        "{} on port {} does not support {what}",
        device.device_type(),
        device.port_id()
    ))
}

fn require_kind(device: &Device, kinds: &[DeviceType], what: &str) -> Result<()> {
    if kinds.contains(&device.device_type()) {
        Ok(())
    } else {
        Err(unsupported(device, what))
    }
}

fn require_tier(device: &Device, tier: MotorTier, what: &str) -> Result<()> {
    match device.device_type().motor_tier() {
        Some(have) if have >= tier => Ok(()),
        _ => Err(unsupported(device, what)),
    }
}

fn require_lpf2(device: &Device, what: &str) -> Result<()> {
    if device.variant().is_wedo2() {
        Err(Error::Unsupported(format!(
            "{what} is not available on the {}",
            device.variant()
        )))
    } else {
        Ok(())
    }
}

fn require_connected(device: &Device) -> Result<()> {
    if device.is_connected() {
        Ok(())
    } else {
        Err(Error::DeviceDetached)
    }
}

/// Split a target into its values, checking that pairs only go to virtual
/// ports.
fn target_values(device: &Device, target: MotorTarget) -> Result<Vec<i32>> {
    match target {
        MotorTarget::Single(value) => Ok(vec![value]),
        MotorTarget::Pair(first, second) if device.is_virtual() => Ok(vec![first, second]),
        MotorTarget::Pair(..) => Err(Error::VirtualPort(
            "only virtual ports can accept multiple values".into(),
        )),
    }
}

fn speed_bytes(values: &[i32]) -> impl Iterator<Item = u8> + '_ {
    values.iter().map(|&v| map_speed(v) as u8)
}

// ── Generic ──────────────────────────────────────────────────────────────────

/// Ask the hub to report the current value of the device's active mode.
pub fn request_update(device: &Device) -> Result<Outbound> {
    require_connected(device)?;
    Ok(port_information_request(
        device.port_id(),
        port_information::VALUE,
    ))
}

/// Raw mode data write.
pub fn write_mode(device: &Device, mode: u8, data: &[u8]) -> Result<Outbound> {
    require_connected(device)?;
    Ok(write_direct(device.variant(), device.port_id(), mode, data))
}

// ── Basic motors ─────────────────────────────────────────────────────────────

/// Open-loop power, −100..=100; 127 brakes.
pub fn set_power(device: &Device, power: i32) -> Result<Outbound> {
    require_tier(device, MotorTier::Basic, "motor power")?;
    write_mode(device, 0x00, &[map_speed(power) as u8])
}

// ── Tacho motors ─────────────────────────────────────────────────────────────

/// Run at `speed` until told otherwise, or for `time_ms` when given.
pub fn set_speed(device: &Device, speed: MotorTarget, time_ms: Option<u16>) -> Result<Outbound> {
    require_tier(device, MotorTier::Tacho, "speed control")?;
    require_lpf2(device, "motor speed")?;
    require_connected(device)?;
    let speeds = target_values(device, speed)?;
    let paired = speeds.len() == 2;
    let motor = device.motor;

    let mut sub = Vec::with_capacity(10);
    match time_ms {
        Some(time) => {
            sub.push(if paired {
                output_subcommand::START_SPEED_FOR_TIME_SYNCHRONIZED
            } else {
                output_subcommand::START_SPEED_FOR_TIME
            });
            sub.extend_from_slice(&time.to_le_bytes());
            sub.extend(speed_bytes(&speeds));
            sub.extend_from_slice(&[motor.max_power, motor.brake_style.code(), motor.profile()]);
        }
        None => {
            sub.push(if paired {
                output_subcommand::START_SPEED_SYNCHRONIZED
            } else {
                output_subcommand::START_SPEED
            });
            sub.extend(speed_bytes(&speeds));
            sub.extend_from_slice(&[motor.max_power, motor.profile()]);
        }
    }
    Ok(output_command(device.port_id(), &sub))
}

/// Turn by `degrees` at `speed`; a negative speed turns backwards.
pub fn rotate_by_degrees(device: &Device, degrees: u32, speed: MotorTarget) -> Result<Outbound> {
    require_tier(device, MotorTier::Tacho, "rotation by degrees")?;
    require_lpf2(device, "rotation by degrees")?;
    require_connected(device)?;
    let speeds = target_values(device, speed)?;
    let motor = device.motor;

    let mut sub = vec![if speeds.len() == 2 {
        output_subcommand::START_SPEED_FOR_DEGREES_SYNCHRONIZED
    } else {
        output_subcommand::START_SPEED_FOR_DEGREES
    }];
    sub.extend_from_slice(&degrees.to_le_bytes());
    sub.extend(speed_bytes(&speeds));
    sub.extend_from_slice(&[motor.max_power, motor.brake_style.code(), motor.profile()]);
    Ok(output_command(device.port_id(), &sub))
}

pub fn set_acceleration_time(device: &Device, time_ms: u16, profile: u8) -> Result<Outbound> {
    profile_time(device, output_subcommand::SET_ACC_TIME, time_ms, profile)
}

pub fn set_deceleration_time(device: &Device, time_ms: u16, profile: u8) -> Result<Outbound> {
    profile_time(device, output_subcommand::SET_DEC_TIME, time_ms, profile)
}

fn profile_time(device: &Device, subcommand: u8, time_ms: u16, profile: u8) -> Result<Outbound> {
    require_tier(device, MotorTier::Tacho, "acceleration profiles")?;
    require_lpf2(device, "acceleration profiles")?;
    require_connected(device)?;
    let [lo, hi] = time_ms.to_le_bytes();
    Ok(output_command(device.port_id(), &[subcommand, lo, hi, profile]))
}

// ── Absolute motors ──────────────────────────────────────────────────────────

/// Move to an absolute angle (normalized into −180..180).
pub fn goto_angle(device: &Device, angle: MotorTarget, speed: i32) -> Result<Outbound> {
    require_tier(device, MotorTier::Absolute, "absolute positioning")?;
    if let MotorTarget::Pair(..) = angle {
        if !device.is_virtual() {
            return Err(Error::VirtualPort(
                "only virtual ports can accept multiple positions".into(),
            ));
        }
    }
    require_lpf2(device, "absolute positioning")?;
    require_connected(device)?;
    let angles = target_values(device, angle)?;
    let motor = device.motor;

    let mut sub = vec![if angles.len() == 2 {
        output_subcommand::GOTO_ABSOLUTE_POSITION_SYNCHRONIZED
    } else {
        output_subcommand::GOTO_ABSOLUTE_POSITION
    }];
    for angle in angles {
        sub.extend_from_slice(&normalize_angle(angle).to_le_bytes());
    }
    sub.extend_from_slice(&[
        map_speed(speed) as u8,
        motor.max_power,
        motor.brake_style.code(),
        motor.profile(),
    ]);
    Ok(output_command(device.port_id(), &sub))
}

/// Make the current position the new zero.
pub fn reset_zero(device: &Device) -> Result<Outbound> {
    require_tier(device, MotorTier::Absolute, "zero reset")?;
    require_lpf2(device, "zero reset")?;
    require_connected(device)?;
    Ok(output_command(
        device.port_id(),
        &[output_subcommand::WRITE_DIRECT_MODE_DATA, 0x02, 0x00, 0x00, 0x00, 0x00],
    ))
}

/// Rotation that undoes an absolute reading: degrees and signed speed.
pub fn real_zero_rotation(angle: i32, speed: i32) -> (u32, i32) {
    if angle < 0 {
        (angle.unsigned_abs(), speed)
    } else {
        (angle.unsigned_abs(), -speed)
    }
}

// ── Lights & LEDs ────────────────────────────────────────────────────────────

pub fn set_led_color(device: &mut Device, color: Color) -> Result<Vec<Outbound>> {
    require_kind(device, &[DeviceType::HubLed], "LED color")?;
    require_connected(device)?;
    if device.variant().is_wedo2() {
        return Ok(vec![
            Outbound::raw(WEDO2_PORT_TYPE_WRITE, vec![0x06, 0x17, 0x01, 0x01]),
            Outbound::raw(WEDO2_MOTOR_VALUE_WRITE, vec![0x06, 0x04, 0x01, color.code()]),
        ]);
    }
    let mut out: Vec<Outbound> = device.subscribe(0x00)?.into_iter().collect();
    out.push(write_mode(device, 0x00, &[color.code()])?);
    Ok(out)
}

pub fn set_led_rgb(device: &mut Device, red: u8, green: u8, blue: u8) -> Result<Vec<Outbound>> {
    require_kind(device, &[DeviceType::HubLed], "LED RGB")?;
    require_connected(device)?;
    if device.variant().is_wedo2() {
        return Ok(vec![
            Outbound::raw(WEDO2_PORT_TYPE_WRITE, vec![0x06, 0x17, 0x01, 0x02]),
            Outbound::raw(
                WEDO2_MOTOR_VALUE_WRITE,
                vec![0x06, 0x04, 0x03, red, green, blue],
            ),
        ]);
    }
    let mut out: Vec<Outbound> = device.subscribe(0x01)?.into_iter().collect();
    out.push(write_mode(device, 0x01, &[red, green, blue])?);
    Ok(out)
}

pub fn set_brightness(device: &Device, brightness: u8) -> Result<Outbound> {
    require_kind(device, &[DeviceType::Light], "brightness")?;
    write_mode(device, 0x00, &[brightness])
}

// ── Sound ────────────────────────────────────────────────────────────────────

/// WeDo 2.0 piezo tone; the hub plays it for `time_ms`.
pub fn play_piezo_tone(device: &Device, frequency: u16, time_ms: u16) -> Result<Outbound> {
    require_kind(device, &[DeviceType::PiezoBuzzer], "tones")?;
    require_connected(device)?;
    let mut payload = vec![0x05, 0x02, 0x04];
    payload.extend_from_slice(&frequency.to_le_bytes());
    payload.extend_from_slice(&time_ms.to_le_bytes());
    Ok(Outbound::raw(WEDO2_MOTOR_VALUE_WRITE, payload))
}

pub fn play_sound(device: &mut Device, sound: DuploTrainBaseSound) -> Result<Vec<Outbound>> {
    require_kind(device, &[DeviceType::DuploTrainBaseSpeaker], "sounds")?;
    let mut out: Vec<Outbound> = device.subscribe(0x01)?.into_iter().collect();
    out.push(write_mode(device, 0x01, &[sound.code()])?);
    Ok(out)
}

pub fn play_tone(device: &mut Device, tone: u8) -> Result<Vec<Outbound>> {
    require_kind(device, &[DeviceType::DuploTrainBaseSpeaker], "tones")?;
    let mut out: Vec<Outbound> = device.subscribe(0x02)?.into_iter().collect();
    out.push(write_mode(device, 0x02, &[tone])?);
    Ok(out)
}

// ── Color & distance sensor ──────────────────────────────────────────────────

fn require_color_distance(device: &Device, what: &str) -> Result<()> {
    require_kind(device, &[DeviceType::ColorDistanceSensor], what)?;
    require_lpf2(device, what)
}

pub fn set_sensor_led_color(device: &mut Device, color: Color) -> Result<Vec<Outbound>> {
    require_color_distance(device, "setting LED color")?;
    let mut out: Vec<Outbound> = device.subscribe(0x05)?.into_iter().collect();
    out.push(write_mode(device, 0x05, &[color.code()])?);
    Ok(out)
}

/// Preset the distance counter; works in any mode.
pub fn set_distance_count(device: &Device, count: u32) -> Result<Outbound> {
    require_color_distance(device, "setting distance count")?;
    write_mode(device, 0x02, &count.to_le_bytes())
}

/// Send a 16-bit Power Functions IR message through the sensor's LED.
pub fn send_pf_ir(device: &mut Device, message: [u8; 2]) -> Result<Vec<Outbound>> {
    require_color_distance(device, "Power Functions IR")?;
    let payload = [
        (message[0] << 4).wrapping_add(message[1] >> 4),
        message[0] >> 4,
    ];
    let mut out: Vec<Outbound> = device.subscribe(0x07)?.into_iter().collect();
    out.push(write_mode(device, 0x07, &payload)?);
    Ok(out)
}

/// Toggle a PF receiver's extended address; channels 5..=8 switch it back.
pub fn pf_extended_channel(device: &mut Device, channel: u8) -> Result<Vec<Outbound>> {
    let (channel, address) = pf_address(channel)?;
    send_pf_ir(device, [((channel - 1) << 4) + (address << 3), 6 << 4])
}

/// Single-output PF power, −7..=7 with 8 meaning brake.
pub fn pf_power(device: &mut Device, channel: u8, output: PfOutput, power: i8) -> Result<Vec<Outbound>> {
    let (channel, address) = pf_address(channel)?;
    let output = match output {
        PfOutput::Red => 4,
        PfOutput::Blue => 5,
    };
    send_pf_ir(
        device,
        [((channel - 1) << 4) + (address << 3) + output, pf_pwm(power) << 4],
    )
}

/// Combo PWM: drive both outputs of one receiver.
pub fn pf_motors(device: &mut Device, channel: u8, blue: i8, red: i8) -> Result<Vec<Outbound>> {
    let (channel, address) = pf_address(channel)?;
    send_pf_ir(
        device,
        [
            ((channel - 1 + 4 + (address << 3)) << 4) + pf_pwm(blue),
            pf_pwm(red) << 4,
        ],
    )
}

/// Channels 5..=8 address the extended bank of channels 1..=4.
fn pf_address(channel: u8) -> Result<(u8, u8)> {
    if !(1..=8).contains(&channel) {
        return Err(Error::InvalidArgument(format!(
            "Power Functions channel {channel} is outside 1..=8"
        )));
    }
    if channel > 4 {
        Ok((channel - 4, 1))
    } else {
        Ok((channel, 0))
    }
}

fn pf_pwm(power: i8) -> u8 {
    (power as u8) & 0x0f
}

// ── Technic sensors ──────────────────────────────────────────────────────────

/// Brightness of the three lights around the Technic color sensor.
pub fn set_color_sensor_lights(device: &Device, first: u8, second: u8, third: u8) -> Result<Outbound> {
    require_kind(device, &[DeviceType::TechnicColorSensor], "light brightness")?;
    write_mode(device, 0x03, &[first, second, third])
}

/// Brightness of the four eye segments of the Technic distance sensor.
pub fn set_distance_sensor_lights(
    device: &Device,
    top_left: u8,
    bottom_left: u8,
    top_right: u8,
    bottom_right: u8,
) -> Result<Outbound> {
    require_kind(device, &[DeviceType::TechnicDistanceSensor], "light brightness")?;
    write_mode(device, 0x05, &[top_left, top_right, bottom_left, bottom_right])
}

pub fn set_impact_count(device: &Device, count: u32) -> Result<Outbound> {
    require_kind(device, &[DeviceType::TechnicMediumHubTiltSensor], "impact count")?;
    write_mode(device, 0x01, &count.to_le_bytes())
}

pub fn set_impact_threshold(device: &mut Device, threshold: u8) -> Result<Outbound> {
    require_kind(device, &[DeviceType::TechnicMediumHubTiltSensor], "impact threshold")?;
    device.impact.threshold = threshold;
    write_mode(device, 0x02, &[device.impact.threshold, device.impact.holdoff])
}

pub fn set_impact_holdoff(device: &mut Device, holdoff: u8) -> Result<Outbound> {
    require_kind(device, &[DeviceType::TechnicMediumHubTiltSensor], "impact holdoff")?;
    device.impact.holdoff = holdoff;
    write_mode(device, 0x02, &[device.impact.threshold, device.impact.holdoff])
}

pub fn set_matrix(device: &mut Device, matrix: &Matrix) -> Result<Vec<Outbound>> {
    require_kind(device, &[DeviceType::Technic3x3ColorLightMatrix], "matrix colors")?;
    let pixels: [u8; 9] = match matrix {
        Matrix::Uniform(Color::None) => [Color::None.code(); 9],
        Matrix::Uniform(color) => [Pixel::new(*color, 10).code(); 9],
        Matrix::Pixels(pixels) => pixels.map(Pixel::code),
    };
    let mut out: Vec<Outbound> = device.subscribe(0x02)?.into_iter().collect();
    out.push(write_mode(device, 0x02, &pixels)?);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LPF2_ALL_CHARACTERISTIC;
    use crate::types::{BrakingStyle, HubVariant};

    fn device(kind: DeviceType, variant: HubVariant) -> Device {
        Device::new(1, 0x01, kind, variant, false)
    }

    fn body(out: &Outbound) -> &[u8] {
        &out.payload[2..]
    }

    #[test]
    fn test_set_power_clamps_and_targets_mode_zero() {
        let dev = device(DeviceType::TrainMotor, HubVariant::Hub);
        let out = set_power(&dev, 150).unwrap();
        assert_eq!(body(&out), &[0x81, 0x01, 0x11, 0x51, 0x00, 100]);
        let out = set_power(&dev, -30).unwrap();
        assert_eq!(body(&out), &[0x81, 0x01, 0x11, 0x51, 0x00, (-30i8) as u8]);
    }

    #[test]
    fn test_set_power_rejects_sensors() {
        let dev = device(DeviceType::TiltSensor, HubVariant::Hub);
        assert!(matches!(set_power(&dev, 10), Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_set_speed_layouts() {
        let mut dev = device(DeviceType::TechnicLargeLinearMotor, HubVariant::TechnicMediumHub);
        let out = set_speed(&dev, 50.into(), None).unwrap();
        assert_eq!(body(&out), &[0x81, 0x01, 0x11, 0x07, 50, 100, 0x03]);

        dev.motor.brake_style = BrakingStyle::Hold;
        dev.motor.use_deceleration_profile = false;
        let out = set_speed(&dev, 50.into(), Some(1000)).unwrap();
        assert_eq!(
            body(&out),
            &[0x81, 0x01, 0x11, 0x09, 0xe8, 0x03, 50, 100, 126, 0x01]
        );
    }

    #[test]
    fn test_pairs_need_virtual_port() {
        let dev = device(DeviceType::MediumLinearMotor, HubVariant::Hub);
        assert!(matches!(
            set_speed(&dev, (10, 20).into(), None),
            Err(Error::VirtualPort(_))
        ));

        let pair = Device::new(2, 0x10, DeviceType::MediumLinearMotor, HubVariant::Hub, true);
        let out = set_speed(&pair, (10, -20).into(), None).unwrap();
        assert_eq!(body(&out), &[0x81, 0x10, 0x11, 0x08, 10, (-20i8) as u8, 100, 0x03]);
        let out = rotate_by_degrees(&pair, 90, (10, 10).into()).unwrap();
        assert_eq!(body(&out)[3], 0x0c);
    }

    #[test]
    fn test_rotate_by_degrees_layout() {
        let dev = device(DeviceType::MoveHubMediumLinearMotor, HubVariant::MoveHub);
        let out = rotate_by_degrees(&dev, 360, (-40).into()).unwrap();
        assert_eq!(
            body(&out),
            &[0x81, 0x01, 0x11, 0x0b, 0x68, 0x01, 0x00, 0x00, (-40i8) as u8, 100, 127, 0x03]
        );
    }

    #[test]
    fn test_tacho_commands_rejected_on_wedo2() {
        let dev = device(DeviceType::MediumLinearMotor, HubVariant::WeDo2SmartHub);
        assert!(matches!(rotate_by_degrees(&dev, 90, 50.into()), Err(Error::Unsupported(_))));
        let basic = device(DeviceType::TrainMotor, HubVariant::Hub);
        assert!(matches!(set_speed(&basic, 50.into(), None), Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_goto_angle_normalizes() {
        let dev = device(DeviceType::TechnicMediumAngularMotor, HubVariant::TechnicMediumHub);
        let out = goto_angle(&dev, 190.into(), 30).unwrap();
        let b = body(&out);
        assert_eq!(b[3], 0x0d);
        assert_eq!(i32::from_le_bytes([b[4], b[5], b[6], b[7]]), -170);
        assert_eq!(&b[8..], &[30, 100, 127, 0x03]);

        assert!(matches!(
            goto_angle(&dev, (10, 20).into(), 30),
            Err(Error::VirtualPort(_))
        ));
        let wedo = device(DeviceType::TechnicMediumAngularMotor, HubVariant::WeDo2SmartHub);
        assert!(matches!(goto_angle(&wedo, 10.into(), 30), Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_goto_angle_pair_layout() {
        let pair = Device::new(3, 0x10, DeviceType::TechnicLargeAngularMotor, HubVariant::Hub, true);
        let out = goto_angle(&pair, (90, -90).into(), 100).unwrap();
        let b = body(&out);
        assert_eq!(b[3], 0x0e);
        assert_eq!(i32::from_le_bytes([b[4], b[5], b[6], b[7]]), 90);
        assert_eq!(i32::from_le_bytes([b[8], b[9], b[10], b[11]]), -90);
        assert_eq!(b.len(), 16);
    }

    #[test]
    fn test_reset_zero() {
        let dev = device(DeviceType::TechnicLargeAngularMotor, HubVariant::Hub);
        assert_eq!(
            body(&reset_zero(&dev).unwrap()),
            &[0x81, 0x01, 0x11, 0x51, 0x02, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_real_zero_rotation_direction() {
        assert_eq!(real_zero_rotation(-30, 50), (30, 50));
        assert_eq!(real_zero_rotation(45, 50), (45, -50));
    }

    #[test]
    fn test_hub_led_subscribes_once() {
        let mut dev = device(DeviceType::HubLed, HubVariant::Hub);
        let out = set_led_color(&mut dev, Color::Red).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(body(&out[0])[0], 0x41);
        assert_eq!(body(&out[1]), &[0x81, 0x01, 0x11, 0x51, 0x00, 9]);

        let out = set_led_color(&mut dev, Color::Green).unwrap();
        assert_eq!(out.len(), 1);

        let out = set_led_rgb(&mut dev, 1, 2, 3).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(body(&out[1]), &[0x81, 0x01, 0x11, 0x51, 0x01, 1, 2, 3]);
    }

    #[test]
    fn test_wedo2_led_frames() {
        let mut dev = Device::new(1, 6, DeviceType::HubLed, HubVariant::WeDo2SmartHub, false);
        let out = set_led_color(&mut dev, Color::Blue).unwrap();
        assert_eq!(out[0].characteristic, WEDO2_PORT_TYPE_WRITE);
        assert_eq!(out[0].payload, vec![0x06, 0x17, 0x01, 0x01]);
        assert_eq!(out[1].characteristic, WEDO2_MOTOR_VALUE_WRITE);
        assert_eq!(out[1].payload, vec![0x06, 0x04, 0x01, 3]);

        let out = set_led_rgb(&mut dev, 10, 20, 30).unwrap();
        assert_eq!(out[0].payload, vec![0x06, 0x17, 0x01, 0x02]);
        assert_eq!(out[1].payload, vec![0x06, 0x04, 0x03, 10, 20, 30]);
    }

    #[test]
    fn test_piezo_tone() {
        let dev = Device::new(1, 5, DeviceType::PiezoBuzzer, HubVariant::WeDo2SmartHub, false);
        let out = play_piezo_tone(&dev, 440, 500).unwrap();
        assert_eq!(out.characteristic, WEDO2_MOTOR_VALUE_WRITE);
        assert_eq!(out.payload, vec![0x05, 0x02, 0x04, 0xb8, 0x01, 0xf4, 0x01]);
    }

    #[test]
    fn test_duplo_speaker_switches_modes() {
        let mut dev = device(DeviceType::DuploTrainBaseSpeaker, HubVariant::DuploTrainBase);
        let out = play_sound(&mut dev, DuploTrainBaseSound::Horn).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(body(&out[1]), &[0x81, 0x01, 0x11, 0x51, 0x01, 9]);
        let out = play_tone(&mut dev, 4).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(dev.mode(), Some(2));
    }

    #[test]
    fn test_pf_ir_encoding() {
        let mut dev = device(DeviceType::ColorDistanceSensor, HubVariant::Hub);

        // channel 1, red, power 7: message [0x04, 0x70] → payload [0x47, 0x00]
        let out = pf_power(&mut dev, 1, PfOutput::Red, 7).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(body(&out[1]), &[0x81, 0x01, 0x11, 0x51, 0x07, 0x47, 0x00]);

        // channel 2 extended toggle: message [0x10, 0x60] → [0x06, 0x01]
        let out = pf_extended_channel(&mut dev, 2).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(&body(&out[0])[5..], &[0x06, 0x01]);

        // combo, channel 1, blue 1, red -1: [0x41, 0xf0] → [0x1f, 0x04]
        let out = pf_motors(&mut dev, 1, 1, -1).unwrap();
        assert_eq!(&body(&out[0])[5..], &[0x1f, 0x04]);

        assert!(matches!(pf_power(&mut dev, 9, PfOutput::Blue, 1), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_color_distance_outputs_rejected_on_wedo2() {
        let mut dev = device(DeviceType::ColorDistanceSensor, HubVariant::WeDo2SmartHub);
        assert!(matches!(set_sensor_led_color(&mut dev, Color::Red), Err(Error::Unsupported(_))));
        assert!(matches!(set_distance_count(&dev, 1), Err(Error::Unsupported(_))));
        assert!(matches!(pf_extended_channel(&mut dev, 1), Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_distance_sensor_light_order() {
        let dev = device(DeviceType::TechnicDistanceSensor, HubVariant::TechnicMediumHub);
        let out = set_distance_sensor_lights(&dev, 1, 2, 3, 4).unwrap();
        assert_eq!(&body(&out)[4..], &[0x05, 1, 3, 2, 4]);
    }

    #[test]
    fn test_impact_settings_are_sticky() {
        let mut dev = device(DeviceType::TechnicMediumHubTiltSensor, HubVariant::TechnicMediumHub);
        let out = set_impact_threshold(&mut dev, 20).unwrap();
        assert_eq!(&body(&out)[4..], &[0x02, 20, 10]);
        let out = set_impact_holdoff(&mut dev, 5).unwrap();
        assert_eq!(&body(&out)[4..], &[0x02, 20, 5]);
        let out = set_impact_count(&dev, 3).unwrap();
        assert_eq!(&body(&out)[4..], &[0x01, 3, 0, 0, 0]);
    }

    #[test]
    fn test_matrix_pixels() {
        let mut dev = device(DeviceType::Technic3x3ColorLightMatrix, HubVariant::TechnicMediumHub);
        let out = set_matrix(&mut dev, &Matrix::Uniform(Color::Red)).unwrap();
        assert_eq!(out[1].characteristic, LPF2_ALL_CHARACTERISTIC);
        assert_eq!(&body(&out[1])[5..], &[169; 9]);

        let mut pixels = [Pixel::new(Color::None, 0); 9];
        pixels[4] = Pixel::new(Color::Green, 3);
        let out = set_matrix(&mut dev, &Matrix::Pixels(pixels)).unwrap();
        assert_eq!(out.len(), 1);
        let data = &body(&out[0])[5..];
        assert_eq!(data[0], 255);
        assert_eq!(data[4], 6 + (3 << 4));
    }
}
