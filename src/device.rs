//! Attached devices: type codes, mode tables and per-port device state.
//!
//! A [`Device`] is the registry's record of whatever is plugged into one
//! port.  It holds the fields every device shares (current mode, busy flag,
//! completion queue, latest values, listeners) and, for motors, the
//! settings of its capability tier.  Decoding lives in [`crate::decode`],
//! command encoding in [`crate::commands`].

use std::collections::{HashMap, VecDeque};
use std::fmt;

use log::debug;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use crate::decode;
use crate::error::{Error, Result};
use crate::events::Emitter;
use crate::protocol::{port_input_format, Outbound};
use crate::types::{BrakingStyle, ConnectionState, DeviceEvent, DeviceInfo, HubVariant};

// ── Device types ─────────────────────────────────────────────────────────────

/// Device type codes reported in attach events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceType {
    SimpleMediumLinearMotor,
    TrainMotor,
    Light,
    VoltageSensor,
    CurrentSensor,
    PiezoBuzzer,
    HubLed,
    TiltSensor,
    MotionSensor,
    ColorDistanceSensor,
    MediumLinearMotor,
    MoveHubMediumLinearMotor,
    MoveHubTiltSensor,
    DuploTrainBaseMotor,
    DuploTrainBaseSpeaker,
    DuploTrainBaseColorSensor,
    DuploTrainBaseSpeedometer,
    TechnicLargeLinearMotor,
    TechnicXLargeLinearMotor,
    TechnicMediumAngularMotor,
    TechnicLargeAngularMotor,
    TechnicMediumHubGestureSensor,
    RemoteControlButton,
    RemoteControlRssi,
    TechnicMediumHubAccelerometer,
    TechnicMediumHubGyroSensor,
    TechnicMediumHubTiltSensor,
    TechnicMediumHubTemperatureSensor,
    TechnicColorSensor,
    TechnicDistanceSensor,
    TechnicForceSensor,
    Technic3x3ColorLightMatrix,
    TechnicSmallAngularMotor,
    MarioAccelerometer,
    MarioBarcodeSensor,
    MarioPantsSensor,
    TechnicMediumAngularMotorGrey,
    TechnicLargeAngularMotorGrey,
    /// A code this crate has no decoder for (including 0).
    Unknown(u16),
}

/// Motor capability tiers; each includes the ones before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MotorTier {
    /// Open-loop power.
    Basic,
    /// Speed control with rotation feedback.
    Tacho,
    /// Tacho plus absolute positioning.
    Absolute,
}

impl DeviceType {
    pub fn from_code(code: u16) -> DeviceType {
        use DeviceType::*;
        match code {
            1 => SimpleMediumLinearMotor,
            2 => TrainMotor,
            8 => Light,
            20 => VoltageSensor,
            21 => CurrentSensor,
            22 => PiezoBuzzer,
            23 => HubLed,
            34 => TiltSensor,
            35 => MotionSensor,
            37 => ColorDistanceSensor,
            38 => MediumLinearMotor,
            39 => MoveHubMediumLinearMotor,
            40 => MoveHubTiltSensor,
            41 => DuploTrainBaseMotor,
            42 => DuploTrainBaseSpeaker,
            43 => DuploTrainBaseColorSensor,
            44 => DuploTrainBaseSpeedometer,
            46 => TechnicLargeLinearMotor,
            47 => TechnicXLargeLinearMotor,
            48 => TechnicMediumAngularMotor,
            49 => TechnicLargeAngularMotor,
            54 => TechnicMediumHubGestureSensor,
            55 => RemoteControlButton,
            56 => RemoteControlRssi,
            57 => TechnicMediumHubAccelerometer,
            58 => TechnicMediumHubGyroSensor,
            59 => TechnicMediumHubTiltSensor,
            60 => TechnicMediumHubTemperatureSensor,
            61 => TechnicColorSensor,
            62 => TechnicDistanceSensor,
            63 => TechnicForceSensor,
            64 => Technic3x3ColorLightMatrix,
            65 => TechnicSmallAngularMotor,
            71 => MarioAccelerometer,
            73 => MarioBarcodeSensor,
            74 => MarioPantsSensor,
            75 => TechnicMediumAngularMotorGrey,
            76 => TechnicLargeAngularMotorGrey,
            other => Unknown(other),
        }
    }

    pub fn code(self) -> u16 {
        use DeviceType::*;
        match self {
            SimpleMediumLinearMotor => 1,
            TrainMotor => 2,
            Light => 8,
            VoltageSensor => 20,
            CurrentSensor => 21,
            PiezoBuzzer => 22,
            HubLed => 23,
            TiltSensor => 34,
            MotionSensor => 35,
            ColorDistanceSensor => 37,
            MediumLinearMotor => 38,
            MoveHubMediumLinearMotor => 39,
            MoveHubTiltSensor => 40,
            DuploTrainBaseMotor => 41,
            DuploTrainBaseSpeaker => 42,
            DuploTrainBaseColorSensor => 43,
            DuploTrainBaseSpeedometer => 44,
            TechnicLargeLinearMotor => 46,
            TechnicXLargeLinearMotor => 47,
            TechnicMediumAngularMotor => 48,
            TechnicLargeAngularMotor => 49,
            TechnicMediumHubGestureSensor => 54,
            RemoteControlButton => 55,
            RemoteControlRssi => 56,
            TechnicMediumHubAccelerometer => 57,
            TechnicMediumHubGyroSensor => 58,
            TechnicMediumHubTiltSensor => 59,
            TechnicMediumHubTemperatureSensor => 60,
            TechnicColorSensor => 61,
            TechnicDistanceSensor => 62,
            TechnicForceSensor => 63,
            Technic3x3ColorLightMatrix => 64,
            TechnicSmallAngularMotor => 65,
            MarioAccelerometer => 71,
            MarioBarcodeSensor => 73,
            MarioPantsSensor => 74,
            TechnicMediumAngularMotorGrey => 75,
            TechnicLargeAngularMotorGrey => 76,
            Unknown(code) => code,
        }
    }

    /// Event name → mode number.  Listening for a name subscribes the mode.
    pub fn modes(self) -> &'static [(&'static str, u8)] {
        use DeviceType::*;
        match self {
            MediumLinearMotor | MoveHubMediumLinearMotor => &[("rotate", 2)],
            TechnicLargeLinearMotor
            | TechnicXLargeLinearMotor
            | TechnicMediumAngularMotor
            | TechnicLargeAngularMotor
            | TechnicSmallAngularMotor
            | TechnicMediumAngularMotorGrey
            | TechnicLargeAngularMotorGrey => &[("rotate", 2), ("absolute", 3)],
            VoltageSensor => &[("voltage", 0)],
            CurrentSensor => &[("current", 0)],
            HubLed => &[("color", 0), ("rgb", 1)],
            TiltSensor | MoveHubTiltSensor => &[("tilt", 0)],
            MotionSensor => &[("distance", 0)],
            ColorDistanceSensor => &[
                ("color", 0),
                ("distance", 1),
                ("distanceCount", 2),
                ("reflect", 3),
                ("ambient", 4),
                ("rgbIntensity", 6),
                ("colorAndDistance", 8),
            ],
            DuploTrainBaseSpeaker => &[("sound", 1), ("tone", 2)],
            DuploTrainBaseColorSensor => {
                &[("intensity", 0), ("color", 1), ("reflect", 2), ("rgb", 3)]
            }
            DuploTrainBaseSpeedometer => &[("speed", 0)],
            RemoteControlButton | RemoteControlRssi => &[("remoteButton", 0)],
            TechnicMediumHubAccelerometer => &[("accel", 0)],
            TechnicMediumHubGyroSensor => &[("gyro", 0)],
            TechnicMediumHubTiltSensor => &[("tilt", 0), ("impactCount", 1)],
            TechnicColorSensor => &[("color", 0), ("reflect", 1), ("ambient", 2)],
            TechnicDistanceSensor => &[("distance", 0), ("fastDistance", 1)],
            TechnicForceSensor => &[("force", 0), ("touched", 1), ("tapped", 2)],
            MarioAccelerometer => &[("accel", 0), ("gesture", 1)],
            MarioBarcodeSensor => &[("barcode", 0), ("rgb", 1)],
            MarioPantsSensor => &[("pants", 0)],
            _ => &[],
        }
    }

    pub fn mode_for(self, event: &str) -> Option<u8> {
        self.modes()
            .iter()
            .find(|(name, _)| *name == event)
            .map(|&(_, mode)| mode)
    }

    pub fn motor_tier(self) -> Option<MotorTier> {
        use DeviceType::*;
        match self {
            SimpleMediumLinearMotor | TrainMotor | DuploTrainBaseMotor => Some(MotorTier::Basic),
            MediumLinearMotor | MoveHubMediumLinearMotor => Some(MotorTier::Tacho),
            TechnicLargeLinearMotor
            | TechnicXLargeLinearMotor
            | TechnicMediumAngularMotor
            | TechnicLargeAngularMotor
            | TechnicSmallAngularMotor
            | TechnicMediumAngularMotorGrey
            | TechnicLargeAngularMotorGrey => Some(MotorTier::Absolute),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Unknown(code) => write!(f, "Unknown({code})"),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

// ── Per-device settings ──────────────────────────────────────────────────────

/// Parameters shared by every tacho/absolute motor command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorSettings {
    pub max_power: u8,
    pub brake_style: BrakingStyle,
    pub use_acceleration_profile: bool,
    pub use_deceleration_profile: bool,
}

impl Default for MotorSettings {
    fn default() -> Self {
        Self {
            max_power: 100,
            brake_style: BrakingStyle::Brake,
            use_acceleration_profile: true,
            use_deceleration_profile: true,
        }
    }
}

impl MotorSettings {
    /// Profile byte: bit 0 acceleration, bit 1 deceleration.
    pub fn profile(&self) -> u8 {
        u8::from(self.use_acceleration_profile) | (u8::from(self.use_deceleration_profile) << 1)
    }
}

/// Impact detection parameters of the Technic medium hub tilt sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImpactSettings {
    pub threshold: u8,
    pub holdoff: u8,
}

impl Default for ImpactSettings {
    fn default() -> Self {
        Self {
            threshold: 10,
            holdoff: 10,
        }
    }
}

// ── Device record ────────────────────────────────────────────────────────────

/// One device bound to one port, owned by the port registry.
#[derive(Debug)]
pub struct Device {
    instance: u64,
    port_id: u8,
    device_type: DeviceType,
    variant: HubVariant,
    is_virtual: bool,
    mode: Option<u8>,
    busy: bool,
    finished: VecDeque<oneshot::Sender<()>>,
    state: ConnectionState,
    values: HashMap<&'static str, DeviceEvent>,
    listeners: Emitter<DeviceEvent>,
    event_timer: Option<AbortHandle>,
    pub auto_subscribe: bool,
    pub motor: MotorSettings,
    pub impact: ImpactSettings,
}

impl Device {
    pub fn new(
        instance: u64,
        port_id: u8,
        device_type: DeviceType,
        variant: HubVariant,
        is_virtual: bool,
    ) -> Self {
        Self {
            instance,
            port_id,
            device_type,
            variant,
            is_virtual,
            mode: None,
            busy: false,
            finished: VecDeque::new(),
            state: ConnectionState::Connected,
            values: HashMap::new(),
            listeners: Emitter::new(),
            event_timer: None,
            auto_subscribe: true,
            motor: MotorSettings::default(),
            impact: ImpactSettings::default(),
        }
    }

    /// Registry-unique id; tells a re-attached device apart from its
    /// predecessor on the same port.
    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn port_id(&self) -> u8 {
        self.port_id
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn variant(&self) -> HubVariant {
        self.variant
    }

    pub fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    pub fn mode(&self) -> Option<u8> {
        self.mode
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    /// Latest reading published under `event`.
    pub fn value(&self, event: &str) -> Option<&DeviceEvent> {
        self.values.get(event)
    }

    pub fn info(&self, port_name: Option<String>) -> DeviceInfo {
        DeviceInfo {
            port_id: self.port_id,
            port_name,
            device_type: self.device_type,
            is_virtual: self.is_virtual,
        }
    }

    fn assert_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::DeviceDetached)
        }
    }

    // ── Subscriptions ────────────────────────────────────────────────────────

    /// Switch value reports to `mode`.  Returns the frame to send, or
    /// `None` when `mode` is already active.
    pub fn subscribe(&mut self, mode: u8) -> Result<Option<Outbound>> {
        self.assert_connected()?;
        if self.mode == Some(mode) {
            return Ok(None);
        }
        self.mode = Some(mode);
        Ok(Some(port_input_format(
            self.variant,
            self.port_id,
            self.device_type.code(),
            mode,
            true,
        )))
    }

    /// Stop value reports for `mode`.
    pub fn unsubscribe(&mut self, mode: u8) -> Result<Outbound> {
        self.assert_connected()?;
        if self.mode == Some(mode) {
            self.mode = None;
        }
        Ok(port_input_format(
            self.variant,
            self.port_id,
            self.device_type.code(),
            mode,
            false,
        ))
    }

    /// Subscription needed when a listener for `event` appears.
    pub fn subscription_for(&mut self, event: &str) -> Option<Outbound> {
        if !self.auto_subscribe {
            return None;
        }
        let mode = self.device_type.mode_for(event)?;
        self.subscribe(mode).ok().flatten()
    }

    /// Register a device-local listener for `event`.
    pub fn on(&mut self, event: &str) -> mpsc::UnboundedReceiver<DeviceEvent> {
        self.listeners.on(event)
    }

    // ── Inbound ──────────────────────────────────────────────────────────────

    /// Decode a value report against the current mode.
    pub fn receive(&self, message: &[u8]) -> Option<DeviceEvent> {
        decode::decode(self.device_type, self.mode, self.variant, message)
    }

    /// Remember `event` as the latest value and publish it to device-local
    /// listeners.
    pub fn publish(&mut self, event: DeviceEvent) {
        let name = event.name();
        self.values.insert(name, event.clone());
        self.listeners.emit(name, event);
    }

    // ── Completion ───────────────────────────────────────────────────────────

    /// Queue a completion for the command just sent.
    pub fn push_finished(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.finished.push_back(tx);
        rx
    }

    pub fn pending_completions(&self) -> usize {
        self.finished.len()
    }

    /// Apply an output feedback status byte.
    ///
    /// `0x10` (buffer full) is ignored outright.  Otherwise bit `0x01` sets
    /// the busy flag and completions are resolved oldest first until at most
    /// one (busy) or none (idle) remain.
    pub fn finish(&mut self, status: u8) {
        if status & 0x10 == 0x10 {
            return;
        }
        self.busy = status & 0x01 == 0x01;
        let keep = usize::from(self.busy);
        while self.finished.len() > keep {
            if let Some(done) = self.finished.pop_front() {
                let _ = done.send(());
            }
        }
    }

    // ── Timers ───────────────────────────────────────────────────────────────

    /// Track the task driving a ramp so a later command can stop it.
    pub fn set_event_timer(&mut self, timer: AbortHandle) {
        self.cancel_event_timer();
        self.event_timer = Some(timer);
    }

    pub fn cancel_event_timer(&mut self) {
        if let Some(timer) = self.event_timer.take() {
            timer.abort();
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Mark the device gone: stop timers, tell its listeners, then drop
    /// them.  Pending completions are dropped unresolved.
    pub fn detach(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        debug!(
            "device {} on port {} detached",
            self.device_type, self.port_id
        );
        self.state = ConnectionState::Disconnected;
        self.cancel_event_timer();
        self.listeners.emit(DeviceEvent::Detach.name(), DeviceEvent::Detach);
        self.listeners.clear();
        self.finished.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn motor() -> Device {
        Device::new(1, 0, DeviceType::MediumLinearMotor, HubVariant::Hub, false)
    }

    #[test]
    fn test_device_type_code_round_trip_for_known_codes() {
        for code in [1u16, 2, 8, 23, 37, 46, 55, 56, 59, 64, 71, 76] {
            assert_eq!(DeviceType::from_code(code).code(), code);
        }
        assert_eq!(DeviceType::from_code(0), DeviceType::Unknown(0));
        assert_eq!(DeviceType::from_code(999), DeviceType::Unknown(999));
    }

    #[test]
    fn test_mode_tables() {
        assert_eq!(DeviceType::ColorDistanceSensor.mode_for("colorAndDistance"), Some(8));
        assert_eq!(DeviceType::TechnicLargeAngularMotor.mode_for("absolute"), Some(3));
        assert_eq!(DeviceType::TrainMotor.mode_for("rotate"), None);
        assert_eq!(DeviceType::RemoteControlRssi.mode_for("remoteButton"), Some(0));
    }

    #[test]
    fn test_motor_tiers() {
        assert_eq!(DeviceType::TrainMotor.motor_tier(), Some(MotorTier::Basic));
        assert_eq!(DeviceType::MoveHubMediumLinearMotor.motor_tier(), Some(MotorTier::Tacho));
        assert_eq!(DeviceType::TechnicSmallAngularMotor.motor_tier(), Some(MotorTier::Absolute));
        assert_eq!(DeviceType::HubLed.motor_tier(), None);
        assert!(MotorTier::Absolute > MotorTier::Tacho);
    }

    #[test]
    fn test_subscribe_is_idempotent_per_mode() {
        let mut dev = motor();
        assert!(dev.subscribe(2).unwrap().is_some());
        assert!(dev.subscribe(2).unwrap().is_none());
        assert_eq!(dev.mode(), Some(2));
        assert!(dev.subscribe(3).unwrap().is_some());
        assert_eq!(dev.mode(), Some(3));
    }

    #[test]
    fn test_subscribe_after_detach_fails() {
        let mut dev = motor();
        dev.detach();
        assert!(matches!(dev.subscribe(2), Err(Error::DeviceDetached)));
    }

    #[test]
    fn test_busy_feedback_drain() {
        let mut dev = motor();
        let mut rx: Vec<_> = (0..3).map(|_| dev.push_finished()).collect();

        dev.finish(0x01);
        assert_eq!(dev.pending_completions(), 1);
        assert!(dev.is_busy());
        assert!(rx[0].try_recv().is_ok());
        assert!(rx[1].try_recv().is_ok());
        assert!(rx[2].try_recv().is_err());

        dev.finish(0x01);
        assert_eq!(dev.pending_completions(), 1);

        dev.finish(0x10 | 0x00);
        assert_eq!(dev.pending_completions(), 1);
        assert!(dev.is_busy());

        dev.finish(0x0a);
        assert_eq!(dev.pending_completions(), 0);
        assert!(!dev.is_busy());
        assert!(rx[2].try_recv().is_ok());
    }

    #[test]
    fn test_idle_feedback_resolves_in_fifo_order() {
        let mut dev = motor();
        let first = dev.push_finished();
        let second = dev.push_finished();
        dev.finish(0x0a);
        let mut first = first;
        let mut second = second;
        assert!(first.try_recv().is_ok());
        assert!(second.try_recv().is_ok());
    }

    #[test]
    fn test_full_status_never_drains() {
        let mut dev = motor();
        let _rx = dev.push_finished();
        dev.finish(0x10);
        dev.finish(0x11);
        assert_eq!(dev.pending_completions(), 1);
        assert!(!dev.is_busy());
    }

    #[test]
    fn test_publish_stores_latest_and_notifies() {
        let mut dev = motor();
        let mut rx = dev.on("rotate");
        dev.publish(DeviceEvent::Rotate { degrees: 10 });
        dev.publish(DeviceEvent::Rotate { degrees: 20 });
        assert_eq!(dev.value("rotate"), Some(&DeviceEvent::Rotate { degrees: 20 }));
        assert_eq!(rx.try_recv().ok(), Some(DeviceEvent::Rotate { degrees: 10 }));
    }

    #[test]
    fn test_detach_notifies_and_closes_listeners() {
        let mut dev = motor();
        let mut detach = dev.on("detach");
        let mut rotate = dev.on("rotate");
        let mut done = dev.push_finished();
        dev.detach();
        assert_eq!(detach.try_recv().ok(), Some(DeviceEvent::Detach));
        assert!(rotate.try_recv().is_err());
        assert!(done.try_recv().is_err());
        assert!(!dev.is_connected());
    }

    #[test]
    fn test_profile_byte() {
        let mut settings = MotorSettings::default();
        assert_eq!(settings.profile(), 0x03);
        settings.use_acceleration_profile = false;
        assert_eq!(settings.profile(), 0x02);
    }
}
