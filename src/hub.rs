//! Hub connection: protocol state machine, async handle and device handles.
//!
//! The work is split in two layers:
//!
//! * [`HubState`] is synchronous.  It owns the message framer, the port
//!   registry, the property cache and the hub-wide listeners.  Every inbound
//!   notification goes through [`HubState::feed`], which dispatches complete
//!   messages and returns the frames the hub needs to send in response
//!   (auto-subscriptions, port diagnostics).  It never awaits, so an
//!   attach/detach sequence or a multi-message chunk is always applied as a
//!   whole.
//! * [`Hub`] wraps a [`HubTransport`] and a shared `HubState`.  It runs the
//!   connect sequence, pumps notifications into the state on a spawned task
//!   and writes whatever comes back.  [`DeviceRef`] is a cheap handle to one
//!   attached device and carries the typed command API.
//!
//! ```text
//!   transport ──notifications──▶ pump task ──feed()──▶ HubState ──▶ listeners
//!       ▲                                                 │
//!       └──────────────── Outbound frames ◀───────────────┘
//! ```

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::commands::{self, Matrix, MotorTarget};
use crate::device::{Device, DeviceType};
use crate::error::{Error, Result};
use crate::events::Emitter;
use crate::parse::{
    compare_versions, decode_mac_address, decode_version, read_f32_le, read_i8, read_u16_le,
    read_u32_le, read_u8, MessageFramer,
};
use crate::protocol::{
    attach_event, create_virtual_port, enable_hub_property_reports, hub_property,
    message_type, mode_information, mode_information_request, port_information,
    port_information_request, request_hub_property, set_hub_name, shutdown, Outbound,
    BATTERY_LEVEL, BATTERY_SERVICE, DEVICE_INFORMATION_SERVICE, FIRMWARE_REVISION,
    LPF2_ALL_CHARACTERISTIC, LPF2_HUB_SERVICE, MAX_HUB_NAME_LEN, WEDO2_BUTTON,
    WEDO2_HIGH_CURRENT_ALERT, WEDO2_PORT_TYPE, WEDO2_SENSOR_VALUE, WEDO2_SMART_HUB_2_SERVICE,
    WEDO2_SMART_HUB_SERVICE,
};
use crate::registry::PortRegistry;
use crate::transport::{lock, HubTransport, NotificationStream};
use crate::types::{
    BrakingStyle, ButtonState, Color, ConnectionState, DeviceEvent, DeviceInfo,
    DuploTrainBaseSound, HubEvent, HubVariant, PfOutput,
};
use crate::util::{wait_for, Ramp};

// ── HubConfig ────────────────────────────────────────────────────────────────

/// Configuration for scanning and for every [`Hub`] connection.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// BLE scan duration in seconds.  Default: `15`.
    pub scan_timeout_secs: u64,
    /// Only report hubs whose advertised name starts with this string.
    /// Default: `None` (any name).
    pub name_filter: Option<String>,
    /// How long `wait_for_*` lookups poll before failing.  Default: `5000`.
    pub wait_timeout_ms: u64,
    /// Poll interval of `wait_for_*` lookups.  Default: `50`.
    pub wait_retry_ms: u64,
    /// Some hubs send their name in a second, delayed advertisement; the
    /// scanner waits this long for it.  Default: `1000`.
    pub name_timeout_ms: u64,
    /// Poll interval of the name wait.  Default: `20`.
    pub name_retry_ms: u64,
    /// How long the connect sequence waits for each property response.
    /// Default: `2000`.
    pub property_timeout_ms: u64,
    /// Subscribe devices to the mode behind an event name as soon as
    /// somebody listens for it.  Default: `true`.
    pub auto_subscribe: bool,
    /// Query port and mode information for every attached port and log the
    /// answers at debug level.  Default: `false`.
    pub port_diagnostics: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            scan_timeout_secs: 15,
            name_filter: None,
            wait_timeout_ms: 5000,
            wait_retry_ms: 50,
            name_timeout_ms: 1000,
            name_retry_ms: 20,
            property_timeout_ms: 2000,
            auto_subscribe: true,
            port_diagnostics: false,
        }
    }
}

// ── Property cache ───────────────────────────────────────────────────────────

/// Latest hub-level values reported by the hub.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HubProperties {
    pub name: Option<String>,
    pub firmware_version: Option<String>,
    pub hardware_version: Option<String>,
    pub primary_mac_address: Option<String>,
    /// Percent.
    pub battery_level: Option<u8>,
    /// dBm.
    pub rssi: Option<i8>,
}

/// Oldest firmware each variant is known to work with.
fn minimum_firmware(variant: HubVariant) -> Option<&'static str> {
    match variant {
        HubVariant::Hub => Some("1.1.00.0004"),
        HubVariant::MoveHub => Some("2.0.00.0017"),
        _ => None,
    }
}

fn ascii(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .to_owned()
}

// ── HubState ─────────────────────────────────────────────────────────────────

/// Per-connection protocol state.
#[derive(Debug)]
pub struct HubState {
    variant: HubVariant,
    auto_subscribe: bool,
    port_diagnostics: bool,
    connection: ConnectionState,
    framer: MessageFramer,
    registry: PortRegistry,
    events: Emitter<HubEvent>,
    properties: HubProperties,
    /// Property id → waiter for the next report of that property.
    pending: HashMap<u8, oneshot::Sender<()>>,
}

impl HubState {
    pub fn new(variant: HubVariant, config: &HubConfig) -> Self {
        Self {
            variant,
            auto_subscribe: config.auto_subscribe,
            port_diagnostics: config.port_diagnostics,
            connection: ConnectionState::Disconnected,
            framer: MessageFramer::new(),
            registry: PortRegistry::new(variant),
            events: Emitter::new(),
            properties: HubProperties::default(),
            pending: HashMap::new(),
        }
    }

    pub fn variant(&self) -> HubVariant {
        self.variant
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    pub fn properties(&self) -> &HubProperties {
        &self.properties
    }

    pub fn registry(&self) -> &PortRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut PortRegistry {
        &mut self.registry
    }

    fn emit(&mut self, event: HubEvent) {
        let name = event.name();
        self.events.emit(name, event);
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    pub fn begin_connect(&mut self) -> Result<()> {
        match self.connection {
            ConnectionState::Connecting => Err(Error::AlreadyConnecting),
            ConnectionState::Connected => Err(Error::AlreadyConnected),
            ConnectionState::Disconnected => {
                self.framer.reset();
                self.connection = ConnectionState::Connecting;
                Ok(())
            }
        }
    }

    pub fn set_connected(&mut self) {
        self.connection = ConnectionState::Connected;
        self.emit(HubEvent::Connect);
    }

    /// Forget everything tied to the link.  Devices are detached (their
    /// listeners see `detach`), pending property waits are dropped and
    /// hub-wide listeners get `disconnect`.  Repeated calls do nothing.
    pub fn on_disconnect(&mut self) {
        if self.connection == ConnectionState::Disconnected {
            return;
        }
        self.connection = ConnectionState::Disconnected;
        self.registry.clear();
        self.framer.reset();
        self.pending.clear();
        self.emit(HubEvent::Disconnect);
    }

    /// Register a hub-wide listener.  Returns the frames that subscribe
    /// attached devices to the matching mode.
    pub fn on(&mut self, name: &str) -> (mpsc::UnboundedReceiver<HubEvent>, Vec<Outbound>) {
        let rx = self.events.on(name);
        let out = self
            .registry
            .devices_mut()
            .filter_map(|device| device.subscription_for(name))
            .collect();
        (rx, out)
    }

    /// Resolve the returned receiver the next time `property` is reported.
    pub fn expect_property(&mut self, property: u8) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(property, tx);
        rx
    }

    /// Register a device without an attach notification.
    pub fn manual_attach(&mut self, port_id: u8, device_type: DeviceType) -> Result<Vec<Outbound>> {
        let mut out = Vec::new();
        if let Some(info) = self.registry.manual_attach(port_id, device_type)? {
            self.on_attached(info, &mut out);
        }
        Ok(out)
    }

    /// Validate a virtual port request and build its frame.
    pub fn virtual_port_request(&self, first: &str, second: &str) -> Result<Outbound> {
        if self.variant.is_wedo2() {
            return Err(Error::Unsupported(format!(
                "virtual ports are not available on the {}",
                self.variant
            )));
        }
        let first_id = self
            .registry
            .port_id(first)
            .ok_or_else(|| Error::UnknownPort(first.to_owned()))?;
        let second_id = self
            .registry
            .port_id(second)
            .ok_or_else(|| Error::UnknownPort(second.to_owned()))?;
        let (Some(a), Some(b)) = (self.registry.device(first_id), self.registry.device(second_id))
        else {
            return Err(Error::VirtualPort(format!(
                "both {first} and {second} must have devices attached"
            )));
        };
        if a.device_type() != b.device_type() {
            return Err(Error::VirtualPort(format!(
                "{first} ({}) and {second} ({}) carry different device types",
                a.device_type(),
                b.device_type()
            )));
        }
        Ok(create_virtual_port(first_id, second_id))
    }

    // ── Inbound ──────────────────────────────────────────────────────────────

    /// Process one notification.  Returns frames to write in response.
    pub fn feed(&mut self, characteristic: Uuid, chunk: &[u8]) -> Vec<Outbound> {
        let mut out = Vec::new();
        if self.variant.is_wedo2() {
            self.dispatch_wedo2(characteristic, chunk, &mut out);
        } else if characteristic == LPF2_ALL_CHARACTERISTIC {
            for message in self.framer.push(chunk) {
                self.dispatch(&message, &mut out);
            }
        } else {
            debug!("ignoring notification from {characteristic}");
        }
        out
    }

    fn dispatch(&mut self, message: &[u8], out: &mut Vec<Outbound>) {
        let Some(kind) = read_u8(message, 2) else {
            return;
        };
        match kind {
            message_type::HUB_PROPERTIES => self.on_hub_property(message),
            message_type::HUB_ATTACHED_IO => self.on_attached_io(message, out),
            message_type::PORT_INFORMATION => self.on_port_information(message, out),
            message_type::PORT_MODE_INFORMATION => self.on_mode_information(message),
            message_type::PORT_VALUE_SINGLE => {
                if let Some(port_id) = read_u8(message, 3) {
                    self.on_port_value(port_id, message);
                }
            }
            message_type::PORT_OUTPUT_COMMAND_FEEDBACK => self.on_feedback(message),
            other => debug!("ignoring message type 0x{other:02x}: {message:02x?}"),
        }
    }

    // ── Hub properties ───────────────────────────────────────────────────────

    fn on_hub_property(&mut self, message: &[u8]) {
        let Some(property) = read_u8(message, 3) else {
            return;
        };
        match property {
            hub_property::BUTTON_STATE => match read_u8(message, 5) {
                Some(1) => self.emit(HubEvent::Button {
                    state: ButtonState::Pressed,
                }),
                Some(0) => self.emit(HubEvent::Button {
                    state: ButtonState::Released,
                }),
                _ => {}
            },
            hub_property::FW_VERSION => {
                if let Some(raw) = read_u32_le(message, 5) {
                    self.properties.firmware_version = Some(decode_version(raw));
                }
            }
            hub_property::HW_VERSION => {
                if let Some(raw) = read_u32_le(message, 5) {
                    self.properties.hardware_version = Some(decode_version(raw));
                }
            }
            hub_property::RSSI => {
                if let Some(rssi) = read_i8(message, 5) {
                    self.update_rssi(rssi);
                }
            }
            hub_property::BATTERY_VOLTAGE => {
                if let Some(level) = read_u8(message, 5) {
                    self.update_battery(level);
                }
            }
            hub_property::PRIMARY_MAC_ADDRESS => {
                if let Some(bytes) = message.get(5..11) {
                    self.properties.primary_mac_address = Some(decode_mac_address(bytes));
                }
            }
            hub_property::ADVERTISING_NAME => {
                if let Some(bytes) = message.get(5..) {
                    self.properties.name = Some(ascii(bytes));
                }
            }
            other => debug!("unhandled hub property 0x{other:02x}"),
        }

        if let Some(waiter) = self.pending.remove(&property) {
            let _ = waiter.send(());
        }
    }

    fn update_rssi(&mut self, rssi: i8) {
        if rssi != 0 && self.properties.rssi != Some(rssi) {
            self.properties.rssi = Some(rssi);
            self.emit(HubEvent::Rssi { rssi });
        }
    }

    fn update_battery(&mut self, level: u8) {
        if self.properties.battery_level != Some(level) {
            self.properties.battery_level = Some(level);
            self.emit(HubEvent::BatteryLevel { level });
        }
    }

    // ── Attach / detach ──────────────────────────────────────────────────────

    fn on_attached_io(&mut self, message: &[u8], out: &mut Vec<Outbound>) {
        let (Some(port_id), Some(event)) = (read_u8(message, 3), read_u8(message, 4)) else {
            return;
        };
        match event {
            attach_event::DETACHED => self.on_detached(port_id),
            attach_event::ATTACHED => {
                let Some(code) = read_u16_le(message, 5) else {
                    return;
                };
                if self.port_diagnostics {
                    if let (Some(hw), Some(sw)) = (read_u32_le(message, 7), read_u32_le(message, 11))
                    {
                        debug!(
                            "port {port_id}: hardware {} software {}",
                            decode_version(hw),
                            decode_version(sw)
                        );
                    }
                    out.push(port_information_request(port_id, port_information::MODE_INFO));
                    out.push(port_information_request(
                        port_id,
                        port_information::MODE_COMBINATIONS,
                    ));
                }
                let device_type = DeviceType::from_code(code);
                if self
                    .registry
                    .device(port_id)
                    .is_some_and(|existing| existing.device_type() != device_type)
                {
                    for info in self.registry.detach_dependents(port_id) {
                        self.emit(HubEvent::Detach(info));
                    }
                }
                if let Some(info) = self.registry.attach(port_id, device_type) {
                    self.on_attached(info, out);
                }
            }
            attach_event::ATTACHED_VIRTUAL => {
                let (Some(code), Some(first), Some(second)) = (
                    read_u16_le(message, 5),
                    read_u8(message, 7),
                    read_u8(message, 8),
                ) else {
                    return;
                };
                if let Some(info) =
                    self.registry
                        .attach_virtual(port_id, DeviceType::from_code(code), first, second)
                {
                    self.on_attached(info, out);
                }
            }
            other => debug!("port {port_id}: unknown attach event 0x{other:02x}"),
        }
    }

    /// Configure a freshly attached device and announce it.
    ///
    /// Modes are walked in table order, so with several hub listeners the
    /// last matching mode in the table is the one left active.
    fn on_attached(&mut self, info: DeviceInfo, out: &mut Vec<Outbound>) {
        let auto_subscribe = self.auto_subscribe;
        if let Some(device) = self.registry.device_mut(info.port_id) {
            device.auto_subscribe = auto_subscribe;
            for &(name, _) in info.device_type.modes() {
                if self.events.listener_count(name) > 0 {
                    out.extend(device.subscription_for(name));
                }
            }
        }
        self.emit(HubEvent::Attach(info));
    }

    fn on_detached(&mut self, port_id: u8) {
        for info in self.registry.detach(port_id) {
            self.emit(HubEvent::Detach(info));
        }
    }

    // ── Port values & feedback ───────────────────────────────────────────────

    fn on_port_value(&mut self, port_id: u8, message: &[u8]) {
        let reading = match self.registry.device(port_id) {
            Some(device) => device.receive(message),
            None => {
                debug!("value report for empty port {port_id}");
                return;
            }
        };
        if let Some(reading) = reading {
            self.notify(port_id, reading);
        }
    }

    /// Two steps: store and publish a reading on its device, then offer it
    /// to hub-wide listeners of the same name (none means nobody gets it).
    fn notify(&mut self, port_id: u8, reading: DeviceEvent) {
        let name = reading.name();
        let port_name = self.registry.port_name(port_id);
        let Some(device) = self.registry.device_mut(port_id) else {
            return;
        };
        device.publish(reading.clone());

        self.events.emit(
            name,
            HubEvent::Device {
                port_id,
                port_name,
                reading,
            },
        );
    }

    fn on_feedback(&mut self, message: &[u8]) {
        let pairs = message.get(3..).unwrap_or(&[]);
        for pair in pairs.chunks_exact(2) {
            if let Some(device) = self.registry.device_mut(pair[0]) {
                device.finish(pair[1]);
            }
        }
    }

    // ── Diagnostics ──────────────────────────────────────────────────────────

    fn on_port_information(&mut self, message: &[u8], out: &mut Vec<Outbound>) {
        let Some(port_id) = read_u8(message, 3) else {
            return;
        };
        if read_u8(message, 4) == Some(port_information::MODE_COMBINATIONS) {
            let masks: Vec<String> = message
                .get(5..)
                .unwrap_or(&[])
                .chunks_exact(2)
                .map(|c| format!("{:016b}", u16::from_le_bytes([c[0], c[1]])))
                .collect();
            debug!("port {port_id}: mode combinations {masks:?}");
            return;
        }

        let (Some(count), Some(input), Some(output)) = (
            read_u8(message, 6),
            read_u16_le(message, 7),
            read_u16_le(message, 9),
        ) else {
            return;
        };
        debug!("port {port_id}: {count} mode(s), input {input:016b}, output {output:016b}");
        if !self.port_diagnostics {
            return;
        }
        for mode in 0..count {
            for kind in mode_information::ALL {
                out.push(mode_information_request(port_id, mode, kind));
            }
        }
    }

    fn on_mode_information(&mut self, message: &[u8]) {
        let (Some(port_id), Some(mode), Some(kind)) =
            (read_u8(message, 3), read_u8(message, 4), read_u8(message, 5))
        else {
            return;
        };
        let prefix = format!("port {port_id} mode {mode}:");
        match kind {
            mode_information::NAME => {
                debug!("{prefix} name {}", ascii(message.get(6..).unwrap_or(&[])));
            }
            mode_information::SYMBOL => {
                debug!("{prefix} symbol {}", ascii(message.get(6..).unwrap_or(&[])));
            }
            mode_information::RAW | mode_information::PCT | mode_information::SI => {
                if let (Some(min), Some(max)) = (read_f32_le(message, 6), read_f32_le(message, 10)) {
                    let label = match kind {
                        mode_information::RAW => "raw",
                        mode_information::PCT => "pct",
                        _ => "si",
                    };
                    debug!("{prefix} {label} range {min}..{max}");
                }
            }
            mode_information::VALUE_FORMAT => {
                if let Some(format) = message.get(6..10) {
                    debug!(
                        "{prefix} {} value(s) of type {}, {} figure(s), {} decimal(s)",
                        format[0], format[1], format[2], format[3]
                    );
                }
            }
            other => debug!("{prefix} unknown information type 0x{other:02x}"),
        }
    }

    // ── WeDo 2.0 ─────────────────────────────────────────────────────────────

    fn dispatch_wedo2(&mut self, characteristic: Uuid, data: &[u8], out: &mut Vec<Outbound>) {
        if characteristic == WEDO2_PORT_TYPE {
            self.on_wedo2_port_type(data, out);
        } else if characteristic == WEDO2_SENSOR_VALUE || characteristic == WEDO2_BUTTON {
            self.on_wedo2_sensor(data);
        } else if characteristic == BATTERY_LEVEL {
            if let Some(level) = read_u8(data, 0) {
                self.update_battery(level);
            }
        } else if characteristic == FIRMWARE_REVISION {
            self.properties.firmware_version = Some(ascii(data));
        } else if characteristic == WEDO2_HIGH_CURRENT_ALERT {
            warn!("high current alert: {data:02x?}");
        } else {
            debug!("ignoring notification from {characteristic}: {data:02x?}");
        }
    }

    fn on_wedo2_port_type(&mut self, data: &[u8], out: &mut Vec<Outbound>) {
        let (Some(port_id), Some(event)) = (read_u8(data, 0), read_u8(data, 1)) else {
            return;
        };
        match event {
            0 => self.on_detached(port_id),
            1 => {
                let Some(code) = read_u8(data, 3) else {
                    return;
                };
                if let Some(info) = self
                    .registry
                    .attach(port_id, DeviceType::from_code(u16::from(code)))
                {
                    self.on_attached(info, out);
                }
            }
            other => debug!("port {port_id}: unknown port type event {other}"),
        }
    }

    fn on_wedo2_sensor(&mut self, data: &[u8]) {
        match read_u8(data, 0) {
            Some(0x01) => self.emit(HubEvent::Button {
                state: ButtonState::Pressed,
            }),
            Some(0x00) => self.emit(HubEvent::Button {
                state: ButtonState::Released,
            }),
            Some(_) => {
                if let Some(port_id) = read_u8(data, 1) {
                    self.on_port_value(port_id, data);
                }
            }
            None => {}
        }
    }
}

// ── Hub ──────────────────────────────────────────────────────────────────────

/// A connection to one hub.
///
/// Cloning is cheap; clones share the same connection and state.
pub struct Hub<T: HubTransport> {
    transport: Arc<T>,
    state: Arc<Mutex<HubState>>,
    config: Arc<HubConfig>,
    pump: Arc<Mutex<Option<AbortHandle>>>,
}

impl<T: HubTransport> Clone for Hub<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            state: Arc::clone(&self.state),
            config: Arc::clone(&self.config),
            pump: Arc::clone(&self.pump),
        }
    }
}

impl<T: HubTransport> Hub<T> {
    /// Wrap a transport for a hub already classified as `variant`.
    pub fn new(transport: T, variant: HubVariant, config: HubConfig) -> Self {
        let mut state = HubState::new(variant, &config);
        state.properties.name = transport.name();
        Self {
            transport: Arc::new(transport),
            state: Arc::new(Mutex::new(state)),
            config: Arc::new(config),
            pump: Arc::new(Mutex::new(None)),
        }
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        lock(&self.state)
    }

    fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.config.wait_timeout_ms)
    }

    fn wait_retry(&self) -> Duration {
        Duration::from_millis(self.config.wait_retry_ms)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    // ── Identity & properties ────────────────────────────────────────────────

    pub fn id(&self) -> String {
        self.transport.id()
    }

    pub fn variant(&self) -> HubVariant {
        self.state().variant()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state().connection_state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Snapshot of the property cache.
    pub fn properties(&self) -> HubProperties {
        self.state().properties().clone()
    }

    pub fn name(&self) -> Option<String> {
        self.state().properties().name.clone()
    }

    pub fn firmware_version(&self) -> Option<String> {
        self.state().properties().firmware_version.clone()
    }

    pub fn hardware_version(&self) -> Option<String> {
        self.state().properties().hardware_version.clone()
    }

    pub fn primary_mac_address(&self) -> Option<String> {
        self.state().properties().primary_mac_address.clone()
    }

    pub fn battery_level(&self) -> Option<u8> {
        self.state().properties().battery_level
    }

    pub fn rssi(&self) -> Option<i8> {
        self.state().properties().rssi
    }

    /// Port names currently known, virtual ports included.
    pub fn port_names(&self) -> Vec<String> {
        self.state().registry().port_names()
    }

    // ── Connection ───────────────────────────────────────────────────────────

    /// Connect, subscribe and run the variant's start-up sequence.
    ///
    /// Emits `connect` once the hub is ready.  On failure the link is torn
    /// down again and the error returned.
    pub async fn connect(&self) -> Result<()> {
        self.state().begin_connect()?;
        let variant = self.variant();
        info!("Connecting to {variant} {} …", self.id());

        let result = if variant.is_wedo2() {
            self.connect_wedo2().await
        } else {
            self.connect_lpf2().await
        };

        match result {
            Ok(()) => {
                self.state().set_connected();
                info!(
                    "Connected to {variant} {} (firmware {})",
                    self.id(),
                    self.firmware_version().as_deref().unwrap_or("unknown")
                );
                Ok(())
            }
            Err(err) => {
                warn!("Connecting to {} failed: {err}", self.id());
                if let Err(e) = self.disconnect().await {
                    debug!("cleanup after failed connect: {e}");
                }
                Err(err)
            }
        }
    }

    async fn connect_lpf2(&self) -> Result<()> {
        self.transport.connect().await?;
        self.transport.discover_service(LPF2_HUB_SERVICE).await?;
        let stream = self.transport.notifications().await?;
        self.start_pump(stream);
        self.transport.subscribe(LPF2_ALL_CHARACTERISTIC).await?;

        for property in [
            hub_property::BUTTON_STATE,
            hub_property::RSSI,
            hub_property::BATTERY_VOLTAGE,
        ] {
            self.send(&enable_hub_property_reports(property)).await?;
        }
        for property in [
            hub_property::FW_VERSION,
            hub_property::HW_VERSION,
            hub_property::PRIMARY_MAC_ADDRESS,
        ] {
            self.request_property(property).await?;
        }
        self.check_firmware()
    }

    async fn connect_wedo2(&self) -> Result<()> {
        self.transport.connect().await?;
        for service in [
            WEDO2_SMART_HUB_SERVICE,
            WEDO2_SMART_HUB_2_SERVICE,
            BATTERY_SERVICE,
            DEVICE_INFORMATION_SERVICE,
        ] {
            self.transport.discover_service(service).await?;
        }
        let stream = self.transport.notifications().await?;
        self.start_pump(stream);
        for characteristic in [
            WEDO2_PORT_TYPE,
            WEDO2_SENSOR_VALUE,
            WEDO2_BUTTON,
            BATTERY_LEVEL,
            WEDO2_HIGH_CURRENT_ALERT,
        ] {
            self.transport.subscribe(characteristic).await?;
        }

        for characteristic in [BATTERY_LEVEL, FIRMWARE_REVISION] {
            match self.transport.read(characteristic).await {
                Ok(value) => {
                    let replies = self.state().feed(characteristic, &value);
                    self.send_all(replies).await?;
                }
                Err(err) => warn!("reading {characteristic} failed: {err}"),
            }
        }
        Ok(())
    }

    /// Request a property and wait for its report, giving up with a warning
    /// after the configured property timeout.
    async fn request_property(&self, property: u8) -> Result<()> {
        let response = self.state().expect_property(property);
        self.send(&request_hub_property(property)).await?;

        let limit = Duration::from_millis(self.config.property_timeout_ms);
        match tokio::time::timeout(limit, response).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => debug!("request for property 0x{property:02x} abandoned"),
            Err(_) => warn!(
                "no response for hub property 0x{property:02x} after {}ms",
                limit.as_millis()
            ),
        }
        Ok(())
    }

    fn check_firmware(&self) -> Result<()> {
        let variant = self.variant();
        let Some(required) = minimum_firmware(variant) else {
            return Ok(());
        };
        let Some(found) = self.firmware_version() else {
            warn!("{variant}: firmware version unknown, skipping version check");
            return Ok(());
        };
        if compare_versions(&found, required) == Ordering::Less {
            return Err(Error::FirmwareOutdated {
                variant,
                found,
                required: required.to_owned(),
            });
        }
        Ok(())
    }

    /// Feed every notification into the state on a background task.  The
    /// end of the stream counts as a disconnect.
    fn start_pump(&self, mut stream: NotificationStream) {
        let hub = self.clone();
        let task = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                let replies = hub
                    .state()
                    .feed(notification.characteristic, &notification.value);
                if let Err(e) = hub.send_all(replies).await {
                    warn!("writing reply frames failed: {e}");
                }
            }
            info!("Notification stream ended: hub {} disconnected.", hub.id());
            hub.state().on_disconnect();
        });
        if let Some(previous) = lock(&self.pump).replace(task.abort_handle()) {
            previous.abort();
        }
    }

    /// Drop the link.  Emits `disconnect` unless already disconnected.
    pub async fn disconnect(&self) -> Result<()> {
        let pump = lock(&self.pump).take();
        if let Some(pump) = pump {
            pump.abort();
        }
        let result = self.transport.disconnect().await;
        self.state().on_disconnect();
        result
    }

    // ── Writes ───────────────────────────────────────────────────────────────

    pub async fn send(&self, frame: &Outbound) -> Result<()> {
        debug!("→ {} {:02x?}", frame.characteristic, frame.payload);
        self.transport
            .write(frame.characteristic, &frame.payload)
            .await
    }

    pub async fn send_all(&self, frames: Vec<Outbound>) -> Result<()> {
        for frame in &frames {
            self.send(frame).await?;
        }
        Ok(())
    }

    // ── Hub commands ─────────────────────────────────────────────────────────

    /// Switch the hub off.
    pub async fn shutdown(&self) -> Result<()> {
        self.send(&shutdown(self.variant())).await
    }

    /// Rename the hub (at most 14 characters).  The new name shows up in
    /// advertisements after the hub restarts.
    pub async fn set_name(&self, name: &str) -> Result<()> {
        if name.len() > MAX_HUB_NAME_LEN {
            return Err(Error::InvalidArgument(format!(
                "name must be {MAX_HUB_NAME_LEN} characters or less"
            )));
        }
        let variant = self.variant();
        let frame = set_hub_name(variant, name);
        self.send(&frame).await?;
        if !variant.is_wedo2() {
            // The first write is sometimes not applied.
            self.send(&frame).await?;
        }
        self.state().properties.name = Some(name.to_owned());
        Ok(())
    }

    /// Combine two ports carrying the same device type into one virtual
    /// port, named by joining both names (`"A"` + `"B"` = `"AB"`).
    pub async fn create_virtual_port(&self, first: &str, second: &str) -> Result<DeviceRef<T>> {
        let frame = self.state().virtual_port_request(first, second)?;
        self.send(&frame).await?;
        self.wait_for_device_at_port(&format!("{first}{second}"))
            .await
    }

    /// Register a listener for a hub event, or for a device reading from
    /// any port.  Attached devices whose mode table has `name` are
    /// subscribed to it.
    pub async fn on(&self, name: &str) -> Result<mpsc::UnboundedReceiver<HubEvent>> {
        let (rx, subscriptions) = self.state().on(name);
        self.send_all(subscriptions).await?;
        Ok(rx)
    }

    // ── Device lookups ───────────────────────────────────────────────────────

    fn device_ref(&self, port_id: u8) -> Option<DeviceRef<T>> {
        let state = self.state();
        let device = state.registry().device(port_id)?;
        Some(DeviceRef {
            hub: self.clone(),
            port_id,
            instance: device.instance(),
        })
    }

    pub fn get_device(&self, port_id: u8) -> Option<DeviceRef<T>> {
        self.device_ref(port_id)
    }

    pub fn get_device_at_port(&self, port_name: &str) -> Option<DeviceRef<T>> {
        let port_id = self.state().registry().port_id(port_name)?;
        self.device_ref(port_id)
    }

    /// Poll until a device appears on `port_name`.
    pub async fn wait_for_device_at_port(&self, port_name: &str) -> Result<DeviceRef<T>> {
        wait_for(self.wait_timeout(), self.wait_retry(), || {
            let found = self.get_device_at_port(port_name);
            async move { found }
        })
        .await
    }

    /// Every attached device, lowest port first.
    pub fn get_devices(&self) -> Vec<DeviceRef<T>> {
        let mut ports: Vec<u8> = self
            .state()
            .registry()
            .devices()
            .map(Device::port_id)
            .collect();
        ports.sort_unstable();
        ports.into_iter().filter_map(|p| self.device_ref(p)).collect()
    }

    pub fn get_devices_by_type(&self, device_type: DeviceType) -> Vec<DeviceRef<T>> {
        let ports = self.state().registry().ports_with_type(device_type);
        ports.into_iter().filter_map(|p| self.device_ref(p)).collect()
    }

    /// Poll until a device of `device_type` is attached anywhere.
    pub async fn wait_for_device_by_type(&self, device_type: DeviceType) -> Result<DeviceRef<T>> {
        wait_for(self.wait_timeout(), self.wait_retry(), || {
            let found = self.get_devices_by_type(device_type).into_iter().next();
            async move { found }
        })
        .await
    }

    /// Register a device the hub does not report by itself.
    ///
    /// Fails with [`Error::PortTypeConflict`] when a different type is
    /// already attached to `port_id`.
    pub async fn manually_attach_device(
        &self,
        device_type: DeviceType,
        port_id: u8,
    ) -> Result<DeviceRef<T>> {
        let subscriptions = self.state().manual_attach(port_id, device_type)?;
        self.send_all(subscriptions).await?;
        self.device_ref(port_id)
            .ok_or_else(|| Error::NoDevice(port_id.to_string()))
    }
}

// ── DeviceRef ────────────────────────────────────────────────────────────────

/// Handle to one attached device.
///
/// A handle stays bound to the device instance it was created for: once
/// that device detaches, or another device takes its port, every call fails
/// with [`Error::DeviceDetached`].
pub struct DeviceRef<T: HubTransport> {
    hub: Hub<T>,
    port_id: u8,
    instance: u64,
}

impl<T: HubTransport> Clone for DeviceRef<T> {
    fn clone(&self) -> Self {
        Self {
            hub: self.hub.clone(),
            port_id: self.port_id,
            instance: self.instance,
        }
    }
}

impl<T: HubTransport> fmt::Debug for DeviceRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRef")
            .field("port_id", &self.port_id)
            .field("instance", &self.instance)
            .finish_non_exhaustive()
    }
}

impl<T: HubTransport> DeviceRef<T> {
    fn with_device<R>(&self, f: impl FnOnce(&mut Device) -> Result<R>) -> Result<R> {
        let mut state = self.hub.state();
        match state.registry_mut().device_mut(self.port_id) {
            Some(device) if device.instance() == self.instance => f(device),
            _ => Err(Error::DeviceDetached),
        }
    }

    /// Build frames against the device and send them.  Interrupts any ramp
    /// running on the device.
    async fn command<F>(&self, build: F) -> Result<()>
    where
        F: FnOnce(&mut Device) -> Result<Vec<Outbound>>,
    {
        let frames = self.with_device(|device| {
            let frames = build(device)?;
            device.cancel_event_timer();
            Ok(frames)
        })?;
        self.hub.send_all(frames).await
    }

    /// Like [`command`](Self::command), then wait for the hub to report
    /// the motion finished.
    async fn command_until_done<F>(&self, build: F) -> Result<()>
    where
        F: FnOnce(&mut Device) -> Result<Outbound>,
    {
        let (frame, done) = self.with_device(|device| {
            let frame = build(device)?;
            device.cancel_event_timer();
            Ok((frame, device.push_finished()))
        })?;
        self.hub.send(&frame).await?;
        done.await.map_err(|_| Error::DeviceDetached)
    }

    /// Step `from` → `to` over `time_ms`, one frame per tick.  Returns when
    /// the ramp completes or another command interrupts it.
    async fn ramp(
        &self,
        from: i32,
        to: i32,
        time_ms: u64,
        step: fn(&Device, i32) -> Result<Outbound>,
    ) -> Result<()> {
        self.with_device(|device| step(device, from).map(|_| ()))?;
        let ramp = Ramp::new(from, to, time_ms);
        let handle = self.clone();
        let task = tokio::spawn(async move {
            for value in ramp.values() {
                tokio::time::sleep(ramp.delay).await;
                let frame = handle.with_device(|device| step(device, value))?;
                handle.hub.send(&frame).await?;
            }
            Ok::<(), Error>(())
        });
        self.with_device(|device| {
            device.set_event_timer(task.abort_handle());
            Ok(())
        })?;

        match task.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => {
                debug!("ramp on port {} interrupted", self.port_id);
                Ok(())
            }
            Err(err) => Err(Error::Transport(format!("ramp task failed: {err}"))),
        }
    }

    // ── Identity ─────────────────────────────────────────────────────────────

    pub fn hub(&self) -> &Hub<T> {
        &self.hub
    }

    pub fn port_id(&self) -> u8 {
        self.port_id
    }

    pub fn port_name(&self) -> Option<String> {
        self.hub.state().registry().port_name(self.port_id)
    }

    pub fn device_type(&self) -> Result<DeviceType> {
        self.with_device(|device| Ok(device.device_type()))
    }

    pub fn info(&self) -> Result<DeviceInfo> {
        let port_name = self.port_name();
        self.with_device(|device| Ok(device.info(port_name)))
    }

    pub fn is_connected(&self) -> bool {
        self.with_device(|device| Ok(device.is_connected()))
            .unwrap_or(false)
    }

    pub fn is_virtual(&self) -> bool {
        self.with_device(|device| Ok(device.is_virtual()))
            .unwrap_or(false)
    }

    pub fn mode(&self) -> Result<Option<u8>> {
        self.with_device(|device| Ok(device.mode()))
    }

    pub fn is_busy(&self) -> Result<bool> {
        self.with_device(|device| Ok(device.is_busy()))
    }

    /// Latest reading published under `event`.
    pub fn value(&self, event: &str) -> Result<Option<DeviceEvent>> {
        self.with_device(|device| Ok(device.value(event).cloned()))
    }

    // ── Subscriptions ────────────────────────────────────────────────────────

    /// Listen for readings named `event` from this device.  Subscribes the
    /// matching mode unless auto-subscribe is off.
    pub async fn on(&self, event: &str) -> Result<mpsc::UnboundedReceiver<DeviceEvent>> {
        let (rx, subscription) = self.with_device(|device| {
            let rx = device.on(event);
            Ok((rx, device.subscription_for(event)))
        })?;
        if let Some(frame) = subscription {
            self.hub.send(&frame).await?;
        }
        Ok(rx)
    }

    pub async fn subscribe(&self, mode: u8) -> Result<()> {
        if let Some(frame) = self.with_device(|device| device.subscribe(mode))? {
            self.hub.send(&frame).await?;
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, mode: u8) -> Result<()> {
        let frame = self.with_device(|device| device.unsubscribe(mode))?;
        self.hub.send(&frame).await
    }

    pub fn set_auto_subscribe(&self, enabled: bool) -> Result<()> {
        self.with_device(|device| {
            device.auto_subscribe = enabled;
            Ok(())
        })
    }

    /// Ask the hub to report the active mode's value now.
    pub async fn request_update(&self) -> Result<()> {
        let frame = self.with_device(|device| commands::request_update(device))?;
        self.hub.send(&frame).await
    }

    pub async fn write_mode(&self, mode: u8, data: &[u8]) -> Result<()> {
        self.command(|device| Ok(vec![commands::write_mode(device, mode, data)?]))
            .await
    }

    // ── Motors ───────────────────────────────────────────────────────────────

    /// −100..=100; 0 floats, 127 brakes.
    pub async fn set_power(&self, power: i32) -> Result<()> {
        self.command(|device| Ok(vec![commands::set_power(device, power)?]))
            .await
    }

    pub async fn stop(&self) -> Result<()> {
        self.set_power(0).await
    }

    pub async fn brake(&self) -> Result<()> {
        self.set_power(127).await
    }

    pub async fn ramp_power(&self, from: i32, to: i32, time_ms: u64) -> Result<()> {
        self.ramp(from, to, time_ms, |device, value| {
            commands::set_power(device, value)
        })
        .await
    }

    pub fn set_max_power(&self, max_power: u8) -> Result<()> {
        self.with_device(|device| {
            device.motor.max_power = max_power.min(100);
            Ok(())
        })
    }

    pub fn set_brake_style(&self, style: BrakingStyle) -> Result<()> {
        self.with_device(|device| {
            device.motor.brake_style = style;
            Ok(())
        })
    }

    pub fn use_acceleration_profile(&self, enabled: bool) -> Result<()> {
        self.with_device(|device| {
            device.motor.use_acceleration_profile = enabled;
            Ok(())
        })
    }

    pub fn use_deceleration_profile(&self, enabled: bool) -> Result<()> {
        self.with_device(|device| {
            device.motor.use_deceleration_profile = enabled;
            Ok(())
        })
    }

    pub async fn set_acceleration_time(&self, time_ms: u16, profile: u8) -> Result<()> {
        self.command(|device| {
            Ok(vec![commands::set_acceleration_time(device, time_ms, profile)?])
        })
        .await
    }

    pub async fn set_deceleration_time(&self, time_ms: u16, profile: u8) -> Result<()> {
        self.command(|device| {
            Ok(vec![commands::set_deceleration_time(device, time_ms, profile)?])
        })
        .await
    }

    /// Run at `speed`.  With `time_ms` the call returns once the hub reports
    /// the timed run finished; without, as soon as the command is written.
    pub async fn set_speed(&self, speed: impl Into<MotorTarget>, time_ms: Option<u16>) -> Result<()> {
        let speed = speed.into();
        match time_ms {
            Some(_) => {
                self.command_until_done(|device| commands::set_speed(device, speed, time_ms))
                    .await
            }
            None => {
                self.command(|device| Ok(vec![commands::set_speed(device, speed, None)?]))
                    .await
            }
        }
    }

    /// Turn by `degrees`; a negative speed turns backwards.
    pub async fn rotate_by_degrees(&self, degrees: u32, speed: impl Into<MotorTarget>) -> Result<()> {
        let speed = speed.into();
        self.command_until_done(|device| commands::rotate_by_degrees(device, degrees, speed))
            .await
    }

    pub async fn goto_angle(&self, angle: impl Into<MotorTarget>, speed: i32) -> Result<()> {
        let angle = angle.into();
        self.command_until_done(|device| commands::goto_angle(device, angle, speed))
            .await
    }

    pub async fn reset_zero(&self) -> Result<()> {
        self.command(|device| Ok(vec![commands::reset_zero(device)?]))
            .await
    }

    /// Turn back to the motor's physical zero mark.
    ///
    /// Reads the absolute position (waiting up to the configured wait
    /// timeout), rotates by the opposite angle and restores the previously
    /// subscribed mode.
    pub async fn goto_real_zero(&self, speed: i32) -> Result<()> {
        let (previous_mode, mut readings, subscription, update) = self.with_device(|device| {
            let mode = device.device_type().mode_for("absolute").ok_or_else(|| {
                Error::Unsupported(format!(
                    "{} on port {} has no absolute position",
                    device.device_type(),
                    device.port_id()
                ))
            })?;
            let previous_mode = device.mode();
            let readings = device.on("absolute");
            let subscription = device.subscribe(mode)?;
            let update = commands::request_update(device)?;
            Ok((previous_mode, readings, subscription, update))
        })?;
        if let Some(frame) = subscription {
            self.hub.send(&frame).await?;
        }
        self.hub.send(&update).await?;

        let limit = self.hub.wait_timeout();
        let next_angle = async {
            while let Some(reading) = readings.recv().await {
                if let DeviceEvent::Absolute { angle } = reading {
                    return Some(angle);
                }
            }
            None
        };
        let angle = match tokio::time::timeout(limit, next_angle).await {
            Ok(Some(angle)) => angle,
            Ok(None) => return Err(Error::DeviceDetached),
            Err(_) => {
                return Err(Error::Timeout {
                    elapsed_ms: limit.as_millis() as u64,
                })
            }
        };
        drop(readings);

        let (degrees, speed) = commands::real_zero_rotation(angle, speed);
        self.rotate_by_degrees(degrees, speed).await?;

        if let Some(mode) = previous_mode {
            self.subscribe(mode).await?;
        }
        Ok(())
    }

    // ── Lights ───────────────────────────────────────────────────────────────

    pub async fn set_led_color(&self, color: Color) -> Result<()> {
        self.command(|device| commands::set_led_color(device, color))
            .await
    }

    pub async fn set_led_rgb(&self, red: u8, green: u8, blue: u8) -> Result<()> {
        self.command(|device| commands::set_led_rgb(device, red, green, blue))
            .await
    }

    /// 0..=100.
    pub async fn set_brightness(&self, brightness: u8) -> Result<()> {
        self.command(|device| Ok(vec![commands::set_brightness(device, brightness)?]))
            .await
    }

    pub async fn ramp_brightness(&self, from: u8, to: u8, time_ms: u64) -> Result<()> {
        self.ramp(i32::from(from), i32::from(to), time_ms, |device, value| {
            commands::set_brightness(device, value.clamp(0, 255) as u8)
        })
        .await
    }

    pub async fn set_matrix(&self, matrix: &Matrix) -> Result<()> {
        self.command(|device| commands::set_matrix(device, matrix))
            .await
    }

    // ── Sound ────────────────────────────────────────────────────────────────

    /// Play a WeDo 2.0 piezo tone; returns once it has finished.
    pub async fn play_piezo_tone(&self, frequency: u16, time_ms: u16) -> Result<()> {
        self.command(|device| Ok(vec![commands::play_piezo_tone(device, frequency, time_ms)?]))
            .await?;
        tokio::time::sleep(Duration::from_millis(u64::from(time_ms))).await;
        Ok(())
    }

    pub async fn play_sound(&self, sound: DuploTrainBaseSound) -> Result<()> {
        self.command(|device| commands::play_sound(device, sound))
            .await
    }

    pub async fn play_tone(&self, tone: u8) -> Result<()> {
        self.command(|device| commands::play_tone(device, tone))
            .await
    }

    // ── Sensors ──────────────────────────────────────────────────────────────

    pub async fn set_sensor_led_color(&self, color: Color) -> Result<()> {
        self.command(|device| commands::set_sensor_led_color(device, color))
            .await
    }

    pub async fn set_distance_count(&self, count: u32) -> Result<()> {
        self.command(|device| Ok(vec![commands::set_distance_count(device, count)?]))
            .await
    }

    pub async fn send_pf_ir(&self, message: [u8; 2]) -> Result<()> {
        self.command(|device| commands::send_pf_ir(device, message))
            .await
    }

    pub async fn pf_extended_channel(&self, channel: u8) -> Result<()> {
        self.command(|device| commands::pf_extended_channel(device, channel))
            .await
    }

    pub async fn pf_power(&self, channel: u8, output: PfOutput, power: i8) -> Result<()> {
        self.command(|device| commands::pf_power(device, channel, output, power))
            .await
    }

    pub async fn pf_motors(&self, channel: u8, blue: i8, red: i8) -> Result<()> {
        self.command(|device| commands::pf_motors(device, channel, blue, red))
            .await
    }

    pub async fn set_color_sensor_lights(&self, first: u8, second: u8, third: u8) -> Result<()> {
        self.command(|device| {
            Ok(vec![commands::set_color_sensor_lights(
                device, first, second, third,
            )?])
        })
        .await
    }

    pub async fn set_distance_sensor_lights(
        &self,
        top_left: u8,
        bottom_left: u8,
        top_right: u8,
        bottom_right: u8,
    ) -> Result<()> {
        self.command(|device| {
            Ok(vec![commands::set_distance_sensor_lights(
                device,
                top_left,
                bottom_left,
                top_right,
                bottom_right,
            )?])
        })
        .await
    }

    pub async fn set_impact_count(&self, count: u32) -> Result<()> {
        self.command(|device| Ok(vec![commands::set_impact_count(device, count)?]))
            .await
    }

    pub async fn set_impact_threshold(&self, threshold: u8) -> Result<()> {
        self.command(|device| Ok(vec![commands::set_impact_threshold(device, threshold)?]))
            .await
    }

    pub async fn set_impact_holdoff(&self, holdoff: u8) -> Result<()> {
        self.command(|device| Ok(vec![commands::set_impact_holdoff(device, holdoff)?]))
            .await
    }
}
