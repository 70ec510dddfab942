//! Port registry: symbolic port names, virtual ports and the devices
//! currently attached to each port.
//!
//! The registry is the single owner of every [`Device`].  Attach and detach
//! notifications from the hub mutate it; application calls only read it or
//! go through [`PortRegistry::manual_attach`].
//!
//! Port names per hub variant:
//!
//! | Variant | Ports |
//! |---|---|
//! | WeDo 2.0 | `A` 1, `B` 2, `CURRENT_SENSOR` 3, `VOLTAGE_SENSOR` 4, `PIEZO_BUZZER` 5, `HUB_LED` 6 |
//! | Move Hub | `A`–`D` 0–3, `HUB_LED` 50, `TILT_SENSOR` 58, `CURRENT_SENSOR` 59, `VOLTAGE_SENSOR` 60 |
//! | Hub | `A` 0, `B` 1, `HUB_LED` 50, `CURRENT_SENSOR` 59, `VOLTAGE_SENSOR` 60 |
//! | Remote Control | `LEFT` 0, `RIGHT` 1, `HUB_LED` 52, `VOLTAGE_SENSOR` 59, `REMOTE_CONTROL_RSSI` 60 |
//! | Duplo Train Base | `MOTOR` 0, `COLOR` 18, `SPEEDOMETER` 19 |
//! | Technic Medium Hub | `A`–`D` 0–3, `HUB_LED` 50, `CURRENT_SENSOR` 59, `VOLTAGE_SENSOR` 60, `ACCELEROMETER` 97, `GYRO_SENSOR` 98, `TILT_SENSOR` 99 |
//! | Technic Small Hub | `A` 0, `B` 1, `HUB_LED` 49, `CURRENT_SENSOR` 59, `VOLTAGE_SENSOR` 60, `ACCELEROMETER` 97, `GYRO_SENSOR` 98, `TILT_SENSOR` 99 |

use std::collections::HashMap;

use log::{debug, warn};

use crate::device::{Device, DeviceType};
use crate::error::{Error, Result};
use crate::types::{DeviceInfo, HubVariant};

/// Fixed port names for `variant`.
pub fn port_map(variant: HubVariant) -> &'static [(&'static str, u8)] {
    match variant {
        HubVariant::WeDo2SmartHub => &[
            ("A", 1),
            ("B", 2),
            ("CURRENT_SENSOR", 3),
            ("VOLTAGE_SENSOR", 4),
            ("PIEZO_BUZZER", 5),
            ("HUB_LED", 6),
        ],
        HubVariant::MoveHub => &[
            ("A", 0),
            ("B", 1),
            ("C", 2),
            ("D", 3),
            ("HUB_LED", 50),
            ("TILT_SENSOR", 58),
            ("CURRENT_SENSOR", 59),
            ("VOLTAGE_SENSOR", 60),
        ],
        HubVariant::Hub => &[
            ("A", 0),
            ("B", 1),
            ("HUB_LED", 50),
            ("CURRENT_SENSOR", 59),
            ("VOLTAGE_SENSOR", 60),
        ],
        HubVariant::RemoteControl => &[
            ("LEFT", 0),
            ("RIGHT", 1),
            ("HUB_LED", 52),
            ("VOLTAGE_SENSOR", 59),
            ("REMOTE_CONTROL_RSSI", 60),
        ],
        HubVariant::DuploTrainBase => &[("MOTOR", 0), ("COLOR", 18), ("SPEEDOMETER", 19)],
        HubVariant::TechnicMediumHub => &[
            ("A", 0),
            ("B", 1),
            ("C", 2),
            ("D", 3),
            ("HUB_LED", 50),
            ("CURRENT_SENSOR", 59),
            ("VOLTAGE_SENSOR", 60),
            ("ACCELEROMETER", 97),
            ("GYRO_SENSOR", 98),
            ("TILT_SENSOR", 99),
        ],
        HubVariant::TechnicSmallHub => &[
            ("A", 0),
            ("B", 1),
            ("HUB_LED", 49),
            ("CURRENT_SENSOR", 59),
            ("VOLTAGE_SENSOR", 60),
            ("ACCELEROMETER", 97),
            ("GYRO_SENSOR", 98),
            ("TILT_SENSOR", 99),
        ],
        HubVariant::Mario | HubVariant::Unknown => &[],
    }
}

/// Live port → device mapping for one hub connection.
#[derive(Debug)]
pub struct PortRegistry {
    variant: HubVariant,
    ports: Vec<(String, u8)>,
    /// Virtual port id → its two physical constituents.
    virtual_ports: HashMap<u8, (u8, u8)>,
    devices: HashMap<u8, Device>,
    next_instance: u64,
}

impl PortRegistry {
    pub fn new(variant: HubVariant) -> Self {
        Self {
            variant,
            ports: Self::base_ports(variant),
            virtual_ports: HashMap::new(),
            devices: HashMap::new(),
            next_instance: 1,
        }
    }

    fn base_ports(variant: HubVariant) -> Vec<(String, u8)> {
        port_map(variant)
            .iter()
            .map(|&(name, id)| (name.to_owned(), id))
            .collect()
    }

    pub fn variant(&self) -> HubVariant {
        self.variant
    }

    // ── Ports ────────────────────────────────────────────────────────────────

    pub fn port_id(&self, name: &str) -> Option<u8> {
        self.ports
            .iter()
            .find(|(n, _)| n == name)
            .map(|&(_, id)| id)
    }

    pub fn port_name(&self, port_id: u8) -> Option<String> {
        self.ports
            .iter()
            .find(|&&(_, id)| id == port_id)
            .map(|(name, _)| name.clone())
    }

    pub fn port_names(&self) -> Vec<String> {
        self.ports.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn is_virtual(&self, port_id: u8) -> bool {
        self.virtual_ports.contains_key(&port_id)
    }

    /// Physical ports a virtual port combines.
    pub fn constituents(&self, port_id: u8) -> Option<(u8, u8)> {
        self.virtual_ports.get(&port_id).copied()
    }

    // ── Devices ──────────────────────────────────────────────────────────────

    pub fn device(&self, port_id: u8) -> Option<&Device> {
        self.devices.get(&port_id)
    }

    pub fn device_mut(&mut self, port_id: u8) -> Option<&mut Device> {
        self.devices.get_mut(&port_id)
    }

    pub fn device_at(&self, port_name: &str) -> Option<&Device> {
        self.device(self.port_id(port_name)?)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn devices_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.devices.values_mut()
    }

    /// Ports carrying a device of `device_type`, lowest port first.
    pub fn ports_with_type(&self, device_type: DeviceType) -> Vec<u8> {
        let mut ports: Vec<u8> = self
            .devices
            .values()
            .filter(|d| d.device_type() == device_type)
            .map(Device::port_id)
            .collect();
        ports.sort_unstable();
        ports
    }

    pub fn info(&self, port_id: u8) -> Option<DeviceInfo> {
        self.device(port_id)
            .map(|d| d.info(self.port_name(port_id)))
    }

    // ── Attach / detach ──────────────────────────────────────────────────────

    /// Register a device reported by the hub.
    ///
    /// The same type on the same port is a no-op and keeps the existing
    /// instance.  A different type replaces whatever was there.  Returns the
    /// new device's identity when something was attached.
    pub fn attach(&mut self, port_id: u8, device_type: DeviceType) -> Option<DeviceInfo> {
        if let Some(existing) = self.devices.get_mut(&port_id) {
            if existing.device_type() == device_type {
                return None;
            }
            debug!(
                "port {port_id}: replacing {} with {device_type}",
                existing.device_type()
            );
            existing.detach();
            for info in self.detach_dependents(port_id) {
                debug!("port {port_id}: dropped virtual port {}", info.port_id);
            }
        }

        let instance = self.next_instance;
        self.next_instance += 1;
        let device = Device::new(
            instance,
            port_id,
            device_type,
            self.variant,
            self.is_virtual(port_id),
        );
        self.devices.insert(port_id, device);

        let info = self.info(port_id);
        if let Some(info) = &info {
            debug!(
                "attached {} on port {} ({port_id})",
                info.device_type,
                info.port_name.as_deref().unwrap_or("?")
            );
        }
        info
    }

    /// Register a virtual port combining `first` and `second`, named after
    /// both, and attach its device.
    ///
    /// Ignored (with a warning) when either constituent has no name.
    pub fn attach_virtual(
        &mut self,
        port_id: u8,
        device_type: DeviceType,
        first: u8,
        second: u8,
    ) -> Option<DeviceInfo> {
        let (Some(first_name), Some(second_name)) = (self.port_name(first), self.port_name(second))
        else {
            warn!("virtual port {port_id}: constituent ports {first}/{second} are unknown, ignoring");
            return None;
        };
        let name = format!("{first_name}{second_name}");
        self.ports.retain(|(n, id)| n != &name && *id != port_id);
        self.ports.push((name, port_id));
        self.virtual_ports.insert(port_id, (first, second));
        self.attach(port_id, device_type)
    }

    /// Remove the device on `port_id` and anything built on it.
    ///
    /// Virtual ports lose their name and virtual status; detaching a
    /// physical port also tears down every virtual port that combines it.
    /// Returns the identities of the removed devices, in removal order.
    pub fn detach(&mut self, port_id: u8) -> Vec<DeviceInfo> {
        let dependents = self.dependents(port_id);
        let mut removed: Vec<DeviceInfo> = self.remove(port_id).into_iter().collect();
        removed.extend(dependents.into_iter().filter_map(|id| self.remove(id)));
        removed
    }

    /// Tear down every virtual port that combines `port_id`, leaving the
    /// physical port itself alone.
    pub fn detach_dependents(&mut self, port_id: u8) -> Vec<DeviceInfo> {
        self.dependents(port_id)
            .into_iter()
            .filter_map(|id| self.remove(id))
            .collect()
    }

    fn dependents(&self, port_id: u8) -> Vec<u8> {
        self.virtual_ports
            .iter()
            .filter(|(_, (first, second))| *first == port_id || *second == port_id)
            .map(|(&id, _)| id)
            .collect()
    }

    fn remove(&mut self, port_id: u8) -> Option<DeviceInfo> {
        let info = self.info(port_id);
        if let Some(mut device) = self.devices.remove(&port_id) {
            device.detach();
        }
        if self.virtual_ports.remove(&port_id).is_some() {
            self.ports.retain(|&(_, id)| id != port_id);
        }
        info
    }

    /// Force-register a device without waiting for the hub to report it.
    ///
    /// Idempotent for the same type; a different type already on the port
    /// is an error.  Returns `Ok(None)` when the device was already there.
    pub fn manual_attach(
        &mut self,
        port_id: u8,
        device_type: DeviceType,
    ) -> Result<Option<DeviceInfo>> {
        match self.devices.get(&port_id) {
            Some(existing) if existing.device_type() == device_type => {
                debug!("device of type {device_type} already attached to port {port_id}");
                Ok(None)
            }
            Some(_) => Err(Error::PortTypeConflict { port_id }),
            None => Ok(self.attach(port_id, device_type)),
        }
    }

    /// Drop every device and virtual port, e.g. after a disconnect.
    pub fn clear(&mut self) {
        for device in self.devices.values_mut() {
            device.detach();
        }
        self.devices.clear();
        self.virtual_ports.clear();
        self.ports = Self::base_ports(self.variant);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub() -> PortRegistry {
        PortRegistry::new(HubVariant::Hub)
    }

    #[test]
    fn test_port_maps_have_unique_ids() {
        for variant in [
            HubVariant::WeDo2SmartHub,
            HubVariant::MoveHub,
            HubVariant::Hub,
            HubVariant::RemoteControl,
            HubVariant::DuploTrainBase,
            HubVariant::TechnicMediumHub,
            HubVariant::TechnicSmallHub,
        ] {
            let map = port_map(variant);
            let mut ids: Vec<u8> = map.iter().map(|&(_, id)| id).collect();
            ids.sort_unstable();
            ids.dedup();
            assert_eq!(ids.len(), map.len(), "{variant}");
        }
        assert!(port_map(HubVariant::Mario).is_empty());
    }

    #[test]
    fn test_attach_is_idempotent_for_same_type() {
        let mut reg = hub();
        let info = reg.attach(0, DeviceType::TrainMotor).unwrap();
        assert_eq!(info.port_name.as_deref(), Some("A"));
        let instance = reg.device(0).unwrap().instance();

        assert!(reg.attach(0, DeviceType::TrainMotor).is_none());
        assert_eq!(reg.devices().count(), 1);
        assert_eq!(reg.device(0).unwrap().instance(), instance);
    }

    #[test]
    fn test_automatic_attach_overwrites_other_type() {
        let mut reg = hub();
        reg.attach(0, DeviceType::TrainMotor);
        let mut detached = reg.device_mut(0).unwrap().on("detach");
        assert!(reg.attach(0, DeviceType::Light).is_some());
        assert_eq!(reg.device(0).unwrap().device_type(), DeviceType::Light);
        assert!(detached.try_recv().is_ok());
    }

    #[test]
    fn test_manual_attach_conflict() {
        let mut reg = hub();
        assert!(reg.manual_attach(1, DeviceType::Light).unwrap().is_some());
        assert!(reg.manual_attach(1, DeviceType::Light).unwrap().is_none());
        let err = reg.manual_attach(1, DeviceType::TrainMotor).unwrap_err();
        assert!(matches!(err, Error::PortTypeConflict { port_id: 1 }));
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_detach_removes_device() {
        let mut reg = hub();
        reg.attach(1, DeviceType::TrainMotor);
        let removed = reg.detach(1);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].port_name.as_deref(), Some("B"));
        assert!(reg.device(1).is_none());
        assert!(reg.detach(1).is_empty());
    }

    #[test]
    fn test_virtual_port_lifecycle() {
        let mut reg = hub();
        reg.attach(0, DeviceType::MediumLinearMotor);
        reg.attach(1, DeviceType::MediumLinearMotor);

        let info = reg
            .attach_virtual(16, DeviceType::MediumLinearMotor, 0, 1)
            .unwrap();
        assert!(info.is_virtual);
        assert_eq!(info.port_name.as_deref(), Some("AB"));
        assert_eq!(reg.port_id("AB"), Some(16));
        assert!(reg.is_virtual(16));
        assert_eq!(reg.constituents(16), Some((0, 1)));
        assert!(reg.device(16).unwrap().is_virtual());

        let removed = reg.detach(1);
        let ports: Vec<u8> = removed.iter().map(|i| i.port_id).collect();
        assert_eq!(ports, vec![1, 16]);
        assert_eq!(reg.port_id("AB"), None);
        assert!(!reg.is_virtual(16));
        assert!(reg.device(16).is_none());
        assert!(reg.device(0).is_some());
    }

    #[test]
    fn test_replacing_constituent_drops_virtual_port() {
        let mut reg = hub();
        reg.attach(0, DeviceType::MediumLinearMotor);
        reg.attach(1, DeviceType::MediumLinearMotor);
        reg.attach_virtual(16, DeviceType::MediumLinearMotor, 0, 1);

        let info = reg.attach(1, DeviceType::TrainMotor).unwrap();
        assert_eq!(info.device_type, DeviceType::TrainMotor);
        assert_eq!(reg.port_id("AB"), None);
        assert!(!reg.is_virtual(16));
        assert!(reg.device(16).is_none());
        assert!(reg.device(0).is_some());
    }

    #[test]
    fn test_virtual_detach_by_its_own_id() {
        let mut reg = hub();
        reg.attach(0, DeviceType::MediumLinearMotor);
        reg.attach(1, DeviceType::MediumLinearMotor);
        reg.attach_virtual(16, DeviceType::MediumLinearMotor, 0, 1);
        let removed = reg.detach(16);
        assert_eq!(removed.len(), 1);
        assert_eq!(reg.port_id("AB"), None);
        assert!(reg.device(0).is_some() && reg.device(1).is_some());
    }

    #[test]
    fn test_virtual_attach_with_unknown_constituents_is_ignored() {
        let mut reg = hub();
        assert!(reg
            .attach_virtual(16, DeviceType::MediumLinearMotor, 7, 8)
            .is_none());
        assert!(reg.device(16).is_none());
        assert!(!reg.is_virtual(16));
    }

    #[test]
    fn test_clear_restores_base_ports() {
        let mut reg = hub();
        reg.attach(0, DeviceType::MediumLinearMotor);
        reg.attach(1, DeviceType::MediumLinearMotor);
        reg.attach_virtual(16, DeviceType::MediumLinearMotor, 0, 1);
        reg.clear();
        assert_eq!(reg.devices().count(), 0);
        assert_eq!(reg.port_names(), vec!["A", "B", "HUB_LED", "CURRENT_SENSOR", "VOLTAGE_SENSOR"]);
    }

    #[test]
    fn test_ports_with_type_sorted() {
        let mut reg = hub();
        reg.attach(1, DeviceType::TrainMotor);
        reg.attach(0, DeviceType::TrainMotor);
        reg.attach(50, DeviceType::HubLed);
        assert_eq!(reg.ports_with_type(DeviceType::TrainMotor), vec![0, 1]);
    }
}
