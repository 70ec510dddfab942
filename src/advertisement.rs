//! Hub classification from advertisement data, before any connection.

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::{
    manufacturer_id, LPF2_HUB_SERVICE, MANUFACTURER_DATA_HUB_TYPE_INDEX, WEDO2_SMART_HUB_SERVICE,
};
use crate::types::HubVariant;

/// What a peripheral advertised.
///
/// `manufacturer_data` is the raw AD structure payload including the
/// two-byte company identifier, so the hub-type byte sits at index 3.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    pub local_name: Option<String>,
    pub service_uuids: Vec<Uuid>,
    pub manufacturer_data: Vec<u8>,
}

impl Advertisement {
    pub fn new(service_uuids: Vec<Uuid>, manufacturer_data: Vec<u8>) -> Self {
        Self {
            local_name: None,
            service_uuids,
            manufacturer_data,
        }
    }

    /// Build from service UUID strings in dashed or compact form.
    /// Unparseable strings are skipped.
    pub fn from_service_strings<S: AsRef<str>>(services: &[S], manufacturer_data: Vec<u8>) -> Self {
        let service_uuids = services
            .iter()
            .filter_map(|s| Uuid::parse_str(s.as_ref()).ok())
            .collect();
        Self::new(service_uuids, manufacturer_data)
    }

    /// Rebuild raw manufacturer data from a company id and its payload, the
    /// shape most BLE bindings hand out.
    pub fn with_manufacturer(mut self, company_id: u16, data: &[u8]) -> Self {
        let mut raw = company_id.to_le_bytes().to_vec();
        raw.extend_from_slice(data);
        self.manufacturer_data = raw;
        self
    }

    fn advertises(&self, service: Uuid) -> bool {
        self.service_uuids.contains(&service)
    }

    fn hub_type_byte(&self) -> Option<u8> {
        if !self.advertises(LPF2_HUB_SERVICE) {
            return None;
        }
        self.manufacturer_data
            .get(MANUFACTURER_DATA_HUB_TYPE_INDEX)
            .copied()
    }

    /// Classify into a hub variant, or [`HubVariant::Unknown`].
    pub fn classify(&self) -> HubVariant {
        if self.advertises(WEDO2_SMART_HUB_SERVICE) {
            return HubVariant::WeDo2SmartHub;
        }
        match self.hub_type_byte() {
            Some(manufacturer_id::MOVE_HUB) => HubVariant::MoveHub,
            Some(manufacturer_id::HUB) => HubVariant::Hub,
            Some(manufacturer_id::REMOTE_CONTROL) => HubVariant::RemoteControl,
            Some(manufacturer_id::DUPLO_TRAIN_BASE) => HubVariant::DuploTrainBase,
            Some(manufacturer_id::TECHNIC_SMALL_HUB) => HubVariant::TechnicSmallHub,
            Some(manufacturer_id::TECHNIC_MEDIUM_HUB) => HubVariant::TechnicMediumHub,
            Some(manufacturer_id::MARIO) => HubVariant::Mario,
            _ => HubVariant::Unknown,
        }
    }

    /// Like [`classify`](Self::classify) but rejects unknown peripherals, so
    /// no hub is ever built for them.
    pub fn hub_variant(&self) -> Result<HubVariant> {
        match self.classify() {
            HubVariant::Unknown => Err(Error::UnrecognizedPeripheral),
            variant => Ok(variant),
        }
    }
}

/// Pure classification entry point.
pub fn classify(service_uuids: &[Uuid], manufacturer_data: &[u8]) -> HubVariant {
    Advertisement::new(service_uuids.to_vec(), manufacturer_data.to_vec()).classify()
}
