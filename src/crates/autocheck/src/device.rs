//! Device identity and lookup
//!
//! The inventory itself lives elsewhere; the self-check core only reads
//! identities to build store keys and decide whether a device can be decoded.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Device class as stored in the `Type` column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceClass {
    /// Charging pile
    Pile,
    /// Charging stack
    Stack,
    /// Anything else
    Unknown,
}

impl DeviceClass {
    /// Parse a class name, ignoring case
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "PILE" => DeviceClass::Pile,
            "STACK" => DeviceClass::Stack,
            _ => DeviceClass::Unknown,
        }
    }

    /// Upper-case tag used in `selfcheck:` keys
    pub fn key_tag(&self) -> &'static str {
        match self {
            DeviceClass::Pile => "PILE",
            DeviceClass::Stack => "STACK",
            DeviceClass::Unknown => "UNKNOWN",
        }
    }

    /// Whether CCU snapshots for this class can be decoded
    pub fn supports_decode(&self) -> bool {
        matches!(self, DeviceClass::Pile)
    }
}

impl std::fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key_tag())
    }
}

/// Immutable identity of one piece of equipment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Globally unique equipment number
    pub equip_no: String,
    pub class: DeviceClass,
    /// Raw `Type` value, kept for store keys of unknown classes
    pub type_name: String,
    pub station_no: String,
    /// Number of physical connectors
    pub connector_count: u32,
    /// Position of the device within its station
    pub equip_order: i32,
    pub name: String,
}

impl DeviceIdentity {
    /// Create an identity with the given number and class name
    pub fn new(equip_no: impl Into<String>, type_name: impl Into<String>) -> Self {
        let type_name = type_name.into();
        Self {
            equip_no: equip_no.into(),
            class: DeviceClass::parse(&type_name),
            type_name,
            station_no: String::new(),
            connector_count: 0,
            equip_order: 0,
            name: String::new(),
        }
    }

    pub fn with_station(mut self, station_no: impl Into<String>, equip_order: i32) -> Self {
        self.station_no = station_no.into();
        self.equip_order = equip_order;
        self
    }

    pub fn with_connectors(mut self, count: u32) -> Self {
        self.connector_count = count;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Read access to the device inventory
pub trait DeviceDirectory: Send + Sync {
    /// Look up a device by equipment number
    fn device(&self, equip_no: &str) -> Option<DeviceIdentity>;

    /// Snapshot of every known device
    fn all_devices(&self) -> Vec<DeviceIdentity>;
}

/// In-memory device directory
#[derive(Debug, Default, Clone)]
pub struct DeviceRegistry {
    devices: Arc<DashMap<String, DeviceIdentity>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a device
    pub fn insert(&self, device: DeviceIdentity) {
        tracing::debug!(equip_no = %device.equip_no, class = %device.class, "Device registered");
        self.devices.insert(device.equip_no.clone(), device);
    }

    /// Insert many devices at once
    pub fn extend(&self, devices: impl IntoIterator<Item = DeviceIdentity>) {
        for device in devices {
            self.insert(device);
        }
    }

    pub fn remove(&self, equip_no: &str) -> Option<DeviceIdentity> {
        self.devices.remove(equip_no).map(|(_, device)| device)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl DeviceDirectory for DeviceRegistry {
    fn device(&self, equip_no: &str) -> Option<DeviceIdentity> {
        self.devices.get(equip_no).map(|entry| entry.clone())
    }

    fn all_devices(&self) -> Vec<DeviceIdentity> {
        self.devices.iter().map(|entry| entry.value().clone()).collect()
    }
}
