//! Equipment inventory reads

use crate::db::client::DataStore;
use crate::db::error::DbResult;
use crate::db::value::DbRow;
use crate::device::DeviceIdentity;
use tracing::{info, warn};

const PILES_SQL: &str = "SELECT ID, StationNo, EquipNo, EquipName, EquipNameEn, Type, \
    IPAddr, GunCount, EquipOrder FROM equipment_info WHERE Type = 'PILE'";

/// Read-only repository over `equipment_info`
pub struct DeviceRepository;

impl DeviceRepository {
    /// Every pile-class device, read from a replica when available
    pub async fn load_piles(store: &DataStore) -> DbResult<Vec<DeviceIdentity>> {
        let rows = store.query(PILES_SQL, &[], true).await?;
        let devices: Vec<DeviceIdentity> = rows.iter().filter_map(identity_from_row).collect();
        info!(rows = rows.len(), devices = devices.len(), "Loaded piles");
        Ok(devices)
    }
}

fn identity_from_row(row: &DbRow) -> Option<DeviceIdentity> {
    let equip_no = row.get_string("EquipNo");
    if equip_no.trim().is_empty() {
        warn!(id = row.get_i64("ID", -1), "Skipping equipment row without EquipNo");
        return None;
    }

    let connectors = row.get_int("GunCount", 0).max(0) as u32;
    Some(
        DeviceIdentity::new(equip_no, row.get_string("Type"))
            .with_station(row.get_string("StationNo"), row.get_int("EquipOrder", 0))
            .with_connectors(connectors)
            .with_name(row.get_string("EquipName")),
    )
}
