//! Self-check record repository

use crate::db::client::DataStore;
use crate::db::error::DbResult;
use crate::db::models::SelfCheckRecord;
use crate::db::value::DbValue;

/// Table definition (MySQL dialect)
pub const SELF_CHECK_RECORD_DDL: &str = "CREATE TABLE IF NOT EXISTS self_check_record (
    ID BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
    Type VARCHAR(32) NOT NULL,
    EquipNo VARCHAR(64) NOT NULL,
    CheckCategory ENUM('FULL','QUICK','STARTUP','REMOTE') NOT NULL,
    Status ENUM('OK','WARN','ERROR') NOT NULL,
    Summary VARCHAR(512) NOT NULL DEFAULT '',
    DetailsJSON JSON NULL,
    TriggerSource ENUM('LOCAL','WEB','CLOUD','AUTO') NOT NULL,
    TriggeredBy VARCHAR(64) NULL,
    CreatedAt DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
    UpdatedAt DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,
    INDEX idx_equip_no (EquipNo),
    INDEX idx_type (Type),
    INDEX idx_created_at (CreatedAt)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4";

const INSERT_SQL: &str = "INSERT INTO self_check_record \
    (Type, EquipNo, CheckCategory, Status, Summary, DetailsJSON, \
    TriggerSource, TriggeredBy, CreatedAt) \
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)";

const RECENT_SQL: &str = "SELECT ID, Type, EquipNo, CheckCategory, Status, Summary, \
    CAST(DetailsJSON AS CHAR) AS DetailsJSON, TriggerSource, TriggeredBy, \
    CAST(CreatedAt AS CHAR) AS CreatedAt \
    FROM self_check_record WHERE EquipNo = ? ORDER BY ID DESC LIMIT ?";

/// Repository for the `self_check_record` table
pub struct SelfCheckRecordRepository;

impl SelfCheckRecordRepository {
    /// Create the table if it does not exist
    pub async fn create_table(store: &DataStore) -> DbResult<()> {
        store.update(SELF_CHECK_RECORD_DDL, &[]).await?;
        Ok(())
    }

    /// Append a record; returns the affected row count
    pub async fn insert(store: &DataStore, record: &SelfCheckRecord) -> DbResult<u64> {
        let params = [
            DbValue::from(record.equip_type.as_str()),
            record.equip_no.as_str().into(),
            record.check_category.as_str().into(),
            record.status.as_str().into(),
            record.summary.as_str().into(),
            record.details_json.as_str().into(),
            record.trigger_source.as_str().into(),
            record.triggered_by.clone().into(),
            record.created_at.as_str().into(),
        ];
        store.update(INSERT_SQL, &params).await
    }

    /// Latest records of one device, newest first
    pub async fn recent_for_device(
        store: &DataStore,
        equip_no: &str,
        limit: u32,
    ) -> DbResult<Vec<SelfCheckRecord>> {
        let rows = store
            .query(RECENT_SQL, &[equip_no.into(), limit.into()], true)
            .await?;
        rows.iter().map(SelfCheckRecord::from_row).collect()
    }
}
