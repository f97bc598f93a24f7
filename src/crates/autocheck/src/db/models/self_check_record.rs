//! Self-check record model
//!
//! One append-only row per finished check in `self_check_record`.

use crate::db::error::{DatabaseError, DbResult};
use crate::db::value::DbRow;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! column_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "UPPERCASE")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Column value
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_uppercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    other => Err(DatabaseError::row_mapping(format!(
                        "invalid {} value: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

column_enum!(
    /// What kind of check produced the record
    CheckCategory {
        Full => "FULL",
        Quick => "QUICK",
        Startup => "STARTUP",
        Remote => "REMOTE",
    }
);

column_enum!(
    /// Overall outcome, ordered by severity
    CheckStatus {
        Ok => "OK",
        Warn => "WARN",
        Error => "ERROR",
    }
);

column_enum!(
    /// Who asked for the check
    TriggerSource {
        Local => "LOCAL",
        Web => "WEB",
        Cloud => "CLOUD",
        Auto => "AUTO",
    }
);

impl CheckStatus {
    fn rank(self) -> u8 {
        match self {
            CheckStatus::Ok => 0,
            CheckStatus::Warn => 1,
            CheckStatus::Error => 2,
        }
    }

    /// The more severe of two statuses
    pub fn max(self, other: CheckStatus) -> CheckStatus {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

/// A persisted self-check outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfCheckRecord {
    /// Assigned by the database; `None` before insert
    pub id: Option<i64>,
    /// Device `Type` column value
    pub equip_type: String,
    pub equip_no: String,
    pub check_category: CheckCategory,
    pub status: CheckStatus,
    pub summary: String,
    /// Structured detail as a JSON document
    pub details_json: String,
    pub trigger_source: TriggerSource,
    pub triggered_by: Option<String>,
    /// `YYYY-MM-DD HH:MM:SS`
    pub created_at: String,
}

impl SelfCheckRecord {
    /// New record stamped with the current local time
    pub fn new(
        equip_type: impl Into<String>,
        equip_no: impl Into<String>,
        check_category: CheckCategory,
        status: CheckStatus,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            equip_type: equip_type.into(),
            equip_no: equip_no.into(),
            check_category,
            status,
            summary: summary.into(),
            details_json: "{}".to_string(),
            trigger_source: TriggerSource::Local,
            triggered_by: None,
            created_at: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }

    pub fn with_details(mut self, details: &serde_json::Value) -> Self {
        self.details_json = details.to_string();
        self
    }

    pub fn with_trigger(mut self, source: TriggerSource, triggered_by: Option<String>) -> Self {
        self.trigger_source = source;
        self.triggered_by = triggered_by;
        self
    }

    /// Map a `self_check_record` row
    pub fn from_row(row: &DbRow) -> DbResult<Self> {
        let id = row.get_i64("ID", -1);
        Ok(Self {
            id: (id >= 0).then_some(id),
            equip_type: row.get_string("Type"),
            equip_no: row.get_string("EquipNo"),
            check_category: row.get_string("CheckCategory").parse()?,
            status: row.get_string("Status").parse()?,
            summary: row.get_string("Summary"),
            details_json: row
                .get_nullable_string("DetailsJSON")
                .unwrap_or_else(|| "{}".to_string()),
            trigger_source: row.get_string("TriggerSource").parse()?,
            triggered_by: row.get_nullable_string("TriggeredBy"),
            created_at: row.get_string("CreatedAt"),
        })
    }

    /// Parsed detail document
    pub fn details(&self) -> DbResult<serde_json::Value> {
        serde_json::from_str(&self.details_json)
            .map_err(|e| DatabaseError::row_mapping(format!("DetailsJSON: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_severity() {
        assert_eq!(CheckStatus::Ok.max(CheckStatus::Warn), CheckStatus::Warn);
        assert_eq!(CheckStatus::Error.max(CheckStatus::Warn), CheckStatus::Error);
        assert_eq!(CheckStatus::Ok.max(CheckStatus::Ok), CheckStatus::Ok);
    }

    #[test]
    fn test_column_enums_parse() {
        assert_eq!("remote".parse::<CheckCategory>().unwrap(), CheckCategory::Remote);
        assert_eq!("WARN".parse::<CheckStatus>().unwrap(), CheckStatus::Warn);
        assert_eq!("Cloud".parse::<TriggerSource>().unwrap(), TriggerSource::Cloud);
        assert!("LATER".parse::<CheckCategory>().is_err());
    }

    #[test]
    fn test_from_row() {
        let row = DbRow::new()
            .with("ID", "42")
            .with("Type", "PILE")
            .with("EquipNo", "EQ-1")
            .with("CheckCategory", "REMOTE")
            .with("Status", "OK")
            .with("Summary", "All modules normal")
            .with("DetailsJSON", r#"{"requestId":1}"#)
            .with("TriggerSource", "LOCAL")
            .with("TriggeredBy", "")
            .with("CreatedAt", "2026-01-02 03:04:05");

        let record = SelfCheckRecord::from_row(&row).unwrap();
        assert_eq!(record.id, Some(42));
        assert_eq!(record.status, CheckStatus::Ok);
        assert_eq!(record.triggered_by, None);
        assert_eq!(record.details().unwrap()["requestId"], 1);
    }

    #[test]
    fn test_from_row_rejects_unknown_status() {
        let row = DbRow::new()
            .with("CheckCategory", "REMOTE")
            .with("Status", "FINE")
            .with("TriggerSource", "LOCAL");
        assert!(matches!(
            SelfCheckRecord::from_row(&row),
            Err(DatabaseError::RowMapping(_))
        ));
    }
}
