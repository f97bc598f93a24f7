//! Statement parameters and result rows

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Bound statement parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DbValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<i64> for DbValue {
    fn from(v: i64) -> Self {
        DbValue::Int(v)
    }
}

impl From<i32> for DbValue {
    fn from(v: i32) -> Self {
        DbValue::Int(i64::from(v))
    }
}

impl From<u32> for DbValue {
    fn from(v: u32) -> Self {
        DbValue::Int(i64::from(v))
    }
}

impl From<f64> for DbValue {
    fn from(v: f64) -> Self {
        DbValue::Float(v)
    }
}

impl From<bool> for DbValue {
    fn from(v: bool) -> Self {
        DbValue::Int(i64::from(v))
    }
}

impl From<&str> for DbValue {
    fn from(v: &str) -> Self {
        DbValue::Text(v.to_string())
    }
}

impl From<String> for DbValue {
    fn from(v: String) -> Self {
        DbValue::Text(v)
    }
}

impl<T: Into<DbValue>> From<Option<T>> for DbValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(DbValue::Null)
    }
}

/// One result row, column name to textual value
///
/// Every cell is kept as text (`None` for SQL NULL) and converted by the
/// typed getters, so the same row shape works for any driver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbRow {
    cells: HashMap<String, Option<String>>,
}

impl DbRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder used by tests and fakes
    pub fn with(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(column, Some(value.into()));
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: Option<String>) {
        self.cells.insert(column.into(), value);
    }

    pub fn contains(&self, column: &str) -> bool {
        self.cells.contains_key(column)
    }

    fn raw(&self, column: &str) -> Option<&str> {
        self.cells.get(column)?.as_deref().map(str::trim)
    }

    pub fn get_int(&self, column: &str, default: i32) -> i32 {
        self.raw(column)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_i64(&self, column: &str, default: i64) -> i64 {
        self.raw(column)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Text value; NULL and missing columns read as empty
    pub fn get_string(&self, column: &str) -> String {
        self.cells
            .get(column)
            .and_then(|v| v.clone())
            .unwrap_or_default()
    }

    /// Text value; NULL, missing and empty all read as `None`
    pub fn get_nullable_string(&self, column: &str) -> Option<String> {
        self.cells
            .get(column)
            .and_then(|v| v.clone())
            .filter(|v| !v.is_empty())
    }

    /// Accepts `1/0`, `true/false` and `Y/N` in any case; anything else is `default`
    pub fn get_bool(&self, column: &str, default: bool) -> bool {
        match self.raw(column).map(str::to_ascii_lowercase).as_deref() {
            Some("1") | Some("true") | Some("y") => true,
            Some("0") | Some("false") | Some("n") => false,
            _ => default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_getters() {
        let mut row = DbRow::new()
            .with("GunCount", "2")
            .with("ID", "9007199254740993")
            .with("EquipName", "Pile 1")
            .with("Bad", "abc");
        row.insert("EquipNameEn", None);

        assert_eq!(row.get_int("GunCount", 0), 2);
        assert_eq!(row.get_int("Bad", -1), -1);
        assert_eq!(row.get_int("Missing", 7), 7);
        assert_eq!(row.get_i64("ID", 0), 9_007_199_254_740_993);
        assert_eq!(row.get_string("EquipName"), "Pile 1");
        assert_eq!(row.get_string("EquipNameEn"), "");
        assert_eq!(row.get_nullable_string("EquipNameEn"), None);
    }

    #[test]
    fn test_nullable_string_treats_empty_as_none() {
        let row = DbRow::new().with("TriggeredBy", "");
        assert_eq!(row.get_nullable_string("TriggeredBy"), None);
    }

    #[test]
    fn test_bool_spellings() {
        let row = DbRow::new()
            .with("a", "1")
            .with("b", "TRUE")
            .with("c", "y")
            .with("d", "0")
            .with("e", "False")
            .with("f", "N")
            .with("g", "maybe");

        assert!(row.get_bool("a", false));
        assert!(row.get_bool("b", false));
        assert!(row.get_bool("c", false));
        assert!(!row.get_bool("d", true));
        assert!(!row.get_bool("e", true));
        assert!(!row.get_bool("f", true));
        assert!(row.get_bool("g", true));
        assert!(!row.get_bool("missing", false));
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(DbValue::from(3_i32), DbValue::Int(3));
        assert_eq!(DbValue::from(Some("x")), DbValue::Text("x".into()));
        assert_eq!(DbValue::from(None::<String>), DbValue::Null);
    }
}
