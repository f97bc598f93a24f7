//! Key-value snapshot store
//!
//! Read-only access to the fast cache where devices publish their raw
//! self-check flags and aggregate results. The [`SnapshotStore`] trait is the
//! seam the orchestrator depends on; [`RedisSnapshotStore`] is the production
//! implementation.

pub mod redis;

pub use self::redis::{RedisConfig, RedisSnapshotStore};

use crate::device::{DeviceClass, DeviceIdentity};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use thiserror::Error;

/// Key-value store errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KvError {
    /// Key or field does not exist
    #[error("Key not found: {0}")]
    NotFound(String),

    /// No live connection to the store
    #[error("Key-value store not ready: {0}")]
    NotReady(String),

    /// The store returned an error or the link dropped mid-call
    #[error("Key-value transport error: {0}")]
    Transport(String),
}

impl KvError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, KvError::NotFound(_))
    }
}

/// Result type for key-value operations
pub type KvResult<T> = std::result::Result<T, KvError>;

/// Read access to the snapshot cache
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Whether a live connection is currently held
    fn is_connected(&self) -> bool;

    /// Read a whole hash; an empty or missing hash is `NotFound`
    async fn fetch_hash(&self, key: &str) -> KvResult<HashMap<String, String>>;

    /// List keys matching a glob pattern
    async fn find_keys(&self, pattern: &str) -> KvResult<Vec<String>>;

    /// Read a plain string value
    async fn get(&self, key: &str) -> KvResult<String>;

    /// Read a single hash field; `None` when the key or field is absent
    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>>;
}

fn type_segment(device: &DeviceIdentity) -> String {
    match device.class {
        DeviceClass::Unknown if !device.type_name.is_empty() => device.type_name.clone(),
        class => class.key_tag().to_string(),
    }
}

/// Glob matching every CCU hash of a device: `selfcheck:{TYPE}#{id}:CCU#*`
pub fn ccu_key_pattern(device: &DeviceIdentity) -> String {
    format!("selfcheck:{}#{}:CCU#*", type_segment(device), device.equip_no)
}

/// Key of one CCU hash: `selfcheck:{TYPE}#{id}:CCU#{n}`
pub fn ccu_key(device: &DeviceIdentity, module_index: u32) -> String {
    format!(
        "selfcheck:{}#{}:CCU#{}",
        type_segment(device),
        device.equip_no,
        module_index
    )
}

/// Key of the aggregate result blob: `AutoCheck:Result:{Type}:{id}`
pub fn aggregate_result_key(device: &DeviceIdentity) -> String {
    let segment = match device.class {
        DeviceClass::Pile => "Pile".to_string(),
        DeviceClass::Stack => "Stack".to_string(),
        DeviceClass::Unknown => device.type_name.clone(),
    };
    format!("AutoCheck:Result:{}:{}", segment, device.equip_no)
}

/// Key of a pile's live object hash: `objects:STA#{station}:PILE#{order}`
pub fn online_status_key(station_no: &str, equip_order: i32) -> String {
    format!("objects:STA#{station_no}:PILE#{equip_order}")
}

/// Module number at the end of a CCU key, if the key is one
pub fn ccu_module_index(key: &str) -> Option<u32> {
    static CCU_SUFFIX: OnceLock<Option<Regex>> = OnceLock::new();
    let re = CCU_SUFFIX
        .get_or_init(|| Regex::new(r":CCU#(\d+)$").ok())
        .as_ref()?;
    re.captures(key)?.get(1)?.as_str().parse().ok()
}
