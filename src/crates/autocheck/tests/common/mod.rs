//! Common test utilities and setup
#![allow(dead_code)]

use async_trait::async_trait;
use autocheck::bus::{BusError, BusResult, MessageBus, MessageHandler};
use autocheck::check::{OrchestratorDeps, SelfCheckConfig, SelfCheckOrchestrator};
use autocheck::db::{
    Connector, DataStore, DatabaseConfig, DatabaseError, DbResult, DbRow, DbValue, Endpoint,
    SqlConnection,
};
use autocheck::device::{DeviceIdentity, DeviceRegistry};
use autocheck::kv::{KvError, KvResult, SnapshotStore};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Bus that records publishes and keeps subscribed handlers
#[derive(Default)]
pub struct FakeBus {
    pub published: Mutex<Vec<(String, Vec<u8>)>>,
    pub handlers: Mutex<Vec<(String, Arc<dyn MessageHandler>)>>,
    pub fail_publish: AtomicBool,
}

impl FakeBus {
    pub fn published_json(&self) -> Vec<(String, Value)> {
        self.published
            .lock()
            .iter()
            .map(|(key, payload)| (key.clone(), serde_json::from_slice(payload).unwrap()))
            .collect()
    }

    /// Deliver a payload to every handler subscribed to `queue`
    pub async fn deliver(&self, queue: &str, payload: &Value) {
        let handlers: Vec<Arc<dyn MessageHandler>> = self
            .handlers
            .lock()
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            handler.handle(serde_json::to_vec(payload).unwrap()).await;
        }
    }
}

#[async_trait]
impl MessageBus for FakeBus {
    async fn publish(&self, routing_key: &str, payload: &[u8]) -> BusResult<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(BusError::NotReady("broker unreachable".to_string()));
        }
        self.published
            .lock()
            .push((routing_key.to_string(), payload.to_vec()));
        Ok(())
    }

    async fn subscribe(&self, queue: &str, handler: Arc<dyn MessageHandler>) -> BusResult<()> {
        self.handlers.lock().push((queue.to_string(), handler));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.fail_publish.load(Ordering::SeqCst)
    }
}

/// In-memory snapshot cache
pub struct FakeKv {
    pub connected: AtomicBool,
    pub hashes: Mutex<HashMap<String, HashMap<String, String>>>,
    pub strings: Mutex<HashMap<String, String>>,
}

impl Default for FakeKv {
    fn default() -> Self {
        Self {
            connected: AtomicBool::new(true),
            hashes: Mutex::new(HashMap::new()),
            strings: Mutex::new(HashMap::new()),
        }
    }
}

impl FakeKv {
    pub fn put_hash(&self, key: &str, fields: &[(&str, &str)]) {
        self.hashes.lock().insert(
            key.to_string(),
            fields
                .iter()
                .map(|(f, v)| (f.to_string(), v.to_string()))
                .collect(),
        );
    }

    /// A CCU hash with every flag clear
    pub fn put_clean_ccu(&self, key: &str) {
        let fields: HashMap<String, String> = (0..32)
            .map(|i| (format!("{i};flag {i}"), "2".to_string()))
            .collect();
        self.hashes.lock().insert(key.to_string(), fields);
    }
}

#[async_trait]
impl SnapshotStore for FakeKv {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn fetch_hash(&self, key: &str) -> KvResult<HashMap<String, String>> {
        match self.hashes.lock().get(key) {
            Some(hash) if !hash.is_empty() => Ok(hash.clone()),
            _ => Err(KvError::NotFound(key.to_string())),
        }
    }

    async fn find_keys(&self, pattern: &str) -> KvResult<Vec<String>> {
        let prefix = pattern.trim_end_matches('*');
        let mut keys: Vec<String> = self
            .hashes
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn get(&self, key: &str) -> KvResult<String> {
        self.strings
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| KvError::NotFound(key.to_string()))
    }

    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>> {
        Ok(self.hashes.lock().get(key).and_then(|h| h.get(field).cloned()))
    }
}

/// Shared script driving every [`FakeConnection`]
#[derive(Default)]
pub struct Script {
    /// Successful statements with their parameters
    pub executed: Mutex<Vec<(String, Vec<DbValue>)>>,
    /// Every statement attempt, successful or not
    pub attempts: AtomicUsize,
    /// Errors returned by the next statements, in order
    pub failures: Mutex<VecDeque<DatabaseError>>,
    /// Rows returned by queries
    pub rows: Mutex<Vec<DbRow>>,
    /// Time each statement takes
    pub delay: Mutex<Option<Duration>>,
    pub fail_ping: AtomicBool,
    pub fail_connect: AtomicBool,
    /// Endpoint host of each opened connection
    pub connects: Mutex<Vec<String>>,
}

impl Script {
    pub fn fail_next(&self, err: DatabaseError) {
        self.failures.lock().push_back(err);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.lock().len()
    }

    pub fn inserts(&self) -> Vec<Vec<DbValue>> {
        self.executed
            .lock()
            .iter()
            .filter(|(sql, _)| sql.starts_with("INSERT INTO self_check_record"))
            .map(|(_, params)| params.clone())
            .collect()
    }

    async fn run(&self, sql: &str, params: &[DbValue]) -> DbResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }
        self.executed
            .lock()
            .push((sql.to_string(), params.to_vec()));
        Ok(())
    }
}

pub struct FakeConnection {
    script: Arc<Script>,
}

#[async_trait]
impl SqlConnection for FakeConnection {
    async fn ping(&mut self) -> DbResult<()> {
        if self.script.fail_ping.load(Ordering::SeqCst) {
            return Err(DatabaseError::Transient("server has gone away".to_string()));
        }
        Ok(())
    }

    async fn query(&mut self, sql: &str, params: &[DbValue]) -> DbResult<Vec<DbRow>> {
        self.script.run(sql, params).await?;
        Ok(self.script.rows.lock().clone())
    }

    async fn execute(&mut self, sql: &str, params: &[DbValue]) -> DbResult<u64> {
        self.script.run(sql, params).await?;
        Ok(1)
    }
}

#[derive(Clone, Default)]
pub struct FakeConnector {
    pub script: Arc<Script>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, endpoint: &Endpoint) -> DbResult<Box<dyn SqlConnection>> {
        if self.script.fail_connect.load(Ordering::SeqCst) {
            return Err(DatabaseError::Transient(format!(
                "Can't connect to MySQL server on '{}'",
                endpoint.host
            )));
        }
        self.script.connects.lock().push(endpoint.host.clone());
        Ok(Box::new(FakeConnection {
            script: Arc::clone(&self.script),
        }))
    }
}

pub fn endpoint(host: &str) -> Endpoint {
    Endpoint {
        host: host.to_string(),
        ..Default::default()
    }
}

/// Master-only config with no pre-opened connections
pub fn database_config() -> DatabaseConfig {
    let mut config = DatabaseConfig {
        master: endpoint("master"),
        ..Default::default()
    };
    config.pool.min_idle = 0;
    config
}

pub fn setup_store(config: DatabaseConfig) -> (Arc<Script>, Arc<DataStore>) {
    let connector = FakeConnector::default();
    let script = Arc::clone(&connector.script);
    let store = DataStore::new(config, Arc::new(connector)).expect("store config is valid");
    (script, Arc::new(store))
}

/// Everything an orchestrator test needs
pub struct Harness {
    pub bus: Arc<FakeBus>,
    pub kv: Arc<FakeKv>,
    pub script: Arc<Script>,
    pub store: Arc<DataStore>,
    pub registry: DeviceRegistry,
    pub orchestrator: Arc<SelfCheckOrchestrator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SelfCheckConfig::default())
    }

    pub fn with_config(config: SelfCheckConfig) -> Self {
        let bus = Arc::new(FakeBus::default());
        let kv = Arc::new(FakeKv::default());
        let (script, store) = setup_store(database_config());

        let registry = DeviceRegistry::new();
        registry.insert(
            DeviceIdentity::new("EQ-1", "PILE")
                .with_station("155261", 1)
                .with_connectors(2),
        );
        registry.insert(DeviceIdentity::new("ST-1", "STACK").with_station("155261", 2));

        let orchestrator = Arc::new(SelfCheckOrchestrator::new(
            OrchestratorDeps {
                bus: Arc::clone(&bus) as Arc<dyn MessageBus>,
                kv: Arc::clone(&kv) as Arc<dyn SnapshotStore>,
                store: Arc::clone(&store),
                devices: Arc::new(registry.clone()),
            },
            config,
        ));

        Self {
            bus,
            kv,
            script,
            store,
            registry,
            orchestrator,
        }
    }
}

pub fn notice(device_id: &str, state: &str, index: Option<u64>) -> Value {
    let mut msg = serde_json::json!({
        "NoticeType": 1010,
        "Data": { "pileId": device_id, "state": state, "desc": "" },
    });
    if let Some(index) = index {
        msg["Index"] = index.into();
    }
    msg
}

pub fn completed(device_id: &str, index: Option<u64>, result: i64, fail_count: i64) -> Value {
    let mut msg = notice(device_id, "COMPLETED", index);
    msg["Data"]["result"] = result.into();
    msg["Data"]["failCount"] = fail_count.into();
    msg
}

pub fn final_result(device_id: &str, index: Option<u64>, result: i64, fail_count: i64) -> Value {
    let mut msg = serde_json::json!({
        "ReqType": 1010,
        "Result": result,
        "Data": {
            "pileId": device_id,
            "successCount": 10 - fail_count,
            "failCount": fail_count,
            "code": 0,
        },
    });
    if let Some(index) = index {
        msg["Index"] = index.into();
    }
    msg
}

pub fn text(value: &DbValue) -> &str {
    match value {
        DbValue::Text(s) => s.as_str(),
        other => panic!("expected text, got {:?}", other),
    }
}
