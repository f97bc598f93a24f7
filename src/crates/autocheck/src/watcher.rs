//! Online status watcher
//!
//! Polls the live object hash of every pile and reports connectivity
//! changes. A pile is online when field `comm` of
//! `objects:STA#{station}:PILE#{order}` equals `"true"`.

use crate::device::{DeviceClass, DeviceDirectory};
use crate::kv::{online_status_key, KvError, SnapshotStore};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Shortest allowed poll interval
pub const MIN_POLL_INTERVAL_MS: u64 = 1000;

/// The `watcher` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub enabled: bool,
    pub poll_interval_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 5000,
        }
    }
}

impl WatcherConfig {
    /// Poll interval, clamped to the minimum
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS))
    }
}

/// Connectivity change of one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OnlineEvent {
    pub device_id: String,
    pub online: bool,
}

/// Periodic pile connectivity poller
pub struct OnlineStatusWatcher {
    kv: Arc<dyn SnapshotStore>,
    devices: Arc<dyn DeviceDirectory>,
    interval: Duration,
    known: DashMap<String, bool>,
    events: broadcast::Sender<OnlineEvent>,
    running: AtomicBool,
}

impl OnlineStatusWatcher {
    pub fn new(
        kv: Arc<dyn SnapshotStore>,
        devices: Arc<dyn DeviceDirectory>,
        config: &WatcherConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            kv,
            devices,
            interval: config.poll_interval(),
            known: DashMap::new(),
            events,
            running: AtomicBool::new(false),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<OnlineEvent> {
        self.events.subscribe()
    }

    /// Last observed status; devices never seen online read as offline
    pub fn is_online(&self, device_id: &str) -> bool {
        self.known.get(device_id).map(|v| *v).unwrap_or(false)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Poll every pile once; returns how many changed status
    pub async fn poll_once(&self) -> usize {
        if !self.kv.is_connected() {
            debug!("Key-value store not connected, skipping online poll");
            return 0;
        }

        let mut changed = 0;
        for device in self.devices.all_devices() {
            if device.class != DeviceClass::Pile {
                continue;
            }

            let key = online_status_key(&device.station_no, device.equip_order);
            let online = match self.kv.hget(&key, "comm").await {
                Ok(value) => value.as_deref() == Some("true"),
                Err(KvError::NotReady(_)) => {
                    debug!("Key-value store dropped during online poll");
                    break;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Online status read failed");
                    false
                }
            };

            let previous = self.known.insert(device.equip_no.clone(), online).unwrap_or(false);
            if previous != online {
                changed += 1;
                info!(
                    device_id = %device.equip_no,
                    online = online,
                    "Device status changed"
                );
                let _ = self.events.send(OnlineEvent {
                    device_id: device.equip_no,
                    online,
                });
            }
        }

        if changed > 0 {
            debug!(changed = changed, "Online status refreshed");
        }
        changed
    }

    /// Poll now and then on every interval; `None` if already running
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Online status watcher already running");
            return None;
        }
        info!(interval_ms = self.interval.as_millis() as u64, "Online status watcher started");

        let watcher = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(watcher.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            while watcher.is_running() {
                ticker.tick().await;
                if !watcher.is_running() {
                    break;
                }
                watcher.poll_once().await;
            }
        }))
    }

    /// Stop after the current poll
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Online status watcher stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceIdentity, DeviceRegistry};
    use crate::kv::KvResult;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct ObjectStore {
        connected: AtomicBool,
        comm: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl SnapshotStore for ObjectStore {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn fetch_hash(&self, key: &str) -> KvResult<HashMap<String, String>> {
            Err(KvError::NotFound(key.to_string()))
        }

        async fn find_keys(&self, _pattern: &str) -> KvResult<Vec<String>> {
            Ok(Vec::new())
        }

        async fn get(&self, key: &str) -> KvResult<String> {
            Err(KvError::NotFound(key.to_string()))
        }

        async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>> {
            assert_eq!(field, "comm");
            Ok(self.comm.lock().get(key).cloned())
        }
    }

    fn setup() -> (Arc<ObjectStore>, OnlineStatusWatcher) {
        let kv = Arc::new(ObjectStore::default());
        kv.connected.store(true, Ordering::SeqCst);

        let registry = DeviceRegistry::new();
        registry.insert(DeviceIdentity::new("EQ-1", "PILE").with_station("155261", 1));
        registry.insert(DeviceIdentity::new("EQ-2", "PILE").with_station("155261", 2));
        registry.insert(DeviceIdentity::new("ST-1", "STACK").with_station("155261", 3));

        let watcher = OnlineStatusWatcher::new(
            Arc::clone(&kv) as Arc<dyn SnapshotStore>,
            Arc::new(registry),
            &WatcherConfig::default(),
        );
        (kv, watcher)
    }

    #[test]
    fn test_poll_interval_is_clamped() {
        let config = WatcherConfig {
            enabled: true,
            poll_interval_ms: 10,
        };
        assert_eq!(config.poll_interval(), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_only_changes_are_reported() {
        let (kv, watcher) = setup();
        let mut events = watcher.events();
        kv.comm
            .lock()
            .insert("objects:STA#155261:PILE#1".into(), "true".into());

        assert_eq!(watcher.poll_once().await, 1);
        assert_eq!(
            events.try_recv().unwrap(),
            OnlineEvent {
                device_id: "EQ-1".into(),
                online: true
            }
        );
        assert!(watcher.is_online("EQ-1"));
        assert!(!watcher.is_online("EQ-2"));

        assert_eq!(watcher.poll_once().await, 0);
        assert!(events.try_recv().is_err());

        kv.comm
            .lock()
            .insert("objects:STA#155261:PILE#1".into(), "false".into());
        assert_eq!(watcher.poll_once().await, 1);
        assert!(!events.try_recv().unwrap().online);
    }

    #[tokio::test]
    async fn test_poll_skipped_when_disconnected() {
        let (kv, watcher) = setup();
        kv.connected.store(false, Ordering::SeqCst);
        kv.comm
            .lock()
            .insert("objects:STA#155261:PILE#2".into(), "true".into());

        assert_eq!(watcher.poll_once().await, 0);
        assert!(!watcher.is_online("EQ-2"));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (_kv, watcher) = setup();
        let watcher = Arc::new(watcher);

        let handle = watcher.start();
        assert!(handle.is_some());
        assert!(watcher.start().is_none());

        watcher.stop();
        assert!(!watcher.is_running());
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}
