//! Data store retry, reconnect and routing behaviour

mod common;

use autocheck::db::models::{CheckCategory, CheckStatus, TriggerSource};
use autocheck::db::repositories::{DeviceRepository, SelfCheckRecordRepository};
use autocheck::db::{DatabaseError, DbRow, DbValue};
use autocheck::device::DeviceClass;
use common::{database_config, endpoint, setup_store};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn transient() -> DatabaseError {
    DatabaseError::Transient("Lost connection to MySQL server during query (2013)".into())
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_retried_once() {
    let (script, store) = setup_store(database_config());
    script.fail_next(transient());

    let affected = store.update("UPDATE t SET a = ?", &[1i64.into()]).await.unwrap();
    assert_eq!(affected, 1);
    assert_eq!(script.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(script.executed.lock().len(), 1);
    // The failing connection was discarded, not reused
    assert_eq!(script.connect_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_not_retried() {
    let (script, store) = setup_store(database_config());
    script.fail_next(DatabaseError::Permanent(
        "You have an error in your SQL syntax".into(),
    ));

    let err = store.update("UPDAT t", &[]).await.unwrap_err();
    assert!(matches!(err, DatabaseError::Permanent(_)));
    assert_eq!(script.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(store.stats().master.discarded, 0);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_cycle_after_retries_exhausted() {
    let (script, store) = setup_store(database_config());
    // Default policy: one attempt plus two retries
    for _ in 0..3 {
        script.fail_next(transient());
    }

    let result = store.update("DELETE FROM t", &[]).await;
    assert!(result.is_ok());
    assert_eq!(script.attempts.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_cycle_runs_full_retry_policy() {
    let (script, store) = setup_store(database_config());
    // Three fail before the reconnect, two more after it
    for _ in 0..5 {
        script.fail_next(transient());
    }

    let result = store.update("DELETE FROM t", &[]).await;
    assert!(result.is_ok());
    assert_eq!(script.attempts.load(Ordering::SeqCst), 6);
    assert_eq!(script.executed.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_cycle_gives_up_after_second_policy() {
    let (script, store) = setup_store(database_config());
    for _ in 0..7 {
        script.fail_next(transient());
    }

    let err = store.update("DELETE FROM t", &[]).await.unwrap_err();
    assert!(err.is_transient());
    // Two full cycles of one attempt plus two retries
    assert_eq!(script.attempts.load(Ordering::SeqCst), 6);
    assert_eq!(script.failures.lock().len(), 1);
}

#[tokio::test]
async fn test_reads_fall_back_to_master_without_replicas() {
    let (script, store) = setup_store(database_config());

    store.query("SELECT 1", &[], true).await.unwrap();
    assert_eq!(*script.connects.lock(), vec!["master".to_string()]);
    assert!(store.stats().replica.is_none());
}

#[tokio::test]
async fn test_replica_preferring_reads_use_replica() {
    let mut config = database_config();
    config.replicas = vec![endpoint("replica-1")];
    let (script, store) = setup_store(config);

    store.query("SELECT 1", &[], true).await.unwrap();
    store.query("SELECT 1", &[], false).await.unwrap();
    store.update("UPDATE t SET a = 1", &[]).await.unwrap();

    let connects = script.connects.lock().clone();
    assert_eq!(connects, vec!["replica-1".to_string(), "master".to_string()]);
    let stats = store.stats();
    assert_eq!(stats.statements, 3);
    assert_eq!(stats.replica.map(|r| r.created), Some(1));
}

#[tokio::test]
async fn test_replica_routing_can_be_disabled() {
    let mut config = database_config();
    config.replicas = vec![endpoint("replica-1")];
    config.behavior.read_from_replicas = false;
    let (script, store) = setup_store(config);

    store.query("SELECT 1", &[], true).await.unwrap();
    assert_eq!(*script.connects.lock(), vec!["master".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_slow_statements_are_counted() {
    let mut config = database_config();
    config.behavior.slow_sql_ms = 50;
    let (script, store) = setup_store(config);

    store.query("SELECT 1", &[], false).await.unwrap();
    *script.delay.lock() = Some(Duration::from_millis(120));
    store.query("SELECT SLEEP(1)", &[], false).await.unwrap();

    let stats = store.stats();
    assert_eq!(stats.statements, 2);
    assert_eq!(stats.slow_statements, 1);
}

#[tokio::test(start_paused = true)]
async fn test_pool_exhaustion_is_reported() {
    let mut config = database_config();
    config.pool = config.pool.with_max_size(1).with_acquire_timeout(100);
    let (script, store) = setup_store(config);
    *script.delay.lock() = Some(Duration::from_secs(5));

    let holder = Arc::clone(&store);
    let busy = tokio::spawn(async move { holder.update("UPDATE t SET a = 1", &[]).await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let err = store.query("SELECT 1", &[], false).await.unwrap_err();
    assert!(err.is_pool_exhausted());
    // Exhaustion is not retried
    assert_eq!(script.attempts.load(Ordering::SeqCst), 1);

    assert!(busy.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_blocked_acquire_proceeds_after_release() {
    let mut config = database_config();
    config.pool = config.pool.with_max_size(1).with_acquire_timeout(3000);
    let (script, store) = setup_store(config);
    *script.delay.lock() = Some(Duration::from_secs(1));

    let holder = Arc::clone(&store);
    let busy = tokio::spawn(async move { holder.update("UPDATE t SET a = 1", &[]).await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let started = tokio::time::Instant::now();
    store.query("SELECT 1", &[], false).await.unwrap();
    // Waited for the holder, then reused its connection
    assert!(started.elapsed() >= Duration::from_millis(990));
    assert_eq!(script.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(script.connect_count(), 1);

    assert!(busy.await.unwrap().is_ok());
    let stats = store.stats().master;
    assert_eq!((stats.total, stats.idle, stats.in_use), (1, 1, 0));
}

#[tokio::test]
async fn test_connect_warms_up_master() {
    let mut config = database_config();
    config.pool.min_idle = 2;
    let connector = common::FakeConnector::default();
    let script = Arc::clone(&connector.script);

    let store = autocheck::DataStore::connect(config, Arc::new(connector))
        .await
        .unwrap();
    assert_eq!(script.connect_count(), 2);
    assert_eq!(store.stats().master.idle, 2);
}

#[tokio::test]
async fn test_connect_fails_when_master_unreachable() {
    let mut config = database_config();
    config.pool.min_idle = 1;
    let connector = common::FakeConnector::default();
    connector.script.fail_connect.store(true, Ordering::SeqCst);

    let result = autocheck::DataStore::connect(config, Arc::new(connector)).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_recent_records_are_mapped() {
    let (script, store) = setup_store(database_config());
    script.rows.lock().push(
        DbRow::new()
            .with("ID", "42")
            .with("Type", "PILE")
            .with("EquipNo", "EQ-1")
            .with("CheckCategory", "REMOTE")
            .with("Status", "WARN")
            .with("Summary", "1 of 2 modules reported faults: CCU#2 fan_2.stopped")
            .with("DetailsJSON", r#"{"requestId":7}"#)
            .with("TriggerSource", "WEB")
            .with("CreatedAt", "2024-05-01 10:00:00"),
    );

    let records = SelfCheckRecordRepository::recent_for_device(&store, "EQ-1", 5)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.id, Some(42));
    assert_eq!(record.check_category, CheckCategory::Remote);
    assert_eq!(record.status, CheckStatus::Warn);
    assert_eq!(record.trigger_source, TriggerSource::Web);
    assert!(record.triggered_by.is_none());
    assert_eq!(record.details().unwrap()["requestId"], 7);

    let executed = script.executed.lock();
    assert_eq!(
        executed[0].1,
        vec![DbValue::Text("EQ-1".into()), DbValue::Int(5)]
    );
}

#[tokio::test]
async fn test_unknown_status_is_a_mapping_error() {
    let (script, store) = setup_store(database_config());
    script.rows.lock().push(
        DbRow::new()
            .with("ID", "1")
            .with("CheckCategory", "REMOTE")
            .with("Status", "BROKEN")
            .with("TriggerSource", "LOCAL"),
    );

    let err = SelfCheckRecordRepository::recent_for_device(&store, "EQ-1", 1)
        .await
        .unwrap_err();
    assert!(matches!(err, DatabaseError::RowMapping(_)));
}

#[tokio::test]
async fn test_load_piles_skips_rows_without_number() {
    let (script, store) = setup_store(database_config());
    script.rows.lock().extend([
        DbRow::new()
            .with("ID", "1")
            .with("StationNo", "155261")
            .with("EquipNo", "EQ-1")
            .with("Type", "PILE")
            .with("GunCount", "2")
            .with("EquipOrder", "1"),
        DbRow::new().with("ID", "2").with("Type", "PILE"),
    ]);

    let piles = DeviceRepository::load_piles(&store).await.unwrap();
    assert_eq!(piles.len(), 1);
    assert_eq!(piles[0].class, DeviceClass::Pile);
    assert_eq!(piles[0].connector_count, 2);
}
