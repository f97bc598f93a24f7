//! Self-check orchestration
//!
//! [`SelfCheckOrchestrator`] issues check commands, tracks one in-flight
//! session per device, interprets progress and result notifications, and on
//! a terminal notification fetches and decodes the module snapshot, stores
//! the record and reports the outcome as a [`CheckEvent`].
//!
//! Session state lives in a concurrent map keyed by device id. A terminal
//! notification removes the session before anything is persisted, so a
//! duplicate terminal message finds nothing and each session is written once.

pub mod events;
pub mod protocol;
pub mod session;
pub mod summary;

pub use events::CheckEvent;
pub use protocol::{parse_inbound, CheckCommand, FinalResult, InboundMessage, Notice, NoticeState};
pub use session::{SelfCheckSession, SessionState, Step};
pub use summary::{summarize, CheckSummary, ModuleReport, OutcomeSource, ReportedOutcome};

use crate::bus::{MessageBus, MessageHandler};
use crate::db::models::{CheckCategory, SelfCheckRecord, TriggerSource};
use crate::db::repositories::SelfCheckRecordRepository;
use crate::db::DataStore;
use crate::decoder::decode_ccu;
use crate::device::{DeviceDirectory, DeviceIdentity};
use crate::kv::{aggregate_result_key, ccu_key_pattern, ccu_module_index, SnapshotStore};
use crate::{AutoCheckError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// The `selfcheck` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfCheckConfig {
    /// Routing key check commands are published to
    pub command_routing_key: String,
    pub notice_queue: String,
    pub response_queue: String,
    /// Quiet time after which an in-flight session is failed
    pub session_timeout_secs: u64,
    pub watchdog_interval_secs: u64,
    pub check_category: CheckCategory,
    pub trigger_source: TriggerSource,
    pub triggered_by: Option<String>,
    /// Buffered events per slow observer before it starts lagging
    pub event_capacity: usize,
}

impl Default for SelfCheckConfig {
    fn default() -> Self {
        Self {
            command_routing_key: "AutoCheck.DataServer.req".to_string(),
            notice_queue: "DataServer.AutoCheck.notice".to_string(),
            response_queue: "DataServer.AutoCheck.resp".to_string(),
            session_timeout_secs: 300,
            watchdog_interval_secs: 5,
            check_category: CheckCategory::Remote,
            trigger_source: TriggerSource::Local,
            triggered_by: None,
            event_capacity: 256,
        }
    }
}

impl SelfCheckConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

/// Clients the orchestrator works through
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub bus: Arc<dyn MessageBus>,
    pub kv: Arc<dyn SnapshotStore>,
    pub store: Arc<DataStore>,
    pub devices: Arc<dyn DeviceDirectory>,
}

/// Self-check state machine
pub struct SelfCheckOrchestrator {
    deps: OrchestratorDeps,
    config: SelfCheckConfig,
    sessions: DashMap<String, SelfCheckSession>,
    next_request_id: AtomicU64,
    events: broadcast::Sender<CheckEvent>,
}

impl SelfCheckOrchestrator {
    pub fn new(deps: OrchestratorDeps, config: SelfCheckConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            deps,
            config,
            sessions: DashMap::new(),
            next_request_id: AtomicU64::new(1),
            events,
        }
    }

    pub fn config(&self) -> &SelfCheckConfig {
        &self.config
    }

    /// Receive every event emitted from now on
    pub fn events(&self) -> broadcast::Receiver<CheckEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the active session for a device
    pub fn session(&self, device_id: &str) -> Option<SelfCheckSession> {
        self.sessions.get(device_id).map(|s| s.clone())
    }

    pub fn active_sessions(&self) -> Vec<SelfCheckSession> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    /// Register for notices and final results on the bus
    pub async fn subscribe(self: &Arc<Self>) -> Result<()> {
        for queue in [&self.config.notice_queue, &self.config.response_queue] {
            let handler: Arc<dyn MessageHandler> = Arc::clone(self) as Arc<dyn MessageHandler>;
            self.deps.bus.subscribe(queue, handler).await?;
        }
        Ok(())
    }

    /// Publish a check command for `device_id` and return its request id
    ///
    /// An active session for the same device is superseded. Returns as soon
    /// as the command is published.
    pub async fn trigger_check(&self, device_id: &str) -> Result<u64> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let payload = CheckCommand::new(request_id, device_id).to_bytes()?;

        let session = SelfCheckSession::new(request_id, device_id);
        if let Some(previous) = self.sessions.insert(device_id.to_string(), session) {
            warn!(
                device_id = device_id,
                request_id = request_id,
                superseded = previous.request_id,
                state = %previous.state,
                "Superseding active self-check"
            );
        }

        if let Err(e) = self
            .deps
            .bus
            .publish(&self.config.command_routing_key, &payload)
            .await
        {
            self.sessions
                .remove_if(device_id, |_, s| s.request_id == request_id);
            error!(
                device_id = device_id,
                request_id = request_id,
                error = %e,
                "Failed to publish self-check command"
            );
            self.emit(CheckEvent::progress(
                device_id,
                format!("Self-check command not sent: {}", e),
                false,
            ));
            return Err(e.into());
        }

        info!(device_id = device_id, request_id = request_id, "Self-check command sent");
        self.emit(CheckEvent::progress(device_id, "Self-check command sent", false));
        Ok(request_id)
    }

    /// Dispatch one inbound payload; never fails
    pub async fn handle_payload(&self, payload: &[u8]) {
        match parse_inbound(payload) {
            Ok(InboundMessage::Notice(notice)) => self.on_notice(notice).await,
            Ok(InboundMessage::FinalResult(result)) => self.on_final_result(result).await,
            Ok(InboundMessage::Ignored(what)) => {
                debug!(message = %what, "Ignoring unrelated message");
            }
            Err(e) => {
                warn!(error = %e, bytes = payload.len(), "Dropping malformed self-check message");
            }
        }
    }

    /// Fail every session quiet for longer than the timeout; returns how many
    pub fn expire_stale_sessions(&self) -> usize {
        let now = Instant::now();
        let timeout = self.config.session_timeout();

        let stale: Vec<(String, u64)> = self
            .sessions
            .iter()
            .filter(|s| s.is_stale(now, timeout))
            .map(|s| (s.key().clone(), s.request_id))
            .collect();

        let mut expired = 0;
        for (device_id, request_id) in stale {
            let removed = self.sessions.remove_if(&device_id, |_, s| {
                s.request_id == request_id && s.is_stale(now, timeout)
            });
            let Some((_, mut session)) = removed else {
                continue;
            };

            session.finish(SessionState::Failed, "Self-check timed out");
            warn!(
                device_id = %device_id,
                request_id = request_id,
                timeout_secs = timeout.as_secs(),
                "Self-check timed out"
            );

            self.emit(CheckEvent::TimedOut {
                device_id: device_id.clone(),
                request_id,
            });
            self.emit(CheckEvent::progress(
                device_id.as_str(),
                session.progress_description.as_str(),
                false,
            ));
            self.emit(CheckEvent::Result {
                device_id,
                request_id,
                state: SessionState::Failed,
                result_code: -1,
                success_count: 0,
                fail_count: 0,
            });
            expired += 1;
        }
        expired
    }

    /// Run [`expire_stale_sessions`](Self::expire_stale_sessions) periodically
    ///
    /// The task ends once the orchestrator is dropped.
    pub fn spawn_watchdog(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = Arc::downgrade(self);
        let period = Duration::from_secs(self.config.watchdog_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(orchestrator) = orchestrator.upgrade() else {
                    break;
                };
                orchestrator.expire_stale_sessions();
            }
            debug!("Watchdog stopped");
        })
    }

    async fn on_notice(&self, notice: Notice) {
        let applied = {
            let Some(mut session) = self.sessions.get_mut(&notice.device_id) else {
                debug!(device_id = %notice.device_id, "Notice for device without active session");
                return;
            };
            if notice.index.is_some_and(|index| index != session.request_id) {
                debug!(
                    device_id = %notice.device_id,
                    index = ?notice.index,
                    request_id = session.request_id,
                    "Notice for superseded request"
                );
                return;
            }

            let step = session.state.on_notice(&notice.state);
            match &step {
                Step::Ack => session.touch(&notice.description),
                Step::Advance(SessionState::Started) => {
                    session.state = SessionState::Started;
                    session.touch(&notice.description);
                }
                _ => {}
            }
            (step, session.request_id)
        };

        let (step, request_id) = applied;
        let device_id = notice.device_id.as_str();

        match step {
            Step::Ignore(reason) => {
                if matches!(notice.state, NoticeState::Unknown(_)) {
                    warn!(device_id = device_id, reason = %reason, "Ignoring self-check notice");
                } else {
                    debug!(device_id = device_id, reason = %reason, "Ignoring self-check notice");
                }
            }
            Step::Ack => {
                debug!(device_id = device_id, request_id = request_id, "Command acknowledged");
                self.emit(CheckEvent::progress(device_id, notice.description.as_str(), false));
            }
            Step::Advance(SessionState::Started) => {
                info!(device_id = device_id, request_id = request_id, "Self-check started");
                let description = non_empty(&notice.description, "Self-check started");
                self.emit(CheckEvent::progress(device_id, description, true));
            }
            Step::Advance(_) => {
                let removed = self
                    .sessions
                    .remove_if(device_id, |_, s| s.request_id == request_id);
                let Some((_, session)) = removed else {
                    debug!(
                        device_id = device_id,
                        request_id = request_id,
                        "Session already concluded"
                    );
                    return;
                };

                let outcome = ReportedOutcome {
                    source: OutcomeSource::Notice,
                    result: notice.result.unwrap_or(0),
                    success_count: notice.success_count,
                    fail_count: notice.fail_count,
                    code: None,
                };
                let state = if outcome.is_failure() {
                    SessionState::Failed
                } else {
                    SessionState::Completed
                };
                let description =
                    non_empty(&notice.description, "Self-check completed").to_string();
                self.conclude(session, state, description, outcome).await;
            }
        }
    }

    async fn on_final_result(&self, result: FinalResult) {
        let removed = self.sessions.remove_if(&result.device_id, |_, s| {
            result.index.map_or(true, |index| index == s.request_id)
        });
        let Some((_, session)) = removed else {
            debug!(
                device_id = %result.device_id,
                index = ?result.index,
                "Final result without matching session"
            );
            return;
        };

        let outcome = ReportedOutcome {
            source: OutcomeSource::FinalResult,
            result: result.result,
            success_count: Some(result.success_count),
            fail_count: Some(result.fail_count),
            code: Some(result.code),
        };
        let state = if result.succeeded() {
            SessionState::Completed
        } else {
            SessionState::Failed
        };
        self.conclude(session, state, result.description(), outcome)
            .await;
    }

    /// Finish a removed session: persist, then report
    async fn conclude(
        &self,
        mut session: SelfCheckSession,
        state: SessionState,
        description: String,
        outcome: ReportedOutcome,
    ) {
        session.finish(state, description.as_str());
        info!(
            device_id = %session.device_id,
            request_id = session.request_id,
            state = %state,
            result = outcome.result,
            "Self-check finished"
        );
        self.emit(CheckEvent::progress(
            session.device_id.as_str(),
            description,
            false,
        ));

        let (state, tallies) = match self.persist(&session, &outcome).await {
            Ok(summary) => (state, Some(summary)),
            Err(e) => {
                error!(
                    device_id = %session.device_id,
                    request_id = session.request_id,
                    error = %e,
                    "Failed to persist self-check result"
                );
                (SessionState::Failed, None)
            }
        };

        let success_count = outcome
            .success_count
            .or(tallies.as_ref().map(|t| t.ok_modules))
            .unwrap_or(0);
        let fail_count = outcome
            .fail_count
            .or(tallies.as_ref().map(|t| t.faulty_modules))
            .unwrap_or(0);

        self.emit(CheckEvent::Result {
            device_id: session.device_id,
            request_id: session.request_id,
            state,
            result_code: outcome.result,
            success_count,
            fail_count,
        });
    }

    /// Fetch, decode, summarize and store one outcome
    async fn persist(
        &self,
        session: &SelfCheckSession,
        outcome: &ReportedOutcome,
    ) -> Result<CheckSummary> {
        let device = self.deps.devices.device(&session.device_id);

        let modules = match &device {
            Some(device) => self.collect_modules(device).await,
            None => Err(AutoCheckError::NotFound(format!(
                "device {} is not registered",
                session.device_id
            ))),
        };
        if let Err(e) = &modules {
            warn!(device_id = %session.device_id, error = %e, "Module snapshot unavailable");
        }

        let aggregate = match &device {
            Some(device) => self.read_aggregate(device).await,
            None => None,
        };

        let summary = summarize(&modules, outcome);
        let details = details_document(session, device.as_ref(), &modules, outcome, aggregate);
        let equip_type = device
            .as_ref()
            .map(|d| d.type_name.clone())
            .unwrap_or_else(|| "UNKNOWN".to_string());

        let record = SelfCheckRecord::new(
            equip_type,
            session.device_id.as_str(),
            self.config.check_category,
            summary.status,
            summary.summary.as_str(),
        )
        .with_details(&details)
        .with_trigger(self.config.trigger_source, self.config.triggered_by.clone());

        SelfCheckRecordRepository::insert(&self.deps.store, &record).await?;
        info!(
            device_id = %session.device_id,
            request_id = session.request_id,
            status = %summary.status,
            "Self-check record saved"
        );
        Ok(summary)
    }

    /// Read and decode every CCU snapshot of a device, ordered by module
    async fn collect_modules(&self, device: &DeviceIdentity) -> Result<Vec<ModuleReport>> {
        if !device.class.supports_decode() {
            return Err(AutoCheckError::Unimplemented(format!(
                "{} devices have no CCU snapshots",
                device.class
            )));
        }
        if !self.deps.kv.is_connected() {
            return Err(AutoCheckError::TransportNotReady(
                "key-value store is not connected".to_string(),
            ));
        }

        let mut keys: Vec<(u32, String)> = self
            .deps
            .kv
            .find_keys(&ccu_key_pattern(device))
            .await?
            .into_iter()
            .filter_map(|key| ccu_module_index(&key).map(|index| (index, key)))
            .collect();
        keys.sort();

        if keys.is_empty() {
            return Err(AutoCheckError::NotFound(format!(
                "no CCU snapshots for {}",
                device.equip_no
            )));
        }

        let mut modules = Vec::with_capacity(keys.len());
        for (index, key) in keys {
            let hash = self.deps.kv.fetch_hash(&key).await?;
            let decoded = decode_ccu(Some(&hash))
                .map_err(|e| AutoCheckError::NotFound(format!("{}: {}", key, e)))?;
            let index = decoded.attributes.index.unwrap_or(index);
            modules.push(ModuleReport::new(key, index, decoded.attributes));
        }

        debug!(device_id = %device.equip_no, modules = modules.len(), "Decoded CCU snapshots");
        Ok(modules)
    }

    /// The `AutoCheck:Result:*` blob, if the device left one
    async fn read_aggregate(&self, device: &DeviceIdentity) -> Option<Value> {
        if !self.deps.kv.is_connected() {
            return None;
        }
        let key = aggregate_result_key(device);
        match self.deps.kv.get(&key).await {
            Ok(raw) => Some(serde_json::from_str(&raw).unwrap_or(Value::String(raw))),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read aggregate result");
                None
            }
        }
    }

    fn emit(&self, event: CheckEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl MessageHandler for SelfCheckOrchestrator {
    async fn handle(&self, payload: Vec<u8>) {
        self.handle_payload(&payload).await;
    }
}

fn non_empty<'a>(text: &'a str, fallback: &'a str) -> &'a str {
    if text.is_empty() {
        fallback
    } else {
        text
    }
}

fn details_document(
    session: &SelfCheckSession,
    device: Option<&DeviceIdentity>,
    modules: &Result<Vec<ModuleReport>>,
    outcome: &ReportedOutcome,
    aggregate: Option<Value>,
) -> Value {
    let device = match device {
        Some(d) => json!({
            "equipNo": d.equip_no,
            "type": d.type_name,
            "stationNo": d.station_no,
            "connectorCount": d.connector_count,
            "name": d.name,
        }),
        None => json!({ "equipNo": session.device_id }),
    };
    let (modules, error) = match modules {
        Ok(modules) => (json!(modules), Value::Null),
        Err(e) => (json!([]), json!(e.to_string())),
    };

    json!({
        "requestId": session.request_id,
        "device": device,
        "modules": modules,
        "reported": outcome,
        "aggregate": aggregate,
        "error": error,
        "startedAt": session.started_at.to_rfc3339(),
        "finishedAt": session.finished_at.map(|t| t.to_rfc3339()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::CcuAttributes;

    #[test]
    fn test_default_config() {
        let config = SelfCheckConfig::default();
        assert_eq!(config.command_routing_key, "AutoCheck.DataServer.req");
        assert_eq!(config.session_timeout(), Duration::from_secs(300));
        assert_eq!(config.check_category, CheckCategory::Remote);
    }

    #[test]
    fn test_details_document_shape() {
        let mut session = SelfCheckSession::new(4, "EQ-1");
        session.finish(SessionState::Completed, "done");
        let device = DeviceIdentity::new("EQ-1", "PILE").with_station("155261", 2);
        let modules = Ok(vec![ModuleReport::new("k", 1, CcuAttributes::default())]);
        let outcome = ReportedOutcome {
            source: OutcomeSource::Notice,
            result: 0,
            success_count: None,
            fail_count: Some(0),
            code: None,
        };

        let doc = details_document(&session, Some(&device), &modules, &outcome, None);
        assert_eq!(doc["requestId"], 4);
        assert_eq!(doc["device"]["stationNo"], "155261");
        assert_eq!(doc["modules"][0]["index"], 1);
        assert_eq!(doc["reported"]["source"], "notice");
        assert!(doc["error"].is_null());
        assert!(doc["finishedAt"].is_string());
    }

    #[test]
    fn test_details_document_records_error() {
        let session = SelfCheckSession::new(1, "EQ-9");
        let modules = Err(AutoCheckError::NotFound("device EQ-9 is not registered".into()));
        let outcome = ReportedOutcome {
            source: OutcomeSource::FinalResult,
            result: 0,
            success_count: Some(1),
            fail_count: Some(0),
            code: Some(0),
        };

        let doc = details_document(&session, None, &modules, &outcome, None);
        assert_eq!(doc["device"]["equipNo"], "EQ-9");
        assert!(doc["error"].as_str().unwrap().contains("not registered"));
        assert_eq!(doc["modules"], json!([]));
    }
}
