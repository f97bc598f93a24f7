//! Self-check wire format
//!
//! Outbound: `{"ReqType":1010,"Index":n,"Content":{"pileId":"..."}}`.
//! Inbound notices carry `NoticeType`; inbound final results carry
//! `ReqType` and `Result`. Both keep the device id in `Data.pileId`.

use crate::{AutoCheckError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request and notice type of the self-check exchange
pub const SELF_CHECK_TYPE: i64 = 1010;

/// Outbound check command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CheckCommand {
    pub req_type: i64,
    /// Request id, echoed back by some gateways
    pub index: u64,
    pub content: CommandContent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandContent {
    #[serde(rename = "pileId")]
    pub pile_id: String,
}

impl CheckCommand {
    pub fn new(request_id: u64, device_id: impl Into<String>) -> Self {
        Self {
            req_type: SELF_CHECK_TYPE,
            index: request_id,
            content: CommandContent {
                pile_id: device_id.into(),
            },
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// `Data.state` of a progress notice
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeState {
    CmdSent,
    Started,
    Completed,
    Unknown(String),
}

impl NoticeState {
    pub fn parse(value: &str) -> Self {
        match value {
            "CMD_SENT" => NoticeState::CmdSent,
            "STARTED" => NoticeState::Started,
            "COMPLETED" => NoticeState::Completed,
            other => NoticeState::Unknown(other.to_string()),
        }
    }
}

/// Progress notice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub device_id: String,
    pub description: String,
    pub state: NoticeState,
    pub result: Option<i64>,
    pub success_count: Option<i64>,
    pub fail_count: Option<i64>,
    /// Echoed request id, when present
    pub index: Option<u64>,
}

/// Terminal result message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalResult {
    pub device_id: String,
    pub result: i64,
    pub success_count: i64,
    pub fail_count: i64,
    pub code: i64,
    pub index: Option<u64>,
}

impl FinalResult {
    pub fn succeeded(&self) -> bool {
        self.result == 0 && self.fail_count == 0
    }

    /// Human-readable outcome
    pub fn description(&self) -> String {
        if self.succeeded() {
            "Self-check succeeded".to_string()
        } else if self.fail_count > 0 {
            format!("Self-check failed ({} items failed)", self.fail_count)
        } else {
            "Self-check finished".to_string()
        }
    }
}

/// A parsed inbound payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Notice(Notice),
    FinalResult(FinalResult),
    /// Well-formed but for another exchange
    Ignored(String),
}

fn malformed(msg: impl Into<String>) -> AutoCheckError {
    AutoCheckError::MalformedMessage(msg.into())
}

fn int_field(obj: &Value, field: &str) -> Option<i64> {
    match obj.get(field)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn index_field(root: &Value) -> Option<u64> {
    int_field(root, "Index").and_then(|i| u64::try_from(i).ok())
}

/// Parse one inbound payload
///
/// Anything that is not JSON, lacks `Data.pileId`, or carries neither a
/// `NoticeType` nor a `ReqType`/`Result` pair is `MalformedMessage`.
pub fn parse_inbound(payload: &[u8]) -> Result<InboundMessage> {
    let root: Value = serde_json::from_slice(payload)
        .map_err(|e| malformed(format!("invalid JSON: {}", e)))?;

    let data = root
        .get("Data")
        .filter(|d| d.is_object())
        .ok_or_else(|| malformed("missing Data object"))?;
    let device_id = data
        .get("pileId")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| malformed("missing Data.pileId"))?
        .to_string();

    if root.get("NoticeType").is_some() {
        let notice_type = int_field(&root, "NoticeType")
            .ok_or_else(|| malformed("NoticeType is not an integer"))?;
        if notice_type != SELF_CHECK_TYPE {
            return Ok(InboundMessage::Ignored(format!("NoticeType {}", notice_type)));
        }

        let state = data
            .get("state")
            .and_then(Value::as_str)
            .map(NoticeState::parse)
            .ok_or_else(|| malformed("missing Data.state"))?;

        return Ok(InboundMessage::Notice(Notice {
            device_id,
            description: data
                .get("desc")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            state,
            result: int_field(data, "result"),
            success_count: int_field(data, "successCount"),
            fail_count: int_field(data, "failCount"),
            index: index_field(&root),
        }));
    }

    if root.get("ReqType").is_some() && root.get("Result").is_some() {
        let req_type =
            int_field(&root, "ReqType").ok_or_else(|| malformed("ReqType is not an integer"))?;
        if req_type != SELF_CHECK_TYPE {
            return Ok(InboundMessage::Ignored(format!("ReqType {}", req_type)));
        }

        return Ok(InboundMessage::FinalResult(FinalResult {
            device_id,
            result: int_field(&root, "Result")
                .ok_or_else(|| malformed("Result is not an integer"))?,
            success_count: int_field(data, "successCount").unwrap_or(0),
            fail_count: int_field(data, "failCount").unwrap_or(0),
            code: int_field(data, "code").unwrap_or(0),
            index: index_field(&root),
        }));
    }

    Err(malformed("missing NoticeType or ReqType/Result"))
}
