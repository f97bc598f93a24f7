//! Outcome aggregation
//!
//! Folds decoded modules and the device-reported result into the status and
//! summary line stored with each record.

use crate::db::models::CheckStatus;
use crate::decoder::{CcuAttributes, Fault, FaultSeverity};
use crate::AutoCheckError;
use serde::Serialize;

/// Width of the `Summary` column
pub const SUMMARY_MAX_CHARS: usize = 512;

/// One decoded CCU with its active faults
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleReport {
    pub key: String,
    pub index: u32,
    pub attributes: CcuAttributes,
    pub faults: Vec<Fault>,
}

impl ModuleReport {
    pub fn new(key: impl Into<String>, index: u32, attributes: CcuAttributes) -> Self {
        let faults = attributes.faults();
        Self {
            key: key.into(),
            index,
            attributes,
            faults,
        }
    }

    pub fn status(&self) -> CheckStatus {
        self.faults
            .iter()
            .fold(CheckStatus::Ok, |status, fault| match fault.severity {
                FaultSeverity::Error => status.max(CheckStatus::Error),
                FaultSeverity::Warning => status.max(CheckStatus::Warn),
            })
    }
}

/// Which message ended the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeSource {
    Notice,
    FinalResult,
}

/// What the device said about its own check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedOutcome {
    pub source: OutcomeSource,
    pub result: i64,
    pub success_count: Option<i64>,
    pub fail_count: Option<i64>,
    pub code: Option<i64>,
}

impl ReportedOutcome {
    pub fn is_failure(&self) -> bool {
        self.result != 0 || self.fail_count.unwrap_or(0) > 0
    }
}

/// Status, summary line and module tallies of one check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckSummary {
    pub status: CheckStatus,
    pub summary: String,
    pub ok_modules: i64,
    pub faulty_modules: i64,
}

/// Combine decode outcome and reported result
///
/// A decode failure is an error unless the device class simply has no
/// module data, in which case the reported result decides.
pub fn summarize(
    modules: &std::result::Result<Vec<ModuleReport>, AutoCheckError>,
    reported: &ReportedOutcome,
) -> CheckSummary {
    let (mut status, mut summary, ok_modules, faulty_modules) = match modules {
        Ok(modules) => {
            let faulty: Vec<&ModuleReport> =
                modules.iter().filter(|m| !m.faults.is_empty()).collect();
            let status = modules
                .iter()
                .fold(CheckStatus::Ok, |status, m| status.max(m.status()));

            let summary = if faulty.is_empty() {
                format!("All modules normal ({} checked)", modules.len())
            } else {
                let flags: Vec<String> = faulty
                    .iter()
                    .flat_map(|m| {
                        m.faults
                            .iter()
                            .map(move |f| format!("CCU#{} {}", m.index, f.flag))
                    })
                    .collect();
                format!(
                    "{} of {} modules reported faults: {}",
                    faulty.len(),
                    modules.len(),
                    flags.join(", ")
                )
            };
            (
                status,
                summary,
                (modules.len() - faulty.len()) as i64,
                faulty.len() as i64,
            )
        }
        Err(AutoCheckError::Unimplemented(what)) => {
            let status = if reported.is_failure() {
                CheckStatus::Error
            } else {
                CheckStatus::Ok
            };
            (status, format!("Module data not available: {}", what), 0, 0)
        }
        Err(err) => (
            CheckStatus::Error,
            format!("Self-check data unavailable: {}", err),
            0,
            0,
        ),
    };

    if reported.is_failure() {
        status = status.max(CheckStatus::Error);
        summary.push_str(&format!(
            "; device reported result {} with {} failed items",
            reported.result,
            reported.fail_count.unwrap_or(0)
        ));
    }

    CheckSummary {
        status,
        summary: truncate_chars(&summary, SUMMARY_MAX_CHARS),
        ok_modules,
        faulty_modules,
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}
