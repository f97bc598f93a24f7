//! CCU bitfield decoding
//!
//! Turns the flat hash a charge-control unit publishes into structured
//! fault attributes. Each relevant field name carries a flag index before a
//! `;` delimiter (`"7;negative stuck"`), and each value is `1` (true) or
//! `2` (false). Everything else is skipped.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// Number of indexed flags in a CCU hash
pub const CCU_FLAG_COUNT: usize = 32;

const INDEX_DELIMITER: char = ';';
const MODULE_INDEX_FIELD: &str = "index";

/// Decoder errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The input hash is absent or empty
    #[error("CCU hash not found: {0}")]
    NotFound(String),
}

/// AC contactor feedback
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcContactorStatus {
    pub stuck: bool,
    pub refuse: bool,
}

/// Parallel contactor pair feedback
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelContactorStatus {
    pub positive_stuck: bool,
    pub positive_refuse: bool,
    pub negative_stuck: bool,
    pub negative_refuse: bool,
}

/// Fan feedback
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanStatus {
    pub stopped: bool,
    pub rotating: bool,
}

/// Connector ("gun") assembly feedback
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GunStatus {
    pub positive_contactor_stuck: bool,
    pub positive_contactor_refuse: bool,
    pub negative_contactor_stuck: bool,
    pub negative_contactor_refuse: bool,
    pub unlocked: bool,
    pub locked: bool,
    pub aux_power_12v: bool,
    pub aux_power_24v: bool,
}

impl GunStatus {
    fn slot(&mut self, offset: usize) -> Option<&mut bool> {
        Some(match offset {
            0 => &mut self.positive_contactor_refuse,
            1 => &mut self.positive_contactor_stuck,
            2 => &mut self.negative_contactor_refuse,
            3 => &mut self.negative_contactor_stuck,
            4 => &mut self.unlocked,
            5 => &mut self.locked,
            6 => &mut self.aux_power_12v,
            7 => &mut self.aux_power_24v,
            _ => return None,
        })
    }
}

/// Severity of an active flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultSeverity {
    Warning,
    Error,
}

/// One active fault flag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    /// Dotted flag path, e.g. `gun_a.positive_contactor_stuck`
    pub flag: String,
    pub severity: FaultSeverity,
}

/// Decoded attributes of one charge-control unit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CcuAttributes {
    /// Module number, when the hash carries one
    pub index: Option<u32>,
    pub ac_contactor_1: AcContactorStatus,
    pub ac_contactor_2: AcContactorStatus,
    pub parallel_contactor: ParallelContactorStatus,
    pub fan_1: FanStatus,
    pub fan_2: FanStatus,
    pub fan_3: FanStatus,
    pub fan_4: FanStatus,
    pub gun_a: GunStatus,
    pub gun_b: GunStatus,
}

impl CcuAttributes {
    /// Mutable reference to the flag stored at a bitfield index
    fn flag_mut(&mut self, index: usize) -> Option<&mut bool> {
        Some(match index {
            0 => &mut self.ac_contactor_1.refuse,
            1 => &mut self.ac_contactor_1.stuck,
            2 => &mut self.ac_contactor_2.refuse,
            3 => &mut self.ac_contactor_2.stuck,
            4 => &mut self.parallel_contactor.positive_refuse,
            5 => &mut self.parallel_contactor.positive_stuck,
            6 => &mut self.parallel_contactor.negative_refuse,
            7 => &mut self.parallel_contactor.negative_stuck,
            8 => &mut self.fan_1.stopped,
            9 => &mut self.fan_1.rotating,
            10 => &mut self.fan_2.stopped,
            11 => &mut self.fan_2.rotating,
            12 => &mut self.fan_3.stopped,
            13 => &mut self.fan_3.rotating,
            14 => &mut self.fan_4.stopped,
            15 => &mut self.fan_4.rotating,
            16..=23 => return self.gun_a.slot(index - 16),
            24..=31 => return self.gun_b.slot(index - 24),
            _ => return None,
        })
    }

    /// List every active flag that indicates a problem
    ///
    /// Contactor stuck/refuse flags are errors, a stopped fan is a warning.
    /// Lock, rotation and auxiliary power flags are plain feedback.
    pub fn faults(&self) -> Vec<Fault> {
        let mut faults = Vec::new();
        let mut push = |flag: &str, active: bool, severity: FaultSeverity| {
            if active {
                faults.push(Fault {
                    flag: flag.to_string(),
                    severity,
                });
            }
        };

        let (error, warning) = (FaultSeverity::Error, FaultSeverity::Warning);

        for (name, ac) in [
            ("ac_contactor_1", &self.ac_contactor_1),
            ("ac_contactor_2", &self.ac_contactor_2),
        ] {
            push(&format!("{name}.stuck"), ac.stuck, error);
            push(&format!("{name}.refuse"), ac.refuse, error);
        }

        let pc = &self.parallel_contactor;
        push("parallel_contactor.positive_stuck", pc.positive_stuck, error);
        push("parallel_contactor.positive_refuse", pc.positive_refuse, error);
        push("parallel_contactor.negative_stuck", pc.negative_stuck, error);
        push("parallel_contactor.negative_refuse", pc.negative_refuse, error);

        for (name, fan) in [
            ("fan_1", &self.fan_1),
            ("fan_2", &self.fan_2),
            ("fan_3", &self.fan_3),
            ("fan_4", &self.fan_4),
        ] {
            push(&format!("{name}.stopped"), fan.stopped, warning);
        }

        for (name, gun) in [("gun_a", &self.gun_a), ("gun_b", &self.gun_b)] {
            push(&format!("{name}.positive_contactor_stuck"), gun.positive_contactor_stuck, error);
            push(
                &format!("{name}.positive_contactor_refuse"),
                gun.positive_contactor_refuse,
                error,
            );
            push(&format!("{name}.negative_contactor_stuck"), gun.negative_contactor_stuck, error);
            push(
                &format!("{name}.negative_contactor_refuse"),
                gun.negative_contactor_refuse,
                error,
            );
        }

        faults
    }
}

/// Result of decoding one hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCcu {
    pub attributes: CcuAttributes,
    /// Which indices carried a valid `1`/`2` value
    pub seen: [bool; CCU_FLAG_COUNT],
}

impl DecodedCcu {
    /// Indices that were absent or invalid in the input
    pub fn missing_indices(&self) -> Vec<usize> {
        self.seen
            .iter()
            .enumerate()
            .filter_map(|(i, seen)| (!seen).then_some(i))
            .collect()
    }
}

/// Parse the flag index out of a field name such as `"12;fan 3 stopped"`
fn field_index(field: &str) -> Option<usize> {
    let (prefix, _) = field.split_once(INDEX_DELIMITER)?;
    let index: i64 = prefix.trim().parse().ok()?;
    usize::try_from(index).ok().filter(|i| *i < CCU_FLAG_COUNT)
}

/// Map a raw value to a flag: `1` is set, `2` is clear, anything else is skipped
fn flag_value(value: &str) -> Option<bool> {
    match value.trim().parse::<i64>().ok()? {
        1 => Some(true),
        2 => Some(false),
        _ => None,
    }
}

/// Decode a CCU hash
///
/// Malformed fields are dropped silently; only an absent or empty input is
/// an error. Flags whose index is missing keep their default `false`.
pub fn decode_ccu(hash: Option<&HashMap<String, String>>) -> Result<DecodedCcu, DecodeError> {
    let hash = match hash {
        Some(hash) if !hash.is_empty() => hash,
        _ => return Err(DecodeError::NotFound("CCU hash is empty".to_string())),
    };

    let mut attributes = CcuAttributes {
        index: hash
            .get(MODULE_INDEX_FIELD)
            .and_then(|v| v.trim().parse().ok()),
        ..Default::default()
    };
    let mut seen = [false; CCU_FLAG_COUNT];

    for (field, value) in hash {
        let Some(index) = field_index(field) else {
            continue;
        };
        let Some(status) = flag_value(value) else {
            continue;
        };
        if let Some(slot) = attributes.flag_mut(index) {
            *slot = status;
            seen[index] = true;
        }
    }

    let decoded = DecodedCcu { attributes, seen };
    let missing = decoded.missing_indices();
    if !missing.is_empty() {
        debug!(missing = ?missing, "CCU hash is missing flag indices");
    }

    Ok(decoded)
}
