//! Database models

pub mod self_check_record;

pub use self_check_record::{CheckCategory, CheckStatus, SelfCheckRecord, TriggerSource};
