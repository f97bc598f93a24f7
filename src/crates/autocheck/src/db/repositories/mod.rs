//! Repositories

pub mod device_repo;
pub mod self_check_repo;

pub use device_repo::DeviceRepository;
pub use self_check_repo::{SelfCheckRecordRepository, SELF_CHECK_RECORD_DDL};
