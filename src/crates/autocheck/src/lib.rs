//! Remote self-check coordination for charging equipment
//!
//! Sends self-check commands to piles over a message bus, correlates the
//! asynchronous progress and result notifications with the originating
//! request, decodes the per-module fault snapshot from the key-value cache
//! and appends the outcome to the relational store.
//!
//! Every client is built once by the caller and handed to
//! [`check::SelfCheckOrchestrator`]; nothing here is a process-wide singleton.

pub mod bus;
pub mod check;
pub mod config;
pub mod db;
pub mod decoder;
pub mod device;
pub mod kv;
pub mod watcher;

use thiserror::Error;

pub use bus::{BusError, MessageBus, MessageHandler};
pub use check::{CheckEvent, SelfCheckOrchestrator, SessionState};
pub use db::{DataStore, DatabaseError};
pub use decoder::{decode_ccu, CcuAttributes, DecodeError};
pub use device::{DeviceClass, DeviceDirectory, DeviceIdentity, DeviceRegistry};
pub use kv::{KvError, SnapshotStore};

/// Errors surfaced by the self-check core
#[derive(Debug, Error)]
pub enum AutoCheckError {
    /// Missing device, key or record
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation not supported for this device class
    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    /// Bus or key-value client not connected
    #[error("Transport not ready: {0}")]
    TransportNotReady(String),

    /// Relational store failure
    #[error(transparent)]
    Store(#[from] DatabaseError),

    /// Message bus failure other than not-ready
    #[error(transparent)]
    Bus(BusError),

    /// Key-value failure other than not-found and not-ready
    #[error(transparent)]
    Kv(KvError),

    /// Inbound payload that could not be understood
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AutoCheckError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, AutoCheckError::NotFound(_))
    }

    pub fn is_unimplemented(&self) -> bool {
        matches!(self, AutoCheckError::Unimplemented(_))
    }

    pub fn is_not_ready(&self) -> bool {
        matches!(self, AutoCheckError::TransportNotReady(_))
    }
}

impl From<BusError> for AutoCheckError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::NotReady(msg) => AutoCheckError::TransportNotReady(msg),
            other => AutoCheckError::Bus(other),
        }
    }
}

impl From<KvError> for AutoCheckError {
    fn from(err: KvError) -> Self {
        match err {
            KvError::NotFound(key) => AutoCheckError::NotFound(key),
            KvError::NotReady(msg) => AutoCheckError::TransportNotReady(msg),
            other => AutoCheckError::Kv(other),
        }
    }
}

impl From<DecodeError> for AutoCheckError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::NotFound(what) => AutoCheckError::NotFound(what),
        }
    }
}

/// Result type for self-check operations
pub type Result<T> = std::result::Result<T, AutoCheckError>;

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
