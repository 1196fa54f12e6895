use std::time::Duration;

use thiserror::Error;

use crate::Side;

pub type Result<T> = std::result::Result<T, SdrError>;

/// Failures surfaced by the hardware port, the workers and the coordinator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SdrError {
    /// Hardware unreachable or already claimed. Fatal to the device being opened.
    #[error("cannot open {id}: {reason}")]
    DeviceOpen { id: String, reason: String },

    /// A hardware parameter read or write failed. The setting keeps its previous value.
    #[error("attribute {key}: {reason}")]
    Attribute { key: String, reason: String },

    /// A transfer moved fewer samples than the block. Transient.
    #[error("short transfer: {transferred} of {requested} samples")]
    TransferShortfall { requested: usize, transferred: usize },

    /// A worker did not stop within the bound. The shared change was not applied.
    #[error("{side} worker did not stop within {waited:?}")]
    SuspendTimeout { side: Side, waited: Duration },

    #[error("{side} side of {id} is already open")]
    SideInUse { id: String, side: Side },

    #[error("invalid {key}: {reason}")]
    InvalidSetting { key: &'static str, reason: String },

    #[error("device is closed")]
    NotOpen,

    #[error("backend: {0}")]
    Backend(String),
}

impl SdrError {
    pub fn attribute(key: &str, reason: impl Into<String>) -> Self {
        SdrError::Attribute {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}
