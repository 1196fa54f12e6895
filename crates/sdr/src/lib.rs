//! Shared Rx/Tx front-end access: one physical radio, two independently
//! started logical devices, real-time streaming workers.

pub mod attr;
pub mod backend;
pub mod buddy;
pub mod config;
pub mod device;
pub mod error;
pub mod ident;
pub mod port;
pub mod registry;
pub mod settings;
pub mod shared;
pub mod worker;

mod rx_worker;
mod tx_worker;

use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub use config::StreamConfig;
pub use device::{DeviceMessage, LogicalDevice, SampleQueue};
pub use error::{Result, SdrError};
pub use ident::DeviceId;
pub use port::{BufferHandle, HardwarePort, PortHandle};
pub use registry::DeviceRegistry;
pub use settings::{CrossNotification, DeviceSettings, GainMode, SettingKey, SharedSettings};

/// Sample buffer: a block of interleaved int16 IQ samples
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuf {
    /// Interleaved I,Q,I,Q,... as i16
    pub data: Vec<i16>,
    /// Number of complex samples (data.len() / 2)
    pub num_samples: usize,
}

impl SampleBuf {
    pub fn from_interleaved(data: Vec<i16>) -> Self {
        let num_samples = data.len() / 2;
        Self { data, num_samples }
    }
}

/// Which half of the front-end a logical device drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Rx,
    Tx,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Rx => Side::Tx,
            Side::Tx => Side::Rx,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Rx => "rx",
            Side::Tx => "tx",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rx" | "input" => Ok(Side::Rx),
            "tx" | "output" => Ok(Side::Tx),
            other => Err(format!("unknown side '{}' (use rx or tx)", other)),
        }
    }
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
