use std::time::Duration;

use crate::error::{Result, SdrError};

/// Hardware transfers are sized in multiples of this many complex samples.
pub const TRANSFER_GRANULARITY: usize = 64;

/// Default hardware block: 16K complex samples.
pub const DEFAULT_BLOCK_SIZE: usize = 16 * 1024;

/// Streaming and coordination parameters shared by both sides of a device.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Complex samples per hardware buffer transfer
    pub block_size: usize,
    /// How long the Tx worker waits on its upstream queue before zero-filling
    pub poll_interval: Duration,
    /// Bound on stopping a worker during a shared change or on stop
    pub suspend_timeout: Duration,
    /// Sleep after a short or failed transfer
    pub shortfall_backoff: Duration,
    /// Consecutive short transfers before the stream is reported degraded
    pub degraded_after: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            poll_interval: Duration::from_millis(20),
            suspend_timeout: Duration::from_secs(2),
            shortfall_backoff: Duration::from_millis(5),
            degraded_after: 3,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size % TRANSFER_GRANULARITY != 0 {
            return Err(SdrError::InvalidSetting {
                key: "block_size",
                reason: format!(
                    "{} is not a non-zero multiple of {}",
                    self.block_size, TRANSFER_GRANULARITY
                ),
            });
        }
        if self.degraded_after == 0 {
            return Err(SdrError::InvalidSetting {
                key: "degraded_after",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(StreamConfig::default().validate().is_ok());
        assert_eq!(DEFAULT_BLOCK_SIZE % TRANSFER_GRANULARITY, 0);
    }

    #[test]
    fn test_rejects_unaligned_block() {
        let cfg = StreamConfig {
            block_size: 1000,
            ..StreamConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(SdrError::InvalidSetting { key: "block_size", .. })
        ));
    }
}
