//! Fabric configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("max_payload_size must be greater than 0")]
    ZeroPayloadSize,
    #[error("channel_capacity must be greater than 0")]
    ZeroChannelCapacity,
    #[error("max_batch_routes must be greater than 0")]
    ZeroBatchRoutes,
}

/// Limits applied at dispatch and batch boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricConfig {
    /// Maximum serialized payload size in bytes (default: 1 MiB).
    pub max_payload_size: usize,
    /// Buffer size for per-call response channels (default: 32).
    pub channel_capacity: usize,
    /// Maximum routes accepted in a single batch (default: 100).
    pub max_batch_routes: usize,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1024 * 1024,
            channel_capacity: 32,
            max_batch_routes: 100,
        }
    }
}

impl FabricConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn with_max_batch_routes(mut self, max: usize) -> Self {
        self.max_batch_routes = max;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.max_payload_size == 0 {
            return Err(ConfigValidationError::ZeroPayloadSize);
        }
        if self.channel_capacity == 0 {
            return Err(ConfigValidationError::ZeroChannelCapacity);
        }
        if self.max_batch_routes == 0 {
            return Err(ConfigValidationError::ZeroBatchRoutes);
        }
        Ok(())
    }
}
