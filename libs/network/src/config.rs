//! Bus Configuration

use crate::error::{BusError, Result};
use serde::Deserialize;
use std::time::Duration;
use types::messages::Compression;

/// Default interval between topology sync broadcasts
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Default inactivity window before a channel is considered dead.
/// Sync traffic is expected every second, so five missed cycles
/// indicates a stalled peer.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(5);

/// Default maximum packet body size (16MB)
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Per-node bus configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Stable identity of this node for the process lifetime
    pub node_id: String,
    /// Algorithm offered when this node initiates a handshake; `None`
    /// means never offer compression
    pub offered_compression: Option<Compression>,
    /// Algorithms this node accepts from peers
    pub allowed_compression: Vec<Compression>,
    /// How often the external scheduler is expected to call
    /// `broadcast_sync`
    pub sync_interval: Duration,
    /// Inactivity window after which `check_liveness` closes a channel
    pub liveness_timeout: Duration,
    /// Maximum accepted packet body length
    pub max_body_bytes: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            node_id: "node-0".to_string(),
            offered_compression: None,
            allowed_compression: vec![Compression::Lz4, Compression::Snappy],
            sync_interval: DEFAULT_SYNC_INTERVAL,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl BusConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Self::default()
        }
    }

    /// Validate the configuration before the bus starts using it.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(BusError::configuration(
                "node_id cannot be empty",
                Some("node_id"),
            ));
        }

        if self.max_body_bytes == 0 {
            return Err(BusError::configuration(
                "max_body_bytes cannot be zero",
                Some("max_body_bytes"),
            ));
        }

        if self.liveness_timeout < self.sync_interval {
            return Err(BusError::configuration(
                "liveness_timeout must be at least the sync_interval",
                Some("liveness_timeout"),
            ));
        }

        if let Some(offered) = self.offered_compression {
            if !self.allowed_compression.contains(&offered) {
                return Err(BusError::configuration(
                    "offered_compression must also be allowed",
                    Some("offered_compression"),
                ));
            }
        }

        Ok(())
    }
}
