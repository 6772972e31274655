//! Configuration system.
//!
//! Loads core configuration from JSON strings (file IO left to app).

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// Root configuration for the sync core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Fixed master tick rate.
    pub tick_hz: u32,
    /// Side length of a spatial grid cell.
    pub cell_size: i32,
    /// World extent in world units.
    pub world_width: i32,
    pub world_height: i32,
    /// Maximum partition extent; boundary partitions are clipped.
    pub partition_width: i32,
    pub partition_height: i32,
    /// Default interest radius for new sessions.
    #[serde(default = "default_interest_radius")]
    pub interest_radius: i32,
    /// Seconds between persistence sweeps. 0 disables persistence.
    #[serde(default = "default_persist_every_secs")]
    pub persist_every_secs: u32,
}

fn default_interest_radius() -> i32 {
    64
}

fn default_persist_every_secs() -> u32 {
    30
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tick_hz: 64,
            cell_size: 32,
            world_width: 1024,
            world_height: 1024,
            partition_width: 256,
            partition_height: 256,
            interest_radius: default_interest_radius(),
            persist_every_secs: default_persist_every_secs(),
        }
    }
}

impl SyncConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Rejects configurations that cannot drive the core.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tick_hz == 0 {
            bail!("tick_hz must be non-zero");
        }
        if self.cell_size <= 0 {
            bail!("cell_size must be positive, got {}", self.cell_size);
        }
        if self.world_width <= 0 || self.world_height <= 0 {
            bail!(
                "world extent must be positive, got {}x{}",
                self.world_width,
                self.world_height
            );
        }
        if self.partition_width <= 0 || self.partition_height <= 0 {
            bail!(
                "partition extent must be positive, got {}x{}",
                self.partition_width,
                self.partition_height
            );
        }
        if self.interest_radius < 0 {
            bail!("interest_radius must not be negative");
        }
        Ok(())
    }
}
