//! Configuration system.
//!
//! Loads engine configuration from JSON strings/files (file IO left to the
//! binaries). One struct is shared by the gate and game processes; each
//! reads the fields it cares about.

use serde::{Deserialize, Serialize};

/// Root configuration shared by gate/game processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Dispatcher address, e.g. `127.0.0.1:41000`.
    pub dispatcher_addr: String,
    /// Gate listen address for client TCP connections.
    pub gate_addr: String,
    /// Fixed game tick rate.
    pub tick_hz: u32,
    /// Area-of-interest distance on each axis.
    #[serde(default = "default_aoi_distance")]
    pub aoi_distance: f32,
    /// Seconds between periodic entity save sweeps.
    #[serde(default = "default_save_interval_secs")]
    pub save_interval_secs: u64,
    /// Entity type created for each newly connected client.
    #[serde(default = "default_boot_entity")]
    pub boot_entity: String,
    /// Fatal on unknown message types instead of warn-and-drop.
    #[serde(default)]
    pub strict_proto: bool,
}

fn default_aoi_distance() -> f32 {
    100.0
}

fn default_save_interval_secs() -> u64 {
    300
}

fn default_boot_entity() -> String {
    "Avatar".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatcher_addr: "127.0.0.1:41000".to_string(),
            gate_addr: "127.0.0.1:42000".to_string(),
            tick_hz: 30,
            aoi_distance: default_aoi_distance(),
            save_interval_secs: default_save_interval_secs(),
            boot_entity: default_boot_entity(),
            strict_proto: false,
        }
    }
}

impl EngineConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}
