//! Configuration.
//!
//! Process-wide knobs, set at init and shared by both sides of the link.
//! Loads from JSON strings/files (file IO left to the host application).

use serde::{Deserialize, Serialize};

/// Lag-compensation tuning for remotely controlled objects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LagCompensationConfig {
    /// When an input is missing, let the doll replay the closest neighbour
    /// instead of stalling.
    #[serde(default = "default_true")]
    pub doll_allow_guess_input_when_missing: bool,
    /// Extra buffered inputs tolerated before a doll force-requests a
    /// reconciliation.
    #[serde(default = "default_force_input_reconciliation")]
    pub doll_force_input_reconciliation: u32,
    /// Minimum rewind window for the force-reconciliation check to apply.
    #[serde(default = "default_force_input_reconciliation_min_frames")]
    pub doll_force_input_reconciliation_min_frames: u32,
}

impl Default for LagCompensationConfig {
    fn default() -> Self {
        Self {
            doll_allow_guess_input_when_missing: true,
            doll_force_input_reconciliation: default_force_input_reconciliation(),
            doll_force_input_reconciliation_min_frames:
                default_force_input_reconciliation_min_frames(),
        }
    }
}

/// Root configuration shared by client and server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Fixed simulation step, in seconds.
    #[serde(default = "default_fixed_frame_delta")]
    pub fixed_frame_delta: f32,
    /// Lower clamp on the optimal per-peer queued input count.
    #[serde(default = "default_min_frames_delay")]
    pub min_frames_delay: u32,
    /// Upper clamp on the optimal per-peer queued input count.
    #[serde(default = "default_max_frames_delay")]
    pub max_frames_delay: u32,
    /// How many past inputs ride along in each datagram to mask loss.
    /// Bounded by 255: the duplication counter is one byte.
    #[serde(default = "default_max_redundant_inputs")]
    pub max_redundant_inputs: u32,
    /// Ring size of the input-arrival watchers.
    #[serde(default = "default_network_traced_frames")]
    pub network_traced_frames: u32,
    /// Cap on locally retained, not yet server-acknowledged inputs.
    #[serde(default = "default_client_max_frames_storage_size")]
    pub client_max_frames_storage_size: u32,
    /// How often the server tells a client to speed up or slow down.
    #[serde(default = "default_tick_speedup_notification_delay_ms")]
    pub tick_speedup_notification_delay_ms: u32,
    /// Trickled objects transmitted per frame, highest priority first.
    #[serde(default = "default_trickled_objects_per_frame")]
    pub trickled_objects_per_frame: u32,
    #[serde(default)]
    pub lag_compensation: LagCompensationConfig,
}

fn default_true() -> bool {
    true
}

fn default_fixed_frame_delta() -> f32 {
    1.0 / 60.0
}

fn default_min_frames_delay() -> u32 {
    2
}

fn default_max_frames_delay() -> u32 {
    7
}

fn default_max_redundant_inputs() -> u32 {
    6
}

fn default_network_traced_frames() -> u32 {
    120
}

fn default_client_max_frames_storage_size() -> u32 {
    30
}

fn default_tick_speedup_notification_delay_ms() -> u32 {
    600
}

fn default_trickled_objects_per_frame() -> u32 {
    2
}

fn default_force_input_reconciliation() -> u32 {
    10
}

fn default_force_input_reconciliation_min_frames() -> u32 {
    5
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fixed_frame_delta: default_fixed_frame_delta(),
            min_frames_delay: default_min_frames_delay(),
            max_frames_delay: default_max_frames_delay(),
            max_redundant_inputs: default_max_redundant_inputs(),
            network_traced_frames: default_network_traced_frames(),
            client_max_frames_storage_size: default_client_max_frames_storage_size(),
            tick_speedup_notification_delay_ms: default_tick_speedup_notification_delay_ms(),
            trickled_objects_per_frame: default_trickled_objects_per_frame(),
            lag_compensation: LagCompensationConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn fixed_frame_delta_ms(&self) -> u32 {
        (self.fixed_frame_delta * 1000.0) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let cfg = SyncConfig::from_json_str(r#"{"min_frames_delay": 3}"#).unwrap();
        assert_eq!(cfg.min_frames_delay, 3);
        assert_eq!(cfg.max_frames_delay, 7);
        assert!(cfg.lag_compensation.doll_allow_guess_input_when_missing);
    }

    #[test]
    fn frame_delta_in_ms() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.fixed_frame_delta_ms(), 16);
    }
}
