//! # Telemetry — Device Metrics Reported via Heartbeat
//!
//! Workers attach a [`DeviceMetrics`] snapshot to every heartbeat request.
//! All utilization figures are normalized fractions in `[0, 1]`; the
//! eligibility predicate in the coordinator reads battery and thermal state
//! directly from the latest snapshot, so out-of-range values are clamped at
//! ingest rather than rejected (a worker with a buggy sensor should still
//! count as alive).

use serde::{Deserialize, Serialize};

/// Battery charging state as reported by the device OS.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatteryState {
    Charging,
    Full,
    Discharging,
    NotCharging,
    #[default]
    Unspecified,
}

impl BatteryState {
    /// States in which a device may be drafted into a training round.
    /// Discharging devices are excluded to avoid draining user batteries.
    pub fn allows_training(self) -> bool {
        matches!(
            self,
            BatteryState::Charging | BatteryState::Full | BatteryState::NotCharging
        )
    }
}

/// A point-in-time utilization snapshot from a worker device.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeviceMetrics {
    /// CPU utilization, 0.0–1.0.
    pub cpu_usage: f64,
    /// Memory utilization, 0.0–1.0.
    pub memory_usage: f64,
    /// Thermal pressure, 0.0 (nominal) – 1.0 (critical).
    pub thermal_state: f64,
    /// Battery charge level, 0.0–1.0.
    pub battery_level: f64,
    #[serde(default)]
    pub battery_state: BatteryState,
    /// OS low-power / battery-saver mode.
    #[serde(default)]
    pub low_power_mode: bool,
}

impl DeviceMetrics {
    /// Clamp every fraction into `[0, 1]`. Applied once at heartbeat ingest.
    pub fn clamped(mut self) -> Self {
        self.cpu_usage = self.cpu_usage.clamp(0.0, 1.0);
        self.memory_usage = self.memory_usage.clamp(0.0, 1.0);
        self.thermal_state = self.thermal_state.clamp(0.0, 1.0);
        self.battery_level = self.battery_level.clamp(0.0, 1.0);
        self
    }
}
