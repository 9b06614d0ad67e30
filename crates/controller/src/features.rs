//! Installed optional subsystems. Fixed at provisioning and never mutated
//! at runtime; every handler and report builder receives it by reference.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub tank: bool,
    pub source: bool,
    pub flow_sensor: bool,
    pub pressure_sensor: bool,
    pub drain_valve: bool,
}

impl FeatureConfig {
    /// Every optional subsystem installed.
    pub fn all() -> Self {
        Self {
            tank: true,
            source: true,
            flow_sensor: true,
            pressure_sensor: true,
            drain_valve: true,
        }
    }

    /// Tank fill time is only meaningful with a metered source feeding a tank.
    pub fn reports_tank_fill_time(&self) -> bool {
        self.tank && self.source
    }
}
