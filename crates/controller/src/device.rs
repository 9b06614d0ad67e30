//! Device configuration model, partial config changes, and the device-state
//! record that command handlers mutate.

use serde::{Deserialize, Serialize};

use crate::features::FeatureConfig;
use crate::guard::{ProcessGuard, TargetParameters};
use crate::payload::{FieldError, Payload};

// ---------------------------------------------------------------------------
// Configuration model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub services: ServicesConfig,
    pub source: SourceConfig,
    pub tank: TankConfig,
    pub flow_sensor: FlowSensorConfig,
    pub pressure_sensor: PressureSensorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Liters dispensed between two slice reports.
    pub data_resolution_l: u32,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            data_resolution_l: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub static_flow_rate: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TankConfig {
    pub timeout_secs: u32,
    pub shape_type: f32,
    pub dimension_1: u32,
    pub dimension_2: f32,
    pub dimension_3: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowSensorConfig {
    pub pulses_per_l: f32,
    pub max_flow_rate: f32,
    pub min_flow_rate: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureSensorConfig {
    pub report_mode: ReportMode,
    pub atmosphere_pressure: i32,
}

/// Which pressure-derived values telemetry carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ReportMode {
    #[default]
    Off,
    Pressure,
    Volume,
    Both,
}

impl ReportMode {
    pub fn includes_pressure(self) -> bool {
        matches!(self, Self::Pressure | Self::Both)
    }

    pub fn includes_volume(self) -> bool {
        matches!(self, Self::Volume | Self::Both)
    }
}

impl TryFrom<u8> for ReportMode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Off),
            1 => Ok(Self::Pressure),
            2 => Ok(Self::Volume),
            3 => Ok(Self::Both),
            other => Err(format!("report mode {other} is not one of 0, 1, 2, 3")),
        }
    }
}

impl From<ReportMode> for u8 {
    fn from(mode: ReportMode) -> Self {
        match mode {
            ReportMode::Off => 0,
            ReportMode::Pressure => 1,
            ReportMode::Volume => 2,
            ReportMode::Both => 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Partial updates
// ---------------------------------------------------------------------------

/// A validated config-change request. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigChange {
    pub data_resolution_l: Option<u32>,
    pub static_flow_rate: Option<f32>,
    pub tank_timeout_secs: Option<u32>,
    pub tank_shape_type: Option<f32>,
    pub tank_dimension_1: Option<u32>,
    pub tank_dimension_2: Option<f32>,
    pub tank_dimension_3: Option<f32>,
    pub pulses_per_l: Option<f32>,
    pub max_flow_rate: Option<f32>,
    pub min_flow_rate: Option<f32>,
    pub report_mode: Option<ReportMode>,
    pub atmosphere_pressure: Option<i32>,
}

impl ConfigChange {
    /// Read every recognised leaf that belongs to an installed feature.
    /// Sections for missing features are skipped without inspection.
    pub fn parse(payload: &Payload, features: &FeatureConfig) -> Result<Self, FieldError> {
        let mut change = Self {
            data_resolution_l: payload.u32("srvc.res")?,
            ..Self::default()
        };

        if features.source {
            change.static_flow_rate = payload.f32("src.rate")?;
        }

        if features.tank {
            change.tank_timeout_secs = payload.u32("tnk.time")?;
            change.tank_shape_type = payload.f32("tnk.shape")?;
            change.tank_dimension_1 = payload.u32("tnk.dim1")?;
            change.tank_dimension_2 = payload.f32("tnk.dim2")?;
            change.tank_dimension_3 = payload.f32("tnk.dim3")?;
        }

        if features.flow_sensor {
            change.pulses_per_l = payload.f32("flow.ppl")?;
            change.max_flow_rate = payload.f32("flow.max")?;
            change.min_flow_rate = payload.f32("flow.min")?;
        }

        if features.pressure_sensor {
            change.report_mode = payload
                .u32("prssr.mode")?
                .map(|m| {
                    u8::try_from(m)
                        .ok()
                        .and_then(|m| ReportMode::try_from(m).ok())
                        .ok_or_else(|| FieldError::out_of_range("prssr.mode"))
                })
                .transpose()?;
            change.atmosphere_pressure = payload.i32("prssr.atmo")?;
        }

        Ok(change)
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn set<T: Copy>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

impl DeviceConfig {
    pub fn apply(&mut self, change: &ConfigChange) {
        set(&mut self.services.data_resolution_l, change.data_resolution_l);
        set(&mut self.source.static_flow_rate, change.static_flow_rate);
        set(&mut self.tank.timeout_secs, change.tank_timeout_secs);
        set(&mut self.tank.shape_type, change.tank_shape_type);
        set(&mut self.tank.dimension_1, change.tank_dimension_1);
        set(&mut self.tank.dimension_2, change.tank_dimension_2);
        set(&mut self.tank.dimension_3, change.tank_dimension_3);
        set(&mut self.flow_sensor.pulses_per_l, change.pulses_per_l);
        set(&mut self.flow_sensor.max_flow_rate, change.max_flow_rate);
        set(&mut self.flow_sensor.min_flow_rate, change.min_flow_rate);
        set(&mut self.pressure_sensor.report_mode, change.report_mode);
        set(
            &mut self.pressure_sensor.atmosphere_pressure,
            change.atmosphere_pressure,
        );
    }
}

// ---------------------------------------------------------------------------
// Device state
// ---------------------------------------------------------------------------

/// The single mutable device record. Mutated only from the dispatch task;
/// the external control loop reads targets and clears the guard through
/// [`crate::controller::Controller::state_mut`].
#[derive(Debug, Clone)]
pub struct DeviceState {
    features: FeatureConfig,
    pub guard: ProcessGuard,
    pub targets: TargetParameters,
    pub config: DeviceConfig,
    /// Milliseconds; zero marks a freshly activated process.
    pub process_begin_timestamp: u64,
}

impl DeviceState {
    pub fn new(features: FeatureConfig, config: DeviceConfig) -> Self {
        Self {
            features,
            guard: ProcessGuard::default(),
            targets: TargetParameters::default(),
            config,
            process_begin_timestamp: 0,
        }
    }

    pub fn features(&self) -> &FeatureConfig {
        &self.features
    }
}
