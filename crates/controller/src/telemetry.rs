//! Outbound report construction. Builders are pure: they shape the JSON body
//! from the installed features and current config, and the
//! [`Controller`](crate::controller::Controller) decides whether and where
//! it can be delivered.

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::device::DeviceConfig;
use crate::features::FeatureConfig;
use crate::ports::PressureModel;
use crate::topics::Channel;

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info = 0,
    Warning = 1,
    Error = 2,
}

impl Level {
    /// Channels a message of this level is published on. With `cascade`
    /// set, a message also goes to every more severe channel, matching
    /// older firmware that subscribers may still depend on.
    pub fn channels(self, cascade: bool) -> &'static [Channel] {
        static ALL: [Channel; 3] = [Channel::Log, Channel::Warning, Channel::Error];
        let first = self as usize;
        if cascade {
            &ALL[first..]
        } else {
            &ALL[first..=first]
        }
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportKind {
    Log(Level),
    DispenseSlice,
    DispenseSummary,
    DrainSummary,
    Pressure,
    Config,
}

/// How hard the publisher tries when the transport is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Dropped with a local warning.
    BestEffort,
    /// One reconnect attempt, then dropped.
    RetryOnce,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub kind: ReportKind,
    pub body: Value,
    pub retain: bool,
}

impl Report {
    fn new(kind: ReportKind, body: Map<String, Value>) -> Self {
        Self {
            kind,
            body: Value::Object(body),
            retain: false,
        }
    }

    pub fn log(level: Level, message: impl Into<String>) -> Self {
        Self {
            kind: ReportKind::Log(level),
            body: json!({ "m": message.into() }),
            retain: false,
        }
    }

    pub fn delivery(&self) -> Delivery {
        match self.kind {
            ReportKind::DispenseSummary | ReportKind::DrainSummary => Delivery::RetryOnce,
            _ => Delivery::BestEffort,
        }
    }

    pub fn channels(&self, cascade: bool) -> Vec<Channel> {
        match self.kind {
            ReportKind::Log(level) => level.channels(cascade).to_vec(),
            ReportKind::DispenseSlice => vec![Channel::DispenseSlice],
            ReportKind::DispenseSummary => vec![Channel::DispenseSummary],
            ReportKind::DrainSummary => vec![Channel::DrainSummary],
            ReportKind::Pressure => vec![Channel::PressureReport],
            ReportKind::Config => vec![Channel::Config],
        }
    }

    pub fn payload(&self) -> Vec<u8> {
        self.body.to_string().into_bytes()
    }

    /// Message text of a log report.
    pub fn message(&self) -> Option<&str> {
        match self.kind {
            ReportKind::Log(_) => self.body.get("m").and_then(Value::as_str),
            _ => None,
        }
    }
}

fn secs(ms: u64) -> f32 {
    ms as f32 / 1000.0
}

// ---------------------------------------------------------------------------
// Process reports (fed by the control loop)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispenseSlice {
    pub elapsed_ms: u64,
    pub volume: f32,
    pub avg_flow: f32,
    pub avg_pressure: f32,
}

impl DispenseSlice {
    pub fn report(
        &self,
        features: &FeatureConfig,
        config: &DeviceConfig,
        model: &impl PressureModel,
    ) -> Report {
        let mut body = Map::new();
        body.insert("t".into(), json!(secs(self.elapsed_ms)));
        body.insert("v".into(), json!(self.volume));
        body.insert("q".into(), json!(self.avg_flow));

        if features.pressure_sensor {
            let mode = config.pressure_sensor.report_mode;
            if mode.includes_pressure() {
                body.insert("tp".into(), json!(self.avg_pressure));
            }
            if mode.includes_volume() {
                body.insert(
                    "tv".into(),
                    json!(model.pressure_to_volume(self.avg_pressure)),
                );
            }
        }

        Report::new(ReportKind::DispenseSlice, body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispenseSummary {
    pub total_ms: u64,
    pub total_volume: f32,
    pub tank_volume: f32,
    pub tank_fill_secs: u32,
}

impl DispenseSummary {
    pub fn report(&self, features: &FeatureConfig) -> Report {
        let mut body = Map::new();
        body.insert("tt".into(), json!(secs(self.total_ms)));
        body.insert("vt".into(), json!(self.total_volume));

        if features.tank {
            body.insert("tv".into(), json!(self.tank_volume));
            if features.reports_tank_fill_time() {
                body.insert("tts".into(), json!(self.tank_fill_secs));
            }
        }

        Report::new(ReportKind::DispenseSummary, body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrainSummary {
    pub total_ms: u64,
    pub start_pressure: f32,
    pub end_pressure: f32,
    pub start_volume: f32,
    pub end_volume: f32,
}

impl DrainSummary {
    pub fn report(&self, features: &FeatureConfig, config: &DeviceConfig) -> Report {
        let mut body = Map::new();
        body.insert("tt".into(), json!(secs(self.total_ms)));

        if features.pressure_sensor {
            let mode = config.pressure_sensor.report_mode;
            if mode.includes_pressure() {
                body.insert("sp".into(), json!(self.start_pressure));
                body.insert("fp".into(), json!(self.end_pressure));
            }
            if mode.includes_volume() {
                body.insert("sv".into(), json!(self.start_volume));
                body.insert("fv".into(), json!(self.end_volume));
            }
        }

        Report::new(ReportKind::DrainSummary, body)
    }
}

/// A standalone tank pressure reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureReading {
    pub pressure: f32,
    pub volume: f32,
}

impl PressureReading {
    /// `None` when there is no pressure sensor or the report mode excludes
    /// both values.
    pub fn report(&self, features: &FeatureConfig, config: &DeviceConfig) -> Option<Report> {
        if !features.pressure_sensor {
            return None;
        }
        let mode = config.pressure_sensor.report_mode;
        let mut body = Map::new();
        if mode.includes_pressure() {
            body.insert("p".into(), json!(self.pressure));
        }
        if mode.includes_volume() {
            body.insert("v".into(), json!(self.volume));
        }
        (!body.is_empty()).then(|| Report::new(ReportKind::Pressure, body))
    }
}

// ---------------------------------------------------------------------------
// Config snapshot
// ---------------------------------------------------------------------------

/// Full config mirror restricted to installed features. Published retained.
pub fn config_snapshot(features: &FeatureConfig, config: &DeviceConfig) -> Report {
    let mut body = Map::new();
    body.insert(
        "srvc".into(),
        json!({ "res": config.services.data_resolution_l }),
    );

    if features.source {
        body.insert(
            "src".into(),
            json!({ "rate": config.source.static_flow_rate }),
        );
    }

    if features.tank {
        let t = &config.tank;
        body.insert(
            "tnk".into(),
            json!({
                "time": t.timeout_secs,
                "shape": t.shape_type,
                "dim1": t.dimension_1,
                "dim2": t.dimension_2,
                "dim3": t.dimension_3,
            }),
        );
    }

    if features.flow_sensor {
        let f = &config.flow_sensor;
        body.insert(
            "flow".into(),
            json!({
                "ppl": f.pulses_per_l,
                "max": f.max_flow_rate,
                "min": f.min_flow_rate,
            }),
        );
    }

    if features.pressure_sensor {
        let p = &config.pressure_sensor;
        body.insert(
            "prssr".into(),
            json!({
                "mode": u8::from(p.report_mode),
                "atmo": p.atmosphere_pressure,
            }),
        );
    }

    Report {
        retain: true,
        ..Report::new(ReportKind::Config, body)
    }
}
