//! Command handlers.
//!
//! Each handler validates its payload against the installed features and
//! the process guard, mutates [`DeviceState`] only once validation has
//! passed, and returns the ordered [`Effect`]s the controller must carry
//! out. Every handler yields exactly one log or acknowledgement report.

use thiserror::Error;
use tracing::{info, warn};

use crate::device::{ConfigChange, DeviceConfig, DeviceState};
use crate::guard::DrainTarget;
use crate::payload::{DecodeError, FieldError, Payload};
use crate::ports::Credential;
use crate::telemetry::{config_snapshot, Level, Report, ReportKind};
use crate::topics::{Command, Topics};

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Publish(Report),
    /// Write the current config to the store; on failure restore `previous`.
    PersistConfig { previous: DeviceConfig },
    ResetCredentials(Credential),
    HardReset,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    pub effects: Vec<Effect>,
}

impl Outcome {
    fn log(level: Level, message: String) -> Self {
        match level {
            Level::Info => info!("{message}"),
            Level::Warning | Level::Error => warn!("{message}"),
        }
        Self {
            effects: vec![Effect::Publish(Report::log(level, message))],
        }
    }

    fn rejected(rejection: Rejection) -> Self {
        Self::log(Level::Error, rejection.to_string())
    }

    fn then(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn reports(&self) -> impl Iterator<Item = &Report> {
        self.effects.iter().filter_map(|e| match e {
            Effect::Publish(r) => Some(r),
            _ => None,
        })
    }

    /// Message of the first log report, if any.
    pub fn message(&self) -> Option<&str> {
        self.reports().find_map(Report::message)
    }

    pub fn is_rejection(&self) -> bool {
        self.reports()
            .any(|r| r.kind == ReportKind::Log(Level::Error))
    }
}

// ---------------------------------------------------------------------------
// Rejections
// ---------------------------------------------------------------------------

/// Why a command was refused. The display text is the wire message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("MQTT payload failed to deserialize with error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Invalid payload, {0}")]
    Field(#[from] FieldError),
    #[error("{process} request denied, process already in progress. Deactivate with topic: {deactivate_topic}")]
    Busy {
        process: &'static str,
        deactivate_topic: String,
    },
    #[error("Dispense requested without a target volume")]
    NoDispenseTarget,
    #[error("Drain request denied, more than one target was sent")]
    MultipleDrainTargets,
    #[error("Drain requested without any target time, pressure, or volume")]
    NoDrainTarget,
    #[error("Unable to set target drain {0} as tank pressure sensor not active")]
    PressureSensorInactive(&'static str),
}

impl Rejection {
    fn busy(process: &'static str, topics: &Topics) -> Self {
        Self::Busy {
            process,
            deactivate_topic: topics.command(Command::Deactivate).to_string(),
        }
    }
}

fn settle(result: Result<Outcome, Rejection>) -> Outcome {
    result.unwrap_or_else(Outcome::rejected)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub fn dispense_activate(state: &mut DeviceState, topics: &Topics, raw: &[u8]) -> Outcome {
    settle(try_dispense_activate(state, topics, raw))
}

fn try_dispense_activate(
    state: &mut DeviceState,
    topics: &Topics,
    raw: &[u8],
) -> Result<Outcome, Rejection> {
    if state.guard.is_busy() {
        return Err(Rejection::busy("Dispense", topics));
    }

    let payload = Payload::decode(raw)?;
    let volume = payload.f32("tv")?.ok_or(Rejection::NoDispenseTarget)?;

    state
        .guard
        .begin_dispense()
        .map_err(|_| Rejection::busy("Dispense", topics))?;
    state.targets.output_volume = volume;
    state.process_begin_timestamp = 0;

    Ok(Outcome::log(
        Level::Info,
        format!("Beginning dispensation process with target volume: {volume} liters"),
    ))
}

pub fn drain_activate(state: &mut DeviceState, topics: &Topics, raw: &[u8]) -> Outcome {
    settle(try_drain_activate(state, topics, raw))
}

fn try_drain_activate(
    state: &mut DeviceState,
    topics: &Topics,
    raw: &[u8],
) -> Result<Outcome, Rejection> {
    if state.guard.is_busy() {
        return Err(Rejection::busy("Drain", topics));
    }

    let payload = Payload::decode(raw)?;
    let time_ms = payload.u32("tt")?;
    let volume = payload.f32("tv")?;
    let pressure = payload.f32("tp")?;

    let present = [time_ms.is_some(), volume.is_some(), pressure.is_some()]
        .into_iter()
        .filter(|p| *p)
        .count();
    if present > 1 {
        return Err(Rejection::MultipleDrainTargets);
    }

    let has_pressure_sensor = state.features().pressure_sensor;
    let (target, message) = match (time_ms, volume, pressure) {
        (Some(ms), None, None) => {
            let secs = ms as f32 / 1000.0;
            (
                DrainTarget::TimeSecs(secs),
                format!("Beginning drain process with target time: {secs} seconds"),
            )
        }
        (None, Some(v), None) => {
            if !has_pressure_sensor {
                return Err(Rejection::PressureSensorInactive("volume"));
            }
            (
                DrainTarget::Volume(v),
                format!("Beginning drain process with target volume: {v} liters"),
            )
        }
        (None, None, Some(p)) => {
            if !has_pressure_sensor {
                return Err(Rejection::PressureSensorInactive("pressure"));
            }
            (
                DrainTarget::Pressure(p),
                format!("Beginning drain process with target pressure: {p}"),
            )
        }
        _ => return Err(Rejection::NoDrainTarget),
    };

    state
        .guard
        .begin_drain()
        .map_err(|_| Rejection::busy("Drain", topics))?;
    state.targets.set_drain(target);
    state.process_begin_timestamp = 0;

    Ok(Outcome::log(Level::Info, message))
}

pub fn deactivate(state: &mut DeviceState) -> Outcome {
    state.guard.request_deactivate();
    Outcome::log(Level::Info, "Deactivation requested".to_string())
}

pub fn restart() -> Outcome {
    Outcome::log(Level::Info, "System reset requested".to_string()).then(Effect::HardReset)
}

pub fn config_change(state: &mut DeviceState, raw: &[u8]) -> Outcome {
    settle(try_config_change(state, raw))
}

fn try_config_change(state: &mut DeviceState, raw: &[u8]) -> Result<Outcome, Rejection> {
    let payload = Payload::decode(raw)?;
    let change = ConfigChange::parse(&payload, state.features())?;
    let previous = state.config.clone();
    state.config.apply(&change);

    info!(empty = change.is_empty(), "configuration updated");
    let snapshot = config_snapshot(state.features(), &state.config);
    Ok(Outcome {
        effects: vec![Effect::PersistConfig { previous }, Effect::Publish(snapshot)],
    })
}

pub fn settings_reset(raw: &[u8]) -> Outcome {
    settle(try_settings_reset(raw))
}

fn try_settings_reset(raw: &[u8]) -> Result<Outcome, Rejection> {
    let payload = Payload::decode(raw)?;
    let wifi = payload.bool("wifi")?.unwrap_or(false);
    let mqtt = payload.bool("mqtt")?.unwrap_or(false);

    let selected: Vec<Credential> = [(wifi, Credential::Wifi), (mqtt, Credential::Mqtt)]
        .into_iter()
        .filter_map(|(on, c)| on.then_some(c))
        .collect();

    if selected.is_empty() {
        return Ok(Outcome::log(
            Level::Warning,
            "Settings reset requested without wifi or mqtt selected".to_string(),
        ));
    }

    let names: Vec<&str> = selected.iter().map(|c| c.as_str()).collect();
    let mut outcome = Outcome::default();
    for credential in selected.iter().copied() {
        outcome = outcome.then(Effect::ResetCredentials(credential));
    }
    let report = Outcome::log(
        Level::Info,
        format!("Resetting {} settings, system reset requested", names.join(" and ")),
    );
    outcome.effects.extend(report.effects);
    Ok(outcome.then(Effect::HardReset))
}
