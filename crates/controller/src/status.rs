use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::device::{DeviceConfig, DeviceState};
use crate::guard::{ProcessGuard, TargetParameters};
use crate::topics::Command;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedStatus = Arc<RwLock<StatusBoard>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Read-only mirror of the device state for the status API. Written by the
/// controller after every handled message; never read back by it.
pub struct StatusBoard {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub guard: ProcessGuard,
    pub targets: TargetParameters,
    pub config: DeviceConfig,
    pub events: VecDeque<StatusEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Command,
    Rejected,
    Connectivity,
    Dropped,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub guard: ProcessGuard,
    pub targets: TargetParameters,
    pub config: DeviceConfig,
    pub events: Vec<StatusEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl StatusBoard {
    pub fn new(state: &DeviceState) -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            guard: state.guard,
            targets: state.targets,
            config: state.config.clone(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared(state: &DeviceState) -> SharedStatus {
        Arc::new(RwLock::new(Self::new(state)))
    }

    /// Copy the current device state into the board.
    pub fn sync(&mut self, state: &DeviceState) {
        self.guard = state.guard;
        self.targets = state.targets;
        if self.config != state.config {
            self.config = state.config.clone();
        }
    }

    /// Record the outcome of a handled command.
    pub fn record_command(&mut self, command: Command, detail: &str, rejected: bool) {
        let kind = if rejected {
            EventKind::Rejected
        } else {
            EventKind::Command
        };
        let name = serde_json::to_value(command)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        self.push_event(kind, format!("{name}: {detail}"));
    }

    pub fn record_connectivity(&mut self, connected: bool) {
        self.mqtt_connected = connected;
        let detail = if connected {
            "mqtt connected"
        } else {
            "mqtt disconnected"
        };
        self.push_event(EventKind::Connectivity, detail.to_string());
    }

    /// Record a report that could not be delivered.
    pub fn record_dropped(&mut self, detail: String) {
        self.push_event(EventKind::Dropped, detail);
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            guard: self.guard,
            targets: self.targets,
            config: self.config.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(StatusEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
