//! Boundaries to the collaborators the controller drives but does not own:
//! the messaging transport, persistent storage, the device control plane
//! and the tank's physical model.
//!
//! ```text
//!   Transport ──▶ Controller ──▶ Transport
//!                   │   │
//!        ConfigStore ◀─┘   └─▶ ControlPlane
//! ```

use std::future::Future;

use anyhow::Result;
use serde::Serialize;

use crate::device::DeviceConfig;

// ---------------------------------------------------------------------------
// Messaging transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(Inbound),
    Connected,
    Disconnected,
    /// No further events will arrive.
    Closed,
}

pub trait Transport {
    fn is_connected(&self) -> bool;

    /// One bounded connection attempt. Returns whether the transport is
    /// connected afterwards.
    fn reconnect(&mut self) -> impl Future<Output = bool>;

    fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> impl Future<Output = Result<()>>;

    /// Wait for the next inbound event, in delivery order.
    fn next_event(&mut self) -> impl Future<Output = Result<TransportEvent>>;

    /// Flush queued publications and disconnect cleanly.
    fn shutdown(&mut self) -> impl Future<Output = ()>;
}

// ---------------------------------------------------------------------------
// Persistent storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Credential {
    /// Read by the network layer that joins the access point; the controller
    /// only clears it.
    Wifi,
    Mqtt,
}

impl Credential {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wifi => "wifi",
            Self::Mqtt => "mqtt",
        }
    }
}

pub trait ConfigStore {
    /// `None` when nothing has been stored yet.
    fn load_config(&self) -> impl Future<Output = Result<Option<DeviceConfig>>>;

    fn save_config(&self, config: &DeviceConfig) -> impl Future<Output = Result<()>>;

    /// Forget the stored credentials of one kind.
    fn reset_credentials(&self, credential: Credential) -> impl Future<Output = Result<()>>;
}

// ---------------------------------------------------------------------------
// Device control plane
// ---------------------------------------------------------------------------

pub trait ControlPlane {
    /// Reboot the device. Production implementations do not return.
    fn hard_reset(&mut self);
}

// ---------------------------------------------------------------------------
// Physical model
// ---------------------------------------------------------------------------

/// Converts a tank pressure reading into the volume it implies.
pub trait PressureModel {
    fn pressure_to_volume(&self, pressure: f32) -> f32;
}

impl<F> PressureModel for F
where
    F: Fn(f32) -> f32,
{
    fn pressure_to_volume(&self, pressure: f32) -> f32 {
        self(pressure)
    }
}
