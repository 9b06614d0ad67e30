//! Command and telemetry core of a networked irrigation controller.
//!
//! Inbound MQTT commands are routed by [`dispatch`] to the [`handlers`],
//! which validate against the installed [`features`] and the process
//! [`guard`] and return effects for the [`controller`] to carry out against
//! the [`ports`]. Outbound reports are shaped by [`telemetry`].

pub mod config;
pub mod controller;
pub mod db;
pub mod device;
pub mod dispatch;
pub mod features;
pub mod guard;
pub mod handlers;
pub mod mqtt;
pub mod payload;
pub mod ports;
pub mod status;
pub mod telemetry;
pub mod topics;
pub mod web;
