//! The dispatch runtime.
//!
//! [`Controller`] owns the device state and drives the ports: it pulls
//! events from the [`Transport`] strictly in delivery order, routes messages
//! through [`dispatch`], and executes the returned effects one after the
//! other. It is also the entry point the control loop uses to publish
//! process telemetry.
//!
//! ```text
//!  Transport ──▶ dispatch ──▶ handler ──▶ Outcome
//!                                           │
//!      ConfigStore ◀── PersistConfig ◀──────┤
//!      Transport   ◀── Publish      ◀───────┤
//!      ControlPlane◀── HardReset    ◀───────┘
//! ```

use std::ops::ControlFlow;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::device::DeviceState;
use crate::dispatch::dispatch;
use crate::handlers::{Effect, Outcome};
use crate::ports::{ConfigStore, ControlPlane, PressureModel, Transport, TransportEvent};
use crate::status::SharedStatus;
use crate::telemetry::{
    config_snapshot, Delivery, DispenseSlice, DispenseSummary, DrainSummary, Level,
    PressureReading, Report,
};
use crate::topics::Topics;

/// Pause after a transport error before polling again.
const ERROR_BACKOFF: Duration = Duration::from_secs(2);

/// Why [`Controller::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// A hard reset was carried out.
    Restart,
    /// The transport will deliver nothing more.
    TransportClosed,
}

pub struct Controller<T, S, P> {
    transport: T,
    store: S,
    plane: P,
    topics: Topics,
    state: DeviceState,
    cascade_log_levels: bool,
    status: Option<SharedStatus>,
}

impl<T, S, P> Controller<T, S, P>
where
    T: Transport,
    S: ConfigStore,
    P: ControlPlane,
{
    pub fn new(transport: T, store: S, plane: P, topics: Topics, state: DeviceState) -> Self {
        Self {
            transport,
            store,
            plane,
            topics,
            state,
            cascade_log_levels: false,
            status: None,
        }
    }

    /// Publish info and warning messages on every more severe channel too.
    pub fn with_cascading_logs(mut self, cascade: bool) -> Self {
        self.cascade_log_levels = cascade;
        self
    }

    pub fn with_status(mut self, status: SharedStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    /// For the control loop: read targets, stamp the process timestamp,
    /// clear the guard once a process ends.
    pub fn state_mut(&mut self) -> &mut DeviceState {
        &mut self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn plane(&self) -> &P {
        &self.plane
    }

    // -----------------------------------------------------------------------
    // Dispatch loop
    // -----------------------------------------------------------------------

    pub async fn run(&mut self) -> Exit {
        loop {
            match self.transport.next_event().await {
                Ok(TransportEvent::Message(m)) => {
                    if let ControlFlow::Break(exit) =
                        self.handle_message(&m.topic, &m.payload).await
                    {
                        return exit;
                    }
                }
                Ok(TransportEvent::Connected) => self.on_connected().await,
                Ok(TransportEvent::Disconnected) => {
                    warn!("mqtt disconnected");
                    self.with_board(|b| b.record_connectivity(false)).await;
                }
                Ok(TransportEvent::Closed) => {
                    info!("transport closed");
                    return Exit::TransportClosed;
                }
                Err(e) => {
                    error!("transport error: {e:#}. retrying...");
                    self.with_board(|b| {
                        b.mqtt_connected = false;
                        b.record_error(format!("transport error: {e:#}"));
                    })
                    .await;
                    sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }

    /// Also runs after a successful retry reconnect, which consumes the
    /// ConnAck inside the transport.
    async fn on_connected(&mut self) {
        info!("mqtt connected");
        self.with_board(|b| b.record_connectivity(true)).await;
        let snapshot = config_snapshot(self.state.features(), &self.state.config);
        self.deliver(&snapshot).await;
    }

    /// Handle one inbound message to completion.
    pub async fn handle_message(&mut self, topic: &str, payload: &[u8]) -> ControlFlow<Exit> {
        let Some((command, outcome)) = dispatch(&mut self.state, &self.topics, topic, payload)
        else {
            self.with_board(|b| b.record_system(format!("unhandled topic {topic}")))
                .await;
            return ControlFlow::Continue(());
        };

        let detail = outcome.message().unwrap_or("applied").to_string();
        let rejected = outcome.is_rejection();
        self.with_board(|b| b.record_command(command, &detail, rejected))
            .await;

        let flow = self.execute(outcome).await;

        let state = &self.state;
        if let Some(status) = &self.status {
            status.write().await.sync(state);
        }
        flow
    }

    async fn execute(&mut self, outcome: Outcome) -> ControlFlow<Exit> {
        for effect in outcome.effects {
            match effect {
                Effect::Publish(report) => {
                    self.publish(&report).await;
                }
                Effect::PersistConfig { previous } => {
                    if let Err(e) = self.store.save_config(&self.state.config).await {
                        // The change is abandoned and the error replaces the snapshot.
                        error!("failed to persist configuration: {e:#}");
                        self.state.config = previous;
                        let report = Report::log(
                            Level::Error,
                            format!("Failed to persist configuration: {e}"),
                        );
                        self.publish(&report).await;
                        return ControlFlow::Continue(());
                    }
                }
                Effect::ResetCredentials(credential) => {
                    info!(credential = credential.as_str(), "resetting credentials");
                    if let Err(e) = self.store.reset_credentials(credential).await {
                        error!(
                            credential = credential.as_str(),
                            "failed to reset credentials: {e:#}"
                        );
                    }
                }
                Effect::HardReset => {
                    warn!("hard reset");
                    self.transport.shutdown().await;
                    self.plane.hard_reset();
                    return ControlFlow::Break(Exit::Restart);
                }
            }
        }
        ControlFlow::Continue(())
    }

    // -----------------------------------------------------------------------
    // Publication
    // -----------------------------------------------------------------------

    /// Deliver a report on each of its channels. Returns whether it went out.
    pub async fn publish(&mut self, report: &Report) -> bool {
        if !self.transport.is_connected() {
            match report.delivery() {
                Delivery::BestEffort => {
                    warn!(kind = ?report.kind, "unable to publish report, mqtt disconnected");
                    self.record_dropped(report).await;
                    return false;
                }
                Delivery::RetryOnce => {
                    warn!(
                        kind = ?report.kind,
                        "unable to publish report, trying mqtt connection one more time"
                    );
                    if !self.transport.reconnect().await {
                        self.record_dropped(report).await;
                        return false;
                    }
                    self.on_connected().await;
                }
            }
        }

        self.deliver(report).await
    }

    async fn deliver(&mut self, report: &Report) -> bool {
        let payload = report.payload();
        for channel in report.channels(self.cascade_log_levels) {
            let topic = self.topics.channel(channel);
            if let Err(e) = self
                .transport
                .publish(&topic, payload.clone(), report.retain)
                .await
            {
                warn!(topic = %topic, "publish failed: {e:#}");
                self.record_dropped(report).await;
                return false;
            }
        }
        true
    }

    pub async fn publish_config(&mut self) -> bool {
        let report = config_snapshot(self.state.features(), &self.state.config);
        self.publish(&report).await
    }

    pub async fn publish_dispense_slice(
        &mut self,
        slice: &DispenseSlice,
        model: &impl PressureModel,
    ) -> bool {
        let report = slice.report(self.state.features(), &self.state.config, model);
        self.publish(&report).await
    }

    pub async fn publish_dispense_summary(&mut self, summary: &DispenseSummary) -> bool {
        let report = summary.report(self.state.features());
        self.publish(&report).await
    }

    pub async fn publish_drain_summary(&mut self, summary: &DrainSummary) -> bool {
        let report = summary.report(self.state.features(), &self.state.config);
        self.publish(&report).await
    }

    /// Skipped (returns `false`) when the report mode carries neither value.
    pub async fn publish_pressure(&mut self, reading: &PressureReading) -> bool {
        match reading.report(self.state.features(), &self.state.config) {
            Some(report) => self.publish(&report).await,
            None => false,
        }
    }

    pub async fn publish_log(&mut self, level: Level, message: impl Into<String>) -> bool {
        self.publish(&Report::log(level, message)).await
    }

    // -----------------------------------------------------------------------
    // Status board
    // -----------------------------------------------------------------------

    async fn with_board(&self, f: impl FnOnce(&mut crate::status::StatusBoard)) {
        if let Some(status) = &self.status {
            f(&mut *status.write().await);
        }
    }

    async fn record_dropped(&self, report: &Report) {
        let detail = format!("{:?} report dropped, mqtt disconnected", report.kind);
        self.with_board(|b| b.record_dropped(detail)).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;

    use anyhow::{bail, Result};
    use serde_json::{json, Value};

    use crate::device::{DeviceConfig, ReportMode};
    use crate::features::FeatureConfig;
    use crate::ports::{Credential, Inbound};
    use crate::status::StatusBoard;

    // -- Mock ports ----------------------------------------------------------

    #[derive(Default)]
    struct MockTransport {
        connected: bool,
        reconnect_succeeds: bool,
        reconnect_attempts: usize,
        fail_publish: bool,
        events: VecDeque<TransportEvent>,
        published: Vec<(String, Value, bool)>,
        shut_down: bool,
    }

    impl MockTransport {
        fn connected() -> Self {
            Self {
                connected: true,
                ..Self::default()
            }
        }

        fn topics(&self) -> Vec<&str> {
            self.published.iter().map(|(t, _, _)| t.as_str()).collect()
        }
    }

    impl Transport for MockTransport {
        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn reconnect(&mut self) -> bool {
            self.reconnect_attempts += 1;
            self.connected = self.reconnect_succeeds;
            self.connected
        }

        async fn publish(&mut self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
            if self.fail_publish {
                bail!("queue full");
            }
            let body = serde_json::from_slice(&payload)?;
            self.published.push((topic.to_string(), body, retain));
            Ok(())
        }

        async fn next_event(&mut self) -> Result<TransportEvent> {
            Ok(self.events.pop_front().unwrap_or(TransportEvent::Closed))
        }

        async fn shutdown(&mut self) {
            self.shut_down = true;
        }
    }

    #[derive(Default)]
    struct MockStore {
        saved: RefCell<Vec<DeviceConfig>>,
        reset: RefCell<Vec<Credential>>,
        fail_save: bool,
    }

    impl ConfigStore for MockStore {
        async fn load_config(&self) -> Result<Option<DeviceConfig>> {
            Ok(self.saved.borrow().last().cloned())
        }

        async fn save_config(&self, config: &DeviceConfig) -> Result<()> {
            if self.fail_save {
                bail!("disk full");
            }
            self.saved.borrow_mut().push(config.clone());
            Ok(())
        }

        async fn reset_credentials(&self, credential: Credential) -> Result<()> {
            self.reset.borrow_mut().push(credential);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockPlane {
        resets: Cell<usize>,
    }

    impl ControlPlane for MockPlane {
        fn hard_reset(&mut self) {
            self.resets.set(self.resets.get() + 1);
        }
    }

    type TestController = Controller<MockTransport, MockStore, MockPlane>;

    fn controller(transport: MockTransport, features: FeatureConfig) -> TestController {
        Controller::new(
            transport,
            MockStore::default(),
            MockPlane::default(),
            Topics::new("drip-01"),
            DeviceState::new(features, DeviceConfig::default()),
        )
    }

    fn message(topic: &str, payload: &[u8]) -> TransportEvent {
        TransportEvent::Message(Inbound {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        })
    }

    // -- Dispatch and effects ------------------------------------------------

    #[tokio::test]
    async fn dispense_publishes_info_log() {
        let mut c = controller(MockTransport::connected(), FeatureConfig::default());
        let flow = c
            .handle_message("drip-01/dispense/activate", br#"{"tv": 2}"#)
            .await;

        assert_eq!(flow, ControlFlow::Continue(()));
        assert!(c.state().guard.dispensing());
        assert_eq!(c.transport().topics(), vec!["drip-01/log"]);
    }

    #[tokio::test]
    async fn rejection_publishes_error_log() {
        let mut c = controller(MockTransport::connected(), FeatureConfig::default());
        c.handle_message("drip-01/dispense/activate", b"{}").await;

        let (topic, body, _) = &c.transport().published[0];
        assert_eq!(topic, "drip-01/error");
        assert_eq!(body["m"], "Dispense requested without a target volume");
    }

    #[tokio::test]
    async fn unhandled_topic_publishes_nothing() {
        let mut c = controller(MockTransport::connected(), FeatureConfig::default());
        c.handle_message("drip-01/drain/activate", br#"{"tt": 1}"#)
            .await;
        assert!(c.transport().published.is_empty());
        assert!(!c.state().guard.is_busy());
    }

    #[tokio::test]
    async fn config_change_persists_and_publishes_retained_snapshot() {
        let mut c = controller(MockTransport::connected(), FeatureConfig::all());
        c.handle_message("drip-01/config/change", br#"{"tnk":{"time":600}}"#)
            .await;

        let saved = c.store().saved.borrow();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].tank.timeout_secs, 600);

        let (topic, body, retain) = &c.transport().published[0];
        assert_eq!(topic, "drip-01/config");
        assert_eq!(body["tnk"]["time"], 600);
        assert!(*retain);
    }

    #[tokio::test]
    async fn persist_failure_abandons_change_with_one_error_report() {
        let status = StatusBoard::shared(&DeviceState::new(
            FeatureConfig::all(),
            DeviceConfig::default(),
        ));
        let mut c = controller(MockTransport::connected(), FeatureConfig::all())
            .with_status(status.clone());
        c.store.fail_save = true;
        c.handle_message("drip-01/config/change", br#"{"srvc":{"res":2}}"#)
            .await;

        assert_eq!(c.transport().topics(), vec!["drip-01/error"]);
        let (_, body, _) = &c.transport().published[0];
        assert_eq!(body["m"], "Failed to persist configuration: disk full");
        assert_eq!(c.state().config.services.data_resolution_l, 1);
        assert_eq!(status.read().await.config.services.data_resolution_l, 1);
    }

    #[tokio::test]
    async fn restart_shuts_transport_down_and_resets() {
        let mut c = controller(MockTransport::connected(), FeatureConfig::default());
        let flow = c.handle_message("drip-01/restart", b"").await;

        assert_eq!(flow, ControlFlow::Break(Exit::Restart));
        assert_eq!(c.plane().resets.get(), 1);
        assert!(c.transport().shut_down);
        assert_eq!(c.transport().topics(), vec!["drip-01/log"]);
    }

    #[tokio::test]
    async fn settings_reset_clears_credentials_then_resets() {
        let mut c = controller(MockTransport::connected(), FeatureConfig::default());
        let flow = c
            .handle_message("drip-01/settings/reset", br#"{"wifi": true, "mqtt": true}"#)
            .await;

        assert_eq!(flow, ControlFlow::Break(Exit::Restart));
        assert_eq!(
            *c.store().reset.borrow(),
            vec![Credential::Wifi, Credential::Mqtt]
        );
        assert_eq!(c.plane().resets.get(), 1);
    }

    #[tokio::test]
    async fn settings_reset_without_selection_does_not_reset() {
        let mut c = controller(MockTransport::connected(), FeatureConfig::default());
        let flow = c
            .handle_message("drip-01/settings/reset", br#"{"mqtt": false}"#)
            .await;

        assert_eq!(flow, ControlFlow::Continue(()));
        assert_eq!(c.plane().resets.get(), 0);
        assert_eq!(c.transport().topics(), vec!["drip-01/warning"]);
    }

    // -- Run loop ------------------------------------------------------------

    #[tokio::test]
    async fn run_handles_messages_in_order() {
        let mut transport = MockTransport::connected();
        transport.events = VecDeque::from(vec![
            message("drip-01/dispense/activate", br#"{"tv": 1}"#),
            message("drip-01/dispense/activate", br#"{"tv": 5}"#),
            message("drip-01/deactivate", b""),
        ]);
        let mut c = controller(transport, FeatureConfig::default());

        assert_eq!(c.run().await, Exit::TransportClosed);
        assert_eq!(c.state().targets.output_volume, 1.0);
        assert!(c.state().guard.deactivate_requested());
        assert_eq!(
            c.transport().topics(),
            vec!["drip-01/log", "drip-01/error", "drip-01/log"]
        );
    }

    #[tokio::test]
    async fn run_stops_at_restart() {
        let mut transport = MockTransport::connected();
        transport.events = VecDeque::from(vec![
            message("drip-01/restart", b""),
            message("drip-01/dispense/activate", br#"{"tv": 1}"#),
        ]);
        let mut c = controller(transport, FeatureConfig::default());

        assert_eq!(c.run().await, Exit::Restart);
        assert!(!c.state().guard.dispensing());
    }

    #[tokio::test]
    async fn connect_publishes_config_snapshot() {
        let mut transport = MockTransport::connected();
        transport.events = VecDeque::from(vec![TransportEvent::Connected]);
        let status = StatusBoard::shared(&DeviceState::new(
            FeatureConfig::default(),
            DeviceConfig::default(),
        ));
        let mut c = controller(transport, FeatureConfig::default()).with_status(status.clone());

        c.run().await;
        assert_eq!(c.transport().topics(), vec!["drip-01/config"]);
        assert!(status.read().await.mqtt_connected);
    }

    #[tokio::test]
    async fn status_board_records_commands() {
        let status = StatusBoard::shared(&DeviceState::new(
            FeatureConfig::default(),
            DeviceConfig::default(),
        ));
        let mut c = controller(MockTransport::connected(), FeatureConfig::default())
            .with_status(status.clone());
        c.handle_message("drip-01/dispense/activate", br#"{"tv": 3}"#)
            .await;

        let board = status.read().await;
        assert!(board.guard.dispensing());
        assert_eq!(board.targets.output_volume, 3.0);
        assert!(board.events[0].detail.starts_with("dispense-activate: Beginning"));
    }

    // -- Publication ---------------------------------------------------------

    #[tokio::test]
    async fn best_effort_dropped_when_disconnected() {
        let mut c = controller(MockTransport::default(), FeatureConfig::default());
        assert!(!c.publish_log(Level::Info, "hello").await);
        assert_eq!(c.transport().reconnect_attempts, 0);
        assert!(c.transport().published.is_empty());
    }

    #[tokio::test]
    async fn rejection_while_disconnected_changes_nothing() {
        let mut c = controller(MockTransport::default(), FeatureConfig::default());
        c.handle_message("drip-01/dispense/activate", b"[]").await;
        assert!(!c.state().guard.is_busy());
        assert!(c.transport().published.is_empty());
    }

    #[tokio::test]
    async fn summary_retries_once_then_publishes() {
        let mut transport = MockTransport::default();
        transport.reconnect_succeeds = true;
        let mut c = controller(transport, FeatureConfig::default());

        let sent = c
            .publish_dispense_summary(&DispenseSummary {
                total_ms: 3000,
                total_volume: 2.0,
                tank_volume: 0.0,
                tank_fill_secs: 0,
            })
            .await;

        assert!(sent);
        assert_eq!(c.transport().reconnect_attempts, 1);
        let (topic, body, retain) = &c.transport().published[1];
        assert_eq!(topic, "drip-01/dispense/report/summary");
        assert_eq!(*body, json!({ "tt": 3.0, "vt": 2.0 }));
        assert!(!*retain);
    }

    #[tokio::test]
    async fn retry_reconnect_republishes_config_and_marks_connected() {
        let mut transport = MockTransport::default();
        transport.reconnect_succeeds = true;
        let status = StatusBoard::shared(&DeviceState::new(
            FeatureConfig::default(),
            DeviceConfig::default(),
        ));
        let mut c = controller(transport, FeatureConfig::default()).with_status(status.clone());

        let sent = c
            .publish_drain_summary(&DrainSummary {
                total_ms: 2000,
                start_pressure: 0.0,
                end_pressure: 0.0,
                start_volume: 0.0,
                end_volume: 0.0,
            })
            .await;

        assert!(sent);
        assert_eq!(
            c.transport().topics(),
            vec!["drip-01/config", "drip-01/drain/report/summary"]
        );
        assert!(c.transport().published[0].2);
        assert!(status.read().await.mqtt_connected);
    }

    #[tokio::test]
    async fn summary_dropped_after_failed_retry() {
        let mut c = controller(MockTransport::default(), FeatureConfig::all());
        let sent = c
            .publish_drain_summary(&DrainSummary {
                total_ms: 1000,
                start_pressure: 1.0,
                end_pressure: 0.5,
                start_volume: 10.0,
                end_volume: 5.0,
            })
            .await;

        assert!(!sent);
        assert_eq!(c.transport().reconnect_attempts, 1);
        assert!(c.transport().published.is_empty());
    }

    #[tokio::test]
    async fn slice_uses_current_report_mode() {
        let mut c = controller(MockTransport::connected(), FeatureConfig::all());
        c.state_mut().config.pressure_sensor.report_mode = ReportMode::Volume;
        let slice = DispenseSlice {
            elapsed_ms: 1000,
            volume: 1.0,
            avg_flow: 1.0,
            avg_pressure: 2.0,
        };
        c.publish_dispense_slice(&slice, &|p: f32| p * 10.0).await;

        let (topic, body, _) = &c.transport().published[0];
        assert_eq!(topic, "drip-01/dispense/report/slice");
        assert_eq!(body["tv"], json!(20.0));
        assert!(body.get("tp").is_none());
    }

    #[tokio::test]
    async fn pressure_reading_skipped_in_mode_off() {
        let mut c = controller(MockTransport::connected(), FeatureConfig::all());
        let reading = PressureReading {
            pressure: 1.0,
            volume: 2.0,
        };
        assert!(!c.publish_pressure(&reading).await);
        c.state_mut().config.pressure_sensor.report_mode = ReportMode::Pressure;
        assert!(c.publish_pressure(&reading).await);
        assert_eq!(c.transport().topics(), vec!["drip-01/pressure/report"]);
    }

    #[tokio::test]
    async fn cascading_logs_fan_out() {
        let mut c = controller(MockTransport::connected(), FeatureConfig::default())
            .with_cascading_logs(true);
        c.publish_log(Level::Info, "hello").await;
        assert_eq!(
            c.transport().topics(),
            vec!["drip-01/log", "drip-01/warning", "drip-01/error"]
        );
    }

    #[tokio::test]
    async fn publish_failure_is_reported_as_not_sent() {
        let mut transport = MockTransport::connected();
        transport.fail_publish = true;
        let mut c = controller(transport, FeatureConfig::default());
        assert!(!c.publish_config().await);
    }

    #[tokio::test]
    async fn control_loop_can_finish_a_process() {
        let mut c = controller(MockTransport::connected(), FeatureConfig::default());
        c.handle_message("drip-01/dispense/activate", br#"{"tv": 1}"#)
            .await;
        c.state_mut().guard.finish();
        c.handle_message("drip-01/dispense/activate", br#"{"tv": 4}"#)
            .await;
        assert_eq!(c.state().targets.output_volume, 4.0);
    }
}
