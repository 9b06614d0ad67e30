use anyhow::{bail, Context, Result};
use rumqttc::MqttOptions;
use std::env;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use drip_controller::config;
use drip_controller::controller::{Controller, Exit};
use drip_controller::db::Db;
use drip_controller::device::DeviceState;
use drip_controller::mqtt::MqttTransport;
use drip_controller::ports::{ConfigStore, ControlPlane, Credential};
use drip_controller::status::StatusBoard;
use drip_controller::topics::Topics;
use drip_controller::web;

/// Exit status asking the process supervisor for an immediate restart.
const RESTART_EXIT_CODE: i32 = 75;

/// Restarts by exiting; the supervisor (systemd `Restart=always`) brings the
/// controller back with a fresh session.
struct ProcessRestart;

impl ControlPlane for ProcessRestart {
    fn hard_reset(&mut self) {
        info!(code = RESTART_EXIT_CODE, "exiting for restart");
        std::process::exit(RESTART_EXIT_CODE);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "controller.toml".to_string());
    let cfg = config::load(&config_path)?;

    let db_url =
        env::var("DB_URL").unwrap_or_else(|_| "sqlite:controller.db?mode=rwc".to_string());
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // The stored config is the source of truth; the file only seeds it.
    let device_config = match db.load_config().await? {
        Some(stored) => stored,
        None => {
            info!("no stored device config, seeding from [defaults]");
            db.save_config(&cfg.defaults)
                .await
                .context("failed to seed device config")?;
            cfg.defaults.clone()
        }
    };

    let state = DeviceState::new(cfg.features, device_config);

    // ── Status board + web server ───────────────────────────────────
    let status = StatusBoard::shared(&state);
    status
        .write()
        .await
        .record_system("controller started".to_string());

    let web_status = status.clone();
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_status, web_port).await {
            error!("status api stopped: {e:#}");
        }
    });

    // ── MQTT ────────────────────────────────────────────────────────
    let topics = Topics::new(&cfg.device_id);
    let mut options = MqttOptions::new(&cfg.device_id, &cfg.mqtt.host, cfg.mqtt.port);
    options.set_keep_alive(cfg.mqtt.keep_alive());

    let mqtt_seed = cfg.mqtt.credentials();
    match db
        .seed_credentials(Credential::Mqtt, mqtt_seed.as_ref())
        .await?
    {
        Some(creds) => {
            options.set_credentials(creds.username, creds.secret);
        }
        None => warn!("no mqtt credentials stored, connecting anonymously"),
    }

    let subscriptions = topics.subscriptions(state.features());
    info!(
        broker = %cfg.mqtt.host,
        port = cfg.mqtt.port,
        subscriptions = ?subscriptions,
        "starting dispatch loop"
    );
    let transport = MqttTransport::new(options, subscriptions, cfg.mqtt.reconnect_timeout());

    let mut controller = Controller::new(transport, db, ProcessRestart, topics, state)
        .with_cascading_logs(cfg.telemetry.cascade_log_levels)
        .with_status(status);

    match controller.run().await {
        Exit::Restart => std::process::exit(RESTART_EXIT_CODE),
        Exit::TransportClosed => bail!("mqtt transport closed"),
    }
}
