//! Topic table. Every topic lives under `<device_id>/`; inbound commands are
//! matched by exact string comparison.

use serde::Serialize;

use crate::features::FeatureConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Command {
    DispenseActivate,
    DrainActivate,
    Deactivate,
    Restart,
    ConfigChange,
    SettingsReset,
}

impl Command {
    pub const ALL: [Command; 6] = [
        Command::DispenseActivate,
        Command::DrainActivate,
        Command::Deactivate,
        Command::Restart,
        Command::ConfigChange,
        Command::SettingsReset,
    ];

    fn suffix(self) -> &'static str {
        match self {
            Self::DispenseActivate => "dispense/activate",
            Self::DrainActivate => "drain/activate",
            Self::Deactivate => "deactivate",
            Self::Restart => "restart",
            Self::ConfigChange => "config/change",
            Self::SettingsReset => "settings/reset",
        }
    }

    /// Whether the command is served with the given hardware installed.
    pub fn available(self, features: &FeatureConfig) -> bool {
        match self {
            Self::DrainActivate => features.drain_valve,
            _ => true,
        }
    }
}

/// Outbound report topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Channel {
    DispenseSlice,
    DispenseSummary,
    DrainSummary,
    PressureReport,
    Config,
    Log,
    Warning,
    Error,
}

impl Channel {
    fn suffix(self) -> &'static str {
        match self {
            Self::DispenseSlice => "dispense/report/slice",
            Self::DispenseSummary => "dispense/report/summary",
            Self::DrainSummary => "drain/report/summary",
            Self::PressureReport => "pressure/report",
            Self::Config => "config",
            Self::Log => "log",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Topics {
    prefix: String,
    commands: Vec<(String, Command)>,
}

impl Topics {
    pub fn new(device_id: &str) -> Self {
        let commands = Command::ALL
            .iter()
            .map(|c| (format!("{device_id}/{}", c.suffix()), *c))
            .collect();
        Self {
            prefix: device_id.to_string(),
            commands,
        }
    }

    pub fn command(&self, command: Command) -> &str {
        self.commands
            .iter()
            .find(|(_, c)| *c == command)
            .map(|(t, _)| t.as_str())
            .unwrap_or_default()
    }

    pub fn channel(&self, channel: Channel) -> String {
        format!("{}/{}", self.prefix, channel.suffix())
    }

    /// First table entry whose topic equals `topic` and whose feature is
    /// installed.
    pub fn match_command(&self, topic: &str, features: &FeatureConfig) -> Option<Command> {
        self.commands
            .iter()
            .find(|(t, c)| t == topic && c.available(features))
            .map(|(_, c)| *c)
    }

    /// Topics to subscribe to for the installed hardware.
    pub fn subscriptions(&self, features: &FeatureConfig) -> Vec<String> {
        self.commands
            .iter()
            .filter(|(_, c)| c.available(features))
            .map(|(t, _)| t.clone())
            .collect()
    }
}
