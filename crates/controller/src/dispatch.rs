//! Topic → handler routing.

use tracing::{debug, info};

use crate::device::DeviceState;
use crate::handlers::{self, Outcome};
use crate::topics::{Command, Topics};

/// Route one inbound message. Returns `None` for topics outside the table
/// (or belonging to hardware that is not installed); those leave the state
/// untouched.
pub fn dispatch(
    state: &mut DeviceState,
    topics: &Topics,
    topic: &str,
    payload: &[u8],
) -> Option<(Command, Outcome)> {
    debug!(topic = %topic, bytes = payload.len(), "received message");

    let Some(command) = topics.match_command(topic, state.features()) else {
        info!(topic = %topic, "topic is unhandled");
        return None;
    };

    let outcome = match command {
        Command::DispenseActivate => handlers::dispense_activate(state, topics, payload),
        Command::DrainActivate => handlers::drain_activate(state, topics, payload),
        Command::Deactivate => handlers::deactivate(state),
        Command::Restart => handlers::restart(),
        Command::ConfigChange => handlers::config_change(state, payload),
        Command::SettingsReset => handlers::settings_reset(payload),
    };

    Some((command, outcome))
}
