//! Session builders shared by the integration tests and the agent's
//! simulation mode.

use std::sync::{Arc, Once};

use tether_core::at::AtPort;
use tether_core::channel::Ports;
use tether_core::config::TetherConfig;
use tether_core::plugin::Plugin;
use tether_core::session::{Session, SessionHandle};
use tether_core::state::SessionId;
use tether_core::urc::UrcTable;

use crate::modem::{ModemProfile, SimModem};
use crate::scripted::{Script, ScriptedChannel};

/// Route `tracing` output to the test harness, once per process.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// A session over a scripted channel.
pub fn scripted_session(
    script: Script,
    plugin: Arc<dyn Plugin>,
    config: &TetherConfig,
) -> (SessionHandle, Arc<ScriptedChannel>) {
    let (channel, events) = ScriptedChannel::new(script);
    let ports = Ports::new(channel.clone()).with_data_interface("wwan0");
    let handle = Session::spawn(SessionId(1), ports, events, plugin, config);
    (handle, channel)
}

/// A session over an [`AtPort`] talking to a simulated modem.
pub fn modem_session(
    profile: ModemProfile,
    plugin: Arc<dyn Plugin>,
    config: &TetherConfig,
) -> (SessionHandle, SimModem) {
    let (host, modem) = SimModem::spawn(profile);
    let (port, events) = AtPort::spawn(host, Arc::new(UrcTable::standard()), config.channel.urc_buffer);
    let ports = Ports::new(Arc::new(port)).with_data_interface("wwan0");
    let handle = Session::spawn(SessionId(1), ports, events, plugin, config);
    (handle, modem)
}
