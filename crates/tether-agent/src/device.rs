//! Opening a modem and binding its session to a plugin.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::ValueEnum;
use tether_core::at::AtPort;
use tether_core::channel::Ports;
use tether_core::config::TetherConfig;
use tether_core::op::{Operation, Value};
use tether_core::plugin::{DeviceIdentity, Plugin};
use tether_core::session::{Session, SessionHandle};
use tether_core::state::SessionId;
use tether_core::urc::UrcTable;
use tether_plugins::PluginRegistry;
use tether_sim::{ModemProfile, SimModem};
use tokio_serial::SerialPortBuilderExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Simulated hardware families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SimProfile {
    Huawei,
    Generic,
}

impl SimProfile {
    fn profile(self) -> ModemProfile {
        match self {
            SimProfile::Huawei => ModemProfile::default().registered(),
            SimProfile::Generic => ModemProfile::generic().registered(),
        }
    }
}

pub enum Source {
    /// AT port character device, e.g. `/dev/ttyUSB2`.
    Serial(PathBuf),
    Simulated(SimProfile),
}

pub struct Device {
    pub session: SessionHandle,
    pub identity: DeviceIdentity,
    pub plugin: &'static str,
    // Keeps the simulated modem's control side alive.
    _modem: Option<SimModem>,
}

/// Open the AT port, identify the device and adopt the matching plugin.
///
/// `plugin` forces a plugin by name instead of selecting one from the
/// reported identity.
pub async fn open(
    source: Source,
    config: &TetherConfig,
    registry: &PluginRegistry,
    plugin: Option<&str>,
) -> anyhow::Result<Device> {
    let urcs = Arc::new(UrcTable::standard());
    let (port, events, modem) = match source {
        Source::Serial(path) => {
            let stream = tokio_serial::new(path.to_string_lossy(), config.channel.baud_rate)
                .open_native_async()
                .with_context(|| format!("opening {}", path.display()))?;
            info!(device = %path.display(), baud = config.channel.baud_rate, "AT port opened");
            let (port, events) = AtPort::spawn(stream, urcs, config.channel.urc_buffer);
            (port, events, None)
        }
        Source::Simulated(profile) => {
            let (host, modem) = SimModem::spawn(profile.profile());
            info!(?profile, "simulated modem started");
            let (port, events) = AtPort::spawn(host, urcs, config.channel.urc_buffer);
            (port, events, Some(modem))
        }
    };

    // Identification works on every AT family, so start with the fallback.
    let initial = registry.select(&DeviceIdentity::default());
    let session = Session::spawn(SessionId(1), Ports::new(Arc::new(port)), events, initial.clone(), config);

    let identity = DeviceIdentity::new(
        identify(&session, Operation::LoadManufacturer).await,
        identify(&session, Operation::LoadModel).await,
    );
    let chosen: Arc<dyn Plugin> = match plugin {
        Some(name) => match registry.by_name(name) {
            Some(p) => p,
            None => bail!("unknown plugin {name:?}, expected one of {:?}", registry.names()),
        },
        None => registry.select(&identity),
    };
    if chosen.name() != initial.name() {
        session.adopt(chosen.clone()).await?;
    }

    Ok(Device {
        session,
        identity,
        plugin: chosen.name(),
        _modem: modem,
    })
}

async fn identify(session: &SessionHandle, op: Operation) -> String {
    match session.execute(op.clone(), CancellationToken::new()).await {
        Ok(Value::Text(s)) => s,
        Ok(other) => {
            warn!(%op, value = ?other, "identification returned no text");
            String::new()
        }
        Err(e) => {
            warn!(%op, error = %e, "identification failed");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::state::Registration;

    fn registry(config: &TetherConfig) -> PluginRegistry {
        PluginRegistry::standard(Arc::new(config.clone()))
    }

    #[tokio::test]
    async fn simulated_huawei_adopts_vendor_plugin() {
        let config = TetherConfig::default();
        let device = open(Source::Simulated(SimProfile::Huawei), &config, &registry(&config), None)
            .await
            .unwrap();
        assert_eq!(device.identity.vendor, "huawei");
        assert_eq!(device.identity.model, "E3372");
        assert_eq!(device.plugin, "huawei");

        // Announced by the modem at power-on, before identification.
        let snapshot = device.session.snapshot().await.unwrap();
        assert_eq!(snapshot.registration, Some(Registration::Home));
    }

    #[tokio::test]
    async fn forced_plugin_and_unknown_names() {
        let config = TetherConfig::default();
        let r = registry(&config);
        let device = open(Source::Simulated(SimProfile::Huawei), &config, &r, Some("generic"))
            .await
            .unwrap();
        assert_eq!(device.plugin, "generic");

        let err = open(Source::Simulated(SimProfile::Generic), &config, &r, Some("nope"))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("unknown plugin"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn serial_port_writes_while_a_read_is_pending() {
        use std::time::Duration;
        use tether_core::channel::{Channel, Request};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (host, mut modem) = tokio_serial::SerialStream::pair().unwrap();
        let (port, _events) = AtPort::spawn(host, Arc::new(UrcTable::standard()), 8);
        let device = tokio::spawn(async move {
            let mut cmd = Vec::new();
            let mut byte = [0u8; 1];
            while modem.read_exact(&mut byte).await.is_ok() && byte[0] != b'\r' {
                cmd.push(byte[0]);
            }
            modem.write_all(b"\r\nOK\r\n").await.unwrap();
            (cmd, modem)
        });

        let reply = tokio::time::timeout(
            Duration::from_secs(5),
            port.send(Request::at("AT"), Duration::from_secs(2)),
        )
        .await
        .unwrap();
        assert!(reply.is_ok(), "{reply:?}");
        let (cmd, _modem) = device.await.unwrap();
        assert_eq!(cmd, b"AT");
    }

    #[tokio::test]
    async fn missing_serial_device_is_reported() {
        let config = TetherConfig::default();
        let err = open(
            Source::Serial("/nonexistent/ttyUSB9".into()),
            &config,
            &registry(&config),
            None,
        )
        .await
        .err()
        .unwrap();
        assert!(err.to_string().contains("/nonexistent/ttyUSB9"));
    }
}
