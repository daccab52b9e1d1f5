//! End-to-end runs over the line protocol against the simulated modem.

use std::sync::Arc;
use std::time::Duration;

use tether_core::config::TetherConfig;
use tether_core::error::{ErrorKind, OpError};
use tether_core::op::{ConnectParams, EngineState, Modes, Mode, Operation, Value};
use tether_core::state::{AccessTech, Field, Registration};
use tether_plugins::{Generic3gpp, Huawei, PluginRegistry};
use tether_core::plugin::DeviceIdentity;
use tether_sim::test_util::{init_tracing, modem_session};
use tether_sim::ModemProfile;
use tokio_util::sync::CancellationToken;

async fn run(session: &tether_core::session::SessionHandle, op: Operation) -> Result<Value, OpError> {
    session.execute(op, CancellationToken::new()).await
}

fn huawei(cfg: &TetherConfig) -> Arc<Huawei> {
    Arc::new(Huawei::new(Arc::new(cfg.clone())))
}

#[tokio::test]
async fn identification_and_signal() {
    init_tracing();
    let cfg = TetherConfig::default();
    let plugin = Arc::new(Generic3gpp::new(Arc::new(cfg.clone())));
    let (session, modem) = modem_session(ModemProfile::generic(), plugin, &cfg);

    assert_eq!(run(&session, Operation::LoadManufacturer).await, Ok(Value::Text("Generic".into())));
    assert_eq!(run(&session, Operation::LoadModel).await, Ok(Value::Text("LTE Modem".into())));
    assert_eq!(run(&session, Operation::LoadRevision).await, Ok(Value::Text("1.0".into())));
    assert_eq!(
        run(&session, Operation::LoadSignal).await,
        Ok(Value::Signal {
            rssi_dbm: Some(-73),
            ber: None
        })
    );
    assert_eq!(
        run(&session, Operation::LoadCurrentModes).await,
        Ok(Value::Modes(Modes {
            allowed: vec![Mode::G2, Mode::G3, Mode::G4],
            preferred: None
        }))
    );
    assert_eq!(modem.commands(), vec!["AT+CGMI", "AT+CGMM", "AT+CGMR", "AT+CSQ", "AT+WS46?"]);
}

#[tokio::test]
async fn plugin_chosen_from_reported_identity() {
    init_tracing();
    let cfg = TetherConfig::default();
    let registry = PluginRegistry::standard(Arc::new(cfg.clone()));
    let (session, _modem) = modem_session(ModemProfile::default(), registry.select(&DeviceIdentity::default()), &cfg);

    let vendor = run(&session, Operation::LoadManufacturer).await.unwrap();
    let model = run(&session, Operation::LoadModel).await.unwrap();
    let device = DeviceIdentity::new(vendor.as_text().unwrap(), model.as_text().unwrap());
    let plugin = registry.select(&device);
    assert_eq!(plugin.name(), "huawei");
    session.adopt(plugin).await.unwrap();

    assert_eq!(
        run(&session, Operation::LoadCurrentModes).await,
        Ok(Value::Modes(Modes {
            allowed: vec![Mode::G2, Mode::G3, Mode::G4],
            preferred: Some(Mode::G4)
        }))
    );
}

#[tokio::test]
async fn vendor_signal_query_with_standard_fallback() {
    init_tracing();
    let cfg = TetherConfig::default();
    let (session, modem) = modem_session(ModemProfile::default(), huawei(&cfg), &cfg);
    assert_eq!(
        run(&session, Operation::LoadSignal).await,
        Ok(Value::Signal {
            rssi_dbm: Some(-61),
            ber: None
        })
    );
    assert_eq!(modem.count("AT+CSQ"), 0);

    // Older firmware without ^HCSQ.
    let profile = ModemProfile {
        hcsq: None,
        ..ModemProfile::default()
    };
    let (session, modem) = modem_session(profile, huawei(&cfg), &cfg);
    for _ in 0..2 {
        assert_eq!(
            run(&session, Operation::LoadSignal).await,
            Ok(Value::Signal {
                rssi_dbm: Some(-73),
                ber: None
            })
        );
    }
    assert_eq!(modem.commands(), vec!["AT^HCSQ?", "AT+CSQ", "AT+CSQ"]);
}

#[tokio::test(start_paused = true)]
async fn generic_connect_and_disconnect() {
    init_tracing();
    let cfg = TetherConfig::default();
    let plugin = Arc::new(Generic3gpp::new(Arc::new(cfg.clone())));
    let profile = ModemProfile {
        activation_polls: 2,
        ..ModemProfile::generic()
    };
    let (session, modem) = modem_session(profile, plugin, &cfg);

    let params = ConnectParams {
        user: Some("web".into()),
        password: Some("web".into()),
        ..ConnectParams::apn("internet")
    };
    let Value::Bearer(bearer) = run(&session, Operation::Connect(params)).await.unwrap() else {
        panic!("expected a bearer");
    };
    assert_eq!(bearer.cid, 1);
    assert_eq!(bearer.interface.as_deref(), Some("wwan0"));
    assert!(modem.is_active(1));
    assert_eq!(modem.count("AT+CGAUTH=1,"), 1);
    assert_eq!(modem.count("AT+CGACT?"), 3);

    assert_eq!(run(&session, Operation::Disconnect).await, Ok(Value::Unit));
    assert!(!modem.is_active(1));
    assert_eq!(session.snapshot().await.unwrap().bearer, None);
}

#[tokio::test(start_paused = true)]
async fn ndis_dial_with_notification() {
    init_tracing();
    let cfg = TetherConfig::default();
    let (session, modem) = modem_session(ModemProfile::default(), huawei(&cfg), &cfg);

    let start = tokio::time::Instant::now();
    assert!(run(&session, Operation::Connect(ConnectParams::apn("internet"))).await.is_ok());
    assert!(start.elapsed() < cfg.connect.connect_wait);
    assert_eq!(modem.count("AT^NDISSTATQRY?"), 0);

    assert_eq!(run(&session, Operation::Disconnect).await, Ok(Value::Unit));
    assert!(!modem.is_active(1));
    assert_eq!(
        modem.commands(),
        vec![
            "AT+CGDCONT=1,\"IP\",\"internet\"",
            "AT^NDISDUP=1,1,\"internet\"",
            "AT^NDISDUP=1,0",
            "AT^NDISSTATQRY?",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn ndis_dial_without_notification_polls() {
    init_tracing();
    let cfg = TetherConfig::default();
    let profile = ModemProfile {
        ndis_notify: false,
        ..ModemProfile::default()
    };
    let (session, modem) = modem_session(profile, huawei(&cfg), &cfg);

    assert!(run(&session, Operation::Connect(ConnectParams::apn("internet"))).await.is_ok());
    assert_eq!(modem.count("AT^NDISSTATQRY?"), 1);
    assert_eq!(session.snapshot().await.unwrap().bearer, Some(1));
}

#[tokio::test(start_paused = true)]
async fn location_engine_lifecycle() {
    init_tracing();
    let cfg = TetherConfig::default();
    let (session, modem) = modem_session(ModemProfile::default(), huawei(&cfg), &cfg);
    let mut changes = session.subscribe();

    assert_eq!(
        run(&session, Operation::LocationStart).await,
        Ok(Value::Location(EngineState::Started))
    );
    // Already running: nothing sent.
    assert_eq!(
        run(&session, Operation::LocationStart).await,
        Ok(Value::Location(EngineState::Started))
    );
    assert_eq!(
        run(&session, Operation::LocationStop).await,
        Ok(Value::Location(EngineState::Off))
    );
    assert_eq!(
        run(&session, Operation::LocationStop).await,
        Ok(Value::Location(EngineState::Off))
    );
    assert_eq!(modem.commands(), vec!["AT^WPDGP", "AT^WPEND"]);

    let mut seen = Vec::new();
    while let Ok(change) = changes.try_recv() {
        seen.push(change.field);
    }
    assert_eq!(
        seen,
        vec![
            Field::Location(EngineState::Starting),
            Field::Location(EngineState::Started),
            Field::Location(EngineState::Stopping),
            Field::Location(EngineState::Off),
        ]
    );
}

#[tokio::test]
async fn unsolicited_lines_update_state_between_operations() {
    init_tracing();
    let cfg = TetherConfig::default();
    let (session, modem) = modem_session(ModemProfile::default(), huawei(&cfg), &cfg);
    let mut changes = session.subscribe();

    modem.urc("+CEREG: 1,\"00A1\",\"0001F2C3\",7");
    modem.urc("^RSSI: 25");
    for _ in 0..3 {
        changes.recv().await.unwrap();
    }
    // Responses still parse with notifications interleaved.
    assert_eq!(run(&session, Operation::LoadModel).await, Ok(Value::Text("E3372".into())));

    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(snapshot.registration, Some(Registration::Home));
    assert_eq!(snapshot.access_tech, Some(AccessTech::Lte));
    assert_eq!(snapshot.signal_dbm, Some(-63));
}

#[tokio::test(start_paused = true)]
async fn late_reply_after_timeout_is_discarded() {
    init_tracing();
    let mut cfg = TetherConfig::default();
    cfg.channel.command_timeout = Duration::from_secs(1);
    let profile = ModemProfile {
        delays: [("AT+CSQ".to_string(), Duration::from_millis(1500))].into(),
        ..ModemProfile::generic()
    };
    let plugin = Arc::new(Generic3gpp::new(Arc::new(cfg.clone())));
    let (session, modem) = modem_session(profile, plugin, &cfg);

    let err = run(&session, Operation::LoadSignal).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(!session.is_closed());

    // Issued immediately; the late +CSQ answers must not resolve it.
    assert_eq!(run(&session, Operation::LoadModel).await, Ok(Value::Text("LTE Modem".into())));
    assert_eq!(modem.count("AT+CSQ"), 2);
    assert_eq!(
        run(&session, Operation::LoadRevision).await,
        Ok(Value::Text("1.0".into()))
    );
    assert_eq!(session.snapshot().await.unwrap().signal_dbm, None);
}

#[tokio::test]
async fn unplug_closes_the_session() {
    init_tracing();
    let cfg = TetherConfig::default();
    let (session, modem) = modem_session(ModemProfile::default(), huawei(&cfg), &cfg);
    let mut changes = session.subscribe();

    assert!(run(&session, Operation::LoadModel).await.is_ok());
    modem.unplug();
    session.closed().await;

    assert_eq!(changes.recv().await.unwrap().field, Field::Removed);
    assert!(session.snapshot().await.is_err());
    assert_eq!(run(&session, Operation::LoadModel).await, Err(OpError::SessionClosed));
}
