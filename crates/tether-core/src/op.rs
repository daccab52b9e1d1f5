//! Operation vocabulary: what callers can ask a session to do, and the typed
//! values operations complete with.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Requests ────────────────────────────────────────────────────────

/// Authentication method for packet-data contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    #[default]
    None,
    Pap,
    Chap,
}

impl AuthMethod {
    /// 3GPP TS 27.007 `+CGAUTH` `<auth_prot>` value.
    pub fn code(self) -> u8 {
        match self {
            AuthMethod::None => 0,
            AuthMethod::Pap => 1,
            AuthMethod::Chap => 2,
        }
    }
}

/// IP family requested for a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    #[default]
    Ipv4,
    Ipv6,
    Ipv4v6,
}

impl IpFamily {
    /// `<PDP_type>` string for `+CGDCONT`.
    pub fn pdp_type(self) -> &'static str {
        match self {
            IpFamily::Ipv4 => "IP",
            IpFamily::Ipv6 => "IPV6",
            IpFamily::Ipv4v6 => "IPV4V6",
        }
    }
}

/// Parameters of a connect request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectParams {
    pub apn: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub auth: AuthMethod,
    #[serde(default)]
    pub ip_family: IpFamily,
}

impl ConnectParams {
    pub fn apn(apn: impl Into<String>) -> Self {
        Self {
            apn: apn.into(),
            ..Default::default()
        }
    }

    /// Credentials were supplied, so an authenticate step is required.
    pub fn needs_auth(&self) -> bool {
        self.auth != AuthMethod::None || self.user.is_some() || self.password.is_some()
    }
}

/// One externally requested action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    LoadManufacturer,
    LoadModel,
    LoadRevision,
    LoadSignal,
    LoadCurrentModes,
    Connect(ConnectParams),
    Disconnect,
    LocationStart,
    LocationStop,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::LoadManufacturer => "load-manufacturer",
            Operation::LoadModel => "load-model",
            Operation::LoadRevision => "load-revision",
            Operation::LoadSignal => "load-signal",
            Operation::LoadCurrentModes => "load-current-modes",
            Operation::Connect(_) => "connect",
            Operation::Disconnect => "disconnect",
            Operation::LocationStart => "location-start",
            Operation::LocationStop => "location-stop",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Values ──────────────────────────────────────────────────────────

/// Radio access generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[serde(rename = "2g")]
    G2,
    #[serde(rename = "3g")]
    G3,
    #[serde(rename = "4g")]
    G4,
    #[serde(rename = "5g")]
    G5,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::G2 => write!(f, "2G"),
            Mode::G3 => write!(f, "3G"),
            Mode::G4 => write!(f, "4G"),
            Mode::G5 => write!(f, "5G"),
        }
    }
}

/// Allowed and preferred access generations.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Modes {
    pub allowed: Vec<Mode>,
    pub preferred: Option<Mode>,
}

/// An established data bearer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BearerInfo {
    /// Context identifier (AT) or packet data handle (message channels).
    pub cid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
}

/// Location engine state machine.
///
/// ```text
///   Off ──start──▶ Starting ──ok──▶ Started ──stop──▶ Stopping ──notified/timeout──▶ Off
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    #[default]
    Off,
    Starting,
    Started,
    Stopping,
}

/// Typed success value of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Unit,
    Text(String),
    Signal {
        /// Received signal strength in dBm, `None` when unknown.
        rssi_dbm: Option<i32>,
        /// Bit error rate class 0–7, `None` when unknown.
        ber: Option<u8>,
    },
    Modes(Modes),
    Bearer(BearerInfo),
    Location(EngineState),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_params_auth_detection() {
        assert!(!ConnectParams::apn("internet").needs_auth());
        let p = ConnectParams {
            user: Some("u".into()),
            ..ConnectParams::apn("internet")
        };
        assert!(p.needs_auth());
    }

    #[test]
    fn operation_names() {
        assert_eq!(Operation::Connect(ConnectParams::apn("x")).name(), "connect");
        assert_eq!(Operation::LocationStop.to_string(), "location-stop");
    }
}
