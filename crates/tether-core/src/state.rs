//! Session state snapshot and change notifications.
//!
//! The snapshot is owned by the session task. Unsolicited events and
//! completed procedures update it through [`Field`]s; every effective
//! change is broadcast as a [`StateChange`].

use std::fmt;

use serde::Serialize;

use crate::op::EngineState;

/// Identifies one device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Network registration status (3GPP TS 27.007 `<stat>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Registration {
    Idle,
    Home,
    Searching,
    Denied,
    Unknown,
    Roaming,
}

impl Registration {
    pub fn from_stat(stat: u32) -> Self {
        match stat {
            0 => Registration::Idle,
            1 => Registration::Home,
            2 => Registration::Searching,
            3 => Registration::Denied,
            5 => Registration::Roaming,
            _ => Registration::Unknown,
        }
    }

    pub fn is_registered(self) -> bool {
        matches!(self, Registration::Home | Registration::Roaming)
    }
}

/// Radio access technology currently in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessTech {
    Gsm,
    Umts,
    Lte,
    Nr,
    Unknown,
}

impl AccessTech {
    /// 3GPP TS 27.007 `<AcT>` value.
    pub fn from_act(act: u32) -> Self {
        match act {
            0 | 1 | 3 => AccessTech::Gsm,
            2 | 4 | 5 | 6 => AccessTech::Umts,
            7 | 9 => AccessTech::Lte,
            10..=13 => AccessTech::Nr,
            _ => AccessTech::Unknown,
        }
    }
}

/// Convert a `+CSQ`/`^RSSI` index (0–31, 99 unknown) to dBm.
pub fn csq_to_dbm(index: u32) -> Option<i32> {
    (index <= 31).then(|| -113 + 2 * index as i32)
}

/// One observable session attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum Field {
    Registration(Registration),
    AccessTech(AccessTech),
    /// Signal strength in dBm, `None` when the device reports unknown.
    Signal(Option<i32>),
    /// Data bearer up (with its context id) or down.
    Bearer(Option<u32>),
    Location(EngineState),
    /// The device went away; the session is closed.
    Removed,
}

/// A change notification for downstream consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub session: SessionId,
    #[serde(flatten)]
    pub field: Field,
}

/// Cached view of the device, owned by the session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateSnapshot {
    pub registration: Option<Registration>,
    pub access_tech: Option<AccessTech>,
    pub signal_dbm: Option<i32>,
    pub bearer: Option<u32>,
    pub location: EngineState,
    pub removed: bool,
}

impl StateSnapshot {
    /// Apply a field; returns whether anything changed.
    pub fn apply(&mut self, field: &Field) -> bool {
        match field {
            Field::Registration(r) => replace(&mut self.registration, Some(*r)),
            Field::AccessTech(t) => replace(&mut self.access_tech, Some(*t)),
            Field::Signal(s) => replace(&mut self.signal_dbm, *s),
            Field::Bearer(b) => replace(&mut self.bearer, *b),
            Field::Location(l) => replace(&mut self.location, *l),
            Field::Removed => replace(&mut self.removed, true),
        }
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}
