//! Generic 3GPP TS 27.007 plugin: the fallback for any AT modem.

use std::sync::Arc;

use tether_core::classify::Expect;
use tether_core::config::TetherConfig;
use tether_core::correlator::{Handler, Pattern};
use tether_core::error::OpError;
use tether_core::op::Operation;
use tether_core::plugin::{DeviceIdentity, Plugin};
use tether_core::probe::Feature;
use tether_core::sequence::Procedure;
use tether_core::state::{AccessTech, Field, Registration};
use tether_core::step::CommandStep;
use tether_core::urc::UrcKind;
use tether_core::Event;

use crate::dial;
use crate::load::{self, ProbeFallback, Query};

pub struct Generic3gpp {
    config: Arc<TetherConfig>,
}

impl Generic3gpp {
    pub fn new(config: Arc<TetherConfig>) -> Self {
        Self { config }
    }
}

/// `+CGxx` with a `+Gxx` fallback for devices predating the 3GPP names.
pub(crate) fn identification(op: &Operation) -> Option<Box<dyn Procedure>> {
    let (name, feature, primary, fallback) = match op {
        Operation::LoadManufacturer => ("manufacturer", Feature("cgmi"), "AT+CGMI", "AT+GMI"),
        Operation::LoadModel => ("model", Feature("cgmm"), "AT+CGMM", "AT+GMM"),
        Operation::LoadRevision => ("revision", Feature("cgmr"), "AT+CGMR", "AT+GMR"),
        _ => return None,
    };
    let step = |label: &'static str, cmd: &str| {
        CommandStep::at(label, cmd)
            .expect(Expect::Text)
            .parse(load::info_text)
            .retry_once()
    };
    Some(Box::new(ProbeFallback::new(
        name,
        feature,
        step(name, primary),
        step(name, fallback),
    )))
}

pub(crate) fn csq_step() -> CommandStep {
    CommandStep::at("signal", "AT+CSQ")
        .expect(Expect::Prefixed("+CSQ:"))
        .parse(load::csq)
        .retry_once()
}

pub(crate) fn signal() -> Box<dyn Procedure> {
    Box::new(Query::new("signal", csq_step()))
}

pub(crate) fn ws46_step() -> CommandStep {
    CommandStep::at("current-modes", "AT+WS46?")
        .expect(Expect::Prefixed("+WS46:"))
        .parse(load::ws46)
        .retry_once()
}

/// Registration and packet-domain interests shared by every AT family.
pub(crate) fn standard_interests() -> Vec<(Pattern, Handler)> {
    let registration: Handler = Box::new(|event, _snapshot| {
        let Event::Urc(urc) = event else { return Vec::new() };
        let mut fields = Vec::new();
        if let Some(stat) = urc.field_u32(0) {
            fields.push(Field::Registration(Registration::from_stat(stat)));
        }
        if let Some(act) = urc.field_u32(3) {
            fields.push(Field::AccessTech(AccessTech::from_act(act)));
        }
        fields
    });
    let packet_domain: Handler = Box::new(|event, snapshot| {
        let Event::Urc(urc) = event else { return Vec::new() };
        match (urc.field(0).and_then(deactivated_cid), snapshot.bearer) {
            (Some(cid), Some(bearer)) if cid == bearer => vec![Field::Bearer(None)],
            _ => Vec::new(),
        }
    });
    vec![
        (Pattern::Urc(UrcKind::Registration), registration),
        (Pattern::Urc(UrcKind::PacketDomain), packet_domain),
    ]
}

/// Context id of a `+CGEV: NW DEACT` / `ME DEACT` / `NW PDN DEACT` event.
fn deactivated_cid(event: &str) -> Option<u32> {
    let mut words = event.split_whitespace();
    let source = words.next()?;
    if source != "NW" && source != "ME" {
        return None;
    }
    let mut verb = words.next()?;
    if verb == "PDN" {
        verb = words.next()?;
    }
    if verb != "DEACT" {
        return None;
    }
    // `NW DEACT <PDP_type>, <PDP_addr>, <cid>` puts the cid last.
    event
        .rsplit([' ', ','])
        .find(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
}

impl Plugin for Generic3gpp {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn supports(&self, _device: &DeviceIdentity) -> bool {
        true
    }

    fn procedure(&self, op: &Operation) -> Result<Box<dyn Procedure>, OpError> {
        if let Some(p) = identification(op) {
            return Ok(p);
        }
        match op {
            Operation::LoadSignal => Ok(signal()),
            Operation::LoadCurrentModes => Ok(Box::new(Query::new("current-modes", ws46_step()))),
            Operation::Connect(params) => Ok(Box::new(dial::Connect::new(self.config.clone(), params.clone()))),
            Operation::Disconnect => Ok(Box::new(dial::Disconnect::new(self.config.clone()))),
            Operation::LocationStart | Operation::LocationStop => Err(OpError::Unsupported(op.name().into())),
            _ => Err(OpError::Invariant(format!("{op} has no procedure"))),
        }
    }

    fn interests(&self) -> Vec<(Pattern, Handler)> {
        standard_interests()
    }
}
