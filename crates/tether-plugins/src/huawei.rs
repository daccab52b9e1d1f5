//! # Huawei NDIS Plugin
//!
//! Dialing goes through `^NDISDUP`, which answers `OK` immediately and
//! reports the outcome later as `^NDISSTAT`. When no notification arrives
//! in time the connection state is polled with `^NDISSTATQRY?`.
//!
//! ```text
//!   Define ──ok──▶ Dial ──ok──▶ Wait ──NDISSTAT 1──▶ Done
//!                                 │ timeout
//!                                 ▼
//!                               Poll ──1──▶ Done
//!                                 │ 0
//!                                 └─sleep─▶ Poll
//! ```

use std::sync::Arc;

use tether_core::classify::{Expect, Payload, Shape, split_fields};
use tether_core::config::TetherConfig;
use tether_core::correlator::{Handler, Pattern};
use tether_core::error::{ClassifyError, OpError, ProtocolError, StepError};
use tether_core::op::{BearerInfo, ConnectParams, Operation, Value};
use tether_core::plugin::{DeviceIdentity, Plugin};
use tether_core::probe::Feature;
use tether_core::sequence::{Action, Input, Procedure, Retry, StepContext};
use tether_core::state::{AccessTech, Field, csq_to_dbm};
use tether_core::step::CommandStep;
use tether_core::urc::UrcKind;
use tether_core::Event;
use tracing::{debug, info, warn};

use crate::dial::{self, quote};
use crate::generic;
use crate::load::{ProbeFallback, unexpected};
use crate::location::{self, Dialect};
use crate::tables;

pub struct Huawei {
    config: Arc<TetherConfig>,
}

impl Huawei {
    pub fn new(config: Arc<TetherConfig>) -> Self {
        Self { config }
    }
}

/// `^SYSCFGEX: "<acqorder>",<band>,...`.
pub fn syscfgex(p: Payload) -> Result<Payload, ClassifyError> {
    let text = p
        .text()
        .ok_or_else(|| ClassifyError::Parse("no ^SYSCFGEX line".into()))?;
    let acqorder = split_fields(text).into_iter().next().unwrap_or_default();
    tables::syscfgex_modes(acqorder)
        .map(|m| Payload::Value(Value::Modes(m)))
        .ok_or_else(|| ClassifyError::Unexpected(format!("unknown acquisition order {acqorder:?}")))
}

/// `^HCSQ?` answers in a per-RAT shape; the first measurement is always
/// the rssi, `NOSERVICE` carries none.
fn hcsq_step() -> Result<CommandStep, OpError> {
    let shapes = [
        Shape::new("measured", r#"^\^HCSQ:\s*"(LTE|WCDMA|GSM|TD-SCDMA)"\s*,\s*(\d+)"#),
        Shape::new("no-service", r#"^\^HCSQ:\s*"NOSERVICE""#),
    ]
    .into_iter()
    .collect::<Result<Vec<_>, _>>()
    .map_err(|e| OpError::Invariant(format!("bad ^HCSQ shape: {e}")))?;
    Ok(CommandStep::at("signal", "AT^HCSQ?")
        .expect(Expect::OneOf(shapes.into()))
        .parse(hcsq)
        .retry_once())
}

/// `^HCSQ` rssi: 0 is below -120 dBm, each step is 1 dB, 255 unknown.
pub fn hcsq(p: Payload) -> Result<Payload, ClassifyError> {
    let rssi_dbm = match p {
        Payload::Matched {
            label: "no-service", ..
        } => None,
        Payload::Matched { captures, .. } => {
            let raw = captures.get(1).map(String::as_str).unwrap_or_default();
            let rssi: u32 = raw
                .parse()
                .map_err(|_| ClassifyError::Parse(format!("bad ^HCSQ rssi {raw:?}")))?;
            (rssi <= 96).then(|| -121 + rssi as i32)
        }
        other => return Err(ClassifyError::Unexpected(format!("{other:?}"))),
    };
    Ok(Payload::Value(Value::Signal { rssi_dbm, ber: None }))
}

/// Leading connection state of `^NDISSTATQRY:`, 1 when connected.
fn ndis_state(reply: &Payload) -> Result<bool, OpError> {
    let text = reply
        .text()
        .ok_or_else(|| OpError::Unexpected("no ^NDISSTATQRY line".into()))?;
    match split_fields(text).first().copied() {
        Some("1") => Ok(true),
        Some("0") | Some("2") | Some("3") => Ok(false),
        other => Err(OpError::Parse(format!("bad NDIS state {other:?}"))),
    }
}

fn status_query() -> CommandStep {
    CommandStep::at("verify", "AT^NDISSTATQRY?")
        .expect(Expect::Prefixed("^NDISSTATQRY:"))
        .retry_once()
}

fn hang_up(cid: u32) -> CommandStep {
    CommandStep::at("hang-up", format!("AT^NDISDUP={cid},0"))
}

/// `^MODE` `<sys_mode>` as reported by LTE-era firmware.
fn sys_mode(mode: u32) -> Option<AccessTech> {
    match mode {
        0 => None,
        3 => Some(AccessTech::Gsm),
        5 | 15 => Some(AccessTech::Umts),
        7 => Some(AccessTech::Lte),
        _ => Some(AccessTech::Unknown),
    }
}

// ── Connect ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Define,
    Dial,
    Wait,
    Poll,
}

pub struct NdisConnect {
    config: Arc<TetherConfig>,
    params: ConnectParams,
    cid: u32,
    stage: Stage,
    busy: Retry,
    poll: Retry,
    dialed: bool,
}

impl NdisConnect {
    pub fn new(config: Arc<TetherConfig>, params: ConnectParams) -> Self {
        let c = &config.connect;
        Self {
            cid: c.cid,
            busy: Retry::new(c.busy_retries + 1, c.busy_delay),
            poll: Retry::new(c.verify_attempts, c.verify_interval),
            params,
            stage: Stage::Define,
            dialed: false,
            config,
        }
    }

    fn define(&mut self) -> Action {
        self.stage = Stage::Define;
        self.busy.begin();
        Action::Send(dial::define_step(self.cid, &self.params))
    }

    fn dial(&mut self) -> Action {
        self.stage = Stage::Dial;
        self.dialed = true;
        let p = &self.params;
        let mut cmd = format!("AT^NDISDUP={},1,{}", self.cid, quote(&p.apn));
        if p.needs_auth() {
            cmd.push_str(&format!(
                ",{},{},{}",
                quote(p.user.as_deref().unwrap_or_default()),
                quote(p.password.as_deref().unwrap_or_default()),
                p.auth.code()
            ));
        }
        Action::Send(CommandStep::at("dial", cmd).timeout(self.config.channel.long_timeout))
    }

    fn poll(&mut self) -> Action {
        self.stage = Stage::Poll;
        self.poll.begin();
        Action::Send(status_query())
    }

    fn connected(&self, ctx: &mut StepContext) -> Action {
        ctx.update(Field::Bearer(Some(self.cid)));
        Action::Complete(Value::Bearer(BearerInfo {
            cid: self.cid,
            interface: ctx.data_interface().map(str::to_string),
        }))
    }

    fn on_reply(&mut self, ctx: &mut StepContext, reply: Result<Payload, StepError>) -> Action {
        match (self.stage, reply) {
            (Stage::Define, Err(e)) if dial::is_busy(&e) => match self.busy.again() {
                Some(delay) => Action::Sleep(delay),
                None => Action::Fail(OpError::RetriesExhausted {
                    step: "define",
                    attempts: self.busy.attempts(),
                }),
            },
            (_, Err(e)) => Action::Fail(e.into()),
            (Stage::Define, Ok(_)) => self.dial(),
            (Stage::Dial, Ok(_)) => {
                self.stage = Stage::Wait;
                Action::Await {
                    pattern: Pattern::Urc(UrcKind::BearerState),
                    until: None,
                    timeout: self.config.connect.connect_wait,
                }
            }
            (Stage::Poll, Ok(payload)) => match ndis_state(&payload) {
                Ok(true) => self.connected(ctx),
                Ok(false) => match self.poll.again() {
                    Some(delay) => Action::Sleep(delay),
                    None => Action::Fail(OpError::RetriesExhausted {
                        step: "verify",
                        attempts: self.poll.attempts(),
                    }),
                },
                Err(e) => Action::Fail(e),
            },
            (Stage::Wait, Ok(_)) => Action::Fail(OpError::Invariant("reply while awaiting NDISSTAT".into())),
        }
    }
}

impl Procedure for NdisConnect {
    fn name(&self) -> &'static str {
        "ndis-connect"
    }

    fn advance(&mut self, ctx: &mut StepContext, input: Input) -> Action {
        match input {
            Input::Start => self.define(),
            Input::Reply(reply) => self.on_reply(ctx, reply),
            Input::Event(Event::Urc(urc)) => match urc.field_u32(0) {
                Some(1) => {
                    info!(cid = self.cid, "NDIS connected");
                    self.connected(ctx)
                }
                stat => {
                    debug!(?stat, raw = %urc.raw, "NDIS connection refused");
                    Action::Fail(OpError::Protocol(ProtocolError::CallFailed))
                }
            },
            Input::WaitTimedOut => {
                debug!("no NDISSTAT notification, polling");
                self.poll()
            }
            Input::Woke => match self.stage {
                Stage::Define => self.define(),
                Stage::Poll => self.poll(),
                _ => Action::Fail(OpError::Invariant("woke outside a retry".into())),
            },
            other => unexpected(other),
        }
    }

    fn cleanup(&mut self, _ctx: &mut StepContext, outcome: &Result<Value, OpError>) -> Option<CommandStep> {
        (outcome.is_err() && self.dialed).then(|| hang_up(self.cid))
    }
}

// ── Disconnect ──────────────────────────────────────────────────────

pub struct NdisDisconnect {
    config: Arc<TetherConfig>,
    poll: Retry,
    hung_up: bool,
}

impl NdisDisconnect {
    pub fn new(config: Arc<TetherConfig>) -> Self {
        let d = &config.disconnect;
        Self {
            poll: Retry::new(d.verify_attempts, d.verify_interval),
            hung_up: false,
            config,
        }
    }

    fn poll(&mut self) -> Action {
        self.poll.begin();
        Action::Send(status_query())
    }

    fn done(ctx: &mut StepContext) -> Action {
        ctx.update(Field::Bearer(None));
        Action::Complete(Value::Unit)
    }
}

impl Procedure for NdisDisconnect {
    fn name(&self) -> &'static str {
        "ndis-disconnect"
    }

    fn advance(&mut self, ctx: &mut StepContext, input: Input) -> Action {
        match input {
            Input::Start => {
                let cid = ctx.snapshot().bearer.unwrap_or(self.config.connect.cid);
                Action::Send(hang_up(cid).timeout(self.config.channel.long_timeout))
            }
            Input::Reply(Ok(_)) if !self.hung_up => {
                self.hung_up = true;
                self.poll()
            }
            Input::Reply(Err(e)) if !self.hung_up => Action::Fail(e.into()),
            Input::Reply(Err(e)) => match e.transport() {
                Some(t) => {
                    warn!(error = %t, "status poll failed after hang-up, assuming disconnected");
                    Self::done(ctx)
                }
                None => Action::Fail(e.into()),
            },
            Input::Reply(Ok(payload)) => match ndis_state(&payload) {
                Ok(false) => Self::done(ctx),
                Ok(true) => match self.poll.again() {
                    Some(delay) => Action::Sleep(delay),
                    None => Action::Fail(OpError::RetriesExhausted {
                        step: "verify",
                        attempts: self.poll.attempts(),
                    }),
                },
                Err(e) => Action::Fail(e),
            },
            Input::Woke => self.poll(),
            other => unexpected(other),
        }
    }
}

// ── Plugin ──────────────────────────────────────────────────────────

impl Plugin for Huawei {
    fn name(&self) -> &'static str {
        "huawei"
    }

    fn supports(&self, device: &DeviceIdentity) -> bool {
        device.vendor_is("huawei") || device.usb_vendor == Some(0x12d1)
    }

    fn procedure(&self, op: &Operation) -> Result<Box<dyn Procedure>, OpError> {
        if let Some(p) = generic::identification(op) {
            return Ok(p);
        }
        let location = &self.config.location;
        match op {
            Operation::LoadSignal => Ok(Box::new(ProbeFallback::new(
                "signal",
                Feature("hcsq"),
                hcsq_step()?,
                generic::csq_step(),
            ))),
            Operation::LoadCurrentModes => Ok(Box::new(ProbeFallback::new(
                "current-modes",
                Feature("syscfgex"),
                CommandStep::at("current-modes", "AT^SYSCFGEX?")
                    .expect(Expect::Prefixed("^SYSCFGEX:"))
                    .parse(syscfgex)
                    .retry_once(),
                generic::ws46_step(),
            ))),
            Operation::Connect(params) => Ok(Box::new(NdisConnect::new(self.config.clone(), params.clone()))),
            Operation::Disconnect => Ok(Box::new(NdisDisconnect::new(self.config.clone()))),
            Operation::LocationStart => Ok(Box::new(location::Start::new(Dialect::HUAWEI, location))),
            Operation::LocationStop => Ok(Box::new(location::Stop::new(Dialect::HUAWEI, location))),
            _ => Err(OpError::Invariant(format!("{op} has no procedure"))),
        }
    }

    fn interests(&self) -> Vec<(Pattern, Handler)> {
        let rssi: Handler = Box::new(|event, _| match event {
            Event::Urc(urc) => urc
                .field_u32(0)
                .map(|idx| vec![Field::Signal(csq_to_dbm(idx))])
                .unwrap_or_default(),
            _ => Vec::new(),
        });
        let mode: Handler = Box::new(|event, _| match event {
            Event::Urc(urc) => urc
                .field_u32(0)
                .and_then(sys_mode)
                .map(|t| vec![Field::AccessTech(t)])
                .unwrap_or_default(),
            _ => Vec::new(),
        });
        let mut interests = generic::standard_interests();
        interests.push((Pattern::Urc(UrcKind::SignalQuality), rssi));
        interests.push((Pattern::Urc(UrcKind::AccessTechnology), mode));
        interests
    }
}
