//! QMI-style message plugin: DMS identification, NAS signal and mode
//! preference, WDS packet data sessions.
//!
//! A WDS session is identified by the packet data handle returned from
//! start-network. The handle is what the session snapshot records as the
//! bearer id and what stop-network needs, so disconnect reads it back from
//! the snapshot.

use std::sync::Arc;

use bytes::{Buf, Bytes};
use tether_core::channel::{Message, MessageReply};
use tether_core::classify::Payload;
use tether_core::config::TetherConfig;
use tether_core::correlator::{Handler, Pattern};
use tether_core::error::{ClassifyError, OpError};
use tether_core::op::{BearerInfo, ConnectParams, Operation, Value};
use tether_core::plugin::{DeviceIdentity, Plugin};
use tether_core::sequence::{Action, Input, Procedure, Retry, StepContext};
use tether_core::state::{AccessTech, Field, Registration};
use tether_core::step::CommandStep;
use tether_core::Event;
use tracing::{debug, warn};

use crate::load::{Query, unexpected};
use crate::tables;

pub mod wds {
    pub const SERVICE: u8 = 0x01;
    pub const START_NETWORK: u16 = 0x0020;
    pub const STOP_NETWORK: u16 = 0x0021;
    pub const PACKET_SERVICE_STATUS: u16 = 0x0022;

    pub const TLV_APN: u8 = 0x14;
    pub const TLV_AUTH_PREF: u8 = 0x16;
    pub const TLV_USERNAME: u8 = 0x17;
    pub const TLV_PASSWORD: u8 = 0x18;
    pub const TLV_HANDLE: u8 = 0x01;
    pub const TLV_STATUS: u8 = 0x01;

    pub const STATUS_DISCONNECTED: u8 = 1;
    pub const STATUS_CONNECTED: u8 = 2;
}

pub mod dms {
    pub const SERVICE: u8 = 0x02;
    pub const GET_MANUFACTURER: u16 = 0x0021;
    pub const GET_MODEL: u16 = 0x0022;
    pub const GET_REVISION: u16 = 0x0023;
}

pub mod nas {
    pub const SERVICE: u8 = 0x03;
    pub const GET_SIGNAL_STRENGTH: u16 = 0x0020;
    pub const SERVING_SYSTEM_IND: u16 = 0x0024;
    pub const GET_SYSTEM_SELECTION_PREFERENCE: u16 = 0x0034;
    pub const TLV_MODE_PREFERENCE: u8 = 0x11;
}

// ── TLV decoding ────────────────────────────────────────────────────

fn reply_of(p: Payload) -> Result<MessageReply, ClassifyError> {
    match p {
        Payload::Message(reply) => Ok(reply),
        other => Err(ClassifyError::Unexpected(format!("expected a message reply, got {other:?}"))),
    }
}

fn tlv(reply: &MessageReply, kind: u8) -> Result<Bytes, ClassifyError> {
    reply
        .tlv(kind)
        .cloned()
        .ok_or_else(|| ClassifyError::Parse(format!("missing TLV 0x{kind:02x} in 0x{:04x}", reply.id)))
}

fn short(kind: u8) -> ClassifyError {
    ClassifyError::Parse(format!("TLV 0x{kind:02x} too short"))
}

/// TLV 0x01 as a string.
pub fn text_tlv(p: Payload) -> Result<Payload, ClassifyError> {
    let reply = reply_of(p)?;
    let raw = tlv(&reply, 0x01)?;
    Ok(Payload::Value(Value::Text(String::from_utf8_lossy(&raw).trim().to_string())))
}

/// Signal strength TLV: `i8` dBm followed by the radio interface.
pub fn signal_tlv(p: Payload) -> Result<Payload, ClassifyError> {
    let reply = reply_of(p)?;
    let mut raw = tlv(&reply, 0x01)?;
    if raw.remaining() < 1 {
        return Err(short(0x01));
    }
    let dbm = raw.get_i8();
    Ok(Payload::Value(Value::Signal {
        rssi_dbm: Some(i32::from(dbm)),
        ber: None,
    }))
}

pub fn mode_pref_tlv(p: Payload) -> Result<Payload, ClassifyError> {
    let reply = reply_of(p)?;
    let mut raw = tlv(&reply, nas::TLV_MODE_PREFERENCE)?;
    if raw.remaining() < 2 {
        return Err(short(nas::TLV_MODE_PREFERENCE));
    }
    Ok(Payload::Value(Value::Modes(tables::nas_mode_pref(raw.get_u16_le()))))
}

fn handle_of(p: &Payload) -> Result<u32, OpError> {
    let Payload::Message(reply) = p else {
        return Err(OpError::Unexpected("start-network without a message reply".into()));
    };
    let mut raw = tlv(reply, wds::TLV_HANDLE).map_err(|e| OpError::Parse(e.to_string()))?;
    if raw.remaining() < 4 {
        return Err(OpError::Parse(short(wds::TLV_HANDLE).to_string()));
    }
    Ok(raw.get_u32_le())
}

fn status_of(p: &Payload) -> Result<u8, OpError> {
    let Payload::Message(reply) = p else {
        return Err(OpError::Unexpected("status without a message reply".into()));
    };
    let mut raw = tlv(reply, wds::TLV_STATUS).map_err(|e| OpError::Parse(e.to_string()))?;
    if raw.remaining() < 1 {
        return Err(OpError::Parse(short(wds::TLV_STATUS).to_string()));
    }
    Ok(raw.get_u8())
}

fn start_network(params: &ConnectParams) -> Message {
    let mut msg = Message::new(wds::SERVICE, wds::START_NETWORK);
    if !params.apn.is_empty() {
        msg = msg.with_tlv(wds::TLV_APN, params.apn.clone());
    }
    if params.needs_auth() {
        msg = msg.with_tlv(wds::TLV_AUTH_PREF, vec![params.auth.code()]);
    }
    if let Some(user) = &params.user {
        msg = msg.with_tlv(wds::TLV_USERNAME, user.clone());
    }
    if let Some(password) = &params.password {
        msg = msg.with_tlv(wds::TLV_PASSWORD, password.clone());
    }
    msg
}

fn stop_network(handle: u32) -> CommandStep {
    CommandStep::message(
        "stop-network",
        Message::new(wds::SERVICE, wds::STOP_NETWORK).with_tlv(wds::TLV_HANDLE, handle.to_le_bytes().to_vec()),
    )
}

fn status_query() -> CommandStep {
    CommandStep::message("verify", Message::new(wds::SERVICE, wds::PACKET_SERVICE_STATUS)).retry_once()
}

// ── Connect ─────────────────────────────────────────────────────────

pub struct WdsConnect {
    config: Arc<TetherConfig>,
    params: ConnectParams,
    handle: Option<u32>,
    verify: Retry,
}

impl WdsConnect {
    pub fn new(config: Arc<TetherConfig>, params: ConnectParams) -> Self {
        let c = &config.connect;
        Self {
            verify: Retry::new(c.verify_attempts, c.verify_interval),
            params,
            handle: None,
            config,
        }
    }

    fn verify(&mut self) -> Action {
        self.verify.begin();
        Action::Send(status_query())
    }
}

impl Procedure for WdsConnect {
    fn name(&self) -> &'static str {
        "wds-connect"
    }

    fn advance(&mut self, ctx: &mut StepContext, input: Input) -> Action {
        match input {
            Input::Start => Action::Send(
                CommandStep::message("start-network", start_network(&self.params))
                    .timeout(self.config.channel.long_timeout),
            ),
            Input::Reply(Err(e)) => Action::Fail(e.into()),
            Input::Reply(Ok(payload)) => match self.handle {
                None => match handle_of(&payload) {
                    Ok(handle) => {
                        debug!(handle, "network started");
                        self.handle = Some(handle);
                        self.verify()
                    }
                    Err(e) => Action::Fail(e),
                },
                Some(handle) => match status_of(&payload) {
                    Ok(wds::STATUS_CONNECTED) => {
                        ctx.update(Field::Bearer(Some(handle)));
                        Action::Complete(Value::Bearer(BearerInfo {
                            cid: handle,
                            interface: ctx.data_interface().map(str::to_string),
                        }))
                    }
                    Ok(status) => match self.verify.again() {
                        Some(delay) => {
                            debug!(status, "packet service not up yet");
                            Action::Sleep(delay)
                        }
                        None => Action::Fail(OpError::RetriesExhausted {
                            step: "verify",
                            attempts: self.verify.attempts(),
                        }),
                    },
                    Err(e) => Action::Fail(e),
                },
            },
            Input::Woke => self.verify(),
            other => unexpected(other),
        }
    }

    fn cleanup(&mut self, _ctx: &mut StepContext, outcome: &Result<Value, OpError>) -> Option<CommandStep> {
        match (outcome, self.handle) {
            (Err(_), Some(handle)) => Some(stop_network(handle)),
            _ => None,
        }
    }
}

// ── Disconnect ──────────────────────────────────────────────────────

pub struct WdsDisconnect {
    verify: Retry,
    stopped: bool,
}

impl WdsDisconnect {
    pub fn new(config: &TetherConfig) -> Self {
        let d = &config.disconnect;
        Self {
            verify: Retry::new(d.verify_attempts, d.verify_interval),
            stopped: false,
        }
    }

    fn verify(&mut self) -> Action {
        self.verify.begin();
        Action::Send(status_query())
    }

    fn done(ctx: &mut StepContext) -> Action {
        ctx.update(Field::Bearer(None));
        Action::Complete(Value::Unit)
    }
}

impl Procedure for WdsDisconnect {
    fn name(&self) -> &'static str {
        "wds-disconnect"
    }

    fn advance(&mut self, ctx: &mut StepContext, input: Input) -> Action {
        match input {
            Input::Start => match ctx.snapshot().bearer {
                Some(handle) => Action::Send(stop_network(handle)),
                None => {
                    debug!("no packet data handle, already disconnected");
                    Action::Complete(Value::Unit)
                }
            },
            Input::Reply(Ok(_)) if !self.stopped => {
                self.stopped = true;
                self.verify()
            }
            Input::Reply(Err(e)) if !self.stopped => Action::Fail(e.into()),
            Input::Reply(Err(e)) => match e.transport() {
                Some(t) => {
                    warn!(error = %t, "status query failed after stop, assuming disconnected");
                    Self::done(ctx)
                }
                None => Action::Fail(e.into()),
            },
            Input::Reply(Ok(payload)) => match status_of(&payload) {
                Ok(wds::STATUS_CONNECTED) => match self.verify.again() {
                    Some(delay) => Action::Sleep(delay),
                    None => Action::Fail(OpError::RetriesExhausted {
                        step: "verify",
                        attempts: self.verify.attempts(),
                    }),
                },
                Ok(_) => Self::done(ctx),
                Err(e) => Action::Fail(e),
            },
            Input::Woke => self.verify(),
            other => unexpected(other),
        }
    }
}

// ── Indications ─────────────────────────────────────────────────────

/// NAS registration state byte.
fn registration(state: u8) -> Registration {
    match state {
        0 => Registration::Idle,
        1 => Registration::Home,
        2 => Registration::Searching,
        3 => Registration::Denied,
        _ => Registration::Unknown,
    }
}

/// NAS radio interface byte.
fn radio_interface(radio: u8) -> AccessTech {
    match radio {
        0x04 => AccessTech::Gsm,
        0x05 | 0x09 => AccessTech::Umts,
        0x08 => AccessTech::Lte,
        0x0C => AccessTech::Nr,
        _ => AccessTech::Unknown,
    }
}

fn indication_tlv(event: &Event, kind: u8) -> Option<Bytes> {
    match event {
        Event::Indication(msg) => msg.tlv(kind).cloned(),
        _ => None,
    }
}

// ── Plugin ──────────────────────────────────────────────────────────

pub struct Qmi {
    config: Arc<TetherConfig>,
}

impl Qmi {
    pub fn new(config: Arc<TetherConfig>) -> Self {
        Self { config }
    }
}

impl Plugin for Qmi {
    fn name(&self) -> &'static str {
        "qmi"
    }

    fn supports(&self, device: &DeviceIdentity) -> bool {
        device.message_channel
    }

    fn procedure(&self, op: &Operation) -> Result<Box<dyn Procedure>, OpError> {
        let identity = |name: &'static str, id: u16| -> Box<dyn Procedure> {
            Box::new(Query::new(
                name,
                CommandStep::message(name, Message::new(dms::SERVICE, id))
                    .parse(text_tlv)
                    .retry_once(),
            ))
        };
        match op {
            Operation::LoadManufacturer => Ok(identity("manufacturer", dms::GET_MANUFACTURER)),
            Operation::LoadModel => Ok(identity("model", dms::GET_MODEL)),
            Operation::LoadRevision => Ok(identity("revision", dms::GET_REVISION)),
            Operation::LoadSignal => Ok(Box::new(Query::new(
                "signal",
                CommandStep::message("signal", Message::new(nas::SERVICE, nas::GET_SIGNAL_STRENGTH))
                    .parse(signal_tlv)
                    .retry_once(),
            ))),
            Operation::LoadCurrentModes => Ok(Box::new(Query::new(
                "current-modes",
                CommandStep::message(
                    "current-modes",
                    Message::new(nas::SERVICE, nas::GET_SYSTEM_SELECTION_PREFERENCE),
                )
                .parse(mode_pref_tlv)
                .retry_once(),
            ))),
            Operation::Connect(params) => Ok(Box::new(WdsConnect::new(self.config.clone(), params.clone()))),
            Operation::Disconnect => Ok(Box::new(WdsDisconnect::new(&self.config))),
            Operation::LocationStart | Operation::LocationStop => Err(OpError::Unsupported(op.name().into())),
        }
    }

    fn interests(&self) -> Vec<(Pattern, Handler)> {
        let packet_status: Handler = Box::new(|event, _| {
            match indication_tlv(event, wds::TLV_STATUS).and_then(|b| b.first().copied()) {
                Some(wds::STATUS_DISCONNECTED) => vec![Field::Bearer(None)],
                _ => Vec::new(),
            }
        });
        let serving_system: Handler = Box::new(|event, _| {
            let Some(raw) = indication_tlv(event, 0x01) else {
                return Vec::new();
            };
            let mut fields = Vec::new();
            if let Some(&state) = raw.first() {
                fields.push(Field::Registration(registration(state)));
            }
            // state, cs attach, ps attach, network, count, interfaces...
            if let (Some(&count), Some(&radio)) = (raw.get(4), raw.get(5)) {
                if count > 0 {
                    fields.push(Field::AccessTech(radio_interface(radio)));
                }
            }
            fields
        });
        vec![
            (
                Pattern::Indication {
                    service: wds::SERVICE,
                    id: wds::PACKET_SERVICE_STATUS,
                },
                packet_status,
            ),
            (
                Pattern::Indication {
                    service: nas::SERVICE,
                    id: nas::SERVING_SYSTEM_IND,
                },
                serving_system,
            ),
        ]
    }
}
