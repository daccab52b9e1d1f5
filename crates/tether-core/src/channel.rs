//! # Transport Channels
//!
//! A [`Channel`] is one communication path to the device: a serial AT port
//! or a message-bus client speaking QMI/MBIM-style request/response
//! messages. Every [`Channel::send`] resolves to exactly one correlated
//! [`Reply`] or one [`TransportError`].
//!
//! Anything the device emits that is not a direct reply is delivered on the
//! channel's unsolicited stream as an [`Event`], consumed by the session's
//! correlator.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TransportError;
use crate::urc::Urc;

// ─── Requests ───────────────────────────────────────────────────────────────

/// Wire-level request payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// An AT command line without the trailing `\r`, e.g. `AT+CGMM`.
    At(String),
    /// A binary request message.
    Message(Message),
}

impl Request {
    pub fn at(cmd: impl Into<String>) -> Self {
        Request::At(cmd.into())
    }

    /// AT command text, if this is an AT request.
    pub fn as_at(&self) -> Option<&str> {
        match self {
            Request::At(s) => Some(s),
            Request::Message(_) => None,
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::At(cmd) => f.write_str(cmd),
            Request::Message(m) => write!(f, "svc 0x{:02x} msg 0x{:04x}", m.service, m.id),
        }
    }
}

/// One type-length-value field of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub kind: u8,
    pub value: Bytes,
}

/// A QMI/MBIM-style message: service, message id and TLVs.
///
/// Used for requests and for unsolicited indications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub service: u8,
    pub id: u16,
    pub tlvs: Vec<Tlv>,
}

impl Message {
    pub fn new(service: u8, id: u16) -> Self {
        Self {
            service,
            id,
            tlvs: Vec::new(),
        }
    }

    pub fn with_tlv(mut self, kind: u8, value: impl Into<Bytes>) -> Self {
        self.tlvs.push(Tlv {
            kind,
            value: value.into(),
        });
        self
    }

    pub fn tlv(&self, kind: u8) -> Option<&Bytes> {
        find_tlv(&self.tlvs, kind)
    }
}

fn find_tlv(tlvs: &[Tlv], kind: u8) -> Option<&Bytes> {
    tlvs.iter().find(|t| t.kind == kind).map(|t| &t.value)
}

// ─── Replies ────────────────────────────────────────────────────────────────

/// Final result code terminating an AT response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalResult {
    Ok,
    Error,
    CmeError(u16),
    CmsError(u16),
    NoCarrier,
    Busy,
    NoAnswer,
    NoDialtone,
    /// `CONNECT` with optional rate text.
    Connect(Option<String>),
}

impl FinalResult {
    /// Parse a final result code line, `None` for anything else.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        match line {
            "OK" => return Some(FinalResult::Ok),
            "ERROR" => return Some(FinalResult::Error),
            "NO CARRIER" => return Some(FinalResult::NoCarrier),
            "BUSY" => return Some(FinalResult::Busy),
            "NO ANSWER" => return Some(FinalResult::NoAnswer),
            "NO DIALTONE" | "NO DIAL TONE" => return Some(FinalResult::NoDialtone),
            "CONNECT" => return Some(FinalResult::Connect(None)),
            _ => {}
        }
        if let Some(rest) = line.strip_prefix("CONNECT ") {
            return Some(FinalResult::Connect(Some(rest.trim().to_string())));
        }
        // Numeric codes only; verbose CME text falls back to a generic error.
        if let Some(rest) = line.strip_prefix("+CME ERROR:") {
            return Some(
                rest.trim()
                    .parse()
                    .map(FinalResult::CmeError)
                    .unwrap_or(FinalResult::Error),
            );
        }
        if let Some(rest) = line.strip_prefix("+CMS ERROR:") {
            return Some(
                rest.trim()
                    .parse()
                    .map(FinalResult::CmsError)
                    .unwrap_or(FinalResult::Error),
            );
        }
        None
    }

    pub fn is_success(&self) -> bool {
        matches!(self, FinalResult::Ok | FinalResult::Connect(_))
    }
}

/// Complete AT response: information lines plus the final result code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtReply {
    pub lines: Vec<String>,
    pub result: FinalResult,
}

impl AtReply {
    pub fn ok() -> Self {
        Self {
            lines: Vec::new(),
            result: FinalResult::Ok,
        }
    }

    pub fn ok_with<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            result: FinalResult::Ok,
        }
    }

    pub fn failed(result: FinalResult) -> Self {
        Self {
            lines: Vec::new(),
            result,
        }
    }
}

/// Response message: result/error code pair plus TLVs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageReply {
    pub service: u8,
    pub id: u16,
    /// 0 on success.
    pub result: u16,
    /// Protocol error code when `result != 0`.
    pub error: u16,
    pub tlvs: Vec<Tlv>,
}

impl MessageReply {
    pub fn success(service: u8, id: u16) -> Self {
        Self {
            service,
            id,
            result: 0,
            error: 0,
            tlvs: Vec::new(),
        }
    }

    pub fn failure(service: u8, id: u16, error: u16) -> Self {
        Self {
            service,
            id,
            result: 1,
            error,
            tlvs: Vec::new(),
        }
    }

    pub fn with_tlv(mut self, kind: u8, value: impl Into<Bytes>) -> Self {
        self.tlvs.push(Tlv {
            kind,
            value: value.into(),
        });
        self
    }

    pub fn tlv(&self, kind: u8) -> Option<&Bytes> {
        find_tlv(&self.tlvs, kind)
    }
}

/// The single correlated reply to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    At(AtReply),
    Message(MessageReply),
}

// ─── Unsolicited ────────────────────────────────────────────────────────────

/// Asynchronous input not correlated to an outstanding request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A text line recognised by the URC table.
    Urc(Urc),
    /// A text line no rule recognised. The correlator drops these.
    Line(String),
    /// A message-bus indication.
    Indication(Message),
}

// ─── Channel ────────────────────────────────────────────────────────────────

/// Role a channel was tagged with by port classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    Primary,
    Secondary,
}

/// One request/response path to the device.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Send one request and wait for its correlated reply.
    ///
    /// `timeout` bounds the wait once the request is on the wire. Exactly
    /// one reply or error is delivered per call.
    async fn send(&self, request: Request, timeout: Duration) -> Result<Reply, TransportError>;
}

/// The set of channels a device session owns, tagged by role.
#[derive(Clone)]
pub struct Ports {
    primary: Arc<dyn Channel>,
    secondary: Option<Arc<dyn Channel>>,
    /// Network interface carrying packet data, if any.
    pub data_interface: Option<String>,
}

impl Ports {
    pub fn new(primary: Arc<dyn Channel>) -> Self {
        Self {
            primary,
            secondary: None,
            data_interface: None,
        }
    }

    pub fn with_secondary(mut self, secondary: Arc<dyn Channel>) -> Self {
        self.secondary = Some(secondary);
        self
    }

    pub fn with_data_interface(mut self, name: impl Into<String>) -> Self {
        self.data_interface = Some(name.into());
        self
    }

    /// Channel for `role`, falling back to the primary port.
    pub fn get(&self, role: ChannelRole) -> &dyn Channel {
        match role {
            ChannelRole::Secondary => self.secondary.as_deref().unwrap_or(&*self.primary),
            ChannelRole::Primary => &*self.primary,
        }
    }
}
