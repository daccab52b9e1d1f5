//! Error taxonomy for the orchestration engine.
//!
//! Errors are layered the same way the engine is:
//!
//! - [`TransportError`]: the channel failed to deliver a reply.
//! - [`ProtocolError`]: the device answered with a structured error code.
//! - [`ClassifyError`]: the reply did not satisfy the step's expectation.
//! - [`StepError`]: what a single command step surfaces to a sequence.
//! - [`OpError`]: what an operation request completes with.
//!
//! Only the sequence layer decides whether an error is recoverable, so every
//! layer keeps its variants typed instead of collapsing them into strings.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Transport ───────────────────────────────────────────────────────

/// Channel-level failure: no correlated reply was delivered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("device removed")]
    DeviceRemoved,
    #[error("write failed: {0}")]
    WriteFailure(String),
}

/// Coarse class of a transport failure, used by the retry allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Timeout,
    DeviceRemoved,
    WriteFailure,
}

impl TransportError {
    pub fn class(&self) -> FailureClass {
        match self {
            TransportError::Timeout(_) => FailureClass::Timeout,
            TransportError::DeviceRemoved => FailureClass::DeviceRemoved,
            TransportError::WriteFailure(_) => FailureClass::WriteFailure,
        }
    }

    /// Device removal and write failures end the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::Timeout(_))
    }
}

// ── Protocol ────────────────────────────────────────────────────────

/// Which error-reporting family a numeric device code came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorFamily {
    /// `+CME ERROR: <n>` (3GPP TS 27.007).
    Cme,
    /// `+CMS ERROR: <n>` (3GPP TS 27.005).
    Cms,
    /// Message-channel protocol error code (QMI/MBIM style).
    Message,
}

impl fmt::Display for ErrorFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorFamily::Cme => write!(f, "CME"),
            ErrorFamily::Cms => write!(f, "CMS"),
            ErrorFamily::Message => write!(f, "message"),
        }
    }
}

/// A device-reported error mapped to a domain meaning.
///
/// Unknown codes survive as [`ProtocolError::Code`] so they can still be
/// logged and matched on by vendor procedures.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolError {
    #[error("device reported ERROR")]
    Generic,
    #[error("operation not allowed")]
    NotAllowed,
    #[error("operation not supported")]
    NotSupported,
    #[error("SIM not inserted")]
    SimNotInserted,
    #[error("SIM PIN required")]
    SimPinRequired,
    #[error("device busy")]
    Busy,
    #[error("network not ready")]
    NetworkNotReady,
    #[error("service option not supported")]
    ServiceOptionNotSupported,
    #[error("service option not subscribed")]
    ServiceOptionNotSubscribed,
    #[error("service option temporarily out of order")]
    ServiceOptionOutOfOrder,
    #[error("PDP authentication failed")]
    AuthenticationFailed,
    #[error("missing or unknown APN")]
    UnknownApn,
    #[error("no carrier")]
    NoCarrier,
    #[error("call failed")]
    CallFailed,
    #[error("request had no effect")]
    NoEffect,
    #[error("invalid handle")]
    InvalidHandle,
    #[error("{family} error {code}")]
    Code { family: ErrorFamily, code: u16 },
}

// ── Classifier ──────────────────────────────────────────────────────

/// A reply arrived but did not satisfy the step's expectation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassifyError {
    #[error("device error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("unexpected response: {0}")]
    Unexpected(String),
}

// ── Step ────────────────────────────────────────────────────────────

/// Outcome of a failed command step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Classify(#[from] ClassifyError),
}

impl StepError {
    /// The device answered with an error code. Only these are eligible for
    /// the "ignore and continue" policy of multi-variant probes.
    pub fn protocol(&self) -> Option<&ProtocolError> {
        match self {
            StepError::Classify(ClassifyError::Protocol(p)) => Some(p),
            _ => None,
        }
    }

    /// The device answered at all (error code, unparseable or unexpected).
    pub fn is_device_answer(&self) -> bool {
        matches!(self, StepError::Classify(_))
    }

    pub fn transport(&self) -> Option<&TransportError> {
        match self {
            StepError::Transport(t) => Some(t),
            _ => None,
        }
    }
}

// ── Operation ───────────────────────────────────────────────────────

/// Flat error kind reported to consumers of the operation API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    DeviceRemoved,
    WriteFailure,
    Protocol,
    Parse,
    UnexpectedResponse,
    RetriesExhausted,
    InvariantViolated,
    Unsupported,
    Cancelled,
    SessionClosed,
}

/// Terminal error of an operation request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpError {
    #[error("transport: {0}")]
    Transport(TransportError),
    #[error("device error: {0}")]
    Protocol(ProtocolError),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("unexpected response: {0}")]
    Unexpected(String),
    #[error("{step} gave up after {attempts} attempts")]
    RetriesExhausted { step: &'static str, attempts: u32 },
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error("{0} is not supported by this device")]
    Unsupported(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("session closed")]
    SessionClosed,
}

impl OpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OpError::Transport(t) => match t.class() {
                FailureClass::Timeout => ErrorKind::Timeout,
                FailureClass::DeviceRemoved => ErrorKind::DeviceRemoved,
                FailureClass::WriteFailure => ErrorKind::WriteFailure,
            },
            OpError::Protocol(_) => ErrorKind::Protocol,
            OpError::Parse(_) => ErrorKind::Parse,
            OpError::Unexpected(_) => ErrorKind::UnexpectedResponse,
            OpError::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            OpError::Invariant(_) => ErrorKind::InvariantViolated,
            OpError::Unsupported(_) => ErrorKind::Unsupported,
            OpError::Cancelled => ErrorKind::Cancelled,
            OpError::SessionClosed => ErrorKind::SessionClosed,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, OpError::Cancelled)
    }

    /// The session cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            OpError::Transport(t) => t.is_fatal(),
            OpError::SessionClosed => true,
            _ => false,
        }
    }
}

impl From<StepError> for OpError {
    fn from(e: StepError) -> Self {
        match e {
            StepError::Transport(t) => OpError::Transport(t),
            StepError::Classify(ClassifyError::Protocol(p)) => OpError::Protocol(p),
            StepError::Classify(ClassifyError::Parse(s)) => OpError::Parse(s),
            StepError::Classify(ClassifyError::Unexpected(s)) => OpError::Unexpected(s),
        }
    }
}

impl From<TransportError> for OpError {
    fn from(e: TransportError) -> Self {
        OpError::Transport(e)
    }
}

// ── Config ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("unsupported config version {0}")]
    Version(u32),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
