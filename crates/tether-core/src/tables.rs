//! Read-only lookup data injected into the classifier.
//!
//! Tables are built once per session (or shared between sessions behind an
//! `Arc`) and never mutated afterwards.

use std::collections::HashMap;

use crate::error::{ErrorFamily, ProtocolError};

/// Maps numeric device error codes to domain errors.
#[derive(Debug, Clone)]
pub struct ErrorTable {
    codes: HashMap<(ErrorFamily, u16), ProtocolError>,
}

/// 3GPP TS 27.007 §9.2 mobile termination error codes.
const CME_CODES: &[(u16, ProtocolError)] = &[
    (3, ProtocolError::NotAllowed),
    (4, ProtocolError::NotSupported),
    (10, ProtocolError::SimNotInserted),
    (11, ProtocolError::SimPinRequired),
    (14, ProtocolError::Busy),
    (30, ProtocolError::NetworkNotReady),
    (31, ProtocolError::NetworkNotReady),
    (132, ProtocolError::ServiceOptionNotSupported),
    (133, ProtocolError::ServiceOptionNotSubscribed),
    (134, ProtocolError::ServiceOptionOutOfOrder),
    (149, ProtocolError::AuthenticationFailed),
    (533, ProtocolError::UnknownApn),
];

/// Message-channel protocol errors (QMI numbering).
const MESSAGE_CODES: &[(u16, ProtocolError)] = &[
    (0x000E, ProtocolError::CallFailed),
    (0x0014, ProtocolError::NetworkNotReady),
    (0x001A, ProtocolError::NoEffect),
    (0x0021, ProtocolError::InvalidHandle),
    (0x0034, ProtocolError::Busy),
    (0x005E, ProtocolError::NotSupported),
];

impl ErrorTable {
    pub fn empty() -> Self {
        Self {
            codes: HashMap::new(),
        }
    }

    /// Standard 3GPP CME codes and common message-protocol codes.
    pub fn standard() -> Self {
        let mut table = Self::empty();
        for (code, err) in CME_CODES {
            table.codes.insert((ErrorFamily::Cme, *code), err.clone());
        }
        for (code, err) in MESSAGE_CODES {
            table.codes.insert((ErrorFamily::Message, *code), err.clone());
        }
        table
    }

    /// Add or override a mapping (vendor extensions).
    pub fn with(mut self, family: ErrorFamily, code: u16, err: ProtocolError) -> Self {
        self.codes.insert((family, code), err);
        self
    }

    /// Map a code; unknown codes keep their number.
    pub fn lookup(&self, family: ErrorFamily, code: u16) -> ProtocolError {
        self.codes
            .get(&(family, code))
            .cloned()
            .unwrap_or(ProtocolError::Code { family, code })
    }
}

impl Default for ErrorTable {
    fn default() -> Self {
        Self::standard()
    }
}
