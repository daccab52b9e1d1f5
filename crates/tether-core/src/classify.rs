//! # Response Classifier
//!
//! Turns a raw [`Reply`] plus the step's declared [`Expect`]ation into a
//! [`Payload`] or a typed [`ClassifyError`].
//!
//! Device-side errors (`ERROR`, `+CME ERROR: <n>`, message error codes) are
//! mapped through the injected [`ErrorTable`] into [`ProtocolError`]s and
//! stay distinct from transport failures, which never reach this module.

use std::sync::Arc;

use regex::Regex;

use crate::channel::{AtReply, FinalResult, MessageReply, Reply};
use crate::error::{ClassifyError, ErrorFamily, ProtocolError};
use crate::op::Value;
use crate::tables::ErrorTable;

/// Successful, classified reply content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Plain success, content ignored.
    None,
    /// A single extracted value.
    Text(String),
    /// All information lines.
    Lines(Vec<String>),
    /// One of several declared response shapes matched.
    Matched {
        label: &'static str,
        captures: Vec<String>,
    },
    /// A message reply with its TLVs.
    Message(MessageReply),
    /// Output of a step's parser.
    Value(Value),
}

impl Payload {
    pub fn text(&self) -> Option<&str> {
        match self {
            Payload::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Payload::Value(v) => Some(v),
            Payload::Text(s) => Some(Value::Text(s)),
            Payload::None => Some(Value::Unit),
            _ => None,
        }
    }
}

/// Optional typed transform applied to a successful payload.
pub type Parser = fn(Payload) -> Result<Payload, ClassifyError>;

/// One candidate response shape of a multi-variant command.
#[derive(Debug, Clone)]
pub struct Shape {
    pub label: &'static str,
    pub pattern: Regex,
}

impl Shape {
    pub fn new(label: &'static str, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            label,
            pattern: Regex::new(pattern)?,
        })
    }
}

/// Expected response shape of a command step.
#[derive(Debug, Clone)]
pub enum Expect {
    /// `OK` (or `CONNECT`); information lines ignored.
    Ok,
    /// The value following `tag` on the first line that starts with it,
    /// e.g. `+CGMM:`. Surrounding quotes are removed.
    Prefixed(&'static str),
    /// The first non-empty information line, verbatim.
    Text,
    /// All information lines.
    Lines,
    /// First shape (in order) matching any information line.
    OneOf(Arc<[Shape]>),
    /// A successful message reply.
    Message,
}

/// Classify a reply against an expectation.
pub fn classify(reply: Reply, expect: &Expect, errors: &ErrorTable) -> Result<Payload, ClassifyError> {
    match reply {
        Reply::At(at) => classify_at(at, expect, errors),
        Reply::Message(msg) => classify_message(msg, expect, errors),
    }
}

fn classify_at(reply: AtReply, expect: &Expect, errors: &ErrorTable) -> Result<Payload, ClassifyError> {
    check_final(&reply.result, errors)?;

    let lines: Vec<String> = reply
        .lines
        .into_iter()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();

    match expect {
        Expect::Ok => Ok(Payload::None),
        Expect::Prefixed(tag) => lines
            .iter()
            .find_map(|l| l.strip_prefix(*tag))
            .map(|rest| Payload::Text(unquote(rest.trim()).to_string()))
            .ok_or_else(|| ClassifyError::Parse(format!("no {tag} line in response"))),
        Expect::Text => lines
            .into_iter()
            .next()
            .map(Payload::Text)
            .ok_or_else(|| ClassifyError::Parse("empty response".into())),
        Expect::Lines => Ok(Payload::Lines(lines)),
        Expect::OneOf(shapes) => {
            for shape in shapes.iter() {
                for line in &lines {
                    if let Some(caps) = shape.pattern.captures(line) {
                        let captures = caps
                            .iter()
                            .skip(1)
                            .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                            .collect();
                        return Ok(Payload::Matched {
                            label: shape.label,
                            captures,
                        });
                    }
                }
            }
            Err(ClassifyError::Unexpected(lines.join(" | ")))
        }
        Expect::Message => Err(ClassifyError::Unexpected(
            "text response to a message request".into(),
        )),
    }
}

fn check_final(result: &FinalResult, errors: &ErrorTable) -> Result<(), ClassifyError> {
    let err = match result {
        FinalResult::Ok | FinalResult::Connect(_) => return Ok(()),
        FinalResult::Error => ProtocolError::Generic,
        FinalResult::CmeError(code) => errors.lookup(ErrorFamily::Cme, *code),
        FinalResult::CmsError(code) => errors.lookup(ErrorFamily::Cms, *code),
        FinalResult::NoCarrier | FinalResult::NoAnswer | FinalResult::NoDialtone => {
            ProtocolError::NoCarrier
        }
        FinalResult::Busy => ProtocolError::Busy,
    };
    Err(ClassifyError::Protocol(err))
}

fn classify_message(
    reply: MessageReply,
    expect: &Expect,
    errors: &ErrorTable,
) -> Result<Payload, ClassifyError> {
    if reply.result != 0 {
        return Err(ClassifyError::Protocol(
            errors.lookup(ErrorFamily::Message, reply.error),
        ));
    }
    match expect {
        Expect::Message => Ok(Payload::Message(reply)),
        Expect::Ok => Ok(Payload::None),
        _ => Err(ClassifyError::Unexpected(format!(
            "message reply 0x{:04x} to a text expectation",
            reply.id
        ))),
    }
}

/// Strip one pair of surrounding double quotes.
pub fn unquote(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
}

/// Split a comma-separated AT value list, trimming whitespace and quotes.
pub fn split_fields(s: &str) -> Vec<&str> {
    s.split(',').map(|f| unquote(f.trim())).collect()
}
