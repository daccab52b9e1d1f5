//! Single-value load procedures and their reply parsers.

use tether_core::classify::{Payload, split_fields, unquote};
use tether_core::error::{ClassifyError, OpError};
use tether_core::op::Value;
use tether_core::probe::{Feature, Support};
use tether_core::sequence::{Action, Input, Procedure, StepContext};
use tether_core::state::{Field, csq_to_dbm};
use tether_core::step::CommandStep;

use crate::tables;

/// One command, one value.
pub struct Query {
    name: &'static str,
    step: Option<CommandStep>,
}

impl Query {
    pub fn new(name: &'static str, step: CommandStep) -> Self {
        Self {
            name,
            step: Some(step),
        }
    }
}

impl Procedure for Query {
    fn name(&self) -> &'static str {
        self.name
    }

    fn advance(&mut self, ctx: &mut StepContext, input: Input) -> Action {
        match input {
            Input::Start => match self.step.take() {
                Some(step) => Action::Send(step),
                None => Action::Fail(OpError::Invariant("query restarted".into())),
            },
            Input::Reply(Ok(payload)) => complete(ctx, payload),
            Input::Reply(Err(e)) => Action::Fail(e.into()),
            other => unexpected(other),
        }
    }
}

/// Try a command behind a feature probe; when the device does not support
/// it, use the fallback command instead. The primary is sent at most once
/// per session after it was found unsupported.
pub struct ProbeFallback {
    name: &'static str,
    feature: Feature,
    primary: Option<CommandStep>,
    fallback: Option<CommandStep>,
}

impl ProbeFallback {
    pub fn new(name: &'static str, feature: Feature, primary: CommandStep, fallback: CommandStep) -> Self {
        Self {
            name,
            feature,
            primary: Some(primary),
            fallback: Some(fallback),
        }
    }
}

impl Procedure for ProbeFallback {
    fn name(&self) -> &'static str {
        self.name
    }

    fn advance(&mut self, ctx: &mut StepContext, input: Input) -> Action {
        match input {
            Input::Start => match self.primary.take() {
                Some(step) => Action::Probe {
                    feature: self.feature,
                    step,
                },
                None => Action::Fail(OpError::Invariant("probe restarted".into())),
            },
            Input::Probed {
                reply: Some(Ok(payload)),
                ..
            } => complete(ctx, payload),
            Input::Probed {
                support: Support::Unsupported,
                ..
            } => match self.fallback.take() {
                Some(step) => Action::Send(step),
                None => Action::Fail(OpError::Unsupported(self.feature.to_string())),
            },
            // Supported earlier but failing now, or a transport error.
            Input::Probed { reply: Some(Err(e)), .. } => Action::Fail(e.into()),
            Input::Reply(Ok(payload)) => complete(ctx, payload),
            Input::Reply(Err(e)) => Action::Fail(e.into()),
            other => unexpected(other),
        }
    }
}

fn complete(ctx: &mut StepContext, payload: Payload) -> Action {
    match payload.into_value() {
        Some(value) => {
            if let Value::Signal { rssi_dbm, .. } = &value {
                ctx.update(Field::Signal(*rssi_dbm));
            }
            Action::Complete(value)
        }
        None => Action::Fail(OpError::Invariant("reply produced no value".into())),
    }
}

pub(crate) fn unexpected(input: Input) -> Action {
    Action::Fail(OpError::Invariant(format!("unexpected input {input:?}")))
}

// ── Parsers ─────────────────────────────────────────────────────────

/// An identification line, with or without its `+CGMI:`-style tag.
pub fn info_text(p: Payload) -> Result<Payload, ClassifyError> {
    let text = p
        .text()
        .ok_or_else(|| ClassifyError::Parse("no information line".into()))?;
    let value = match text.split_once(':') {
        Some((tag, rest)) if tag.starts_with('+') || tag.starts_with('^') => rest,
        _ => text,
    };
    let value = unquote(value.trim());
    if value.is_empty() {
        return Err(ClassifyError::Parse("empty identification".into()));
    }
    Ok(Payload::Value(Value::Text(value.to_string())))
}

/// `+CSQ: <rssi>,<ber>`.
pub fn csq(p: Payload) -> Result<Payload, ClassifyError> {
    let text = p
        .text()
        .ok_or_else(|| ClassifyError::Parse("no +CSQ line".into()))?;
    let fields = split_fields(text);
    let [rssi, ber] = fields.as_slice() else {
        return Err(ClassifyError::Parse(format!("bad +CSQ value {text:?}")));
    };
    let rssi: u32 = rssi
        .parse()
        .map_err(|_| ClassifyError::Parse(format!("bad rssi {rssi:?}")))?;
    let ber: u32 = ber
        .parse()
        .map_err(|_| ClassifyError::Parse(format!("bad ber {ber:?}")))?;
    Ok(Payload::Value(Value::Signal {
        rssi_dbm: csq_to_dbm(rssi),
        ber: (ber <= 7).then_some(ber as u8),
    }))
}

/// `+WS46: <n>`.
pub fn ws46(p: Payload) -> Result<Payload, ClassifyError> {
    let text = p
        .text()
        .ok_or_else(|| ClassifyError::Parse("no +WS46 line".into()))?;
    let n: u32 = text
        .trim()
        .parse()
        .map_err(|_| ClassifyError::Parse(format!("bad +WS46 value {text:?}")))?;
    tables::ws46_modes(n)
        .map(|m| Payload::Value(Value::Modes(m)))
        .ok_or_else(|| ClassifyError::Unexpected(format!("unknown +WS46 mode {n}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::op::Mode;

    fn text(s: &str) -> Payload {
        Payload::Text(s.into())
    }

    #[test]
    fn identification_lines() {
        assert_eq!(
            info_text(text("+CGMI: \"Quectel\"")),
            Ok(Payload::Value(Value::Text("Quectel".into())))
        );
        assert_eq!(
            info_text(text("huawei")),
            Ok(Payload::Value(Value::Text("huawei".into())))
        );
        // Colons inside a bare value are kept.
        assert_eq!(
            info_text(text("Revision: 11.617")),
            Ok(Payload::Value(Value::Text("Revision: 11.617".into())))
        );
        assert!(info_text(text("+CGMR:")).is_err());
        assert!(info_text(Payload::None).is_err());
    }

    #[test]
    fn signal_quality() {
        assert_eq!(
            csq(text("20,99")),
            Ok(Payload::Value(Value::Signal {
                rssi_dbm: Some(-73),
                ber: None
            }))
        );
        assert_eq!(
            csq(text("99,3")),
            Ok(Payload::Value(Value::Signal {
                rssi_dbm: None,
                ber: Some(3)
            }))
        );
        assert!(matches!(csq(text("20")), Err(ClassifyError::Parse(_))));
        assert!(matches!(csq(text("x,1")), Err(ClassifyError::Parse(_))));
    }

    #[test]
    fn ws46_values() {
        let Ok(Payload::Value(Value::Modes(m))) = ws46(text("28")) else {
            panic!("expected modes");
        };
        assert_eq!(m.allowed, vec![Mode::G4]);
        assert!(matches!(ws46(text("77")), Err(ClassifyError::Unexpected(_))));
    }
}
