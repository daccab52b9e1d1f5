//! # 3GPP Packet Data Dial
//!
//! Connect: define the context (retried while the device reports busy),
//! authenticate when credentials were given, activate, then poll the
//! activation state until the context is up or the poll budget is spent.
//!
//! ```text
//!   Define ──ok──▶ [Auth] ──ok──▶ Activate ──ok──▶ Verify ──up──▶ Done
//!     │ busy                                         │ down
//!     └─sleep─▶ Define                               └─sleep─▶ Verify
//! ```
//!
//! Any failure after activation was attempted deactivates the context in
//! cleanup. Disconnect deactivates and polls until the context is down; a
//! transport failure while polling is taken as disconnected.

use std::sync::Arc;

use tether_core::classify::{Expect, Payload, split_fields};
use tether_core::config::TetherConfig;
use tether_core::error::{OpError, ProtocolError, StepError};
use tether_core::op::{BearerInfo, ConnectParams, Value};
use tether_core::sequence::{Action, Input, Procedure, Retry, StepContext};
use tether_core::state::Field;
use tether_core::step::CommandStep;
use tracing::{debug, warn};

use crate::load::unexpected;

/// `+CGACT?` result: activation state per context id.
pub fn parse_cgact(lines: &[String]) -> Vec<(u32, bool)> {
    lines
        .iter()
        .filter_map(|l| l.strip_prefix("+CGACT:"))
        .filter_map(|rest| match split_fields(rest).as_slice() {
            [cid, state] => Some((cid.parse().ok()?, *state == "1")),
            _ => None,
        })
        .collect()
}

pub(crate) fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('"', ""))
}

/// `+CGDCONT` for the dial context.
pub(crate) fn define_step(cid: u32, params: &ConnectParams) -> CommandStep {
    CommandStep::at(
        "define",
        format!(
            "AT+CGDCONT={},{},{}",
            cid,
            quote(params.ip_family.pdp_type()),
            quote(&params.apn)
        ),
    )
}

/// Whether a failed step may be retried after the busy delay.
pub(crate) fn is_busy(e: &StepError) -> bool {
    e.protocol() == Some(&ProtocolError::Busy)
}

fn cgact_query() -> CommandStep {
    CommandStep::at("verify", "AT+CGACT?")
        .expect(Expect::Lines)
        .retry_once()
}

fn context_state(cid: u32, reply: &Payload) -> Result<bool, OpError> {
    let Payload::Lines(lines) = reply else {
        return Err(OpError::Unexpected("context state without lines".into()));
    };
    parse_cgact(lines)
        .into_iter()
        .find(|(c, _)| *c == cid)
        .map(|(_, up)| up)
        .ok_or_else(|| OpError::Invariant(format!("no state reported for context {cid}")))
}

// ── Connect ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Define,
    Auth,
    Activate,
    Verify,
}

pub struct Connect {
    config: Arc<TetherConfig>,
    params: ConnectParams,
    cid: u32,
    stage: Stage,
    busy: Retry,
    verify: Retry,
    activation_sent: bool,
}

impl Connect {
    pub fn new(config: Arc<TetherConfig>, params: ConnectParams) -> Self {
        let c = &config.connect;
        Self {
            cid: c.cid,
            busy: Retry::new(c.busy_retries + 1, c.busy_delay),
            verify: Retry::new(c.verify_attempts, c.verify_interval),
            params,
            stage: Stage::Define,
            activation_sent: false,
            config,
        }
    }

    fn define(&mut self) -> Action {
        self.stage = Stage::Define;
        self.busy.begin();
        Action::Send(define_step(self.cid, &self.params))
    }

    fn auth(&mut self) -> Action {
        self.stage = Stage::Auth;
        let p = &self.params;
        Action::Send(CommandStep::at(
            "authenticate",
            format!(
                "AT+CGAUTH={},{},{},{}",
                self.cid,
                p.auth.code(),
                quote(p.user.as_deref().unwrap_or_default()),
                quote(p.password.as_deref().unwrap_or_default())
            ),
        ))
    }

    fn activate(&mut self) -> Action {
        self.stage = Stage::Activate;
        self.activation_sent = true;
        Action::Send(
            CommandStep::at("activate", format!("AT+CGACT=1,{}", self.cid))
                .timeout(self.config.channel.long_timeout),
        )
    }

    fn verify(&mut self) -> Action {
        self.stage = Stage::Verify;
        self.verify.begin();
        Action::Send(cgact_query())
    }

    fn on_reply(&mut self, ctx: &mut StepContext, reply: Result<Payload, StepError>) -> Action {
        match (self.stage, reply) {
            (Stage::Define, Err(e)) if is_busy(&e) => match self.busy.again() {
                Some(delay) => {
                    debug!(attempt = self.busy.attempts(), "context definition busy, retrying");
                    Action::Sleep(delay)
                }
                None => Action::Fail(OpError::RetriesExhausted {
                    step: "define",
                    attempts: self.busy.attempts(),
                }),
            },
            (_, Err(e)) => Action::Fail(e.into()),
            (Stage::Define, Ok(_)) if self.params.needs_auth() => self.auth(),
            (Stage::Define | Stage::Auth, Ok(_)) => self.activate(),
            (Stage::Activate, Ok(_)) => self.verify(),
            (Stage::Verify, Ok(payload)) => match context_state(self.cid, &payload) {
                Ok(true) => {
                    ctx.update(Field::Bearer(Some(self.cid)));
                    Action::Complete(Value::Bearer(BearerInfo {
                        cid: self.cid,
                        interface: ctx.data_interface().map(str::to_string),
                    }))
                }
                Ok(false) => match self.verify.again() {
                    Some(delay) => Action::Sleep(delay),
                    None => Action::Fail(OpError::RetriesExhausted {
                        step: "verify",
                        attempts: self.verify.attempts(),
                    }),
                },
                Err(e) => Action::Fail(e),
            },
        }
    }
}

impl Procedure for Connect {
    fn name(&self) -> &'static str {
        "3gpp-connect"
    }

    fn advance(&mut self, ctx: &mut StepContext, input: Input) -> Action {
        match input {
            Input::Start => self.define(),
            Input::Reply(reply) => self.on_reply(ctx, reply),
            Input::Woke => match self.stage {
                Stage::Define => self.define(),
                Stage::Verify => self.verify(),
                _ => Action::Fail(OpError::Invariant("woke outside a retry".into())),
            },
            other => unexpected(other),
        }
    }

    fn cleanup(&mut self, _ctx: &mut StepContext, outcome: &Result<Value, OpError>) -> Option<CommandStep> {
        (outcome.is_err() && self.activation_sent)
            .then(|| CommandStep::at("deactivate", format!("AT+CGACT=0,{}", self.cid)))
    }
}

// ── Disconnect ──────────────────────────────────────────────────────

pub struct Disconnect {
    config: Arc<TetherConfig>,
    cid: Option<u32>,
    verify: Retry,
    deactivated: bool,
}

impl Disconnect {
    pub fn new(config: Arc<TetherConfig>) -> Self {
        let d = &config.disconnect;
        Self {
            verify: Retry::new(d.verify_attempts, d.verify_interval),
            cid: None,
            deactivated: false,
            config,
        }
    }

    fn verify(&mut self) -> Action {
        self.verify.begin();
        Action::Send(cgact_query())
    }

    fn done(ctx: &mut StepContext) -> Action {
        ctx.update(Field::Bearer(None));
        Action::Complete(Value::Unit)
    }
}

impl Procedure for Disconnect {
    fn name(&self) -> &'static str {
        "3gpp-disconnect"
    }

    fn advance(&mut self, ctx: &mut StepContext, input: Input) -> Action {
        match input {
            Input::Start => {
                let cid = ctx.snapshot().bearer.unwrap_or(self.config.connect.cid);
                self.cid = Some(cid);
                Action::Send(
                    CommandStep::at("deactivate", format!("AT+CGACT=0,{cid}"))
                        .timeout(self.config.channel.long_timeout),
                )
            }
            Input::Reply(Err(e)) if !self.deactivated => Action::Fail(e.into()),
            Input::Reply(Ok(_)) if !self.deactivated => {
                self.deactivated = true;
                self.verify()
            }
            Input::Reply(Err(e)) => match e.transport() {
                Some(t) => {
                    warn!(error = %t, "status poll failed after deactivation, assuming disconnected");
                    Self::done(ctx)
                }
                None => Action::Fail(e.into()),
            },
            Input::Reply(Ok(payload)) => {
                let cid = self.cid.unwrap_or(self.config.connect.cid);
                match context_state(cid, &payload) {
                    // An unlisted context is not active.
                    Ok(false) | Err(OpError::Invariant(_)) => Self::done(ctx),
                    Ok(true) => match self.verify.again() {
                        Some(delay) => Action::Sleep(delay),
                        None => Action::Fail(OpError::RetriesExhausted {
                            step: "verify",
                            attempts: self.verify.attempts(),
                        }),
                    },
                    Err(e) => Action::Fail(e),
                }
            }
            Input::Woke => self.verify(),
            other => unexpected(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cgact_lines() {
        let lines = vec![
            "+CGACT: 1,1".to_string(),
            "+CGACT: 2,0".to_string(),
            "junk".to_string(),
            "+CGACT: x,1".to_string(),
        ];
        assert_eq!(parse_cgact(&lines), vec![(1, true), (2, false)]);
    }

    #[test]
    fn context_state_requires_our_cid() {
        let reply = Payload::Lines(vec!["+CGACT: 2,1".into()]);
        assert!(matches!(context_state(1, &reply), Err(OpError::Invariant(_))));
        assert_eq!(context_state(2, &reply), Ok(true));
        assert!(matches!(
            context_state(1, &Payload::None),
            Err(OpError::Unexpected(_))
        ));
    }

    #[test]
    fn quoting_strips_embedded_quotes() {
        assert_eq!(quote("a\"b"), "\"ab\"");
    }

    // ─── Procedure Walks ────────────────────────────────────────────────

    fn ctx() -> StepContext {
        StepContext::new(tether_core::SessionId(1), Some("wwan0".into()))
    }

    fn sent(a: &Action) -> String {
        match a {
            Action::Send(step) => step.request.to_string(),
            other => panic!("expected a send, got {other:?}"),
        }
    }

    fn ok() -> Input {
        Input::Reply(Ok(Payload::None))
    }

    fn busy() -> Input {
        Input::Reply(Err(tether_core::error::ClassifyError::Protocol(ProtocolError::Busy).into()))
    }

    #[test]
    fn connect_with_credentials() {
        let params = ConnectParams {
            user: Some("u".into()),
            password: Some("p".into()),
            auth: tether_core::op::AuthMethod::Chap,
            ..ConnectParams::apn("internet")
        };
        let mut c = Connect::new(Arc::new(TetherConfig::default()), params);
        let mut ctx = ctx();
        assert_eq!(sent(&c.advance(&mut ctx, Input::Start)), "AT+CGDCONT=1,\"IP\",\"internet\"");
        assert_eq!(sent(&c.advance(&mut ctx, ok())), "AT+CGAUTH=1,2,\"u\",\"p\"");
        assert_eq!(sent(&c.advance(&mut ctx, ok())), "AT+CGACT=1,1");
        assert_eq!(sent(&c.advance(&mut ctx, ok())), "AT+CGACT?");
        let done = c.advance(&mut ctx, Input::Reply(Ok(Payload::Lines(vec!["+CGACT: 1,1".into()]))));
        assert!(matches!(
            done,
            Action::Complete(Value::Bearer(BearerInfo { cid: 1, interface: Some(ref i) })) if i == "wwan0"
        ));
        assert!(c.cleanup(&mut ctx, &Ok(Value::Unit)).is_none());
    }

    #[test]
    fn busy_definition_is_retried_then_gives_up() {
        let mut cfg = TetherConfig::default();
        cfg.connect.busy_retries = 2;
        let mut c = Connect::new(Arc::new(cfg), ConnectParams::apn("internet"));
        let mut ctx = ctx();
        c.advance(&mut ctx, Input::Start);
        for _ in 0..2 {
            assert!(matches!(c.advance(&mut ctx, busy()), Action::Sleep(_)));
            assert!(sent(&c.advance(&mut ctx, Input::Woke)).starts_with("AT+CGDCONT"));
        }
        assert!(matches!(
            c.advance(&mut ctx, busy()),
            Action::Fail(OpError::RetriesExhausted { step: "define", attempts: 3 })
        ));
        // Nothing was activated, nothing to undo.
        assert!(c.cleanup(&mut ctx, &Err(OpError::Cancelled)).is_none());
    }

    #[test]
    fn failed_activation_is_undone() {
        let mut c = Connect::new(Arc::new(TetherConfig::default()), ConnectParams::apn("x"));
        let mut ctx = ctx();
        c.advance(&mut ctx, Input::Start);
        c.advance(&mut ctx, ok());
        let fail = c.advance(
            &mut ctx,
            Input::Reply(Err(tether_core::error::ClassifyError::Protocol(
                ProtocolError::ServiceOptionNotSubscribed,
            )
            .into())),
        );
        let Action::Fail(err) = fail else { panic!("expected failure") };
        let undo = c.cleanup(&mut ctx, &Err(err)).unwrap();
        assert_eq!(undo.request.to_string(), "AT+CGACT=0,1");
    }

    #[test]
    fn disconnect_uses_bearer_cid_and_tolerates_poll_failure() {
        let mut d = Disconnect::new(Arc::new(TetherConfig::default()));
        let mut ctx = ctx();
        assert_eq!(sent(&d.advance(&mut ctx, Input::Start)), "AT+CGACT=0,1");
        assert_eq!(sent(&d.advance(&mut ctx, ok())), "AT+CGACT?");
        let r = d.advance(
            &mut ctx,
            Input::Reply(Err(tether_core::TransportError::Timeout(Default::default()).into())),
        );
        assert!(matches!(r, Action::Complete(Value::Unit)));
    }
}
