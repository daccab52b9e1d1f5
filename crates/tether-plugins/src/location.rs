//! # Location Engine Toggle
//!
//! ```text
//!   Off ──start──▶ Starting ──ok──▶ Started ──stop──▶ Stopping ──notified──▶ Off
//!                      │ error                           │ timeout
//!                      └──────▶ Off                      └──────▶ Off
//! ```
//!
//! Starting a started engine and stopping a stopped one complete without
//! touching the device.

use std::time::Duration;

use tether_core::config::LocationConfig;
use tether_core::correlator::Pattern;
use tether_core::error::OpError;
use tether_core::op::{EngineState, Value};
use tether_core::sequence::{Action, Input, Procedure, StepContext};
use tether_core::state::Field;
use tether_core::step::CommandStep;
use tether_core::urc::UrcKind;
use tracing::{debug, warn};

use crate::load::unexpected;

/// Vendor command set for one location engine.
#[derive(Debug, Clone, Copy)]
pub struct Dialect {
    pub start: &'static str,
    pub stop: &'static str,
    /// Notification sent once the engine has fully stopped.
    pub stopped: Pattern,
}

impl Dialect {
    pub const HUAWEI: Dialect = Dialect {
        start: "AT^WPDGP",
        stop: "AT^WPEND",
        stopped: Pattern::Urc(UrcKind::LocationStopped),
    };
}

fn state(s: EngineState) -> Value {
    Value::Location(s)
}

pub struct Start {
    dialect: Dialect,
    timeout: Duration,
    sent: bool,
}

impl Start {
    pub fn new(dialect: Dialect, config: &LocationConfig) -> Self {
        Self {
            dialect,
            timeout: config.start_timeout,
            sent: false,
        }
    }
}

impl Procedure for Start {
    fn name(&self) -> &'static str {
        "location-start"
    }

    fn advance(&mut self, ctx: &mut StepContext, input: Input) -> Action {
        match input {
            Input::Start if ctx.snapshot().location == EngineState::Started => {
                debug!("location engine already started");
                Action::Complete(state(EngineState::Started))
            }
            Input::Start => {
                self.sent = true;
                ctx.update(Field::Location(EngineState::Starting));
                Action::Send(CommandStep::at("location-start", self.dialect.start).timeout(self.timeout))
            }
            Input::Reply(Ok(_)) => {
                ctx.update(Field::Location(EngineState::Started));
                Action::Complete(state(EngineState::Started))
            }
            Input::Reply(Err(e)) => Action::Fail(e.into()),
            other => unexpected(other),
        }
    }

    fn cleanup(&mut self, ctx: &mut StepContext, outcome: &Result<Value, OpError>) -> Option<CommandStep> {
        if outcome.is_err() && self.sent {
            ctx.update(Field::Location(EngineState::Off));
        }
        None
    }
}

pub struct Stop {
    dialect: Dialect,
    timeout: Duration,
    previous: EngineState,
    accepted: bool,
}

impl Stop {
    pub fn new(dialect: Dialect, config: &LocationConfig) -> Self {
        Self {
            dialect,
            timeout: config.stop_timeout,
            previous: EngineState::Off,
            accepted: false,
        }
    }

    fn stopped(ctx: &mut StepContext) -> Action {
        ctx.update(Field::Location(EngineState::Off));
        Action::Complete(state(EngineState::Off))
    }
}

impl Procedure for Stop {
    fn name(&self) -> &'static str {
        "location-stop"
    }

    fn advance(&mut self, ctx: &mut StepContext, input: Input) -> Action {
        match input {
            Input::Start => {
                self.previous = ctx.snapshot().location;
                if self.previous == EngineState::Off {
                    return Action::Complete(state(EngineState::Off));
                }
                ctx.update(Field::Location(EngineState::Stopping));
                Action::Send(CommandStep::at("location-stop", self.dialect.stop))
            }
            Input::Reply(Ok(_)) => {
                self.accepted = true;
                Action::Await {
                    pattern: self.dialect.stopped,
                    until: None,
                    timeout: self.timeout,
                }
            }
            Input::Reply(Err(e)) => Action::Fail(e.into()),
            Input::Event(_) => Self::stopped(ctx),
            Input::WaitTimedOut => {
                warn!(timeout = ?self.timeout, "no stop notification, assuming engine off");
                Self::stopped(ctx)
            }
            other => unexpected(other),
        }
    }

    fn cleanup(&mut self, ctx: &mut StepContext, outcome: &Result<Value, OpError>) -> Option<CommandStep> {
        if outcome.is_err() && self.previous != EngineState::Off {
            // An accepted stop request finishes on its own.
            let s = if self.accepted { EngineState::Off } else { self.previous };
            ctx.update(Field::Location(s));
        }
        None
    }
}
