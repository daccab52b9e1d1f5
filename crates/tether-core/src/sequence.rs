//! # Sequence Orchestrator
//!
//! Drives one operation's [`Procedure`] to a single terminal outcome.
//!
//! A procedure is an explicit state machine: the orchestrator feeds it an
//! [`Input`] (start, a step reply, a probe result, an awaited event, a timer)
//! and executes the [`Action`] it returns. Per request:
//!
//! ```text
//!   INIT ──▶ STEP_1 ──▶ … ──▶ STEP_n ──▶ DONE
//!              │                 │
//!              └──── failure ────┴──▶ CLEANUP_ON_ERROR ──▶ (error)
//!   any ──cancel──▶ CANCELLED (cleanup runs, then the cancellation error)
//! ```
//!
//! Guarantees:
//!
//! - at most one command step in flight; a step cancelled mid-flight is
//!   allowed to finish and its reply is discarded;
//! - the procedure's cleanup hook runs exactly once per request, after the
//!   last step and before completion; a cleanup step's failure is logged
//!   and ignored;
//! - every dispatch and wait gets a fresh, monotonically increasing
//!   [`StepToken`]; resolutions carrying an older token are dropped;
//! - one-shot interests never outlive the wait that registered them.

use std::fmt;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::{Event, Ports};
use crate::classify::Payload;
use crate::correlator::{Pattern, Predicate};
use crate::error::{OpError, StepError, TransportError};
use crate::op::Value;
use crate::probe::{Feature, FeatureCache, Support};
use crate::pump::EventPump;
use crate::state::{Field, SessionId, StateSnapshot};
use crate::step::{CommandStep, Executor};

/// Monotonic identifier of a dispatch or wait within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StepToken(pub u64);

impl StepToken {
    fn next(self) -> Self {
        StepToken(self.0 + 1)
    }
}

impl fmt::Display for StepToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Step(u32),
    CleanupOnError,
    Done,
    Cancelled,
}

/// What the orchestrator hands a procedure.
#[derive(Debug)]
pub enum Input {
    Start,
    Reply(Result<Payload, StepError>),
    /// Outcome of an [`Action::Probe`]. `reply` is `None` when the cache
    /// already said unsupported and nothing was sent.
    Probed {
        feature: Feature,
        support: Support,
        reply: Option<Result<Payload, StepError>>,
    },
    Event(Event),
    WaitTimedOut,
    Woke,
}

/// What a procedure asks the orchestrator to do next.
pub enum Action {
    Send(CommandStep),
    /// Send `step` unless `feature` is cached unsupported; resolve the cache
    /// from the reply.
    Probe {
        feature: Feature,
        step: CommandStep,
    },
    /// Block until a matching unsolicited event or the timeout.
    Await {
        pattern: Pattern,
        until: Option<Predicate>,
        timeout: Duration,
    },
    Sleep(Duration),
    Complete(Value),
    Fail(OpError),
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Send(s) => write!(f, "Send({})", s.label),
            Action::Probe { feature, step } => write!(f, "Probe({feature}, {})", step.label),
            Action::Await { pattern, timeout, .. } => write!(f, "Await({pattern:?}, {timeout:?})"),
            Action::Sleep(d) => write!(f, "Sleep({d:?})"),
            Action::Complete(v) => write!(f, "Complete({v:?})"),
            Action::Fail(e) => write!(f, "Fail({e})"),
        }
    }
}

/// Sequence state visible to a procedure.
#[derive(Debug)]
pub struct StepContext {
    session: SessionId,
    token: StepToken,
    phase: Phase,
    snapshot: StateSnapshot,
    data_interface: Option<String>,
    updates: Vec<Field>,
}

impl StepContext {
    pub fn new(session: SessionId, data_interface: Option<String>) -> Self {
        Self {
            session,
            token: StepToken::default(),
            phase: Phase::Init,
            snapshot: StateSnapshot::default(),
            data_interface,
            updates: Vec::new(),
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn token(&self) -> StepToken {
        self.token
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Session state as of the last input.
    pub fn snapshot(&self) -> &StateSnapshot {
        &self.snapshot
    }

    pub fn data_interface(&self) -> Option<&str> {
        self.data_interface.as_deref()
    }

    /// Queue a snapshot update, applied when the procedure yields.
    pub fn update(&mut self, field: Field) {
        self.updates.push(field);
    }
}

/// A named multi-step procedure.
pub trait Procedure: Send {
    fn name(&self) -> &'static str;

    fn advance(&mut self, ctx: &mut StepContext, input: Input) -> Action;

    /// Called exactly once with the terminal outcome. A returned step is
    /// dispatched best-effort before the request completes.
    fn cleanup(&mut self, _ctx: &mut StepContext, _outcome: &Result<Value, OpError>) -> Option<CommandStep> {
        None
    }
}

/// Bounded sequence-level retry with a fixed delay.
#[derive(Debug, Clone)]
pub struct Retry {
    attempts: u32,
    max: u32,
    delay: Duration,
}

impl Retry {
    /// `max` counts every attempt, including the first.
    pub fn new(max: u32, delay: Duration) -> Self {
        Self {
            attempts: 0,
            max: max.max(1),
            delay,
        }
    }

    /// Record an attempt about to be made.
    pub fn begin(&mut self) {
        self.attempts += 1;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before the next attempt, or `None` when the budget is spent.
    pub fn again(&self) -> Option<Duration> {
        (self.attempts < self.max).then_some(self.delay)
    }
}

/// Operation cancellation combined with session shutdown.
#[derive(Clone, Default)]
pub struct CancelScope {
    op: CancellationToken,
    session: CancellationToken,
}

impl CancelScope {
    pub fn new(op: CancellationToken, session: CancellationToken) -> Self {
        Self { op, session }
    }

    pub fn is_cancelled(&self) -> bool {
        self.op.is_cancelled() || self.session.is_cancelled()
    }

    pub async fn cancelled(&self) {
        tokio::select! {
            _ = self.op.cancelled() => {}
            _ = self.session.cancelled() => {}
        }
    }
}

enum Waited {
    Event(Event),
    TimedOut,
    Cancelled,
    Closed,
}

/// Runs procedures against one session's resources.
pub struct Orchestrator<'a> {
    ports: &'a Ports,
    executor: &'a Executor,
    probes: &'a mut FeatureCache,
    pump: &'a mut EventPump,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        ports: &'a Ports,
        executor: &'a Executor,
        probes: &'a mut FeatureCache,
        pump: &'a mut EventPump,
    ) -> Self {
        Self {
            ports,
            executor,
            probes,
            pump,
        }
    }

    pub async fn run(&mut self, procedure: &mut dyn Procedure, cancel: &CancelScope) -> Result<Value, OpError> {
        let name = procedure.name();
        let mut ctx = StepContext::new(self.pump.session(), self.ports.data_interface.clone());
        let mut input = Input::Start;
        let mut index = 0u32;

        let outcome = loop {
            if cancel.is_cancelled() {
                if let Input::Reply(r) = &input {
                    debug!(op = name, token = %ctx.token, ok = r.is_ok(), "cancelled, reply discarded");
                }
                break Err(OpError::Cancelled);
            }
            ctx.snapshot.clone_from(self.pump.snapshot());
            let action = procedure.advance(&mut ctx, input);
            self.flush(&mut ctx);

            input = match action {
                Action::Complete(value) => break Ok(value),
                Action::Fail(err) => break Err(err),
                Action::Send(step) => {
                    index += 1;
                    ctx.phase = Phase::Step(index);
                    ctx.token = ctx.token.next();
                    Input::Reply(self.dispatch(step).await)
                }
                Action::Probe { feature, step } => {
                    if self.probes.get(feature) == Support::Unsupported {
                        debug!(op = name, %feature, "cached unsupported, not probing");
                        Input::Probed {
                            feature,
                            support: Support::Unsupported,
                            reply: None,
                        }
                    } else {
                        index += 1;
                        ctx.phase = Phase::Step(index);
                        ctx.token = ctx.token.next();
                        let reply = self.dispatch(step).await;
                        let support = self.probes.resolve(feature, &reply);
                        debug!(op = name, %feature, ?support, "probed");
                        Input::Probed {
                            feature,
                            support,
                            reply: Some(reply),
                        }
                    }
                }
                Action::Await {
                    pattern,
                    until,
                    timeout,
                } => {
                    ctx.token = ctx.token.next();
                    match self.wait(pattern, until, timeout, ctx.token, cancel).await {
                        Waited::Event(ev) => Input::Event(ev),
                        Waited::TimedOut => Input::WaitTimedOut,
                        Waited::Cancelled => break Err(OpError::Cancelled),
                        Waited::Closed => break Err(TransportError::DeviceRemoved.into()),
                    }
                }
                Action::Sleep(delay) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break Err(OpError::Cancelled),
                        _ = self.idle(delay) => Input::Woke,
                    }
                }
            };
        };

        ctx.phase = match &outcome {
            Ok(_) => Phase::Done,
            Err(OpError::Cancelled) => Phase::Cancelled,
            Err(_) => Phase::CleanupOnError,
        };
        let cleanup = procedure.cleanup(&mut ctx, &outcome);
        self.flush(&mut ctx);
        if let Some(step) = cleanup {
            match &outcome {
                Err(e) if e.is_fatal() => {
                    debug!(op = name, step = step.label, "device gone, cleanup not sent");
                }
                _ => {
                    ctx.token = ctx.token.next();
                    debug!(op = name, step = step.label, phase = ?ctx.phase, "cleanup");
                    if let Err(e) = self.dispatch(step).await {
                        warn!(op = name, error = %e, "cleanup failed, ignored");
                    }
                }
            }
        }
        outcome
    }

    fn flush(&mut self, ctx: &mut StepContext) {
        for field in ctx.updates.drain(..) {
            self.pump.apply(field);
        }
    }

    /// Execute one step while keeping the unsolicited stream moving.
    async fn dispatch(&mut self, step: CommandStep) -> Result<Payload, StepError> {
        let executor = self.executor;
        let ports = self.ports;
        let fut = executor.execute(ports, step);
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                r = &mut fut => return r,
                ev = self.pump.recv(), if self.pump.is_open() => {
                    if let Some(ev) = ev {
                        self.route_stale(ev);
                    }
                }
            }
        }
    }

    /// Timer that keeps routing events.
    async fn idle(&mut self, delay: Duration) {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                _ = &mut sleep => return,
                ev = self.pump.recv(), if self.pump.is_open() => {
                    if let Some(ev) = ev {
                        self.route_stale(ev);
                    }
                }
            }
        }
    }

    /// Route with no wait outstanding: any resolution is stale.
    fn route_stale(&mut self, ev: Event) {
        if let Some((token, _)) = self.pump.route(ev) {
            warn!(session = %self.pump.session(), %token, "stale resolution dropped");
        }
    }

    async fn wait(
        &mut self,
        pattern: Pattern,
        until: Option<Predicate>,
        timeout: Duration,
        token: StepToken,
        cancel: &CancelScope,
    ) -> Waited {
        let session = self.pump.session();
        let id = self
            .pump
            .correlator_mut()
            .await_once(session, pattern, token, until);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let waited = loop {
            if !self.pump.is_open() {
                break Waited::Closed;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Waited::Cancelled,
                ev = self.pump.recv() => {
                    let Some(ev) = ev else { break Waited::Closed };
                    match self.pump.route(ev) {
                        Some((t, ev)) if t == token => break Waited::Event(ev),
                        Some((t, _)) => warn!(%session, token = %t, "stale resolution dropped"),
                        None => {}
                    }
                }
                _ = &mut deadline => break Waited::TimedOut,
            }
        };
        // Resolved interests are already gone; anything else is ours to remove.
        if !matches!(waited, Waited::Event(_)) {
            self.pump.correlator_mut().remove(id);
        }
        waited
    }
}
