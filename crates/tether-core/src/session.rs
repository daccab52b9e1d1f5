//! # Device Session
//!
//! One task per device. The task owns the ports, the correlator, the
//! feature cache and the state snapshot; nothing else touches them, so
//! sequence state needs no locks. Operation requests are queued on the
//! session mailbox and run strictly one after another.
//!
//! ```text
//!   SessionHandle ──execute──▶ mailbox ──▶ session task ──▶ Orchestrator
//!                                              ▲                  │
//!   unsolicited stream ──────────────▶ EventPump ◀────────────────┘
//! ```
//!
//! A fatal transport error or the end of the unsolicited stream tears the
//! session down: interests are removed, a [`Field::Removed`] change is
//! broadcast and queued requests complete with [`OpError::SessionClosed`].
//! An orderly [`SessionHandle::shutdown`] does the same minus the
//! `Removed` change, so subscribers can tell an unplug from a close.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{Event, Ports};
use crate::config::TetherConfig;
use crate::error::OpError;
use crate::op::{Operation, Value};
use crate::plugin::Plugin;
use crate::probe::{Feature, FeatureCache, Support};
use crate::pump::EventPump;
use crate::sequence::{CancelScope, Orchestrator};
use crate::state::{Field, SessionId, StateChange, StateSnapshot};
use crate::step::{Executor, RetryPolicy};

/// Completion sink of one request. Consumed on use, so a request completes
/// at most once; dropping it unsent completes the caller with
/// [`OpError::SessionClosed`].
struct Completion {
    op: &'static str,
    started: Instant,
    tx: oneshot::Sender<Result<Value, OpError>>,
}

impl Completion {
    fn complete(self, result: Result<Value, OpError>) {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => info!(op = self.op, elapsed_ms, "operation complete"),
            Err(e) if e.is_cancelled() => info!(op = self.op, elapsed_ms, "operation cancelled"),
            Err(e) => warn!(op = self.op, elapsed_ms, error = %e, "operation failed"),
        }
        if self.tx.send(result).is_err() {
            debug!(op = self.op, "requester gone");
        }
    }
}

enum Command {
    Execute {
        op: Operation,
        cancel: CancellationToken,
        done: Completion,
    },
    Feature {
        feature: Feature,
        reply: oneshot::Sender<Support>,
    },
    Snapshot {
        reply: oneshot::Sender<StateSnapshot>,
    },
    Adopt {
        plugin: Arc<dyn Plugin>,
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    tx: mpsc::Sender<Command>,
    changes: broadcast::Sender<StateChange>,
    shutdown: CancellationToken,
    closed: CancellationToken,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Run one operation to completion.
    ///
    /// Cancelling `cancel` stops further dispatch; the procedure's cleanup
    /// still runs before this returns [`OpError::Cancelled`].
    pub async fn execute(&self, op: Operation, cancel: CancellationToken) -> Result<Value, OpError> {
        let (tx, rx) = oneshot::channel();
        let done = Completion {
            op: op.name(),
            started: Instant::now(),
            tx,
        };
        self.tx
            .send(Command::Execute { op, cancel, done })
            .await
            .map_err(|_| OpError::SessionClosed)?;
        rx.await.unwrap_or(Err(OpError::SessionClosed))
    }

    /// State change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    pub async fn feature(&self, feature: Feature) -> Result<Support, OpError> {
        self.ask(|reply| Command::Feature { feature, reply }).await
    }

    pub async fn snapshot(&self) -> Result<StateSnapshot, OpError> {
        self.ask(|reply| Command::Snapshot { reply }).await
    }

    /// Switch to another plugin: its interests replace the current ones.
    pub async fn adopt(&self, plugin: Arc<dyn Plugin>) -> Result<(), OpError> {
        self.ask(|reply| Command::Adopt { plugin, reply }).await
    }

    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, OpError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(make(tx)).await.map_err(|_| OpError::SessionClosed)?;
        rx.await.map_err(|_| OpError::SessionClosed)
    }

    /// Cancel the running operation and close the session.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Resolves once the session task has finished tearing down.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    Shutdown,
    HandlesDropped,
    DeviceLost,
    StreamClosed,
}

impl CloseReason {
    fn device_gone(self) -> bool {
        matches!(self, CloseReason::DeviceLost | CloseReason::StreamClosed)
    }
}

pub struct Session {
    id: SessionId,
    ports: Ports,
    executor: Executor,
    probes: FeatureCache,
    pump: EventPump,
    plugin: Arc<dyn Plugin>,
    commands: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
    closed: CancellationToken,
}

impl Session {
    /// Start a session task over `ports` and their unsolicited stream.
    pub fn spawn(
        id: SessionId,
        ports: Ports,
        events: mpsc::Receiver<Event>,
        plugin: Arc<dyn Plugin>,
        config: &TetherConfig,
    ) -> SessionHandle {
        let (tx, commands) = mpsc::channel(32);
        let (changes, _) = broadcast::channel(config.channel.urc_buffer);
        let shutdown = CancellationToken::new();
        let closed = CancellationToken::new();

        let executor = Executor::new(
            RetryPolicy::new(&config.retry, &config.channel),
            Arc::new(plugin.errors()),
        );
        let session = Session {
            id,
            ports,
            executor,
            probes: FeatureCache::new(),
            pump: EventPump::new(id, events, changes.clone()),
            plugin,
            commands,
            shutdown: shutdown.clone(),
            closed: closed.clone(),
        };
        tokio::spawn(session.run());

        SessionHandle {
            id,
            tx,
            changes,
            shutdown,
            closed,
        }
    }

    async fn run(mut self) {
        info!(session = %self.id, plugin = self.plugin.name(), "session started");
        self.register_interests();

        let reason = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break CloseReason::Shutdown,
                // Events first so queries observe every event queued before them.
                ev = self.pump.recv(), if self.pump.is_open() => match ev {
                    Some(ev) => {
                        if let Some((token, _)) = self.pump.route(ev) {
                            warn!(session = %self.id, %token, "stale resolution dropped");
                        }
                    }
                    None => break CloseReason::StreamClosed,
                },
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle(cmd).await.is_break() {
                            break CloseReason::DeviceLost;
                        }
                    }
                    None => break CloseReason::HandlesDropped,
                },
            }
        };

        info!(session = %self.id, ?reason, "session closing");
        self.pump.correlator_mut().remove_session(self.id);
        if reason.device_gone() {
            self.pump.apply(Field::Removed);
        }
        self.commands.close();
        while let Ok(cmd) = self.commands.try_recv() {
            if let Command::Execute { done, .. } = cmd {
                done.complete(Err(OpError::SessionClosed));
            }
        }
        self.closed.cancel();
    }

    fn register_interests(&mut self) {
        let id = self.id;
        let correlator = self.pump.correlator_mut();
        for (pattern, handler) in self.plugin.interests() {
            correlator.register(id, pattern, handler);
        }
    }

    async fn handle(&mut self, cmd: Command) -> ControlFlow<()> {
        match cmd {
            Command::Execute { op, cancel, done } => return self.execute(op, cancel, done).await,
            Command::Feature { feature, reply } => {
                let _ = reply.send(self.probes.get(feature));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.pump.snapshot().clone());
            }
            Command::Adopt { plugin, reply } => {
                info!(session = %self.id, from = self.plugin.name(), to = plugin.name(), "plugin change");
                self.pump.correlator_mut().remove_persistent(self.id);
                self.executor = Executor::new(self.executor.policy().clone(), Arc::new(plugin.errors()));
                self.plugin = plugin;
                self.register_interests();
                let _ = reply.send(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn execute(&mut self, op: Operation, cancel: CancellationToken, done: Completion) -> ControlFlow<()> {
        if cancel.is_cancelled() {
            done.complete(Err(OpError::Cancelled));
            return ControlFlow::Continue(());
        }
        let mut procedure = match self.plugin.procedure(&op) {
            Ok(p) => p,
            Err(e) => {
                done.complete(Err(e));
                return ControlFlow::Continue(());
            }
        };

        info!(session = %self.id, op = %op, procedure = procedure.name(), "operation start");
        let scope = CancelScope::new(cancel, self.shutdown.clone());
        let result = Orchestrator::new(&self.ports, &self.executor, &mut self.probes, &mut self.pump)
            .run(procedure.as_mut(), &scope)
            .await;

        let fatal = matches!(&result, Err(e) if e.is_fatal());
        done.complete(result);
        if fatal {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{AtReply, Channel, Reply, Request};
    use crate::classify::Expect;
    use crate::correlator::{Handler, Pattern};
    use crate::error::TransportError;
    use crate::plugin::DeviceIdentity;
    use crate::sequence::{Action, Input, Procedure, StepContext};
    use crate::state::Registration;
    use crate::step::CommandStep;
    use crate::urc::{UrcKind, UrcTable};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    // ─── Harness ────────────────────────────────────────────────────────

    /// Answers `+CGMM` with a model line; `AT+GONE` simulates removal.
    #[derive(Default)]
    struct Echo {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Channel for Echo {
        async fn send(&self, request: Request, _timeout: Duration) -> Result<Reply, TransportError> {
            let cmd = request.to_string();
            self.sent.lock().unwrap().push(cmd.clone());
            match cmd.as_str() {
                "AT+GONE" => Err(TransportError::DeviceRemoved),
                "AT+CGMM" => Ok(Reply::At(AtReply::ok_with(["+CGMM: E3372"]))),
                _ => Ok(Reply::At(AtReply::ok())),
            }
        }
    }

    struct Single(CommandStep);

    impl Procedure for Single {
        fn name(&self) -> &'static str {
            "single"
        }

        fn advance(&mut self, _ctx: &mut StepContext, input: Input) -> Action {
            match input {
                Input::Start => Action::Send(self.0.clone()),
                Input::Reply(Ok(p)) => Action::Complete(p.into_value().unwrap_or(Value::Unit)),
                Input::Reply(Err(e)) => Action::Fail(e.into()),
                _ => Action::Fail(OpError::Invariant("unexpected input".into())),
            }
        }
    }

    struct TestPlugin {
        name: &'static str,
        registration: bool,
    }

    impl Plugin for TestPlugin {
        fn name(&self) -> &'static str {
            self.name
        }

        fn supports(&self, _device: &DeviceIdentity) -> bool {
            true
        }

        fn procedure(&self, op: &Operation) -> Result<Box<dyn Procedure>, OpError> {
            match op {
                Operation::LoadModel => Ok(Box::new(Single(
                    CommandStep::at("model", "AT+CGMM").expect(Expect::Prefixed("+CGMM:")),
                ))),
                Operation::Disconnect => Ok(Box::new(Single(CommandStep::at("gone", "AT+GONE")))),
                other => Err(OpError::Unsupported(other.name().into())),
            }
        }

        fn interests(&self) -> Vec<(Pattern, Handler)> {
            if !self.registration {
                return Vec::new();
            }
            let handler: Handler = Box::new(|ev, _| match ev {
                Event::Urc(u) => u
                    .field_u32(0)
                    .map(|s| vec![Field::Registration(Registration::from_stat(s))])
                    .unwrap_or_default(),
                _ => Vec::new(),
            });
            vec![(Pattern::Urc(UrcKind::Registration), handler)]
        }
    }

    fn start(registration: bool) -> (SessionHandle, Arc<Echo>, mpsc::Sender<Event>) {
        let ch = Arc::new(Echo::default());
        let (tx, rx) = mpsc::channel(8);
        let plugin = Arc::new(TestPlugin {
            name: "test",
            registration,
        });
        let handle = Session::spawn(
            SessionId(7),
            Ports::new(ch.clone()),
            rx,
            plugin,
            &TetherConfig::default(),
        );
        (handle, ch, tx)
    }

    fn urc(line: &str) -> Event {
        Event::Urc(UrcTable::standard().match_line(line).unwrap())
    }

    // ─── Operations ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn execute_returns_typed_value() {
        let (s, _ch, _tx) = start(false);
        let r = s.execute(Operation::LoadModel, CancellationToken::new()).await;
        assert_eq!(r, Ok(Value::Text("E3372".into())));
    }

    #[tokio::test]
    async fn unsupported_operation_is_reported() {
        let (s, ch, _tx) = start(false);
        let r = s.execute(Operation::LoadSignal, CancellationToken::new()).await;
        assert!(matches!(r, Err(OpError::Unsupported(_))));
        assert!(ch.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn pre_cancelled_request_never_dispatches() {
        let (s, ch, _tx) = start(false);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let r = s.execute(Operation::LoadModel, cancel).await;
        assert_eq!(r, Err(OpError::Cancelled));
        assert!(ch.sent.lock().unwrap().is_empty());
    }

    // ─── Unsolicited State ──────────────────────────────────────────────

    #[tokio::test]
    async fn urcs_update_snapshot_and_notify() {
        let (s, _ch, tx) = start(true);
        let mut changes = s.subscribe();
        tx.send(urc("+CREG: 1")).await.unwrap();
        let c = changes.recv().await.unwrap();
        assert_eq!(c.session, SessionId(7));
        assert_eq!(c.field, Field::Registration(Registration::Home));
        let snap = s.snapshot().await.unwrap();
        assert_eq!(snap.registration, Some(Registration::Home));
    }

    #[tokio::test]
    async fn adopt_replaces_interests() {
        let (s, _ch, tx) = start(true);
        let mut changes = s.subscribe();
        tx.send(urc("+CREG: 1")).await.unwrap();
        assert_eq!(
            changes.recv().await.unwrap().field,
            Field::Registration(Registration::Home)
        );
        s.adopt(Arc::new(TestPlugin {
            name: "other",
            registration: false,
        }))
        .await
        .unwrap();
        tx.send(urc("+CREG: 5")).await.unwrap();
        let snap = s.snapshot().await.unwrap();
        assert_eq!(snap.registration, Some(Registration::Home));
    }

    // ─── Teardown ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn device_removal_closes_session() {
        let (s, _ch, _tx) = start(false);
        let mut changes = s.subscribe();
        let r = s.execute(Operation::Disconnect, CancellationToken::new()).await;
        assert_eq!(r, Err(OpError::Transport(TransportError::DeviceRemoved)));
        s.closed().await;
        assert_eq!(changes.recv().await.unwrap().field, Field::Removed);
        let r = s.execute(Operation::LoadModel, CancellationToken::new()).await;
        assert_eq!(r, Err(OpError::SessionClosed));
    }

    #[tokio::test]
    async fn closed_unsolicited_stream_closes_session() {
        let (s, _ch, tx) = start(false);
        let mut changes = s.subscribe();
        drop(tx);
        s.closed().await;
        assert!(s.is_closed());
        assert_eq!(changes.recv().await.unwrap().field, Field::Removed);
        assert_eq!(s.feature(Feature("x")).await, Err(OpError::SessionClosed));
    }

    #[tokio::test]
    async fn shutdown_closes_session() {
        let (s, _ch, _tx) = start(false);
        let mut changes = s.subscribe();
        s.shutdown();
        s.closed().await;
        let r = s.execute(Operation::LoadModel, CancellationToken::new()).await;
        assert_eq!(r, Err(OpError::SessionClosed));
        // Orderly close: no removal is announced.
        assert!(matches!(changes.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
    }
}
