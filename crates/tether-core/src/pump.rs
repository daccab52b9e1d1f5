//! The session's unsolicited-event pump.
//!
//! Bundles the unsolicited stream, the correlator and the state snapshot
//! so both the idle session loop and a running sequence can route events
//! the same way.

use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::channel::Event;
use crate::correlator::{Correlator, Routed};
use crate::sequence::StepToken;
use crate::state::{Field, SessionId, StateChange, StateSnapshot};

pub struct EventPump {
    session: SessionId,
    rx: mpsc::Receiver<Event>,
    open: bool,
    correlator: Correlator,
    snapshot: StateSnapshot,
    changes: broadcast::Sender<StateChange>,
}

impl EventPump {
    pub fn new(
        session: SessionId,
        rx: mpsc::Receiver<Event>,
        changes: broadcast::Sender<StateChange>,
    ) -> Self {
        Self {
            session,
            rx,
            open: true,
            correlator: Correlator::new(),
            snapshot: StateSnapshot::default(),
            changes,
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// False once the unsolicited stream has ended (device gone).
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Next unsolicited event; `None` marks the stream closed.
    pub async fn recv(&mut self) -> Option<Event> {
        let ev = self.rx.recv().await;
        if ev.is_none() {
            self.open = false;
        }
        ev
    }

    /// Route an event. Persistent updates are applied here; an awaited
    /// resolution is handed back to the caller.
    pub fn route(&mut self, event: Event) -> Option<(StepToken, Event)> {
        match self.correlator.dispatch(event, &self.snapshot) {
            Routed::Dropped => None,
            Routed::State(fields) => {
                for f in fields {
                    self.apply(f);
                }
                None
            }
            Routed::Resolved { token, event } => Some((token, event)),
        }
    }

    /// Update the snapshot and notify subscribers of an effective change.
    pub fn apply(&mut self, field: Field) {
        if self.snapshot.apply(&field) {
            debug!(session = %self.session, ?field, "state change");
            // No subscribers is fine.
            let _ = self.changes.send(StateChange {
                session: self.session,
                field,
            });
        }
    }

    pub fn snapshot(&self) -> &StateSnapshot {
        &self.snapshot
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn correlator_mut(&mut self) -> &mut Correlator {
        &mut self.correlator
    }
}
