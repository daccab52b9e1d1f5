//! # Unsolicited Event Correlator
//!
//! Routes events that are not direct replies. Each session keeps an ordered
//! table of interests:
//!
//! - **persistent** interests run a handler that turns the event into
//!   snapshot [`Field`] updates (registration, signal, ...);
//! - **awaited** interests resolve a sequence blocked on a notification.
//!   They carry the sequence's [`StepToken`], are removed atomically with
//!   their resolution, and are matched only while their predicate holds.
//!
//! Interests are evaluated in registration order and the first match wins.
//! Unmatched events are dropped.

use tracing::trace;

use crate::channel::Event;
use crate::sequence::StepToken;
use crate::state::{Field, SessionId, StateSnapshot};
use crate::urc::UrcKind;

/// What an interest listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    Urc(UrcKind),
    Indication { service: u8, id: u16 },
}

impl Pattern {
    pub fn matches(&self, event: &Event) -> bool {
        match (self, event) {
            (Pattern::Urc(kind), Event::Urc(urc)) => urc.kind == *kind,
            (Pattern::Indication { service, id }, Event::Indication(msg)) => {
                msg.service == *service && msg.id == *id
            }
            _ => false,
        }
    }
}

/// Maps a matched event to snapshot updates.
pub type Handler = Box<dyn Fn(&Event, &StateSnapshot) -> Vec<Field> + Send + Sync>;

/// Extra condition an awaited event must satisfy.
pub type Predicate = Box<dyn Fn(&Event) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterestId(u64);

enum Route {
    Persistent(Handler),
    Awaiting {
        token: StepToken,
        until: Option<Predicate>,
    },
}

struct Interest {
    id: InterestId,
    session: SessionId,
    pattern: Pattern,
    route: Route,
}

impl Interest {
    fn matches(&self, event: &Event) -> bool {
        if !self.pattern.matches(event) {
            return false;
        }
        match &self.route {
            Route::Awaiting {
                until: Some(pred), ..
            } => pred(event),
            _ => true,
        }
    }
}

/// Result of routing one event.
#[derive(Debug, PartialEq)]
pub enum Routed {
    /// No interest matched.
    Dropped,
    /// A persistent interest produced these updates (possibly none).
    State(Vec<Field>),
    /// An awaited interest was resolved and removed.
    Resolved { token: StepToken, event: Event },
}

#[derive(Default)]
pub struct Correlator {
    interests: Vec<Interest>,
    next_id: u64,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, session: SessionId, pattern: Pattern, route: Route) -> InterestId {
        self.next_id += 1;
        let id = InterestId(self.next_id);
        self.interests.push(Interest {
            id,
            session,
            pattern,
            route,
        });
        id
    }

    pub fn register(&mut self, session: SessionId, pattern: Pattern, handler: Handler) -> InterestId {
        self.push(session, pattern, Route::Persistent(handler))
    }

    /// Register a one-shot interest resolving the sequence step `token`.
    pub fn await_once(
        &mut self,
        session: SessionId,
        pattern: Pattern,
        token: StepToken,
        until: Option<Predicate>,
    ) -> InterestId {
        self.push(session, pattern, Route::Awaiting { token, until })
    }

    /// Remove an interest; returns whether it was still registered.
    pub fn remove(&mut self, id: InterestId) -> bool {
        let before = self.interests.len();
        self.interests.retain(|i| i.id != id);
        self.interests.len() != before
    }

    /// Remove the persistent interests of a session (plugin change).
    pub fn remove_persistent(&mut self, session: SessionId) {
        self.interests
            .retain(|i| !(i.session == session && matches!(i.route, Route::Persistent(_))));
    }

    /// Remove every interest of a session.
    pub fn remove_session(&mut self, session: SessionId) {
        self.interests.retain(|i| i.session != session);
    }

    pub fn clear(&mut self) {
        self.interests.clear();
    }

    pub fn len(&self) -> usize {
        self.interests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interests.is_empty()
    }

    /// Number of one-shot interests still waiting.
    pub fn awaiting(&self) -> usize {
        self.interests
            .iter()
            .filter(|i| matches!(i.route, Route::Awaiting { .. }))
            .count()
    }

    /// Route an event to the first matching interest.
    pub fn dispatch(&mut self, event: Event, snapshot: &StateSnapshot) -> Routed {
        let Some(pos) = self.interests.iter().position(|i| i.matches(&event)) else {
            trace!(?event, "unmatched event dropped");
            return Routed::Dropped;
        };
        match &self.interests[pos].route {
            Route::Persistent(handler) => Routed::State(handler(&event, snapshot)),
            Route::Awaiting { token, .. } => {
                let token = *token;
                self.interests.remove(pos);
                Routed::Resolved { token, event }
            }
        }
    }
}
