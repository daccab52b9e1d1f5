//! Scripted [`Channel`]: replies from a queue of expectations and records
//! every dispatch.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tether_core::channel::{AtReply, Channel, Event, FinalResult, MessageReply, Reply, Request};
use tether_core::error::TransportError;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

enum Outcome {
    Reply(Reply),
    Fail(TransportError),
    /// Never answer: the request times out.
    Hang,
}

struct Expectation {
    /// Request text (`Display`) must start with this.
    prefix: String,
    delay: Duration,
    outcome: Outcome,
    then: Vec<Event>,
}

/// Ordered expectations, consumed one per dispatch.
#[derive(Default)]
pub struct Script {
    steps: VecDeque<Expectation>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, prefix: impl Into<String>, outcome: Outcome) -> Self {
        self.steps.push_back(Expectation {
            prefix: prefix.into(),
            delay: Duration::ZERO,
            outcome,
            then: Vec::new(),
        });
        self
    }

    /// Answer `cmd` with `OK` and the given information lines.
    pub fn ok<I, S>(self, cmd: &str, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(cmd, Outcome::Reply(Reply::At(AtReply::ok_with(lines))))
    }

    /// Answer `cmd` with a final error result.
    pub fn error(self, cmd: &str, result: FinalResult) -> Self {
        self.push(cmd, Outcome::Reply(Reply::At(AtReply::failed(result))))
    }

    pub fn message(self, reply: MessageReply) -> Self {
        let prefix = format!("svc 0x{:02x} msg 0x{:04x}", reply.service, reply.id);
        self.push(prefix, Outcome::Reply(Reply::Message(reply)))
    }

    pub fn fail(self, cmd: &str, err: TransportError) -> Self {
        self.push(cmd, Outcome::Fail(err))
    }

    pub fn hang(self, cmd: &str) -> Self {
        self.push(cmd, Outcome::Hang)
    }

    /// Delay the previous answer.
    pub fn after(mut self, delay: Duration) -> Self {
        if let Some(last) = self.steps.back_mut() {
            last.delay = delay;
        }
        self
    }

    /// Emit `event` on the unsolicited stream right after the previous answer.
    pub fn then(mut self, event: Event) -> Self {
        if let Some(last) = self.steps.back_mut() {
            last.then.push(event);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// One recorded dispatch.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub request: String,
    pub at: Instant,
}

pub struct ScriptedChannel {
    script: Mutex<Script>,
    log: Mutex<Vec<Dispatch>>,
    unscripted: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    events: Mutex<Option<mpsc::Sender<Event>>>,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedChannel {
    /// The channel and its unsolicited stream.
    pub fn new(script: Script) -> (Arc<Self>, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(64);
        let channel = Arc::new(Self {
            script: Mutex::new(script),
            log: Mutex::new(Vec::new()),
            unscripted: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            events: Mutex::new(Some(tx)),
        });
        (channel, rx)
    }

    /// Push an unsolicited event now.
    pub fn inject(&self, event: Event) -> bool {
        match lock(&self.events).as_ref() {
            Some(tx) => tx.try_send(event).is_ok(),
            None => false,
        }
    }

    /// Simulate unplugging: the unsolicited stream closes and every later
    /// request fails with device removed.
    pub fn unplug(&self) {
        lock(&self.events).take();
    }

    pub fn dispatched(&self) -> Vec<String> {
        lock(&self.log).iter().map(|d| d.request.clone()).collect()
    }

    pub fn dispatches(&self) -> Vec<Dispatch> {
        lock(&self.log).clone()
    }

    /// Number of dispatches whose request starts with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        lock(&self.log)
            .iter()
            .filter(|d| d.request.starts_with(prefix))
            .count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Requests that arrived with no matching expectation.
    pub fn unscripted(&self) -> Vec<String> {
        lock(&self.unscripted).clone()
    }

    /// Expectations not yet consumed.
    pub fn remaining(&self) -> usize {
        lock(&self.script).len()
    }
}

#[async_trait]
impl Channel for ScriptedChannel {
    async fn send(&self, request: Request, timeout: Duration) -> Result<Reply, TransportError> {
        let text = request.to_string();
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);
        lock(&self.log).push(Dispatch {
            request: text.clone(),
            at: Instant::now(),
        });

        if lock(&self.events).is_none() {
            return Err(TransportError::DeviceRemoved);
        }

        let next = {
            let mut script = lock(&self.script);
            match script.steps.front() {
                Some(e) if text.starts_with(&e.prefix) => script.steps.pop_front(),
                _ => None,
            }
        };
        let Some(step) = next else {
            warn!(request = %text, "unscripted request");
            lock(&self.unscripted).push(text.clone());
            return Err(TransportError::WriteFailure(format!("unscripted request {text}")));
        };

        if !step.delay.is_zero() {
            tokio::time::sleep(step.delay).await;
        }
        let result = match step.outcome {
            Outcome::Reply(reply) => Ok(reply),
            Outcome::Fail(err) => Err(err),
            Outcome::Hang => {
                tokio::time::sleep(timeout).await;
                Err(TransportError::Timeout(timeout))
            }
        };
        for event in step.then {
            debug!(?event, "scripted event");
            self.inject(event);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replies_in_order_and_records() {
        let (ch, _events) = ScriptedChannel::new(
            Script::new()
                .ok("AT+CGMM", ["EM7455"])
                .error("AT+CGMR", FinalResult::CmeError(4)),
        );
        let t = Duration::from_secs(1);
        assert!(ch.send(Request::at("AT+CGMM"), t).await.is_ok());
        assert!(ch.send(Request::at("AT+CGMR"), t).await.is_ok());
        assert!(ch.send(Request::at("AT+CSQ"), t).await.is_err());
        assert_eq!(ch.dispatched(), vec!["AT+CGMM", "AT+CGMR", "AT+CSQ"]);
        assert_eq!(ch.unscripted(), vec!["AT+CSQ"]);
        assert_eq!(ch.max_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hang_times_out() {
        let (ch, _events) = ScriptedChannel::new(Script::new().hang("AT"));
        let r = ch.send(Request::at("AT"), Duration::from_secs(3)).await;
        assert!(matches!(r, Err(TransportError::Timeout(d)) if d == Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn unplug_closes_the_stream() {
        let (ch, mut events) = ScriptedChannel::new(Script::new());
        ch.unplug();
        assert!(events.recv().await.is_none());
        assert!(matches!(
            ch.send(Request::at("AT"), Duration::from_secs(1)).await,
            Err(TransportError::DeviceRemoved)
        ));
    }
}
