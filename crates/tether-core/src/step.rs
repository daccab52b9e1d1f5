//! # Command Step Executor
//!
//! Issues one [`CommandStep`] on a channel and classifies the reply.
//!
//! A step is built immediately before dispatch and consumed by
//! [`Executor::execute`]; it is never reused. The executor owns the only
//! retry the engine performs below the sequence layer: a step that opted in
//! is redispatched once when its transport failure class is on the
//! configured transient allow-list. Device removal is never redispatched.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::channel::{ChannelRole, Message, Ports, Request};
use crate::classify::{Expect, Parser, Payload, classify};
use crate::config::{ChannelConfig, RetryConfig};
use crate::error::{FailureClass, StepError, TransportError};
use crate::tables::ErrorTable;

/// One command to issue, with its expectation and policy.
#[derive(Debug, Clone)]
pub struct CommandStep {
    /// Short name used in logs and in `RetriesExhausted` errors.
    pub label: &'static str,
    pub request: Request,
    pub expect: Expect,
    /// `None` uses the configured default command timeout.
    pub timeout: Option<Duration>,
    /// 0 or 1.
    pub retry_budget: u8,
    pub role: ChannelRole,
    pub parse: Option<Parser>,
}

impl CommandStep {
    /// An AT command expecting plain `OK`.
    pub fn at(label: &'static str, cmd: impl Into<String>) -> Self {
        Self::new(label, Request::At(cmd.into()), Expect::Ok)
    }

    /// A message request expecting a successful message reply.
    pub fn message(label: &'static str, message: Message) -> Self {
        Self::new(label, Request::Message(message), Expect::Message)
    }

    fn new(label: &'static str, request: Request, expect: Expect) -> Self {
        Self {
            label,
            request,
            expect,
            timeout: None,
            retry_budget: 0,
            role: ChannelRole::Primary,
            parse: None,
        }
    }

    pub fn expect(mut self, expect: Expect) -> Self {
        self.expect = expect;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Allow one redispatch on a transient transport failure.
    pub fn retry_once(mut self) -> Self {
        self.retry_budget = 1;
        self
    }

    pub fn on(mut self, role: ChannelRole) -> Self {
        self.role = role;
        self
    }

    pub fn parse(mut self, parser: Parser) -> Self {
        self.parse = Some(parser);
        self
    }
}

/// Which transport failures may be redispatched, and the default timeout.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    transient: Vec<FailureClass>,
    max_budget: u8,
    command_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(retry: &RetryConfig, channel: &ChannelConfig) -> Self {
        Self {
            transient: retry.transient.clone(),
            max_budget: retry.step_retry_budget.min(1),
            command_timeout: channel.command_timeout,
        }
    }

    pub fn is_transient(&self, err: &TransportError) -> bool {
        let class = err.class();
        class != FailureClass::DeviceRemoved && self.transient.contains(&class)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default(), &ChannelConfig::default())
    }
}

/// Dispatches steps and classifies replies through the injected error table.
#[derive(Clone)]
pub struct Executor {
    policy: RetryPolicy,
    errors: Arc<ErrorTable>,
}

impl Executor {
    pub fn new(policy: RetryPolicy, errors: Arc<ErrorTable>) -> Self {
        Self { policy, errors }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn execute(&self, ports: &Ports, step: CommandStep) -> Result<Payload, StepError> {
        let CommandStep {
            label,
            request,
            expect,
            timeout,
            retry_budget,
            role,
            parse,
        } = step;
        let timeout = timeout.unwrap_or(self.policy.command_timeout);
        let mut budget = retry_budget.min(self.policy.max_budget);
        let channel = ports.get(role);

        let reply = loop {
            debug!(step = label, cmd = %request, ?timeout, "dispatch");
            match channel.send(request.clone(), timeout).await {
                Ok(reply) => break reply,
                Err(e) if budget > 0 && self.policy.is_transient(&e) => {
                    budget -= 1;
                    warn!(step = label, error = %e, "transient failure, redispatching");
                }
                Err(e) => {
                    debug!(step = label, error = %e, "transport failure");
                    return Err(e.into());
                }
            }
        };

        let payload = classify(reply, &expect, &self.errors)?;
        debug!(step = label, "classified");
        match parse {
            Some(parser) => Ok(parser(payload)?),
            None => Ok(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{AtReply, Channel, FinalResult, Reply};
    use crate::error::{ClassifyError, ProtocolError};
    use crate::op::Value;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned outcomes and counts sends.
    struct Canned {
        outcomes: Mutex<VecDeque<Result<Reply, TransportError>>>,
        sent: Mutex<Vec<String>>,
    }

    impl Canned {
        fn new(outcomes: Vec<Result<Reply, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sends(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Channel for Canned {
        async fn send(&self, request: Request, _timeout: Duration) -> Result<Reply, TransportError> {
            self.sent.lock().unwrap().push(request.to_string());
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(TransportError::DeviceRemoved))
        }
    }

    fn executor() -> Executor {
        Executor::new(RetryPolicy::default(), Arc::new(ErrorTable::standard()))
    }

    fn timeout() -> TransportError {
        TransportError::Timeout(Duration::from_secs(3))
    }

    // ─── Dispatch & Classify ────────────────────────────────────────────

    #[tokio::test]
    async fn prefixed_value_is_extracted() {
        let ch = Canned::new(vec![Ok(Reply::At(AtReply::ok_with(["+CGMM: \"E3372\""])))]);
        let ports = Ports::new(ch.clone());
        let step = CommandStep::at("model", "AT+CGMM").expect(Expect::Prefixed("+CGMM:"));
        let r = executor().execute(&ports, step).await;
        assert_eq!(r, Ok(Payload::Text("E3372".into())));
        assert_eq!(ch.sent.lock().unwrap().as_slice(), ["AT+CGMM"]);
    }

    #[tokio::test]
    async fn parser_runs_on_success() {
        fn upper(p: Payload) -> Result<Payload, ClassifyError> {
            let s = p.text().ok_or_else(|| ClassifyError::Parse("no text".into()))?;
            Ok(Payload::Value(Value::Text(s.to_uppercase())))
        }
        let ch = Canned::new(vec![Ok(Reply::At(AtReply::ok_with(["huawei"])))]);
        let step = CommandStep::at("mfr", "AT+GMI").expect(Expect::Text).parse(upper);
        let r = executor().execute(&Ports::new(ch), step).await;
        assert_eq!(r, Ok(Payload::Value(Value::Text("HUAWEI".into()))));
    }

    #[tokio::test]
    async fn device_error_is_not_retried() {
        let ch = Canned::new(vec![
            Ok(Reply::At(AtReply::failed(FinalResult::CmeError(4)))),
            Ok(Reply::At(AtReply::ok())),
        ]);
        let step = CommandStep::at("x", "AT+X").retry_once();
        let r = executor().execute(&Ports::new(ch.clone()), step).await;
        assert_eq!(r.unwrap_err().protocol(), Some(&ProtocolError::NotSupported));
        assert_eq!(ch.sends(), 1);
    }

    // ─── Transient Retry ────────────────────────────────────────────────

    #[tokio::test]
    async fn timeout_redispatched_once_when_opted_in() {
        let ch = Canned::new(vec![Err(timeout()), Ok(Reply::At(AtReply::ok()))]);
        let step = CommandStep::at("x", "AT+X").retry_once();
        let r = executor().execute(&Ports::new(ch.clone()), step).await;
        assert_eq!(r, Ok(Payload::None));
        assert_eq!(ch.sends(), 2);
    }

    #[tokio::test]
    async fn second_timeout_surfaces() {
        let ch = Canned::new(vec![Err(timeout()), Err(timeout()), Ok(Reply::At(AtReply::ok()))]);
        let step = CommandStep::at("x", "AT+X").retry_once();
        let r = executor().execute(&Ports::new(ch.clone()), step).await;
        assert_eq!(r, Err(StepError::Transport(timeout())));
        assert_eq!(ch.sends(), 2);
    }

    #[tokio::test]
    async fn no_budget_no_retry() {
        let ch = Canned::new(vec![Err(timeout()), Ok(Reply::At(AtReply::ok()))]);
        let r = executor()
            .execute(&Ports::new(ch.clone()), CommandStep::at("x", "AT+X"))
            .await;
        assert!(r.is_err());
        assert_eq!(ch.sends(), 1);
    }

    #[tokio::test]
    async fn device_removed_never_redispatched() {
        let ch = Canned::new(vec![Err(TransportError::DeviceRemoved), Ok(Reply::At(AtReply::ok()))]);
        let step = CommandStep::at("x", "AT+X").retry_once();
        let r = executor().execute(&Ports::new(ch.clone()), step).await;
        assert_eq!(r, Err(StepError::Transport(TransportError::DeviceRemoved)));
        assert_eq!(ch.sends(), 1);
    }

    #[tokio::test]
    async fn class_off_allow_list_not_retried() {
        let ch = Canned::new(vec![
            Err(TransportError::WriteFailure("eio".into())),
            Ok(Reply::At(AtReply::ok())),
        ]);
        let step = CommandStep::at("x", "AT+X").retry_once();
        let r = executor().execute(&Ports::new(ch.clone()), step).await;
        assert!(matches!(r, Err(StepError::Transport(TransportError::WriteFailure(_)))));
        assert_eq!(ch.sends(), 1);
    }

    #[tokio::test]
    async fn configured_zero_budget_overrides_step() {
        let retry = RetryConfig {
            step_retry_budget: 0,
            ..RetryConfig::default()
        };
        let exec = Executor::new(
            RetryPolicy::new(&retry, &ChannelConfig::default()),
            Arc::new(ErrorTable::standard()),
        );
        let ch = Canned::new(vec![Err(timeout()), Ok(Reply::At(AtReply::ok()))]);
        let r = exec
            .execute(&Ports::new(ch.clone()), CommandStep::at("x", "AT+X").retry_once())
            .await;
        assert!(r.is_err());
        assert_eq!(ch.sends(), 1);
    }
}
