//! # tether-core
//!
//! Asynchronous AT/QMI command-response orchestration engine.
//!
//! A command is queued on a serial or message channel, matched against one
//! or more possible response shapes, retried on known transient conditions
//! and composed into multi-step procedures that are cancellable and safe to
//! tear down mid-flight.
//!
//! ## Modules
//!
//! - [`channel`]: transport channel trait, requests, replies, events
//! - [`at`]: AT line-protocol channel over any byte stream
//! - [`urc`]: declarative unsolicited result code table
//! - [`tables`]: injected device error-code table
//! - [`classify`]: response classifier (expectations → payload or error)
//! - [`step`]: command step executor with single transient retry
//! - [`sequence`]: procedure state machines and the orchestrator
//! - [`correlator`]: unsolicited event interests
//! - [`pump`]: routes the unsolicited stream through the correlator
//! - [`probe`]: per-session feature support cache
//! - [`state`]: state snapshot and change notifications
//! - [`session`]: per-device session task and handle
//! - [`plugin`]: vendor plugin seam
//! - [`op`]: operation vocabulary and typed values
//! - [`config`]: TOML configuration
//! - [`error`]: error taxonomy

pub mod at;
pub mod channel;
pub mod classify;
pub mod config;
pub mod correlator;
pub mod error;
pub mod op;
pub mod plugin;
pub mod probe;
pub mod pump;
pub mod sequence;
pub mod session;
pub mod state;
pub mod step;
pub mod tables;
pub mod urc;

pub use channel::{Channel, ChannelRole, Event, Ports, Reply, Request};
pub use config::TetherConfig;
pub use error::{ErrorKind, OpError, StepError, TransportError};
pub use op::{Operation, Value};
pub use plugin::{DeviceIdentity, Plugin};
pub use sequence::{Action, Input, Procedure, StepContext};
pub use session::{Session, SessionHandle};
pub use state::{Field, SessionId, StateChange};
pub use step::CommandStep;
