//! # tether-sim
//!
//! Test doubles for the tether engine: a [`ScriptedChannel`] that answers
//! from a queue of expectations and records every dispatch, and a
//! byte-level [`SimModem`] that speaks the AT line protocol over an
//! in-memory pipe.

pub mod modem;
pub mod scripted;
pub mod test_util;

pub use modem::{ModemProfile, SimModem};
pub use scripted::{Script, ScriptedChannel};
