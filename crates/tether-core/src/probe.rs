//! Per-session memoized feature support.
//!
//! Each entry starts `Unknown` and moves at most once to a terminal value.
//! `Unknown` means "probe now", never a default: a transport failure during
//! the probe leaves the entry `Unknown` so the next operation probes again.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use crate::error::StepError;

/// A named firmware capability, e.g. `"syscfgex"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Feature(pub &'static str);

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Support {
    #[default]
    Unknown,
    Supported,
    Unsupported,
}

impl Support {
    pub fn is_known(self) -> bool {
        self != Support::Unknown
    }
}

#[derive(Debug, Default)]
pub struct FeatureCache {
    entries: HashMap<Feature, Support>,
}

impl FeatureCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, feature: Feature) -> Support {
        self.entries.get(&feature).copied().unwrap_or_default()
    }

    /// Record a terminal value. Returns the value now in effect, which is
    /// the earlier one if the entry was already terminal.
    pub fn record(&mut self, feature: Feature, support: Support) -> Support {
        let entry = self.entries.entry(feature).or_default();
        if !entry.is_known() {
            *entry = support;
        }
        *entry
    }

    /// Resolve a feature from the outcome of its probe command.
    ///
    /// Success marks it supported, any device answer (error code,
    /// unparseable or unexpected reply) unsupported; transport failures
    /// resolve nothing.
    pub fn resolve<T>(&mut self, feature: Feature, outcome: &Result<T, StepError>) -> Support {
        match outcome {
            Ok(_) => self.record(feature, Support::Supported),
            Err(e) if e.is_device_answer() => self.record(feature, Support::Unsupported),
            Err(_) => self.get(feature),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.values().filter(|s| s.is_known()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
