//! Daemon configuration.
//!
//! Retry bounds, delays and timeouts are empirically tuned per hardware
//! quirk, so none of them are hard-coded in procedures: everything is read
//! from here. Parsed from TOML into all-optional `*Input` structs, then
//! resolved into validated config with defaults filled in.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, FailureClass};

pub const CONFIG_VERSION: u32 = 1;

// ── Input (as written in TOML) ──────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TetherConfigInput {
    pub version: u32,
    pub channel: ChannelConfigInput,
    pub retry: RetryConfigInput,
    pub connect: ConnectConfigInput,
    pub disconnect: DisconnectConfigInput,
    pub location: LocationConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChannelConfigInput {
    pub command_timeout_ms: Option<u64>,
    pub long_timeout_ms: Option<u64>,
    pub urc_buffer: Option<usize>,
    pub baud_rate: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RetryConfigInput {
    pub transient: Option<Vec<FailureClass>>,
    pub step_retry_budget: Option<u8>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConnectConfigInput {
    pub cid: Option<u32>,
    pub verify_attempts: Option<u32>,
    pub verify_interval_ms: Option<u64>,
    pub busy_retries: Option<u32>,
    pub busy_delay_ms: Option<u64>,
    pub connect_wait_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DisconnectConfigInput {
    pub verify_attempts: Option<u32>,
    pub verify_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LocationConfigInput {
    pub start_timeout_ms: Option<u64>,
    pub stop_timeout_ms: Option<u64>,
}

// ── Resolved ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Default per-command reply timeout.
    pub command_timeout: Duration,
    /// Timeout for commands known to block (context activation).
    pub long_timeout: Duration,
    /// Capacity of the unsolicited event queue.
    pub urc_buffer: usize,
    /// Line speed of a serial AT port.
    pub baud_rate: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(3),
            long_timeout: Duration::from_secs(20),
            urc_buffer: 64,
            baud_rate: 115_200,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Transport failure classes a step may be redispatched for.
    pub transient: Vec<FailureClass>,
    /// Redispatch budget granted to steps that opt in (0 or 1).
    pub step_retry_budget: u8,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            transient: vec![FailureClass::Timeout],
            step_retry_budget: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Context identifier used for dialing.
    pub cid: u32,
    /// Bounded status polls after activation.
    pub verify_attempts: u32,
    pub verify_interval: Duration,
    /// Retries of a configuration command answered with a busy code.
    pub busy_retries: u32,
    pub busy_delay: Duration,
    /// How long to wait for an unsolicited connect confirmation.
    pub connect_wait: Duration,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            cid: 1,
            verify_attempts: 5,
            verify_interval: Duration::from_secs(1),
            busy_retries: 3,
            busy_delay: Duration::from_secs(1),
            connect_wait: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DisconnectConfig {
    pub verify_attempts: u32,
    pub verify_interval: Duration,
}

impl Default for DisconnectConfig {
    fn default() -> Self {
        Self {
            verify_attempts: 3,
            verify_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocationConfig {
    pub start_timeout: Duration,
    /// Bound on waiting for the "fully stopped" notification.
    pub stop_timeout: Duration,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TetherConfig {
    pub version: u32,
    pub channel: ChannelConfig,
    pub retry: RetryConfig,
    pub connect: ConnectConfig,
    pub disconnect: DisconnectConfig,
    pub location: LocationConfig,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            channel: ChannelConfig::default(),
            retry: RetryConfig::default(),
            connect: ConnectConfig::default(),
            disconnect: DisconnectConfig::default(),
            location: LocationConfig::default(),
        }
    }
}

fn ms(v: Option<u64>, default: Duration) -> Duration {
    v.map(Duration::from_millis).unwrap_or(default)
}

fn at_least_one(field: &'static str, v: Option<u32>, default: u32) -> Result<u32, ConfigError> {
    match v {
        Some(0) => Err(ConfigError::Invalid {
            field,
            reason: "must be at least 1".into(),
        }),
        Some(n) => Ok(n),
        None => Ok(default),
    }
}

impl TetherConfigInput {
    pub fn resolve(self) -> Result<TetherConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::Version(version));
        }

        let d = TetherConfig::default();

        let channel = ChannelConfig {
            command_timeout: ms(self.channel.command_timeout_ms, d.channel.command_timeout),
            long_timeout: ms(self.channel.long_timeout_ms, d.channel.long_timeout),
            urc_buffer: self.channel.urc_buffer.unwrap_or(d.channel.urc_buffer).max(8),
            baud_rate: at_least_one("channel.baud_rate", self.channel.baud_rate, d.channel.baud_rate)?,
        };
        if channel.command_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "channel.command_timeout_ms",
                reason: "must be non-zero".into(),
            });
        }

        let transient = self.retry.transient.unwrap_or(d.retry.transient);
        if transient.contains(&FailureClass::DeviceRemoved) {
            return Err(ConfigError::Invalid {
                field: "retry.transient",
                reason: "device removal is never transient".into(),
            });
        }
        let step_retry_budget = self.retry.step_retry_budget.unwrap_or(d.retry.step_retry_budget);
        if step_retry_budget > 1 {
            return Err(ConfigError::Invalid {
                field: "retry.step_retry_budget",
                reason: "a step is redispatched at most once".into(),
            });
        }

        let connect = ConnectConfig {
            cid: at_least_one("connect.cid", self.connect.cid, d.connect.cid)?,
            verify_attempts: at_least_one(
                "connect.verify_attempts",
                self.connect.verify_attempts,
                d.connect.verify_attempts,
            )?,
            verify_interval: ms(self.connect.verify_interval_ms, d.connect.verify_interval),
            busy_retries: self.connect.busy_retries.unwrap_or(d.connect.busy_retries),
            busy_delay: ms(self.connect.busy_delay_ms, d.connect.busy_delay),
            connect_wait: ms(self.connect.connect_wait_ms, d.connect.connect_wait),
        };

        let disconnect = DisconnectConfig {
            verify_attempts: at_least_one(
                "disconnect.verify_attempts",
                self.disconnect.verify_attempts,
                d.disconnect.verify_attempts,
            )?,
            verify_interval: ms(self.disconnect.verify_interval_ms, d.disconnect.verify_interval),
        };

        let location = LocationConfig {
            start_timeout: ms(self.location.start_timeout_ms, d.location.start_timeout),
            stop_timeout: ms(self.location.stop_timeout_ms, d.location.stop_timeout),
        };

        Ok(TetherConfig {
            version,
            channel,
            retry: RetryConfig {
                transient,
                step_retry_budget,
            },
            connect,
            disconnect,
            location,
        })
    }
}

impl TetherConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(TetherConfig::default());
        }
        let parsed: TetherConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_default() {
        let cfg = TetherConfig::from_toml_str("  ").unwrap();
        assert_eq!(cfg.version, CONFIG_VERSION);
        assert_eq!(cfg.connect.verify_attempts, 5);
        assert_eq!(cfg.channel.baud_rate, 115_200);
        assert_eq!(cfg.retry.transient, vec![FailureClass::Timeout]);
    }

    #[test]
    fn parse_toml_config_basic() {
        let toml = r#"
            version = 1

            [channel]
            command_timeout_ms = 5000
            baud_rate = 921600

            [retry]
            transient = ["timeout", "write_failure"]
            step_retry_budget = 0

            [connect]
            cid = 3
            verify_attempts = 10
            verify_interval_ms = 250
            busy_retries = 5

            [location]
            stop_timeout_ms = 2000
        "#;
        let cfg = TetherConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.channel.command_timeout, Duration::from_secs(5));
        assert_eq!(cfg.channel.long_timeout, Duration::from_secs(20));
        assert_eq!(cfg.channel.baud_rate, 921_600);
        assert_eq!(
            cfg.retry.transient,
            vec![FailureClass::Timeout, FailureClass::WriteFailure]
        );
        assert_eq!(cfg.retry.step_retry_budget, 0);
        assert_eq!(cfg.connect.cid, 3);
        assert_eq!(cfg.connect.verify_attempts, 10);
        assert_eq!(cfg.connect.verify_interval, Duration::from_millis(250));
        assert_eq!(cfg.connect.busy_retries, 5);
        assert_eq!(cfg.connect.busy_delay, Duration::from_secs(1));
        assert_eq!(cfg.location.stop_timeout, Duration::from_secs(2));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            TetherConfig::from_toml_str("version = 2"),
            Err(ConfigError::Version(2))
        ));
        assert!(matches!(
            TetherConfig::from_toml_str("[retry]\ntransient = [\"device_removed\"]"),
            Err(ConfigError::Invalid { field: "retry.transient", .. })
        ));
        assert!(matches!(
            TetherConfig::from_toml_str("[retry]\nstep_retry_budget = 2"),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            TetherConfig::from_toml_str("[connect]\nverify_attempts = 0"),
            Err(ConfigError::Invalid { field: "connect.verify_attempts", .. })
        ));
        assert!(matches!(
            TetherConfig::from_toml_str("[channel]\nbaud_rate = 0"),
            Err(ConfigError::Invalid { field: "channel.baud_rate", .. })
        ));
        assert!(matches!(
            TetherConfig::from_toml_str("[channel\n"),
            Err(ConfigError::Toml(_))
        ));
    }
}
