// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Configuration value objects and JSON5 file parsing.
//!
//! All protocol parameters are explicit configuration passed at engine
//! construction; nothing is registered through global attributes.
//!
//! ## Timer defaults (RFC 3973)
//!
//! | Parameter | Default | Purpose |
//! |-----------|---------|---------|
//! | Hello Period | 30 s | Time between periodic Hellos |
//! | Triggered Hello Delay | 5 s | Upper bound on randomized Hello jitter |
//! | Hello Holdtime | 105 s | 3.5 x Hello Period, neighbor expiry |
//! | Propagation Delay | 500 ms | LAN Prune Delay option, default |
//! | Override Interval | 2500 ms | Join-override window on shared media |
//! | Prune Holdtime (t_limit) | 210 s | Downstream Pruned lifetime / prune rate limit |
//! | Graft Retry Period | 3 s | Graft retransmission until GraftAck |
//! | Assert Time | 180 s | Assert state lifetime |
//! | Source Lifetime | 210 s | Originator keepalive for a directly attached source |
//! | Refresh Interval | 60 s | State-Refresh generation period |
//! | RPF Check Interval | 10 s | Periodic re-resolution sweep |

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Period between Hello messages
pub const DEFAULT_HELLO_PERIOD: Duration = Duration::from_secs(30);
/// Upper bound for randomized triggered Hellos
pub const DEFAULT_TRIGGERED_HELLO_DELAY: Duration = Duration::from_secs(5);
/// Holdtime advertised in Hello (3.5 x Hello Period)
pub const DEFAULT_HELLO_HOLDTIME: Duration = Duration::from_secs(105);
/// LAN Prune Delay propagation-delay default
pub const DEFAULT_PROPAGATION_DELAY: Duration = Duration::from_millis(500);
/// Join-override window on shared media
pub const DEFAULT_OVERRIDE_INTERVAL: Duration = Duration::from_millis(2500);
/// Prune holdtime / prune rate limit (t_limit)
pub const DEFAULT_PRUNE_HOLDTIME: Duration = Duration::from_secs(210);
/// Graft retransmission period
pub const DEFAULT_GRAFT_RETRY_PERIOD: Duration = Duration::from_secs(3);
/// Assert state lifetime
pub const DEFAULT_ASSERT_TIME: Duration = Duration::from_secs(180);
/// Originator keepalive for directly attached sources
pub const DEFAULT_SOURCE_LIFETIME: Duration = Duration::from_secs(210);
/// State-Refresh generation period
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
/// Periodic RPF re-resolution sweep
pub const DEFAULT_RPF_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Per-interface PIM-DM configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PimInterfaceConfig {
    /// Period between periodic Hello messages
    pub hello_period: Duration,
    /// Holdtime advertised in Hello (neighbor expiry)
    pub hello_holdtime: Duration,
    /// Propagation delay advertised in the LAN Prune Delay option
    pub propagation_delay: Duration,
    /// Override interval advertised in the LAN Prune Delay option
    pub override_interval: Duration,
    /// Whether this router advertises State-Refresh capability
    pub state_refresh_capable: bool,
    /// Administrative multicast boundary: no group traffic or prune state
    /// crosses this interface
    pub boundary: bool,
    /// Echo a Prune when the prune-pending timer fires on a multi-access
    /// link, for flood-and-prune reliability
    pub prune_echo: bool,
}

impl Default for PimInterfaceConfig {
    fn default() -> Self {
        Self {
            hello_period: DEFAULT_HELLO_PERIOD,
            hello_holdtime: DEFAULT_HELLO_HOLDTIME,
            propagation_delay: DEFAULT_PROPAGATION_DELAY,
            override_interval: DEFAULT_OVERRIDE_INTERVAL,
            state_refresh_capable: true,
            boundary: false,
            prune_echo: true,
        }
    }
}

/// Engine-wide PIM-DM configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PimDmConfig {
    /// Upper bound for randomized triggered Hellos
    pub triggered_hello_delay: Duration,
    /// Prune holdtime sent in Prunes and used as the rate-limit window
    pub prune_holdtime: Duration,
    /// Graft retransmission period
    pub graft_retry_period: Duration,
    /// Assert state lifetime
    pub assert_time: Duration,
    /// Originator keepalive for directly attached sources
    pub source_lifetime: Duration,
    /// State-Refresh generation period
    pub refresh_interval: Duration,
    /// Periodic RPF re-resolution sweep interval
    pub rpf_check_interval: Duration,
    /// Named per-interface overrides; interfaces not listed get defaults
    pub interfaces: HashMap<String, PimInterfaceConfig>,
}

impl Default for PimDmConfig {
    fn default() -> Self {
        Self {
            triggered_hello_delay: DEFAULT_TRIGGERED_HELLO_DELAY,
            prune_holdtime: DEFAULT_PRUNE_HOLDTIME,
            graft_retry_period: DEFAULT_GRAFT_RETRY_PERIOD,
            assert_time: DEFAULT_ASSERT_TIME,
            source_lifetime: DEFAULT_SOURCE_LIFETIME,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            rpf_check_interval: DEFAULT_RPF_CHECK_INTERVAL,
            interfaces: HashMap::new(),
        }
    }
}

impl PimDmConfig {
    /// Load configuration from a JSON5 file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e.to_string()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile =
            json5::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        let config = file.into_config();
        config.validate()?;
        Ok(config)
    }

    /// Configuration for a named interface, falling back to defaults
    pub fn interface(&self, name: &str) -> PimInterfaceConfig {
        self.interfaces.get(name).cloned().unwrap_or_default()
    }

    /// Validate timer relationships
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, iface) in &self.interfaces {
            if iface.hello_period.is_zero() {
                return Err(ConfigError::InvalidTimer {
                    interface: name.clone(),
                    reason: "hello_period must be non-zero".to_string(),
                });
            }
            if iface.hello_holdtime <= iface.hello_period {
                return Err(ConfigError::InvalidTimer {
                    interface: name.clone(),
                    reason: "hello_holdtime must exceed hello_period".to_string(),
                });
            }
            // LAN Prune Delay fields are 15/16-bit milliseconds on the wire
            if iface.propagation_delay.as_millis() > 0x7fff {
                return Err(ConfigError::InvalidTimer {
                    interface: name.clone(),
                    reason: "propagation_delay exceeds the 15-bit wire field".to_string(),
                });
            }
            if iface.override_interval.as_millis() > 0xffff {
                return Err(ConfigError::InvalidTimer {
                    interface: name.clone(),
                    reason: "override_interval exceeds the 16-bit wire field".to_string(),
                });
            }
        }
        if self.refresh_interval.is_zero() || self.refresh_interval.as_secs() > u8::MAX as u64 {
            return Err(ConfigError::InvalidTimer {
                interface: "<global>".to_string(),
                reason: "refresh_interval must fit the 8-bit wire field and be non-zero"
                    .to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read {0}: {1}")]
    IoError(PathBuf, String),
    /// JSON5 syntax or shape error
    #[error("failed to parse config: {0}")]
    ParseError(String),
    /// Timer relationship violated
    #[error("invalid timer on {interface}: {reason}")]
    InvalidTimer {
        /// Interface the offending setting belongs to
        interface: String,
        /// Human-readable reason
        reason: String,
    },
    /// Address is not a valid multicast group
    #[error("not a multicast group address: {0}")]
    InvalidGroup(Ipv4Addr),
}

// File-format mirror of the config, with durations in integer units so that
// JSON5 files stay human-editable.

#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    triggered_hello_delay_secs: Option<u64>,
    #[serde(default)]
    prune_holdtime_secs: Option<u64>,
    #[serde(default)]
    graft_retry_period_secs: Option<u64>,
    #[serde(default)]
    assert_time_secs: Option<u64>,
    #[serde(default)]
    source_lifetime_secs: Option<u64>,
    #[serde(default)]
    refresh_interval_secs: Option<u64>,
    #[serde(default)]
    rpf_check_interval_secs: Option<u64>,
    #[serde(default)]
    interfaces: HashMap<String, InterfaceFile>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct InterfaceFile {
    #[serde(default)]
    hello_period_secs: Option<u64>,
    #[serde(default)]
    hello_holdtime_secs: Option<u64>,
    #[serde(default)]
    propagation_delay_ms: Option<u64>,
    #[serde(default)]
    override_interval_ms: Option<u64>,
    #[serde(default)]
    state_refresh_capable: Option<bool>,
    #[serde(default)]
    boundary: Option<bool>,
    #[serde(default)]
    prune_echo: Option<bool>,
}

impl ConfigFile {
    fn into_config(self) -> PimDmConfig {
        let defaults = PimDmConfig::default();
        let secs = Duration::from_secs;
        PimDmConfig {
            triggered_hello_delay: self
                .triggered_hello_delay_secs
                .map(secs)
                .unwrap_or(defaults.triggered_hello_delay),
            prune_holdtime: self
                .prune_holdtime_secs
                .map(secs)
                .unwrap_or(defaults.prune_holdtime),
            graft_retry_period: self
                .graft_retry_period_secs
                .map(secs)
                .unwrap_or(defaults.graft_retry_period),
            assert_time: self.assert_time_secs.map(secs).unwrap_or(defaults.assert_time),
            source_lifetime: self
                .source_lifetime_secs
                .map(secs)
                .unwrap_or(defaults.source_lifetime),
            refresh_interval: self
                .refresh_interval_secs
                .map(secs)
                .unwrap_or(defaults.refresh_interval),
            rpf_check_interval: self
                .rpf_check_interval_secs
                .map(secs)
                .unwrap_or(defaults.rpf_check_interval),
            interfaces: self
                .interfaces
                .into_iter()
                .map(|(name, f)| (name, f.into_config()))
                .collect(),
        }
    }
}

impl InterfaceFile {
    fn into_config(self) -> PimInterfaceConfig {
        let defaults = PimInterfaceConfig::default();
        PimInterfaceConfig {
            hello_period: self
                .hello_period_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.hello_period),
            hello_holdtime: self
                .hello_holdtime_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.hello_holdtime),
            propagation_delay: self
                .propagation_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.propagation_delay),
            override_interval: self
                .override_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.override_interval),
            state_refresh_capable: self
                .state_refresh_capable
                .unwrap_or(defaults.state_refresh_capable),
            boundary: self.boundary.unwrap_or(defaults.boundary),
            prune_echo: self.prune_echo.unwrap_or(defaults.prune_echo),
        }
    }
}
