use std::{collections::HashMap, fs::read_to_string};

use clap::Parser;
use serde::*;

/// How a node's identifier is established across restarts.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierPersistence {
    /// A fresh identifier is generated every startup.
    Ephemeral,
    /// The identifier is read from (and written back to) `identifier_path`.
    Persistent,
}

impl Default for IdentifierPersistence {
    fn default() -> Self {
        Self::Ephemeral
    }
}

/// The crypto strategy a session's `SecurityMediator` is bound to. Only one
/// concrete strategy is implemented; the field exists so a future strategy
/// can be selected without reshaping the config.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SecurityStrategy {
    HmacSha1,
}

impl Default for SecurityStrategy {
    fn default() -> Self {
        Self::HmacSha1
    }
}

/// A single endpoint binding: the transport protocol and the address it
/// listens on (`*` is accepted as a bind-any-interface wildcard).
#[derive(Deserialize, Debug, Clone)]
pub struct EndpointBinding {
    pub protocol: String,
    pub binding: String,
}

/// A bootstrap peer dialed once the node starts, keyed by protocol so
/// different transports can carry their own bootstrap lists.
#[derive(Deserialize, Debug, Clone)]
pub struct BootstrapEntry {
    pub protocol: String,
    pub address: String,
}

#[derive(Deserialize, Debug)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

impl Default for Log {
    fn default() -> Self {
        Self { level: LogLevel::default() }
    }
}

/// Timeouts and retry policy. All values are milliseconds, bounded to a
/// 24-hour upper limit by `Node::clamp_timeouts`.
#[derive(Deserialize, Debug, Clone)]
pub struct Timeouts {
    #[serde(default = "Timeouts::connect_ms")]
    pub connect_ms: u64,
    #[serde(default = "Timeouts::retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "Timeouts::retry_limit")]
    pub retry_limit: u32,
    #[serde(default = "Timeouts::tracker_expiry_ms")]
    pub tracker_expiry_ms: u64,
}

const MAX_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;

impl Timeouts {
    fn connect_ms() -> u64 {
        5_000
    }

    fn retry_interval_ms() -> u64 {
        2_000
    }

    fn retry_limit() -> u32 {
        3
    }

    fn tracker_expiry_ms() -> u64 {
        10_000
    }

    /// Clamp every field to the 24-hour upper bound.
    pub fn clamped(&self) -> Self {
        Self {
            connect_ms: self.connect_ms.min(MAX_TIMEOUT_MS),
            retry_interval_ms: self.retry_interval_ms.min(MAX_TIMEOUT_MS),
            retry_limit: self.retry_limit,
            tracker_expiry_ms: self.tracker_expiry_ms.min(MAX_TIMEOUT_MS),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_ms: Self::connect_ms(),
            retry_interval_ms: Self::retry_interval_ms(),
            retry_limit: Self::retry_limit(),
            tracker_expiry_ms: Self::tracker_expiry_ms(),
        }
    }
}

/// The node's descriptive identity, shown to operators and peers, distinct
/// from its routing identifier.
#[derive(Deserialize, Debug, Clone)]
pub struct NodeDescription {
    #[serde(default = "NodeDescription::name")]
    pub name: String,
    #[serde(default = "NodeDescription::description")]
    pub description: String,
}

impl NodeDescription {
    fn name() -> String {
        "brypt-node".to_string()
    }

    fn description() -> String {
        String::new()
    }
}

impl Default for NodeDescription {
    fn default() -> Self {
        Self {
            name: Self::name(),
            description: Self::description(),
        }
    }
}

/// The persisted-state record: everything the core consumes but never
/// produces. Serialization ownership lives here.
#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(default)]
    pub endpoints: Vec<EndpointBinding>,

    #[serde(default)]
    pub bootstrap: Vec<BootstrapEntry>,

    #[serde(default)]
    pub identifier_persistence: IdentifierPersistence,

    /// Path read/written when `identifier_persistence` is `Persistent`.
    #[serde(default = "Config::identifier_path")]
    pub identifier_path: String,

    #[serde(default)]
    pub security_strategy: SecurityStrategy,

    #[serde(default)]
    pub timeouts: Timeouts,

    /// Bound size of `SecurityMediator`'s per-peer replay window.
    #[serde(default = "Config::replay_window_size")]
    pub replay_window_size: usize,

    #[serde(default)]
    pub node: NodeDescription,

    #[serde(default)]
    pub log: Log,

    #[serde(default)]
    pub auth: HashMap<String, String>,
}

impl Config {
    fn identifier_path() -> String {
        "brypt-identifier.json".to_string()
    }

    fn replay_window_size() -> usize {
        256
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            bootstrap: Vec::new(),
            identifier_persistence: IdentifierPersistence::default(),
            identifier_path: Self::identifier_path(),
            security_strategy: SecurityStrategy::default(),
            timeouts: Timeouts::default(),
            replay_window_size: Self::replay_window_size(),
            node: NodeDescription::default(),
            log: Log::default(),
            auth: HashMap::new(),
        }
    }
}

#[derive(Parser)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS")
)]
struct Cli {
    /// specify the configuration file path.
    #[arg(long)]
    config: Option<String>,
}

impl Config {
    /// Load command line parameters; if a config file path is given, parse
    /// it as JSON5, otherwise fall back to defaults.
    pub fn load() -> anyhow::Result<Self> {
        let cli = Cli::parse();

        match cli.config {
            Some(path) => {
                let text = read_to_string(&path)?;
                Ok(serde_json5::from_str(&text)?)
            }
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_empty_document() {
        let config: Config = serde_json5::from_str("{}").unwrap();
        assert_eq!(config.replay_window_size, 256);
        assert_eq!(config.identifier_persistence, IdentifierPersistence::Ephemeral);
    }

    #[test]
    fn timeouts_are_clamped_to_24_hours() {
        let timeouts = Timeouts {
            connect_ms: u64::MAX,
            retry_interval_ms: u64::MAX,
            retry_limit: 5,
            tracker_expiry_ms: u64::MAX,
        };

        let clamped = timeouts.clamped();
        assert_eq!(clamped.connect_ms, MAX_TIMEOUT_MS);
        assert_eq!(clamped.retry_interval_ms, MAX_TIMEOUT_MS);
        assert_eq!(clamped.tracker_expiry_ms, MAX_TIMEOUT_MS);
    }
}
