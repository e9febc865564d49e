use std::{collections::HashMap, fs::read_to_string, net::SocketAddr, str::FromStr};

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;

use codec::message::IceServer;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Channel {
    ///
    /// Durable retention hint per channel, in milliseconds. Events older
    /// than this may be garbage collected; a channel with no sessions for
    /// this long is torn down.
    ///
    #[serde(default = "Channel::default_age_ms")]
    pub default_age_ms: u64,
    ///
    /// Ephemeral cache entries per channel before the oldest entry is
    /// dropped on overflow.
    ///
    #[serde(default = "Channel::max_cache_size")]
    pub max_cache_size: usize,
    ///
    /// Ephemeral event retention, in milliseconds.
    ///
    #[serde(default = "Channel::ephemeral_ttl_ms")]
    pub ephemeral_ttl_ms: u64,
}

impl Channel {
    fn default_age_ms() -> u64 {
        86_400_000
    }

    fn max_cache_size() -> usize {
        1_024
    }

    fn ephemeral_ttl_ms() -> u64 {
        30_000
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self {
            default_age_ms: Self::default_age_ms(),
            max_cache_size: Self::max_cache_size(),
            ephemeral_ttl_ms: Self::ephemeral_ttl_ms(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Session {
    ///
    /// A session with no send/receive/status call for this long is
    /// implicitly disconnected by the reaper.
    ///
    #[serde(default = "Session::idle_ttl_ms")]
    pub idle_ttl_ms: u64,
}

impl Session {
    fn idle_ttl_ms() -> u64 {
        90_000
    }
}

impl Default for Session {
    fn default() -> Self {
        Self {
            idle_ttl_ms: Self::idle_ttl_ms(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Receive {
    ///
    /// Durable events returned per receive when the caller names no
    /// limit.
    ///
    #[serde(default = "Receive::default_limit")]
    pub default_limit: usize,
    ///
    /// Hard cap on events per receive regardless of the caller's limit.
    ///
    #[serde(default = "Receive::max_limit")]
    pub max_limit: usize,
    ///
    /// Long-poll wait budget, in milliseconds.
    ///
    #[serde(default = "Receive::long_poll_ms")]
    pub long_poll_ms: u64,
}

impl Receive {
    fn default_limit() -> usize {
        50
    }

    fn max_limit() -> usize {
        500
    }

    fn long_poll_ms() -> u64 {
        40_000
    }
}

impl Default for Receive {
    fn default() -> Self {
        Self {
            default_limit: Self::default_limit(),
            max_limit: Self::max_limit(),
            long_poll_ms: Self::long_poll_ms(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Api {
    ///
    /// http server listen
    ///
    /// The address the JSON api binds to. Every broker operation and the
    /// admin probes are served here.
    ///
    #[serde(default = "Api::bind")]
    pub listen: SocketAddr,
}

impl Api {
    fn bind() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 3000))
    }
}

impl Default for Api {
    fn default() -> Self {
        Self { listen: Self::bind() }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
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

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

///
/// Grant behind one developer api key.
///
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct KeyGrant {
    ///
    /// Stable identity mixed into private-scope channel derivation. Keys
    /// can rotate without losing their channels as long as the id stays.
    ///
    pub key_id: String,
    #[serde(default = "KeyGrant::max_channels")]
    pub max_channels: usize,
}

impl KeyGrant {
    fn max_channels() -> usize {
        64
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Auth {
    ///
    /// static developer keys
    ///
    /// Maps a devApiKey to its grant. This is the only authentication
    /// source of the broker; a key missing here is rejected outright.
    ///
    #[serde(default)]
    pub keys: HashMap<String, KeyGrant>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub channel: Channel,
    #[serde(default)]
    pub session: Session,
    #[serde(default)]
    pub receive: Receive,
    #[serde(default)]
    pub api: Api,
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub auth: Auth,
    ///
    /// Handed to connecting agents verbatim; entries carrying credentials
    /// are treated as relay (TURN) servers and only returned to agents
    /// that enabled relay support.
    ///
    #[serde(default, rename = "ice-servers")]
    pub ice_servers: Vec<IceServer>,
}

impl Config {
    pub fn limits(&self) -> service::Limits {
        service::Limits {
            default_receive_limit: self.receive.default_limit,
            max_receive_limit: self.receive.max_limit,
            long_poll_ms: self.receive.long_poll_ms,
            ephemeral_ttl_ms: self.channel.ephemeral_ttl_ms,
            max_cache_size: self.channel.max_cache_size,
            channel_default_age_ms: self.channel.default_age_ms,
            session_idle_ttl_ms: self.session.idle_ttl_ms,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: courier-server --config /etc/courier/config.toml
    ///
    #[arg(long, short)]
    config: Option<String>,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    /// If no configuration file path is given the built-in defaults are
    /// used, which bind the api to localhost and authorize no keys.
    ///
    pub fn load() -> Result<Self> {
        Ok(match Cli::parse().config {
            Some(path) => toml::from_str::<Self>(&read_to_string(&path)?)?,
            None => Self::default(),
        })
    }
}
