//! Connection and pool configuration.
//!
//! Both structs are built once per instance and never mutated afterwards.
//! They deserialize from TOML with every key optional; durations are given in
//! milliseconds.
//!
//! ```toml
//! hosts = ["10.0.0.1", "10.0.0.2:9161"]
//! keyspace = "metrics"
//! timeout = 1500
//! consistency_level = "LOCAL_QUORUM"
//! ```
use std::{fmt, path::Path, str::FromStr, time::Duration};

use serde::{Deserialize, Deserializer};

use crate::{Error, protocol::ConsistencyLevel};

pub const DEFAULT_PORT: u16 = 9160;

/// A store node, identified as `name:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Host {
    pub name: String,
    pub port: u16,
}

impl Host {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
        }
    }

    /// Parses `name` or `name:port`; a missing port falls back to `default_port`.
    pub fn parse(s: &str, default_port: u16) -> Result<Self, Error> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::Config("empty host".into()));
        }

        let split = match s.strip_prefix('[') {
            // [v6]:port
            Some(rest) => rest
                .split_once(']')
                .map(|(name, tail)| (name, tail.strip_prefix(':'))),
            None => match s.rsplit_once(':') {
                Some((name, port)) if !name.contains(':') => Some((name, Some(port))),
                _ => None,
            },
        };

        match split {
            Some((name, Some(port))) => {
                let port = port
                    .parse()
                    .map_err(|_| Error::Config(format!("invalid port in host '{s}'")))?;
                Ok(Host::new(name, port))
            }
            Some((name, None)) => Ok(Host::new(name, default_port)),
            None => Ok(Host::new(s, default_port)),
        }
    }
}

impl FromStr for Host {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Host::parse(s, DEFAULT_PORT)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.contains(':') {
            write!(f, "[{}]:{}", self.name, self.port)
        } else {
            write!(f, "{}:{}", self.name, self.port)
        }
    }
}

/// Settings for a single [`Connection`](crate::Connection).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    /// Connect deadline, covering dial, authentication and version negotiation.
    #[serde(with = "millis")]
    pub timeout: Duration,
    #[serde(with = "millis")]
    pub ping_interval: Duration,
    #[serde(with = "millis")]
    pub ping_timeout: Duration,
    /// Lifetime after which the connection replaces its session.
    #[serde(with = "millis")]
    pub ttl: Duration,
    #[serde(with = "opt_millis")]
    pub request_timeout: Option<Duration>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub keyspace: Option<String>,
    pub cql_version: Option<String>,
    pub consistency_level: ConsistencyLevel,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: DEFAULT_PORT,
            timeout: Duration::from_millis(3_000),
            ping_interval: Duration::from_millis(30_000),
            ping_timeout: Duration::from_millis(7_500),
            ttl: Duration::from_secs(20 * 60),
            request_timeout: None,
            user: None,
            password: None,
            keyspace: None,
            cql_version: Some("3.0.0".into()),
            consistency_level: ConsistencyLevel::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn for_host(host: &Host) -> Self {
        Self {
            host: host.name.clone(),
            port: host.port,
            ..Self::default()
        }
    }

    pub fn host(&self) -> Result<Host, Error> {
        Host::parse(&self.host, self.port)
    }

    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.user.as_deref(), self.password.as_deref()) {
            (None, None) => None,
            (user, password) => Some((user.unwrap_or_default(), password.unwrap_or_default())),
        }
    }
}

/// Settings for a [`Pool`](crate::Pool). Connection-level keys sit at the
/// top level next to the pool keys and apply to every pooled connection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Nodes to dial; when empty, the connection-level `host` is used alone.
    pub hosts: Vec<String>,
    /// Connections opened per host.
    pub host_pool_size: usize,
    #[serde(with = "millis")]
    pub monitor_interval: Duration,
    /// Upper bound of the random extra lifetime given to each connection, so
    /// that connections opened together do not all reconnect together.
    #[serde(with = "millis")]
    pub ttl_jitter: Duration,
    #[serde(flatten)]
    pub connection: ConnectionConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            host_pool_size: 1,
            monitor_interval: Duration::from_millis(30_000),
            ttl_jitter: Duration::from_millis(10_000),
            connection: ConnectionConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn with_hosts<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hosts: hosts.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, Error> {
        toml::from_str(toml_str).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn hosts(&self) -> Result<Vec<Host>, Error> {
        if self.hosts.is_empty() {
            return Ok(vec![self.connection.host()?]);
        }
        self.hosts
            .iter()
            .map(|h| Host::parse(h, self.connection.port))
            .collect()
    }

    /// Settings for one pooled connection to `host`.
    pub fn connection_config(&self, host: &Host) -> ConnectionConfig {
        ConnectionConfig {
            host: host.name.clone(),
            port: host.port,
            ..self.connection.clone()
        }
    }
}

mod millis {
    use super::*;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod opt_millis {
    use super::*;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}
