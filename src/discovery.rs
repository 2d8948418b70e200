//! Finding the rest of the ring from one seed node.
use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::Arc,
};

use log::{debug, info};

use crate::{
    Connection, Error, Pool, QueryOptions,
    config::{ConnectionConfig, Host, PoolConfig},
    marshal::Value,
    protocol::Transport,
};

const SYSTEM_QUERY: &[u8] = b"use system";
const DISCOVER_QUERY: &[u8] = b"select peer from system.peers";

/// Asks the seed described by `config` for its peers.
///
/// The seed itself is part of the result even when it does not list
/// itself. Peers inherit the seed's port.
pub fn discover(config: &ConnectionConfig, transport: Arc<dyn Transport>) -> Result<Vec<Host>, Error> {
    let mut seed_config = config.clone();
    seed_config.keyspace = None;
    if seed_config.cql_version.is_none() {
        seed_config.cql_version = Some("3.0.0".into());
    }

    let seed = Connection::new(seed_config, transport)?;
    info!("auto-discovering nodes from {}", seed.host());
    seed.connect()?;
    let peers = peers(&seed);
    seed.close();

    let mut hosts = peers?;
    if !hosts.contains(seed.host()) {
        hosts.push(seed.host().clone());
    }
    debug!("discovered {} nodes", hosts.len());
    Ok(hosts)
}

/// Builds a pool over every node [`discover`] finds from `seed`. The pool
/// is returned unconnected.
///
/// Once connected, the pool asks `seed` for the ring again every
/// `monitor_interval` and follows it; see [`Pool::rediscover`].
pub fn discover_pool(seed: &str, config: PoolConfig, transport: Arc<dyn Transport>) -> Result<Pool, Error> {
    let seed = Host::parse(seed, config.connection.port)?;
    let hosts = discover(&config.connection_config(&seed), Arc::clone(&transport))?;

    let config = PoolConfig {
        hosts: hosts.iter().map(ToString::to_string).collect(),
        ..config
    };
    Pool::build(config, transport, Some(seed))
}

fn peers(seed: &Connection) -> Result<Vec<Host>, Error> {
    let options = QueryOptions::default();
    seed.execute_query(SYSTEM_QUERY, &options)?;
    let rows = seed.execute_query(DISCOVER_QUERY, &options)?.into_rows();

    let port = seed.host().port;
    Ok(rows
        .iter()
        .filter_map(|row| row.column("peer"))
        .filter_map(|column| peer_address(&column.value))
        .map(|name| Host::new(name, port))
        .collect())
}

/// A peer arrives either as text or as the raw 4 or 16 address bytes.
fn peer_address(value: &Value) -> Option<String> {
    match value {
        Value::Text(name) if !name.is_empty() => Some(name.clone()),
        Value::Bytes(bytes) => {
            let ip = match bytes.len() {
                4 => IpAddr::V4(Ipv4Addr::from(<[u8; 4]>::try_from(bytes.as_slice()).ok()?)),
                16 => IpAddr::V6(Ipv6Addr::from(<[u8; 16]>::try_from(bytes.as_slice()).ok()?)),
                _ => return None,
            };
            Some(ip.to_string())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_addresses() {
        let inputs = vec![
            (Value::Text("10.0.0.2".into()), Some("10.0.0.2")),
            (Value::Bytes(vec![10, 0, 0, 3]), Some("10.0.0.3")),
            (
                Value::Bytes([0u8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1].to_vec()),
                Some("::1"),
            ),
            (Value::Bytes(vec![1, 2, 3]), None),
            (Value::Null, None),
            (Value::Text(String::new()), None),
        ];

        for (value, expected) in inputs {
            assert_eq!(peer_address(&value).as_deref(), expected);
        }
    }
}
