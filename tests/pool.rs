mod common;

use std::time::Duration;

use cassia::{
    Client, ConnectionState, Error, Pool, PoolConfig, PoolEvent, QueryOptions, QueryResult,
};
use common::{Cluster, eventually, init_logging};

const SETTLE: Duration = Duration::from_secs(2);

/// A pool whose monitor never fires on its own, so tests drive the cycles.
fn pool(cluster: &Cluster, hosts: &[&str]) -> Pool {
    let mut config = PoolConfig::with_hosts(hosts.iter().copied());
    config.monitor_interval = Duration::from_secs(600);
    config.connection.ping_timeout = Duration::from_millis(200);
    Pool::new(config, cluster.transport()).unwrap()
}

#[test]
fn connect_with_no_reachable_hosts() {
    init_logging();
    let cluster = Cluster::with_nodes(&["db1", "db2"]);
    cluster.set_up("db1", false);
    cluster.set_up("db2", false);
    let pool = pool(&cluster, &["db1", "db2"]);

    let err = pool.connect().unwrap_err();
    assert!(matches!(err, Error::NoAvailableNodes { .. }), "{err}");
    assert!(pool.health().healthy.is_empty());
    assert_eq!(pool.health().unhealthy, vec!["db1:9160", "db2:9160"]);
    assert!(matches!(
        pool.cql("SELECT * FROM users"),
        Err(Error::NoAvailableNodes { .. })
    ));
}

#[test]
fn connect_succeeds_with_one_live_host() {
    let cluster = Cluster::with_nodes(&["db1", "db2"]);
    cluster.set_up("db2", false);
    let pool = pool(&cluster, &["db1", "db2"]);

    pool.connect().unwrap();
    assert!(eventually(SETTLE, || pool.health().unhealthy == vec!["db2:9160"]));
    assert_eq!(pool.health().healthy, vec!["db1:9160"]);

    // Connecting again is a no-op.
    assert!(pool.connect().unwrap().is_none());
    assert_eq!(cluster.opened("db1"), 1);
}

#[test]
fn host_pool_size_opens_several_connections() {
    let cluster = Cluster::with_nodes(&["db1", "db2"]);
    let mut config = PoolConfig::with_hosts(["db1", "db2"]);
    config.host_pool_size = 3;
    let pool = Pool::new(config, cluster.transport()).unwrap();

    pool.connect().unwrap();
    assert!(eventually(SETTLE, || pool.connections().len() == 6));
    assert_eq!(cluster.live("db1"), 3);
    assert_eq!(cluster.live("db2"), 3);
    pool.close();
}

#[test]
fn get_connection_evicts_connections_that_are_not_ready() {
    let cluster = Cluster::with_nodes(&["db1", "db2"]);
    let pool = pool(&cluster, &["db1", "db2"]);
    pool.connect().unwrap();
    assert!(eventually(SETTLE, || pool.connections().len() == 2));

    let doomed = pool.connections().into_iter().next().unwrap();
    let survivor = pool.connections().into_iter().nth(1).unwrap();
    doomed.close();

    let picked = pool
        .get_connection_with(|clients| clients.iter().position(|c| c.id() == doomed.id()).or(Some(0)))
        .unwrap();
    assert_eq!(picked.id(), survivor.id());
    assert!(picked.is_ready());
    assert!(pool.connections().iter().all(|c| c.is_ready()));
    assert_eq!(pool.health().unhealthy, vec![doomed.host().to_string()]);
}

#[test]
fn empty_pool_reports_an_error_event() {
    let cluster = Cluster::with_nodes(&["db1"]);
    let pool = pool(&cluster, &["db1"]);
    let events = pool.subscribe();

    assert!(pool.get_connection().is_none());
    assert_eq!(
        events.recv_timeout(Duration::from_secs(1)).unwrap(),
        PoolEvent::Error {
            why: "No Available Connections".into()
        }
    );
}

#[test]
fn monitor_quarantines_and_resurrects() {
    init_logging();
    let cluster = Cluster::with_nodes(&["db1", "db2"]);
    let pool = pool(&cluster, &["db1", "db2"]);
    pool.connect().unwrap();
    assert!(eventually(SETTLE, || pool.connections().len() == 2));

    let report = pool.monitor_connections();
    assert_eq!(report.pinged, 2);
    assert!(report.quarantined.is_empty());

    cluster.set_up("db2", false);
    let report = pool.monitor_connections();
    assert_eq!(report.pinged, 2);
    assert_eq!(report.quarantined.len(), 1);
    assert_eq!(report.quarantined[0].to_string(), "db2:9160");
    assert!(report.resurrected.is_empty());
    assert!(eventually(SETTLE, || pool.health().healthy == vec!["db1:9160"]));
    assert_eq!(pool.health().unhealthy, vec!["db2:9160"]);

    // Still down: retried, and stays dead.
    let report = pool.monitor_connections();
    assert!(report.resurrected.is_empty());
    assert_eq!(pool.health().unhealthy, vec!["db2:9160"]);

    cluster.set_up("db2", true);
    let report = pool.monitor_connections();
    assert_eq!(report.resurrected.len(), 1);
    assert!(pool.health().unhealthy.is_empty());
    let mut healthy = pool.health().healthy;
    healthy.sort();
    assert_eq!(healthy, vec!["db1:9160", "db2:9160"]);
}

#[test]
fn hanging_pings_are_quarantined() {
    let cluster = Cluster::with_nodes(&["db1", "db2"]);
    let pool = pool(&cluster, &["db1", "db2"]);
    pool.connect().unwrap();
    assert!(eventually(SETTLE, || pool.connections().len() == 2));

    cluster.update("db1", |node| node.hang_pings = true);
    let report = pool.monitor_connections();
    assert_eq!(report.quarantined.len(), 1);
    assert_eq!(report.quarantined[0].to_string(), "db1:9160");
    // The host still accepts sessions, so it is revived in the same cycle.
    assert_eq!(report.resurrected.len(), 1);
    assert!(eventually(SETTLE, || pool.health().unhealthy.is_empty()));
}

#[test]
fn close_emits_closed_after_every_connection() {
    let cluster = Cluster::with_nodes(&["db1", "db2"]);
    let pool = pool(&cluster, &["db1", "db2"]);
    let events = pool.subscribe();
    pool.connect().unwrap();
    assert!(eventually(SETTLE, || pool.connections().len() == 2));
    let connections = pool.connections();

    pool.close();
    pool.close();
    assert_eq!(
        events.recv_timeout(Duration::from_secs(1)).unwrap(),
        PoolEvent::Closed
    );
    assert!(connections.iter().all(|c| c.state() == ConnectionState::Closed));
    assert_eq!(cluster.live("db1") + cluster.live("db2"), 0);
    assert!(pool.monitor_connections().skipped);
    assert!(events.try_recv().is_err());
}

#[test]
fn keyspace_is_broadcast() {
    let cluster = Cluster::with_nodes(&["db1", "db2"]);
    let pool = pool(&cluster, &["db1", "db2"]);
    pool.connect().unwrap();
    assert!(eventually(SETTLE, || pool.connections().len() == 2));

    let keyspace = pool.use_keyspace("metrics").unwrap();
    assert_eq!(keyspace.name(), "metrics");
    assert!(
        pool.connections()
            .iter()
            .all(|c| c.keyspace().as_deref() == Some("metrics"))
    );
    assert!(matches!(
        Client::use_keyspace(&pool, "missing"),
        Err(Error::NotFound { .. })
    ));

    // Connections opened later select it too.
    cluster.set_up("db2", false);
    pool.monitor_connections();
    cluster.set_up("db2", true);
    pool.monitor_connections();
    assert!(
        pool.connections()
            .iter()
            .all(|c| c.keyspace().as_deref() == Some("metrics"))
    );
}

#[test]
fn queries_go_through_the_pool() {
    let cluster = Cluster::with_nodes(&["db1", "db2"]);
    let pool = pool(&cluster, &["db1", "db2"]);
    pool.connect().unwrap();
    assert!(eventually(SETTLE, || pool.connections().len() == 2));

    let rows = pool.cql("SELECT * FROM users").unwrap().into_rows();
    assert_eq!(rows.len(), 1);

    let results = pool
        .execute_query_all(b"SELECT COUNT(*) FROM users", &QueryOptions::default())
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| matches!(r, QueryResult::Count(1))));
}

#[test]
fn a_host_with_a_live_connection_is_never_dead() {
    let cluster = Cluster::with_nodes(&["db1"]);
    let mut config = PoolConfig::with_hosts(["db1"]);
    config.host_pool_size = 2;
    config.monitor_interval = Duration::from_secs(600);
    let pool = Pool::new(config, cluster.transport()).unwrap();
    pool.connect().unwrap();
    assert!(eventually(SETTLE, || pool.connections().len() == 2));

    pool.connections()[0].close();
    assert!(eventually(SETTLE, || pool.connections().len() == 1));
    assert_eq!(pool.health().healthy, vec!["db1:9160"]);
    assert!(pool.health().unhealthy.is_empty());

    // The lost slot is still reopened.
    let report = pool.monitor_connections();
    assert_eq!(report.resurrected.len(), 1);
    assert_eq!(pool.connections().len(), 2);
    assert_eq!(cluster.live("db1"), 2);

    // Once every connection is gone the host is dead, and comes back whole.
    cluster.set_up("db1", false);
    let report = pool.monitor_connections();
    assert_eq!(report.quarantined.len(), 2);
    assert_eq!(pool.health().unhealthy, vec!["db1:9160"]);
    assert!(pool.health().healthy.is_empty());

    cluster.set_up("db1", true);
    pool.monitor_connections();
    assert_eq!(pool.health().healthy, vec!["db1:9160"]);
    assert!(pool.health().unhealthy.is_empty());
    pool.monitor_connections();
    assert_eq!(pool.connections().len(), 2);
}

#[test]
fn closed_connections_are_quarantined_by_the_monitor_thread() {
    let cluster = Cluster::with_nodes(&["db1", "db2"]);
    let pool = pool(&cluster, &["db1", "db2"]);
    pool.connect().unwrap();
    assert!(eventually(SETTLE, || pool.connections().len() == 2));

    let closed = pool.connections().into_iter().next().unwrap();
    closed.close();
    assert!(eventually(SETTLE, || {
        pool.health().unhealthy == vec![closed.host().to_string()]
    }));
    assert_eq!(pool.connections().len(), 1);
}

#[test]
fn periodic_monitor_converges() {
    init_logging();
    let cluster = Cluster::with_nodes(&["db1", "db2"]);
    let mut config = PoolConfig::with_hosts(["db1", "db2"]);
    config.monitor_interval = Duration::from_millis(100);
    config.connection.ping_timeout = Duration::from_millis(200);
    let pool = Pool::new(config, cluster.transport()).unwrap();
    pool.connect().unwrap();
    assert!(eventually(SETTLE, || pool.connections().len() == 2));

    cluster.set_up("db2", false);
    assert!(eventually(SETTLE, || pool.health().unhealthy == vec!["db2:9160"]));
    assert_eq!(pool.health().healthy, vec!["db1:9160"]);

    cluster.set_up("db2", true);
    assert!(eventually(SETTLE, || {
        pool.health().unhealthy.is_empty() && pool.connections().len() == 2
    }));
    pool.close();
}
