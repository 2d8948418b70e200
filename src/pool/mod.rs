//! A self-healing set of connections across several hosts.
//!
//! The pool keeps two collections behind one lock: `clients`, the live
//! connections requests are routed to, and the number of connection slots
//! each host is missing. A host missing slots with no connection left in
//! `clients` is dead; a host is never both live and dead. Only pool methods
//! touch them. Connections report health changes and closures as
//! [`ConnectionEvent`]s, which are forwarded to the pool's monitor thread and
//! applied there.
//!
//! Every `monitor_interval` the monitor pings each live connection
//! concurrently. Connections failing their ping are closed and their slot
//! marked missing. Each host missing a slot is then dialed once; success
//! brings a connection back into `clients`. A permanently dead host is
//! retried every cycle, with no backoff.
//!
//! A pool built from a seed node (see [`discover_pool`]) also asks the seed
//! for the ring every cycle, dropping connections to nodes that left it and
//! dialing nodes that joined.
//!
//! [`discover_pool`]: crate::discover_pool
mod worker;

use std::{
    collections::{BTreeMap, HashMap, btree_map::Entry},
    fmt,
    sync::{
        Arc, Mutex, RwLock, Weak,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
    },
    thread,
    time::{Duration, Instant},
};

use log::{debug, info, trace, warn};
use rand::Rng;

use crate::{
    Connection, ConnectionEvent, Error, Keyspace, QueryOptions, QueryResult,
    config::{Host, PoolConfig},
    discovery, lock,
    protocol::{TcpTransport, Transport},
    read, write,
};

use worker::WorkerPool;

const MAX_WORKERS: usize = 16;

/// Slack given to a ping job on top of the ping timeout before the monitor
/// stops waiting for it.
const PING_GRACE: Duration = Duration::from_millis(250);

/// Notifications delivered to [`Pool::subscribe`] receivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// No connection was available to serve a request.
    Error { why: String },
    /// Every connection has been closed.
    Closed,
}

/// Outcome of one [`Pool::monitor_connections`] cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub pinged: usize,
    pub quarantined: Vec<Host>,
    pub resurrected: Vec<Host>,
    /// The cycle did not run, because another was in progress or the pool
    /// is closing.
    pub skipped: bool,
}

/// Outcome of one [`Pool::rediscover`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RingChange {
    /// Nodes that joined the ring; their connections have been dialed.
    pub added: Vec<Host>,
    /// Nodes that left the ring; their connections have been closed.
    pub removed: Vec<Host>,
    /// The run did not happen, because another was in progress or the pool
    /// is closing.
    pub skipped: bool,
}

impl RingChange {
    pub fn is_changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Health {
    /// `host:port` of every live connection.
    pub healthy: Vec<String>,
    /// `host:port` of every host left without a connection.
    pub unhealthy: Vec<String>,
}

enum MonitorSignal {
    Connection(ConnectionEvent),
    Shutdown,
}

#[derive(Default)]
struct PoolState {
    clients: Vec<Connection>,
    /// Connection slots waiting to be reopened, per host.
    missing: BTreeMap<Host, usize>,
}

impl PoolState {
    fn has_client(&self, host: &Host) -> bool {
        self.clients.iter().any(|c| c.host() == host)
    }

    fn lost(&mut self, host: &Host) {
        *self.missing.entry(host.clone()).or_default() += 1;
    }

    fn restored(&mut self, host: &Host) {
        if let Entry::Occupied(mut slots) = self.missing.entry(host.clone()) {
            *slots.get_mut() -= 1;
            if *slots.get() == 0 {
                slots.remove();
            }
        }
    }

    /// Hosts without a single live connection.
    fn dead(&self) -> impl Iterator<Item = &Host> {
        self.missing.keys().filter(|host| !self.has_client(host))
    }
}

struct PoolInner {
    config: PoolConfig,
    hosts: RwLock<Vec<Host>>,
    /// Node asked for the ring on every monitor cycle.
    seed: Option<Host>,
    transport: Arc<dyn Transport>,
    state: Mutex<PoolState>,
    keyspace: RwLock<Option<String>>,
    connected: AtomicBool,
    closing: AtomicBool,
    check_in_progress: AtomicBool,
    discovery_in_progress: AtomicBool,
    workers: WorkerPool,
    signals: mpsc::Sender<MonitorSignal>,
    receiver: Mutex<Option<mpsc::Receiver<MonitorSignal>>>,
    monitor: Mutex<Option<thread::JoinHandle<()>>>,
    subscribers: Mutex<Vec<mpsc::Sender<PoolEvent>>>,
}

/// Cheap to clone; clones share the same connections.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("hosts", &self.hosts())
            .field("seed", &self.inner.seed)
            .field("health", &self.health())
            .field("closing", &self.is_closing())
            .finish()
    }
}

impl Pool {
    pub fn new(config: PoolConfig, transport: Arc<dyn Transport>) -> Result<Self, Error> {
        Self::build(config, transport, None)
    }

    /// A pool that keeps its host list in step with the ring `seed` reports.
    pub(crate) fn build(
        config: PoolConfig,
        transport: Arc<dyn Transport>,
        seed: Option<Host>,
    ) -> Result<Self, Error> {
        let hosts = config.hosts()?;
        let (signals, receiver) = mpsc::channel();
        let size = (hosts.len() * config.host_pool_size).clamp(1, MAX_WORKERS);
        let workers = WorkerPool::new("pool", size)?;
        let keyspace = config.connection.keyspace.clone();

        let inner = PoolInner {
            config,
            hosts: RwLock::new(hosts),
            seed,
            transport,
            state: Mutex::new(PoolState::default()),
            keyspace: RwLock::new(keyspace),
            connected: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            check_in_progress: AtomicBool::new(false),
            discovery_in_progress: AtomicBool::new(false),
            workers,
            signals,
            receiver: Mutex::new(Some(receiver)),
            monitor: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// A pool over [`TcpTransport`].
    pub fn tcp(config: PoolConfig) -> Result<Self, Error> {
        Self::new(config, Arc::new(TcpTransport))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// The hosts connections are kept to. Follows the ring when the pool
    /// has a seed.
    pub fn hosts(&self) -> Vec<Host> {
        read(&self.inner.hosts).clone()
    }

    pub fn seed(&self) -> Option<&Host> {
        self.inner.seed.as_ref()
    }

    /// Dials `host_pool_size` connections to every host concurrently.
    ///
    /// Returns as soon as one dial succeeds, with the keyspace that
    /// connection selected. Dials still in flight keep registering their
    /// outcome in the background. Fails with [`Error::NoAvailableNodes`]
    /// only when every dial fails. The monitor is started either way.
    pub fn connect(&self) -> Result<Option<Keyspace>, Error> {
        if self.inner.connected.swap(true, Ordering::AcqRel) {
            return Ok(None);
        }

        let (tx, rx) = mpsc::channel();
        for host in self.hosts() {
            for _ in 0..self.inner.config.host_pool_size {
                let inner = Arc::clone(&self.inner);
                let host = host.clone();
                let tx = tx.clone();
                self.inner.workers.execute(move || {
                    let _ = tx.send(inner.dial(&host));
                });
            }
        }
        drop(tx);
        self.inner.arm_monitor()?;

        for result in rx {
            if let Ok(keyspace) = result {
                return Ok(keyspace);
            }
        }
        Err(Error::no_available_nodes("Could Not Connect To Any Nodes"))
    }

    /// A uniformly random live connection.
    pub fn get_connection(&self) -> Option<Connection> {
        self.get_connection_with(random_index)
    }

    /// A live connection chosen by `selector`, which returns an index into
    /// the connections it is given.
    ///
    /// A chosen connection that is no longer ready triggers a sweep closing
    /// every not-ready connection and marking its slot missing, then
    /// selection runs again.
    /// When nothing is left a [`PoolEvent::Error`] is emitted and `None`
    /// returned.
    pub fn get_connection_with<F>(&self, selector: F) -> Option<Connection>
    where
        F: Fn(&[Connection]) -> Option<usize>,
    {
        let mut evicted = Vec::new();
        let picked = {
            let mut state = lock(&self.inner.state);
            loop {
                let Some(i) = selector(&state.clients).filter(|&i| i < state.clients.len()) else {
                    break None;
                };
                if state.clients[i].is_ready() {
                    break Some(state.clients[i].clone());
                }

                let (ready, stale): (Vec<_>, Vec<_>) =
                    state.clients.drain(..).partition(Connection::is_ready);
                state.clients = ready;
                for connection in stale {
                    debug!("get_connection: pushing host onto dead pool: {}", connection.host());
                    state.lost(connection.host());
                    evicted.push(connection);
                }
            }
        };

        for connection in evicted {
            connection.close();
        }
        if picked.is_none() {
            self.inner.emit(PoolEvent::Error {
                why: "No Available Connections".into(),
            });
        }
        picked
    }

    pub(crate) fn checkout(&self) -> Result<Connection, Error> {
        self.get_connection()
            .ok_or_else(|| Error::no_available_nodes("Could Not Connect To Any Nodes"))
    }

    /// Runs one health-check cycle now. The monitor thread calls this every
    /// `monitor_interval`.
    pub fn monitor_connections(&self) -> MonitorReport {
        self.inner.monitor_connections()
    }

    /// Asks the seed for the ring now, closing connections to nodes that
    /// left it and dialing `host_pool_size` connections to each node that
    /// joined. The monitor thread calls this every `monitor_interval`.
    ///
    /// Fails with [`Error::Config`] on a pool without a seed.
    pub fn rediscover(&self) -> Result<RingChange, Error> {
        self.inner.rediscover()
    }

    /// Selects `name` on every live connection and on every connection
    /// opened later. Returns the first description obtained, or the first
    /// error when no connection succeeded.
    pub fn use_keyspace(&self, name: &str) -> Result<Keyspace, Error> {
        let clients = self.connections();
        if clients.is_empty() {
            return Err(Error::no_available_nodes("Could Not Connect To Any Nodes"));
        }

        let mut keyspace = None;
        let mut first_error = None;
        for connection in clients {
            match connection.use_keyspace(name) {
                Ok(selected) => {
                    keyspace.get_or_insert(selected);
                }
                Err(e) => {
                    debug!("use_keyspace {name} failed on {}: {e}", connection.host());
                    first_error.get_or_insert(e);
                }
            }
        }

        match (keyspace, first_error) {
            (Some(keyspace), _) => {
                *write(&self.inner.keyspace) = Some(name.to_string());
                Ok(keyspace)
            }
            (None, Some(e)) => Err(e),
            (None, None) => Err(Error::no_available_nodes("No Available Connections")),
        }
    }

    /// Runs one query on every live connection.
    pub fn execute_query_all(&self, query: &[u8], options: &QueryOptions) -> Result<Vec<QueryResult>, Error> {
        self.connections()
            .iter()
            .map(|connection| connection.execute_query(query, options))
            .collect()
    }

    pub fn health(&self) -> Health {
        let state = lock(&self.inner.state);
        Health {
            healthy: state.clients.iter().map(|c| c.host().to_string()).collect(),
            unhealthy: state.dead().map(ToString::to_string).collect(),
        }
    }

    /// Snapshot of the live connections.
    pub fn connections(&self) -> Vec<Connection> {
        lock(&self.inner.state).clients.clone()
    }

    pub fn subscribe(&self) -> mpsc::Receiver<PoolEvent> {
        let (tx, rx) = mpsc::channel();
        lock(&self.inner.subscribers).push(tx);
        rx
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    /// Stops the monitor, closes every connection, then emits
    /// [`PoolEvent::Closed`]. A monitor cycle already running completes
    /// first. Idempotent.
    pub fn close(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        let _ = self.inner.signals.send(MonitorSignal::Shutdown);
        if let Some(monitor) = lock(&self.inner.monitor).take() {
            if monitor.thread().id() != thread::current().id() {
                let _ = monitor.join();
            }
        }

        let clients = std::mem::take(&mut lock(&self.inner.state).clients);
        for connection in &clients {
            connection.close();
        }

        info!("connection pool closed");
        self.inner.emit(PoolEvent::Closed);
    }
}

impl PoolInner {
    fn create_connection(&self, host: &Host) -> Result<Connection, Error> {
        let mut config = self.config.connection_config(host);
        config.keyspace = read(&self.keyspace).clone();
        config.ttl += jitter(self.config.ttl_jitter);

        let connection = Connection::new(config, Arc::clone(&self.transport))?;
        let signals = self.signals.clone();
        connection.on_event(move |event| {
            let _ = signals.send(MonitorSignal::Connection(event.clone()));
        });
        Ok(connection)
    }

    /// Initial dial of one pool slot for `host`.
    fn dial(&self, host: &Host) -> Result<Option<Keyspace>, Error> {
        let connection = self.create_connection(host)?;

        match connection.connect() {
            Ok(keyspace) => {
                info!("connection established to {host}");
                let mut state = lock(&self.state);
                if self.closing.load(Ordering::Acquire) {
                    drop(state);
                    connection.close();
                    return Err(Error::no_available_nodes("Pool is closing"));
                }
                state.clients.push(connection);
                Ok(keyspace)
            }
            Err(e) => {
                warn!("initial connection failed to {host}: {e}");
                connection.close();
                lock(&self.state).lost(host);
                Err(e)
            }
        }
    }

    fn monitor_connections(self: &Arc<Self>) -> MonitorReport {
        if self.closing.load(Ordering::Acquire)
            || self.check_in_progress.swap(true, Ordering::AcqRel)
        {
            trace!("monitor cycle skipped");
            return MonitorReport {
                skipped: true,
                ..MonitorReport::default()
            };
        }

        let mut report = MonitorReport::default();
        self.ping_all(&mut report);
        if !self.closing.load(Ordering::Acquire) {
            self.resurrect_dead(&mut report);
        }

        self.check_in_progress.store(false, Ordering::Release);
        debug!(
            "monitor cycle done: {} pinged, {} quarantined, {} resurrected",
            report.pinged,
            report.quarantined.len(),
            report.resurrected.len()
        );
        report
    }

    fn ping_all(&self, report: &mut MonitorReport) {
        let clients = lock(&self.state).clients.clone();
        let (tx, rx) = mpsc::channel();
        let mut pending: HashMap<u64, Connection> = HashMap::new();

        for connection in clients {
            let tx = tx.clone();
            let job = connection.clone();
            let queued = self.workers.execute(move || {
                let healthy = job.ping().is_ok();
                let _ = tx.send((job.id(), healthy));
            });
            if queued {
                pending.insert(connection.id(), connection);
            }
        }
        drop(tx);

        let deadline = Instant::now() + self.config.connection.ping_timeout + PING_GRACE;
        let mut failed = Vec::new();
        while !pending.is_empty() {
            match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                Ok((id, healthy)) => {
                    if let Some(connection) = pending.remove(&id) {
                        report.pinged += 1;
                        if !healthy {
                            failed.push(connection);
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        // Pings that never reported back count as timed out.
        for (_, connection) in pending.drain() {
            warn!("ping timeout to {}", connection.host());
            report.pinged += 1;
            failed.push(connection);
        }

        // The connection's own health event may have quarantined it already.
        for connection in failed {
            self.quarantine(connection.id());
            report.quarantined.push(connection.host().clone());
        }
    }

    fn resurrect_dead(self: &Arc<Self>, report: &mut MonitorReport) {
        let dead: Vec<Host> = lock(&self.state).missing.keys().cloned().collect();
        if dead.is_empty() {
            return;
        }

        let (tx, rx) = mpsc::channel();
        for host in dead {
            let inner = Arc::clone(self);
            let tx = tx.clone();
            self.workers.execute(move || {
                let revived = inner.resurrect(&host);
                let _ = tx.send((host, revived));
            });
        }
        drop(tx);

        for (host, revived) in rx {
            if revived {
                report.resurrected.push(host);
            }
        }
    }

    fn resurrect(&self, host: &Host) -> bool {
        let connection = match self.create_connection(host) {
            Ok(connection) => connection,
            Err(e) => {
                warn!("cannot rebuild connection to {host}: {e}");
                return false;
            }
        };

        match connection.connect() {
            Ok(_) => {
                let mut state = lock(&self.state);
                if self.closing.load(Ordering::Acquire) {
                    drop(state);
                    connection.close();
                    return false;
                }
                info!("host rising from the dead: {host}");
                state.restored(host);
                state.clients.push(connection);
                true
            }
            Err(e) => {
                debug!("host still dead: {host}: {e}");
                connection.close();
                false
            }
        }
    }

    /// Moves the connection `id` out of `clients`, marks its slot missing,
    /// then closes it.
    fn quarantine(&self, id: u64) -> Option<Host> {
        let connection = {
            let mut state = lock(&self.state);
            let position = state.clients.iter().position(|c| c.id() == id)?;
            let connection = state.clients.remove(position);
            state.lost(connection.host());
            connection
        };

        info!("moving {} onto dead pool", connection.host());
        connection.close();
        Some(connection.host().clone())
    }

    fn rediscover(&self) -> Result<RingChange, Error> {
        let Some(seed) = &self.seed else {
            return Err(Error::Config("pool has no seed node to rediscover from".into()));
        };
        if self.closing.load(Ordering::Acquire)
            || self.discovery_in_progress.swap(true, Ordering::AcqRel)
        {
            trace!("rediscovery skipped");
            return Ok(RingChange {
                skipped: true,
                ..RingChange::default()
            });
        }

        let result = discovery::discover(&self.config.connection_config(seed), Arc::clone(&self.transport))
            .map(|current| self.apply_ring(current));
        self.discovery_in_progress.store(false, Ordering::Release);

        if let Err(e) = &result {
            warn!("node auto-discovery failed: {e}");
        }
        result
    }

    fn apply_ring(&self, current: Vec<Host>) -> RingChange {
        let previous = std::mem::replace(&mut *write(&self.hosts), current.clone());
        let change = RingChange {
            added: current.iter().filter(|h| !previous.contains(h)).cloned().collect(),
            removed: previous.iter().filter(|h| !current.contains(h)).cloned().collect(),
            skipped: false,
        };
        if !change.is_changed() {
            return change;
        }
        info!(
            "node changes; added: {:?}; removed: {:?}",
            change.added.iter().map(ToString::to_string).collect::<Vec<_>>(),
            change.removed.iter().map(ToString::to_string).collect::<Vec<_>>()
        );

        let departed = {
            let mut state = lock(&self.state);
            let (departed, kept): (Vec<_>, Vec<_>) = state
                .clients
                .drain(..)
                .partition(|c| change.removed.contains(c.host()));
            state.clients = kept;
            for host in &change.removed {
                state.missing.remove(host);
            }
            for host in &change.added {
                *state.missing.entry(host.clone()).or_default() += self.config.host_pool_size;
            }
            departed
        };
        for connection in departed {
            connection.close();
        }

        for host in &change.added {
            for _ in 0..self.config.host_pool_size {
                if !self.resurrect(host) {
                    break;
                }
            }
        }
        change
    }

    fn handle_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Health {
                id, healthy: false, ..
            }
            | ConnectionEvent::Closed { id, .. } => {
                if !self.closing.load(Ordering::Acquire) {
                    self.quarantine(id);
                }
            }
            ConnectionEvent::Health { host, .. } => trace!("{host} reports healthy"),
            ConnectionEvent::Reconnected {
                host, generation, ..
            } => debug!("{host} reconnected, generation {generation}"),
        }
    }

    fn arm_monitor(self: &Arc<Self>) -> Result<(), Error> {
        let Some(receiver) = lock(&self.receiver).take() else {
            return Ok(());
        };
        let inner = Arc::downgrade(self);
        let interval = self.config.monitor_interval;

        let handle = thread::Builder::new()
            .name("pool-monitor".into())
            .spawn(move || run_monitor(inner, receiver, interval))?;
        *lock(&self.monitor) = Some(handle);
        Ok(())
    }

    fn emit(&self, event: PoolEvent) {
        lock(&self.subscribers).retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::Release);
        let _ = self.signals.send(MonitorSignal::Shutdown);
        let clients = std::mem::take(&mut lock(&self.state).clients);
        for connection in clients {
            connection.close();
        }
    }
}

fn run_monitor(inner: Weak<PoolInner>, receiver: mpsc::Receiver<MonitorSignal>, interval: Duration) {
    let mut next_cycle = Instant::now() + interval;

    loop {
        let signal = receiver.recv_timeout(next_cycle.saturating_duration_since(Instant::now()));
        let Some(inner) = inner.upgrade() else { break };

        match signal {
            Err(RecvTimeoutError::Timeout) => {
                inner.monitor_connections();
                if inner.seed.is_some() {
                    let _ = inner.rediscover();
                }
                next_cycle = Instant::now() + interval;
            }
            Ok(MonitorSignal::Connection(event)) => inner.handle_event(event),
            Ok(MonitorSignal::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("pool monitor stopped");
}

fn random_index(clients: &[Connection]) -> Option<usize> {
    if clients.is_empty() {
        None
    } else {
        Some(rand::rng().random_range(0..clients.len()))
    }
}

fn jitter(max: Duration) -> Duration {
    let max = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..max))
}
