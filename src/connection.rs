//! A single client session to one store host.
//!
//! A [`Connection`] walks through an explicit state machine on
//! [`connect`](Connection::connect):
//!
//! ```text
//! Disconnected -> Connecting -> Authenticating -> NegotiatingVersion -> Ready
//!                      \______________ any failure ______________/
//!                                        |
//!                                     Errored          (close) -> Closed
//! ```
//!
//! Once ready it keeps itself alive on a timer thread: it pings the store
//! every `ping_interval` and replaces its session once `ttl` has elapsed.
//! The replacement is dialed before the old session is released, so the
//! connection stays ready throughout. Health changes are reported to
//! listeners registered with [`on_event`](Connection::on_event).
use std::{
    fmt,
    io::Write,
    sync::{
        Arc, Mutex, PoisonError, RwLock, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, RecvTimeoutError},
    },
    thread,
    time::{Duration, Instant},
};

use flate2::write::ZlibEncoder;
use log::{debug, info, trace, warn};

use crate::{
    Error, Keyspace, QueryResult,
    config::{ConnectionConfig, Host},
    lock,
    protocol::{Compression, Request, Response, RpcClient, TcpTransport, Transport, TransportError},
    read, write,
};

/// Canary query; any node alive in a useful sense answers it.
pub const PING_QUERY: &[u8] = b"SELECT * FROM system.schema_keyspaces;";

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    NegotiatingVersion,
    Ready,
    Closed,
    Errored,
}

/// Notifications a connection sends to its listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The health flag flipped.
    Health { id: u64, host: Host, healthy: bool },
    /// The session was replaced after reaching its end of life.
    Reconnected { id: u64, host: Host, generation: u64 },
    Closed { id: u64, host: Host },
}

impl ConnectionEvent {
    pub fn id(&self) -> u64 {
        match self {
            ConnectionEvent::Health { id, .. }
            | ConnectionEvent::Reconnected { id, .. }
            | ConnectionEvent::Closed { id, .. } => *id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingOutcome {
    Healthy,
    /// Another ping was already in flight.
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Compress the query payload with zlib before sending it.
    pub gzip: bool,
}

type Listener = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

struct Session {
    client: Arc<dyn RpcClient>,
    generation: u64,
    version: String,
}

struct Timer {
    stop: mpsc::Sender<()>,
    handle: thread::JoinHandle<()>,
}

struct Inner {
    id: u64,
    host: Host,
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    state: Mutex<ConnectionState>,
    session: RwLock<Option<Arc<Session>>>,
    generation: AtomicU64,
    healthy: AtomicBool,
    pinging: AtomicBool,
    keyspace: RwLock<Option<String>>,
    listeners: Mutex<Vec<Listener>>,
    timer: Mutex<Option<Timer>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let session = self
            .session
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            session.client.shutdown();
        }
    }
}

/// Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("host", &self.inner.host)
            .field("state", &self.state())
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

impl Connection {
    pub fn new(config: ConnectionConfig, transport: Arc<dyn Transport>) -> Result<Self, Error> {
        let host = config.host()?;
        let inner = Inner {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            host,
            config,
            transport,
            state: Mutex::new(ConnectionState::Disconnected),
            session: RwLock::new(None),
            generation: AtomicU64::new(0),
            healthy: AtomicBool::new(false),
            pinging: AtomicBool::new(false),
            keyspace: RwLock::new(None),
            listeners: Mutex::new(Vec::new()),
            timer: Mutex::new(None),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// A connection over [`TcpTransport`].
    pub fn tcp(config: ConnectionConfig) -> Result<Self, Error> {
        Self::new(config, Arc::new(TcpTransport))
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn host(&self) -> &Host {
        &self.inner.host
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn is_healthy(&self) -> bool {
        self.inner.healthy.load(Ordering::Acquire)
    }

    /// Identity of the current session. Grows by one every time a session
    /// is installed, including the replacement made at end of life.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Store API version reported during the handshake.
    pub fn version(&self) -> Option<String> {
        read(&self.inner.session)
            .as_ref()
            .map(|session| session.version.clone())
    }

    /// The keyspace last selected on this connection.
    pub fn keyspace(&self) -> Option<String> {
        read(&self.inner.keyspace).clone()
    }

    pub fn on_event<F>(&self, listener: F)
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        lock(&self.inner.listeners).push(Arc::new(listener));
    }

    /// Dials the host and runs the handshake within the configured `timeout`.
    ///
    /// Selects the configured keyspace, if any, and returns its description.
    /// A failed attempt leaves the connection `Errored` with its half-open
    /// session destroyed; calling `connect` again retries from scratch.
    pub fn connect(&self) -> Result<Option<Keyspace>, Error> {
        {
            let mut state = lock(&self.inner.state);
            match *state {
                ConnectionState::Ready => return Ok(None),
                ConnectionState::Connecting
                | ConnectionState::Authenticating
                | ConnectionState::NegotiatingVersion => {
                    return Err(Error::InvalidRequest {
                        why: format!("connect to {} already in progress", self.inner.host),
                    });
                }
                _ => *state = ConnectionState::Connecting,
            }
        }
        self.stop_timer();

        let host = &self.inner.host;
        debug!("connecting to {host}");
        let deadline = Instant::now() + self.inner.config.timeout;

        let (client, version) = match self.handshake(deadline, |stage| self.advance(stage)) {
            Ok(session) => session,
            Err(e) => {
                warn!("connect to {host} failed: {e}");
                self.advance(ConnectionState::Errored);
                self.inner.healthy.store(false, Ordering::Release);
                return Err(e);
            }
        };
        if self.install(client, version).is_none() {
            return Err(Error::NotConnected {
                host: host.to_string(),
            });
        }
        self.inner.healthy.store(true, Ordering::Release);
        info!("connection established to {host}");
        self.arm_timer()?;

        let Some(keyspace) = self.inner.config.keyspace.clone() else {
            return Ok(None);
        };
        match self.use_keyspace(&keyspace) {
            Ok(keyspace) => Ok(Some(keyspace)),
            Err(e) => {
                self.stop_timer();
                if let Some(session) = write(&self.inner.session).take() {
                    session.client.shutdown();
                }
                self.advance(ConnectionState::Errored);
                self.inner.healthy.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Issues one RPC and waits for its response.
    pub fn execute(&self, request: Request) -> Result<Response, Error> {
        let session = self.session()?;
        self.call(&session, request, self.inner.config.request_timeout)
    }

    /// Runs a query and decodes its typed result.
    pub fn execute_query(&self, query: &[u8], options: &QueryOptions) -> Result<QueryResult, Error> {
        let session = self.session()?;
        let (payload, compression) = if options.gzip {
            (deflate(query)?, Compression::Gzip)
        } else {
            (query.to_vec(), Compression::None)
        };

        let request = self.query_request(&session, payload, compression);
        let name = request.name();
        match self.call(&session, request, self.inner.config.request_timeout)? {
            Response::Cql(result) => QueryResult::decode(result),
            other => Err(unexpected(name, other)),
        }
    }

    /// Runs a plain-text query without compression.
    pub fn cql(&self, query: &str) -> Result<QueryResult, Error> {
        self.execute_query(query.as_bytes(), &QueryOptions::default())
    }

    /// Describes then selects `name`. Later sessions of this connection
    /// select it again after reconnecting.
    pub fn use_keyspace(&self, name: &str) -> Result<Keyspace, Error> {
        if name.trim().is_empty() {
            return Err(Error::InvalidName {
                why: "Keyspace name not specified".into(),
            });
        }

        let session = self.session()?;
        let timeout = self.inner.config.request_timeout;
        let definition = match self.call(&session, Request::DescribeKeyspace(name.into()), timeout)? {
            Response::Keyspace(definition) => definition,
            other => return Err(unexpected("describe_keyspace", other)),
        };
        let response = self.call(&session, Request::SetKeyspace(name.into()), timeout)?;
        expect_ok("set_keyspace", response)?;

        *write(&self.inner.keyspace) = Some(name.to_string());
        Ok(Keyspace::new(definition))
    }

    /// Sends the canary query, bounded by `ping_timeout`.
    ///
    /// The health flag follows the outcome. A ping that times out also
    /// destroys the session, leaving the connection `Errored`. While one
    /// ping is in flight further calls return [`PingOutcome::Skipped`].
    pub fn ping(&self) -> Result<PingOutcome, Error> {
        if self.inner.pinging.swap(true, Ordering::AcqRel) {
            return Ok(PingOutcome::Skipped);
        }

        let result = self.session().and_then(|session| {
            let request = self.query_request(&session, PING_QUERY.to_vec(), Compression::None);
            self.call(&session, request, Some(self.inner.config.ping_timeout))
        });
        self.inner.pinging.store(false, Ordering::Release);

        match result {
            Ok(_) => {
                trace!("good ping to {}", self.inner.host);
                self.set_healthy(true);
                Ok(PingOutcome::Healthy)
            }
            Err(e) => {
                if let Error::Timeout { .. } = e {
                    warn!("ping timeout to {}", self.inner.host);
                } else {
                    warn!("ping to {} failed: {e}", self.inner.host);
                }
                self.set_healthy(false);
                Err(e)
            }
        }
    }

    /// Stops the timers and destroys the session. Idempotent.
    pub fn close(&self) {
        {
            let mut state = lock(&self.inner.state);
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }
        self.stop_timer();

        let session = write(&self.inner.session).take();
        if let Some(session) = session {
            session.client.shutdown();
        }
        self.inner.healthy.store(false, Ordering::Release);

        debug!("connection to {} closed", self.inner.host);
        self.emit(ConnectionEvent::Closed {
            id: self.inner.id,
            host: self.inner.host.clone(),
        });
    }

    fn handshake<F>(&self, deadline: Instant, on_stage: F) -> Result<(Arc<dyn RpcClient>, String), Error>
    where
        F: Fn(ConnectionState),
    {
        let client = self.inner.transport.open(&self.inner.host, self.inner.config.timeout)?;
        match self.negotiate(client.as_ref(), deadline, on_stage) {
            Ok(version) => Ok((client, version)),
            Err(e) => {
                debug!("handshake with {} failed; destroying session", self.inner.host);
                client.shutdown();
                Err(e)
            }
        }
    }

    fn negotiate<F>(&self, client: &dyn RpcClient, deadline: Instant, on_stage: F) -> Result<String, Error>
    where
        F: Fn(ConnectionState),
    {
        let remaining = || Some(deadline.saturating_duration_since(Instant::now()));
        let config = &self.inner.config;

        on_stage(ConnectionState::Authenticating);
        if let Some((username, password)) = config.credentials() {
            let request = Request::Login {
                username: username.into(),
                password: password.into(),
            };
            expect_ok("login", checked(client.call(request, remaining()))?)?;
            debug!("successful authentication to {}", self.inner.host);
        }

        on_stage(ConnectionState::NegotiatingVersion);
        if let Some(version) = &config.cql_version {
            let request = Request::SetCqlVersion(version.clone());
            expect_ok("set_cql_version", checked(client.call(request, remaining()))?)?;
        }

        match checked(client.call(Request::DescribeVersion, remaining()))? {
            Response::Version(version) => Ok(version),
            other => Err(unexpected("describe_version", other)),
        }
    }

    /// Makes `client` the current session. Returns its generation, or `None`
    /// when the connection was closed in the meantime.
    fn install(&self, client: Arc<dyn RpcClient>, version: String) -> Option<u64> {
        let mut state = lock(&self.inner.state);
        if *state == ConnectionState::Closed {
            client.shutdown();
            return None;
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let session = Arc::new(Session {
            client,
            generation,
            version,
        });
        // Calls still running on the old session finish before it is dropped.
        let old = write(&self.inner.session).replace(session);
        *state = ConnectionState::Ready;
        drop(state);
        drop(old);

        Some(generation)
    }

    /// Replaces the session at end of life without leaving the ready state.
    fn refresh(&self) -> Result<(), Error> {
        let host = &self.inner.host;
        info!("handling connection end-of-life for {host}");

        let deadline = Instant::now() + self.inner.config.timeout;
        let keyspace = self.keyspace();
        let result = self.handshake(deadline, |_| {}).and_then(|(client, version)| {
            if let Some(keyspace) = keyspace {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let response = checked(client.call(Request::SetKeyspace(keyspace), Some(remaining)));
                if let Err(e) = response.and_then(|r| expect_ok("set_keyspace", r)) {
                    client.shutdown();
                    return Err(e);
                }
            }
            Ok((client, version))
        });

        match result {
            Ok((client, version)) => {
                let generation = self.install(client, version).ok_or_else(|| Error::NotConnected {
                    host: host.to_string(),
                })?;
                info!("successfully reconnected after connection end-of-life to {host}");
                self.set_healthy(true);
                self.emit(ConnectionEvent::Reconnected {
                    id: self.inner.id,
                    host: host.clone(),
                    generation,
                });
                Ok(())
            }
            Err(e) => {
                warn!("reconnection error for {host}: {e}");
                let session = write(&self.inner.session).take();
                if let Some(session) = session {
                    session.client.shutdown();
                }
                self.advance(ConnectionState::Errored);
                self.set_healthy(false);
                Err(e)
            }
        }
    }

    fn session(&self) -> Result<Arc<Session>, Error> {
        read(&self.inner.session)
            .clone()
            .ok_or_else(|| Error::NotConnected {
                host: self.inner.host.to_string(),
            })
    }

    fn call(&self, session: &Session, request: Request, timeout: Option<Duration>) -> Result<Response, Error> {
        match session.client.call(request, timeout) {
            Err(e @ (TransportError::TimedOut | TransportError::Closed)) => {
                self.fail_session(session.generation, &e);
                Err(e.into())
            }
            result => checked(result),
        }
    }

    /// Drops the session of `generation` after its transport gave out. A
    /// session installed since then is left alone.
    fn fail_session(&self, generation: u64, reason: &TransportError) {
        let failed = {
            let mut session = write(&self.inner.session);
            match session.as_ref() {
                Some(current) if current.generation == generation => session.take(),
                _ => None,
            }
        };
        let Some(failed) = failed else { return };

        failed.client.shutdown();
        warn!("session to {} lost: {reason}", self.inner.host);
        self.advance(ConnectionState::Errored);
        self.set_healthy(false);
    }

    fn query_request(&self, session: &Session, query: Vec<u8>, compression: Compression) -> Request {
        if select_cql3(self.inner.config.cql_version.as_deref(), &session.version) {
            Request::ExecuteCql3Query {
                query,
                compression,
                consistency: self.inner.config.consistency_level,
            }
        } else {
            Request::ExecuteCqlQuery { query, compression }
        }
    }

    /// Moves to `to` unless the connection has been closed.
    fn advance(&self, to: ConnectionState) {
        let mut state = lock(&self.inner.state);
        if *state != ConnectionState::Closed {
            *state = to;
        }
    }

    fn set_healthy(&self, healthy: bool) {
        if self.inner.healthy.swap(healthy, Ordering::AcqRel) != healthy {
            self.emit(ConnectionEvent::Health {
                id: self.inner.id,
                host: self.inner.host.clone(),
                healthy,
            });
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        let listeners = lock(&self.inner.listeners).clone();
        for listener in listeners {
            listener(&event);
        }
    }

    fn arm_timer(&self) -> Result<(), Error> {
        let (stop, signals) = mpsc::channel();
        let inner = Arc::downgrade(&self.inner);
        let ping_interval = self.inner.config.ping_interval;
        let ttl = self.inner.config.ttl;

        let handle = thread::Builder::new()
            .name(format!("connection-{}-timer", self.inner.id))
            .spawn(move || run_timer(inner, signals, ping_interval, ttl))?;

        if let Some(previous) = lock(&self.inner.timer).replace(Timer { stop, handle }) {
            let _ = previous.stop.send(());
        }
        Ok(())
    }

    fn stop_timer(&self) {
        let Some(timer) = lock(&self.inner.timer).take() else {
            return;
        };
        let _ = timer.stop.send(());
        if timer.handle.thread().id() != thread::current().id() {
            let _ = timer.handle.join();
        }
    }
}

fn run_timer(inner: Weak<Inner>, signals: mpsc::Receiver<()>, ping_interval: Duration, ttl: Duration) {
    let mut next_ping = Instant::now() + ping_interval;
    let mut end_of_life = Instant::now() + ttl;

    loop {
        let wake = next_ping.min(end_of_life);
        match signals.recv_timeout(wake.saturating_duration_since(Instant::now())) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        let Some(inner) = inner.upgrade() else { break };
        let connection = Connection { inner };

        let now = Instant::now();
        if now >= end_of_life {
            if connection.refresh().is_err() {
                break;
            }
            end_of_life = Instant::now() + ttl;
            next_ping = Instant::now() + ping_interval;
        } else if now >= next_ping {
            let _ = connection.ping();
            next_ping = Instant::now() + ping_interval;
        }
    }
}

/// Lifts store-side failures out of a transport result.
fn checked(result: Result<Response, TransportError>) -> Result<Response, Error> {
    match result? {
        Response::Err { code, why } => Err(Error::from_response(code, why)),
        response => Ok(response),
    }
}

fn expect_ok(request: &'static str, response: Response) -> Result<(), Error> {
    match response {
        Response::Ok => Ok(()),
        other => Err(unexpected(request, other)),
    }
}

fn unexpected(request: &'static str, response: Response) -> Error {
    Error::UnexpectedResponse {
        request,
        response: format!("{response:?}"),
    }
}

/// The cql3 call exists from API version 19.34 on and is only worth using
/// when version 3 of the query language was requested.
fn select_cql3(cql_version: Option<&str>, api_version: &str) -> bool {
    if !cql_version.is_some_and(|v| v.starts_with('3')) {
        return false;
    }
    let mut parts = api_version.split('.').map(|p| p.parse::<u32>().ok());
    matches!(
        (parts.next().flatten(), parts.next().flatten()),
        (Some(19), Some(minor)) if minor > 33
    )
}

fn deflate(query: &[u8]) -> Result<Vec<u8>, Error> {
    let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(query).map_err(Error::Compression)?;
    encoder.finish().map_err(Error::Compression)
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::ZlibDecoder;

    use super::*;

    struct Unreachable;

    impl Transport for Unreachable {
        fn open(&self, _: &Host, _: Duration) -> Result<Arc<dyn RpcClient>, TransportError> {
            Err(TransportError::TimedOut)
        }
    }

    fn connection() -> Connection {
        Connection::new(ConnectionConfig::default(), Arc::new(Unreachable)).unwrap()
    }

    #[test]
    fn cql3_selection() {
        let inputs = vec![
            (Some("3.0.0"), "19.36.0", true),
            (Some("3.0.0"), "19.33.0", false),
            (Some("3.0.0"), "20.1.0", false),
            (Some("2.0.0"), "19.36.0", false),
            (None, "19.36.0", false),
            (Some("3.0.0"), "garbage", false),
        ];

        for (cql, api, expected) in inputs {
            assert_eq!(select_cql3(cql, api), expected, "{cql:?} {api}");
        }
    }

    #[test]
    fn deflate_is_a_zlib_stream() {
        let query = b"SELECT * FROM users WHERE KEY = 'jdoe';".repeat(8);
        let compressed = deflate(&query).unwrap();
        assert!(compressed.len() < query.len());

        let mut inflated = Vec::new();
        ZlibDecoder::new(compressed.as_slice())
            .read_to_end(&mut inflated)
            .unwrap();
        assert_eq!(inflated, query);
    }

    #[test]
    fn connect_timeout_leaves_connection_errored() {
        let conn = connection();
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        let err = conn.connect().unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(conn.state(), ConnectionState::Errored);
        assert!(!conn.is_healthy());
    }

    #[test]
    fn requests_need_a_session() {
        let conn = connection();
        assert!(matches!(
            conn.execute(Request::DescribeVersion),
            Err(Error::NotConnected { .. })
        ));
        assert!(matches!(conn.use_keyspace(""), Err(Error::InvalidName { .. })));
    }

    #[test]
    fn close_is_idempotent() {
        let conn = connection();
        let closed = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&closed);
        conn.on_event(move |event| {
            if let ConnectionEvent::Closed { .. } = event {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        conn.close();
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(connection().id(), connection().id());
    }
}
