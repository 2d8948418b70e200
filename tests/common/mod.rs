#![allow(dead_code)]

use std::{
    collections::{BTreeMap, HashMap},
    io::{self, Read},
    net::{SocketAddr, TcpListener},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use cassia::{
    Host,
    connection::PING_QUERY,
    protocol::{
        ColumnDefinition, Compression, CqlMetadata, CqlResult, CqlRow, KeyspaceDefinition,
        ProtocolTransport, Request, Response, ResponseError, RpcClient, TableDefinition,
        Transport, TransportError, WireColumn,
    },
};
use flate2::read::ZlibDecoder;

pub const VERSION: &str = "19.36.0";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn eventually(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Behaviour of one scripted store node.
#[derive(Debug, Clone)]
pub struct Node {
    pub up: bool,
    /// Ping queries never answer; the caller's deadline runs out.
    pub hang_pings: bool,
    pub version: String,
    pub credentials: Option<(String, String)>,
    pub keyspaces: BTreeMap<String, KeyspaceDefinition>,
    pub peers: Vec<String>,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            up: true,
            hang_pings: false,
            version: VERSION.into(),
            credentials: None,
            keyspaces: BTreeMap::from([("metrics".to_string(), keyspace("metrics"))]),
            peers: Vec::new(),
        }
    }
}

#[derive(Default)]
struct State {
    nodes: HashMap<String, Node>,
    opened: HashMap<String, usize>,
    live: HashMap<String, usize>,
    requests: Vec<(String, Request)>,
}

/// In-memory store reachable through [`Transport`].
#[derive(Clone, Default)]
pub struct Cluster {
    state: Arc<Mutex<State>>,
}

fn key(host: &str) -> String {
    host.parse::<Host>().unwrap().to_string()
}

impl Cluster {
    pub fn with_nodes(hosts: &[&str]) -> Self {
        let cluster = Self::default();
        for host in hosts {
            cluster.add(host, Node::default());
        }
        cluster
    }

    pub fn add(&self, host: &str, node: Node) {
        self.state.lock().unwrap().nodes.insert(key(host), node);
    }

    pub fn update(&self, host: &str, f: impl FnOnce(&mut Node)) {
        let mut state = self.state.lock().unwrap();
        f(state.nodes.get_mut(&key(host)).unwrap());
    }

    pub fn set_up(&self, host: &str, up: bool) {
        self.update(host, |node| node.up = up);
    }

    /// Sessions ever opened to `host`.
    pub fn opened(&self, host: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.opened.get(&key(host)).copied().unwrap_or_default()
    }

    /// Sessions to `host` not yet shut down.
    pub fn live(&self, host: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.live.get(&key(host)).copied().unwrap_or_default()
    }

    pub fn requests(&self, host: &str) -> Vec<Request> {
        let host = key(host);
        let state = self.state.lock().unwrap();
        state
            .requests
            .iter()
            .filter(|(h, _)| *h == host)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }
}

impl Transport for Cluster {
    fn open(&self, host: &Host, _timeout: Duration) -> Result<Arc<dyn RpcClient>, TransportError> {
        let host = host.to_string();
        let mut state = self.state.lock().unwrap();
        if !state.nodes.get(&host).is_some_and(|node| node.up) {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused).into());
        }
        *state.opened.entry(host.clone()).or_default() += 1;
        *state.live.entry(host.clone()).or_default() += 1;

        Ok(Arc::new(MockClient {
            host,
            cluster: self.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockClient {
    host: String,
    cluster: Cluster,
    closed: AtomicBool,
}

impl RpcClient for MockClient {
    fn call(&self, request: Request, timeout: Option<Duration>) -> Result<Response, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if timeout.is_some_and(|t| t.is_zero()) {
            return Err(TransportError::TimedOut);
        }

        let node = {
            let mut state = self.cluster.state.lock().unwrap();
            state.requests.push((self.host.clone(), request.clone()));
            state.nodes.get(&self.host).cloned()
        };
        let Some(node) = node.filter(|node| node.up) else {
            self.shutdown();
            return Err(TransportError::Closed);
        };

        if node.hang_pings && is_ping(&request) {
            thread::sleep(timeout.unwrap_or(Duration::from_secs(1)));
            self.shutdown();
            return Err(TransportError::TimedOut);
        }
        Ok(respond(&node, request))
    }

    fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let mut state = self.cluster.state.lock().unwrap();
            if let Some(live) = state.live.get_mut(&self.host) {
                *live -= 1;
            }
        }
    }
}

impl Drop for MockClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn is_ping(request: &Request) -> bool {
    match request {
        Request::ExecuteCqlQuery { query, .. } | Request::ExecuteCql3Query { query, .. } => {
            query == PING_QUERY
        }
        _ => false,
    }
}

fn failure(code: ResponseError, why: impl Into<String>) -> Response {
    Response::Err {
        code,
        why: why.into(),
    }
}

/// How a scripted node answers one request.
pub fn respond(node: &Node, request: Request) -> Response {
    match request {
        Request::Login { username, password } => match &node.credentials {
            Some((u, p)) if *u != username || *p != password => {
                failure(ResponseError::Authentication, "Invalid username or password")
            }
            _ => Response::Ok,
        },
        Request::SetCqlVersion(_) => Response::Ok,
        Request::DescribeVersion => Response::Version(node.version.clone()),
        Request::DescribeKeyspace(name) => match node.keyspaces.get(&name) {
            Some(definition) => Response::Keyspace(definition.clone()),
            None => failure(ResponseError::NotFound, format!("Keyspace {name} does not exist")),
        },
        Request::SetKeyspace(name) => {
            if node.keyspaces.contains_key(&name) {
                Response::Ok
            } else {
                failure(ResponseError::InvalidRequest, format!("Keyspace '{name}' does not exist"))
            }
        }
        Request::ExecuteCqlQuery { query, compression }
        | Request::ExecuteCql3Query {
            query, compression, ..
        } => Response::Cql(query_result(node, &inflate(query, compression))),
    }
}

fn inflate(query: Vec<u8>, compression: Compression) -> String {
    match compression {
        Compression::None => String::from_utf8(query).unwrap(),
        Compression::Gzip => {
            let mut text = String::new();
            ZlibDecoder::new(query.as_slice())
                .read_to_string(&mut text)
                .unwrap();
            text
        }
    }
}

fn text_schema() -> CqlMetadata {
    CqlMetadata {
        default_name_type: Some("UTF8Type".into()),
        default_value_type: Some("UTF8Type".into()),
        ..CqlMetadata::default()
    }
}

fn text_column(name: &str, value: &str) -> WireColumn {
    WireColumn {
        name: name.as_bytes().to_vec(),
        value: Some(value.as_bytes().to_vec()),
        timestamp: Some(1_700_000_000_000_000),
        ttl: None,
    }
}

/// Pings get an empty row set, `insert`s nothing, peers their list, and
/// anything else one row echoing the query text in column `query`.
fn query_result(node: &Node, query: &str) -> CqlResult {
    let lowered = query.trim().to_lowercase();
    if query.as_bytes() == PING_QUERY {
        CqlResult::Rows {
            schema: CqlMetadata::default(),
            rows: Vec::new(),
        }
    } else if lowered == "use system" || lowered.starts_with("insert") {
        CqlResult::Void
    } else if lowered == "select peer from system.peers" {
        CqlResult::Rows {
            schema: text_schema(),
            rows: node
                .peers
                .iter()
                .map(|peer| CqlRow {
                    key: Vec::new(),
                    columns: vec![text_column("peer", peer)],
                })
                .collect(),
        }
    } else if lowered.starts_with("select count") {
        CqlResult::Int(1)
    } else {
        CqlResult::Rows {
            schema: text_schema(),
            rows: vec![CqlRow {
                key: b"echo".to_vec(),
                columns: vec![text_column("query", query)],
            }],
        }
    }
}

pub fn keyspace(name: &str) -> KeyspaceDefinition {
    KeyspaceDefinition {
        name: name.into(),
        strategy_class: "SimpleStrategy".into(),
        strategy_options: BTreeMap::from([("replication_factor".into(), "1".into())]),
        tables: vec![TableDefinition {
            name: "users".into(),
            key_validation_class: Some("UTF8Type".into()),
            comparator_type: Some("UTF8Type".into()),
            default_validation_class: Some("UTF8Type".into()),
            column_metadata: vec![ColumnDefinition {
                name: b"age".to_vec(),
                validation_class: "Int32Type".into(),
            }],
        }],
    }
}

/// Serves `node` over loopback TCP, one thread per accepted socket.
pub fn serve(node: Node) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            let node = node.clone();
            thread::spawn(move || {
                let mut transport = ProtocolTransport::new(stream);
                while let Ok(request) = transport.read_request() {
                    if transport.write_response(&respond(&node, request)).is_err() {
                        break;
                    }
                }
            });
        }
    });

    addr
}

/// Accepts sockets and never answers on them.
pub fn serve_silently() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    thread::spawn(move || {
        let mut held = Vec::new();
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            held.push(stream);
        }
    });

    addr
}
