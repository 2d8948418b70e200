use std::{
    net::{Shutdown, TcpStream, ToSocketAddrs},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use log::{debug, trace};

use crate::config::Host;

use super::{
    ProtocolTransport, Request, Response, RpcClient, Transport, TransportError,
    transport::io_error,
};

/// [`Transport`] over plain TCP sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport;

impl Transport for TcpTransport {
    fn open(&self, host: &Host, timeout: Duration) -> Result<Arc<dyn RpcClient>, TransportError> {
        let mut last = None;

        for addr in (host.name.as_str(), host.port).to_socket_addrs()? {
            debug!("dialing {host} at {addr}");
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Ok(Arc::new(TcpClient::new(stream)?)),
                Err(e) => last = Some(io_error(e)),
            }
        }

        Err(last.unwrap_or(TransportError::Closed))
    }
}

/// One socket. Calls are serialized on the socket, so every response read
/// belongs to the request just written.
pub struct TcpClient {
    transport: Mutex<ProtocolTransport<TcpStream>>,
    socket: TcpStream,
    closed: AtomicBool,
}

impl TcpClient {
    pub fn new(stream: TcpStream) -> Result<Self, TransportError> {
        stream.set_nodelay(true)?;
        let socket = stream.try_clone()?;
        Ok(Self {
            transport: Mutex::new(ProtocolTransport::new(stream)),
            socket,
            closed: AtomicBool::new(false),
        })
    }
}

impl RpcClient for TcpClient {
    fn call(&self, request: Request, timeout: Option<Duration>) -> Result<Response, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if timeout.is_some_and(|t| t.is_zero()) {
            return Err(TransportError::TimedOut);
        }

        let mut transport = self.transport.lock().unwrap_or_else(PoisonError::into_inner);
        let stream = transport.get_ref();
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)?;

        trace!("calling {}", request.name());
        let result = transport
            .write_request(&request)
            .and_then(|_| transport.read_response());

        // A late response would be read by the next caller; the socket is
        // useless once a call fails midway.
        if let Err(TransportError::TimedOut | TransportError::Deserialize(_)) = result {
            self.shutdown();
        }
        result
    }

    fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.socket.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}
