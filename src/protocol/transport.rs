use std::{
    io::{self, Read, Write},
    sync::Arc,
    time::Duration,
};

use bincode::{
    config::{BigEndian, Configuration, Fixint},
    decode_from_std_read, encode_into_std_write,
    error::{DecodeError, EncodeError},
};
use thiserror::Error;

use crate::config::Host;

use super::{Request, Response};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to encode message: {0}")]
    Serialize(EncodeError),
    #[error("failed to decode message: {0}")]
    Deserialize(DecodeError),
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("transport deadline elapsed")]
    TimedOut,
    #[error("transport closed")]
    Closed,
}

impl From<EncodeError> for TransportError {
    fn from(value: EncodeError) -> Self {
        match value {
            EncodeError::Io { inner, .. } => io_error(inner),
            other => TransportError::Serialize(other),
        }
    }
}

impl From<DecodeError> for TransportError {
    fn from(value: DecodeError) -> Self {
        match value {
            DecodeError::Io { inner, .. } => io_error(inner),
            other => TransportError::Deserialize(other),
        }
    }
}

/// Folds socket-level timeouts and hang-ups into dedicated variants.
pub(crate) fn io_error(err: io::Error) -> TransportError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => TransportError::TimedOut,
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => TransportError::Closed,
        _ => TransportError::Io(err),
    }
}

/// Opens client sessions to store hosts.
pub trait Transport: Send + Sync {
    /// Dials `host`, giving up after `timeout`.
    fn open(&self, host: &Host, timeout: Duration) -> Result<Arc<dyn RpcClient>, TransportError>;
}

/// One open session able to issue RPCs.
///
/// Implementations must pair every response with the request that produced
/// it when `call` is invoked from several threads at once.
pub trait RpcClient: Send + Sync {
    /// Issues `request` and waits for its response. When `timeout` elapses
    /// first the call fails with [`TransportError::TimedOut`].
    fn call(&self, request: Request, timeout: Option<Duration>) -> Result<Response, TransportError>;

    /// Forcibly tears the session down. Later calls fail with
    /// [`TransportError::Closed`]; a response still in flight is discarded.
    fn shutdown(&self);
}

/// Message framing over any byte stream.
pub struct ProtocolTransport<T: Read + Write> {
    stream: T,
    config: Configuration<BigEndian, Fixint>,
}

impl<T: Read + Write> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        let config = bincode::config::standard()
            .with_big_endian()
            .with_fixed_int_encoding();
        Self { stream, config }
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn write_request(&mut self, req: &Request) -> Result<(), TransportError> {
        encode_into_std_write(req, &mut self.stream, self.config)?;
        self.stream.flush().map_err(io_error)?;
        Ok(())
    }

    pub fn write_response(&mut self, resp: &Response) -> Result<(), TransportError> {
        encode_into_std_write(resp, &mut self.stream, self.config)?;
        self.stream.flush().map_err(io_error)?;
        Ok(())
    }

    pub fn read_response(&mut self) -> Result<Response, TransportError> {
        let resp: Response = decode_from_std_read(&mut self.stream, self.config)?;
        Ok(resp)
    }

    pub fn read_request(&mut self) -> Result<Request, TransportError> {
        let req: Request = decode_from_std_read(&mut self.stream, self.config)?;
        Ok(req)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Seek};

    use crate::protocol::{CqlMetadata, CqlResult, CqlRow, WireColumn};

    use super::*;

    #[test]
    fn read_write_request() {
        let stream = Cursor::new(Vec::new());
        let mut transport = ProtocolTransport::new(stream);

        transport
            .write_request(&Request::SetKeyspace("metrics".into()))
            .unwrap();
        transport.stream.seek(std::io::SeekFrom::Start(0)).unwrap();
        let req = transport.read_request().unwrap();
        assert_eq!(req, Request::SetKeyspace("metrics".into()));
    }

    #[test]
    fn read_write_response() {
        let stream = Cursor::new(Vec::new());
        let mut transport = ProtocolTransport::new(stream);
        let resp = Response::Cql(CqlResult::Rows {
            schema: CqlMetadata::default(),
            rows: vec![CqlRow {
                key: b"k".to_vec(),
                columns: vec![WireColumn {
                    name: b"c".to_vec(),
                    value: Some(vec![1]),
                    timestamp: Some(1_000),
                    ttl: None,
                }],
            }],
        });

        transport.write_response(&resp).unwrap();
        transport.stream.seek(std::io::SeekFrom::Start(0)).unwrap();
        assert_eq!(transport.read_response().unwrap(), resp);
    }

    #[test]
    fn eof_reads_as_closed() {
        let mut transport = ProtocolTransport::new(Cursor::new(Vec::new()));
        assert!(matches!(
            transport.read_response(),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn socket_timeouts_fold_into_timed_out() {
        let err = io_error(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(matches!(err, TransportError::TimedOut));
    }
}
