//! Client-store communication protocol.
//!
//! This module defines the remote procedure calls a client issues against the
//! store, the responses it gets back, and the transport abstraction that
//! carries them. The connection and pool layers only ever talk to the store
//! through the [`Transport`] and [`RpcClient`] traits.
//!
//! # Key Components
//!
//! - [`Request`] / [`Response`]: the RPC vocabulary.
//! - [`CqlResult`]: decoded result of a query; rows, a count, or nothing.
//! - [`Transport`]: dials a host and hands back an [`RpcClient`].
//! - [`ProtocolTransport`]: message framing over any byte stream.
//! - [`TcpTransport`]: the stock transport, one TCP socket per session.
//!
//! # Binary Format
//!
//! Messages are encoded with bincode using a big-endian, fixed-width integer
//! configuration. Enum discriminants give every message a stable tag, so a
//! message is self-delimiting on the stream without any extra framing header.
//!
//! # See Also
//!
//! - [`connection`](crate::connection): issues requests over one session.
//! - [`row`](crate::row): turns [`CqlResult::Rows`] into typed rows.
mod request;
mod response;
mod tcp;
mod transport;

pub use request::{Compression, ConsistencyLevel, Request};
pub use response::{
    ColumnDefinition, CqlMetadata, CqlResult, CqlRow, KeyspaceDefinition, Response,
    ResponseError, TableDefinition, WireColumn,
};
pub use tcp::{TcpClient, TcpTransport};
pub use transport::{ProtocolTransport, RpcClient, Transport, TransportError};
