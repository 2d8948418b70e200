use bincode::{Decode, Encode};
use serde::Deserialize;

/// Compression applied to a query payload before it is sent.
#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub enum Compression {
    #[default]
    None,
    /// zlib stream.
    Gzip,
}

#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsistencyLevel {
    Any,
    One,
    Two,
    Three,
    #[default]
    Quorum,
    LocalQuorum,
    EachQuorum,
    All,
}

/// Remote procedure calls understood by the store.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub enum Request {
    Login {
        username: String,
        password: String,
    },
    SetCqlVersion(String),
    DescribeVersion,
    DescribeKeyspace(String),
    SetKeyspace(String),
    ExecuteCqlQuery {
        query: Vec<u8>,
        compression: Compression,
    },
    ExecuteCql3Query {
        query: Vec<u8>,
        compression: Compression,
        consistency: ConsistencyLevel,
    },
}

impl Request {
    /// RPC command name, as it appears in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Login { .. } => "login",
            Request::SetCqlVersion(_) => "set_cql_version",
            Request::DescribeVersion => "describe_version",
            Request::DescribeKeyspace(_) => "describe_keyspace",
            Request::SetKeyspace(_) => "set_keyspace",
            Request::ExecuteCqlQuery { .. } => "execute_cql_query",
            Request::ExecuteCql3Query { .. } => "execute_cql3_query",
        }
    }
}
