use std::collections::BTreeMap;

use bincode::{Decode, Encode};

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub enum Response {
    Ok,
    Version(String),
    Keyspace(KeyspaceDefinition),
    Cql(CqlResult),
    Err { code: ResponseError, why: String },
}

/// Failure classes the store reports.
#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum ResponseError {
    InvalidRequest,
    NotFound,
    Authentication,
    Authorization,
    Unavailable,
    TimedOut,
    SchemaDisagreement,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub enum CqlResult {
    Rows { schema: CqlMetadata, rows: Vec<CqlRow> },
    Int(i32),
    Void,
}

/// Type information for decoding a set of rows. Per-column overrides are
/// keyed by the raw column name; `None` defaults mean `BytesType`.
#[derive(Debug, Clone, Default, Encode, Decode, PartialEq, Eq)]
pub struct CqlMetadata {
    pub name_types: BTreeMap<Vec<u8>, String>,
    pub value_types: BTreeMap<Vec<u8>, String>,
    pub default_name_type: Option<String>,
    pub default_value_type: Option<String>,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct CqlRow {
    pub key: Vec<u8>,
    pub columns: Vec<WireColumn>,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct WireColumn {
    pub name: Vec<u8>,
    pub value: Option<Vec<u8>>,
    /// Microseconds since the epoch.
    pub timestamp: Option<i64>,
    pub ttl: Option<i32>,
}

#[derive(Debug, Clone, Default, Encode, Decode, PartialEq, Eq)]
pub struct KeyspaceDefinition {
    pub name: String,
    pub strategy_class: String,
    pub strategy_options: BTreeMap<String, String>,
    pub tables: Vec<TableDefinition>,
}

#[derive(Debug, Clone, Default, Encode, Decode, PartialEq, Eq)]
pub struct TableDefinition {
    pub name: String,
    pub key_validation_class: Option<String>,
    pub comparator_type: Option<String>,
    pub default_validation_class: Option<String>,
    pub column_metadata: Vec<ColumnDefinition>,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub name: Vec<u8>,
    pub validation_class: String,
}
