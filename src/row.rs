//! Typed rows decoded from a query result.
//!
//! A [`Row`] owns its columns in the order the store returned them plus a
//! name index, so columns are reachable both by position and by name.
use std::{
    collections::HashMap,
    fmt,
    ops::{Bound, RangeBounds},
    sync::Arc,
};

use chrono::{DateTime, Utc};

use crate::{
    Error,
    marshal::{DEFAULT_TYPE, Marshaller, Value},
    protocol::{CqlMetadata, CqlResult, CqlRow, WireColumn},
};

/// Name of the vestigial key column a `SELECT *` returns first.
const KEY_COLUMN: &[u8] = b"KEY";

/// A named, timestamped, optionally expiring value.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: Value,
    pub value: Value,
    pub timestamp: Option<DateTime<Utc>>,
    pub ttl: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct Row {
    key: Vec<u8>,
    columns: Vec<Column>,
    index: HashMap<String, usize>,
    schema: Arc<CqlMetadata>,
}

impl Row {
    /// Decodes one wire row against `schema`.
    pub fn decode(row: CqlRow, schema: Arc<CqlMetadata>) -> Result<Self, Error> {
        RowDecoder::new(schema).decode(row)
    }

    fn from_parts(key: Vec<u8>, columns: Vec<Column>, schema: Arc<CqlMetadata>) -> Self {
        let mut index = HashMap::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            index.entry(name_key(&column.name)).or_insert(i);
        }
        Self {
            key,
            columns,
            index,
            schema,
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn schema(&self) -> &CqlMetadata {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }

    /// Looks a column up by the text of its name; untyped names are read as
    /// UTF-8. When names repeat, the first column wins.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.index.get(name).map(|&i| &self.columns[i])
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Column> {
        self.columns.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &Value> {
        self.columns.iter().map(|c| &c.name)
    }

    /// A new row holding the columns at positions in `range`.
    pub fn slice(&self, range: impl RangeBounds<usize>) -> Row {
        let start = match range.start_bound() {
            Bound::Included(&i) => i,
            Bound::Excluded(&i) => i.saturating_add(1),
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(&i) => i.saturating_add(1),
            Bound::Excluded(&i) => i,
            Bound::Unbounded => self.columns.len(),
        };
        let end = end.min(self.columns.len());
        let columns = self
            .columns
            .get(start..end)
            .map(<[Column]>::to_vec)
            .unwrap_or_default();
        Row::from_parts(self.key.clone(), columns, Arc::clone(&self.schema))
    }

    /// A new row holding the columns whose names sort in `[start, end)`.
    /// Missing bounds default to `" "` and `"~"`, which cover printable ASCII.
    pub fn name_slice(&self, start: Option<&str>, end: Option<&str>) -> Row {
        let start = start.unwrap_or(" ");
        let end = end.unwrap_or("~");
        let columns = self
            .columns
            .iter()
            .filter(|c| {
                let name = name_key(&c.name);
                name.as_str() >= start && name.as_str() < end
            })
            .cloned()
            .collect();
        Row::from_parts(self.key.clone(), columns, Arc::clone(&self.schema))
    }
}

impl<'a> IntoIterator for &'a Row {
    type Item = &'a Column;
    type IntoIter = std::slice::Iter<'a, Column>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.names().map(name_key).collect();
        write!(
            f,
            "<Row: Key: '{}', ColumnCount: {}, Columns: [ '{}' ]>",
            String::from_utf8_lossy(&self.key),
            self.len(),
            names.join("','")
        )
    }
}

/// Text under which a column name is indexed, sliced and displayed.
fn name_key(name: &Value) -> String {
    match name {
        Value::Text(text) => text.clone(),
        Value::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        other => other.to_string(),
    }
}

/// Decodes rows sharing one schema, building each distinct marshaller once.
#[derive(Debug)]
pub struct RowDecoder {
    schema: Arc<CqlMetadata>,
    marshallers: HashMap<String, Marshaller>,
}

impl RowDecoder {
    pub fn new(schema: Arc<CqlMetadata>) -> Self {
        Self {
            schema,
            marshallers: HashMap::new(),
        }
    }

    pub fn decode(&mut self, row: CqlRow) -> Result<Row, Error> {
        let CqlRow { key, columns } = row;
        let mut decoded = Vec::with_capacity(columns.len());

        for (i, column) in columns.into_iter().enumerate() {
            if i == 0 && column.name == KEY_COLUMN {
                continue;
            }
            decoded.push(self.column(column)?);
        }

        Ok(Row::from_parts(key, decoded, Arc::clone(&self.schema)))
    }

    fn column(&mut self, column: WireColumn) -> Result<Column, Error> {
        let name_type = self
            .schema
            .name_types
            .get(&column.name)
            .or(self.schema.default_name_type.as_ref())
            .cloned()
            .unwrap_or_else(|| DEFAULT_TYPE.to_string());
        let value_type = self
            .schema
            .value_types
            .get(&column.name)
            .or(self.schema.default_value_type.as_ref())
            .cloned()
            .unwrap_or_else(|| DEFAULT_TYPE.to_string());

        let name = self.marshaller(&name_type).deserialize(&column.name)?;
        let value = match column.value {
            Some(bytes) => self.marshaller(&value_type).deserialize(&bytes)?,
            None => Value::Null,
        };
        let timestamp = column
            .timestamp
            .and_then(|micros| DateTime::from_timestamp_millis(micros.div_euclid(1000)));

        Ok(Column {
            name,
            value,
            timestamp,
            ttl: column.ttl,
        })
    }

    fn marshaller(&mut self, type_name: &str) -> &Marshaller {
        self.marshallers
            .entry(type_name.to_string())
            .or_insert_with(|| Marshaller::parse(type_name))
    }
}

/// Decoded outcome of a query.
#[derive(Debug, Clone)]
pub enum QueryResult {
    Rows(Vec<Row>),
    Count(i32),
    Void,
}

impl QueryResult {
    pub fn decode(result: CqlResult) -> Result<Self, Error> {
        match result {
            CqlResult::Rows { schema, rows } => {
                let mut decoder = RowDecoder::new(Arc::new(schema));
                let rows = rows
                    .into_iter()
                    .map(|row| decoder.decode(row))
                    .collect::<Result<_, _>>()?;
                Ok(QueryResult::Rows(rows))
            }
            CqlResult::Int(n) => Ok(QueryResult::Count(n)),
            CqlResult::Void => Ok(QueryResult::Void),
        }
    }

    /// The decoded rows; empty for counts and void results.
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            QueryResult::Rows(rows) => rows,
            _ => Vec::new(),
        }
    }
}
