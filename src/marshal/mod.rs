//! Type marshalling between store type descriptors and native values.
//!
//! The store describes every column name, column value and row key with a
//! type-descriptor string. This module turns those strings into a
//! [`TypeDescriptor`] tree and, from the tree, into a [`Marshaller`] that
//! converts between [`Value`]s and the binary form the store expects.
//!
//! # Overview
//!
//! - [`TypeDescriptor`]: permissive parse of a (possibly nested) descriptor.
//! - [`Primitive`]: the codec table, one entry per primitive type name.
//! - [`Marshaller`]: resolves a descriptor against the codec table once and
//!   reuses the resolution for every serialize/deserialize call.
//!
//! # Binary Format
//!
//! Composite values are encoded component by component as
//! `{u16 length}{component bytes}{end-of-component byte}`. The
//! end-of-component byte is `0x00` except on range-slice bounds, where it
//! tells the store whether the bound includes the component (see [`Slice`]).
//!
//! Collections are `{u16 cardinality}` followed by length-prefixed elements
//! (`{u16 length}{bytes}`), maps by length-prefixed key/value pairs. Set
//! elements carry two trailing zero bytes each.
//!
//! Reversed types encode exactly like their inner type; the reversal only
//! changes ordering on the store.
//!
//! # Example
//! ```rust
//! use cassia::marshal::{Marshaller, Value};
//!
//! let marshaller = Marshaller::parse("CompositeType(UTF8Type,Int32Type)");
//! let value = Value::Composite(vec!["abc".into(), 42.into()]);
//!
//! let bytes = marshaller.serialize(&value).unwrap();
//! assert_eq!(marshaller.deserialize(&bytes).unwrap(), value);
//! ```
mod codec;
mod descriptor;
mod timeuuid;
mod value;

use thiserror::Error;

pub use codec::{Primitive, decode_varint, encode_varint};
pub use descriptor::{DEFAULT_TYPE, TypeDescriptor};
pub use timeuuid::{time_uuid, time_uuid_timestamp};
pub use value::Value;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MarshalError {
    #[error("[marshal][resolve]: unknown type '{0}'")]
    UnknownType(String),

    #[error("[marshal][{type_name}]: cannot encode a {found} value")]
    Mismatch {
        type_name: &'static str,
        found: &'static str,
    },

    #[error("[marshal][{type_name}]: value {value} out of range")]
    Overflow {
        type_name: &'static str,
        value: String,
    },

    #[error("[marshal][{type_name}]: expected {expected} bytes, found {found}")]
    Length {
        type_name: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("[marshal][{type_name}]: {reason}")]
    Encode {
        type_name: &'static str,
        reason: String,
    },

    #[error("[marshal][decode]: buffer truncated, needed {needed} bytes but {remaining} remain")]
    Truncated { needed: usize, remaining: usize },

    #[error("[marshal][composite]: {found} components supplied for a {expected}-component type")]
    Components { expected: usize, found: usize },
}

/// Direction of a range-slice bound being serialized.
///
/// Only composite types react to it: it selects the end-of-component byte of
/// the last component and of components wrapped in [`Value::Bound`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slice {
    Start,
    End,
}

const EOC_NONE: u8 = 0x00;
const EOC_LOW: u8 = 0x01;
const EOC_HIGH: u8 = 0xff;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Plan {
    Primitive(Primitive),
    Composite(Vec<Plan>),
    Reversed(Box<Plan>),
    Set(Box<Plan>),
    List(Box<Plan>),
    Map(Box<Plan>, Box<Plan>),
}

impl Plan {
    fn resolve(descriptor: &TypeDescriptor) -> Result<Self, MarshalError> {
        Ok(match descriptor {
            TypeDescriptor::Primitive(name) => Plan::Primitive(
                Primitive::from_name(name).ok_or_else(|| MarshalError::UnknownType(name.clone()))?,
            ),
            TypeDescriptor::Composite(parts) => {
                Plan::Composite(parts.iter().map(Plan::resolve).collect::<Result<_, _>>()?)
            }
            TypeDescriptor::Reversed(inner) => Plan::Reversed(Box::new(Plan::resolve(inner)?)),
            TypeDescriptor::Set(inner) => Plan::Set(Box::new(Plan::resolve(inner)?)),
            TypeDescriptor::List(inner) => Plan::List(Box::new(Plan::resolve(inner)?)),
            TypeDescriptor::Map(key, value) => Plan::Map(
                Box::new(Plan::resolve(key)?),
                Box::new(Plan::resolve(value)?),
            ),
        })
    }

    fn serialize(&self, value: &Value, slice: Option<Slice>) -> Result<Vec<u8>, MarshalError> {
        match self {
            Plan::Primitive(p) => p.encode(value),
            Plan::Reversed(inner) => inner.serialize(value, slice),
            Plan::Composite(parts) => serialize_composite(parts, value, slice),
            Plan::Set(element) | Plan::List(element) => {
                let items = match value {
                    Value::Set(items) | Value::List(items) => items,
                    other => {
                        return Err(MarshalError::Mismatch {
                            type_name: self.name(),
                            found: other.kind(),
                        });
                    }
                };
                let mut out = length_prefix(items.len(), self.name())?.to_vec();
                for item in items {
                    write_prefixed(&mut out, &element.serialize(item, None)?, self.name())?;
                    if let Plan::Set(_) = self {
                        out.extend_from_slice(&[0, 0]);
                    }
                }
                Ok(out)
            }
            Plan::Map(key, val) => {
                let Value::Map(entries) = value else {
                    return Err(MarshalError::Mismatch {
                        type_name: self.name(),
                        found: value.kind(),
                    });
                };
                let mut out = length_prefix(entries.len(), self.name())?.to_vec();
                for (k, v) in entries {
                    write_prefixed(&mut out, &key.serialize(k, None)?, self.name())?;
                    write_prefixed(&mut out, &val.serialize(v, None)?, self.name())?;
                }
                Ok(out)
            }
        }
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, MarshalError> {
        match self {
            Plan::Primitive(p) => p.decode(bytes),
            Plan::Reversed(inner) => inner.deserialize(bytes),
            Plan::Composite(parts) => {
                let mut reader = Reader::new(bytes);
                let mut out = Vec::new();
                while !reader.is_empty() {
                    let plan = parts.get(out.len()).ok_or(MarshalError::Components {
                        expected: parts.len(),
                        found: out.len() + 1,
                    })?;
                    let component = reader.prefixed()?;
                    reader.take(1)?;
                    out.push(plan.deserialize(component)?);
                }
                Ok(Value::Composite(out))
            }
            Plan::Set(element) | Plan::List(element) => {
                let mut reader = Reader::new(bytes);
                if reader.is_empty() {
                    return Ok(self.collection(Vec::new()));
                }
                let count = reader.u16()?;
                let mut items = Vec::with_capacity(count.into());
                for _ in 0..count {
                    items.push(element.deserialize(reader.prefixed()?)?);
                    if let Plan::Set(_) = self {
                        reader.take(2)?;
                    }
                }
                Ok(self.collection(items))
            }
            Plan::Map(key, val) => {
                let mut reader = Reader::new(bytes);
                if reader.is_empty() {
                    return Ok(Value::Map(Vec::new()));
                }
                let count = reader.u16()?;
                let mut entries = Vec::with_capacity(count.into());
                for _ in 0..count {
                    let k = key.deserialize(reader.prefixed()?)?;
                    let v = val.deserialize(reader.prefixed()?)?;
                    entries.push((k, v));
                }
                Ok(Value::Map(entries))
            }
        }
    }

    fn collection(&self, items: Vec<Value>) -> Value {
        match self {
            Plan::Set(_) => Value::Set(items),
            _ => Value::List(items),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Plan::Primitive(p) => p.name(),
            Plan::Composite(_) => "CompositeType",
            Plan::Reversed(_) => "ReversedType",
            Plan::Set(_) => "SetType",
            Plan::List(_) => "ListType",
            Plan::Map(..) => "MapType",
        }
    }
}

fn serialize_composite(
    parts: &[Plan],
    value: &Value,
    slice: Option<Slice>,
) -> Result<Vec<u8>, MarshalError> {
    let components = match value {
        Value::Composite(components) => components.as_slice(),
        single => std::slice::from_ref(single),
    };
    if components.len() > parts.len() {
        return Err(MarshalError::Components {
            expected: parts.len(),
            found: components.len(),
        });
    }

    let mut out = Vec::new();
    let last = components.len().saturating_sub(1);
    for (i, (component, plan)) in components.iter().zip(parts).enumerate() {
        let (inner, inclusive) = match component {
            Value::Bound { value, inclusive } => (value.as_ref(), Some(*inclusive)),
            plain => (plain, None),
        };

        let eoc = match (inclusive, slice) {
            (Some(true), Some(Slice::Start)) | (Some(false), Some(Slice::End)) => EOC_HIGH,
            (Some(true), Some(Slice::End)) | (Some(false), Some(Slice::Start)) => EOC_LOW,
            (None, Some(Slice::Start)) if i == last => EOC_HIGH,
            (None, Some(Slice::End)) if i == last => EOC_LOW,
            _ => EOC_NONE,
        };

        write_prefixed(&mut out, &plan.serialize(inner, None)?, "CompositeType")?;
        out.push(eoc);
    }

    Ok(out)
}

fn length_prefix(len: usize, type_name: &'static str) -> Result<[u8; 2], MarshalError> {
    u16::try_from(len)
        .map(u16::to_be_bytes)
        .map_err(|_| MarshalError::Overflow {
            type_name,
            value: len.to_string(),
        })
}

fn write_prefixed(
    out: &mut Vec<u8>,
    bytes: &[u8],
    type_name: &'static str,
) -> Result<(), MarshalError> {
    out.extend_from_slice(&length_prefix(bytes.len(), type_name)?);
    out.extend_from_slice(bytes);
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], MarshalError> {
        let remaining = self.buf.len() - self.pos;
        if n > remaining {
            return Err(MarshalError::Truncated {
                needed: n,
                remaining,
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, MarshalError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn prefixed(&mut self) -> Result<&'a [u8], MarshalError> {
        let len = self.u16()?;
        self.take(len.into())
    }
}

/// Serializer/deserializer pair for one type descriptor.
///
/// The descriptor is resolved against the codec table when the marshaller is
/// built. An unknown primitive does not fail construction; it surfaces as
/// [`MarshalError::UnknownType`] from every later call.
#[derive(Debug, Clone)]
pub struct Marshaller {
    descriptor: TypeDescriptor,
    plan: Result<Plan, MarshalError>,
}

impl Marshaller {
    pub fn new(descriptor: TypeDescriptor) -> Self {
        let plan = Plan::resolve(&descriptor);
        Self { descriptor, plan }
    }

    /// Builds a marshaller straight from a descriptor string.
    pub fn parse(descriptor: &str) -> Self {
        Self::new(TypeDescriptor::parse(descriptor))
    }

    pub fn descriptor(&self) -> &TypeDescriptor {
        &self.descriptor
    }

    pub fn is_composite(&self) -> bool {
        self.descriptor.is_composite()
    }

    pub fn serialize(&self, value: &Value) -> Result<Vec<u8>, MarshalError> {
        self.plan()?.serialize(value, None)
    }

    /// Serializes `value` as the start or end bound of a range slice.
    pub fn serialize_bound(&self, value: &Value, slice: Slice) -> Result<Vec<u8>, MarshalError> {
        self.plan()?.serialize(value, Some(slice))
    }

    pub fn deserialize(&self, bytes: &[u8]) -> Result<Value, MarshalError> {
        self.plan()?.deserialize(bytes)
    }

    fn plan(&self) -> Result<&Plan, MarshalError> {
        self.plan.as_ref().map_err(Clone::clone)
    }
}

impl Default for Marshaller {
    fn default() -> Self {
        Self::new(TypeDescriptor::default())
    }
}
