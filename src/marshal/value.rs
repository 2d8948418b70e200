use std::fmt;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Native value produced by, or handed to, a [`Marshaller`](super::Marshaller).
///
/// One variant exists per family of store types. Several primitive type names
/// share a variant: `UTF8Type` and `AsciiType` both map to [`Value::Text`],
/// `UUIDType`, `LexicalUUIDType` and `TimeUUIDType` all map to [`Value::Uuid`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// An absent cell, or an empty buffer for a non-byte type.
    Null,
    Bytes(Vec<u8>),
    Int(i32),
    Long(i64),
    /// Arbitrary-width two's-complement integer (`IntegerType`).
    VarInt(i128),
    Text(String),
    Float(f32),
    Double(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
    Uuid(Uuid),
    Counter(i64),
    Composite(Vec<Value>),
    List(Vec<Value>),
    Set(Vec<Value>),
    /// Key/value pairs; keys are unique, iteration order carries no meaning.
    Map(Vec<(Value, Value)>),
    /// A composite range-slice bound: the component plus whether the bound
    /// includes it. Only meaningful as an element of [`Value::Composite`].
    Bound { value: Box<Value>, inclusive: bool },
}

impl Value {
    /// Name of the variant, used in mismatch errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bytes(_) => "bytes",
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::VarInt(_) => "varint",
            Value::Text(_) => "text",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Boolean(_) => "boolean",
            Value::Timestamp(_) => "timestamp",
            Value::Uuid(_) => "uuid",
            Value::Counter(_) => "counter",
            Value::Composite(_) => "composite",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Map(_) => "map",
            Value::Bound { .. } => "bound",
        }
    }

    /// Wraps `self` as an exclusive range bound.
    pub fn exclusive(self) -> Value {
        Value::Bound {
            value: Box::new(self),
            inclusive: false,
        }
    }

    /// Wraps `self` as an inclusive range bound.
    pub fn inclusive(self) -> Value {
        Value::Bound {
            value: Box::new(self),
            inclusive: true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int(v) => Some(v.into()),
            Value::Long(v) | Value::Counter(v) => Some(v),
            Value::VarInt(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bytes(bytes) => {
                for b in bytes {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            Value::Int(v) => write!(f, "{v}"),
            Value::Long(v) | Value::Counter(v) => write!(f, "{v}"),
            Value::VarInt(v) => write!(f, "{v}"),
            Value::Text(s) => write!(f, "{s}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
            Value::Uuid(u) => write!(f, "{u}"),
            Value::Composite(parts) => write_joined(f, parts, ":"),
            Value::List(items) => {
                write!(f, "[")?;
                write_joined(f, items, ", ")?;
                write!(f, "]")
            }
            Value::Set(items) => {
                write!(f, "{{")?;
                write_joined(f, items, ", ")?;
                write!(f, "}}")
            }
            Value::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::Bound { value, .. } => write!(f, "{value}"),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, items: &[Value], sep: &str) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, "{sep}")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Long(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<Uuid> for Value {
    fn from(value: Uuid) -> Self {
        Value::Uuid(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_display_joins_components() {
        let value = Value::Composite(vec!["abc".into(), 42.into()]);
        assert_eq!(value.to_string(), "abc:42");
    }

    #[test]
    fn bytes_display_as_hex() {
        assert_eq!(Value::Bytes(vec![0x0a, 0xff]).to_string(), "0aff");
    }

    #[test]
    fn bound_helpers() {
        let bound = Value::from("a").exclusive();
        assert_eq!(
            bound,
            Value::Bound {
                value: Box::new(Value::Text("a".into())),
                inclusive: false
            }
        );
    }

    #[test]
    fn integer_widening() {
        assert_eq!(Value::Int(-3).as_i64(), Some(-3));
        assert_eq!(Value::VarInt(i128::MAX).as_i64(), None);
    }
}
