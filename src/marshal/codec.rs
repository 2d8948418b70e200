//! Per-primitive encode/decode table.
//!
//! Every primitive type name the store can report maps onto one [`Primitive`].
//! Numbers are big-endian, timestamps are milliseconds since the epoch stored
//! as a 64-bit integer, UUIDs use the standard 16-byte layout.
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{MarshalError, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Bytes,
    Long,
    VarInt,
    Int32,
    Utf8,
    Ascii,
    LexicalUuid,
    TimeUuid,
    Uuid,
    Counter,
    Float,
    Double,
    /// Carried as an IEEE double; the store-side arbitrary precision is not modelled.
    Decimal,
    Date,
    Timestamp,
    Boolean,
}

impl Primitive {
    /// Looks up the codec for a bare type name.
    pub fn from_name(name: &str) -> Option<Self> {
        let primitive = match name {
            "BytesType" => Primitive::Bytes,
            "LongType" => Primitive::Long,
            "IntegerType" => Primitive::VarInt,
            "Int32Type" => Primitive::Int32,
            "UTF8Type" => Primitive::Utf8,
            "AsciiType" => Primitive::Ascii,
            "LexicalUUIDType" => Primitive::LexicalUuid,
            "TimeUUIDType" => Primitive::TimeUuid,
            "UUIDType" => Primitive::Uuid,
            "CounterColumnType" => Primitive::Counter,
            "FloatType" => Primitive::Float,
            "DoubleType" => Primitive::Double,
            "DecimalType" => Primitive::Decimal,
            "DateType" => Primitive::Date,
            "TimestampType" => Primitive::Timestamp,
            "BooleanType" => Primitive::Boolean,
            _ => return None,
        };
        Some(primitive)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Primitive::Bytes => "BytesType",
            Primitive::Long => "LongType",
            Primitive::VarInt => "IntegerType",
            Primitive::Int32 => "Int32Type",
            Primitive::Utf8 => "UTF8Type",
            Primitive::Ascii => "AsciiType",
            Primitive::LexicalUuid => "LexicalUUIDType",
            Primitive::TimeUuid => "TimeUUIDType",
            Primitive::Uuid => "UUIDType",
            Primitive::Counter => "CounterColumnType",
            Primitive::Float => "FloatType",
            Primitive::Double => "DoubleType",
            Primitive::Decimal => "DecimalType",
            Primitive::Date => "DateType",
            Primitive::Timestamp => "TimestampType",
            Primitive::Boolean => "BooleanType",
        }
    }

    pub fn encode(&self, value: &Value) -> Result<Vec<u8>, MarshalError> {
        if let Value::Null = value {
            return Ok(Vec::new());
        }

        let bytes = match (self, value) {
            (Primitive::Bytes, Value::Bytes(b)) => b.clone(),
            (Primitive::Bytes, Value::Text(s)) => s.as_bytes().to_vec(),
            (Primitive::Long, v) | (Primitive::Counter, v) => self.integer(v)?.to_be_bytes().to_vec(),
            (Primitive::Int32, Value::Int(v)) => v.to_be_bytes().to_vec(),
            (Primitive::Int32, v @ (Value::Long(_) | Value::VarInt(_))) => {
                let wide = self.integer(v)?;
                i32::try_from(wide)
                    .map_err(|_| MarshalError::Overflow {
                        type_name: self.name(),
                        value: wide.to_string(),
                    })?
                    .to_be_bytes()
                    .to_vec()
            }
            (Primitive::VarInt, Value::VarInt(v)) => encode_varint(*v),
            (Primitive::VarInt, v) => encode_varint(self.integer(v)?.into()),
            (Primitive::Utf8, Value::Text(s)) => s.as_bytes().to_vec(),
            (Primitive::Ascii, Value::Text(s)) => s
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect(),
            (Primitive::Uuid | Primitive::LexicalUuid | Primitive::TimeUuid, Value::Uuid(u)) => {
                u.as_bytes().to_vec()
            }
            (Primitive::Uuid | Primitive::LexicalUuid | Primitive::TimeUuid, Value::Text(s)) => {
                Uuid::parse_str(s)
                    .map_err(|e| MarshalError::Encode {
                        type_name: self.name(),
                        reason: e.to_string(),
                    })?
                    .as_bytes()
                    .to_vec()
            }
            (Primitive::TimeUuid, Value::Timestamp(t)) => super::time_uuid(*t)?.as_bytes().to_vec(),
            (Primitive::Float, Value::Float(v)) => v.to_be_bytes().to_vec(),
            (Primitive::Float, Value::Double(v)) => {
                // Only doubles an f32 holds exactly are narrowed.
                let narrow = *v as f32;
                if f64::from(narrow) != *v && !v.is_nan() {
                    return Err(MarshalError::Overflow {
                        type_name: self.name(),
                        value: v.to_string(),
                    });
                }
                narrow.to_be_bytes().to_vec()
            }
            (Primitive::Double | Primitive::Decimal, Value::Double(v)) => v.to_be_bytes().to_vec(),
            (Primitive::Double | Primitive::Decimal, Value::Float(v)) => {
                f64::from(*v).to_be_bytes().to_vec()
            }
            (Primitive::Date | Primitive::Timestamp, Value::Timestamp(t)) => {
                t.timestamp_millis().to_be_bytes().to_vec()
            }
            (Primitive::Date | Primitive::Timestamp, Value::Long(ms)) => ms.to_be_bytes().to_vec(),
            (Primitive::Boolean, Value::Boolean(b)) => vec![u8::from(*b)],
            (_, other) => {
                return Err(MarshalError::Mismatch {
                    type_name: self.name(),
                    found: other.kind(),
                });
            }
        };

        Ok(bytes)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Value, MarshalError> {
        let value = match self {
            Primitive::Bytes => Value::Bytes(bytes.to_vec()),
            Primitive::Utf8 => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
            Primitive::Ascii => Value::Text(bytes.iter().map(|b| char::from(b & 0x7f)).collect()),
            _ if bytes.is_empty() => Value::Null,
            Primitive::Long => Value::Long(i64::from_be_bytes(self.fixed(bytes)?)),
            Primitive::Counter => Value::Counter(i64::from_be_bytes(self.fixed(bytes)?)),
            Primitive::Int32 => Value::Int(i32::from_be_bytes(self.fixed(bytes)?)),
            Primitive::VarInt => Value::VarInt(decode_varint(bytes)?),
            Primitive::Uuid | Primitive::LexicalUuid | Primitive::TimeUuid => {
                Value::Uuid(Uuid::from_bytes(self.fixed(bytes)?))
            }
            Primitive::Float => Value::Float(f32::from_be_bytes(self.fixed(bytes)?)),
            Primitive::Double | Primitive::Decimal => {
                Value::Double(f64::from_be_bytes(self.fixed(bytes)?))
            }
            Primitive::Date | Primitive::Timestamp => {
                let ms = i64::from_be_bytes(self.fixed(bytes)?);
                let at = DateTime::<Utc>::from_timestamp_millis(ms).ok_or(
                    MarshalError::Overflow {
                        type_name: self.name(),
                        value: ms.to_string(),
                    },
                )?;
                Value::Timestamp(at)
            }
            // Any nonzero byte reads as true.
            Primitive::Boolean => Value::Boolean(bytes[0] != 0),
        };

        Ok(value)
    }

    fn integer(&self, value: &Value) -> Result<i64, MarshalError> {
        match *value {
            Value::Int(v) => Ok(v.into()),
            Value::Long(v) | Value::Counter(v) => Ok(v),
            Value::VarInt(v) => i64::try_from(v).map_err(|_| MarshalError::Overflow {
                type_name: self.name(),
                value: v.to_string(),
            }),
            ref other => Err(MarshalError::Mismatch {
                type_name: self.name(),
                found: other.kind(),
            }),
        }
    }

    fn fixed<const N: usize>(&self, bytes: &[u8]) -> Result<[u8; N], MarshalError> {
        bytes.try_into().map_err(|_| MarshalError::Length {
            type_name: self.name(),
            expected: N,
            found: bytes.len(),
        })
    }
}

/// Shortest big-endian two's-complement representation of `value`.
pub fn encode_varint(value: i128) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let (head, next) = (bytes[start], bytes[start + 1]);
        let redundant = (head == 0x00 && next & 0x80 == 0) || (head == 0xff && next & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

/// Sign-extends a big-endian two's-complement integer of any width up to 16 bytes.
pub fn decode_varint(bytes: &[u8]) -> Result<i128, MarshalError> {
    if bytes.len() > 16 {
        return Err(MarshalError::Length {
            type_name: "IntegerType",
            expected: 16,
            found: bytes.len(),
        });
    }

    let fill = match bytes.first() {
        Some(b) if b & 0x80 != 0 => 0xff,
        _ => 0x00,
    };
    let mut buf = [fill; 16];
    buf[16 - bytes.len()..].copy_from_slice(bytes);
    Ok(i128::from_be_bytes(buf))
}
