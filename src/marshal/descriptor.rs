use std::fmt;

/// Primitive assumed when a column carries no type at all.
pub const DEFAULT_TYPE: &str = "BytesType";

/// Parsed form of a store type-descriptor string such as
/// `org.apache.cassandra.db.marshal.CompositeType(UTF8Type,Int32Type)`.
///
/// Parsing is permissive: any bare name that is not one of the wrapper types
/// becomes a [`TypeDescriptor::Primitive`]. Whether that name has a codec is
/// only checked when a [`Marshaller`](super::Marshaller) is used.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeDescriptor {
    Primitive(String),
    Composite(Vec<TypeDescriptor>),
    Reversed(Box<TypeDescriptor>),
    Set(Box<TypeDescriptor>),
    List(Box<TypeDescriptor>),
    Map(Box<TypeDescriptor>, Box<TypeDescriptor>),
}

impl TypeDescriptor {
    pub fn parse(descriptor: &str) -> Self {
        let descriptor = descriptor.trim();
        if descriptor.is_empty() {
            return Self::default();
        }

        let (name, params) = match descriptor.find('(') {
            Some(open) => {
                let close = descriptor.rfind(')').filter(|c| *c > open);
                let inner = &descriptor[open + 1..close.unwrap_or(descriptor.len())];
                (&descriptor[..open], Some(inner))
            }
            None => (descriptor, None),
        };
        let name = bare_name(name);
        let mut params = params.map(split_params).unwrap_or_default().into_iter();

        match name {
            "CompositeType" => Self::Composite(params.map(Self::parse).collect()),
            "ReversedType" => Self::Reversed(Box::new(next_or_default(&mut params))),
            "SetType" => Self::Set(Box::new(next_or_default(&mut params))),
            "ListType" => Self::List(Box::new(next_or_default(&mut params))),
            "MapType" => {
                let key = next_or_default(&mut params);
                let value = next_or_default(&mut params);
                Self::Map(Box::new(key), Box::new(value))
            }
            name => Self::Primitive(name.to_string()),
        }
    }

    /// Parses an optional descriptor; `None` yields the opaque-bytes type.
    pub fn parse_opt(descriptor: Option<&str>) -> Self {
        descriptor.map(Self::parse).unwrap_or_default()
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, Self::Composite(_))
    }

    pub fn is_collection(&self) -> bool {
        matches!(self, Self::Set(_) | Self::List(_) | Self::Map(..))
    }

    /// True when the outermost layer reverses ordering.
    pub fn is_reversed(&self) -> bool {
        matches!(self, Self::Reversed(_))
    }
}

impl Default for TypeDescriptor {
    fn default() -> Self {
        Self::Primitive(DEFAULT_TYPE.to_string())
    }
}

impl From<&str> for TypeDescriptor {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primitive(name) => write!(f, "{name}"),
            Self::Composite(parts) => {
                write!(f, "CompositeType(")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{part}")?;
                }
                write!(f, ")")
            }
            Self::Reversed(inner) => write!(f, "ReversedType({inner})"),
            Self::Set(inner) => write!(f, "SetType({inner})"),
            Self::List(inner) => write!(f, "ListType({inner})"),
            Self::Map(key, value) => write!(f, "MapType({key},{value})"),
        }
    }
}

/// `org.apache.cassandra.db.marshal.UTF8Type` -> `UTF8Type`
fn bare_name(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name).trim()
}

fn next_or_default<'a>(params: &mut impl Iterator<Item = &'a str>) -> TypeDescriptor {
    params.next().map(TypeDescriptor::parse).unwrap_or_default()
}

/// Splits on commas that are not nested inside parentheses.
fn split_params(params: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (i, ch) in params.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                out.push(params[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }

    let last = params[start..].trim();
    if !last.is_empty() || !out.is_empty() {
        out.push(last);
    }
    out
}
