//! Closed document value type.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// A numeric document value.
///
/// Integers keep their signedness so that values above `i64::MAX`
/// survive a round trip without being widened to floats.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    /// Signed integer.
    Int(i64),
    /// Unsigned integer that does not fit in `i64`.
    UInt(u64),
    /// IEEE-754 double. NaN is rejected by the encoder.
    Float(f64),
}

impl Number {
    /// Returns the value as `i64` if it is an integer in range.
    #[must_use]
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Number::Int(n) => Some(n),
            Number::UInt(n) => i64::try_from(n).ok(),
            Number::Float(_) => None,
        }
    }

    /// Returns the value as `f64`, converting integers.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Int(n) => n as f64,
            Number::UInt(n) => n as f64,
            Number::Float(f) => f,
        }
    }

    /// Returns true for `Int` and `UInt`.
    #[must_use]
    pub fn is_integer(self) -> bool {
        !matches!(self, Number::Float(_))
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Number::Int(n) => write!(f, "{n}"),
            Number::UInt(n) => write!(f, "{n}"),
            Number::Float(x) => write!(f, "{x}"),
        }
    }
}

/// Reference to blob content stored outside the document body.
///
/// Blob content lives in an external content-addressable store; the
/// document only carries its digest and metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobRef {
    /// Content digest, e.g. `sha256-...`.
    pub digest: String,
    /// Content length in bytes.
    pub length: u64,
    /// MIME type, if known.
    pub content_type: Option<String>,
}

impl BlobRef {
    /// Creates a blob reference.
    pub fn new(digest: impl Into<String>, length: u64) -> Self {
        Self {
            digest: digest.into(),
            length,
            content_type: None,
        }
    }

    /// Sets the content type.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// A structured document value.
///
/// Every value a document body can hold is one of these variants, so
/// consumers match exhaustively instead of probing types at runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Numeric value.
    Number(Number),
    /// UTF-8 string.
    String(String),
    /// Point in time, UTC.
    Date(DateTime<Utc>),
    /// String-keyed dictionary. Keys iterate in sorted order.
    Dict(BTreeMap<String, Value>),
    /// Ordered array.
    Array(Vec<Value>),
    /// Reference to external blob content.
    Blob(BlobRef),
}

impl Value {
    /// Builds a dictionary from key/value pairs.
    pub fn dict<K, I>(pairs: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Dict(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Returns a short name for the variant, used in error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Date(_) => "date",
            Value::Dict(_) => "dict",
            Value::Array(_) => "array",
            Value::Blob(_) => "blob",
        }
    }

    /// Returns true if this is `Null`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the boolean, if this is a `Bool`.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the number, if this is a `Number`.
    #[must_use]
    pub fn as_number(&self) -> Option<Number> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the value as `i64` if it is an integer in range.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        self.as_number().and_then(Number::as_i64)
    }

    /// Returns the string slice, if this is a `String`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the date, if this is a `Date`.
    #[must_use]
    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Date(d) => Some(*d),
            _ => None,
        }
    }

    /// Returns the dictionary, if this is a `Dict`.
    #[must_use]
    pub fn as_dict(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Returns the array, if this is an `Array`.
    #[must_use]
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Returns the blob reference, if this is a `Blob`.
    #[must_use]
    pub fn as_blob(&self) -> Option<&BlobRef> {
        match self {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }

    /// Looks up a key if this is a dictionary.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key))
    }

    /// Returns true if this value or any nested value is a blob.
    #[must_use]
    pub fn contains_blobs(&self) -> bool {
        match self {
            Value::Blob(_) => true,
            Value::Dict(d) => d.values().any(Value::contains_blobs),
            Value::Array(a) => a.iter().any(Value::contains_blobs),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(Number::Int(n))
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(Number::Int(i64::from(n)))
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        match i64::try_from(n) {
            Ok(signed) => Value::Number(Number::Int(signed)),
            Err(_) => Value::Number(Number::UInt(n)),
        }
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Number(Number::Float(x))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(d: DateTime<Utc>) -> Self {
        Value::Date(d)
    }
}

impl From<BlobRef> for Value {
    fn from(b: BlobRef) -> Self {
        Value::Blob(b)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Value::Null, Into::into)
    }
}
