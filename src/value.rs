//! Dynamically-typed values stored in field records and metadata.
//!
//! Metadata is schemaless: every key may hold any [`Value`]. Containers nest
//! arbitrarily; [`Value::Binary`] carries opaque bytes that are never coerced.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A flat key→value map, the content of one field record.
pub type Document = BTreeMap<String, Value>;

/// Possible values a field or metadata key can hold.
///
/// # Examples
///
/// ```
/// use convostore::Value;
///
/// let text = Value::from("hello");
/// let score = Value::from(0.5);
///
/// assert_eq!(text.as_str(), Some("hello"));
/// assert_eq!(score.as_float(), Some(0.5));
/// assert!(Value::binary(vec![0, 159]).to_json().is_none());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    /// Non-finite values are written as `"NaN"`, `"inf"` or `"-inf"`.
    Float(#[serde(with = "float_wire")] f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// Opaque bytes. Written as a hex string on the persistent wire.
    Binary(#[serde(with = "binary_wire")] Vec<u8>),
}

impl Value {
    /// Wraps raw bytes.
    #[must_use]
    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Binary(bytes.into())
    }

    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub const fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(v) => Some(v),
            _ => None,
        }
    }

    pub const fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Reads a list of strings, as stored for id lists and vector names.
    #[must_use]
    pub fn as_string_list(&self) -> Option<Vec<String>> {
        self.as_list()?
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect()
    }

    /// Returns the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Binary(_) => "binary",
        }
    }

    /// Converts to plain JSON.
    ///
    /// Returns `None` when the value cannot be represented as JSON: binary
    /// data anywhere in the tree, or a non-finite float.
    #[must_use]
    pub fn to_json(&self) -> Option<serde_json::Value> {
        use serde_json::Value as Json;

        Some(match self {
            Self::Null => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Int(i) => Json::from(*i),
            Self::Float(f) => Json::Number(serde_json::Number::from_f64(*f)?),
            Self::String(s) => Json::String(s.clone()),
            Self::List(items) => {
                Json::Array(items.iter().map(Self::to_json).collect::<Option<Vec<_>>>()?)
            }
            Self::Map(map) => Json::Object(
                map.iter()
                    .map(|(k, v)| v.to_json().map(|j| (k.clone(), j)))
                    .collect::<Option<serde_json::Map<_, _>>>()?,
            ),
            Self::Binary(_) => return None,
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) => write!(f, "\"{s}\""),
            Self::List(items) => write!(f, "[{} items]", items.len()),
            Self::Map(map) => write!(f, "{{{} keys}}", map.len()),
            Self::Binary(bytes) => write!(f, "<{} bytes>", bytes.len()),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;

        match json {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Bool(b),
            Json::Number(n) => n
                .as_i64()
                .map_or_else(|| Self::Float(n.as_f64().unwrap_or(f64::NAN)), Self::Int),
            Json::String(s) => Self::String(s),
            Json::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            Json::Object(map) => Self::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float(f64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(v)
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Self::List(v.into_iter().map(Self::String).collect())
    }
}

impl From<Vec<&str>> for Value {
    fn from(v: Vec<&str>) -> Self {
        Self::List(v.into_iter().map(Self::from).collect())
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Self::Map(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// A string argument that may have been produced by coercing a non-string.
///
/// Ids, metadata keys and utterance text accept integers and characters as
/// well as strings. Coerced inputs are stringified and logged at warn level
/// once they are resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrLike {
    value: String,
    coerced_from: Option<&'static str>,
}

impl StrLike {
    /// Returns the string, warning if the input was not a string.
    pub fn resolve(self, what: &str) -> String {
        if let Some(source) = self.coerced_from {
            tracing::warn!(
                value = %self.value,
                source_type = source,
                "{what} must be a string; input has been cast to a string"
            );
        }
        self.value
    }

    /// Returns true if the input was not a string.
    #[must_use]
    pub const fn was_coerced(&self) -> bool {
        self.coerced_from.is_some()
    }

    /// Borrows the string without logging.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.value
    }

    fn coerced(value: String, source: &'static str) -> Self {
        Self {
            value,
            coerced_from: Some(source),
        }
    }
}

impl From<&str> for StrLike {
    fn from(v: &str) -> Self {
        Self {
            value: v.to_string(),
            coerced_from: None,
        }
    }
}

impl From<String> for StrLike {
    fn from(value: String) -> Self {
        Self {
            value,
            coerced_from: None,
        }
    }
}

impl From<&String> for StrLike {
    fn from(v: &String) -> Self {
        Self::from(v.as_str())
    }
}

impl From<char> for StrLike {
    fn from(v: char) -> Self {
        Self::coerced(v.to_string(), "char")
    }
}

macro_rules! coerce_integer {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for StrLike {
                fn from(v: $ty) -> Self {
                    Self::coerced(v.to_string(), stringify!($ty))
                }
            }
        )*
    };
}

coerce_integer!(i32, i64, u32, u64, usize);

mod float_wire {
    use std::fmt;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_infinite() {
            serializer.serialize_str(if value.is_sign_positive() { "inf" } else { "-inf" })
        } else {
            serializer.serialize_f64(*value)
        }
    }

    struct FloatVisitor;

    impl<'de> Visitor<'de> for FloatVisitor {
        type Value = f64;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a number or one of \"NaN\", \"inf\", \"-inf\"")
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<f64, E> {
            Ok(v)
        }

        #[allow(clippy::cast_precision_loss)]
        fn visit_i64<E: de::Error>(self, v: i64) -> Result<f64, E> {
            Ok(v as f64)
        }

        #[allow(clippy::cast_precision_loss)]
        fn visit_u64<E: de::Error>(self, v: u64) -> Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<f64, E> {
            match v {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(E::invalid_value(de::Unexpected::Str(other), &self)),
            }
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        deserializer.deserialize_any(FloatVisitor)
    }
}

mod binary_wire {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(encoded).map_err(serde::de::Error::custom)
    }
}
